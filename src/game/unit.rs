use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::task::AbortHandle;

use crate::game::GameError;
use crate::game::Player;
use crate::game::map::{Map, MapEvent};
use crate::rules::{ActionMode, ActionState, ActionType, UnitType};
use crate::util::{TaskGroup, lock};

/// A queued piece of work for one unit.
#[derive(Debug)]
pub struct Action {
    pub id: u32,
    pub action_type: Arc<ActionType>,
    pub unit: Arc<Unit>,
    pub mode: ActionMode,
    pub target_unit: Option<Arc<Unit>>,
    pub target_cell: Option<(u32, u32)>,
}

impl Action {
    pub fn player(&self) -> Option<Arc<Player>> {
        self.unit.player()
    }
}

/// Something standing on the map. Each unit owns its action pipeline: a
/// fair turn mutex plus one task per queued action, so any number of actions
/// can be queued while exactly one works at a time, in arrival order.
#[derive(Debug)]
pub struct Unit {
    pub id: u32,
    pub unit_type: Arc<UnitType>,
    map: Weak<Map>,
    player: Mutex<Option<Arc<Player>>>,
    turn: Arc<tokio::sync::Mutex<()>>,
    tasks: Mutex<TaskGroup>,
    action_tasks: Mutex<HashMap<u32, AbortHandle>>,
}

impl Unit {
    pub(crate) fn new(
        id: u32,
        unit_type: Arc<UnitType>,
        map: Weak<Map>,
        player: Option<Arc<Player>>,
    ) -> Self {
        Self {
            id,
            unit_type,
            map,
            player: Mutex::new(player),
            turn: Arc::new(tokio::sync::Mutex::new(())),
            tasks: Mutex::new(TaskGroup::new()),
            action_tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn map(&self) -> Option<Arc<Map>> {
        self.map.upgrade()
    }

    pub fn player(&self) -> Option<Arc<Player>> {
        lock(&self.player).clone()
    }

    pub(crate) fn set_player(&self, player: Option<Arc<Player>>) {
        *lock(&self.player) = player;
    }

    /// Spawn the task that will run the action once the unit's turn mutex
    /// admits it. Tasks queue on the mutex in spawn order.
    pub(crate) fn queue_action(&self, map: &Arc<Map>, action: Arc<Action>) {
        let abort = lock(&self.tasks).spawn(process(Arc::clone(map), action.clone()));
        lock(&self.action_tasks).insert(action.id, abort);
    }

    /// Abort a queued or running action's task. The task's exit guards emit
    /// the terminal events and refund any open payment.
    pub(crate) fn cancel_action(&self, action_id: u32) -> Result<(), GameError> {
        let handle = lock(&self.action_tasks)
            .remove(&action_id)
            .ok_or_else(|| GameError::rule("that action is not queued on this unit"))?;
        handle.abort();
        Ok(())
    }

    /// Abort every task belonging to this unit's pipeline.
    pub(crate) fn cancel_all(&self) {
        lock(&self.tasks).cancel_all();
        lock(&self.action_tasks).clear();
    }

    pub(crate) fn forget_action(&self, action_id: u32) {
        lock(&self.action_tasks).remove(&action_id);
    }
}

/// Emits the single `ActionDequeued` on every exit path of an action task,
/// cancellation included, and drops the finished action from the registries.
struct DequeueGuard {
    map: Arc<Map>,
    action: Arc<Action>,
}

impl Drop for DequeueGuard {
    fn drop(&mut self) {
        self.action.unit.forget_action(self.action.id);
        self.map.remove_action(self.action.id);
        self.map.emit(MapEvent::ActionDequeued {
            action: Arc::clone(&self.action),
        });
    }
}

/// Armed only while the action is WORKING; a drop while armed means the
/// task was cancelled mid-execution and reports the CANCELLED transition.
struct CancelMark<'a> {
    map: &'a Map,
    action: &'a Arc<Action>,
    armed: bool,
}

impl Drop for CancelMark<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.map.emit(MapEvent::ActionUpdate {
                action: Arc::clone(self.action),
                state: ActionState::Cancelled,
                message: None,
            });
        }
    }
}

/// One action task. Waits for the unit's turn, runs the executor, and walks
/// the action state machine until a terminal state or a repeat re-queue.
/// The turn mutex is held only while WORKING; a WAIT releases it so later
/// actions on the same unit can progress while this one sits on resources.
async fn process(map: Arc<Map>, action: Arc<Action>) {
    let _dequeue = DequeueGuard {
        map: Arc::clone(&map),
        action: Arc::clone(&action),
    };
    let turn = Arc::clone(&action.unit.turn);
    loop {
        let state = {
            let _turn = turn.lock().await;
            let mut mark = CancelMark {
                map: &map,
                action: &action,
                armed: true,
            };
            let put_state = |state: ActionState, message: Option<String>| {
                map.emit(MapEvent::ActionUpdate {
                    action: Arc::clone(&action),
                    state,
                    message,
                });
            };
            put_state(ActionState::Working, None);
            let state = match action.action_type.executor.run(&map, &action).await {
                Ok(()) => {
                    put_state(ActionState::Complete, None);
                    ActionState::Complete
                }
                Err(err @ GameError::Resource { .. }) => {
                    put_state(
                        ActionState::Wait,
                        Some(format!(
                            "Action {} ({}) is waiting: {err}",
                            action.id, action.action_type.name
                        )),
                    );
                    ActionState::Wait
                }
                Err(GameError::Action { state, message }) => {
                    put_state(state, Some(message));
                    state
                }
                Err(err) => {
                    log::error!(
                        "action {} ({}) failed: {err}",
                        action.id,
                        action.action_type.name
                    );
                    put_state(
                        ActionState::Failed,
                        Some("Unknown error, check the server logs".to_string()),
                    );
                    ActionState::Failed
                }
            };
            mark.armed = false;
            state
        };
        match state {
            ActionState::Wait => {
                let Some(player) = action.unit.player() else {
                    return;
                };
                player.wait_resources(&action.action_type.cost).await;
            }
            ActionState::Complete => {
                if action.mode == ActionMode::Repeat {
                    map.emit(MapEvent::ActionUpdate {
                        action: Arc::clone(&action),
                        state: ActionState::Queued,
                        message: None,
                    });
                } else {
                    return;
                }
            }
            ActionState::Failed | ActionState::Cancelled => return,
            ActionState::Queued | ActionState::Working => {}
        }
    }
}
