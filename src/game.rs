//! The authoritative game state: players and their economies, the map, and
//! the per-unit action pipeline. Everything here is owned by the server; the
//! network layer only ever talks to it through [`map::Map`] operations and
//! the event queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use thiserror::Error;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedSender;

use crate::api::message::ServerToClient;
use crate::rules::{ActionState, CostEntry, Rules};
use crate::util::lock;

pub mod map;
pub mod unit;

/// A rule violation. Reported to the offending client as an `Error` message;
/// the server keeps running.
#[derive(Debug, Error)]
pub enum GameError {
    #[error("Not enough {resource} (got {got}, need {need})")]
    Resource {
        resource: String,
        got: i64,
        need: i64,
    },
    #[error("You're not allowed to manage that unit")]
    Owner { unit_id: u32 },
    /// Raised by an executor to force the action into a specific state.
    #[error("{message}")]
    Action {
        state: ActionState,
        message: String,
    },
    #[error("{0}")]
    Rule(String),
}

impl GameError {
    pub fn rule(message: impl Into<String>) -> Self {
        GameError::Rule(message.into())
    }
}

/// A scalar resource amount with a broadcast-and-clear change signal. Every
/// mutation wakes every waiter registered at that moment; waiters re-check
/// their predicate after waking, so spurious wakes are harmless.
#[derive(Debug, Default)]
pub struct ResourceCell {
    amount: AtomicI64,
    signal: Notify,
}

impl ResourceCell {
    pub fn new(amount: i64) -> Self {
        Self {
            amount: AtomicI64::new(amount),
            signal: Notify::new(),
        }
    }

    pub fn get(&self) -> i64 {
        self.amount.load(Ordering::Acquire)
    }

    pub fn set(&self, amount: i64) {
        self.amount.store(amount, Ordering::Release);
        self.signal.notify_waiters();
    }

    /// Adjust the amount without waking observers; callers batch-notify once
    /// all amounts of a multi-resource operation are in place.
    fn add(&self, delta: i64) {
        self.amount.fetch_add(delta, Ordering::AcqRel);
    }

    fn notify(&self) {
        self.signal.notify_waiters();
    }

    /// Wait for the next state change.
    pub async fn wait_change(&self) {
        self.signal.notified().await;
    }

    /// Wait until the amount satisfies the predicate, registering for the
    /// change signal before checking so no wake is lost in between.
    pub async fn wait_until(&self, pred: impl Fn(i64) -> bool) {
        loop {
            let mut changed = std::pin::pin!(self.signal.notified());
            changed.as_mut().enable();
            if pred(self.get()) {
                return;
            }
            changed.await;
        }
    }
}

/// A participant. The `outbox` is the non-owning back-reference to the
/// player's client: dropping the connection closes the channel and sends
/// become no-ops.
#[derive(Debug)]
pub struct Player {
    pub id: u32,
    pub name: String,
    outbox: UnboundedSender<ServerToClient>,
    pub resources: HashMap<u32, Arc<ResourceCell>>,
    /// Serializes take/give so a debit is atomic with respect to observers.
    balance: Mutex<()>,
}

impl Player {
    pub fn new(
        id: u32,
        name: impl Into<String>,
        outbox: UnboundedSender<ServerToClient>,
        rules: &Rules,
    ) -> Self {
        let resources = rules
            .resource_types
            .iter()
            .map(|resource| {
                (
                    resource.id,
                    Arc::new(ResourceCell::new(resource.start_amount)),
                )
            })
            .collect();
        Self {
            id,
            name: name.into(),
            outbox,
            resources,
            balance: Mutex::new(()),
        }
    }

    pub fn send(&self, message: ServerToClient) {
        let _ = self.outbox.send(message);
    }

    pub fn amount_of(&self, resource_type_id: u32) -> i64 {
        self.resources
            .get(&resource_type_id)
            .map(|cell| cell.get())
            .unwrap_or(0)
    }

    /// Deduct the cost. Either every resource covers its share and all of
    /// them are debited, or nothing changes and the first shortfall is
    /// reported. Observers wake only after the whole debit is in place.
    pub fn take(&self, cost: &[CostEntry]) -> Result<(), GameError> {
        let _balance = lock(&self.balance);
        for entry in cost {
            let got = self.amount_of(entry.resource.id);
            if got < entry.amount {
                return Err(GameError::Resource {
                    resource: entry.resource.name.clone(),
                    got,
                    need: entry.amount,
                });
            }
        }
        for entry in cost {
            if let Some(cell) = self.resources.get(&entry.resource.id) {
                cell.add(-entry.amount);
            }
        }
        for entry in cost {
            if let Some(cell) = self.resources.get(&entry.resource.id) {
                cell.notify();
            }
        }
        Ok(())
    }

    /// Credit the amounts. Infallible so the payment refund path can never
    /// fail halfway.
    pub fn give(&self, amounts: &[CostEntry]) {
        let _balance = lock(&self.balance);
        for entry in amounts {
            if let Some(cell) = self.resources.get(&entry.resource.id) {
                cell.add(entry.amount);
            }
        }
        for entry in amounts {
            if let Some(cell) = self.resources.get(&entry.resource.id) {
                cell.notify();
            }
        }
    }

    /// Block until every entry of the cost is simultaneously covered. Checks
    /// one resource at a time and re-verifies the whole set after each wait.
    pub async fn wait_resources(&self, cost: &[CostEntry]) {
        loop {
            let mut unsatisfied = None;
            for entry in cost {
                if self.amount_of(entry.resource.id) < entry.amount {
                    unsatisfied = Some(entry);
                    break;
                }
            }
            let Some(entry) = unsatisfied else {
                return;
            };
            match self.resources.get(&entry.resource.id) {
                Some(cell) => cell.wait_until(|amount| amount >= entry.amount).await,
                // A cost naming a resource the player does not track can
                // never be satisfied.
                None => std::future::pending::<()>().await,
            }
        }
    }
}

/// Debits the cost on construction and refunds it when dropped, unless the
/// work in between completed and [`Payment::commit`] defused the refund.
/// Because the refund runs from `Drop`, it also fires when the surrounding
/// task is cancelled mid-await.
#[must_use = "dropping a payment immediately refunds it"]
pub struct Payment<'a> {
    player: &'a Player,
    cost: &'a [CostEntry],
    armed: bool,
}

impl<'a> Payment<'a> {
    pub fn take(player: &'a Player, cost: &'a [CostEntry]) -> Result<Self, GameError> {
        player.take(cost)?;
        Ok(Self {
            player,
            cost,
            armed: true,
        })
    }

    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for Payment<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.player.give(self.cost);
        }
    }
}
