use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::game::{GameError, Player};
use crate::game::unit::{Action, Unit};
use crate::rules::{ActionMode, ActionState, ActionType, TerrainType, UnitType};
use crate::util::{IdRegistry, lock};

/// One grid square. A cell holds at most one unit; units know their position
/// only through the map.
#[derive(Debug, Clone, Default)]
pub struct Cell {
    pub terrain_type: Option<Arc<TerrainType>>,
    pub unit: Option<u32>,
}

/// Domain events fanned out through the map's queue. The in-game protocol
/// drains them in arrival order and translates them to wire messages.
#[derive(Debug, Clone)]
pub enum MapEvent {
    Generated {
        width: u32,
        height: u32,
    },
    CellTerrain {
        position: (u32, u32),
        terrain_type: Arc<TerrainType>,
    },
    UnitCreated {
        position: (u32, u32),
        unit: Arc<Unit>,
    },
    UnitMoved {
        unit: Arc<Unit>,
        position: (u32, u32),
    },
    ActionUpdate {
        action: Arc<Action>,
        state: ActionState,
        message: Option<String>,
    },
    ActionDequeued {
        action: Arc<Action>,
    },
}

/// The world: a row-major grid plus the registries for everything living on
/// it. Registries sit behind std mutexes that are only held across
/// synchronous sections; the lock order is cells, then units, then actions.
#[derive(Debug)]
pub struct Map {
    pub width: u32,
    pub height: u32,
    cells: Mutex<Vec<Cell>>,
    pub players: Arc<Mutex<IdRegistry<Arc<Player>>>>,
    units: Mutex<IdRegistry<Arc<Unit>>>,
    actions: Mutex<IdRegistry<Arc<Action>>>,
    events: UnboundedSender<MapEvent>,
}

impl Map {
    pub fn new(
        players: Arc<Mutex<IdRegistry<Arc<Player>>>>,
        width: u32,
        height: u32,
    ) -> (Arc<Self>, UnboundedReceiver<MapEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let map = Arc::new(Self {
            width,
            height,
            cells: Mutex::new(vec![Cell::default(); (width * height) as usize]),
            players,
            units: Mutex::new(IdRegistry::new()),
            actions: Mutex::new(IdRegistry::new()),
            events,
        });
        (map, events_rx)
    }

    pub(crate) fn emit(&self, event: MapEvent) {
        let _ = self.events.send(event);
    }

    fn index(&self, (x, y): (u32, u32)) -> Result<usize, GameError> {
        if x >= self.width || y >= self.height {
            return Err(GameError::rule("Coordinates are outside the map"));
        }
        Ok((y * self.width + x) as usize)
    }

    pub fn contains(&self, (x, y): (u32, u32)) -> bool {
        x < self.width && y < self.height
    }

    pub fn cell(&self, xy: (u32, u32)) -> Result<Cell, GameError> {
        let index = self.index(xy)?;
        Ok(lock(&self.cells)[index].clone())
    }

    pub fn terrain_at(&self, xy: (u32, u32)) -> Result<Option<Arc<TerrainType>>, GameError> {
        Ok(self.cell(xy)?.terrain_type)
    }

    pub fn unit_at(&self, xy: (u32, u32)) -> Result<Option<Arc<Unit>>, GameError> {
        let unit_id = self.cell(xy)?.unit;
        Ok(unit_id.and_then(|id| lock(&self.units).get(id).cloned()))
    }

    pub fn unit(&self, id: u32) -> Option<Arc<Unit>> {
        lock(&self.units).get(id).cloned()
    }

    pub fn units(&self) -> Vec<Arc<Unit>> {
        lock(&self.units).iter().cloned().collect()
    }

    pub fn action(&self, id: u32) -> Option<Arc<Action>> {
        lock(&self.actions).get(id).cloned()
    }

    pub(crate) fn remove_action(&self, id: u32) {
        lock(&self.actions).remove(id);
    }

    pub fn player(&self, id: u32) -> Option<Arc<Player>> {
        lock(&self.players).get(id).cloned()
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        lock(&self.players).iter().cloned().collect()
    }

    pub fn remove_player(&self, id: u32) -> Option<Arc<Player>> {
        lock(&self.players).remove(id)
    }

    /// Where the unit currently stands, by scanning the grid. The registries
    /// own the units; cells only carry the id.
    pub fn location_of(&self, unit: &Unit) -> Option<(u32, u32)> {
        let cells = lock(&self.cells);
        cells.iter().enumerate().find_map(|(index, cell)| {
            (cell.unit == Some(unit.id))
                .then(|| (index as u32 % self.width, index as u32 / self.width))
        })
    }

    /// Set a cell's terrain and announce it. Used by the generator passes.
    pub fn set_terrain(
        &self,
        xy: (u32, u32),
        terrain_type: &Arc<TerrainType>,
    ) -> Result<(), GameError> {
        let index = self.index(xy)?;
        lock(&self.cells)[index].terrain_type = Some(Arc::clone(terrain_type));
        self.emit(MapEvent::CellTerrain {
            position: xy,
            terrain_type: Arc::clone(terrain_type),
        });
        Ok(())
    }

    /// Place a new unit. Fails when the target cell is occupied; the new
    /// unit is announced with a `UnitCreated` event.
    pub fn create_unit(
        self: &Arc<Self>,
        xy: (u32, u32),
        unit_type: &Arc<UnitType>,
        owner: Option<&Arc<Player>>,
    ) -> Result<Arc<Unit>, GameError> {
        let index = self.index(xy)?;
        let mut cells = lock(&self.cells);
        if cells[index].unit.is_some() {
            return Err(GameError::rule("cells can only hold one unit"));
        }
        let unit = {
            let mut units = lock(&self.units);
            Arc::clone(units.insert_with(|id| {
                Arc::new(Unit::new(
                    id,
                    Arc::clone(unit_type),
                    Arc::downgrade(self),
                    owner.cloned(),
                ))
            }))
        };
        cells[index].unit = Some(unit.id);
        drop(cells);
        self.emit(MapEvent::UnitCreated {
            position: xy,
            unit: Arc::clone(&unit),
        });
        Ok(unit)
    }

    /// Place a new unit on the first empty cell of the spiral vicinity of
    /// the anchor. Returns `None`, creating nothing and emitting nothing,
    /// when no empty in-bounds cell exists.
    pub fn create_unit_near(
        self: &Arc<Self>,
        anchor: &Unit,
        unit_type: &Arc<UnitType>,
        owner: Option<&Arc<Player>>,
    ) -> Option<Arc<Unit>> {
        let origin = self.location_of(anchor)?;
        for xy in vicinity(origin, self.width, self.height) {
            let free = {
                let cells = lock(&self.cells);
                self.index(xy).is_ok_and(|index| cells[index].unit.is_none())
            };
            if free {
                return self.create_unit(xy, unit_type, owner).ok();
            }
        }
        None
    }

    /// Step a unit onto a neighboring cell. The destination must be inside
    /// the map, adjacent, empty, and walkable.
    pub fn move_unit(&self, unit: &Arc<Unit>, destination: (u32, u32)) -> Result<(), GameError> {
        let origin = self
            .location_of(unit)
            .ok_or_else(|| GameError::rule("unit is not on the map"))?;
        let destination_index = self.index(destination)?;
        let dx = (origin.0 as i64 - destination.0 as i64).abs();
        let dy = (origin.1 as i64 - destination.1 as i64).abs();
        if dx > 1 || dy > 1 || (dx, dy) == (0, 0) {
            return Err(GameError::rule("can only move unit to neighboring cell"));
        }
        let origin_index = self.index(origin)?;
        let mut cells = lock(&self.cells);
        if cells[destination_index].unit.is_some() {
            return Err(GameError::rule("cells can only hold one unit"));
        }
        let walkable = cells[destination_index]
            .terrain_type
            .as_ref()
            .is_some_and(|terrain| terrain.tags.contains("walk"));
        if !walkable {
            return Err(GameError::rule("cannot move unit to unwalkable cell"));
        }
        cells[destination_index].unit = cells[origin_index].unit.take();
        drop(cells);
        self.emit(MapEvent::UnitMoved {
            unit: Arc::clone(unit),
            position: destination,
        });
        Ok(())
    }

    /// Register an action and hand it to the owning unit's pipeline.
    pub fn action_queue(
        self: &Arc<Self>,
        action_type: &Arc<ActionType>,
        unit: &Arc<Unit>,
        mode: ActionMode,
        target_unit: Option<Arc<Unit>>,
        target_cell: Option<(u32, u32)>,
    ) -> Arc<Action> {
        let action = {
            let mut actions = lock(&self.actions);
            Arc::clone(actions.insert_with(|id| {
                Arc::new(Action {
                    id,
                    action_type: Arc::clone(action_type),
                    unit: Arc::clone(unit),
                    mode,
                    target_unit,
                    target_cell,
                })
            }))
        };
        unit.queue_action(self, Arc::clone(&action));
        action
    }

    /// Cancel a leaving player's pipelines and hand their units to the
    /// neutral owner.
    pub fn repossess(&self, player_id: u32) {
        for unit in self.units() {
            if unit.player().is_some_and(|player| player.id == player_id) {
                unit.cancel_all();
                unit.set_player(None);
            }
        }
    }
}

/// Enumerate coordinates starting at the anchor and spiraling outwards: for
/// each distance the four diagonal-walk rings, filtered to the map bounds.
/// The iterator ends on the first ring with no in-bounds point.
pub fn vicinity(origin: (u32, u32), width: u32, height: u32) -> Vicinity {
    Vicinity {
        origin: (origin.0 as i64, origin.1 as i64),
        width: width as i64,
        height: height as i64,
        distance: 0,
        ring: VecDeque::new(),
        done: false,
    }
}

pub struct Vicinity {
    origin: (i64, i64),
    width: i64,
    height: i64,
    distance: i64,
    ring: VecDeque<(i64, i64)>,
    done: bool,
}

impl Vicinity {
    fn inside(&self, (x, y): (i64, i64)) -> bool {
        0 <= x && x < self.width && 0 <= y && y < self.height
    }
}

impl Iterator for Vicinity {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<(u32, u32)> {
        if self.done {
            return None;
        }
        if self.distance == 0 {
            self.distance = 1;
            if self.inside(self.origin) {
                return Some((self.origin.0 as u32, self.origin.1 as u32));
            }
        }
        loop {
            if let Some((x, y)) = self.ring.pop_front() {
                return Some((x as u32, y as u32));
            }
            let (x, y) = self.origin;
            let d = self.distance;
            let mut ring = VecDeque::new();
            for i in 0..d {
                ring.push_back((x + i, y - d + i));
            }
            for i in 0..d {
                ring.push_back((x + d - i, y + i));
            }
            for i in 0..d {
                ring.push_back((x - i, y + d - i));
            }
            for i in 0..d {
                ring.push_back((x - d + i, y - i));
            }
            ring.retain(|&point| self.inside(point));
            if ring.is_empty() {
                self.done = true;
                return None;
            }
            self.ring = ring;
            self.distance += 1;
        }
    }
}
