//! The static type catalog: terrain, resources, units and the actions units
//! can perform. The catalog is built once at startup and never changes while
//! the server runs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::game::{GameError, Payment};
use crate::game::map::Map;
use crate::game::unit::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionMode {
    #[default]
    Once,
    Repeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionTargetType {
    #[default]
    None,
    Cell,
    Unit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    Queued,
    Working,
    Complete,
    Wait,
    Cancelled,
    Failed,
}

#[derive(Debug)]
pub struct TerrainType {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub tags: HashSet<String>,
}

#[derive(Debug)]
pub struct ResourceType {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub start_amount: i64,
}

#[derive(Debug)]
pub struct UnitType {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub tags: HashSet<String>,
    /// Id of the action clients should offer by default, 0 for none.
    pub default_action_type: u32,
}

/// One resource amount inside a cost or reward list.
#[derive(Debug, Clone)]
pub struct CostEntry {
    pub resource: Arc<ResourceType>,
    pub amount: i64,
}

pub type Cost = Vec<CostEntry>;

#[derive(Debug)]
pub struct ActionType {
    pub id: u32,
    pub executor: Executor,
    pub name: String,
    pub description: String,
    pub unit_type: Arc<UnitType>,
    pub cost: Cost,
    pub duration: f64,
    pub default_mode: ActionMode,
    pub target_type: ActionTargetType,
    pub target_tags: HashSet<String>,
}

impl ActionType {
    fn sleep_duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration.max(0.0))
    }
}

/// The behavior an [`ActionType`] runs once the acting unit's turn comes up.
/// The catalog is closed, so the behaviors are an enum rather than trait
/// objects; each arm is an async recipe over the shared map.
#[derive(Debug)]
pub enum Executor {
    /// Pay the action cost up front, work for the action duration, then
    /// place a new unit of the given type on the nearest empty cell.
    CreateNear { unit_type: Arc<UnitType> },
    /// Work for the action duration, then credit the rewards to the owner.
    Farm { rewards: Cost },
    /// Work for the action duration, then step onto the targeted cell. A
    /// rejected step fails the action with the map's reason.
    MoveStep,
}

impl Executor {
    pub async fn run(&self, map: &Arc<Map>, action: &Action) -> Result<(), GameError> {
        match self {
            Executor::CreateNear { unit_type } => {
                let player = action
                    .player()
                    .ok_or_else(|| GameError::rule("the acting unit has no owner"))?;
                let payment = Payment::take(&player, &action.action_type.cost)?;
                tokio::time::sleep(action.action_type.sleep_duration()).await;
                let _ = map.create_unit_near(&action.unit, unit_type, Some(&player));
                payment.commit();
                Ok(())
            }
            Executor::Farm { rewards } => {
                tokio::time::sleep(action.action_type.sleep_duration()).await;
                let player = action
                    .player()
                    .ok_or_else(|| GameError::rule("the acting unit has no owner"))?;
                player.give(rewards);
                Ok(())
            }
            Executor::MoveStep => {
                let target = action
                    .target_cell
                    .ok_or_else(|| GameError::rule("this action requires a cell target"))?;
                tokio::time::sleep(action.action_type.sleep_duration()).await;
                map.move_unit(&action.unit, target).map_err(|err| match err {
                    GameError::Rule(message) => GameError::Action {
                        state: ActionState::Failed,
                        message,
                    },
                    other => other,
                })
            }
        }
    }
}

/// Immutable catalog handed to the server at startup.
#[derive(Debug, Default)]
pub struct Rules {
    pub terrain_types: Vec<Arc<TerrainType>>,
    pub resource_types: Vec<Arc<ResourceType>>,
    pub unit_types: Vec<Arc<UnitType>>,
    pub action_types: Vec<Arc<ActionType>>,
}

impl Rules {
    pub fn terrain_type(&self, id: u32) -> Option<&Arc<TerrainType>> {
        self.terrain_types.iter().find(|t| t.id == id)
    }

    pub fn resource_type(&self, id: u32) -> Option<&Arc<ResourceType>> {
        self.resource_types.iter().find(|t| t.id == id)
    }

    pub fn unit_type(&self, id: u32) -> Option<&Arc<UnitType>> {
        self.unit_types.iter().find(|t| t.id == id)
    }

    pub fn action_type(&self, id: u32) -> Option<&Arc<ActionType>> {
        self.action_types.iter().find(|t| t.id == id)
    }

    pub fn terrain_named(&self, name: &str) -> Option<&Arc<TerrainType>> {
        self.terrain_types.iter().find(|t| t.name == name)
    }

    pub fn unit_type_named(&self, name: &str) -> Option<&Arc<UnitType>> {
        self.unit_types.iter().find(|t| t.name == name)
    }
}

fn tags(names: &[&str]) -> HashSet<String> {
    names.iter().map(|name| (*name).to_string()).collect()
}

/// The built-in game: three terrains, three resources, resource deposits as
/// neutral units, a city that produces citizens, and citizens that farm wood.
pub fn default_rules() -> Arc<Rules> {
    let grass = Arc::new(TerrainType {
        id: 1,
        name: "grass".into(),
        description: "Grass".into(),
        tags: tags(&["walk", "build"]),
    });
    let mountain = Arc::new(TerrainType {
        id: 2,
        name: "mountain".into(),
        description: "Mountains".into(),
        tags: tags(&[]),
    });
    let water = Arc::new(TerrainType {
        id: 3,
        name: "water".into(),
        description: "Water".into(),
        tags: tags(&["water"]),
    });

    let wood = Arc::new(ResourceType {
        id: 1,
        name: "wood".into(),
        description: "Wood".into(),
        start_amount: 100,
    });
    let food = Arc::new(ResourceType {
        id: 2,
        name: "food".into(),
        description: "Food".into(),
        start_amount: 100,
    });
    let stone = Arc::new(ResourceType {
        id: 3,
        name: "stone".into(),
        description: "Stone".into(),
        start_amount: 100,
    });

    let forest = Arc::new(UnitType {
        id: 1,
        name: "forest".into(),
        description: "Forest".into(),
        tags: tags(&["resource", "resource_wood"]),
        default_action_type: 0,
    });
    let quarry = Arc::new(UnitType {
        id: 2,
        name: "quarry".into(),
        description: "Quarry".into(),
        tags: tags(&["resource", "resource_quarry"]),
        default_action_type: 0,
    });
    let city = Arc::new(UnitType {
        id: 3,
        name: "city".into(),
        description: "City".into(),
        tags: tags(&["building"]),
        default_action_type: 0,
    });
    let citizen = Arc::new(UnitType {
        id: 4,
        name: "citizen".into(),
        description: "Citizen".into(),
        tags: tags(&[]),
        default_action_type: 0,
    });

    let citizen_farm_wood = Arc::new(ActionType {
        id: 1,
        executor: Executor::Farm {
            rewards: vec![CostEntry {
                resource: Arc::clone(&wood),
                amount: 10,
            }],
        },
        name: "citizen_farm_wood".into(),
        description: "Cut down trees".into(),
        unit_type: Arc::clone(&citizen),
        cost: Vec::new(),
        duration: 2.0,
        default_mode: ActionMode::Once,
        target_type: ActionTargetType::Unit,
        target_tags: tags(&["resource_wood"]),
    });
    let city_create_citizen = Arc::new(ActionType {
        id: 2,
        executor: Executor::CreateNear {
            unit_type: Arc::clone(&citizen),
        },
        name: "city_create_citizen".into(),
        description: "Create a Citizen".into(),
        unit_type: Arc::clone(&city),
        cost: vec![CostEntry {
            resource: Arc::clone(&food),
            amount: 20,
        }],
        duration: 2.0,
        default_mode: ActionMode::Once,
        target_type: ActionTargetType::None,
        target_tags: tags(&[]),
    });
    let citizen_move = Arc::new(ActionType {
        id: 3,
        executor: Executor::MoveStep,
        name: "citizen_move".into(),
        description: "Move".into(),
        unit_type: Arc::clone(&citizen),
        cost: Vec::new(),
        duration: 0.5,
        default_mode: ActionMode::Once,
        target_type: ActionTargetType::Cell,
        target_tags: tags(&["walk"]),
    });

    Arc::new(Rules {
        terrain_types: vec![grass, mountain, water],
        resource_types: vec![wood, food, stone],
        unit_types: vec![forest, quarry, city, citizen],
        action_types: vec![citizen_farm_wood, city_create_citizen, citizen_move],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_is_consistent() {
        let rules = default_rules();
        for (index, terrain) in rules.terrain_types.iter().enumerate() {
            assert_eq!(terrain.id as usize, index + 1);
        }
        for action in &rules.action_types {
            assert!(rules.unit_type(action.unit_type.id).is_some());
            for entry in &action.cost {
                assert!(rules.resource_type(entry.resource.id).is_some());
            }
        }
        let farm = rules.action_type(1).expect("farm action");
        assert_eq!(farm.target_type, ActionTargetType::Unit);
        assert!(farm.target_tags.contains("resource_wood"));
        let create = rules.action_type(2).expect("create action");
        assert_eq!(create.cost.len(), 1);
        assert_eq!(create.cost[0].amount, 20);
    }

    #[test]
    fn state_names_follow_the_wire_convention() {
        let state = serde_json::to_string(&ActionState::Working).expect("serialize");
        assert_eq!(state, "\"WORKING\"");
        let mode: ActionMode = serde_json::from_str("\"REPEAT\"").expect("deserialize");
        assert_eq!(mode, ActionMode::Repeat);
    }
}
