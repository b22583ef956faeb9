use serde::{Deserialize, Serialize};

use crate::rules::{ActionMode, ActionState, ActionTargetType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellPos {
    pub x: u32,
    pub y: u32,
}

impl From<(u32, u32)> for CellPos {
    fn from((x, y): (u32, u32)) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAmount {
    pub resource_type_id: u32,
    pub amount: i64,
}

/// Client-to-server wrapper. The enum is externally tagged, so the single
/// set variant is the payload discriminator on both wire forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientToServer {
    CmdJoin {
        name: String,
    },
    CmdLeave,
    CmdGameStart,
    CmdActionQueue {
        action_type_id: u32,
        unit_id: u32,
        target_unit_id: Option<u32>,
        target_cell: Option<CellPos>,
        mode: ActionMode,
    },
    CmdActionCancel {
        action_id: u32,
    },
}

/// Server-to-client wrapper: errors, the rules catalog, lobby and world
/// events, action lifecycle and economy updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerToClient {
    Error {
        error: String,
    },
    InfoTerrainType {
        terrain_type_id: u32,
        name: String,
        description: String,
        tags: Vec<String>,
    },
    InfoResourceType {
        resource_type_id: u32,
        name: String,
        description: String,
        start_amount: i64,
    },
    InfoUnitType {
        unit_type_id: u32,
        name: String,
        description: String,
        tags: Vec<String>,
        default_action_type_id: u32,
    },
    InfoActionType {
        action_type_id: u32,
        name: String,
        description: String,
        unit_type_id: u32,
        cost: Vec<ResourceAmount>,
        duration: f64,
        default_mode: ActionMode,
        target_type: ActionTargetType,
        target_tags: Vec<String>,
    },
    EventPlayerJoin {
        player_id: u32,
        name: String,
    },
    EventPlayerLeave {
        player_id: u32,
    },
    EventGameStart,
    EventMapGenerate {
        width: u32,
        height: u32,
    },
    EventMapGenerateCell {
        position: CellPos,
        terrain_type_id: u32,
    },
    EventUnitCreate {
        unit_id: u32,
        player_id: u32,
        unit_type_id: u32,
        position: CellPos,
    },
    EventUnitMove {
        unit_id: u32,
        position: CellPos,
    },
    EventActionQueued {
        action_id: u32,
        unit_id: u32,
    },
    EventActionUpdate {
        action_id: u32,
        state: ActionState,
        message: Option<String>,
    },
    EventActionDequeued {
        action_id: u32,
    },
    EventPlayerResource {
        resource_type_id: u32,
        amount: i64,
    },
}
