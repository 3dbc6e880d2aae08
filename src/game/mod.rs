//! Battle coordination modules

pub mod combat;
pub mod room;
pub mod settlement;
pub mod validator;

pub use room::{BattleRoom, RoomHandle, RoomRegistry};

use uuid::Uuid;

use crate::ws::protocol::ClientMsg;

/// Inbound room event, one per WebSocket message or transport notification
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// A parsed client message plus its transport context
    Message {
        session_id: Uuid,
        msg: ClientMsg,
        /// Server arrival time (ms); the only ordering key within a room
        received_at: u64,
    },
    /// The transport layer lost this session
    Disconnected { session_id: Uuid },
}

/// Addressing for one outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    All,
    AllExcept(Uuid),
    Only(Uuid),
}

impl Recipients {
    /// Whether the session with this id should receive the message
    pub fn includes(&self, session_id: Uuid) -> bool {
        match self {
            Recipients::All => true,
            Recipients::AllExcept(excluded) => *excluded != session_id,
            Recipients::Only(only) => *only == session_id,
        }
    }
}
