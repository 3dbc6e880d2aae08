//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Difficulty selected by the client at join time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Normal,
    Hard,
}

impl Default for Difficulty {
    fn default() -> Self {
        Self::Normal
    }
}

/// A point on the battlefield
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Claimed shot trajectory endpoints
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub start_x: f32,
    pub start_y: f32,
    pub end_x: f32,
    pub end_y: f32,
}

impl Trajectory {
    /// Straight-line length of the claimed trajectory
    pub fn length(&self) -> f32 {
        let dx = self.end_x - self.start_x;
        let dy = self.end_y - self.start_y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Declared melee action kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MeleeActionKind {
    Attack,
    PowerAttack,
    Defend,
    Riposte,
}

/// Status effect tags carried by melee actions and results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectTag {
    Stun,
    Bleed,
    Defend,
    Riposte,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Join a battle room
    Join {
        player_id: Uuid,
        #[serde(default)]
        difficulty: Difficulty,
    },

    /// Client-reported transient state for one player
    Update {
        id: Uuid,
        x: f32,
        y: f32,
        angle: f32,
        health: i32,
        ammo: i32,
    },

    /// Weapon fired
    Shot {
        player_id: Uuid,
        position: Position,
        trajectory: Trajectory,
        /// Client clock at fire time, advisory only
        #[serde(default)]
        timestamp: Option<u64>,
    },

    /// Claimed hit on another player
    Hit {
        player_id: Uuid,
        target_id: Uuid,
        weapon: String,
        damage: i32,
    },

    /// Declared melee exchange
    Melee {
        player_id: Uuid,
        #[serde(default)]
        target_id: Option<Uuid>,
        action: MeleeActionKind,
        #[serde(default)]
        effects: Vec<EffectTag>,
    },

    /// End of battle for this player, triggers reward settlement
    End {
        player_id: Uuid,
        score: i64,
        kills: u32,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// A player entered the room
    PlayerJoined { player: PlayerInfo },

    /// Initial sync for the joining client
    Start {
        room_id: Uuid,
        players: Vec<PlayerInfo>,
    },

    /// State relay from one player to the rest of the room
    PlayerUpdate {
        id: Uuid,
        x: f32,
        y: f32,
        angle: f32,
        health: i32,
        ammo: i32,
    },

    /// Shot echo (broadcast whether or not the claim validated)
    Shot {
        player_id: Uuid,
        position: Position,
        trajectory: Trajectory,
    },

    /// Hit relay
    Hit {
        player_id: Uuid,
        target_id: Uuid,
        weapon: String,
        damage: i32,
    },

    /// Outcome of a melee exchange
    MeleeResult {
        attacker_id: Uuid,
        target_id: Option<Uuid>,
        success: bool,
        hit: bool,
        damage_dealt: i32,
        target_killed: bool,
        message: String,
        applied_effects: Vec<EffectTag>,
    },

    /// A player left the room
    PlayerLeft { player_id: Uuid },

    /// Settlement outcome, sent only to the ending client
    Reward { tokens_earned: i64 },

    /// Error message
    Error { code: String, message: String },
}

/// Player roster entry as seen on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: Uuid,
    pub display_name: String,
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub health: i32,
    pub ammo: i32,
    pub alive: bool,
    pub kills: u32,
    pub deaths: u32,
    pub score: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_parses_documented_wire_shape() {
        let raw = r#"{"type":"join","player_id":"7b9f8a3c-53a2-4f09-9b6e-0d2c5a1e4f88","difficulty":"hard"}"#;
        let msg: ClientMsg = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMsg::Join { difficulty, .. } => assert_eq!(difficulty, Difficulty::Hard),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn join_difficulty_defaults_when_absent() {
        let raw = r#"{"type":"join","player_id":"7b9f8a3c-53a2-4f09-9b6e-0d2c5a1e4f88"}"#;
        let msg: ClientMsg = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMsg::Join { difficulty, .. } => assert_eq!(difficulty, Difficulty::Normal),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn melee_action_uses_kebab_case() {
        let raw = r#"{"type":"melee","player_id":"7b9f8a3c-53a2-4f09-9b6e-0d2c5a1e4f88","action":"power-attack"}"#;
        let msg: ClientMsg = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMsg::Melee {
                action, target_id, ..
            } => {
                assert_eq!(action, MeleeActionKind::PowerAttack);
                assert!(target_id.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn trajectory_length_is_euclidean() {
        let t = Trajectory {
            start_x: 0.0,
            start_y: 0.0,
            end_x: 3.0,
            end_y: 4.0,
        };
        assert_eq!(t.length(), 5.0);
    }
}
