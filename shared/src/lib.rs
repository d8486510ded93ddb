//! # Shared Game Library
//!
//! This module contains all shared data structures, constants, and message
//! definitions used by the game server and any client talking to it. It serves
//! as the foundation for the WebSocket protocol and ensures both sides agree
//! on the shape of the game world.
//!
//! ## Core Components
//!
//! ### Game Constants
//! World parameters that define the play area:
//! - **Grid Dimensions**: The bounded 2D grid the shared object moves on
//! - **Player Capacity**: Maximum number of simultaneously joined players
//! - **Color Palette**: Fixed set of colors assigned to players round-robin
//!
//! ### Wire Protocol
//! Every frame on the wire is a JSON [`Envelope`] carrying a [`MessageType`]
//! tag, a type-specific `data` payload, an optional player id, and an RFC3339
//! timestamp. Client→server payloads are [`JoinRequest`], [`LeaveRequest`] and
//! [`MoveRequest`]; server→client payloads are [`GameSnapshot`],
//! [`ErrorResponse`] and [`ConflictResponse`].
//!
//! ### Versioned State
//! The [`GameObject`] carries a monotonically increasing version that clients
//! echo back with each move. The server uses it to detect write-write
//! conflicts optimistically instead of locking the object per player.
//!
//! ## Design Philosophy
//!
//! ### Snapshot Semantics
//! [`GameSnapshot`] is a deep, independent copy of the authoritative state.
//! Holding or mutating a snapshot never affects the live state, which keeps
//! broadcast fan-out free of aliasing bugs.
//!
//! ### Type Safety
//! Strong typing prevents common protocol bugs: directions are an enum rather
//! than free-form strings, error codes are a closed set, and malformed
//! payloads fail at decode time instead of deep inside a handler.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Width of the default game grid in cells
pub const GRID_WIDTH: i32 = 20;

/// Height of the default game grid in cells
pub const GRID_HEIGHT: i32 = 20;

/// Maximum number of players that can join a game
pub const MAX_PLAYERS: usize = 4;

/// Colors assigned to joining players, indexed by roster size modulo the
/// palette length
pub const PLAYER_COLORS: [&str; 4] = ["#FF0000", "#00FF00", "#0000FF", "#FFFF00"];

/// Coordinates on the game grid
///
/// Also used for grid dimensions, where `x`/`y` are the exclusive upper
/// bounds. The grid uses a Y-down convention: `up` decreases `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    /// Applies one step in `direction`, clamped to the grid bounds
    ///
    /// Steps off a boundary clamp to the boundary, so the result of a step
    /// from a valid position is always a valid position. A clamped step may
    /// return the starting position unchanged.
    pub fn step(self, direction: Direction, grid: Position) -> Position {
        match direction {
            Direction::Up => Position {
                x: self.x,
                y: (self.y - 1).max(0),
            },
            Direction::Down => Position {
                x: self.x,
                y: (self.y + 1).min(grid.y - 1),
            },
            Direction::Left => Position {
                x: (self.x - 1).max(0),
                y: self.y,
            },
            Direction::Right => Position {
                x: (self.x + 1).min(grid.x - 1),
                y: self.y,
            },
        }
    }

    /// Returns true if this position lies within `grid`
    pub fn in_bounds(self, grid: Position) -> bool {
        self.x >= 0 && self.x < grid.x && self.y >= 0 && self.y < grid.y
    }
}

/// Movement directions accepted in a move request
///
/// Serialized in lowercase on the wire. Unknown direction strings fail to
/// decode, so an unrecognised direction can never reach the game logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

/// The one shared object all players contend over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameObject {
    pub id: String,
    pub position: Position,
    pub version: i64,
    pub last_updated: DateTime<Utc>,
}

/// A joined player as seen in snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: String,
    pub name: String,
    pub color: String,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
}

/// Deep, independent copy of the authoritative game state
///
/// Mutating a snapshot never affects the live state it was taken from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    pub object: GameObject,
    pub players: HashMap<String, Player>,
    pub version: i64,
    pub max_players: usize,
    pub grid_size: Position,
}

/// Tag identifying the payload carried by an [`Envelope`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Join,
    Leave,
    Move,
    GameState,
    Error,
    Conflict,
}

/// One WebSocket text frame
///
/// The `data` field stays an untyped JSON value at this level; handlers decode
/// it into the payload struct matching `kind` with [`Envelope::data_as`], so a
/// malformed payload is a per-message validation error rather than a broken
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(rename = "playerId", default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Builds an envelope around a serializable payload, stamped now
    pub fn new<T: Serialize>(kind: MessageType, data: &T) -> serde_json::Result<Self> {
        Ok(Self {
            kind,
            data: serde_json::to_value(data)?,
            player_id: None,
            timestamp: Utc::now(),
        })
    }

    /// Decodes the `data` payload into the struct matching `kind`
    pub fn data_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.data.clone())
    }
}

/// Payload of a `join` message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub player_name: String,
}

/// Payload of a `leave` message; carries no fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaveRequest {}

/// Payload of a `move` message
///
/// `object_version` is the object version the client last observed. The
/// server re-reads its own snapshot when the transaction begins, so the field
/// is informational on the wire rather than an input to conflict detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    pub direction: Direction,
    pub object_version: i64,
    pub request_id: String,
}

/// Stable machine-readable error codes sent alongside error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    GameFull,
    InvalidJoin,
    InvalidMove,
    NotRegistered,
    TransactionError,
}

/// Payload of an `error` message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub message: String,
    pub code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Payload of a `conflict` message
///
/// `expected_version` is the version the losing transaction started from;
/// `actual_version` is the version found at commit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResponse {
    pub message: String,
    pub expected_version: i64,
    pub actual_version: i64,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Position {
        Position { x: 10, y: 10 }
    }

    #[test]
    fn test_step_moves_within_grid() {
        let start = Position { x: 5, y: 5 };
        assert_eq!(start.step(Direction::Up, grid()), Position { x: 5, y: 4 });
        assert_eq!(start.step(Direction::Down, grid()), Position { x: 5, y: 6 });
        assert_eq!(start.step(Direction::Left, grid()), Position { x: 4, y: 5 });
        assert_eq!(start.step(Direction::Right, grid()), Position { x: 6, y: 5 });
    }

    #[test]
    fn test_step_clamps_at_edges() {
        let origin = Position { x: 0, y: 0 };
        assert_eq!(origin.step(Direction::Up, grid()), origin);
        assert_eq!(origin.step(Direction::Left, grid()), origin);

        let corner = Position { x: 9, y: 9 };
        assert_eq!(corner.step(Direction::Down, grid()), corner);
        assert_eq!(corner.step(Direction::Right, grid()), corner);
    }

    #[test]
    fn test_in_bounds() {
        assert!(Position { x: 0, y: 0 }.in_bounds(grid()));
        assert!(Position { x: 9, y: 9 }.in_bounds(grid()));
        assert!(!Position { x: 10, y: 9 }.in_bounds(grid()));
        assert!(!Position { x: -1, y: 0 }.in_bounds(grid()));
    }

    #[test]
    fn test_direction_wire_spelling() {
        assert_eq!(serde_json::to_string(&Direction::Up).unwrap(), "\"up\"");
        assert_eq!(
            serde_json::from_str::<Direction>("\"right\"").unwrap(),
            Direction::Right
        );
        assert!(serde_json::from_str::<Direction>("\"sideways\"").is_err());
    }

    #[test]
    fn test_error_code_wire_spelling() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::GameFull).unwrap(),
            "\"GAME_FULL\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::NotRegistered).unwrap(),
            "\"NOT_REGISTERED\""
        );
    }

    #[test]
    fn test_move_envelope_wire_shape() {
        let envelope = Envelope::new(
            MessageType::Move,
            &MoveRequest {
                direction: Direction::Right,
                object_version: 1,
                request_id: "req-1".to_string(),
            },
        )
        .unwrap();

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "move");
        assert_eq!(value["data"]["direction"], "right");
        assert_eq!(value["data"]["objectVersion"], 1);
        assert_eq!(value["data"]["requestId"], "req-1");
        assert!(value["timestamp"].is_string());
        // playerId is omitted entirely when unset
        assert!(value.get("playerId").is_none());
    }

    #[test]
    fn test_envelope_timestamp_defaults_when_missing() {
        let envelope: Envelope = serde_json::from_str(r#"{"type":"leave","data":{}}"#).unwrap();
        assert_eq!(envelope.kind, MessageType::Leave);
    }

    #[test]
    fn test_envelope_payload_roundtrip() {
        let envelope = Envelope::new(
            MessageType::Join,
            &JoinRequest {
                player_name: "Alice".to_string(),
            },
        )
        .unwrap();

        let text = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&text).unwrap();
        let request: JoinRequest = parsed.data_as().unwrap();
        assert_eq!(request.player_name, "Alice");
    }

    #[test]
    fn test_snapshot_serde_roundtrip() {
        let mut players = HashMap::new();
        players.insert(
            "p1".to_string(),
            Player {
                id: "p1".to_string(),
                name: "Alice".to_string(),
                color: PLAYER_COLORS[0].to_string(),
                connected: true,
                last_seen: Utc::now(),
            },
        );

        let snapshot = GameSnapshot {
            object: GameObject {
                id: "obj".to_string(),
                position: Position { x: 10, y: 10 },
                version: 3,
                last_updated: Utc::now(),
            },
            players,
            version: 5,
            max_players: MAX_PLAYERS,
            grid_size: Position {
                x: GRID_WIDTH,
                y: GRID_HEIGHT,
            },
        };

        let text = serde_json::to_string(&snapshot).unwrap();
        let parsed: GameSnapshot = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
