//! Authoritative game state store and the lock discipline around it

use chrono::Utc;
use log::info;
use parking_lot::RwLock;
use shared::{
    GameObject, GameSnapshot, Player, Position, GRID_HEIGHT, GRID_WIDTH, MAX_PLAYERS,
    PLAYER_COLORS,
};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Errors from roster mutation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("game is full")]
    GameFull,
}

/// The live game state
///
/// Only ever touched through [`GameStore`]: readers get deep copies via
/// `snapshot`, writers run inside the store's write lock.
#[derive(Debug)]
pub struct GameState {
    pub object: GameObject,
    pub players: HashMap<String, Player>,
    pub version: i64,
    pub max_players: usize,
    pub grid_size: Position,
}

impl GameState {
    fn new(grid_size: Position) -> Self {
        Self {
            object: GameObject {
                id: Uuid::new_v4().to_string(),
                position: Position {
                    x: grid_size.x / 2,
                    y: grid_size.y / 2,
                },
                version: 1,
                last_updated: Utc::now(),
            },
            players: HashMap::new(),
            version: 1,
            max_players: MAX_PLAYERS,
            grid_size,
        }
    }

    /// Deep copy of every field; the result shares nothing with the live state
    pub fn snapshot(&self) -> GameSnapshot {
        GameSnapshot {
            object: self.object.clone(),
            players: self.players.clone(),
            version: self.version,
            max_players: self.max_players,
            grid_size: self.grid_size,
        }
    }
}

/// Contract between the state store and the concurrency controller
///
/// `GameStore` is the only production implementation; the seam exists so the
/// controller can be driven against a scripted store in tests.
pub trait StateStore: Send + Sync {
    /// Consistent deep copy of the current state
    fn snapshot(&self) -> GameSnapshot;

    /// Runs `f` as the commit critical section under the write lock
    fn with_commit_lock<R>(&self, f: impl FnOnce(&mut GameState) -> R) -> R;

    /// Adds a player to the roster, assigning id and color
    fn add_player(&self, name: &str) -> Result<Player, RosterError>;

    /// Flags a player as disconnected; returns false for unknown ids
    fn mark_disconnected(&self, player_id: &str) -> bool;

    /// Drops a player that is still disconnected; returns whether removal
    /// happened
    fn remove_if_disconnected(&self, player_id: &str) -> bool;

    /// Refreshes a player's last-seen timestamp
    fn touch_player(&self, player_id: &str);
}

/// Owner of the single authoritative [`GameState`]
///
/// A reader-writer lock guards the whole state: snapshots copy under the read
/// lock, commits and roster changes run under the write lock. The lock is
/// never held across an await point.
pub struct GameStore {
    state: RwLock<GameState>,
}

impl GameStore {
    pub fn new(grid_size: Position) -> Self {
        Self {
            state: RwLock::new(GameState::new(grid_size)),
        }
    }
}

impl Default for GameStore {
    fn default() -> Self {
        Self::new(Position {
            x: GRID_WIDTH,
            y: GRID_HEIGHT,
        })
    }
}

impl StateStore for GameStore {
    fn snapshot(&self) -> GameSnapshot {
        self.state.read().snapshot()
    }

    fn with_commit_lock<R>(&self, f: impl FnOnce(&mut GameState) -> R) -> R {
        f(&mut self.state.write())
    }

    fn add_player(&self, name: &str) -> Result<Player, RosterError> {
        let mut state = self.state.write();

        if state.players.len() >= state.max_players {
            return Err(RosterError::GameFull);
        }

        let color = PLAYER_COLORS[state.players.len() % PLAYER_COLORS.len()];
        let player = Player {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            color: color.to_string(),
            connected: true,
            last_seen: Utc::now(),
        };
        state.players.insert(player.id.clone(), player.clone());

        Ok(player)
    }

    fn mark_disconnected(&self, player_id: &str) -> bool {
        let mut state = self.state.write();
        if let Some(player) = state.players.get_mut(player_id) {
            player.connected = false;
            player.last_seen = Utc::now();
            true
        } else {
            false
        }
    }

    fn remove_if_disconnected(&self, player_id: &str) -> bool {
        let mut state = self.state.write();
        match state.players.get(player_id) {
            Some(player) if !player.connected => {
                state.players.remove(player_id);
                info!("Removed player {} after grace period", player_id);
                true
            }
            _ => false,
        }
    }

    fn touch_player(&self, player_id: &str) {
        let mut state = self.state.write();
        if let Some(player) = state.players.get_mut(player_id) {
            player.last_seen = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GameStore {
        GameStore::new(Position { x: 20, y: 20 })
    }

    #[test]
    fn test_new_state_defaults() {
        let snapshot = store().snapshot();

        assert_eq!(snapshot.object.position, Position { x: 10, y: 10 });
        assert_eq!(snapshot.object.version, 1);
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.max_players, 4);
        assert!(snapshot.players.is_empty());
        assert!(!snapshot.object.id.is_empty());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let store = store();
        let mut snapshot = store.snapshot();

        snapshot.object.version = 999;
        snapshot.object.position = Position { x: 0, y: 0 };
        snapshot.players.insert(
            "ghost".to_string(),
            Player {
                id: "ghost".to_string(),
                name: "Ghost".to_string(),
                color: "#000000".to_string(),
                connected: false,
                last_seen: Utc::now(),
            },
        );

        let fresh = store.snapshot();
        assert_eq!(fresh.object.version, 1);
        assert_eq!(fresh.object.position, Position { x: 10, y: 10 });
        assert!(fresh.players.is_empty());
    }

    #[test]
    fn test_add_player_assigns_palette_colors() {
        let store = store();

        let first = store.add_player("Alice").unwrap();
        let second = store.add_player("Bob").unwrap();

        assert_eq!(first.color, PLAYER_COLORS[0]);
        assert_eq!(second.color, PLAYER_COLORS[1]);
        assert!(first.connected);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_add_player_enforces_capacity() {
        let store = store();

        for i in 0..MAX_PLAYERS {
            store.add_player(&format!("player-{}", i)).unwrap();
        }

        assert_eq!(store.add_player("late"), Err(RosterError::GameFull));
        assert_eq!(store.snapshot().players.len(), MAX_PLAYERS);
    }

    #[test]
    fn test_mark_disconnected() {
        let store = store();
        let player = store.add_player("Alice").unwrap();

        assert!(store.mark_disconnected(&player.id));
        assert!(!store.snapshot().players[&player.id].connected);

        assert!(!store.mark_disconnected("unknown"));
    }

    #[test]
    fn test_remove_only_when_disconnected() {
        let store = store();
        let player = store.add_player("Alice").unwrap();

        // Still connected: removal refuses
        assert!(!store.remove_if_disconnected(&player.id));
        assert_eq!(store.snapshot().players.len(), 1);

        store.mark_disconnected(&player.id);
        assert!(store.remove_if_disconnected(&player.id));
        assert!(store.snapshot().players.is_empty());

        // Second removal is a no-op
        assert!(!store.remove_if_disconnected(&player.id));
    }

    #[test]
    fn test_commit_lock_mutations_are_visible() {
        let store = store();

        store.with_commit_lock(|state| {
            state.object.position = Position { x: 3, y: 4 };
            state.object.version += 1;
            state.version += 1;
        });

        let snapshot = store.snapshot();
        assert_eq!(snapshot.object.position, Position { x: 3, y: 4 });
        assert_eq!(snapshot.object.version, 2);
        assert_eq!(snapshot.version, 2);
    }

    #[test]
    fn test_touch_player_refreshes_last_seen() {
        let store = store();
        let player = store.add_player("Alice").unwrap();
        let before = store.snapshot().players[&player.id].last_seen;

        store.touch_player(&player.id);
        let after = store.snapshot().players[&player.id].last_seen;
        assert!(after >= before);
    }
}
