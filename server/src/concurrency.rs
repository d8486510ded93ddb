//! Optimistic concurrency control over the shared game object
//!
//! This module implements the transaction engine that lets any number of
//! players race to move the shared object without ever blocking each other.
//! Each move runs as a short optimistic transaction:
//! - **Begin** records the object version the player observed
//! - **Propose** computes the candidate position against a fresh snapshot
//! - **Commit** re-checks the version inside the store's write lock and either
//!   applies the change or reports a conflict
//!
//! Losing transactions are not retried here; the conflict is the interesting
//! result, so it is surfaced to the caller together with the versions that
//! disagreed. Conflict statistics are kept for observability.

use crate::game::{GameStore, StateStore};
use log::debug;
use parking_lot::Mutex;
use shared::{Direction, GameObject, GameSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors from proposing a move inside a transaction
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProposeError {
    #[error("invalid move: out of bounds")]
    OutOfBounds,
    #[error("no active transaction")]
    NoTransaction,
}

/// Errors from committing a transaction
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommitError {
    #[error("version mismatch: expected version {expected}, got {actual}")]
    VersionMismatch { expected: i64, actual: i64 },
    #[error("transaction has no proposed changes")]
    NoProposal,
    #[error("no active transaction")]
    NoTransaction,
}

/// An in-flight optimistic transaction
///
/// Lives in the controller's active table from `begin_transaction` until the
/// terminal `commit_transaction` or `abort_transaction` call.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub player_id: String,
    pub request_id: String,
    pub started_at: Instant,
    pub initial_version: i64,
    pub proposed: Option<GameObject>,
}

/// Running totals kept for the conflict visualization
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConflictStats {
    pub total_transactions: u64,
    pub conflict_count: u64,
    pub successful_moves: u64,
    pub average_latency: Duration,
}

struct ControllerInner {
    active: HashMap<String, Transaction>,
    stats: ConflictStats,
}

/// The optimistic concurrency engine
///
/// One lock guards the active-transaction table and the statistics; the state
/// store keeps its own lock. When both are held (the commit path) the
/// controller lock is always taken first.
pub struct ConcurrencyController<S = GameStore> {
    store: Arc<S>,
    inner: Mutex<ControllerInner>,
    nonce: AtomicU64,
}

impl<S: StateStore> ConcurrencyController<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            inner: Mutex::new(ControllerInner {
                active: HashMap::new(),
                stats: ConflictStats::default(),
            }),
            nonce: AtomicU64::new(1),
        }
    }

    /// Starts a transaction for one move attempt
    ///
    /// Snapshots the store and pins the observed object version as the
    /// transaction's conflict baseline. The transaction id mixes in a
    /// process-monotonic nonce so reused request ids still yield unique ids.
    pub fn begin_transaction(&self, player_id: &str, request_id: &str) -> Transaction {
        let snapshot = self.store.snapshot();
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);

        let transaction = Transaction {
            id: format!("{}-{}-{}", player_id, request_id, nonce),
            player_id: player_id.to_string(),
            request_id: request_id.to_string(),
            started_at: Instant::now(),
            initial_version: snapshot.object.version,
            proposed: None,
        };

        let mut inner = self.inner.lock();
        inner.stats.total_transactions += 1;
        inner
            .active
            .insert(transaction.id.clone(), transaction.clone());

        transaction
    }

    /// Validates a move and stages it on the transaction
    ///
    /// The candidate position is one clamped step from the *current* snapshot
    /// position. A step off the grid edge clamps back onto it and is staged
    /// as an identity move that still bumps the version on commit.
    /// Authoritative state is not touched.
    pub fn propose_move(
        &self,
        transaction_id: &str,
        direction: Direction,
    ) -> Result<(), ProposeError> {
        let snapshot = self.store.snapshot();

        let mut inner = self.inner.lock();
        let transaction = inner
            .active
            .get_mut(transaction_id)
            .ok_or(ProposeError::NoTransaction)?;

        let new_position = snapshot
            .object
            .position
            .step(direction, snapshot.grid_size);
        if !new_position.in_bounds(snapshot.grid_size) {
            return Err(ProposeError::OutOfBounds);
        }

        transaction.proposed = Some(GameObject {
            id: snapshot.object.id.clone(),
            position: new_position,
            version: snapshot.object.version + 1,
            last_updated: chrono::Utc::now(),
        });

        Ok(())
    }

    /// Attempts to commit a transaction against the live state
    ///
    /// The table entry is removed whether or not the commit succeeds. The
    /// version check, the mutation, and every statistics update happen inside
    /// one critical section under the store's write lock, so no two commits
    /// can observe the same current version.
    pub fn commit_transaction(&self, transaction_id: &str) -> Result<GameSnapshot, CommitError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let transaction = inner
            .active
            .remove(transaction_id)
            .ok_or(CommitError::NoTransaction)?;
        let proposed = transaction.proposed.ok_or(CommitError::NoProposal)?;

        let stats = &mut inner.stats;
        self.store.with_commit_lock(|state| {
            let current_version = state.object.version;

            if transaction.initial_version != current_version {
                stats.conflict_count += 1;
                debug!(
                    "Transaction {} conflicted: expected version {}, got {}",
                    transaction_id, transaction.initial_version, current_version
                );
                return Err(CommitError::VersionMismatch {
                    expected: transaction.initial_version,
                    actual: current_version,
                });
            }

            state.object.position = proposed.position;
            state.object.version = proposed.version;
            state.object.last_updated = proposed.last_updated;
            state.version += 1;

            stats.successful_moves += 1;
            stats.average_latency = update_average_latency(
                stats.average_latency,
                transaction.started_at.elapsed(),
                stats.successful_moves,
            );

            Ok(state.snapshot())
        })
    }

    /// Drops a transaction without committing; unknown ids are ignored
    pub fn abort_transaction(&self, transaction_id: &str) {
        self.inner.lock().active.remove(transaction_id);
    }

    /// Aborts every transaction still registered for a player
    ///
    /// Called on session teardown so a dropped connection leaves nothing in
    /// the active table. Returns how many transactions were swept.
    pub fn abort_player_transactions(&self, player_id: &str) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.active.len();
        inner.active.retain(|_, tx| tx.player_id != player_id);
        before - inner.active.len()
    }

    /// Current statistics snapshot
    pub fn conflict_stats(&self) -> ConflictStats {
        self.inner.lock().stats
    }

    /// Number of transactions that have begun but not reached a terminal call
    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }
}

/// Rolling average over `count` samples, `sample` being the newest
fn update_average_latency(current: Duration, sample: Duration, count: u64) -> Duration {
    if count <= 1 {
        return sample;
    }
    let total = current.as_nanos() * (count as u128 - 1) + sample.as_nanos();
    Duration::from_nanos((total / count as u128) as u64)
}
