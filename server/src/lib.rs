//! # Game Server Library
//!
//! This library implements the authoritative server for a real-time
//! multiplayer game in which every connected player contends over a single
//! shared object on a bounded grid. Its purpose is to make write-write
//! conflicts between players visible: moves run as optimistic transactions,
//! the loser of a race gets an explicit conflict message, and every client
//! re-converges on the committed state.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! The server owns the only live copy of the game state. Clients never
//! mutate state directly; they submit intents and receive snapshot
//! broadcasts that reflect whatever the server committed.
//!
//! ### Optimistic Concurrency
//! Moves are arbitrated by version comparison rather than locking. Two
//! players may both act on the same observed state; the first commit wins,
//! the second is rejected with the pair of versions that disagreed. This is
//! deliberate: a pessimistic lock would serialise the intents and hide the
//! race this server exists to demonstrate.
//!
//! ### Session Management
//! Handles the complete lifecycle of WebSocket sessions: upgrade, join,
//! heartbeats, backpressure, disconnect, and a grace window during which a
//! disconnected player remains visible in the roster.
//!
//! ## Architecture Design
//!
//! Three components, each owning its data exclusively:
//!
//! - [`game::GameStore`] owns the game state behind a reader-writer lock and
//!   hands out deep snapshots.
//! - [`concurrency::ConcurrencyController`] owns the table of in-flight
//!   transactions and the conflict statistics, and runs the commit critical
//!   section against the store.
//! - [`hub`] owns the session set on a single event-loop task; sessions
//!   reach it through channels, never through shared mutable state.
//!
//! When the controller and store locks are both held, the controller lock is
//! taken first; no other component acquires both, which rules out deadlock.
//!
//! ## Module Organization
//!
//! ### Game Module (`game`)
//! The authoritative state store: snapshot reads, the commit critical
//! section, and roster mutation, all guarded by one reader-writer lock.
//!
//! ### Concurrency Module (`concurrency`)
//! The optimistic transaction engine: begin/propose/commit/abort, version
//! conflict detection, and running statistics for the conflict
//! visualization.
//!
//! ### Hub Module (`hub`)
//! WebSocket plumbing: per-session read and write pumps, the hub event loop
//! that fans snapshots out to every session, heartbeat deadlines, and
//! slow-consumer eviction.

pub mod concurrency;
pub mod game;
pub mod hub;
