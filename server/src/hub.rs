//! WebSocket session hub: fan-in of client intents, fan-out of state
//!
//! The hub is the single writer over the set of connected sessions. Sessions
//! never touch each other's state; they post `HubEvent`s onto the hub's event
//! channel and the hub task reacts: registering sessions, delivering direct
//! messages, fanning out snapshot broadcasts, and cleaning up after
//! disconnects.
//!
//! Each accepted connection runs two tasks. The read pump decodes inbound
//! envelopes and drives the concurrency controller for moves; the write pump
//! drains a bounded outbound queue into the socket and sends heartbeat pings.
//! A session whose queue is full at delivery time is evicted rather than
//! stalling the hub: slow consumers are dropped, not waited on.

use crate::concurrency::{CommitError, ConcurrencyController};
use crate::game::{GameStore, RosterError, StateStore};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{
    ConflictResponse, Envelope, ErrorCode, ErrorResponse, JoinRequest, MessageType, MoveRequest,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};

/// How long a single outbound write may take before the session is torn down
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// How long the read pump waits for any inbound frame (pongs included)
const PONG_WAIT: Duration = Duration::from_secs(60);

/// Heartbeat ping interval; must be shorter than [`PONG_WAIT`]
const PING_PERIOD: Duration = Duration::from_secs(54);

/// Maximum size of an inbound message in bytes
const MAX_MESSAGE_SIZE: usize = 512;

/// Timing and capacity knobs for the hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long a disconnected player survives in the roster before removal
    pub grace_period: Duration,
    /// Capacity of each session's outbound queue
    pub outbound_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            outbound_queue: 256,
        }
    }
}

/// Events posted to the hub task by sessions and internal timers
enum HubEvent {
    Register {
        session_id: u64,
        sender: mpsc::Sender<Message>,
    },
    Unregister {
        session_id: u64,
        player_id: Option<String>,
    },
    Broadcast,
    SendTo {
        session_id: u64,
        envelope: Envelope,
    },
}

/// Shared handle used by sessions to reach the hub task
pub struct Hub {
    store: Arc<GameStore>,
    controller: Arc<ConcurrencyController>,
    config: HubConfig,
    events_tx: mpsc::Sender<HubEvent>,
    next_session_id: AtomicU64,
}

impl Hub {
    /// Creates the hub handle and the event-loop task driving it
    ///
    /// The returned [`HubTask`] must be spawned exactly once; the `Arc<Hub>`
    /// handle is cloned into every connection task.
    pub fn new(
        store: Arc<GameStore>,
        controller: Arc<ConcurrencyController>,
    ) -> (Arc<Hub>, HubTask) {
        Self::with_config(store, controller, HubConfig::default())
    }

    pub fn with_config(
        store: Arc<GameStore>,
        controller: Arc<ConcurrencyController>,
        config: HubConfig,
    ) -> (Arc<Hub>, HubTask) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let hub = Arc::new(Hub {
            store,
            controller,
            config,
            events_tx,
            next_session_id: AtomicU64::new(1),
        });
        let task = HubTask {
            hub: Arc::clone(&hub),
            events: events_rx,
            sessions: HashMap::new(),
        };
        (hub, task)
    }

    /// Queues a snapshot broadcast to every connected session
    pub async fn broadcast(&self) {
        self.send_event(HubEvent::Broadcast).await;
    }

    async fn register(&self, session_id: u64, sender: mpsc::Sender<Message>) {
        self.send_event(HubEvent::Register { session_id, sender })
            .await;
    }

    async fn unregister(&self, session_id: u64, player_id: Option<String>) {
        self.send_event(HubEvent::Unregister {
            session_id,
            player_id,
        })
        .await;
    }

    async fn send_error(
        &self,
        session_id: u64,
        message: &str,
        code: ErrorCode,
        request_id: Option<String>,
    ) {
        let response = ErrorResponse {
            message: message.to_string(),
            code,
            request_id,
        };
        match Envelope::new(MessageType::Error, &response) {
            Ok(envelope) => {
                self.send_event(HubEvent::SendTo {
                    session_id,
                    envelope,
                })
                .await
            }
            Err(e) => error!("Failed to marshal error response: {}", e),
        }
    }

    async fn send_conflict(
        &self,
        session_id: u64,
        request_id: String,
        expected_version: i64,
        actual_version: i64,
    ) {
        let response = ConflictResponse {
            message: "version mismatch: concurrent modification detected".to_string(),
            expected_version,
            actual_version,
            request_id,
            timestamp: Utc::now(),
        };
        match Envelope::new(MessageType::Conflict, &response) {
            Ok(envelope) => {
                self.send_event(HubEvent::SendTo {
                    session_id,
                    envelope,
                })
                .await
            }
            Err(e) => error!("Failed to marshal conflict response: {}", e),
        }
    }

    async fn send_event(&self, event: HubEvent) {
        if self.events_tx.send(event).await.is_err() {
            warn!("Hub event loop is gone; dropping event");
        }
    }
}

/// The hub's event loop; owns the session set
pub struct HubTask {
    hub: Arc<Hub>,
    events: mpsc::Receiver<HubEvent>,
    sessions: HashMap<u64, mpsc::Sender<Message>>,
}

impl HubTask {
    /// Runs until every hub handle is dropped
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle_event(event);
        }
        info!("Hub event loop stopped");
    }

    fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register { session_id, sender } => {
                self.sessions.insert(session_id, sender);
                info!(
                    "Session {} connected. Total sessions: {}",
                    session_id,
                    self.sessions.len()
                );

                // New sessions see the current state immediately
                match Envelope::new(MessageType::GameState, &self.hub.store.snapshot()) {
                    Ok(envelope) => self.deliver(session_id, &envelope),
                    Err(e) => error!("Failed to marshal game state: {}", e),
                }
            }

            HubEvent::Unregister {
                session_id,
                player_id,
            } => {
                if self.sessions.remove(&session_id).is_some() {
                    info!(
                        "Session {} disconnected. Total sessions: {}",
                        session_id,
                        self.sessions.len()
                    );
                }

                if let Some(player_id) = player_id {
                    let swept = self.hub.controller.abort_player_transactions(&player_id);
                    if swept > 0 {
                        debug!(
                            "Aborted {} outstanding transactions for player {}",
                            swept, player_id
                        );
                    }

                    if self.hub.store.mark_disconnected(&player_id) {
                        self.spawn_grace_removal(player_id);
                    }
                    self.broadcast_state();
                }
            }

            HubEvent::Broadcast => self.broadcast_state(),

            HubEvent::SendTo {
                session_id,
                envelope,
            } => self.deliver(session_id, &envelope),
        }
    }

    /// Serializes the current snapshot once and fans it out to every session
    fn broadcast_state(&mut self) {
        let message = match Envelope::new(MessageType::GameState, &self.hub.store.snapshot())
            .and_then(|envelope| serde_json::to_string(&envelope))
        {
            Ok(text) => Message::Text(text),
            Err(e) => {
                error!("Failed to marshal game state: {}", e);
                return;
            }
        };

        let mut evicted = Vec::new();
        for (session_id, sender) in &self.sessions {
            if sender.try_send(message.clone()).is_err() {
                evicted.push(*session_id);
            }
        }

        for session_id in evicted {
            warn!("Session {} outbound queue full, evicting", session_id);
            self.sessions.remove(&session_id);
        }
    }

    /// Delivers one envelope to one session, evicting it if the queue is full
    fn deliver(&mut self, session_id: u64, envelope: &Envelope) {
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to marshal message: {}", e);
                return;
            }
        };

        let queue_full = match self.sessions.get(&session_id) {
            Some(sender) => sender.try_send(Message::Text(text)).is_err(),
            None => false,
        };
        if queue_full {
            warn!("Session {} outbound queue full, evicting", session_id);
            self.sessions.remove(&session_id);
        }
    }

    /// Removes a disconnected player once the grace period has elapsed
    fn spawn_grace_removal(&self, player_id: String) {
        let store = Arc::clone(&self.hub.store);
        let events = self.hub.events_tx.clone();
        let grace_period = self.hub.config.grace_period;

        tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            if store.remove_if_disconnected(&player_id) {
                let _ = events.send(HubEvent::Broadcast).await;
            }
        });
    }
}

/// Per-connection state on the read pump
struct Session {
    id: u64,
    hub: Arc<Hub>,
    player_id: Option<String>,
}

impl Session {
    /// Dispatches one inbound envelope; returns false when the session should
    /// end
    async fn handle_envelope(&mut self, envelope: Envelope) -> bool {
        match envelope.kind {
            MessageType::Join => {
                self.handle_join(&envelope).await;
                true
            }
            MessageType::Move => {
                self.handle_move(&envelope).await;
                true
            }
            MessageType::Leave => false,
            kind => {
                warn!(
                    "Session {}: unexpected {:?} message from client",
                    self.id, kind
                );
                true
            }
        }
    }

    async fn handle_join(&mut self, envelope: &Envelope) {
        let request: JoinRequest = match envelope.data_as() {
            Ok(request) => request,
            Err(_) => {
                self.hub
                    .send_error(self.id, "Invalid join request", ErrorCode::InvalidJoin, None)
                    .await;
                return;
            }
        };

        if self.player_id.is_some() {
            self.hub
                .send_error(self.id, "Already joined", ErrorCode::InvalidJoin, None)
                .await;
            return;
        }

        match self.hub.store.add_player(&request.player_name) {
            Ok(player) => {
                info!("Player {} ({}) joined the game", player.name, player.id);
                self.player_id = Some(player.id);
                self.hub.broadcast().await;
            }
            Err(RosterError::GameFull) => {
                self.hub
                    .send_error(self.id, "Game is full", ErrorCode::GameFull, None)
                    .await;
            }
        }
    }

    async fn handle_move(&mut self, envelope: &Envelope) {
        let Some(player_id) = self.player_id.clone() else {
            self.hub
                .send_error(
                    self.id,
                    "Player not registered",
                    ErrorCode::NotRegistered,
                    None,
                )
                .await;
            return;
        };

        let request: MoveRequest = match envelope.data_as() {
            Ok(request) => request,
            Err(_) => {
                self.hub
                    .send_error(self.id, "Invalid move request", ErrorCode::InvalidMove, None)
                    .await;
                return;
            }
        };

        let transaction = self
            .hub
            .controller
            .begin_transaction(&player_id, &request.request_id);

        if let Err(e) = self
            .hub
            .controller
            .propose_move(&transaction.id, request.direction)
        {
            self.hub.controller.abort_transaction(&transaction.id);
            self.hub
                .send_error(
                    self.id,
                    &e.to_string(),
                    ErrorCode::InvalidMove,
                    Some(request.request_id),
                )
                .await;
            return;
        }

        match self.hub.controller.commit_transaction(&transaction.id) {
            Ok(_) => {
                self.hub.store.touch_player(&player_id);
                self.hub.broadcast().await;
            }
            Err(CommitError::VersionMismatch { expected, actual }) => {
                debug!(
                    "Session {}: move {} lost the race ({} -> {})",
                    self.id, request.request_id, expected, actual
                );
                self.hub
                    .send_conflict(self.id, request.request_id, expected, actual)
                    .await;
                // Everyone re-converges on the committed state
                self.hub.broadcast().await;
            }
            Err(e) => {
                self.hub
                    .send_error(
                        self.id,
                        &e.to_string(),
                        ErrorCode::TransactionError,
                        Some(request.request_id),
                    )
                    .await;
            }
        }
    }
}

/// Serves one accepted TCP connection for its whole lifetime
///
/// Performs the WebSocket upgrade, registers the session, spawns the write
/// pump, then runs the read pump until the peer leaves, errs, or goes silent
/// past the read deadline.
pub async fn handle_connection(hub: Arc<Hub>, stream: TcpStream, addr: SocketAddr) {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_MESSAGE_SIZE);
    ws_config.max_frame_size = Some(MAX_MESSAGE_SIZE);

    let ws_stream = match accept_async_with_config(stream, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    debug!("WebSocket connection established: {}", addr);

    let (ws_sink, ws_source) = ws_stream.split();
    let session_id = hub.next_session_id.fetch_add(1, Ordering::Relaxed);
    let (outbound_tx, outbound_rx) = mpsc::channel(hub.config.outbound_queue);

    hub.register(session_id, outbound_tx).await;
    tokio::spawn(write_pump(session_id, ws_sink, outbound_rx));

    let mut session = Session {
        id: session_id,
        hub: Arc::clone(&hub),
        player_id: None,
    };
    read_pump(&mut session, ws_source).await;

    hub.unregister(session_id, session.player_id.take()).await;
}

/// Decodes inbound frames and dispatches them until the session ends
async fn read_pump(session: &mut Session, mut source: SplitStream<WebSocketStream<TcpStream>>) {
    loop {
        let message = match timeout(PONG_WAIT, source.next()).await {
            Err(_) => {
                debug!("Session {}: read deadline expired", session.id);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("Session {}: read error: {}", session.id, e);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                let envelope: Envelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("Session {}: malformed message: {}", session.id, e);
                        break;
                    }
                };

                if !session.handle_envelope(envelope).await {
                    break;
                }
            }
            Message::Close(_) => break,
            // Pings are answered by the protocol layer; pongs only matter for
            // having refreshed the read deadline above
            _ => {}
        }
    }
}

/// Drains the outbound queue into the socket and emits heartbeat pings
///
/// Ends when the queue closes (unregister or eviction) or a write fails or
/// exceeds the write deadline; dropping the sink closes the connection, which
/// in turn stops the read pump.
async fn write_pump(
    session_id: u64,
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound: mpsc::Receiver<Message>,
) {
    let mut ping = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);

    loop {
        tokio::select! {
            maybe_message = outbound.recv() => {
                match maybe_message {
                    Some(message) => {
                        match timeout(WRITE_WAIT, sink.send(message)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!("Session {}: write error: {}", session_id, e);
                                break;
                            }
                            Err(_) => {
                                debug!("Session {}: write deadline expired", session_id);
                                break;
                            }
                        }
                    }
                    None => {
                        // Queue closed: say goodbye and let the socket drop
                        let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if timeout(WRITE_WAIT, sink.send(Message::Ping(Vec::new())))
                    .await
                    .map_or(true, |result| result.is_err())
                {
                    debug!("Session {}: ping failed", session_id);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Position;
    use std::time::Duration;

    fn hub_with_grace(grace_period: Duration) -> (Arc<Hub>, HubTask, Arc<GameStore>) {
        let store = Arc::new(GameStore::new(Position { x: 10, y: 10 }));
        let controller = Arc::new(ConcurrencyController::new(Arc::clone(&store)));
        let (hub, task) = Hub::with_config(
            Arc::clone(&store),
            controller,
            HubConfig {
                grace_period,
                outbound_queue: 4,
            },
        );
        (hub, task, store)
    }

    fn text_envelope(message: &Message) -> Envelope {
        match message {
            Message::Text(text) => serde_json::from_str(text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_delivers_initial_snapshot() {
        let (_hub, mut task, _store) = hub_with_grace(Duration::from_secs(30));
        let (tx, mut rx) = mpsc::channel(4);

        task.handle_event(HubEvent::Register {
            session_id: 1,
            sender: tx,
        });

        let envelope = text_envelope(&rx.try_recv().unwrap());
        assert_eq!(envelope.kind, MessageType::GameState);
        let snapshot: shared::GameSnapshot = envelope.data_as().unwrap();
        assert_eq!(snapshot.object.version, 1);
    }

    #[tokio::test]
    async fn test_slow_session_is_evicted() {
        let (_hub, mut task, _store) = hub_with_grace(Duration::from_secs(30));
        // Queue of one: the initial snapshot fills it
        let (tx, _rx) = mpsc::channel(1);

        task.handle_event(HubEvent::Register {
            session_id: 1,
            sender: tx,
        });
        assert_eq!(task.sessions.len(), 1);

        // The next broadcast finds the queue full and drops the session
        task.handle_event(HubEvent::Broadcast);
        assert!(task.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_direct_send_reaches_only_target() {
        let (_hub, mut task, _store) = hub_with_grace(Duration::from_secs(30));
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);

        task.handle_event(HubEvent::Register {
            session_id: 1,
            sender: tx1,
        });
        task.handle_event(HubEvent::Register {
            session_id: 2,
            sender: tx2,
        });
        rx1.try_recv().unwrap();
        rx2.try_recv().unwrap();

        let envelope = Envelope::new(
            MessageType::Error,
            &ErrorResponse {
                message: "Game is full".to_string(),
                code: ErrorCode::GameFull,
                request_id: None,
            },
        )
        .unwrap();
        task.handle_event(HubEvent::SendTo {
            session_id: 2,
            envelope,
        });

        assert!(rx1.try_recv().is_err());
        let envelope = text_envelope(&rx2.try_recv().unwrap());
        assert_eq!(envelope.kind, MessageType::Error);
    }

    #[tokio::test]
    async fn test_unregister_marks_player_and_grace_removes() {
        let (_hub, mut task, store) = hub_with_grace(Duration::from_millis(50));
        let player = store.add_player("Alice").unwrap();

        task.handle_event(HubEvent::Unregister {
            session_id: 1,
            player_id: Some(player.id.clone()),
        });

        // Inside the grace window the player is present but disconnected
        let snapshot = store.snapshot();
        assert!(!snapshot.players[&player.id].connected);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.snapshot().players.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_without_player_is_quiet() {
        let (_hub, mut task, store) = hub_with_grace(Duration::from_millis(50));

        task.handle_event(HubEvent::Unregister {
            session_id: 7,
            player_id: None,
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.snapshot().players.is_empty());
    }
}
