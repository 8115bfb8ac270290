//! Per-workspace sync rooms.
//!
//! A room holds the authoritative substrate for one workspace id and the
//! set of connected peer sockets. It performs the sync handshake with
//! every new peer, relays updates and awareness to the other peers,
//! echoes sync-status frames back to their sender untouched, pings every
//! peer on an interval, and evicts itself after the last peer leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use yrs::sync::Awareness;
use yrs::Doc;

use crate::keys::ActorId;
use crate::substrate::{CommitOrigin, Substrate};
use crate::sync::protocol::{self, Frame};

/// Room keepalive and eviction tunables.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// WebSocket ping cadence; a peer missing a pong for one full
    /// interval is closed.
    pub ping_interval: Duration,
    /// Grace period after the last peer leaves before the room (and its
    /// awareness state) is discarded.
    pub eviction_delay: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            eviction_delay: Duration::from_secs(60),
        }
    }
}

/// Which workspace ids may open rooms.
#[derive(Debug, Clone)]
pub enum RoomPolicy {
    /// Any workspace id creates a room on demand.
    Open,
    /// Only pre-registered ids are served.
    Registered(std::collections::HashSet<String>),
}

/// One peer's outbound queue.
type PeerSender = mpsc::UnboundedSender<Message>;

/// A single workspace room.
pub struct Room {
    id: String,
    substrate: Substrate,
    awareness: RwLock<Awareness>,
    peers: Mutex<HashMap<u64, PeerSender>>,
    next_peer_id: AtomicU64,
    /// Bumped on every join; lets a pending eviction detect late joins.
    generation: AtomicU64,
}

impl Room {
    fn new(id: String) -> Self {
        Self {
            substrate: Substrate::new(ActorId::generate()),
            awareness: RwLock::new(Awareness::new(Doc::new())),
            peers: Mutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn substrate(&self) -> &Substrate {
        &self.substrate
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    fn add_peer(&self, sender: PeerSender) -> u64 {
        let peer_id = self.next_peer_id.fetch_add(1, Ordering::SeqCst);
        self.peers.lock().insert(peer_id, sender);
        self.generation.fetch_add(1, Ordering::SeqCst);
        peer_id
    }

    fn remove_peer(&self, peer_id: u64) {
        self.peers.lock().remove(&peer_id);
    }

    fn send_to(&self, peer_id: u64, message: Message) {
        if let Some(sender) = self.peers.lock().get(&peer_id) {
            let _ = sender.send(message);
        }
    }

    fn broadcast_except(&self, sender_id: u64, message: Message) {
        for (peer_id, sender) in self.peers.lock().iter() {
            if *peer_id != sender_id {
                let _ = sender.send(message.clone());
            }
        }
    }
}

/// All live rooms plus the admission policy.
pub struct RoomRegistry {
    rooms: DashMap<String, Arc<Room>>,
    policy: RoomPolicy,
    config: RoomConfig,
    auth_token: Option<String>,
}

impl RoomRegistry {
    pub fn new(policy: RoomPolicy, config: RoomConfig, auth_token: Option<String>) -> Self {
        Self { rooms: DashMap::new(), policy, config, auth_token }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Whether a connection for `workspace_id` with `token` is admitted.
    pub fn authorize(&self, workspace_id: &str, token: Option<&str>) -> bool {
        if let Some(expected) = &self.auth_token {
            if token != Some(expected.as_str()) {
                return false;
            }
        }
        match &self.policy {
            RoomPolicy::Open => true,
            RoomPolicy::Registered(ids) => ids.contains(workspace_id),
        }
    }

    /// The room for `workspace_id`, created lazily on first use.
    pub fn room(&self, workspace_id: &str) -> Arc<Room> {
        self.rooms
            .entry(workspace_id.to_string())
            .or_insert_with(|| {
                tracing::info!("creating room workspace={workspace_id}");
                Arc::new(Room::new(workspace_id.to_string()))
            })
            .clone()
    }

    /// Start the eviction countdown for an empty room. A join before the
    /// timer fires cancels it via the room generation.
    fn schedule_eviction(self: &Arc<Self>, room: &Arc<Room>) {
        if room.peer_count() > 0 {
            return;
        }
        let generation = room.generation.load(Ordering::SeqCst);
        let registry = Arc::clone(self);
        let workspace_id = room.id.clone();
        let delay = self.config.eviction_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(room) = registry
                .rooms
                .get(&workspace_id)
                .map(|entry| Arc::clone(entry.value()))
            else {
                return;
            };
            if room.peer_count() == 0 && room.generation.load(Ordering::SeqCst) == generation {
                registry.rooms.remove(&workspace_id);
                tracing::info!("evicted idle room workspace={workspace_id}");
            }
        });
    }
}

/// Serve one peer socket inside a room until it closes.
pub async fn handle_socket(registry: Arc<RoomRegistry>, room: Arc<Room>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let peer_id = room.add_peer(tx);
    tracing::debug!(
        "peer joined workspace={} peer={peer_id} peers={}",
        room.id,
        room.peer_count()
    );

    // Writer half: everything (frames and pings) funnels through one
    // queue so writes never interleave.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    // Handshake step 1: offer our state so the peer answers with what
    // the room is missing.
    match protocol::sync_step1(&room.substrate.state_vector()) {
        Ok(frame) => room.send_to(peer_id, Message::Binary(frame)),
        Err(e) => tracing::warn!("failed to encode step 1 workspace={}: {e:#}", room.id),
    }

    let mut ping = interval(registry.config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_seen = true;

    loop {
        tokio::select! {
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Err(e) = handle_peer_frame(&room, peer_id, bytes) {
                            tracing::debug!(
                                "dropping peer workspace={} peer={peer_id}: {e:#}",
                                room.id
                            );
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_seen = true;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(
                            "socket error workspace={} peer={peer_id}: {e}",
                            room.id
                        );
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if !pong_seen {
                    tracing::debug!(
                        "closing unresponsive peer workspace={} peer={peer_id}",
                        room.id
                    );
                    break;
                }
                pong_seen = false;
                room.send_to(peer_id, Message::Ping(Vec::new()));
            }
        }
    }

    room.remove_peer(peer_id);
    writer.abort();
    tracing::debug!(
        "peer left workspace={} peer={peer_id} peers={}",
        room.id,
        room.peer_count()
    );
    registry.schedule_eviction(&room);
}

fn handle_peer_frame(room: &Arc<Room>, peer_id: u64, bytes: Vec<u8>) -> anyhow::Result<()> {
    match protocol::decode_frame(&bytes)? {
        Frame::SyncStep1(state_vector) => {
            let diff = room.substrate.encode_diff(&state_vector)?;
            room.send_to(peer_id, Message::Binary(protocol::sync_step2(diff)));
        }
        Frame::SyncStep2(update) | Frame::Update(update) => {
            room.substrate.apply_update(&update, CommitOrigin::Remote)?;
            room.broadcast_except(peer_id, Message::Binary(protocol::update(update)));
        }
        Frame::Awareness(update) => {
            if let Err(e) = room.awareness.write().apply_update(update) {
                tracing::debug!("bad awareness update workspace={}: {e}", room.id);
            } else {
                // Relay the original frame to everyone but the sender.
                room.broadcast_except(peer_id, Message::Binary(bytes));
            }
        }
        Frame::QueryAwareness => {
            let update = room.awareness.read().update();
            match update {
                Ok(update) => {
                    room.send_to(peer_id, Message::Binary(protocol::awareness(update)));
                }
                Err(e) => {
                    tracing::debug!("failed to encode awareness workspace={}: {e}", room.id);
                }
            }
        }
        // Echoed back byte-for-byte; the payload is opaque here.
        Frame::SyncStatus(_) => {
            room.send_to(peer_id, Message::Binary(bytes));
        }
        Frame::AuthDenied(_) | Frame::Unknown(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(policy: RoomPolicy, token: Option<&str>) -> Arc<RoomRegistry> {
        Arc::new(RoomRegistry::new(
            policy,
            RoomConfig::default(),
            token.map(str::to_string),
        ))
    }

    #[test]
    fn test_open_policy_admits_anyone() {
        let registry = registry(RoomPolicy::Open, None);
        assert!(registry.authorize("anything", None));
    }

    #[test]
    fn test_registered_policy_limits_ids() {
        let ids = ["known".to_string()].into_iter().collect();
        let registry = registry(RoomPolicy::Registered(ids), None);
        assert!(registry.authorize("known", None));
        assert!(!registry.authorize("unknown", None));
    }

    #[test]
    fn test_token_required_when_configured() {
        let registry = registry(RoomPolicy::Open, Some("secret"));
        assert!(registry.authorize("ws", Some("secret")));
        assert!(!registry.authorize("ws", Some("wrong")));
        assert!(!registry.authorize("ws", None));
    }

    #[test]
    fn test_rooms_are_created_lazily_and_shared() {
        let registry = registry(RoomPolicy::Open, None);
        assert_eq!(registry.room_count(), 0);
        let a = registry.room("ws");
        let b = registry.room("ws");
        assert_eq!(registry.room_count(), 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_fires_after_delay_unless_rejoined() {
        let registry = registry(RoomPolicy::Open, None);
        let room = registry.room("ws");

        // Simulate a join/leave cycle without sockets.
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = room.add_peer(tx);
        room.remove_peer(peer);
        registry.schedule_eviction(&room);

        // A rejoin before the timer fires cancels the eviction.
        tokio::time::advance(Duration::from_secs(30)).await;
        let (tx, _rx2) = mpsc::unbounded_channel();
        let peer = room.add_peer(tx);
        room.remove_peer(peer);
        tokio::time::advance(Duration::from_secs(31)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.room_count(), 1);

        // Left idle for the full delay, the room is discarded.
        registry.schedule_eviction(&room);
        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.room_count(), 0);
    }
}
