//! Sync provider supervisor.
//!
//! Maintains one WebSocket to a peer server and keeps the local
//! substrate synchronized. A single supervisor task walks the state
//! machine `Offline → Connecting → Handshaking → Connected → (Error →
//! backoff →) Connecting …`; `connect`/`disconnect` only flip the
//! desired state and wake the loop, so cancellation is synchronous to
//! the status transition and asynchronous to the socket close.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::substrate::{CommitOrigin, Substrate, UpdateSubscription};
use crate::sync::backoff::{Backoff, Sleeper, WakeHandle};
use crate::sync::protocol::{self, Frame};

/// Connection state, observable synchronously on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No socket; idle.
    Offline,
    /// Open handshake in flight.
    Connecting,
    /// Socket open; sync step 1 sent, awaiting the peer's step 2.
    Handshaking,
    /// Converged; normal update and heartbeat traffic.
    Connected,
    /// I/O failure or abnormal close; reconnect scheduled.
    Error,
}

/// Where to connect, produced by the auth callback per attempt so tokens
/// can be refreshed between retries.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    /// `ws(s)://host/workspaces/{id}/sync`
    pub url: String,
    /// Sent as the WebSocket subprotocol and as a `token=` query
    /// parameter.
    pub token: Option<String>,
}

/// Tunables for the heartbeat/echo liveness check.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Idle interval between sync-status probes.
    pub heartbeat_interval: Duration,
    /// How long after an unanswered probe the connection counts as dead.
    pub echo_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            echo_timeout: Duration::from_secs(3),
        }
    }
}

type AuthFn = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<SyncTarget>> + Send + Sync>;
type StatusFn = Arc<dyn Fn(SyncStatus) + Send + Sync>;

/// Identifier returned by [`SyncProvider::observe_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusObserverId(u64);

struct ProviderInner {
    workspace_id: String,
    substrate: Substrate,
    auth: AuthFn,
    options: SyncOptions,
    status_tx: watch::Sender<SyncStatus>,
    status_observers: Mutex<Vec<(u64, StatusFn)>>,
    next_observer_id: AtomicU64,
    /// Incremented on every locally-originated substrate update.
    local_version: AtomicU64,
    /// Largest version the server has echoed back; −1 before any echo.
    acked_version: AtomicI64,
    /// Sender feeding the currently-open socket, if any.
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    /// Bumped to cancel the active connection attempt.
    cancel_tx: watch::Sender<u64>,
    wake: Mutex<Option<WakeHandle>>,
    desired_connected: AtomicBool,
    shutdown: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    update_sub: Mutex<Option<UpdateSubscription>>,
}

impl ProviderInner {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || !self.desired_connected.load(Ordering::SeqCst)
    }
}

/// Single-connection sync supervisor. Cheap to clone; clones share the
/// same connection and counters.
#[derive(Clone)]
pub struct SyncProvider {
    inner: Arc<ProviderInner>,
}

impl SyncProvider {
    /// Create a supervisor for one workspace. No socket is opened until
    /// [`connect`](Self::connect).
    pub fn new<F, Fut>(workspace_id: impl Into<String>, substrate: &Substrate, auth: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<SyncTarget>> + Send + 'static,
    {
        Self::with_options(workspace_id, substrate, auth, SyncOptions::default())
    }

    pub fn with_options<F, Fut>(
        workspace_id: impl Into<String>,
        substrate: &Substrate,
        auth: F,
        options: SyncOptions,
    ) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<SyncTarget>> + Send + 'static,
    {
        let auth: AuthFn = Arc::new(move |id| Box::pin(auth(id)));
        let inner = Arc::new(ProviderInner {
            workspace_id: workspace_id.into(),
            substrate: substrate.clone(),
            auth,
            options,
            status_tx: watch::channel(SyncStatus::Offline).0,
            status_observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(0),
            local_version: AtomicU64::new(0),
            acked_version: AtomicI64::new(-1),
            outbound: Mutex::new(None),
            cancel_tx: watch::channel(0).0,
            wake: Mutex::new(None),
            desired_connected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            task: Mutex::new(None),
            update_sub: Mutex::new(None),
        });

        // Count and forward locally-originated updates. Remote-applied
        // and persistence-loaded updates leave the version untouched.
        let weak = Arc::downgrade(&inner);
        let subscription = substrate.on_update(move |bytes, origin| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !origin.is_local() {
                return;
            }
            let version = inner.local_version.fetch_add(1, Ordering::SeqCst) + 1;
            let outbound = inner.outbound.lock().clone();
            if let Some(tx) = outbound {
                let _ = tx.send(protocol::update(bytes.to_vec()));
                let _ = tx.send(protocol::sync_status(version));
            }
        });
        *inner.update_sub.lock() = Some(subscription);

        Self { inner }
    }

    pub fn workspace_id(&self) -> &str {
        &self.inner.workspace_id
    }

    pub fn status(&self) -> SyncStatus {
        *self.inner.status_tx.borrow()
    }

    /// Watch-style subscription for async waiting on transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Callback subscription, invoked synchronously on every transition.
    pub fn observe_status<F>(&self, cb: F) -> StatusObserverId
    where
        F: Fn(SyncStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.inner.status_observers.lock().push((id, Arc::new(cb)));
        StatusObserverId(id)
    }

    pub fn unobserve_status(&self, id: StatusObserverId) {
        self.inner.status_observers.lock().retain(|(i, _)| *i != id.0);
    }

    pub fn local_version(&self) -> u64 {
        self.inner.local_version.load(Ordering::SeqCst)
    }

    pub fn acked_version(&self) -> i64 {
        self.inner.acked_version.load(Ordering::SeqCst)
    }

    /// Whether local transactions exist that the server has not yet
    /// acknowledged: `acked_version < local_version`.
    pub fn has_local_changes(&self) -> bool {
        self.acked_version() < self.local_version() as i64
    }

    /// Start (or immediately retry) the connection loop.
    pub fn connect(&self) {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        self.inner.desired_connected.store(true, Ordering::SeqCst);
        if let Some(wake) = self.inner.wake.lock().as_ref() {
            wake.wake();
        }
        let mut task = self.inner.task.lock();
        let running = task.as_ref().map(|t| !t.is_finished()).unwrap_or(false);
        if !running {
            let inner = Arc::clone(&self.inner);
            *task = Some(tokio::spawn(run_supervisor(inner)));
        }
    }

    /// Stop syncing. The status flips to `Offline` before this returns;
    /// the socket closes asynchronously. Pending backoff sleeps wake.
    pub fn disconnect(&self) {
        self.inner.desired_connected.store(false, Ordering::SeqCst);
        set_status(&self.inner, SyncStatus::Offline);
        self.inner.cancel_tx.send_modify(|generation| *generation += 1);
        if let Some(wake) = self.inner.wake.lock().as_ref() {
            wake.wake();
        }
    }

    /// Disconnect, detach the update listener, drop status observers and
    /// wait for the supervisor task to finish. Idempotent.
    pub async fn destroy(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.disconnect();
        *self.inner.update_sub.lock() = None;
        self.inner.status_observers.lock().clear();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn record_ack_for_test(&self, version: u64) {
        record_ack(&self.inner, version);
    }
}

fn record_ack(inner: &ProviderInner, version: u64) {
    inner
        .acked_version
        .fetch_max(version as i64, Ordering::SeqCst);
}

fn set_status(inner: &ProviderInner, status: SyncStatus) {
    let changed = inner.status_tx.send_if_modified(|current| {
        if *current == status {
            false
        } else {
            *current = status;
            true
        }
    });
    if !changed {
        return;
    }
    tracing::debug!(
        "sync status workspace={} status={status:?}",
        inner.workspace_id
    );
    let observers: Vec<StatusFn> = inner
        .status_observers
        .lock()
        .iter()
        .map(|(_, cb)| Arc::clone(cb))
        .collect();
    for cb in observers {
        cb(status);
    }
}

/// Park duration while disconnected; `connect()` wakes the sleeper, so
/// the length only bounds how long a missed wake could linger.
const PARK_DELAY: Duration = Duration::from_secs(3600);

async fn run_supervisor(inner: Arc<ProviderInner>) {
    let (sleeper, wake) = Sleeper::new();
    *inner.wake.lock() = Some(wake);
    let mut backoff = Backoff::new();

    // One long-lived task per provider: while disconnected it parks on
    // the sleeper instead of exiting, so `connect()` can never race a
    // dying task.
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        if !inner.desired_connected.load(Ordering::SeqCst) {
            sleeper.sleep(PARK_DELAY).await;
            continue;
        }
        set_status(&inner, SyncStatus::Connecting);
        match run_connection(&inner, &mut backoff).await {
            Ok(()) => {}
            Err(e) => {
                if !inner.stopping() {
                    tracing::debug!(
                        "sync connection failed workspace={}: {e:#}",
                        inner.workspace_id
                    );
                    set_status(&inner, SyncStatus::Error);
                }
            }
        }
        *inner.outbound.lock() = None;
        if inner.stopping() {
            continue;
        }
        let delay = backoff.next_delay();
        tracing::debug!(
            "sync reconnect in {delay:?} workspace={}",
            inner.workspace_id
        );
        sleeper.sleep(delay).await;
    }

    *inner.wake.lock() = None;
}

/// One full connection attempt: auth, dial, handshake, steady state.
/// Returns `Ok` only on cancellation; every failure is an `Err` so the
/// supervisor schedules a backoff.
async fn run_connection(inner: &Arc<ProviderInner>, backoff: &mut Backoff) -> anyhow::Result<()> {
    let mut cancel_rx = inner.cancel_tx.subscribe();
    if inner.stopping() {
        return Ok(());
    }

    let target = (inner.auth)(inner.workspace_id.clone()).await?;
    let mut request = build_url(&target).into_client_request()?;
    if let Some(token) = &target.token {
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_str(token)?);
    }

    let (socket, _response) = tokio::select! {
        result = connect_async(request) => result?,
        _ = cancel_rx.changed() => return Ok(()),
    };
    set_status(inner, SyncStatus::Handshaking);

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    *inner.outbound.lock() = Some(tx);

    // Handshake: our state vector, an awareness query, and a version
    // probe so `has_local_changes` settles without waiting for traffic.
    sink.send(WsMessage::Binary(protocol::sync_step1(
        &inner.substrate.state_vector(),
    )?))
    .await?;
    sink.send(WsMessage::Binary(protocol::query_awareness())).await?;
    sink.send(WsMessage::Binary(protocol::sync_status(
        inner.local_version.load(Ordering::SeqCst),
    )))
    .await?;

    let mut heartbeat = interval(inner.options.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_echo = Instant::now();
    let mut last_probe: Option<Instant> = None;

    loop {
        tokio::select! {
            message = stream.next() => {
                let Some(message) = message else {
                    anyhow::bail!("socket closed by peer");
                };
                match message? {
                    WsMessage::Binary(bytes) => {
                        if let Some(reply) = handle_frame(inner, &bytes, &mut last_echo, backoff)? {
                            sink.send(WsMessage::Binary(reply)).await?;
                        }
                    }
                    WsMessage::Close(frame) => {
                        anyhow::bail!("socket closed: {frame:?}");
                    }
                    _ => {}
                }
            }
            Some(outgoing) = rx.recv() => {
                sink.send(WsMessage::Binary(outgoing)).await?;
            }
            _ = heartbeat.tick() => {
                if let Some(probe) = last_probe {
                    if last_echo < probe && probe.elapsed() > inner.options.echo_timeout {
                        anyhow::bail!(
                            "no sync-status echo within {:?}",
                            inner.options.echo_timeout
                        );
                    }
                }
                sink.send(WsMessage::Binary(protocol::sync_status(
                    inner.local_version.load(Ordering::SeqCst),
                )))
                .await?;
                last_probe = Some(Instant::now());
            }
            _ = cancel_rx.changed() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return Ok(());
            }
        }
    }
}

fn handle_frame(
    inner: &Arc<ProviderInner>,
    bytes: &[u8],
    last_echo: &mut Instant,
    backoff: &mut Backoff,
) -> anyhow::Result<Option<Vec<u8>>> {
    match protocol::decode_frame(bytes)? {
        Frame::SyncStep1(state_vector) => {
            let diff = inner.substrate.encode_diff(&state_vector)?;
            Ok(Some(protocol::sync_step2(diff)))
        }
        Frame::SyncStep2(update) | Frame::Update(update) => {
            inner.substrate.apply_update(&update, CommitOrigin::Remote)?;
            if *inner.status_tx.borrow() == SyncStatus::Handshaking {
                backoff.reset();
                set_status(inner, SyncStatus::Connected);
            }
            Ok(None)
        }
        Frame::SyncStatus(version) => {
            record_ack(inner, version);
            *last_echo = Instant::now();
            Ok(None)
        }
        Frame::AuthDenied(reason) => {
            anyhow::bail!("authentication rejected: {}", reason.unwrap_or_default());
        }
        // The provider announces no awareness of its own; inbound
        // awareness traffic and reserved tags are dropped.
        Frame::Awareness(_) | Frame::QueryAwareness | Frame::Unknown(_) => Ok(None),
    }
}

fn build_url(target: &SyncTarget) -> String {
    match &target.token {
        Some(token) if target.url.contains('?') => format!("{}&token={token}", target.url),
        Some(token) => format!("{}?token={token}", target.url),
        None => target.url.clone(),
    }
}
