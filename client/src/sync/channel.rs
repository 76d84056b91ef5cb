use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::ReconnectPolicy;
use super::identity::Identity;
use super::listeners::{Registry, RosterListener, StateListener, Subscription, call_guarded};
use super::machine::{DEFAULT_PENDING_LIMIT, Effect, RosterSync};
use super::roster::Roster;
use super::state::{ChannelState, CloseReason, StateChange};
use crate::error::{ChannelError, TransportError};
use crate::transport::ws::WsConnector;
use crate::transport::{Connection, Connector};

/// Tuning for a [`LiveRosterChannel`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOptions {
    pub reconnect: ReconnectPolicy,
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
    /// Deltas buffered while waiting for the initial snapshot.
    pub pending_limit: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            pending_limit: DEFAULT_PENDING_LIMIT,
        }
    }
}

/// State visible to both the handle and the driver task.
struct Shared {
    id: Uuid,
    roster_tx: watch::Sender<Roster>,
    state_tx: watch::Sender<StateChange>,
    roster_listeners: Arc<Registry<RosterListener>>,
    state_listeners: Arc<Registry<StateListener>>,
    /// Set by `close()`. Once set the driver publishes nothing.
    closed: AtomicBool,
    /// Cancelled when the driver task exits.
    stopped: CancellationToken,
}

impl Shared {
    fn publish_roster(&self, roster: Roster) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.roster_tx.send_replace(roster.clone());
        self.roster_listeners.emit(|listener| listener(&roster));
    }

    fn transition(&self, change: StateChange) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.emit_state(change);
    }

    fn emit_state(&self, change: StateChange) {
        debug!(channel = %self.id, state = %change.state, reason = ?change.reason, "channel state changed");
        self.state_tx.send_replace(change);
        self.state_listeners.emit(|listener| listener(change));
    }
}

/// One live connection to a roster server for one identity.
///
/// Construction spawns a driver task and returns immediately; the connection
/// completes asynchronously. The driver identifies, waits for the snapshot,
/// applies deltas and reconnects with backoff after transient failures. The
/// last known roster stays visible across reconnects.
///
/// Listeners run on the driver task (or, for the replay on `subscribe`, on the
/// caller) and must not block.
pub struct LiveRosterChannel {
    identity: Identity,
    endpoint: String,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl LiveRosterChannel {
    /// Open a channel over WebSocket. Must be called within a tokio runtime.
    pub fn connect(
        identity: Identity,
        endpoint: impl Into<String>,
        reconnect: Option<ReconnectPolicy>,
    ) -> Result<Self, ChannelError> {
        let options = ChannelOptions {
            reconnect: reconnect.unwrap_or_default(),
            ..Default::default()
        };
        Self::with_connector(WsConnector, identity, endpoint, options)
    }

    /// Open a channel over any [`Connector`].
    pub fn with_connector<C: Connector>(
        connector: C,
        identity: Identity,
        endpoint: impl Into<String>,
        options: ChannelOptions,
    ) -> Result<Self, ChannelError> {
        let endpoint = endpoint.into();
        validate_endpoint(&endpoint)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;

        let (roster_tx, _) = watch::channel(Roster::empty());
        let (state_tx, _) = watch::channel(StateChange::new(ChannelState::Connecting));
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            roster_tx,
            state_tx,
            roster_listeners: Registry::new(),
            state_listeners: Registry::new(),
            closed: AtomicBool::new(false),
            stopped: CancellationToken::new(),
        });
        let cancel = CancellationToken::new();

        info!(channel = %shared.id, %identity, %endpoint, "opening roster channel");

        runtime.spawn(drive(
            connector,
            RosterSync::new(identity.clone(), options.pending_limit),
            endpoint.clone(),
            options,
            shared.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            identity,
            endpoint,
            shared,
            cancel,
        })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Register a roster listener. It is called right away with the current roster,
    /// then with the full roster after every change. After `close()` the listener
    /// is accepted but never called.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Roster) + Send + Sync + 'static,
    {
        let listener: Arc<RosterListener> = Arc::new(listener);
        let subscription = self.shared.roster_listeners.subscribe(listener.clone());
        if subscription.is_active() {
            let current = self.current_roster();
            call_guarded(listener.as_ref(), |l| l(&current));
        }
        subscription
    }

    /// Register a listener for state transitions.
    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(StateChange) + Send + Sync + 'static,
    {
        self.shared.state_listeners.subscribe(Arc::new(listener))
    }

    /// The roster as of now. Frozen after `close()`.
    pub fn current_roster(&self) -> Roster {
        self.shared.roster_tx.borrow().clone()
    }

    pub fn current_state(&self) -> ChannelState {
        self.shared.state_tx.borrow().state
    }

    pub fn is_online(&self, id: &str) -> bool {
        self.shared.roster_tx.borrow().contains(id)
    }

    /// Async view of the roster, for consumers that prefer awaiting over callbacks.
    pub fn watch_roster(&self) -> watch::Receiver<Roster> {
        self.shared.roster_tx.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<StateChange> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the channel will make no further connection attempts:
    /// after `close()`, a server rejection, or an exhausted reconnect policy.
    pub async fn stopped(&self) {
        self.shared.stopped.cancelled().await;
    }

    /// Tear the channel down: `Closing`, then `Closed` with `normal-close`.
    /// Cancels any pending reconnect and releases the connection. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        info!(channel = %self.shared.id, identity = %self.identity, "closing roster channel");

        self.shared.emit_state(StateChange::new(ChannelState::Closing));
        self.shared.emit_state(StateChange::closed(CloseReason::NormalClose));
        self.shared.roster_listeners.seal();
        self.shared.state_listeners.seal();
    }
}

impl Drop for LiveRosterChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for LiveRosterChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveRosterChannel")
            .field("id", &self.shared.id)
            .field("identity", &self.identity)
            .field("endpoint", &self.endpoint)
            .field("state", &self.current_state())
            .finish()
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), ChannelError> {
    let Some((scheme, rest)) = endpoint.split_once("://") else {
        return Err(ChannelError::InvalidEndpoint(format!(
            "{endpoint:?} is not a URL"
        )));
    };
    if !matches!(scheme.to_ascii_lowercase().as_str(), "ws" | "wss") {
        return Err(ChannelError::InvalidEndpoint(format!(
            "unsupported scheme {scheme:?} (expected ws or wss)"
        )));
    }
    if rest.is_empty() || rest.starts_with('/') {
        return Err(ChannelError::InvalidEndpoint(format!(
            "{endpoint:?} has no host"
        )));
    }
    Ok(())
}

/// Driver task: connect, run the session, back off, repeat until closed,
/// rejected or out of attempts.
async fn drive<C: Connector>(
    connector: C,
    mut sync: RosterSync,
    endpoint: String,
    options: ChannelOptions,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let _stopped = shared.stopped.clone().drop_guard();
    let channel = shared.id;
    let mut attempt: u32 = 0;

    loop {
        if let Some(change) = sync.begin_connect() {
            shared.transition(change);
        }

        let connecting = tokio::time::timeout(options.connect_timeout, connector.connect(&endpoint));
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connecting => result.unwrap_or(Err(TransportError::Timeout)),
        };

        let reason = match result {
            Ok(conn) => {
                info!(%channel, %endpoint, "roster connection established");
                match run_session(&mut sync, conn, &shared, &cancel, &mut attempt).await {
                    Some(reason) => reason,
                    None => return,
                }
            }
            Err(e) => {
                warn!(%channel, %endpoint, error = %e, "roster connection failed");
                CloseReason::NetworkError
            }
        };

        shared.transition(sync.connection_lost(reason));

        if !reason.is_retryable() {
            info!(%channel, %reason, "roster channel closed, not reconnecting");
            return;
        }

        attempt = attempt.saturating_add(1);
        if !options.reconnect.allows(attempt) {
            warn!(%channel, attempts = attempt - 1, "reconnect attempts exhausted, giving up");
            return;
        }

        let delay = options.reconnect.delay_for(attempt);
        if let Some(change) = sync.schedule_reconnect() {
            shared.transition(change);
        }
        info!(%channel, attempt, delay_ms = delay.as_millis() as u64, "reconnecting to roster server");

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

enum Step {
    Cancelled,
    Frame(Option<Result<String, TransportError>>),
}

/// Run one connection until it ends. Returns the close reason, or `None` if the
/// channel was closed by its owner.
async fn run_session<T: Connection>(
    sync: &mut RosterSync,
    mut conn: T,
    shared: &Shared,
    cancel: &CancellationToken,
    attempt: &mut u32,
) -> Option<CloseReason> {
    let channel = shared.id;

    if let Some(reason) = execute(sync.connected(), &mut conn, shared).await {
        conn.close().await;
        return Some(reason);
    }

    loop {
        let step = tokio::select! {
            _ = cancel.cancelled() => Step::Cancelled,
            frame = conn.recv() => Step::Frame(frame),
        };

        match step {
            Step::Cancelled => {
                conn.close().await;
                return None;
            }
            Step::Frame(Some(Ok(text))) => {
                let was_identified = sync.state() == ChannelState::Identified;
                let effects = sync.handle_text(&text);
                if !was_identified && sync.state() == ChannelState::Identified {
                    *attempt = 0;
                }
                if let Some(reason) = execute(effects, &mut conn, shared).await {
                    conn.close().await;
                    return Some(reason);
                }
            }
            Step::Frame(Some(Err(e))) => {
                warn!(%channel, error = %e, "roster connection error");
                return Some(CloseReason::NetworkError);
            }
            Step::Frame(None) => {
                info!(%channel, "roster server closed the connection");
                return Some(CloseReason::NetworkError);
            }
        }
    }
}

/// Carry out effects in order. Stops at the first one that ends the connection.
async fn execute<T: Connection>(
    effects: Vec<Effect>,
    conn: &mut T,
    shared: &Shared,
) -> Option<CloseReason> {
    for effect in effects {
        match effect {
            Effect::Send(msg) => {
                let json = match msg.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!(channel = %shared.id, error = %e, "failed to encode client message");
                        return Some(CloseReason::ProtocolError);
                    }
                };
                if let Err(e) = conn.send(json).await {
                    warn!(channel = %shared.id, error = %e, "failed to send to roster server");
                    return Some(CloseReason::NetworkError);
                }
            }
            Effect::Transition(change) => shared.transition(change),
            Effect::Publish(roster) => shared.publish_roster(roster),
            Effect::Drop(reason) => return Some(reason),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;

    use crate::sync::identity::Role;
    use crate::sync::protocol::ServerMessage;
    use crate::transport::memory::{MemoryConnector, MemoryServer, ServerEnd};

    const ENDPOINT: &str = "ws://roster.test/ws";

    // ── Helpers ──────────────────────────────────────────────────

    fn teacher() -> Identity {
        Identity::new(Role::Teacher, "T1").unwrap()
    }

    fn snapshot(ids: &[&str]) -> ServerMessage {
        ServerMessage::Snapshot {
            online_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn added(id: &str) -> ServerMessage {
        ServerMessage::EntryAdded { id: id.into() }
    }

    fn removed(id: &str) -> ServerMessage {
        ServerMessage::EntryRemoved { id: id.into() }
    }

    fn open(options: ChannelOptions) -> (LiveRosterChannel, MemoryServer) {
        let (connector, server) = MemoryConnector::pair();
        let channel =
            LiveRosterChannel::with_connector(connector, teacher(), ENDPOINT, options).unwrap();
        (channel, server)
    }

    /// Accept the next connection and consume its IDENTIFY frame.
    async fn accept_identified(server: &mut MemoryServer) -> ServerEnd {
        let mut end = server.accept().await.expect("client should connect");
        let frame = end.recv().await.expect("client should identify");
        assert_eq!(frame, r#"{"type":"IDENTIFY","data":{"role":"teacher","id":"T1"}}"#);
        end
    }

    /// Wait until the current state is `state`. Only for states the channel settles in.
    async fn wait_for_state(channel: &LiveRosterChannel, state: ChannelState) -> StateChange {
        let mut rx = channel.watch_state();
        let change = *rx.wait_for(|c| c.state == state).await.unwrap();
        change
    }

    /// Every transition, in order. Catches passing states like `Closed` before `Reconnecting`.
    fn state_feed(channel: &LiveRosterChannel) -> mpsc::UnboundedReceiver<StateChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.on_state_change(move |change| {
            let _ = tx.send(change);
        });
        rx
    }

    async fn next_state(
        feed: &mut mpsc::UnboundedReceiver<StateChange>,
        state: ChannelState,
    ) -> StateChange {
        loop {
            let change = feed.recv().await.expect("state feed ended");
            if change.state == state {
                return change;
            }
        }
    }

    async fn wait_for_roster(channel: &LiveRosterChannel, expected: &[&str]) {
        let mut rx = channel.watch_roster();
        rx.wait_for(|r| r.to_sorted_vec() == expected).await.unwrap();
    }

    fn record_rosters(channel: &LiveRosterChannel) -> Arc<Mutex<Vec<Vec<String>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.subscribe(move |roster| sink.lock().unwrap().push(roster.to_sorted_vec()));
        seen
    }

    fn record_states(channel: &LiveRosterChannel) -> Arc<Mutex<Vec<StateChange>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.on_state_change(move |change| sink.lock().unwrap().push(change));
        seen
    }

    fn slow_reconnect() -> ChannelOptions {
        ChannelOptions {
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_secs(5),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    // ── Construction ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_rejects_bad_endpoints() {
        for endpoint in ["", "roster.test", "http://roster.test/ws", "ws://", "ws:///path"] {
            let (connector, _server) = MemoryConnector::pair();
            let result = LiveRosterChannel::with_connector(
                connector,
                teacher(),
                endpoint,
                ChannelOptions::default(),
            );
            assert!(
                matches!(result, Err(ChannelError::InvalidEndpoint(_))),
                "{endpoint:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_requires_runtime() {
        let (connector, _server) = MemoryConnector::pair();
        let result = LiveRosterChannel::with_connector(
            connector,
            teacher(),
            ENDPOINT,
            ChannelOptions::default(),
        );
        assert_eq!(result.unwrap_err(), ChannelError::NoRuntime);
    }

    #[tokio::test]
    async fn test_starts_connecting_with_empty_roster() {
        let (channel, _server) = open(ChannelOptions::default());
        assert_eq!(channel.current_state(), ChannelState::Connecting);
        assert!(channel.current_roster().is_empty());
        assert_eq!(channel.endpoint(), ENDPOINT);
        assert_eq!(channel.identity().id(), "T1");
    }

    // ── Protocol flow ────────────────────────────────────────────

    #[tokio::test]
    async fn test_snapshot_then_deltas() {
        let (channel, mut server) = open(ChannelOptions::default());
        let end = accept_identified(&mut server).await;

        end.send(&snapshot(&["S1", "S2"]));
        wait_for_roster(&channel, &["S1", "S2"]).await;
        assert_eq!(channel.current_state(), ChannelState::Identified);

        end.send(&added("S3"));
        end.send(&removed("S1"));
        wait_for_roster(&channel, &["S2", "S3"]).await;
        assert!(channel.is_online("S3"));
        assert!(!channel.is_online("S1"));
    }

    #[tokio::test]
    async fn test_duplicate_deltas_notify_once() {
        let (channel, mut server) = open(ChannelOptions::default());
        let seen = record_rosters(&channel);
        let end = accept_identified(&mut server).await;

        end.send(&snapshot(&[]));
        end.send(&added("S1"));
        end.send(&added("S1"));
        end.send(&removed("S9"));
        end.send(&added("S2"));
        wait_for_roster(&channel, &["S1", "S2"]).await;

        let seen = seen.lock().unwrap();
        // replay (empty), snapshot (empty), +S1, +S2
        assert_eq!(seen.len(), 4, "unexpected notifications: {seen:?}");
        assert_eq!(seen[2], vec!["S1"]);
        assert_eq!(seen[3], vec!["S1", "S2"]);
    }

    #[tokio::test]
    async fn test_buffered_deltas_apply_after_snapshot() {
        let (channel, mut server) = open(ChannelOptions::default());
        let end = accept_identified(&mut server).await;

        end.send(&removed("S1"));
        end.send(&added("S1"));
        end.send(&removed("S2"));
        end.send(&snapshot(&["S1", "S2"]));

        wait_for_state(&channel, ChannelState::Identified).await;
        assert_eq!(channel.current_roster().to_sorted_vec(), vec!["S1"]);
    }

    #[tokio::test]
    async fn test_malformed_frames_do_not_tear_down() {
        let (channel, mut server) = open(ChannelOptions::default());
        let end = accept_identified(&mut server).await;

        end.send(&snapshot(&["S1"]));
        end.send_raw("{{{ not json");
        end.send_raw(r#"{"type":"HEARTBEAT","data":{}}"#);
        end.send_raw(r#"{"type":"ENTRY_ADDED","data":{"who":"S2"}}"#);
        end.send(&added("S9"));

        wait_for_roster(&channel, &["S1", "S9"]).await;
        assert_eq!(channel.current_state(), ChannelState::Identified);
        assert_eq!(server.attempts(), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_current_roster() {
        let (channel, mut server) = open(ChannelOptions::default());
        let end = accept_identified(&mut server).await;
        end.send(&snapshot(&["S1", "S2"]));
        wait_for_roster(&channel, &["S1", "S2"]).await;

        let seen = record_rosters(&channel);
        // Delivered synchronously inside subscribe, before any new server event
        assert_eq!(*seen.lock().unwrap(), vec![vec!["S1", "S2"]]);
    }

    #[tokio::test]
    async fn test_subscribers_notified_in_order() {
        let (channel, mut server) = open(ChannelOptions::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = order.clone();
            channel.subscribe(move |roster| {
                if !roster.is_empty() {
                    order.lock().unwrap().push(name);
                }
            });
        }

        let end = accept_identified(&mut server).await;
        end.send(&snapshot(&["S1"]));
        wait_for_roster(&channel, &["S1"]).await;

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_unsubscribed_listener_stops_receiving() {
        let (channel, mut server) = open(ChannelOptions::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let subscription = channel.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        subscription.unsubscribe();

        let end = accept_identified(&mut server).await;
        end.send(&snapshot(&["S1"]));
        wait_for_roster(&channel, &["S1"]).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    // ── Disconnects and reconnects ───────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_roster_survives_disconnect() {
        let (channel, mut server) = open(slow_reconnect());
        let mut feed = state_feed(&channel);
        let end = accept_identified(&mut server).await;
        end.send(&snapshot(&["S1", "S2"]));
        wait_for_roster(&channel, &["S1", "S2"]).await;

        end.disconnect();
        let closed = next_state(&mut feed, ChannelState::Closed).await;
        assert_eq!(closed.reason, Some(CloseReason::NetworkError));
        assert_eq!(channel.current_roster().to_sorted_vec(), vec!["S1", "S2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_example_session() {
        let (channel, mut server) = open(ChannelOptions::default());
        let states = record_states(&channel);
        let mut feed = state_feed(&channel);

        let end = accept_identified(&mut server).await;
        end.send(&snapshot(&["S1", "S2"]));
        wait_for_roster(&channel, &["S1", "S2"]).await;
        end.send(&added("S3"));
        wait_for_roster(&channel, &["S1", "S2", "S3"]).await;
        end.send(&removed("S1"));
        wait_for_roster(&channel, &["S2", "S3"]).await;

        end.disconnect();
        next_state(&mut feed, ChannelState::Reconnecting).await;
        assert_eq!(channel.current_roster().to_sorted_vec(), vec!["S2", "S3"]);

        let end = accept_identified(&mut server).await;
        end.send(&snapshot(&["S2"]));
        wait_for_roster(&channel, &["S2"]).await;
        assert_eq!(channel.current_state(), ChannelState::Identified);

        let states: Vec<ChannelState> = states.lock().unwrap().iter().map(|c| c.state).collect();
        assert_eq!(
            states,
            vec![
                ChannelState::Open,
                ChannelState::Identified,
                ChannelState::Closed,
                ChannelState::Reconnecting,
                ChannelState::Connecting,
                ChannelState::Open,
                ChannelState::Identified,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_waits_for_backoff() {
        let (channel, mut server) = open(slow_reconnect());
        let mut feed = state_feed(&channel);
        accept_identified(&mut server).await.disconnect();
        next_state(&mut feed, ChannelState::Reconnecting).await;

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(server.attempts(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        accept_identified(&mut server).await;
        assert_eq!(server.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_reconnect() {
        let (channel, mut server) = open(slow_reconnect());
        let mut feed = state_feed(&channel);
        accept_identified(&mut server).await.disconnect();
        next_state(&mut feed, ChannelState::Reconnecting).await;

        channel.close();
        channel.stopped().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(server.attempts(), 1);
        assert!(server.try_accept().is_none());
        assert_eq!(channel.current_state(), ChannelState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures_are_retried() {
        let (connector, mut server) = MemoryConnector::pair();
        server.refuse_connections(true);
        let channel = LiveRosterChannel::with_connector(
            connector,
            teacher(),
            ENDPOINT,
            ChannelOptions::default(),
        )
        .unwrap();
        let mut feed = state_feed(&channel);

        let closed = next_state(&mut feed, ChannelState::Closed).await;
        assert_eq!(closed.reason, Some(CloseReason::NetworkError));
        next_state(&mut feed, ChannelState::Reconnecting).await;

        server.refuse_connections(false);
        let end = accept_identified(&mut server).await;
        end.send(&snapshot(&["S4"]));
        wait_for_roster(&channel, &["S4"]).await;
        assert!(server.attempts() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let (connector, server) = MemoryConnector::pair();
        server.refuse_connections(true);
        let options = ChannelOptions {
            reconnect: ReconnectPolicy {
                max_attempts: Some(2),
                ..Default::default()
            },
            ..Default::default()
        };
        let channel =
            LiveRosterChannel::with_connector(connector, teacher(), ENDPOINT, options).unwrap();

        channel.stopped().await;
        // Initial attempt plus two retries
        assert_eq!(server.attempts(), 3);
        assert_eq!(channel.current_state(), ChannelState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_terminal() {
        let (channel, mut server) = open(ChannelOptions::default());
        let end = accept_identified(&mut server).await;
        end.send(&ServerMessage::Rejected {
            reason: "unknown teacher".into(),
        });

        let closed = wait_for_state(&channel, ChannelState::Closed).await;
        assert_eq!(closed.reason, Some(CloseReason::ServerRejected));
        channel.stopped().await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(server.attempts(), 1);
        assert_eq!(channel.current_state(), ChannelState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_overflow_reconnects() {
        let options = ChannelOptions {
            pending_limit: 2,
            ..Default::default()
        };
        let (channel, mut server) = open(options);
        let states = record_states(&channel);

        let end = accept_identified(&mut server).await;
        end.send(&added("S1"));
        end.send(&added("S2"));
        end.send(&added("S3"));

        let end = accept_identified(&mut server).await;
        end.send(&snapshot(&["S5"]));
        wait_for_roster(&channel, &["S5"]).await;

        let reasons: Vec<CloseReason> = states
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| c.reason)
            .collect();
        assert_eq!(reasons, vec![CloseReason::ProtocolError]);
    }

    // ── Teardown ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (channel, mut server) = open(ChannelOptions::default());
        let states = record_states(&channel);
        let end = accept_identified(&mut server).await;
        end.send(&snapshot(&["S1"]));
        wait_for_roster(&channel, &["S1"]).await;

        channel.close();
        channel.close();
        assert!(channel.is_closed());

        let recorded: Vec<StateChange> = states.lock().unwrap().clone();
        let count = recorded.len();
        assert_eq!(recorded[count - 2].state, ChannelState::Closing);
        assert_eq!(recorded[count - 1].state, ChannelState::Closed);
        assert_eq!(recorded[count - 1].reason, Some(CloseReason::NormalClose));
        let closings = recorded
            .iter()
            .filter(|c| c.state == ChannelState::Closing)
            .count();
        assert_eq!(closings, 1);

        // Server-side traffic after close changes nothing
        end.send(&added("S2"));
        tokio::task::yield_now().await;
        assert_eq!(channel.current_roster().to_sorted_vec(), vec!["S1"]);
        assert_eq!(states.lock().unwrap().len(), count);
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let (channel, mut server) = open(ChannelOptions::default());
        let mut end = accept_identified(&mut server).await;
        channel.close();
        assert!(end.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_closes_channel() {
        let (channel, mut server) = open(ChannelOptions::default());
        let mut end = accept_identified(&mut server).await;
        drop(channel);
        assert!(end.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_after_close_never_fires() {
        let (channel, mut server) = open(ChannelOptions::default());
        let end = accept_identified(&mut server).await;
        end.send(&snapshot(&["S1"]));
        wait_for_roster(&channel, &["S1"]).await;
        channel.close();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let roster_sub = channel.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = hits.clone();
        let state_sub = channel.on_state_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!roster_sub.is_active());
        assert!(!state_sub.is_active());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        // Frozen at the last known value
        assert_eq!(channel.current_roster().to_sorted_vec(), vec!["S1"]);
    }

    #[tokio::test]
    async fn test_listener_may_close_channel() {
        let (connector, mut server) = MemoryConnector::pair();
        let channel = Arc::new(
            LiveRosterChannel::with_connector(
                connector,
                teacher(),
                ENDPOINT,
                ChannelOptions::default(),
            )
            .unwrap(),
        );
        let weak = Arc::downgrade(&channel);
        channel.subscribe(move |roster| {
            if roster.contains("STOP")
                && let Some(channel) = weak.upgrade()
            {
                channel.close();
            }
        });

        let end = accept_identified(&mut server).await;
        end.send(&snapshot(&["STOP"]));
        wait_for_state(&channel, ChannelState::Closed).await;
        assert!(channel.is_closed());
    }
}
