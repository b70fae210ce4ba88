//! Endpoint connection: one socket, one task, one state machine.
//!
//! ```text
//!            ┌──────────── connect ok ───────────┐
//!            │                                    ▼
//!      Connecting ◀── delay ── Closed ◀── drop ── Open
//!            │                   │
//!            └── connect err ────┤ attempts >= max
//!                                ▼
//!                           Terminated  (failover hook fires once)
//! ```
//!
//! The task owns the socket, the heartbeat timers and the subscription
//! registry. Callers reach it only through [`ConnectionHandle`], which sends
//! commands over a channel and observes state through a `watch`.
//!
//! On every `Connecting → Open` transition the retry counter resets and every
//! registered subscription is reissued *before* the state is published as
//! `Open`, so anyone woken by [`ConnectionHandle::wait_open`] sees a
//! connection whose subscriptions are already in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use chainrelay_core::{
    Backoff, HealthStatus, Incoming, JsonRpcRequest, JsonRpcResponse, RpcClient, TransportError,
};

use crate::subscriptions::{Listener, SubscriptionKey, SubscriptionRegistry, Topic};
use crate::transport::{Connector, Frame, FrameSink, Socket};

/// One configured streaming RPC address. Identity is its position in the
/// configured list; it never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Per-endpoint resilience settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Consecutive failures tolerated before the connection terminates.
    pub max_reconnect_attempts: u32,
    /// Fixed wait between a failure and the next dial.
    pub reconnect_delay: Duration,
    /// Ping period while `Open`.
    pub heartbeat_interval: Duration,
    /// How long a ping may go unanswered, or one write may block, before the
    /// socket is dropped.
    pub pong_timeout: Duration,
    /// Upper bound on one handshake.
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            reconnect_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    fn reconnect_backoff(&self) -> Backoff {
        Backoff::Fixed(self.reconnect_delay)
    }
}

/// Lifecycle of one endpoint connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    /// Final. Either the retry budget is spent or the pool shut down.
    Terminated,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Invoked with the endpoint index when the retry budget runs out.
/// Not invoked on a requested shutdown.
pub type TerminationHook = Box<dyn FnOnce(usize) + Send + 'static>;

type Reply<T> = oneshot::Sender<Result<T, TransportError>>;

enum Command {
    Request {
        method: String,
        params: Vec<Value>,
        reply: Reply<Value>,
    },
    Subscribe {
        topic: Topic,
        listener: Listener,
        reply: Reply<SubscriptionKey>,
    },
    Close,
}

/// What an outstanding request id is waiting for.
enum Pending {
    Request(Reply<Value>),
    /// `reply` is `None` for replays: nobody is waiting on those.
    Subscribe {
        key: SubscriptionKey,
        reply: Option<Reply<SubscriptionKey>>,
    },
}

impl Pending {
    fn fail(self, err: TransportError) {
        match self {
            Self::Request(reply) => {
                let _ = reply.send(Err(err));
            }
            Self::Subscribe { reply: Some(reply), .. } => {
                let _ = reply.send(Err(err));
            }
            Self::Subscribe { reply: None, .. } => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Disconnected,
    Shutdown,
}

/// The state machine for one endpoint. Built together with its handle and
/// then moved onto its own task with [`spawn`](Self::spawn).
pub struct EndpointConnection {
    index: usize,
    endpoint: Endpoint,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    registry: SubscriptionRegistry,
    pending: HashMap<u64, Pending>,
    next_id: u64,
    attempts: u32,
}

impl EndpointConnection {
    pub fn new(
        index: usize,
        endpoint: Endpoint,
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, ConnectionHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let handle = ConnectionHandle {
            inner: Arc::new(HandleInner {
                index,
                endpoint: endpoint.clone(),
                commands: cmd_tx,
                state: state_rx,
            }),
        };
        let conn = Self {
            index,
            endpoint,
            config,
            connector,
            commands: cmd_rx,
            state: state_tx,
            registry: SubscriptionRegistry::new(),
            pending: HashMap::new(),
            next_id: 0,
            attempts: 0,
        };
        (conn, handle)
    }

    /// Start the state machine on its own task.
    pub fn spawn(self, on_terminated: TerminationHook) -> JoinHandle<()> {
        tokio::spawn(self.run(on_terminated))
    }

    async fn run(mut self, on_terminated: TerminationHook) {
        loop {
            self.set_state(ConnectionState::Connecting);
            let exit = match self.establish().await {
                Ok(Some(socket)) => self.serve(socket).await,
                Ok(None) => Exit::Shutdown,
                Err(e) => {
                    warn!(
                        url = %self.endpoint.url,
                        attempt = self.attempts + 1,
                        error = %e,
                        "connect failed"
                    );
                    Exit::Disconnected
                }
            };
            if exit == Exit::Shutdown {
                break;
            }

            self.set_state(ConnectionState::Closed);
            self.attempts += 1;
            if self.attempts >= self.config.max_reconnect_attempts {
                error!(
                    url = %self.endpoint.url,
                    attempts = self.attempts,
                    "max reconnection attempts reached, endpoint terminated"
                );
                self.set_state(ConnectionState::Terminated);
                on_terminated(self.index);
                return;
            }

            let delay = self.config.reconnect_backoff().delay(self.attempts - 1);
            debug!(
                url = %self.endpoint.url,
                attempt = self.attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            if !self.idle(delay).await {
                break;
            }
        }
        info!(url = %self.endpoint.url, "connection shut down");
        self.set_state(ConnectionState::Terminated);
    }

    /// Dial once. `Ok(None)` means shutdown was requested meanwhile.
    async fn establish(&mut self) -> Result<Option<Socket>, TransportError> {
        let connector = Arc::clone(&self.connector);
        let url = self.endpoint.url.clone();
        let limit = self.config.connect_timeout;
        let dial = time::timeout(limit, async move { connector.connect(&url).await });
        tokio::pin!(dial);

        loop {
            tokio::select! {
                res = &mut dial => {
                    return match res {
                        Ok(Ok(socket)) => Ok(Some(socket)),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(TransportError::Timeout { ms: limit.as_millis() as u64 }),
                    };
                }
                cmd = self.commands.recv() => {
                    if !self.reject(cmd) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Wait out the reconnect delay while still answering commands.
    /// Returns `false` if shutdown was requested.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => {
                    if !self.reject(cmd) {
                        return false;
                    }
                }
            }
        }
    }

    /// Handle a command while not `Open`. Subscriptions are still recorded
    /// so the next open replays them. Returns `false` on shutdown.
    fn reject(&mut self, cmd: Option<Command>) -> bool {
        match cmd {
            None | Some(Command::Close) => false,
            Some(Command::Request { reply, .. }) => {
                let _ = reply.send(Err(self.not_connected()));
                true
            }
            Some(Command::Subscribe { topic, listener, reply }) => {
                let key = self.registry.insert(topic, listener);
                debug!(
                    url = %self.endpoint.url,
                    %key,
                    "registered while disconnected, will replay on open"
                );
                let _ = reply.send(Err(self.not_connected()));
                true
            }
        }
    }

    async fn serve(&mut self, socket: Socket) -> Exit {
        let Socket { mut sink, mut stream } = socket;

        self.attempts = 0;
        self.replay(&mut sink).await;
        self.set_state(ConnectionState::Open);
        info!(
            url = %self.endpoint.url,
            subscriptions = self.registry.len(),
            "connection open"
        );

        let period = self.config.heartbeat_interval;
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        let exit = loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Close) => {
                        let limit = self.config.pong_timeout;
                        if send_within(&mut sink, Frame::Close, limit).await.is_ok() {
                            let _ = time::timeout(limit, sink.close()).await;
                        }
                        break Exit::Shutdown;
                    }
                    Some(Command::Request { method, params, reply }) => {
                        let id = self.allocate_id();
                        let sent = self
                            .send_request(&mut sink, id, &method, params, Pending::Request(reply))
                            .await;
                        if let Err(e) = sent {
                            warn!(url = %self.endpoint.url, error = %e, "send failed");
                            break Exit::Disconnected;
                        }
                    }
                    Some(Command::Subscribe { topic, listener, reply }) => {
                        let key = self.registry.insert(topic, listener);
                        if let Err(e) = self.issue(&mut sink, key, Some(reply)).await {
                            warn!(url = %self.endpoint.url, %key, error = %e, "subscribe send failed");
                            break Exit::Disconnected;
                        }
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(Frame::Text(text))) => self.on_text(&text),
                    Some(Ok(Frame::Ping(data))) => {
                        let sent = send_within(&mut sink, Frame::Pong(data), self.config.pong_timeout);
                        if let Err(e) = sent.await {
                            warn!(url = %self.endpoint.url, error = %e, "pong send failed");
                            break Exit::Disconnected;
                        }
                    }
                    Some(Ok(Frame::Pong(_))) => pong_deadline = None,
                    Some(Ok(Frame::Close)) => {
                        warn!(url = %self.endpoint.url, "closed by remote");
                        break Exit::Disconnected;
                    }
                    Some(Err(e)) => {
                        warn!(url = %self.endpoint.url, error = %e, "receive error");
                        break Exit::Disconnected;
                    }
                    None => {
                        warn!(url = %self.endpoint.url, "stream ended");
                        break Exit::Disconnected;
                    }
                },
                _ = heartbeat.tick() => {
                    let sent = send_within(&mut sink, Frame::Ping(Vec::new()), self.config.pong_timeout);
                    if let Err(e) = sent.await {
                        warn!(url = %self.endpoint.url, error = %e, "ping send failed");
                        break Exit::Disconnected;
                    }
                    // an unanswered earlier ping keeps its (earlier) deadline
                    pong_deadline.get_or_insert(Instant::now() + self.config.pong_timeout);
                }
                _ = expire(pong_deadline) => {
                    warn!(url = %self.endpoint.url, "no pong before deadline, dropping socket");
                    break Exit::Disconnected;
                }
            }
        };

        self.abandon_in_flight();
        exit
    }

    /// Reissue every registered subscription on a fresh socket. A failure is
    /// logged and the rest still go out.
    async fn replay(&mut self, sink: &mut FrameSink) {
        let set = self.registry.replay_set();
        if set.is_empty() {
            return;
        }
        debug!(url = %self.endpoint.url, count = set.len(), "replaying subscriptions");
        for (key, topic) in set {
            if let Err(e) = self.issue(sink, key, None).await {
                warn!(
                    url = %self.endpoint.url,
                    %key,
                    %topic,
                    error = %e,
                    "failed to replay subscription"
                );
            }
        }
    }

    async fn issue(
        &mut self,
        sink: &mut FrameSink,
        key: SubscriptionKey,
        reply: Option<Reply<SubscriptionKey>>,
    ) -> Result<(), TransportError> {
        let Some(params) = self.registry.topic(key).map(Topic::subscribe_params) else {
            return Ok(());
        };
        let id = self.allocate_id();
        self.send_request(sink, id, "eth_subscribe", params, Pending::Subscribe { key, reply })
            .await
    }

    async fn send_request(
        &mut self,
        sink: &mut FrameSink,
        id: u64,
        method: &str,
        params: Vec<Value>,
        pending: Pending,
    ) -> Result<(), TransportError> {
        let text = match serde_json::to_string(&JsonRpcRequest::new(id, method, params)) {
            Ok(text) => text,
            Err(e) => {
                pending.fail(TransportError::Other(e.to_string()));
                return Err(e.into());
            }
        };
        self.pending.insert(id, pending);
        if let Err(e) = send_within(sink, Frame::Text(text), self.config.pong_timeout).await {
            if let Some(pending) = self.pending.remove(&id) {
                pending.fail(TransportError::WebSocket(e.to_string()));
            }
            return Err(e);
        }
        Ok(())
    }

    fn on_text(&mut self, text: &str) {
        match Incoming::parse(text) {
            Some(Incoming::Notification(push)) => {
                if !self.registry.dispatch(&push.subscription, push.result) {
                    debug!(
                        url = %self.endpoint.url,
                        subscription = %push.subscription,
                        "push for unknown subscription"
                    );
                }
            }
            Some(Incoming::Response(resp)) => self.on_response(resp),
            None => debug!(url = %self.endpoint.url, "ignoring unrecognised frame"),
        }
    }

    fn on_response(&mut self, resp: JsonRpcResponse) {
        let Some(pending) = resp.id.as_number().and_then(|id| self.pending.remove(&id)) else {
            debug!(url = %self.endpoint.url, id = %resp.id, "response for unknown request");
            return;
        };
        match pending {
            Pending::Request(reply) => {
                let _ = reply.send(resp.into_result().map_err(TransportError::Rpc));
            }
            Pending::Subscribe { key, reply } => {
                let outcome = match resp.into_result() {
                    Ok(Value::String(server_id)) => {
                        self.registry.bind(server_id.clone(), key);
                        debug!(
                            url = %self.endpoint.url,
                            %key,
                            subscription = %server_id,
                            bound = self.registry.bound(),
                            registered = self.registry.len(),
                            "subscribed"
                        );
                        Ok(key)
                    }
                    Ok(other) => Err(TransportError::Other(format!(
                        "unexpected subscription id {other}"
                    ))),
                    Err(e) => Err(TransportError::Rpc(e)),
                };
                if let Err(e) = &outcome {
                    warn!(url = %self.endpoint.url, %key, error = %e, "subscription rejected");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
        }
    }

    /// Socket is gone: server ids are meaningless and nothing will answer.
    fn abandon_in_flight(&mut self) {
        self.registry.clear_routes();
        for (_, pending) in self.pending.drain() {
            pending.fail(TransportError::WebSocket("connection lost".into()));
        }
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn not_connected(&self) -> TransportError {
        TransportError::NotConnected { url: self.endpoint.url.clone() }
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(url = %self.endpoint.url, from = %prev, to = %next, "state change");
        }
    }
}

/// Write one frame. A socket that stops draining for `limit` is treated like
/// one that stopped answering pings.
async fn send_within(
    sink: &mut FrameSink,
    frame: Frame,
    limit: Duration,
) -> Result<(), TransportError> {
    time::timeout(limit, sink.send(frame))
        .await
        .unwrap_or_else(|_| Err(TransportError::Timeout { ms: limit.as_millis() as u64 }))
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => future::pending::<()>().await,
    }
}

struct HandleInner {
    index: usize,
    endpoint: Endpoint,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

/// Cheap, cloneable access to one endpoint connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Position of the endpoint in the configured list.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ConnectionState::Terminated
    }

    /// `true` if both handles point at the same connection.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Suspend until the connection is `Open`. Fails once it is terminated.
    pub async fn wait_open(&self) -> Result<(), TransportError> {
        let mut rx = self.inner.state.clone();
        let state = rx
            .wait_for(|s| matches!(s, ConnectionState::Open | ConnectionState::Terminated))
            .await
            .map(|s| *s)
            .map_err(|_| self.terminated())?;
        match state {
            ConnectionState::Open => Ok(()),
            _ => Err(self.terminated()),
        }
    }

    /// Register `listener` for `topic` on this connection.
    ///
    /// The registration is kept and replayed on every reconnect even when
    /// this call fails with [`TransportError::NotConnected`].
    pub async fn subscribe(
        &self,
        topic: Topic,
        listener: Listener,
    ) -> Result<SubscriptionKey, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Subscribe { topic, listener, reply })
            .map_err(|_| self.terminated())?;
        rx.await
            .map_err(|_| TransportError::WebSocket("connection dropped the subscription".into()))?
    }

    /// Ask the connection to close its socket and stop for good.
    pub fn close(&self) {
        let _ = self.inner.commands.send(Command::Close);
    }

    /// Poll until the connection is past a handshake (or `deadline`), then
    /// request close so a half-open handshake is not cut mid-flight.
    pub async fn close_when_settled(&self, poll_interval: Duration, deadline: Instant) {
        while self.state() == ConnectionState::Connecting && Instant::now() < deadline {
            time::sleep(poll_interval).await;
        }
        self.close();
    }

    fn terminated(&self) -> TransportError {
        TransportError::Terminated { url: self.inner.endpoint.url.clone() }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("index", &self.inner.index)
            .field("url", &self.inner.endpoint.url)
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl RpcClient for ConnectionHandle {
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Request { method: method.to_string(), params, reply })
            .map_err(|_| self.terminated())?;
        rx.await
            .map_err(|_| TransportError::WebSocket("connection dropped the request".into()))?
    }

    fn health(&self) -> HealthStatus {
        match self.state() {
            ConnectionState::Open => HealthStatus::Healthy,
            ConnectionState::Connecting | ConnectionState::Closed => HealthStatus::Degraded,
            ConnectionState::Terminated => HealthStatus::Unhealthy,
        }
    }

    fn url(&self) -> &str {
        &self.inner.endpoint.url
    }
}
