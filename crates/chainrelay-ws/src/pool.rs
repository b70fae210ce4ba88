//! Failover pool over a fixed set of endpoint connections.
//!
//! Exactly one connection is "active" at a time. Selection is a monotonic
//! counter reduced modulo the pool size; the first connection to open is
//! what counter value zero points at. When any connection spends its
//! reconnect budget the counter advances (past connections that are already
//! terminated) and every registered swap callback is called with the new
//! handle, in registration order. Terminations before the first connection
//! opens do not move the counter.
//!
//! The new active connection is not required to be `Open`. Consumers bound to
//! it see `NotConnected` until it opens, and its own replay-on-open then
//! issues whatever they registered.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures::future;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use chainrelay_core::{HealthStatus, TransportError};

use crate::connection::{
    ConnectionConfig, ConnectionHandle, ConnectionState, Endpoint, EndpointConnection,
};
use crate::transport::Connector;

/// Called with the newly active handle on every failover.
pub type SwapCallback = Arc<dyn Fn(ConnectionHandle) + Send + Sync + 'static>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub connection: ConnectionConfig,
    /// Upper bound on the whole shutdown drain.
    pub shutdown_grace: Duration,
    /// How often shutdown re-checks a connection that is mid-handshake.
    pub close_poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            shutdown_grace: Duration::from_secs(5),
            close_poll_interval: Duration::from_millis(5),
        }
    }
}

struct PoolShared {
    handles: Vec<ConnectionHandle>,
    /// Only ever incremented.
    counter: AtomicUsize,
    /// Index of the first connection that opened.
    offset: AtomicUsize,
    /// Set once `offset` is fixed. Terminations before that leave the
    /// counter alone.
    ready: AtomicBool,
    callbacks: Mutex<Vec<SwapCallback>>,
    exhausted: AtomicBool,
}

impl PoolShared {
    fn slot(&self, ticket: usize) -> usize {
        (self.offset.load(Ordering::SeqCst) + ticket) % self.handles.len()
    }

    fn active(&self) -> &ConnectionHandle {
        &self.handles[self.slot(self.counter.load(Ordering::SeqCst))]
    }

    /// Termination hook of connection `terminated`.
    fn swap(&self, terminated: usize) {
        if !self.ready.load(Ordering::SeqCst) {
            debug!(
                terminated = %self.handles[terminated].endpoint().url,
                "endpoint terminated before the pool was ready"
            );
            return;
        }
        let n = self.handles.len();
        let mut next = None;
        for _ in 0..n {
            let ticket = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            let candidate = &self.handles[self.slot(ticket)];
            if !candidate.is_terminated() {
                next = Some(candidate.clone());
                break;
            }
        }

        let Some(handle) = next else {
            self.exhausted.store(true, Ordering::SeqCst);
            error!(endpoints = n, "every endpoint terminated, pool exhausted");
            return;
        };

        info!(
            terminated = %self.handles[terminated].endpoint().url,
            active = %handle.endpoint().url,
            active_state = %handle.state(),
            "failover"
        );
        let callbacks: Vec<SwapCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(handle.clone());
        }
    }
}

/// Resolve with the first handle that is `Open`, or fail once every one of
/// them has terminated.
async fn first_open(handles: &[ConnectionHandle]) -> Result<&ConnectionHandle, TransportError> {
    let mut waits: Vec<_> = handles
        .iter()
        .map(|h| Box::pin(async move { h.wait_open().await.map(|()| h) }))
        .collect();
    while !waits.is_empty() {
        let (res, _, rest) = future::select_all(waits).await;
        if let Ok(handle) = res {
            return Ok(handle);
        }
        waits = rest;
    }
    Err(TransportError::AllEndpointsTerminated)
}

/// A fixed set of endpoint connections behind one "current connection".
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    tasks: Vec<JoinHandle<()>>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Start one connection per endpoint and wait until any of them opens.
    ///
    /// Fails with [`TransportError::AllEndpointsTerminated`] only if every
    /// connection terminates before one opens.
    pub async fn connect(
        endpoints: Vec<Endpoint>,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, TransportError> {
        if endpoints.is_empty() {
            return Err(TransportError::NoEndpoints);
        }

        let (conns, handles): (Vec<_>, Vec<_>) = endpoints
            .into_iter()
            .enumerate()
            .map(|(index, endpoint)| {
                EndpointConnection::new(
                    index,
                    endpoint,
                    config.connection.clone(),
                    Arc::clone(&connector),
                )
            })
            .unzip();

        let shared = Arc::new(PoolShared {
            handles,
            counter: AtomicUsize::new(0),
            offset: AtomicUsize::new(0),
            ready: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            exhausted: AtomicBool::new(false),
        });

        let tasks = conns
            .into_iter()
            .map(|conn| {
                let pool: Weak<PoolShared> = Arc::downgrade(&shared);
                conn.spawn(Box::new(move |index| {
                    if let Some(pool) = pool.upgrade() {
                        pool.swap(index);
                    }
                }))
            })
            .collect();

        info!(endpoints = shared.handles.len(), "connection pool starting");
        let pool = Self { shared, tasks, config };

        let opened = first_open(&pool.shared.handles)
            .await
            .map(|h| (h.index(), h.endpoint().url.clone()));
        match opened {
            Ok((index, url)) => {
                pool.shared.offset.store(index, Ordering::SeqCst);
                pool.shared.ready.store(true, Ordering::SeqCst);
                // a termination between opening and `ready` skipped its swap
                if pool.shared.active().is_terminated() {
                    pool.shared.swap(index);
                }
                info!(url = %url, "connection pool ready");
                Ok(pool)
            }
            Err(e) => {
                error!("every endpoint terminated before any opened");
                for task in &pool.tasks {
                    task.abort();
                }
                Err(e)
            }
        }
    }

    /// The active connection. Waits until some connection is `Open` and
    /// registers `on_swap` for every later failover. Callbacks accumulate.
    pub async fn current<F>(&self, on_swap: F) -> Result<ConnectionHandle, TransportError>
    where
        F: Fn(ConnectionHandle) + Send + Sync + 'static,
    {
        first_open(&self.shared.handles).await?;
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(on_swap));
        Ok(self.shared.active().clone())
    }

    pub fn len(&self) -> usize {
        self.shared.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.handles.is_empty()
    }

    /// Endpoint index of the active connection.
    pub fn active_index(&self) -> usize {
        self.shared.active().index()
    }

    /// Every connection, in configured order.
    pub fn handles(&self) -> &[ConnectionHandle] {
        &self.shared.handles
    }

    /// `true` once every connection has terminated after the pool started.
    pub fn is_exhausted(&self) -> bool {
        self.shared.exhausted.load(Ordering::SeqCst)
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.shared.handles.iter().map(ConnectionHandle::state).collect()
    }

    pub fn health(&self) -> HealthStatus {
        let open = self
            .shared
            .handles
            .iter()
            .filter(|h| h.is_open())
            .count();
        if open == self.shared.handles.len() {
            HealthStatus::Healthy
        } else if open > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Close every connection, waiting at most `shutdown_grace` in total.
    ///
    /// Connections still handshaking are polled until they settle so the
    /// close is not sent mid-handshake. Tasks still running at the deadline
    /// are aborted.
    pub async fn shutdown(self) {
        let deadline = Instant::now() + self.config.shutdown_grace;
        let poll = self.config.close_poll_interval;

        future::join_all(
            self.shared
                .handles
                .iter()
                .map(|h| h.close_when_settled(poll, deadline)),
        )
        .await;

        for (handle, mut task) in self.shared.handles.iter().zip(self.tasks) {
            if time::timeout_at(deadline, &mut task).await.is_err() {
                warn!(url = %handle.endpoint().url, "connection still running at deadline, aborting");
                task.abort();
            }
        }
        info!("connection pool shut down");
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("handles", &self.shared.handles)
            .field("active", &self.active_index())
            .field("exhausted", &self.is_exhausted())
            .finish()
    }
}
