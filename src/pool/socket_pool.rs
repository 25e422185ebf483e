//! Generic socket pool.
//!
//! # Responsibilities
//! - Bound sockets per group, per pool and per upstream proxy
//! - Queue requests priority-then-FIFO and serve them as sockets free up
//! - Run connect jobs as tasks, with a speculative backup job for slow groups
//! - Keep idle sockets for reuse and evict them on timeout or flush
//!
//! # Data Flow
//! ```text
//! request_socket ─▶ idle socket? ──yes──▶ handle (ReusedIdle / UnusedIdle)
//!        │ no
//!        ▼
//!   pending queue ─▶ start_job (if group/pool/proxy limits allow)
//!                         │
//!        job task ─▶ on_job_complete ─▶ head of queue (Unused) or idle
//!
//! handle.release() ─▶ release_socket ─▶ head of queue (ReusedIdle) or idle
//! drop(handle)     ─▶ release_socket ─▶ closed, slot handed to stalled groups
//! ```
//!
//! # Design Decisions
//! - Jobs are not bound to requests: a finished job serves whichever request
//!   heads its group's queue at that moment
//! - Fresh requests skip idle sockets and are never handed a released one
//! - All state sits behind one mutex that is never held across an await;
//!   sockets being closed are dropped after the lock is released because
//!   dropping a layered socket re-enters the pool below it
//! - Higher layered pools are held weakly and asked for relief only after
//!   this pool's lock is released, so locks are always taken higher → lower

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::connect_job::{ConnectJobFailure, ConnectTiming, ConnectedSocket, FailureExtra};
use crate::error::NetError;
use crate::net::connection::SocketId;
use crate::net::socket::{is_connected_and_idle, BoxedSocket};
use crate::observability::metrics;
use crate::pool::group_key::ConnectionGroupKey;
use crate::pool::handle::{ClientSocketHandle, ReuseType, SocketReleaser};
use crate::pool::layered::HigherLayeredPool;
use crate::pool::pending::{PendingQueue, RequestId};
use crate::pool::priority::{LoadState, LoadStateCell, RequestPriority};
use crate::proxy::server::ProxyServer;

/// Builds the connect jobs of one pool layer.
#[async_trait]
pub trait ConnectJobFactory: Send + Sync + 'static {
    type Params: Clone + Send + Sync + 'static;

    /// Wall-clock budget for one job, resolution through final handshake.
    fn connection_timeout(&self) -> Duration;

    async fn connect(
        &self,
        key: &ConnectionGroupKey,
        params: &Self::Params,
        priority: RequestPriority,
        load_state: &LoadStateCell,
    ) -> Result<ConnectedSocket, ConnectJobFailure>;
}

/// A failed socket request.
///
/// When the job kept its socket (certificate error, proxy auth), `handle`
/// holds it as an active lease of this pool.
pub struct RequestSocketError {
    pub error: NetError,
    pub extra: Option<FailureExtra>,
    pub handle: Option<ClientSocketHandle>,
}

impl From<NetError> for RequestSocketError {
    fn from(error: NetError) -> Self {
        Self {
            error,
            extra: None,
            handle: None,
        }
    }
}

impl std::fmt::Debug for RequestSocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSocketError")
            .field("error", &self.error)
            .field("extra", &self.extra)
            .field("handle", &self.handle)
            .finish()
    }
}

struct PooledSocket {
    socket: BoxedSocket,
    id: SocketId,
    reuse_type: ReuseType,
    idle_time: Duration,
    timing: ConnectTiming,
    generation: u64,
}

impl PooledSocket {
    fn kept_by_failure(socket: BoxedSocket, id: SocketId, generation: u64) -> Self {
        Self {
            socket,
            id,
            reuse_type: ReuseType::Unused,
            idle_time: Duration::ZERO,
            timing: ConnectTiming::default(),
            generation,
        }
    }
}

struct DeliveredFailure {
    error: NetError,
    extra: Option<FailureExtra>,
    socket: Option<(BoxedSocket, SocketId)>,
    generation: u64,
}

impl DeliveredFailure {
    fn aborted() -> Self {
        Self {
            error: NetError::ConnectionAborted,
            extra: None,
            socket: None,
            generation: 0,
        }
    }
}

type Delivery = Result<PooledSocket, DeliveredFailure>;

struct PendingRequest<P> {
    params: P,
    priority: RequestPriority,
    /// Served only by a newly connected socket, never a released one.
    fresh_only: bool,
    tx: oneshot::Sender<Delivery>,
}

struct IdleSocket {
    socket: BoxedSocket,
    id: SocketId,
    since: Instant,
    used: bool,
    timing: ConnectTiming,
}

impl IdleSocket {
    fn fresh(socket: BoxedSocket, id: SocketId, timing: ConnectTiming) -> Self {
        Self {
            socket,
            id,
            since: Instant::now(),
            used: false,
            timing,
        }
    }
}

struct JobEntry {
    abort: AbortHandle,
    load_state: LoadStateCell,
    backup: bool,
}

struct Group<P> {
    /// Oldest first; reuse takes from the back.
    idle: Vec<IdleSocket>,
    active: usize,
    jobs: HashMap<u64, JobEntry>,
    pending: PendingQueue<PendingRequest<P>>,
    backup_timer: Option<AbortHandle>,
}

impl<P> Default for Group<P> {
    fn default() -> Self {
        Self {
            idle: Vec::new(),
            active: 0,
            jobs: HashMap::new(),
            pending: PendingQueue::default(),
            backup_timer: None,
        }
    }
}

impl<P> Group<P> {
    fn num_sockets(&self) -> usize {
        self.idle.len() + self.active + self.jobs.len()
    }

    fn is_empty(&self) -> bool {
        self.num_sockets() == 0 && self.pending.is_empty()
    }

    fn wants_job(&self) -> bool {
        self.pending.len() > self.jobs.len()
    }

    fn cancel_backup_timer(&mut self) {
        if let Some(timer) = self.backup_timer.take() {
            timer.abort();
        }
    }
}

struct PoolState<P> {
    groups: HashMap<ConnectionGroupKey, Group<P>>,
    /// Idle + active + connecting, across all groups.
    total: usize,
    generation: u64,
    next_id: u64,
}

impl<P> PoolState<P> {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn proxy_sockets(&self, proxy: &ProxyServer) -> usize {
        self.groups
            .iter()
            .filter(|(k, _)| k.proxy() == proxy)
            .map(|(_, g)| g.num_sockets())
            .sum()
    }

    fn pending_total(&self) -> usize {
        self.groups.values().map(|g| g.pending.len()).sum()
    }

    fn remove_if_empty(&mut self, key: &ConnectionGroupKey) {
        if self.groups.get(key).is_some_and(Group::is_empty) {
            self.groups.remove(key);
        }
    }
}

/// A bounded pool of sockets for one connection layer.
pub struct SocketPool<F: ConnectJobFactory> {
    name: &'static str,
    config: PoolConfig,
    layer_depth: u8,
    factory: F,
    state: Mutex<PoolState<F::Params>>,
    higher_pools: Mutex<Vec<Weak<dyn HigherLayeredPool>>>,
    me: Weak<Self>,
}

impl<F: ConnectJobFactory> SocketPool<F> {
    /// `layer_depth` is 0 for pools over raw transport and grows by one per
    /// layer stacked on top.
    pub fn new(name: &'static str, config: PoolConfig, layer_depth: u8, factory: F) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name,
            config,
            layer_depth,
            factory,
            state: Mutex::new(PoolState {
                groups: HashMap::new(),
                total: 0,
                generation: 0,
                next_id: 0,
            }),
            higher_pools: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn layer_depth(&self) -> u8 {
        self.layer_depth
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<F::Params>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pool whose sockets are built on this pool's sockets.
    ///
    /// # Panics
    /// If `higher` is not strictly above this pool, which would allow a
    /// relief cycle.
    pub fn add_higher_layered_pool<H: ConnectJobFactory>(&self, higher: &Arc<SocketPool<H>>) {
        assert!(
            higher.layer_depth > self.layer_depth,
            "pool {} (depth {}) cannot be layered over {} (depth {})",
            higher.name,
            higher.layer_depth,
            self.name,
            self.layer_depth
        );
        let strong: Arc<dyn HigherLayeredPool> = higher.clone();
        let weak = Arc::downgrade(&strong);
        self.higher_pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(weak);
    }

    /// Get a socket for `key`, reusing an idle one or waiting for a connect.
    ///
    /// Dropping the returned future cancels the request: it leaves the queue
    /// without disturbing the order of the rest, and a socket already on its
    /// way is returned to the pool.
    pub async fn request_socket(
        self: &Arc<Self>,
        key: &ConnectionGroupKey,
        params: F::Params,
        priority: RequestPriority,
    ) -> Result<ClientSocketHandle, RequestSocketError> {
        self.request(key, params, priority, false).await
    }

    /// Get a socket for `key` over a connection no earlier request has used.
    ///
    /// Idle sockets are left alone, except those holding the group's last
    /// slots, which are closed to make way for the new connection.
    pub async fn request_fresh_socket(
        self: &Arc<Self>,
        key: &ConnectionGroupKey,
        params: F::Params,
        priority: RequestPriority,
    ) -> Result<ClientSocketHandle, RequestSocketError> {
        self.request(key, params, priority, true).await
    }

    async fn request(
        self: &Arc<Self>,
        key: &ConnectionGroupKey,
        params: F::Params,
        priority: RequestPriority,
        fresh_only: bool,
    ) -> Result<ClientSocketHandle, RequestSocketError> {
        let mut closing = Vec::new();
        let (id, rx, stalled) = {
            let mut state = self.lock();
            if fresh_only {
                self.close_idle_holding_group_slots(&mut state, key, &mut closing);
            } else if let Some(pooled) = self.take_idle(&mut state, key, &mut closing) {
                drop(state);
                drop(closing);
                metrics::record_socket_reused(self.name);
                tracing::debug!(pool = self.name, group = %key, socket = %pooled.id, "Reusing idle socket");
                return Ok(self.make_handle(key, pooled));
            }

            let id = RequestId(state.next_id());
            let (tx, rx) = oneshot::channel();
            state.groups.entry(key.clone()).or_default().pending.push(
                id,
                priority,
                PendingRequest {
                    params,
                    priority,
                    fresh_only,
                    tx,
                },
            );
            let stalled = self.start_jobs_for_group(&mut state, key, &mut closing);
            metrics::set_pending_requests(self.name, state.pending_total());
            (id, rx, stalled)
        };
        let mut waiter = Waiter {
            pool: Arc::clone(self),
            key: key.clone(),
            id,
            rx: Some(rx),
        };
        drop(closing);
        if stalled {
            tracing::debug!(pool = self.name, group = %key, "Pool stalled, asking higher pools for relief");
            self.relieve_via_higher_pools();
        }

        match waiter.wait().await {
            Ok(pooled) => Ok(self.make_handle(key, pooled)),
            Err(failure) => {
                let handle = failure.socket.map(|(socket, socket_id)| {
                    self.make_handle(key, PooledSocket::kept_by_failure(socket, socket_id, failure.generation))
                });
                Err(RequestSocketError {
                    error: failure.error,
                    extra: failure.extra,
                    handle,
                })
            }
        }
    }

    /// Preconnect: start jobs until `key` holds `num_sockets` sockets.
    ///
    /// Completed sockets with no waiting request go idle as unused.
    pub fn request_sockets(
        &self,
        key: &ConnectionGroupKey,
        params: F::Params,
        num_sockets: usize,
    ) -> Result<(), NetError> {
        let target = num_sockets.min(self.config.max_sockets_per_group);
        let mut closing = Vec::new();
        let result = {
            let mut state = self.lock();
            let mut result = Ok(());
            loop {
                let have = state.groups.get(key).map_or(0, Group::num_sockets);
                if have >= target {
                    break;
                }
                if !self.make_room(&mut state, key, &mut closing) {
                    result = Err(NetError::PreconnectMaxSocketLimit);
                    break;
                }
                self.start_job(&mut state, key, params.clone(), RequestPriority::Idle, false);
            }
            state.remove_if_empty(key);
            result
        };
        drop(closing);
        tracing::debug!(pool = self.name, group = %key, num_sockets, ok = result.is_ok(), "Preconnect requested");
        result
    }

    /// Fail every pending request with `error`, cancel all jobs, close idle
    /// sockets, and make sure active sockets are closed when released.
    pub fn flush_with_error(&self, error: NetError) {
        let mut closing = Vec::new();
        let mut failed = Vec::new();
        {
            let mut state = self.lock();
            state.generation += 1;
            let mut freed = 0;
            for group in state.groups.values_mut() {
                group.cancel_backup_timer();
                for (_, job) in group.jobs.drain() {
                    job.abort.abort();
                    freed += 1;
                }
                freed += group.idle.len();
                closing.extend(group.idle.drain(..).map(|idle| idle.socket));
                failed.extend(group.pending.drain().into_iter().map(|(_, req)| req.tx));
            }
            state.total -= freed;
            state.groups.retain(|_, g| !g.is_empty());
            metrics::set_pending_requests(self.name, 0);
            tracing::info!(
                pool = self.name,
                error = %error,
                generation = state.generation,
                idle_closed = closing.len(),
                requests_failed = failed.len(),
                "Pool flushed"
            );
        }
        metrics::record_idle_closed(self.name, "flush", closing.len());
        drop(closing);
        for tx in failed {
            let _ = tx.send(Err(DeliveredFailure {
                error: error.clone(),
                extra: None,
                socket: None,
                generation: 0,
            }));
        }
    }

    /// Close every idle socket.
    pub fn close_idle_sockets(&self) -> usize {
        self.close_idle_where(|_| true)
    }

    /// Close the idle sockets of one group.
    pub fn close_idle_sockets_in_group(&self, key: &ConnectionGroupKey) -> usize {
        self.close_idle_where(|k| k == key)
    }

    fn close_idle_where(&self, pred: impl Fn(&ConnectionGroupKey) -> bool) -> usize {
        let mut closing = Vec::new();
        let count = {
            let mut state = self.lock();
            let mut freed = 0;
            for (key, group) in state.groups.iter_mut() {
                if pred(key) {
                    freed += group.idle.len();
                    closing.extend(group.idle.drain(..).map(|idle| idle.socket));
                }
            }
            state.total -= freed;
            state.groups.retain(|_, g| !g.is_empty());
            if freed > 0 {
                self.start_jobs_for_stalled_groups(&mut state, &mut closing);
            }
            freed
        };
        metrics::record_idle_closed(self.name, "closed", count);
        drop(closing);
        count
    }

    /// Close the oldest idle socket in the pool, if any.
    pub fn close_one_idle_socket(&self) -> bool {
        let mut closing = Vec::new();
        {
            let mut state = self.lock();
            match Self::pop_oldest_idle(&mut state, None) {
                Some(socket) => closing.push(socket),
                None => return false,
            }
            self.start_jobs_for_stalled_groups(&mut state, &mut closing);
        }
        metrics::record_idle_closed(self.name, "relief", 1);
        drop(closing);
        true
    }

    /// Evict idle sockets past their timeout or no longer usable.
    ///
    /// With `force`, every idle socket is evicted.
    pub fn cleanup_idle_sockets(&self, force: bool) -> usize {
        let now = Instant::now();
        let unused_timeout = self.config.unused_idle_timeout();
        let used_timeout = self.config.used_idle_timeout();
        let mut closing = Vec::new();
        let count = {
            let mut state = self.lock();
            let mut freed = 0;
            for group in state.groups.values_mut() {
                let mut kept = Vec::with_capacity(group.idle.len());
                for mut idle in group.idle.drain(..) {
                    let timeout = if idle.used { used_timeout } else { unused_timeout };
                    let expired = now.duration_since(idle.since) >= timeout;
                    if force || expired || !is_connected_and_idle(idle.socket.as_mut()) {
                        closing.push(idle.socket);
                        freed += 1;
                    } else {
                        kept.push(idle);
                    }
                }
                group.idle = kept;
            }
            state.total -= freed;
            state.groups.retain(|_, g| !g.is_empty());
            if freed > 0 {
                self.start_jobs_for_stalled_groups(&mut state, &mut closing);
            }
            freed
        };
        if count > 0 {
            tracing::debug!(pool = self.name, closed = count, "Idle sockets cleaned up");
            metrics::record_idle_closed(self.name, "timeout", count);
        }
        drop(closing);
        count
    }

    /// Run [`cleanup_idle_sockets`](Self::cleanup_idle_sockets) every
    /// cleanup interval until the pool is dropped.
    pub fn spawn_idle_sweeper(&self) -> JoinHandle<()> {
        let weak = self.me.clone();
        let interval = self.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(pool) => {
                        pool.cleanup_idle_sockets(false);
                    }
                    None => break,
                }
            }
        })
    }

    /// What requests in `key` are currently waiting on.
    pub fn load_state(&self, key: &ConnectionGroupKey) -> LoadState {
        let state = self.lock();
        match state.groups.get(key) {
            Some(group) if group.jobs.is_empty() && !group.pending.is_empty() => {
                LoadState::WaitingForAvailableSocket
            }
            Some(group) => group
                .jobs
                .values()
                .map(|job| job.load_state.get())
                .max()
                .unwrap_or_default(),
            None => LoadState::Idle,
        }
    }

    /// Some group has queued requests that only lack pool or proxy capacity.
    pub fn is_stalled(&self) -> bool {
        let state = self.lock();
        self.any_group_stalled(&state)
    }

    pub fn idle_socket_count(&self) -> usize {
        self.lock().groups.values().map(|g| g.idle.len()).sum()
    }

    pub fn idle_socket_count_in_group(&self, key: &ConnectionGroupKey) -> usize {
        self.lock().groups.get(key).map_or(0, |g| g.idle.len())
    }

    pub fn active_socket_count_in_group(&self, key: &ConnectionGroupKey) -> usize {
        self.lock().groups.get(key).map_or(0, |g| g.active)
    }

    pub fn connect_job_count_in_group(&self, key: &ConnectionGroupKey) -> usize {
        self.lock().groups.get(key).map_or(0, |g| g.jobs.len())
    }

    pub fn pending_request_count_in_group(&self, key: &ConnectionGroupKey) -> usize {
        self.lock().groups.get(key).map_or(0, |g| g.pending.len())
    }

    /// Sockets counted against the pool limit.
    pub fn total_socket_count(&self) -> usize {
        self.lock().total
    }

    pub fn info_as_value(&self) -> Value {
        let state = self.lock();
        let groups: serde_json::Map<String, Value> = state
            .groups
            .iter()
            .map(|(key, group)| {
                (
                    key.to_string(),
                    json!({
                        "pending_request_count": group.pending.len(),
                        "top_pending_priority": group.pending.top_priority(),
                        "active_socket_count": group.active,
                        "idle_socket_count": group.idle.len(),
                        "connect_job_count": group.jobs.len(),
                        "backup_job_timer_is_running": group.backup_timer.is_some(),
                        "is_stalled": self.is_group_stalled(&state, key, group),
                    }),
                )
            })
            .collect();
        json!({
            "name": self.name,
            "layer_depth": self.layer_depth,
            "handed_out_socket_count": state.groups.values().map(|g| g.active).sum::<usize>(),
            "connecting_socket_count": state.groups.values().map(|g| g.jobs.len()).sum::<usize>(),
            "idle_socket_count": state.groups.values().map(|g| g.idle.len()).sum::<usize>(),
            "total_socket_count": state.total,
            "max_socket_count": self.config.max_sockets_per_pool,
            "max_sockets_per_group": self.config.max_sockets_per_group,
            "pool_generation_number": state.generation,
            "groups": groups,
        })
    }

    fn make_handle(self: &Arc<Self>, key: &ConnectionGroupKey, pooled: PooledSocket) -> ClientSocketHandle {
        let releaser = self.clone() as Arc<dyn SocketReleaser>;
        ClientSocketHandle::new(
            pooled.socket,
            key.clone(),
            pooled.id,
            pooled.reuse_type,
            pooled.idle_time,
            pooled.generation,
            pooled.timing,
            releaser,
        )
    }

    /// Pop the most recently used idle socket that still passes the probe.
    fn take_idle(
        &self,
        state: &mut PoolState<F::Params>,
        key: &ConnectionGroupKey,
        closing: &mut Vec<BoxedSocket>,
    ) -> Option<PooledSocket> {
        let generation = state.generation;
        let group = state.groups.get_mut(key)?;
        let mut found = None;
        let mut discarded = 0;
        while let Some(mut idle) = group.idle.pop() {
            if is_connected_and_idle(idle.socket.as_mut()) {
                found = Some(idle);
                break;
            }
            discarded += 1;
            closing.push(idle.socket);
        }
        if found.is_some() {
            group.active += 1;
        }
        state.total -= discarded;
        if discarded > 0 {
            metrics::record_idle_closed(self.name, "stale", discarded);
        }
        found.map(|idle| PooledSocket {
            socket: idle.socket,
            id: idle.id,
            reuse_type: if idle.used {
                ReuseType::ReusedIdle
            } else {
                ReuseType::UnusedIdle
            },
            idle_time: idle.since.elapsed(),
            timing: idle.timing,
            generation,
        })
    }

    /// Close `key`'s oldest idle sockets while the group is at its limit.
    fn close_idle_holding_group_slots(
        &self,
        state: &mut PoolState<F::Params>,
        key: &ConnectionGroupKey,
        closing: &mut Vec<BoxedSocket>,
    ) {
        let Some(group) = state.groups.get_mut(key) else {
            return;
        };
        let mut closed = 0;
        while group.num_sockets() >= self.config.max_sockets_per_group && !group.idle.is_empty() {
            closing.push(group.idle.remove(0).socket);
            closed += 1;
        }
        state.total -= closed;
        if closed > 0 {
            metrics::record_idle_closed(self.name, "fresh_request", closed);
        }
    }

    fn has_pool_room(&self, state: &PoolState<F::Params>, proxy: &ProxyServer) -> bool {
        state.total < self.config.max_sockets_per_pool
            && (proxy.is_direct() || state.proxy_sockets(proxy) < self.config.max_sockets_per_proxy)
    }

    /// Ensure a new socket for `key` fits under the group, pool and proxy
    /// limits, closing idle sockets of other groups if that is what it takes.
    fn make_room(
        &self,
        state: &mut PoolState<F::Params>,
        key: &ConnectionGroupKey,
        closing: &mut Vec<BoxedSocket>,
    ) -> bool {
        if state.groups.get(key).map_or(0, Group::num_sockets) >= self.config.max_sockets_per_group {
            return false;
        }
        while !self.has_pool_room(state, key.proxy()) {
            // Under the pool limit means only the proxy limit is in the way.
            let only_proxy = state.total < self.config.max_sockets_per_pool;
            let filter = only_proxy.then(|| key.proxy().clone());
            match Self::pop_oldest_idle(state, filter.as_ref()) {
                Some(socket) => {
                    metrics::record_idle_closed(self.name, "make_room", 1);
                    closing.push(socket);
                }
                None => return false,
            }
        }
        true
    }

    /// Remove the oldest idle socket, optionally only among groups behind `proxy`.
    fn pop_oldest_idle(state: &mut PoolState<F::Params>, proxy: Option<&ProxyServer>) -> Option<BoxedSocket> {
        let key = state
            .groups
            .iter()
            .filter(|(k, g)| !g.idle.is_empty() && proxy.is_none_or(|p| k.proxy() == p))
            .min_by_key(|(_, g)| g.idle[0].since)
            .map(|(k, _)| k.clone())?;
        let idle = state.groups.get_mut(&key)?.idle.remove(0);
        state.total -= 1;
        state.remove_if_empty(&key);
        Some(idle.socket)
    }

    fn start_job(
        &self,
        state: &mut PoolState<F::Params>,
        key: &ConnectionGroupKey,
        params: F::Params,
        priority: RequestPriority,
        backup: bool,
    ) {
        let Some(pool) = self.me.upgrade() else {
            return;
        };
        let job_id = state.next_id();
        let load_state = LoadStateCell::default();
        let task_key = key.clone();
        let task_cell = load_state.clone();
        let task = tokio::spawn(async move {
            let result = tokio::time::timeout(
                pool.factory.connection_timeout(),
                pool.factory.connect(&task_key, &params, priority, &task_cell),
            )
            .await
            .unwrap_or_else(|_| Err(NetError::TimedOut.into()));
            pool.on_job_complete(&task_key, job_id, result);
        });
        state.total += 1;
        let group = state.groups.entry(key.clone()).or_default();
        let first_job = group.jobs.is_empty();
        group.jobs.insert(
            job_id,
            JobEntry {
                abort: task.abort_handle(),
                load_state,
                backup,
            },
        );
        tracing::debug!(pool = self.name, group = %key, job = job_id, backup, "Connect job started");
        if first_job && !backup && self.config.backup_jobs_enabled && group.backup_timer.is_none() {
            group.backup_timer = Some(self.spawn_backup_timer(key));
        }
    }

    fn spawn_backup_timer(&self, key: &ConnectionGroupKey) -> AbortHandle {
        let weak = self.me.clone();
        let key = key.clone();
        let delay = self.config.backup_connect_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(pool) = weak.upgrade() {
                pool.on_backup_timer(&key);
            }
        })
        .abort_handle()
    }

    fn on_backup_timer(&self, key: &ConnectionGroupKey) {
        let mut closing = Vec::new();
        {
            let mut state = self.lock();
            let Some(group) = state.groups.get_mut(key) else {
                return;
            };
            group.backup_timer = None;
            if group.pending.is_empty() || group.jobs.is_empty() || group.jobs.values().any(|j| j.backup) {
                return;
            }
            // A job still resolving would not be helped by a second one.
            let resolving = group
                .jobs
                .values()
                .any(|j| j.load_state.get() == LoadState::ResolvingHost);
            let top = group.pending.peek().map(|req| (req.params.clone(), req.priority));
            match top {
                Some((params, priority)) if !resolving && self.make_room(&mut state, key, &mut closing) => {
                    tracing::debug!(pool = self.name, group = %key, "Starting backup connect job");
                    self.start_job(&mut state, key, params, priority, true);
                }
                _ => {
                    let timer = self.spawn_backup_timer(key);
                    if let Some(group) = state.groups.get_mut(key) {
                        group.backup_timer = Some(timer);
                    }
                }
            }
        }
        drop(closing);
    }

    /// Start jobs for queued requests of `key` while limits allow.
    ///
    /// Returns true when requests are left waiting on pool or proxy capacity.
    fn start_jobs_for_group(
        &self,
        state: &mut PoolState<F::Params>,
        key: &ConnectionGroupKey,
        closing: &mut Vec<BoxedSocket>,
    ) -> bool {
        loop {
            let Some(group) = state.groups.get(key) else {
                return false;
            };
            if !group.wants_job() || group.num_sockets() >= self.config.max_sockets_per_group {
                return false;
            }
            let Some((params, priority)) = group.pending.peek().map(|r| (r.params.clone(), r.priority)) else {
                return false;
            };
            if !self.make_room(state, key, closing) {
                return true;
            }
            self.start_job(state, key, params, priority, false);
        }
    }

    /// Give free capacity to stalled groups, highest priority first.
    fn start_jobs_for_stalled_groups(&self, state: &mut PoolState<F::Params>, closing: &mut Vec<BoxedSocket>) {
        loop {
            let next = state
                .groups
                .iter()
                .filter(|(_, g)| g.wants_job() && g.num_sockets() < self.config.max_sockets_per_group)
                .max_by_key(|(_, g)| g.pending.top_priority())
                .and_then(|(k, g)| g.pending.peek().map(|r| (k.clone(), r.params.clone(), r.priority)));
            let Some((key, params, priority)) = next else {
                return;
            };
            if !self.make_room(state, &key, closing) {
                return;
            }
            self.start_job(state, &key, params, priority, false);
        }
    }

    fn is_group_stalled(
        &self,
        state: &PoolState<F::Params>,
        key: &ConnectionGroupKey,
        group: &Group<F::Params>,
    ) -> bool {
        group.wants_job()
            && group.num_sockets() < self.config.max_sockets_per_group
            && !self.has_pool_room(state, key.proxy())
    }

    fn any_group_stalled(&self, state: &PoolState<F::Params>) -> bool {
        state
            .groups
            .iter()
            .any(|(key, group)| self.is_group_stalled(state, key, group))
    }

    fn relieve_via_higher_pools(&self) {
        let higher: Vec<Arc<dyn HigherLayeredPool>> = self
            .higher_pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for pool in higher {
            if pool.close_one_idle_connection() {
                tracing::debug!(pool = self.name, higher = pool.pool_name(), "Higher pool released an idle connection");
                return;
            }
        }
    }

    fn on_job_complete(
        &self,
        key: &ConnectionGroupKey,
        job_id: u64,
        result: Result<ConnectedSocket, ConnectJobFailure>,
    ) {
        metrics::record_connect_job(self.name, result.as_ref().map(|_| ()).map_err(|f| &f.error));
        let mut closing = Vec::new();
        let mut undelivered = None;
        let mut stalled = false;
        {
            let mut state = self.lock();
            let generation = state.generation;
            let Some(group) = state.groups.get_mut(key) else {
                return;
            };
            // Missing means the job was cancelled; its socket is just dropped.
            let Some(job) = group.jobs.remove(&job_id) else {
                return;
            };
            if group.jobs.is_empty() {
                group.cancel_backup_timer();
            }
            let mut freed = 0;
            match result {
                Ok(connected) => {
                    let id = SocketId::next();
                    tracing::debug!(pool = self.name, group = %key, job = job_id, socket = %id, "Connect job succeeded");
                    match group.pending.pop() {
                        Some((_, req)) => {
                            group.active += 1;
                            let pooled = PooledSocket {
                                socket: connected.socket,
                                id,
                                reuse_type: ReuseType::Unused,
                                idle_time: Duration::ZERO,
                                timing: connected.timing,
                                generation,
                            };
                            if let Err(Ok(pooled)) = req.tx.send(Ok(pooled)) {
                                group.active -= 1;
                                group.idle.push(IdleSocket::fresh(pooled.socket, pooled.id, pooled.timing));
                            }
                            // The other half of a main/backup pair is no longer needed.
                            let paired = job.backup || group.jobs.values().any(|j| j.backup);
                            if paired && group.jobs.len() > group.pending.len() {
                                let loser = group
                                    .jobs
                                    .iter()
                                    .find(|(_, j)| j.backup != job.backup)
                                    .map(|(id, _)| *id);
                                if let Some(loser) = loser.and_then(|id| group.jobs.remove(&id)) {
                                    loser.abort.abort();
                                    freed += 1;
                                }
                            }
                        }
                        None => group.idle.push(IdleSocket::fresh(connected.socket, id, connected.timing)),
                    }
                }
                Err(failure) => {
                    tracing::debug!(pool = self.name, group = %key, job = job_id, error = %failure.error, "Connect job failed");
                    let ConnectJobFailure { error, extra, socket } = failure;
                    match group.pending.pop() {
                        Some((_, req)) => {
                            let socket = socket.map(|s| (s, SocketId::next()));
                            let kept = socket.is_some();
                            if kept {
                                group.active += 1;
                            } else {
                                freed += 1;
                            }
                            let delivered = DeliveredFailure {
                                error,
                                extra,
                                socket,
                                generation,
                            };
                            if let Err(Err(lost)) = req.tx.send(Err(delivered)) {
                                if kept {
                                    group.active -= 1;
                                    freed += 1;
                                }
                                undelivered = Some(lost);
                            }
                        }
                        None => {
                            freed += 1;
                            if let Some(socket) = socket {
                                closing.push(socket);
                            }
                        }
                    }
                }
            }
            state.total -= freed;
            if freed > 0 {
                stalled = self.start_jobs_for_group(&mut state, key, &mut closing);
                self.start_jobs_for_stalled_groups(&mut state, &mut closing);
            }
            metrics::set_pending_requests(self.name, state.pending_total());
            state.remove_if_empty(key);
        }
        drop(undelivered);
        drop(closing);
        if stalled {
            self.relieve_via_higher_pools();
        }
    }

    fn cancel_request(
        self: &Arc<Self>,
        key: &ConnectionGroupKey,
        id: RequestId,
        mut rx: oneshot::Receiver<Delivery>,
    ) {
        let mut closing = Vec::new();
        let still_pending = {
            let mut state = self.lock();
            let aborted = state.groups.get_mut(key).and_then(|group| {
                group.pending.remove(id)?;
                let mut aborted = 0;
                // Backups go first, then the most recent jobs.
                while group.jobs.len() > group.pending.len() {
                    let victim = group
                        .jobs
                        .iter()
                        .max_by_key(|(id, j)| (j.backup, **id))
                        .map(|(id, _)| *id);
                    let Some(job) = victim.and_then(|id| group.jobs.remove(&id)) else {
                        break;
                    };
                    job.abort.abort();
                    aborted += 1;
                }
                if group.jobs.is_empty() {
                    group.cancel_backup_timer();
                }
                Some(aborted)
            });
            if let Some(aborted) = aborted {
                tracing::debug!(pool = self.name, group = %key, aborted_jobs = aborted, "Pending request cancelled");
                state.total -= aborted;
                if aborted > 0 {
                    self.start_jobs_for_stalled_groups(&mut state, &mut closing);
                }
                metrics::set_pending_requests(self.name, state.pending_total());
                state.remove_if_empty(key);
            }
            aborted.is_some()
        };
        drop(closing);
        if still_pending {
            return;
        }
        // Already served: whatever was sent goes back to the pool.
        match rx.try_recv() {
            Ok(Ok(pooled)) => self.make_handle(key, pooled).release(),
            Ok(Err(failure)) => {
                if let Some((socket, socket_id)) = failure.socket {
                    drop(self.make_handle(key, PooledSocket::kept_by_failure(socket, socket_id, failure.generation)));
                }
            }
            Err(_) => {}
        }
    }
}

impl<F: ConnectJobFactory> SocketReleaser for SocketPool<F> {
    fn release_socket(
        &self,
        key: &ConnectionGroupKey,
        id: SocketId,
        mut socket: BoxedSocket,
        reusable: bool,
        generation: u64,
    ) {
        let mut closing = Vec::new();
        let mut stalled = false;
        {
            let mut state = self.lock();
            let current = state.generation;
            let Some(group) = state.groups.get_mut(key) else {
                return;
            };
            group.active = group.active.saturating_sub(1);
            let keep = reusable && generation == current && is_connected_and_idle(socket.as_mut());
            // Requests left waiting all want a new connection; free the slot for one.
            let only_fresh_waiting =
                keep && group.wants_job() && !group.pending.any(|req| !req.fresh_only);
            if keep && !only_fresh_waiting {
                tracing::trace!(pool = self.name, group = %key, socket = %id, "Socket released for reuse");
                match group.pending.pop_first(|req| !req.fresh_only) {
                    Some((_, req)) => {
                        group.active += 1;
                        metrics::record_socket_reused(self.name);
                        let pooled = PooledSocket {
                            socket,
                            id,
                            reuse_type: ReuseType::ReusedIdle,
                            idle_time: Duration::ZERO,
                            timing: ConnectTiming::default(),
                            generation: current,
                        };
                        if let Err(Ok(pooled)) = req.tx.send(Ok(pooled)) {
                            group.active -= 1;
                            group.idle.push(IdleSocket {
                                used: true,
                                ..IdleSocket::fresh(pooled.socket, id, pooled.timing)
                            });
                        }
                    }
                    None => group.idle.push(IdleSocket {
                        used: true,
                        ..IdleSocket::fresh(socket, id, ConnectTiming::default())
                    }),
                }
                // A stalled request elsewhere outranks an idle socket.
                if self.any_group_stalled(&state) {
                    if let Some(socket) = Self::pop_oldest_idle(&mut state, None) {
                        closing.push(socket);
                    }
                }
            } else {
                tracing::trace!(pool = self.name, group = %key, socket = %id, "Socket closed on release");
                state.total -= 1;
                closing.push(socket);
            }
            if !closing.is_empty() {
                stalled = self.start_jobs_for_group(&mut state, key, &mut closing);
                self.start_jobs_for_stalled_groups(&mut state, &mut closing);
            }
            metrics::set_pending_requests(self.name, state.pending_total());
            state.remove_if_empty(key);
        }
        drop(closing);
        if stalled {
            self.relieve_via_higher_pools();
        }
    }
}

impl<F: ConnectJobFactory> HigherLayeredPool for SocketPool<F> {
    fn close_one_idle_connection(&self) -> bool {
        self.close_one_idle_socket()
    }

    fn layer_depth(&self) -> u8 {
        self.layer_depth
    }

    fn pool_name(&self) -> &'static str {
        self.name
    }
}

/// Cancels its request when dropped before delivery.
struct Waiter<F: ConnectJobFactory> {
    pool: Arc<SocketPool<F>>,
    key: ConnectionGroupKey,
    id: RequestId,
    rx: Option<oneshot::Receiver<Delivery>>,
}

impl<F: ConnectJobFactory> Waiter<F> {
    async fn wait(&mut self) -> Delivery {
        let Some(rx) = self.rx.as_mut() else {
            return Err(DeliveredFailure::aborted());
        };
        let delivery = rx.await;
        self.rx = None;
        delivery.unwrap_or_else(|_| Err(DeliveredFailure::aborted()))
    }
}

impl<F: ConnectJobFactory> Drop for Waiter<F> {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            self.pool.cancel_request(&self.key, self.id, rx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::DuplexStream;

    use crate::net::address::HostPortPair;
    use crate::pool::group_key::SocketType;
    use crate::proxy::server::ProxyScheme;

    #[derive(Clone)]
    enum Outcome {
        Connect,
        Fail(NetError),
    }

    #[derive(Default)]
    struct ScriptedFactory {
        script: Mutex<VecDeque<(Duration, Outcome)>>,
        started: AtomicUsize,
        peers: Mutex<Vec<DuplexStream>>,
    }

    impl ScriptedFactory {
        fn with(script: Vec<(Duration, Outcome)>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ConnectJobFactory for ScriptedFactory {
        type Params = ();

        fn connection_timeout(&self) -> Duration {
            Duration::from_secs(30)
        }

        async fn connect(
            &self,
            _key: &ConnectionGroupKey,
            _params: &(),
            _priority: RequestPriority,
            load_state: &LoadStateCell,
        ) -> Result<ConnectedSocket, ConnectJobFailure> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let (delay, outcome) = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((Duration::ZERO, Outcome::Connect));
            load_state.set(LoadState::Connecting);
            tokio::time::sleep(delay).await;
            match outcome {
                Outcome::Connect => {
                    let (client, server) = tokio::io::duplex(1024);
                    self.peers.lock().unwrap().push(server);
                    Ok(ConnectedSocket::new(Box::new(client), ConnectTiming::default()))
                }
                Outcome::Fail(error) => Err(error.into()),
            }
        }
    }

    fn config(per_group: usize, per_pool: usize) -> PoolConfig {
        PoolConfig {
            max_sockets_per_group: per_group,
            max_sockets_per_pool: per_pool,
            max_sockets_per_proxy: per_pool,
            backup_jobs_enabled: false,
            ..PoolConfig::default()
        }
    }

    fn key(host: &str) -> ConnectionGroupKey {
        ConnectionGroupKey::new(HostPortPair::new(host, 80), SocketType::Plain, ProxyServer::direct())
    }

    fn pool(config: PoolConfig, factory: ScriptedFactory) -> Arc<SocketPool<ScriptedFactory>> {
        SocketPool::new("test", config, 0, factory)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test]
    async fn released_socket_is_reused() {
        let pool = pool(config(6, 16), ScriptedFactory::default());
        let k = key("a");
        let first = pool.request_socket(&k, (), RequestPriority::Low).await.unwrap();
        assert_eq!(first.reuse_type(), ReuseType::Unused);
        let id = first.id();
        first.release();
        assert_eq!(pool.idle_socket_count_in_group(&k), 1);

        let second = pool.request_socket(&k, (), RequestPriority::Low).await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.reuse_type(), ReuseType::ReusedIdle);
        assert_eq!(pool.factory().started.load(Ordering::SeqCst), 1);
        assert_eq!(pool.total_socket_count(), 1);
    }

    #[tokio::test]
    async fn fresh_request_leaves_idle_sockets_alone() {
        let pool = pool(config(6, 16), ScriptedFactory::default());
        let k = key("a");
        let first = pool.request_socket(&k, (), RequestPriority::Low).await.unwrap();
        let id = first.id();
        first.release();

        let fresh = pool.request_fresh_socket(&k, (), RequestPriority::Low).await.unwrap();
        assert_ne!(fresh.id(), id);
        assert_eq!(fresh.reuse_type(), ReuseType::Unused);
        assert_eq!(pool.idle_socket_count_in_group(&k), 1);
        assert_eq!(pool.factory().started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fresh_request_closes_idle_socket_holding_the_last_slot() {
        let pool = pool(config(1, 16), ScriptedFactory::default());
        let k = key("a");
        let first = pool.request_socket(&k, (), RequestPriority::Low).await.unwrap();
        let id = first.id();
        first.release();
        assert_eq!(pool.idle_socket_count_in_group(&k), 1);

        let fresh = pool.request_fresh_socket(&k, (), RequestPriority::Low).await.unwrap();
        assert_ne!(fresh.id(), id);
        assert_eq!(pool.idle_socket_count_in_group(&k), 0);
        assert_eq!(pool.total_socket_count(), 1);
    }

    #[tokio::test]
    async fn released_socket_is_not_handed_to_a_fresh_request() {
        let pool = pool(config(1, 16), ScriptedFactory::default());
        let k = key("a");
        let held = pool.request_socket(&k, (), RequestPriority::Low).await.unwrap();
        let held_id = held.id();
        let waiting = {
            let pool = pool.clone();
            let k = k.clone();
            tokio::spawn(async move { pool.request_fresh_socket(&k, (), RequestPriority::Low).await })
        };
        settle().await;
        assert_eq!(pool.pending_request_count_in_group(&k), 1);

        held.release();
        let fresh = waiting.await.unwrap().unwrap();
        assert_ne!(fresh.id(), held_id);
        assert_eq!(fresh.reuse_type(), ReuseType::Unused);
        assert_eq!(pool.idle_socket_count_in_group(&k), 0);
        assert_eq!(pool.factory().started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropped_handle_closes_socket() {
        let pool = pool(config(6, 16), ScriptedFactory::default());
        let k = key("a");
        let handle = pool.request_socket(&k, (), RequestPriority::Low).await.unwrap();
        assert_eq!(pool.active_socket_count_in_group(&k), 1);
        drop(handle);
        assert_eq!(pool.total_socket_count(), 0);
        assert_eq!(pool.idle_socket_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_requests_served_by_priority_then_fifo() {
        let pool = pool(config(1, 16), ScriptedFactory::default());
        let k = key("a");
        let held = pool.request_socket(&k, (), RequestPriority::Low).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for (tag, priority) in [
            (1, RequestPriority::Low),
            (2, RequestPriority::Highest),
            (3, RequestPriority::Low),
        ] {
            let pool = pool.clone();
            let k = k.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let handle = pool.request_socket(&k, (), priority).await.unwrap();
                order.lock().unwrap().push(tag);
                handle.release();
            }));
            settle().await;
        }
        assert_eq!(pool.pending_request_count_in_group(&k), 3);
        held.release();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 3]);
        assert_eq!(pool.factory().started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn group_limit_caps_connect_jobs() {
        let factory = ScriptedFactory::with(vec![(Duration::from_secs(1), Outcome::Connect); 3]);
        let pool = pool(config(2, 16), factory);
        let k = key("a");
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let pool = pool.clone();
            let k = k.clone();
            tasks.push(tokio::spawn(async move {
                pool.request_socket(&k, (), RequestPriority::Low).await
            }));
        }
        settle().await;
        assert_eq!(pool.connect_job_count_in_group(&k), 2);
        assert_eq!(pool.pending_request_count_in_group(&k), 3);
        assert_eq!(pool.load_state(&k), LoadState::Connecting);
        if let Some(third) = tasks.pop() {
            third.abort();
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_request_leaves_queue_and_aborts_its_job() {
        let factory = ScriptedFactory::with(vec![(Duration::from_secs(5), Outcome::Connect)]);
        let pool = pool(config(6, 16), factory);
        let k = key("a");
        let request = {
            let pool = pool.clone();
            let k = k.clone();
            tokio::spawn(async move { pool.request_socket(&k, (), RequestPriority::Low).await })
        };
        settle().await;
        assert_eq!(pool.connect_job_count_in_group(&k), 1);
        request.abort();
        let _ = request.await;
        assert_eq!(pool.pending_request_count_in_group(&k), 0);
        assert_eq!(pool.connect_job_count_in_group(&k), 0);
        assert_eq!(pool.total_socket_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_goes_to_head_of_queue() {
        let factory = ScriptedFactory::with(vec![(Duration::ZERO, Outcome::Fail(NetError::ConnectionRefused))]);
        let pool = pool(config(6, 16), factory);
        let err = pool
            .request_socket(&key("a"), (), RequestPriority::Low)
            .await
            .unwrap_err();
        assert_eq!(err.error, NetError::ConnectionRefused);
        assert!(err.handle.is_none());
        assert_eq!(pool.total_socket_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_limit_evicts_idle_socket_of_other_group() {
        let pool = pool(config(6, 1), ScriptedFactory::default());
        let a = key("a");
        pool.request_socket(&a, (), RequestPriority::Low).await.unwrap().release();
        assert_eq!(pool.idle_socket_count_in_group(&a), 1);

        let b = pool.request_socket(&key("b"), (), RequestPriority::Low).await.unwrap();
        assert_eq!(pool.idle_socket_count_in_group(&a), 0);
        assert_eq!(pool.total_socket_count(), 1);
        drop(b);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_group_gets_freed_slot() {
        let pool = pool(config(6, 1), ScriptedFactory::default());
        let held = pool.request_socket(&key("a"), (), RequestPriority::Low).await.unwrap();
        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.request_socket(&key("b"), (), RequestPriority::Low).await })
        };
        settle().await;
        assert!(pool.is_stalled());
        assert_eq!(pool.load_state(&key("b")), LoadState::WaitingForAvailableSocket);
        drop(held);
        let handle = waiting.await.unwrap().unwrap();
        assert_eq!(handle.key(), &key("b"));
        assert!(!pool.is_stalled());
    }

    #[tokio::test(start_paused = true)]
    async fn proxy_limit_spans_groups() {
        let mut cfg = config(6, 16);
        cfg.max_sockets_per_proxy = 1;
        let pool = pool(cfg, ScriptedFactory::default());
        let proxy = ProxyServer::new(ProxyScheme::Http, HostPortPair::new("proxy", 8080));
        let via = |host: &str| {
            ConnectionGroupKey::new(HostPortPair::new(host, 80), SocketType::Plain, proxy.clone())
        };
        let _held = pool.request_socket(&via("a"), (), RequestPriority::Low).await.unwrap();
        let waiting = {
            let pool = pool.clone();
            let k = via("b");
            tokio::spawn(async move { pool.request_socket(&k, (), RequestPriority::Low).await })
        };
        settle().await;
        assert_eq!(pool.connect_job_count_in_group(&via("b")), 0);
        assert_eq!(pool.pending_request_count_in_group(&via("b")), 1);
        // Direct groups do not count against a proxy.
        assert!(pool.request_socket(&key("c"), (), RequestPriority::Low).await.is_ok());
        waiting.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn backup_job_wins_slow_connect() {
        let factory = ScriptedFactory::with(vec![
            (Duration::from_secs(10), Outcome::Connect),
            (Duration::from_millis(10), Outcome::Connect),
        ]);
        let mut cfg = config(6, 16);
        cfg.backup_jobs_enabled = true;
        let pool = pool(cfg, factory);
        let k = key("a");
        let start = Instant::now();
        let handle = pool.request_socket(&k, (), RequestPriority::Low).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.factory().started.load(Ordering::SeqCst), 2);
        // The slower main job was cancelled once the backup won.
        assert_eq!(pool.connect_job_count_in_group(&k), 0);
        assert_eq!(pool.total_socket_count(), 1);
        drop(handle);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_request_aborts_main_and_backup_jobs() {
        let factory = ScriptedFactory::with(vec![
            (Duration::from_secs(10), Outcome::Connect),
            (Duration::from_secs(10), Outcome::Connect),
        ]);
        let mut cfg = config(6, 16);
        cfg.backup_jobs_enabled = true;
        let pool = pool(cfg, factory);
        let k = key("a");
        let request = {
            let pool = pool.clone();
            let k = k.clone();
            tokio::spawn(async move { pool.request_socket(&k, (), RequestPriority::Low).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pool.connect_job_count_in_group(&k), 2);

        request.abort();
        let _ = request.await;
        assert_eq!(pool.pending_request_count_in_group(&k), 0);
        assert_eq!(pool.connect_job_count_in_group(&k), 0);
        assert_eq!(pool.total_socket_count(), 0);

        // Neither job survives to leave a socket behind.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(pool.idle_socket_count_in_group(&k), 0);
        assert_eq!(pool.total_socket_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_fails_pending_and_closes_released_sockets() {
        let factory = ScriptedFactory::with(vec![
            (Duration::ZERO, Outcome::Connect),
            (Duration::from_secs(5), Outcome::Connect),
        ]);
        let pool = pool(config(6, 16), factory);
        let k = key("a");
        let active = pool.request_socket(&k, (), RequestPriority::Low).await.unwrap();
        let waiting = {
            let pool = pool.clone();
            let k = k.clone();
            tokio::spawn(async move { pool.request_socket(&k, (), RequestPriority::Low).await })
        };
        settle().await;
        pool.flush_with_error(NetError::NetworkChanged);
        assert_eq!(waiting.await.unwrap().unwrap_err().error, NetError::NetworkChanged);

        active.release();
        assert_eq!(pool.idle_socket_count(), 0);
        assert_eq!(pool.total_socket_count(), 0);
        assert_eq!(pool.info_as_value()["pool_generation_number"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn preconnect_fills_group_with_unused_idle_sockets() {
        let pool = pool(config(2, 16), ScriptedFactory::default());
        let k = key("a");
        pool.request_sockets(&k, (), 4).unwrap();
        settle().await;
        assert_eq!(pool.idle_socket_count_in_group(&k), 2);
        let handle = pool.request_socket(&k, (), RequestPriority::Low).await.unwrap();
        assert_eq!(handle.reuse_type(), ReuseType::UnusedIdle);
    }

    #[tokio::test(start_paused = true)]
    async fn preconnect_reports_pool_limit() {
        let pool = pool(config(4, 1), ScriptedFactory::default());
        let _held = pool.request_socket(&key("a"), (), RequestPriority::Low).await.unwrap();
        assert_eq!(
            pool.request_sockets(&key("b"), (), 1),
            Err(NetError::PreconnectMaxSocketLimit)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sockets_expire() {
        let mut cfg = config(6, 16);
        cfg.used_idle_timeout_secs = 5;
        let pool = pool(cfg, ScriptedFactory::default());
        pool.request_socket(&key("a"), (), RequestPriority::Low).await.unwrap().release();
        assert_eq!(pool.cleanup_idle_sockets(false), 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(pool.cleanup_idle_sockets(false), 1);
        assert_eq!(pool.total_socket_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn higher_pool_gives_up_idle_socket_for_stalled_lower_pool() {
        let lower = pool(config(6, 1), ScriptedFactory::default());
        let higher = SocketPool::new("higher", config(6, 16), 1, ScriptedFactory::default());
        lower.add_higher_layered_pool(&higher);

        // An idle socket of the higher pool holds the lower pool's only slot.
        let lower_handle = lower.request_socket(&key("a"), (), RequestPriority::Low).await.unwrap();
        {
            let mut state = higher.lock();
            state.total += 1;
            state.groups.entry(key("a")).or_default().idle.push(IdleSocket::fresh(
                Box::new(lower_handle),
                SocketId::next(),
                ConnectTiming::default(),
            ));
        }

        let handle = lower.request_socket(&key("b"), (), RequestPriority::Low).await.unwrap();
        assert_eq!(handle.key(), &key("b"));
        assert_eq!(higher.idle_socket_count(), 0);
    }

    #[test]
    #[should_panic(expected = "cannot be layered")]
    fn layering_must_go_up() {
        let a = pool(config(6, 16), ScriptedFactory::default());
        let b = pool(config(6, 16), ScriptedFactory::default());
        a.add_higher_layered_pool(&b);
    }
}
