//! Relay Adaptor
//!
//! Owns the listening socket and runs the accept loop. Exactly one relay
//! session is served at a time: the next inbound connection is not accepted
//! until the current session has closed both of its sockets.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::hook::{Direction, InterceptionHook, PassThrough};
use super::peer::Peer;
use super::queue::{DirectionQueue, SendState};
use super::session::{RelaySession, SessionStats};
use crate::config::AdaptorConfig;
use crate::error::AdaptorError;

/// Default idle interval between pump ticks and accept / injection polls
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Default scratch buffer size used when draining a socket
pub const DEFAULT_READ_CHUNK_SIZE: usize = 1024;

/// State shared between the accept loop, the active session and callers
/// injecting data or registering hooks from other tasks
pub(crate) struct AdaptorState {
    running: AtomicBool,
    // Set for the whole life of a `start()` call, including after `stop()`
    active: AtomicBool,
    listener_queue: DirectionQueue,
    target_queue: DirectionQueue,
    listener_hook: RwLock<Arc<dyn InterceptionHook>>,
    target_hook: RwLock<Arc<dyn InterceptionHook>>,
    local_addr: Mutex<Option<SocketAddr>>,
    last_stats: Mutex<Option<SessionStats>>,
}

impl AdaptorState {
    pub(crate) fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            active: AtomicBool::new(false),
            listener_queue: DirectionQueue::new(),
            target_queue: DirectionQueue::new(),
            listener_hook: RwLock::new(Arc::new(PassThrough)),
            target_hook: RwLock::new(Arc::new(PassThrough)),
            local_addr: Mutex::new(None),
            last_stats: Mutex::new(None),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn hook_slot(&self, direction: Direction) -> &RwLock<Arc<dyn InterceptionHook>> {
        match direction {
            Direction::ListenerToTarget => &self.listener_hook,
            Direction::TargetToListener => &self.target_hook,
        }
    }

    /// Snapshot of the hook for chunks travelling in `direction`
    pub(crate) fn hook(&self, direction: Direction) -> Arc<dyn InterceptionHook> {
        let slot = self
            .hook_slot(direction)
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&*slot)
    }

    pub(crate) fn set_hook(&self, direction: Direction, hook: Arc<dyn InterceptionHook>) {
        let mut slot = self
            .hook_slot(direction)
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = hook;
    }

    /// Injection queue serviced on the read side of `direction`: the listener
    /// queue is written to the listener socket, the target queue to the target
    pub(crate) fn queue(&self, direction: Direction) -> &DirectionQueue {
        match direction {
            Direction::ListenerToTarget => &self.listener_queue,
            Direction::TargetToListener => &self.target_queue,
        }
    }

    fn clear_queues(&self) -> usize {
        self.listener_queue.clear() + self.target_queue.clear()
    }

    fn set_local_addr(&self, addr: Option<SocketAddr>) {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = addr;
    }

    fn set_last_stats(&self, stats: SessionStats) {
        *self
            .last_stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(stats);
    }

    #[cfg(test)]
    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

/// Marks the accept loop finished however `start()` exits, cancellation included
struct LoopGuard<'a>(&'a AdaptorState);

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
        self.0.set_local_addr(None);
        self.0.active.store(false, Ordering::SeqCst);
    }
}

/// Intercepting relay between one listen endpoint and one fixed target.
///
/// `Adaptor` is a cheap handle: clone it to call [`Adaptor::stop`] or inject
/// data from other tasks while [`Adaptor::start`] is running.
#[derive(Clone)]
pub struct Adaptor {
    listen_addr: SocketAddr,
    target_addr: SocketAddr,
    tick_interval: Duration,
    read_chunk_size: usize,
    state: Arc<AdaptorState>,
}

impl Adaptor {
    /// Create a new adaptor with default tick and read sizes
    pub fn new(listen_addr: SocketAddr, target_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            target_addr,
            tick_interval: DEFAULT_TICK_INTERVAL,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            state: Arc::new(AdaptorState::new()),
        }
    }

    /// Create a new adaptor from configuration
    pub fn from_config(config: &AdaptorConfig) -> Self {
        Self::new(config.listen_addr, config.target_addr)
            .with_tick_interval(config.tick_interval)
            .with_read_chunk_size(config.read_chunk_size)
    }

    /// Override the pump tick and poll interval
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Override the scratch buffer size used when draining a socket
    pub fn with_read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size;
        self
    }

    /// Configured listen endpoint; see [`Adaptor::local_addr`] for the bound one
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn target_addr(&self) -> SocketAddr {
        self.target_addr
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Address the listener is actually bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .state
            .local_addr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Statistics of the most recently finished session
    pub fn last_session_stats(&self) -> Option<SessionStats> {
        self.state
            .last_stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Replace the hook applied to chunks read from the listener side
    pub fn set_listener_hook<H>(&self, hook: H)
    where
        H: InterceptionHook + 'static,
    {
        self.state.set_hook(Direction::ListenerToTarget, Arc::new(hook));
    }

    /// Replace the hook applied to chunks read from the target side
    pub fn set_target_hook<H>(&self, hook: H)
    where
        H: InterceptionHook + 'static,
    {
        self.state.set_hook(Direction::TargetToListener, Arc::new(hook));
    }

    /// Restore pass-through behaviour in both directions
    pub fn clear_hooks(&self) {
        self.state.set_hook(Direction::ListenerToTarget, Arc::new(PassThrough));
        self.state.set_hook(Direction::TargetToListener, Arc::new(PassThrough));
    }

    /// Bind the listener and serve sessions until stopped.
    ///
    /// Returns `Ok(())` after [`Adaptor::stop`]. Bind, accept, target-connect
    /// and hook failures are fatal: the listener is closed, the adaptor is
    /// marked stopped and the error is returned.
    ///
    /// Fails with [`AdaptorError::AlreadyRunning`] while an earlier call has
    /// not yet returned, even if it has already been asked to stop.
    pub async fn start(&self) -> Result<(), AdaptorError> {
        if self.state.active.swap(true, Ordering::SeqCst) {
            return Err(AdaptorError::AlreadyRunning);
        }
        let _guard = LoopGuard(&self.state);
        self.state.running.store(true, Ordering::SeqCst);

        info!("Binding relay listener to {}", self.listen_addr);
        let listener = match TcpListener::bind(self.listen_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                error!("Failed to bind {}: {}", self.listen_addr, source);
                return Err(AdaptorError::Bind {
                    address: self.listen_addr,
                    source,
                });
            }
        };

        let local_addr = listener.local_addr().ok();
        self.state.set_local_addr(local_addr);
        info!(
            "Relaying {} -> {}",
            local_addr.unwrap_or(self.listen_addr),
            self.target_addr
        );

        let result = self.accept_loop(&listener).await;

        drop(listener);

        match &result {
            Ok(()) => info!("Relay adaptor stopped"),
            Err(e) => error!("Relay adaptor failed: {}", e),
        }

        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<(), AdaptorError> {
        while self.is_running() {
            // Bounded wait so the running flag is re-checked every tick
            let (stream, client_addr) = match timeout(self.tick_interval, listener.accept()).await {
                Err(_) => continue,
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => return Err(AdaptorError::Accept(e)),
            };

            if !self.is_running() {
                debug!("Dropping connection from {} accepted during shutdown", client_addr);
                break;
            }

            let discarded = self.state.clear_queues();
            if discarded > 0 {
                debug!("Discarded {} stale injected payloads", discarded);
            }

            debug!("Accepted connection from {}", client_addr);
            self.serve(stream).await?;
        }

        Ok(())
    }

    /// Connect to the target and pump the session to completion. Both
    /// streams are dropped on every path out of here.
    async fn serve(&self, inbound: TcpStream) -> Result<(), AdaptorError> {
        debug!("Connecting to target {}", self.target_addr);
        let outbound = TcpStream::connect(self.target_addr)
            .await
            .map_err(|source| AdaptorError::Connect {
                address: self.target_addr,
                source,
            })?;

        let peers = Peer::new(inbound, self.read_chunk_size)
            .and_then(|listener| Ok((listener, Peer::new(outbound, self.read_chunk_size)?)));
        let (listener_peer, target_peer) = match peers {
            Ok(peers) => peers,
            Err(e) => {
                warn!("Connection closed before the session could start: {}", e);
                return Ok(());
            }
        };

        let session = RelaySession::new(&self.state, listener_peer, target_peer, self.tick_interval);
        let stats = session.run().await?;
        self.state.set_last_stats(stats);

        Ok(())
    }

    /// Request a cooperative stop. Takes effect at the next loop check; an
    /// in-flight target connect is not interrupted.
    pub fn stop(&self) {
        if self.state.running.swap(false, Ordering::SeqCst) {
            info!("Stop requested for relay adaptor on {}", self.listen_addr);
        }
    }

    /// Write `data` to the listener-side peer of the active session.
    ///
    /// Waits until the payload is written (`true`), or the adaptor stops or a
    /// new session discards it (`false`).
    pub async fn inject_to_listener(&self, data: impl Into<Bytes>) -> bool {
        self.inject(Direction::ListenerToTarget, data.into()).await
    }

    /// Write `data` to the target peer of the active session; see
    /// [`Adaptor::inject_to_listener`]
    pub async fn inject_to_target(&self, data: impl Into<Bytes>) -> bool {
        self.inject(Direction::TargetToListener, data.into()).await
    }

    async fn inject(&self, direction: Direction, data: Bytes) -> bool {
        let len = data.len();
        let item = self.state.queue(direction).enqueue(data);

        loop {
            match item.state() {
                SendState::Done => return true,
                SendState::Discarded => {
                    debug!("Injected payload of {} bytes was discarded", len);
                    return false;
                }
                SendState::Pending => {}
            }

            if !self.is_running() {
                return item.is_done();
            }

            sleep(self.tick_interval).await;
        }
    }
}

impl std::fmt::Debug for Adaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adaptor")
            .field("listen_addr", &self.listen_addr)
            .field("target_addr", &self.target_addr)
            .field("tick_interval", &self.tick_interval)
            .field("read_chunk_size", &self.read_chunk_size)
            .field("running", &self.is_running())
            .finish()
    }
}
