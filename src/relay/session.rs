//! Relay Session
//!
//! Owns one accepted connection and one target connection and pumps bytes
//! between them, tick by tick, until either side goes away or the adaptor
//! is stopped.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::adaptor::AdaptorState;
use super::hook::{Action, Direction};
use super::peer::Peer;
use crate::error::AdaptorError;

/// Per-direction traffic counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionStats {
    pub chunks: u64,
    pub bytes: u64,
    pub passed: u64,
    pub bounced: u64,
    pub dropped: u64,
}

/// Statistics for a finished relay session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: Uuid,
    pub listener_addr: SocketAddr,
    pub target_addr: SocketAddr,
    pub start_time: SystemTime,
    pub duration_ms: u64,
    pub listener_to_target: DirectionStats,
    pub target_to_listener: DirectionStats,
    pub injected_to_listener: u64,
    pub injected_to_target: u64,
}

impl SessionStats {
    fn new(listener_addr: SocketAddr, target_addr: SocketAddr) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            listener_addr,
            target_addr,
            start_time: SystemTime::now(),
            duration_ms: 0,
            listener_to_target: DirectionStats::default(),
            target_to_listener: DirectionStats::default(),
            injected_to_listener: 0,
            injected_to_target: 0,
        }
    }

    pub fn direction(&self, direction: Direction) -> &DirectionStats {
        match direction {
            Direction::ListenerToTarget => &self.listener_to_target,
            Direction::TargetToListener => &self.target_to_listener,
        }
    }

    fn direction_mut(&mut self, direction: Direction) -> &mut DirectionStats {
        match direction {
            Direction::ListenerToTarget => &mut self.listener_to_target,
            Direction::TargetToListener => &mut self.target_to_listener,
        }
    }

    fn record_decision(&mut self, direction: Direction, len: usize, action: Action) {
        let stats = self.direction_mut(direction);
        stats.chunks += 1;
        stats.bytes += len as u64;
        match action {
            Action::Pass => stats.passed += 1,
            Action::Back => stats.bounced += 1,
            Action::Stop => stats.dropped += 1,
        }
    }

    fn record_injection(&mut self, direction: Direction) {
        match direction {
            Direction::ListenerToTarget => self.injected_to_listener += 1,
            Direction::TargetToListener => self.injected_to_target += 1,
        }
    }

    /// Log session statistics
    pub fn log(&self) {
        info!(
            session_id = %self.session_id,
            listener_addr = %self.listener_addr,
            target_addr = %self.target_addr,
            duration_ms = self.duration_ms,
            up_chunks = self.listener_to_target.chunks,
            up_bytes = self.listener_to_target.bytes,
            down_chunks = self.target_to_listener.chunks,
            down_bytes = self.target_to_listener.bytes,
            injected_to_listener = self.injected_to_listener,
            injected_to_target = self.injected_to_target,
            "Relay session ended"
        );
    }
}

/// Why a tick could not complete
enum TickError {
    Socket(io::Error),
    Hook(AdaptorError),
}

impl From<io::Error> for TickError {
    fn from(e: io::Error) -> Self {
        TickError::Socket(e)
    }
}

/// The duplex pump for one accepted connection
pub struct RelaySession<'a> {
    state: &'a AdaptorState,
    listener: Peer,
    target: Peer,
    tick: Duration,
    started: Instant,
    stats: SessionStats,
}

impl<'a> RelaySession<'a> {
    pub(crate) fn new(state: &'a AdaptorState, listener: Peer, target: Peer, tick: Duration) -> Self {
        let stats = SessionStats::new(listener.addr(), target.addr());
        debug!(
            "Creating relay session {} ({} <-> {})",
            stats.session_id,
            listener.addr(),
            target.addr()
        );

        Self {
            state,
            listener,
            target,
            tick,
            started: Instant::now(),
            stats,
        }
    }

    fn is_live(&self) -> bool {
        self.state.is_running() && self.listener.is_connected() && self.target.is_connected()
    }

    /// Run the pump to completion.
    ///
    /// Socket faults end the session quietly. A hook failure also ends it and
    /// is returned once both sockets are closed.
    pub async fn run(mut self) -> Result<SessionStats, AdaptorError> {
        info!(
            "Relay session {} started: {} <-> {}",
            self.stats.session_id,
            self.listener.addr(),
            self.target.addr()
        );

        let mut failure = None;

        while self.is_live() {
            if let Err(e) = self.tick_once().await {
                match e {
                    TickError::Socket(e) => {
                        warn!("Relay session {} socket fault: {}", self.stats.session_id, e);
                    }
                    TickError::Hook(e) => failure = Some(e),
                }
                break;
            }

            sleep(self.tick).await;
        }

        self.stats.duration_ms = self.started.elapsed().as_millis() as u64;
        let RelaySession {
            listener,
            target,
            stats,
            ..
        } = self;

        listener.shutdown().await;
        target.shutdown().await;
        stats.log();

        match failure {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    /// One pass of the pump: listener side first, then target side
    async fn tick_once(&mut self) -> Result<(), TickError> {
        self.service(Direction::ListenerToTarget).await?;
        self.service(Direction::TargetToListener).await
    }

    /// Returns (side the chunk is read from, the other side)
    fn peers(&mut self, direction: Direction) -> (&mut Peer, &mut Peer) {
        match direction {
            Direction::ListenerToTarget => (&mut self.listener, &mut self.target),
            Direction::TargetToListener => (&mut self.target, &mut self.listener),
        }
    }

    async fn service(&mut self, direction: Direction) -> Result<(), TickError> {
        let chunk = self.peers(direction).0.drain()?;

        if chunk.is_empty() {
            // Injection only gets the socket on ticks with no inbound bytes
            return self.service_queue(direction).await;
        }

        self.intercept(direction, chunk).await
    }

    async fn intercept(&mut self, direction: Direction, chunk: Bytes) -> Result<(), TickError> {
        let len = chunk.len();
        let hook = self.state.hook(direction);
        let decision = hook
            .intercept(chunk)
            .map_err(|source| TickError::Hook(AdaptorError::Hook { direction, source }))?;

        debug!(
            "Session {} {}: {} bytes in, {:?} with {} bytes",
            self.stats.session_id,
            direction,
            len,
            decision.action,
            decision.data.len()
        );
        self.stats.record_decision(direction, len, decision.action);

        let (source, other) = self.peers(direction);
        match decision.action {
            Action::Pass => other.write(&decision.data).await?,
            Action::Back => source.write(&decision.data).await?,
            Action::Stop => {}
        }

        Ok(())
    }

    async fn service_queue(&mut self, direction: Direction) -> Result<(), TickError> {
        let Some(item) = self.state.queue(direction).dequeue_one() else {
            return Ok(());
        };

        let (source, _) = self.peers(direction);
        let addr = source.addr();
        if let Err(e) = source.write(item.payload()).await {
            item.mark_discarded();
            return Err(e.into());
        }
        item.mark_done();

        debug!(
            "Session {} injected {} bytes toward {}",
            self.stats.session_id,
            item.payload().len(),
            addr
        );
        self.stats.record_injection(direction);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::hook::Decision;
    use crate::relay::queue::SendState;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(10);

    /// Returns (accepted side, connecting side)
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    /// Session peers plus the far ends: the listener's client and the target server
    async fn session_sockets() -> (Peer, Peer, TcpStream, TcpStream) {
        let (accepted, listener_client) = socket_pair().await;
        let (target_server, outbound) = socket_pair().await;
        (
            Peer::new(accepted, 1024).unwrap(),
            Peer::new(outbound, 1024).unwrap(),
            listener_client,
            target_server,
        )
    }

    async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_listener_side_serviced_before_target_side() {
        let state = AdaptorState::new();
        state.set_running(true);
        let calls = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&calls);
        state.set_hook(
            Direction::ListenerToTarget,
            Arc::new(move |chunk: Bytes| {
                seen.lock().unwrap().push(Direction::ListenerToTarget);
                Decision::pass(chunk)
            }),
        );
        let seen = Arc::clone(&calls);
        state.set_hook(
            Direction::TargetToListener,
            Arc::new(move |chunk: Bytes| {
                seen.lock().unwrap().push(Direction::TargetToListener);
                Decision::pass(chunk)
            }),
        );

        let (listener, target, mut listener_client, mut target_server) = session_sockets().await;

        // Both sides hold data before the first tick, the target side first
        target_server.write_all(b"down").await.unwrap();
        listener_client.write_all(b"up").await.unwrap();
        sleep(Duration::from_millis(50)).await;

        let session = RelaySession::new(&state, listener, target, TICK);
        let (result, _) = tokio::join!(session.run(), async move {
            assert_eq!(read_exactly(&mut target_server, 2).await, b"up");
            assert_eq!(read_exactly(&mut listener_client, 4).await, b"down");
        });

        result.unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            vec![Direction::ListenerToTarget, Direction::TargetToListener]
        );
    }

    #[tokio::test]
    async fn test_inbound_bytes_delay_injection_to_a_quiet_tick() {
        let state = AdaptorState::new();
        state.set_running(true);
        let item = state
            .queue(Direction::ListenerToTarget)
            .enqueue(Bytes::from_static(b"inj"));

        // State of the queued item each time a hook sees a chunk
        let observed = Arc::new(Mutex::new(Vec::new()));
        for direction in [Direction::ListenerToTarget, Direction::TargetToListener] {
            let item = Arc::clone(&item);
            let observed = Arc::clone(&observed);
            state.set_hook(
                direction,
                Arc::new(move |chunk: Bytes| {
                    observed.lock().unwrap().push(item.state());
                    Decision::pass(chunk)
                }),
            );
        }

        let (listener, target, mut listener_client, mut target_server) = session_sockets().await;
        listener_client.write_all(b"busy").await.unwrap();
        target_server.write_all(b"down").await.unwrap();
        sleep(Duration::from_millis(50)).await;

        let session = RelaySession::new(&state, listener, target, TICK);
        let (result, _) = tokio::join!(session.run(), async move {
            assert_eq!(read_exactly(&mut target_server, 4).await, b"busy");
            // Relayed chunk from the first tick, then the injection on the next
            assert_eq!(read_exactly(&mut listener_client, 7).await, b"downinj");
        });

        let stats = result.unwrap();
        assert_eq!(
            *observed.lock().unwrap(),
            vec![SendState::Pending, SendState::Pending]
        );
        assert!(item.is_done());
        assert_eq!(stats.injected_to_listener, 1);
        assert!(state.queue(Direction::ListenerToTarget).is_empty());
    }

    #[tokio::test]
    async fn test_session_ends_when_adaptor_stops() {
        let state = AdaptorState::new();
        state.set_running(true);
        let (listener, target, _listener_client, _target_server) = session_sockets().await;

        let session = RelaySession::new(&state, listener, target, TICK);
        let (result, _) = tokio::join!(session.run(), async {
            sleep(Duration::from_millis(30)).await;
            state.set_running(false);
        });

        let stats = result.unwrap();
        assert_eq!(stats.listener_to_target, DirectionStats::default());
    }
}
