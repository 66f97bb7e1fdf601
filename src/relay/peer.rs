//! Relay Peer
//!
//! Thin wrapper around one connected `TcpStream` giving the relay pump the
//! non-blocking drain / write / liveness operations it needs.

use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

pub struct Peer {
    stream: TcpStream,
    addr: SocketAddr,
    scratch: Vec<u8>,
    closed: bool,
}

impl Peer {
    pub fn new(stream: TcpStream, read_chunk_size: usize) -> io::Result<Self> {
        let addr = stream.peer_addr()?;
        Ok(Self {
            stream,
            addr,
            scratch: vec![0u8; read_chunk_size.max(1)],
            closed: false,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// False once end-of-stream or a socket error has been observed
    pub fn is_connected(&self) -> bool {
        !self.closed
    }

    /// Read everything currently buffered on the socket without waiting.
    ///
    /// Returns an empty chunk when nothing is pending. Bytes received ahead
    /// of an end-of-stream are still returned; the peer is flagged closed
    /// and the next liveness check ends the session.
    pub fn drain(&mut self) -> io::Result<Bytes> {
        let mut chunk = BytesMut::new();

        while !self.closed {
            match self.stream.try_read(&mut self.scratch) {
                Ok(0) => {
                    debug!("Peer {} closed its side of the connection", self.addr);
                    self.closed = true;
                }
                Ok(n) => chunk.extend_from_slice(&self.scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.closed = true;
                    if chunk.is_empty() {
                        return Err(e);
                    }
                    debug!("Read error on {} after {} bytes: {}", self.addr, chunk.len(), e);
                    break;
                }
            }
        }

        Ok(chunk.freeze())
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let result = match self.stream.write_all(data).await {
            Ok(()) => self.stream.flush().await,
            Err(e) => Err(e),
        };

        if result.is_err() {
            self.closed = true;
        }
        result
    }

    /// Close the write half; errors are irrelevant at this point
    pub async fn shutdown(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, Duration};

    async fn pair() -> (Peer, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Peer::new(server, 16).unwrap(), client)
    }

    #[tokio::test]
    async fn test_drain_empty_when_idle() {
        let (mut peer, _client) = pair().await;
        let chunk = peer.drain().unwrap();
        assert!(chunk.is_empty());
        assert!(peer.is_connected());
    }

    #[tokio::test]
    async fn test_drain_collects_more_than_one_read() {
        let (mut peer, mut client) = pair().await;
        let payload = vec![0xABu8; 100];
        client.write_all(&payload).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        // Scratch buffer is 16 bytes, so this spans several reads
        let chunk = peer.drain().unwrap();
        assert_eq!(&chunk[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_drain_marks_closed_on_eof() {
        let (mut peer, mut client) = pair().await;
        client.write_all(b"bye").await.unwrap();
        drop(client);
        sleep(Duration::from_millis(50)).await;

        let chunk = peer.drain().unwrap();
        assert_eq!(&chunk[..], b"bye");
        assert!(!peer.is_connected());
    }
}
