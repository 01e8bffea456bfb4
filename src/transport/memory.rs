//! In-process transport backed by channels.
//!
//! Used for loopback setups and tests: the client side gets an ordinary
//! [`Connection`], the other end is a [`MemoryPeer`] that plays the relay.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Connection, Dialer, FrameSink, FrameSource, WireMessage};
use crate::error::{Error, Result};

/// Create a connected client/peer pair.
pub fn pair() -> (Connection, MemoryPeer) {
    let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();

    let conn = Connection {
        sink: Box::new(MemorySink {
            tx: Some(to_peer_tx),
        }),
        source: Box::new(MemorySource { rx: to_client_rx }),
    };
    let peer = MemoryPeer {
        tx: to_client_tx,
        rx: to_peer_rx,
    };
    (conn, peer)
}

/// The relay end of an in-memory connection.
///
/// Dropping it closes the connection for the client.
pub struct MemoryPeer {
    tx: mpsc::UnboundedSender<WireMessage>,
    rx: mpsc::UnboundedReceiver<WireMessage>,
}

impl MemoryPeer {
    /// Send a message to the client. Returns false once the client is gone.
    pub fn send(&self, msg: WireMessage) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Send a binary message to the client.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.send(WireMessage::Binary(data.into()))
    }

    /// Receive the next message from the client. `None` once the client
    /// closed its sending half.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.rx.recv().await
    }

    /// Receive the next binary message, skipping pings and pongs.
    pub async fn recv_binary(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await? {
                WireMessage::Binary(data) => return Some(data),
                WireMessage::Ping(_) | WireMessage::Pong(_) => continue,
            }
        }
    }

    /// Take a message that is already queued, if any.
    pub fn try_recv(&mut self) -> Option<WireMessage> {
        self.rx.try_recv().ok()
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<WireMessage>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, msg: WireMessage) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::transport("connection closed"))?;
        tx.send(msg)
            .map_err(|_| Error::transport("peer went away"))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<WireMessage>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<WireMessage>> {
        Ok(self.rx.recv().await)
    }
}

/// Dialer handing out in-memory connections.
///
/// Every successful dial publishes the relay end on the channel returned by
/// [`MemoryDialer::new`].
pub struct MemoryDialer {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    failures: AtomicUsize,
}

impl MemoryDialer {
    /// Create a dialer and the receiver of its peers.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let dialer = Self {
            peers,
            failures: AtomicUsize::new(0),
        };
        (dialer, rx)
    }

    /// Make the next `count` dials fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> Result<Connection> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::transport("connection refused"));
        }

        let (conn, peer) = pair();
        self.peers
            .send(peer)
            .map_err(|_| Error::transport("no listener"))?;
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_exchanges_messages() {
        let (mut conn, mut peer) = pair();

        conn.sink
            .send(WireMessage::Binary(Bytes::from_static(b"up")))
            .await
            .unwrap();
        assert_eq!(peer.recv_binary().await.unwrap(), Bytes::from_static(b"up"));

        assert!(peer.send_binary(Bytes::from_static(b"down")));
        assert_eq!(
            conn.source.recv().await.unwrap(),
            Some(WireMessage::Binary(Bytes::from_static(b"down")))
        );
    }

    #[tokio::test]
    async fn test_peer_drop_closes_source() {
        let (mut conn, peer) = pair();
        drop(peer);
        assert_eq!(conn.source.recv().await.unwrap(), None);
        assert!(conn
            .sink
            .send(WireMessage::Ping(Bytes::new()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_dialer_failures() {
        let (dialer, mut peers) = MemoryDialer::new();
        dialer.fail_next(1);

        assert!(dialer.dial().await.is_err());
        assert!(dialer.dial().await.is_ok());
        assert!(peers.recv().await.is_some());
    }
}
