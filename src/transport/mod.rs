//! Message transports carrying tunnel frames.
//!
//! A tunnel only needs a message-oriented connection that can:
//!
//! 1. send a binary message, a ping or a pong,
//! 2. receive the next message (blocking until one arrives),
//! 3. report closure.
//!
//! ```text
//! ┌──────────────┐   FrameSink    ┌──────────────────┐
//! │    Tunnel    │ ─────────────▶ │  WebSocket (ws)  │
//! │  (dispatch)  │ ◀───────────── │  or in-memory    │
//! └──────────────┘  FrameSource   └──────────────────┘
//! ```
//!
//! The two halves are separate so the dispatch loop can block on receive
//! while flows write through the tunnel's write lock.

pub mod memory;
mod ws;

pub use ws::WsDialer;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// A transport-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Opaque binary message holding one tunnel frame
    Binary(Bytes),
    /// Liveness check
    Ping(Bytes),
    /// Liveness answer
    Pong(Bytes),
}

/// Sending half of a transport connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one message.
    async fn send(&mut self, msg: WireMessage) -> Result<()>;

    /// Close the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Receiving half of a transport connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next message. `Ok(None)` means the peer closed.
    ///
    /// The tunnel answers every ping it receives, so a transport that
    /// replies to pings by itself must not surface them.
    async fn recv(&mut self) -> Result<Option<WireMessage>>;
}

/// An established transport connection.
pub struct Connection {
    /// Sending half
    pub sink: Box<dyn FrameSink>,
    /// Receiving half
    pub source: Box<dyn FrameSource>,
}

/// Establishes transport connections to the relay.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial the relay once.
    async fn dial(&self) -> Result<Connection>;
}
