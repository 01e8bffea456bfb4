//! # lproxy
//!
//! Client side of a SOCKS5-over-WebSocket tunnel. Local TCP connections
//! accepted by a SOCKS5 front end are multiplexed as flows over a small
//! pool of long-lived WebSocket tunnels to a relay.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │          SOCKS5 front end (CONNECT, no auth)            │
//! ├─────────────────────────────────────────────────────────┤
//! │  Pool (round robin, reconnection, keepalive)            │
//! ├─────────────────────────────────────────────────────────┤
//! │  Flow table (slots, generations, reorder, half close)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Tunnel framing (5-byte header, dispatch, ping/pong)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  Transport (WebSocket, in-memory)                       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Safety**: A recycled slot never receives data meant for its
//!    previous occupant
//! 2. **Ordering**: Each flow's bytes reach the local socket in sequence
//! 3. **Resilience**: Broken tunnels are re-dialed and their flows freed

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod mux;
pub mod proxy;
pub mod stats;
pub mod transport;

pub use config::{ClientConfig, ClientConfigFile};
pub use error::{Error, Result};
pub use mux::{FlowHandle, FlowTable, Pool, Tunnel};
pub use stats::{PoolStats, StatsSnapshot};

/// Crate version reported by the client binary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
