//! Flow multiplexing over a pool of tunnels.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                            Pool                             │
//! │  ┌────────────┐  ┌────────────┐          ┌────────────┐     │
//! │  │  Tunnel 0  │  │  Tunnel 1  │   ...    │ Tunnel N-1 │     │
//! │  └─────┬──────┘  └─────┬──────┘          └─────┬──────┘     │
//! │        └───────────────┼───────────────────────┘            │
//! │                        ▼                                    │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │                     FlowTable                         │  │
//! │  │  • fixed slots, FIFO free list                        │  │
//! │  │  • generation tags reject stale frames                │  │
//! │  │  • per-flow reorder queue and close state             │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod flow;
pub mod frame;
pub mod pool;
pub mod reorder;
pub mod table;
pub mod tunnel;

pub use flow::{Disposition, Flow, FlowSnapshot};
pub use frame::{Command, Frame, FRAME_HEADER_SIZE};
pub use pool::Pool;
pub use reorder::ReorderQueue;
pub use table::{FlowHandle, FlowTable};
pub use tunnel::Tunnel;

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    use super::{Flow, FlowHandle, FlowTable, Tunnel};
    use crate::error::Result;
    use crate::proxy::TargetAddr;
    use crate::stats::PoolStats;
    use crate::transport::memory::{self, MemoryPeer};
    use crate::transport::{FrameSink, FrameSource, WireMessage};

    pub const TUNNEL_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn table(capacity: usize) -> Arc<FlowTable> {
        let stats = Arc::new(PoolStats::new());
        Arc::new(FlowTable::new(capacity, 20, Duration::from_secs(1), stats).unwrap())
    }

    pub fn tunnel(
        table: &Arc<FlowTable>,
        id: usize,
    ) -> (Arc<Tunnel>, Box<dyn FrameSource>, MemoryPeer) {
        let (conn, peer) = memory::pair();
        let tunnel = Arc::new(Tunnel::new(
            id,
            conn.sink,
            Arc::clone(table),
            3,
            TUNNEL_WRITE_TIMEOUT,
        ));
        (tunnel, conn.source, peer)
    }

    /// Sink whose writes and close never complete.
    pub struct StalledSink;

    #[async_trait]
    impl FrameSink for StalledSink {
        async fn send(&mut self, _msg: WireMessage) -> Result<()> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            std::future::pending().await
        }
    }

    /// Tunnel that reads normally but whose writes hang.
    pub fn stalled_tunnel(
        table: &Arc<FlowTable>,
        id: usize,
    ) -> (Arc<Tunnel>, Box<dyn FrameSource>, MemoryPeer) {
        let (conn, peer) = memory::pair();
        let tunnel = Arc::new(Tunnel::new(
            id,
            Box::new(StalledSink),
            Arc::clone(table),
            3,
            TUNNEL_WRITE_TIMEOUT,
        ));
        (tunnel, conn.source, peer)
    }

    pub fn target() -> TargetAddr {
        TargetAddr::Domain("example.com".into(), 443)
    }

    /// Allocate a flow whose local socket is one end of a duplex pipe.
    /// The other end is returned for the test to read.
    pub async fn open_flow(
        table: &Arc<FlowTable>,
        tunnel: &Arc<Tunnel>,
    ) -> (FlowHandle, Arc<Flow>, DuplexStream) {
        let handle = table.allocate(target(), Arc::clone(tunnel)).unwrap();
        let flow = table.lookup(handle.index, handle.generation).unwrap();

        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (_reader, writer) = tokio::io::split(local);
        let _stop = flow.attach(handle.generation, Box::new(writer)).await.unwrap();
        (handle, flow, remote)
    }
}
