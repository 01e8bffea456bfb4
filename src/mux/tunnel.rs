//! One multiplexed connection to the relay.
//!
//! A tunnel owns the sending half of a transport connection behind a write
//! lock, dispatches inbound frames to flows and tracks liveness with pings.
//! It also keeps a registry of the flows bound to it so that losing the
//! connection releases exactly those flows.
//!
//! ```text
//!  relay ──▶ serve() ──▶ on_message() ──▶ FlowTable::lookup ──▶ Flow
//!    ▲                                                            │
//!    └──────────── send_frame() (write lock) ◀────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::mux::flow::Disposition;
use crate::mux::frame::{Command, Frame};
use crate::mux::table::{FlowHandle, FlowTable};
use crate::transport::{FrameSink, FrameSource, WireMessage};

/// A live tunnel connection.
pub struct Tunnel {
    id: usize,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    table: Arc<FlowTable>,
    /// index -> generation of flows bound to this tunnel
    flows: Mutex<HashMap<u16, u16>>,
    waiting_pings: AtomicU32,
    max_missed_pongs: u32,
    write_timeout: Duration,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Tunnel {
    /// Wrap the sending half of a fresh connection.
    ///
    /// A write that cannot finish within `write_timeout`, waiting for the
    /// write lock included, closes the tunnel.
    pub fn new(
        id: usize,
        sink: Box<dyn FrameSink>,
        table: Arc<FlowTable>,
        max_missed_pongs: u32,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id,
            sink: tokio::sync::Mutex::new(sink),
            table,
            flows: Mutex::new(HashMap::new()),
            waiting_pings: AtomicU32::new(0),
            max_missed_pongs,
            write_timeout,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Pool slot this tunnel occupies.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Check if the tunnel can still carry frames.
    pub fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Number of flows bound to this tunnel.
    pub fn flow_count(&self) -> usize {
        self.flows.lock().len()
    }

    /// Pings sent since the last pong.
    pub fn waiting_pings(&self) -> u32 {
        self.waiting_pings.load(Ordering::SeqCst)
    }

    pub(crate) fn remember(&self, handle: FlowHandle) {
        self.flows.lock().insert(handle.index, handle.generation);
    }

    pub(crate) fn forget(&self, handle: FlowHandle) {
        let mut flows = self.flows.lock();
        if flows.get(&handle.index) == Some(&handle.generation) {
            flows.remove(&handle.index);
        }
    }

    /// Encode and send one frame under the write lock.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.write(WireMessage::Binary(frame.encode())).await
    }

    async fn write(&self, msg: WireMessage) -> Result<()> {
        if !self.is_live() {
            return Err(Error::transport(format!("tunnel {} is closed", self.id)));
        }

        let sent = tokio::time::timeout(self.write_timeout, async {
            let mut sink = self.sink.lock().await;
            sink.send(msg).await
        })
        .await;

        match sent {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "tunnel {} write stalled for {:?}, closing",
                    self.id,
                    self.write_timeout
                );
                self.close();
                Err(Error::transport(format!("tunnel {} write timed out", self.id)))
            }
        }
    }

    /// Force the connection down. The serve loop notices and cleans up.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("tunnel {} closing", self.id);
        }
        self.shutdown.notify_one();
    }

    /// Send a ping, or close the tunnel once more than
    /// `max_missed_pongs` went unanswered.
    ///
    /// The ping counts as outstanding before it is written, so a stalled
    /// sink still moves the tunnel toward closure.
    pub async fn keepalive(&self) {
        if !self.is_live() {
            return;
        }

        let waiting = self.waiting_pings.load(Ordering::SeqCst);
        if waiting > self.max_missed_pongs {
            tracing::warn!("tunnel {} missed {} pongs, closing", self.id, waiting);
            self.close();
            return;
        }
        self.waiting_pings.fetch_add(1, Ordering::SeqCst);

        let payload = Bytes::copy_from_slice(&unix_millis().to_le_bytes());
        if let Err(e) = self.write(WireMessage::Ping(payload)).await {
            tracing::debug!("tunnel {} ping failed: {}", self.id, e);
        }
    }

    fn on_pong(&self, payload: &[u8]) {
        self.waiting_pings.store(0, Ordering::SeqCst);
        if let Ok(sent) = <[u8; 8]>::try_from(payload) {
            let rtt = unix_millis().saturating_sub(u64::from_le_bytes(sent));
            tracing::debug!("tunnel {} rtt {}ms", self.id, rtt);
        }
    }

    /// Abort a flow toward the relay and free its slot.
    pub async fn terminate_flow(&self, index: u16, generation: u16) {
        if let Err(e) = self
            .send_frame(&Frame::client_closed(index, generation))
            .await
        {
            tracing::debug!("tunnel {} close notice for {}:{} failed: {}", self.id, index, generation, e);
        }
        if let Err(e) = self.table.release(index, generation).await {
            tracing::debug!("tunnel {} terminate: {}", self.id, e);
        }
    }

    /// Dispatch inbound messages until the connection ends, then release
    /// every flow bound to this tunnel.
    pub async fn serve(&self, mut source: Box<dyn FrameSource>) {
        tracing::debug!("tunnel {} serving", self.id);

        loop {
            let next = tokio::select! {
                _ = self.shutdown.notified() => break,
                next = source.recv() => next,
            };

            match next {
                Ok(Some(WireMessage::Binary(data))) => {
                    if let Err(e) = self.on_message(data).await {
                        tracing::warn!("tunnel {} dropped: {}", self.id, e);
                        break;
                    }
                }
                // Only transports without their own ping handling pass these up.
                Ok(Some(WireMessage::Ping(payload))) => {
                    if let Err(e) = self.write(WireMessage::Pong(payload)).await {
                        tracing::debug!("tunnel {} pong failed: {}", self.id, e);
                    }
                }
                Ok(Some(WireMessage::Pong(payload))) => self.on_pong(&payload),
                Ok(None) => {
                    tracing::info!("tunnel {} closed by relay", self.id);
                    break;
                }
                Err(e) => {
                    tracing::warn!("tunnel {} read failed: {}", self.id, e);
                    break;
                }
            }
        }

        self.on_close().await;
    }

    async fn on_close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let flows: Vec<(u16, u16)> = self.flows.lock().drain().collect();
        tracing::info!("tunnel {} down, releasing {} flows", self.id, flows.len());

        for (index, generation) in flows {
            if let Err(e) = self.table.release(index, generation).await {
                tracing::debug!("tunnel {} cleanup: {}", self.id, e);
            }
        }

        let closed = tokio::time::timeout(self.write_timeout, async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        })
        .await;
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("tunnel {} close failed: {}", self.id, e),
            Err(_) => tracing::debug!("tunnel {} close timed out", self.id),
        }
    }

    /// Handle one binary message. Only a malformed header is fatal.
    async fn on_message(&self, data: Bytes) -> Result<()> {
        let frame = Frame::decode(data)?;
        let (index, generation) = (frame.index, frame.generation);

        match frame.command {
            Command::Data => {
                let (seq, payload) = match frame.sequenced() {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!("tunnel {} flow {}:{}: {}", self.id, index, generation, e);
                        return Ok(());
                    }
                };
                let flow = match self.table.lookup(index, generation) {
                    Ok(flow) => flow,
                    Err(e) => {
                        tracing::debug!("tunnel {} dropping data: {}", self.id, e);
                        return Ok(());
                    }
                };
                let disposition = flow.on_data(generation, seq, payload).await;
                self.apply(index, generation, disposition).await;
            }
            Command::ServerFinished => {
                let last_seq = match frame.final_sequence() {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!("tunnel {} flow {}:{}: {}", self.id, index, generation, e);
                        return Ok(());
                    }
                };
                match self.table.lookup(index, generation) {
                    Ok(flow) => flow.on_server_finished(generation, last_seq).await,
                    Err(e) => tracing::debug!("tunnel {} dropping half close: {}", self.id, e),
                }
            }
            Command::ServerClosed => {
                let last_seq = match frame.final_sequence() {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!("tunnel {} flow {}:{}: {}", self.id, index, generation, e);
                        return Ok(());
                    }
                };
                let release_now = match self.table.lookup(index, generation) {
                    Ok(flow) => flow.on_server_closed(generation, last_seq),
                    Err(e) => {
                        tracing::debug!("tunnel {} dropping close: {}", self.id, e);
                        false
                    }
                };
                if release_now {
                    self.apply(index, generation, Disposition::Release).await;
                }
            }
            Command::ClientClosed => {
                // Relay aborted the flow.
                self.apply(index, generation, Disposition::Release).await;
            }
            other => {
                tracing::debug!(
                    "tunnel {} ignoring command {} for {}:{}",
                    self.id,
                    other.as_u8(),
                    index,
                    generation
                );
            }
        }
        Ok(())
    }

    async fn apply(&self, index: u16, generation: u16, disposition: Disposition) {
        match disposition {
            Disposition::Keep => {}
            Disposition::Release => {
                if let Err(e) = self.table.release(index, generation).await {
                    tracing::debug!("tunnel {} release: {}", self.id, e);
                }
            }
            Disposition::Terminate => self.terminate_flow(index, generation).await,
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::test_util;
    use crate::transport::memory::MemoryPeer;
    use tokio::io::AsyncReadExt;
    use tokio::task::JoinHandle;

    fn spawn_serve(tunnel: &Arc<Tunnel>, source: Box<dyn FrameSource>) -> JoinHandle<()> {
        let tunnel = Arc::clone(tunnel);
        tokio::spawn(async move { tunnel.serve(source).await })
    }

    async fn next_frame(peer: &mut MemoryPeer) -> Frame {
        Frame::decode(peer.recv_binary().await.expect("frame")).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_reorders_data() {
        let table = test_util::table(2);
        let (tunnel, source, peer) = test_util::tunnel(&table, 0);
        let (h, _flow, mut remote) = test_util::open_flow(&table, &tunnel).await;
        let _serve = spawn_serve(&tunnel, source);

        peer.send_binary(Frame::data(h.index, h.generation, 1, b"world").encode());
        peer.send_binary(Frame::data(h.index, h.generation, 0, b"hello ").encode());

        let mut buf = [0u8; 11];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn test_stale_and_unknown_frames_ignored() {
        let table = test_util::table(2);
        let (tunnel, source, peer) = test_util::tunnel(&table, 0);
        let (h, flow, mut remote) = test_util::open_flow(&table, &tunnel).await;
        let _serve = spawn_serve(&tunnel, source);

        peer.send_binary(Frame::data(h.index, h.generation + 1, 0, b"stale").encode());
        peer.send_binary(Bytes::from_static(&[0x42, 0, 0, 1, 0, 1, 2, 3]));
        peer.send_binary(Frame::data(h.index, h.generation, 0, b"ok").encode());

        let mut buf = [0u8; 2];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        assert!(tunnel.is_live());
        assert!(flow.is_current(h.generation));
    }

    #[tokio::test]
    async fn test_deferred_full_close_releases_once() {
        let table = test_util::table(2);
        let (tunnel, source, peer) = test_util::tunnel(&table, 0);
        let (h, flow, mut remote) = test_util::open_flow(&table, &tunnel).await;
        let serve = spawn_serve(&tunnel, source);

        peer.send_binary(Frame::server_closed(h.index, h.generation, 2).encode());
        peer.send_binary(Frame::data(h.index, h.generation, 1, b"b").encode());
        peer.send_binary(Frame::data(h.index, h.generation, 0, b"a").encode());

        let mut all = Vec::new();
        remote.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"ab");
        assert_eq!(flow.snapshot().generation, h.generation + 1);
        assert!(table.lookup(h.index, h.generation).is_err());
        assert_eq!(table.free_count(), 2);
        assert_eq!(tunnel.flow_count(), 0);

        drop(peer);
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_finished_closes_write_side() {
        let table = test_util::table(2);
        let (tunnel, source, peer) = test_util::tunnel(&table, 0);
        let (h, flow, mut remote) = test_util::open_flow(&table, &tunnel).await;
        let _serve = spawn_serve(&tunnel, source);

        peer.send_binary(Frame::data(h.index, h.generation, 0, b"bye").encode());
        peer.send_binary(Frame::server_finished(h.index, h.generation, 1).encode());

        let mut all = Vec::new();
        remote.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"bye");
        // Half close keeps the slot.
        assert!(flow.is_current(h.generation));
    }

    #[tokio::test]
    async fn test_relay_abort_releases_flow() {
        let table = test_util::table(2);
        let (tunnel, source, peer) = test_util::tunnel(&table, 0);
        let (h, _flow, mut remote) = test_util::open_flow(&table, &tunnel).await;
        let _serve = spawn_serve(&tunnel, source);

        peer.send_binary(Frame::client_closed(h.index, h.generation).encode());

        let mut all = Vec::new();
        remote.read_to_end(&mut all).await.unwrap();
        assert!(all.is_empty());
        assert!(table.lookup(h.index, h.generation).is_err());
    }

    #[tokio::test]
    async fn test_short_header_tears_tunnel_down() {
        let table = test_util::table(2);
        let (tunnel, source, peer) = test_util::tunnel(&table, 0);
        let (_h, _flow, mut remote) = test_util::open_flow(&table, &tunnel).await;
        let serve = spawn_serve(&tunnel, source);

        peer.send_binary(Bytes::from_static(&[1, 0, 0]));
        serve.await.unwrap();

        assert!(!tunnel.is_live());
        assert_eq!(table.used_count(), 0);
        let mut all = Vec::new();
        remote.read_to_end(&mut all).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_peer_loss_releases_only_own_flows() {
        let table = test_util::table(4);
        let (first, source, peer) = test_util::tunnel(&table, 0);
        let (second, _other_source, _other_peer) = test_util::tunnel(&table, 1);

        let (a, _fa, _ra) = test_util::open_flow(&table, &first).await;
        let (b, _fb, _rb) = test_util::open_flow(&table, &second).await;
        let serve = spawn_serve(&first, source);

        drop(peer);
        serve.await.unwrap();

        assert!(table.lookup(a.index, a.generation).is_err());
        assert!(table.lookup(b.index, b.generation).is_ok());
        assert!(first.send_frame(&Frame::quota(0, 0, 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_local_failure_sends_abort() {
        let table = test_util::table(2);
        let (tunnel, source, mut peer) = test_util::tunnel(&table, 0);
        let (h, _flow, remote) = test_util::open_flow(&table, &tunnel).await;
        let _serve = spawn_serve(&tunnel, source);
        drop(remote);

        peer.send_binary(Frame::data(h.index, h.generation, 0, b"lost").encode());

        let frame = next_frame(&mut peer).await;
        assert_eq!(frame.command, Command::ClientClosed);
        assert_eq!((frame.index, frame.generation), (h.index, h.generation));
    }

    #[tokio::test]
    async fn test_answers_ping() {
        let table = test_util::table(1);
        let (tunnel, source, mut peer) = test_util::tunnel(&table, 0);
        let _serve = spawn_serve(&tunnel, source);

        peer.send(WireMessage::Ping(Bytes::from_static(b"t0")));
        assert_eq!(
            peer.recv().await,
            Some(WireMessage::Pong(Bytes::from_static(b"t0")))
        );
    }

    #[tokio::test]
    async fn test_missed_pongs_close_tunnel() {
        let table = test_util::table(1);
        let (tunnel, source, mut peer) = test_util::tunnel(&table, 0);
        let serve = spawn_serve(&tunnel, source);

        for _ in 0..3 {
            tunnel.keepalive().await;
        }
        assert_eq!(tunnel.waiting_pings(), 3);

        let ping = match peer.recv().await {
            Some(WireMessage::Ping(payload)) => payload,
            other => panic!("expected ping, got {:?}", other),
        };
        assert_eq!(ping.len(), 8);

        // A pong resets the counter.
        peer.send(WireMessage::Pong(ping));
        while tunnel.waiting_pings() != 0 {
            tokio::task::yield_now().await;
        }

        // Four unanswered pings are tolerated, the fifth tick closes.
        for _ in 0..4 {
            tunnel.keepalive().await;
        }
        assert_eq!(tunnel.waiting_pings(), 4);
        assert!(tunnel.is_live());

        tunnel.keepalive().await;
        assert!(!tunnel.is_live());
        serve.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_closes_tunnel() {
        let table = test_util::table(2);
        let (tunnel, source, _peer) = test_util::stalled_tunnel(&table, 0);
        let (h, _flow, mut remote) = test_util::open_flow(&table, &tunnel).await;
        let serve = spawn_serve(&tunnel, source);

        let err = tunnel
            .send_frame(&Frame::quota(h.index, h.generation, 20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(!tunnel.is_live());

        // Teardown finishes even though the sink never closes.
        serve.await.unwrap();
        assert!(table.lookup(h.index, h.generation).is_err());
        assert_eq!(tunnel.flow_count(), 0);
        let mut all = Vec::new();
        remote.read_to_end(&mut all).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_with_write_lock_held() {
        let table = test_util::table(2);
        let (tunnel, source, _peer) = test_util::stalled_tunnel(&table, 0);
        let (h, _flow, _remote) = test_util::open_flow(&table, &tunnel).await;
        let serve = spawn_serve(&tunnel, source);

        let writer = Arc::clone(&tunnel);
        let stuck = tokio::spawn(async move {
            writer.send_frame(&Frame::client_finished(h.index, h.generation)).await
        });
        tokio::task::yield_now().await;

        tunnel.close();
        serve.await.unwrap();
        assert!(table.lookup(h.index, h.generation).is_err());
        assert!(stuck.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_counts_ping_on_stalled_sink() {
        let table = test_util::table(1);
        let (tunnel, _source, _peer) = test_util::stalled_tunnel(&table, 0);

        tunnel.keepalive().await;
        assert_eq!(tunnel.waiting_pings(), 1);
        assert!(!tunnel.is_live());
    }
}
