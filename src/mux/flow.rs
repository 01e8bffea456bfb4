//! A single proxied connection multiplexed over a tunnel.
//!
//! Inbound segments are queued by sequence number and drained to the local
//! socket strictly in order. Only one drain runs per flow at a time: a push
//! that finds a drain in progress just queues its segment, and the running
//! drain picks it up before it stops.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::mux::frame::Frame;
use crate::mux::reorder::ReorderQueue;
use crate::mux::table::{FlowHandle, FlowTable};
use crate::mux::tunnel::Tunnel;
use crate::proxy::{LocalReader, LocalWriter, TargetAddr};
use crate::stats::PoolStats;

/// Largest chunk read from a local socket into one data frame.
pub const READ_CHUNK_SIZE: usize = 4096;

/// What the tunnel has to do with a flow after an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Flow stays open
    Keep,
    /// Flow is finished; free its slot
    Release,
    /// Local socket failed; abort the flow toward the relay and free its slot
    Terminate,
}

/// Point-in-time view of a flow's protocol state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSnapshot {
    /// Slot is occupied
    pub used: bool,
    /// Current generation tag
    pub generation: u16,
    /// Next inbound sequence to deliver
    pub expected_sequence: u32,
    /// Final sequence announced by the relay
    pub last_sequence: u32,
    /// Write side closes once `last_sequence` is reached
    pub pending_half_close: bool,
    /// Slot is freed once `last_sequence` is reached
    pub pending_full_close: bool,
    /// Segments waiting in the reorder queue
    pub queued: usize,
}

struct FlowState {
    used: bool,
    generation: u16,
    target: Option<TargetAddr>,
    tunnel: Option<Arc<Tunnel>>,
    expected_seq: u32,
    last_seq: u32,
    pending_half_close: bool,
    pending_full_close: bool,
    quota_tick: u16,
    queue: ReorderQueue,
    draining: bool,
    stop: Option<oneshot::Sender<()>>,
}

struct LocalSide {
    generation: u16,
    writer: Option<LocalWriter>,
    write_closed: bool,
}

/// Resources detached from a flow when its slot is retired.
pub(crate) struct Retired {
    pub tunnel: Option<Arc<Tunnel>>,
    pub stop: Option<oneshot::Sender<()>>,
}

enum DrainStep {
    Deliver(Bytes, Option<Arc<Tunnel>>),
    Idle { close_write: bool, release: bool },
}

/// One flow slot. Created once per slot and recycled for every connection
/// that occupies it.
pub struct Flow {
    index: u16,
    quota_threshold: u16,
    write_timeout: Duration,
    stats: Arc<PoolStats>,
    state: Mutex<FlowState>,
    local: tokio::sync::Mutex<LocalSide>,
}

impl Flow {
    pub(crate) fn new(
        index: u16,
        quota_threshold: u16,
        write_timeout: Duration,
        stats: Arc<PoolStats>,
    ) -> Self {
        Self {
            index,
            quota_threshold,
            write_timeout,
            stats,
            state: Mutex::new(FlowState {
                used: false,
                generation: 0,
                target: None,
                tunnel: None,
                expected_seq: 0,
                last_seq: 0,
                pending_half_close: false,
                pending_full_close: false,
                quota_tick: 0,
                queue: ReorderQueue::new(),
                draining: false,
                stop: None,
            }),
            local: tokio::sync::Mutex::new(LocalSide {
                generation: 0,
                writer: None,
                write_closed: true,
            }),
        }
    }

    /// Slot index of this flow.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Check if the slot is in use by the given generation.
    pub fn is_current(&self, generation: u16) -> bool {
        let st = self.state.lock();
        st.used && st.generation == generation
    }

    /// Generation of the current occupant, if the slot is in use.
    pub fn current_generation(&self) -> Option<u16> {
        let st = self.state.lock();
        st.used.then_some(st.generation)
    }

    /// Destination of the current occupant.
    pub fn target(&self) -> Option<TargetAddr> {
        self.state.lock().target.clone()
    }

    /// Get a snapshot of the protocol state.
    pub fn snapshot(&self) -> FlowSnapshot {
        let st = self.state.lock();
        FlowSnapshot {
            used: st.used,
            generation: st.generation,
            expected_sequence: st.expected_seq,
            last_sequence: st.last_seq,
            pending_half_close: st.pending_half_close,
            pending_full_close: st.pending_full_close,
            queued: st.queue.len(),
        }
    }

    /// Mark the slot used by a new connection. Returns the new generation.
    pub(crate) fn occupy(&self, target: TargetAddr, tunnel: Arc<Tunnel>) -> u16 {
        let mut st = self.state.lock();
        debug_assert!(!st.used, "free list handed out a used slot");

        st.generation = st.generation.wrapping_add(1);
        st.used = true;
        st.target = Some(target);
        st.tunnel = Some(tunnel);
        st.expected_seq = 0;
        st.last_seq = 0;
        st.pending_half_close = false;
        st.pending_full_close = false;
        st.quota_tick = 0;
        st.queue.clear();
        st.draining = false;
        st.stop = None;
        st.generation
    }

    /// Mark the slot unused if `generation` is the current occupant.
    pub(crate) fn retire(&self, generation: u16) -> Result<Retired> {
        let mut st = self.state.lock();
        if !st.used || st.generation != generation {
            return Err(Error::StaleReference {
                index: self.index,
                generation,
            });
        }

        st.generation = st.generation.wrapping_add(1);
        st.used = false;
        st.target = None;
        st.pending_half_close = false;
        st.pending_full_close = false;
        st.queue.clear();

        Ok(Retired {
            tunnel: st.tunnel.take(),
            stop: st.stop.take(),
        })
    }

    /// Hand the local socket's write side to the flow.
    ///
    /// Returns the receiver that fires when the flow is released, so the
    /// local read loop can stop.
    pub async fn attach(
        &self,
        generation: u16,
        writer: LocalWriter,
    ) -> Result<oneshot::Receiver<()>> {
        let mut local = self.local.lock().await;
        let (stop_tx, stop_rx) = oneshot::channel();
        {
            let mut st = self.state.lock();
            if !st.used || st.generation != generation {
                return Err(Error::StaleReference {
                    index: self.index,
                    generation,
                });
            }
            st.stop = Some(stop_tx);
        }

        local.generation = generation;
        local.writer = Some(writer);
        local.write_closed = false;
        Ok(stop_rx)
    }

    /// Queue an inbound segment and deliver whatever is now in order.
    pub async fn on_data(&self, generation: u16, seq: u32, data: Bytes) -> Disposition {
        {
            let mut st = self.state.lock();
            if !st.used || st.generation != generation {
                return Disposition::Keep;
            }
            st.queue.push(seq, data);
            if st.draining {
                return Disposition::Keep;
            }
            st.draining = true;
        }

        self.drain(generation).await
    }

    /// The relay will send nothing past `last_seq`.
    pub async fn on_server_finished(&self, generation: u16, last_seq: u32) {
        let close_now = {
            let mut st = self.state.lock();
            if !st.used || st.generation != generation {
                return;
            }
            st.last_seq = last_seq;
            if st.expected_seq >= last_seq {
                true
            } else {
                st.pending_half_close = true;
                tracing::debug!(
                    "flow {}:{} half close pending, expected {} last {}",
                    self.index,
                    generation,
                    st.expected_seq,
                    last_seq
                );
                false
            }
        };

        if close_now {
            self.close_write(generation).await;
        }
    }

    /// The relay closed the flow after `last_seq`.
    ///
    /// Returns true if everything was delivered and the slot can be freed
    /// now; otherwise the close is deferred until draining reaches
    /// `last_seq` and [`Flow::on_data`] returns [`Disposition::Release`].
    pub fn on_server_closed(&self, generation: u16, last_seq: u32) -> bool {
        let mut st = self.state.lock();
        if !st.used || st.generation != generation {
            return false;
        }
        st.last_seq = last_seq;
        if st.expected_seq >= last_seq {
            return true;
        }

        st.pending_full_close = true;
        tracing::debug!(
            "flow {}:{} close pending, expected {} last {}",
            self.index,
            generation,
            st.expected_seq,
            last_seq
        );
        false
    }

    async fn drain(&self, generation: u16) -> Disposition {
        loop {
            let step = {
                let mut st = self.state.lock();
                if !st.used || st.generation != generation {
                    return Disposition::Keep;
                }

                let next = match st.queue.peek_min() {
                    Some(seq) if seq == st.expected_seq => st.queue.pop_min(),
                    _ => None,
                };

                match next {
                    Some((_, data)) => {
                        st.expected_seq = st.expected_seq.wrapping_add(1);
                        st.quota_tick += 1;
                        let report = if st.quota_tick >= self.quota_threshold {
                            st.quota_tick = 0;
                            st.tunnel.clone()
                        } else {
                            None
                        };
                        DrainStep::Deliver(data, report)
                    }
                    None => {
                        // Clearing the flag under the same lock that checked
                        // the queue means no concurrent push is missed.
                        st.draining = false;
                        let drained = st.expected_seq >= st.last_seq;
                        let close_write = st.pending_half_close && drained;
                        let release = st.pending_full_close && drained;
                        if close_write {
                            st.pending_half_close = false;
                        }
                        if release {
                            st.pending_full_close = false;
                        }
                        DrainStep::Idle {
                            close_write,
                            release,
                        }
                    }
                }
            };

            match step {
                DrainStep::Deliver(data, report) => {
                    if let Err(e) = self.write_local(generation, &data).await {
                        tracing::warn!(
                            "flow {}:{} local write failed, force close: {}",
                            self.index,
                            generation,
                            e
                        );
                        self.stop_draining(generation);
                        return Disposition::Terminate;
                    }
                    self.stats.add_bytes_to_local(data.len() as u64);

                    if let Some(tunnel) = report {
                        let frame = Frame::quota(self.index, generation, self.quota_threshold);
                        if let Err(e) = tunnel.send_frame(&frame).await {
                            tracing::debug!(
                                "flow {}:{} quota report failed: {}",
                                self.index,
                                generation,
                                e
                            );
                        }
                    }
                }
                DrainStep::Idle {
                    close_write,
                    release,
                } => {
                    if close_write {
                        self.close_write(generation).await;
                    }
                    return if release {
                        Disposition::Release
                    } else {
                        Disposition::Keep
                    };
                }
            }
        }
    }

    fn stop_draining(&self, generation: u16) {
        let mut st = self.state.lock();
        if st.used && st.generation == generation {
            st.draining = false;
        }
    }

    async fn write_local(&self, generation: u16, data: &[u8]) -> Result<()> {
        let mut local = self.local.lock().await;
        if local.generation != generation || local.write_closed {
            return Err(Error::LocalSocket(io::Error::new(
                io::ErrorKind::NotConnected,
                "local socket closed",
            )));
        }

        let result = match local.writer.as_mut() {
            Some(writer) => write_with_deadline(writer, data, self.write_timeout).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "local socket closed",
            )),
        };

        if result.is_err() {
            // Dropping the writer closes the socket.
            local.writer = None;
            local.write_closed = true;
        }
        result.map_err(Error::LocalSocket)
    }

    /// Shut down the local write side once. Later calls are no-ops.
    async fn close_write(&self, generation: u16) {
        let mut local = self.local.lock().await;
        if local.generation != generation || local.write_closed {
            return;
        }
        local.write_closed = true;

        if let Some(writer) = local.writer.as_mut() {
            match tokio::time::timeout(self.write_timeout, writer.shutdown()).await {
                Ok(Ok(())) => {
                    tracing::debug!("flow {}:{} local write side closed", self.index, generation)
                }
                Ok(Err(e)) => tracing::debug!(
                    "flow {}:{} local shutdown failed: {}",
                    self.index,
                    generation,
                    e
                ),
                Err(_) => {
                    tracing::debug!("flow {}:{} local shutdown timed out", self.index, generation)
                }
            }
        }
    }

    /// Close the local socket owned by `generation`.
    pub(crate) async fn close_local(&self, generation: u16) {
        let writer = {
            let mut local = self.local.lock().await;
            if local.generation != generation {
                return;
            }
            local.write_closed = true;
            local.writer.take()
        };

        if let Some(mut writer) = writer {
            let _ = tokio::time::timeout(self.write_timeout, writer.shutdown()).await;
        }
    }

    /// Relay local bytes to the tunnel until EOF, error or release.
    pub(crate) async fn relay_outbound(
        self: Arc<Self>,
        table: Arc<FlowTable>,
        tunnel: Arc<Tunnel>,
        handle: FlowHandle,
        target: TargetAddr,
        mut reader: LocalReader,
        mut stop: oneshot::Receiver<()>,
    ) {
        let created = match Frame::created(handle.index, handle.generation, &target) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("flow {} cannot announce {}: {}", handle, target, e);
                tunnel.terminate_flow(handle.index, handle.generation).await;
                return;
            }
        };
        if let Err(e) = tunnel.send_frame(&created).await {
            tracing::warn!("flow {} create failed: {}", handle, e);
            let _ = table.release(handle.index, handle.generation).await;
            return;
        }

        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let read = tokio::select! {
                _ = &mut stop => {
                    tracing::debug!("flow {} released, local read loop stops", handle);
                    break;
                }
                read = reader.read(&mut buf) => read,
            };

            if !self.is_current(handle.generation) {
                tracing::debug!("flow {} already freed, discarding local read", handle);
                break;
            }

            match read {
                Ok(0) => {
                    tracing::debug!("flow {} local half close", handle);
                    let frame = Frame::client_finished(handle.index, handle.generation);
                    if let Err(e) = tunnel.send_frame(&frame).await {
                        tracing::warn!("flow {} half close send failed: {}", handle, e);
                        let _ = table.release(handle.index, handle.generation).await;
                    }
                    break;
                }
                Ok(n) => {
                    let frame = Frame::outbound_data(handle.index, handle.generation, &buf[..n]);
                    if let Err(e) = tunnel.send_frame(&frame).await {
                        tracing::warn!("flow {} send failed, force free: {}", handle, e);
                        let _ = table.release(handle.index, handle.generation).await;
                        break;
                    }
                    self.stats.add_bytes_to_remote(n as u64);
                }
                Err(e) => {
                    tracing::debug!("flow {} local read failed: {}", handle, e);
                    tunnel.terminate_flow(handle.index, handle.generation).await;
                    break;
                }
            }
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("index", &self.index)
            .field("state", &self.snapshot())
            .finish()
    }
}

/// Write all of `buf`, giving every single write attempt `deadline`.
async fn write_with_deadline(
    writer: &mut LocalWriter,
    mut buf: &[u8],
    deadline: Duration,
) -> io::Result<()> {
    while !buf.is_empty() {
        let n = tokio::time::timeout(deadline, writer.write(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "local write timed out"))??;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "local socket closed"));
        }
        buf = &buf[n..];
    }
    Ok(())
}
