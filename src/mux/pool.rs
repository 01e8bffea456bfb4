//! Tunnel pool.
//!
//! Keeps a fixed number of tunnels to the relay, each owned by its own
//! supervisor task that dials, serves and re-dials it forever. New flows
//! are spread over the live tunnels round robin and all of them share one
//! flow table.
//!
//! ```text
//!   SOCKS5 ──▶ handle_new_flow ──▶ select_tunnel ──▶ FlowTable::allocate
//!                                       │
//!        ┌──────────────┬───────────────┴──┐
//!        ▼              ▼                  ▼
//!    slot 0         slot 1     ...     slot N-1     (supervisor per slot)
//!        ▲              ▲                  ▲
//!        └──── keepalive task pings every live tunnel ────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::mux::table::{FlowHandle, FlowTable};
use crate::mux::tunnel::Tunnel;
use crate::proxy::{LocalReader, LocalWriter, RequestHandler, SocksRequest, TargetAddr};
use crate::stats::PoolStats;
use crate::transport::Dialer;

/// A pool of tunnels sharing one flow table.
pub struct Pool {
    config: Arc<ClientConfig>,
    dialer: Arc<dyn Dialer>,
    table: Arc<FlowTable>,
    tunnels: RwLock<Vec<Option<Arc<Tunnel>>>>,
    cursor: Mutex<usize>,
    stats: Arc<PoolStats>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Create an idle pool. Nothing is dialed until [`Pool::start`].
    pub fn new(config: ClientConfig, dialer: Arc<dyn Dialer>) -> Result<Arc<Self>> {
        config.validate()?;

        let stats = Arc::new(PoolStats::new());
        let table = Arc::new(FlowTable::new(
            config.flow_capacity,
            config.quota_threshold,
            config.local_write_timeout,
            Arc::clone(&stats),
        )?);
        let tunnels = RwLock::new(vec![None; config.tunnel_count]);

        Ok(Arc::new(Self {
            config: Arc::new(config),
            dialer,
            table,
            tunnels,
            cursor: Mutex::new(0),
            stats,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Get the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Get the shared flow table.
    pub fn table(&self) -> &Arc<FlowTable> {
        &self.table
    }

    /// Get the statistics.
    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }

    /// Tunnel currently installed in `slot`.
    pub fn tunnel(&self, slot: usize) -> Option<Arc<Tunnel>> {
        self.tunnels.read().get(slot).cloned().flatten()
    }

    /// Spawn one supervisor per tunnel slot and the keepalive task.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        for slot in 0..self.config.tunnel_count {
            let pool = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                pool.supervise(slot).await;
            }));
        }

        let pool = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            pool.run_keepalive().await;
        }));

        tracing::info!(
            "tunnel pool started: {} tunnels, {} flow slots",
            self.config.tunnel_count,
            self.table.capacity()
        );
    }

    async fn supervise(&self, slot: usize) {
        loop {
            tracing::debug!("tunnel {} dialing", slot);
            let conn = match self.dialer.dial().await {
                Ok(conn) => conn,
                Err(e) => {
                    self.stats.dial_failed();
                    tracing::warn!(
                        "tunnel {} dial failed, retry in {:?}: {}",
                        slot,
                        self.config.dial_retry_delay,
                        e
                    );
                    tokio::time::sleep(self.config.dial_retry_delay).await;
                    continue;
                }
            };

            self.stats.tunnel_connected();
            let tunnel = Arc::new(Tunnel::new(
                slot,
                conn.sink,
                Arc::clone(&self.table),
                self.config.max_missed_pongs,
                self.config.tunnel_write_timeout,
            ));
            self.install(slot, Some(Arc::clone(&tunnel)));
            tracing::info!("tunnel {} connected", slot);

            tunnel.serve(conn.source).await;

            self.install(slot, None);
            tracing::info!(
                "tunnel {} broken, reconnect in {:?}",
                slot,
                self.config.reconnect_delay
            );
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    async fn run_keepalive(&self) {
        loop {
            tokio::time::sleep(self.config.keepalive_interval).await;
            self.keepalive().await;
        }
    }

    /// Ping every live tunnel once. Tunnels are pinged concurrently so a
    /// stalled one cannot hold back the others.
    pub async fn keepalive(&self) {
        let live: Vec<Arc<Tunnel>> = self
            .tunnels
            .read()
            .iter()
            .flatten()
            .filter(|t| t.is_live())
            .cloned()
            .collect();

        join_all(live.iter().map(|tunnel| tunnel.keepalive())).await;
        tracing::debug!("pool stats: {:?}", self.stats.snapshot());
    }

    pub(crate) fn install(&self, slot: usize, tunnel: Option<Arc<Tunnel>>) {
        let mut tunnels = self.tunnels.write();
        if let Some(entry) = tunnels.get_mut(slot) {
            *entry = tunnel;
        }
    }

    /// Pick the next live tunnel, round robin from the cursor.
    pub fn select_tunnel(&self) -> Result<Arc<Tunnel>> {
        let tunnels = self.tunnels.read();
        let len = tunnels.len();
        if len == 0 {
            return Err(Error::NoTunnelAvailable);
        }

        let mut cursor = self.cursor.lock();
        let start = *cursor % len;
        for offset in 0..len {
            let i = (start + offset) % len;
            if let Some(tunnel) = &tunnels[i] {
                if tunnel.is_live() {
                    *cursor = (i + 1) % len;
                    return Ok(Arc::clone(tunnel));
                }
            }
        }
        Err(Error::NoTunnelAvailable)
    }

    /// Admit a SOCKS5 request: pick a tunnel, take a slot, answer the
    /// client and start relaying.
    ///
    /// On an admission error the request is dropped without a reply.
    pub async fn handle_new_flow(&self, request: SocksRequest) -> Result<()> {
        let tunnel = match self.select_tunnel() {
            Ok(tunnel) => tunnel,
            Err(e) => {
                self.stats.flow_rejected();
                tracing::warn!("no tunnel for {}, dropping request", request.target());
                return Err(e);
            }
        };

        let target = request.target().clone();
        let handle = match self.table.allocate(target.clone(), Arc::clone(&tunnel)) {
            Ok(handle) => handle,
            Err(e) => {
                self.stats.flow_rejected();
                tracing::warn!("cannot admit {}: {}", target, e);
                return Err(e);
            }
        };

        let (reader, writer) = match request.accept().await {
            Ok(halves) => halves,
            Err(e) => {
                let _ = self.table.release(handle.index, handle.generation).await;
                return Err(e);
            }
        };

        self.start_relay(tunnel, handle, target, reader, writer).await;
        Ok(())
    }

    /// Bind the accepted socket to its slot and spawn the outbound relay.
    ///
    /// The client already got its success reply, so a slot that was torn
    /// down in the meantime (tunnel lost) just drops the socket.
    async fn start_relay(
        &self,
        tunnel: Arc<Tunnel>,
        handle: FlowHandle,
        target: TargetAddr,
        reader: LocalReader,
        writer: LocalWriter,
    ) {
        let flow = match self.table.lookup(handle.index, handle.generation) {
            Ok(flow) => flow,
            Err(e) => {
                tracing::debug!("flow {} gone before relay start: {}", handle, e);
                return;
            }
        };
        let stop = match flow.attach(handle.generation, writer).await {
            Ok(stop) => stop,
            Err(e) => {
                tracing::debug!("flow {} gone before relay start: {}", handle, e);
                return;
            }
        };
        self.stats.flow_admitted();
        tracing::debug!("flow {} to {} on tunnel {}", handle, target, tunnel.id());

        let table = Arc::clone(&self.table);
        tokio::spawn(flow.relay_outbound(table, tunnel, handle, target, reader, stop));
    }

    /// Stop all supervisors, close every tunnel and free every flow.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        let tunnels: Vec<Arc<Tunnel>> = self
            .tunnels
            .write()
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        for tunnel in &tunnels {
            tunnel.close();
        }

        self.table.drain_all().await;
        tracing::info!("tunnel pool stopped");
    }
}

#[async_trait]
impl RequestHandler for Pool {
    async fn handle_request(&self, request: SocksRequest) -> Result<()> {
        self.handle_new_flow(request).await
    }
}
