use crate::membership::member::NodeId;
use crate::membership::store::MembershipStore;
use crate::membership::wire::GossipMessage;
use crate::server::ShutdownSignal;
use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::{Duration, Instant};

const MAX_DATAGRAM: usize = 64 * 1024;

/// Sends gossip datagrams from the node's UDP socket.
#[derive(Clone)]
pub(crate) struct GossipSender {
    logger: slog::Logger,
    socket: Arc<UdpSocket>,
    store: Arc<MembershipStore>,
}

impl GossipSender {
    pub(crate) fn new(logger: slog::Logger, socket: Arc<UdpSocket>, store: Arc<MembershipStore>) -> Self {
        GossipSender { logger, socket, store }
    }

    /// Bump our heartbeat and push the whole snapshot to each target.
    pub(crate) async fn push_snapshot(&self, targets: &[NodeId]) -> io::Result<()> {
        let addrs: Vec<SocketAddr> = targets.iter().filter_map(|id| id.gossip_addr()).collect();
        self.push_snapshot_to_addrs(&addrs).await
    }

    async fn push_snapshot_to_addrs(&self, addrs: &[SocketAddr]) -> io::Result<()> {
        if addrs.is_empty() {
            return Ok(());
        }
        let message = GossipMessage::Snapshot(self.store.prepare_push());
        let payload = message
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        for addr in addrs {
            self.send(*addr, &payload).await;
        }

        Ok(())
    }

    /// Flip suspicion locally and on every member we know of.
    pub(crate) async fn broadcast_suspicion(&self, enabled: bool) -> io::Result<()> {
        self.store.set_suspicion_enabled(enabled);
        let payload = GossipMessage::SetSuspicion(enabled)
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        for id in self.store.broadcast_targets() {
            if let Some(addr) = id.gossip_addr() {
                self.send(addr, &payload).await;
            }
        }

        Ok(())
    }

    async fn send(&self, addr: SocketAddr, payload: &[u8]) {
        if let Err(e) = self.socket.send_to(payload, addr).await {
            // Datagram loss is routine; the failure detector decides what it means.
            slog::debug!(self.logger, "Gossip to {} failed: {:?}", addr, e);
        }
    }
}

/// Pushes the membership snapshot to `fanout` random peers every `interval`. While the node knows
/// nobody, it keeps knocking on the introducer instead.
pub(crate) struct Disseminator {
    sender: GossipSender,
    store: Arc<MembershipStore>,
    introducer: Option<SocketAddr>,
    fanout: usize,
    interval: Duration,
}

impl Disseminator {
    pub(crate) fn new(
        sender: GossipSender,
        store: Arc<MembershipStore>,
        introducer: Option<SocketAddr>,
        fanout: usize,
        interval: Duration,
    ) -> Self {
        Disseminator {
            sender,
            store,
            introducer,
            fanout,
            interval,
        }
    }

    pub(crate) async fn run(self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => {
                    slog::info!(self.sender.logger, "Gossip disseminator stopped");
                    return;
                }
            }

            let targets = self.store.gossip_targets(self.fanout);
            let result = match (targets.is_empty(), self.introducer) {
                (true, Some(introducer)) => self.sender.push_snapshot_to_addrs(&[introducer]).await,
                _ => self.sender.push_snapshot(&targets).await,
            };
            if let Err(e) = result {
                slog::error!(self.sender.logger, "Failed to build gossip snapshot: {:?}", e);
            }
        }
    }
}

/// Applies inbound datagrams to the membership store.
pub(crate) struct Receiver {
    logger: slog::Logger,
    socket: Arc<UdpSocket>,
    store: Arc<MembershipStore>,
}

impl Receiver {
    pub(crate) fn new(logger: slog::Logger, socket: Arc<UdpSocket>, store: Arc<MembershipStore>) -> Self {
        Receiver { logger, socket, store }
    }

    pub(crate) async fn run(self, mut shutdown: ShutdownSignal) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        slog::warn!(self.logger, "Gossip receive failed: {:?}", e);
                        continue;
                    }
                },
                _ = shutdown.wait() => {
                    slog::info!(self.logger, "Gossip receiver stopped");
                    return;
                }
            };

            self.handle_datagram(&buf[..len], from);
        }
    }

    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let drop_rate = self.store.message_drop_rate();
        if drop_rate > 0.0 && rand::thread_rng().gen::<f64>() < drop_rate {
            slog::debug!(self.logger, "Dropping gossip from {}", from);
            return;
        }

        match GossipMessage::decode(datagram) {
            Ok(GossipMessage::SetSuspicion(enabled)) => {
                let previous = self.store.set_suspicion_enabled(enabled);
                if previous != enabled {
                    slog::info!(self.logger, "Suspicion {} by {}", if enabled { "enabled" } else { "disabled" }, from);
                }
            }
            Ok(GossipMessage::Snapshot(members)) => {
                let changed = self.store.merge_snapshot(members, Instant::now());
                slog::debug!(self.logger, "Merged snapshot from {} ({} changes)", from, changed);
            }
            Err(e) => slog::warn!(self.logger, "Ignoring gossip from {}: {}", from, e),
        }
    }
}
