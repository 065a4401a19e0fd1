use crate::api::types::MemberInfo;
use crate::membership::{GossipSender, MembershipStore, NodeId, NodeRole};
use crate::server::ShutdownHandle;
use crate::storage::{
    BlockLocations, BlockStore, DeleteOutput, Freshness, GetOutput, LocalBlock, PutOutput, StorageClient,
    StorageClientError,
};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

/// Handle to a running node. Dropping it stops every loop the node runs.
pub struct ClusterNode {
    logger: slog::Logger,
    gossip_addr: SocketAddr,
    store: Arc<MembershipStore>,
    client: StorageClient,
    gossip: GossipSender,
    blocks: BlockStore,
    shutdown_handle: ShutdownHandle,
}

impl ClusterNode {
    pub(super) fn new(
        logger: slog::Logger,
        gossip_addr: SocketAddr,
        store: Arc<MembershipStore>,
        client: StorageClient,
        gossip: GossipSender,
        blocks: BlockStore,
        shutdown_handle: ShutdownHandle,
    ) -> Self {
        ClusterNode {
            logger,
            gossip_addr,
            store,
            client,
            gossip,
            blocks,
            shutdown_handle,
        }
    }

    pub fn id(&self) -> &NodeId {
        self.store.self_id()
    }

    /// Other nodes join the cluster by naming this address as their introducer.
    pub fn gossip_addr(&self) -> SocketAddr {
        self.gossip_addr
    }

    // ----- storage -----

    /// Store the file at `local_path` under `name`, replacing any previous version.
    pub async fn put(&self, local_path: &Path, name: &str) -> Result<PutOutput, StorageClientError> {
        self.client.put(local_path, name).await
    }

    /// Fetch `name` into `local_path`, first waiting (bounded) for pending replicas to settle.
    pub async fn get(&self, name: &str, local_path: &Path) -> Result<GetOutput, StorageClientError> {
        self.client.get(name, local_path, Freshness::Strong).await
    }

    pub async fn get_with_freshness(
        &self,
        name: &str,
        local_path: &Path,
        freshness: Freshness,
    ) -> Result<GetOutput, StorageClientError> {
        self.client.get(name, local_path, freshness).await
    }

    pub async fn delete(&self, name: &str) -> Result<DeleteOutput, StorageClientError> {
        self.client.delete(name).await
    }

    pub async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageClientError> {
        self.client.list_by_prefix(prefix).await
    }

    pub async fn size_by_prefix(&self, prefix: &str) -> Result<u64, StorageClientError> {
        self.client.size_by_prefix(prefix).await
    }

    /// Replicas of each block of `name`, without pending slots. `None` if the file is unknown.
    pub async fn locate(&self, name: &str) -> Result<Option<BlockLocations>, StorageClientError> {
        self.client.locate(name).await
    }

    /// Have each of `targets` download `name` into its download directory. Returns the targets
    /// that took the request; the downloads themselves finish in the background.
    pub async fn multi_read(&self, name: &str, targets: &[NodeId]) -> Vec<NodeId> {
        self.client.multi_read(name, targets).await
    }

    /// Blocks hosted on this node.
    pub async fn local_blocks(&self) -> io::Result<Vec<LocalBlock>> {
        self.blocks.list().await
    }

    // ----- membership -----

    pub fn current_leader(&self) -> Option<NodeId> {
        self.store.current_leader()
    }

    pub fn current_role(&self) -> NodeRole {
        self.store.current_role()
    }

    pub fn random_k_alive_peers(&self, k: usize) -> Vec<NodeId> {
        self.store.random_alive_peers(k)
    }

    pub fn membership_snapshot(&self) -> Vec<MemberInfo> {
        let leadership = self.store.leadership();
        let mut members: Vec<MemberInfo> = self
            .store
            .snapshot()
            .into_iter()
            .map(|member| {
                let role = leadership.role_of(&member.id);
                MemberInfo::new(member, role)
            })
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    pub fn self_member(&self) -> Option<MemberInfo> {
        let role = self.store.current_role();
        self.store.self_member().map(|member| MemberInfo::new(member, role))
    }

    /// Turn suspicion on or off here and on every member this node knows of.
    pub async fn set_suspicion(&self, enabled: bool) -> io::Result<()> {
        slog::info!(self.logger, "Setting suspicion to {}", enabled);
        self.gossip.broadcast_suspicion(enabled).await
    }

    /// Probability in [0, 1] that this node ignores an inbound gossip datagram.
    pub fn set_message_drop_rate(&self, rate: f64) -> Result<(), &'static str> {
        if !(0.0..=1.0).contains(&rate) {
            return Err("Message drop rate must be within [0, 1]");
        }
        self.store.set_message_drop_rate(rate);
        Ok(())
    }

    /// Announce a voluntary departure to every live member, then stop.
    pub async fn leave(self) {
        let targets = self.store.mark_self_left();
        if let Err(e) = self.gossip.push_snapshot(&targets).await {
            slog::warn!(self.logger, "Failed to announce leave: {:?}", e);
        }
        slog::info!(self.logger, "Left the cluster");
        self.shutdown_handle.shutdown();
    }

    pub fn shutdown(&self) {
        self.shutdown_handle.shutdown();
    }
}
