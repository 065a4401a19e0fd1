use crate::api::node::ClusterNode;
use crate::api::options::NodeOptionsValidated;
use crate::membership::{
    self, DownNodeHandler, Disseminator, FailureDetector, GossipReceiver, GossipSender, Member, MembershipStore,
    NodeId, Thresholds,
};
use crate::server::{self, StorageServer};
use crate::storage::{
    AdmissionControl, BlockDirectory, BlockStore, ClientSettings, Follower, LeaderService, PeerClient, Rereplicator,
    StorageClient, StorageService,
};
use crate::NodeOptions;
use std::convert::TryFrom;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Instant;

// Concurrent block operations one class may run ahead of the other on this node.
const ADMISSION_BALANCE_BOUND: i32 = 3;

pub struct NodeConfig {
    /// Address peers use to reach this node. Both sockets bind to it.
    pub ip_addr: IpAddr,
    /// Port 0 picks a free port.
    pub gossip_port: u16,
    /// Port 0 picks a free port.
    pub storage_port: u16,
    /// Gossip address of any node already in the cluster. `None` starts a new cluster.
    pub introducer: Option<SocketAddr>,
    /// Where this node keeps the blocks it replicates.
    pub data_directory: PathBuf,
    /// Where forced reads land.
    pub download_directory: PathBuf,
    pub info_logger: slog::Logger,
    pub options: NodeOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeCreationError {
    #[error("Illegal options for configuring node: {0}")]
    IllegalOptions(String),
    #[error("Failed to bind socket")]
    Bind(#[source] io::Error),
    #[error("Failed to prepare directory")]
    Directory(#[source] io::Error),
}

pub async fn try_create_node(config: NodeConfig) -> Result<ClusterNode, NodeCreationError> {
    let options = NodeOptionsValidated::try_from(config.options)
        .map_err(|e| NodeCreationError::IllegalOptions(e.to_string()))?;

    tokio::fs::create_dir_all(&config.data_directory)
        .await
        .map_err(NodeCreationError::Directory)?;
    tokio::fs::create_dir_all(&config.download_directory)
        .await
        .map_err(NodeCreationError::Directory)?;

    let gossip_socket = UdpSocket::bind(SocketAddr::new(config.ip_addr, config.gossip_port))
        .await
        .map_err(NodeCreationError::Bind)?;
    let listener = TcpListener::bind(SocketAddr::new(config.ip_addr, config.storage_port))
        .await
        .map_err(NodeCreationError::Bind)?;
    let gossip_port = gossip_socket.local_addr().map_err(NodeCreationError::Bind)?.port();
    let storage_port = listener.local_addr().map_err(NodeCreationError::Bind)?.port();

    let gossip_addr = SocketAddr::new(config.ip_addr, gossip_port);
    let self_id = NodeId::from_addr(gossip_addr);
    let logger = config.info_logger.new(slog::o!("NodeId" => self_id.to_string()));
    let me = Member::new(self_id, storage_port, membership::new_incarnation());

    let store = Arc::new(MembershipStore::new(
        logger.new(slog::o!("Component" => "Membership")),
        me,
        options.num_leaders,
        Instant::now(),
    ));
    store.set_suspicion_enabled(options.suspicion_enabled);
    store.set_message_drop_rate(options.message_drop_rate);

    let (shutdown_handle, shutdown_signal) = server::shutdown_signal();

    // -- gossip --
    let gossip_socket = Arc::new(gossip_socket);
    let gossip_sender = GossipSender::new(
        logger.new(slog::o!("Component" => "GossipSender")),
        gossip_socket.clone(),
        store.clone(),
    );
    let receiver = GossipReceiver::new(
        logger.new(slog::o!("Component" => "GossipReceiver")),
        gossip_socket,
        store.clone(),
    );
    tokio::spawn(receiver.run(shutdown_signal.clone()));
    let disseminator = Disseminator::new(
        gossip_sender.clone(),
        store.clone(),
        config.introducer,
        options.gossip_fanout,
        options.gossip_interval,
    );
    tokio::spawn(disseminator.run(shutdown_signal.clone()));

    // -- storage --
    let peers = PeerClient::new(store.clone(), options.connect_timeout, options.header_timeout);
    let blocks = BlockStore::new(config.data_directory);
    let directory = Arc::new(BlockDirectory::new(options.block_size, options.replication_factor));
    let client = StorageClient::new(
        logger.new(slog::o!("Component" => "StorageClient")),
        store.clone(),
        peers.clone(),
        ClientSettings {
            block_size: options.block_size,
            replication_factor: options.replication_factor,
            poll_interval: options.poll_interval,
            poll_deadline: options.poll_deadline,
            leader_attempts: options.leader_ack_attempts,
        },
    );
    let follower = Follower::new(
        logger.new(slog::o!("Component" => "Follower")),
        blocks.clone(),
        Arc::new(AdmissionControl::new(ADMISSION_BALANCE_BOUND)),
        store.clone(),
        peers.clone(),
        options.leader_ack_attempts,
        options.poll_interval,
        options.header_timeout,
    );
    let leader = LeaderService::new(
        logger.new(slog::o!("Component" => "Leader")),
        store.clone(),
        directory.clone(),
        peers.clone(),
    );
    let service = Arc::new(StorageService::new(
        logger.new(slog::o!("Component" => "StorageService")),
        follower,
        leader,
        client.clone(),
        config.download_directory,
        options.header_timeout,
    ));
    let server = StorageServer::new(logger.new(slog::o!("Component" => "StorageServer")), service);
    tokio::spawn(server.run(listener, shutdown_signal.clone()));

    // -- failure detection --
    let rereplicator: Arc<dyn DownNodeHandler> = Arc::new(Rereplicator::new(
        logger.new(slog::o!("Component" => "Rereplicator")),
        store.clone(),
        directory,
        peers,
    ));
    FailureDetector::spawn(
        logger.new(slog::o!("Component" => "FailureDetector")),
        store.clone(),
        rereplicator,
        Thresholds {
            t_fail: options.t_fail,
            t_cleanup: options.t_cleanup,
        },
        options.scan_interval,
        shutdown_signal,
    );

    slog::info!(logger, "Node started with storage on port {}", storage_port);

    Ok(ClusterNode::new(
        logger,
        gossip_addr,
        store,
        client,
        gossip_sender,
        blocks,
        shutdown_handle,
    ))
}
