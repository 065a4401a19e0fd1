use crate::membership::{DownNodeHandler, MembershipStore, NodeId, NodeRole};
use crate::storage::block_table::WriteRecord;
use crate::storage::directory::{BlockDirectory, Orphan};
use crate::storage::peer_client::PeerClient;
use crate::storage::wire::{self, Connection, Operation, TaskHeader, WireError};
use rand::seq::SliceRandom;
use std::sync::Arc;

/// Directory-side half of the storage protocol. Every node runs one; only nodes in the leader
/// tier ever receive acks, so only they hold a populated directory.
pub(crate) struct LeaderService {
    logger: slog::Logger,
    store: Arc<MembershipStore>,
    directory: Arc<BlockDirectory>,
    peers: PeerClient,
}

impl LeaderService {
    pub(crate) fn new(
        logger: slog::Logger,
        store: Arc<MembershipStore>,
        directory: Arc<BlockDirectory>,
        peers: PeerClient,
    ) -> Self {
        LeaderService {
            logger,
            store,
            directory,
            peers,
        }
    }

    /// Apply a replica's ack. The acting leader re-sends it to the sub-leaders so they mirror the
    /// directory; `ack_target` marks an ack as already forwarded.
    pub(crate) async fn handle_ack(&self, header: TaskHeader) {
        self.apply_ack(&header);

        if header.ack_target.is_some() || self.store.current_role() != NodeRole::Leader {
            return;
        }
        let mut forwarded = header;
        forwarded.ack_target = Some(self.store.self_id().clone());
        for sub_leader in self.store.leadership().sub_leaders {
            let peers = self.peers.clone();
            let logger = self.logger.clone();
            let forwarded = forwarded.clone();
            tokio::spawn(async move {
                if let Err(e) = peers.open_task(&sub_leader, &forwarded).await {
                    slog::warn!(logger, "Could not mirror ack to {}: {}", sub_leader, e);
                }
            });
        }
    }

    fn apply_ack(&self, header: &TaskHeader) {
        let acker = match &header.data_target {
            Some(acker) => acker,
            None => {
                slog::warn!(self.logger, "Dropping ack without a replica: {:?}", header);
                return;
            }
        };
        let block = header.block_index as usize;

        match header.operation {
            Operation::Write => {
                let record = self.directory.apply_write_ack(
                    &header.file_name,
                    block,
                    header.original_file_size,
                    acker,
                    |id| self.store.is_gone(id),
                );
                match record {
                    WriteRecord::Recorded => slog::debug!(
                        self.logger,
                        "{} holds block {} of '{}'",
                        acker,
                        block,
                        header.file_name
                    ),
                    WriteRecord::AlreadyPresent => {}
                    other => slog::warn!(
                        self.logger,
                        "Dropped write ack from {} for block {} of '{}': {:?}",
                        acker,
                        block,
                        header.file_name,
                        other
                    ),
                }
            }
            Operation::Delete => {
                if self.directory.apply_delete_ack(&header.file_name, block, acker) {
                    slog::info!(self.logger, "'{}' fully deleted", header.file_name);
                }
            }
            other => slog::warn!(self.logger, "Ignoring ack for {:?}", other),
        }
    }

    /// Answer a directory request on `conn`.
    pub(crate) async fn answer(&self, conn: &mut Connection, header: &TaskHeader) -> Result<(), WireError> {
        let out = conn.get_mut();
        match header.operation {
            Operation::DirectoryQuery => wire::write_line(out, &self.directory.locate(&header.file_name)).await,
            Operation::PrefixList => wire::write_line(out, &self.directory.list_by_prefix(&header.file_name)).await,
            Operation::PrefixSize => wire::write_line(out, &self.directory.size_by_prefix(&header.file_name)).await,
            other => {
                slog::warn!(self.logger, "{:?} is not a directory request", other);
                Ok(())
            }
        }
    }
}

/// Restores the replication factor of blocks that lived on a node confirmed down.
pub(crate) struct Rereplicator {
    logger: slog::Logger,
    store: Arc<MembershipStore>,
    directory: Arc<BlockDirectory>,
    peers: PeerClient,
}

impl Rereplicator {
    pub(crate) fn new(
        logger: slog::Logger,
        store: Arc<MembershipStore>,
        directory: Arc<BlockDirectory>,
        peers: PeerClient,
    ) -> Self {
        Rereplicator {
            logger,
            store,
            directory,
            peers,
        }
    }

    async fn restore(&self, orphan: Orphan) {
        let logger = self.logger.new(slog::o!(
            "File" => orphan.block.file_name.clone(),
            "Block" => orphan.block.block
        ));

        let candidates: Vec<NodeId> = self
            .store
            .alive_members()
            .into_iter()
            .filter(|id| !orphan.holders.contains(id))
            .collect();
        let target = match candidates.choose(&mut rand::thread_rng()) {
            Some(target) => target.clone(),
            None => {
                slog::warn!(logger, "No live node can take a new replica; block stays pending");
                return;
            }
        };

        let mut push = TaskHeader::new(Operation::Write, orphan.block.file_name.clone());
        push.data_target = Some(target.clone());
        push.original_file_size = orphan.file_size;
        push.block_index = orphan.block.block as u64;

        let mut sources = orphan.holders;
        sources.shuffle(&mut rand::thread_rng());
        for source in sources {
            match self.peers.open_task(&source, &push).await {
                Ok(_) => {
                    slog::info!(logger, "Asked {} to copy block to {}", source, target);
                    return;
                }
                Err(e) => slog::warn!(logger, "Source {} unavailable: {}", source, e),
            }
        }

        slog::warn!(logger, "No surviving replica could be reached; block stays pending");
    }
}

#[async_trait::async_trait]
impl DownNodeHandler for Rereplicator {
    async fn handle_down(&self, node: NodeId, my_role: NodeRole) {
        let eviction = self.directory.evict(&node);
        if my_role != NodeRole::Leader {
            slog::debug!(self.logger, "Mirrored eviction of {} ({} blocks)", node, eviction.orphans.len());
            return;
        }

        for file_name in &eviction.lost_files {
            slog::warn!(self.logger, "'{}' lost its last replica with {}", file_name, node);
        }
        slog::info!(self.logger, "Re-replicating {} blocks from {}", eviction.orphans.len(), node);
        for orphan in eviction.orphans {
            self.restore(orphan).await;
        }
    }
}
