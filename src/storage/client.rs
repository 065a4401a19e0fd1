use crate::membership::{MembershipStore, NodeId};
use crate::storage::block_table;
use crate::storage::directory::BlockLocations;
use crate::storage::peer_client::{PeerClient, PeerError};
use crate::storage::wire::{self, Operation, TaskHeader};
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use std::io::{self, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::{Duration, Instant};

/// How fresh the directory must be before a read starts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// Wait (bounded) until no replica slot of the file is pending.
    Strong,
    /// Read from whatever replicas the directory lists right now.
    Available,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageClientError {
    #[error("No leader is known")]
    NoLeader,
    #[error("Leader could not be reached")]
    LeaderUnreachable,
    #[error("File '{0}' does not exist")]
    FileNotFound(String),
    #[error("No replica accepted block {0}")]
    BlockUnplaced(usize),
    #[error("Previous version of '{0}' was not removed in time")]
    OverwriteTimeout(String),
    #[error("A file of {0} bytes needs more blocks than the directory tracks")]
    FileTooLarge(u64),
    #[error("Local file I/O failed")]
    LocalIo(#[from] io::Error),
}

#[derive(Debug, PartialEq, Eq)]
pub struct PutOutput {
    /// Replicas that confirmed each block, by block index.
    pub replicas_per_block: Vec<usize>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct GetOutput {
    pub bytes_written: u64,
    /// Blocks no replica could serve. Their bytes are absent from the local file.
    pub missing_blocks: Vec<usize>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct DeleteOutput {
    pub requested: usize,
    pub unreachable: usize,
}

#[derive(Debug, thiserror::Error)]
enum TransferError {
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct ClientSettings {
    pub(crate) block_size: u64,
    pub(crate) replication_factor: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) poll_deadline: Duration,
    pub(crate) leader_attempts: usize,
}

/// Runs put/get/delete/list by asking the leader for placement and talking to replicas directly.
#[derive(Clone)]
pub(crate) struct StorageClient {
    logger: slog::Logger,
    store: Arc<MembershipStore>,
    peers: PeerClient,
    settings: ClientSettings,
}

impl StorageClient {
    pub(crate) fn new(
        logger: slog::Logger,
        store: Arc<MembershipStore>,
        peers: PeerClient,
        settings: ClientSettings,
    ) -> Self {
        StorageClient {
            logger,
            store,
            peers,
            settings,
        }
    }

    /// Store `local_path` under `name`, replacing any previous version.
    pub(crate) async fn put(&self, local_path: &Path, name: &str) -> Result<PutOutput, StorageClientError> {
        let logger = self.logger.new(slog::o!("File" => name.to_string()));
        let file_size = tokio::fs::metadata(local_path).await?.len();

        if self.locate(name).await?.is_some() {
            slog::info!(logger, "Replacing existing version");
            self.delete(name).await?;
            self.await_removal(name).await?;
        }

        let block_size = self.settings.block_size;
        let num_blocks = block_table::num_blocks(file_size, block_size);
        if num_blocks > block_table::MAX_BLOCKS_PER_FILE {
            return Err(StorageClientError::FileTooLarge(file_size));
        }
        let num_blocks = num_blocks as usize;
        let mut replicas_per_block = Vec::with_capacity(num_blocks);
        for block in 0..num_blocks {
            let offset = block as u64 * block_size;
            let len = block_size.min(file_size - offset);

            let mut pool = self.store.reachable_peers();
            pool.shuffle(&mut rand::thread_rng());
            let mut placed = 0;
            while placed < self.settings.replication_factor {
                let candidate = match pool.pop() {
                    Some(candidate) => candidate,
                    None => break,
                };
                match self
                    .send_block(&candidate, local_path, name, block, offset, len, file_size)
                    .await
                {
                    Ok(()) => placed += 1,
                    Err(e) => slog::warn!(logger, "Block {} to {} failed: {}", block, candidate, e),
                }
            }

            if placed == 0 {
                return Err(StorageClientError::BlockUnplaced(block));
            }
            if placed < self.settings.replication_factor {
                slog::warn!(logger, "Block {} has only {} replicas", block, placed);
            }
            replicas_per_block.push(placed);
        }

        // Replicas ack the leader on their own; wait until the directory shows every block.
        self.await_visible(name, &replicas_per_block).await?;
        slog::info!(logger, "Stored {} bytes in {} blocks", file_size, num_blocks);
        Ok(PutOutput { replicas_per_block })
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_block(
        &self,
        replica: &NodeId,
        local_path: &Path,
        name: &str,
        block: usize,
        offset: u64,
        len: u64,
        file_size: u64,
    ) -> Result<(), TransferError> {
        let mut header = TaskHeader::new(Operation::Write, name);
        header.data_target = Some(replica.clone());
        header.original_file_size = file_size;
        header.block_index = block as u64;
        header.data_size = len;

        let mut conn = self.peers.open_task(replica, &header).await?;
        let mut file = File::open(local_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        tokio::io::copy(&mut file.take(len), conn.get_mut()).await?;
        conn.get_mut().flush().await?;
        self.peers.expect_handshake(replica, &mut conn).await?;

        Ok(())
    }

    /// Fetch `name` into `local_path`, block by block from a random replica of each.
    pub(crate) async fn get(
        &self,
        name: &str,
        local_path: &Path,
        freshness: Freshness,
    ) -> Result<GetOutput, StorageClientError> {
        let logger = self.logger.new(slog::o!("File" => name.to_string()));
        let locations = self.locate_with(name, freshness).await?;

        let mut out = File::create(local_path).await?;
        let mut bytes_written = 0;
        let mut missing_blocks = Vec::new();
        for (block, replicas) in locations.rows.into_iter().enumerate() {
            let mut replicas = replicas;
            replicas.shuffle(&mut rand::thread_rng());

            let mut fetched = None;
            for replica in replicas {
                match self.fetch_block(&replica, name, block).await {
                    Ok(bytes) => {
                        fetched = Some(bytes);
                        break;
                    }
                    Err(e) => slog::warn!(logger, "Block {} from {} failed: {}", block, replica, e),
                }
            }

            match fetched {
                Some(bytes) => {
                    out.write_all(&bytes).await?;
                    bytes_written += bytes.len() as u64;
                }
                None => {
                    slog::warn!(logger, "No replica could serve block {}", block);
                    missing_blocks.push(block);
                }
            }
        }
        out.flush().await?;

        Ok(GetOutput {
            bytes_written,
            missing_blocks,
        })
    }

    async fn fetch_block(&self, replica: &NodeId, name: &str, block: usize) -> Result<Vec<u8>, TransferError> {
        let mut header = TaskHeader::new(Operation::Read, name);
        header.data_target = Some(replica.clone());
        header.block_index = block as u64;

        let mut conn = self.peers.open_task(replica, &header).await?;
        let reply: TaskHeader = self.peers.read_reply(replica, &mut conn).await?;
        wire::send_handshake(conn.get_mut())
            .await
            .map_err(PeerError::from)?;

        let mut bytes = vec![0u8; reply.data_size as usize];
        conn.read_exact(&mut bytes).await?;
        Ok(bytes)
    }

    /// Ask every replica of `name` to drop its blocks. Slots already pending are skipped.
    pub(crate) async fn delete(&self, name: &str) -> Result<DeleteOutput, StorageClientError> {
        let locations = self
            .locate(name)
            .await?
            .ok_or_else(|| StorageClientError::FileNotFound(name.to_string()))?;

        let mut output = DeleteOutput {
            requested: 0,
            unreachable: 0,
        };
        for (block, replicas) in locations.rows.into_iter().enumerate() {
            for replica in replicas {
                let mut header = TaskHeader::new(Operation::Delete, name);
                header.data_target = Some(replica.clone());
                header.block_index = block as u64;

                match self.peers.open_task(&replica, &header).await {
                    Ok(_) => output.requested += 1,
                    Err(e) => {
                        slog::warn!(self.logger, "Delete of block {} of '{}' on {} failed: {}", block, name, replica, e);
                        output.unreachable += 1;
                    }
                }
            }
        }

        Ok(output)
    }

    /// Instruct each target to fetch `name` into its download directory. Returns the targets that
    /// accepted.
    pub(crate) async fn multi_read(&self, name: &str, targets: &[NodeId]) -> Vec<NodeId> {
        let header = TaskHeader::new(Operation::ForceRead, name);
        let mut accepted = Vec::new();
        for target in targets {
            match self.peers.open_task(target, &header).await {
                Ok(_) => accepted.push(target.clone()),
                Err(e) => slog::warn!(self.logger, "{} refused to fetch '{}': {}", target, name, e),
            }
        }
        accepted
    }

    pub(crate) async fn locate(&self, name: &str) -> Result<Option<BlockLocations>, StorageClientError> {
        self.ask_leader(TaskHeader::new(Operation::DirectoryQuery, name)).await
    }

    pub(crate) async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageClientError> {
        self.ask_leader(TaskHeader::new(Operation::PrefixList, prefix)).await
    }

    pub(crate) async fn size_by_prefix(&self, prefix: &str) -> Result<u64, StorageClientError> {
        self.ask_leader(TaskHeader::new(Operation::PrefixSize, prefix)).await
    }

    async fn locate_with(&self, name: &str, freshness: Freshness) -> Result<BlockLocations, StorageClientError> {
        let deadline = Instant::now() + self.settings.poll_deadline;
        loop {
            let locations = self
                .locate(name)
                .await?
                .ok_or_else(|| StorageClientError::FileNotFound(name.to_string()))?;
            if freshness == Freshness::Available || locations.pending_cells == 0 {
                return Ok(locations);
            }
            if Instant::now() >= deadline {
                slog::warn!(
                    self.logger,
                    "'{}' still has {} pending replicas; reading what is available",
                    name,
                    locations.pending_cells
                );
                return Ok(locations);
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn await_visible(&self, name: &str, replicas_per_block: &[usize]) -> Result<(), StorageClientError> {
        let deadline = Instant::now() + self.settings.poll_deadline;
        loop {
            if let Some(locations) = self.locate(name).await? {
                let complete = locations
                    .rows
                    .iter()
                    .zip(replicas_per_block)
                    .all(|(row, placed)| row.len() >= *placed);
                if complete {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                slog::warn!(self.logger, "Directory has not caught up with '{}' yet", name);
                return Ok(());
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn await_removal(&self, name: &str) -> Result<(), StorageClientError> {
        let deadline = Instant::now() + self.settings.poll_deadline;
        while self.locate(name).await?.is_some() {
            if Instant::now() >= deadline {
                return Err(StorageClientError::OverwriteTimeout(name.to_string()));
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
        Ok(())
    }

    async fn ask_leader<T: DeserializeOwned>(&self, header: TaskHeader) -> Result<T, StorageClientError> {
        let mut last_error = StorageClientError::NoLeader;
        for attempt in 1..=self.settings.leader_attempts {
            if let Some(leader) = self.store.current_leader() {
                match self.query(&leader, &header).await {
                    Ok(reply) => return Ok(reply),
                    Err(e) => {
                        slog::warn!(self.logger, "Leader {} did not answer (attempt {}): {}", leader, attempt, e);
                        last_error = StorageClientError::LeaderUnreachable;
                    }
                }
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }

        Err(last_error)
    }

    async fn query<T: DeserializeOwned>(&self, leader: &NodeId, header: &TaskHeader) -> Result<T, PeerError> {
        let mut conn = self.peers.open_task(leader, header).await?;
        self.peers.read_reply(leader, &mut conn).await
    }
}
