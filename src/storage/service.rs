use crate::storage::block_store;
use crate::storage::client::{Freshness, StorageClient};
use crate::storage::follower::Follower;
use crate::storage::leader::LeaderService;
use crate::storage::wire::{self, Connection, Operation, TaskHeader};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;

/// Routes one inbound storage connection to the follower, the directory, or a forced read.
pub(crate) struct StorageService {
    logger: slog::Logger,
    follower: Follower,
    leader: LeaderService,
    client: StorageClient,
    download_directory: PathBuf,
    header_timeout: Duration,
}

impl StorageService {
    pub(crate) fn new(
        logger: slog::Logger,
        follower: Follower,
        leader: LeaderService,
        client: StorageClient,
        download_directory: PathBuf,
        header_timeout: Duration,
    ) -> Self {
        StorageService {
            logger,
            follower,
            leader,
            client,
            download_directory,
            header_timeout,
        }
    }

    pub(crate) async fn handle_connection(self: Arc<Self>, mut conn: Connection) {
        let header: TaskHeader = match tokio::time::timeout(self.header_timeout, wire::read_line(&mut conn)).await {
            Ok(Ok(header)) => header,
            Ok(Err(e)) => {
                slog::warn!(self.logger, "Bad task header: {}", e);
                return;
            }
            Err(_) => {
                slog::warn!(self.logger, "Timed out waiting for a task header");
                return;
            }
        };
        if let Err(e) = wire::send_handshake(conn.get_mut()).await {
            slog::warn!(self.logger, "Could not acknowledge {:?}: {}", header.operation, e);
            return;
        }

        if header.is_ack {
            self.leader.handle_ack(header).await;
            return;
        }

        let logger = self.logger.new(slog::o!(
            "File" => header.file_name.clone(),
            "Block" => header.block_index
        ));
        let operation = header.operation;
        let result = match operation {
            Operation::Read => self.follower.serve_read(&mut conn, header).await,
            Operation::Write => self.follower.serve_write(&mut conn, header).await,
            Operation::Delete => self.follower.serve_delete(header).await,
            Operation::DirectoryQuery | Operation::PrefixList | Operation::PrefixSize => {
                self.leader.answer(&mut conn, &header).await.map_err(Into::into)
            }
            Operation::ForceRead => {
                self.spawn_forced_read(header.file_name);
                Ok(())
            }
        };

        if let Err(e) = result {
            slog::warn!(logger, "{:?} failed: {}", operation, e);
        }
    }

    fn spawn_forced_read(&self, file_name: String) {
        let client = self.client.clone();
        let logger = self.logger.clone();
        let destination = self.download_directory.join(block_store::flat_name(&file_name));
        tokio::spawn(async move {
            match client.get(&file_name, &destination, Freshness::Strong).await {
                Ok(output) => slog::info!(
                    logger,
                    "Fetched '{}' into {} ({} bytes)",
                    file_name,
                    destination.display(),
                    output.bytes_written
                ),
                Err(e) => slog::warn!(logger, "Forced read of '{}' failed: {}", file_name, e),
            }
        });
    }
}
