use crate::membership::{MembershipStore, NodeId};
use crate::storage::admission::{Access, AdmissionControl};
use crate::storage::block_store::BlockStore;
use crate::storage::peer_client::{PeerClient, PeerError};
use crate::storage::wire::{self, Connection, Operation, TaskHeader, WireError};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Duration;

#[derive(Debug, thiserror::Error)]
pub(crate) enum FollowerError {
    #[error("Block {1} of '{0}' is not stored here")]
    MissingBlock(String, u64),
    #[error("Expected {expected} bytes but the sender stopped after {received}")]
    Truncated { expected: u64, received: u64 },
    #[error("Local block I/O failed")]
    Io(#[from] io::Error),
    #[error("Requester exchange failed")]
    Wire(#[from] WireError),
    #[error("Replication push failed")]
    Peer(#[from] PeerError),
}

/// Serves block reads, writes and deletes against this node's block store, and reports completed
/// writes and deletes to the leader.
pub(crate) struct Follower {
    logger: slog::Logger,
    self_id: NodeId,
    blocks: BlockStore,
    admission: Arc<AdmissionControl>,
    store: Arc<MembershipStore>,
    peers: PeerClient,
    ack_attempts: usize,
    ack_retry_interval: Duration,
    reply_timeout: Duration,
}

impl Follower {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        logger: slog::Logger,
        blocks: BlockStore,
        admission: Arc<AdmissionControl>,
        store: Arc<MembershipStore>,
        peers: PeerClient,
        ack_attempts: usize,
        ack_retry_interval: Duration,
        reply_timeout: Duration,
    ) -> Self {
        Follower {
            logger,
            self_id: store.self_id().clone(),
            blocks,
            admission,
            store,
            peers,
            ack_attempts,
            ack_retry_interval,
            reply_timeout,
        }
    }

    /// Reply with the stored size, wait for the requester to be ready, then stream the block.
    pub(crate) async fn serve_read(&self, conn: &mut Connection, mut header: TaskHeader) -> Result<(), FollowerError> {
        let path = self.blocks.path(&header.file_name, header.block_index);
        let _guard = self.admission.admit(path.clone(), Access::Read).await;

        let size = self
            .blocks
            .block_size(&path)
            .await?
            .ok_or_else(|| FollowerError::MissingBlock(header.file_name.clone(), header.block_index))?;
        header.data_size = size;
        wire::write_line(conn.get_mut(), &header).await?;
        tokio::time::timeout(self.reply_timeout, wire::expect_handshake(conn))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "requester never acknowledged size"))??;

        let mut file = File::open(&path).await?;
        let sent = tokio::io::copy(&mut (&mut file).take(size), conn.get_mut()).await?;
        conn.get_mut().flush().await?;
        slog::debug!(self.logger, "Served {} bytes of {}", sent, path.display());

        Ok(())
    }

    /// Store the incoming block, or push our copy elsewhere if the header targets another node.
    pub(crate) async fn serve_write(&self, conn: &mut Connection, header: TaskHeader) -> Result<(), FollowerError> {
        match &header.data_target {
            Some(target) if *target != self.self_id => {
                let target = target.clone();
                return self.push_replica(header, target).await;
            }
            _ => {}
        }

        let path = self.blocks.path(&header.file_name, header.block_index);
        {
            let _guard = self.admission.admit(path.clone(), Access::Write).await;
            if let Err(e) = self.receive_block(conn, &path, header.data_size).await {
                // The leader never hears of a failed write, so the slot stays pending.
                if let Err(remove_err) = self.blocks.remove(&path).await {
                    slog::error!(self.logger, "Could not clean up {}: {:?}", path.display(), remove_err);
                }
                return Err(e);
            }
            wire::send_handshake(conn.get_mut()).await?;
        }

        self.ack_leader(header).await;
        Ok(())
    }

    async fn receive_block(&self, conn: &mut Connection, path: &Path, expected: u64) -> Result<(), FollowerError> {
        let mut file = File::create(path).await?;
        let received = tokio::io::copy(&mut (&mut *conn).take(expected), &mut file).await?;
        file.flush().await?;
        if received < expected {
            return Err(FollowerError::Truncated { expected, received });
        }

        Ok(())
    }

    /// Send our copy of a block to `target`, whose own write ack completes the re-replication.
    async fn push_replica(&self, header: TaskHeader, target: NodeId) -> Result<(), FollowerError> {
        let logger = self.logger.new(slog::o!("File" => header.file_name.clone(), "Block" => header.block_index));
        let path = self.blocks.path(&header.file_name, header.block_index);
        let _guard = self.admission.admit(path.clone(), Access::Read).await;

        let size = self
            .blocks
            .block_size(&path)
            .await?
            .ok_or_else(|| FollowerError::MissingBlock(header.file_name.clone(), header.block_index))?;
        let mut push = TaskHeader::new(Operation::Write, header.file_name.clone());
        push.data_target = Some(target.clone());
        push.original_file_size = header.original_file_size;
        push.block_index = header.block_index;
        push.data_size = size;

        let mut conn = self.peers.open_task(&target, &push).await?;
        let mut file = File::open(&path).await?;
        tokio::io::copy(&mut (&mut file).take(size), conn.get_mut()).await?;
        conn.get_mut().flush().await?;
        self.peers.expect_handshake(&target, &mut conn).await?;
        slog::info!(logger, "Replicated block to {}", target);

        Ok(())
    }

    /// Remove the block once nothing else runs on this node. Missing blocks count as deleted.
    /// The leader is acked even when removal fails, so the directory stops handing out the block.
    pub(crate) async fn serve_delete(&self, header: TaskHeader) -> Result<(), FollowerError> {
        let path = self.blocks.path(&header.file_name, header.block_index);
        let removed = {
            let _guard = self.admission.admit(path.clone(), Access::Exclusive).await;
            self.blocks.remove(&path).await
        };

        self.ack_leader(header).await;
        Ok(removed?)
    }

    /// Tell the current leader this node finished `header`. The leader is looked up on every
    /// attempt since it may change while the operation runs.
    pub(crate) async fn ack_leader(&self, mut header: TaskHeader) {
        header.is_ack = true;
        header.data_target = Some(self.self_id.clone());
        header.ack_target = None;

        for attempt in 1..=self.ack_attempts {
            match self.store.current_leader() {
                Some(leader) => match self.peers.open_task(&leader, &header).await {
                    Ok(_) => return,
                    Err(e) => slog::warn!(self.logger, "Ack to leader {} failed (attempt {}): {}", leader, attempt, e),
                },
                None => slog::warn!(self.logger, "No leader to ack (attempt {})", attempt),
            }
            tokio::time::sleep(self.ack_retry_interval).await;
        }

        slog::error!(
            self.logger,
            "Gave up acking {:?} of block {} of '{}'",
            header.operation,
            header.block_index,
            header.file_name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Member;
    use crate::storage::testing::{self, FakePeer};
    use tempfile::TempDir;

    const NO_ACK_WAIT: Duration = Duration::from_millis(200);

    struct Harness {
        follower: Follower,
        blocks: BlockStore,
        leader: FakePeer,
        me: NodeId,
        _dir: TempDir,
    }

    /// A follower on port 2 whose leader (port 1) is played by the test.
    async fn start() -> Harness {
        let dir = TempDir::new().unwrap();
        let leader = FakePeer::bind(1).await;
        let me = Member::new(testing::node(2), 0, 20);
        let store = testing::store(me.clone(), 1, vec![leader.member(10)]);
        let blocks = BlockStore::new(dir.path().to_path_buf());
        let follower = Follower::new(
            testing::logger(),
            blocks.clone(),
            Arc::new(AdmissionControl::new(3)),
            store.clone(),
            testing::peer_client(store),
            1,
            Duration::from_millis(10),
            Duration::from_secs(2),
        );

        Harness {
            follower,
            blocks,
            leader,
            me: me.id,
            _dir: dir,
        }
    }

    fn write_header(target: &NodeId, data_size: u64) -> TaskHeader {
        let mut header = TaskHeader::new(Operation::Write, "logs/a");
        header.data_target = Some(target.clone());
        header.original_file_size = 25;
        header.block_index = 1;
        header.data_size = data_size;
        header
    }

    #[tokio::test]
    async fn write_stores_block_and_acks_leader() {
        // -- setup --
        let harness = start().await;
        let (mut requester, mut conn) = testing::connection_pair().await;
        requester.write_all(b"hello").await.unwrap();

        // -- execute --
        let (result, ack) = tokio::join!(
            harness.follower.serve_write(&mut conn, write_header(&harness.me, 5)),
            harness.leader.next_task()
        );

        // -- verify --
        result.unwrap();
        wire::expect_handshake(&mut requester).await.unwrap();
        let stored = tokio::fs::read(harness.blocks.path("logs/a", 1)).await.unwrap();
        assert_eq!(stored, b"hello");
        assert!(ack.is_ack);
        assert_eq!(ack.operation, Operation::Write);
        assert_eq!(ack.data_target, Some(harness.me.clone()));
        assert_eq!(ack.ack_target, None);
        assert_eq!((ack.file_name.as_str(), ack.block_index, ack.original_file_size), ("logs/a", 1, 25));
    }

    #[tokio::test]
    async fn truncated_write_leaves_no_block_and_no_ack() {
        // -- setup --
        let harness = start().await;
        let (mut requester, mut conn) = testing::connection_pair().await;
        requester.write_all(b"hell").await.unwrap();
        drop(requester);

        // -- execute --
        let result = harness
            .follower
            .serve_write(&mut conn, write_header(&harness.me, 10))
            .await;

        // -- verify --
        assert!(matches!(
            result,
            Err(FollowerError::Truncated {
                expected: 10,
                received: 4
            })
        ));
        let path = harness.blocks.path("logs/a", 1);
        assert_eq!(harness.blocks.block_size(&path).await.unwrap(), None);
        harness.leader.assert_idle(NO_ACK_WAIT).await;
    }

    #[tokio::test]
    async fn delete_of_missing_block_still_acks_leader() {
        // -- setup --
        let harness = start().await;
        let mut header = TaskHeader::new(Operation::Delete, "never/stored");
        header.data_target = Some(harness.me.clone());
        header.block_index = 3;

        // -- execute --
        let (result, ack) = tokio::join!(harness.follower.serve_delete(header), harness.leader.next_task());

        // -- verify --
        result.unwrap();
        assert!(ack.is_ack);
        assert_eq!(ack.operation, Operation::Delete);
        assert_eq!(ack.file_name, "never/stored");
        assert_eq!(ack.block_index, 3);
        assert_eq!(ack.data_target, Some(harness.me.clone()));
    }

    #[tokio::test]
    async fn delete_removes_stored_block() {
        // -- setup --
        let harness = start().await;
        let path = harness.blocks.path("logs/a", 0);
        tokio::fs::write(&path, b"bytes").await.unwrap();

        // -- execute --
        let (result, _) = tokio::join!(
            harness.follower.serve_delete(TaskHeader::new(Operation::Delete, "logs/a")),
            harness.leader.next_task()
        );

        // -- verify --
        result.unwrap();
        assert_eq!(harness.blocks.block_size(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_announces_size_then_streams_block() {
        // -- setup --
        let harness = start().await;
        tokio::fs::write(harness.blocks.path("logs/a", 1), b"0123456789").await.unwrap();
        let (requester, mut conn) = testing::connection_pair().await;
        let mut header = TaskHeader::new(Operation::Read, "logs/a");
        header.block_index = 1;

        // -- execute --
        let requester_side = async {
            let mut requester = tokio::io::BufReader::new(requester);
            let reply: TaskHeader = wire::read_line(&mut requester).await.unwrap();
            wire::send_handshake(requester.get_mut()).await.unwrap();
            let mut bytes = vec![0u8; reply.data_size as usize];
            requester.read_exact(&mut bytes).await.unwrap();
            (reply.data_size, bytes)
        };
        let (result, (size, bytes)) = tokio::join!(harness.follower.serve_read(&mut conn, header), requester_side);

        // -- verify --
        result.unwrap();
        assert_eq!(size, 10);
        assert_eq!(bytes, b"0123456789");
    }

    #[tokio::test]
    async fn read_of_missing_block_fails() {
        let harness = start().await;
        let (_requester, mut conn) = testing::connection_pair().await;

        let result = harness
            .follower
            .serve_read(&mut conn, TaskHeader::new(Operation::Read, "absent"))
            .await;

        assert!(matches!(result, Err(FollowerError::MissingBlock(name, 0)) if name == "absent"));
    }

    #[tokio::test]
    async fn write_for_another_node_pushes_local_copy() {
        // -- setup --
        let harness = start().await;
        tokio::fs::write(harness.blocks.path("logs/a", 1), b"replica").await.unwrap();
        let (_requester, mut conn) = testing::connection_pair().await;
        let target_id = harness.leader.id.clone();

        // -- execute --
        // The leader doubles as the new replica here.
        let target_side = async {
            let (push, mut push_conn) = harness.leader.accept().await;
            let mut bytes = vec![0u8; push.data_size as usize];
            push_conn.read_exact(&mut bytes).await.unwrap();
            wire::send_handshake(push_conn.get_mut()).await.unwrap();
            (push, bytes)
        };
        let (result, (push, bytes)) = tokio::join!(
            harness.follower.serve_write(&mut conn, write_header(&target_id, 0)),
            target_side
        );

        // -- verify --
        result.unwrap();
        assert_eq!(push.operation, Operation::Write);
        assert_eq!(push.data_target, Some(target_id));
        assert_eq!(push.data_size, 7);
        assert_eq!(push.original_file_size, 25);
        assert!(!push.is_ack);
        assert_eq!(bytes, b"replica");
        harness.leader.assert_idle(NO_ACK_WAIT).await;
    }
}
