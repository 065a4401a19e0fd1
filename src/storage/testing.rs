use crate::membership::{Member, MembershipStore, NodeId};
use crate::storage::peer_client::PeerClient;
use crate::storage::wire::{self, Connection, TaskHeader};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, Instant};

pub(crate) fn logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

pub(crate) fn node(gossip_port: u16) -> NodeId {
    NodeId::new(format!("127.0.0.1:{}", gossip_port))
}

/// Membership as seen by `me`, with `peers` already merged in.
pub(crate) fn store(me: Member, num_leaders: usize, peers: Vec<Member>) -> Arc<MembershipStore> {
    let store = Arc::new(MembershipStore::new(logger(), me, num_leaders, Instant::now()));
    store.merge_snapshot(peers, Instant::now());
    store
}

pub(crate) fn peer_client(store: Arc<MembershipStore>) -> PeerClient {
    PeerClient::new(store, Duration::from_millis(500), Duration::from_secs(2))
}

/// A connected socket pair: the requester's end and the accepted end a service reads from.
pub(crate) async fn connection_pair() -> (TcpStream, Connection) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let requester = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let (accepted, _) = listener.accept().await.unwrap();
    (requester, BufReader::new(accepted))
}

/// Another node played by the test: a storage listener known to membership under `id`.
pub(crate) struct FakePeer {
    pub(crate) id: NodeId,
    listener: TcpListener,
}

impl FakePeer {
    pub(crate) async fn bind(gossip_port: u16) -> FakePeer {
        FakePeer {
            id: node(gossip_port),
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub(crate) fn member(&self, creation_timestamp: i64) -> Member {
        let storage_port = self.listener.local_addr().unwrap().port();
        Member::new(self.id.clone(), storage_port, creation_timestamp)
    }

    /// Accept the next task and acknowledge its header. The connection is returned for any
    /// payload that follows.
    pub(crate) async fn accept(&self) -> (TaskHeader, Connection) {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), self.listener.accept())
            .await
            .expect("No task arrived")
            .unwrap();
        let mut conn = BufReader::new(stream);
        let header = wire::read_line(&mut conn).await.unwrap();
        wire::send_handshake(conn.get_mut()).await.unwrap();
        (header, conn)
    }

    pub(crate) async fn next_task(&self) -> TaskHeader {
        self.accept().await.0
    }

    pub(crate) async fn assert_idle(&self, wait: Duration) {
        if let Ok(accepted) = tokio::time::timeout(wait, self.listener.accept()).await {
            let (stream, _) = accepted.unwrap();
            let mut conn = BufReader::new(stream);
            let header: Result<TaskHeader, _> = wire::read_line(&mut conn).await;
            panic!("{} unexpectedly received {:?}", self.id, header);
        }
    }
}
