use crate::membership::{MembershipStore, NodeId};
use crate::storage::wire::{self, Connection, TaskHeader, WireError};
use std::io;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::Duration;

#[derive(Debug, thiserror::Error)]
pub(crate) enum PeerError {
    #[error("No storage address known for {0}")]
    UnknownPeer(NodeId),
    #[error("Timed out connecting to {0}")]
    ConnectTimeout(NodeId),
    #[error("Timed out waiting on {0}")]
    Timeout(NodeId),
    #[error("Could not connect to {0}")]
    Connect(NodeId, #[source] io::Error),
    #[error("Exchange with peer failed")]
    Wire(#[from] WireError),
}

/// Opens storage connections to other nodes, resolving identities through membership.
#[derive(Clone)]
pub(crate) struct PeerClient {
    store: Arc<MembershipStore>,
    connect_timeout: Duration,
    reply_timeout: Duration,
}

impl PeerClient {
    pub(crate) fn new(store: Arc<MembershipStore>, connect_timeout: Duration, reply_timeout: Duration) -> Self {
        PeerClient {
            store,
            connect_timeout,
            reply_timeout,
        }
    }

    pub(crate) async fn connect(&self, peer: &NodeId) -> Result<Connection, PeerError> {
        let addr = self
            .store
            .storage_addr(peer)
            .ok_or_else(|| PeerError::UnknownPeer(peer.clone()))?;
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::ConnectTimeout(peer.clone()))?
            .map_err(|e| PeerError::Connect(peer.clone(), e))?;
        let _ = stream.set_nodelay(true);

        Ok(BufReader::new(stream))
    }

    /// Connect, send `header` and wait for the peer's handshake.
    pub(crate) async fn open_task(&self, peer: &NodeId, header: &TaskHeader) -> Result<Connection, PeerError> {
        let mut conn = self.connect(peer).await?;
        wire::write_line(conn.get_mut(), header).await?;
        self.expect_handshake(peer, &mut conn).await?;

        Ok(conn)
    }

    pub(crate) async fn expect_handshake(&self, peer: &NodeId, conn: &mut Connection) -> Result<(), PeerError> {
        tokio::time::timeout(self.reply_timeout, wire::expect_handshake(conn))
            .await
            .map_err(|_| PeerError::Timeout(peer.clone()))??;
        Ok(())
    }

    pub(crate) async fn read_reply<T: serde::de::DeserializeOwned>(
        &self,
        peer: &NodeId,
        conn: &mut Connection,
    ) -> Result<T, PeerError> {
        let reply = tokio::time::timeout(self.reply_timeout, wire::read_line(conn))
            .await
            .map_err(|_| PeerError::Timeout(peer.clone()))??;
        Ok(reply)
    }
}
