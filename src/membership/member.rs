use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Identity of a cluster member: the address its gossip socket is bound to, rendered as
/// `ip:port`. The storage endpoint is found through the member record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn from_addr(addr: SocketAddr) -> Self {
        NodeId(addr.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn gossip_addr(&self) -> Option<SocketAddr> {
        self.0.parse().ok()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Liveness of a member as seen by the local node. The derive order of the first three variants
/// is their severity, which is what the merge uses to break heartbeat ties.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MemberState {
    Alive,
    Suspected,
    Down,
    Left,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    Leader,
    SubLeader,
    Follower,
}

/// One member record, exactly as it travels inside a gossip snapshot.
///
/// `creation_timestamp` is assigned once when the process starts and doubles as the incarnation
/// number. Within one incarnation `heartbeat` and `state` only move forward.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Member {
    pub(crate) id: NodeId,
    pub(crate) storage_port: u16,
    pub(crate) creation_timestamp: i64,
    pub(crate) heartbeat: u64,
    pub(crate) state: MemberState,
}

impl Member {
    pub(crate) fn new(id: NodeId, storage_port: u16, creation_timestamp: i64) -> Self {
        Member {
            id,
            storage_port,
            creation_timestamp,
            heartbeat: 0,
            state: MemberState::Alive,
        }
    }

    pub(crate) fn storage_addr(&self) -> Option<SocketAddr> {
        self.id
            .gossip_addr()
            .map(|gossip_addr| SocketAddr::new(gossip_addr.ip(), self.storage_port))
    }

    pub(crate) fn is_reachable(&self) -> bool {
        !matches!(self.state, MemberState::Down | MemberState::Left)
    }
}

/// Creation timestamp for a process starting now, in nanoseconds since the unix epoch.
pub(crate) fn new_incarnation() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
