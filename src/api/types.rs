use crate::membership::{Member, MemberState, NodeId, NodeRole};
use std::net::SocketAddr;

/// A point-in-time copy of one membership record, as seen by the local node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: NodeId,
    pub storage_addr: Option<SocketAddr>,
    pub creation_timestamp: i64,
    pub heartbeat: u64,
    pub state: MemberState,
    pub role: NodeRole,
}

impl MemberInfo {
    pub(super) fn new(member: Member, role: NodeRole) -> Self {
        MemberInfo {
            storage_addr: member.storage_addr(),
            id: member.id,
            creation_timestamp: member.creation_timestamp,
            heartbeat: member.heartbeat,
            state: member.state,
            role,
        }
    }
}
