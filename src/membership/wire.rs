use crate::membership::member::Member;
use bytes::Bytes;

const ENABLE_SUSPICION: &[u8] = b"enable";
const DISABLE_SUSPICION: &[u8] = b"disable";

/// One gossip datagram. Control strings are matched literally before a snapshot is attempted.
#[derive(Debug, PartialEq)]
pub(crate) enum GossipMessage {
    Snapshot(Vec<Member>),
    SetSuspicion(bool),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum GossipWireError {
    #[error("Malformed membership snapshot")]
    Malformed(#[from] serde_json::Error),
}

impl GossipMessage {
    pub(crate) fn encode(&self) -> Result<Bytes, GossipWireError> {
        match self {
            GossipMessage::Snapshot(members) => Ok(Bytes::from(serde_json::to_vec(members)?)),
            GossipMessage::SetSuspicion(true) => Ok(Bytes::from_static(ENABLE_SUSPICION)),
            GossipMessage::SetSuspicion(false) => Ok(Bytes::from_static(DISABLE_SUSPICION)),
        }
    }

    pub(crate) fn decode(datagram: &[u8]) -> Result<Self, GossipWireError> {
        if datagram == ENABLE_SUSPICION {
            Ok(GossipMessage::SetSuspicion(true))
        } else if datagram == DISABLE_SUSPICION {
            Ok(GossipMessage::SetSuspicion(false))
        } else {
            Ok(GossipMessage::Snapshot(serde_json::from_slice(datagram)?))
        }
    }
}
