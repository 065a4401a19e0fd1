//! Gossip membership: who is in the cluster, who is alive, and who leads.
mod failure_detector;
mod gossip;
mod leadership;
mod member;
mod merge;
mod store;
mod time;
mod wire;

pub use member::MemberState;
pub use member::NodeId;
pub use member::NodeRole;

pub(crate) use failure_detector::DownNodeHandler;
pub(crate) use failure_detector::FailureDetector;
pub(crate) use failure_detector::Thresholds;
pub(crate) use gossip::Disseminator;
pub(crate) use gossip::GossipSender;
pub(crate) use gossip::Receiver as GossipReceiver;
pub(crate) use member::new_incarnation;
pub(crate) use member::Member;
pub(crate) use store::MembershipStore;
