//! Block-replicated file storage. Placement lives in a directory on the leader tier; block bytes
//! move directly between clients and replicas.
mod admission;
mod block_store;
mod block_table;
mod client;
mod directory;
mod follower;
mod leader;
mod peer_client;
mod service;
#[cfg(test)]
mod testing;
mod wire;

pub use block_store::LocalBlock;
pub use client::DeleteOutput;
pub use client::Freshness;
pub use client::GetOutput;
pub use client::PutOutput;
pub use client::StorageClientError;
pub use directory::BlockLocations;

pub(crate) use admission::AdmissionControl;
pub(crate) use block_store::BlockStore;
pub(crate) use client::ClientSettings;
pub(crate) use client::StorageClient;
pub(crate) use directory::BlockDirectory;
pub(crate) use follower::Follower;
pub(crate) use leader::LeaderService;
pub(crate) use leader::Rereplicator;
pub(crate) use peer_client::PeerClient;
pub(crate) use service::StorageService;
