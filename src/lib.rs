mod api;
mod membership;
mod server;
mod storage;

pub use api::try_create_node;
pub use api::ClusterNode;
pub use api::MemberInfo;
pub use api::NodeConfig;
pub use api::NodeCreationError;
pub use api::NodeOptions;
pub use membership::MemberState;
pub use membership::NodeId;
pub use membership::NodeRole;
pub use storage::BlockLocations;
pub use storage::DeleteOutput;
pub use storage::Freshness;
pub use storage::GetOutput;
pub use storage::LocalBlock;
pub use storage::PutOutput;
pub use storage::StorageClientError;

