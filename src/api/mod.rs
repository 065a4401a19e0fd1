//! This mod is meant to hold most of the code for the library's client-facing API.
mod node;
mod options;
mod types;
mod wiring;

pub use node::ClusterNode;
pub use options::NodeOptions;
pub use types::MemberInfo;
pub use wiring::try_create_node;
pub use wiring::NodeConfig;
pub use wiring::NodeCreationError;
