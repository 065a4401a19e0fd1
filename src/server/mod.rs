mod shutdown;
mod storage_server;

pub(crate) use shutdown::shutdown_signal;
pub(crate) use shutdown::ShutdownHandle;
pub(crate) use shutdown::ShutdownSignal;
pub(crate) use storage_server::StorageServer;
