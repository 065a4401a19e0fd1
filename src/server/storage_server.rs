use crate::server::ShutdownSignal;
use crate::storage::StorageService;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::TcpListener;

/// Accepts storage connections and hands each one to its own task.
pub(crate) struct StorageServer {
    logger: slog::Logger,
    service: Arc<StorageService>,
}

impl StorageServer {
    pub(crate) fn new(logger: slog::Logger, service: Arc<StorageService>) -> Self {
        StorageServer { logger, service }
    }

    pub(crate) async fn run(self, listener: TcpListener, mut shutdown: ShutdownSignal) {
        match listener.local_addr() {
            Ok(addr) => slog::info!(self.logger, "Listening on '{:?}'", addr),
            Err(e) => slog::warn!(self.logger, "Listening on unknown address: {:?}", e),
        }

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.wait() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    slog::debug!(self.logger, "Connection from {}", peer);
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(self.service.clone().handle_connection(BufReader::new(stream)));
                }
                Err(e) => slog::warn!(self.logger, "Accept failed: {:?}", e),
            }
        }

        slog::info!(self.logger, "Server run() has exited");
    }
}
