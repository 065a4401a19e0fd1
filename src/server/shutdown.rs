use tokio::sync::watch;

pub(crate) fn shutdown_signal() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);

    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

/// Dropping the handle, or calling `shutdown()`, stops every task holding a matching signal.
pub(crate) struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone)]
pub(crate) struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown is requested. Safe to call again after it has resolved.
    pub(crate) async fn wait(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            // We don't care if the handle sent a value or dropped
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
