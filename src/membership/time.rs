use tokio::time::{Duration, Instant};

/// Source of time for the membership loops. Production code uses [`RealClock`]; tests drive a
/// [`MockClock`] by hand so staleness thresholds can be crossed deterministically.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) fn mocked_clock() -> (MockClock, MockClockController) {
    let start = Instant::now();
    let (tx, rx) = tokio::sync::watch::channel(start);

    (MockClock { now: rx }, MockClockController { now: tx, start })
}

#[cfg(test)]
#[derive(Clone)]
pub(crate) struct MockClock {
    now: tokio::sync::watch::Receiver<Instant>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.now.borrow()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        loop {
            if *self.now.borrow() >= deadline {
                return;
            }
            if self.now.changed().await.is_err() {
                // Controller is gone, so time will never reach the deadline.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) struct MockClockController {
    now: tokio::sync::watch::Sender<Instant>,
    start: Instant,
}

#[cfg(test)]
impl MockClockController {
    pub(crate) fn now(&self) -> Instant {
        *self.now.borrow()
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.now() - self.start
    }

    /// Move time forward. Sleepers only promise to wake at or after their deadline, so step in
    /// increments smaller than the thresholds under test.
    pub(crate) fn advance(&mut self, duration: Duration) {
        let next = self.now() + duration;
        let _ = self.now.send(next);
    }
}
