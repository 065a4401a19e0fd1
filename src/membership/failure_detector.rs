use crate::membership::member::{MemberState, NodeId, NodeRole};
use crate::membership::store::MembershipStore;
use crate::membership::time::{Clock, RealClock};
use crate::server::ShutdownSignal;
use std::sync::Arc;
use tokio::time::Duration;

/// Invoked when a peer is confirmed down while this node sits in the leader tier. Runs on its own
/// task; the detector keeps scanning meanwhile.
#[async_trait::async_trait]
pub(crate) trait DownNodeHandler: Send + Sync + 'static {
    async fn handle_down(&self, node: NodeId, my_role: NodeRole);
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Thresholds {
    pub(crate) t_fail: Duration,
    pub(crate) t_cleanup: Duration,
}

/// State a record should be in given how long it has gone without a refresh.
pub(crate) fn aged_state(current: MemberState, age: Duration, suspicion: bool, thresholds: Thresholds) -> MemberState {
    match current {
        // LEFT never ages. DOWN only clears with a new incarnation, which the merge handles.
        MemberState::Left | MemberState::Down => current,
        _ if suspicion && age >= thresholds.t_fail + thresholds.t_cleanup => MemberState::Down,
        _ if suspicion && age >= thresholds.t_fail => MemberState::Suspected,
        _ if age >= thresholds.t_fail => MemberState::Down,
        _ => MemberState::Alive,
    }
}

pub(crate) struct FailureDetector<C: Clock = RealClock> {
    logger: slog::Logger,
    store: Arc<MembershipStore>,
    on_down: Arc<dyn DownNodeHandler>,
    thresholds: Thresholds,
    scan_interval: Duration,
    clock: C,
}

impl FailureDetector {
    pub(crate) fn spawn(
        logger: slog::Logger,
        store: Arc<MembershipStore>,
        on_down: Arc<dyn DownNodeHandler>,
        thresholds: Thresholds,
        scan_interval: Duration,
        shutdown: ShutdownSignal,
    ) {
        let detector = FailureDetector::new(logger, store, on_down, thresholds, scan_interval, RealClock);
        tokio::spawn(detector.run(shutdown));
    }
}

impl<C: Clock> FailureDetector<C> {
    fn new(
        logger: slog::Logger,
        store: Arc<MembershipStore>,
        on_down: Arc<dyn DownNodeHandler>,
        thresholds: Thresholds,
        scan_interval: Duration,
        clock: C,
    ) -> Self {
        FailureDetector {
            logger,
            store,
            on_down,
            thresholds,
            scan_interval,
            clock,
        }
    }

    async fn run(mut self, mut shutdown: ShutdownSignal) {
        loop {
            let mut clock = self.clock.clone();
            tokio::select! {
                _ = clock.sleep(self.scan_interval) => {}
                _ = shutdown.wait() => {
                    slog::info!(self.logger, "Failure detector stopped");
                    return;
                }
            }

            self.scan();
        }
    }

    fn scan(&mut self) {
        let suspicion = self.store.suspicion_enabled();
        let thresholds = self.thresholds;
        let changes = self
            .store
            .age_members(self.clock.now(), |state, age| aged_state(state, age, suspicion, thresholds));

        let mut newly_down = Vec::new();
        for change in changes {
            match change.to {
                MemberState::Down => {
                    slog::info!(self.logger, "Member {} is DOWN (was {:?})", change.id, change.from);
                    newly_down.push(change.id);
                }
                MemberState::Suspected => slog::info!(self.logger, "Suspecting member {}", change.id),
                _ => slog::info!(self.logger, "Member {} is {:?} again", change.id, change.to),
            }
        }
        if newly_down.is_empty() {
            return;
        }

        // Role is evaluated after the new DOWN states are applied, so the successor of a failed
        // leader recovers for it.
        let my_role = self.store.current_role();
        if my_role == NodeRole::Follower {
            return;
        }
        for node in newly_down {
            if !self.store.try_begin_rereplication(&node) {
                slog::debug!(self.logger, "Recovery for {} already running", node);
                continue;
            }

            let store = self.store.clone();
            let on_down = self.on_down.clone();
            tokio::spawn(async move {
                on_down.handle_down(node.clone(), my_role).await;
                store.finish_rereplication(&node);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::member::Member;
    use crate::membership::time::{mocked_clock, MockClockController};
    use crate::server;
    use tokio::sync::mpsc;

    const T_FAIL: Duration = Duration::from_millis(1500);
    const T_CLEANUP: Duration = Duration::from_millis(1000);
    const SCAN: Duration = Duration::from_millis(50);

    struct ChannelHandler {
        tx: mpsc::UnboundedSender<(NodeId, NodeRole)>,
    }

    #[async_trait::async_trait]
    impl DownNodeHandler for ChannelHandler {
        async fn handle_down(&self, node: NodeId, my_role: NodeRole) {
            let _ = self.tx.send((node, my_role));
        }
    }

    fn member(port: u16, creation_timestamp: i64) -> Member {
        Member::new(NodeId::new(format!("127.0.0.1:{}", port)), port + 1000, creation_timestamp)
    }

    struct Harness {
        store: Arc<MembershipStore>,
        controller: MockClockController,
        down_rx: mpsc::UnboundedReceiver<(NodeId, NodeRole)>,
        // Refreshed at every step of `advance_to`.
        keep_alive: Vec<Member>,
        _shutdown: server::ShutdownHandle,
    }

    /// Node on port 1 with the given incarnation, plus a peer on port 2 with incarnation 20.
    fn start(my_creation_timestamp: i64) -> Harness {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let (clock, controller) = mocked_clock();
        let store = Arc::new(MembershipStore::new(
            logger.clone(),
            member(1, my_creation_timestamp),
            4,
            controller.now(),
        ));
        store.merge_snapshot(vec![member(2, 20)], controller.now());

        let (tx, down_rx) = mpsc::unbounded_channel();
        let (shutdown_handle, shutdown) = server::shutdown_signal();
        let detector = FailureDetector::new(
            logger,
            store.clone(),
            Arc::new(ChannelHandler { tx }),
            Thresholds {
                t_fail: T_FAIL,
                t_cleanup: T_CLEANUP,
            },
            SCAN,
            clock,
        );
        tokio::spawn(detector.run(shutdown));

        Harness {
            store,
            controller,
            down_rx,
            keep_alive: Vec::new(),
            _shutdown: shutdown_handle,
        }
    }

    fn peer() -> NodeId {
        NodeId::new("127.0.0.1:2")
    }

    impl Harness {
        fn peer_state(&self) -> MemberState {
            self.store.get(&peer()).unwrap().state
        }

        /// Advance in scan-sized steps until `elapsed` is reached, letting the detector run at
        /// every step.
        async fn advance_to(&mut self, elapsed: Duration) {
            while self.controller.elapsed() < elapsed {
                self.controller.advance(SCAN);
                for member in self.keep_alive.iter_mut() {
                    member.heartbeat += 1;
                }
                self.store.merge_snapshot(self.keep_alive.clone(), self.controller.now());
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                }
            }
        }

        async fn recv_down(&mut self) -> (NodeId, NodeRole) {
            tokio::time::timeout(Duration::from_secs(5), self.down_rx.recv())
                .await
                .expect("Unexpected timeout")
                .expect("Detector dropped handler")
        }
    }

    #[test]
    fn aged_state_table() {
        let thresholds = Thresholds {
            t_fail: T_FAIL,
            t_cleanup: T_CLEANUP,
        };
        let young = Duration::from_millis(100);
        let stale = T_FAIL;
        let dead = T_FAIL + T_CLEANUP;

        assert_eq!(aged_state(MemberState::Alive, young, false, thresholds), MemberState::Alive);
        assert_eq!(aged_state(MemberState::Alive, stale, false, thresholds), MemberState::Down);
        assert_eq!(aged_state(MemberState::Alive, stale, true, thresholds), MemberState::Suspected);
        assert_eq!(aged_state(MemberState::Suspected, young, true, thresholds), MemberState::Alive);
        assert_eq!(aged_state(MemberState::Suspected, dead, true, thresholds), MemberState::Down);
        assert_eq!(aged_state(MemberState::Left, dead, true, thresholds), MemberState::Left);
        assert_eq!(aged_state(MemberState::Down, young, false, thresholds), MemberState::Down);
    }

    #[tokio::test]
    async fn without_suspicion_goes_straight_to_down() {
        // -- setup --
        let mut harness = start(10);

        // -- execute --
        harness.advance_to(T_FAIL - SCAN * 2).await;
        let before = harness.peer_state();
        harness.advance_to(T_FAIL + SCAN * 2).await;

        // -- verify --
        assert_eq!(before, MemberState::Alive);
        assert_eq!(harness.peer_state(), MemberState::Down);
        assert_eq!(harness.recv_down().await, (peer(), NodeRole::Leader));
    }

    #[tokio::test]
    async fn with_suspicion_passes_through_suspected() {
        // -- setup --
        let mut harness = start(10);
        harness.store.set_suspicion_enabled(true);

        // -- execute & verify --
        harness.advance_to(T_FAIL + SCAN * 2).await;
        assert_eq!(harness.peer_state(), MemberState::Suspected);

        harness.advance_to(T_FAIL + T_CLEANUP - SCAN * 2).await;
        assert_eq!(harness.peer_state(), MemberState::Suspected);

        harness.advance_to(T_FAIL + T_CLEANUP + SCAN * 2).await;
        assert_eq!(harness.peer_state(), MemberState::Down);
        assert_eq!(harness.recv_down().await.0, peer());
    }

    #[tokio::test]
    async fn refreshed_suspect_is_alive_again() {
        // -- setup --
        let mut harness = start(10);
        harness.store.set_suspicion_enabled(true);
        harness.advance_to(T_FAIL + SCAN * 2).await;
        assert_eq!(harness.peer_state(), MemberState::Suspected);

        // -- execute --
        let mut heartbeat = member(2, 20);
        heartbeat.heartbeat = 1;
        harness.store.merge_snapshot(vec![heartbeat], harness.controller.now());
        harness.advance_to(T_FAIL + SCAN * 6).await;

        // -- verify --
        assert_eq!(harness.peer_state(), MemberState::Alive);
    }

    #[tokio::test]
    async fn followers_do_not_recover_down_nodes() {
        // -- setup --
        // Peer 2 (incarnation 20) fails while 4 older live nodes fill the leader tier ahead of us.
        let mut harness = start(1000);
        harness.keep_alive = vec![member(3, 30), member(4, 40), member(5, 50), member(6, 60)];

        // -- execute --
        harness.advance_to(T_FAIL + SCAN * 2).await;

        // -- verify --
        assert_eq!(harness.peer_state(), MemberState::Down);
        tokio::time::timeout(Duration::from_millis(50), harness.down_rx.recv())
            .await
            .expect_err("Follower started a recovery");
    }

    #[tokio::test]
    async fn successor_recovers_for_failed_leader() {
        // -- setup --
        // Peer 2 (incarnation 20) is the leader; we are next in line.
        let mut harness = start(30);

        // -- execute --
        harness.advance_to(T_FAIL + SCAN * 2).await;

        // -- verify --
        assert_eq!(harness.recv_down().await, (peer(), NodeRole::Leader));
        assert_eq!(harness.store.current_role(), NodeRole::Leader);
    }
}
