use crate::membership::leadership::{self, Leadership};
use crate::membership::member::{Member, MemberState, NodeId, NodeRole};
use crate::membership::merge::{self, MergeEvent};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::time::{Duration, Instant};

/// The node's view of the cluster: identity to member record, plus the local time each record
/// was last refreshed. Every mutation goes through per-key entry locks. When both maps are
/// touched, `members` is always locked first.
pub(crate) struct MembershipStore {
    logger: slog::Logger,
    self_id: NodeId,
    num_leaders: usize,
    members: DashMap<NodeId, Member>,
    last_update: DashMap<NodeId, Instant>,
    suspicion_enabled: AtomicBool,
    // f64 bits
    drop_rate: AtomicU64,
    rereplication_in_progress: DashMap<NodeId, i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LivenessChange {
    pub(crate) id: NodeId,
    pub(crate) from: MemberState,
    pub(crate) to: MemberState,
}

impl MembershipStore {
    pub(crate) fn new(logger: slog::Logger, me: Member, num_leaders: usize, now: Instant) -> Self {
        let self_id = me.id.clone();
        let members = DashMap::new();
        let last_update = DashMap::new();
        last_update.insert(self_id.clone(), now);
        members.insert(self_id.clone(), me);

        MembershipStore {
            logger,
            self_id,
            num_leaders,
            members,
            last_update,
            suspicion_enabled: AtomicBool::new(false),
            drop_rate: AtomicU64::new(0f64.to_bits()),
            rereplication_in_progress: DashMap::new(),
        }
    }

    pub(crate) fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub(crate) fn get(&self, id: &NodeId) -> Option<Member> {
        self.members.get(id).map(|m| m.value().clone())
    }

    pub(crate) fn self_member(&self) -> Option<Member> {
        self.get(&self.self_id)
    }

    pub(crate) fn snapshot(&self) -> Vec<Member> {
        self.members.iter().map(|m| m.value().clone()).collect()
    }

    pub(crate) fn storage_addr(&self, id: &NodeId) -> Option<SocketAddr> {
        self.members.get(id).and_then(|m| m.storage_addr())
    }

    /// Apply every record of an incoming snapshot. Records about ourselves are skipped: this node
    /// is the only authority on its own incarnation. Returns how many local records changed.
    pub(crate) fn merge_snapshot(&self, incoming: Vec<Member>, now: Instant) -> usize {
        let mut changed = 0;
        for record in incoming {
            if record.id == self.self_id {
                continue;
            }

            let merged = match self.members.entry(record.id.clone()) {
                Entry::Occupied(mut entry) => match merge::merge(Some(entry.get()), &record) {
                    Some(merged) => {
                        entry.insert(merged.record.clone());
                        if merged.refresh {
                            self.last_update.insert(record.id.clone(), now);
                        }
                        merged
                    }
                    None => continue,
                },
                Entry::Vacant(entry) => match merge::merge(None, &record) {
                    Some(merged) => {
                        entry.insert(merged.record.clone());
                        self.last_update.insert(record.id.clone(), now);
                        merged
                    }
                    None => continue,
                },
            };

            changed += 1;
            match merged.event {
                MergeEvent::Joined => slog::info!(self.logger, "Member {} joined ({:?})", record.id, merged.record.state),
                MergeEvent::Reincarnated => slog::info!(
                    self.logger,
                    "Member {} rejoined with incarnation {}",
                    record.id,
                    merged.record.creation_timestamp
                ),
                MergeEvent::Left => slog::info!(self.logger, "Member {} left the cluster", record.id),
                MergeEvent::Updated => {}
            }
        }

        changed
    }

    /// Bump our heartbeat and hand back the snapshot to disseminate.
    pub(crate) fn prepare_push(&self) -> Vec<Member> {
        if let Some(mut me) = self.members.get_mut(&self.self_id) {
            me.heartbeat += 1;
            if me.state != MemberState::Left {
                me.state = MemberState::Alive;
            }
        }

        self.snapshot()
    }

    /// Mark this node LEFT. Returns the peers that should hear about it.
    pub(crate) fn mark_self_left(&self) -> Vec<NodeId> {
        if let Some(mut me) = self.members.get_mut(&self.self_id) {
            me.state = MemberState::Left;
        }
        self.reachable_peers()
    }

    /// Up to `k` distinct peers worth gossiping with, chosen uniformly at random.
    pub(crate) fn gossip_targets(&self, k: usize) -> Vec<NodeId> {
        let mut peers = self.reachable_peers();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(k);
        peers
    }

    /// Every other identity we know about, whatever its state.
    pub(crate) fn broadcast_targets(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|m| *m.key() != self.self_id)
            .map(|m| m.key().clone())
            .collect()
    }

    /// Other members not known to be DOWN or LEFT.
    pub(crate) fn reachable_peers(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|m| *m.key() != self.self_id && m.value().is_reachable())
            .map(|m| m.key().clone())
            .collect()
    }

    /// Members currently ALIVE, this node included.
    pub(crate) fn alive_members(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|m| m.value().state == MemberState::Alive)
            .map(|m| m.key().clone())
            .collect()
    }

    pub(crate) fn random_alive_peers(&self, k: usize) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .alive_members()
            .into_iter()
            .filter(|id| *id != self.self_id)
            .collect();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(k);
        peers
    }

    pub(crate) fn is_gone(&self, id: &NodeId) -> bool {
        self.members.get(id).map_or(false, |m| !m.is_reachable())
    }

    pub(crate) fn leadership(&self) -> Leadership {
        leadership::derive(&self.snapshot(), self.num_leaders)
    }

    pub(crate) fn current_leader(&self) -> Option<NodeId> {
        self.leadership().leader
    }

    pub(crate) fn current_role(&self) -> NodeRole {
        self.leadership().role_of(&self.self_id)
    }

    /// Re-evaluate the state of every peer from the age of its last refresh. `next_state` gets the
    /// current state and the age and returns the state the record should be in.
    pub(crate) fn age_members<F>(&self, now: Instant, next_state: F) -> Vec<LivenessChange>
    where
        F: Fn(MemberState, Duration) -> MemberState,
    {
        let ids: Vec<NodeId> = self
            .members
            .iter()
            .filter(|m| *m.key() != self.self_id)
            .map(|m| m.key().clone())
            .collect();

        let mut changes = Vec::new();
        for id in ids {
            let mut member = match self.members.get_mut(&id) {
                Some(member) => member,
                None => continue,
            };
            let last_update = match self.last_update.get(&id) {
                Some(last_update) => *last_update,
                None => continue,
            };

            let age = now.saturating_duration_since(last_update);
            let to = next_state(member.state, age);
            if to != member.state {
                changes.push(LivenessChange {
                    id: id.clone(),
                    from: member.state,
                    to,
                });
                member.state = to;
            }
        }

        changes
    }

    pub(crate) fn suspicion_enabled(&self) -> bool {
        self.suspicion_enabled.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub(crate) fn set_suspicion_enabled(&self, enabled: bool) -> bool {
        self.suspicion_enabled.swap(enabled, Ordering::AcqRel)
    }

    pub(crate) fn message_drop_rate(&self) -> f64 {
        f64::from_bits(self.drop_rate.load(Ordering::Acquire))
    }

    pub(crate) fn set_message_drop_rate(&self, rate: f64) {
        self.drop_rate.store(rate.to_bits(), Ordering::Release);
    }

    /// Claim the right to recover from `id` going down. Fails if a recovery for the same
    /// incarnation is already running on this node.
    pub(crate) fn try_begin_rereplication(&self, id: &NodeId) -> bool {
        let incarnation = match self.members.get(id) {
            Some(member) => member.creation_timestamp,
            None => return false,
        };

        match self.rereplication_in_progress.entry(id.clone()) {
            Entry::Occupied(entry) if *entry.get() == incarnation => false,
            Entry::Occupied(mut entry) => {
                entry.insert(incarnation);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(incarnation);
                true
            }
        }
    }

    pub(crate) fn finish_rereplication(&self, id: &NodeId) {
        self.rereplication_in_progress.remove(id);
    }
}
