use crate::membership::member::{Member, MemberState};
use std::cmp;

/// Result of merging one incoming record into the local view. `None` from [`merge`] means the
/// local record stays as it is.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Merged {
    pub(crate) record: Member,
    /// The incoming record counts as fresh evidence of life.
    pub(crate) refresh: bool,
    pub(crate) event: MergeEvent,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum MergeEvent {
    Joined,
    Reincarnated,
    Left,
    Updated,
}

pub(crate) fn merge(local: Option<&Member>, incoming: &Member) -> Option<Merged> {
    let local = match local {
        Some(local) => local,
        None => {
            return Some(Merged {
                record: incoming.clone(),
                refresh: true,
                event: MergeEvent::Joined,
            })
        }
    };

    if incoming.creation_timestamp < local.creation_timestamp {
        return None;
    }
    if incoming.creation_timestamp > local.creation_timestamp {
        return Some(Merged {
            record: incoming.clone(),
            refresh: incoming.state == MemberState::Alive,
            event: MergeEvent::Reincarnated,
        });
    }

    // Same incarnation from here on.
    let mut record = local.clone();
    let mut event = MergeEvent::Updated;
    if local.state == MemberState::Down || incoming.state == MemberState::Down {
        record.state = MemberState::Down;
        record.heartbeat = cmp::max(local.heartbeat, incoming.heartbeat);
    } else if local.state == MemberState::Left || incoming.state == MemberState::Left {
        record.state = MemberState::Left;
        record.heartbeat = cmp::max(local.heartbeat, incoming.heartbeat);
        if local.state != MemberState::Left {
            event = MergeEvent::Left;
        }
    } else if incoming.heartbeat > local.heartbeat {
        record.heartbeat = incoming.heartbeat;
        record.state = incoming.state;
    } else if incoming.heartbeat == local.heartbeat {
        record.state = cmp::max(local.state, incoming.state);
    }

    let refresh = record.state == MemberState::Alive && record != *local;
    if record == *local {
        return None;
    }

    Some(Merged { record, refresh, event })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::member::NodeId;

    fn member(creation_timestamp: i64, heartbeat: u64, state: MemberState) -> Member {
        Member {
            id: NodeId::new("127.0.0.1:9000"),
            storage_port: 9100,
            creation_timestamp,
            heartbeat,
            state,
        }
    }

    #[test]
    fn unknown_member_is_inserted() {
        let incoming = member(10, 0, MemberState::Alive);

        let merged = merge(None, &incoming).unwrap();

        assert_eq!(merged.record, incoming);
        assert_eq!(merged.event, MergeEvent::Joined);
        assert!(merged.refresh);
    }

    #[test]
    fn identical_record_is_idempotent() {
        for state in [MemberState::Alive, MemberState::Suspected, MemberState::Down, MemberState::Left] {
            let local = member(10, 4, state);
            assert_eq!(merge(Some(&local), &local.clone()), None, "state {:?}", state);
        }
    }

    #[test]
    fn larger_incarnation_always_wins() {
        let local = member(10, 99, MemberState::Alive);

        for state in [MemberState::Alive, MemberState::Suspected, MemberState::Down, MemberState::Left] {
            let incoming = member(11, 0, state);
            let merged = merge(Some(&local), &incoming).unwrap();

            assert_eq!(merged.record, incoming);
            assert_eq!(merged.event, MergeEvent::Reincarnated);
            assert_eq!(merged.refresh, state == MemberState::Alive);
        }
    }

    #[test]
    fn smaller_incarnation_is_ignored() {
        let local = member(10, 0, MemberState::Down);
        let incoming = member(9, 50, MemberState::Alive);

        assert_eq!(merge(Some(&local), &incoming), None);
    }

    #[test]
    fn down_is_sticky_within_incarnation() {
        let local = member(10, 3, MemberState::Down);
        let incoming = member(10, 8, MemberState::Alive);

        let merged = merge(Some(&local), &incoming).unwrap();

        assert_eq!(merged.record.state, MemberState::Down);
        assert_eq!(merged.record.heartbeat, 8);
        assert!(!merged.refresh);
    }

    #[test]
    fn incoming_down_overrides_higher_local_heartbeat() {
        let local = member(10, 20, MemberState::Alive);
        let incoming = member(10, 1, MemberState::Down);

        let merged = merge(Some(&local), &incoming).unwrap();

        assert_eq!(merged.record.state, MemberState::Down);
        assert_eq!(merged.record.heartbeat, 20);
    }

    #[test]
    fn left_reported_once() {
        let local = member(10, 3, MemberState::Alive);
        let incoming = member(10, 3, MemberState::Left);

        let merged = merge(Some(&local), &incoming).unwrap();
        assert_eq!(merged.record.state, MemberState::Left);
        assert_eq!(merged.event, MergeEvent::Left);

        // Second copy of the same leave changes nothing.
        assert_eq!(merge(Some(&merged.record), &incoming), None);
        // A later heartbeat from a left member still records it as left, without a new event.
        let later = member(10, 9, MemberState::Alive);
        let merged_again = merge(Some(&merged.record), &later).unwrap();
        assert_eq!(merged_again.record.state, MemberState::Left);
        assert_eq!(merged_again.event, MergeEvent::Updated);
    }

    #[test]
    fn higher_heartbeat_wins_and_refreshes() {
        let local = member(10, 3, MemberState::Suspected);
        let incoming = member(10, 4, MemberState::Alive);

        let merged = merge(Some(&local), &incoming).unwrap();

        assert_eq!(merged.record, incoming);
        assert!(merged.refresh);
    }

    #[test]
    fn lower_heartbeat_is_ignored() {
        let local = member(10, 5, MemberState::Alive);
        let incoming = member(10, 4, MemberState::Suspected);

        assert_eq!(merge(Some(&local), &incoming), None);
    }

    #[test]
    fn heartbeat_tie_takes_more_severe_state() {
        let local = member(10, 5, MemberState::Alive);
        let incoming = member(10, 5, MemberState::Suspected);

        let merged = merge(Some(&local), &incoming).unwrap();
        assert_eq!(merged.record.state, MemberState::Suspected);
        assert!(!merged.refresh);

        // Other direction keeps the local suspicion.
        assert_eq!(merge(Some(&merged.record), &local), None);
    }
}
