use crate::membership::member::{Member, NodeId, NodeRole};

/// The leader tier as derived from one membership snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Leadership {
    pub(crate) leader: Option<NodeId>,
    pub(crate) sub_leaders: Vec<NodeId>,
}

impl Leadership {
    pub(crate) fn role_of(&self, id: &NodeId) -> NodeRole {
        if self.leader.as_ref() == Some(id) {
            NodeRole::Leader
        } else if self.sub_leaders.contains(id) {
            NodeRole::SubLeader
        } else {
            NodeRole::Follower
        }
    }
}

/// Oldest reachable members by incarnation lead. Ties on the timestamp are broken by identity so
/// that every node with the same view picks the same order.
pub(crate) fn derive<'a>(members: impl IntoIterator<Item = &'a Member>, num_leaders: usize) -> Leadership {
    let mut eligible: Vec<&Member> = members.into_iter().filter(|m| m.is_reachable()).collect();
    eligible.sort_by(|a, b| {
        a.creation_timestamp
            .cmp(&b.creation_timestamp)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut tier = eligible.into_iter().take(num_leaders).map(|m| m.id.clone());
    let leader = tier.next();
    let sub_leaders = tier.collect();

    Leadership { leader, sub_leaders }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::member::MemberState;

    fn member(port: u16, creation_timestamp: i64, state: MemberState) -> Member {
        Member {
            id: NodeId::new(format!("127.0.0.1:{}", port)),
            storage_port: port + 100,
            creation_timestamp,
            heartbeat: 0,
            state,
        }
    }

    #[test]
    fn oldest_members_form_the_tier() {
        let members = vec![
            member(5, 50, MemberState::Alive),
            member(1, 10, MemberState::Alive),
            member(3, 30, MemberState::Suspected),
            member(2, 20, MemberState::Alive),
            member(4, 40, MemberState::Alive),
        ];

        let leadership = derive(&members, 4);

        assert_eq!(leadership.leader, Some(members[1].id.clone()));
        assert_eq!(
            leadership.sub_leaders,
            vec![members[3].id.clone(), members[2].id.clone(), members[4].id.clone()]
        );
        assert_eq!(leadership.role_of(&members[0].id), NodeRole::Follower);
        assert_eq!(leadership.role_of(&members[2].id), NodeRole::SubLeader);
    }

    #[test]
    fn down_leader_promotes_next_oldest() {
        // -- setup --
        let mut members = vec![
            member(1, 10, MemberState::Alive),
            member(2, 20, MemberState::Alive),
            member(3, 30, MemberState::Alive),
        ];
        let before = derive(&members, 2);
        assert_eq!(before.leader, Some(members[0].id.clone()));

        // -- execute --
        members[0].state = MemberState::Down;
        let after = derive(&members, 2);

        // -- verify --
        assert_eq!(after.leader, Some(members[1].id.clone()));
        assert_eq!(after.sub_leaders, vec![members[2].id.clone()]);
        assert_eq!(after.role_of(&members[0].id), NodeRole::Follower);
    }

    #[test]
    fn left_members_are_not_eligible() {
        let members = vec![member(1, 10, MemberState::Left), member(2, 20, MemberState::Alive)];

        let leadership = derive(&members, 4);

        assert_eq!(leadership.leader, Some(members[1].id.clone()));
        assert!(leadership.sub_leaders.is_empty());
    }

    #[test]
    fn empty_view_has_no_leader() {
        let leadership = derive(&Vec::<Member>::new(), 4);

        assert_eq!(leadership, Leadership::default());
    }
}
