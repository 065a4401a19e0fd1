use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Default, Debug)]
pub struct NodeOptions {
    pub block_size: Option<u64>,
    pub replication_factor: Option<usize>,
    /// Size of the leader tier: the leader plus its sub-leaders.
    pub num_leaders: Option<usize>,
    pub gossip_fanout: Option<usize>,
    pub gossip_interval: Option<Duration>,
    pub scan_interval: Option<Duration>,
    pub t_fail: Option<Duration>,
    pub t_cleanup: Option<Duration>,
    pub message_drop_rate: Option<f64>,
    pub suspicion_enabled: Option<bool>,
    pub connect_timeout: Option<Duration>,
    pub header_timeout: Option<Duration>,
    pub poll_interval: Option<Duration>,
    pub poll_deadline: Option<Duration>,
    pub leader_ack_attempts: Option<usize>,
}

pub(super) struct NodeOptionsValidated {
    pub block_size: u64,
    pub replication_factor: usize,
    pub num_leaders: usize,
    pub gossip_fanout: usize,
    pub gossip_interval: Duration,
    pub scan_interval: Duration,
    pub t_fail: Duration,
    pub t_cleanup: Duration,
    pub message_drop_rate: f64,
    pub suspicion_enabled: bool,
    pub connect_timeout: Duration,
    pub header_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_deadline: Duration,
    pub leader_ack_attempts: usize,
}

impl NodeOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.block_size == 0 {
            return Err("Block size must be positive");
        }
        if self.replication_factor == 0 {
            return Err("Replication factor must be positive");
        }
        if self.num_leaders == 0 {
            return Err("Leader tier must hold at least one node");
        }
        if self.gossip_fanout == 0 {
            return Err("Gossip fan-out must be positive");
        }
        if !(0.0..=1.0).contains(&self.message_drop_rate) {
            return Err("Message drop rate must be within [0, 1]");
        }
        if self.t_fail <= self.gossip_interval {
            return Err("Failure timeout must be greater than the gossip interval");
        }
        if self.leader_ack_attempts == 0 {
            return Err("Leader ack attempts must be positive");
        }

        Ok(())
    }
}

impl TryFrom<NodeOptions> for NodeOptionsValidated {
    type Error = &'static str;

    fn try_from(options: NodeOptions) -> Result<Self, Self::Error> {
        let values = NodeOptionsValidated {
            block_size: options.block_size.unwrap_or(20 * 1024 * 1024),
            replication_factor: options.replication_factor.unwrap_or(4),
            num_leaders: options.num_leaders.unwrap_or(4),
            gossip_fanout: options.gossip_fanout.unwrap_or(2),
            gossip_interval: options.gossip_interval.unwrap_or(Duration::from_millis(200)),
            scan_interval: options.scan_interval.unwrap_or(Duration::from_millis(50)),
            t_fail: options.t_fail.unwrap_or(Duration::from_millis(1500)),
            t_cleanup: options.t_cleanup.unwrap_or(Duration::from_millis(1000)),
            message_drop_rate: options.message_drop_rate.unwrap_or(0.0),
            suspicion_enabled: options.suspicion_enabled.unwrap_or(false),
            connect_timeout: options.connect_timeout.unwrap_or(Duration::from_secs(1)),
            header_timeout: options.header_timeout.unwrap_or(Duration::from_secs(5)),
            poll_interval: options.poll_interval.unwrap_or(Duration::from_millis(250)),
            poll_deadline: options.poll_deadline.unwrap_or(Duration::from_secs(30)),
            leader_ack_attempts: options.leader_ack_attempts.unwrap_or(5),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let validated = NodeOptionsValidated::try_from(NodeOptions::default()).unwrap();

        assert_eq!(validated.block_size, 20 * 1024 * 1024);
        assert_eq!(validated.replication_factor, 4);
        assert_eq!(validated.num_leaders, 4);
        assert!(!validated.suspicion_enabled);
    }

    #[test]
    fn rejects_illegal_values() {
        let cases = vec![
            NodeOptions {
                block_size: Some(0),
                ..Default::default()
            },
            NodeOptions {
                replication_factor: Some(0),
                ..Default::default()
            },
            NodeOptions {
                num_leaders: Some(0),
                ..Default::default()
            },
            NodeOptions {
                gossip_fanout: Some(0),
                ..Default::default()
            },
            NodeOptions {
                message_drop_rate: Some(1.5),
                ..Default::default()
            },
            NodeOptions {
                message_drop_rate: Some(-0.1),
                ..Default::default()
            },
            NodeOptions {
                gossip_interval: Some(Duration::from_secs(2)),
                t_fail: Some(Duration::from_secs(2)),
                ..Default::default()
            },
        ];

        for options in cases {
            let debug = format!("{:?}", options);
            assert!(NodeOptionsValidated::try_from(options).is_err(), "{}", debug);
        }
    }
}
