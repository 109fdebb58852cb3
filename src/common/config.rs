use std::time::Duration;

use super::error::{Error, Result};

/// Period at which the quorum gate re-checks the group size.
pub const DEFAULT_QUORUM_POLL: Duration = Duration::from_secs(6);

/// Period at which pending transactions are multicast.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

pub const DEFAULT_MAILBOX_SIZE: usize = 1024;

/// What happens to a pending transaction whose multicast fails.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FailurePolicy {
    /// Log the failure and forget the transaction.
    #[default]
    Drop,
    /// Keep the transaction, with its original id, for the next flush.
    Requeue,
}

/// Configuration for a [`Node`](crate::network::Node).
#[derive(Clone, Debug)]
pub struct ReplicaConfig {
    /// The account name, used as the group name.
    pub account: String,

    /// Number of replicas that must be present before any transaction is sent.
    pub minimum_replicas: usize,

    pub quorum_poll: Duration,

    pub flush_interval: Duration,

    /// The maximum size of the processor mailbox backlog.
    pub mailbox_size: usize,

    pub failure_policy: FailurePolicy,
}

impl ReplicaConfig {
    pub fn new(account: impl Into<String>, minimum_replicas: usize) -> Self {
        ReplicaConfig {
            account: account.into(),
            minimum_replicas,
            quorum_poll: DEFAULT_QUORUM_POLL,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            mailbox_size: DEFAULT_MAILBOX_SIZE,
            failure_policy: FailurePolicy::Drop,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.minimum_replicas < 1 {
            return Err(Error::InvalidConfig("at least one replica is required".into()));
        }
        if self.account.is_empty() || self.account.contains(char::is_whitespace) {
            return Err(Error::InvalidConfig(format!("bad account name {:?}", self.account)));
        }
        if self.quorum_poll.is_zero() || self.flush_interval.is_zero() {
            return Err(Error::InvalidConfig("timer periods must be non-zero".into()));
        }
        if self.mailbox_size == 0 {
            return Err(Error::InvalidConfig("mailbox size must be non-zero".into()));
        }
        Ok(())
    }
}
