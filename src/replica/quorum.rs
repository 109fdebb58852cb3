use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

use crate::common::Result;
use super::ingress::Mailbox;

/*
    Nothing is broadcast until the group has held at least `minimum` replicas
    once. The latch never resets: a replica that later sees the group shrink
    below the minimum keeps accepting and sending transactions.
*/

#[derive(Clone, Copy, Debug)]
pub struct QuorumState {
    minimum: usize,
    latched: bool,
}

impl QuorumState {
    pub fn new(minimum: usize) -> Self {
        QuorumState {
            minimum,
            latched: false,
        }
    }

    pub fn minimum(&self) -> usize {
        self.minimum
    }

    pub fn is_met(&self, members: usize) -> bool {
        members >= self.minimum
    }

    pub fn missing(&self, members: usize) -> usize {
        self.minimum.saturating_sub(members)
    }

    pub fn latch(&mut self) {
        self.latched = true;
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }
}

/// Proof that the quorum latch was set.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Ready;

/// Block until the replica has seen `minimum` members, then latch.
///
/// The group size is re-read every `poll`. There is no timeout: if the group
/// never grows large enough this never returns.
pub async fn await_quorum(mailbox: &Mailbox, minimum: usize, poll: Duration) -> Result<Ready> {
    let quorum = QuorumState::new(minimum);
    let mut ticker = interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let members = mailbox.membership().await?.members.len();
        if quorum.is_met(members) {
            mailbox.activate().await?;
            info!(members, minimum, "quorum reached");
            return Ok(Ready);
        }
        info!(
            members,
            need = quorum.missing(members),
            retry_in = ?poll,
            "not enough replicas to run"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_state() {
        let mut quorum = QuorumState::new(3);
        assert!(!quorum.is_met(2));
        assert_eq!(quorum.missing(2), 1);
        assert!(quorum.is_met(3));
        assert_eq!(quorum.missing(5), 0);

        assert!(!quorum.is_latched());
        quorum.latch();
        assert!(quorum.is_latched());
    }
}
