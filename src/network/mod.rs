pub mod daemon;
pub mod node;
pub mod tcp;

pub use daemon::*;
pub use node::*;
pub use tcp::*;

use std::{fmt, future::Future};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::common::Result;

/*
    The group communication service delivers every message sent to a group,
    and every change of the group's membership, to all current members in one
    agreed order. Membership changes are delivered in the same stream as
    application messages, so each member sees the same messages between two
    consecutive views (virtual synchrony). The replica engine only depends on
    the contract in this module; `daemon` provides an in-process sequencer and
    `tcp` exposes that sequencer to other processes.
*/

/// Name of a connected member, unique per daemon.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct MemberId(pub String);

impl MemberId {
    pub fn new(name: impl Into<String>) -> Self {
        MemberId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery guarantee requested for a multicast.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Guarantee {
    Unreliable,
    Reliable,
    Fifo,
    Causal,
    Agreed,
    /// Totally ordered and agreed by every current member before delivery.
    Safe,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct VirtualSynchronySet {
    pub members: Vec<MemberId>,
    /// Whether the receiving member belongs to this set.
    pub local: bool,
}

/// The reason a regular membership was installed.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum MembershipCause {
    Join(MemberId),
    Leave(MemberId),
    Disconnect(MemberId),
    Network(Vec<VirtualSynchronySet>),
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct MembershipInfo {
    pub group: String,
    /// Increases with every view installed for the group.
    pub view_id: u64,
    /// Full membership snapshot after the change.
    pub members: Vec<MemberId>,
    pub cause: MembershipCause,
}

/// Everything a connection receives from the daemon, in delivery order.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum GroupEvent {
    Message {
        group: String,
        sender: MemberId,
        guarantee: Guarantee,
        payload: Vec<u8>,
    },
    Membership(MembershipInfo),
    /// A regular membership for `group` follows.
    Transitional { group: String },
    /// This member left `group`; no more events for it follow.
    SelfLeave { group: String },
}

/// Ordered stream of events for one connection.
pub type EventStream = UnboundedReceiver<GroupEvent>;

/// A connection to a group communication daemon.
pub trait GroupConnection: Send + Sync + 'static {
    fn member(&self) -> &MemberId;

    fn join(&self, group: &str) -> impl Future<Output = Result<()>> + Send;

    fn leave(&self, group: &str) -> impl Future<Output = Result<()>> + Send;

    fn multicast(
        &self,
        group: &str,
        guarantee: Guarantee,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;
}
