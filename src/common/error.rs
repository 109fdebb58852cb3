use thiserror::Error;

use crate::network::MemberId;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the replica engine, the group service and the console.
#[derive(Debug, Error)]
pub enum Error {
    /// The daemon could not be reached or refused the connection.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Another connection already uses this member name.
    #[error("member name {0} is already connected")]
    DuplicateMember(MemberId),

    /// Joining or leaving a group failed.
    #[error("group {group}: {reason}")]
    Group { group: String, reason: String },

    /// A multicast was not accepted by the daemon.
    #[error("multicast to {group} failed: {reason}")]
    Multicast { group: String, reason: String },

    /// The connection was closed by either side.
    #[error("connection closed")]
    Disconnected,

    /// The replica processor stopped and no longer accepts events.
    #[error("replica mailbox closed")]
    MailboxClosed,

    /// Submissions are refused until the quorum latch is set.
    #[error("quorum not reached: {members} of {minimum} replicas present")]
    QuorumNotReached { members: usize, minimum: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An application message did not match the wire format.
    #[error("malformed message {message:?}: {reason}")]
    Wire { message: String, reason: String },

    /// An operator command could not be understood.
    #[error("{0}")]
    Command(String),

    #[error("frame encoding failed")]
    Frame(#[from] serde_json::Error),

    #[error("io error")]
    Io(#[from] std::io::Error),
}
