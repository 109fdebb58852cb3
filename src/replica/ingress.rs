use tokio::sync::{mpsc, oneshot};

use crate::{
    common::{Digest, Error, Result},
    network::{GroupEvent, MemberId, VirtualSynchronySet},
};
use super::{
    message::{Transaction, TxKind},
    processor::EngineState,
};

/// Events consumed by the [`ReplicaProcessor`](super::ReplicaProcessor).
pub enum Event {
    Submit {
        kind: TxKind,
        operand: f64,
        responder: oneshot::Sender<Result<Transaction>>,
    },
    /// Multicast the pending buffer. Timer ticks carry no responder.
    Flush {
        responder: Option<oneshot::Sender<FlushReport>>,
    },
    Deliver(GroupEvent),
    /// Set the quorum latch and start applying deliveries.
    Activate { responder: oneshot::Sender<()> },
    CleanHistory { responder: oneshot::Sender<()> },
    Query(Query),
}

pub enum Query {
    Balance(oneshot::Sender<f64>),
    History(oneshot::Sender<History>),
    Membership(oneshot::Sender<MembershipSnapshot>),
    Status(oneshot::Sender<Status>),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct FlushReport {
    pub sent: usize,
    pub dropped: usize,
    pub requeued: usize,
}

#[derive(Clone, Debug)]
pub struct History {
    pub executed: Vec<Transaction>,
    pub pending: Vec<Transaction>,
}

#[derive(Clone, Debug)]
pub struct MembershipSnapshot {
    pub group: String,
    pub view_id: u64,
    pub members: Vec<MemberId>,
    pub partitions: Vec<VirtualSynchronySet>,
    pub minimum: usize,
    pub latched: bool,
}

#[derive(Clone, Debug)]
pub struct Status {
    pub state: EngineState,
    pub balance: f64,
    pub order_counter: u64,
    pub fingerprint: Digest,
    pub held: usize,
}

/// Ingress mailbox for the replica processor.
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Event>,
}

impl Mailbox {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Mailbox { sender }
    }

    pub async fn submit(&self, kind: TxKind, operand: f64) -> Result<Transaction> {
        self.ask(|responder| Event::Submit {
            kind,
            operand,
            responder,
        })
        .await?
    }

    /// Flush now and wait for the report.
    pub async fn flush(&self) -> Result<FlushReport> {
        self.ask(|responder| Event::Flush {
            responder: Some(responder),
        })
        .await
    }

    /// Request a flush without waiting for it.
    pub async fn tick(&self) -> Result<()> {
        self.send(Event::Flush { responder: None }).await
    }

    pub async fn deliver(&self, event: GroupEvent) -> Result<()> {
        self.send(Event::Deliver(event)).await
    }

    pub async fn activate(&self) -> Result<()> {
        self.ask(|responder| Event::Activate { responder }).await
    }

    pub async fn clean_history(&self) -> Result<()> {
        self.ask(|responder| Event::CleanHistory { responder }).await
    }

    pub async fn balance(&self) -> Result<f64> {
        self.ask(|responder| Event::Query(Query::Balance(responder))).await
    }

    pub async fn history(&self) -> Result<History> {
        self.ask(|responder| Event::Query(Query::History(responder))).await
    }

    pub async fn membership(&self) -> Result<MembershipSnapshot> {
        self.ask(|responder| Event::Query(Query::Membership(responder))).await
    }

    pub async fn status(&self) -> Result<Status> {
        self.ask(|responder| Event::Query(Query::Status(responder))).await
    }

    async fn send(&self, event: Event) -> Result<()> {
        self.sender.send(event).await.map_err(|_| Error::MailboxClosed)
    }

    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Event) -> Result<T> {
        let (responder, receiver) = oneshot::channel();
        self.send(build(responder)).await?;
        receiver.await.map_err(|_| Error::MailboxClosed)
    }
}
