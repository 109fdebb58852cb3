use std::{collections::VecDeque, sync::Arc};

use tokio::sync::mpsc::Receiver;
use tracing::{debug, error, info, warn};

use crate::{
    common::{short_hex, Error, FailurePolicy, Hashable, ReplicaConfig, Result},
    network::{GroupConnection, GroupEvent, Guarantee, MemberId, MembershipCause, MembershipInfo},
};
use super::{
    ingress::{Event, FlushReport, History, MembershipSnapshot, Query, Status},
    message::{Transaction, TxKind, WireMessage},
    peers::MembershipView,
    pending::PendingBuffer,
    quorum::QuorumState,
    store::{Applied, Ledger},
};

/*
    The processor is the only owner of the replica state. Submissions, flush
    ticks, deliveries and queries all arrive through one mailbox and are
    handled one at a time, so a flush can never interleave with a delivery.
    Deliveries are applied in the order the group service hands them over;
    since every replica receives the same order, every replica folds the same
    sequence into its balance.
*/

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EngineState {
    /// Only membership is tracked. Application messages are held.
    AwaitingQuorum,
    Active,
}

pub struct ReplicaProcessor<C: GroupConnection> {
    pub member: MemberId,
    pub group: String,
    pub state: EngineState,
    pub quorum: QuorumState,
    pub view: MembershipView,
    pub ledger: Ledger,
    pub pending: PendingBuffer,
    pub failure_policy: FailurePolicy,
    /// Deliveries received before activation, in arrival order.
    held: VecDeque<(MemberId, Vec<u8>)>,
    connection: Arc<C>,
    mailbox: Receiver<Event>,
}

impl<C: GroupConnection> ReplicaProcessor<C> {
    pub fn new(connection: Arc<C>, config: &ReplicaConfig, mailbox: Receiver<Event>) -> Self {
        let member = connection.member().clone();
        ReplicaProcessor {
            pending: PendingBuffer::new(member.clone()),
            member,
            group: config.account.clone(),
            state: EngineState::AwaitingQuorum,
            quorum: QuorumState::new(config.minimum_replicas),
            view: MembershipView::default(),
            ledger: Ledger::new(),
            failure_policy: config.failure_policy,
            held: VecDeque::new(),
            connection,
            mailbox,
        }
    }

    pub async fn run(mut self) {
        info!(member = %self.member, group = %self.group, "replica processor started");
        while let Some(event) = self.mailbox.recv().await {
            match event {
                Event::Submit {
                    kind,
                    operand,
                    responder,
                } => {
                    let _ = responder.send(self.submit(kind, operand));
                }
                Event::Flush { responder } => {
                    let report = self.flush().await;
                    if let Some(responder) = responder {
                        let _ = responder.send(report);
                    }
                }
                Event::Deliver(event) => self.handle_group_event(event).await,
                Event::Activate { responder } => {
                    self.activate();
                    let _ = responder.send(());
                }
                Event::CleanHistory { responder } => {
                    self.ledger.clean_history();
                    let _ = responder.send(());
                }
                Event::Query(query) => self.answer(query),
            }
        }
        info!(member = %self.member, "replica processor stopped");
    }

    fn submit(&mut self, kind: TxKind, operand: f64) -> Result<Transaction> {
        if self.state != EngineState::Active {
            return Err(Error::QuorumNotReached {
                members: self.view.size(),
                minimum: self.quorum.minimum(),
            });
        }
        if !operand.is_finite() {
            return Err(Error::Command(format!("{kind} needs a finite number")));
        }
        let tx = self.pending.submit(kind, operand);
        debug!(id = %tx.unique_id, pending = self.pending.len(), "queued transaction");
        Ok(tx)
    }

    async fn flush(&mut self) -> FlushReport {
        let mut report = FlushReport::default();
        if self.state != EngineState::Active || self.pending.is_empty() {
            return report;
        }

        let mut failed = Vec::new();
        for tx in self.pending.take() {
            let payload = WireMessage::from(&tx).to_string().into_bytes();
            match self.connection.multicast(&self.group, Guarantee::Safe, payload).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    error!(id = %tx.unique_id, error = %e, "unable to multicast transaction");
                    match self.failure_policy {
                        FailurePolicy::Drop => report.dropped += 1,
                        FailurePolicy::Requeue => {
                            report.requeued += 1;
                            failed.push(tx);
                        }
                    }
                }
            }
        }
        self.pending.requeue(failed);
        self.pending.finish_batch();

        info!(
            sent = report.sent,
            dropped = report.dropped,
            requeued = report.requeued,
            "flushed pending transactions"
        );
        report
    }

    fn activate(&mut self) {
        if self.state == EngineState::Active {
            return;
        }
        self.quorum.latch();
        self.state = EngineState::Active;
        info!(held = self.held.len(), members = self.view.size(), "replica active");

        // Apply what arrived while waiting, in arrival order
        while let Some((sender, payload)) = self.held.pop_front() {
            self.apply(&sender, &payload);
        }
    }

    async fn handle_group_event(&mut self, event: GroupEvent) {
        match event {
            GroupEvent::Message {
                group,
                sender,
                payload,
                ..
            } => {
                if group != self.group {
                    debug!(%group, "ignoring message for another group");
                    return;
                }
                if self.state == EngineState::AwaitingQuorum {
                    self.held.push_back((sender, payload));
                    return;
                }
                self.apply(&sender, &payload);
            }
            GroupEvent::Membership(info) => {
                if info.group != self.group {
                    return;
                }
                self.handle_membership(info).await;
            }
            GroupEvent::Transitional { group } => {
                info!(%group, "transitional membership");
            }
            GroupEvent::SelfLeave { group } => {
                info!(%group, "left group");
            }
        }
    }

    async fn handle_membership(&mut self, info: MembershipInfo) {
        self.view.update(&info);
        info!(
            view_id = info.view_id,
            members = self.view.size(),
            "regular membership"
        );

        match &info.cause {
            MembershipCause::Join(joined) => {
                info!(%joined, "member joined");
                // Every latched existing member sends; all hold the same prefix
                if *joined != self.member
                    && self.quorum.is_latched()
                    && self.view.is_member(&self.member)
                {
                    self.send_balance(joined).await;
                }
            }
            MembershipCause::Leave(left) => info!(%left, "member left"),
            MembershipCause::Disconnect(left) => info!(%left, "member disconnected"),
            MembershipCause::Network(sets) => {
                // Observed only; diverged balances are not merged
                warn!(sets = sets.len(), "network change");
                for (i, set) in sets.iter().enumerate() {
                    let members: Vec<&str> = set.members.iter().map(MemberId::as_str).collect();
                    info!(set = i, local = set.local, ?members, "virtual synchrony set");
                }
            }
        }
    }

    async fn send_balance(&self, joined: &MemberId) {
        let balance = self.ledger.balance();
        let payload = WireMessage::Balance(balance).to_string().into_bytes();
        match self.connection.multicast(&self.group, Guarantee::Safe, payload).await {
            Ok(()) => info!(%joined, balance, "sent balance to new member"),
            Err(e) => error!(%joined, error = %e, "unable to send balance"),
        }
    }

    fn apply(&mut self, sender: &MemberId, payload: &[u8]) {
        let message = std::str::from_utf8(payload)
            .map_err(|_| Error::Wire {
                message: String::from_utf8_lossy(payload).into_owned(),
                reason: "not utf-8".into(),
            })
            .and_then(|text| text.parse::<WireMessage>());
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(%sender, error = %e, "ignoring message");
                return;
            }
        };

        match message {
            WireMessage::Balance(balance) => {
                self.ledger.overwrite_balance(balance);
                info!(%sender, balance, "balance overwritten");
            }
            WireMessage::Transaction {
                kind,
                operand,
                unique_id,
            } => {
                let tx = Transaction {
                    kind,
                    operand,
                    unique_id,
                    origin: sender.clone(),
                };
                let id = tx.unique_id.clone();
                match self.ledger.execute(tx) {
                    Applied::Executed { order } => debug!(
                        %id,
                        order,
                        balance = self.ledger.balance(),
                        "executed transaction"
                    ),
                    Applied::Duplicate => warn!(%id, "discarding duplicate transaction"),
                }
            }
        }
    }

    fn answer(&self, query: Query) {
        match query {
            Query::Balance(responder) => {
                let _ = responder.send(self.ledger.balance());
            }
            Query::History(responder) => {
                let _ = responder.send(History {
                    executed: self.ledger.executed().to_vec(),
                    pending: self.pending.transactions().to_vec(),
                });
            }
            Query::Membership(responder) => {
                let _ = responder.send(MembershipSnapshot {
                    group: self.group.clone(),
                    view_id: self.view.view_id,
                    members: self.view.members.clone(),
                    partitions: self.view.partitions.clone(),
                    minimum: self.quorum.minimum(),
                    latched: self.quorum.is_latched(),
                });
            }
            Query::Status(responder) => {
                let fingerprint = self.ledger.hash();
                debug!(fingerprint = %short_hex(&fingerprint), "status requested");
                let _ = responder.send(Status {
                    state: self.state,
                    balance: self.ledger.balance(),
                    order_counter: self.ledger.order_counter(),
                    fingerprint,
                    held: self.held.len(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use tokio::{sync::mpsc, time::timeout};

    use super::*;
    use crate::{
        network::VirtualSynchronySet,
        replica::{await_quorum, Mailbox, Ready},
    };

    /// Records multicasts instead of sending them.
    struct Recorder {
        member: MemberId,
        sent: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl Recorder {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl GroupConnection for Recorder {
        fn member(&self) -> &MemberId {
            &self.member
        }

        async fn join(&self, _group: &str) -> Result<()> {
            Ok(())
        }

        async fn leave(&self, _group: &str) -> Result<()> {
            Ok(())
        }

        async fn multicast(&self, group: &str, guarantee: Guarantee, payload: Vec<u8>) -> Result<()> {
            assert_eq!(guarantee, Guarantee::Safe);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Multicast {
                    group: group.to_string(),
                    reason: "daemon unreachable".into(),
                });
            }
            self.sent.lock().unwrap().push(String::from_utf8(payload).unwrap());
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn start(name: &str, minimum: usize, policy: FailurePolicy) -> (Mailbox, Arc<Recorder>) {
        let recorder = Arc::new(Recorder {
            member: MemberId::new(name),
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        });
        let mut config = ReplicaConfig::new("savings", minimum);
        config.failure_policy = policy;
        let (sender, receiver) = mpsc::channel(100);
        let processor = ReplicaProcessor::new(recorder.clone(), &config, receiver);
        tokio::spawn(processor.run());
        (Mailbox::new(sender), recorder)
    }

    fn view(view_id: u64, members: &[&str], cause: MembershipCause) -> GroupEvent {
        GroupEvent::Membership(MembershipInfo {
            group: "savings".into(),
            view_id,
            members: members.iter().map(|m| MemberId::new(*m)).collect(),
            cause,
        })
    }

    fn joined(name: &str) -> MembershipCause {
        MembershipCause::Join(MemberId::new(name))
    }

    fn message(sender: &str, line: &str) -> GroupEvent {
        GroupEvent::Message {
            group: "savings".into(),
            sender: MemberId::new(sender),
            guarantee: Guarantee::Safe,
            payload: line.as_bytes().to_vec(),
        }
    }

    async fn active(name: &str, policy: FailurePolicy) -> (Mailbox, Arc<Recorder>) {
        let (mailbox, recorder) = start(name, 1, policy);
        mailbox.deliver(view(1, &[name], joined(name))).await.unwrap();
        mailbox.activate().await.unwrap();
        (mailbox, recorder)
    }

    #[tokio::test]
    async fn test_submit_rejected_before_quorum() {
        let (mailbox, recorder) = start("r1", 2, FailurePolicy::Drop);
        mailbox.deliver(view(1, &["r1"], joined("r1"))).await.unwrap();

        let result = mailbox.submit(TxKind::Deposit, 5.0).await;
        assert!(matches!(
            result,
            Err(Error::QuorumNotReached {
                members: 1,
                minimum: 2
            })
        ));
        assert_eq!(mailbox.flush().await.unwrap(), FlushReport::default());
        assert!(recorder.sent().is_empty());
    }

    #[tokio::test]
    async fn test_gate_waits_for_minimum() {
        let (mailbox, _recorder) = start("r1", 2, FailurePolicy::Drop);
        mailbox.deliver(view(1, &["r1"], joined("r1"))).await.unwrap();

        let gate = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { await_quorum(&mailbox, 2, Duration::from_millis(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!gate.is_finished());
        assert_eq!(mailbox.status().await.unwrap().state, EngineState::AwaitingQuorum);

        mailbox.deliver(view(2, &["r1", "r2"], joined("r2"))).await.unwrap();
        let ready = timeout(Duration::from_secs(2), gate).await.unwrap().unwrap().unwrap();
        assert_eq!(ready, Ready);
        assert_eq!(mailbox.status().await.unwrap().state, EngineState::Active);

        // The latch holds when the group shrinks again
        mailbox
            .deliver(view(3, &["r1"], MembershipCause::Leave(MemberId::new("r2"))))
            .await
            .unwrap();
        assert!(mailbox.submit(TxKind::Deposit, 1.0).await.is_ok());
        assert!(mailbox.membership().await.unwrap().latched);
    }

    #[tokio::test]
    async fn test_flush_multicasts_each_transaction() {
        let (mailbox, recorder) = active("r1", FailurePolicy::Drop).await;
        mailbox.submit(TxKind::Deposit, 100.0).await.unwrap();
        mailbox.submit(TxKind::AddInterest, 10.0).await.unwrap();

        let report = mailbox.flush().await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(recorder.sent(), vec!["deposit 100 r1#1.1", "addInterest 10 r1#1.2"]);
        assert!(mailbox.history().await.unwrap().pending.is_empty());

        // Sequence restarts in a new batch
        let tx = mailbox.submit(TxKind::Deposit, 1.0).await.unwrap();
        assert_eq!(tx.unique_id.as_str(), "r1#2.1");
    }

    #[tokio::test]
    async fn test_failed_multicast_dropped() {
        let (mailbox, recorder) = active("r1", FailurePolicy::Drop).await;
        recorder.fail.store(true, Ordering::SeqCst);
        mailbox.submit(TxKind::Deposit, 100.0).await.unwrap();

        let report = mailbox.flush().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(mailbox.history().await.unwrap().pending.is_empty());

        recorder.fail.store(false, Ordering::SeqCst);
        assert_eq!(mailbox.flush().await.unwrap().sent, 0);
        assert!(recorder.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failed_multicast_requeued_with_same_id() {
        let (mailbox, recorder) = active("r1", FailurePolicy::Requeue).await;
        recorder.fail.store(true, Ordering::SeqCst);
        let tx = mailbox.submit(TxKind::Deposit, 100.0).await.unwrap();

        let report = mailbox.flush().await.unwrap();
        assert_eq!(report.requeued, 1);
        let pending = mailbox.history().await.unwrap().pending;
        assert_eq!(pending[0].unique_id, tx.unique_id);

        recorder.fail.store(false, Ordering::SeqCst);
        assert_eq!(mailbox.flush().await.unwrap().sent, 1);
        assert_eq!(recorder.sent(), vec![format!("deposit 100 {}", tx.unique_id)]);
    }

    #[tokio::test]
    async fn test_deliveries_held_until_activation() {
        let (mailbox, _recorder) = start("r3", 3, FailurePolicy::Drop);
        mailbox.deliver(view(4, &["r1", "r2", "r3"], joined("r3"))).await.unwrap();
        mailbox.deliver(message("r1", "balance 40")).await.unwrap();
        mailbox.deliver(message("r2", "deposit 2 r2#5.1")).await.unwrap();

        let status = mailbox.status().await.unwrap();
        assert_eq!(status.held, 2);
        assert_eq!(status.balance, 0.0);

        mailbox.activate().await.unwrap();
        let status = mailbox.status().await.unwrap();
        assert_eq!(status.held, 0);
        assert_eq!(status.balance, 42.0);
        assert_eq!(status.order_counter, 1);
    }

    #[tokio::test]
    async fn test_late_join_balance_sync() {
        let (mailbox, _recorder) = start("r4", 3, FailurePolicy::Drop);
        mailbox.deliver(view(5, &["r1", "r2", "r3", "r4"], joined("r4"))).await.unwrap();
        mailbox.deliver(message("r1", "balance 110.5")).await.unwrap();
        mailbox.activate().await.unwrap();

        let status = mailbox.status().await.unwrap();
        assert_eq!(status.balance, 110.5);
        assert_eq!(status.order_counter, 0);
        assert!(mailbox.history().await.unwrap().executed.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_messages_ignored() {
        let (mailbox, _recorder) = active("r1", FailurePolicy::Drop).await;
        mailbox.deliver(message("r2", "withdraw 5 r2#1.1")).await.unwrap();
        mailbox.deliver(message("r2", "deposit lots r2#1.2")).await.unwrap();
        mailbox
            .deliver(GroupEvent::Message {
                group: "savings".into(),
                sender: MemberId::new("r2"),
                guarantee: Guarantee::Safe,
                payload: vec![0xff, 0xfe],
            })
            .await
            .unwrap();
        mailbox.deliver(message("r2", "deposit 7 r2#1.3")).await.unwrap();

        assert_eq!(mailbox.balance().await.unwrap(), 7.0);
        assert_eq!(mailbox.status().await.unwrap().order_counter, 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_applied_once() {
        let (mailbox, _recorder) = active("r1", FailurePolicy::Drop).await;
        mailbox.deliver(message("r2", "deposit 100 r2#1.1")).await.unwrap();
        mailbox.deliver(message("r2", "addInterest 10 r2#1.2")).await.unwrap();
        let once = mailbox.balance().await.unwrap();
        mailbox.deliver(message("r2", "addInterest 10 r2#1.2")).await.unwrap();

        assert_eq!(mailbox.balance().await.unwrap(), once);
        assert_eq!(mailbox.history().await.unwrap().executed.len(), 2);
    }

    #[tokio::test]
    async fn test_every_latched_member_sends_balance() {
        let (first, first_sent) = start("r1", 2, FailurePolicy::Drop);
        let (second, second_sent) = start("r2", 2, FailurePolicy::Drop);
        for mailbox in [&first, &second] {
            mailbox.deliver(view(2, &["r1", "r2"], joined("r2"))).await.unwrap();
            mailbox.activate().await.unwrap();
            mailbox.deliver(message("r2", "deposit 25 r2#1.1")).await.unwrap();
            mailbox.deliver(view(3, &["r1", "r2", "r3"], joined("r3"))).await.unwrap();
        }

        // Queries are answered after the membership event is handled
        first.status().await.unwrap();
        second.status().await.unwrap();
        assert_eq!(first_sent.sent(), vec!["balance 25"]);
        assert_eq!(second_sent.sent(), vec!["balance 25"]);
    }

    #[tokio::test]
    async fn test_balance_sent_when_oldest_member_unlatched() {
        let (oldest, oldest_sent) = start("r1", 2, FailurePolicy::Drop);
        let (second, second_sent) = start("r2", 2, FailurePolicy::Drop);
        for mailbox in [&oldest, &second] {
            mailbox.deliver(view(2, &["r1", "r2"], joined("r2"))).await.unwrap();
        }
        second.activate().await.unwrap();
        for mailbox in [&oldest, &second] {
            mailbox.deliver(message("r2", "deposit 100 r2#1.1")).await.unwrap();
            mailbox.deliver(view(3, &["r1", "r2", "r3"], joined("r3"))).await.unwrap();
        }

        assert_eq!(oldest.status().await.unwrap().state, EngineState::AwaitingQuorum);
        second.status().await.unwrap();
        assert!(oldest_sent.sent().is_empty());
        assert_eq!(second_sent.sent(), vec!["balance 100"]);
    }

    #[tokio::test]
    async fn test_joiner_does_not_send_balance() {
        let (mailbox, recorder) = active("r1", FailurePolicy::Drop).await;
        mailbox.deliver(view(2, &["r0", "r1"], joined("r1"))).await.unwrap();
        mailbox.status().await.unwrap();
        assert!(recorder.sent().is_empty());
    }

    #[tokio::test]
    async fn test_no_balance_sync_before_latch() {
        let (mailbox, recorder) = start("r1", 3, FailurePolicy::Drop);
        mailbox.deliver(view(1, &["r1"], joined("r1"))).await.unwrap();
        mailbox.deliver(view(2, &["r1", "r2"], joined("r2"))).await.unwrap();
        mailbox.status().await.unwrap();
        assert!(recorder.sent().is_empty());
    }

    #[tokio::test]
    async fn test_network_change_is_observed_only() {
        let (mailbox, _recorder) = active("r1", FailurePolicy::Drop).await;
        mailbox.deliver(message("r2", "deposit 10 r2#1.1")).await.unwrap();
        let sets = vec![
            VirtualSynchronySet {
                members: vec![MemberId::new("r1")],
                local: true,
            },
            VirtualSynchronySet {
                members: vec![MemberId::new("r2")],
                local: false,
            },
        ];
        mailbox
            .deliver(view(9, &["r1", "r2"], MembershipCause::Network(sets.clone())))
            .await
            .unwrap();

        let snapshot = mailbox.membership().await.unwrap();
        assert_eq!(snapshot.partitions, sets);
        assert_eq!(snapshot.view_id, 9);
        assert_eq!(mailbox.balance().await.unwrap(), 10.0);
    }

    #[tokio::test]
    async fn test_clean_history_keeps_pending_and_balance() {
        let (mailbox, _recorder) = active("r1", FailurePolicy::Drop).await;
        mailbox.deliver(message("r2", "deposit 10 r2#1.1")).await.unwrap();
        mailbox.submit(TxKind::Deposit, 3.0).await.unwrap();
        mailbox.clean_history().await.unwrap();

        let history = mailbox.history().await.unwrap();
        assert!(history.executed.is_empty());
        assert_eq!(history.pending.len(), 1);
        assert_eq!(mailbox.balance().await.unwrap(), 10.0);
    }
}
