pub mod ingress;
pub mod message;
pub mod peers;
pub mod pending;
pub mod processor;
pub mod quorum;
pub mod store;

pub use ingress::*;
pub use message::*;
pub use peers::*;
pub use pending::*;
pub use processor::*;
pub use quorum::*;
pub use store::*;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::{
        common::{Error, ReplicaConfig},
        network::{Daemon, GroupConnection, GroupEvent, LocalConnection, Node},
    };

    fn config(minimum: usize) -> ReplicaConfig {
        let mut config = ReplicaConfig::new("savings", minimum);
        config.quorum_poll = Duration::from_millis(10);
        // Flushes are driven by hand unless a test shortens this
        config.flush_interval = Duration::from_secs(3600);
        config
    }

    async fn start(daemon: &Daemon, name: &str, config: ReplicaConfig) -> Node<LocalConnection> {
        let (connection, events) = daemon.connect(name).await.unwrap();
        Node::start(connection, events, config).await.unwrap()
    }

    async fn ready(nodes: &[&Node<LocalConnection>]) {
        for node in nodes {
            timeout(Duration::from_secs(5), node.await_quorum())
                .await
                .expect("quorum not reached")
                .unwrap();
        }
    }

    async fn wait_for_balance(mailbox: &Mailbox, expected: &str) {
        let converged = timeout(Duration::from_secs(5), async {
            loop {
                let balance = mailbox.balance().await.unwrap();
                if format!("{balance:.2}") == expected {
                    return;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(converged.is_ok(), "balance never reached {expected}");
    }

    #[tokio::test]
    async fn test_end_to_end() {
        // Arrange: three replicas, all required
        let daemon = Daemon::spawn();
        let a = start(&daemon, "A", config(3)).await;
        let b = start(&daemon, "B", config(3)).await;
        let c = start(&daemon, "C", config(3)).await;
        ready(&[&a, &b, &c]).await;

        // Act: A deposits, one flush cycle
        a.mailbox().submit(TxKind::Deposit, 100.0).await.unwrap();
        assert_eq!(a.mailbox().flush().await.unwrap().sent, 1);

        // Assert: everyone reports 100.00
        for node in [&a, &b, &c] {
            wait_for_balance(&node.mailbox(), "100.00").await;
        }

        // Act: B adds interest, next flush cycle
        b.mailbox().submit(TxKind::AddInterest, 10.0).await.unwrap();
        b.mailbox().flush().await.unwrap();

        // Assert: everyone reports 110.00 with identical state
        for node in [&a, &b, &c] {
            wait_for_balance(&node.mailbox(), "110.00").await;
        }
        let expected = a.mailbox().status().await.unwrap();
        for node in [&b, &c] {
            let status = node.mailbox().status().await.unwrap();
            assert_eq!(status.balance.to_bits(), expected.balance.to_bits());
            assert_eq!(status.fingerprint, expected.fingerprint);
            assert_eq!(status.order_counter, 2);
        }
    }

    #[tokio::test]
    async fn test_concurrent_submitters_converge() {
        let daemon = Daemon::spawn();
        let a = start(&daemon, "A", config(2)).await;
        let b = start(&daemon, "B", config(2)).await;
        ready(&[&a, &b]).await;

        for i in 0..5 {
            a.mailbox().submit(TxKind::Deposit, 10.0 + i as f64).await.unwrap();
            b.mailbox().submit(TxKind::AddInterest, 1.5).await.unwrap();
        }
        let (ma, mb) = (a.mailbox(), b.mailbox());
        let (first, second) = tokio::join!(ma.flush(), mb.flush());
        assert_eq!(first.unwrap().sent + second.unwrap().sent, 10);

        let settled = timeout(Duration::from_secs(5), async {
            loop {
                let sa = a.mailbox().status().await.unwrap();
                let sb = b.mailbox().status().await.unwrap();
                if sa.order_counter == 10 && sb.order_counter == 10 {
                    return (sa, sb);
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("deliveries never settled");
        assert_eq!(settled.0.balance.to_bits(), settled.1.balance.to_bits());
        assert_eq!(settled.0.fingerprint, settled.1.fingerprint);
    }

    #[tokio::test]
    async fn test_no_traffic_below_quorum() {
        let daemon = Daemon::spawn();
        let a = start(&daemon, "A", config(3)).await;
        let b = start(&daemon, "B", config(3)).await;

        let (observer, mut events) = daemon.connect("observer").await.unwrap();
        observer.join("savings").await.unwrap();

        let result = a.mailbox().submit(TxKind::Deposit, 1.0).await;
        assert!(matches!(result, Err(Error::QuorumNotReached { .. })));
        assert_eq!(b.mailbox().flush().await.unwrap().sent, 0);

        // Only the observer's own join shows up
        sleep(Duration::from_millis(50)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, GroupEvent::Message { .. }), "unexpected {event:?}");
        }
    }

    #[tokio::test]
    async fn test_late_joiner_converges() {
        let daemon = Daemon::spawn();
        let a = start(&daemon, "A", config(2)).await;
        let b = start(&daemon, "B", config(2)).await;
        ready(&[&a, &b]).await;

        a.mailbox().submit(TxKind::Deposit, 200.0).await.unwrap();
        a.mailbox().flush().await.unwrap();
        b.mailbox().submit(TxKind::AddInterest, 5.0).await.unwrap();
        b.mailbox().flush().await.unwrap();
        wait_for_balance(&a.mailbox(), "210.00").await;
        wait_for_balance(&b.mailbox(), "210.00").await;

        // D joins after quorum and receives the balance instead of the history
        let d = start(&daemon, "D", config(2)).await;
        ready(&[&d]).await;
        wait_for_balance(&d.mailbox(), "210.00").await;
        let status = d.mailbox().status().await.unwrap();
        assert_eq!(status.order_counter, 0);
        assert!(d.mailbox().history().await.unwrap().executed.is_empty());

        d.mailbox().submit(TxKind::Deposit, -10.0).await.unwrap();
        d.mailbox().flush().await.unwrap();
        for node in [&a, &b, &d] {
            wait_for_balance(&node.mailbox(), "200.00").await;
        }
    }

    #[tokio::test]
    async fn test_late_joiner_converges_with_unlatched_oldest_member() {
        let daemon = Daemon::spawn();
        // A joins first but never runs its quorum gate
        let a = start(&daemon, "A", config(2)).await;
        let b = start(&daemon, "B", config(2)).await;
        ready(&[&b]).await;

        b.mailbox().submit(TxKind::Deposit, 100.0).await.unwrap();
        b.mailbox().flush().await.unwrap();
        wait_for_balance(&b.mailbox(), "100.00").await;

        let d = start(&daemon, "D", config(2)).await;
        ready(&[&d]).await;
        wait_for_balance(&d.mailbox(), "100.00").await;

        let snapshot = d.mailbox().membership().await.unwrap();
        assert_eq!(snapshot.members.first(), Some(a.member()));
        assert!(!a.mailbox().membership().await.unwrap().latched);
    }

    #[tokio::test]
    async fn test_timer_flushes_pending() {
        let daemon = Daemon::spawn();
        let mut fast = config(1);
        fast.flush_interval = Duration::from_millis(20);
        let a = start(&daemon, "A", fast).await;
        ready(&[&a]).await;

        a.mailbox().submit(TxKind::Deposit, 42.0).await.unwrap();
        wait_for_balance(&a.mailbox(), "42.00").await;
        assert!(a.mailbox().history().await.unwrap().pending.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_leaves_group() {
        let daemon = Daemon::spawn();
        let a = start(&daemon, "A", config(1)).await;
        let b = start(&daemon, "B", config(1)).await;
        ready(&[&a, &b]).await;

        b.shutdown().await.unwrap();
        let left = timeout(Duration::from_secs(5), async {
            loop {
                if a.mailbox().membership().await.unwrap().members.len() == 1 {
                    return;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(left.is_ok());
    }
}
