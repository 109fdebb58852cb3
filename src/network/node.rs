use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle, time::interval};
use tracing::{debug, info};

use super::{EventStream, GroupConnection, MemberId};
use crate::{
    common::{ReplicaConfig, Result},
    replica::{await_quorum, Mailbox, ReplicaProcessor, Ready},
};

/// A running replica: the processor plus the tasks that feed it.
pub struct Node<C: GroupConnection> {
    connection: Arc<C>,
    mailbox: Mailbox,
    config: ReplicaConfig,
    tasks: Vec<JoinHandle<()>>,
}

impl<C: GroupConnection> Node<C> {
    /// Start the processor, forward `events` into it and join the account group.
    pub async fn start(connection: C, events: EventStream, config: ReplicaConfig) -> Result<Self> {
        config.validate()?;
        let connection = Arc::new(connection);
        let (sender, receiver) = mpsc::channel(config.mailbox_size);
        let mailbox = Mailbox::new(sender);

        let processor = ReplicaProcessor::new(connection.clone(), &config, receiver);
        let tasks = vec![
            tokio::spawn(processor.run()),
            tokio::spawn(forward(events, mailbox.clone())),
            tokio::spawn(flush_timer(mailbox.clone(), config.flush_interval)),
        ];

        connection.join(&config.account).await?;
        info!(member = %connection.member(), group = %config.account, "joined group");

        Ok(Node {
            connection,
            mailbox,
            config,
            tasks,
        })
    }

    pub fn member(&self) -> &MemberId {
        self.connection.member()
    }

    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// Wait for the configured number of replicas. May never return.
    pub async fn await_quorum(&self) -> Result<Ready> {
        await_quorum(&self.mailbox, self.config.minimum_replicas, self.config.quorum_poll).await
    }

    /// Leave the group, disconnect and stop every task.
    pub async fn shutdown(self) -> Result<()> {
        let left = self.connection.leave(&self.config.account).await;
        let disconnected = self.connection.disconnect().await;
        for task in &self.tasks {
            task.abort();
        }
        info!(member = %self.member(), "replica stopped");
        left.and(disconnected)
    }
}

async fn forward(mut events: EventStream, mailbox: Mailbox) {
    while let Some(event) = events.recv().await {
        if mailbox.deliver(event).await.is_err() {
            break;
        }
    }
    debug!("event stream closed");
}

async fn flush_timer(mailbox: Mailbox, period: std::time::Duration) {
    let mut ticker = interval(period);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if mailbox.tick().await.is_err() {
            break;
        }
    }
}
