use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::Serialize;
use token_bucket::{denial_backoff, ArchiveKey, TokenBucket};

use crate::QueueError;

/// Delay between successive publishes. The broker can mis-order messages
/// published in a tight loop, and chronological processing depends on order.
const PUBLISH_PACING: Duration = Duration::from_millis(100);

/// Publisher for one durable queue.
pub struct Producer {
    // The connection must outlive the channel.
    _connection: Connection,
    channel: Channel,
    queue: String,
}

impl Producer {
    pub async fn connect(uri: &str, queue: &str) -> Result<Self, QueueError> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(Self {
            _connection: connection,
            channel,
            queue: queue.to_string(),
        })
    }

    /// Publish serialised envelopes in order, persistent delivery mode.
    pub async fn publish<T: Serialize>(&self, messages: &[T]) -> Result<usize, QueueError> {
        if messages.is_empty() {
            tracing::debug!(queue = %self.queue, "nothing to publish");
            return Ok(0);
        }

        for message in messages {
            let payload = crate::serialise(message)?;
            self.channel
                .basic_publish(
                    "",
                    &self.queue,
                    BasicPublishOptions::default(),
                    &payload,
                    BasicProperties::default().with_delivery_mode(2),
                )
                .await?
                .await?;
            tokio::time::sleep(PUBLISH_PACING).await;
        }
        tracing::info!(queue = %self.queue, count = messages.len(), "published messages");
        Ok(messages.len())
    }

    /// Number of messages currently ready on the queue.
    pub async fn message_count(&self) -> Result<u32, QueueError> {
        let queue = self
            .channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.message_count())
    }
}

/// Consumer for one durable queue, with bounded in-flight messages and
/// optional token-bucket admission.
pub struct Consumer {
    _connection: Connection,
    channel: Channel,
    queue: String,
    max_in_flight: u16,
    rate_limit: Option<(Arc<TokenBucket>, ArchiveKey)>,
}

impl Consumer {
    pub async fn connect(
        uri: &str,
        queue: &str,
        max_in_flight: u16,
        rate_limit: Option<(Arc<TokenBucket>, ArchiveKey)>,
    ) -> Result<Self, QueueError> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(Self {
            _connection: connection,
            channel,
            queue: queue.to_string(),
            max_in_flight,
            rate_limit,
        })
    }

    /// Drain every ready message into `sink`, one wire envelope per line.
    /// Used to park a stopped extraction so it can be resumed later from the
    /// state file. Returns the number of messages consumed.
    pub async fn consume_all_into(
        &self,
        sink: &mut (dyn std::io::Write + Send),
        idle_timeout: Duration,
    ) -> Result<usize, QueueError> {
        let mut deliveries = self
            .channel
            .basic_consume(
                &self.queue,
                &format!("{}-drain", self.queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let mut consumed = 0;
        loop {
            let delivery = match tokio::time::timeout(idle_timeout, deliveries.next()).await {
                Err(_elapsed) => break,
                Ok(None) => break,
                Ok(Some(delivery)) => delivery?,
            };
            sink.write_all(&delivery.data)
                .and_then(|()| sink.write_all(b"\n"))
                .map_err(|error| {
                    tracing::error!(%error, "failed to write drained message");
                    lapin::Error::IOError(std::sync::Arc::new(error))
                })?;
            delivery.ack(BasicAckOptions::default()).await?;
            consumed += 1;
        }
        tracing::info!(queue = %self.queue, consumed, "drained queue to state");
        Ok(consumed)
    }

    /// Iterate pending messages until the stream closes.
    ///
    /// Messages denied by the rate limiter are nacked back onto the queue
    /// after a short pause. Everything else is acked first and then handed to
    /// `callback`; a callback error is terminal for that message. The broker
    /// can close the connection on messages held unacked too long, and a
    /// failed callback must not be redelivered anyway: replay belongs to the
    /// orchestrator, which watches ledger progress rather than broker state.
    pub async fn run<T, F, Fut>(&self, callback: F) -> Result<(), QueueError>
    where
        T: serde::de::DeserializeOwned,
        F: Fn(T) -> Fut,
        Fut: std::future::Future<Output = Result<(), anyhow::Error>>,
    {
        self.channel
            .basic_qos(self.max_in_flight, BasicQosOptions::default())
            .await?;

        let mut deliveries = self
            .channel
            .basic_consume(
                &self.queue,
                &format!("{}-consumer", self.queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        while let Some(delivery) = deliveries.next().await {
            let delivery = delivery?;

            if let Some((bucket, key)) = &self.rate_limit {
                if !bucket.try_acquire(*key) {
                    delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await?;
                    tokio::time::sleep(denial_backoff(bucket.rate())).await;
                    continue;
                }
            }

            delivery.ack(BasicAckOptions::default()).await?;

            let message: T = match crate::deserialise(&delivery.data) {
                Ok(message) => message,
                Err(error) => {
                    tracing::error!(queue = %self.queue, %error, "dropping undecodable message");
                    continue;
                }
            };
            if let Err(error) = callback(message).await {
                tracing::error!(
                    queue = %self.queue,
                    error = format!("{error:#}"),
                    "failed to process message; not re-queuing",
                );
            }
        }
        Ok(())
    }
}
