//! Batch orchestration: admit, publish, and the wait-until-stable retry loop.
//!
//! The broker is at-least-once and the consumers never retry a failed
//! callback, so this loop is the authoritative retry mechanism. Stability is
//! defined by observed ledger progress, not by broker state: once the export
//! count stops moving between rounds, the batch is as done as it will get.

use std::time::Duration;

use ledger::Ledger;
use patient_queue::{Message, Producer};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Upper bound on republish rounds.
    pub num_retries: u32,
    /// Pause between draining the queues and sampling the export count.
    pub wait: Duration,
    /// Poll interval while waiting for the queues to drain.
    pub drain_poll: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            num_retries: 5,
            wait: Duration::from_secs(300),
            drain_poll: Duration::from_secs(60),
        }
    }
}

/// The loop's window onto the world, seamed for tests.
#[async_trait::async_trait]
pub trait BatchDriver: Send + Sync {
    /// Block until every populated queue reports zero ready messages.
    async fn wait_for_queues_to_drain(&self) -> anyhow::Result<()>;
    /// Exported-study count for the project, from the ledger.
    async fn exported_count(&self) -> anyhow::Result<i64>;
    /// Re-admit and re-publish the batch; returns how many went out.
    async fn republish(&self) -> anyhow::Result<usize>;
}

/// Retry populating until the export count stops changing between two
/// consecutive rounds. Returns the final count.
pub async fn retry_until_export_count_is_unchanged(
    driver: &dyn BatchDriver,
    policy: &RetryPolicy,
) -> anyhow::Result<i64> {
    let mut last_exported_count = 0i64;

    tracing::info!(
        wait_seconds = policy.wait.as_secs(),
        max_retries = policy.num_retries,
        "retrying extraction until no new exports are found",
    );
    for round in 1..=policy.num_retries {
        driver.wait_for_queues_to_drain().await?;
        wait_with_progress(policy.wait).await;

        let exported_count = driver.exported_count().await?;
        if exported_count == last_exported_count {
            tracing::info!(exported_count, "export count unchanged between rounds; stopping");
            return Ok(exported_count);
        }
        tracing::info!(
            new_exports = exported_count - last_exported_count,
            round,
            max_retries = policy.num_retries,
            "new exports found; republishing remaining work",
        );
        last_exported_count = exported_count;
        driver.republish().await?;
    }

    driver.exported_count().await
}

/// Sleep for `wait`, showing a per-second progress bar on interactive runs.
async fn wait_with_progress(wait: Duration) {
    let seconds = wait.as_secs();
    if seconds == 0 {
        tokio::time::sleep(wait).await;
        return;
    }
    let bar = indicatif::ProgressBar::new(seconds);
    bar.set_message("waiting for studies to be fully processed");
    for _ in 0..seconds {
        tokio::time::sleep(Duration::from_secs(1)).await;
        bar.inc(1);
    }
    bar.finish_and_clear();
}

/// Production driver over the broker and the ledger.
pub struct QueueBatchDriver {
    pub ledger: Ledger,
    pub producers: Vec<Producer>,
    pub extract_slug: String,
    pub messages: Vec<Message>,
    pub drain_poll: Duration,
}

#[async_trait::async_trait]
impl BatchDriver for QueueBatchDriver {
    async fn wait_for_queues_to_drain(&self) -> anyhow::Result<()> {
        tracing::info!("waiting for queues to empty");
        loop {
            let mut ready = 0;
            for producer in &self.producers {
                ready += producer.message_count().await?;
            }
            if ready == 0 {
                tracing::info!("queues are empty");
                return Ok(());
            }
            tracing::debug!(ready, "messages still queued; sleeping");
            tokio::time::sleep(self.drain_poll).await;
        }
    }

    async fn exported_count(&self) -> anyhow::Result<i64> {
        Ok(self.ledger.exported_count(&self.extract_slug).await?)
    }

    async fn republish(&self) -> anyhow::Result<usize> {
        let remaining =
            admit_and_sort(&self.ledger, &self.extract_slug, self.messages.clone()).await?;
        let mut published = 0;
        for producer in &self.producers {
            published += producer.publish(&remaining).await?;
        }
        Ok(published)
    }
}

/// Register a batch with the ledger and return the admitted work items in
/// ascending study-date order, ready for publishing.
pub async fn admit_and_sort(
    ledger: &Ledger,
    extract_slug: &str,
    messages: Vec<Message>,
) -> anyhow::Result<Vec<Message>> {
    let mut admitted = ledger.admit(extract_slug, &messages).await?;
    admitted.sort_by(|a, b| a.study_date.cmp(&b.study_date));
    Ok(admitted)
}
