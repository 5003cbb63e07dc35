//! The per-message fetch state machine.

use std::time::Duration;

use patient_queue::Message;
use tokio::time::Instant;

use crate::node::{ArchiveNode, JobState, StudyQuery};

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Modality name of the primary archive, as known to the node.
    pub primary_modality: String,
    /// Modality name of the secondary archive, the fallback.
    pub secondary_modality: String,
    /// Per-study C-MOVE watchdog.
    pub transfer_timeout: Duration,
    /// Interval between job-state polls.
    pub poll_interval: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            primary_modality: "PACS".to_string(),
            secondary_modality: "VNA".to_string(),
            transfer_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Where the study was ultimately found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Local,
    Primary,
    Secondary,
}

impl FetchSource {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchSource::Local => "local",
            FetchSource::Primary => "primary",
            FetchSource::Secondary => "secondary",
        }
    }
}

/// Fatal outcomes for a single study. These terminate the message; the
/// orchestrator decides whether the study is retried in a later round.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("study not found in primary or secondary archive")]
    NotFound,
    #[error("transfer did not complete within {0:?}")]
    TransferTimeout(Duration),
    #[error("transfer job failed")]
    TransferFailed,
    #[error(transparent)]
    Node(#[from] anyhow::Error),
}

/// Drive one work item through {local-hit, primary-query, secondary-fallback,
/// C-MOVE, tag-stamp, route-to-anon}.
pub async fn process_message(
    message: &Message,
    node: &dyn ArchiveNode,
    config: &FetcherConfig,
) -> Result<FetchSource, FetchError> {
    let query = study_query(message);

    let existing = node.find_local(&query).await?;
    if let Some(resource_id) = existing.first() {
        tracing::info!(
            mrn = %message.mrn,
            accession_number = %message.accession_number,
            source = FetchSource::Local.as_str(),
            "study already present in raw store",
        );
        node.stamp_project(resource_id, &message.project_name).await?;
        node.send_to_anon(resource_id).await?;
        return Ok(FetchSource::Local);
    }

    let (source, query_id) = match node.query_remote(&config.primary_modality, &query).await? {
        Some(query_id) => (FetchSource::Primary, query_id),
        None => match node.query_remote(&config.secondary_modality, &query).await? {
            Some(query_id) => (FetchSource::Secondary, query_id),
            None => {
                tracing::error!(
                    mrn = %message.mrn,
                    accession_number = %message.accession_number,
                    "study not found in any archive",
                );
                return Err(FetchError::NotFound);
            }
        },
    };
    tracing::info!(
        mrn = %message.mrn,
        accession_number = %message.accession_number,
        source = source.as_str(),
        "fetching study via C-MOVE",
    );

    let job_id = node.retrieve(&query_id).await?;
    wait_for_transfer(node, &job_id, config).await?;

    // The instances have landed; stamp every matching study with the project
    // marker so downstream routing picks the right config. The raw store
    // forwards stamped studies once they go stable.
    let studies = node.find_local(&query).await?;
    if studies.len() != 1 {
        tracing::warn!(
            count = studies.len(),
            mrn = %message.mrn,
            accession_number = %message.accession_number,
            "expected exactly one study with matching identifiers",
        );
    }
    for study_id in &studies {
        node.stamp_project(study_id, &message.project_name).await?;
    }

    Ok(source)
}

async fn wait_for_transfer(
    node: &dyn ArchiveNode,
    job_id: &str,
    config: &FetcherConfig,
) -> Result<(), FetchError> {
    let deadline = Instant::now() + config.transfer_timeout;

    loop {
        match node.job_state(job_id).await? {
            JobState::Success => return Ok(()),
            JobState::Failure => return Err(FetchError::TransferFailed),
            JobState::InProgress => {
                if Instant::now() >= deadline {
                    return Err(FetchError::TransferTimeout(config.transfer_timeout));
                }
                tokio::time::sleep(config.poll_interval).await;
            }
        }
    }
}

fn study_query(message: &Message) -> StudyQuery {
    if message.study_uid.is_empty() {
        StudyQuery::by_identifiers(&message.mrn, &message.accession_number)
    } else {
        StudyQuery::by_uid(&message.study_uid)
    }
}
