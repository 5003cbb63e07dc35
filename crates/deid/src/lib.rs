//! The DICOM tag-operation engine.
//!
//! Given an in-memory dataset and a project's merged tag scheme, the engine
//! filters instances the project must not receive, deletes every data element
//! the scheme does not allow, applies the scheme's operations, and finally
//! substitutes the pseudonymous study and patient identifiers. The in-memory
//! transformation never suspends; hashing and ledger writes happen between
//! the passes, through the [`PseudonymSource`] seam.
//!
//! Given identical inputs (dataset, scheme, ledger state, hasher key) the
//! output is byte-identical.

mod arena;
mod engine;
mod helpers;
mod validate;

pub use arena::DataSet;
pub use engine::TagEngine;
pub use helpers::bounded_age;
pub use validate::{validation_diff, ValidationError};

use dicom_dictionary_std::tags;
use dicom_object::mem::InMemDicomObject;

/// Outcome contract of the engine, matched by callers to decide what to drop.
#[derive(Debug, thiserror::Error)]
pub enum DeidError {
    /// Drop every instance of this series; the study continues without it.
    #[error("series discarded: {0}")]
    DiscardSeries(String),
    /// Ignore this instance; the wrong modality is expected traffic.
    #[error("instance skipped: {0}")]
    SkipInstance(String),
    /// Drop the whole study. Not retried, never marked exported.
    #[error("study discarded: {0}")]
    DiscardStudy(String),
    /// Failure of the hasher or ledger behind the pseudonym seam.
    #[error("pseudonym assignment failed")]
    Pseudonym(#[source] anyhow::Error),
}

/// Identifiers of the study an instance belongs to, read before any
/// anonymisation has touched the dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyInfo {
    pub mrn: String,
    pub accession_number: String,
    pub study_uid: String,
}

impl StudyInfo {
    /// Read study identifiers from a DICOM dataset.
    pub fn from_dataset(dataset: &InMemDicomObject) -> Self {
        let read = |tag| {
            dataset
                .element(tag)
                .ok()
                .and_then(|element| element.to_str().ok())
                .map(|value| value.trim().to_string())
                .unwrap_or_default()
        };
        Self {
            mrn: read(tags::PATIENT_ID),
            accession_number: read(tags::ACCESSION_NUMBER),
            study_uid: read(tags::STUDY_INSTANCE_UID),
        }
    }
}

/// The engine's window onto the hasher oracle and the study ledger.
///
/// Implementations are expected to be deterministic: the same study must map
/// to the same pseudonyms for the lifetime of the ledger.
#[async_trait::async_trait]
pub trait PseudonymSource: Send + Sync {
    /// Keyed hash of `message` for the project, truncated to `length` chars.
    async fn secure_hash(
        &self,
        project_slug: &str,
        message: &str,
        length: u32,
    ) -> anyhow::Result<String>;

    /// The study's pseudonymous StudyInstanceUID, assigned on first use.
    async fn pseudo_study_uid(
        &self,
        project_slug: &str,
        study: &StudyInfo,
    ) -> anyhow::Result<String>;

    /// The patient's pseudonymous id within this project, assigned on first
    /// use from the already-hashed candidate.
    async fn pseudo_patient_id(
        &self,
        project_slug: &str,
        mrn: &str,
        hashed_candidate: &str,
    ) -> anyhow::Result<String>;
}
