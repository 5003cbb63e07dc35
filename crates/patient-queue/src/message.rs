use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::QueueError;

/// The immutable description of one study to extract, as carried on the wire.
///
/// Serialised as a self-describing JSON envelope so that operators can read a
/// queue dump (or a CLI state file) without tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub mrn: String,
    pub accession_number: String,
    /// May be empty when the upstream extract did not know the UID; queries
    /// then fall back to (PatientID, AccessionNumber).
    #[serde(default)]
    pub study_uid: String,
    pub study_date: NaiveDate,
    pub procedure_occurrence_id: i64,
    /// Project slug; selects the project config everywhere downstream.
    pub project_name: String,
    pub extract_generated_timestamp: DateTime<Utc>,
}

/// Emitted by the anonymiser once a study's archive is spooled; consumed by
/// the uploader dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportMessage {
    pub project_name: String,
    pub pseudo_study_uid: String,
}

/// Serialise any envelope type to its wire form.
pub fn serialise<T: Serialize>(message: &T) -> Result<Vec<u8>, QueueError> {
    Ok(serde_json::to_vec(message)?)
}

/// Deserialise an envelope from its wire form.
pub fn deserialise<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, QueueError> {
    Ok(serde_json::from_slice(body)?)
}
