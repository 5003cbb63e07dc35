//! State files: parked work items, one wire envelope per line.
//!
//! `pixl stop` drains the imaging queues into these files; a later `populate`
//! resumes from them instead of re-parsing the original ingest.

use std::path::{Path, PathBuf};

use anyhow::Context;
use patient_queue::Message;

pub fn state_filepath_for_queue(queue: &str) -> PathBuf {
    PathBuf::from(format!("{queue}.state"))
}

/// Read messages back from a state file, ignoring blank lines.
pub fn messages_from_state_file(path: &Path) -> anyhow::Result<Vec<Message>> {
    if path.extension().map_or(true, |extension| extension != "state") {
        anyhow::bail!("invalid file suffix for {}. Expected .state", path.display());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading state file {}", path.display()))?;

    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            patient_queue::deserialise(line.as_bytes())
                .with_context(|| format!("state file {} holds an invalid message", path.display()))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn message(index: i64) -> Message {
        Message {
            mrn: format!("mrn-{index}"),
            accession_number: format!("acc-{index}"),
            study_uid: String::new(),
            study_date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            procedure_occurrence_id: index,
            project_name: "test-extract".to_string(),
            extract_generated_timestamp: Utc.with_ymd_and_hms(2023, 12, 7, 14, 8, 0).unwrap(),
        }
    }

    #[test]
    fn test_state_file_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("imaging-primary.state");

        let mut raw = Vec::new();
        for index in [1, 2] {
            raw.extend(patient_queue::serialise(&message(index)).unwrap());
            raw.push(b'\n');
        }
        raw.extend(b"\n"); // Trailing blank lines are tolerated.
        std::fs::write(&path, raw).unwrap();

        let restored = messages_from_state_file(&path).unwrap();
        assert_eq!(restored, vec![message(1), message(2)]);
    }

    #[test]
    fn test_wrong_suffix_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("imaging-primary.csv");
        std::fs::write(&path, "").unwrap();

        let err = messages_from_state_file(&path).unwrap_err();
        assert!(err.to_string().contains("Expected .state"), "{err}");
    }

    #[test]
    fn test_state_filepath() {
        assert_eq!(
            state_filepath_for_queue("imaging-primary"),
            PathBuf::from("imaging-primary.state"),
        );
    }
}
