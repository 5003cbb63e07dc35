//! Reading ingest inputs: the CSV format and the OMOP parquet directory.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::{Field, Row};
use patient_queue::Message;

/// The five leading columns an ingest CSV must carry, in order.
pub const EXPECTED_CSV_COLUMNS: [&str; 5] = [
    "procedure_id",
    "mrn",
    "accession_number",
    "project_name",
    "omop-es-datetime",
];

/// Read work items from an ingest CSV. The `omop-es-datetime` column carries
/// the study date as `dd/mm/yyyy HH:MM`.
pub fn messages_from_csv(
    path: &Path,
    extract_generated_timestamp: DateTime<Utc>,
) -> anyhow::Result<Vec<Message>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let headers = reader.headers()?.clone();
    let leading: Vec<&str> = headers.iter().take(EXPECTED_CSV_COLUMNS.len()).collect();
    if leading != EXPECTED_CSV_COLUMNS {
        anyhow::bail!(
            "csv file expected to have at least {EXPECTED_CSV_COLUMNS:?} as column names, \
             found {leading:?}"
        );
    }

    let mut messages = Vec::new();
    for record in reader.records() {
        let record = record?;
        let study_date =
            NaiveDateTime::parse_from_str(&record[4], "%d/%m/%Y %H:%M")
                .with_context(|| format!("parsing study date '{}'", &record[4]))?
                .date();
        messages.push(Message {
            mrn: record[1].to_string(),
            accession_number: record[2].to_string(),
            study_uid: String::new(),
            study_date,
            procedure_occurrence_id: record[0]
                .parse()
                .with_context(|| format!("parsing procedure id '{}'", &record[0]))?,
            project_name: project_config::slugify(&record[3]),
            extract_generated_timestamp,
        });
    }

    if messages.is_empty() {
        anyhow::bail!("failed to find any messages in {}", path.display());
    }
    tracing::info!(count = messages.len(), path = %path.display(), "created messages from csv");
    Ok(messages)
}

/// Project name and extract datetime recorded by the OMOP extract tool.
pub fn config_from_log_file(parquet_dir: &Path) -> anyhow::Result<(String, DateTime<Utc>)> {
    let log_file = parquet_dir.join("extract_summary.json");
    let raw = std::fs::read_to_string(&log_file)
        .with_context(|| format!("reading {}", log_file.display()))?;
    let logs: serde_json::Value = serde_json::from_str(&raw)?;

    let project_name = logs["settings"]["cdm_source_name"]
        .as_str()
        .context("extract_summary.json has no settings.cdm_source_name")?
        .to_string();
    let datetime = logs["datetime"]
        .as_str()
        .context("extract_summary.json has no datetime")?;
    let extract_generated_timestamp = DateTime::parse_from_rfc3339(datetime)
        .with_context(|| format!("parsing extract datetime '{datetime}'"))?
        .with_timezone(&Utc);
    Ok((project_name, extract_generated_timestamp))
}

/// Read work items from an OMOP parquet directory: `private/` links join to
/// `public/` procedures on person and procedure ids. Rows without an
/// accession number are dropped.
pub fn messages_from_parquet(
    dir: &Path,
    project_name: &str,
    extract_generated_timestamp: DateTime<Utc>,
) -> anyhow::Result<Vec<Message>> {
    let private_dir = dir.join("private");
    let public_dir = dir.join("public");
    for required in [&private_dir, &public_dir] {
        if !required.is_dir() {
            anyhow::bail!("{} must exist and be a directory", required.display());
        }
    }

    // person_id -> PrimaryMrn
    let mut mrn_by_person: HashMap<i64, String> = HashMap::new();
    for_each_row(&private_dir.join("PERSON_LINKS.parquet"), |row| {
        if let (Some(person_id), Some(mrn)) = (row_i64(row, "person_id"), row_str(row, "PrimaryMrn"))
        {
            mrn_by_person.insert(person_id, mrn);
        }
        Ok(())
    })?;

    // procedure_occurrence_id -> AccessionNumber
    let mut accession_by_procedure: HashMap<i64, String> = HashMap::new();
    for_each_row(
        &private_dir.join("PROCEDURE_OCCURRENCE_LINKS.parquet"),
        |row| {
            if let (Some(procedure_id), Some(accession)) = (
                row_i64(row, "procedure_occurrence_id"),
                row_str(row, "AccessionNumber"),
            ) {
                accession_by_procedure.insert(procedure_id, accession);
            }
            Ok(())
        },
    )?;

    let slug = project_config::slugify(project_name);
    let mut messages = Vec::new();
    for_each_row(&public_dir.join("PROCEDURE_OCCURRENCE.parquet"), |row| {
        let Some(procedure_id) = row_i64(row, "procedure_occurrence_id") else {
            return Ok(());
        };
        let Some(person_id) = row_i64(row, "person_id") else {
            return Ok(());
        };
        let Some(study_date) = row_date(row, "procedure_date") else {
            return Ok(());
        };
        let Some(mrn) = mrn_by_person.get(&person_id) else {
            return Ok(());
        };
        let Some(accession) = accession_by_procedure.get(&procedure_id) else {
            return Ok(());
        };
        if accession.is_empty() {
            return Ok(());
        }

        messages.push(Message {
            mrn: mrn.clone(),
            accession_number: accession.clone(),
            study_uid: String::new(),
            study_date,
            procedure_occurrence_id: procedure_id,
            project_name: slug.clone(),
            extract_generated_timestamp,
        });
        Ok(())
    })?;

    if messages.is_empty() {
        anyhow::bail!("failed to find any messages in {}", dir.display());
    }
    tracing::info!(count = messages.len(), dir = %dir.display(), "created messages from parquet");
    Ok(messages)
}

fn for_each_row(
    path: &Path,
    mut visit: impl FnMut(&Row) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = SerializedFileReader::new(file)
        .with_context(|| format!("reading parquet {}", path.display()))?;
    for row in reader.get_row_iter(None)? {
        visit(&row?)?;
    }
    Ok(())
}

fn row_field<'a>(row: &'a Row, name: &str) -> Option<&'a Field> {
    row.get_column_iter()
        .find(|(column, _)| column.as_str() == name)
        .map(|(_, field)| field)
}

fn row_i64(row: &Row, name: &str) -> Option<i64> {
    match row_field(row, name)? {
        Field::Long(value) => Some(*value),
        Field::Int(value) => Some(i64::from(*value)),
        _ => None,
    }
}

fn row_str(row: &Row, name: &str) -> Option<String> {
    match row_field(row, name)? {
        Field::Str(value) => Some(value.clone()),
        _ => None,
    }
}

fn row_date(row: &Row, name: &str) -> Option<NaiveDate> {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch is a valid date");
    match row_field(row, name)? {
        Field::Date(days) => epoch.checked_add_signed(chrono::Duration::days(i64::from(*days))),
        Field::TimestampMillis(millis) => {
            DateTime::from_timestamp_millis(*millis).map(|ts| ts.date_naive())
        }
        Field::TimestampMicros(micros) => {
            DateTime::from_timestamp_micros(*micros).map(|ts| ts.date_naive())
        }
        Field::Str(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d").ok(),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 12, 7, 14, 8, 0).unwrap()
    }

    #[test]
    fn test_messages_from_csv() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("extract.csv");
        std::fs::write(
            &path,
            "procedure_id,mrn,accession_number,project_name,omop-es-datetime\n\
             4,987654321,AA12345601,Test Extract - UCLH OMOP CDM,01/01/2023 09:30\n\
             5,987654322,AA12345602,Test Extract - UCLH OMOP CDM,02/01/2023 11:00\n",
        )
        .unwrap();

        let messages = messages_from_csv(&path, timestamp()).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].mrn, "987654321");
        assert_eq!(messages[0].project_name, "test-extract-uclh-omop-cdm");
        assert_eq!(messages[0].study_date.to_string(), "2023-01-01");
        assert_eq!(messages[1].procedure_occurrence_id, 5);
    }

    #[test]
    fn test_csv_with_wrong_columns_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.csv");
        std::fs::write(&path, "a,b,c,d,e\n1,2,3,4,5\n").unwrap();

        let err = messages_from_csv(&path, timestamp()).unwrap_err();
        assert!(err.to_string().contains("column names"), "{err}");
    }

    #[test]
    fn test_empty_csv_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty.csv");
        std::fs::write(
            &path,
            "procedure_id,mrn,accession_number,project_name,omop-es-datetime\n",
        )
        .unwrap();

        let err = messages_from_csv(&path, timestamp()).unwrap_err();
        assert!(err.to_string().contains("any messages"), "{err}");
    }

    #[test]
    fn test_config_from_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("extract_summary.json"),
            r#"{"settings": {"cdm_source_name": "Test Extract - UCLH OMOP CDM"},
                "datetime": "2023-12-07T14:08:58+00:00"}"#,
        )
        .unwrap();

        let (name, when) = config_from_log_file(tmp.path()).unwrap();
        assert_eq!(name, "Test Extract - UCLH OMOP CDM");
        assert_eq!(when, Utc.with_ymd_and_hms(2023, 12, 7, 14, 8, 58).unwrap());
    }
}
