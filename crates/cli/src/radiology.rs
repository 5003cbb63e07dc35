//! Radiology report extraction: join de-identified reports onto exported
//! studies and write them into the extract's parquet tree.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use exports::RadiologyReport;
use ledger::ExportedImage;

/// Columns of a radiology report CSV, in order.
pub const EXPECTED_REPORT_COLUMNS: [&str; 4] =
    ["procedure_id", "mrn", "accession_number", "report_text"];

/// A raw report row, still carrying real identifiers.
#[derive(Debug, Clone)]
pub struct ReportRow {
    pub procedure_occurrence_id: i64,
    pub mrn: String,
    pub accession_number: String,
    pub report_text: String,
}

pub fn reports_from_csv(path: &Path) -> anyhow::Result<Vec<ReportRow>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;

    let headers = reader.headers()?.clone();
    let leading: Vec<&str> = headers.iter().take(EXPECTED_REPORT_COLUMNS.len()).collect();
    if leading != EXPECTED_REPORT_COLUMNS {
        anyhow::bail!(
            "report csv expected to have {EXPECTED_REPORT_COLUMNS:?} as column names, \
             found {leading:?}"
        );
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(ReportRow {
            procedure_occurrence_id: record[0]
                .parse()
                .with_context(|| format!("parsing procedure id '{}'", &record[0]))?,
            mrn: record[1].to_string(),
            accession_number: record[2].to_string(),
            report_text: record[3].to_string(),
        });
    }
    Ok(rows)
}

/// Substitute pseudonymous identifiers into report rows. Reports without an
/// exported study are dropped: an unexported study's report must not leave
/// either, and a report keyed to an unknown study is upstream noise.
pub fn link_reports(
    rows: Vec<ReportRow>,
    exported: &[ExportedImage],
) -> (Vec<RadiologyReport>, usize) {
    let by_key: HashMap<(&str, &str), &ExportedImage> = exported
        .iter()
        .map(|image| ((image.mrn.as_str(), image.accession_number.as_str()), image))
        .collect();

    let total = rows.len();
    let linked: Vec<RadiologyReport> = rows
        .into_iter()
        .filter_map(|row| {
            let image = by_key.get(&(row.mrn.as_str(), row.accession_number.as_str()))?;
            let report_text = scrub_report_text(&row.report_text, &[&row.mrn, &row.accession_number]);
            Some(RadiologyReport {
                procedure_occurrence_id: row.procedure_occurrence_id,
                pseudo_study_uid: image.pseudo_study_uid.clone(),
                pseudo_patient_id: image.pseudo_patient_id.clone().unwrap_or_default(),
                report_text,
            })
        })
        .collect();

    let dropped = total - linked.len();
    (linked, dropped)
}

/// Scrub known identifiers out of a report's free text before it leaves.
///
/// This removes the identifiers the pipeline knows about (the row's MRN and
/// accession number) and anything shaped like an NHS number. It is a
/// last-line defence for structured identifiers leaking into prose, not a
/// general PII scrubber.
pub fn scrub_report_text(text: &str, identifiers: &[&str]) -> String {
    use std::sync::OnceLock;
    static NHS_NUMBER: OnceLock<regex::Regex> = OnceLock::new();
    let nhs_number = NHS_NUMBER.get_or_init(|| {
        regex::Regex::new(r"\b\d{3}[ -]?\d{3}[ -]?\d{4}\b").expect("pattern is valid")
    });

    let mut scrubbed = nhs_number.replace_all(text, "[identifier]").into_owned();
    for identifier in identifiers {
        if identifier.is_empty() {
            continue;
        }
        scrubbed = scrubbed.replace(identifier, "[identifier]");
    }
    scrubbed
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn exported(mrn: &str, accession: &str, uid: &str) -> ExportedImage {
        ExportedImage {
            mrn: mrn.to_string(),
            accession_number: accession.to_string(),
            pseudo_study_uid: uid.to_string(),
            pseudo_patient_id: Some(format!("pseudo-{mrn}")),
            exported_at: Utc.with_ymd_and_hms(2023, 12, 7, 14, 8, 0).unwrap(),
        }
    }

    fn row(mrn: &str, accession: &str) -> ReportRow {
        ReportRow {
            procedure_occurrence_id: 4,
            mrn: mrn.to_string(),
            accession_number: accession.to_string(),
            report_text: "No acute abnormality.".to_string(),
        }
    }

    #[test]
    fn test_link_substitutes_pseudonyms() {
        let (linked, dropped) = link_reports(
            vec![row("m1", "a1")],
            &[exported("m1", "a1", "2.25.11")],
        );
        assert_eq!(dropped, 0);
        assert_eq!(linked[0].pseudo_study_uid, "2.25.11");
        assert_eq!(linked[0].pseudo_patient_id, "pseudo-m1");
        assert_eq!(linked[0].report_text, "No acute abnormality.");
    }

    #[test]
    fn test_unexported_reports_are_dropped() {
        let (linked, dropped) = link_reports(
            vec![row("m1", "a1"), row("m2", "a2")],
            &[exported("m1", "a1", "2.25.11")],
        );
        assert_eq!(linked.len(), 1);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_known_identifiers_are_scrubbed_from_report_text() {
        let (linked, _) = link_reports(
            vec![ReportRow {
                procedure_occurrence_id: 4,
                mrn: "987654321".to_string(),
                accession_number: "AA12345601".to_string(),
                report_text: "Compared with AA12345601 for patient 987654321.".to_string(),
            }],
            &[exported("987654321", "AA12345601", "2.25.11")],
        );
        assert_eq!(
            linked[0].report_text,
            "Compared with [identifier] for patient [identifier].",
        );
    }

    #[test]
    fn test_nhs_shaped_numbers_are_scrubbed() {
        let scrubbed = scrub_report_text("NHS number 943 476 5919 on file.", &[]);
        assert_eq!(scrubbed, "NHS number [identifier] on file.");
        assert_eq!(scrub_report_text("Slice 3 of 12.", &[]), "Slice 3 of 12.");
    }

    #[test]
    fn test_reports_from_csv() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("reports.csv");
        std::fs::write(
            &path,
            "procedure_id,mrn,accession_number,report_text\n\
             4,m1,a1,\"Fracture of the left radius.\"\n",
        )
        .unwrap();

        let rows = reports_from_csv(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].report_text, "Fracture of the left radius.");
    }
}
