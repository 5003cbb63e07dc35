//! The on-disk export tree for a project's extracts.
//!
//! ```text
//! exports
//! └── <project_slug>
//!     ├── all_extracts
//!     │   └── <extract_datetime_slug>
//!     │       ├── omop
//!     │       │   └── public
//!     │       │       └── PROCEDURE_OCCURRENCE.parquet
//!     │       └── radiology
//!     │           └── radiology.parquet
//!     └── latest -> </symlink/to/latest/extract>
//! ```
//!
//! Uploaders mirror `all_extracts/<slug>` onto the sink under
//! `<project-slug>/<extract-time-slug>/parquet/`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parquet::data_type::{ByteArray, ByteArrayType, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::parser::parse_message_type;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("could not find public directory in input {0}")]
    MissingPublicDir(PathBuf),
    #[error("no parquet files found in {0}")]
    NoParquetFiles(PathBuf),
    #[error("filesystem error at '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),
}

/// One de-identified radiology report, linked to its exported study.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadiologyReport {
    pub procedure_occurrence_id: i64,
    pub pseudo_study_uid: String,
    pub pseudo_patient_id: String,
    pub report_text: String,
}

/// Paths for one (project, extract-datetime) pair within the export root.
#[derive(Debug, Clone)]
pub struct ParquetExport {
    pub project_slug: String,
    pub extract_time_slug: String,
    pub current_extract_base: PathBuf,
    pub public_output: PathBuf,
    pub radiology_output: PathBuf,
    latest_symlink: PathBuf,
}

impl ParquetExport {
    pub fn new(project_name: &str, extract_datetime: &DateTime<Utc>, export_dir: &Path) -> Self {
        let project_slug = project_config::slugify(project_name);
        let extract_time_slug = project_config::extract_time_slug(extract_datetime);

        let project_base = export_dir.join(&project_slug);
        let current_extract_base = project_base.join("all_extracts").join(&extract_time_slug);

        Self {
            public_output: current_extract_base.join("omop").join("public"),
            radiology_output: current_extract_base.join("radiology"),
            latest_symlink: project_base.join("latest"),
            project_slug,
            extract_time_slug,
            current_extract_base,
        }
    }

    /// Copy the OMOP `public/` directory in as this extract's public data and
    /// point the project's `latest` symlink at the extract.
    pub fn copy_to_exports(&self, input_omop_dir: &Path) -> Result<(), ExportError> {
        let public_input = input_omop_dir.join("public");
        if !public_input.is_dir() {
            return Err(ExportError::MissingPublicDir(input_omop_dir.to_owned()));
        }

        tracing::info!(
            from = %public_input.display(),
            to = %self.public_output.display(),
            "copying public parquet files",
        );
        copy_tree(&public_input, &self.public_output)?;

        // Re-pointing the symlink is last, so `latest` never names a
        // half-copied extract.
        if self.latest_symlink.symlink_metadata().is_ok() {
            std::fs::remove_file(&self.latest_symlink).map_err(|source| ExportError::Io {
                path: self.latest_symlink.clone(),
                source,
            })?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&self.current_extract_base, &self.latest_symlink).map_err(
            |source| ExportError::Io {
                path: self.latest_symlink.clone(),
                source,
            },
        )?;
        Ok(())
    }

    /// Write the project's de-identified radiology reports as
    /// `radiology/radiology.parquet`.
    pub fn export_radiology(&self, reports: &[RadiologyReport]) -> Result<PathBuf, ExportError> {
        mkdir_p(&self.radiology_output)?;
        let path = self.radiology_output.join("radiology.parquet");
        tracing::info!(path = %path.display(), rows = reports.len(), "exporting radiology reports");

        let schema = parse_message_type(
            "message radiology {
                required int64 procedure_occurrence_id;
                required binary pseudo_study_uid (UTF8);
                required binary pseudo_patient_id (UTF8);
                required binary report_text (UTF8);
            }",
        )?;
        let file = File::create(&path).map_err(|source| ExportError::Io {
            path: path.clone(),
            source,
        })?;
        let mut writer = SerializedFileWriter::new(
            file,
            Arc::new(schema),
            Arc::new(WriterProperties::builder().build()),
        )?;

        let mut row_group = writer.next_row_group()?;

        let ids: Vec<i64> = reports.iter().map(|r| r.procedure_occurrence_id).collect();
        let mut column = row_group.next_column()?.expect("schema has four columns");
        column
            .typed::<Int64Type>()
            .write_batch(&ids, None, None)?;
        column.close()?;

        let string_columns: [fn(&RadiologyReport) -> &str; 3] = [
            |r| &r.pseudo_study_uid,
            |r| &r.pseudo_patient_id,
            |r| &r.report_text,
        ];
        for accessor in string_columns {
            let values: Vec<ByteArray> = reports
                .iter()
                .map(|report| ByteArray::from(accessor(report)))
                .collect();
            let mut column = row_group.next_column()?.expect("schema has four columns");
            column
                .typed::<ByteArrayType>()
                .write_batch(&values, None, None)?;
            column.close()?;
        }

        row_group.close()?;
        writer.close()?;
        Ok(path)
    }

    /// Every parquet file below the extract base, relative to it, in sorted
    /// order. This is exactly the set an uploader mirrors.
    pub fn parquet_files(&self) -> Result<Vec<PathBuf>, ExportError> {
        let mut files = Vec::new();
        collect_parquet(&self.current_extract_base, &mut files)?;
        if files.is_empty() {
            return Err(ExportError::NoParquetFiles(self.current_extract_base.clone()));
        }
        let mut relative: Vec<PathBuf> = files
            .into_iter()
            .map(|file| {
                file.strip_prefix(&self.current_extract_base)
                    .expect("collected below the base")
                    .to_owned()
            })
            .collect();
        relative.sort();
        Ok(relative)
    }
}

fn mkdir_p(dir: &Path) -> Result<(), ExportError> {
    std::fs::create_dir_all(dir).map_err(|source| ExportError::Io {
        path: dir.to_owned(),
        source,
    })
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), ExportError> {
    mkdir_p(to)?;
    let entries = std::fs::read_dir(from).map_err(|source| ExportError::Io {
        path: from.to_owned(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ExportError::Io {
            path: from.to_owned(),
            source,
        })?;
        let target = to.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|source| ExportError::Io {
                path: entry.path(),
                source,
            })?;
        }
    }
    Ok(())
}

fn collect_parquet(dir: &Path, into: &mut Vec<PathBuf>) -> Result<(), ExportError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ExportError::Io {
        path: dir.to_owned(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ExportError::Io {
            path: dir.to_owned(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_parquet(&path, into)?;
        } else if path.extension().map_or(false, |ext| ext == "parquet") {
            into.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use parquet::record::RowAccessor;

    fn export(root: &Path) -> ParquetExport {
        let when = Utc.with_ymd_and_hms(2023, 12, 7, 14, 8, 58).unwrap();
        ParquetExport::new("Test Extract - UCLH OMOP CDM", &when, root)
    }

    #[test]
    fn test_layout_slugs() {
        let export = export(Path::new("/exports"));
        assert_eq!(export.project_slug, "test-extract-uclh-omop-cdm");
        assert_eq!(export.extract_time_slug, "2023-12-07t14-08-58z");
        assert_eq!(
            export.public_output,
            Path::new(
                "/exports/test-extract-uclh-omop-cdm/all_extracts/2023-12-07t14-08-58z/omop/public"
            ),
        );
    }

    #[test]
    fn test_copy_to_exports_mirrors_public_and_links_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("omop-input");
        std::fs::create_dir_all(input.join("public/batch_1")).unwrap();
        std::fs::write(input.join("public/PROCEDURE_OCCURRENCE.parquet"), b"x").unwrap();
        std::fs::write(input.join("public/batch_1/PROCEDURE_OCCURRENCE.parquet"), b"y").unwrap();

        let export = export(tmp.path());
        export.copy_to_exports(&input).unwrap();

        assert!(export.public_output.join("PROCEDURE_OCCURRENCE.parquet").exists());
        assert!(export
            .public_output
            .join("batch_1/PROCEDURE_OCCURRENCE.parquet")
            .exists());
        let latest = tmp.path().join("test-extract-uclh-omop-cdm/latest");
        assert_eq!(std::fs::read_link(latest).unwrap(), export.current_extract_base);
    }

    #[test]
    fn test_copy_without_public_dir_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("omop-input");
        std::fs::create_dir_all(&input).unwrap();

        let err = export(tmp.path()).copy_to_exports(&input).unwrap_err();
        assert!(matches!(err, ExportError::MissingPublicDir(_)), "{err}");
    }

    #[test]
    fn test_radiology_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let export = export(tmp.path());
        let reports = vec![
            RadiologyReport {
                procedure_occurrence_id: 4,
                pseudo_study_uid: "2.25.11".to_string(),
                pseudo_patient_id: "abcd".to_string(),
                report_text: "No acute abnormality.".to_string(),
            },
            RadiologyReport {
                procedure_occurrence_id: 5,
                pseudo_study_uid: "2.25.12".to_string(),
                pseudo_patient_id: "efgh".to_string(),
                report_text: "Fracture of the left radius.".to_string(),
            },
        ];

        let path = export.export_radiology(&reports).unwrap();
        assert!(path.ends_with("radiology/radiology.parquet"));

        let reader = SerializedFileReader::new(File::open(&path).unwrap()).unwrap();
        let rows: Vec<_> = reader
            .get_row_iter(None)
            .unwrap()
            .map(|row| row.unwrap())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_long(0).unwrap(), 4);
        assert_eq!(rows[1].get_string(1).unwrap(), "2.25.12");
        assert_eq!(rows[0].get_string(3).unwrap(), "No acute abnormality.");
    }

    #[test]
    fn test_parquet_files_are_relative_and_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let export = export(tmp.path());
        std::fs::create_dir_all(export.public_output.join("batch_1")).unwrap();
        std::fs::create_dir_all(&export.radiology_output).unwrap();
        std::fs::write(export.radiology_output.join("radiology.parquet"), b"r").unwrap();
        std::fs::write(
            export.public_output.join("batch_1/PROCEDURE_OCCURRENCE.parquet"),
            b"p",
        )
        .unwrap();
        std::fs::write(export.public_output.join("notes.txt"), b"skip me").unwrap();

        let files = export.parquet_files().unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("omop/public/batch_1/PROCEDURE_OCCURRENCE.parquet"),
                PathBuf::from("radiology/radiology.parquet"),
            ],
        );
    }
}
