//! Per-project configuration: which studies a project may receive, how their
//! DICOM tags are operated on, and where the de-identified results are delivered.
//!
//! Configuration is stored as YAML documents under a configs directory, one
//! `<project-slug>.yaml` per project, with tag-operation files referenced by
//! name under `tag-operations/` (and `tag-operations/manufacturer-overrides/`).
//! String-keyed choices in the documents (destinations, tag operations) are
//! resolved to closed enums at load time; everything downstream matches
//! exhaustively.

mod config;
pub mod tags;
mod tag_ops;

pub use config::{
    load_project_config, CaseInsensitiveRegex, Destination, DicomDestination, Manufacturer,
    ParquetDestination, Project, ProjectConfig, TagOperationFiles,
};
pub use tag_ops::{load_tag_operations, merge_tag_schemes, ManufacturerOverride, TagAction, TagOp,
    TagOperations, TagScheme};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no config for project '{0}'")]
    MissingProject(String),
    #[error("tag operation file '{0}' does not exist")]
    MissingTagFile(std::path::PathBuf),
    #[error("there should be at least one base tag operations file")]
    NoBaseTagFiles,
    #[error("parquet destination cannot be '{0}'")]
    InvalidParquetDestination(String),
    #[error("failed to read '{path}'")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse '{path}'")]
    Yaml {
        path: std::path::PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Derive a filesystem- and queue-safe slug from a human project name:
/// lowercased, with runs of non-alphanumeric characters replaced by single
/// hyphens and no leading or trailing hyphen.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;

    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.extend(ch.to_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

/// Slug for an extract timestamp, used as the per-extract directory name.
pub fn extract_time_slug(when: &chrono::DateTime<chrono::Utc>) -> String {
    slugify(&when.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Test Extract - UCLH OMOP CDM"), "test-extract-uclh-omop-cdm");
        assert_eq!(slugify("already-a-slug"), "already-a-slug");
        assert_eq!(slugify("  padded  "), "padded");
        assert_eq!(slugify("MiXeD_CaSe"), "mixed-case");
    }

    #[test]
    fn test_extract_time_slug() {
        let when = chrono::Utc.with_ymd_and_hms(2023, 12, 7, 14, 8, 58).unwrap();
        assert_eq!(extract_time_slug(&when), "2023-12-07t14-08-58z");
    }
}
