use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};

use crate::ConfigError;

/// Resolved configuration for one project.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub project: Project,
    /// Accepted for compatibility with existing config files; not enforced.
    #[serde(default = "default_min_instances")]
    pub min_instances_per_series: u32,
    /// Case-insensitive substring deny-list applied to SeriesDescription.
    #[serde(default)]
    pub series_filters: Vec<String>,
    #[serde(default)]
    pub allowed_manufacturers: Vec<Manufacturer>,
    pub tag_operation_files: TagOperationFiles,
    pub destination: Destination,
}

fn default_min_instances() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub azure_kv_alias: Option<String>,
    /// Modality allow-list, e.g. ["DX", "CR"].
    pub modalities: Vec<String>,
}

/// An allowed manufacturer, together with the series numbers to exclude for it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manufacturer {
    pub regex: CaseInsensitiveRegex,
    #[serde(default)]
    pub exclude_series_numbers: Vec<String>,
}

/// A regex compiled case-insensitively at config load.
#[derive(Debug, Clone)]
pub struct CaseInsensitiveRegex(regex::Regex);

impl CaseInsensitiveRegex {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self(
            regex::RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()?,
        ))
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.0.is_match(haystack)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl<'de> Deserialize<'de> for CaseInsensitiveRegex {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pattern = String::deserialize(deserializer)?;
        Self::new(&pattern).map_err(serde::de::Error::custom)
    }
}

/// Tag operation files for a project. At least one base file is required.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagOperationFiles {
    pub base: Vec<PathBuf>,
    #[serde(default)]
    pub manufacturer_overrides: Vec<PathBuf>,
}

/// Where de-identified studies and parquet extracts are delivered.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Destination {
    pub dicom: DicomDestination,
    pub parquet: ParquetDestination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DicomDestination {
    None,
    Ftps,
    Dicomweb,
    Xnat,
    Sftp,
    TreApi,
}

/// Parquet sinks are a subset of the DICOM ones: a DICOM-only protocol
/// (dicomweb, xnat) cannot carry parquet files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParquetDestination {
    None,
    Ftps,
    Sftp,
    TreApi,
}

impl ProjectConfig {
    /// Parse and validate a single project config document.
    pub fn from_yaml(raw: &str, path: &Path, configs_dir: &Path) -> Result<Self, ConfigError> {
        let mut config: ProjectConfig =
            serde_yaml::from_str(raw).map_err(|source| ConfigError::Yaml {
                path: path.to_owned(),
                source,
            })?;

        if config.tag_operation_files.base.is_empty() {
            return Err(ConfigError::NoBaseTagFiles);
        }

        // Resolve tag-operation file names against the configs directory and
        // fail now rather than at anonymisation time.
        let tag_ops_dir = configs_dir.join("tag-operations");
        config.tag_operation_files.base = resolve_existing(
            &tag_ops_dir,
            std::mem::take(&mut config.tag_operation_files.base),
        )?;
        config.tag_operation_files.manufacturer_overrides = resolve_existing(
            &tag_ops_dir.join("manufacturer-overrides"),
            std::mem::take(&mut config.tag_operation_files.manufacturer_overrides),
        )?;

        Ok(config)
    }

    pub fn slug(&self) -> String {
        crate::slugify(&self.project.name)
    }

    /// Whether this config excludes the series with the given description.
    ///
    /// A simple case-insensitive substring check: this data is ultimately typed
    /// by a human, and different image sources use different case conventions.
    pub fn is_series_description_excluded(&self, series_description: &str) -> bool {
        let description = series_description.to_uppercase();
        self.series_filters
            .iter()
            .any(|filter| description.contains(&filter.to_uppercase()))
    }

    /// Whether the manufacturer is in the allow-list.
    pub fn is_manufacturer_allowed(&self, manufacturer: &str) -> bool {
        self.manufacturer_config(manufacturer).is_some()
    }

    /// The first allow-list entry matching the manufacturer, if any.
    pub fn manufacturer_config(&self, manufacturer: &str) -> Option<&Manufacturer> {
        self.allowed_manufacturers
            .iter()
            .find(|entry| entry.regex.is_match(manufacturer))
    }

    /// Whether this config excludes the series with the given number for the
    /// given manufacturer.
    pub fn is_series_number_excluded(&self, manufacturer: &str, series_number: &str) -> bool {
        let Some(entry) = self.manufacturer_config(manufacturer) else {
            return false;
        };
        entry
            .exclude_series_numbers
            .iter()
            .any(|excluded| series_number.contains(excluded.as_str()))
    }
}

fn resolve_existing(dir: &Path, names: Vec<PathBuf>) -> Result<Vec<PathBuf>, ConfigError> {
    names
        .into_iter()
        .map(|name| {
            let path = dir.join(name);
            if path.exists() {
                Ok(path)
            } else {
                Err(ConfigError::MissingTagFile(path))
            }
        })
        .collect()
}

/// Load configuration for a project based on its slug. The project must have a
/// corresponding `<slug>.yaml` in the configs directory.
pub fn load_project_config(configs_dir: &Path, slug: &str) -> Result<ProjectConfig, ConfigError> {
    let path = configs_dir.join(format!("{slug}.yaml"));
    let raw = std::fs::read_to_string(&path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::MissingProject(slug.to_string())
        } else {
            ConfigError::Io {
                path: path.clone(),
                source,
            }
        }
    })?;
    tracing::debug!(?path, "loading project config");
    ProjectConfig::from_yaml(&raw, &path, configs_dir)
}

#[cfg(test)]
mod test {
    use super::*;

    const MINIMAL: &str = r#"
project:
  name: "Test Extract - UCLH OMOP CDM"
  modalities: ["DX", "CR"]
series_filters:
  - "localizer"
  - "scout"
allowed_manufacturers:
  - regex: "philips"
    exclude_series_numbers: ["77"]
tag_operation_files:
  base:
    - "base.yaml"
destination:
  dicom: "ftps"
  parquet: "ftps"
"#;

    fn write_config_tree(dir: &std::path::Path) {
        std::fs::create_dir_all(dir.join("tag-operations/manufacturer-overrides")).unwrap();
        std::fs::write(dir.join("tag-operations/base.yaml"), "[]").unwrap();
    }

    fn parse(raw: &str) -> Result<ProjectConfig, ConfigError> {
        let tmp = tempfile::tempdir().unwrap();
        write_config_tree(tmp.path());
        ProjectConfig::from_yaml(raw, &tmp.path().join("test.yaml"), tmp.path())
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.slug(), "test-extract-uclh-omop-cdm");
        assert_eq!(config.project.modalities, vec!["DX", "CR"]);
        assert_eq!(config.destination.dicom, DicomDestination::Ftps);
        assert_eq!(config.min_instances_per_series, 1);
    }

    #[test]
    fn test_series_description_filter_is_case_insensitive_substring() {
        let config = parse(MINIMAL).unwrap();
        assert!(config.is_series_description_excluded("LOCALIZER series"));
        assert!(config.is_series_description_excluded("head Scout"));
        assert!(!config.is_series_description_excluded("axial brain"));
    }

    #[test]
    fn test_manufacturer_allow_list() {
        let config = parse(MINIMAL).unwrap();
        assert!(config.is_manufacturer_allowed("Philips Healthcare"));
        assert!(!config.is_manufacturer_allowed("Siemens"));
        assert!(config.is_series_number_excluded("PHILIPS", "77"));
        assert!(!config.is_series_number_excluded("PHILIPS", "12"));
        // Unknown manufacturers fall to the allow-list check, not this one.
        assert!(!config.is_series_number_excluded("Siemens", "77"));
    }

    #[test]
    fn test_dicom_only_parquet_destination_is_rejected() {
        let raw = MINIMAL.replace("parquet: \"ftps\"", "parquet: \"dicomweb\"");
        let err = parse(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::Yaml { .. }), "{err}");
    }

    #[test]
    fn test_missing_tag_file_is_rejected() {
        let raw = MINIMAL.replace("base.yaml", "absent.yaml");
        let err = parse(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTagFile(_)), "{err}");
    }

    #[test]
    fn test_no_base_tag_files_is_rejected() {
        let raw = MINIMAL.replace("  base:\n    - \"base.yaml\"", "  base: []");
        let err = parse(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::NoBaseTagFiles), "{err}");
    }
}
