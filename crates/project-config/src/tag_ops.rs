use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::{CaseInsensitiveRegex, ConfigError, ProjectConfig};

/// One entry of a tag-operation file: which data element, and what to do to it.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TagOp {
    #[serde(deserialize_with = "tag_number")]
    pub group: u16,
    #[serde(deserialize_with = "tag_number")]
    pub element: u16,
    pub op: TagAction,
}

/// Tag files spell group and element ids as `0x`-prefixed hex. Depending on
/// the YAML parser these arrive as integers or as strings, so both are taken.
fn tag_number<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct TagNumber;

    impl serde::de::Visitor<'_> for TagNumber {
        type Value = u16;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a 16-bit tag number, as an integer or 0x-prefixed hex string")
        }

        fn visit_u64<E: serde::de::Error>(self, value: u64) -> Result<u16, E> {
            u16::try_from(value).map_err(|_| E::custom("tag number out of range"))
        }

        fn visit_i64<E: serde::de::Error>(self, value: i64) -> Result<u16, E> {
            u16::try_from(value).map_err(|_| E::custom("tag number out of range"))
        }

        fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<u16, E> {
            let digits = value
                .strip_prefix("0x")
                .or_else(|| value.strip_prefix("0X"))
                .unwrap_or(value);
            u16::from_str_radix(digits, 16)
                .map_err(|_| E::custom(format!("'{value}' is not a tag number")))
        }
    }

    deserializer.deserialize_any(TagNumber)
}

/// The closed set of operations a scheme may apply to a data element. Config
/// files spell these as strings; they are resolved to variants at load time.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TagAction {
    /// Leave the element untouched.
    Keep,
    /// Replace the value with a VR-appropriate blank.
    Replace,
    /// Remove the element.
    Delete,
    /// Replace the value with its keyed hash. Long-string (LO) elements only.
    SecureHash,
}

/// A manufacturer-specific override block: when the dataset's Manufacturer
/// matches, these tag operations are merged over the base scheme.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManufacturerOverride {
    pub manufacturer: CaseInsensitiveRegex,
    pub tags: Vec<TagOp>,
}

/// The tag-operation files of one project, loaded but not yet merged.
#[derive(Debug, Clone)]
pub struct TagOperations {
    /// Base schemes, in the order listed by the project config.
    pub base: Vec<Vec<TagOp>>,
    /// Override blocks from each manufacturer-overrides file.
    pub manufacturer_overrides: Vec<Vec<ManufacturerOverride>>,
}

/// The merged scheme: for each (group, element), the operation to apply.
/// Elements absent from the scheme are deleted by the allow-list pass.
pub type TagScheme = BTreeMap<(u16, u16), TagAction>;

/// Load the tag-operation files referenced by a project config.
pub fn load_tag_operations(config: &ProjectConfig) -> Result<TagOperations, ConfigError> {
    let base = config
        .tag_operation_files
        .base
        .iter()
        .map(|path| load_yaml::<Vec<TagOp>>(path))
        .collect::<Result<Vec<_>, _>>()?;

    let manufacturer_overrides = config
        .tag_operation_files
        .manufacturer_overrides
        .iter()
        .map(|path| load_yaml::<Vec<ManufacturerOverride>>(path))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TagOperations {
        base,
        manufacturer_overrides,
    })
}

fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
        path: path.to_owned(),
        source,
    })
}

/// Merge the loaded schemes into one. Base files are merged in listed order
/// with later entries overriding earlier ones by (group, element); if the
/// dataset's manufacturer matches any override block, its tags merge last.
pub fn merge_tag_schemes(operations: &TagOperations, manufacturer: Option<&str>) -> TagScheme {
    let mut merged = TagScheme::new();

    for scheme in &operations.base {
        for tag in scheme {
            merged.insert((tag.group, tag.element), tag.op);
        }
    }

    let Some(manufacturer) = manufacturer else {
        return merged;
    };
    for file in &operations.manufacturer_overrides {
        for block in file {
            if !block.manufacturer.is_match(manufacturer) {
                continue;
            }
            for tag in &block.tags {
                merged.insert((tag.group, tag.element), tag.op);
            }
        }
    }
    merged
}

#[cfg(test)]
mod test {
    use super::*;

    fn op(group: u16, element: u16, op: TagAction) -> TagOp {
        TagOp { group, element, op }
    }

    #[test]
    fn test_later_base_files_override_earlier_ones() {
        let operations = TagOperations {
            base: vec![
                vec![
                    op(0x0008, 0x0050, TagAction::Keep),
                    op(0x0010, 0x0020, TagAction::Keep),
                ],
                vec![op(0x0010, 0x0020, TagAction::SecureHash)],
            ],
            manufacturer_overrides: vec![],
        };

        let merged = merge_tag_schemes(&operations, None);
        assert_eq!(merged[&(0x0008, 0x0050)], TagAction::Keep);
        assert_eq!(merged[&(0x0010, 0x0020)], TagAction::SecureHash);
    }

    #[test]
    fn test_manufacturer_override_merges_last() {
        let operations = TagOperations {
            base: vec![vec![op(0x0018, 0x1000, TagAction::Delete)]],
            manufacturer_overrides: vec![vec![
                ManufacturerOverride {
                    manufacturer: CaseInsensitiveRegex::new("philips").unwrap(),
                    tags: vec![op(0x0018, 0x1000, TagAction::Keep)],
                },
                ManufacturerOverride {
                    manufacturer: CaseInsensitiveRegex::new("siemens").unwrap(),
                    tags: vec![op(0x0018, 0x1000, TagAction::Replace)],
                },
            ]],
        };

        let merged = merge_tag_schemes(&operations, Some("Philips Healthcare"));
        assert_eq!(merged[&(0x0018, 0x1000)], TagAction::Keep);

        let merged = merge_tag_schemes(&operations, Some("SIEMENS"));
        assert_eq!(merged[&(0x0018, 0x1000)], TagAction::Replace);

        let merged = merge_tag_schemes(&operations, Some("GE Medical"));
        assert_eq!(merged[&(0x0018, 0x1000)], TagAction::Delete);
    }

    #[test]
    fn test_tag_numbers_parse_as_hex_strings_or_integers() {
        let parsed: Vec<TagOp> = serde_yaml::from_str(
            r#"
- group: "0x0010"
  element: 32
  op: "keep"
"#,
        )
        .unwrap();
        assert_eq!(parsed[0].group, 0x0010);
        assert_eq!(parsed[0].element, 0x0020);
    }

    #[test]
    fn test_tag_action_spellings() {
        let parsed: Vec<TagOp> = serde_yaml::from_str(
            r#"
- group: 0x0008
  element: 0x0050
  op: "secure-hash"
- group: 0x0020
  element: 0x000D
  op: "keep"
- group: 0x0010
  element: 0x0010
  op: "replace"
- group: 0x0010
  element: 0x0030
  op: "delete"
"#,
        )
        .unwrap();
        assert_eq!(
            parsed.iter().map(|t| t.op).collect::<Vec<_>>(),
            vec![
                TagAction::SecureHash,
                TagAction::Keep,
                TagAction::Replace,
                TagAction::Delete
            ],
        );
    }
}
