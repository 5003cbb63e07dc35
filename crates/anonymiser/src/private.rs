//! Reading the stamped project marker.

use dicom_core::Tag;
use dicom_object::InMemDicomObject;
use project_config::tags::PROJECT_NAME_TAG;

/// Locate the project slug carried in the private marker tag.
///
/// The private block id is not fixed; the creator element within the marker's
/// group names the block that is ours. Returns `None` when the dataset was
/// never stamped (standalone use).
pub fn read_project_slug(dataset: &InMemDicomObject) -> Option<String> {
    let group = PROJECT_NAME_TAG.group;

    for block in 0x10..=0xFFu16 {
        let Ok(creator) = dataset.element(Tag(group, block)) else {
            continue;
        };
        let Ok(value) = creator.to_str() else {
            continue;
        };
        if value.trim() != PROJECT_NAME_TAG.creator {
            continue;
        }

        let value_tag = Tag(group, PROJECT_NAME_TAG.element_with_block(block as u8));
        return dataset
            .element(value_tag)
            .ok()
            .and_then(|element| element.to_str().ok())
            .map(|slug| slug.trim().to_string());
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use dicom_core::value::PrimitiveValue;
    use dicom_core::{DataElement, VR};

    #[test]
    fn test_reads_slug_through_creator_lookup() {
        // The stamp landed in block 0x11, not the conventional 0x10.
        let dataset = InMemDicomObject::from_element_iter([
            DataElement::new(
                Tag(0x000D, 0x0011),
                VR::LO,
                PrimitiveValue::from(PROJECT_NAME_TAG.creator),
            ),
            DataElement::new(
                Tag(0x000D, 0x1101),
                VR::LO,
                PrimitiveValue::from("test-extract-uclh-omop-cdm"),
            ),
        ]);

        assert_eq!(
            read_project_slug(&dataset).as_deref(),
            Some("test-extract-uclh-omop-cdm"),
        );
    }

    #[test]
    fn test_other_creators_are_ignored() {
        let dataset = InMemDicomObject::from_element_iter([
            DataElement::new(
                Tag(0x000D, 0x0010),
                VR::LO,
                PrimitiveValue::from("SOMEONE ELSE"),
            ),
            DataElement::new(Tag(0x000D, 0x1001), VR::LO, PrimitiveValue::from("nope")),
        ]);
        assert_eq!(read_project_slug(&dataset), None);
    }

    #[test]
    fn test_unstamped_dataset_yields_none() {
        let dataset = InMemDicomObject::from_element_iter([]);
        assert_eq!(read_project_slug(&dataset), None);
    }
}
