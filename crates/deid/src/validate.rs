//! Post-anonymisation validation.
//!
//! An aggressive tag scheme can strip attributes the information-object
//! definition requires. The engine cannot refuse such schemes (projects own
//! them), but it can report what the anonymisation newly broke: errors already
//! present before the passes are excluded from the diff.

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

/// Attributes which must be present and non-empty (type 1) in any composite
/// instance this pipeline handles.
const TYPE1: &[(Tag, &str)] = &[
    (tags::SOP_CLASS_UID, "SOPClassUID"),
    (tags::SOP_INSTANCE_UID, "SOPInstanceUID"),
    (tags::STUDY_INSTANCE_UID, "StudyInstanceUID"),
    (tags::SERIES_INSTANCE_UID, "SeriesInstanceUID"),
    (tags::MODALITY, "Modality"),
];

/// Attributes which must be present but may be empty (type 2).
const TYPE2: &[(Tag, &str)] = &[
    (tags::PATIENT_ID, "PatientID"),
    (tags::PATIENT_NAME, "PatientName"),
    (tags::PATIENT_BIRTH_DATE, "PatientBirthDate"),
    (tags::PATIENT_SEX, "PatientSex"),
    (tags::STUDY_DATE, "StudyDate"),
    (tags::STUDY_TIME, "StudyTime"),
    (tags::ACCESSION_NUMBER, "AccessionNumber"),
    (tags::REFERRING_PHYSICIAN_NAME, "ReferringPhysicianName"),
    (tags::STUDY_ID, "StudyID"),
    (tags::SERIES_NUMBER, "SeriesNumber"),
    (tags::INSTANCE_NUMBER, "InstanceNumber"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub tag: Tag,
    pub name: &'static str,
    pub problem: Problem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Problem {
    /// A required attribute is absent.
    Missing,
    /// A type-1 attribute is present but empty.
    Empty,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.problem {
            Problem::Missing => write!(f, "{} is missing", self.name),
            Problem::Empty => write!(f, "{} is empty", self.name),
        }
    }
}

fn validate(dataset: &InMemDicomObject) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for &(tag, name) in TYPE1 {
        match dataset.element(tag) {
            Err(_) => errors.push(ValidationError {
                tag,
                name,
                problem: Problem::Missing,
            }),
            Ok(element) => {
                let empty = element
                    .to_str()
                    .map(|value| value.trim().is_empty())
                    .unwrap_or(false);
                if empty {
                    errors.push(ValidationError {
                        tag,
                        name,
                        problem: Problem::Empty,
                    });
                }
            }
        }
    }

    for &(tag, name) in TYPE2 {
        if dataset.element(tag).is_err() {
            errors.push(ValidationError {
                tag,
                name,
                problem: Problem::Missing,
            });
        }
    }
    errors
}

/// The validation errors introduced between `before` and `after`.
pub fn validation_diff(
    before: &InMemDicomObject,
    after: &InMemDicomObject,
) -> Vec<ValidationError> {
    let pre_existing = validate(before);
    validate(after)
        .into_iter()
        .filter(|error| !pre_existing.contains(error))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use dicom_core::value::PrimitiveValue;
    use dicom_core::{DataElement, VR};

    fn minimal() -> InMemDicomObject {
        InMemDicomObject::from_element_iter(
            TYPE1
                .iter()
                .map(|&(tag, _)| DataElement::new(tag, VR::UI, PrimitiveValue::from("1.2.3")))
                .chain(
                    TYPE2
                        .iter()
                        .map(|&(tag, _)| DataElement::new(tag, VR::LO, PrimitiveValue::Empty)),
                ),
        )
    }

    #[test]
    fn test_clean_dataset_has_no_diff() {
        let dataset = minimal();
        assert!(validation_diff(&dataset, &dataset).is_empty());
    }

    #[test]
    fn test_newly_removed_attribute_is_reported() {
        let before = minimal();
        let mut after = before.clone();
        after.remove_element(tags::SERIES_INSTANCE_UID);

        let diff = validation_diff(&before, &after);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].name, "SeriesInstanceUID");
        assert_eq!(diff[0].problem, Problem::Missing);
    }

    #[test]
    fn test_pre_existing_errors_are_excluded() {
        let mut before = minimal();
        before.remove_element(tags::STUDY_ID);
        let mut after = before.clone();
        after.remove_element(tags::INSTANCE_NUMBER);

        let diff = validation_diff(&before, &after);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].name, "InstanceNumber");
    }

    #[test]
    fn test_emptied_type1_attribute_is_reported() {
        let before = minimal();
        let mut after = before.clone();
        after.put(DataElement::new(
            tags::MODALITY,
            VR::CS,
            PrimitiveValue::Empty,
        ));

        let diff = validation_diff(&before, &after);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].problem, Problem::Empty);
    }
}
