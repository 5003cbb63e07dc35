use dicom_core::{Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use project_config::{merge_tag_schemes, ProjectConfig, TagOperations};

use crate::arena::DataSet;
use crate::{DeidError, PseudonymSource, StudyInfo};

/// Hash length used for patient-identifier pseudonyms.
const PATIENT_ID_HASH_LENGTH: u32 = 64;

/// The engine binds a project's configuration and loaded tag operations to
/// the pseudonym seam. One engine serves every instance of a study.
pub struct TagEngine<'a> {
    config: &'a ProjectConfig,
    operations: &'a TagOperations,
    pseudonyms: &'a dyn PseudonymSource,
}

impl<'a> TagEngine<'a> {
    pub fn new(
        config: &'a ProjectConfig,
        operations: &'a TagOperations,
        pseudonyms: &'a dyn PseudonymSource,
    ) -> Self {
        Self {
            config,
            operations,
            pseudonyms,
        }
    }

    /// De-identify one instance.
    ///
    /// Pre-flight filters run first, against the un-anonymised dataset. Then
    /// the allow-list and operation passes run purely in memory; hashing and
    /// pseudonym assignment suspend between passes, never inside them. The
    /// pseudonymous StudyInstanceUID and PatientID are written last so that
    /// downstream consumers see the final identifiers.
    pub async fn anonymise(
        &self,
        dataset: InMemDicomObject,
    ) -> Result<InMemDicomObject, DeidError> {
        let study = StudyInfo::from_dataset(&dataset);
        self.preflight(&dataset)?;

        let manufacturer = read_str(&dataset, tags::MANUFACTURER);
        let scheme = merge_tag_schemes(self.operations, manufacturer.as_deref());
        let slug = self.config.slug();

        tracing::debug!(
            mrn = %study.mrn,
            accession_number = %study.accession_number,
            scheme_len = scheme.len(),
            "anonymising instance",
        );

        let mut data = DataSet::from_object(dataset);
        data.enforce_allow_list(&scheme);
        let hash_requests = data.apply_operations(&scheme)?;

        for request in hash_requests {
            let hashed = self
                .pseudonyms
                .secure_hash(&slug, &request.message, PATIENT_ID_HASH_LENGTH)
                .await
                .map_err(DeidError::Pseudonym)?;
            data.set_string(request.item, request.tag, VR::LO, &hashed);
        }

        let pseudo_study_uid = self
            .pseudonyms
            .pseudo_study_uid(&slug, &study)
            .await
            .map_err(DeidError::Pseudonym)?;
        data.set_root_string(tags::STUDY_INSTANCE_UID, VR::UI, &pseudo_study_uid);

        let candidate = self
            .pseudonyms
            .secure_hash(&slug, &study.mrn, PATIENT_ID_HASH_LENGTH)
            .await
            .map_err(DeidError::Pseudonym)?;
        let pseudo_patient_id = self
            .pseudonyms
            .pseudo_patient_id(&slug, &study.mrn, &candidate)
            .await
            .map_err(DeidError::Pseudonym)?;
        data.set_root_string(tags::PATIENT_ID, VR::LO, &pseudo_patient_id);

        Ok(data.into_object())
    }

    /// Ordered filters deciding whether this instance reaches the passes at
    /// all. The series-description check runs first in case the scheme later
    /// deletes SeriesDescription itself.
    fn preflight(&self, dataset: &InMemDicomObject) -> Result<(), DeidError> {
        if let Some(description) = read_str(dataset, tags::SERIES_DESCRIPTION) {
            if self.config.is_series_description_excluded(&description) {
                return Err(DeidError::DiscardSeries(format!(
                    "series description '{description}' is filtered",
                )));
            }
        }

        let modality = read_str(dataset, tags::MODALITY).unwrap_or_default();
        if !self
            .config
            .project
            .modalities
            .iter()
            .any(|allowed| allowed == &modality)
        {
            return Err(DeidError::SkipInstance(format!(
                "modality '{modality}' is not in scope",
            )));
        }

        let manufacturer = read_str(dataset, tags::MANUFACTURER).unwrap_or_default();
        if !self.config.is_manufacturer_allowed(&manufacturer) {
            return Err(DeidError::DiscardSeries(format!(
                "manufacturer '{manufacturer}' is not allowed",
            )));
        }
        if let Some(series_number) = read_str(dataset, tags::SERIES_NUMBER) {
            if self
                .config
                .is_series_number_excluded(&manufacturer, &series_number)
            {
                return Err(DeidError::DiscardSeries(format!(
                    "series number '{series_number}' is excluded for '{manufacturer}'",
                )));
            }
        }
        Ok(())
    }
}

fn read_str(dataset: &InMemDicomObject, tag: Tag) -> Option<String> {
    dataset
        .element(tag)
        .ok()
        .and_then(|element| element.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
