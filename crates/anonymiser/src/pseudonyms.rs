//! Production pseudonym seam: the hasher oracle plus the study ledger.

use deid::{PseudonymSource, StudyInfo};
use hasher_client::HasherClient;
use ledger::Ledger;

pub struct Pseudonyms {
    hasher: HasherClient,
    ledger: Ledger,
}

impl Pseudonyms {
    pub fn new(hasher: HasherClient, ledger: Ledger) -> Self {
        Self { hasher, ledger }
    }
}

#[async_trait::async_trait]
impl PseudonymSource for Pseudonyms {
    async fn secure_hash(
        &self,
        project_slug: &str,
        message: &str,
        length: u32,
    ) -> anyhow::Result<String> {
        Ok(self.hasher.hash(project_slug, message, length).await?)
    }

    async fn pseudo_study_uid(
        &self,
        project_slug: &str,
        study: &StudyInfo,
    ) -> anyhow::Result<String> {
        Ok(self
            .ledger
            .assign_pseudo_study_uid(
                project_slug,
                &study.mrn,
                &study.accession_number,
                hasher_client::new_study_uid,
            )
            .await?)
    }

    async fn pseudo_patient_id(
        &self,
        project_slug: &str,
        mrn: &str,
        hashed_candidate: &str,
    ) -> anyhow::Result<String> {
        Ok(self
            .ledger
            .assign_or_get_pseudo_patient_id(project_slug, mrn, hashed_candidate)
            .await?)
    }
}
