//! Orchestration of one export: guard, fetch, deliver, record.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dicom_dictionary_std::tags;
use exports::ParquetExport;
use ledger::{Ledger, LedgerError};
use patient_queue::ExportMessage;

use crate::secrets::SecretStore;
use crate::sinks::{make_parquet_uploader, make_uploader, XnatSettings};
use crate::{StudyArchive, UploadError};

/// The two ledger operations the dispatch performs, seamed so the guard and
/// the record-after-delivery ordering can be tested without postgres.
#[async_trait::async_trait]
pub trait ExportLedger: Send + Sync {
    async fn already_exported(&self, pseudo_study_uid: &str) -> Result<bool, LedgerError>;
    async fn mark_exported(
        &self,
        pseudo_study_uid: &str,
        when: DateTime<Utc>,
    ) -> Result<(), LedgerError>;
}

#[async_trait::async_trait]
impl ExportLedger for Ledger {
    async fn already_exported(&self, pseudo_study_uid: &str) -> Result<bool, LedgerError> {
        Ledger::already_exported(self, pseudo_study_uid).await
    }

    async fn mark_exported(
        &self,
        pseudo_study_uid: &str,
        when: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        Ledger::mark_exported(self, pseudo_study_uid, when).await
    }
}

/// Where the anonymiser's spooled archives are fetched from. Seamed so the
/// dispatch can be tested without the anonymisation node.
#[async_trait::async_trait]
pub trait ArchiveSource: Send + Sync {
    async fn fetch(&self, pseudo_study_uid: &str) -> anyhow::Result<Vec<u8>>;
}

/// HTTP source backed by the anonymiser's archive endpoint.
pub struct AnonymiserArchives {
    url: url::Url,
    client: reqwest::Client,
}

impl AnonymiserArchives {
    pub fn new(url: url::Url) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|error| UploadError::Other(error.into()))?;
        Ok(Self { url, client })
    }
}

#[async_trait::async_trait]
impl ArchiveSource for AnonymiserArchives {
    async fn fetch(&self, pseudo_study_uid: &str) -> anyhow::Result<Vec<u8>> {
        let url = self
            .url
            .join(&format!("studies/{pseudo_study_uid}/archive"))
            .expect("anonymiser URL is a valid base");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("archive fetch returned {status}");
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub configs_dir: PathBuf,
    /// Root of the local export tree, for parquet mirroring.
    pub export_root: PathBuf,
    pub xnat_settings: XnatSettings,
}

/// Consumes export messages: one study in, one delivery plus one ledger write
/// out. Delivery failure aborts before the ledger is touched.
pub struct Dispatch {
    ledger: Arc<dyn ExportLedger>,
    secrets: Arc<dyn SecretStore>,
    archives: Arc<dyn ArchiveSource>,
    config: DispatchConfig,
}

impl Dispatch {
    pub fn new(
        ledger: Arc<dyn ExportLedger>,
        secrets: Arc<dyn SecretStore>,
        archives: Arc<dyn ArchiveSource>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            ledger,
            secrets,
            archives,
            config,
        }
    }

    /// Deliver one spooled study to its project's DICOM destination.
    pub async fn handle_export(&self, message: &ExportMessage) -> Result<(), UploadError> {
        let config =
            project_config::load_project_config(&self.config.configs_dir, &message.project_name)
                .map_err(anyhow::Error::from)?;

        if self
            .ledger
            .already_exported(&message.pseudo_study_uid)
            .await?
        {
            return Err(UploadError::AlreadyExported);
        }

        let zip_bytes = self.archives.fetch(&message.pseudo_study_uid).await?;
        let pseudo_patient_id = read_pseudo_patient_id(zip_bytes.clone()).await;

        let study = StudyArchive {
            project_slug: message.project_name.clone(),
            pseudo_study_uid: message.pseudo_study_uid.clone(),
            pseudo_patient_id,
            zip_bytes,
        };

        let uploader =
            make_uploader(&config, self.secrets.as_ref(), &self.config.xnat_settings).await?;
        uploader.upload_dicom(&study).await?;

        // Only a sink acknowledgment gets us here.
        self.ledger
            .mark_exported(&message.pseudo_study_uid, Utc::now())
            .await?;
        Ok(())
    }

    /// Mirror an extract's parquet tree to the project's parquet destination.
    pub async fn handle_parquet_export(
        &self,
        project_name: &str,
        extract_datetime: &DateTime<Utc>,
    ) -> Result<(), UploadError> {
        let slug = project_config::slugify(project_name);
        let config = project_config::load_project_config(&self.config.configs_dir, &slug)
            .map_err(anyhow::Error::from)?;

        let export = ParquetExport::new(project_name, extract_datetime, &self.config.export_root);
        let uploader = make_parquet_uploader(&config, self.secrets.as_ref()).await?;
        uploader.upload_parquet(&export).await
    }
}

/// The pseudonymous patient id, read from the archive's first instance. Sinks
/// which do not need it tolerate its absence.
async fn read_pseudo_patient_id(zip_bytes: Vec<u8>) -> Option<String> {
    tokio::task::spawn_blocking(move || {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(&zip_bytes)).ok()?;
        let mut entry = archive.by_index(0).ok()?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes).ok()?;

        let object = dicom_object::from_reader(bytes.as_slice()).ok()?;
        object
            .element(tags::PATIENT_ID)
            .ok()
            .and_then(|element| element.to_str().ok())
            .map(|value| value.trim().to_string())
    })
    .await
    .ok()
    .flatten()
}
