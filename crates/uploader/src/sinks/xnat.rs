//! Zip import into an XNAT instance.

use exports::ParquetExport;

use crate::secrets::SecretStore;
use crate::sinks::fetch_secret;
use crate::{StudyArchive, UploadError, Uploader};

/// Where imported sessions land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum XnatDestination {
    /// Straight into the archive.
    Archive,
    /// Into the prearchive for manual review before archiving.
    Prearchive,
}

impl XnatDestination {
    fn as_param(self) -> &'static str {
        match self {
            XnatDestination::Archive => "/archive",
            XnatDestination::Prearchive => "/prearchive",
        }
    }
}

/// Conflict handling for sessions which already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum XnatOverwrite {
    /// Error if the session already exists.
    None,
    /// Append; conflicting series raise an error.
    Append,
    /// Append; conflicting series are overwritten.
    Delete,
}

impl XnatOverwrite {
    fn as_param(self) -> &'static str {
        match self {
            XnatOverwrite::None => "none",
            XnatOverwrite::Append => "append",
            XnatOverwrite::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct XnatSettings {
    pub destination: XnatDestination,
    pub overwrite: XnatOverwrite,
}

impl Default for XnatSettings {
    fn default() -> Self {
        Self {
            destination: XnatDestination::Archive,
            overwrite: XnatOverwrite::None,
        }
    }
}

pub struct XnatUploader {
    url: String,
    username: String,
    password: String,
    settings: XnatSettings,
    client: reqwest::Client,
}

impl XnatUploader {
    pub async fn from_secrets(
        prefix: &str,
        secrets: &dyn SecretStore,
        settings: XnatSettings,
    ) -> Result<Self, UploadError> {
        let host = fetch_secret(secrets, prefix, "xnat", "host").await?;
        let port: u16 = fetch_secret(secrets, prefix, "xnat", "port")
            .await?
            .parse()
            .map_err(|_| UploadError::Rejected("xnat port is not a number".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|error| UploadError::Other(error.into()))?;
        Ok(Self {
            url: format!("https://{host}:{port}"),
            username: fetch_secret(secrets, prefix, "xnat", "username").await?,
            password: fetch_secret(secrets, prefix, "xnat", "password").await?,
            settings,
            client,
        })
    }
}

#[async_trait::async_trait]
impl Uploader for XnatUploader {
    async fn upload_dicom(&self, study: &StudyArchive) -> Result<(), UploadError> {
        tracing::info!(pseudo_study_uid = %study.pseudo_study_uid, "starting XNAT import");

        let subject = study.pseudo_patient_id.as_deref().ok_or_else(|| {
            UploadError::Rejected("XNAT import needs the pseudonymous patient id".to_string())
        })?;

        let response = self
            .client
            .post(format!("{}/data/services/import", self.url))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[
                ("dest", self.settings.destination.as_param()),
                ("overwrite", self.settings.overwrite.as_param()),
                ("project", study.project_slug.as_str()),
                ("subject", subject),
                ("session", study.pseudo_study_uid.as_str()),
                ("import-handler", "DICOM-zip"),
            ])
            .header(reqwest::header::CONTENT_TYPE, "application/zip")
            .body(study.zip_bytes.clone())
            .send()
            .await
            .map_err(|error| UploadError::Other(error.into()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Rejected(format!(
                "XNAT import returned {status}: {}",
                response.text().await.unwrap_or_default(),
            )));
        }
        tracing::info!(pseudo_study_uid = %study.pseudo_study_uid, "finished XNAT import");
        Ok(())
    }

    async fn upload_parquet(&self, _export: &ParquetExport) -> Result<(), UploadError> {
        Err(UploadError::Unsupported {
            destination: "xnat",
            what: "parquet upload",
        })
    }
}
