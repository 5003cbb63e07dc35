//! Delivery through the TRE's airlock API.
//!
//! The airlock is eventually consistent: a flush request queues data for
//! ingestion rather than completing it. Delivery is acknowledged at
//! queued-for-flush, and the dispatch records the export at that point,
//! accepting the in-flight window.

use std::io::{Cursor, Write};

use exports::ParquetExport;

use crate::secrets::SecretStore;
use crate::sinks::{fetch_secret, sink_error};
use crate::{StudyArchive, UploadError, Uploader};

pub struct TreApiUploader {
    url: String,
    token: String,
    client: reqwest::Client,
}

impl TreApiUploader {
    pub async fn from_secrets(
        prefix: &str,
        secrets: &dyn SecretStore,
    ) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|error| UploadError::Other(error.into()))?;
        Ok(Self {
            url: fetch_secret(secrets, prefix, "treapi", "url")
                .await?
                .trim_end_matches('/')
                .to_string(),
            token: fetch_secret(secrets, prefix, "treapi", "token").await?,
            client,
        })
    }

    async fn check_token(&self) -> Result<(), UploadError> {
        let response = self
            .client
            .get(format!("{}/tokens/info", self.url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|error| UploadError::Other(error.into()))?;
        if !response.status().is_success() {
            return Err(UploadError::Rejected("TRE API token is invalid".to_string()));
        }
        Ok(())
    }

    async fn upload_file(&self, filename: &str, bytes: Vec<u8>) -> Result<(), UploadError> {
        let response = self
            .client
            .post(format!("{}/airlock/upload/{filename}", self.url))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|error| UploadError::Other(error.into()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Rejected(format!(
                "airlock upload returned {status}: {}",
                response.text().await.unwrap_or_default(),
            )));
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), UploadError> {
        let response = self
            .client
            .post(format!("{}/airlock/flush", self.url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|error| UploadError::Other(error.into()))?;
        if !response.status().is_success() {
            return Err(UploadError::Rejected("airlock flush was refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Uploader for TreApiUploader {
    async fn upload_dicom(&self, study: &StudyArchive) -> Result<(), UploadError> {
        tracing::info!(pseudo_study_uid = %study.pseudo_study_uid, "starting TRE airlock upload");
        self.check_token().await?;
        self.upload_file(&study.file_name(), study.zip_bytes.clone())
            .await?;
        self.flush().await?;
        tracing::info!(pseudo_study_uid = %study.pseudo_study_uid, "study queued for airlock flush");
        Ok(())
    }

    async fn upload_parquet(&self, export: &ParquetExport) -> Result<(), UploadError> {
        tracing::info!(project = %export.project_slug, "starting TRE airlock parquet upload");
        self.check_token().await?;

        let files = export.parquet_files()?;
        let base = export.current_extract_base.clone();
        let bundle = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, UploadError> {
            let mut bytes = Vec::new();
            {
                let mut archive = zip::ZipWriter::new(Cursor::new(&mut bytes));
                let options = zip::write::FileOptions::default()
                    .compression_method(zip::CompressionMethod::Deflated);
                for relative in files {
                    let content = std::fs::read(base.join(&relative)).map_err(sink_error)?;
                    archive
                        .start_file(relative.to_string_lossy(), options)
                        .map_err(sink_error)?;
                    archive.write_all(&content).map_err(sink_error)?;
                }
                archive.finish().map_err(sink_error)?;
            }
            Ok(bytes)
        })
        .await
        .map_err(anyhow::Error::from)??;

        let filename = format!(
            "{}-{}-parquet.zip",
            export.project_slug, export.extract_time_slug,
        );
        self.upload_file(&filename, bundle).await?;
        self.flush().await?;
        tracing::info!(project = %export.project_slug, "parquet queued for airlock flush");
        Ok(())
    }
}
