//! STOW-RS delivery to a DICOM-web server.

use std::io::{Cursor, Read};

use exports::ParquetExport;

use crate::secrets::SecretStore;
use crate::sinks::{fetch_secret, sink_error};
use crate::{StudyArchive, UploadError, Uploader};

const BOUNDARY: &str = "pixl-stow-rs-boundary";

pub struct DicomWebUploader {
    /// Base URL of the STOW-RS service.
    url: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl DicomWebUploader {
    pub async fn from_secrets(
        prefix: &str,
        secrets: &dyn SecretStore,
    ) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|error| UploadError::Other(error.into()))?;
        Ok(Self {
            url: fetch_secret(secrets, prefix, "dicomweb", "url")
                .await?
                .trim_end_matches('/')
                .to_string(),
            username: fetch_secret(secrets, prefix, "dicomweb", "username").await?,
            password: fetch_secret(secrets, prefix, "dicomweb", "password").await?,
            client,
        })
    }
}

/// Unpack the study zip into its instance files.
fn unzip_instances(zip_bytes: &[u8]) -> Result<Vec<Vec<u8>>, UploadError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes)).map_err(sink_error)?;
    let mut instances = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(sink_error)?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes).map_err(sink_error)?;
        instances.push(bytes);
    }
    Ok(instances)
}

/// Assemble a `multipart/related` request body of DICOM parts.
fn stow_body(instances: &[Vec<u8>]) -> Vec<u8> {
    let mut body = Vec::new();
    for instance in instances {
        body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Type: application/dicom\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(instance);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

#[async_trait::async_trait]
impl Uploader for DicomWebUploader {
    async fn upload_dicom(&self, study: &StudyArchive) -> Result<(), UploadError> {
        tracing::info!(pseudo_study_uid = %study.pseudo_study_uid, "starting STOW-RS upload");

        let zip_bytes = study.zip_bytes.clone();
        let instances =
            tokio::task::spawn_blocking(move || unzip_instances(&zip_bytes))
                .await
                .map_err(anyhow::Error::from)??;
        if instances.is_empty() {
            return Err(UploadError::Rejected("study archive is empty".to_string()));
        }

        let response = self
            .client
            .post(format!("{}/studies", self.url))
            .basic_auth(&self.username, Some(&self.password))
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; type=\"application/dicom\"; boundary={BOUNDARY}"),
            )
            .header(reqwest::header::ACCEPT, "application/dicom+json")
            .body(stow_body(&instances))
            .send()
            .await
            .map_err(|error| UploadError::Other(error.into()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Rejected(format!(
                "STOW-RS returned {status}: {}",
                response.text().await.unwrap_or_default(),
            )));
        }
        tracing::info!(pseudo_study_uid = %study.pseudo_study_uid, "finished STOW-RS upload");
        Ok(())
    }

    async fn upload_parquet(&self, _export: &ParquetExport) -> Result<(), UploadError> {
        Err(UploadError::Unsupported {
            destination: "dicomweb",
            what: "parquet upload",
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stow_body_shape() {
        let body = stow_body(&[b"DICM-ONE".to_vec(), b"DICM-TWO".to_vec()]);
        let text = String::from_utf8_lossy(&body);
        assert_eq!(text.matches("Content-Type: application/dicom").count(), 2);
        assert!(text.contains("DICM-ONE"));
        assert!(text.ends_with(&format!("--{BOUNDARY}--\r\n")));
    }

    #[test]
    fn test_unzip_instances_round_trip() {
        let mut bytes = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut bytes));
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            writer.start_file("1.dcm", options).unwrap();
            std::io::Write::write_all(&mut writer, b"DICM-ONE").unwrap();
            writer.start_file("2.dcm", options).unwrap();
            std::io::Write::write_all(&mut writer, b"DICM-TWO").unwrap();
            writer.finish().unwrap();
        }

        let instances = unzip_instances(&bytes).unwrap();
        assert_eq!(instances, vec![b"DICM-ONE".to_vec(), b"DICM-TWO".to_vec()]);
    }
}
