//! Sink implementations and the destination factory.

mod dicomweb;
mod ftps;
mod none;
mod sftp;
mod treapi;
mod xnat;

pub use dicomweb::DicomWebUploader;
pub use ftps::FtpsUploader;
pub use none::NoneUploader;
pub use sftp::SftpUploader;
pub use treapi::TreApiUploader;
pub use xnat::{XnatDestination, XnatOverwrite, XnatSettings, XnatUploader};

use project_config::{DicomDestination, ParquetDestination, ProjectConfig};

use crate::secrets::{secret_prefix, SecretStore};
use crate::{UploadError, Uploader};

/// Build the study uploader for a project's DICOM destination. Secrets are
/// fetched here, freshly per call, so vault rotations apply immediately.
pub async fn make_uploader(
    config: &ProjectConfig,
    secrets: &dyn SecretStore,
    xnat_settings: &XnatSettings,
) -> Result<Box<dyn Uploader>, UploadError> {
    let prefix = secret_prefix(config);
    Ok(match config.destination.dicom {
        DicomDestination::None => Box::new(NoneUploader),
        DicomDestination::Ftps => Box::new(FtpsUploader::from_secrets(&prefix, secrets).await?),
        DicomDestination::Dicomweb => {
            Box::new(DicomWebUploader::from_secrets(&prefix, secrets).await?)
        }
        DicomDestination::Xnat => {
            Box::new(XnatUploader::from_secrets(&prefix, secrets, xnat_settings.clone()).await?)
        }
        DicomDestination::Sftp => Box::new(SftpUploader::from_secrets(&prefix, secrets).await?),
        DicomDestination::TreApi => {
            Box::new(TreApiUploader::from_secrets(&prefix, secrets).await?)
        }
    })
}

/// Build the parquet uploader for a project. The destination enum already
/// excludes the DICOM-only protocols.
pub async fn make_parquet_uploader(
    config: &ProjectConfig,
    secrets: &dyn SecretStore,
) -> Result<Box<dyn Uploader>, UploadError> {
    let prefix = secret_prefix(config);
    Ok(match config.destination.parquet {
        ParquetDestination::None => Box::new(NoneUploader),
        ParquetDestination::Ftps => Box::new(FtpsUploader::from_secrets(&prefix, secrets).await?),
        ParquetDestination::Sftp => Box::new(SftpUploader::from_secrets(&prefix, secrets).await?),
        ParquetDestination::TreApi => {
            Box::new(TreApiUploader::from_secrets(&prefix, secrets).await?)
        }
    })
}

pub(crate) async fn fetch_secret(
    secrets: &dyn SecretStore,
    prefix: &str,
    protocol: &str,
    field: &str,
) -> Result<String, UploadError> {
    let name = format!("{prefix}--{protocol}--{field}");
    secrets
        .fetch(&name)
        .await
        .map_err(|_| UploadError::MissingSecret(name))
}

/// Errors raised by a sink's own protocol stack.
pub(crate) fn sink_error(error: impl std::fmt::Display) -> UploadError {
    UploadError::Rejected(error.to_string())
}
