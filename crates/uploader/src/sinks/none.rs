use exports::ParquetExport;

use crate::{StudyArchive, UploadError, Uploader};

/// Destination `none`: the project keeps its outputs local. Any attempt to
/// deliver is an error, so the ledger is never marked.
pub struct NoneUploader;

#[async_trait::async_trait]
impl Uploader for NoneUploader {
    async fn upload_dicom(&self, _study: &StudyArchive) -> Result<(), UploadError> {
        Err(UploadError::Unsupported {
            destination: "none",
            what: "DICOM upload",
        })
    }

    async fn upload_parquet(&self, _export: &ParquetExport) -> Result<(), UploadError> {
        Err(UploadError::Unsupported {
            destination: "none",
            what: "parquet upload",
        })
    }
}
