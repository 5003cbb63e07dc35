//! The final mile: destination-polymorphic delivery of de-identified studies
//! and parquet extracts, with the ledger updated only after a sink
//! acknowledges.

mod dispatch;
mod secrets;
pub mod service;
mod sinks;

pub use dispatch::{AnonymiserArchives, ArchiveSource, Dispatch, DispatchConfig, ExportLedger};
pub use secrets::{EnvSecretStore, SecretStore};
pub use sinks::{make_uploader, XnatDestination, XnatOverwrite, XnatSettings};

use exports::ParquetExport;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("image already exported")]
    AlreadyExported,
    #[error("destination '{destination}' does not support {what}")]
    Unsupported {
        destination: &'static str,
        what: &'static str,
    },
    #[error("missing secret '{0}'")]
    MissingSecret(String),
    #[error("sink rejected the upload: {0}")]
    Rejected(String),
    #[error(transparent)]
    Ledger(#[from] ledger::LedgerError),
    #[error(transparent)]
    Export(#[from] exports::ExportError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A study ready for delivery: the spooled archive plus the identifiers a
/// sink may need to address it.
#[derive(Debug, Clone)]
pub struct StudyArchive {
    pub project_slug: String,
    pub pseudo_study_uid: String,
    /// Pseudonymous patient id, read from the archive's first instance.
    /// Some sinks (XNAT) address experiments by subject.
    pub pseudo_patient_id: Option<String>,
    pub zip_bytes: Vec<u8>,
}

impl StudyArchive {
    /// Filename of the archive on any filesystem-like sink.
    pub fn file_name(&self) -> String {
        format!("{}.zip", self.pseudo_study_uid)
    }
}

/// Delivery capability of one destination. Implementations deliver and
/// nothing else; the double-export guard and the ledger write live in
/// [`Dispatch`], which only records delivery after `upload_dicom` returns.
#[async_trait::async_trait]
pub trait Uploader: Send + Sync {
    /// Deliver a study archive to the sink.
    async fn upload_dicom(&self, study: &StudyArchive) -> Result<(), UploadError>;

    /// Mirror the extract's parquet tree onto the sink under
    /// `<project-slug>/<extract-time-slug>/parquet/`.
    async fn upload_parquet(&self, export: &ParquetExport) -> Result<(), UploadError>;
}
