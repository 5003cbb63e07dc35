//! The imaging fetcher: drives the raw DICOM node through local probes,
//! archive queries and C-MOVE transfers, stamps fetched studies with their
//! project marker, and hands them onward to the anonymisation node.

mod fetcher;
mod node;

pub use fetcher::{process_message, FetchError, FetchSource, FetcherConfig};
pub use node::{ArchiveNode, DicomNode, DicomNodeConfig, JobState, StudyQuery};
