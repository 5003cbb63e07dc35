//! The anonymisation stage.
//!
//! The anonymisation node calls back here once a routed study goes stable.
//! The stage reads the study's instances, resolves the project config from
//! the stamped marker tag, applies the tag engine per instance, bundles the
//! survivors into a deflate zip addressed by the pseudonymous study UID, and
//! notifies the uploader dispatch through the export queue.

mod node;
mod private;
mod pseudonyms;
mod service;

pub use node::{AnonNode, StudyNode};
pub use private::read_project_slug;
pub use pseudonyms::Pseudonyms;
pub use service::{process_study, router, AppState, ExportNotifier, ProcessError, ProcessedStudy};
