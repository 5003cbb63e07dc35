use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use deid::{DeidError, PseudonymSource, TagEngine};
use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use patient_queue::ExportMessage;
use serde::{Deserialize, Serialize};

use crate::node::StudyNode;
use crate::read_project_slug;

/// Hand-off to the uploader dispatch. Seamed so the stage can be exercised
/// without a broker; production wires the export-queue producer in.
#[async_trait::async_trait]
pub trait ExportNotifier: Send + Sync {
    async fn notify(&self, message: &ExportMessage) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl ExportNotifier for patient_queue::Producer {
    async fn notify(&self, message: &ExportMessage) -> anyhow::Result<()> {
        self.publish(std::slice::from_ref(message)).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The whole study was dropped; expected traffic, never retried.
    #[error("study discarded: {0}")]
    Discarded(String),
    /// No instance survived the engine; treated as a discard.
    #[error("no instances survived anonymisation")]
    EmptyStudy,
    /// The study carries no project marker and no fallback is configured.
    #[error("study has no project marker tag")]
    MissingProjectTag,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct AppState {
    pub node: Arc<dyn StudyNode>,
    pub pseudonyms: Arc<dyn PseudonymSource>,
    pub exports: Arc<dyn ExportNotifier>,
    pub configs_dir: PathBuf,
    /// Where finished archives are spooled until the uploader collects them.
    pub spool_dir: PathBuf,
    /// Project to assume for unstamped studies, for standalone use only.
    pub fallback_project: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StableStudy {
    resource_id: String,
}

#[derive(Debug, Serialize)]
pub struct ProcessedStudy {
    pub pseudo_study_uid: String,
    pub instances: usize,
    pub skipped: usize,
    /// Instances dropped individually (e.g. undecodable files).
    pub discarded: usize,
}

/// The anonymiser's HTTP surface: the stable-study callback from the node,
/// archive retrieval for the uploader, and a liveness probe.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/heart-beat", get(|| async { "OK" }))
        .route("/studies", post(stable_study))
        .route("/studies/:pseudo_uid/archive", get(fetch_archive))
        .with_state(state)
}

async fn stable_study(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StableStudy>,
) -> Result<Json<ProcessedStudy>, StatusCode> {
    match process_study(&state, &body.resource_id).await {
        Ok(processed) => Ok(Json(processed)),
        Err(ProcessError::Discarded(reason)) => {
            tracing::warn!(resource_id = %body.resource_id, %reason, "discarding study");
            Err(StatusCode::NO_CONTENT)
        }
        Err(ProcessError::EmptyStudy) => {
            tracing::warn!(resource_id = %body.resource_id, "no instances survived; discarding");
            Err(StatusCode::NO_CONTENT)
        }
        Err(ProcessError::MissingProjectTag) => {
            tracing::error!(resource_id = %body.resource_id, "study has no project marker tag");
            Err(StatusCode::UNPROCESSABLE_ENTITY)
        }
        Err(ProcessError::Other(error)) => {
            tracing::error!(
                resource_id = %body.resource_id,
                error = format!("{error:#}"),
                "failed to anonymise study",
            );
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn fetch_archive(
    State(state): State<Arc<AppState>>,
    Path(pseudo_uid): Path<String>,
) -> Result<Vec<u8>, StatusCode> {
    // The spool is flat and the uid is ledger-issued; refuse anything else.
    if pseudo_uid.contains('/') || pseudo_uid.contains("..") {
        return Err(StatusCode::BAD_REQUEST);
    }
    let path = state.spool_dir.join(format!("{pseudo_uid}.zip"));
    tokio::fs::read(&path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)
}

/// Anonymise one stable study end to end.
pub async fn process_study(
    state: &AppState,
    resource_id: &str,
) -> Result<ProcessedStudy, ProcessError> {
    let instance_ids = state.node.instance_ids(resource_id).await?;
    if instance_ids.is_empty() {
        return Err(ProcessError::EmptyStudy);
    }

    // The project config comes from the marker stamped by the fetcher; the
    // explicit fallback only exists for standalone deployments.
    let first = state.node.instance_file(&instance_ids[0]).await?;
    let (first_dataset, _) = parse_instance(first).await?;
    let slug = match read_project_slug(&first_dataset) {
        Some(slug) => slug,
        None => state
            .fallback_project
            .clone()
            .ok_or(ProcessError::MissingProjectTag)?,
    };

    let config = project_config::load_project_config(&state.configs_dir, &slug)
        .map_err(anyhow::Error::from)?;
    let operations = project_config::load_tag_operations(&config)
        .map_err(anyhow::Error::from)?;
    let engine = TagEngine::new(&config, &operations, state.pseudonyms.as_ref());

    let mut survivors: Vec<(String, Vec<u8>)> = Vec::new();
    let mut skipped = 0usize;
    let mut discarded = 0usize;
    let mut pseudo_study_uid = None;

    for instance_id in &instance_ids {
        let bytes = state.node.instance_file(instance_id).await?;
        // An undecodable file loses that instance, not the study.
        let (dataset, transfer_syntax) = match parse_instance(bytes).await {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::info!(
                    instance_id = %instance_id,
                    error = format!("{error:#}"),
                    "discarding undecodable instance",
                );
                discarded += 1;
                continue;
            }
        };

        let anonymised = match engine.anonymise(dataset.clone()).await {
            Ok(anonymised) => anonymised,
            Err(DeidError::SkipInstance(reason)) => {
                tracing::info!(instance_id = %instance_id, %reason, "skipping instance");
                skipped += 1;
                continue;
            }
            Err(error @ (DeidError::DiscardSeries(_) | DeidError::DiscardStudy(_))) => {
                return Err(ProcessError::Discarded(error.to_string()));
            }
            Err(DeidError::Pseudonym(error)) => return Err(error.into()),
        };

        let introduced = deid::validation_diff(&dataset, &anonymised);
        if !introduced.is_empty() {
            let problems: Vec<String> =
                introduced.iter().map(ToString::to_string).collect();
            tracing::warn!(
                instance_id = %instance_id,
                problems = problems.join("; "),
                "anonymisation introduced validation errors",
            );
        }

        if pseudo_study_uid.is_none() {
            pseudo_study_uid = read_tag(&anonymised, tags::STUDY_INSTANCE_UID);
        }
        let name = read_tag(&anonymised, tags::SOP_INSTANCE_UID)
            .unwrap_or_else(|| format!("{}", survivors.len()));
        let bytes = serialise_instance(anonymised, transfer_syntax).await?;
        survivors.push((format!("{name}.dcm"), bytes));
    }

    if survivors.is_empty() {
        return Err(ProcessError::EmptyStudy);
    }
    let pseudo_study_uid =
        pseudo_study_uid.ok_or_else(|| anyhow::anyhow!("anonymised study carries no UID"))?;

    let archive_path = state.spool_dir.join(format!("{pseudo_study_uid}.zip"));
    let instances = survivors.len();
    write_archive(archive_path, survivors).await?;

    state
        .exports
        .notify(&ExportMessage {
            project_name: slug.clone(),
            pseudo_study_uid: pseudo_study_uid.clone(),
        })
        .await?;

    tracing::info!(
        project = %slug,
        pseudo_study_uid = %pseudo_study_uid,
        instances,
        skipped,
        discarded,
        "study anonymised and spooled",
    );
    Ok(ProcessedStudy {
        pseudo_study_uid,
        instances,
        skipped,
        discarded,
    })
}

/// Parse a DICOM part-10 file off the async path; returns the dataset and its
/// transfer syntax UID.
async fn parse_instance(bytes: Vec<u8>) -> anyhow::Result<(InMemDicomObject, String)> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<(InMemDicomObject, String)> {
        let file = dicom_object::from_reader(bytes.as_slice())?;
        let transfer_syntax = file.meta().transfer_syntax().to_string();
        let dataset: InMemDicomObject = (*file).clone();
        Ok((dataset, transfer_syntax))
    })
    .await?
}

/// Re-serialise an anonymised dataset as a part-10 file with rebuilt meta.
async fn serialise_instance(
    dataset: InMemDicomObject,
    transfer_syntax: String,
) -> anyhow::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(
                read_tag(&dataset, tags::SOP_CLASS_UID).unwrap_or_default(),
            )
            .media_storage_sop_instance_uid(
                read_tag(&dataset, tags::SOP_INSTANCE_UID).unwrap_or_default(),
            )
            .transfer_syntax(&transfer_syntax)
            .build()?;
        let file = dataset.with_exact_meta(meta);
        let mut bytes = Vec::new();
        file.write_all(&mut bytes)?;
        Ok(bytes)
    })
    .await?
}

/// Bundle the surviving instances into a deflate zip.
async fn write_archive(path: PathBuf, entries: Vec<(String, Vec<u8>)>) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(&path)?;
        let mut archive = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for (name, bytes) in entries {
            archive.start_file(name, options)?;
            archive.write_all(&bytes)?;
        }
        archive.finish()?;
        Ok(())
    })
    .await?
}

fn read_tag(dataset: &InMemDicomObject, tag: dicom_core::Tag) -> Option<String> {
    dataset
        .element(tag)
        .ok()
        .and_then(|element| element.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
