//! HTTP surface of the export service: parquet export requests and liveness.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::Dispatch;

#[derive(Debug, Deserialize)]
struct ExportPatientData {
    project_name: String,
    extract_datetime: DateTime<Utc>,
}

pub fn router(dispatch: Arc<Dispatch>) -> Router {
    Router::new()
        .route("/heart-beat", get(|| async { "OK" }))
        .route("/export-patient-data", post(export_patient_data))
        .with_state(dispatch)
}

async fn export_patient_data(
    State(dispatch): State<Arc<Dispatch>>,
    Json(body): Json<ExportPatientData>,
) -> StatusCode {
    match dispatch
        .handle_parquet_export(&body.project_name, &body.extract_datetime)
        .await
    {
        Ok(()) => StatusCode::OK,
        Err(error) => {
            tracing::error!(
                project = %body.project_name,
                error = format!("{error:#}"),
                "parquet export failed",
            );
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
