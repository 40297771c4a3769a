use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use tracing::warn;

use reelhouse_core::{
    ArtifactKind, JobId, JobSnapshot, JobSummary, SchedulerError, SubmitRequest,
};

use crate::{
    api::{ApiResponse, CancelJobResponse, JobAcceptedResponse, SubmitJobRequest},
    infra::app_state::AppState,
};

#[derive(Debug)]
pub struct JobHttpError {
    status: StatusCode,
    message: String,
}

impl JobHttpError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<SchedulerError> for JobHttpError {
    fn from(error: SchedulerError) -> Self {
        let status = match &error {
            SchedulerError::InvalidKind(_)
            | SchedulerError::InvalidParams(_)
            | SchedulerError::EmptyFileSet => StatusCode::BAD_REQUEST,
            SchedulerError::NotFound(_) => StatusCode::NOT_FOUND,
            SchedulerError::AlreadyTerminal(_)
            | SchedulerError::DuplicateInFlight { .. } => StatusCode::CONFLICT,
            SchedulerError::KindUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SchedulerError::Internal(_) => {
                warn!(error = %error, "scheduler internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for JobHttpError {
    fn into_response(self) -> axum::response::Response {
        let payload = Json(ApiResponse::<()>::error(self.message));
        (self.status, payload).into_response()
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, JobHttpError> {
    raw.parse::<JobId>()
        .map_err(|_| JobHttpError::bad_request(format!("invalid job id: {raw}")))
}

pub async fn submit_job_handler(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, JobHttpError> {
    let kind: ArtifactKind = request.kind.parse()?;
    let mut submit = SubmitRequest::new(request.files, kind)
        .with_priority(request.priority.unwrap_or_default());
    if let Some(params) = request.params {
        submit = submit.with_params(params);
    }

    let receipt = state.scheduler().submit(submit)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(JobAcceptedResponse {
            job_id: receipt.job_id,
            tasks: receipt.tasks,
            coalesced: receipt.coalesced,
        })),
    ))
}

pub async fn list_jobs_handler(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<JobSummary>>> {
    Json(ApiResponse::success(state.scheduler().list()))
}

pub async fn job_status_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<ApiResponse<JobSnapshot>>, JobHttpError> {
    let id = parse_job_id(&job_id)?;
    let snapshot = state.scheduler().status(id)?;
    Ok(Json(ApiResponse::success(snapshot)))
}

pub async fn cancel_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<ApiResponse<CancelJobResponse>>, JobHttpError> {
    let id = parse_job_id(&job_id)?;
    let snapshot = state.scheduler().cancel(id)?;
    Ok(Json(ApiResponse::success(CancelJobResponse::new(
        snapshot.id,
        snapshot.state,
    ))))
}
