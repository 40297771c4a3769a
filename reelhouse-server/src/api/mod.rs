//! Wire types of the job control API.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};

use reelhouse_core::{
    ArtifactKind, ArtifactParams, FileRef, JobId, JobState, KindCapability, Priority,
    Tool, ToolStatus,
};

/// Envelope shared by every JSON response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(error),
        }
    }
}

/// Body of `POST /api/jobs`. The kind stays a string so unknown kinds are
/// reported as a validation error rather than a body rejection.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitJobRequest {
    pub files: Vec<String>,
    pub kind: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub params: Option<ArtifactParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAcceptedResponse {
    pub job_id: JobId,
    pub tasks: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coalesced: Vec<FileRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelJobResponse {
    pub job_id: JobId,
    pub state: String,
}

impl CancelJobResponse {
    pub fn new(job_id: JobId, state: JobState) -> Self {
        Self {
            job_id,
            state: state.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilitiesResponse {
    pub kinds: Vec<KindCapability>,
    pub enabled: Vec<ArtifactKind>,
    pub tools: BTreeMap<Tool, ToolStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcribe_model: Option<PathBuf>,
}
