use serde::{Deserialize, Serialize};

use crate::error::{GenError, Result};

/// Which kind of asset a generation produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Status field that carries the finished asset URL.
    pub fn result_field(&self) -> &'static str {
        match self {
            MediaKind::Image => "generated_photo_url",
            MediaKind::Video => "generated_video_url",
        }
    }
}

/// A request to generate a new asset from a source image.
///
/// Exactly one of `style_id` / `custom_prompt` must be set to a non-blank
/// value; [`GenerationRequest::validate`] enforces this before submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub image_url: String,
    #[serde(rename = "style", skip_serializing_if = "Option::is_none")]
    pub style_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_prompt: Option<String>,
}

impl GenerationRequest {
    /// Request using a preset style.
    pub fn with_style(image_url: impl Into<String>, style_id: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            style_id: Some(style_id.into()),
            custom_prompt: None,
        }
    }

    /// Request using free-form instructions.
    pub fn with_prompt(image_url: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            style_id: None,
            custom_prompt: Some(prompt.into()),
        }
    }

    /// Check the request before it leaves the process.
    pub fn validate(&self) -> Result<()> {
        if self.image_url.trim().is_empty() {
            return Err(GenError::Validation("A source image is required".into()));
        }
        let has_style = is_meaningful(self.style_id.as_deref());
        let has_prompt = is_meaningful(self.custom_prompt.as_deref());
        match (has_style, has_prompt) {
            (true, false) | (false, true) => Ok(()),
            (false, false) => Err(GenError::Validation(
                "Choose a style or enter custom instructions".into(),
            )),
            (true, true) => Err(GenError::Validation(
                "A request may use a style or custom instructions, not both".into(),
            )),
        }
    }
}

pub(crate) fn is_meaningful(value: Option<&str>) -> bool {
    value.map(|v| !v.trim().is_empty()).unwrap_or(false)
}

/// Service-issued handle correlating a submitted job with its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: String,
    pub project_id: Option<i64>,
}

impl TaskHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project_id: None,
        }
    }

    pub fn with_project(mut self, project_id: i64) -> Self {
        self.project_id = Some(project_id);
        self
    }
}

/// A finished asset, normalized for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub url: String,
    pub filename: String,
    pub size: String,
    pub format: String,
}

/// What a submission produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The service finished synchronously.
    Immediate(ResultRecord),
    /// The service queued a job that must be awaited.
    Task(TaskHandle),
}

/// One observation of the status endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReport {
    Ready(ResultRecord),
    Failed(String),
    Pending,
}

/// How waiting for a result ended, when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Ready(ResultRecord),
    /// The caller cancelled. Not an error.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Progress,
    Complete,
    Error,
}

/// A decoded progress frame from the generation stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub kind: EventKind,
    pub percent: u8,
    pub stage_label: String,
    pub message: String,
    pub payload: Option<ResultRecord>,
    pub error_text: Option<String>,
}

impl ProgressEvent {
    pub fn progress(percent: u8, stage_label: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Progress,
            percent: percent.min(100),
            stage_label: stage_label.into(),
            message: String::new(),
            payload: None,
            error_text: None,
        }
    }

    /// `Complete` and `Error` end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Complete | EventKind::Error)
    }
}
