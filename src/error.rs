use thiserror::Error;

/// Errors that can cross the orchestration boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenError {
    /// A local precondition was not met. Never reaches the network.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The service rejected the submission, or it could not be delivered.
    #[error("{}", submission_text(*status, message))]
    Submission {
        status: Option<u16>,
        message: String,
    },

    /// The status endpoint never reported a terminal state.
    #[error("Generation is still processing after {attempts} checks")]
    Timeout { attempts: u32 },

    /// The service explicitly reported that the job failed.
    #[error("Generation failed: {0}")]
    RemoteFailure(String),

    /// Transport failure or protocol violation on the progress stream.
    #[error("Stream error: {0}")]
    Stream(String),
}

fn submission_text(status: Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("Submission rejected with HTTP {}: {}", code, message),
        None => format!("Submission failed: {}", message),
    }
}

impl GenError {
    /// Message suitable for showing to the user as `last_error`.
    ///
    /// Remote failures carry the service's reason verbatim; timeouts get a
    /// "try again later" message so they read differently from rejections.
    pub fn user_message(&self) -> String {
        match self {
            GenError::RemoteFailure(reason) => reason.clone(),
            GenError::Timeout { .. } => {
                "Generation is taking longer than expected. It may still finish; please try again later."
                    .to_string()
            }
            GenError::Validation(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the workflow can return to `Configuring` and retry.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, GenError::Validation(_))
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, GenError>;

/// A single status check that could not be completed.
///
/// The poller counts these as pending attempts; they never reach the
/// workflow.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatusCheckError {
    #[error("Status endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("{0}")]
    Network(String),

    #[error("Unreadable status response: {0}")]
    InvalidResponse(String),
}
