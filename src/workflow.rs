//! The user-visible generation workflow.
//!
//! [`Workflow`] owns the only mutable state in the crate. Every change goes
//! through a named transition, and every asynchronous completion is tagged
//! with the [`EpisodeId`] it belongs to so late answers from a superseded
//! episode are dropped instead of applied.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{GenError, Result};
use crate::types::{is_meaningful, GenerationRequest, ProgressEvent, ResultRecord, TaskHandle};

/// Style used for the "remove background" follow-up.
pub const REMOVE_BACKGROUND_STYLE: &str = "remove-background";

/// Workflow state shared between the UI and running episodes.
pub type SharedWorkflow = Arc<Mutex<Workflow>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Configuring,
    Generating,
    Complete,
}

/// Identifies one `Generating` episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EpisodeId(u64);

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The user's generation choices. Kept across failed attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Selections {
    pub style_id: Option<String>,
    pub dynamic_prompt: Option<String>,
    pub custom_instructions: String,
}

impl Selections {
    pub fn is_empty(&self) -> bool {
        !is_meaningful(self.style_id.as_deref())
            && !is_meaningful(self.dynamic_prompt.as_deref())
            && self.custom_instructions.trim().is_empty()
    }

    /// Build the request for `image_url`. Custom instructions win over a
    /// dynamic prompt, which wins over a preset style.
    fn to_request(&self, image_url: &str) -> Option<GenerationRequest> {
        let custom = self.custom_instructions.trim();
        if !custom.is_empty() {
            return Some(GenerationRequest::with_prompt(image_url, custom));
        }
        if let Some(prompt) = self.dynamic_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            return Some(GenerationRequest::with_prompt(image_url, prompt.trim()));
        }
        self.style_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|style| GenerationRequest::with_style(image_url, style))
    }
}

/// Everything a runner needs to carry out one episode.
#[derive(Debug, Clone)]
pub struct GenerationTicket {
    pub episode: EpisodeId,
    pub request: GenerationRequest,
    /// Fires when the episode is superseded, cancelled, or the workflow is
    /// reset or dropped.
    pub cancel: CancellationToken,
}

#[derive(Debug)]
struct ActiveEpisode {
    id: EpisodeId,
    handle: Option<TaskHandle>,
    cancel: CancellationToken,
    percent: u8,
    stage_label: String,
}

/// Read-only view of the workflow for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub phase: Phase,
    pub last_error: Option<String>,
    pub image_url: Option<String>,
    pub uploading: bool,
    pub selections: Selections,
    pub episode: Option<EpisodeId>,
    pub task: Option<TaskHandle>,
    pub percent: Option<u8>,
    pub stage_label: Option<String>,
    pub result: Option<ResultRecord>,
}

/// Generation workflow state machine.
///
/// ```text
/// Idle ──upload──▶ Configuring ──start──▶ Generating ──result──▶ Complete
///                      ▲                      │                     │
///                      └──────failure─────────┘◀──remove background─┘
/// any ──start over──▶ Idle
/// ```
#[derive(Debug)]
pub struct Workflow {
    phase: Phase,
    last_error: Option<String>,
    image_url: Option<String>,
    uploading: bool,
    previews: Vec<String>,
    selections: Selections,
    episode: Option<ActiveEpisode>,
    result: Option<ResultRecord>,
    next_episode: u64,
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Workflow {
    fn drop(&mut self) {
        if let Some(episode) = self.episode.take() {
            episode.cancel.cancel();
        }
    }
}

impl Workflow {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            last_error: None,
            image_url: None,
            uploading: false,
            previews: Vec::new(),
            selections: Selections::default(),
            episode: None,
            result: None,
            next_episode: 1,
        }
    }

    pub fn into_shared(self) -> SharedWorkflow {
        Arc::new(Mutex::new(self))
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn result(&self) -> Option<&ResultRecord> {
        self.result.as_ref()
    }

    pub fn selections(&self) -> &Selections {
        &self.selections
    }

    pub fn active_episode(&self) -> Option<EpisodeId> {
        self.episode.as_ref().map(|e| e.id)
    }

    pub fn active_handle(&self) -> Option<&TaskHandle> {
        self.episode.as_ref().and_then(|e| e.handle.as_ref())
    }

    pub fn snapshot(&self) -> WorkflowState {
        WorkflowState {
            phase: self.phase,
            last_error: self.last_error.clone(),
            image_url: self.image_url.clone(),
            uploading: self.uploading,
            selections: self.selections.clone(),
            episode: self.active_episode(),
            task: self.active_handle().cloned(),
            percent: self.episode.as_ref().map(|e| e.percent),
            stage_label: self.episode.as_ref().map(|e| e.stage_label.clone()),
            result: self.result.clone(),
        }
    }

    /// Whether completions for `episode` would still be applied.
    pub fn is_current(&self, episode: EpisodeId) -> bool {
        self.phase == Phase::Generating && self.active_episode() == Some(episode)
    }

    // ── Source image ────────────────────────────────────────────────

    /// An upload began. `preview` is a local reference that will be handed
    /// back for release by [`start_over`](Self::start_over).
    pub fn image_upload_started(&mut self, preview: impl Into<String>) -> Result<()> {
        self.expect_phase("upload an image", &[Phase::Idle, Phase::Configuring])?;
        self.previews.push(preview.into());
        self.image_url = None;
        self.uploading = true;
        Ok(())
    }

    /// The upload finished; the workflow is ready to configure.
    pub fn image_uploaded(&mut self, url: impl Into<String>) -> Result<()> {
        self.expect_phase("upload an image", &[Phase::Idle, Phase::Configuring])?;
        let url = url.into();
        if url.trim().is_empty() {
            return Err(GenError::Validation("Uploaded image has no URL".into()));
        }
        tracing::debug!(%url, "Source image uploaded");
        self.image_url = Some(url);
        self.uploading = false;
        self.last_error = None;
        self.phase = Phase::Configuring;
        Ok(())
    }

    pub fn image_upload_failed(&mut self, message: impl Into<String>) -> Result<()> {
        self.expect_phase("report an upload failure", &[Phase::Idle, Phase::Configuring])?;
        self.uploading = false;
        self.last_error = Some(message.into());
        Ok(())
    }

    // ── Selections ──────────────────────────────────────────────────

    pub fn select_style(&mut self, style_id: Option<String>) -> Result<()> {
        self.expect_phase("change the style", &[Phase::Idle, Phase::Configuring])?;
        self.selections.style_id = style_id;
        Ok(())
    }

    pub fn select_dynamic_prompt(&mut self, prompt: Option<String>) -> Result<()> {
        self.expect_phase("change the prompt", &[Phase::Idle, Phase::Configuring])?;
        self.selections.dynamic_prompt = prompt;
        Ok(())
    }

    pub fn set_custom_instructions(&mut self, text: impl Into<String>) -> Result<()> {
        self.expect_phase("edit instructions", &[Phase::Idle, Phase::Configuring])?;
        self.selections.custom_instructions = text.into();
        Ok(())
    }

    // ── Generation ──────────────────────────────────────────────────

    /// `Configuring → Generating`.
    ///
    /// Fails locally, without leaving `Configuring`, when no style, prompt,
    /// or instructions are chosen or the image has not finished uploading.
    pub fn start_generation(&mut self) -> Result<GenerationTicket> {
        self.expect_phase("start generating", &[Phase::Configuring])?;

        let image_url = match (&self.image_url, self.uploading) {
            (Some(url), false) => url.clone(),
            _ => {
                return Err(GenError::Validation(
                    "Wait for the image upload to finish".into(),
                ))
            }
        };
        let request = self.selections.to_request(&image_url).ok_or_else(|| {
            GenError::Validation(
                "Choose a style, a prompt, or enter custom instructions".into(),
            )
        })?;
        request.validate()?;

        self.result = None;
        Ok(self.begin_episode(request))
    }

    /// `Complete → Generating` for the background-removal follow-up on the
    /// current result.
    pub fn remove_background(&mut self) -> Result<GenerationTicket> {
        self.expect_phase("remove the background", &[Phase::Complete])?;
        let url = self
            .result
            .as_ref()
            .map(|r| r.url.clone())
            .ok_or_else(|| GenError::Validation("There is no result to edit".into()))?;
        let request = GenerationRequest::with_style(url, REMOVE_BACKGROUND_STYLE);
        Ok(self.begin_episode(request))
    }

    fn begin_episode(&mut self, request: GenerationRequest) -> GenerationTicket {
        if let Some(previous) = self.episode.take() {
            previous.cancel.cancel();
        }
        let id = EpisodeId(self.next_episode);
        self.next_episode += 1;
        let cancel = CancellationToken::new();

        self.episode = Some(ActiveEpisode {
            id,
            handle: None,
            cancel: cancel.clone(),
            percent: 0,
            stage_label: String::new(),
        });
        self.last_error = None;
        self.phase = Phase::Generating;
        tracing::info!(episode = %id, image_url = %request.image_url, "Generation started");

        GenerationTicket {
            episode: id,
            request,
            cancel,
        }
    }

    /// Record the task handle issued for `episode`.
    pub fn task_submitted(&mut self, episode: EpisodeId, handle: TaskHandle) -> bool {
        if !self.accepts(episode, "task handle") {
            return false;
        }
        if let Some(active) = self.episode.as_mut() {
            tracing::debug!(episode = %episode, task_id = %handle.id, "Task attached");
            active.handle = Some(handle);
        }
        true
    }

    /// Record streamed progress. The displayed percentage never decreases.
    pub fn progress(&mut self, episode: EpisodeId, event: &ProgressEvent) -> bool {
        if !self.accepts(episode, "progress") {
            return false;
        }
        if let Some(active) = self.episode.as_mut() {
            if event.percent >= active.percent {
                active.percent = event.percent.min(100);
            }
            if !event.stage_label.is_empty() {
                active.stage_label = event.stage_label.clone();
            }
        }
        true
    }

    /// `Generating → Complete`.
    pub fn generation_succeeded(&mut self, episode: EpisodeId, record: ResultRecord) -> bool {
        if !self.accepts(episode, "result") {
            return false;
        }
        tracing::info!(episode = %episode, url = %record.url, "Generation complete");
        self.episode = None;
        self.result = Some(record);
        self.last_error = None;
        self.phase = Phase::Complete;
        true
    }

    /// `Generating → Configuring`, keeping the user's selections.
    pub fn generation_failed(&mut self, episode: EpisodeId, error: &GenError) -> bool {
        if !self.accepts(episode, "failure") {
            return false;
        }
        tracing::warn!(episode = %episode, error = %error, "Generation failed");
        self.episode = None;
        self.result = None;
        self.last_error = Some(error.user_message());
        self.phase = Phase::Configuring;
        true
    }

    /// Abandon the running episode and return to `Configuring` without an
    /// error.
    pub fn cancel_generation(&mut self) -> Result<()> {
        self.expect_phase("cancel", &[Phase::Generating])?;
        self.abandon_episode();
        Ok(())
    }

    /// `episode` ended because its cancellation token fired. Returns to
    /// `Configuring` without an error if it is still the running episode.
    pub fn generation_cancelled(&mut self, episode: EpisodeId) -> bool {
        if !self.is_current(episode) {
            return false;
        }
        self.abandon_episode();
        true
    }

    fn abandon_episode(&mut self) {
        if let Some(episode) = self.episode.take() {
            tracing::info!(episode = %episode.id, "Generation cancelled");
            episode.cancel.cancel();
        }
        self.result = None;
        self.phase = Phase::Configuring;
    }

    /// Reset to `Idle` from any phase.
    ///
    /// Cancels the running episode, forgets the handle and result, and
    /// returns the local preview references the caller should release.
    pub fn start_over(&mut self) -> Vec<String> {
        if let Some(episode) = self.episode.take() {
            episode.cancel.cancel();
        }
        let previews = std::mem::take(&mut self.previews);
        let next_episode = self.next_episode;
        *self = Self::new();
        self.next_episode = next_episode;
        tracing::info!(released = previews.len(), "Workflow reset");
        previews
    }

    fn accepts(&self, episode: EpisodeId, what: &str) -> bool {
        let current = self.is_current(episode);
        if !current {
            tracing::warn!(
                episode = %episode,
                active = ?self.active_episode(),
                phase = ?self.phase,
                "Ignoring stale {}",
                what,
            );
        }
        current
    }

    fn expect_phase(&self, action: &str, allowed: &[Phase]) -> Result<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(GenError::Validation(format!(
                "Cannot {} while {:?}",
                action, self.phase
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projector::record_from_url;

    fn configured() -> Workflow {
        let mut wf = Workflow::new();
        wf.image_upload_started("blob:preview-1").unwrap();
        wf.image_uploaded("https://x/img.png").unwrap();
        wf
    }

    #[test]
    fn test_upload_moves_to_configuring() {
        let mut wf = Workflow::new();
        assert_eq!(wf.phase(), Phase::Idle);
        wf.image_uploaded("https://x/img.png").unwrap();
        assert_eq!(wf.phase(), Phase::Configuring);
    }

    #[test]
    fn test_start_requires_a_selection() {
        let mut wf = configured();
        wf.set_custom_instructions("   ").unwrap();

        let err = wf.start_generation().unwrap_err();
        assert!(matches!(err, GenError::Validation(_)));
        assert_eq!(wf.phase(), Phase::Configuring);
        assert!(wf.active_episode().is_none());
    }

    #[test]
    fn test_start_requires_finished_upload() {
        let mut wf = configured();
        wf.select_style(Some("clean-studio".into())).unwrap();
        wf.image_upload_started("blob:preview-2").unwrap();

        let err = wf.start_generation().unwrap_err();
        assert!(err.to_string().contains("upload"));
        assert_eq!(wf.phase(), Phase::Configuring);
    }

    #[test]
    fn test_request_precedence() {
        let mut wf = configured();
        wf.select_style(Some("clean-studio".into())).unwrap();
        wf.select_dynamic_prompt(Some("on marble".into())).unwrap();
        let ticket = wf.start_generation().unwrap();
        assert_eq!(ticket.request.custom_prompt.as_deref(), Some("on marble"));
        assert!(ticket.request.style_id.is_none());

        let mut wf = configured();
        wf.select_style(Some("clean-studio".into())).unwrap();
        let ticket = wf.start_generation().unwrap();
        assert_eq!(ticket.request.style_id.as_deref(), Some("clean-studio"));

        let mut wf = configured();
        wf.select_dynamic_prompt(Some("on marble".into())).unwrap();
        wf.set_custom_instructions(" soft shadows ").unwrap();
        let ticket = wf.start_generation().unwrap();
        assert_eq!(ticket.request.custom_prompt.as_deref(), Some("soft shadows"));
    }

    #[test]
    fn test_success_path() {
        let mut wf = configured();
        wf.select_style(Some("clean-studio".into())).unwrap();
        let ticket = wf.start_generation().unwrap();
        assert_eq!(wf.phase(), Phase::Generating);

        assert!(wf.task_submitted(ticket.episode, TaskHandle::new("t1")));
        assert_eq!(wf.active_handle().unwrap().id, "t1");

        let record = record_from_url("https://x/out.png");
        assert!(wf.generation_succeeded(ticket.episode, record.clone()));
        assert_eq!(wf.phase(), Phase::Complete);
        assert_eq!(wf.result(), Some(&record));
        assert!(wf.active_handle().is_none());
    }

    #[test]
    fn test_failure_keeps_selections() {
        let mut wf = configured();
        wf.select_style(Some("clean-studio".into())).unwrap();
        wf.set_custom_instructions("warm light").unwrap();
        let ticket = wf.start_generation().unwrap();

        assert!(wf.generation_failed(ticket.episode, &GenError::RemoteFailure("nsfw content".into())));
        assert_eq!(wf.phase(), Phase::Configuring);
        assert_eq!(wf.last_error(), Some("nsfw content"));
        assert_eq!(wf.selections().style_id.as_deref(), Some("clean-studio"));
        assert_eq!(wf.selections().custom_instructions, "warm light");

        // Retry clears the error.
        let retry = wf.start_generation().unwrap();
        assert!(retry.episode > ticket.episode);
        assert!(wf.last_error().is_none());
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let mut wf = configured();
        wf.select_style(Some("clean-studio".into())).unwrap();
        let first = wf.start_generation().unwrap();
        wf.cancel_generation().unwrap();
        assert!(first.cancel.is_cancelled());

        let second = wf.start_generation().unwrap();
        let before = wf.snapshot();

        assert!(!wf.task_submitted(first.episode, TaskHandle::new("old")));
        assert!(!wf.progress(first.episode, &ProgressEvent::progress(80, "old")));
        assert!(!wf.generation_succeeded(first.episode, record_from_url("https://x/old.png")));
        assert!(!wf.generation_failed(first.episode, &GenError::Stream("late".into())));

        assert_eq!(wf.snapshot(), before);
        assert_eq!(wf.phase(), Phase::Generating);
        assert_eq!(wf.active_episode(), Some(second.episode));
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut wf = configured();
        wf.select_style(Some("clean-studio".into())).unwrap();
        let ticket = wf.start_generation().unwrap();

        wf.progress(ticket.episode, &ProgressEvent::progress(40, "enhancing"));
        wf.progress(ticket.episode, &ProgressEvent::progress(25, "upscaling"));
        let state = wf.snapshot();
        assert_eq!(state.percent, Some(40));
        assert_eq!(state.stage_label.as_deref(), Some("upscaling"));
    }

    #[test]
    fn test_start_over_releases_everything() {
        let mut wf = configured();
        wf.image_upload_started("blob:preview-2").unwrap();
        wf.image_uploaded("https://x/img2.png").unwrap();
        wf.select_style(Some("clean-studio".into())).unwrap();
        let ticket = wf.start_generation().unwrap();
        wf.task_submitted(ticket.episode, TaskHandle::new("t1"));

        let released = wf.start_over();

        assert_eq!(released, vec!["blob:preview-1", "blob:preview-2"]);
        assert!(ticket.cancel.is_cancelled());
        assert_eq!(wf.phase(), Phase::Idle);
        assert!(wf.active_handle().is_none());
        assert_eq!(wf.selections(), &Selections::default());
        assert!(!wf.generation_succeeded(ticket.episode, record_from_url("https://x/late.png")));
        assert_eq!(wf.phase(), Phase::Idle);
    }

    #[test]
    fn test_episode_ids_not_reused_after_reset() {
        let mut wf = configured();
        wf.select_style(Some("clean-studio".into())).unwrap();
        let first = wf.start_generation().unwrap();
        wf.start_over();

        wf.image_uploaded("https://x/img.png").unwrap();
        wf.select_style(Some("clean-studio".into())).unwrap();
        let second = wf.start_generation().unwrap();
        assert_ne!(first.episode, second.episode);
    }

    #[test]
    fn test_remove_background_follow_up() {
        let mut wf = configured();
        wf.select_style(Some("clean-studio".into())).unwrap();
        let ticket = wf.start_generation().unwrap();
        wf.generation_succeeded(ticket.episode, record_from_url("https://x/out.png"));

        let follow_up = wf.remove_background().unwrap();
        assert_eq!(wf.phase(), Phase::Generating);
        assert_eq!(follow_up.request.image_url, "https://x/out.png");
        assert_eq!(follow_up.request.style_id.as_deref(), Some(REMOVE_BACKGROUND_STYLE));
        assert_ne!(follow_up.episode, ticket.episode);
    }

    #[test]
    fn test_remove_background_requires_complete() {
        let mut wf = configured();
        assert!(matches!(wf.remove_background(), Err(GenError::Validation(_))));
    }

    #[test]
    fn test_selections_locked_while_generating() {
        let mut wf = configured();
        wf.select_style(Some("clean-studio".into())).unwrap();
        wf.start_generation().unwrap();
        assert!(wf.select_style(None).is_err());
        assert!(wf.image_uploaded("https://x/other.png").is_err());
    }

    #[test]
    fn test_drop_cancels_episode() {
        let mut wf = configured();
        wf.select_style(Some("clean-studio".into())).unwrap();
        let ticket = wf.start_generation().unwrap();
        drop(wf);
        assert!(ticket.cancel.is_cancelled());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let wf = configured();
        let json = serde_json::to_value(wf.snapshot()).unwrap();
        assert_eq!(json["phase"], "configuring");
        assert_eq!(json["imageUrl"], "https://x/img.png");
        assert!(json.get("lastError").is_some());
    }

    #[test]
    fn test_token_cancel_returns_to_configuring() {
        let mut wf = configured();
        wf.select_style(Some("clean-studio".into())).unwrap();
        let first = wf.start_generation().unwrap();
        first.cancel.cancel();

        assert!(wf.generation_cancelled(first.episode));
        assert_eq!(wf.phase(), Phase::Configuring);
        assert!(wf.last_error().is_none());
        assert!(wf.active_episode().is_none());

        let second = wf.start_generation().unwrap();
        assert!(!wf.generation_cancelled(first.episode));
        assert_eq!(wf.active_episode(), Some(second.episode));
        assert_eq!(wf.phase(), Phase::Generating);
    }

    #[test]
    fn test_upload_failure_rejected_while_generating() {
        let mut wf = configured();
        wf.select_style(Some("clean-studio".into())).unwrap();
        wf.start_generation().unwrap();

        let err = wf.image_upload_failed("network down").unwrap_err();
        assert!(matches!(err, GenError::Validation(_)));
        assert_eq!(wf.phase(), Phase::Generating);
        assert!(wf.last_error().is_none());

        let mut idle = Workflow::new();
        idle.image_upload_started("blob:preview-9").unwrap();
        idle.image_upload_failed("network down").unwrap();
        assert_eq!(idle.last_error(), Some("network down"));
    }
}
