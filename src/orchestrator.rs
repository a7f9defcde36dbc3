//! Runs generation episodes end to end.
//!
//! An episode starts from a [`GenerationTicket`] issued by the workflow,
//! waits for the result by polling or by streaming, and applies the outcome
//! back to the workflow. The outcome is applied only if the episode is still
//! the active one.

use std::sync::{Arc, MutexGuard};

use tokio::task::JoinHandle;

use crate::config::{CompletionMode, OrchestratorConfig};
use crate::error::{GenError, Result};
use crate::poller::BoundedPoller;
use crate::projector::ResultSink;
use crate::service::GenerationService;
use crate::stream::StreamConsumer;
use crate::types::{Completion, EventKind, ResultRecord, SubmitOutcome, TaskHandle};
use crate::workflow::{EpisodeId, GenerationTicket, SharedWorkflow, Workflow};

/// How a single episode ended, from the caller's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum EpisodeOutcome {
    /// The result was applied and the workflow is `Complete`.
    Completed(ResultRecord),
    /// The failure was applied and the workflow is back in `Configuring`.
    Failed(GenError),
    /// The episode was cancelled before it finished.
    Cancelled,
    /// The workflow moved on; whatever the episode produced was dropped.
    Superseded,
}

/// Drives episodes against a [`GenerationService`].
pub struct Orchestrator<S> {
    service: Arc<S>,
    poller: BoundedPoller<Arc<S>>,
    streams: StreamConsumer<Arc<S>>,
    workflow: SharedWorkflow,
    config: OrchestratorConfig,
    sink: Option<Arc<dyn ResultSink>>,
}

impl<S> std::fmt::Debug for Orchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl<S: GenerationService> Orchestrator<S> {
    pub fn new(service: S, workflow: SharedWorkflow, config: OrchestratorConfig) -> Self {
        let service = Arc::new(service);
        Self {
            poller: BoundedPoller::new(Arc::clone(&service), config.poll.clone()),
            streams: StreamConsumer::new(Arc::clone(&service), config.frame_mode),
            service,
            workflow,
            config,
            sink: None,
        }
    }

    /// Receive every applied result, e.g. to download or persist it.
    pub fn with_sink(mut self, sink: impl ResultSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn workflow(&self) -> &SharedWorkflow {
        &self.workflow
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Start a generation from the current selections and run it.
    ///
    /// Fails only when the workflow refuses to start, in which case no
    /// request is sent.
    pub async fn generate(&self) -> Result<EpisodeOutcome> {
        let ticket = self.lock().start_generation()?;
        Ok(self.run(ticket).await)
    }

    /// Run the background-removal follow-up on the current result.
    pub async fn remove_background(&self) -> Result<EpisodeOutcome> {
        let ticket = self.lock().remove_background()?;
        Ok(self.run(ticket).await)
    }

    /// Run one episode to its end and apply the outcome.
    pub async fn run(&self, ticket: GenerationTicket) -> EpisodeOutcome {
        let episode = ticket.episode;
        tracing::info!(
            episode = %episode,
            mode = ?self.config.mode,
            media = ?self.config.media(),
            "Running generation episode",
        );

        let waited = match self.config.mode {
            CompletionMode::Poll => self.await_by_polling(&ticket).await,
            CompletionMode::Stream => self.await_by_streaming(&ticket).await,
        };

        match waited {
            Ok(Completion::Ready(record)) => self.apply_success(episode, record),
            Ok(Completion::Cancelled) => {
                if self.lock().generation_cancelled(episode) {
                    EpisodeOutcome::Cancelled
                } else {
                    EpisodeOutcome::Superseded
                }
            }
            Err(e) => {
                if self.lock().generation_failed(episode, &e) {
                    EpisodeOutcome::Failed(e)
                } else {
                    EpisodeOutcome::Superseded
                }
            }
        }
    }

    async fn await_by_polling(&self, ticket: &GenerationTicket) -> Result<Completion> {
        let submitted = tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => return Ok(Completion::Cancelled),
            outcome = self.service.submit(&ticket.request, self.config.media()) => outcome?,
        };

        match submitted {
            SubmitOutcome::Immediate(record) => Ok(Completion::Ready(record)),
            SubmitOutcome::Task(handle) => {
                if !self.lock().task_submitted(ticket.episode, handle.clone()) {
                    return Ok(Completion::Cancelled);
                }
                self.poller.poll(&handle, &ticket.cancel).await
            }
        }
    }

    async fn await_by_streaming(&self, ticket: &GenerationTicket) -> Result<Completion> {
        let mut events = self
            .streams
            .open(&ticket.request, ticket.cancel.clone())
            .await?;

        while let Some(item) = events.next_event().await {
            let event = item?;
            if !self.lock().progress(ticket.episode, &event) {
                return Ok(Completion::Cancelled);
            }
            match event.kind {
                EventKind::Progress => {}
                EventKind::Complete => {
                    return match event.payload {
                        Some(record) => Ok(Completion::Ready(record)),
                        None => Err(GenError::Stream(
                            "complete event carried no result".into(),
                        )),
                    };
                }
                EventKind::Error => {
                    let reason = event
                        .error_text
                        .filter(|t| !t.trim().is_empty())
                        .or_else(|| Some(event.message).filter(|m| !m.trim().is_empty()))
                        .unwrap_or_else(|| "The generation service reported an error".into());
                    return Err(GenError::RemoteFailure(reason));
                }
            }
        }

        // Only cancellation ends the sequence without an item.
        Ok(Completion::Cancelled)
    }

    fn apply_success(&self, episode: EpisodeId, record: ResultRecord) -> EpisodeOutcome {
        let handle: Option<TaskHandle> = {
            let mut workflow = self.lock();
            let handle = workflow.active_handle().cloned();
            if !workflow.generation_succeeded(episode, record.clone()) {
                return EpisodeOutcome::Superseded;
            }
            handle
        };
        if let Some(sink) = &self.sink {
            sink.deliver(&record, handle.as_ref());
        }
        EpisodeOutcome::Completed(record)
    }

    fn lock(&self) -> MutexGuard<'_, Workflow> {
        self.workflow
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S: GenerationService + 'static> Orchestrator<S> {
    /// Run `ticket` on the Tokio runtime.
    pub fn spawn(self: &Arc<Self>, ticket: GenerationTicket) -> JoinHandle<EpisodeOutcome> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.run(ticket).await })
    }
}
