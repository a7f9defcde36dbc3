//! # studio-gen
//!
//! Async orchestration for a remote product-photo and avatar-video
//! generation service.
//!
//! Provides a typed HTTP client for submission and status checks, a bounded
//! poller, a streamed-progress consumer, and a workflow state machine that
//! ignores late answers from superseded generations.
//!
//! ## Quick Start
//!
//! ```no_run
//! use studio_gen::{EpisodeOutcome, Orchestrator, OrchestratorConfig, StudioClient, Workflow};
//!
//! # async fn example() -> studio_gen::Result<()> {
//! let client = StudioClient::new("http://localhost:3000");
//!
//! let mut workflow = Workflow::new();
//! workflow.image_upload_started("blob:local-preview")?;
//! workflow.image_uploaded("https://cdn.example.com/uploads/shoe.jpg")?;
//! workflow.select_style(Some("clean-studio".into()))?;
//!
//! let orchestrator = Orchestrator::new(client, workflow.into_shared(), OrchestratorConfig::default());
//!
//! match orchestrator.generate().await? {
//!     EpisodeOutcome::Completed(record) => println!("{} ({})", record.url, record.format),
//!     EpisodeOutcome::Failed(e) => eprintln!("{}", e.user_message()),
//!     other => println!("{:?}", other),
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod poller;
pub mod projector;
pub mod service;
pub mod stream;
pub mod types;
pub mod workflow;

pub use client::StudioClient;
pub use config::{ClientConfig, CompletionMode, FrameMode, OrchestratorConfig, PollConfig, Routes};
pub use error::{GenError, Result, StatusCheckError};
pub use orchestrator::{EpisodeOutcome, Orchestrator};
pub use poller::BoundedPoller;
pub use projector::ResultSink;
pub use service::{ByteStream, GenerationService, StatusSource};
pub use stream::{EventStream, FrameDecoder, StreamConsumer};
pub use types::{
    Completion, EventKind, GenerationRequest, MediaKind, ProgressEvent, ResultRecord, StatusReport,
    SubmitOutcome, TaskHandle,
};
pub use workflow::{
    EpisodeId, GenerationTicket, Phase, Selections, SharedWorkflow, Workflow, WorkflowState,
};
