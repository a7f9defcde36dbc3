use std::time::Duration;

use crate::types::MediaKind;

/// Timing policy for [`BoundedPoller`](crate::poller::BoundedPoller).
///
/// These numbers track the generation service's processing SLAs, so they
/// live here rather than inside the polling loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Wait before the first status check.
    pub initial_delay: Duration,
    /// Wait between consecutive status checks.
    pub interval: Duration,
    /// Maximum number of status checks before giving up.
    pub max_attempts: u32,
    /// Which status field signals readiness.
    pub media: MediaKind,
}

impl PollConfig {
    /// Image preview polling: roughly a five minute ceiling.
    pub fn image_preview() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            interval: Duration::from_secs(10),
            max_attempts: 30,
            media: MediaKind::Image,
        }
    }

    /// Avatar video polling: same cadence, longer ceiling.
    pub fn video() -> Self {
        Self {
            max_attempts: 40,
            media: MediaKind::Video,
            ..Self::image_preview()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Worst-case time spent before a timeout is reported.
    pub fn ceiling(&self) -> Duration {
        self.initial_delay + self.interval * self.max_attempts.saturating_sub(1)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::image_preview()
    }
}

/// Request paths on the generation service, relative to the endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Routes {
    pub image_submit: String,
    pub video_submit: String,
    pub image_status: String,
    pub video_status: String,
    pub stream: String,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            image_submit: "/api/generate-image".to_string(),
            video_submit: "/api/generate-video".to_string(),
            image_status: "/api/image-status".to_string(),
            video_status: "/api/video-status".to_string(),
            stream: "/api/generate-image/stream".to_string(),
        }
    }
}

impl Routes {
    pub fn submit(&self, media: MediaKind) -> &str {
        match media {
            MediaKind::Image => &self.image_submit,
            MediaKind::Video => &self.video_submit,
        }
    }

    pub fn status(&self, media: MediaKind) -> &str {
        match media {
            MediaKind::Image => &self.image_status,
            MediaKind::Video => &self.video_status,
        }
    }
}

/// Connection settings for [`StudioClient`](crate::client::StudioClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Service base URL (e.g., "https://studio.example.com").
    pub endpoint: String,
    pub routes: Routes,
    /// Timeout for submit and status calls. Streams have no overall timeout.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:3000".to_string(),
            routes: Routes::default(),
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_routes(mut self, routes: Routes) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// How an episode discovers completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Submit, then poll the status endpoint.
    #[default]
    Poll,
    /// Open a progress stream that carries the result.
    Stream,
}

/// How the stream decoder treats `data:` lines whose JSON does not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameMode {
    /// Skip the frame and log it.
    #[default]
    Lenient,
    /// Fail the stream.
    Strict,
}

/// Settings for [`Orchestrator`](crate::orchestrator::Orchestrator).
///
/// Use [`OrchestratorConfig::builder()`] or [`OrchestratorConfig::default()`]
/// (image polling with the preview preset).
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub mode: CompletionMode,
    pub poll: PollConfig,
    pub frame_mode: FrameMode,
}

impl OrchestratorConfig {
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }

    pub fn media(&self) -> MediaKind {
        self.poll.media
    }
}

/// Builder for [`OrchestratorConfig`].
#[derive(Default)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    /// Choose between polling and streaming.
    pub fn with_mode(mut self, mode: CompletionMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the polling policy (also selects the media kind).
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.config.poll = poll;
        self
    }

    pub fn with_frame_mode(mut self, mode: FrameMode) -> Self {
        self.config.frame_mode = mode;
        self
    }

    pub fn build(self) -> OrchestratorConfig {
        self.config
    }
}
