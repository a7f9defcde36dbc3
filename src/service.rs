use bytes::Bytes;
use futures::stream::BoxStream;
use std::future::Future;
use std::sync::Arc;

use crate::error::{Result, StatusCheckError};
use crate::types::{GenerationRequest, MediaKind, StatusReport, SubmitOutcome, TaskHandle};

/// Raw response body of a progress stream, chunked however the transport
/// delivered it.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Answers "is this task done yet?" for the poller.
pub trait StatusSource: Send + Sync {
    /// Perform one status check. Implementations must not retry internally.
    fn fetch_status(
        &self,
        handle: &TaskHandle,
        media: MediaKind,
    ) -> impl Future<Output = std::result::Result<StatusReport, StatusCheckError>> + Send;
}

/// The remote generation service as seen by the orchestrator.
///
/// [`StudioClient`](crate::client::StudioClient) is the HTTP implementation;
/// tests substitute scripted fakes.
pub trait GenerationService: StatusSource {
    /// Submit a request. Exactly one outbound call; never retried here.
    fn submit(
        &self,
        request: &GenerationRequest,
        media: MediaKind,
    ) -> impl Future<Output = Result<SubmitOutcome>> + Send;

    /// Open the streaming variant of a generation and return its body.
    fn open_stream(&self, request: &GenerationRequest)
        -> impl Future<Output = Result<ByteStream>> + Send;
}

impl<T: StatusSource> StatusSource for Arc<T> {
    fn fetch_status(
        &self,
        handle: &TaskHandle,
        media: MediaKind,
    ) -> impl Future<Output = std::result::Result<StatusReport, StatusCheckError>> + Send {
        (**self).fetch_status(handle, media)
    }
}

impl<T: GenerationService> GenerationService for Arc<T> {
    fn submit(
        &self,
        request: &GenerationRequest,
        media: MediaKind,
    ) -> impl Future<Output = Result<SubmitOutcome>> + Send {
        (**self).submit(request, media)
    }

    fn open_stream(&self, request: &GenerationRequest)
        -> impl Future<Output = Result<ByteStream>> + Send {
        (**self).open_stream(request)
    }
}
