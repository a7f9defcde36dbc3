//! Streamed generation progress.
//!
//! The service answers a streaming request with a long-lived text body of
//! `data: <json>` lines. [`FrameDecoder`] turns arbitrarily chunked bytes
//! into [`ProgressEvent`]s, and [`EventStream`] drives it over a live
//! connection, stopping at the first terminal frame.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::FrameMode;
use crate::error::{GenError, Result};
use crate::projector;
use crate::service::{ByteStream, GenerationService};
use crate::types::{EventKind, GenerationRequest, ProgressEvent};

const DATA_PREFIX: &str = "data: ";

/// Wire shape of a single `data:` frame.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: EventKind,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    percent: Option<f64>,
    #[serde(default)]
    stage: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default, alias = "result")]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl RawFrame {
    fn into_event(self) -> ProgressEvent {
        let percent = self
            .progress
            .or(self.percent)
            .unwrap_or(0.0)
            .clamp(0.0, 100.0)
            .round() as u8;
        ProgressEvent {
            kind: self.kind,
            percent,
            stage_label: self.stage.unwrap_or_default(),
            message: self.message.unwrap_or_default(),
            payload: self.data.as_ref().and_then(projector::record_from_value),
            error_text: self.error,
        }
    }
}

/// Longest line the decoder will hold while waiting for a newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental decoder for newline-delimited `data:` frames.
///
/// Bytes are buffered until a full line is available, so both lines and
/// multi-byte UTF-8 characters may be split across chunks. Decoding stops
/// after a terminal frame; anything behind it stays buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Leading bytes of `buffer` known to contain no newline.
    scanned: usize,
    mode: FrameMode,
    max_line: usize,
    deferred: Option<GenError>,
}

impl FrameDecoder {
    pub fn new(mode: FrameMode) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            mode,
            max_line: MAX_LINE_BYTES,
            deferred: None,
        }
    }

    pub fn with_max_line(mut self, bytes: usize) -> Self {
        self.max_line = bytes;
        self
    }

    /// Feed one chunk and return every frame it completed.
    ///
    /// If a line fails after earlier frames in the same chunk decoded, those
    /// frames are returned and the error is held until
    /// [`take_error`](Self::take_error), the next `push`, or `finish`.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<ProgressEvent>> {
        if let Some(e) = self.deferred.take() {
            return Err(e);
        }
        self.buffer.extend_from_slice(chunk);
        let (events, error) = self.drain_lines();
        self.settle(events, error)
    }

    /// Decode whatever remains once the body has ended. A final line is
    /// accepted without its trailing newline.
    pub fn finish(&mut self) -> Result<Vec<ProgressEvent>> {
        if let Some(e) = self.deferred.take() {
            return Err(e);
        }
        let (mut events, error) = self.drain_lines();
        if error.is_none() && !events.last().is_some_and(|e| e.is_terminal()) {
            let rest = std::mem::take(&mut self.buffer);
            self.scanned = 0;
            match self.decode_line(&rest) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => return self.settle(events, Some(e)),
            }
        }
        self.settle(events, error)
    }

    /// Error held back from an earlier `push`, if any.
    pub fn take_error(&mut self) -> Option<GenError> {
        self.deferred.take()
    }

    /// Bytes held back waiting for the rest of their line.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn settle(
        &mut self,
        events: Vec<ProgressEvent>,
        error: Option<GenError>,
    ) -> Result<Vec<ProgressEvent>> {
        match error {
            Some(e) if events.is_empty() => Err(e),
            Some(e) => {
                self.deferred = Some(e);
                Ok(events)
            }
            None => Ok(events),
        }
    }

    /// Decode complete lines up to the first terminal frame or error.
    fn drain_lines(&mut self) -> (Vec<ProgressEvent>, Option<GenError>) {
        let mut events = Vec::new();
        let mut error = None;
        let mut stopped = false;
        let mut start = 0;
        let mut cursor = self.scanned;

        while let Some(offset) = self.buffer[cursor..].iter().position(|b| *b == b'\n') {
            let end = cursor + offset;
            let decoded = self.decode_line(&self.buffer[start..end]);
            start = end + 1;
            cursor = start;
            match decoded {
                Ok(Some(event)) => {
                    let terminal = event.is_terminal();
                    events.push(event);
                    if terminal {
                        stopped = true;
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error = Some(e);
                    stopped = true;
                    break;
                }
            }
        }

        self.buffer.drain(..start);
        self.scanned = if stopped { 0 } else { self.buffer.len() };

        if error.is_none() && !stopped && self.buffer.len() > self.max_line {
            tracing::warn!(
                buffered = self.buffer.len(),
                limit = self.max_line,
                "Stream line exceeds limit"
            );
            self.buffer.clear();
            self.scanned = 0;
            error = Some(GenError::Stream(format!(
                "Frame exceeds {} bytes without a line break",
                self.max_line
            )));
        }
        (events, error)
    }

    fn decode_line(&self, raw: &[u8]) -> Result<Option<ProgressEvent>> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);

        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            if !line.trim().is_empty() {
                tracing::debug!(line = %line, "Ignoring non-data stream line");
            }
            return Ok(None);
        };

        match serde_json::from_str::<RawFrame>(payload) {
            Ok(frame) => Ok(Some(frame.into_event())),
            Err(e) => match self.mode {
                FrameMode::Lenient => {
                    tracing::warn!(error = %e, frame = %payload, "Skipping malformed stream frame");
                    Ok(None)
                }
                FrameMode::Strict => Err(GenError::Stream(format!("Malformed frame: {}", e))),
            },
        }
    }
}

/// A live, ordered, non-restartable sequence of progress events.
///
/// Ends after the first `Complete` or `Error` event, closing the
/// connection even if the service keeps sending. Ending without such an
/// event produces a single `GenError::Stream`. Cancellation ends it
/// quietly.
pub struct EventStream {
    body: Option<ByteStream>,
    decoder: FrameDecoder,
    queued: VecDeque<ProgressEvent>,
    cancel: CancellationToken,
    last_percent: u8,
    finished: bool,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("open", &self.body.is_some())
            .field("queued", &self.queued.len())
            .field("last_percent", &self.last_percent)
            .field("finished", &self.finished)
            .finish()
    }
}

impl EventStream {
    pub fn new(body: ByteStream, mode: FrameMode, cancel: CancellationToken) -> Self {
        Self {
            body: Some(body),
            decoder: FrameDecoder::new(mode),
            queued: VecDeque::new(),
            cancel,
            last_percent: 0,
            finished: false,
        }
    }

    fn cancelled(mode: FrameMode, cancel: CancellationToken) -> Self {
        let mut stream = Self::new(futures::stream::empty().boxed(), mode, cancel);
        stream.close();
        stream
    }

    /// Whether the connection is still held open.
    pub fn is_open(&self) -> bool {
        self.body.is_some()
    }

    /// Next event, `None` once the sequence is over.
    pub async fn next_event(&mut self) -> Option<Result<ProgressEvent>> {
        loop {
            if self.finished {
                return None;
            }
            if self.cancel.is_cancelled() {
                tracing::debug!("Progress stream cancelled");
                self.close();
                return None;
            }
            if let Some(event) = self.queued.pop_front() {
                return Some(Ok(self.emit(event)));
            }
            if let Some(e) = self.decoder.take_error() {
                self.close();
                return Some(Err(e));
            }

            let Some(body) = self.body.as_mut() else {
                tracing::warn!(last_percent = self.last_percent, "Progress stream ended early");
                self.close();
                return Some(Err(GenError::Stream(
                    "stream ended without a terminal event".into(),
                )));
            };

            let cancel = self.cancel.clone();
            let chunk: Option<Option<Result<Bytes>>> = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                chunk = body.next() => Some(chunk),
            };

            match chunk {
                // Cancelled; handled at the top of the loop.
                None => continue,
                Some(Some(Ok(bytes))) => match self.decoder.push(&bytes) {
                    Ok(events) => self.queued.extend(events),
                    Err(e) => {
                        self.close();
                        return Some(Err(e));
                    }
                },
                Some(Some(Err(e))) => {
                    tracing::warn!(error = %e, "Progress stream interrupted");
                    self.close();
                    return Some(Err(e));
                }
                Some(None) => {
                    self.body = None;
                    match self.decoder.finish() {
                        Ok(events) => self.queued.extend(events),
                        Err(e) => {
                            self.close();
                            return Some(Err(e));
                        }
                    }
                }
            }
        }
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<ProgressEvent>> + Send {
        futures::stream::unfold(self, |mut events| async move {
            events.next_event().await.map(|item| (item, events))
        })
    }

    fn emit(&mut self, mut event: ProgressEvent) -> ProgressEvent {
        // Never let the visible percentage move backwards.
        if event.percent < self.last_percent {
            event.percent = self.last_percent;
        }
        self.last_percent = event.percent;
        if event.is_terminal() {
            self.close();
        }
        event
    }

    /// Drop the connection and anything not yet delivered.
    fn close(&mut self) {
        self.body = None;
        self.queued.clear();
        self.finished = true;
    }
}

/// Opens streaming generations against a [`GenerationService`].
#[derive(Debug)]
pub struct StreamConsumer<S> {
    service: S,
    frame_mode: FrameMode,
}

impl<S: GenerationService> StreamConsumer<S> {
    pub fn new(service: S, frame_mode: FrameMode) -> Self {
        Self {
            service,
            frame_mode,
        }
    }

    /// Submit `request` and return its event sequence.
    ///
    /// If `cancel` fires while the connection is being opened, the returned
    /// sequence is already finished.
    pub async fn open(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        request.validate()?;

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            body = self.service.open_stream(request) => Some(body?),
        };

        Ok(match body {
            Some(body) => EventStream::new(body, self.frame_mode, cancel),
            None => EventStream::cancelled(self.frame_mode, cancel),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(chunks: Vec<&[u8]>) -> ByteStream {
        let chunks: Vec<Result<Bytes>> = chunks
            .into_iter()
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(chunks).boxed()
    }

    fn open(chunks: Vec<&[u8]>, mode: FrameMode) -> EventStream {
        EventStream::new(body(chunks), mode, CancellationToken::new())
    }

    async fn drain(stream: &mut EventStream) -> Vec<Result<ProgressEvent>> {
        let mut out = Vec::new();
        while let Some(item) = stream.next_event().await {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_decoder_buffers_split_line() {
        let mut decoder = FrameDecoder::new(FrameMode::Lenient);
        let first = decoder
            .push(b"data: {\"type\":\"progress\",\"progr")
            .unwrap();
        assert!(first.is_empty());
        assert!(decoder.pending_bytes() > 0);

        let second = decoder.push(b"ess\":42,\"stage\":\"upscaling\"}\n").unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].percent, 42);
        assert_eq!(second[0].stage_label, "upscaling");
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_decoder_handles_split_multibyte_char() {
        let line = "data: {\"type\":\"progress\",\"progress\":5,\"stage\":\"Préparation\"}\n";
        let bytes = line.as_bytes();
        let split = line.find('é').unwrap() + 1; // inside the two-byte sequence
        let mut decoder = FrameDecoder::new(FrameMode::Lenient);

        assert!(decoder.push(&bytes[..split]).unwrap().is_empty());
        let events = decoder.push(&bytes[split..]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stage_label, "Préparation");
    }

    #[test]
    fn test_decoder_ignores_other_lines() {
        let mut decoder = FrameDecoder::new(FrameMode::Lenient);
        let events = decoder
            .push(b": keep-alive\n\nevent: progress\nid: 3\ndata: {\"type\":\"progress\",\"progress\":10}\n\n")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].percent, 10);
    }

    #[test]
    fn test_decoder_strips_carriage_return() {
        let mut decoder = FrameDecoder::new(FrameMode::Lenient);
        let events = decoder
            .push(b"data: {\"type\":\"progress\",\"percent\":7}\r\n")
            .unwrap();
        assert_eq!(events[0].percent, 7);
    }

    #[test]
    fn test_lenient_skips_malformed_frame() {
        let mut decoder = FrameDecoder::new(FrameMode::Lenient);
        let events = decoder
            .push(b"data: {not json\ndata: {\"type\":\"progress\",\"progress\":20}\n")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].percent, 20);
    }

    #[test]
    fn test_strict_rejects_malformed_frame() {
        let mut decoder = FrameDecoder::new(FrameMode::Strict);
        let err = decoder.push(b"data: {not json\n").unwrap_err();
        assert!(matches!(err, GenError::Stream(msg) if msg.contains("Malformed")));
    }

    #[test]
    fn test_frame_fields() {
        let mut decoder = FrameDecoder::new(FrameMode::Lenient);
        let events = decoder
            .push(
                b"data: {\"type\":\"complete\",\"progress\":100,\"message\":\"done\",\"data\":{\"images\":[{\"url\":\"https://x/out.png\",\"size\":\"1024x1024\"}]}}\n\
                  data: {\"type\":\"error\",\"progress\":140,\"error\":\"gpu lost\"}\n",
            )
            .unwrap();
        assert_eq!(events[0].kind, EventKind::Complete);
        assert_eq!(events[0].message, "done");
        let payload = events[0].payload.as_ref().unwrap();
        assert_eq!(payload.filename, "out.png");
        assert_eq!(payload.size, "1024x1024");

        assert_eq!(events[1].kind, EventKind::Error);
        assert_eq!(events[1].percent, 100);
        assert_eq!(events[1].error_text.as_deref(), Some("gpu lost"));
    }

    #[test]
    fn test_finish_accepts_unterminated_last_line() {
        let mut decoder = FrameDecoder::new(FrameMode::Lenient);
        assert!(decoder.push(b"data: {\"type\":\"complete\"}").unwrap().is_empty());
        let events = decoder.finish().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Complete);
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_line_split_across_chunks_yields_one_event() {
        let mut stream = open(
            vec![
                b"data: {\"type\":\"progress\",\"progress\":3".as_slice(),
                b"0,\"stage\":\"enhancing\"}\ndata: {\"type\":\"complete\",\"data\":\"https://x/o.png\"}\n".as_slice(),
            ],
            FrameMode::Lenient,
        );

        let items = drain(&mut stream).await;
        assert_eq!(items.len(), 2);
        let first = items[0].as_ref().unwrap();
        assert_eq!(first.kind, EventKind::Progress);
        assert_eq!(first.percent, 30);
        assert_eq!(items[1].as_ref().unwrap().kind, EventKind::Complete);
    }

    #[tokio::test]
    async fn test_eof_without_terminal_is_single_error() {
        let mut stream = open(
            vec![
                b"data: {\"type\":\"progress\",\"progress\":10}\n".as_slice(),
                b"data: {\"type\":\"progress\",\"progress\":50}\ndata: {\"type\":\"prog".as_slice(),
            ],
            FrameMode::Lenient,
        );

        let items = drain(&mut stream).await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().percent, 10);
        assert_eq!(items[1].as_ref().unwrap().percent, 50);
        match &items[2] {
            Err(GenError::Stream(msg)) => assert!(msg.contains("without a terminal event")),
            other => panic!("Expected stream error, got {:?}", other),
        }
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_stops_at_terminal_event() {
        let mut stream = open(
            vec![
                b"data: {\"type\":\"error\",\"error\":\"rejected\"}\ndata: {\"type\":\"progress\",\"progress\":90}\n".as_slice(),
                b"data: {\"type\":\"complete\"}\n".as_slice(),
            ],
            FrameMode::Lenient,
        );

        let first = stream.next_event().await.unwrap().unwrap();
        assert_eq!(first.kind, EventKind::Error);
        assert!(!stream.is_open());
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_percent_never_decreases() {
        let mut stream = open(
            vec![
                b"data: {\"type\":\"progress\",\"progress\":60}\n".as_slice(),
                b"data: {\"type\":\"progress\",\"progress\":40}\n".as_slice(),
                b"data: {\"type\":\"progress\",\"progress\":-5}\n".as_slice(),
                b"data: {\"type\":\"complete\",\"progress\":100}\n".as_slice(),
            ],
            FrameMode::Lenient,
        );

        let percents: Vec<u8> = drain(&mut stream)
            .await
            .into_iter()
            .map(|e| e.unwrap().percent)
            .collect();
        assert_eq!(percents, vec![60, 60, 60, 100]);
    }

    #[tokio::test]
    async fn test_transport_error_is_reported_once() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"progress\",\"progress\":10}\n")),
            Err(GenError::Stream("Connection interrupted: reset".into())),
            Ok(Bytes::from_static(b"data: {\"type\":\"complete\"}\n")),
        ];
        let mut stream = EventStream::new(
            futures::stream::iter(chunks).boxed(),
            FrameMode::Lenient,
            CancellationToken::new(),
        );

        let items = drain(&mut stream).await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(
            items[1].as_ref().unwrap_err(),
            &GenError::Stream("Connection interrupted: reset".into())
        );
    }

    #[tokio::test]
    async fn test_cancel_is_a_clean_exit() {
        let chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::from_static(
            b"data: {\"type\":\"progress\",\"progress\":10}\n",
        ))];
        let body = futures::stream::iter(chunks)
            .chain(futures::stream::pending())
            .boxed();
        let cancel = CancellationToken::new();
        let mut stream = EventStream::new(body, FrameMode::Lenient, cancel.clone());

        assert_eq!(stream.next_event().await.unwrap().unwrap().percent, 10);

        let (next, _) = tokio::join!(stream.next_event(), async {
            tokio::task::yield_now().await;
            cancel.cancel();
        });
        assert!(next.is_none());
        assert!(!stream.is_open());
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_into_stream_collects() {
        let stream = open(
            vec![b"data: {\"type\":\"progress\",\"progress\":50}\ndata: {\"type\":\"complete\"}\n".as_slice()],
            FrameMode::Lenient,
        );
        let items: Vec<_> = stream.into_stream().collect().await;
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_strict_complete_before_garbage_completes() {
        let mut stream = open(
            vec![b"data: {\"type\":\"complete\",\"data\":\"https://x/o.png\"}\ndata: {garbage\n".as_slice()],
            FrameMode::Strict,
        );

        let first = stream.next_event().await.unwrap().unwrap();
        assert_eq!(first.kind, EventKind::Complete);
        assert_eq!(first.payload.unwrap().url, "https://x/o.png");
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_strict_error_follows_earlier_frames() {
        let mut stream = open(
            vec![b"data: {\"type\":\"progress\",\"progress\":25}\ndata: {garbage\n".as_slice()],
            FrameMode::Strict,
        );

        let items = drain(&mut stream).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().percent, 25);
        assert!(matches!(&items[1], Err(GenError::Stream(msg)) if msg.contains("Malformed")));
    }

    #[test]
    fn test_decoder_stops_at_terminal_and_keeps_tail() {
        let mut decoder = FrameDecoder::new(FrameMode::Strict);
        let events = decoder
            .push(b"data: {\"type\":\"error\",\"error\":\"x\"}\ndata: {\"type\":\"progress\",\"progress\":9}\n")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Error);
        assert!(decoder.pending_bytes() > 0);

        let rest = decoder.push(b"").unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].percent, 9);
    }

    #[test]
    fn test_decoder_rejects_overlong_line() {
        let mut decoder = FrameDecoder::new(FrameMode::Lenient).with_max_line(16);
        assert!(decoder.push(b"data: {\"type\":").unwrap().is_empty());

        let err = decoder.push(b"\"progress\",\"progress\":1").unwrap_err();
        assert!(matches!(err, GenError::Stream(msg) if msg.contains("16 bytes")));
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_frame_with_progress_and_percent() {
        let mut decoder = FrameDecoder::new(FrameMode::Lenient);
        let events = decoder
            .push(b"data: {\"type\":\"progress\",\"progress\":40,\"percent\":35}\ndata: {\"type\":\"progress\",\"percent\":55}\n")
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].percent, 40);
        assert_eq!(events[1].percent, 55);
    }
}
