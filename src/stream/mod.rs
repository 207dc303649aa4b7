//! Incremental decoding of the chat stream.
//!
//! A response body is a run of relaxed object-literal frames, e.g.
//! `data: {'message': {'content': 'Hel'}, 'done': False}\n\n`. Bytes go
//! through [`Utf8Decoder`], [`FrameExtractor`], [`normalize`] and
//! [`extract_delta`]; [`pump`] drives that pipeline over a live body.

mod decoder;
mod delta;
mod extractor;
mod normalize;

pub use decoder::{InvalidUtf8, Utf8Decoder};
pub use delta::extract_delta;
pub use extractor::FrameExtractor;
pub use normalize::{normalize, to_strict_json, NormalizedRecord};

use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::ChatError;

/// Per-request controls for a streaming call.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub cancel: CancellationToken,
    /// Overall deadline covering the request and the whole body.
    pub deadline: Option<Instant>,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The body reached end-of-stream.
    Completed,
    /// The cancellation token fired; the body was released early.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub outcome: StreamOutcome,
    pub deltas: usize,
    pub dropped_frames: usize,
}

/// Deltas decoded from one chunk.
#[derive(Debug, Default)]
pub struct ChunkDeltas {
    pub deltas: Vec<String>,
    /// Set when decoding stopped at an invalid byte sequence. `deltas` then
    /// holds what the text before it completed.
    pub error: Option<ChatError>,
}

/// Turns raw body chunks into content deltas.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    utf8: Utf8Decoder,
    extractor: FrameExtractor,
    dropped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns the deltas of every frame it completed.
    /// Frames that fail to normalize are logged and skipped.
    pub fn feed(&mut self, chunk: &[u8]) -> ChunkDeltas {
        let (text, error) = match self.utf8.decode(chunk) {
            Ok(text) => (text, None),
            Err(mut err) => (std::mem::take(&mut err.decoded), Some(ChatError::from(err))),
        };
        let mut deltas = Vec::new();

        for frame in self.extractor.push(&text) {
            match normalize(&frame) {
                Ok(record) => {
                    trace!(done = record.done, "frame decoded");
                    if let Some(delta) = extract_delta(&record) {
                        deltas.push(delta.to_owned());
                    }
                }
                Err(err) => {
                    self.dropped += 1;
                    warn!(error = %err, frame = %frame, "dropping malformed frame");
                }
            }
        }

        ChunkDeltas { deltas, error }
    }

    /// Frames that were dropped, either malformed or abandoned mid-string.
    pub fn dropped_frames(&self) -> usize {
        self.dropped + self.extractor.abandoned()
    }

    /// Discards whatever is left of an unterminated final frame.
    pub fn finish(&mut self) {
        let text = self.extractor.finish();
        let bytes = self.utf8.finish();
        if text > 0 || bytes > 0 {
            debug!(
                partial_frame = text,
                undecoded_bytes = bytes,
                "discarding incomplete tail of stream"
            );
        }
    }
}

/// Reads `body` to the end, handing each delta to `on_chunk` in order.
///
/// `on_chunk` runs inside the loop, so the next chunk is not requested
/// until every delta of the current one has been delivered. When `cancel`
/// fires the body is dropped, which releases the connection, and no further
/// deltas are delivered. Errors from the body end the loop; deltas already
/// delivered stay delivered.
pub async fn pump<S, B, E, F>(
    body: S,
    cancel: &CancellationToken,
    mut on_chunk: F,
) -> Result<StreamSummary, ChatError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    ChatError: From<E>,
    F: FnMut(&str),
{
    let mut body = Box::pin(body);
    let mut decoder = FrameDecoder::new();
    let mut deltas = 0;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            chunk = body.next() => Some(chunk),
        };

        let Some(chunk) = next else {
            drop(body);
            debug!(deltas, "stream cancelled; response body released");
            return Ok(StreamSummary {
                outcome: StreamOutcome::Cancelled,
                deltas,
                dropped_frames: decoder.dropped_frames(),
            });
        };

        let Some(chunk) = chunk else {
            break;
        };
        let chunk = chunk?;
        trace!(bytes = chunk.as_ref().len(), "chunk received");

        let fed = decoder.feed(chunk.as_ref());
        for delta in fed.deltas {
            if cancel.is_cancelled() {
                break;
            }
            deltas += 1;
            on_chunk(&delta);
        }
        if let Some(err) = fed.error {
            return Err(err);
        }
    }

    decoder.finish();
    debug!(
        deltas,
        dropped_frames = decoder.dropped_frames(),
        "stream completed"
    );

    Ok(StreamSummary {
        outcome: StreamOutcome::Completed,
        deltas,
        dropped_frames: decoder.dropped_frames(),
    })
}
