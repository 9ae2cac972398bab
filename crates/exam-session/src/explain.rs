//! Streaming explanation reader.
//!
//! An [`ExplanationStream`] wraps one outbound request and yields decoded
//! text fragments as they arrive. It is lazy, forward-only and cannot be
//! restarted. A multi-byte character split across network reads is held
//! back until its remaining bytes arrive.
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use exam_session::{ExplanationStream, StreamOutcome};
//!
//! # async fn example(mut stream: ExplanationStream) {
//! let cancel = stream.cancel_token();
//! while let Some(fragment) = stream.next().await {
//!     match fragment {
//!         Ok(text) => print!("{text}"),
//!         Err(e) => eprintln!("{e}"),
//!     }
//! }
//! assert!(!matches!(stream.outcome(), StreamOutcome::Pending));
//! # drop(cancel);
//! # }
//! ```

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

/// Why an explanation stream ended early.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The initial response was not a success.
    #[error("Explanation request failed (HTTP {status}): {message}")]
    Rejected {
        /// HTTP status of the response.
        status: u16,
        /// Body text of the response, if any.
        message: String,
    },

    /// The connection failed before or during the body.
    #[error("Explanation stream interrupted: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
    },
}

impl StreamError {
    /// Creates a new `Transport` error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}

/// How an explanation stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Still producing fragments.
    Pending,
    /// The body ended normally.
    Completed,
    /// The consumer cancelled; the body was dropped.
    Cancelled,
    /// The request or body failed.
    Failed(StreamError),
}

// ============================================================================
// UTF-8 decoding
// ============================================================================

const REPLACEMENT: char = '\u{FFFD}';

/// Incremental UTF-8 decoder.
///
/// Bytes of an incomplete trailing sequence are kept for the next call.
/// Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes as much of `pending + chunk` as is complete.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest = buf.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(&String::from_utf8_lossy(valid));
                    if let Some(len) = e.error_len() {
                        out.push(REPLACEMENT);
                        rest = &after[len..];
                    } else {
                        self.pending = after.to_vec();
                        break;
                    }
                }
            }
        }
        out
    }

    /// Flushes the decoder at end of input.
    ///
    /// An incomplete trailing sequence becomes one U+FFFD.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            self.pending.clear();
            Some(REPLACEMENT.to_string())
        }
    }
}

// ============================================================================
// Stream
// ============================================================================

/// A cancellable stream of explanation text.
pub struct ExplanationStream {
    body: Option<BoxStream<'static, Result<Vec<u8>, StreamError>>>,
    decoder: Utf8Decoder,
    cancel: CancellationToken,
    cancelled: BoxFuture<'static, ()>,
    outcome: StreamOutcome,
}

impl ExplanationStream {
    /// Wraps a byte stream.
    pub fn from_bytes<S, B, E>(body: S, cancel: CancellationToken) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let body = body
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.as_ref().to_vec())
                    .map_err(|e| StreamError::transport(e.to_string()))
            })
            .boxed();
        Self::with_body(body, cancel)
    }

    /// A stream that yields `error` once and ends.
    #[must_use]
    pub fn failed(error: StreamError) -> Self {
        let body = futures::stream::once(async move { Err::<Vec<u8>, _>(error) }).boxed();
        Self::with_body(body, CancellationToken::new())
    }

    /// Wraps an HTTP response.
    ///
    /// A non-success status becomes a single [`StreamError::Rejected`]
    /// carrying the response body text.
    pub fn from_response(response: reqwest::Response, cancel: CancellationToken) -> Self {
        let status = response.status();
        if status.is_success() {
            return Self::from_bytes(response.bytes_stream(), cancel);
        }

        let body = futures::stream::once(async move {
            let message = response.text().await.unwrap_or_default();
            Err::<Vec<u8>, _>(StreamError::Rejected {
                status: status.as_u16(),
                message: message.trim().to_string(),
            })
        })
        .boxed();
        Self::with_body(body, cancel)
    }

    fn with_body(body: BoxStream<'static, Result<Vec<u8>, StreamError>>, cancel: CancellationToken) -> Self {
        let token = cancel.clone();
        Self {
            body: Some(body),
            decoder: Utf8Decoder::new(),
            cancel,
            cancelled: async move { token.cancelled().await }.boxed(),
            outcome: StreamOutcome::Pending,
        }
    }

    /// A handle that can cancel this stream from elsewhere.
    ///
    /// Cancelling through the token releases the body on the stream's next
    /// poll, or when it is dropped.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels the stream and drops the body right away, releasing the
    /// connection. Has no effect once the stream has ended.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        if self.body.is_some() {
            self.finish(StreamOutcome::Cancelled);
        }
    }

    /// How the stream ended, or `Pending` while it is still running.
    #[must_use]
    pub const fn outcome(&self) -> &StreamOutcome {
        &self.outcome
    }

    /// Reads the remaining fragments into one string.
    ///
    /// # Errors
    ///
    /// Returns the stream's error, or [`StreamError::Transport`] if it was
    /// cancelled before completing.
    pub async fn read_to_end(mut self) -> Result<String, StreamError> {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment?);
        }
        match self.outcome {
            StreamOutcome::Cancelled => Err(StreamError::transport("cancelled")),
            _ => Ok(text),
        }
    }

    fn finish(&mut self, outcome: StreamOutcome) {
        self.body = None;
        self.outcome = outcome;
    }
}

impl Stream for ExplanationStream {
    type Item = Result<String, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            let Some(body) = this.body.as_mut() else {
                return Poll::Ready(None);
            };

            if this.cancelled.poll_unpin(cx).is_ready() {
                this.finish(StreamOutcome::Cancelled);
                return Poll::Ready(None);
            }

            match body.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(bytes))) => {
                    let text = this.decoder.decode(&bytes);
                    if !text.is_empty() {
                        return Poll::Ready(Some(Ok(text)));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finish(StreamOutcome::Failed(e.clone()));
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.finish(StreamOutcome::Completed);
                    return Poll::Ready(this.decoder.finish().map(Ok));
                }
            }
        }
    }
}

impl std::fmt::Debug for ExplanationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplanationStream")
            .field("open", &self.body.is_some())
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use futures::channel::mpsc;

    use super::*;

    type Chunk = Result<Vec<u8>, std::io::Error>;

    fn chunks(parts: Vec<Vec<u8>>) -> ExplanationStream {
        let body = futures::stream::iter(parts.into_iter().map(Ok::<_, std::io::Error>));
        ExplanationStream::from_bytes(body, CancellationToken::new())
    }

    // ------------------------------------------------------------------------
    // Decoder
    // ------------------------------------------------------------------------

    #[test]
    fn test_split_multibyte_character() {
        // "你好" = E4 BD A0 E5 A5 BD
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&[0xE4, 0xBD]), "");
        assert_eq!(decoder.decode(&[0xA0, 0xE5]), "你");
        assert_eq!(decoder.decode(&[0xA5, 0xBD]), "好");
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_invalid_bytes_become_replacement() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"ok\xFFgo"), "ok\u{FFFD}go");
    }

    #[test]
    fn test_truncated_tail_flushes_one_replacement() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&[b'a', 0xE4, 0xBD]), "a");
        assert_eq!(decoder.finish().as_deref(), Some("\u{FFFD}"));
        assert_eq!(decoder.finish(), None);
    }

    // ------------------------------------------------------------------------
    // Stream
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_stream_reassembles_fragments() {
        let text = "解释: A stack is LIFO.";
        let bytes = text.as_bytes();
        // Split inside the first character
        let parts = vec![bytes[..1].to_vec(), bytes[1..4].to_vec(), bytes[4..].to_vec()];

        let mut stream = chunks(parts);
        let mut out = String::new();
        while let Some(fragment) = stream.next().await {
            out.push_str(&fragment.unwrap());
        }

        assert_eq!(out, text);
        assert_eq!(stream.outcome(), &StreamOutcome::Completed);
    }

    #[tokio::test]
    async fn test_failed_response_yields_one_error() {
        let mut stream = ExplanationStream::failed(StreamError::Rejected {
            status: 403,
            message: "answers_not_available".to_string(),
        });

        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(StreamError::Rejected { status: 403, .. })));
        assert!(stream.next().await.is_none());
        assert!(matches!(stream.outcome(), StreamOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_transport_error_mid_stream() {
        let body = futures::stream::iter(vec![
            Ok(b"partial ".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(b"never seen".to_vec()),
        ]);
        let stream = ExplanationStream::from_bytes(body, CancellationToken::new());

        let err = stream.read_to_end().await.unwrap_err();
        assert!(matches!(err, StreamError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_cancel_reports_cancelled_not_completed() {
        let (tx, rx) = mpsc::unbounded::<Chunk>();
        let mut stream = ExplanationStream::from_bytes(rx, CancellationToken::new());

        tx.unbounded_send(Ok(b"first".to_vec())).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "first");

        stream.cancel();
        // The body is dropped before any further poll
        assert!(tx.unbounded_send(Ok(b"late".to_vec())).is_err());
        assert_eq!(stream.outcome(), &StreamOutcome::Cancelled);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_after_completion_keeps_outcome() {
        let mut stream = chunks(vec![b"done".to_vec()]);
        assert_eq!(stream.next().await.unwrap().unwrap(), "done");
        assert!(stream.next().await.is_none());

        stream.cancel();
        assert_eq!(stream.outcome(), &StreamOutcome::Completed);
    }

    #[tokio::test]
    async fn test_cancel_from_another_task() {
        let (tx, rx) = mpsc::unbounded::<Chunk>();
        let mut stream = ExplanationStream::from_bytes(rx, CancellationToken::new());
        let token = stream.cancel_token();

        let reader = tokio::spawn(async move {
            let mut seen = 0;
            while stream.next().await.is_some() {
                seen += 1;
            }
            (seen, stream.outcome().clone())
        });

        tx.unbounded_send(Ok(b"one".to_vec())).unwrap();
        tokio::task::yield_now().await;
        token.cancel();

        let (_, outcome) = reader.await.unwrap();
        assert_eq!(outcome, StreamOutcome::Cancelled);
        drop(tx);
    }
}
