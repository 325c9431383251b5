//! Cancellable stream consumption
//!
//! Drains the backend's chunk stream through an ordered matcher chain.
//! Matchers inspect every chunk and may rewrite it or request cancellation;
//! the first cancellation verdict stops forwarding and fires the shared
//! `CancellationToken` exactly once. Cancellation is cooperative: the token is
//! checked between chunks, an in-flight network read is never interrupted.
//! Output already forwarded is never retracted.

use backend::{BackendError, ChunkStream};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Verdict of one matcher for one chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum MatchVerdict {
    /// Forward this (possibly rewritten, possibly empty) text downstream.
    Forward(String),
    /// Forward this final text, then cancel the stream.
    Cancel(String),
}

/// A rule applied to every chunk of a response stream. Scoped to a single
/// request; matchers are stateful and never reused.
pub trait Matcher: Send {
    fn feed(&mut self, chunk: &str) -> MatchVerdict;

    /// Flush any text held back across chunk boundaries. Called once when the
    /// stream ends without cancellation.
    fn finish(&mut self) -> String {
        String::new()
    }
}

/// Cancels the stream when a stop sequence appears in the output.
///
/// Holds back up to `stop.len() - 1` trailing bytes so a sequence split
/// across chunk boundaries is still caught before any part of it is
/// forwarded.
pub struct StopSequenceMatcher {
    stop: String,
    pending: String,
}

impl StopSequenceMatcher {
    pub fn new(stop: impl Into<String>) -> Self {
        Self {
            stop: stop.into(),
            pending: String::new(),
        }
    }
}

impl Matcher for StopSequenceMatcher {
    fn feed(&mut self, chunk: &str) -> MatchVerdict {
        self.pending.push_str(chunk);

        if let Some(idx) = self.pending.find(&self.stop) {
            let out = self.pending[..idx].to_string();
            self.pending.clear();
            return MatchVerdict::Cancel(out);
        }

        let holdback = self.stop.len().saturating_sub(1);
        if self.pending.len() <= holdback {
            return MatchVerdict::Forward(String::new());
        }

        let mut split = self.pending.len() - holdback;
        while !self.pending.is_char_boundary(split) {
            split -= 1;
        }
        let out: String = self.pending.drain(..split).collect();
        MatchVerdict::Forward(out)
    }

    fn finish(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }
}

/// Result of draining a stream.
#[derive(Debug)]
pub struct DrainOutcome {
    /// All text forwarded to the caller, in order.
    pub text: String,
    /// Whether the stream ended by cancellation (matcher or external).
    pub cancelled: bool,
}

/// Consume a chunk stream through the matcher chain.
///
/// Chunks are forwarded to `sink` (when present) as they clear the chain, so
/// a streaming client sees output incrementally. The accumulated text is also
/// returned for single-shot responses and empty-response detection.
pub async fn drain(
    mut chunks: ChunkStream,
    mut matchers: Vec<Box<dyn Matcher>>,
    cancel: CancellationToken,
    sink: Option<&mpsc::Sender<String>>,
) -> Result<DrainOutcome, BackendError> {
    let mut text = String::new();
    let mut cancelled = false;

    'stream: while let Some(item) = chunks.next().await {
        if cancel.is_cancelled() {
            // External cancellation observed between chunks
            debug!("stream consumer observed cancellation, stopping");
            cancelled = true;
            break;
        }

        let mut piece = item?;
        for matcher in matchers.iter_mut() {
            match matcher.feed(&piece) {
                MatchVerdict::Forward(out) => piece = out,
                MatchVerdict::Cancel(out) => {
                    forward(&mut text, sink, out).await;
                    // First cancellation verdict wins; signal exactly once
                    cancel.cancel();
                    cancelled = true;
                    debug!("matcher requested cancellation");
                    break 'stream;
                }
            }
            if piece.is_empty() {
                break;
            }
        }
        forward(&mut text, sink, piece).await;
    }

    if !cancelled {
        flush_tails(&mut matchers, &cancel, &mut cancelled, &mut text, sink).await;
    }

    Ok(DrainOutcome { text, cancelled })
}

/// Flush held-back matcher tails in chain order, passing each tail through
/// the matchers downstream of its owner. A stop sequence completed only by a
/// tail still cancels.
async fn flush_tails(
    matchers: &mut [Box<dyn Matcher>],
    cancel: &CancellationToken,
    cancelled: &mut bool,
    text: &mut String,
    sink: Option<&mpsc::Sender<String>>,
) {
    for i in 0..matchers.len() {
        let mut tail = matchers[i].finish();
        if tail.is_empty() {
            continue;
        }
        for matcher in matchers.iter_mut().skip(i + 1) {
            match matcher.feed(&tail) {
                MatchVerdict::Forward(out) => tail = out,
                MatchVerdict::Cancel(out) => {
                    tail = out;
                    if !*cancelled {
                        cancel.cancel();
                        *cancelled = true;
                    }
                    break;
                }
            }
            if tail.is_empty() {
                break;
            }
        }
        forward(text, sink, tail).await;
        if *cancelled {
            return;
        }
    }
}

async fn forward(text: &mut String, sink: Option<&mpsc::Sender<String>>, piece: String) {
    if piece.is_empty() {
        return;
    }
    text.push_str(&piece);
    if let Some(sink) = sink {
        // A closed sink means the client went away; keep accumulating so the
        // request can still finish and release its credential.
        let _ = sink.send(piece).await;
    }
}
