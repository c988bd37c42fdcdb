//! Reassembles a streamed chat reply from an NDJSON response body.
//!
//! The proxy re-publishes the model server's stream unchanged, one JSON record
//! per line:
//! ```text
//! {"model":"gemma3:12b","message":{"role":"assistant","content":"Hel"},"done":false}
//! {"model":"gemma3:12b","message":{"role":"assistant","content":"lo"},"done":false}
//! {"model":"gemma3:12b","message":{"role":"assistant","content":""},"done":true}
//! ```
//!
//! Chunks arrive with arbitrary boundaries, so decoding carries partial UTF-8
//! sequences forward and lines are only parsed once their `\n` has arrived.
//! A line that fails to parse is reported and skipped.

use futures::{Stream, StreamExt};
use thiserror::Error;

use crate::decoder::Utf8Decoder;
use crate::protocol::content_delta;

/// Subscriber for assembler output.
pub trait AssemblerEvents {
    /// Called once per content delta with the whole text assembled so far.
    fn on_update(&mut self, accumulated: &str);

    fn on_malformed(&mut self, line: &str, error: &serde_json::Error) {
        tracing::warn!(%line, %error, "skipping malformed NDJSON line");
    }
}

impl<F> AssemblerEvents for F
where
    F: FnMut(&str),
{
    fn on_update(&mut self, accumulated: &str) {
        self(accumulated)
    }
}

/// The producer failed after the stream had started.
#[derive(Debug, Error)]
#[error("stream interrupted after {} bytes of content: {source}", .partial.len())]
pub struct StreamInterrupted<E>
where
    E: std::error::Error + 'static,
{
    pub partial: String,
    #[source]
    pub source: E,
}

#[derive(Debug, Default)]
pub struct StreamAssembler {
    decoder: Utf8Decoder,
    pending: String,
    accumulated: String,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk<V>(&mut self, chunk: &[u8], events: &mut V)
    where
        V: AssemblerEvents + ?Sized,
    {
        let text = self.decoder.decode(chunk);
        if text.is_empty() {
            return;
        }
        self.pending.push_str(&text);

        let Some(last_newline) = self.pending.rfind('\n') else {
            return;
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        for line in complete.split('\n') {
            self.process_line(line, events);
        }
    }

    /// Ends the stream and returns the assembled content. An unterminated
    /// final line is not a complete record and is dropped.
    pub fn finish(mut self) -> String {
        self.pending.push_str(&self.decoder.flush());
        if !self.pending.trim().is_empty() {
            // Compatibility risk if the upstream ever stops terminating its
            // final record.
            tracing::debug!(
                residue = %self.pending,
                "dropping unterminated NDJSON line at end of stream"
            );
        }
        self.accumulated
    }

    fn process_line<V>(&mut self, line: &str, events: &mut V)
    where
        V: AssemblerEvents + ?Sized,
    {
        if line.trim().is_empty() {
            return;
        }

        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(record) => {
                if let Some(delta) = content_delta(&record) {
                    self.accumulated.push_str(delta);
                    events.on_update(&self.accumulated);
                }
            }
            Err(error) => events.on_malformed(line, &error),
        }
    }
}

/// Drives `stream` to completion, one read at a time.
///
/// Returns the assembled content, or the partial content together with the
/// producer's error if the stream fails midway.
pub async fn consume<S, B, E, V>(stream: S, events: &mut V) -> Result<String, StreamInterrupted<E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error + 'static,
    V: AssemblerEvents + ?Sized,
{
    let mut stream = std::pin::pin!(stream);
    let mut assembler = StreamAssembler::new();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => assembler.push_chunk(bytes.as_ref(), events),
            Err(source) => {
                return Err(StreamInterrupted {
                    partial: assembler.finish(),
                    source,
                });
            }
        }
    }

    Ok(assembler.finish())
}
