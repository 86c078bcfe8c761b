//! Streaming Session Implementation
//!
//! One prompt, one response: submits the prompt to the engine and turns the
//! engine's output bytes into a lazily produced character stream.

use std::io;
use std::ops::DerefMut;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Stream;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamingConfig;
use crate::decoder::ByteDecoder;
use crate::engine::{EngineChannels, EngineInput, EngineOutput};
use crate::reader::{IdleTimeoutReader, ReadOutcome};

// ============================================================================
// Engine I/O
// ============================================================================

/// Connected engine channels
struct EngineLink {
    input: EngineInput,
    reader: IdleTimeoutReader<BufReader<EngineOutput>>,
}

/// The engine's byte channels plus the decoder state that belongs to them
///
/// Decoder and reader outlive any single session: a cancelled session leaves
/// them exactly where the engine's output stream is, so the next session
/// neither loses nor replays bytes.
pub struct EngineIo {
    link: Option<EngineLink>,
    decoder: ByteDecoder,
    initial_timeout: Duration,
    idle_timeout: Duration,
}

impl EngineIo {
    /// Create without channels; `attach` once the engine is open
    #[must_use]
    pub fn new(config: &StreamingConfig) -> Self {
        Self {
            link: None,
            decoder: ByteDecoder::new(),
            initial_timeout: config.initial_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }

    /// Create already attached to `channels`
    #[must_use]
    pub fn attached(channels: EngineChannels, config: &StreamingConfig) -> Self {
        let mut io = Self::new(config);
        io.attach(channels);
        io
    }

    /// Connect to freshly opened engine channels
    pub fn attach(&mut self, channels: EngineChannels) {
        self.decoder.reset();
        self.link = Some(EngineLink {
            input: channels.input,
            reader: IdleTimeoutReader::new(
                BufReader::new(channels.output),
                self.initial_timeout,
                self.idle_timeout,
            ),
        });
    }

    /// Drop the channels
    pub fn detach(&mut self) {
        self.link = None;
        self.decoder.reset();
    }

    /// Whether channels are attached
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }

    /// Bytes the decoder has dropped as malformed
    #[must_use]
    pub fn discarded_bytes(&self) -> u64 {
        self.decoder.discarded_bytes()
    }

    /// Write one prompt line and flush
    pub async fn submit(&mut self, prompt: &str) -> io::Result<()> {
        let link = self.link.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "generation engine is not open")
        })?;
        link.input.write_all(prompt.as_bytes()).await?;
        link.input.write_all(b"\n").await?;
        link.input.flush().await?;
        link.reader.arm();
        Ok(())
    }

    /// Discard output until the engine has been silent for `quiet`
    ///
    /// Clears the tail of a response whose session was cancelled, so it does
    /// not leak into the next one. Returns the number of bytes discarded.
    pub async fn drain(&mut self, quiet: Duration) -> usize {
        let Some(link) = self.link.as_mut() else {
            return 0;
        };
        let mut drained = 0;
        while let ReadOutcome::Byte(_) = link.reader.next_byte_within(quiet).await {
            drained += 1;
        }
        if drained > 0 || self.decoder.has_pending() {
            debug!(bytes = drained, "Discarded stale engine output");
        }
        self.decoder.reset();
        drained
    }

    async fn next_byte(&mut self) -> ReadOutcome {
        match self.link.as_mut() {
            Some(link) => link.reader.next_byte().await,
            None => ReadOutcome::Closed,
        }
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle of a streaming session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created, prompt not yet sent
    Idle,
    /// Writing the prompt to the engine
    Submitting,
    /// Relaying characters
    Streaming,
    /// Response finished (cleanly or degraded)
    Completed,
    /// Stopped before the response finished
    Cancelled,
}

/// How a completed response was recognised as finished
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndOfResponse {
    /// The engine went quiet for the idle timeout
    IdleTimeout,
    /// The engine emitted the configured end marker
    EndMarker,
}

/// Final result of a session, reported exactly once
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Response finished normally
    Completed {
        /// Full response text
        text: String,
        /// What ended it
        end: EndOfResponse,
    },
    /// Engine output closed or failed mid-response
    Degraded {
        /// Text received before the failure
        text: String,
        /// Failure description
        reason: String,
    },
    /// Stop flag raised or consumer went away
    Cancelled {
        /// Text relayed before cancellation
        partial: String,
    },
}

impl SessionOutcome {
    /// Text relayed to the consumer
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Completed { text, .. } | Self::Degraded { text, .. } => text,
            Self::Cancelled { partial } => partial,
        }
    }
}

/// Shared view of a running session
#[derive(Clone, Debug)]
pub struct SessionHandle {
    cancel: CancellationToken,
    state: Arc<Mutex<SessionState>>,
}

impl SessionHandle {
    /// Create a handle around a stop flag
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            state: Arc::new(Mutex::new(SessionState::Idle)),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Raise the stop flag
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the stop flag is raised
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the session has reached a terminal state
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Completed | SessionState::Cancelled
        )
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }
}

// ============================================================================
// Transcript
// ============================================================================

/// Response text as completed lines plus the line in progress
#[derive(Clone, Debug)]
pub struct Transcript {
    lines: Vec<String>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self {
            lines: vec![String::new()],
        }
    }
}

impl Transcript {
    /// Append one character; `'\n'` closes the current line
    pub fn push(&mut self, character: char) {
        if character == '\n' {
            self.lines.push(String::new());
        } else if let Some(line) = self.lines.last_mut() {
            line.push(character);
        }
    }

    /// The line still being written
    #[must_use]
    pub fn partial_line(&self) -> &str {
        self.lines.last().map_or("", String::as_str)
    }

    /// Full text: lines joined by line breaks
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Whether nothing has been appended
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.len() == 1 && self.lines[0].is_empty()
    }
}

// ============================================================================
// Streaming Session
// ============================================================================

/// One request/response cycle against the engine
///
/// Generic over how the [`EngineIo`] is held; the relay passes a mutex guard
/// so the engine stays exclusively owned for the session's lifetime.
pub struct StreamingSession<G>
where
    G: DerefMut<Target = EngineIo>,
{
    io: G,
    transcript: Transcript,
    handle: SessionHandle,
    end_marker: Option<char>,
    outcome_tx: Option<oneshot::Sender<SessionOutcome>>,
    chars: u64,
    started_at: Instant,
}

impl<G> StreamingSession<G>
where
    G: DerefMut<Target = EngineIo> + Send + 'static,
{
    /// Create an idle session
    ///
    /// Returns the session and the receiver its outcome is delivered to.
    pub fn new(
        io: G,
        handle: SessionHandle,
        config: &StreamingConfig,
    ) -> (Self, oneshot::Receiver<SessionOutcome>) {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let session = Self {
            io,
            transcript: Transcript::default(),
            handle,
            end_marker: config.end_marker,
            outcome_tx: Some(outcome_tx),
            chars: 0,
            started_at: Instant::now(),
        };
        (session, outcome_rx)
    }

    /// Handle for observing or cancelling this session
    #[must_use]
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Send the prompt; exactly one write per session
    pub async fn submit(&mut self, prompt: &str) -> io::Result<()> {
        self.handle.set_state(SessionState::Submitting);
        if let Err(e) = self.io.submit(prompt).await {
            warn!(error = %e, "Failed to submit prompt to engine");
            self.finish(SessionOutcome::Degraded {
                text: String::new(),
                reason: format!("prompt submission failed: {e}"),
            });
            return Err(e);
        }
        self.handle.set_state(SessionState::Streaming);
        self.started_at = Instant::now();
        Ok(())
    }

    /// Turn the session into a lazily produced character stream
    ///
    /// Each poll reads just enough bytes to yield one character. The stream
    /// ends when the response completes, fails, or is cancelled.
    pub fn into_stream(self) -> impl Stream<Item = char> + Send + 'static {
        futures::stream::unfold(self, |mut session| async move {
            let character = session.next_char().await?;
            Some((character, session))
        })
    }

    /// Produce the next character, or `None` once the session has ended
    pub async fn next_char(&mut self) -> Option<char> {
        if self.outcome_tx.is_none() {
            return None;
        }

        let cancel = self.handle.cancel.clone();
        loop {
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                outcome = self.io.next_byte() => Some(outcome),
            };

            let Some(read) = read else {
                self.finish_cancelled();
                return None;
            };

            match read {
                ReadOutcome::Byte(byte) => {
                    let Some(character) = self.io.decoder.feed(byte) else {
                        continue;
                    };
                    if Some(character) == self.end_marker {
                        self.finish_completed(EndOfResponse::EndMarker);
                        return None;
                    }
                    self.transcript.push(character);
                    self.chars += 1;
                    return Some(character);
                }
                ReadOutcome::TimedOut => {
                    self.finish_completed(EndOfResponse::IdleTimeout);
                    return None;
                }
                ReadOutcome::Closed => {
                    self.finish_degraded("engine output closed".to_string());
                    return None;
                }
                ReadOutcome::Failed(e) => {
                    self.finish_degraded(format!("engine output failed: {e}"));
                    return None;
                }
            }
        }
    }

    /// Text accumulated so far
    #[must_use]
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }
}

impl<G> StreamingSession<G>
where
    G: DerefMut<Target = EngineIo>,
{
    fn finish_completed(&mut self, end: EndOfResponse) {
        info!(
            chars = self.chars,
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            end = ?end,
            "Response completed"
        );
        self.finish(SessionOutcome::Completed {
            text: self.transcript.text(),
            end,
        });
    }

    fn finish_degraded(&mut self, reason: String) {
        warn!(chars = self.chars, reason = %reason, "Response ended early");
        self.finish(SessionOutcome::Degraded {
            text: self.transcript.text(),
            reason,
        });
    }

    fn finish_cancelled(&mut self) {
        info!(chars = self.chars, "Response cancelled");
        self.finish(SessionOutcome::Cancelled {
            partial: self.transcript.text(),
        });
    }

    fn finish(&mut self, outcome: SessionOutcome) {
        let Some(tx) = self.outcome_tx.take() else {
            return;
        };
        let state = match outcome {
            SessionOutcome::Cancelled { .. } => SessionState::Cancelled,
            _ => SessionState::Completed,
        };
        self.handle.set_state(state);
        // Receiver may already be gone; the outcome is then simply unobserved
        let _ = tx.send(outcome);
    }
}

impl<G> Drop for StreamingSession<G>
where
    G: DerefMut<Target = EngineIo>,
{
    fn drop(&mut self) {
        if self.outcome_tx.is_some() {
            debug!(chars = self.chars, "Session dropped before completion");
            self.finish_cancelled();
        }
    }
}
