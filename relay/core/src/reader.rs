//! Idle-Timeout Byte Reader
//!
//! Reads the generation engine's output one byte at a time, bounded by a
//! timeout. The engine never says "I am done": the only end-of-response signal
//! available is silence. The reader therefore runs in two phases:
//!
//! - **Startup**: until the first byte of a response arrives, waits up to
//!   `initial_timeout` (model warmup and prompt evaluation can be slow).
//! - **Flowing**: once bytes are arriving, a gap longer than `idle_timeout`
//!   is taken to mean the response is finished.
//!
//! This is a heuristic, not a protocol. A model that pauses for longer than
//! the idle timeout mid-answer will have its response cut short. Engines that
//! emit an explicit end marker should be configured to use it (see
//! [`StreamingConfig::end_marker`](crate::config::StreamingConfig)).

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Result of waiting for one byte
#[derive(Debug)]
pub enum ReadOutcome {
    /// A byte arrived within the timeout
    Byte(u8),
    /// Nothing arrived within the timeout
    TimedOut,
    /// The output channel reached end-of-file
    Closed,
    /// The output channel failed
    Failed(io::Error),
}

/// Byte reader with a startup timeout and a shorter idle timeout
pub struct IdleTimeoutReader<R> {
    inner: R,
    initial_timeout: Duration,
    idle_timeout: Duration,
    /// Whether a byte has been read since the last `arm()`
    flowing: bool,
}

impl<R: AsyncRead + Unpin> IdleTimeoutReader<R> {
    /// Wrap a byte source
    pub fn new(inner: R, initial_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            inner,
            initial_timeout,
            idle_timeout,
            flowing: false,
        }
    }

    /// Start a new response: the next wait uses the initial timeout again
    pub fn arm(&mut self) {
        self.flowing = false;
    }

    /// Whether the current response has started flowing
    #[must_use]
    pub fn is_flowing(&self) -> bool {
        self.flowing
    }

    /// Timeout that the next `next_byte` call will use
    #[must_use]
    pub fn current_timeout(&self) -> Duration {
        if self.flowing {
            self.idle_timeout
        } else {
            self.initial_timeout
        }
    }

    /// Wait for the next byte using the phase timeout
    pub async fn next_byte(&mut self) -> ReadOutcome {
        let timeout = self.current_timeout();
        let outcome = self.next_byte_within(timeout).await;
        if matches!(outcome, ReadOutcome::Byte(_)) {
            self.flowing = true;
        }
        outcome
    }

    /// Wait up to `timeout` for the next byte
    ///
    /// Cancel-safe: `AsyncRead::read` never consumes a byte it does not
    /// return, so dropping this future leaves the stream position intact.
    pub async fn next_byte_within(&mut self, timeout: Duration) -> ReadOutcome {
        let mut buf = [0u8; 1];
        match tokio::time::timeout(timeout, self.inner.read(&mut buf)).await {
            Ok(Ok(0)) => ReadOutcome::Closed,
            Ok(Ok(_)) => ReadOutcome::Byte(buf[0]),
            Ok(Err(e)) => ReadOutcome::Failed(e),
            Err(_elapsed) => ReadOutcome::TimedOut,
        }
    }

    /// Consume the reader, returning the wrapped source
    pub fn into_inner(self) -> R {
        self.inner
    }
}
