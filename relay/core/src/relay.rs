//! Relay - Single-Engine Request Arbiter
//!
//! Owns the one generation engine and hands it to one streaming session at a
//! time. A new request preempts whatever session is running: the previous
//! session is cancelled, releases the engine, and the new one starts on a
//! drained output channel.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──► start() ──► submit() / stop() / reset_engine() ... ──► shutdown()
//!              │                                                       │
//!         open engine                                           close engine
//! ```

use std::io;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamingConfig;
use crate::engine::GenerationEngine;
use crate::streaming::{EngineIo, SessionHandle, SessionOutcome, StreamingSession};

/// Boxed character stream of one response
pub type CharStream = Pin<Box<dyn Stream<Item = char> + Send>>;

/// Errors from the relay
#[derive(Debug, Error)]
pub enum RelayError {
    /// The engine could not be (re)started
    #[error("failed to start generation engine: {0}")]
    EngineStart(String),
    /// The prompt could not be written to the engine
    #[error("failed to submit prompt to generation engine: {0}")]
    EngineSubmit(#[source] io::Error),
    /// The engine is not running
    #[error("generation engine is not running")]
    EngineUnavailable,
    /// A newer request took the engine before this one started
    #[error("request was superseded by a newer request")]
    Preempted,
}

/// An accepted request
pub struct Submission {
    /// Response characters, produced as the engine emits them
    pub stream: CharStream,
    /// Resolves once the response has ended
    pub outcome: oneshot::Receiver<SessionOutcome>,
    /// Observe or cancel the session
    pub handle: SessionHandle,
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submission")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Arbiter for the single generation engine
pub struct Relay {
    engine: AsyncMutex<Box<dyn GenerationEngine>>,
    io: Arc<AsyncMutex<EngineIo>>,
    active: Mutex<Option<SessionHandle>>,
    config: StreamingConfig,
}

impl Relay {
    /// Create a relay around `engine`; call [`Relay::start`] before submitting
    pub fn new(engine: impl GenerationEngine + 'static, config: StreamingConfig) -> Self {
        Self {
            engine: AsyncMutex::new(Box::new(engine)),
            io: Arc::new(AsyncMutex::new(EngineIo::new(&config))),
            active: Mutex::new(None),
            config,
        }
    }

    /// Streaming configuration in use
    #[must_use]
    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Open the engine
    pub async fn start(&self) -> Result<(), RelayError> {
        let mut io = self.io.lock().await;
        let mut engine = self.engine.lock().await;
        let channels = engine
            .open()
            .await
            .map_err(|e| RelayError::EngineStart(format!("{e:#}")))?;
        io.attach(channels);
        info!(engine = engine.name(), "Generation engine started");
        Ok(())
    }

    /// Whether the engine channels are attached
    pub async fn is_engine_open(&self) -> bool {
        self.io.lock().await.is_attached()
    }

    /// Submit a prompt, preempting any running session
    ///
    /// The returned stream holds the engine until it ends or is dropped.
    pub async fn submit(&self, prompt: &str) -> Result<Submission, RelayError> {
        let handle = SessionHandle::new(CancellationToken::new());
        if let Some(previous) = self.active.lock().replace(handle.clone()) {
            if !previous.is_finished() {
                info!("Preempting running session for new request");
            }
            previous.cancel();
        }

        let mut io = Arc::clone(&self.io).lock_owned().await;
        if handle.is_cancelled() {
            debug!("Request preempted while waiting for the engine");
            return Err(RelayError::Preempted);
        }
        if !io.is_attached() {
            return Err(RelayError::EngineUnavailable);
        }

        io.drain(self.config.drain_timeout()).await;

        let (mut session, outcome) = StreamingSession::new(io, handle.clone(), &self.config);
        session
            .submit(prompt)
            .await
            .map_err(RelayError::EngineSubmit)?;
        debug!(prompt_len = prompt.len(), "Prompt submitted");

        Ok(Submission {
            stream: Box::pin(session.into_stream()),
            outcome,
            handle,
        })
    }

    /// Raise the stop flag of the running session
    ///
    /// Returns whether a session was still running.
    pub fn stop(&self) -> bool {
        let Some(active) = self.active.lock().take() else {
            return false;
        };
        let running = !active.is_finished();
        active.cancel();
        if running {
            info!("Stop requested for running session");
        }
        running
    }

    /// Restart the engine process
    ///
    /// Cancels the running session first; waits for it to release the engine.
    pub async fn reset_engine(&self) -> Result<(), RelayError> {
        self.stop();
        let mut io = self.io.lock().await;
        io.detach();

        let mut engine = self.engine.lock().await;
        if let Err(e) = engine.close().await {
            warn!(error = %e, "Error closing engine during reset");
        }
        let channels = engine
            .open()
            .await
            .map_err(|e| RelayError::EngineStart(format!("{e:#}")))?;
        io.attach(channels);
        info!(engine = engine.name(), "Generation engine reset");
        Ok(())
    }

    /// Cancel any running session and close the engine
    pub async fn shutdown(&self) {
        self.stop();
        let mut io = self.io.lock().await;
        io.detach();
        let mut engine = self.engine.lock().await;
        if let Err(e) = engine.close().await {
            warn!(error = %e, "Error closing engine during shutdown");
        }
        info!("Relay shut down");
    }
}
