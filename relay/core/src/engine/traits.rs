//! Generation Engine Traits
//!
//! Trait definitions for generation engines. This abstraction allows the
//! relay to drive a local subprocess, a scripted stand-in, or anything else
//! that exposes byte-oriented input and output channels, without changing
//! the streaming pipeline.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Engine input channel (prompts are written here)
pub type EngineInput = Box<dyn AsyncWrite + Send + Unpin>;

/// Engine output channel (generated bytes are read from here)
pub type EngineOutput = Box<dyn AsyncRead + Send + Unpin>;

/// The byte channels of an open engine
pub struct EngineChannels {
    /// Where prompts go
    pub input: EngineInput,
    /// Where generated bytes come from
    pub output: EngineOutput,
}

impl std::fmt::Debug for EngineChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineChannels").finish_non_exhaustive()
    }
}

/// Generation engine lifecycle
///
/// Implement this trait to plug a different text generator into the relay.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Engine name for logs (e.g., "process", "scripted")
    fn name(&self) -> &str;

    /// Start the engine and hand back its byte channels
    ///
    /// Calling `open` on an engine that is already open restarts it.
    async fn open(&mut self) -> anyhow::Result<EngineChannels>;

    /// Stop the engine. Closing an engine that is not open is a no-op.
    async fn close(&mut self) -> anyhow::Result<()>;
}
