//! Generation Engine Integration
//!
//! The generation engine is an external process that turns a prompt into
//! text. The relay only sees two byte channels: an input it writes prompts to
//! and an output it reads generated bytes from.
//!
//! # Available Engines
//!
//! - **Process**: a local executable driven over stdin/stdout (default)
//! - **Scripted**: in-memory replies, for tests and offline runs
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::engine::{GenerationEngine, ProcessEngine};
//!
//! let mut engine = ProcessEngine::from_config(&config.engine, &config.generation);
//! let channels = engine.open().await?;
//! ```

mod process;
mod scripted;
mod traits;

pub use process::ProcessEngine;
pub use scripted::{ScriptedEngine, ScriptedReply};
pub use traits::{EngineChannels, EngineInput, EngineOutput, GenerationEngine};
