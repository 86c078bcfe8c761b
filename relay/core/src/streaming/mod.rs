//! Response Streaming
//!
//! Turns the engine's raw output into a per-request character stream with an
//! explicit completion outcome.

pub mod session;

pub use session::{
    EndOfResponse, EngineIo, SessionHandle, SessionOutcome, SessionState, StreamingSession,
    Transcript,
};
