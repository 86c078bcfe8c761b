//! Relay Core - Streaming Chat Relay for a Local Generation Engine
//!
//! This crate relays chat messages to a local text-generation process that
//! speaks over its standard input and output, streams the answer back one
//! character at a time, and records every exchange in a SQLite store. It has
//! no HTTP dependencies; the `relay-daemon` binary puts a web server in front.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          relay-daemon                             │
//! │          axum routes ──► ChatService ◄── ChatContext              │
//! └───────────────────────────────┼──────────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                          RELAY CORE                               │
//! │  ┌───────────────────┐   ┌────┴──────────────────────────────┐   │
//! │  │ ConversationStore │   │              Relay                 │   │
//! │  │     (SQLite)      │   │  one engine, newest request wins   │   │
//! │  └───────────────────┘   │  ┌──────────────────────────────┐  │   │
//! │                          │  │ StreamingSession             │  │   │
//! │                          │  │  IdleTimeoutReader ─► bytes  │  │   │
//! │                          │  │  ByteDecoder       ─► chars  │  │   │
//! │                          │  └──────────────────────────────┘  │   │
//! │                          └────────────────┬───────────────────┘   │
//! └───────────────────────────────────────────┼──────────────────────┘
//!                                             │ stdin / stdout
//!                                   ┌─────────┴─────────┐
//!                                   │ GenerationEngine  │
//!                                   │ (ProcessEngine)   │
//!                                   └───────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ChatService`]: records messages and relays them
//! - [`Relay`]: arbitrates the single engine between requests
//! - [`StreamingSession`]: one prompt, one character stream, one outcome
//! - [`ConversationStore`]: discussions and messages in SQLite
//! - [`GenerationEngine`]: how an engine process is opened and closed
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use relay_core::{ChatService, ConversationStore, ProcessEngine, Relay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RelayConfig::default();
//!     let engine = ProcessEngine::from_config(&config.engine, &config.generation);
//!     let relay = Arc::new(Relay::new(engine, config.streaming.clone()));
//!     relay.start().await?;
//!
//!     let store = ConversationStore::open(&config.store.db_path)?;
//!     let chat = ChatService::new(store, relay);
//!
//!     let mut reply = chat.send_message("Hello!").await?;
//!     while let Some(c) = reply.stream.next().await {
//!         print!("{c}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`chat`]: discussion selection and response persistence
//! - [`config`]: layered configuration (defaults, TOML, environment, CLI)
//! - [`decoder`]: incremental UTF-8 decoding
//! - [`engine`]: engine abstraction, process and scripted implementations
//! - [`reader`]: byte reads bounded by startup and idle timeouts
//! - [`relay`]: single-engine arbitration and preemption
//! - [`store`]: SQLite conversation store
//! - [`streaming`]: per-request streaming sessions

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod chat;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod reader;
pub mod relay;
pub mod store;
pub mod streaming;

pub use chat::{ChatContext, ChatError, ChatReply, ChatService, INTERRUPTED_MARKER};
pub use config::{
    load_config, load_config_from_path, ConfigError, ConfigOverrides, ConfigSource,
    EngineConfig, GenerationParams, RelayConfig, ServerConfig, StoreConfig, StreamingConfig,
};
pub use decoder::ByteDecoder;
pub use engine::{
    EngineChannels, GenerationEngine, ProcessEngine, ScriptedEngine, ScriptedReply,
};
pub use reader::{IdleTimeoutReader, ReadOutcome};
pub use relay::{CharStream, Relay, RelayError, Submission};
pub use store::{
    ConversationStore, Discussion, DiscussionId, ExportedDiscussion, ExportedMessage, Message,
    Sender, StoreError,
};
pub use streaming::{
    EndOfResponse, EngineIo, SessionHandle, SessionOutcome, SessionState, StreamingSession,
};
