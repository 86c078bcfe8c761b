//! Scripted Engine
//!
//! An in-memory engine that answers each prompt line with a canned byte
//! sequence and then goes silent, the way a real engine does once it has
//! finished a response. Replies can be split into delayed chunks, and can end
//! by closing the output channel to simulate an engine crash.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;

use super::traits::{EngineChannels, GenerationEngine};

/// Capacity of the in-memory pipes
const PIPE_CAPACITY: usize = 4096;

/// One canned reply
#[derive(Clone, Debug, Default)]
pub struct ScriptedReply {
    /// Byte chunks, each written after its delay
    chunks: Vec<(Duration, Vec<u8>)>,
    /// Close the output channel after the last chunk
    close_after: bool,
}

impl ScriptedReply {
    /// Reply with `bytes` immediately
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            chunks: vec![(Duration::ZERO, bytes.into())],
            close_after: false,
        }
    }

    /// Append a chunk written after `delay`
    #[must_use]
    pub fn then(mut self, delay: Duration, bytes: impl Into<Vec<u8>>) -> Self {
        self.chunks.push((delay, bytes.into()));
        self
    }

    /// Close the output channel once the reply is written
    #[must_use]
    pub fn and_close(mut self) -> Self {
        self.close_after = true;
        self
    }
}

/// Engine that replays scripted replies
#[derive(Default)]
pub struct ScriptedEngine {
    replies: Arc<Mutex<VecDeque<ScriptedReply>>>,
    prompts: Arc<Mutex<Vec<String>>>,
    task: Option<JoinHandle<()>>,
    opened: u32,
}

impl ScriptedEngine {
    /// Create an engine with no replies queued
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine with the given replies queued in order
    pub fn with_replies(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        let engine = Self::new();
        engine.replies.lock().extend(replies);
        engine
    }

    /// Shared view of the prompts received so far
    #[must_use]
    pub fn prompts(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.prompts)
    }

    /// Queue another reply
    pub fn push_reply(&self, reply: ScriptedReply) {
        self.replies.lock().push_back(reply);
    }

    /// How many times the engine has been opened
    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.opened
    }
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn open(&mut self) -> anyhow::Result<EngineChannels> {
        self.close().await?;

        let (input, engine_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut engine_stdout, output) = tokio::io::duplex(PIPE_CAPACITY);
        let replies = Arc::clone(&self.replies);
        let prompts = Arc::clone(&self.prompts);

        self.task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(engine_stdin).lines();
            while let Ok(Some(prompt)) = lines.next_line().await {
                debug!(prompt = %prompt, "Scripted engine received prompt");
                prompts.lock().push(prompt);

                let Some(reply) = replies.lock().pop_front() else {
                    continue;
                };
                for (delay, bytes) in reply.chunks {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if engine_stdout.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                if reply.close_after {
                    return;
                }
            }
        }));
        self.opened += 1;

        Ok(EngineChannels {
            input: Box::new(input),
            output: Box::new(output),
        })
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}
