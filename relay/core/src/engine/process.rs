//! Subprocess Engine
//!
//! Runs the generation engine as a child process. Prompts are written to its
//! stdin, generated text is read from its stdout. Stderr is inherited so the
//! engine's own diagnostics land in the relay's terminal.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::traits::{EngineChannels, GenerationEngine};
use crate::config::{EngineConfig, GenerationParams};

/// Generation engine backed by a local executable
pub struct ProcessEngine {
    /// Executable to launch
    command: PathBuf,
    /// Full argument list
    args: Vec<String>,
    /// Running child, if open
    child: Option<Child>,
}

impl ProcessEngine {
    /// Create an engine for `command` with an explicit argument list
    pub fn new(command: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            child: None,
        }
    }

    /// Create from configuration, appending the generation flags
    #[must_use]
    pub fn from_config(engine: &EngineConfig, generation: &GenerationParams) -> Self {
        let mut args = engine.args.clone();
        args.extend(generation.to_args());
        Self::new(engine.command.clone(), args)
    }

    /// Argument list the child is launched with
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// OS process id of the running child
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

#[async_trait]
impl GenerationEngine for ProcessEngine {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn open(&mut self) -> anyhow::Result<EngineChannels> {
        self.close().await?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn engine {:?}", self.command))?;

        let stdin = child
            .stdin
            .take()
            .context("engine stdin was not captured")?;
        let stdout = child
            .stdout
            .take()
            .context("engine stdout was not captured")?;

        info!(
            command = ?self.command,
            pid = ?child.id(),
            "Generation engine started"
        );
        self.child = Some(child);

        Ok(EngineChannels {
            input: Box::new(stdin),
            output: Box::new(stdout),
        })
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Err(e) = child.start_kill() {
            // Already exited on its own
            debug!(error = %e, "Engine kill failed");
        }
        match child.wait().await {
            Ok(status) => info!(%status, "Generation engine stopped"),
            Err(e) => warn!(error = %e, "Failed to reap engine process"),
        }
        Ok(())
    }
}
