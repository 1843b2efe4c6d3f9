// ABOUTME: Command producer - spawns an external program to draft each message.
// ABOUTME: Writes the DraftRequest as JSON to stdin and takes trimmed stdout as the draft.

use crate::traits::{ContentProducer, DraftRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as ProcessCommand;

/// Configuration for the command producer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Program to run
    pub binary: String,
    /// Extra arguments; the rendered prompt is appended as the last one
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the program
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

pub struct CommandProducer {
    config: CommandConfig,
}

impl CommandProducer {
    pub fn new(config: CommandConfig) -> Result<Self> {
        if config.binary.trim().is_empty() {
            anyhow::bail!("command producer requires a binary");
        }
        Ok(Self { config })
    }

    /// Factory function for the registry
    pub fn factory() -> crate::registry::ProducerFactory {
        Box::new(|options| {
            let cfg: CommandConfig = serde_json::from_value(options.clone())
                .context("command producer options need at least `binary`")?;
            Ok(Arc::new(CommandProducer::new(cfg)?))
        })
    }

    async fn run(&self, request: &DraftRequest) -> Result<String> {
        let prompt = request.prompt();
        let payload = serde_json::to_vec(request).context("Failed to encode draft request")?;

        tracing::debug!(
            binary = %self.config.binary,
            agent_id = %request.agent_id,
            kind = request.kind.as_str(),
            "Spawning producer command"
        );

        let mut command = ProcessCommand::new(&self.config.binary);
        command
            .args(&self.config.args)
            .arg(&prompt)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.config.binary))?;

        let mut stdin = child.stdin.take().context("Failed to capture stdin")?;
        // A program that ignores stdin may close it early; that is not a failure
        if let Err(e) = stdin.write_all(&payload).await {
            tracing::debug!(error = %e, "Producer command closed stdin early");
        }
        drop(stdin);

        let mut stdout = child.stdout.take().context("Failed to capture stdout")?;
        let mut stderr = child.stderr.take().context("Failed to capture stderr")?;
        let mut out = String::new();
        let mut err = String::new();
        let (read_out, read_err) = tokio::join!(
            stdout.read_to_string(&mut out),
            stderr.read_to_string(&mut err)
        );
        read_out.context("Failed to read producer stdout")?;
        read_err.context("Failed to read producer stderr")?;

        let status = child.wait().await?;
        if !err.trim().is_empty() {
            tracing::warn!(stderr = %err.trim(), "Producer command stderr");
        }
        if !status.success() {
            anyhow::bail!("Producer command exited with status: {:?}", status.code());
        }

        let draft = out.trim().to_string();
        if draft.is_empty() {
            anyhow::bail!("Producer command returned an empty draft");
        }
        Ok(draft)
    }
}

#[async_trait]
impl ContentProducer for CommandProducer {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn draft(&self, request: &DraftRequest) -> Result<String> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        tokio::time::timeout(timeout, self.run(request))
            .await
            .with_context(|| format!("Producer command timed out after {:?}", timeout))?
    }
}
