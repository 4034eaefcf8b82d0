use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;

pub const DEFAULT_PROMPT: &str = "Explain how feedback improves learning.";
const RUN_SUBCOMMAND: &str = "run";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` did not finish within {after:?}")]
    TimedOut { program: String, after: Duration },
    #[error("i/o error talking to child process: {0}")]
    Io(#[from] io::Error),
}

/// What the child left behind.
#[derive(Debug)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

/// Hands a prompt to an external model-runner CLI over stdin.
#[derive(Debug, Clone)]
pub struct PromptRunner {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl PromptRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    /// `<program> run <model> --temperature <t> --max-tokens <n>`
    pub fn from_config(cfg: &RunnerConfig) -> Self {
        let args = vec![
            RUN_SUBCOMMAND.to_string(),
            cfg.model.clone(),
            "--temperature".to_string(),
            cfg.temperature.clone(),
            "--max-tokens".to_string(),
            cfg.max_tokens.clone(),
        ];
        Self::new(cfg.program.clone(), args).with_timeout(cfg.timeout)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Full argument vector, program first.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub async fn run(&self, prompt: &str) -> Result<RunOutput, RunnerError> {
        info!(argv = ?self.argv(), "starting model runner");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let payload = prompt.as_bytes().to_vec();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok::<(), io::Error>(());
            };
            match stdin.write_all(&payload).await {
                // The child may exit without reading its input.
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };

        let exchange = async move {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed?;
            output
        };

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| RunnerError::TimedOut {
                    program: self.program.clone(),
                    after: limit,
                })??,
            None => exchange.await?,
        };

        let result = RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status,
        };

        if result.status.success() {
            debug!(stdout_bytes = output.stdout.len(), "model runner finished");
        } else {
            warn!(
                status = %result.status,
                stderr = %result.stderr.trim(),
                "model runner exited unsuccessfully"
            );
        }

        Ok(result)
    }
}
