//! Claude CLI executor.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::executor::{ExecuteResult, Executor, ExecutorError};
use crate::config::ExecutorConfig;

/// JSON emitted by `claude --output-format json`.
#[derive(Debug, Deserialize)]
struct ClaudeOutput {
    session_id: String,
    result: String,
    #[serde(default)]
    total_cost_usd: f64,
}

pub struct ClaudeExecutor {
    cli_path: String,
    max_turns: u32,
    timeout: Option<Duration>,
}

impl ClaudeExecutor {
    pub fn new() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            cli_path: config.cli_path.clone(),
            max_turns: config.max_turns,
            timeout: config.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn with_cli_path(mut self, cli_path: impl Into<String>) -> Self {
        self.cli_path = cli_path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build_args(&self, session_id: &str, text: &str, is_new: bool) -> Vec<String> {
        let mut args = Vec::new();
        if !is_new {
            args.push("--resume".to_string());
            args.push(session_id.to_string());
        }
        args.push("-p".to_string());
        args.push(text.to_string());

        args.push("--output-format".to_string());
        args.push("json".to_string());
        args.push("--max-turns".to_string());
        args.push(self.max_turns.to_string());
        args
    }

    pub fn parse_result(&self, output: &[u8]) -> Result<ExecuteResult, ExecutorError> {
        let parsed: ClaudeOutput = serde_json::from_slice(output).map_err(ExecutorError::Parse)?;
        Ok(ExecuteResult {
            session_id: parsed.session_id,
            response: parsed.result,
            cost: parsed.total_cost_usd,
        })
    }

    async fn run(&self, args: Vec<String>) -> Result<ExecuteResult, ExecutorError> {
        let mut cmd = Command::new(&self.cli_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(ExecutorError::Spawn)?;
        let output = child.wait_with_output().await.map_err(ExecutorError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError::Failed {
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        self.parse_result(&output.stdout)
    }
}

impl Default for ClaudeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ClaudeExecutor {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        text: &str,
        is_new: bool,
    ) -> Result<ExecuteResult, ExecutorError> {
        let args = self.build_args(session_id, text, is_new);
        tracing::debug!(cli = %self.cli_path, is_new, "Running collaborator");

        // Dropping the in-flight future drops the child, which kills it.
        let run = self.run(args);
        match self.timeout {
            Some(limit) => tokio::select! {
                _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
                res = tokio::time::timeout(limit, run) => {
                    res.unwrap_or(Err(ExecutorError::Timeout(limit)))
                }
            },
            None => tokio::select! {
                _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
                res = run => res,
            },
        }
    }
}
