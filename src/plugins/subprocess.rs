//! Out-of-process tools
//!
//! Spawns a plugin executable per call and speaks one JSON line each way
//! over stdin/stdout.

use super::protocol::{PluginRequest, PluginResponse, ToolImplementation};
use crate::error::ToolDefect;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// A tool served by an external executable
#[derive(Debug, Clone)]
pub struct SubprocessTool {
    plugin: String,
    tool: String,
    path: PathBuf,
    timeout: Duration,
}

impl SubprocessTool {
    pub fn new(plugin: &str, tool: &str, path: PathBuf, timeout: Duration) -> Self {
        Self {
            plugin: plugin.to_string(),
            tool: tool.to_string(),
            path,
            timeout,
        }
    }

    fn defect(&self, message: String) -> ToolDefect {
        ToolDefect::new(&self.tool, format!("plugin '{}': {}", self.plugin, message))
    }

    /// Read lines until the response matching `request_id` shows up
    async fn read_response(
        &self,
        stdout: tokio::process::ChildStdout,
        request_id: &str,
    ) -> Result<Option<PluginResponse>, ToolDefect> {
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| self.defect(format!("failed to read plugin output: {}", e)))?
        {
            // Plugins may log to stdout; only a matching response counts
            if let Ok(response) = serde_json::from_str::<PluginResponse>(&line) {
                if response.id == request_id {
                    return Ok(Some(response));
                }
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl ToolImplementation for SubprocessTool {
    async fn invoke(&self, arguments: Value) -> Result<Value, ToolDefect> {
        let request = PluginRequest::new(&self.tool, arguments);
        debug!("Executing plugin '{}' for tool '{}'", self.plugin, self.tool);

        let mut child = Command::new(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.defect(format!("failed to spawn: {}", e)))?;

        let request_json = serde_json::to_string(&request)
            .map_err(|e| self.defect(format!("failed to serialize request: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(format!("{}\n", request_json).as_bytes())
                .await
                .map_err(|e| self.defect(format!("failed to write to plugin: {}", e)))?;
            // dropping stdin closes the pipe so line-oriented plugins see EOF
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.defect("failed to capture plugin stdout".to_string()))?;

        let outcome = tokio::time::timeout(self.timeout, self.read_response(stdout, &request.id)).await;
        let _ = child.kill().await;

        match outcome {
            Ok(Ok(Some(response))) => Ok(response.into_output()),
            Ok(Ok(None)) => Ok(Value::String(format!(
                "Plugin '{}' closed without responding",
                self.plugin
            ))),
            Ok(Err(defect)) => Err(defect),
            Err(_) => {
                warn!("Plugin '{}' timed out after {:?}", self.plugin, self.timeout);
                Ok(Value::String(format!(
                    "Plugin '{}' timed out after {} seconds",
                    self.plugin,
                    self.timeout.as_secs()
                )))
            }
        }
    }
}
