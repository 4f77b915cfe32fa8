//! Tool call executor
//!
//! Turns one tool call requested by a run into exactly one result. Bad
//! arguments and unknown tools become error payloads so the run always
//! gets an answer; only a tool defect escapes as `Err`.

use super::protocol::{ToolInvocationRequest, ToolInvocationResult};
use super::registry::ToolRegistry;
use crate::error::ToolDefect;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Executes tool calls against a shared registry
#[derive(Clone)]
pub struct ToolCallExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolCallExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Execute one tool call
    pub async fn execute(
        &self,
        request: &ToolInvocationRequest,
    ) -> Result<ToolInvocationResult, ToolDefect> {
        let arguments = match decode_arguments(&request.raw_arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                error!(
                    "Invalid arguments for '{}' ({}): {}. Input: {}",
                    request.tool_name, request.call_id, e, request.raw_arguments
                );
                return Ok(ToolInvocationResult::error(
                    &request.call_id,
                    &format!("invalid arguments: {}", e),
                ));
            }
        };

        let tool = match self.registry.get(&request.tool_name) {
            Some(tool) => tool,
            None => {
                warn!("Tool '{}' not found in registry", request.tool_name);
                return Ok(ToolInvocationResult::error(
                    &request.call_id,
                    &format!("tool not found: {}", request.tool_name),
                ));
            }
        };

        debug!("Invoking '{}' for call {}", request.tool_name, request.call_id);
        let output = tool.invoke(arguments).await.map_err(|defect| {
            error!(
                "Tool '{}' raised during call {}: {}",
                request.tool_name, request.call_id, defect
            );
            defect
        })?;

        Ok(ToolInvocationResult::from_value(&request.call_id, &output))
    }
}

/// Arguments must decode to a JSON object; an empty payload means no arguments.
fn decode_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    if !value.is_object() {
        return Err(format!("expected a JSON object, got {}", type_name(&value)));
    }
    Ok(value)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
