//! Tool protocol definitions
//!
//! Defines the capability declarations advertised to the hosted assistant,
//! the request/result pair exchanged during a run, the typed dispatch
//! boundary, and the JSON line format spoken by out-of-process plugins.

use crate::error::ToolDefect;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Capability description for one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    /// Tool name (e.g., "search_real_estate_listings")
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON schema of the arguments object
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolDeclaration {
    pub fn new(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }

    /// Shape expected in the assistant's `tools` list
    pub fn to_function_tool(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// One tool call surfaced by a run that requires action
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocationRequest {
    pub call_id: String,
    pub tool_name: String,
    /// Serialized JSON arguments exactly as the assistant produced them
    pub raw_arguments: String,
}

impl ToolInvocationRequest {
    pub fn new(call_id: &str, tool_name: &str, raw_arguments: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            raw_arguments: raw_arguments.to_string(),
        }
    }
}

/// Output reported back for one call id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    #[serde(rename = "tool_call_id")]
    pub call_id: String,
    /// Serialized JSON value
    pub output: String,
}

impl ToolInvocationResult {
    /// Result carrying a value produced by a tool
    pub fn from_value(call_id: &str, value: &Value) -> Self {
        Self {
            call_id: call_id.to_string(),
            output: value.to_string(),
        }
    }

    /// Result telling the assistant the call could not be served
    pub fn error(call_id: &str, message: &str) -> Self {
        Self::from_value(call_id, &serde_json::json!({ "error": message }))
    }

    /// Whether this result carries an error payload
    pub fn is_error(&self) -> bool {
        serde_json::from_str::<Value>(&self.output)
            .map(|v| v.get("error").is_some())
            .unwrap_or(false)
    }
}

/// A locally executable tool.
///
/// Implementations report recoverable problems (bad input, upstream
/// failures) as a descriptive string value. `Err` is reserved for defects.
#[async_trait]
pub trait ToolImplementation: Send + Sync {
    async fn invoke(&self, arguments: Value) -> Result<Value, ToolDefect>;
}

/// Request line written to a plugin process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRequest {
    /// Request ID for correlation
    pub id: String,
    /// Tool name to invoke
    pub tool: String,
    /// Decoded arguments
    pub params: Value,
}

impl PluginRequest {
    pub fn new(tool: &str, params: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool: tool.to_string(),
            params,
        }
    }
}

/// Response line read from a plugin process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResponse {
    /// Request ID this responds to
    pub id: String,
    /// Whether the operation succeeded
    pub success: bool,
    /// Result data (if success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message (if failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PluginResponse {
    /// Value handed back to the assistant
    pub fn into_output(self) -> Value {
        if self.success {
            self.result.unwrap_or(Value::Null)
        } else {
            Value::String(
                self.error
                    .unwrap_or_else(|| "Plugin reported failure".to_string()),
            )
        }
    }
}

/// Manifest describing the tools of an out-of-process plugin
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub tools: Vec<ToolDeclaration>,
}
