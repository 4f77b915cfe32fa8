//! Hosted assistant client
//!
//! The remote side of a conversation: threads, messages and runs live on
//! the hosted assistants service. [`RemoteAgent`] is the narrow set of
//! operations the rest of the crate needs; [`AssistantsClient`] implements
//! it over HTTP.

use crate::config::AssistantConfig;
use crate::error::{AppError, ConfigError, RemoteError};
use crate::plugins::{ToolInvocationRequest, ToolInvocationResult, ToolRegistry};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result type for remote operations
type Result<T> = std::result::Result<T, RemoteError>;

/// Run state as observed by the orchestration loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Queued or still working
    Pending,
    /// Waiting for tool outputs
    RequiresAction,
    Completed,
    Failed,
    Expired,
    Cancelled,
    /// Ended before producing a full reply
    Incomplete,
}

impl RunStatus {
    /// Map the service's status string
    pub fn from_api(status: &str) -> Self {
        match status {
            "queued" | "in_progress" | "cancelling" => RunStatus::Pending,
            "requires_action" => RunStatus::RequiresAction,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "expired" => RunStatus::Expired,
            "cancelled" => RunStatus::Cancelled,
            "incomplete" => RunStatus::Incomplete,
            other => {
                warn!("Unknown run status '{}', treating as pending", other);
                RunStatus::Pending
            }
        }
    }

    /// Whether the run ended without completing
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            RunStatus::Failed | RunStatus::Expired | RunStatus::Cancelled | RunStatus::Incomplete
        )
    }
}

/// One poll of a run
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub status: RunStatus,
    /// Status string as reported
    pub raw_status: String,
    /// Outstanding tool calls when `status` is `RequiresAction`
    pub tool_calls: Vec<ToolInvocationRequest>,
    /// Failure detail reported by the service
    pub last_error: Option<String>,
}

impl RunSnapshot {
    pub fn new(status: &str) -> Self {
        Self {
            status: RunStatus::from_api(status),
            raw_status: status.to_string(),
            tool_calls: Vec::new(),
            last_error: None,
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolInvocationRequest>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationMessage {
    pub role: String,
    /// Concatenated text content
    pub text: String,
}

/// Operations consumed from the hosted assistant service
#[async_trait]
pub trait RemoteAgent: Send + Sync {
    async fn create_conversation(&self) -> Result<String>;

    async fn post_message(&self, conversation_id: &str, role: &str, text: &str) -> Result<()>;

    async fn create_run(&self, conversation_id: &str, agent_id: &str) -> Result<String>;

    async fn get_run_status(&self, conversation_id: &str, run_id: &str) -> Result<RunSnapshot>;

    async fn submit_tool_outputs(
        &self,
        conversation_id: &str,
        run_id: &str,
        outputs: &[ToolInvocationResult],
    ) -> Result<()>;

    /// Messages, most recent first
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>>;
}

// Wire types

#[derive(Debug, Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    status: String,
    #[serde(default)]
    required_action: Option<RequiredAction>,
    #[serde(default)]
    last_error: Option<RunErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RequiredAction {
    submit_tool_outputs: SubmitToolOutputs,
}

#[derive(Debug, Deserialize)]
struct SubmitToolOutputs {
    tool_calls: Vec<ToolCallObject>,
}

#[derive(Debug, Deserialize)]
struct ToolCallObject {
    id: String,
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct RunErrorObject {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<MessageObject>,
}

#[derive(Debug, Deserialize)]
struct MessageObject {
    role: String,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<TextContent>,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AssistantIdFile {
    assistant_id: String,
}

impl From<RunObject> for RunSnapshot {
    fn from(run: RunObject) -> Self {
        debug!("Run {} is {}", run.id, run.status);
        let tool_calls = run
            .required_action
            .map(|action| {
                action
                    .submit_tool_outputs
                    .tool_calls
                    .into_iter()
                    .map(|call| ToolInvocationRequest {
                        call_id: call.id,
                        tool_name: call.function.name,
                        raw_arguments: call.function.arguments,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let last_error = run.last_error.map(|e| match (e.code, e.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (None, Some(message)) => message,
            (Some(code), None) => code,
            (None, None) => "unknown error".to_string(),
        });

        RunSnapshot {
            last_error,
            ..RunSnapshot::new(&run.status).with_tool_calls(tool_calls)
        }
    }
}

impl From<MessageObject> for ConversationMessage {
    fn from(message: MessageObject) -> Self {
        let text = message
            .content
            .into_iter()
            .filter(|part| part.kind == "text")
            .filter_map(|part| part.text.map(|t| t.value))
            .collect::<Vec<_>>()
            .join("\n");
        ConversationMessage {
            role: message.role,
            text,
        }
    }
}

/// HTTP client for the hosted assistants API
#[derive(Clone)]
pub struct AssistantsClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl AssistantsClient {
    pub fn new(config: &AssistantConfig, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.endpoint, path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        read_json(response).await
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        read_json(response).await
    }

    /// Upload file contents for retrieval, returning the file id
    pub async fn upload_file(&self, file_name: &str, bytes: Vec<u8>) -> Result<String> {
        let file_name = file_name.to_string();
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", reqwest::multipart::Part::bytes(bytes).file_name(file_name));

        let response = self
            .request(reqwest::Method::POST, "/files")
            .multipart(form)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        let file: IdObject = read_json(response).await?;
        Ok(file.id)
    }

    /// Create a vector store over uploaded files, returning its id
    pub async fn create_vector_store(&self, name: &str, file_ids: &[String]) -> Result<String> {
        let store: IdObject = self
            .post_json("/vector_stores", &json!({ "name": name, "file_ids": file_ids }))
            .await?;
        Ok(store.id)
    }

    /// Create an assistant, returning its id
    pub async fn create_assistant(&self, body: &Value) -> Result<String> {
        let assistant: IdObject = self.post_json("/assistants", body).await?;
        Ok(assistant.id)
    }
}

/// Turn a response into `T`, mapping non-success statuses to API errors
async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(RemoteError::Api {
            status: status.as_u16(),
            message,
        });
    }

    response
        .json()
        .await
        .map_err(|e| RemoteError::Parse(e.to_string()))
}

#[async_trait]
impl RemoteAgent for AssistantsClient {
    async fn create_conversation(&self) -> Result<String> {
        let thread: IdObject = self.post_json("/threads", &json!({})).await?;
        Ok(thread.id)
    }

    async fn post_message(&self, conversation_id: &str, role: &str, text: &str) -> Result<()> {
        let _: IdObject = self
            .post_json(
                &format!("/threads/{}/messages", conversation_id),
                &json!({ "role": role, "content": text }),
            )
            .await?;
        Ok(())
    }

    async fn create_run(&self, conversation_id: &str, agent_id: &str) -> Result<String> {
        let run: IdObject = self
            .post_json(
                &format!("/threads/{}/runs", conversation_id),
                &json!({ "assistant_id": agent_id }),
            )
            .await?;
        Ok(run.id)
    }

    async fn get_run_status(&self, conversation_id: &str, run_id: &str) -> Result<RunSnapshot> {
        let run: RunObject = self
            .get_json(&format!("/threads/{}/runs/{}", conversation_id, run_id))
            .await?;
        Ok(run.into())
    }

    async fn submit_tool_outputs(
        &self,
        conversation_id: &str,
        run_id: &str,
        outputs: &[ToolInvocationResult],
    ) -> Result<()> {
        let _: IdObject = self
            .post_json(
                &format!(
                    "/threads/{}/runs/{}/submit_tool_outputs",
                    conversation_id, run_id
                ),
                &json!({ "tool_outputs": outputs }),
            )
            .await?;
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>> {
        let list: MessageList = self
            .get_json(&format!("/threads/{}/messages?order=desc", conversation_id))
            .await?;
        Ok(list.data.into_iter().map(Into::into).collect())
    }
}

/// Resolve the assistant id, creating and caching an assistant if needed
pub async fn provision_assistant(
    client: &AssistantsClient,
    registry: &ToolRegistry,
    config: &AssistantConfig,
) -> std::result::Result<String, AppError> {
    if let Some(id) = &config.id {
        info!("Using configured assistant {}", id);
        return Ok(id.clone());
    }

    if config.id_file.exists() {
        let content = std::fs::read_to_string(&config.id_file)?;
        let cached: AssistantIdFile = serde_json::from_str(&content).map_err(|e| {
            ConfigError::Parse(format!("{}: {}", config.id_file.display(), e))
        })?;
        info!("Loaded existing assistant {}", cached.assistant_id);
        return Ok(cached.assistant_id);
    }

    let file_ids = upload_resources(client, &config.resources_dir).await?;

    let mut tools = vec![json!({ "type": "file_search" })];
    tools.extend(registry.declarations().iter().map(|d| d.to_function_tool()));

    let mut body = json!({
        "name": config.name,
        "model": config.model,
        "instructions": config.instructions,
        "tools": tools,
    });
    if !file_ids.is_empty() {
        let store_id = client
            .create_vector_store(&format!("{} resources", config.name), &file_ids)
            .await?;
        body["tool_resources"] = json!({ "file_search": { "vector_store_ids": [store_id] } });
    }

    let assistant_id = client.create_assistant(&body).await?;
    info!("Created assistant {}", assistant_id);

    let cached = AssistantIdFile {
        assistant_id: assistant_id.clone(),
    };
    let serialized = serde_json::to_string(&cached)
        .map_err(|e| ConfigError::Invalid(format!("assistant id: {}", e)))?;
    std::fs::write(&config.id_file, serialized)?;
    debug!("Saved assistant id to {:?}", config.id_file);

    Ok(assistant_id)
}

/// Upload every regular file in the resources directory
async fn upload_resources(
    client: &AssistantsClient,
    dir: &Path,
) -> std::result::Result<Vec<String>, AppError> {
    let mut file_ids = Vec::new();
    if !dir.is_dir() {
        return Ok(file_ids);
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        let bytes = tokio::fs::read(&path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "resource".to_string());

        let id = client.upload_file(&file_name, bytes).await?;
        debug!("Uploaded {:?} as {}", path, id);
        file_ids.push(id);
    }
    Ok(file_ids)
}
