//! Test doubles shared by unit tests

use crate::assistant::{ConversationMessage, RemoteAgent, RunSnapshot};
use crate::error::{RemoteError, ToolDefect};
use crate::plugins::{
    CollisionPolicy, PluginUnit, ToolDeclaration, ToolImplementation, ToolInvocationRequest,
    ToolInvocationResult, ToolRegistry,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Calls observed by [`ScriptedRemote`], in order
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    CreateConversation,
    PostMessage { role: String, text: String },
    CreateRun { agent_id: String },
    Poll,
    Submit(Vec<ToolInvocationResult>),
    ListMessages,
}

/// Remote agent replaying a fixed sequence of run snapshots.
///
/// Once the script is exhausted every poll reports `completed`.
#[derive(Default)]
pub struct ScriptedRemote {
    script: Mutex<VecDeque<Result<RunSnapshot, RemoteError>>>,
    calls: Mutex<Vec<RemoteCall>>,
    reply: Mutex<Option<String>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, snapshot: RunSnapshot) -> Self {
        self.script.lock().unwrap().push_back(Ok(snapshot));
        self
    }

    pub fn then_status(self, status: &str) -> Self {
        self.then(RunSnapshot::new(status))
    }

    pub fn then_error(self, error: RemoteError) -> Self {
        self.script.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn with_reply(self, text: &str) -> Self {
        *self.reply.lock().unwrap() = Some(text.to_string());
        self
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn submissions(&self) -> Vec<Vec<ToolInvocationResult>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RemoteCall::Submit(outputs) => Some(outputs),
                _ => None,
            })
            .collect()
    }

    pub fn polls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, RemoteCall::Poll))
            .count()
    }

    fn record(&self, call: RemoteCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RemoteAgent for ScriptedRemote {
    async fn create_conversation(&self) -> Result<String, RemoteError> {
        self.record(RemoteCall::CreateConversation);
        Ok("thread_test".to_string())
    }

    async fn post_message(
        &self,
        _conversation_id: &str,
        role: &str,
        text: &str,
    ) -> Result<(), RemoteError> {
        self.record(RemoteCall::PostMessage {
            role: role.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn create_run(&self, _conversation_id: &str, agent_id: &str) -> Result<String, RemoteError> {
        self.record(RemoteCall::CreateRun {
            agent_id: agent_id.to_string(),
        });
        Ok("run_test".to_string())
    }

    async fn get_run_status(
        &self,
        _conversation_id: &str,
        _run_id: &str,
    ) -> Result<RunSnapshot, RemoteError> {
        self.record(RemoteCall::Poll);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(RunSnapshot::new("completed")))
    }

    async fn submit_tool_outputs(
        &self,
        _conversation_id: &str,
        _run_id: &str,
        outputs: &[ToolInvocationResult],
    ) -> Result<(), RemoteError> {
        self.record(RemoteCall::Submit(outputs.to_vec()));
        Ok(())
    }

    async fn list_messages(
        &self,
        _conversation_id: &str,
    ) -> Result<Vec<ConversationMessage>, RemoteError> {
        self.record(RemoteCall::ListMessages);
        Ok(self
            .reply
            .lock()
            .unwrap()
            .iter()
            .map(|text| ConversationMessage {
                role: "assistant".to_string(),
                text: text.clone(),
            })
            .collect())
    }
}

/// Tool that echoes its arguments and counts invocations
pub struct CountingEcho {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolImplementation for CountingEcho {
    async fn invoke(&self, arguments: Value) -> Result<Value, ToolDefect> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "echo": arguments }))
    }
}

/// Tool that always raises
pub struct Exploding;

#[async_trait]
impl ToolImplementation for Exploding {
    async fn invoke(&self, _arguments: Value) -> Result<Value, ToolDefect> {
        Err(ToolDefect::new("explode", "unexpected upstream shape"))
    }
}

/// Registry with `echo` (counting) and `explode`, plus the echo counter
pub fn test_registry() -> (Arc<ToolRegistry>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let units = vec![
        PluginUnit::single(
            ToolDeclaration::new("echo", "Echo arguments", json!({"type": "object"})),
            Arc::new(CountingEcho {
                calls: calls.clone(),
            }),
        ),
        PluginUnit::single(
            ToolDeclaration::new("explode", "Always fails", json!({"type": "object"})),
            Arc::new(Exploding),
        ),
    ];
    let registry = ToolRegistry::load(units, CollisionPolicy::Reject).unwrap();
    (Arc::new(registry), calls)
}

/// Snapshot asking for the given `(call_id, tool, raw_arguments)` calls
pub fn requires_action(calls: &[(&str, &str, &str)]) -> RunSnapshot {
    RunSnapshot::new("requires_action").with_tool_calls(
        calls
            .iter()
            .map(|(id, tool, args)| ToolInvocationRequest::new(id, tool, args))
            .collect(),
    )
}
