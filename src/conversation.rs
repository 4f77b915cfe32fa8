//! Conversation service
//!
//! One chat turn: post the user's message, start a run, drive it to
//! completion and read back the newest message.

use crate::assistant::RemoteAgent;
use crate::error::ChatError;
use crate::run_loop::RunOrchestrator;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Clone)]
pub struct ConversationService {
    remote: Arc<dyn RemoteAgent>,
    orchestrator: RunOrchestrator,
    assistant_id: String,
}

impl ConversationService {
    pub fn new(
        remote: Arc<dyn RemoteAgent>,
        orchestrator: RunOrchestrator,
        assistant_id: String,
    ) -> Self {
        Self {
            remote,
            orchestrator,
            assistant_id,
        }
    }

    /// Open a new conversation and return its id
    pub async fn start(&self) -> Result<String, ChatError> {
        let conversation_id = self.remote.create_conversation().await?;
        info!("New conversation started with ID: {}", conversation_id);
        Ok(conversation_id)
    }

    /// Run one chat turn and return the assistant's reply
    pub async fn chat(
        &self,
        conversation_id: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ChatError> {
        debug!("Received message for {}: {}", conversation_id, message);

        self.remote.post_message(conversation_id, "user", message).await?;
        let run_id = self.remote.create_run(conversation_id, &self.assistant_id).await?;
        self.orchestrator.drive(conversation_id, &run_id, cancel).await?;

        let messages = self.remote.list_messages(conversation_id).await?;
        let reply = messages.into_iter().next().ok_or(ChatError::NoReply)?;

        debug!("Assistant response: {}", reply.text);
        Ok(reply.text)
    }
}
