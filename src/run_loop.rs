//! Run orchestration loop
//!
//! Drives one run to a terminal state. Tool calls a run asks for are
//! executed locally and their outputs submitted together.

use crate::assistant::{RemoteAgent, RunSnapshot, RunStatus};
use crate::audit::AuditLog;
use crate::config::RunConfig;
use crate::error::RunError;
use crate::plugins::{ToolCallExecutor, ToolInvocationRequest, ToolInvocationResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Polling cadence and bounds
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub poll_interval: Duration,
    pub max_polls: Option<u32>,
    pub max_duration: Option<Duration>,
    pub transient_retries: u32,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from(&RunConfig::default())
    }
}

impl From<&RunConfig> for RunSettings {
    fn from(config: &RunConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_polls: config.max_polls(),
            max_duration: config.max_duration(),
            transient_retries: config.transient_retries,
        }
    }
}

/// Summary of a completed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub polls: u32,
    pub tool_calls: usize,
}

/// Drives runs against a remote agent. Cheap to clone; one instance serves
/// every concurrent conversation.
#[derive(Clone)]
pub struct RunOrchestrator {
    remote: Arc<dyn RemoteAgent>,
    executor: ToolCallExecutor,
    settings: RunSettings,
    audit: Option<Arc<AuditLog>>,
}

impl RunOrchestrator {
    pub fn new(
        remote: Arc<dyn RemoteAgent>,
        executor: ToolCallExecutor,
        settings: RunSettings,
    ) -> Self {
        Self {
            remote,
            executor,
            settings,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Option<Arc<AuditLog>>) -> Self {
        self.audit = audit;
        self
    }

    /// Poll the run until it completes, fails, times out or is cancelled
    pub async fn drive(
        &self,
        conversation_id: &str,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let started = Instant::now();
        let polling = self.poll_until_done(conversation_id, run_id, cancel);
        // The duration bound covers backoff and tool execution too
        let result = match self.settings.max_duration {
            Some(max) => match tokio::time::timeout(max, polling).await {
                Ok(result) => result,
                Err(_) => Err(RunError::Timeout(format!("{:?}", max))),
            },
            None => polling.await,
        };
        let elapsed = started.elapsed();

        match &result {
            Ok(outcome) => info!(
                "Run {} completed after {} polls and {} tool calls ({:?})",
                run_id, outcome.polls, outcome.tool_calls, elapsed
            ),
            Err(e) => error!("Run {} on {} ended: {}", run_id, conversation_id, e),
        }

        if let Some(audit) = &self.audit {
            let failure = result.as_ref().err().map(|e| e.to_string());
            audit.log_run(
                conversation_id,
                run_id,
                failure.as_deref(),
                elapsed.as_millis() as u64,
            );
        }

        result
    }

    async fn poll_until_done(
        &self,
        conversation_id: &str,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let mut polls: u32 = 0;
        let mut tool_calls: usize = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }
            self.check_poll_bound(polls)?;

            let snapshot = self.poll(conversation_id, run_id, cancel).await?;
            polls += 1;

            match snapshot.status {
                RunStatus::Completed => return Ok(RunOutcome { polls, tool_calls }),
                RunStatus::RequiresAction => {
                    let outputs = self
                        .resolve_tool_calls(conversation_id, run_id, &snapshot.tool_calls)
                        .await?;
                    tool_calls += outputs.len();

                    if outputs.is_empty() {
                        warn!("Run {} requires action but listed no tool calls", run_id);
                    } else {
                        debug!("Submitting {} tool outputs for run {}", outputs.len(), run_id);
                        self.remote
                            .submit_tool_outputs(conversation_id, run_id, &outputs)
                            .await?;
                    }
                }
                RunStatus::Pending => {}
                _ => return Err(terminal_error(&snapshot)),
            }

            self.sleep(self.settings.poll_interval, cancel).await?;
        }
    }

    fn check_poll_bound(&self, polls: u32) -> Result<(), RunError> {
        match self.settings.max_polls {
            Some(max) if polls >= max => Err(RunError::Timeout(format!("{} polls", max))),
            _ => Ok(()),
        }
    }

    /// Fetch the run status, retrying transient transport failures
    async fn poll(
        &self,
        conversation_id: &str,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RunSnapshot, RunError> {
        let mut attempt = 0;
        let mut backoff = self.settings.poll_interval;

        loop {
            match self.remote.get_run_status(conversation_id, run_id).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_transient() && attempt < self.settings.transient_retries => {
                    attempt += 1;
                    warn!(
                        "Polling run {} failed ({}); retry {}/{} in {:?}",
                        run_id, e, attempt, self.settings.transient_retries, backoff
                    );
                    self.sleep(backoff, cancel).await?;
                    backoff *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Execute every requested call; all outputs or none
    async fn resolve_tool_calls(
        &self,
        conversation_id: &str,
        run_id: &str,
        requests: &[ToolInvocationRequest],
    ) -> Result<Vec<ToolInvocationResult>, RunError> {
        let mut outputs = Vec::with_capacity(requests.len());

        for request in requests {
            let started = Instant::now();
            let result = self.executor.execute(request).await?;

            if let Some(audit) = &self.audit {
                audit.log_tool_call(
                    conversation_id,
                    run_id,
                    request,
                    &result,
                    started.elapsed().as_millis() as u64,
                );
            }
            outputs.push(result);
        }

        Ok(outputs)
    }

    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), RunError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(RunError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

fn terminal_error(snapshot: &RunSnapshot) -> RunError {
    RunError::Terminal {
        status: snapshot.raw_status.clone(),
        reason: snapshot
            .last_error
            .clone()
            .unwrap_or_else(|| "no detail reported".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::testing::{requires_action, test_registry, RemoteCall, ScriptedRemote};
    use serde_json::Value;
    use std::sync::atomic::Ordering;

    fn fast_settings() -> RunSettings {
        RunSettings {
            poll_interval: Duration::from_millis(1),
            max_polls: None,
            max_duration: None,
            transient_retries: 2,
        }
    }

    fn orchestrator(remote: Arc<ScriptedRemote>, settings: RunSettings) -> RunOrchestrator {
        let (registry, _) = test_registry();
        RunOrchestrator::new(remote, ToolCallExecutor::new(registry), settings)
    }

    #[tokio::test]
    async fn test_completed_on_first_poll() {
        let remote = Arc::new(ScriptedRemote::new().then_status("completed"));
        let (registry, echo_calls) = test_registry();
        let orchestrator =
            RunOrchestrator::new(remote.clone(), ToolCallExecutor::new(registry), fast_settings());

        let outcome = orchestrator
            .drive("thread_1", "run_1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome { polls: 1, tool_calls: 0 });
        assert_eq!(remote.calls(), vec![RemoteCall::Poll]);
        assert_eq!(echo_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_tool_call_is_submitted_then_repolled() {
        let remote = Arc::new(
            ScriptedRemote::new()
                .then_status("queued")
                .then(requires_action(&[("call_1", "echo", r#"{"city": "Reno"}"#)]))
                .then_status("in_progress")
                .then_status("completed"),
        );
        let (registry, echo_calls) = test_registry();
        let orchestrator =
            RunOrchestrator::new(remote.clone(), ToolCallExecutor::new(registry), fast_settings());

        let outcome = orchestrator
            .drive("thread_1", "run_1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(echo_calls.load(Ordering::SeqCst), 1);

        let calls = remote.calls();
        assert!(matches!(calls[2], RemoteCall::Submit(_)));
        assert_eq!(calls[3], RemoteCall::Poll);

        let submissions = remote.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].len(), 1);
        assert_eq!(submissions[0][0].call_id, "call_1");
        let output: Value = serde_json::from_str(&submissions[0][0].output).unwrap();
        assert_eq!(output["echo"]["city"], "Reno");
    }

    #[tokio::test]
    async fn test_multiple_tool_calls_submitted_together() {
        let remote = Arc::new(ScriptedRemote::new().then(requires_action(&[
            ("call_a", "echo", r#"{"n": 1}"#),
            ("call_b", "echo", r#"{"n": 2}"#),
        ])));
        let orchestrator = orchestrator(remote.clone(), fast_settings());

        orchestrator
            .drive("thread_1", "run_1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            remote.calls().iter().map(|c| matches!(c, RemoteCall::Poll)).collect::<Vec<_>>(),
            vec![true, false, true]
        );
        let submissions = remote.submissions();
        assert_eq!(submissions.len(), 1);
        let ids: Vec<&str> = submissions[0].iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["call_a", "call_b"]);
    }

    #[tokio::test]
    async fn test_unknown_tool_reports_not_found_and_continues() {
        let remote = Arc::new(
            ScriptedRemote::new()
                .then(requires_action(&[("call_1", "foo", "{}")]))
                .then_status("in_progress"),
        );
        let orchestrator = orchestrator(remote.clone(), fast_settings());

        let outcome = orchestrator
            .drive("thread_1", "run_1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.polls, 3);
        let submitted = &remote.submissions()[0][0];
        assert_eq!(submitted.call_id, "call_1");
        assert!(submitted.is_error());
        assert!(submitted.output.contains("not found"));
    }

    #[tokio::test]
    async fn test_malformed_arguments_still_answered() {
        let remote = Arc::new(
            ScriptedRemote::new().then(requires_action(&[
                ("call_1", "echo", "{broken"),
                ("call_2", "echo", "{}"),
            ])),
        );
        let orchestrator = orchestrator(remote.clone(), fast_settings());

        orchestrator
            .drive("thread_1", "run_1", &CancellationToken::new())
            .await
            .unwrap();

        let submitted = &remote.submissions()[0];
        assert_eq!(submitted.len(), 2);
        assert!(submitted[0].is_error());
        assert!(!submitted[1].is_error());
    }

    #[tokio::test]
    async fn test_requires_action_without_calls_submits_nothing() {
        let remote = Arc::new(ScriptedRemote::new().then_status("requires_action"));
        let orchestrator = orchestrator(remote.clone(), fast_settings());

        let outcome = orchestrator
            .drive("thread_1", "run_1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.polls, 2);
        assert!(remote.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_failure() {
        let mut failed = RunSnapshot::new("failed");
        failed.last_error = Some("server_error: boom".to_string());
        let remote = Arc::new(ScriptedRemote::new().then_status("in_progress").then(failed));
        let orchestrator = orchestrator(remote.clone(), fast_settings());

        let err = orchestrator
            .drive("thread_1", "run_1", &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            RunError::Terminal { status, reason } => {
                assert_eq!(status, "failed");
                assert_eq!(reason, "server_error: boom");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(remote.polls(), 2);
    }

    #[tokio::test]
    async fn test_expired_and_cancelled_are_terminal() {
        for status in ["expired", "cancelled"] {
            let remote = Arc::new(ScriptedRemote::new().then_status(status));
            let err = orchestrator(remote, fast_settings())
                .drive("thread_1", "run_1", &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, RunError::Terminal { .. }), "{}", status);
        }
    }

    #[tokio::test]
    async fn test_tool_defect_terminates_without_submitting() {
        let remote = Arc::new(ScriptedRemote::new().then(requires_action(&[
            ("call_1", "echo", "{}"),
            ("call_2", "explode", "{}"),
        ])));
        let orchestrator = orchestrator(remote.clone(), fast_settings());

        let err = orchestrator
            .drive("thread_1", "run_1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::ToolDefect(_)));
        assert!(remote.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_max_polls_bound() {
        let mut remote = ScriptedRemote::new();
        for _ in 0..10 {
            remote = remote.then_status("in_progress");
        }
        let remote = Arc::new(remote);
        let settings = RunSettings {
            max_polls: Some(3),
            ..fast_settings()
        };

        let err = orchestrator(remote.clone(), settings)
            .drive("thread_1", "run_1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Timeout(_)));
        assert_eq!(remote.polls(), 3);
    }

    #[tokio::test]
    async fn test_max_duration_bound() {
        let mut remote = ScriptedRemote::new();
        for _ in 0..1000 {
            remote = remote.then_status("in_progress");
        }
        let settings = RunSettings {
            poll_interval: Duration::from_millis(10),
            max_duration: Some(Duration::from_millis(50)),
            ..fast_settings()
        };

        let err = orchestrator(Arc::new(remote), settings)
            .drive("thread_1", "run_1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_max_duration_covers_retry_backoff() {
        let mut remote = ScriptedRemote::new();
        for _ in 0..5 {
            remote = remote.then_error(RemoteError::Network("connection reset".to_string()));
        }
        let settings = RunSettings {
            poll_interval: Duration::from_millis(500),
            max_duration: Some(Duration::from_millis(50)),
            transient_retries: 5,
            ..fast_settings()
        };

        let started = Instant::now();
        let err = orchestrator(Arc::new(remote), settings)
            .drive("thread_1", "run_1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_sleep() {
        let remote = Arc::new(ScriptedRemote::new().then_status("in_progress"));
        let settings = RunSettings {
            poll_interval: Duration::from_secs(60),
            ..fast_settings()
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = orchestrator(remote.clone(), settings)
            .drive("thread_1", "run_1", &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Cancelled));
        assert_eq!(remote.polls(), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_polls() {
        let remote = Arc::new(ScriptedRemote::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orchestrator(remote.clone(), fast_settings())
            .drive("thread_1", "run_1", &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Cancelled));
        assert_eq!(remote.polls(), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let remote = Arc::new(
            ScriptedRemote::new()
                .then_error(RemoteError::Network("connection reset".to_string()))
                .then_error(RemoteError::Api {
                    status: 503,
                    message: "busy".to_string(),
                })
                .then_status("completed"),
        );

        let outcome = orchestrator(remote.clone(), fast_settings())
            .drive("thread_1", "run_1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.polls, 1);
        assert_eq!(remote.polls(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let remote = Arc::new(
            ScriptedRemote::new()
                .then_error(RemoteError::Network("down".to_string()))
                .then_error(RemoteError::Network("down".to_string()))
                .then_error(RemoteError::Network("down".to_string())),
        );

        let err = orchestrator(remote.clone(), fast_settings())
            .drive("thread_1", "run_1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Remote(RemoteError::Network(_))));
        assert_eq!(remote.polls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_remote_error_is_not_retried() {
        let remote = Arc::new(ScriptedRemote::new().then_error(RemoteError::Api {
            status: 404,
            message: "no such run".to_string(),
        }));

        let err = orchestrator(remote.clone(), fast_settings())
            .drive("thread_1", "run_1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Remote(RemoteError::Api { status: 404, .. })));
        assert_eq!(remote.polls(), 1);
    }

    #[tokio::test]
    async fn test_audit_records_calls_and_outcome() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = crate::config::AuditConfig {
            enabled: true,
            path: temp_dir.path().join("audit.log"),
            ..crate::config::AuditConfig::default()
        };
        let path = config.path.clone();
        let audit = AuditLog::new(config).map(Arc::new);

        let remote = Arc::new(ScriptedRemote::new().then(requires_action(&[("call_1", "echo", "{}")])));
        orchestrator(remote, fast_settings())
            .with_audit(audit)
            .drive("thread_1", "run_1", &CancellationToken::new())
            .await
            .unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"tool_call\""));
        assert!(lines[1].contains("\"run_completed\""));
    }
}
