//! Audit trail
//!
//! Appends one JSON line per tool invocation and per finished run so
//! operators can reconstruct what the assistant asked the service to do.

use crate::config::AuditConfig;
use crate::plugins::{ToolInvocationRequest, ToolInvocationResult};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Session ID for the current process
static SESSION_ID: Lazy<String> = Lazy::new(|| Uuid::new_v4().to_string());

/// Secret patterns for redaction
static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // API keys and tokens
        Regex::new(
            r#"(?i)(api[_-]?key|token|secret|password|passwd|pwd)['"]?\s*[=:]\s*['"]?([^'"\s,}]+)['"]?"#,
        )
        .unwrap(),
        // Bearer tokens
        Regex::new(r"(?i)bearer\s+[a-zA-Z0-9._-]+").unwrap(),
        // OpenAI style keys
        Regex::new(r"sk-[a-zA-Z0-9_-]{16,}").unwrap(),
        // Generic long alphanumeric strings that might be keys
        Regex::new(r"[a-zA-Z0-9_-]{40,}").unwrap(),
    ]
});

/// Audit entry structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    pub conversation_id: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
    /// "ok", "error", or the failure description for runs
    pub outcome: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    ToolCall,
    RunCompleted,
    RunFailed,
}

/// Append-only JSONL audit log, safe to share between runs
pub struct AuditLog {
    config: AuditConfig,
    file: Mutex<Option<BufWriter<File>>>,
}

impl AuditLog {
    /// Create the audit log, or `None` when auditing is disabled
    pub fn new(config: AuditConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let file = Self::open_log_file(&config.path);
        Some(Self {
            config,
            file: Mutex::new(file),
        })
    }

    /// Open or create the log file
    fn open_log_file(path: &Path) -> Option<BufWriter<File>> {
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create audit log directory: {}", e);
                return None;
            }
        }

        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                error!("Failed to open audit log {:?}: {}", path, e);
                None
            }
        }
    }

    /// Record one executed tool call
    pub fn log_tool_call(
        &self,
        conversation_id: &str,
        run_id: &str,
        request: &ToolInvocationRequest,
        result: &ToolInvocationResult,
        duration_ms: u64,
    ) {
        let entry = AuditEntry {
            session_id: SESSION_ID.clone(),
            timestamp: Utc::now(),
            event: AuditEvent::ToolCall,
            conversation_id: conversation_id.to_string(),
            run_id: run_id.to_string(),
            call_id: Some(request.call_id.clone()),
            tool: Some(request.tool_name.clone()),
            arguments: Some(self.redact_if_needed(&request.raw_arguments)),
            output_preview: Some(truncate_preview(&self.redact_if_needed(&result.output))),
            outcome: if result.is_error() { "error" } else { "ok" }.to_string(),
            duration_ms,
        };

        self.write_entry(&entry);
    }

    /// Record how a run ended
    pub fn log_run(
        &self,
        conversation_id: &str,
        run_id: &str,
        failure: Option<&str>,
        duration_ms: u64,
    ) {
        let (event, outcome) = match failure {
            None => (AuditEvent::RunCompleted, "ok".to_string()),
            Some(reason) => (AuditEvent::RunFailed, self.redact_if_needed(reason)),
        };

        let entry = AuditEntry {
            session_id: SESSION_ID.clone(),
            timestamp: Utc::now(),
            event,
            conversation_id: conversation_id.to_string(),
            run_id: run_id.to_string(),
            call_id: None,
            tool: None,
            arguments: None,
            output_preview: None,
            outcome,
            duration_ms,
        };

        self.write_entry(&entry);
    }

    /// Write a log entry
    fn write_entry(&self, entry: &AuditEntry) {
        let json = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize audit entry: {}", e);
                return;
            }
        };

        let mut guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        self.maybe_rotate(&mut guard);

        if let Some(ref mut file) = *guard {
            if let Err(e) = writeln!(file, "{}", json) {
                error!("Failed to write audit entry: {}", e);
            }
            if let Err(e) = file.flush() {
                warn!("Failed to flush audit log: {}", e);
            }
        }
    }

    /// Redact secrets from text if configured
    fn redact_if_needed(&self, text: &str) -> String {
        if self.config.redact_secrets {
            redact_secrets(text)
        } else {
            text.to_string()
        }
    }

    /// Rotate log file if it grew past the limit
    fn maybe_rotate(&self, file: &mut Option<BufWriter<File>>) {
        let path = &self.config.path;
        let too_big = fs::metadata(path)
            .map(|m| m.len() > self.config.max_size)
            .unwrap_or(false);
        if !too_big {
            return;
        }

        debug!("Rotating audit log files");
        *file = None;

        for i in (1..self.config.retention).rev() {
            let old = format!("{}.{}", path.display(), i);
            let new = format!("{}.{}", path.display(), i + 1);
            let _ = fs::rename(&old, &new);
        }

        let rotated = format!("{}.1", path.display());
        let _ = fs::rename(path, &rotated);

        *file = Self::open_log_file(path);
    }

    /// Get session ID
    pub fn session_id() -> &'static str {
        &SESSION_ID
    }
}

/// Redact secrets from text
fn redact_secrets(text: &str) -> String {
    let mut result = text.to_string();

    for pattern in SECRET_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    result
}

/// Truncate text for preview
fn truncate_preview(text: &str) -> String {
    const MAX_PREVIEW: usize = 500;
    match text.char_indices().nth(MAX_PREVIEW) {
        Some((idx, _)) => format!("{}...[truncated]", &text[..idx]),
        None => text.to_string(),
    }
}
