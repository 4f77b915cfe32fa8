//! Error types for toolrelay

use thiserror::Error;

/// Main error type for toolrelay
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Remote agent error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Missing required secret: environment variable {0} is not set")]
    MissingSecret(String),
}

/// Plugin loading errors. Any of these aborts startup.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Malformed plugin unit '{unit}': {reason}")]
    Malformed { unit: String, reason: String },

    #[error("Tool '{name}' is defined by both '{first}' and '{second}'")]
    Duplicate {
        name: String,
        first: String,
        second: String,
    },

    #[error("Failed to read plugin directory: {0}")]
    Directory(String),
}

/// Errors talking to the hosted assistant service
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),
}

impl RemoteError {
    /// Whether retrying the same request might succeed
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) => true,
            RemoteError::Api { status, .. } => *status == 429 || *status >= 500,
            RemoteError::Parse(_) => false,
        }
    }
}

/// A tool implementation failed in a way it could not describe as output.
///
/// Recoverable failures are returned by tools as ordinary output strings;
/// a defect terminates the enclosing run.
#[derive(Error, Debug, Clone)]
#[error("Tool '{tool}' failed unexpectedly: {message}")]
pub struct ToolDefect {
    pub tool: String,
    pub message: String,
}

impl ToolDefect {
    pub fn new(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Run orchestration errors
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Run ended with status '{status}': {reason}")]
    Terminal { status: String, reason: String },

    #[error("Run did not finish within its bound ({0})")]
    Timeout(String),

    #[error("Run was cancelled locally")]
    Cancelled,

    #[error(transparent)]
    ToolDefect(#[from] ToolDefect),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Chat turn errors surfaced to the HTTP layer
#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("Assistant produced no reply")]
    NoReply,
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
