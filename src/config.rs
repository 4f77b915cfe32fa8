//! Configuration management for toolrelay
//!
//! Handles loading and merging configuration from multiple sources:
//! 1. Compiled defaults
//! 2. System config (/etc/toolrelay/config.toml)
//! 3. User config (~/.toolrelay/config.toml)
//! 4. CLI-specified config file
//! 5. Environment variables
//! 6. CLI arguments (applied in main)

use crate::error::ConfigError;
use crate::plugins::CollisionPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub assistant: AssistantConfig,
    pub run: RunConfig,
    pub plugins: PluginConfig,
    pub tools: ToolsConfig,
    pub audit: AuditConfig,
}

/// HTTP front door
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: String,
    /// Environment variable holding the shared secret expected in X-API-KEY
    pub api_key_env: String,
}

/// Hosted assistant service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Base URL of the assistants API
    pub endpoint: String,
    /// Environment variable containing API key
    pub api_key_env: String,
    /// Model identifier used when creating the assistant
    pub model: String,
    /// Assistant name used when creating the assistant
    pub name: String,
    /// System instructions used when creating the assistant
    pub instructions: String,
    /// Use this assistant instead of provisioning one
    pub id: Option<String>,
    /// File caching the provisioned assistant id
    pub id_file: PathBuf,
    /// Files uploaded for retrieval when the assistant is created
    pub resources_dir: PathBuf,
    /// Request timeout in seconds
    pub timeout: u64,
}

/// Run orchestration loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Delay between status polls
    pub poll_interval_ms: u64,
    /// Maximum number of polls per run (0 = unbounded)
    pub max_polls: u32,
    /// Maximum wall-clock duration per run (0 = unbounded)
    pub max_duration_secs: u64,
    /// Retries for transient transport failures while polling
    pub transient_retries: u32,
}

/// Plugin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Enable out-of-process plugins
    pub enabled: bool,
    /// Plugin directory
    pub directory: PathBuf,
    /// Plugin timeout in seconds
    pub timeout: u64,
    /// What to do when two units declare the same tool
    pub on_collision: CollisionPolicy,
}

/// Built-in tool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub real_estate: RealEstateConfig,
    pub viewing: ViewingConfig,
}

/// Listing search backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealEstateConfig {
    /// Base URL; the tool queries `{endpoint}/for-sale`
    pub endpoint: String,
    /// Value sent as X-RapidAPI-Host
    pub host: String,
    /// Environment variable containing the listings API key
    pub api_key_env: String,
}

/// Viewing scheduler backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewingConfig {
    /// Webhook receiving viewing requests; the tool is disabled when unset
    pub webhook_url: Option<String>,
}

/// Audit trail of tool invocations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Log file path
    pub path: PathBuf,
    /// Maximum log file size before rotation
    pub max_size: u64,
    /// Number of rotated logs to keep
    pub retention: u32,
    /// Redact secrets from logs
    pub redact_secrets: bool,
}

// Default implementations

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            api_key_env: "CUSTOM_API_KEY".to_string(),
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: "gpt-4-1106-preview".to_string(),
            name: "toolrelay".to_string(),
            instructions: DEFAULT_INSTRUCTIONS.trim().to_string(),
            id: None,
            id_file: PathBuf::from("assistant.json"),
            resources_dir: PathBuf::from("resources"),
            timeout: 60,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_polls: 0,
            max_duration_secs: 0,
            transient_retries: 3,
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            enabled: true,
            directory: home.join(".toolrelay/plugins"),
            timeout: 30,
            on_collision: CollisionPolicy::default(),
        }
    }
}

impl Default for RealEstateConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://us-real-estate-listings.p.rapidapi.com".to_string(),
            host: "us-real-estate-listings.p.rapidapi.com".to_string(),
            api_key_env: "RAPID_API_KEY".to_string(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            enabled: false,
            path: home.join(".toolrelay/logs/tool-calls.log"),
            max_size: 10 * 1024 * 1024, // 10MB
            retention: 5,
            redact_secrets: true,
        }
    }
}

const DEFAULT_INSTRUCTIONS: &str = r#"
You are a real estate assistant. Help users search for properties that match
their budget, preferred locations and property types using the
'search_real_estate_listings' tool, and offer to arrange viewings with the
'schedule_property_viewing' tool once they show interest in a property.
Collect the property id, preferred date and time, full name and email before
scheduling, then confirm the appointment details. Keep a friendly,
professional tone, suggest a human representative when a request is beyond
your capabilities, and format text and links with Markdown.
"#;

impl Config {
    /// Load configuration from all sources
    pub fn load(cli_config: Option<&Path>) -> Result<Self, ConfigError> {
        let mut layers: Vec<PathBuf> = Vec::new();

        // System config
        let system_config = Path::new("/etc/toolrelay/config.toml");
        if system_config.exists() {
            layers.push(system_config.to_path_buf());
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".toolrelay/config.toml");
            if user_config.exists() {
                layers.push(user_config);
            }
        }

        // CLI-specified config
        if let Some(path) = cli_config {
            layers.push(path.to_path_buf());
        }

        let mut config = Self::from_layers(&layers)?;
        config.apply_env_overrides();

        Ok(config)
    }

    /// Build a config from files in increasing precedence. Only keys a
    /// layer actually sets override earlier layers.
    fn from_layers(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in paths {
            debug!("Loading config layer {:?}", path);
            merge_tables(&mut merged, read_layer(path)?);
        }

        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("TOOLRELAY_BIND") {
            self.server.bind = bind;
        }
        if let Ok(id) = std::env::var("TOOLRELAY_ASSISTANT_ID") {
            self.assistant.id = Some(id);
        }
        if let Ok(dir) = std::env::var("TOOLRELAY_PLUGIN_DIR") {
            self.plugins.directory = PathBuf::from(dir);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind.is_empty() {
            return Err(ConfigError::MissingField("server.bind".to_string()));
        }
        if self.assistant.endpoint.is_empty() {
            return Err(ConfigError::MissingField("assistant.endpoint".to_string()));
        }
        if self.assistant.model.is_empty() {
            return Err(ConfigError::MissingField("assistant.model".to_string()));
        }
        if self.run.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "run.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the hosted assistant API key from environment
    pub fn assistant_api_key(&self) -> Result<String, ConfigError> {
        require_env(&self.assistant.api_key_env)
    }

    /// Get the shared secret clients must present
    pub fn service_api_key(&self) -> Result<String, ConfigError> {
        require_env(&self.server.api_key_env)
    }
}

impl RunConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_polls(&self) -> Option<u32> {
        (self.max_polls > 0).then_some(self.max_polls)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        (self.max_duration_secs > 0).then(|| Duration::from_secs(self.max_duration_secs))
    }
}

/// Read one config file as a raw table, checking it against the schema
fn read_layer(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;

    let table: toml::Table = contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;

    // Report type errors against the file that introduced them
    let _: Config = toml::Value::Table(table.clone())
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;

    Ok(table)
}

/// Recursively overlay `overlay` onto `base`; nested tables merge key by key
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(nested) => {
                if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                    merge_tables(existing, nested);
                } else {
                    base.insert(key, toml::Value::Table(nested));
                }
            }
            other => {
                base.insert(key, other);
            }
        }
    }
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingSecret(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.server.api_key_env, "CUSTOM_API_KEY");
        assert_eq!(config.run.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.run.max_polls(), None);
        assert_eq!(config.run.max_duration(), None);
        assert_eq!(config.plugins.on_collision, CollisionPolicy::Reject);
        assert!(!config.audit.enabled);
    }

    #[test]
    fn test_config_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut config = Config::default();
        config.run.poll_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
            [assistant]
            model = "gpt-4o"
            id = "asst_123"

            [run]
            poll_interval_ms = 250
            max_polls = 40

            [plugins]
            enabled = false
            on_collision = "last_wins"

            [tools.viewing]
            webhook_url = "https://hooks.example.com/viewing"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.assistant.model, "gpt-4o");
        assert_eq!(config.assistant.id.as_deref(), Some("asst_123"));
        assert_eq!(config.run.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.run.max_polls(), Some(40));
        assert!(!config.plugins.enabled);
        assert_eq!(config.plugins.on_collision, CollisionPolicy::LastWins);
        assert_eq!(
            config.tools.viewing.webhook_url.as_deref(),
            Some("https://hooks.example.com/viewing")
        );
        // untouched sections keep defaults
        assert_eq!(config.server.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_load_merges_cli_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nbind = \"127.0.0.1:9000\"\n\n[run]\nmax_duration_secs = 120"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.run.max_duration(), Some(Duration::from_secs(120)));
        assert_eq!(config.assistant.api_key_env, "OPENAI_API_KEY");
    }

    #[test]
    fn test_later_layer_keeps_unrelated_settings() {
        let mut system = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            system,
            "[plugins]\non_collision = \"last_wins\"\n\n[audit]\nenabled = true\nredact_secrets = false"
        )
        .unwrap();
        let mut user = tempfile::NamedTempFile::new().unwrap();
        writeln!(user, "[server]\nbind = \"127.0.0.1:9100\"").unwrap();

        let config =
            Config::from_layers(&[system.path().to_path_buf(), user.path().to_path_buf()])
                .unwrap();

        assert_eq!(config.server.bind, "127.0.0.1:9100");
        assert_eq!(config.plugins.on_collision, CollisionPolicy::LastWins);
        assert!(config.plugins.enabled);
        assert!(config.audit.enabled);
        assert!(!config.audit.redact_secrets);
    }

    #[test]
    fn test_later_layer_overrides_same_key() {
        let mut system = tempfile::NamedTempFile::new().unwrap();
        writeln!(system, "[plugins]\nenabled = false\ntimeout = 5").unwrap();
        let mut user = tempfile::NamedTempFile::new().unwrap();
        writeln!(user, "[plugins]\nenabled = true").unwrap();

        let config =
            Config::from_layers(&[system.path().to_path_buf(), user.path().to_path_buf()])
                .unwrap();

        assert!(config.plugins.enabled);
        assert_eq!(config.plugins.timeout, 5);
    }

    #[test]
    fn test_layer_type_error_names_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[run]\npoll_interval_ms = \"fast\"").unwrap();

        match Config::from_layers(&[file.path().to_path_buf()]) {
            Err(ConfigError::Parse(message)) => {
                assert!(message.contains(&file.path().display().to_string()))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_load_reports_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[run\npoll_interval_ms = ").unwrap();

        let result = Config::load(Some(file.path()));
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_secret() {
        let mut config = Config::default();
        config.assistant.api_key_env = "TOOLRELAY_TEST_UNSET_KEY_9f2c".to_string();
        match config.assistant_api_key() {
            Err(ConfigError::MissingSecret(name)) => {
                assert_eq!(name, "TOOLRELAY_TEST_UNSET_KEY_9f2c")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
