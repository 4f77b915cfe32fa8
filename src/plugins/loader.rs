//! Plugin loader
//!
//! Discovers out-of-process plugins from the plugin directory and turns
//! each one into a plugin unit backed by [`SubprocessTool`].

use super::protocol::PluginManifest;
use super::registry::PluginUnit;
use super::subprocess::SubprocessTool;
use crate::config::PluginConfig;
use crate::error::PluginError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Loads plugin units from a directory
pub struct PluginLoader {
    config: PluginConfig,
}

impl PluginLoader {
    /// Create a new plugin loader
    pub fn new(config: PluginConfig) -> Self {
        Self { config }
    }

    /// Discover every plugin in the directory.
    ///
    /// A missing directory yields no units; a plugin that cannot be loaded
    /// fails the whole discovery.
    pub fn load_units(&self) -> Result<Vec<PluginUnit>, PluginError> {
        if !self.config.enabled {
            debug!("Plugins disabled in configuration");
            return Ok(Vec::new());
        }

        let plugin_dir = &self.config.directory;
        if !plugin_dir.exists() {
            debug!("Plugin directory does not exist: {:?}", plugin_dir);
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(plugin_dir)
            .map_err(|e| PluginError::Directory(format!("{}: {}", plugin_dir.display(), e)))?;

        let mut names: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| PluginError::Directory(format!("{}: {}", plugin_dir.display(), e)))?;
            let name = entry.file_name().to_string_lossy().to_string();

            // Skip hidden files and manifests
            if name.starts_with('.') || name.ends_with(".json") || name.ends_with(".toml") {
                continue;
            }
            names.push(name);
        }
        // read_dir order is platform dependent; keep registration stable
        names.sort();

        let mut units = Vec::new();
        for name in names {
            units.extend(self.load_plugin(&name)?);
        }

        info!("Loaded {} plugin units from {:?}", units.len(), plugin_dir);
        Ok(units)
    }

    /// Load a specific plugin by name
    fn load_plugin(&self, name: &str) -> Result<Vec<PluginUnit>, PluginError> {
        let malformed = |reason: String| PluginError::Malformed {
            unit: name.to_string(),
            reason,
        };
        let plugin_path = self.config.directory.join(name);

        // Check for executable or directory
        let exec_path = if plugin_path.is_file() {
            plugin_path.clone()
        } else if plugin_path.is_dir() {
            let main = plugin_path.join("main");
            let bin = plugin_path.join(name);
            if main.exists() {
                main
            } else if bin.exists() {
                bin
            } else {
                return Err(malformed("no executable found in plugin directory".to_string()));
            }
        } else {
            return Err(malformed("not a file or directory".to_string()));
        };

        if !is_executable(&exec_path) {
            return Err(malformed(format!("{:?} is not executable", exec_path)));
        }

        let manifest = read_manifest(&plugin_path).map_err(malformed)?;
        if manifest.tools.is_empty() {
            return Err(malformed("manifest declares no tools".to_string()));
        }

        let timeout = Duration::from_secs(self.config.timeout);
        let units = manifest
            .tools
            .into_iter()
            .map(|decl| {
                let tool = SubprocessTool::new(
                    &manifest.name,
                    &decl.name,
                    exec_path.clone(),
                    timeout,
                );
                PluginUnit::single(decl, Arc::new(tool))
            })
            .collect::<Vec<_>>();

        info!("Loaded plugin '{}' with {} tools", manifest.name, units.len());
        Ok(units)
    }
}

/// Manifest lives next to a file plugin or inside a directory plugin
fn manifest_path(plugin_path: &Path) -> PathBuf {
    if plugin_path.is_dir() {
        plugin_path.join("manifest.json")
    } else {
        let mut path = plugin_path.as_os_str().to_owned();
        path.push(".json");
        PathBuf::from(path)
    }
}

fn read_manifest(plugin_path: &Path) -> Result<PluginManifest, String> {
    let path = manifest_path(plugin_path);
    let content = fs::read_to_string(&path)
        .map_err(|e| format!("failed to read manifest {:?}: {}", path, e))?;
    serde_json::from_str(&content).map_err(|e| format!("failed to parse manifest {:?}: {}", path, e))
}

/// Check if a file is executable
#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
