//! Tool registry
//!
//! Built once at startup from a set of plugin units and shared read-only
//! by every run afterwards.

use super::protocol::{ToolDeclaration, ToolImplementation};
use crate::error::PluginError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to do when two units register the same tool name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// The later unit replaces the earlier one
    LastWins,
    /// Abort loading
    #[default]
    Reject,
}

/// A self-contained unit contributing at most one declaration and any
/// number of named callables.
#[derive(Clone)]
pub struct PluginUnit {
    pub name: String,
    pub declaration: Option<ToolDeclaration>,
    pub callables: Vec<(String, Arc<dyn ToolImplementation>)>,
}

impl fmt::Debug for PluginUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginUnit")
            .field("name", &self.name)
            .field("declaration", &self.declaration)
            .field(
                "callables",
                &self.callables.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl PluginUnit {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            declaration: None,
            callables: Vec::new(),
        }
    }

    /// Unit whose declaration and single callable share the tool's name
    pub fn single(declaration: ToolDeclaration, tool: Arc<dyn ToolImplementation>) -> Self {
        let name = declaration.name.clone();
        Self::new(&name)
            .with_declaration(declaration)
            .with_callable(&name, tool)
    }

    pub fn with_declaration(mut self, declaration: ToolDeclaration) -> Self {
        self.declaration = Some(declaration);
        self
    }

    pub fn with_callable(mut self, name: &str, tool: Arc<dyn ToolImplementation>) -> Self {
        self.callables.push((name.to_string(), tool));
        self
    }

    fn validate(&self) -> Result<(), PluginError> {
        let malformed = |reason: &str| PluginError::Malformed {
            unit: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(malformed("unit has no name"));
        }
        if let Some(decl) = &self.declaration {
            if decl.name.trim().is_empty() {
                return Err(malformed("declaration has an empty name"));
            }
            if !decl.parameters.is_object() {
                return Err(malformed("declaration parameters must be a JSON object"));
            }
        }
        if self.callables.iter().any(|(n, _)| n.trim().is_empty()) {
            return Err(malformed("callable has an empty name"));
        }
        Ok(())
    }
}

/// Declarations advertised to the assistant plus the local dispatch table
#[derive(Default)]
pub struct ToolRegistry {
    declarations: Vec<ToolDeclaration>,
    dispatch: HashMap<String, Arc<dyn ToolImplementation>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field(
                "declarations",
                &self.declarations.iter().map(|d| &d.name).collect::<Vec<_>>(),
            )
            .field("callables", &self.tool_names())
            .finish()
    }
}

impl ToolRegistry {
    /// Build a registry from plugin units. Fails on the first malformed unit
    /// rather than producing a partial tool set.
    pub fn load<I>(units: I, policy: CollisionPolicy) -> Result<Self, PluginError>
    where
        I: IntoIterator<Item = PluginUnit>,
    {
        let mut registry = ToolRegistry::default();
        let mut owners: HashMap<String, String> = HashMap::new();
        let mut declared_by: HashMap<String, String> = HashMap::new();

        for unit in units {
            unit.validate()?;
            debug!(
                "Registering unit '{}' ({} callables)",
                unit.name,
                unit.callables.len()
            );

            if let Some(decl) = unit.declaration {
                if let Some(first) = declared_by.get(&decl.name) {
                    check_collision(policy, "Declaration", &decl.name, first, &unit.name)?;
                }
                declared_by.insert(decl.name.clone(), unit.name.clone());
                match registry.declarations.iter().position(|d| d.name == decl.name) {
                    // last-wins keeps one declaration per name
                    Some(idx) => registry.declarations[idx] = decl,
                    None => registry.declarations.push(decl),
                }
            }

            for (name, tool) in unit.callables {
                if let Some(first) = owners.get(&name) {
                    check_collision(policy, "Tool", &name, first, &unit.name)?;
                }
                owners.insert(name.clone(), unit.name.clone());
                registry.dispatch.insert(name, tool);
            }
        }

        info!(
            "Tool registry ready: {} declarations, {} callables",
            registry.declarations.len(),
            registry.dispatch.len()
        );
        Ok(registry)
    }

    pub fn declarations(&self) -> &[ToolDeclaration] {
        &self.declarations
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolImplementation>> {
        self.dispatch.get(name)
    }

    /// Registered callable names, sorted
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.dispatch.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn check_collision(
    policy: CollisionPolicy,
    kind: &str,
    name: &str,
    first: &str,
    second: &str,
) -> Result<(), PluginError> {
    match policy {
        CollisionPolicy::Reject => Err(PluginError::Duplicate {
            name: name.to_string(),
            first: first.to_string(),
            second: second.to_string(),
        }),
        CollisionPolicy::LastWins => {
            warn!(
                "{} '{}' from '{}' replaces the one from '{}'",
                kind, name, second, first
            );
            Ok(())
        }
    }
}
