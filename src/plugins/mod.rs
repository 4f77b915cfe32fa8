//! Plugin system for toolrelay
//!
//! Tools the hosted assistant may call. Built-in tools are compiled in;
//! external plugins are executables that communicate via JSON over
//! stdin/stdout. Both are loaded into one immutable registry at startup.

mod builtin;
mod executor;
mod loader;
mod protocol;
mod registry;
mod subprocess;

pub use builtin::BuiltinTools;
pub use executor::ToolCallExecutor;
pub use loader::PluginLoader;
pub use protocol::{
    ToolDeclaration, ToolImplementation, ToolInvocationRequest, ToolInvocationResult,
};
pub use registry::{CollisionPolicy, PluginUnit, ToolRegistry};
