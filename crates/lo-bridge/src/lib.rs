//! lo Native Bridge
//!
//! The native layer underneath a small scripting runtime. It provides:
//! - Raw memory wrapped as bounded, single-release buffers (`memory`)
//! - dlopen/dlsym library loading with a per-name cache (`library`)
//! - Native threads started from a function address and joined by id (`thread`)
//! - Independent script contexts with their own globals and task queue (`isolate`)
//! - A per-context module cache that parses and evaluates each module once (`module`)
//!
//! The script engine itself is supplied by the host through
//! [`engine::ScriptEngine`]; module resolution and fetching through
//! [`hooks::ModuleHooks`].

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod isolate;
pub mod library;
pub mod memory;
pub mod module;
pub mod thread;

#[cfg(test)]
pub(crate) mod test_support;

pub use bridge::{Bridge, BridgeReport};
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use isolate::{ContextId, IsolateContext, IsolateHandle, IsolateManager, IsolateOptions};
pub use library::{LibraryHandle, LibraryRegistry};
pub use memory::{MemoryBridge, NativeBuffer, Ownership};
pub use module::{ModuleId, ModuleLoader, ModuleStatus};
pub use thread::{JoinResult, ThreadManager, Tid};
