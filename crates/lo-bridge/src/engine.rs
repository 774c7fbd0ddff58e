//! Script Engine Interface
//!
//! The bridge does not implement a scripting language. A host plugs its
//! engine in through [`ScriptEngine`]; the bridge decides *when* scripts are
//! compiled, run and evaluated, and the engine decides *what* that means.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::isolate::ContextId;

/// Export name → value.
pub type Exports = BTreeMap<String, Value>;

/// Import request → namespace of the module it resolved to.
pub type ImportMap = HashMap<String, Arc<ModuleNamespace>>;

/// The exported bindings of an evaluated module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleNamespace {
    exports: Exports,
}

impl ModuleNamespace {
    pub fn new(exports: Exports) -> Self {
        Self { exports }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.exports.get(name)
    }

    pub fn exports(&self) -> &Exports {
        &self.exports
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.exports.keys().map(String::as_str)
    }
}

/// Result of parsing module source text.
pub struct ParsedModule {
    /// Import requests in source order.
    pub requests: Vec<String>,
    pub is_source_text_module: bool,
    /// Engine-specific compiled form.
    pub compiled: Box<dyn Any + Send + Sync>,
}

impl ParsedModule {
    pub fn new(requests: Vec<String>, compiled: impl Any + Send + Sync) -> Self {
        Self {
            requests,
            is_source_text_module: true,
            compiled: Box::new(compiled),
        }
    }

    pub fn compiled<T: 'static>(&self) -> Option<&T> {
        self.compiled.downcast_ref()
    }
}

impl std::fmt::Debug for ParsedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParsedModule")
            .field("requests", &self.requests)
            .field("is_source_text_module", &self.is_source_text_module)
            .finish_non_exhaustive()
    }
}

/// The global namespace of one isolate context.
#[derive(Debug, Default)]
pub struct Globals {
    values: RwLock<Map<String, Value>>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.read().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.values.write().insert(name.into(), value)
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.values.write().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.read().contains_key(name)
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.read().clone()
    }
}

/// What an engine sees of the context it runs in.
#[derive(Debug, Clone)]
pub struct ScriptScope {
    pub context_id: ContextId,
    pub globals: Arc<Globals>,
}

/// A script engine driven by the bridge.
///
/// Errors are plain messages; the bridge wraps them in its own error kinds.
pub trait ScriptEngine: Send + Sync + 'static {
    /// Prepare a fresh context, optionally from a startup snapshot.
    fn initialize(&self, _scope: &ScriptScope, _snapshot: Option<&[u8]>) -> Result<(), String> {
        Ok(())
    }

    /// Check that a classic script parses, without running it.
    fn compile_script(&self, name: &str, source: &str) -> Result<(), String>;

    /// Run a classic script against the context's globals.
    fn run_script(&self, scope: &ScriptScope, name: &str, source: &str) -> Result<(), String>;

    /// Parse module source text.
    fn parse_module(&self, specifier: &str, source: &str) -> Result<ParsedModule, String>;

    /// Run a module body. `imports` holds the namespaces of the module's
    /// dependencies that have finished evaluating.
    fn evaluate_module(
        &self,
        scope: ScriptScope,
        specifier: String,
        module: Arc<ParsedModule>,
        imports: ImportMap,
    ) -> BoxFuture<'static, Result<Exports, String>>;
}
