//! Line-oriented fake engine and in-memory hooks for unit tests.
//!
//! Module and script source is one statement per line:
//!
//! ```text
//! import <request>            record an import request
//! export <name> = <json>      add an export
//! copy <name> from <request>  re-export a binding of an evaluated import
//! global <name> = <json>      write a context global
//! set <name> = <json>         same as global (scripts)
//! await <gate>                block until the gate opens
//! throw <message>             fail evaluation
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use crate::engine::{Exports, ImportMap, ParsedModule, ScriptEngine, ScriptScope};
use crate::hooks::{ModuleHooks, resolve_specifier};

#[derive(Debug, Clone)]
enum Stmt {
    Import(String),
    Export(String, Value),
    Copy(String, String),
    Global(String, Value),
    Await(String),
    Throw(String),
}

fn assignment(rest: &str) -> Result<(String, Value), String> {
    let (name, value) = rest
        .split_once('=')
        .ok_or_else(|| format!("expected `name = value`, got {rest:?}"))?;
    let value = serde_json::from_str(value.trim()).map_err(|e| e.to_string())?;
    Ok((name.trim().to_string(), value))
}

fn parse_lines(source: &str) -> Result<Vec<Stmt>, String> {
    let mut stmts = Vec::new();
    for line in source.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let stmt = match keyword {
            "import" => Stmt::Import(rest.to_string()),
            "export" => {
                let (name, value) = assignment(rest)?;
                Stmt::Export(name, value)
            }
            "global" | "set" => {
                let (name, value) = assignment(rest)?;
                Stmt::Global(name, value)
            }
            "copy" => {
                let (name, request) = rest
                    .split_once(" from ")
                    .ok_or_else(|| format!("bad copy: {line:?}"))?;
                Stmt::Copy(name.trim().to_string(), request.trim().to_string())
            }
            "await" => Stmt::Await(rest.to_string()),
            "throw" => Stmt::Throw(rest.to_string()),
            _ => return Err(format!("unexpected line {line:?}")),
        };
        stmts.push(stmt);
    }
    Ok(stmts)
}

/// A latch tests open to release waiting module bodies or fetches.
#[derive(Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(false).0),
        }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    async fn wait(self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[derive(Default)]
pub struct LineEngine {
    parses: Mutex<HashMap<String, usize>>,
    evals: Mutex<HashMap<String, usize>>,
    scripts: Mutex<Vec<String>>,
    gates: Mutex<HashMap<String, Gate>>,
}

impl LineEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gate(&self, name: &str) -> Gate {
        self.gates
            .lock()
            .entry(name.to_string())
            .or_insert_with(Gate::new)
            .clone()
    }

    pub fn parse_count(&self, specifier: &str) -> usize {
        self.parses.lock().get(specifier).copied().unwrap_or(0)
    }

    pub fn eval_count(&self, specifier: &str) -> usize {
        self.evals.lock().get(specifier).copied().unwrap_or(0)
    }

    /// Names of scripts run so far, in order.
    pub fn scripts_run(&self) -> Vec<String> {
        self.scripts.lock().clone()
    }
}

impl ScriptEngine for LineEngine {
    fn compile_script(&self, _name: &str, source: &str) -> Result<(), String> {
        let stmts = parse_lines(source)?;
        match stmts.iter().all(|s| matches!(s, Stmt::Global(..))) {
            true => Ok(()),
            false => Err("scripts may only assign globals".to_string()),
        }
    }

    fn run_script(&self, scope: &ScriptScope, name: &str, source: &str) -> Result<(), String> {
        self.compile_script(name, source)?;
        for stmt in parse_lines(source)? {
            if let Stmt::Global(key, value) = stmt {
                scope.globals.set(key, value);
            }
        }
        self.scripts.lock().push(name.to_string());
        Ok(())
    }

    fn parse_module(&self, specifier: &str, source: &str) -> Result<ParsedModule, String> {
        *self.parses.lock().entry(specifier.to_string()).or_default() += 1;
        let stmts = parse_lines(source)?;
        let requests = stmts
            .iter()
            .filter_map(|s| match s {
                Stmt::Import(request) => Some(request.clone()),
                _ => None,
            })
            .collect();
        Ok(ParsedModule::new(requests, stmts))
    }

    fn evaluate_module(
        &self,
        scope: ScriptScope,
        specifier: String,
        module: Arc<ParsedModule>,
        imports: ImportMap,
    ) -> BoxFuture<'static, Result<Exports, String>> {
        *self.evals.lock().entry(specifier).or_default() += 1;
        let stmts = module.compiled::<Vec<Stmt>>().cloned().unwrap_or_default();
        let gates: HashMap<String, Gate> = stmts
            .iter()
            .filter_map(|s| match s {
                Stmt::Await(name) => Some((name.clone(), self.gate(name))),
                _ => None,
            })
            .collect();

        async move {
            let mut exports = Exports::new();
            for stmt in stmts {
                match stmt {
                    Stmt::Import(_) => {}
                    Stmt::Export(name, value) => {
                        exports.insert(name, value);
                    }
                    Stmt::Copy(name, request) => {
                        let value = imports
                            .get(&request)
                            .and_then(|ns| ns.get(&name))
                            .cloned()
                            .ok_or_else(|| format!("{request} has no export {name}"))?;
                        exports.insert(name, value);
                    }
                    Stmt::Global(name, value) => {
                        scope.globals.set(name, value);
                    }
                    Stmt::Await(name) => {
                        if let Some(gate) = gates.get(&name) {
                            gate.clone().wait().await;
                        }
                    }
                    Stmt::Throw(message) => return Err(message),
                }
            }
            Ok(exports)
        }
        .boxed()
    }
}

/// Module hooks backed by a map of canonical specifier to source.
#[derive(Default)]
pub struct MemoryHooks {
    sources: HashMap<String, String>,
    loads: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
    gate: Option<Gate>,
}

impl MemoryHooks {
    pub fn new<'a>(sources: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            sources: sources
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Self::default()
        }
    }

    /// Hold every fetch until [`MemoryHooks::open`] is called.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Gate::new());
        self
    }

    pub fn open(&self) {
        if let Some(gate) = &self.gate {
            gate.open();
        }
    }

    /// Make the next fetch of `specifier` fail.
    pub fn fail_next(&self, specifier: &str) {
        self.failing.lock().insert(specifier.to_string());
    }

    pub fn load_count(&self, specifier: &str) -> usize {
        self.loads.lock().get(specifier).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ModuleHooks for MemoryHooks {
    fn on_instantiate(&self, request: &str, referrer: Option<&str>) -> Result<String, String> {
        let specifier = resolve_specifier(request, referrer)?;
        match self.sources.contains_key(&specifier) {
            true => Ok(specifier),
            false => Err(format!("no module named {specifier}")),
        }
    }

    async fn on_load(&self, specifier: &str, _referrer: Option<&str>) -> Result<String, String> {
        *self.loads.lock().entry(specifier.to_string()).or_default() += 1;
        if let Some(gate) = self.gate.clone() {
            gate.wait().await;
        }
        if self.failing.lock().remove(specifier) {
            return Err(format!("{specifier} is unavailable"));
        }
        self.sources
            .get(specifier)
            .cloned()
            .ok_or_else(|| format!("no module named {specifier}"))
    }
}

/// In-memory log sink for asserting on emitted events.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        let writer = self.clone();
        tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
