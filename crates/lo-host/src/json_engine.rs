//! A data-only script engine.
//!
//! Scripts and modules are JSON objects. A script's keys become context
//! globals. A module's keys become its exports, except `$imports`, which
//! lists the module's import requests; each evaluated import is re-exported
//! under `$imports.<request>`.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use lo_bridge::engine::{Exports, ImportMap, ParsedModule, ScriptEngine, ScriptScope};
use serde_json::{Map, Value};

const IMPORTS: &str = "$imports";

pub struct JsonEngine;

fn parse_object(source: &str) -> Result<Map<String, Value>, String> {
    if source.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(source).map_err(|e| e.to_string())
}

impl ScriptEngine for JsonEngine {
    fn compile_script(&self, _name: &str, source: &str) -> Result<(), String> {
        parse_object(source).map(|_| ())
    }

    fn run_script(&self, scope: &ScriptScope, _name: &str, source: &str) -> Result<(), String> {
        for (name, value) in parse_object(source)? {
            scope.globals.set(name, value);
        }
        Ok(())
    }

    fn parse_module(&self, _specifier: &str, source: &str) -> Result<ParsedModule, String> {
        let mut exports = parse_object(source)?;
        let requests = match exports.remove(IMPORTS) {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(request) => Ok(request),
                    other => Err(format!("import request must be a string, got {other}")),
                })
                .collect::<Result<_, _>>()?,
            Some(other) => return Err(format!("{IMPORTS} must be an array, got {other}")),
        };
        Ok(ParsedModule::new(requests, exports))
    }

    fn evaluate_module(
        &self,
        _scope: ScriptScope,
        _specifier: String,
        module: Arc<ParsedModule>,
        imports: ImportMap,
    ) -> BoxFuture<'static, Result<Exports, String>> {
        let mut exports: Exports = module
            .compiled::<Map<String, Value>>()
            .map(|own| own.clone().into_iter().collect())
            .unwrap_or_default();
        if !imports.is_empty() {
            let imported: Map<String, Value> = imports
                .into_iter()
                .map(|(request, namespace)| {
                    let values = namespace.exports().clone().into_iter().collect();
                    (request, Value::Object(values))
                })
                .collect();
            exports.insert(IMPORTS.to_string(), Value::Object(imported));
        }
        futures::future::ready(Ok(exports)).boxed()
    }
}
