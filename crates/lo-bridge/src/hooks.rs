//! Module Hooks
//!
//! Host callbacks consulted while modules are resolved and fetched.
//! `on_instantiate` maps an import request to a canonical specifier;
//! `on_load` produces the source text for a canonical specifier.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::trace;

#[async_trait]
pub trait ModuleHooks: Send + Sync + 'static {
    /// Resolve `request` as seen from `referrer` to a canonical specifier.
    fn on_instantiate(&self, request: &str, referrer: Option<&str>) -> Result<String, String>;

    /// Fetch the source text of a canonical specifier.
    async fn on_load(&self, specifier: &str, referrer: Option<&str>) -> Result<String, String>;
}

/// Resolves specifiers as slash-separated paths under a root directory.
///
/// Requests starting with `./` or `../` are relative to the referrer's
/// directory; everything else is relative to the root. Paths may not
/// escape the root.
#[derive(Debug, Clone)]
pub struct FsModuleHooks {
    root: PathBuf,
}

impl FsModuleHooks {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ModuleHooks for FsModuleHooks {
    fn on_instantiate(&self, request: &str, referrer: Option<&str>) -> Result<String, String> {
        let specifier = resolve_specifier(request, referrer)?;
        if !self.root.join(&specifier).is_file() {
            return Err(format!("{specifier} not found under {}", self.root.display()));
        }
        trace!(request, ?referrer, %specifier, "Resolved module");
        Ok(specifier)
    }

    async fn on_load(&self, specifier: &str, _referrer: Option<&str>) -> Result<String, String> {
        std::fs::read_to_string(self.root.join(specifier)).map_err(|e| e.to_string())
    }
}

/// Join `request` onto `referrer`'s directory when it is relative, then
/// normalize `.` and `..` segments.
pub fn resolve_specifier(request: &str, referrer: Option<&str>) -> Result<String, String> {
    let relative = request.starts_with("./") || request.starts_with("../");
    let joined = match referrer {
        Some(referrer) if relative => match referrer.rsplit_once('/') {
            Some((dir, _)) => format!("{dir}/{request}"),
            None => request.to_string(),
        },
        _ => request.to_string(),
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(format!("{request} escapes the module root"));
                }
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(format!("{request:?} is not a module specifier"));
    }
    Ok(segments.join("/"))
}
