//! Module Loader
//!
//! Per-context module cache. Source text is parsed at most once per
//! canonical specifier, every module body runs at most once, and concurrent
//! callers asking for the same work await the same in-flight future instead
//! of starting their own.
//!
//! ```text
//!   load / load_specifier ──► Requested ──link──► Linked ──evaluate──► Evaluating
//!                                 │                                     │      │
//!                          (link failure kept                      Evaluated  Errored
//!                           on the record)
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::engine::{ImportMap, ModuleNamespace, ParsedModule, ScriptEngine, ScriptScope};
use crate::error::ModuleError;
use crate::hooks::ModuleHooks;
use crate::isolate::ContextId;

type PendingRecord = Shared<BoxFuture<'static, Result<Arc<ModuleRecord>, ModuleError>>>;
type PendingNamespace = Shared<BoxFuture<'static, Result<Arc<ModuleNamespace>, ModuleError>>>;

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// Identity of a module record. Carries the owning context, so an identity
/// handed to another context's loader is rejected instead of aliasing one of
/// its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId {
    context: ContextId,
    index: u64,
}

impl ModuleId {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn as_raw(&self) -> u64 {
        self.index
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}@{}", self.index, self.context)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Requested,
    Linked,
    Evaluating,
    Evaluated,
    Errored,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleStatus::Requested => write!(f, "requested"),
            ModuleStatus::Linked => write!(f, "linked"),
            ModuleStatus::Evaluating => write!(f, "evaluating"),
            ModuleStatus::Evaluated => write!(f, "evaluated"),
            ModuleStatus::Errored => write!(f, "errored"),
        }
    }
}

struct RecordState {
    status: ModuleStatus,
    /// (request, dependency) pairs, filled in by a successful link.
    resolved: Vec<(String, ModuleId)>,
    namespace: Option<Arc<ModuleNamespace>>,
    /// Link failure while `Requested`, evaluation failure once `Errored`.
    error: Option<ModuleError>,
    evaluation: Option<PendingNamespace>,
}

/// A parsed module and its lifecycle state.
pub struct ModuleRecord {
    identity: ModuleId,
    specifier: String,
    source: Arc<str>,
    parsed: Arc<ParsedModule>,
    state: Mutex<RecordState>,
}

impl ModuleRecord {
    pub fn identity(&self) -> ModuleId {
        self.identity
    }

    pub fn specifier(&self) -> &str {
        &self.specifier
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Import requests in source order.
    pub fn requests(&self) -> &[String] {
        &self.parsed.requests
    }

    pub fn is_source_text_module(&self) -> bool {
        self.parsed.is_source_text_module
    }

    pub fn status(&self) -> ModuleStatus {
        self.state.lock().status
    }

    pub fn namespace(&self) -> Option<Arc<ModuleNamespace>> {
        self.state.lock().namespace.clone()
    }

    pub fn error(&self) -> Option<ModuleError> {
        self.state.lock().error.clone()
    }

    /// Dependencies chosen by linking, keyed by import request.
    pub fn dependencies(&self) -> Vec<(String, ModuleId)> {
        self.state.lock().resolved.clone()
    }

    fn link_error(&self) -> Option<ModuleError> {
        let state = self.state.lock();
        match state.status {
            ModuleStatus::Requested => state.error.clone(),
            _ => None,
        }
    }

    fn dependency_ids(&self) -> Vec<ModuleId> {
        self.state.lock().resolved.iter().map(|(_, id)| *id).collect()
    }
}

impl fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("identity", &self.identity)
            .field("specifier", &self.specifier)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loader
// ─────────────────────────────────────────────────────────────────────────────

enum CacheEntry {
    Loading(PendingRecord),
    Ready(Arc<ModuleRecord>),
    Failed(ModuleError),
}

enum Source {
    Provided(Arc<str>),
    Fetch { referrer: Option<String> },
}

struct LoaderInner {
    context_id: ContextId,
    engine: Arc<dyn ScriptEngine>,
    scope: ScriptScope,
    hooks: RwLock<Arc<dyn ModuleHooks>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    records: Mutex<HashMap<ModuleId, Arc<ModuleRecord>>>,
    next_id: AtomicU64,
    destroyed: AtomicBool,
    cancel: watch::Sender<bool>,
}

/// The module cache of one isolate context. Cheap to clone.
#[derive(Clone)]
pub struct ModuleLoader {
    inner: Arc<LoaderInner>,
}

impl ModuleLoader {
    pub fn new(
        context_id: ContextId,
        engine: Arc<dyn ScriptEngine>,
        scope: ScriptScope,
        hooks: Arc<dyn ModuleHooks>,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(LoaderInner {
                context_id,
                engine,
                scope,
                hooks: RwLock::new(hooks),
                cache: Mutex::new(HashMap::new()),
                records: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                destroyed: AtomicBool::new(false),
                cancel,
            }),
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.inner.context_id
    }

    /// Replace the resolution and fetch hooks. Records already cached are
    /// unaffected.
    pub fn register_hooks(&self, hooks: Arc<dyn ModuleHooks>) -> Result<(), ModuleError> {
        self.inner.ensure_alive()?;
        *self.inner.hooks.write() = hooks;
        debug!(context = %self.inner.context_id, "Module hooks registered");
        Ok(())
    }

    /// Parse `source` as the module named `specifier`.
    ///
    /// A second load of the same specifier returns the cached record without
    /// parsing again, even if `source` differs.
    pub async fn load(
        &self,
        source: impl Into<Arc<str>>,
        specifier: &str,
    ) -> Result<Arc<ModuleRecord>, ModuleError> {
        self.inner.ensure_alive()?;
        self.load_with(specifier.to_string(), Source::Provided(source.into()))
            .await
    }

    /// Resolve `request` through the hooks, fetch its source and parse it.
    pub async fn load_specifier(
        &self,
        request: &str,
        referrer: Option<&str>,
    ) -> Result<Arc<ModuleRecord>, ModuleError> {
        self.inner.ensure_alive()?;
        let hooks = self.inner.hooks();
        let specifier =
            hooks
                .on_instantiate(request, referrer)
                .map_err(|message| ModuleError::Resolve {
                    request: request.to_string(),
                    referrer: referrer.unwrap_or("<root>").to_string(),
                    message,
                })?;
        let source = Source::Fetch {
            referrer: referrer.map(str::to_string),
        };
        self.load_with(specifier, source).await
    }

    async fn load_with(
        &self,
        specifier: String,
        source: Source,
    ) -> Result<Arc<ModuleRecord>, ModuleError> {
        let pending = {
            let mut cache = self.inner.cache.lock();
            match cache.get(&specifier) {
                Some(CacheEntry::Ready(record)) => return Ok(Arc::clone(record)),
                Some(CacheEntry::Failed(error)) => return Err(error.clone()),
                Some(CacheEntry::Loading(pending)) => {
                    trace!(%specifier, "Joining in-flight module load");
                    pending.clone()
                }
                None => {
                    let pending = Arc::clone(&self.inner)
                        .parse(specifier.clone(), source)
                        .boxed()
                        .shared();
                    cache.insert(specifier, CacheEntry::Loading(pending.clone()));
                    pending
                }
            }
        };
        self.inner.cancellable(pending).await
    }

    /// Resolve every import of `identity`, transitively, and mark the
    /// records whose whole dependency graph loaded as `Linked`.
    ///
    /// A failure is stored on the record (which stays `Requested`) and on
    /// every record that depends on it.
    pub async fn link(&self, identity: ModuleId) -> Result<Arc<ModuleRecord>, ModuleError> {
        self.inner.ensure_alive()?;
        let root = self.record(identity)?;
        if let Some(error) = root.link_error() {
            return Err(error);
        }
        if root.status() != ModuleStatus::Requested {
            return Ok(root);
        }

        type Edge = (String, Result<Arc<ModuleRecord>, ModuleError>);
        let mut graph: Vec<(Arc<ModuleRecord>, Vec<Edge>)> = Vec::new();
        let mut seen = HashSet::from([root.identity]);
        let mut queue = VecDeque::from([Arc::clone(&root)]);

        while let Some(record) = queue.pop_front() {
            if record.status() != ModuleStatus::Requested || record.link_error().is_some() {
                continue;
            }
            let mut edges = Vec::with_capacity(record.requests().len());
            for request in record.requests() {
                let dependency = self.load_specifier(request, Some(record.specifier())).await;
                if let Ok(dependency) = &dependency {
                    if seen.insert(dependency.identity) {
                        queue.push_back(Arc::clone(dependency));
                    }
                }
                edges.push((request.clone(), dependency));
            }
            graph.push((record, edges));
        }

        let mut failed: HashMap<ModuleId, ModuleError> = HashMap::new();
        for (record, edges) in &graph {
            if let Some(error) = edges.iter().find_map(|(_, dep)| dep.as_ref().err()) {
                failed.insert(record.identity, error.clone());
            }
        }
        loop {
            let mut changed = false;
            for (record, edges) in &graph {
                if failed.contains_key(&record.identity) {
                    continue;
                }
                let broken = edges.iter().find_map(|(_, dep)| {
                    let dep = dep.as_ref().ok()?;
                    (failed.contains_key(&dep.identity) || dep.link_error().is_some())
                        .then_some(dep)
                });
                if let Some(dep) = broken {
                    failed.insert(
                        record.identity,
                        ModuleError::Dependency {
                            specifier: record.specifier.clone(),
                            dependency: dep.specifier.clone(),
                        },
                    );
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for (record, edges) in &graph {
            let mut state = record.state.lock();
            if state.status != ModuleStatus::Requested || state.error.is_some() {
                continue;
            }
            match failed.get(&record.identity) {
                Some(error) => {
                    warn!(specifier = %record.specifier, %error, "Module failed to link");
                    state.error = Some(error.clone());
                }
                None => {
                    state.resolved = edges
                        .iter()
                        .filter_map(|(request, dep)| {
                            dep.as_ref().ok().map(|dep| (request.clone(), dep.identity))
                        })
                        .collect();
                    state.status = ModuleStatus::Linked;
                    debug!(specifier = %record.specifier, deps = state.resolved.len(), "Module linked");
                }
            }
        }

        match root.link_error() {
            Some(error) => Err(error),
            None => Ok(root),
        }
    }

    /// Link if needed, then run `identity` and its dependency graph.
    ///
    /// Each body runs once; concurrent and repeated callers receive the same
    /// namespace (or the same error).
    pub async fn evaluate(&self, identity: ModuleId) -> Result<Arc<ModuleNamespace>, ModuleError> {
        self.inner.ensure_alive()?;
        let root = self.record(identity)?;
        if let Some(namespace) = root.namespace() {
            return Ok(namespace);
        }
        self.link(identity).await?;

        let mut outcome = Err(ModuleError::Unlinked(root.specifier.clone()));
        for record in self.post_order(&root) {
            let result = self.evaluate_one(&record).await;
            if matches!(&result, Err(error) if error.is_fatal()) {
                return result;
            }
            if record.identity == identity {
                outcome = result;
            }
        }
        outcome
    }

    /// Resolve, load and evaluate in one step.
    pub async fn import(
        &self,
        request: &str,
        referrer: Option<&str>,
    ) -> Result<Arc<ModuleNamespace>, ModuleError> {
        let record = self.load_specifier(request, referrer).await?;
        self.evaluate(record.identity).await
    }

    pub fn record(&self, identity: ModuleId) -> Result<Arc<ModuleRecord>, ModuleError> {
        self.inner.ensure_alive()?;
        if identity.context != self.inner.context_id {
            error!(
                context = %self.inner.context_id,
                owner = %identity.context,
                %identity,
                "Module identity from another context"
            );
            return Err(ModuleError::ForeignIdentity {
                identity,
                context: self.inner.context_id,
            });
        }
        self.inner
            .records
            .lock()
            .get(&identity)
            .cloned()
            .ok_or(ModuleError::NotFound(identity))
    }

    /// Namespace of an already evaluated module, without loading anything.
    pub fn require(&self, specifier: &str) -> Result<Option<Arc<ModuleNamespace>>, ModuleError> {
        self.inner.ensure_alive()?;
        Ok(self.get(specifier).and_then(|record| record.namespace()))
    }

    /// Every evaluated module's namespace, keyed by canonical specifier.
    pub fn require_cache(&self) -> Result<BTreeMap<String, Arc<ModuleNamespace>>, ModuleError> {
        self.inner.ensure_alive()?;
        let records = self.inner.records.lock();
        Ok(records
            .values()
            .filter_map(|record| Some((record.specifier.clone(), record.namespace()?)))
            .collect())
    }

    /// Cached record for a canonical specifier, if it finished parsing.
    pub fn get(&self, specifier: &str) -> Option<Arc<ModuleRecord>> {
        match self.inner.cache.lock().get(specifier) {
            Some(CacheEntry::Ready(record)) => Some(Arc::clone(record)),
            _ => None,
        }
    }

    /// Canonical specifiers of every parsed record, sorted.
    pub fn specifiers(&self) -> Vec<String> {
        let mut specifiers: Vec<String> = self
            .inner
            .records
            .lock()
            .values()
            .map(|record| record.specifier.clone())
            .collect();
        specifiers.sort();
        specifiers
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Cancel in-flight work and drop every record. Further calls fail with
    /// [`ModuleError::ContextDestroyed`].
    pub(crate) fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.send_replace(true);

        let records: Vec<Arc<ModuleRecord>> =
            self.inner.records.lock().drain().map(|(_, r)| r).collect();
        let mut cancelled = 0;
        for record in &records {
            let mut state = record.state.lock();
            state.evaluation = None;
            if state.status == ModuleStatus::Evaluating {
                state.status = ModuleStatus::Errored;
                state.error = Some(ModuleError::Cancelled(record.specifier.clone()));
                cancelled += 1;
            }
        }
        self.inner.cache.lock().clear();
        info!(
            context = %self.inner.context_id,
            records = records.len(),
            cancelled,
            "Module cache destroyed"
        );
    }

    fn post_order(&self, root: &Arc<ModuleRecord>) -> Vec<Arc<ModuleRecord>> {
        let records = self.inner.records.lock();
        let mut order = Vec::new();
        let mut visited = HashSet::from([root.identity]);
        let mut stack = vec![(Arc::clone(root), root.dependency_ids(), 0usize)];

        loop {
            let Some(top) = stack.last_mut() else { break };
            if let Some(&next) = top.1.get(top.2) {
                top.2 += 1;
                if !visited.insert(next) {
                    continue;
                }
                if let Some(dep) = records.get(&next) {
                    stack.push((Arc::clone(dep), dep.dependency_ids(), 0));
                }
            } else if let Some((record, _, _)) = stack.pop() {
                order.push(record);
            }
        }
        order
    }

    async fn evaluate_one(
        &self,
        record: &Arc<ModuleRecord>,
    ) -> Result<Arc<ModuleNamespace>, ModuleError> {
        let pending = {
            let mut state = record.state.lock();
            if let Some(namespace) = &state.namespace {
                return Ok(Arc::clone(namespace));
            }
            match state.status {
                ModuleStatus::Evaluated | ModuleStatus::Errored => {
                    return Err(state
                        .error
                        .clone()
                        .unwrap_or_else(|| ModuleError::Cancelled(record.specifier.clone())));
                }
                ModuleStatus::Requested => {
                    return Err(state
                        .error
                        .clone()
                        .unwrap_or_else(|| ModuleError::Unlinked(record.specifier.clone())));
                }
                ModuleStatus::Evaluating => match &state.evaluation {
                    Some(pending) => pending.clone(),
                    None => return Err(ModuleError::Cancelled(record.specifier.clone())),
                },
                ModuleStatus::Linked => {
                    state.status = ModuleStatus::Evaluating;
                    debug!(specifier = %record.specifier, "Evaluating module");
                    let pending = Arc::clone(&self.inner)
                        .run_body(Arc::clone(record))
                        .boxed()
                        .shared();
                    state.evaluation = Some(pending.clone());
                    pending
                }
            }
        };
        self.inner.cancellable(pending).await
    }
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("context", &self.inner.context_id)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

impl LoaderInner {
    fn ensure_alive(&self) -> Result<(), ModuleError> {
        if self.destroyed.load(Ordering::Acquire) {
            error!(context = %self.context_id, "Module operation on destroyed context");
            return Err(ModuleError::ContextDestroyed(self.context_id));
        }
        Ok(())
    }

    fn hooks(&self) -> Arc<dyn ModuleHooks> {
        Arc::clone(&self.hooks.read())
    }

    /// Await `work` unless the context is destroyed first.
    async fn cancellable<T>(
        &self,
        work: impl Future<Output = Result<T, ModuleError>>,
    ) -> Result<T, ModuleError> {
        let mut cancel = self.cancel.subscribe();
        if *cancel.borrow() {
            return Err(ModuleError::ContextDestroyed(self.context_id));
        }
        tokio::select! {
            biased;
            _ = cancel.wait_for(|destroyed| *destroyed) => {
                Err(ModuleError::ContextDestroyed(self.context_id))
            }
            result = work => result,
        }
    }

    async fn parse(
        self: Arc<Self>,
        specifier: String,
        source: Source,
    ) -> Result<Arc<ModuleRecord>, ModuleError> {
        let result = self.fetch_and_parse(&specifier, source).await;

        let mut cache = self.cache.lock();
        if self.destroyed.load(Ordering::Acquire) {
            return Err(ModuleError::ContextDestroyed(self.context_id));
        }
        match &result {
            Ok(record) => {
                cache.insert(specifier, CacheEntry::Ready(Arc::clone(record)));
                self.records
                    .lock()
                    .insert(record.identity, Arc::clone(record));
            }
            // Parse failures are permanent; fetch failures may be retried.
            Err(error @ ModuleError::Parse { .. }) => {
                cache.insert(specifier, CacheEntry::Failed(error.clone()));
            }
            Err(_) => {
                cache.remove(&specifier);
            }
        }
        result
    }

    async fn fetch_and_parse(
        &self,
        specifier: &str,
        source: Source,
    ) -> Result<Arc<ModuleRecord>, ModuleError> {
        let source: Arc<str> = match source {
            Source::Provided(source) => source,
            Source::Fetch { referrer } => {
                let hooks = self.hooks();
                hooks
                    .on_load(specifier, referrer.as_deref())
                    .await
                    .map_err(|message| ModuleError::Load {
                        specifier: specifier.to_string(),
                        message,
                    })?
                    .into()
            }
        };

        let parsed = self
            .engine
            .parse_module(specifier, &source)
            .map_err(|message| {
                warn!(specifier, %message, "Module failed to parse");
                ModuleError::Parse {
                    specifier: specifier.to_string(),
                    message,
                }
            })?;

        let identity = ModuleId {
            context: self.context_id,
            index: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        debug!(
            context = %self.context_id,
            %identity,
            specifier,
            requests = parsed.requests.len(),
            "Module parsed"
        );
        Ok(Arc::new(ModuleRecord {
            identity,
            specifier: specifier.to_string(),
            source,
            parsed: Arc::new(parsed),
            state: Mutex::new(RecordState {
                status: ModuleStatus::Requested,
                resolved: Vec::new(),
                namespace: None,
                error: None,
                evaluation: None,
            }),
        }))
    }

    async fn run_body(
        self: Arc<Self>,
        record: Arc<ModuleRecord>,
    ) -> Result<Arc<ModuleNamespace>, ModuleError> {
        let mut imports = ImportMap::new();
        let mut failure = None;
        for (request, id) in record.dependencies() {
            let dependency = self.records.lock().get(&id).cloned();
            let Some(dependency) = dependency else {
                failure = Some(ModuleError::NotFound(id));
                break;
            };
            match dependency.status() {
                ModuleStatus::Evaluated => {
                    if let Some(namespace) = dependency.namespace() {
                        imports.insert(request, namespace);
                    }
                }
                ModuleStatus::Errored => {
                    failure = Some(ModuleError::Dependency {
                        specifier: record.specifier.clone(),
                        dependency: dependency.specifier.clone(),
                    });
                    break;
                }
                // Still evaluating further up a cycle.
                _ => {}
            }
        }

        let outcome = match failure {
            Some(error) => Err(error),
            None => {
                let body = self.engine.evaluate_module(
                    self.scope.clone(),
                    record.specifier.clone(),
                    Arc::clone(&record.parsed),
                    imports,
                );
                let mut cancel = self.cancel.subscribe();
                tokio::select! {
                    biased;
                    _ = cancel.wait_for(|destroyed| *destroyed) => {
                        Err(ModuleError::Cancelled(record.specifier.clone()))
                    }
                    result = body => result.map_err(|message| ModuleError::Evaluate {
                        specifier: record.specifier.clone(),
                        message,
                    }),
                }
            }
        };

        let mut state = record.state.lock();
        state.evaluation = None;
        match outcome {
            Ok(exports) => {
                let namespace = Arc::new(ModuleNamespace::new(exports));
                state.status = ModuleStatus::Evaluated;
                state.namespace = Some(Arc::clone(&namespace));
                debug!(specifier = %record.specifier, "Module evaluated");
                Ok(namespace)
            }
            Err(error) => {
                if state.status == ModuleStatus::Evaluating {
                    state.status = ModuleStatus::Errored;
                    state.error = Some(error.clone());
                }
                warn!(specifier = %record.specifier, %error, "Module evaluation failed");
                Err(error)
            }
        }
    }
}
