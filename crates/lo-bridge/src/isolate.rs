//! Isolate Contexts
//!
//! A context is one independent script execution environment: its own
//! globals, module cache, callback table and task queue. Contexts share
//! nothing except callbacks a host explicitly registers and invokes through
//! an [`IsolateHandle`].
//!
//! ## Lifecycle
//!
//! ```text
//!   create ──► Created ──start──► Running ──destroy──► Destroyed
//!                 └──────────────destroy──────────────────┘
//! ```
//!
//! `destroy` consumes the context. Handles and module loaders that outlive it
//! report [`ContextError::Destroyed`] / [`ModuleError::ContextDestroyed`].

use std::fmt;
use std::future::Future;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::IsolateConfig;
use crate::engine::{Globals, ModuleNamespace, ScriptEngine, ScriptScope};
use crate::error::{BridgeError, ContextError, ModuleError};
use crate::hooks::{FsModuleHooks, ModuleHooks};
use crate::memory::{MemoryBridge, NativeBuffer, Ownership};
use crate::module::ModuleLoader;

// ─────────────────────────────────────────────────────────────────────────────
// Identity and state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Context lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextState {
    Created = 0,
    Running = 1,
    Destroyed = 2,
}

impl From<u8> for ContextState {
    fn from(v: u8) -> Self {
        match v {
            0 => ContextState::Created,
            1 => ContextState::Running,
            _ => ContextState::Destroyed,
        }
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextState::Created => write!(f, "created"),
            ContextState::Running => write!(f, "running"),
            ContextState::Destroyed => write!(f, "destroyed"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// Runs once when a context is torn down.
pub type CleanupHook = Box<dyn FnOnce(ContextId) + Send>;

/// Runs once, on the first `exit` call.
pub type ExitHook = Box<dyn FnOnce(ContextId, i32) + Send>;

/// Receives failures no caller observed: a failed main module or a failed
/// [`IsolateContext::try_next_tick`] task.
pub type RejectionHook = Arc<dyn Fn(ContextId, &BridgeError) + Send + Sync>;

/// A host function callable by address, from any thread.
pub type Callback = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Everything needed to create a context.
///
/// Unset fields fall back to the manager's [`IsolateConfig`].
pub struct IsolateOptions {
    pub argv: Vec<String>,
    pub main_specifier: String,
    pub bootstrap_script: String,
    pub io_buffer: Option<NativeBuffer>,
    pub fd: RawFd,
    pub start_time: u64,
    pub global_name: Option<String>,
    pub script_name: Option<String>,
    pub cleanup: Option<CleanupHook>,
    pub on_exit: Option<ExitHook>,
    pub on_rejection: Option<RejectionHook>,
    pub startup_snapshot: Option<Arc<[u8]>>,
    pub hooks: Option<Arc<dyn ModuleHooks>>,
}

impl IsolateOptions {
    pub fn new(main_specifier: impl Into<String>, bootstrap_script: impl Into<String>) -> Self {
        Self {
            argv: Vec::new(),
            main_specifier: main_specifier.into(),
            bootstrap_script: bootstrap_script.into(),
            io_buffer: None,
            fd: -1,
            start_time: 0,
            global_name: None,
            script_name: None,
            cleanup: None,
            on_exit: None,
            on_rejection: None,
            startup_snapshot: None,
            hooks: None,
        }
    }

    pub fn argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn io_buffer(mut self, buffer: NativeBuffer) -> Self {
        self.io_buffer = Some(buffer);
        self
    }

    pub fn fd(mut self, fd: RawFd) -> Self {
        self.fd = fd;
        self
    }

    pub fn start_time(mut self, start_time: u64) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn global_name(mut self, name: impl Into<String>) -> Self {
        self.global_name = Some(name.into());
        self
    }

    pub fn script_name(mut self, name: impl Into<String>) -> Self {
        self.script_name = Some(name.into());
        self
    }

    pub fn on_cleanup(mut self, hook: impl FnOnce(ContextId) + Send + 'static) -> Self {
        self.cleanup = Some(Box::new(hook));
        self
    }

    pub fn on_exit(mut self, hook: impl FnOnce(ContextId, i32) + Send + 'static) -> Self {
        self.on_exit = Some(Box::new(hook));
        self
    }

    pub fn on_unhandled_rejection(
        mut self,
        hook: impl Fn(ContextId, &BridgeError) + Send + Sync + 'static,
    ) -> Self {
        self.on_rejection = Some(Arc::new(hook));
        self
    }

    pub fn startup_snapshot(mut self, snapshot: impl Into<Arc<[u8]>>) -> Self {
        self.startup_snapshot = Some(snapshot.into());
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn ModuleHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state and handles
// ─────────────────────────────────────────────────────────────────────────────

struct ContextShared {
    id: ContextId,
    state: AtomicU8,
    modules: ModuleLoader,
    callbacks: DashMap<usize, Callback>,
}

impl ContextShared {
    fn state(&self) -> ContextState {
        ContextState::from(self.state.load(Ordering::Acquire))
    }

    fn ensure_alive(&self) -> Result<(), ContextError> {
        if self.state() == ContextState::Destroyed {
            error!(context = %self.id, "Operation on destroyed context");
            return Err(ContextError::Destroyed(self.id));
        }
        Ok(())
    }

    fn invoke(&self, address: usize, args: &[Value]) -> Result<Value, ContextError> {
        self.ensure_alive()?;
        let callback = self
            .callbacks
            .get(&address)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ContextError::UnknownCallback(address))?;
        Ok(callback(args))
    }
}

/// A cloneable, thread-safe reference to a context that may already be gone.
#[derive(Clone)]
pub struct IsolateHandle {
    shared: Arc<ContextShared>,
}

impl IsolateHandle {
    pub fn id(&self) -> ContextId {
        self.shared.id
    }

    pub fn state(&self) -> ContextState {
        self.shared.state()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == ContextState::Destroyed
    }

    pub fn modules(&self) -> Result<ModuleLoader, ContextError> {
        self.shared.ensure_alive()?;
        Ok(self.shared.modules.clone())
    }

    /// Call a callback registered in this context.
    pub fn invoke_callback(&self, address: usize, args: &[Value]) -> Result<Value, ContextError> {
        self.shared.invoke(address, args)
    }
}

impl fmt::Debug for IsolateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolateHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Creates contexts and tracks the live ones.
#[derive(Clone)]
pub struct IsolateManager {
    config: IsolateConfig,
    engine: Arc<dyn ScriptEngine>,
    memory: MemoryBridge,
    contexts: Arc<DashMap<ContextId, IsolateHandle>>,
}

impl IsolateManager {
    pub fn new(config: IsolateConfig, engine: Arc<dyn ScriptEngine>, memory: MemoryBridge) -> Self {
        Self {
            config,
            engine,
            memory,
            contexts: Arc::new(DashMap::new()),
        }
    }

    /// Build a context in the `Created` state.
    ///
    /// Fails with [`ContextError::Creation`] when the bootstrap script does
    /// not parse or the main specifier cannot be resolved.
    pub fn create(&self, options: IsolateOptions) -> Result<IsolateContext, ContextError> {
        let IsolateOptions {
            argv,
            main_specifier,
            bootstrap_script,
            io_buffer,
            fd,
            start_time,
            global_name,
            script_name,
            cleanup,
            on_exit,
            on_rejection,
            startup_snapshot,
            hooks,
        } = options;
        let id = ContextId::new();
        let global_name = global_name.unwrap_or_else(|| self.config.global_name.clone());
        let script_name = script_name.unwrap_or_else(|| self.config.script_name.clone());

        self.engine
            .compile_script(&script_name, &bootstrap_script)
            .map_err(|message| {
                ContextError::Creation(format!("bootstrap script {script_name} does not parse: {message}"))
            })?;

        let hooks: Arc<dyn ModuleHooks> = match hooks {
            Some(hooks) => hooks,
            None => Arc::new(FsModuleHooks::new(&self.config.module_root)),
        };
        let main = hooks.on_instantiate(&main_specifier, None).map_err(|message| {
            ContextError::Creation(format!("cannot resolve main module {main_specifier}: {message}"))
        })?;

        let io_buffer = match io_buffer {
            Some(buffer) => buffer,
            None => self
                .memory
                .alloc(self.config.io_buffer_size, Ownership::BridgeOwned)
                .map_err(|e| ContextError::Creation(format!("io buffer: {e}")))?,
        };
        let io_address = self
            .memory
            .address(&io_buffer)
            .map_err(|e| ContextError::Creation(format!("io buffer: {e}")))?;

        let globals = Arc::new(Globals::new());
        globals.set(
            global_name.clone(),
            json!({
                "args": &argv,
                "start": start_time,
                "script": script_name,
                "main": main,
                "fd": fd,
                "io": { "address": io_address, "size": io_buffer.size() },
            }),
        );
        let scope = ScriptScope {
            context_id: id,
            globals: Arc::clone(&globals),
        };
        self.engine
            .initialize(&scope, startup_snapshot.as_deref())
            .map_err(|message| ContextError::Creation(format!("engine initialization: {message}")))?;

        let modules = ModuleLoader::new(id, Arc::clone(&self.engine), scope.clone(), hooks);
        let shared = Arc::new(ContextShared {
            id,
            state: AtomicU8::new(ContextState::Created as u8),
            modules,
            callbacks: DashMap::new(),
        });
        self.contexts.insert(
            id,
            IsolateHandle {
                shared: Arc::clone(&shared),
            },
        );
        info!(
            context = %id,
            main = %main,
            global = %global_name,
            snapshot = startup_snapshot.is_some(),
            "Context created"
        );

        Ok(IsolateContext {
            shared,
            engine: Arc::clone(&self.engine),
            memory: self.memory.clone(),
            registry: Arc::clone(&self.contexts),
            scope,
            argv,
            main,
            bootstrap_script,
            script_name,
            global_name,
            fd,
            start_time,
            io_buffer: Some(io_buffer),
            startup_snapshot,
            cleanup,
            on_exit,
            on_rejection,
            exit_status: None,
            main_result: Arc::new(Mutex::new(None)),
            queue: FuturesUnordered::new(),
        })
    }

    /// Identities of every live context.
    pub fn contexts(&self) -> Vec<ContextId> {
        self.contexts.iter().map(|entry| *entry.key()).collect()
    }

    pub fn handle(&self, id: ContextId) -> Option<IsolateHandle> {
        self.contexts.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────────────────────────────────────

type MainResult = Arc<Mutex<Option<Result<Arc<ModuleNamespace>, ModuleError>>>>;

/// An owned script execution environment.
///
/// `Send` but driven by one thread at a time: tasks queued with
/// [`IsolateContext::next_tick`] only make progress inside
/// [`IsolateContext::pump`].
pub struct IsolateContext {
    shared: Arc<ContextShared>,
    engine: Arc<dyn ScriptEngine>,
    memory: MemoryBridge,
    registry: Arc<DashMap<ContextId, IsolateHandle>>,
    scope: ScriptScope,
    argv: Vec<String>,
    main: String,
    bootstrap_script: String,
    script_name: String,
    global_name: String,
    fd: RawFd,
    start_time: u64,
    io_buffer: Option<NativeBuffer>,
    startup_snapshot: Option<Arc<[u8]>>,
    cleanup: Option<CleanupHook>,
    on_exit: Option<ExitHook>,
    on_rejection: Option<RejectionHook>,
    exit_status: Option<i32>,
    main_result: MainResult,
    queue: FuturesUnordered<BoxFuture<'static, ()>>,
}

impl IsolateContext {
    pub fn id(&self) -> ContextId {
        self.shared.id
    }

    pub fn state(&self) -> ContextState {
        self.shared.state()
    }

    pub fn handle(&self) -> IsolateHandle {
        IsolateHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Canonical specifier of the main module.
    pub fn main_specifier(&self) -> &str {
        &self.main
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn global_name(&self) -> &str {
        &self.global_name
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn startup_snapshot(&self) -> Option<&[u8]> {
        self.startup_snapshot.as_deref()
    }

    pub fn io_buffer(&self) -> Option<&NativeBuffer> {
        self.io_buffer.as_ref()
    }

    pub fn globals(&self) -> &Arc<Globals> {
        &self.scope.globals
    }

    pub fn modules(&self) -> &ModuleLoader {
        &self.shared.modules
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// Outcome of the main module, once its evaluation has finished.
    pub fn main_result(&self) -> Option<Result<Arc<ModuleNamespace>, ModuleError>> {
        self.main_result.lock().clone()
    }

    /// Run the bootstrap script and queue evaluation of the main module.
    pub fn start(&mut self) -> Result<(), ContextError> {
        let state = self.state();
        if state != ContextState::Created {
            return Err(ContextError::InvalidState {
                id: self.id(),
                state,
                expected: ContextState::Created,
            });
        }
        self.run_script(&self.script_name, &self.bootstrap_script)?;
        self.shared
            .state
            .store(ContextState::Running as u8, Ordering::Release);
        info!(context = %self.id(), main = %self.main, "Context started");

        let modules = self.shared.modules.clone();
        let main = self.main.clone();
        let slot = Arc::clone(&self.main_result);
        let (id, on_rejection) = (self.id(), self.on_rejection.clone());
        self.next_tick(async move {
            let result = modules.import(&main, None).await;
            if let Err(error) = &result {
                reject(id, on_rejection.as_ref(), &BridgeError::from(error.clone()));
            }
            *slot.lock() = Some(result);
        });
        Ok(())
    }

    /// Queue a task. It runs during subsequent [`pump`](Self::pump) calls.
    pub fn next_tick(&mut self, task: impl Future<Output = ()> + Send + 'static) {
        self.queue.push(task.boxed());
    }

    /// Queue a task whose failure goes to the unhandled-rejection hook.
    pub fn try_next_tick(
        &mut self,
        task: impl Future<Output = Result<(), BridgeError>> + Send + 'static,
    ) {
        let (id, on_rejection) = (self.id(), self.on_rejection.clone());
        self.next_tick(async move {
            if let Err(error) = task.await {
                reject(id, on_rejection.as_ref(), &error);
            }
        });
    }

    /// Poll queued tasks until none can make progress. Returns how many
    /// finished.
    pub fn pump(&mut self) -> usize {
        let waker = futures::task::noop_waker_ref();
        let mut cx = Context::from_waker(waker);
        let mut completed = 0;
        while let Poll::Ready(Some(())) = self.queue.poll_next_unpin(&mut cx) {
            completed += 1;
        }
        completed
    }

    /// Queued tasks that have not finished.
    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    /// Compile and run a classic script against this context's globals.
    pub fn run_script(&self, name: &str, source: &str) -> Result<(), ContextError> {
        self.shared.ensure_alive()?;
        let script_error = |message| ContextError::Script {
            name: name.to_string(),
            message,
        };
        self.engine.compile_script(name, source).map_err(script_error)?;
        self.engine
            .run_script(&self.scope, name, source)
            .map_err(script_error)?;
        debug!(context = %self.id(), script = name, "Script ran");
        Ok(())
    }

    /// Make `callback` callable at `address`. Replaces any earlier entry.
    pub fn register_callback(
        &self,
        address: usize,
        callback: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
    ) -> Result<(), ContextError> {
        self.shared.ensure_alive()?;
        self.shared.callbacks.insert(address, Arc::new(callback));
        debug!(context = %self.id(), address, "Callback registered");
        Ok(())
    }

    pub fn invoke_callback(&self, address: usize, args: &[Value]) -> Result<Value, ContextError> {
        self.shared.invoke(address, args)
    }

    /// Record an exit status. The exit hook runs on the first call only.
    pub fn exit(&mut self, status: i32) {
        if self.exit_status.is_some() {
            return;
        }
        self.exit_status = Some(status);
        info!(context = %self.id(), status, "Context exited");
        if let Some(hook) = self.on_exit.take() {
            hook(self.id(), status);
        }
    }

    /// Tear the context down and release what it owns, including the io
    /// buffer whether or not it was passed in by the caller.
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let previous = self
            .shared
            .state
            .swap(ContextState::Destroyed as u8, Ordering::AcqRel);
        if ContextState::from(previous) == ContextState::Destroyed {
            return;
        }
        let id = self.id();

        let dropped = self.queue.len();
        self.queue = FuturesUnordered::new();
        self.shared.modules.destroy();
        self.shared.callbacks.clear();
        self.registry.remove(&id);

        if let Some(buffer) = self.io_buffer.take() {
            if let Err(error) = self.memory.unwrap(&buffer) {
                warn!(context = %id, %error, "Failed to release io buffer");
            }
        }
        if let Some(cleanup) = self.cleanup.take() {
            cleanup(id);
        }
        info!(context = %id, dropped_tasks = dropped, "Context destroyed");
    }
}

fn reject(id: ContextId, hook: Option<&RejectionHook>, error: &BridgeError) {
    match hook {
        Some(hook) => hook(id, error),
        None => warn!(context = %id, %error, "Unhandled rejection"),
    }
}

impl Drop for IsolateContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for IsolateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolateContext")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("main", &self.main)
            .field("pending_tasks", &self.queue.len())
            .finish_non_exhaustive()
    }
}
