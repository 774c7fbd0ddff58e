//! Bridge root: owns one of each subsystem, built from a [`BridgeConfig`].

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::engine::ScriptEngine;
use crate::error::BridgeResult;
use crate::isolate::IsolateManager;
use crate::library::{LibraryHandle, LibraryRegistry};
use crate::memory::{MemoryBridge, MemoryStats};
use crate::thread::ThreadManager;

/// Point-in-time view of the bridge's resources.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeReport {
    pub libraries: Vec<String>,
    pub builtins: Vec<String>,
    pub contexts: usize,
    pub threads: usize,
    pub memory: MemoryStats,
}

pub struct Bridge {
    config: BridgeConfig,
    memory: MemoryBridge,
    libraries: Arc<LibraryRegistry>,
    threads: Arc<ThreadManager>,
    isolates: IsolateManager,
}

impl Bridge {
    pub fn new(config: BridgeConfig, engine: Arc<dyn ScriptEngine>) -> Self {
        let memory = MemoryBridge::from_config(&config.memory);
        let libraries = LibraryRegistry::new_shared(config.libraries.clone());
        let threads = Arc::new(ThreadManager::new(config.threads.clone()));
        let isolates = IsolateManager::new(config.isolate.clone(), engine, memory.clone());
        Self {
            config,
            memory,
            libraries,
            threads,
            isolates,
        }
    }

    /// Build a bridge and load the configured `preload` libraries.
    pub fn start(config: BridgeConfig, engine: Arc<dyn ScriptEngine>) -> BridgeResult<Self> {
        let bridge = Self::new(config, engine);
        let preloaded = bridge.preload()?;
        info!(preloaded = preloaded.len(), "Bridge started");
        Ok(bridge)
    }

    pub fn preload(&self) -> BridgeResult<Vec<Arc<LibraryHandle>>> {
        Ok(self.libraries.preload()?)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryBridge {
        &self.memory
    }

    pub fn libraries(&self) -> &Arc<LibraryRegistry> {
        &self.libraries
    }

    pub fn threads(&self) -> &Arc<ThreadManager> {
        &self.threads
    }

    pub fn isolates(&self) -> &IsolateManager {
        &self.isolates
    }

    pub fn report(&self) -> BridgeReport {
        BridgeReport {
            libraries: self.libraries.libraries(),
            builtins: self.libraries.builtins().to_vec(),
            contexts: self.isolates.len(),
            threads: self.threads.active().len(),
            memory: self.memory.stats(),
        }
    }

    /// Drop every cached library and log anything still alive.
    pub fn shutdown(self) {
        let report = self.report();
        if report.contexts > 0 {
            warn!(contexts = report.contexts, "Shutting down with live contexts");
        }
        if report.threads > 0 {
            warn!(threads = report.threads, "Shutting down with unjoined threads");
        }
        self.libraries.unload_all();
        info!(
            live_buffers = report.memory.live,
            live_bytes = report.memory.live_bytes,
            "Bridge shut down"
        );
    }
}
