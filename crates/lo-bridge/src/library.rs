//! Native Library Loader
//!
//! Opens files and dynamic libraries and keeps a process-wide registry of
//! loaded libraries keyed by name. The registry is owned by the root
//! [`Bridge`](crate::Bridge); there is no ambient global state.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::config::LibraryConfig;
use crate::error::LibraryError;

// ─────────────────────────────────────────────────────────────────────────────
// Raw calls
// ─────────────────────────────────────────────────────────────────────────────

fn c_string(value: &str) -> Result<CString, LibraryError> {
    CString::new(value).map_err(|_| LibraryError::InvalidName(value.to_string()))
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn dlerror_message() -> String {
    // SAFETY: dlerror returns null or a pointer to a thread-local C string.
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "unknown error".to_string()
    } else {
        // SAFETY: non-null dlerror results are valid C strings.
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

/// Open a file. Flags and mode are passed to the host unmodified.
pub fn open(path: &str, flags: i32, mode: u32) -> Result<RawFd, LibraryError> {
    let c_path = c_string(path)?;
    // SAFETY: `c_path` is a valid nul-terminated string.
    let fd = unsafe { libc::open(c_path.as_ptr(), flags, mode as libc::c_uint) };
    if fd < 0 {
        return Err(LibraryError::Open {
            path: path.to_string(),
            errno: last_errno(),
        });
    }
    trace!(path, fd, "Opened file");
    Ok(fd)
}

pub fn close(fd: RawFd) -> Result<(), LibraryError> {
    // SAFETY: closing an fd has no memory-safety requirements.
    if unsafe { libc::close(fd) } != 0 {
        return Err(LibraryError::Close {
            fd,
            errno: last_errno(),
        });
    }
    Ok(())
}

/// Load a dynamic library. `None` opens the running process itself.
pub fn dlopen(path: Option<&str>, flags: i32) -> Result<usize, LibraryError> {
    let c_path = path.map(c_string).transpose()?;
    let ptr = c_path.as_ref().map_or(std::ptr::null(), |p| p.as_ptr());
    // SAFETY: `ptr` is null or a valid C string that outlives the call.
    let handle = unsafe { libc::dlopen(ptr, flags) };
    if handle.is_null() {
        return Err(LibraryError::Load {
            name: path.unwrap_or("<self>").to_string(),
            message: dlerror_message(),
        });
    }
    Ok(handle as usize)
}

/// Resolve a symbol in a raw library handle.
pub fn dlsym_raw(handle: usize, symbol: &str) -> Result<usize, LibraryError> {
    let c_symbol = c_string(symbol)?;
    // SAFETY: clears any stale error; then a lookup on a handle from dlopen.
    let address = unsafe {
        libc::dlerror();
        libc::dlsym(handle as *mut libc::c_void, c_symbol.as_ptr())
    };
    if address.is_null() {
        return Err(LibraryError::Symbol {
            symbol: symbol.to_string(),
            message: dlerror_message(),
        });
    }
    Ok(address as usize)
}

// ─────────────────────────────────────────────────────────────────────────────
// Library handle
// ─────────────────────────────────────────────────────────────────────────────

/// A resident dynamic library and its resolved symbols.
///
/// The library is closed when the last `Arc` to the handle is dropped.
pub struct LibraryHandle {
    name: String,
    native_handle: usize,
    file_name: Option<PathBuf>,
    internal: bool,
    symbols: DashMap<String, usize>,
}

impl LibraryHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn native_handle(&self) -> usize {
        self.native_handle
    }

    /// `None` for internal bindings, which live in the running process.
    pub fn file_name(&self) -> Option<&PathBuf> {
        self.file_name.as_ref()
    }

    /// First-party binding bundled with the runtime.
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// Resolve a symbol, caching the address.
    pub fn dlsym(&self, symbol: &str) -> Result<usize, LibraryError> {
        if let Some(address) = self.symbols.get(symbol) {
            return Ok(*address);
        }
        let address = *self
            .symbols
            .entry(symbol.to_string())
            .or_try_insert_with(|| dlsym_raw(self.native_handle, symbol))?;
        trace!(library = %self.name, symbol, address, "Resolved symbol");
        Ok(address)
    }

    /// Snapshot of the symbol cache.
    pub fn symbol_cache(&self) -> HashMap<String, usize> {
        self.symbols
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

impl std::fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("name", &self.name)
            .field("native_handle", &format_args!("{:#x}", self.native_handle))
            .field("file_name", &self.file_name)
            .field("internal", &self.internal)
            .field("symbols", &self.symbols.len())
            .finish()
    }
}

impl Drop for LibraryHandle {
    fn drop(&mut self) {
        if self.internal {
            return;
        }
        // SAFETY: the handle came from dlopen and is closed exactly once.
        let rc = unsafe { libc::dlclose(self.native_handle as *mut libc::c_void) };
        if rc != 0 {
            debug!(library = %self.name, error = %dlerror_message(), "dlclose failed");
        } else {
            debug!(library = %self.name, "Closed library");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Name → handle cache. A name maps to at most one resident handle.
pub struct LibraryRegistry {
    config: LibraryConfig,
    libraries: DashMap<String, Arc<LibraryHandle>>,
    /// One lock per name with a load in flight.
    loading: DashMap<String, Arc<Mutex<()>>>,
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new(LibraryConfig::default())
    }
}

impl LibraryRegistry {
    pub fn new(config: LibraryConfig) -> Self {
        Self {
            config,
            libraries: DashMap::new(),
            loading: DashMap::new(),
        }
    }

    pub fn new_shared(config: LibraryConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Look up a library by name, loading it on first use.
    ///
    /// Concurrent first lookups of one name perform a single load. Only
    /// lookups of that name wait for it; no map lock is held while `dlopen`
    /// runs. Failed loads are not cached.
    pub fn library(&self, name: &str) -> Result<Arc<LibraryHandle>, LibraryError> {
        if let Some(handle) = self.resident(name) {
            return Ok(handle);
        }
        let gate = Arc::clone(self.loading.entry(name.to_string()).or_default().value());
        let result = {
            let _loading = gate.lock();
            match self.resident(name) {
                Some(handle) => Ok(handle),
                None => self.load(name).map(|handle| {
                    let entry = self.libraries.entry(name.to_string()).or_insert(Arc::new(handle));
                    Arc::clone(entry.value())
                }),
            }
        };
        self.loading.remove_if(name, |_, current| Arc::ptr_eq(current, &gate));
        result
    }

    fn resident(&self, name: &str) -> Option<Arc<LibraryHandle>> {
        self.libraries.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn load(&self, name: &str) -> Result<LibraryHandle, LibraryError> {
        if self.config.internal.iter().any(|n| n == name) {
            let native_handle = dlopen(None, self.config.dlopen_flags)?;
            debug!(library = name, "Bound internal library");
            return Ok(LibraryHandle {
                name: name.to_string(),
                native_handle,
                file_name: None,
                internal: true,
                symbols: DashMap::new(),
            });
        }

        let file_name = self.locate(name);
        let path = file_name.to_string_lossy();
        let native_handle = dlopen(Some(&path), self.config.dlopen_flags).map_err(|e| match e {
            LibraryError::Load { message, .. } => LibraryError::Load {
                name: name.to_string(),
                message,
            },
            other => other,
        })?;
        info!(library = name, file = %path, "Loaded library");
        Ok(LibraryHandle {
            name: name.to_string(),
            native_handle,
            file_name: Some(file_name),
            internal: false,
            symbols: DashMap::new(),
        })
    }

    /// Pick the file for `name`: explicit override, then the search paths,
    /// then the bare `lib<name>` for the system loader to find.
    fn locate(&self, name: &str) -> PathBuf {
        if let Some(path) = self.config.paths.get(name) {
            return path.clone();
        }
        let ext = &self.config.extension;
        let candidates = [
            format!("{name}/{name}.{ext}"),
            format!("lib{name}.{ext}"),
            format!("{name}.{ext}"),
        ];
        self.config
            .search_paths
            .iter()
            .flat_map(|dir| candidates.iter().map(move |c| dir.join(c)))
            .find(|path| path.is_file())
            .unwrap_or_else(|| PathBuf::from(format!("lib{name}.{ext}")))
    }

    /// Resolve a symbol in a cached handle.
    pub fn dlsym(&self, handle: &LibraryHandle, symbol: &str) -> Result<usize, LibraryError> {
        handle.dlsym(symbol)
    }

    /// Load every library listed under `preload`.
    pub fn preload(&self) -> Result<Vec<Arc<LibraryHandle>>, LibraryError> {
        self.config
            .preload
            .iter()
            .map(|name| self.library(name))
            .collect()
    }

    /// Names of the resident libraries, sorted.
    pub fn libraries(&self) -> Vec<String> {
        let mut names: Vec<_> = self.libraries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Names of the first-party bindings.
    pub fn builtins(&self) -> &[String] {
        &self.config.internal
    }

    /// Drop a library from the cache. Returns whether it was resident.
    pub fn unload(&self, name: &str) -> bool {
        self.libraries.remove(name).is_some()
    }

    pub fn unload_all(&self) {
        let count = self.libraries.len();
        self.libraries.clear();
        debug!(count, "Unloaded all libraries");
    }
}

impl Drop for LibraryRegistry {
    fn drop(&mut self) {
        self.unload_all();
    }
}
