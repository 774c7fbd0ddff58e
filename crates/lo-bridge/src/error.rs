//! Error types for the bridge.
//!
//! Native calls report failure through sentinels (null pointers, `-1`,
//! nonzero pthread codes). Those sentinels stop here: every public operation
//! returns one of the structured kinds below instead.

use crate::isolate::ContextId;
use crate::memory::Ownership;
use crate::module::ModuleId;
use crate::thread::Tid;

// ─────────────────────────────────────────────────────────────────────────────
// Memory
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by the memory bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("Invalid address {address:#x}: {reason}")]
    Addressing { address: usize, reason: AddressingReason },

    #[error("Access out of bounds: offset {offset} + length {length} exceeds size {size}")]
    Bounds {
        offset: usize,
        length: usize,
        size: usize,
    },

    #[error("Buffer at {address:#x} was already released")]
    DoubleRelease { address: usize },

    #[error("Native allocation of {size} bytes failed")]
    Allocation { size: usize },

    #[error("Range {address:#x}+{size} is already wrapped as {existing}")]
    OwnershipConflict {
        address: usize,
        size: usize,
        existing: Ownership,
    },

    #[error("Range {address:#x}+{size} aliases a live {existing} buffer")]
    Aliased {
        address: usize,
        size: usize,
        existing: Ownership,
    },
}

/// Why an address was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingReason {
    Null,
    EmptyRange,
    Overflow,
    NotLive,
    ArenaGone,
    OutsideView,
}

impl std::fmt::Display for AddressingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressingReason::Null => write!(f, "null pointer"),
            AddressingReason::EmptyRange => write!(f, "empty range"),
            AddressingReason::Overflow => write!(f, "range overflows the address space"),
            AddressingReason::NotLive => write!(f, "buffer is no longer live"),
            AddressingReason::ArenaGone => write!(f, "owning arena was dropped"),
            AddressingReason::OutsideView => write!(f, "range lies outside the view"),
        }
    }
}

impl MemoryError {
    /// Double releases break the ownership model and must not be recovered from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MemoryError::DoubleRelease { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Libraries
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised while opening files, libraries and symbols.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LibraryError {
    #[error("Failed to open {path}: errno {errno}")]
    Open { path: String, errno: i32 },

    #[error("Failed to close fd {fd}: errno {errno}")]
    Close { fd: i32, errno: i32 },

    #[error("Failed to load library {name}: {message}")]
    Load { name: String, message: String },

    #[error("Symbol {symbol} not found: {message}")]
    Symbol { symbol: String, message: String },

    #[error("Invalid name {0:?}: contains a nul byte")]
    InvalidName(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Threads
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by the thread manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThreadError {
    #[error("Thread {0} is busy: a join is pending or it was already joined")]
    Busy(Tid),

    #[error("Thread {0} does not exist")]
    Invalid(Tid),

    #[error("Null entry point")]
    NullEntry,

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(String),

    #[error("Thread {0} panicked")]
    Panicked(Tid),
}

impl ThreadError {
    /// Error code reported at the native boundary.
    pub fn code(&self) -> i32 {
        match self {
            ThreadError::Busy(_) => libc::EBUSY,
            ThreadError::Invalid(_) => libc::ESRCH,
            ThreadError::NullEntry => libc::EINVAL,
            ThreadError::SpawnFailed(_) => libc::EAGAIN,
            ThreadError::Panicked(_) => libc::EDEADLK,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Modules
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised while loading, linking or evaluating modules.
///
/// Cloneable: coalesced callers all receive the first caller's outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModuleError {
    #[error("Failed to parse {specifier}: {message}")]
    Parse { specifier: String, message: String },

    #[error("Cannot resolve {request:?} from {referrer}: {message}")]
    Resolve {
        request: String,
        referrer: String,
        message: String,
    },

    #[error("Failed to load source for {specifier}: {message}")]
    Load { specifier: String, message: String },

    #[error("Module {specifier} depends on {dependency}, which failed")]
    Dependency {
        specifier: String,
        dependency: String,
    },

    #[error("Evaluation of {specifier} failed: {message}")]
    Evaluate { specifier: String, message: String },

    #[error("Unknown module identity {0}")]
    NotFound(ModuleId),

    #[error("Module {0} has not been linked")]
    Unlinked(String),

    #[error("Module {0} was cancelled")]
    Cancelled(String),

    #[error("Context {0} has been destroyed")]
    ContextDestroyed(ContextId),

    #[error("Module {identity} does not belong to context {context}")]
    ForeignIdentity { identity: ModuleId, context: ContextId },
}

impl ModuleError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ModuleError::ContextDestroyed(_) | ModuleError::ForeignIdentity { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Contexts
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by the isolate context manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("Failed to create context: {0}")]
    Creation(String),

    #[error("Context {0} has been destroyed")]
    Destroyed(ContextId),

    #[error("Context {id} is {state}, expected {expected}")]
    InvalidState {
        id: ContextId,
        state: crate::isolate::ContextState,
        expected: crate::isolate::ContextState,
    },

    #[error("Script {name} failed: {message}")]
    Script { name: String, message: String },

    #[error("No callback registered at {0:#x}")]
    UnknownCallback(usize),

    #[error(transparent)]
    Module(#[from] ModuleError),
}

impl ContextError {
    pub fn is_fatal(&self) -> bool {
        match self {
            ContextError::Destroyed(_) => true,
            ContextError::Module(e) => e.is_fatal(),
            _ => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Umbrella
// ─────────────────────────────────────────────────────────────────────────────

/// Any error the bridge can produce.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error(transparent)]
    Thread(#[from] ThreadError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Fatal errors signal a violated ownership invariant, not an
    /// environmental failure. Hosts are expected to abort on them.
    pub fn is_fatal(&self) -> bool {
        match self {
            BridgeError::Memory(e) => e.is_fatal(),
            BridgeError::Module(e) => e.is_fatal(),
            BridgeError::Context(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(MemoryError::DoubleRelease { address: 0x10 }.is_fatal());
        assert!(
            !MemoryError::Bounds {
                offset: 0,
                length: 8,
                size: 4
            }
            .is_fatal()
        );

        let destroyed = ModuleError::ContextDestroyed(ContextId::new());
        assert!(BridgeError::from(destroyed.clone()).is_fatal());
        assert!(ContextError::from(destroyed).is_fatal());
        assert!(!BridgeError::from(MemoryError::Allocation { size: 8 }).is_fatal());
    }

    #[test]
    fn thread_error_codes_match_pthread() {
        assert_eq!(ThreadError::Busy(Tid::from_raw(1)).code(), libc::EBUSY);
        assert_eq!(ThreadError::Invalid(Tid::from_raw(1)).code(), libc::ESRCH);
    }
}
