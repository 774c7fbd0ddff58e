//! Bridge Configuration
//!
//! Defines the structure of the bridge's TOML configuration file. Every
//! section is optional; missing sections fall back to their defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Root configuration (bridge.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub memory: MemoryConfig,
    pub libraries: LibraryConfig,
    pub threads: ThreadConfig,
    pub isolate: IsolateConfig,
}

/// Memory bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Upper bound on simultaneously live buffers. Exceeding it is reported
    /// as an allocation failure.
    pub max_live_buffers: Option<usize>,
    /// Zero allocations made through the bridge.
    pub zero_fill: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_live_buffers: None,
            zero_fill: true,
        }
    }
}

/// Native library settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Directories probed for `name/name.so`, `libname.so` and `name.so`.
    pub search_paths: Vec<PathBuf>,
    /// Shared object extension, without the dot.
    pub extension: String,
    /// Explicit name → file overrides.
    pub paths: HashMap<String, PathBuf>,
    /// First-party bindings linked into the running process.
    pub internal: Vec<String>,
    /// Flags passed to dlopen for `library()` lookups.
    pub dlopen_flags: i32,
    /// Libraries loaded when the bridge starts.
    pub preload: Vec<String>,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            extension: default_extension(),
            paths: HashMap::new(),
            internal: Vec::new(),
            dlopen_flags: libc::RTLD_NOW | libc::RTLD_LOCAL,
            preload: Vec::new(),
        }
    }
}

fn default_extension() -> String {
    if cfg!(target_os = "macos") {
        "dylib".to_string()
    } else {
        "so".to_string()
    }
}

/// Thread manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    pub name_prefix: String,
    pub stack_size: Option<usize>,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            name_prefix: "lo-thread".to_string(),
            stack_size: None,
        }
    }
}

/// Defaults for new isolate contexts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolateConfig {
    pub global_name: String,
    pub script_name: String,
    /// Directory the default module hooks read from.
    pub module_root: PathBuf,
    /// Size of the I/O buffer allocated when a context is created without one.
    pub io_buffer_size: usize,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            global_name: "lo".to_string(),
            script_name: "main.js".to_string(),
            module_root: PathBuf::from("."),
            io_buffer_size: 64 * 1024,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        debug!(path = %path.display(), "Loaded bridge config");
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = BridgeConfig::from_toml("").unwrap();
        assert_eq!(config.isolate.global_name, "lo");
        assert_eq!(config.threads.name_prefix, "lo-thread");
        assert!(config.memory.zero_fill);
        assert!(config.libraries.paths.is_empty());
    }

    #[test]
    fn parses_sections() {
        let config = BridgeConfig::from_toml(
            r#"
            [memory]
            max_live_buffers = 16

            [libraries]
            search_paths = ["/opt/lo/lib"]
            internal = ["core"]
            preload = ["m"]

            [libraries.paths]
            m = "libm.so.6"

            [threads]
            stack_size = 65536
            "#,
        )
        .unwrap();

        assert_eq!(config.memory.max_live_buffers, Some(16));
        assert!(config.memory.zero_fill);
        assert_eq!(config.libraries.internal, vec!["core".to_string()]);
        assert_eq!(
            config.libraries.paths.get("m"),
            Some(&PathBuf::from("libm.so.6"))
        );
        assert_eq!(config.threads.stack_size, Some(65536));
        assert_eq!(config.threads.name_prefix, "lo-thread");
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = BridgeConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn load_reports_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "[memory\nzero_fill = true").unwrap();
        let err = BridgeConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
