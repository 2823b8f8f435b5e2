//! Configuration for Skillgate
//!
//! Configuration is read from `~/.skillgate/config.json`. Every section has
//! defaults, so a missing file (or a partial one) is fine. A few settings can
//! be overridden from the environment with the `SKILLGATE_` prefix:
//!
//! | Variable | Setting |
//! |---|---|
//! | `SKILLGATE_STORAGE_ROOT` | `storage_root` |
//! | `SKILLGATE_GITHUB_TOKEN` | `fetch.token` |
//! | `SKILLGATE_PYTHON` | `runtime.python_interpreter` |
//! | `SKILLGATE_APPROVAL_EXPIRY_SECS` | `approval.expiry_secs` |
//!
//! # Example
//!
//! ```json
//! {
//!     "storage_root": "/var/lib/skillgate",
//!     "runtime": { "default_timeout_secs": 30, "max_repair_rounds": 3 },
//!     "approval": { "expiry_secs": 120 }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SkillError};

const CONFIG_DIR_NAME: &str = ".skillgate";
const CONFIG_FILE_NAME: &str = "config.json";

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Durable storage root. Holds `registry.json`, `audit.jsonl`,
    /// `packages/` and `deps/`.
    pub storage_root: PathBuf,
    /// Source archive download settings.
    pub fetch: FetchConfig,
    /// Sandbox defaults and ceilings.
    pub runtime: RuntimeConfig,
    /// Approval workflow timing.
    pub approval: ApprovalConfig,
    /// Built-in skill packages.
    pub builtin: BuiltinConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: Config::dir(),
            fetch: FetchConfig::default(),
            runtime: RuntimeConfig::default(),
            approval: ApprovalConfig::default(),
            builtin: BuiltinConfig::default(),
        }
    }
}

/// Source archive download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Base URL of the archive endpoint. Archives are fetched from
    /// `{archive_base_url}/{owner}/{repo}/zip/{ref}`.
    pub archive_base_url: String,
    /// Canonical code-hosting domain accepted in URL source references.
    pub web_host: String,
    /// Access token sent as a bearer token when present.
    pub token: Option<String>,
    /// Download timeout in seconds.
    pub timeout_secs: u64,
    /// Ceiling on the downloaded archive and on its total uncompressed size.
    pub max_archive_bytes: u64,
    /// Ceiling on the number of archive entries.
    pub max_entries: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            archive_base_url: "https://codeload.github.com".to_string(),
            web_host: "github.com".to_string(),
            token: None,
            timeout_secs: 60,
            max_archive_bytes: 50 * 1024 * 1024,
            max_entries: 10_000,
        }
    }
}

/// Sandbox defaults and ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Explicit Python interpreter. When unset, `python3`/`python` is
    /// searched on `PATH`.
    pub python_interpreter: Option<PathBuf>,
    /// Timeout used when neither the manifest nor the binding sets one.
    pub default_timeout_secs: u64,
    /// Upper bound for any timeout override.
    pub max_timeout_secs: u64,
    /// Per-stream output ceiling used when the manifest sets none.
    pub default_max_output_bytes: u64,
    /// Upper bound for any output ceiling override.
    pub max_output_bytes: u64,
    /// Dependency auto-repair rounds for interpreted runtimes.
    pub max_repair_rounds: u32,
    /// Timeout for one dependency install step.
    pub dependency_install_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            python_interpreter: None,
            default_timeout_secs: 60,
            max_timeout_secs: 600,
            default_max_output_bytes: 1024 * 1024,
            max_output_bytes: 16 * 1024 * 1024,
            max_repair_rounds: 3,
            dependency_install_timeout_secs: 300,
        }
    }
}

/// Approval workflow timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Seconds a pending request stays open before it expires.
    pub expiry_secs: u64,
    /// Extra seconds the waiting invocation allows beyond the expiry, so
    /// the expiry path resolves first.
    pub wait_grace_secs: u64,
    /// Seconds a resolved request is kept in the registry. The latest
    /// approval of each session and skill is kept regardless, it backs
    /// session approval reuse.
    pub retention_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            expiry_secs: 300,
            wait_grace_secs: 5,
            retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Built-in skill packages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuiltinConfig {
    /// Directory holding one sub-directory per built-in package.
    pub dir: Option<PathBuf>,
    /// Slugs reserved for built-ins even if no package is present.
    pub reserved_slugs: Vec<String>,
}

impl Config {
    /// Configuration directory (`~/.skillgate`).
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR_NAME)
    }

    /// Default configuration file path.
    pub fn path() -> PathBuf {
        Self::dir().join(CONFIG_FILE_NAME)
    }

    /// Load from the default path and apply environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path())
    }

    /// Load from `path` (defaults when missing) and apply environment
    /// overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                SkillError::Config(format!("Failed to read {}: {}", path.display(), e))
            })?;
            if content.trim().is_empty() {
                Config::default()
            } else {
                serde_json::from_str(&content).map_err(|e| {
                    SkillError::Config(format!("Failed to parse {}: {}", path.display(), e))
                })?
            }
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `SKILLGATE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup("SKILLGATE_STORAGE_ROOT").filter(|v| !v.trim().is_empty()) {
            self.storage_root = PathBuf::from(root);
        }
        if let Some(token) = lookup("SKILLGATE_GITHUB_TOKEN").filter(|v| !v.trim().is_empty()) {
            self.fetch.token = Some(token);
        }
        if let Some(python) = lookup("SKILLGATE_PYTHON").filter(|v| !v.trim().is_empty()) {
            self.runtime.python_interpreter = Some(PathBuf::from(python));
        }
        if let Some(expiry) = lookup("SKILLGATE_APPROVAL_EXPIRY_SECS") {
            match expiry.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.approval.expiry_secs = secs,
                _ => warn!(value = %expiry, "Ignoring invalid SKILLGATE_APPROVAL_EXPIRY_SECS"),
            }
        }
    }

    /// `<storage-root>/registry.json`
    pub fn registry_path(&self) -> PathBuf {
        self.storage_root.join("registry.json")
    }

    /// `<storage-root>/audit.jsonl`
    pub fn audit_path(&self) -> PathBuf {
        self.storage_root.join("audit.jsonl")
    }

    /// `<storage-root>/packages`
    pub fn packages_dir(&self) -> PathBuf {
        self.storage_root.join("packages")
    }

    /// `<storage-root>/deps`
    pub fn deps_dir(&self) -> PathBuf {
        self.storage_root.join("deps")
    }

    /// Built-in package directory, `<storage-root>/builtin` unless set.
    pub fn builtin_dir(&self) -> PathBuf {
        self.builtin
            .dir
            .clone()
            .unwrap_or_else(|| self.storage_root.join("builtin"))
    }
}
