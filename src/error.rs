//! Error types for Skillgate
//!
//! This module defines all error types used throughout the skill subsystem.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.
//!
//! Policy denials and approval rejections are *not* errors: they are normal
//! terminal outcomes surfaced by the dispatcher as structured tool results.

use thiserror::Error;

/// The primary error type for Skillgate operations.
#[derive(Error, Debug)]
pub enum SkillError {
    /// Malformed or invalid manifest. Always fatal to installation.
    #[error("Manifest error at {field}: {message}")]
    Manifest {
        /// Path of the offending field, e.g. `tools[1].name`.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Bad source reference, unreachable archive or unsafe archive entry.
    #[error("Source error: {0}")]
    Source(String),

    /// Installation failures (missing manifest, storage errors, ...).
    #[error("Installer error: {0}")]
    Installer(String),

    /// The (skill, version) tuple is already installed.
    #[error("Installer error: version '{version}' of skill '{slug}' is already installed")]
    DuplicateVersion {
        /// Skill slug.
        slug: String,
        /// Version label.
        version: String,
    },

    /// Runtime spawn or protocol failures.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The child process exceeded its wall-clock budget and was killed.
    #[error("Runtime timeout: execution exceeded {seconds}s and was terminated")]
    Timeout {
        /// Effective timeout in seconds.
        seconds: u64,
    },

    /// The surrounding turn was cancelled.
    #[error("Cancelled")]
    Cancelled,

    /// Approval workflow errors (unknown request, already resolved, ...).
    #[error("Approval error: {0}")]
    Approval(String),

    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource not found (skills, versions, bindings, approval requests).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Security violations (path traversal attempts, unsafe entries, etc.)
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML deserialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Archive decoding errors
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl SkillError {
    /// Shorthand for a manifest error on a field path.
    pub fn manifest(field: impl Into<String>, message: impl Into<String>) -> Self {
        SkillError::Manifest {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// A specialized `Result` type for Skillgate operations.
pub type Result<T> = std::result::Result<T, SkillError>;
