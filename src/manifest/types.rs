//! Manifest types for Skillgate
//!
//! This module defines the declarative description of a skill package: its
//! identity, the tools it exposes, how it is executed and how risky it is.
//! A `Manifest` is immutable once parsed and validated.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Four-tier risk classification driving default policy decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Executes without approval.
    #[default]
    Low,
    /// Requires approval once per session.
    Medium,
    /// Requires approval on every call.
    High,
    /// Never executes unless a binding explicitly allows it.
    Critical,
}

impl RiskLevel {
    /// All levels, lowest first.
    pub const ALL: [RiskLevel; 4] = [
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    /// Parse a risk label. Returns `None` for unrecognized labels.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }

    /// Lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    /// Whether a freshly installed version must wait for an operator.
    pub fn requires_install_approval(&self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution kind of a skill runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Interpreted script run by the managed Python interpreter. The only
    /// kind eligible for dependency auto-repair.
    Python,
    /// Script run through a platform shell (`sh` / PowerShell).
    Shell,
    /// Command line run through the platform command shell (`sh -c` / `cmd /C`).
    Command,
}

impl RuntimeKind {
    /// Accepted manifest labels.
    pub const LABELS: [&'static str; 3] = ["python", "shell", "command"];

    /// Lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Python => "python",
            RuntimeKind::Shell => "shell",
            RuntimeKind::Command => "command",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a skill's entry is executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Execution kind.
    #[serde(rename = "type")]
    pub kind: RuntimeKind,

    /// Optional interpreter or command override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Extra arguments appended after the entry.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables set for the child process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Wall-clock timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Per-stream output ceiling in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<u64>,
}

impl RuntimeSpec {
    /// A bare runtime spec of the given kind.
    pub fn new(kind: RuntimeKind) -> Self {
        Self {
            kind,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout_secs: None,
            max_output_bytes: None,
        }
    }
}

/// A callable tool exposed by a skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name as registered with the chat engine.
    pub name: String,

    /// Description sent to the model.
    #[serde(default)]
    pub description: String,

    /// JSON Schema of the tool input. Always an object schema.
    pub input_schema: Value,

    /// Alternative names resolving to the same tool.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl ToolDescriptor {
    /// The primary name followed by every alias.
    pub fn all_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    /// Whether `name` (or one of the aliases) matches, ignoring case.
    pub fn answers_to(&self, name: &str) -> bool {
        let wanted = normalize_tool_name(name);
        self.all_names().any(|n| normalize_tool_name(n) == wanted)
    }
}

/// The declarative description of a skill package.
///
/// # Example
///
/// ```json
/// {
///   "id": "weather",
///   "name": "Weather",
///   "version": "1.0.0",
///   "entry": "main.py",
///   "tools": [
///     {
///       "name": "get_forecast",
///       "description": "Forecast for a city",
///       "input_schema": { "type": "object", "properties": { "city": { "type": "string" } } }
///     }
///   ],
///   "dependencies": ["requests"],
///   "runtime": { "type": "python", "timeout_secs": 30 },
///   "risk_level": "medium"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Identity slug (lowercase, digits, `-`, `_`).
    pub id: String,

    /// Display name.
    pub name: String,

    /// Semantic version string.
    pub version: String,

    /// Entry file relative to the package root.
    pub entry: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Ordered list of tools.
    pub tools: Vec<ToolDescriptor>,

    /// Managed external packages the runtime needs.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Capability tags.
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Execution spec.
    pub runtime: RuntimeSpec,

    /// Permission tags.
    #[serde(default)]
    pub permissions: Vec<String>,

    /// Supported platform tags (`linux`, `macos`, `windows`). Empty = any.
    #[serde(default)]
    pub platforms: Vec<String>,

    /// Risk level, `low` when absent.
    #[serde(default)]
    pub risk_level: RiskLevel,
}

impl Manifest {
    /// Find a tool by name or alias, ignoring case.
    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.answers_to(name))
    }

    /// Whether the manifest supports the given platform tag.
    pub fn supports_platform(&self, platform: &str) -> bool {
        self.platforms.is_empty()
            || self
                .platforms
                .iter()
                .any(|p| p.eq_ignore_ascii_case(platform) || p == "any")
    }

    /// Serialize to pretty JSON.
    pub fn to_json_pretty(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Normalized lookup key for tool names and aliases.
pub fn normalize_tool_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Platform tag of the running process.
pub fn current_platform() -> &'static str {
    std::env::consts::OS
}
