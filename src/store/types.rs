//! Durable registry entities.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::manifest::{Manifest, RiskLevel};

/// Where a skill came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Shipped with the host application.
    Builtin,
    /// Installed from a remote repository archive.
    RemoteRepository,
}

/// Skill-level lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillStatus {
    /// Eligible for resolution.
    #[default]
    Active,
    /// Hidden from resolution; bindings are kept.
    Disabled,
}

/// Lifecycle status of one installed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    /// Installed, not yet checked.
    PendingValidation,
    /// Waiting for an operator (high/critical risk).
    PendingApproval,
    /// Usable by the dispatcher.
    Active,
    /// Refused by an operator or by validation.
    Rejected,
    /// Retired; kept for audit history.
    Deprecated,
}

impl VersionStatus {
    /// Status of a freshly created version with the given risk level.
    pub fn initial_for(risk: RiskLevel) -> Self {
        if risk.requires_install_approval() {
            VersionStatus::PendingApproval
        } else {
            VersionStatus::PendingValidation
        }
    }

    /// Snake-case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::PendingValidation => "pending_validation",
            VersionStatus::PendingApproval => "pending_approval",
            VersionStatus::Active => "active",
            VersionStatus::Rejected => "rejected",
            VersionStatus::Deprecated => "deprecated",
        }
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binding scope levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// Applies everywhere.
    System,
    /// Applies to one acting user.
    User,
    /// Applies to one chat session.
    Session,
    /// Applies to one battle-run context.
    BattleRun,
}

impl ScopeKind {
    /// Resolution priority, higher wins.
    pub fn priority(&self) -> u8 {
        match self {
            ScopeKind::BattleRun => 3,
            ScopeKind::Session => 2,
            ScopeKind::User => 1,
            ScopeKind::System => 0,
        }
    }

    /// Parse a scope label (`system`, `user`, `session`, `battle_run`).
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "system" | "global" => Some(ScopeKind::System),
            "user" => Some(ScopeKind::User),
            "session" => Some(ScopeKind::Session),
            "battle_run" | "battle" => Some(ScopeKind::BattleRun),
            _ => None,
        }
    }

    /// Snake-case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::System => "system",
            ScopeKind::User => "user",
            ScopeKind::Session => "session",
            ScopeKind::BattleRun => "battle_run",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal (or pending) state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalDecision {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalDecision::Pending)
    }

    /// Snake-case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::Pending => "pending",
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Denied => "denied",
            ApprovalDecision::Expired => "expired",
        }
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An installable capability package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub id: Uuid,
    /// Unique slug.
    pub slug: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub source_kind: SourceKind,
    /// `owner/repo@ref[:subdir]` for remote skills, package dir for built-ins.
    #[serde(default)]
    pub source_locator: Option<String>,
    #[serde(default)]
    pub status: SkillStatus,
    #[serde(default)]
    pub default_version_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields used to create or refresh a [`Skill`].
#[derive(Debug, Clone)]
pub struct NewSkill {
    pub slug: String,
    pub display_name: String,
    pub description: String,
    pub source_kind: SourceKind,
    pub source_locator: Option<String>,
}

/// One installed version of a skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillVersion {
    pub id: Uuid,
    pub skill_id: Uuid,
    /// Version label, unique per skill.
    pub version: String,
    pub status: VersionStatus,
    pub manifest: Manifest,
    /// Hex SHA-256 over the sorted package tree.
    pub content_hash: String,
    /// Durable package directory, set once the copy finished.
    #[serde(default)]
    pub package_path: Option<PathBuf>,
    /// Why the version was rejected or deprecated.
    #[serde(default)]
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
}

impl SkillVersion {
    /// Active and installed on disk.
    pub fn is_runnable(&self) -> bool {
        self.status == VersionStatus::Active && self.package_path.is_some()
    }
}

/// Association of a skill with a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillBinding {
    pub id: Uuid,
    pub skill_id: Uuid,
    /// Pinned version; `None` follows the skill's default.
    #[serde(default)]
    pub version_id: Option<Uuid>,
    pub scope: ScopeKind,
    /// Scope identifier; `None` for system bindings.
    #[serde(default)]
    pub scope_id: Option<String>,
    pub enabled: bool,
    /// Scope-local policy overrides, see `policy::BindingPolicy`.
    #[serde(default)]
    pub policy: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields used to create or replace a [`SkillBinding`].
#[derive(Debug, Clone)]
pub struct NewBinding {
    pub skill_id: Uuid,
    pub version_id: Option<Uuid>,
    pub scope: ScopeKind,
    pub scope_id: Option<String>,
    pub enabled: bool,
    pub policy: Value,
}

/// A human approval request and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: Uuid,
    pub skill_id: Uuid,
    pub version_id: Uuid,
    pub tool_name: String,
    pub call_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Acting user, `None` for anonymous callers.
    #[serde(default)]
    pub actor_id: Option<String>,
    pub reason: String,
    /// Copy of the original call arguments.
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decided_by: Option<String>,
}
