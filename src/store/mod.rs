//! Durable skill registry
//!
//! Skills, versions, bindings and approval requests are kept in memory and
//! persisted as a single pretty-printed JSON document
//! (`<storage-root>/registry.json`) after every mutation. Reads never touch
//! the disk.

pub mod types;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SkillError};
use crate::manifest::Manifest;

const DEFAULT_APPROVAL_RETENTION_SECS: i64 = 7 * 24 * 60 * 60;

pub use types::{
    ApprovalDecision, ApprovalRecord, NewBinding, NewSkill, ScopeKind, Skill, SkillBinding,
    SkillStatus, SkillVersion, SourceKind, VersionStatus,
};

/// Everything persisted in `registry.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct RegistryState {
    skills: Vec<Skill>,
    versions: Vec<SkillVersion>,
    bindings: Vec<SkillBinding>,
    approvals: Vec<ApprovalRecord>,
}

/// JSON-file backed registry store.
#[derive(Debug)]
pub struct SkillStore {
    path: Option<PathBuf>,
    state: RwLock<RegistryState>,
    approval_retention: Duration,
}

impl SkillStore {
    /// Open (or create on first write) the registry at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = Self::load(&path)?;
        debug!(
            path = %path.display(),
            skills = state.skills.len(),
            versions = state.versions.len(),
            "Opened skill registry"
        );
        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
            approval_retention: Duration::seconds(DEFAULT_APPROVAL_RETENTION_SECS),
        })
    }

    /// A store that is never written to disk. Useful for testing.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(RegistryState::default()),
            approval_retention: Duration::seconds(DEFAULT_APPROVAL_RETENTION_SECS),
        }
    }

    /// How long resolved approval requests are kept.
    pub fn with_approval_retention(mut self, secs: u64) -> Self {
        // chrono rejects spans beyond i64::MAX milliseconds.
        let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
        self.approval_retention = Duration::seconds(secs);
        self
    }

    // ---- skills ----

    /// Create a skill, or refresh display metadata of the existing one with
    /// the same slug.
    pub async fn upsert_skill(&self, new: NewSkill) -> Result<Skill> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let skill = if let Some(existing) = state.skills.iter_mut().find(|s| s.slug == new.slug) {
            existing.display_name = new.display_name;
            existing.description = new.description;
            existing.source_kind = new.source_kind;
            existing.source_locator = new.source_locator;
            existing.updated_at = now;
            existing.clone()
        } else {
            let skill = Skill {
                id: Uuid::new_v4(),
                slug: new.slug,
                display_name: new.display_name,
                description: new.description,
                source_kind: new.source_kind,
                source_locator: new.source_locator,
                status: SkillStatus::Active,
                default_version_id: None,
                created_at: now,
                updated_at: now,
            };
            info!(skill = %skill.slug, id = %skill.id, "Created skill");
            state.skills.push(skill.clone());
            skill
        };

        self.save(&state)?;
        Ok(skill)
    }

    /// Look up a skill by id.
    pub async fn skill(&self, id: Uuid) -> Option<Skill> {
        self.state.read().await.skills.iter().find(|s| s.id == id).cloned()
    }

    /// Look up a skill by slug.
    pub async fn skill_by_slug(&self, slug: &str) -> Option<Skill> {
        self.state
            .read()
            .await
            .skills
            .iter()
            .find(|s| s.slug == slug)
            .cloned()
    }

    /// All skills, sorted by slug.
    ///
    /// # Example
    ///
    /// ```
    /// use skillgate::store::{NewSkill, SkillStore, SourceKind};
    ///
    /// # tokio_test::block_on(async {
    /// let store = SkillStore::in_memory();
    /// for slug in ["zip-tools", "pdf-tools"] {
    ///     store
    ///         .upsert_skill(NewSkill {
    ///             slug: slug.to_string(),
    ///             display_name: slug.to_string(),
    ///             description: String::new(),
    ///             source_kind: SourceKind::Builtin,
    ///             source_locator: None,
    ///         })
    ///         .await
    ///         .unwrap();
    /// }
    ///
    /// let slugs: Vec<String> = store.list_skills().await.into_iter().map(|s| s.slug).collect();
    /// assert_eq!(slugs, ["pdf-tools", "zip-tools"]);
    /// # })
    /// ```
    pub async fn list_skills(&self) -> Vec<Skill> {
        let mut skills = self.state.read().await.skills.clone();
        skills.sort_by(|a, b| a.slug.cmp(&b.slug));
        skills
    }

    /// Set the skill-level status.
    pub async fn set_skill_status(&self, skill_id: Uuid, status: SkillStatus) -> Result<Skill> {
        let mut state = self.state.write().await;
        let skill = find_skill_mut(&mut state, skill_id)?;
        skill.status = status;
        skill.updated_at = Utc::now();
        let skill = skill.clone();
        self.save(&state)?;
        Ok(skill)
    }

    /// Point the skill at a default version of its own.
    pub async fn set_default_version(&self, skill_id: Uuid, version_id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        if !state
            .versions
            .iter()
            .any(|v| v.id == version_id && v.skill_id == skill_id)
        {
            return Err(SkillError::NotFound(format!(
                "Version {} does not belong to skill {}",
                version_id, skill_id
            )));
        }
        let skill = find_skill_mut(&mut state, skill_id)?;
        skill.default_version_id = Some(version_id);
        skill.updated_at = Utc::now();
        self.save(&state)
    }

    // ---- versions ----

    /// Record a new version. Fails with `DuplicateVersion` when the label
    /// already exists for the skill.
    pub async fn create_version(
        &self,
        skill_id: Uuid,
        manifest: Manifest,
        content_hash: String,
        status: VersionStatus,
    ) -> Result<SkillVersion> {
        let mut state = self.state.write().await;
        let slug = state
            .skills
            .iter()
            .find(|s| s.id == skill_id)
            .map(|s| s.slug.clone())
            .ok_or_else(|| SkillError::NotFound(format!("Skill {}", skill_id)))?;

        if state
            .versions
            .iter()
            .any(|v| v.skill_id == skill_id && v.version == manifest.version)
        {
            return Err(SkillError::DuplicateVersion {
                slug,
                version: manifest.version,
            });
        }

        let version = SkillVersion {
            id: Uuid::new_v4(),
            skill_id,
            version: manifest.version.clone(),
            status,
            manifest,
            content_hash,
            package_path: None,
            status_reason: None,
            created_at: Utc::now(),
            approved_at: None,
            activated_at: None,
        };
        info!(
            skill = %slug,
            version = %version.version,
            status = %version.status,
            "Created skill version"
        );
        state.versions.push(version.clone());
        self.save(&state)?;
        Ok(version)
    }

    /// Look up a version by id.
    pub async fn version(&self, id: Uuid) -> Option<SkillVersion> {
        self.state
            .read()
            .await
            .versions
            .iter()
            .find(|v| v.id == id)
            .cloned()
    }

    /// Look up a version by its label.
    pub async fn find_version(&self, skill_id: Uuid, label: &str) -> Option<SkillVersion> {
        self.state
            .read()
            .await
            .versions
            .iter()
            .find(|v| v.skill_id == skill_id && v.version == label)
            .cloned()
    }

    /// Versions of a skill, oldest first.
    pub async fn versions_for(&self, skill_id: Uuid) -> Vec<SkillVersion> {
        let mut versions: Vec<SkillVersion> = self
            .state
            .read()
            .await
            .versions
            .iter()
            .filter(|v| v.skill_id == skill_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.created_at);
        versions
    }

    /// The active version with the most recent activation stamp.
    pub async fn latest_active_version(&self, skill_id: Uuid) -> Option<SkillVersion> {
        self.state
            .read()
            .await
            .versions
            .iter()
            .filter(|v| v.skill_id == skill_id && v.status == VersionStatus::Active)
            .max_by_key(|v| (v.activated_at, v.created_at))
            .cloned()
    }

    /// Record where the version's package was copied.
    pub async fn set_package_path(&self, version_id: Uuid, path: &Path) -> Result<SkillVersion> {
        let mut state = self.state.write().await;
        let version = find_version_mut(&mut state, version_id)?;
        version.package_path = Some(path.to_path_buf());
        let version = version.clone();
        self.save(&state)?;
        Ok(version)
    }

    /// Move a version to `status`, stamping approval/activation times.
    pub async fn set_version_status(
        &self,
        version_id: Uuid,
        status: VersionStatus,
        reason: Option<String>,
    ) -> Result<SkillVersion> {
        let mut state = self.state.write().await;
        let version = find_version_mut(&mut state, version_id)?;
        let now = Utc::now();

        if version.status == VersionStatus::PendingApproval && status == VersionStatus::Active {
            version.approved_at = Some(now);
        }
        if status == VersionStatus::Active && version.status != VersionStatus::Active {
            version.activated_at = Some(now);
        }
        version.status = status;
        version.status_reason = reason;

        let version = version.clone();
        self.save(&state)?;
        debug!(version = %version.id, status = %status, "Updated version status");
        Ok(version)
    }

    /// Remove a version row that never got a usable package. Only
    /// versions without a package path can be removed.
    pub async fn delete_version(&self, version_id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let version = find_version_mut(&mut state, version_id)?;
        if version.package_path.is_some() {
            return Err(SkillError::Installer(format!(
                "Version {} has a stored package and cannot be removed",
                version_id
            )));
        }
        let skill_id = version.skill_id;
        state.versions.retain(|v| v.id != version_id);
        if let Some(skill) = state.skills.iter_mut().find(|s| s.id == skill_id) {
            if skill.default_version_id == Some(version_id) {
                skill.default_version_id = None;
            }
        }
        self.save(&state)?;
        debug!(version = %version_id, "Removed version row");
        Ok(())
    }

    // ---- bindings ----

    /// Create the binding for (skill, scope, scope id), or replace its
    /// version, flag and policy.
    pub async fn upsert_binding(&self, new: NewBinding) -> Result<SkillBinding> {
        let mut state = self.state.write().await;
        if !state.skills.iter().any(|s| s.id == new.skill_id) {
            return Err(SkillError::NotFound(format!("Skill {}", new.skill_id)));
        }
        if let Some(version_id) = new.version_id {
            if !state
                .versions
                .iter()
                .any(|v| v.id == version_id && v.skill_id == new.skill_id)
            {
                return Err(SkillError::NotFound(format!(
                    "Version {} does not belong to skill {}",
                    version_id, new.skill_id
                )));
            }
        }
        let scope_id = match new.scope {
            ScopeKind::System => None,
            _ => Some(new.scope_id.filter(|s| !s.trim().is_empty()).ok_or_else(|| {
                SkillError::Config(format!("A {} binding needs a scope id", new.scope))
            })?),
        };

        let now = Utc::now();
        let binding = if let Some(existing) = state.bindings.iter_mut().find(|b| {
            b.skill_id == new.skill_id && b.scope == new.scope && b.scope_id == scope_id
        }) {
            existing.version_id = new.version_id;
            existing.enabled = new.enabled;
            existing.policy = new.policy;
            existing.updated_at = now;
            existing.clone()
        } else {
            let binding = SkillBinding {
                id: Uuid::new_v4(),
                skill_id: new.skill_id,
                version_id: new.version_id,
                scope: new.scope,
                scope_id,
                enabled: new.enabled,
                policy: new.policy,
                created_at: now,
                updated_at: now,
            };
            state.bindings.push(binding.clone());
            binding
        };

        info!(
            skill = %binding.skill_id,
            scope = %binding.scope,
            scope_id = ?binding.scope_id,
            enabled = binding.enabled,
            "Saved skill binding"
        );
        self.save(&state)?;
        Ok(binding)
    }

    /// Enable or disable a binding.
    pub async fn set_binding_enabled(&self, binding_id: Uuid, enabled: bool) -> Result<SkillBinding> {
        let mut state = self.state.write().await;
        let binding = state
            .bindings
            .iter_mut()
            .find(|b| b.id == binding_id)
            .ok_or_else(|| SkillError::NotFound(format!("Binding {}", binding_id)))?;
        binding.enabled = enabled;
        binding.updated_at = Utc::now();
        let binding = binding.clone();
        self.save(&state)?;
        Ok(binding)
    }

    /// All bindings of a skill, in storage order.
    pub async fn bindings_for(&self, skill_id: Uuid) -> Vec<SkillBinding> {
        self.state
            .read()
            .await
            .bindings
            .iter()
            .filter(|b| b.skill_id == skill_id)
            .cloned()
            .collect()
    }

    // ---- approvals ----

    /// Persist a new approval request. Resolved requests past the
    /// retention window are dropped in the same write.
    pub async fn create_approval(&self, record: ApprovalRecord) -> Result<()> {
        let mut state = self.state.write().await;
        let pruned = prune_approvals(&mut state.approvals, Utc::now() - self.approval_retention);
        if pruned > 0 {
            debug!(pruned = pruned, "Pruned resolved approval requests");
        }
        state.approvals.push(record);
        self.save(&state)
    }

    /// Look up an approval request.
    pub async fn approval(&self, id: Uuid) -> Option<ApprovalRecord> {
        self.state
            .read()
            .await
            .approvals
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    /// Move a pending request to a terminal decision. Fails when the request
    /// is unknown or already resolved.
    pub async fn resolve_approval(
        &self,
        id: Uuid,
        decision: ApprovalDecision,
        decided_by: Option<String>,
    ) -> Result<ApprovalRecord> {
        if !decision.is_terminal() {
            return Err(SkillError::Approval(
                "Cannot resolve a request to pending".to_string(),
            ));
        }
        let mut state = self.state.write().await;
        let record = state
            .approvals
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| SkillError::NotFound(format!("Approval request {}", id)))?;
        if record.decision.is_terminal() {
            return Err(SkillError::Approval(format!(
                "Approval request {} is already {}",
                id, record.decision
            )));
        }
        record.decision = decision;
        record.decided_at = Some(Utc::now());
        record.decided_by = decided_by;
        let record = record.clone();
        self.save(&state)?;
        Ok(record)
    }

    /// Whether the session already approved this skill once.
    pub async fn has_session_approval(&self, session_id: &str, skill_id: Uuid) -> bool {
        self.state.read().await.approvals.iter().any(|a| {
            a.skill_id == skill_id
                && a.decision == ApprovalDecision::Approved
                && a.session_id.as_deref() == Some(session_id)
        })
    }

    /// Pending requests, oldest first.
    pub async fn pending_approvals(&self) -> Vec<ApprovalRecord> {
        let mut pending: Vec<ApprovalRecord> = self
            .state
            .read()
            .await
            .approvals
            .iter()
            .filter(|a| a.decision == ApprovalDecision::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|a| a.created_at);
        pending
    }

    // ---- persistence ----

    fn save(&self, state: &RegistryState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SkillError::Config(format!(
                    "Failed to create registry directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| {
            SkillError::Config(format!("Failed to write registry to {}: {}", tmp.display(), e))
        })?;
        std::fs::rename(&tmp, path).map_err(|e| {
            SkillError::Config(format!("Failed to replace registry {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    fn load(path: &Path) -> Result<RegistryState> {
        if !path.exists() {
            return Ok(RegistryState::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            SkillError::Config(format!("Failed to read registry {}: {}", path.display(), e))
        })?;
        if content.trim().is_empty() {
            return Ok(RegistryState::default());
        }
        serde_json::from_str(&content).map_err(|e| {
            SkillError::Config(format!("Failed to parse registry {}: {}", path.display(), e))
        })
    }
}

fn find_skill_mut(state: &mut RegistryState, id: Uuid) -> Result<&mut Skill> {
    state
        .skills
        .iter_mut()
        .find(|s| s.id == id)
        .ok_or_else(|| SkillError::NotFound(format!("Skill {}", id)))
}

fn find_version_mut(state: &mut RegistryState, id: Uuid) -> Result<&mut SkillVersion> {
    state
        .versions
        .iter_mut()
        .find(|v| v.id == id)
        .ok_or_else(|| SkillError::NotFound(format!("Version {}", id)))
}

/// Drop resolved requests decided before `cutoff`. Pending requests and
/// the latest approval of every (session, skill) pair always stay.
fn prune_approvals(approvals: &mut Vec<ApprovalRecord>, cutoff: DateTime<Utc>) -> usize {
    let mut latest: HashMap<(&str, Uuid), (DateTime<Utc>, Uuid)> = HashMap::new();
    for a in approvals.iter() {
        if a.decision != ApprovalDecision::Approved {
            continue;
        }
        let Some(session) = a.session_id.as_deref() else {
            continue;
        };
        let at = a.decided_at.unwrap_or(a.created_at);
        let entry = latest.entry((session, a.skill_id)).or_insert((at, a.id));
        if at >= entry.0 {
            *entry = (at, a.id);
        }
    }
    let keep: HashSet<Uuid> = latest.into_values().map(|(_, id)| id).collect();

    let before = approvals.len();
    approvals.retain(|a| {
        !a.decision.is_terminal()
            || keep.contains(&a.id)
            || a.decided_at.unwrap_or(a.created_at) >= cutoff
    });
    before - approvals.len()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::manifest::{RiskLevel, RuntimeKind, RuntimeSpec, ToolDescriptor};
    use serde_json::json;
    use tempfile::TempDir;

    pub(crate) fn manifest(id: &str, version: &str, risk: RiskLevel) -> Manifest {
        Manifest {
            id: id.to_string(),
            name: id.to_string(),
            version: version.to_string(),
            entry: "main.py".to_string(),
            description: String::new(),
            tools: vec![ToolDescriptor {
                name: format!("{}_run", id.replace('-', "_")),
                description: "run".to_string(),
                input_schema: json!({"type": "object"}),
                aliases: vec![],
            }],
            dependencies: vec![],
            capabilities: vec![],
            runtime: RuntimeSpec::new(RuntimeKind::Python),
            permissions: vec![],
            platforms: vec![],
            risk_level: risk,
        }
    }

    pub(crate) fn new_skill(slug: &str) -> NewSkill {
        NewSkill {
            slug: slug.to_string(),
            display_name: slug.to_string(),
            description: String::new(),
            source_kind: SourceKind::RemoteRepository,
            source_locator: Some(format!("acme/{}@main", slug)),
        }
    }

    #[tokio::test]
    async fn test_upsert_skill_refreshes_metadata() {
        let store = SkillStore::in_memory();
        let first = store.upsert_skill(new_skill("demo")).await.unwrap();
        let mut update = new_skill("demo");
        update.display_name = "Demo v2".to_string();
        let second = store.upsert_skill(update).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.display_name, "Demo v2");
        assert_eq!(store.list_skills().await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_version_rejected() {
        let store = SkillStore::in_memory();
        let skill = store.upsert_skill(new_skill("demo")).await.unwrap();
        store
            .create_version(
                skill.id,
                manifest("demo", "1.0.0", RiskLevel::Low),
                "h".into(),
                VersionStatus::PendingValidation,
            )
            .await
            .unwrap();

        let err = store
            .create_version(
                skill.id,
                manifest("demo", "1.0.0", RiskLevel::Low),
                "h".into(),
                VersionStatus::PendingValidation,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SkillError::DuplicateVersion { .. }));
        assert_eq!(store.versions_for(skill.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_status_transitions_stamp_times() {
        let store = SkillStore::in_memory();
        let skill = store.upsert_skill(new_skill("demo")).await.unwrap();
        let version = store
            .create_version(
                skill.id,
                manifest("demo", "1.0.0", RiskLevel::High),
                "h".into(),
                VersionStatus::PendingApproval,
            )
            .await
            .unwrap();

        let active = store
            .set_version_status(version.id, VersionStatus::Active, None)
            .await
            .unwrap();
        assert!(active.approved_at.is_some());
        assert!(active.activated_at.is_some());
        assert_eq!(
            store.latest_active_version(skill.id).await.map(|v| v.id),
            Some(version.id)
        );
    }

    #[tokio::test]
    async fn test_binding_uniqueness_per_scope() {
        let store = SkillStore::in_memory();
        let skill = store.upsert_skill(new_skill("demo")).await.unwrap();
        let bind = |scope_id: &str, enabled: bool| NewBinding {
            skill_id: skill.id,
            version_id: None,
            scope: ScopeKind::Session,
            scope_id: Some(scope_id.to_string()),
            enabled,
            policy: json!({}),
        };

        let a = store.upsert_binding(bind("s1", true)).await.unwrap();
        let b = store.upsert_binding(bind("s1", false)).await.unwrap();
        store.upsert_binding(bind("s2", true)).await.unwrap();

        assert_eq!(a.id, b.id);
        assert!(!b.enabled);
        assert_eq!(store.bindings_for(skill.id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_scoped_binding_requires_scope_id() {
        let store = SkillStore::in_memory();
        let skill = store.upsert_skill(new_skill("demo")).await.unwrap();
        let result = store
            .upsert_binding(NewBinding {
                skill_id: skill.id,
                version_id: None,
                scope: ScopeKind::User,
                scope_id: None,
                enabled: true,
                policy: json!({}),
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_approval_resolves_once() {
        let store = SkillStore::in_memory();
        let skill = store.upsert_skill(new_skill("demo")).await.unwrap();
        let now = Utc::now();
        let record = ApprovalRecord {
            id: Uuid::new_v4(),
            skill_id: skill.id,
            version_id: Uuid::new_v4(),
            tool_name: "demo_run".into(),
            call_id: "c1".into(),
            session_id: Some("s1".into()),
            actor_id: Some("u1".into()),
            reason: "medium risk".into(),
            payload: json!({}),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(60),
            decision: ApprovalDecision::Pending,
            decided_at: None,
            decided_by: None,
        };
        store.create_approval(record.clone()).await.unwrap();
        assert!(!store.has_session_approval("s1", skill.id).await);

        store
            .resolve_approval(record.id, ApprovalDecision::Approved, Some("op".into()))
            .await
            .unwrap();
        assert!(store.has_session_approval("s1", skill.id).await);
        assert!(!store.has_session_approval("s2", skill.id).await);

        assert!(store
            .resolve_approval(record.id, ApprovalDecision::Denied, None)
            .await
            .is_err());
    }

    fn approval(skill_id: Uuid, session: &str, decision: ApprovalDecision, age_hours: i64) -> ApprovalRecord {
        let at = Utc::now() - chrono::Duration::hours(age_hours);
        ApprovalRecord {
            id: Uuid::new_v4(),
            skill_id,
            version_id: Uuid::new_v4(),
            tool_name: "demo_run".into(),
            call_id: format!("c-{}", age_hours),
            session_id: Some(session.into()),
            actor_id: None,
            reason: "medium risk".into(),
            payload: json!({}),
            created_at: at,
            expires_at: at + chrono::Duration::seconds(60),
            decision,
            decided_at: decision.is_terminal().then_some(at),
            decided_by: None,
        }
    }

    #[tokio::test]
    async fn test_resolved_approvals_pruned_after_retention() {
        let store = SkillStore::in_memory().with_approval_retention(3600);
        let skill = store.upsert_skill(new_skill("demo")).await.unwrap();

        let old_denied = approval(skill.id, "s1", ApprovalDecision::Denied, 48);
        let old_expired = approval(skill.id, "s1", ApprovalDecision::Expired, 30);
        let older_approved = approval(skill.id, "s1", ApprovalDecision::Approved, 72);
        let latest_approved = approval(skill.id, "s1", ApprovalDecision::Approved, 24);
        let stale_pending = approval(skill.id, "s2", ApprovalDecision::Pending, 24);
        for record in [&old_denied, &old_expired, &older_approved, &latest_approved, &stale_pending] {
            store.create_approval(record.clone()).await.unwrap();
        }
        let fresh = approval(skill.id, "s3", ApprovalDecision::Pending, 0);
        store.create_approval(fresh.clone()).await.unwrap();

        assert!(store.approval(old_denied.id).await.is_none());
        assert!(store.approval(old_expired.id).await.is_none());
        assert!(store.approval(older_approved.id).await.is_none());
        assert!(store.approval(latest_approved.id).await.is_some());
        assert!(store.approval(stale_pending.id).await.is_some());
        assert!(store.approval(fresh.id).await.is_some());
        assert!(store.has_session_approval("s1", skill.id).await);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("registry.json");

        let store = SkillStore::open(&path).unwrap();
        let skill = store.upsert_skill(new_skill("demo")).await.unwrap();
        store
            .create_version(
                skill.id,
                manifest("demo", "1.0.0", RiskLevel::Low),
                "abc".into(),
                VersionStatus::PendingValidation,
            )
            .await
            .unwrap();
        drop(store);

        let reopened = SkillStore::open(&path).unwrap();
        let found = reopened.skill_by_slug("demo").await.unwrap();
        let versions = reopened.versions_for(found.id).await;
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].content_hash, "abc");
        assert_eq!(versions[0].manifest.id, "demo");
    }
}
