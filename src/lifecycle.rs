//! Version lifecycle operations
//!
//! ```text
//! pending_validation --validate--> active --deprecate--> deprecated
//! pending_approval   --approve---> active
//! pending_*          --reject----> rejected
//! ```
//!
//! Activation stamps `activated_at` and makes the version the skill's
//! default when the skill has none yet.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, SkillError};
use crate::installer::hash_blocking;
use crate::security::resolve_within_root;
use crate::store::{SkillStore, SkillVersion, VersionStatus};

/// Operator-facing version transitions.
#[derive(Clone)]
pub struct SkillLifecycle {
    store: Arc<SkillStore>,
}

impl SkillLifecycle {
    pub fn new(store: Arc<SkillStore>) -> Self {
        Self { store }
    }

    /// Re-check a `pending_validation` version and promote it to `active`.
    ///
    /// The package must still be on disk, contain its entry file and hash to
    /// the recorded content hash. A failed check rejects the version.
    pub async fn validate_version(&self, version_id: Uuid) -> Result<SkillVersion> {
        let version = self.load(version_id).await?;
        expect_status(&version, VersionStatus::PendingValidation, "validate")?;

        if let Err(problem) = self.check_package(&version).await {
            warn!(version = %version.id, problem = %problem, "Version failed validation");
            self.store
                .set_version_status(version.id, VersionStatus::Rejected, Some(problem.clone()))
                .await?;
            return Err(SkillError::Installer(format!(
                "Version {} failed validation: {}",
                version.version, problem
            )));
        }

        self.activate(version.id, false).await
    }

    /// Operator approval of a `pending_approval` version.
    pub async fn approve_version(&self, version_id: Uuid, make_default: bool) -> Result<SkillVersion> {
        let version = self.load(version_id).await?;
        expect_status(&version, VersionStatus::PendingApproval, "approve")?;
        if version.package_path.is_none() {
            return Err(SkillError::Installer(format!(
                "Version {} has no installed package",
                version.version
            )));
        }
        self.activate(version.id, make_default).await
    }

    /// Reject a version that has not been activated.
    pub async fn reject_version(&self, version_id: Uuid, reason: Option<String>) -> Result<SkillVersion> {
        let version = self.load(version_id).await?;
        if !matches!(
            version.status,
            VersionStatus::PendingValidation | VersionStatus::PendingApproval
        ) {
            return Err(SkillError::Installer(format!(
                "Cannot reject version {} in status {}",
                version.version, version.status
            )));
        }
        let version = self
            .store
            .set_version_status(version_id, VersionStatus::Rejected, reason)
            .await?;
        info!(version = %version.id, label = %version.version, "Rejected skill version");
        Ok(version)
    }

    /// Retire an active version.
    pub async fn deprecate_version(
        &self,
        version_id: Uuid,
        reason: Option<String>,
    ) -> Result<SkillVersion> {
        let version = self.load(version_id).await?;
        expect_status(&version, VersionStatus::Active, "deprecate")?;
        let version = self
            .store
            .set_version_status(version_id, VersionStatus::Deprecated, reason)
            .await?;
        info!(version = %version.id, label = %version.version, "Deprecated skill version");
        Ok(version)
    }

    /// Mark a version active and update the skill's default pointer.
    pub(crate) async fn activate(&self, version_id: Uuid, make_default: bool) -> Result<SkillVersion> {
        let version = self
            .store
            .set_version_status(version_id, VersionStatus::Active, None)
            .await?;

        let skill = self
            .store
            .skill(version.skill_id)
            .await
            .ok_or_else(|| SkillError::NotFound(format!("Skill {}", version.skill_id)))?;
        if make_default || skill.default_version_id.is_none() {
            self.store
                .set_default_version(skill.id, version.id)
                .await?;
        }

        info!(
            skill = %skill.slug,
            version = %version.version,
            default = make_default || skill.default_version_id.is_none(),
            "Activated skill version"
        );
        Ok(version)
    }

    async fn load(&self, version_id: Uuid) -> Result<SkillVersion> {
        self.store
            .version(version_id)
            .await
            .ok_or_else(|| SkillError::NotFound(format!("Version {}", version_id)))
    }

    async fn check_package(&self, version: &SkillVersion) -> std::result::Result<(), String> {
        let Some(path) = version.package_path.clone() else {
            return Err("no installed package".to_string());
        };
        if !path.is_dir() {
            return Err(format!("package directory {} is missing", path.display()));
        }
        let entry = resolve_within_root(&path, &version.manifest.entry).map_err(|e| e.to_string())?;
        if !entry.as_path().is_file() {
            return Err(format!("entry file '{}' is missing", version.manifest.entry));
        }
        let hash = hash_blocking(path).await.map_err(|e| e.to_string())?;
        if hash != version.content_hash {
            return Err("package content changed since install".to_string());
        }
        Ok(())
    }
}

fn expect_status(version: &SkillVersion, expected: VersionStatus, action: &str) -> Result<()> {
    if version.status != expected {
        return Err(SkillError::Installer(format!(
            "Cannot {} version {}: status is {}, expected {}",
            action, version.version, version.status, expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::content_hash;
    use crate::manifest::RiskLevel;
    use crate::store::tests::{manifest, new_skill};
    use tempfile::TempDir;

    async fn installed(
        store: &SkillStore,
        dir: &TempDir,
        label: &str,
        status: VersionStatus,
    ) -> SkillVersion {
        let pkg = dir.path().join(label);
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("main.py"), "print('{}')").unwrap();
        let skill = store.upsert_skill(new_skill("demo")).await.unwrap();
        let version = store
            .create_version(
                skill.id,
                manifest("demo", label, RiskLevel::Low),
                content_hash(&pkg).unwrap(),
                status,
            )
            .await
            .unwrap();
        store.set_package_path(version.id, &pkg).await.unwrap()
    }

    #[tokio::test]
    async fn test_validate_promotes_and_sets_default() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(SkillStore::in_memory());
        let lifecycle = SkillLifecycle::new(Arc::clone(&store));
        let version = installed(&store, &tmp, "1.0.0", VersionStatus::PendingValidation).await;

        let active = lifecycle.validate_version(version.id).await.unwrap();
        assert_eq!(active.status, VersionStatus::Active);
        assert!(active.activated_at.is_some());
        let skill = store.skill(version.skill_id).await.unwrap();
        assert_eq!(skill.default_version_id, Some(version.id));
    }

    #[tokio::test]
    async fn test_validate_rejects_tampered_package() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(SkillStore::in_memory());
        let lifecycle = SkillLifecycle::new(Arc::clone(&store));
        let version = installed(&store, &tmp, "1.0.0", VersionStatus::PendingValidation).await;
        std::fs::write(tmp.path().join("1.0.0/extra.py"), "import os").unwrap();

        assert!(lifecycle.validate_version(version.id).await.is_err());
        let stored = store.version(version.id).await.unwrap();
        assert_eq!(stored.status, VersionStatus::Rejected);
        assert!(stored.status_reason.unwrap().contains("changed"));
    }

    #[tokio::test]
    async fn test_approve_requires_pending_approval() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(SkillStore::in_memory());
        let lifecycle = SkillLifecycle::new(Arc::clone(&store));
        let pending = installed(&store, &tmp, "1.0.0", VersionStatus::PendingApproval).await;
        let other = installed(&store, &tmp, "1.1.0", VersionStatus::PendingValidation).await;

        assert!(lifecycle.approve_version(other.id, false).await.is_err());
        let approved = lifecycle.approve_version(pending.id, false).await.unwrap();
        assert!(approved.approved_at.is_some());
        assert_eq!(approved.status, VersionStatus::Active);
    }

    #[tokio::test]
    async fn test_make_default_moves_pointer() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(SkillStore::in_memory());
        let lifecycle = SkillLifecycle::new(Arc::clone(&store));
        let v1 = installed(&store, &tmp, "1.0.0", VersionStatus::PendingApproval).await;
        let v2 = installed(&store, &tmp, "2.0.0", VersionStatus::PendingApproval).await;

        lifecycle.approve_version(v1.id, false).await.unwrap();
        lifecycle.approve_version(v2.id, false).await.unwrap();
        let skill = store.skill(v1.skill_id).await.unwrap();
        assert_eq!(skill.default_version_id, Some(v1.id));

        lifecycle.approve_version(v2.id, true).await.unwrap_err();
        let v3 = installed(&store, &tmp, "3.0.0", VersionStatus::PendingApproval).await;
        lifecycle.approve_version(v3.id, true).await.unwrap();
        let skill = store.skill(v1.skill_id).await.unwrap();
        assert_eq!(skill.default_version_id, Some(v3.id));
    }

    #[tokio::test]
    async fn test_reject_and_deprecate() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(SkillStore::in_memory());
        let lifecycle = SkillLifecycle::new(Arc::clone(&store));
        let v1 = installed(&store, &tmp, "1.0.0", VersionStatus::PendingApproval).await;
        let v2 = installed(&store, &tmp, "2.0.0", VersionStatus::PendingValidation).await;

        let rejected = lifecycle
            .reject_version(v1.id, Some("unsafe".into()))
            .await
            .unwrap();
        assert_eq!(rejected.status, VersionStatus::Rejected);
        assert!(lifecycle.deprecate_version(v1.id, None).await.is_err());

        lifecycle.validate_version(v2.id).await.unwrap();
        let deprecated = lifecycle.deprecate_version(v2.id, None).await.unwrap();
        assert_eq!(deprecated.status, VersionStatus::Deprecated);
        assert!(lifecycle.reject_version(v2.id, None).await.is_err());
    }
}
