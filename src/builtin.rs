//! Built-in skill sync
//!
//! Every sub-directory of the built-in directory that carries a native
//! manifest is registered as a `builtin` skill with an active default
//! version. Versions already in the registry are left alone.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::installer::{Installer, PackageOrigin};
use crate::lifecycle::SkillLifecycle;
use crate::manifest::load_manifest_from_dir;
use crate::store::{SkillStore, SourceKind, VersionStatus};

/// What one sync pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuiltinSyncReport {
    /// `slug@version` of newly installed versions.
    pub installed: Vec<String>,
    /// `slug@version` already present.
    pub unchanged: Vec<String>,
    /// Directory name and error of packages that could not be installed.
    pub failed: Vec<(String, String)>,
}

/// Install missing built-in versions from `dir`.
///
/// A missing directory is not an error. Failures of single packages are
/// collected in the report so one broken package does not block the rest.
pub async fn sync_builtin_skills(
    installer: &Installer,
    store: &Arc<SkillStore>,
    dir: &Path,
) -> Result<BuiltinSyncReport> {
    let mut report = BuiltinSyncReport::default();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(dir = %dir.display(), "No built-in skill directory");
            return Ok(report);
        }
        Err(e) => return Err(e.into()),
    };

    let mut packages: Vec<_> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    packages.sort();

    let lifecycle = SkillLifecycle::new(Arc::clone(store));
    for path in packages {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let manifest = match load_manifest_from_dir(&path) {
            Ok(Some((manifest, _))) => manifest,
            Ok(None) => continue,
            Err(e) => {
                warn!(package = %name, error = %e, "Invalid built-in manifest");
                report.failed.push((name, e.to_string()));
                continue;
            }
        };
        let label = format!("{}@{}", manifest.id, manifest.version);

        if let Some(skill) = store.skill_by_slug(&manifest.id).await {
            let builtin = skill.source_kind == SourceKind::Builtin;
            if builtin && store.find_version(skill.id, &manifest.version).await.is_some() {
                report.unchanged.push(label);
                continue;
            }
        }

        let outcome = match installer
            .install_from_dir(&path, PackageOrigin::Builtin(path.clone()), false)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(package = %name, error = %e, "Failed to install built-in skill");
                report.failed.push((name, e.to_string()));
                continue;
            }
        };

        // Built-ins ship with the host and skip the approval queue.
        if outcome.version.status != VersionStatus::Active {
            lifecycle.activate(outcome.version.id, true).await?;
        }
        info!(skill = %label, "Synced built-in skill");
        report.installed.push(label);
    }

    Ok(report)
}
