//! Skill package installer
//!
//! Installation runs fetch, manifest discovery (or the compatibility
//! adapter), content hashing and registry writes, then copies the package
//! into `<storage-root>/packages/<slug>/<version-id>/`. The scratch directory
//! is a `TempDir` owned by the install call, so it is removed on every exit
//! path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::compat::CompatAdapter;
use crate::error::{Result, SkillError};
use crate::lifecycle::SkillLifecycle;
use crate::manifest::{load_manifest_from_dir, Manifest};
use crate::security::resolve_within_root;
use crate::source::{SourceFetcher, SourceRef};
use crate::store::{NewSkill, Skill, SkillStore, SkillVersion, SourceKind, VersionStatus};

/// Where a package being installed came from.
#[derive(Debug, Clone)]
pub enum PackageOrigin {
    /// A remote repository snapshot.
    Remote(SourceRef),
    /// A built-in package directory.
    Builtin(PathBuf),
}

impl PackageOrigin {
    fn kind(&self) -> SourceKind {
        match self {
            PackageOrigin::Remote(_) => SourceKind::RemoteRepository,
            PackageOrigin::Builtin(_) => SourceKind::Builtin,
        }
    }

    fn locator(&self) -> String {
        match self {
            PackageOrigin::Remote(source) => source.locator(),
            PackageOrigin::Builtin(dir) => dir.display().to_string(),
        }
    }
}

/// Result of a successful install.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub skill: Skill,
    pub version: SkillVersion,
    /// The manifest was synthesized from an instruction document.
    pub adapted: bool,
}

/// Orchestrates package installation.
pub struct Installer {
    store: Arc<SkillStore>,
    fetcher: SourceFetcher,
    lifecycle: SkillLifecycle,
    compat: CompatAdapter,
    packages_dir: PathBuf,
    web_host: String,
}

impl Installer {
    /// Create an installer writing packages below `packages_dir`.
    pub fn new(
        store: Arc<SkillStore>,
        fetcher: SourceFetcher,
        compat: CompatAdapter,
        packages_dir: PathBuf,
        web_host: impl Into<String>,
    ) -> Self {
        Self {
            lifecycle: SkillLifecycle::new(Arc::clone(&store)),
            store,
            fetcher,
            compat,
            packages_dir,
            web_host: web_host.into(),
        }
    }

    /// Install from a source reference string.
    ///
    /// With `auto_activate`, a version that starts in `pending_validation`
    /// is validated and promoted right away.
    pub async fn install(
        &self,
        source: &str,
        token: Option<&str>,
        auto_activate: bool,
    ) -> Result<InstallOutcome> {
        let source = SourceRef::parse_with_host(source, &self.web_host)?;
        info!(source = %source, "Installing skill");

        let scratch = self.fetcher.fetch(&source, token).await?;
        let result = self
            .install_from_dir(scratch.path(), PackageOrigin::Remote(source.clone()), auto_activate)
            .await;
        drop(scratch);

        if let Err(e) = &result {
            warn!(source = %source, error = %e, "Skill installation failed");
        }
        result
    }

    /// Install an already extracted package directory.
    pub async fn install_from_dir(
        &self,
        dir: &Path,
        origin: PackageOrigin,
        auto_activate: bool,
    ) -> Result<InstallOutcome> {
        let (manifest, adapted) = self.resolve_manifest(dir, &origin).await?;

        let entry = resolve_within_root(dir, &manifest.entry)?;
        if !entry.as_path().is_file() {
            return Err(SkillError::Installer(format!(
                "Entry file '{}' declared by skill '{}' is missing",
                manifest.entry, manifest.id
            )));
        }

        // A slug keeps the origin it was first installed from.
        if let Some(existing) = self.store.skill_by_slug(&manifest.id).await {
            if existing.source_kind != origin.kind() {
                let owner = match existing.source_kind {
                    SourceKind::Builtin => "reserved for a built-in skill",
                    SourceKind::RemoteRepository => "already taken by a skill installed from a repository",
                };
                return Err(SkillError::Installer(format!(
                    "Skill id '{}' is {}",
                    manifest.id, owner
                )));
            }
        }

        let content_hash = hash_blocking(dir.to_path_buf()).await?;
        let status = VersionStatus::initial_for(manifest.risk_level);

        let skill = self
            .store
            .upsert_skill(NewSkill {
                slug: manifest.id.clone(),
                display_name: manifest.name.clone(),
                description: manifest.description.clone(),
                source_kind: origin.kind(),
                source_locator: Some(origin.locator()),
            })
            .await?;
        let version = self
            .store
            .create_version(skill.id, manifest, content_hash, status)
            .await?;

        let dest = self
            .packages_dir
            .join(&skill.slug)
            .join(version.id.to_string());
        let (src, dst) = (dir.to_path_buf(), dest.clone());
        let copied = match tokio::task::spawn_blocking(move || copy_tree(&src, &dst)).await {
            Ok(copied) => copied,
            Err(e) => Err(SkillError::Installer(format!("Package copy task failed: {}", e))),
        };
        if let Err(e) = copied {
            let _ = std::fs::remove_dir_all(&dest);
            // Drop the row so the same version can be installed again.
            self.store.delete_version(version.id).await?;
            return Err(SkillError::Installer(format!(
                "Failed to store package for '{}': {}",
                skill.slug, e
            )));
        }
        let mut version = self.store.set_package_path(version.id, &dest).await?;

        info!(
            skill = %skill.slug,
            version = %version.version,
            status = %version.status,
            adapted,
            path = %dest.display(),
            "Installed skill package"
        );

        if auto_activate && version.status == VersionStatus::PendingValidation {
            version = self.lifecycle.validate_version(version.id).await?;
        }

        let skill = self.store.skill(skill.id).await.unwrap_or(skill);
        Ok(InstallOutcome {
            skill,
            version,
            adapted,
        })
    }

    async fn resolve_manifest(&self, dir: &Path, origin: &PackageOrigin) -> Result<(Manifest, bool)> {
        if let Some((manifest, file)) = load_manifest_from_dir(dir)? {
            info!(skill = %manifest.id, manifest = %file, "Found native manifest");
            return Ok((manifest, false));
        }

        let PackageOrigin::Remote(source) = origin else {
            return Err(SkillError::Installer(format!(
                "No manifest found in {}",
                dir.display()
            )));
        };

        let mut adapter = self.compat.clone();
        for skill in self.store.list_skills().await {
            if skill.source_kind == SourceKind::Builtin {
                adapter.reserve(skill.slug);
            }
        }
        match adapter.adapt(dir, source)? {
            Some(manifest) => Ok((manifest, true)),
            None => Err(SkillError::Installer(format!(
                "No manifest or instruction document found in {}",
                source
            ))),
        }
    }
}

/// Deterministic hex SHA-256 over the sorted (relative path, content) pairs
/// of every regular file below `root`.
pub fn content_hash(root: &Path) -> Result<String> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for relative in &files {
        let bytes = std::fs::read(root.join(relative))?;
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub(crate) async fn hash_blocking(root: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || content_hash(&root))
        .await
        .map_err(|e| SkillError::Installer(format!("Hashing task failed: {}", e)))?
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| SkillError::Installer(e.to_string()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.push(relative);
        }
    }
    Ok(())
}

/// Recursively copy regular files and directories. Symlinks are skipped.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
