//! Shared wiring for CLI commands.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use skillgate::compat::CompatAdapter;
use skillgate::config::Config;
use skillgate::installer::Installer;
use skillgate::source::SourceFetcher;
use skillgate::store::{Skill, SkillStore, SkillVersion};

/// Load the configuration from `path`, or the default location.
pub(crate) fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    config.with_context(|| "Failed to load configuration")
}

pub(crate) fn open_store(config: &Config) -> Result<Arc<SkillStore>> {
    let path = config.registry_path();
    let store = SkillStore::open(&path)
        .with_context(|| format!("Failed to open registry {}", path.display()))?
        .with_approval_retention(config.approval.retention_secs);
    Ok(Arc::new(store))
}

pub(crate) fn build_installer(config: &Config, store: &Arc<SkillStore>) -> Installer {
    Installer::new(
        Arc::clone(store),
        SourceFetcher::http(config.fetch.clone()),
        CompatAdapter::new(config.builtin.reserved_slugs.iter().cloned()),
        config.packages_dir(),
        config.fetch.web_host.clone(),
    )
}

pub(crate) async fn find_skill(store: &SkillStore, slug: &str) -> Result<Skill> {
    store
        .skill_by_slug(slug)
        .await
        .with_context(|| format!("Skill '{}' is not installed", slug))
}

pub(crate) async fn find_version(store: &SkillStore, slug: &str, label: &str) -> Result<SkillVersion> {
    let skill = find_skill(store, slug).await?;
    store
        .find_version(skill.id, label)
        .await
        .with_context(|| format!("Skill '{}' has no version {}", slug, label))
}
