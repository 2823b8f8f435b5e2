//! Install, lifecycle, binding and audit commands.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::json;

use skillgate::audit::{AuditFilter, AuditLogger};
use skillgate::builtin::sync_builtin_skills;
use skillgate::config::Config;
use skillgate::lifecycle::SkillLifecycle;
use skillgate::manifest::parse_manifest;
use skillgate::policy::PolicyDecision;
use skillgate::source::SourceRef;
use skillgate::store::{NewBinding, ScopeKind, SkillStatus, SourceKind, VersionStatus};

use super::common::{build_installer, find_skill, find_version, open_store};

/// Arguments of `skillgate bind`.
#[derive(Debug, Args)]
pub(crate) struct BindArgs {
    /// Skill slug
    pub slug: String,
    /// Scope kind: system, user, session or battle_run
    #[arg(long, default_value = "system")]
    pub scope: String,
    /// Scope identifier (required for non-system scopes)
    #[arg(long)]
    pub scope_id: Option<String>,
    /// Pin a version label instead of following the default
    #[arg(long)]
    pub version: Option<String>,
    /// Policy override: allow, deny or require_approval
    #[arg(long)]
    pub decision: Option<String>,
    /// Timeout override in seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,
    /// Disable the binding
    #[arg(long)]
    pub disable: bool,
}

pub(crate) fn cmd_validate(file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let manifest = parse_manifest(&text, &file.display().to_string())?;
    println!(
        "{} {} is valid ({} tool(s), risk {}, runtime {})",
        manifest.id,
        manifest.version,
        manifest.tools.len(),
        manifest.risk_level,
        manifest.runtime.kind.as_str()
    );
    Ok(())
}

pub(crate) fn cmd_parse_source(config: &Config, reference: &str) -> Result<()> {
    let source = SourceRef::parse_with_host(reference, &config.fetch.web_host)?;
    println!("owner:  {}", source.owner);
    println!("repo:   {}", source.repo);
    println!("ref:    {}", source.git_ref);
    println!("subdir: {}", source.subdir.as_deref().unwrap_or("-"));
    println!("url:    {}", source.archive_url(&config.fetch.archive_base_url));
    Ok(())
}

pub(crate) async fn cmd_install(
    config: &Config,
    source: &str,
    token: Option<String>,
    activate: bool,
) -> Result<()> {
    let store = open_store(config)?;
    let installer = build_installer(config, &store);
    let token = token.or_else(|| config.fetch.token.clone());

    let outcome = installer
        .install(source, token.as_deref(), activate)
        .await
        .with_context(|| format!("Failed to install {}", source))?;

    println!(
        "Installed {}@{} ({}){}",
        outcome.skill.slug,
        outcome.version.version,
        outcome.version.status,
        if outcome.adapted { " from instruction document" } else { "" }
    );
    match outcome.version.status {
        VersionStatus::PendingApproval => println!(
            "Risk level {} needs operator approval: skillgate approve {} {}",
            outcome.version.manifest.risk_level, outcome.skill.slug, outcome.version.version
        ),
        VersionStatus::PendingValidation => println!(
            "Activate with: skillgate activate {} {}",
            outcome.skill.slug, outcome.version.version
        ),
        _ => {}
    }
    Ok(())
}

pub(crate) async fn cmd_sync_builtins(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let installer = build_installer(config, &store);
    let dir = config.builtin_dir();

    let report = sync_builtin_skills(&installer, &store, &dir).await?;
    for label in &report.installed {
        println!("installed  {}", label);
    }
    for label in &report.unchanged {
        println!("unchanged  {}", label);
    }
    for (name, error) in &report.failed {
        eprintln!("failed     {}: {}", name, error);
    }
    if !report.failed.is_empty() {
        bail!("{} built-in package(s) failed to sync", report.failed.len());
    }
    Ok(())
}

pub(crate) async fn cmd_list(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let skills = store.list_skills().await;
    if skills.is_empty() {
        println!("No skills installed.");
        return Ok(());
    }

    for skill in skills {
        let default = match skill.default_version_id {
            Some(id) => store
                .version(id)
                .await
                .map(|v| v.version)
                .unwrap_or_else(|| "?".to_string()),
            None => "-".to_string(),
        };
        let kind = match skill.source_kind {
            SourceKind::Builtin => "builtin",
            SourceKind::RemoteRepository => "remote",
        };
        let status = match skill.status {
            SkillStatus::Active => "active",
            SkillStatus::Disabled => "disabled",
        };
        println!(
            "{:<24} {:<10} {:<8} {:<9} {}",
            skill.slug, default, kind, status, skill.display_name
        );
    }
    Ok(())
}

pub(crate) async fn cmd_versions(config: &Config, slug: &str) -> Result<()> {
    let store = open_store(config)?;
    let skill = find_skill(&store, slug).await?;
    for version in store.versions_for(skill.id).await {
        let marker = if skill.default_version_id == Some(version.id) { "*" } else { " " };
        println!(
            "{} {:<12} {:<20} {:<9} {}",
            marker,
            version.version,
            version.status,
            version.manifest.risk_level,
            version.status_reason.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub(crate) async fn cmd_activate(
    config: &Config,
    slug: &str,
    label: &str,
    make_default: bool,
) -> Result<()> {
    let store = open_store(config)?;
    let version = find_version(&store, slug, label).await?;
    let lifecycle = SkillLifecycle::new(Arc::clone(&store));

    let version = match version.status {
        VersionStatus::PendingValidation => lifecycle.validate_version(version.id).await?,
        VersionStatus::Active => version,
        VersionStatus::PendingApproval => bail!(
            "{}@{} is {} risk, use `skillgate approve` instead",
            slug,
            label,
            version.manifest.risk_level
        ),
        status => bail!("{}@{} cannot be activated from status {}", slug, label, status),
    };
    if make_default {
        store.set_default_version(version.skill_id, version.id).await?;
    }
    println!("{}@{} is active", slug, version.version);
    Ok(())
}

pub(crate) async fn cmd_approve(
    config: &Config,
    slug: &str,
    label: &str,
    make_default: bool,
) -> Result<()> {
    let store = open_store(config)?;
    let version = find_version(&store, slug, label).await?;
    let version = SkillLifecycle::new(Arc::clone(&store))
        .approve_version(version.id, make_default)
        .await?;
    println!("{}@{} approved and active", slug, version.version);
    Ok(())
}

pub(crate) async fn cmd_reject(
    config: &Config,
    slug: &str,
    label: &str,
    reason: Option<String>,
) -> Result<()> {
    let store = open_store(config)?;
    let version = find_version(&store, slug, label).await?;
    SkillLifecycle::new(Arc::clone(&store))
        .reject_version(version.id, reason)
        .await?;
    println!("{}@{} rejected", slug, label);
    Ok(())
}

pub(crate) async fn cmd_deprecate(
    config: &Config,
    slug: &str,
    label: &str,
    reason: Option<String>,
) -> Result<()> {
    let store = open_store(config)?;
    let version = find_version(&store, slug, label).await?;
    SkillLifecycle::new(Arc::clone(&store))
        .deprecate_version(version.id, reason)
        .await?;
    println!("{}@{} deprecated", slug, label);
    Ok(())
}

pub(crate) async fn cmd_bind(config: &Config, args: BindArgs) -> Result<()> {
    let scope = ScopeKind::parse(&args.scope)
        .with_context(|| format!("Unknown scope '{}'", args.scope))?;
    if scope != ScopeKind::System && args.scope_id.is_none() {
        bail!("--scope-id is required for {} bindings", scope);
    }
    if let Some(decision) = args.decision.as_deref() {
        if PolicyDecision::parse(decision).is_none() {
            bail!("Unknown decision '{}' (allow, deny, require_approval)", decision);
        }
    }

    let store = open_store(config)?;
    let skill = find_skill(&store, &args.slug).await?;
    let version_id = match args.version.as_deref() {
        Some(label) => Some(find_version(&store, &args.slug, label).await?.id),
        None => None,
    };

    let mut policy = serde_json::Map::new();
    if let Some(decision) = args.decision {
        policy.insert("decision".into(), json!(decision));
    }
    if let Some(timeout) = args.timeout_secs {
        policy.insert("timeout_secs".into(), json!(timeout));
    }

    let binding = store
        .upsert_binding(NewBinding {
            skill_id: skill.id,
            version_id,
            scope,
            scope_id: if scope == ScopeKind::System { None } else { args.scope_id },
            enabled: !args.disable,
            policy: if policy.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::Value::Object(policy)
            },
        })
        .await?;

    println!(
        "Bound {} to {}{} ({})",
        args.slug,
        binding.scope,
        binding
            .scope_id
            .as_deref()
            .map(|id| format!(":{}", id))
            .unwrap_or_default(),
        if binding.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

pub(crate) async fn cmd_audit(
    config: &Config,
    skill: Option<String>,
    session: Option<String>,
    tool: Option<String>,
    failures: bool,
    limit: usize,
) -> Result<()> {
    let skill_id = match skill.as_deref() {
        Some(slug) => {
            let store = open_store(config)?;
            Some(find_skill(&store, slug).await?.id)
        }
        None => None,
    };

    let logger = AuditLogger::new(config.audit_path());
    let rows = logger
        .query(&AuditFilter {
            skill_id,
            session_id: session,
            tool_name: tool,
            only_failures: failures,
            limit: Some(limit),
        })
        .await?;

    if rows.is_empty() {
        println!("No audit rows.");
        return Ok(());
    }
    for row in rows {
        let duration = row
            .duration_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} {:<24} {:<16} {:>8} {}",
            row.created_at.format("%Y-%m-%d %H:%M:%S"),
            row.tool_name,
            row.approval_outcome.as_str(),
            duration,
            row.error.as_deref().unwrap_or("ok")
        );
    }
    Ok(())
}
