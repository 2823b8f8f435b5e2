//! Skill tool registry and dispatcher
//!
//! Built once per conversation: each requested skill is resolved to the
//! binding that governs it in this context and to a runnable version, and
//! every tool of that version is registered under its normalized name and
//! aliases. The first skill to claim a name keeps it.
//!
//! [`SkillToolRegistry::handle`] runs policy, approval, execution and audit
//! for one call and always answers with a [`ToolCallResult`].

mod handler;
mod resolve;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::approval::ApprovalWorkflow;
use crate::audit::AuditLogger;
use crate::manifest::normalize_tool_name;
use crate::policy::BindingPolicy;
use crate::sandbox::SkillSandbox;
use crate::store::{SkillStatus, SkillStore, SourceKind};

pub use handler::SkillToolHandler;
pub use resolve::{binding_matches, resolve_version, select_binding, Unresolved};

/// Who is calling, and from where.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub session_id: Option<String>,
    /// Acting user; `None` is anonymous.
    pub user_id: Option<String>,
    pub battle_run_id: Option<String>,
    pub message_id: Option<String>,
}

/// A tool call issued by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Answer handed back to the chat engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

/// Tool description sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Shared services every handler runs against.
#[derive(Clone)]
pub struct DispatchServices {
    pub store: Arc<SkillStore>,
    pub approvals: ApprovalWorkflow,
    pub sandbox: Arc<SkillSandbox>,
    pub audit: Arc<AuditLogger>,
}

/// Per-conversation mapping from tool names to skill handlers.
pub struct SkillToolRegistry {
    services: DispatchServices,
    context: ConversationContext,
    handlers: Vec<SkillToolHandler>,
    by_name: HashMap<String, usize>,
}

impl SkillToolRegistry {
    fn empty(services: DispatchServices, context: ConversationContext) -> Self {
        Self {
            services,
            context,
            handlers: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Resolve `requested` skill slugs for `context`.
    ///
    /// Built-in skills, unknown slugs, disabled skills and skills without a
    /// runnable version contribute nothing.
    pub async fn build(
        services: DispatchServices,
        context: ConversationContext,
        requested: &[String],
    ) -> Self {
        let mut registry = Self::empty(services, context);

        for slug in requested {
            let Some(skill) = registry.services.store.skill_by_slug(slug).await else {
                debug!(slug = %slug, "Requested skill is not installed");
                continue;
            };
            if skill.source_kind == SourceKind::Builtin {
                debug!(slug = %slug, "Skipping built-in skill");
                continue;
            }
            if skill.status != SkillStatus::Active {
                debug!(slug = %slug, "Skipping disabled skill");
                continue;
            }

            let bindings = registry.services.store.bindings_for(skill.id).await;
            let binding = select_binding(&bindings, &registry.context).cloned();
            let policy = binding
                .as_ref()
                .map(|b| BindingPolicy::from_value(&b.policy))
                .unwrap_or_default();

            match resolve_version(&registry.services.store, &skill, binding.as_ref()).await {
                Ok(version) => {
                    let binding_id = binding.as_ref().map(|b| b.id);
                    for tool in version.manifest.tools.clone() {
                        registry.register(SkillToolHandler {
                            skill: skill.clone(),
                            version: version.clone(),
                            tool,
                            binding_id,
                            policy: policy.clone(),
                        });
                    }
                }
                Err(reason) => {
                    warn!(slug = %slug, reason = ?reason, "Skill has no runnable version");
                }
            }
        }

        info!(
            session = ?registry.context.session_id,
            tools = registry.handlers.len(),
            "Skill tool registry ready"
        );
        registry
    }

    /// Register every active built-in skill at its default version, with
    /// no binding policy.
    pub async fn build_builtins(services: DispatchServices, context: ConversationContext) -> Self {
        let mut registry = Self::empty(services, context);
        for skill in registry.services.store.list_skills().await {
            if skill.source_kind != SourceKind::Builtin || skill.status != SkillStatus::Active {
                continue;
            }
            match resolve_version(&registry.services.store, &skill, None).await {
                Ok(version) => {
                    for tool in version.manifest.tools.clone() {
                        registry.register(SkillToolHandler {
                            skill: skill.clone(),
                            version: version.clone(),
                            tool,
                            binding_id: None,
                            policy: BindingPolicy::default(),
                        });
                    }
                }
                Err(reason) => {
                    warn!(slug = %skill.slug, reason = ?reason, "Built-in skill has no runnable version");
                }
            }
        }
        registry
    }

    fn register(&mut self, handler: SkillToolHandler) {
        let names: Vec<String> = handler.tool.all_names().map(normalize_tool_name).collect();
        if let Some(&owner) = names.iter().find_map(|n| self.by_name.get(n)) {
            warn!(
                tool = %handler.tool.name,
                skill = %handler.skill.slug,
                claimed_by = %self.handlers[owner].skill.slug,
                "Tool name already claimed, skipping"
            );
            return;
        }

        let index = self.handlers.len();
        for name in names {
            self.by_name.insert(name, index);
        }
        debug!(tool = %handler.tool.name, skill = %handler.skill.slug, "Registered skill tool");
        self.handlers.push(handler);
    }

    /// Handler answering to `name` (or one of its aliases), ignoring case.
    pub fn handler(&self, name: &str) -> Option<&SkillToolHandler> {
        self.by_name
            .get(&normalize_tool_name(name))
            .map(|&i| &self.handlers[i])
    }

    pub fn can_handle(&self, name: &str) -> bool {
        self.handler(name).is_some()
    }

    /// Number of registered tools (aliases not counted).
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    /// Definitions of every registered tool, in registration order.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.handlers
            .iter()
            .map(|h| ToolDefinition {
                name: h.tool.name.clone(),
                description: h.tool.description.clone(),
                parameters: h.tool.input_schema.clone(),
            })
            .collect()
    }

    /// Dispatch one call. Unknown tools get an error result; everything
    /// else goes through the handler chain.
    pub async fn handle(&self, call: &ToolCall, cancel: &mut watch::Receiver<bool>) -> ToolCallResult {
        match self.handler(&call.name) {
            Some(handler) => handler.handle(&self.services, &self.context, call, cancel).await,
            None => ToolCallResult {
                call_id: call.id.clone(),
                name: call.name.clone(),
                content: format!("Unknown skill tool '{}'", call.name),
                is_error: true,
            },
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;

    use crate::approval::{ApprovalNotifier, ChannelNotifier};
    use crate::audit::{ApprovalOutcome, AuditFilter};
    use crate::config::{ApprovalConfig, RuntimeConfig};
    use crate::installer::content_hash;
    use crate::manifest::{Manifest, RiskLevel};
    use crate::sandbox::{MockDependencyInstaller, StaticInterpreter};
    use crate::store::tests::{manifest, new_skill};
    use crate::store::{NewBinding, ScopeKind, SkillVersion, VersionStatus};

    struct Harness {
        _tmp: TempDir,
        root: PathBuf,
        services: DispatchServices,
        notifier: Arc<ChannelNotifier>,
    }

    fn harness() -> Harness {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let store = Arc::new(SkillStore::in_memory());
        let notifier = Arc::new(ChannelNotifier::new());
        let approvals = ApprovalWorkflow::new(
            Arc::clone(&store),
            notifier.clone() as Arc<dyn ApprovalNotifier>,
            ApprovalConfig {
                expiry_secs: 30,
                wait_grace_secs: 1,
                ..ApprovalConfig::default()
            },
        );
        let mut installer = MockDependencyInstaller::new();
        installer.expect_install().times(0);
        let sandbox = Arc::new(SkillSandbox::new(
            RuntimeConfig::default(),
            Arc::new(StaticInterpreter(PathBuf::from("/bin/sh"))),
            Arc::new(installer),
            root.join("deps"),
        ));
        let audit = Arc::new(AuditLogger::new(root.join("audit.jsonl")));
        Harness {
            _tmp: tmp,
            root,
            services: DispatchServices {
                store,
                approvals,
                sandbox,
                audit,
            },
            notifier,
        }
    }

    fn context() -> ConversationContext {
        ConversationContext {
            session_id: Some("s1".into()),
            user_id: Some("u1".into()),
            battle_run_id: None,
            message_id: Some("m1".into()),
        }
    }

    /// Install an active version whose `main.py` is run by `/bin/sh`.
    async fn install(h: &Harness, slug: &str, m: Manifest, script: &str) -> SkillVersion {
        let pkg = h.root.join("packages").join(slug).join(&m.version);
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("main.py"), script).unwrap();
        let store = &h.services.store;
        let skill = store.upsert_skill(new_skill(slug)).await.unwrap();
        let version = store
            .create_version(skill.id, m, content_hash(&pkg).unwrap(), VersionStatus::PendingValidation)
            .await
            .unwrap();
        store.set_package_path(version.id, &pkg).await.unwrap();
        crate::lifecycle::SkillLifecycle::new(Arc::clone(store))
            .validate_version(version.id)
            .await
            .unwrap()
    }

    fn echo_manifest(id: &str, risk: RiskLevel) -> Manifest {
        let mut m = manifest(id, "1.0.0", risk);
        m.tools[0].aliases = vec![format!("{}-alias", id)];
        m
    }

    const ECHO: &str = r#"read payload; printf '{"echo": %s}' "$payload""#;

    async fn rows(h: &Harness) -> Vec<crate::audit::ExecutionAudit> {
        h.services.audit.query(&AuditFilter::default()).await.unwrap()
    }

    fn slugs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_build_registers_tools_and_aliases() {
        let h = harness();
        install(&h, "weather", echo_manifest("weather", RiskLevel::Low), ECHO).await;

        let registry =
            SkillToolRegistry::build(h.services.clone(), context(), &slugs(&["weather", "missing"])).await;
        assert_eq!(registry.len(), 1);
        assert!(registry.can_handle("weather_run"));
        assert!(registry.can_handle("WEATHER_RUN"));
        assert!(registry.can_handle("weather-alias"));
        assert!(!registry.can_handle("other"));

        let defs = registry.tool_definitions();
        assert_eq!(defs[0].name, "weather_run");
        assert_eq!(defs[0].parameters, json!({"type": "object"}));
    }

    #[tokio::test]
    async fn test_first_claim_wins() {
        let h = harness();
        let mut second = manifest("second", "1.0.0", RiskLevel::Low);
        second.tools[0].name = "first_run".into();
        install(&h, "first", manifest("first", "1.0.0", RiskLevel::Low), ECHO).await;
        install(&h, "second", second, ECHO).await;

        let registry =
            SkillToolRegistry::build(h.services.clone(), context(), &slugs(&["first", "second"])).await;
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.handler("first_run").unwrap().skill.slug, "first");
    }

    #[tokio::test]
    async fn test_unrunnable_and_disabled_skills_are_skipped() {
        let h = harness();
        let store = &h.services.store;
        let pending = store.upsert_skill(new_skill("pending")).await.unwrap();
        store
            .create_version(
                pending.id,
                manifest("pending", "1.0.0", RiskLevel::High),
                "hash".into(),
                VersionStatus::PendingApproval,
            )
            .await
            .unwrap();

        let off = install(&h, "off", manifest("off", "1.0.0", RiskLevel::Low), ECHO).await;
        store.set_skill_status(off.skill_id, SkillStatus::Disabled).await.unwrap();

        let mut foreign = manifest("foreign", "1.0.0", RiskLevel::Low);
        foreign.platforms = vec!["plan9".into()];
        install(&h, "foreign", foreign, ECHO).await;

        let registry = SkillToolRegistry::build(
            h.services.clone(),
            context(),
            &slugs(&["pending", "off", "foreign"]),
        )
        .await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_low_risk_call_runs_and_is_audited() {
        let h = harness();
        install(&h, "echo", echo_manifest("echo", RiskLevel::Low), ECHO).await;
        let registry = SkillToolRegistry::build(h.services.clone(), context(), &slugs(&["echo"])).await;
        let (_tx, mut cancel) = watch::channel(false);

        let result = registry
            .handle(&ToolCall::new("c1", "echo-alias", json!({"q": 1})), &mut cancel)
            .await;
        assert!(!result.is_error, "{}", result.content);
        let body: Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(body["echo"]["tool"], "echo_run");
        assert_eq!(body["echo"]["arguments"], json!({"q": 1}));
        assert_eq!(body["echo"]["context"]["session_id"], "s1");

        let rows = rows(&h).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].approval_outcome, ApprovalOutcome::NotRequired);
        assert_eq!(rows[0].call_id, "c1");
        assert_eq!(rows[0].message_id.as_deref(), Some("m1"));
        assert!(rows[0].duration_ms.is_some());
        assert!(rows[0].succeeded());
    }

    #[tokio::test]
    async fn test_critical_risk_is_denied_without_running() {
        let h = harness();
        install(&h, "nuke", manifest("nuke", "1.0.0", RiskLevel::Critical), "touch ran; echo '{}'").await;
        let registry = SkillToolRegistry::build(h.services.clone(), context(), &slugs(&["nuke"])).await;
        let (_tx, mut cancel) = watch::channel(false);

        let result = registry
            .handle(&ToolCall::new("c1", "nuke_run", json!({})), &mut cancel)
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("denied by policy"));
        assert!(!h.root.join("packages/nuke/1.0.0/ran").exists());

        let rows = rows(&h).await;
        assert_eq!(rows[0].approval_outcome, ApprovalOutcome::PolicyDenied);
        assert_eq!(rows[0].duration_ms, None);
    }

    #[tokio::test]
    async fn test_binding_override_allows_critical_tool() {
        let h = harness();
        let version = install(&h, "nuke", manifest("nuke", "1.0.0", RiskLevel::Critical), ECHO).await;
        h.services
            .store
            .upsert_binding(NewBinding {
                skill_id: version.skill_id,
                version_id: None,
                scope: ScopeKind::Session,
                scope_id: Some("s1".into()),
                enabled: true,
                policy: json!({"tools": {"nuke_run": "allow"}}),
            })
            .await
            .unwrap();
        let registry = SkillToolRegistry::build(h.services.clone(), context(), &slugs(&["nuke"])).await;
        let (_tx, mut cancel) = watch::channel(false);

        let result = registry
            .handle(&ToolCall::new("c1", "nuke_run", json!({})), &mut cancel)
            .await;
        assert!(!result.is_error, "{}", result.content);
    }

    #[tokio::test]
    async fn test_medium_risk_without_stream_fails_closed() {
        let h = harness();
        install(&h, "mail", manifest("mail", "1.0.0", RiskLevel::Medium), ECHO).await;
        let registry = SkillToolRegistry::build(h.services.clone(), context(), &slugs(&["mail"])).await;
        let (_tx, mut cancel) = watch::channel(false);

        let result = registry
            .handle(&ToolCall::new("c1", "mail_run", json!({})), &mut cancel)
            .await;
        assert!(result.is_error);

        let rows = rows(&h).await;
        assert_eq!(rows[0].approval_outcome, ApprovalOutcome::Denied);
        assert!(rows[0].approval_request_id.is_some());
    }

    #[tokio::test]
    async fn test_medium_risk_approval_is_reused_in_session() {
        let h = harness();
        install(&h, "mail", manifest("mail", "1.0.0", RiskLevel::Medium), ECHO).await;
        let registry = SkillToolRegistry::build(h.services.clone(), context(), &slugs(&["mail"])).await;
        let mut events = h.notifier.subscribe("s1").await;
        let approvals = h.services.approvals.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let crate::approval::ApprovalEvent::ApprovalRequested { request_id, .. } = event {
                    approvals.decide(request_id, true, Some("u1".into())).await.unwrap();
                }
            }
        });
        let (_tx, mut cancel) = watch::channel(false);

        let first = registry
            .handle(&ToolCall::new("c1", "mail_run", json!({})), &mut cancel)
            .await;
        assert!(!first.is_error, "{}", first.content);
        let second = registry
            .handle(&ToolCall::new("c2", "mail_run", json!({})), &mut cancel)
            .await;
        assert!(!second.is_error, "{}", second.content);

        let rows = rows(&h).await;
        // Newest first.
        assert_eq!(rows[0].approval_outcome, ApprovalOutcome::SessionReuse);
        assert_eq!(rows[1].approval_outcome, ApprovalOutcome::Approved);
    }

    #[tokio::test]
    async fn test_high_risk_asks_on_every_call() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let h = harness();
        install(&h, "wire", manifest("wire", "1.0.0", RiskLevel::High), ECHO).await;
        let registry = SkillToolRegistry::build(h.services.clone(), context(), &slugs(&["wire"])).await;
        let mut events = h.notifier.subscribe("s1").await;
        let approvals = h.services.approvals.clone();
        let requested = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requested);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let crate::approval::ApprovalEvent::ApprovalRequested { request_id, .. } = event {
                    counter.fetch_add(1, Ordering::SeqCst);
                    approvals.decide(request_id, true, Some("u1".into())).await.unwrap();
                }
            }
        });
        let (_tx, mut cancel) = watch::channel(false);

        for id in ["c1", "c2"] {
            let result = registry
                .handle(&ToolCall::new(id, "wire_run", json!({})), &mut cancel)
                .await;
            assert!(!result.is_error, "{}", result.content);
        }

        assert_eq!(requested.load(Ordering::SeqCst), 2);
        let rows = rows(&h).await;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.approval_outcome == ApprovalOutcome::Approved));
        assert_ne!(rows[0].approval_request_id, rows[1].approval_request_id);
    }

    #[tokio::test]
    async fn test_runtime_failure_and_timeout_are_results() {
        let h = harness();
        install(&h, "broken", manifest("broken", "1.0.0", RiskLevel::Low), "echo boom >&2; exit 2").await;
        let mut slow = manifest("slow", "1.0.0", RiskLevel::Low);
        slow.runtime.timeout_secs = Some(1);
        install(&h, "slow", slow, "sleep 5").await;
        let registry =
            SkillToolRegistry::build(h.services.clone(), context(), &slugs(&["broken", "slow"])).await;
        let (_tx, mut cancel) = watch::channel(false);

        let broken = registry
            .handle(&ToolCall::new("c1", "broken_run", json!({})), &mut cancel)
            .await;
        assert!(broken.is_error);
        assert!(broken.content.contains("status 2"));
        assert!(broken.content.contains("boom"));

        let slow = tokio::time::timeout(
            Duration::from_secs(5),
            registry.handle(&ToolCall::new("c2", "slow_run", json!({})), &mut cancel),
        )
        .await
        .unwrap();
        assert!(slow.is_error);
        assert!(slow.content.contains("timed out after 1s"));

        let rows = rows(&h).await;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| !r.succeeded()));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let h = harness();
        let registry = SkillToolRegistry::build(h.services.clone(), context(), &[]).await;
        let (_tx, mut cancel) = watch::channel(false);
        let result = registry
            .handle(&ToolCall::new("c1", "ghost", json!({})), &mut cancel)
            .await;
        assert!(result.is_error);
        assert!(rows(&h).await.is_empty());
    }

    #[tokio::test]
    async fn test_builtins_are_wired_separately() {
        let h = harness();
        let version = install(&h, "clock", manifest("clock", "1.0.0", RiskLevel::Low), ECHO).await;
        let store = &h.services.store;
        let mut builtin = new_skill("clock");
        builtin.source_kind = SourceKind::Builtin;
        store.upsert_skill(builtin).await.unwrap();
        assert_eq!(store.skill(version.skill_id).await.unwrap().source_kind, SourceKind::Builtin);

        let normal = SkillToolRegistry::build(h.services.clone(), context(), &slugs(&["clock"])).await;
        assert!(normal.is_empty());
        let builtins = SkillToolRegistry::build_builtins(h.services.clone(), context()).await;
        assert!(builtins.can_handle("clock_run"));
    }
}
