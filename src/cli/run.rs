//! `skillgate run`: one tool call through the full dispatch chain.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use skillgate::approval::{
    format_approval_prompt, parse_approval_answer, ApprovalEvent, ApprovalWorkflow,
    ChannelNotifier,
};
use skillgate::audit::AuditLogger;
use skillgate::config::Config;
use skillgate::dispatch::{ConversationContext, DispatchServices, SkillToolRegistry, ToolCall};
use skillgate::sandbox::SkillSandbox;
use skillgate::store::SourceKind;

use super::common::{find_skill, open_store};

/// Arguments of `skillgate run`.
#[derive(Debug, Args)]
pub(crate) struct RunArgs {
    /// Skill slug
    pub slug: String,
    /// Tool name or alias
    pub tool: String,
    /// Chat session the call belongs to
    #[arg(long)]
    pub session: String,
    /// Acting user (omit for anonymous)
    #[arg(long)]
    pub user: Option<String>,
    /// Battle-run context
    #[arg(long)]
    pub battle_run: Option<String>,
    /// Tool arguments as a JSON object
    #[arg(long, default_value = "{}")]
    pub input: String,
}

pub(crate) async fn cmd_run(config: &Config, args: RunArgs) -> Result<()> {
    let arguments: Value =
        serde_json::from_str(&args.input).with_context(|| "--input must be valid JSON")?;
    if !arguments.is_object() {
        bail!("--input must be a JSON object");
    }

    let store = open_store(config)?;
    let skill = find_skill(&store, &args.slug).await?;

    let notifier = Arc::new(ChannelNotifier::new());
    let approvals = ApprovalWorkflow::new(
        Arc::clone(&store),
        notifier.clone(),
        config.approval.clone(),
    );
    let services = DispatchServices {
        store: Arc::clone(&store),
        approvals: approvals.clone(),
        sandbox: Arc::new(SkillSandbox::from_config(
            config.runtime.clone(),
            config.deps_dir(),
        )),
        audit: Arc::new(AuditLogger::new(config.audit_path())),
    };
    let context = ConversationContext {
        session_id: Some(args.session.clone()),
        user_id: args.user.clone(),
        battle_run_id: args.battle_run.clone(),
        message_id: Some(Uuid::new_v4().to_string()),
    };

    let registry = if skill.source_kind == SourceKind::Builtin {
        SkillToolRegistry::build_builtins(services, context).await
    } else {
        SkillToolRegistry::build(services, context, &[skill.slug.clone()]).await
    };
    if !registry.can_handle(&args.tool) {
        let available: Vec<String> = registry
            .tool_definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        bail!(
            "Tool '{}' is not available for {} in this context (available: {})",
            args.tool,
            args.slug,
            if available.is_empty() { "none".to_string() } else { available.join(", ") }
        );
    }

    let events = notifier.subscribe(&args.session).await;
    let answering = tokio::spawn(answer_approvals(events, approvals));

    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            let _ = cancel_tx.send(true);
        }
    });

    let call = ToolCall::new(format!("call_{}", Uuid::new_v4().simple()), &args.tool, arguments);
    let result = registry.handle(&call, &mut cancel_rx).await;

    notifier.unsubscribe(&args.session).await;
    answering.abort();

    println!("{}", result.content);
    if result.is_error {
        bail!("Tool call failed");
    }
    Ok(())
}

/// Prompt on the terminal for every approval request of the session.
async fn answer_approvals(mut events: mpsc::UnboundedReceiver<ApprovalEvent>, approvals: ApprovalWorkflow) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(event) = events.recv().await {
        eprintln!("{}", format_approval_prompt(&event));
        let ApprovalEvent::ApprovalRequested { request_id, .. } = event else {
            continue;
        };

        let approved = loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_approval_answer(&line) {
                    Some(answer) => break answer,
                    None => eprintln!("Please answer yes or no."),
                },
                // Closed stdin counts as a denial.
                _ => break false,
            }
        };

        let operator = std::env::var("USER").ok();
        if let Err(e) = approvals.decide(request_id, approved, operator).await {
            eprintln!("Failed to record decision: {}", e);
        }
    }
}
