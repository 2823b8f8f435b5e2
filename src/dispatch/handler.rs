//! One registered skill tool and its invocation chain:
//! policy, approval, execution, audit.

use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::ApprovalSubject;
use crate::audit::{ApprovalOutcome, ExecutionAudit};
use crate::error::SkillError;
use crate::manifest::{current_platform, RiskLevel, ToolDescriptor};
use crate::policy::{evaluate, BindingPolicy, PolicyDecision};
use crate::sandbox::{tail, ExecutionReport, ExecutionRequest};
use crate::store::{ApprovalDecision, Skill, SkillVersion};

use super::{ConversationContext, DispatchServices, ToolCall, ToolCallResult};

/// Bytes of stderr kept in an audit row.
const AUDIT_STDERR_BYTES: usize = 4096;

/// A tool bound to the skill version, binding and policy that serve it.
#[derive(Debug, Clone)]
pub struct SkillToolHandler {
    pub skill: Skill,
    pub version: SkillVersion,
    pub tool: ToolDescriptor,
    pub binding_id: Option<Uuid>,
    pub policy: BindingPolicy,
}

/// Running state of one invocation, turned into the audit row at the end.
struct Invocation<'a> {
    handler: &'a SkillToolHandler,
    context: &'a ConversationContext,
    call: &'a ToolCall,
    approval_request_id: Option<Uuid>,
    approval_outcome: ApprovalOutcome,
    duration_ms: Option<u64>,
}

impl SkillToolHandler {
    /// Run the full chain. Never fails: every outcome becomes a tool result
    /// and an audit row.
    pub async fn handle(
        &self,
        services: &DispatchServices,
        context: &ConversationContext,
        call: &ToolCall,
        cancel: &mut watch::Receiver<bool>,
    ) -> ToolCallResult {
        let mut invocation = Invocation {
            handler: self,
            context,
            call,
            approval_request_id: None,
            approval_outcome: ApprovalOutcome::NotRequired,
            duration_ms: None,
        };

        let risk = self.version.manifest.risk_level;
        let override_decision = self.policy.decision_for(&self.tool.name);
        let session_approved = match context.session_id.as_deref() {
            Some(session) if risk == RiskLevel::Medium => {
                services.store.has_session_approval(session, self.skill.id).await
            }
            _ => false,
        };
        let outcome = evaluate(Some(risk), override_decision, session_approved);
        debug!(
            skill = %self.skill.slug,
            tool = %self.tool.name,
            risk = %risk,
            decision = %outcome.decision,
            overridden = override_decision.is_some(),
            "Policy decision"
        );

        match outcome.decision {
            PolicyDecision::Deny => {
                invocation.approval_outcome = ApprovalOutcome::PolicyDenied;
                let message = format!("Tool '{}' denied by policy: {}", self.tool.name, outcome.reason);
                return invocation.fail(services, message, json!({})).await;
            }
            PolicyDecision::RequireApproval => {
                let subject = ApprovalSubject {
                    skill_id: self.skill.id,
                    version_id: self.version.id,
                    tool_name: self.tool.name.clone(),
                    call_id: call.id.clone(),
                    session_id: context.session_id.clone(),
                    actor_id: context.user_id.clone(),
                    reason: outcome.reason.clone(),
                    payload: call.arguments.clone(),
                };
                let resolution = match services.approvals.request(subject, cancel).await {
                    Ok(resolution) => resolution,
                    Err(e) => {
                        invocation.approval_outcome = ApprovalOutcome::Denied;
                        let message = format!("Approval request for '{}' failed: {}", self.tool.name, e);
                        return invocation.fail(services, message, json!({})).await;
                    }
                };
                invocation.approval_request_id = Some(resolution.request_id);
                if !resolution.is_approved() {
                    invocation.approval_outcome = match resolution.decision {
                        ApprovalDecision::Expired => ApprovalOutcome::Expired,
                        _ => ApprovalOutcome::Denied,
                    };
                    let message = format!(
                        "Tool '{}' was not approved ({}): {}",
                        self.tool.name, resolution.decision, resolution.detail
                    );
                    return invocation.fail(services, message, json!({})).await;
                }
                invocation.approval_outcome = ApprovalOutcome::Approved;
            }
            PolicyDecision::Allow if outcome.session_reuse => {
                invocation.approval_outcome = ApprovalOutcome::SessionReuse;
            }
            PolicyDecision::Allow => {}
        }

        let request = self.execution_request(context, call);
        let started = Instant::now();
        let executed = services.sandbox.execute(&request, cancel).await;
        invocation.duration_ms = Some(started.elapsed().as_millis() as u64);

        match executed {
            Ok(report) if report.succeeded() => {
                let result = report.result.clone().unwrap_or(Value::Null);
                invocation.succeed(services, result).await
            }
            Ok(report) => {
                let mut message = format!(
                    "Tool '{}' failed: {}",
                    self.tool.name,
                    report
                        .failure_message()
                        .unwrap_or_else(|| "unknown failure".to_string())
                );
                if !report.repair_attempts.is_empty() {
                    let packages: Vec<&str> = report
                        .repair_attempts
                        .iter()
                        .flat_map(|a| a.packages.iter().map(String::as_str))
                        .collect();
                    message.push_str(&format!(
                        " (after {} dependency install attempt(s): {})",
                        report.repair_attempts.len(),
                        packages.join(", ")
                    ));
                }
                invocation.fail(services, message, report_summary(&report)).await
            }
            Err(e) => {
                let message = match e {
                    SkillError::Timeout { seconds } => {
                        format!("Tool '{}' timed out after {}s", self.tool.name, seconds)
                    }
                    SkillError::Cancelled => format!("Tool '{}' was cancelled", self.tool.name),
                    other => format!("Tool '{}' could not run: {}", self.tool.name, other),
                };
                invocation.fail(services, message, json!({})).await
            }
        }
    }

    fn execution_request(&self, context: &ConversationContext, call: &ToolCall) -> ExecutionRequest {
        let payload = json!({
            "tool": self.tool.name,
            "call_id": call.id,
            "arguments": call.arguments,
            "context": {
                "session_id": context.session_id,
                "user_id": context.user_id,
                "battle_run_id": context.battle_run_id,
                "message_id": context.message_id,
            },
        });
        ExecutionRequest {
            skill_id: self.skill.id,
            version_id: self.version.id,
            manifest: self.version.manifest.clone(),
            // `is_runnable` guaranteed a package path at registration.
            package_root: self.version.package_path.clone().unwrap_or_default(),
            payload,
            timeout_secs: self.policy.timeout_secs,
            max_output_bytes: self.policy.max_output_bytes,
            actor_id: context.user_id.clone(),
        }
    }
}

impl Invocation<'_> {
    async fn succeed(self, services: &DispatchServices, result: Value) -> ToolCallResult {
        info!(
            skill = %self.handler.skill.slug,
            tool = %self.handler.tool.name,
            duration_ms = ?self.duration_ms,
            "Skill tool succeeded"
        );
        let call = self.call;
        let content = result.to_string();
        self.audit(services, result, None).await;
        ToolCallResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content,
            is_error: false,
        }
    }

    async fn fail(self, services: &DispatchServices, message: String, details: Value) -> ToolCallResult {
        warn!(
            skill = %self.handler.skill.slug,
            tool = %self.handler.tool.name,
            outcome = self.approval_outcome.as_str(),
            error = %message,
            "Skill tool call failed"
        );
        let call_id = self.call.id.clone();
        let name = self.call.name.clone();
        self.audit(services, details, Some(message.clone())).await;
        ToolCallResult {
            call_id,
            name,
            content: message,
            is_error: true,
        }
    }

    async fn audit(self, services: &DispatchServices, response: Value, error: Option<String>) {
        let row = ExecutionAudit {
            id: Uuid::new_v4(),
            skill_id: self.handler.skill.id,
            version_id: self.handler.version.id,
            approval_request_id: self.approval_request_id,
            session_id: self.context.session_id.clone(),
            battle_run_id: self.context.battle_run_id.clone(),
            message_id: self.context.message_id.clone(),
            tool_name: self.handler.tool.name.clone(),
            call_id: self.call.id.clone(),
            request: self.call.arguments.clone(),
            response,
            approval_outcome: self.approval_outcome,
            platform: current_platform().to_string(),
            duration_ms: self.duration_ms,
            error,
            created_at: Utc::now(),
        };
        if let Err(e) = services.audit.record(&row).await {
            warn!(error = %e, call = %row.call_id, "Failed to write execution audit");
        }
    }
}

fn report_summary(report: &ExecutionReport) -> Value {
    json!({
        "exit_code": report.exit_code,
        "stderr": tail(&report.stderr, AUDIT_STDERR_BYTES),
        "stdout_truncated": report.stdout_truncated,
        "stderr_truncated": report.stderr_truncated,
        "repair_attempts": report.repair_attempts,
        "timeout_secs": report.timeout_secs,
    })
}
