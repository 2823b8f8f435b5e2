//! Policy engine
//!
//! A pure decision over (risk level, binding override, prior session
//! approval). The override is checked first and always wins:
//!
//! | risk | prior session approval | decision |
//! |---|---|---|
//! | low | any | allow |
//! | medium | no | require_approval |
//! | medium | yes | allow |
//! | high | any | require_approval |
//! | critical | any | deny |
//! | unrecognized | any | deny |

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::manifest::{normalize_tool_name, RiskLevel};

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Deny,
    RequireApproval,
}

impl PolicyDecision {
    /// Parse `allow`, `deny` or `require_approval` (dashes accepted).
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "allow" => Some(PolicyDecision::Allow),
            "deny" => Some(PolicyDecision::Deny),
            "require_approval" => Some(PolicyDecision::RequireApproval),
            _ => None,
        }
    }

    /// Snake-case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyDecision::Allow => "allow",
            PolicyDecision::Deny => "deny",
            PolicyDecision::RequireApproval => "require_approval",
        }
    }
}

impl fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decision with the reason shown to users and written to approvals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub decision: PolicyDecision,
    pub reason: String,
    /// Allowed only because the session approved the skill earlier.
    pub session_reuse: bool,
}

impl PolicyOutcome {
    fn new(decision: PolicyDecision, reason: impl Into<String>) -> Self {
        Self {
            decision,
            reason: reason.into(),
            session_reuse: false,
        }
    }
}

/// Evaluate the decision table. `risk` is `None` when the stored label was
/// not recognized.
pub fn evaluate(
    risk: Option<RiskLevel>,
    override_decision: Option<PolicyDecision>,
    session_approved: bool,
) -> PolicyOutcome {
    if let Some(decision) = override_decision {
        return PolicyOutcome::new(decision, format!("binding policy sets {}", decision));
    }

    match risk {
        Some(RiskLevel::Low) => PolicyOutcome::new(PolicyDecision::Allow, "low risk"),
        Some(RiskLevel::Medium) if session_approved => PolicyOutcome {
            decision: PolicyDecision::Allow,
            reason: "medium risk, approved earlier in this session".to_string(),
            session_reuse: true,
        },
        Some(RiskLevel::Medium) => PolicyOutcome::new(
            PolicyDecision::RequireApproval,
            "medium risk skill needs approval once per session",
        ),
        Some(RiskLevel::High) => PolicyOutcome::new(
            PolicyDecision::RequireApproval,
            "high risk skill needs approval for every call",
        ),
        Some(RiskLevel::Critical) => PolicyOutcome::new(
            PolicyDecision::Deny,
            "critical risk skill is not allowed without an explicit binding policy",
        ),
        None => PolicyOutcome::new(PolicyDecision::Deny, "unrecognized risk level"),
    }
}

/// Scope-local policy carried by a binding.
///
/// ```json
/// {"decision": "allow", "tools": {"delete_all": "deny"}, "timeout_secs": 30, "max_output_bytes": 65536}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingPolicy {
    pub decision: Option<String>,
    pub tools: HashMap<String, String>,
    pub timeout_secs: Option<u64>,
    pub max_output_bytes: Option<u64>,
}

impl BindingPolicy {
    /// Parse from binding JSON, field by field.
    ///
    /// `null` gives the empty policy. Anything that cannot be read as a
    /// decision fails closed: a malformed `decision` or `tools` entry, or a
    /// policy that is not an object at all, denies. Malformed limits are
    /// dropped on their own and never cost the decision.
    pub fn from_value(value: &Value) -> Self {
        let object = match value {
            Value::Null => return Self::default(),
            Value::Object(object) => object,
            other => {
                warn!(policy = %other, "Binding policy is not an object, denying");
                return Self::deny_all();
            }
        };

        let mut policy = Self::default();
        match object.get("decision") {
            None | Some(Value::Null) => {}
            Some(Value::String(label)) => policy.decision = Some(label.clone()),
            Some(other) => {
                warn!(decision = %other, "Malformed binding decision, denying");
                policy.decision = Some(PolicyDecision::Deny.as_str().to_string());
            }
        }

        match object.get("tools") {
            None | Some(Value::Null) => {}
            Some(Value::Object(tools)) => {
                for (tool, label) in tools {
                    let label = match label {
                        Value::String(label) => label.clone(),
                        other => {
                            warn!(tool = %tool, decision = %other, "Malformed tool decision, denying");
                            PolicyDecision::Deny.as_str().to_string()
                        }
                    };
                    policy.tools.insert(tool.clone(), label);
                }
            }
            Some(other) => {
                warn!(tools = %other, "Malformed per-tool policy, denying every tool");
                policy.decision = Some(PolicyDecision::Deny.as_str().to_string());
                policy.tools.clear();
            }
        }

        policy.timeout_secs = read_limit(object.get("timeout_secs"), "timeout_secs");
        policy.max_output_bytes = read_limit(object.get("max_output_bytes"), "max_output_bytes");
        policy
    }

    fn deny_all() -> Self {
        Self {
            decision: Some(PolicyDecision::Deny.as_str().to_string()),
            ..Self::default()
        }
    }

    /// Override for `tool`: a tool-specific entry wins over the
    /// binding-wide one. Unrecognized labels fail closed to `deny`.
    pub fn decision_for(&self, tool: &str) -> Option<PolicyDecision> {
        let wanted = normalize_tool_name(tool);
        let label = self
            .tools
            .iter()
            .find(|(name, _)| normalize_tool_name(name) == wanted)
            .map(|(_, label)| label)
            .or(self.decision.as_ref())?;

        Some(PolicyDecision::parse(label).unwrap_or_else(|| {
            warn!(label = %label, tool = %tool, "Unrecognized policy decision, denying");
            PolicyDecision::Deny
        }))
    }
}

fn read_limit(value: Option<&Value>, field: &str) -> Option<u64> {
    match value {
        None | Some(Value::Null) => None,
        Some(v) => v.as_u64().or_else(|| {
            warn!(field = field, value = %v, "Ignoring malformed binding limit");
            None
        }),
    }
}
