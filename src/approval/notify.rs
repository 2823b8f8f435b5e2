//! Live approval notifications
//!
//! The workflow emits two event kinds to the calling session's live stream:
//! a request event when a human decision is needed and a result event once
//! the request reaches a terminal state.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::store::ApprovalDecision;

/// Event pushed to a session stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalEvent {
    /// A tool call is waiting for a decision.
    ApprovalRequested {
        request_id: Uuid,
        skill_id: Uuid,
        version_id: Uuid,
        tool_name: String,
        call_id: String,
        reason: String,
        /// Call arguments, for display.
        arguments: Value,
        expires_at: DateTime<Utc>,
    },
    /// The request reached a terminal decision.
    ApprovalResult {
        request_id: Uuid,
        decision: ApprovalDecision,
    },
}

impl ApprovalEvent {
    /// Request the event refers to.
    pub fn request_id(&self) -> Uuid {
        match self {
            ApprovalEvent::ApprovalRequested { request_id, .. }
            | ApprovalEvent::ApprovalResult { request_id, .. } => *request_id,
        }
    }
}

/// Delivery of approval events to live session streams.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    /// Deliver `event` to the session's active stream. Returns `false` when
    /// the session has no active stream.
    async fn notify(&self, session_id: &str, event: ApprovalEvent) -> bool;
}

/// In-process notifier backed by one unbounded channel per subscribed
/// session.
#[derive(Debug, Default)]
pub struct ChannelNotifier {
    streams: RwLock<HashMap<String, mpsc::UnboundedSender<ApprovalEvent>>>,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the live stream for `session_id`, replacing any previous one.
    pub async fn subscribe(&self, session_id: &str) -> mpsc::UnboundedReceiver<ApprovalEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.write().await.insert(session_id.to_string(), tx);
        debug!(session = %session_id, "Approval stream opened");
        rx
    }

    /// Close the live stream for `session_id`.
    pub async fn unsubscribe(&self, session_id: &str) {
        self.streams.write().await.remove(session_id);
    }
}

#[async_trait]
impl ApprovalNotifier for ChannelNotifier {
    async fn notify(&self, session_id: &str, event: ApprovalEvent) -> bool {
        let streams = self.streams.read().await;
        match streams.get(session_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

/// Human-readable prompt for a request event.
pub fn format_approval_prompt(event: &ApprovalEvent) -> String {
    match event {
        ApprovalEvent::ApprovalRequested {
            tool_name,
            reason,
            arguments,
            expires_at,
            ..
        } => {
            let args_display = match serde_json::to_string_pretty(arguments) {
                Ok(pretty) => pretty,
                Err(_) => arguments.to_string(),
            };
            format!(
                "[Approval Required]\n\
                 Tool: {tool_name}\n\
                 Reason: {reason}\n\
                 Arguments:\n{args_display}\n\
                 Expires: {}\n\n\
                 Approve execution? (yes/no)",
                expires_at.format("%H:%M:%S UTC")
            )
        }
        ApprovalEvent::ApprovalResult {
            request_id,
            decision,
        } => format!("[Approval {}] request {}", decision, request_id),
    }
}

/// Interpret a free-form answer. `None` when the answer is neither.
pub fn parse_approval_answer(answer: &str) -> Option<bool> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "approve" | "approved" | "ok" => Some(true),
        "n" | "no" | "deny" | "denied" | "reject" => Some(false),
        _ => None,
    }
}
