//! Human approval workflow
//!
//! A `require_approval` policy decision becomes a persisted
//! [`ApprovalRecord`] and a live notification to the calling session. The
//! invocation then waits for one of:
//!
//! - an external decision through [`ApprovalWorkflow::decide`];
//! - the request's expiry, enforced by a background task;
//! - cancellation of the surrounding turn, treated as a denial.
//!
//! The wait itself is bounded by `expiry + wait_grace_secs`, so the expiry
//! path normally resolves first. A decision arriving at or after
//! `expires_at` is recorded as `expired`.

mod notify;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ApprovalConfig;
use crate::error::{Result, SkillError};
use crate::store::{ApprovalDecision, ApprovalRecord, SkillStore};

pub use notify::{
    format_approval_prompt, parse_approval_answer, ApprovalEvent, ApprovalNotifier,
    ChannelNotifier,
};

#[cfg(test)]
pub use notify::MockApprovalNotifier;

/// What needs approving.
#[derive(Debug, Clone)]
pub struct ApprovalSubject {
    pub skill_id: Uuid,
    pub version_id: Uuid,
    pub tool_name: String,
    pub call_id: String,
    pub session_id: Option<String>,
    pub actor_id: Option<String>,
    pub reason: String,
    pub payload: Value,
}

/// Terminal outcome of one approval wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalResolution {
    pub request_id: Uuid,
    pub decision: ApprovalDecision,
    /// Why the request ended this way, for the caller-facing message.
    pub detail: String,
}

impl ApprovalResolution {
    pub fn is_approved(&self) -> bool {
        self.decision == ApprovalDecision::Approved
    }
}

type PendingMap = HashMap<Uuid, oneshot::Sender<ApprovalDecision>>;

/// Request/response exchange with a human, with expiry.
#[derive(Clone)]
pub struct ApprovalWorkflow {
    store: Arc<SkillStore>,
    notifier: Arc<dyn ApprovalNotifier>,
    config: ApprovalConfig,
    pending: Arc<Mutex<PendingMap>>,
}

impl ApprovalWorkflow {
    pub fn new(
        store: Arc<SkillStore>,
        notifier: Arc<dyn ApprovalNotifier>,
        config: ApprovalConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a request, notify the session and wait for a terminal decision.
    ///
    /// Fails closed: no live stream, cancellation or a lost wait all end as
    /// a non-approved resolution rather than an error.
    pub async fn request(
        &self,
        subject: ApprovalSubject,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<ApprovalResolution> {
        let now = Utc::now();
        let expiry_secs = self.config.expiry_secs.max(1);
        let record = ApprovalRecord {
            id: Uuid::new_v4(),
            skill_id: subject.skill_id,
            version_id: subject.version_id,
            tool_name: subject.tool_name,
            call_id: subject.call_id,
            session_id: subject.session_id,
            actor_id: subject.actor_id,
            reason: subject.reason,
            payload: subject.payload,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(expiry_secs as i64),
            decision: ApprovalDecision::Pending,
            decided_at: None,
            decided_by: None,
        };
        let request_id = record.id;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);
        if let Err(e) = self.store.create_approval(record.clone()).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        let event = ApprovalEvent::ApprovalRequested {
            request_id,
            skill_id: record.skill_id,
            version_id: record.version_id,
            tool_name: record.tool_name.clone(),
            call_id: record.call_id.clone(),
            reason: record.reason.clone(),
            arguments: record.payload.clone(),
            expires_at: record.expires_at,
        };
        let delivered = match record.session_id.as_deref() {
            Some(session_id) => self.notifier.notify(session_id, event).await,
            None => false,
        };
        if !delivered {
            warn!(
                request = %request_id,
                tool = %record.tool_name,
                "No live session stream for approval, denying"
            );
            return self
                .finish(
                    request_id,
                    ApprovalDecision::Denied,
                    Some("system:no-stream"),
                    "no active session stream to ask for approval",
                )
                .await;
        }

        info!(
            request = %request_id,
            tool = %record.tool_name,
            call_id = %record.call_id,
            expires_in_secs = expiry_secs,
            "Approval requested"
        );
        self.spawn_expiry(request_id, Duration::from_secs(expiry_secs));

        let wait = Duration::from_secs(expiry_secs + self.config.wait_grace_secs.max(1));
        tokio::select! {
            received = rx => match received {
                Ok(decision) => Ok(self.resolution(request_id, decision)),
                Err(_) => self.current(request_id).await,
            },
            _ = tokio::time::sleep(wait) => {
                warn!(request = %request_id, "Approval wait outlived expiry");
                self.finish(request_id, ApprovalDecision::Expired, None, "approval request expired").await
            }
            _ = wait_cancelled(cancel) => {
                info!(request = %request_id, "Approval wait cancelled");
                self.finish(
                    request_id,
                    ApprovalDecision::Denied,
                    Some("system:cancelled"),
                    "cancelled while waiting for approval",
                )
                .await
            }
        }
    }

    /// Record an external decision for a pending request.
    ///
    /// A decision arriving at or after the expiry is recorded as `expired`.
    pub async fn decide(
        &self,
        request_id: Uuid,
        approved: bool,
        decided_by: Option<String>,
    ) -> Result<ApprovalRecord> {
        let record = self
            .store
            .approval(request_id)
            .await
            .ok_or_else(|| SkillError::NotFound(format!("Approval request {}", request_id)))?;

        let decision = if Utc::now() >= record.expires_at {
            ApprovalDecision::Expired
        } else if approved {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Denied
        };

        let record = self
            .store
            .resolve_approval(request_id, decision, decided_by)
            .await?;
        self.publish(&record).await;
        info!(request = %request_id, decision = %decision, "Approval decided");
        Ok(record)
    }

    fn spawn_expiry(&self, request_id: Uuid, after: Duration) {
        let workflow = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // Err means the request was already decided.
            if let Ok(record) = workflow
                .store
                .resolve_approval(request_id, ApprovalDecision::Expired, None)
                .await
            {
                info!(request = %request_id, "Approval request expired");
                workflow.publish(&record).await;
            }
        });
    }

    /// Resolve (if still pending) and build the resolution from what the
    /// store ends up holding.
    async fn finish(
        &self,
        request_id: Uuid,
        decision: ApprovalDecision,
        decided_by: Option<&str>,
        detail: &str,
    ) -> Result<ApprovalResolution> {
        match self
            .store
            .resolve_approval(request_id, decision, decided_by.map(str::to_string))
            .await
        {
            Ok(record) => {
                self.publish(&record).await;
                Ok(ApprovalResolution {
                    request_id,
                    decision: record.decision,
                    detail: detail.to_string(),
                })
            }
            Err(SkillError::Approval(_)) => self.current(request_id).await,
            Err(e) => Err(e),
        }
    }

    async fn current(&self, request_id: Uuid) -> Result<ApprovalResolution> {
        self.pending.lock().await.remove(&request_id);
        let record = self
            .store
            .approval(request_id)
            .await
            .ok_or_else(|| SkillError::NotFound(format!("Approval request {}", request_id)))?;
        let decision = if record.decision.is_terminal() {
            record.decision
        } else {
            ApprovalDecision::Denied
        };
        Ok(self.resolution(request_id, decision))
    }

    fn resolution(&self, request_id: Uuid, decision: ApprovalDecision) -> ApprovalResolution {
        let detail = match decision {
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Denied => "approval denied",
            ApprovalDecision::Expired => "approval request expired",
            ApprovalDecision::Pending => "approval still pending",
        };
        ApprovalResolution {
            request_id,
            decision,
            detail: detail.to_string(),
        }
    }

    /// Wake the waiter and tell the session about a terminal record.
    async fn publish(&self, record: &ApprovalRecord) {
        if let Some(tx) = self.pending.lock().await.remove(&record.id) {
            let _ = tx.send(record.decision);
        }
        if let Some(session_id) = record.session_id.as_deref() {
            let event = ApprovalEvent::ApprovalResult {
                request_id: record.id,
                decision: record.decision,
            };
            if !self.notifier.notify(session_id, event).await {
                warn!(request = %record.id, "Approval result not delivered, stream closed");
            }
        }
    }
}

/// Resolves once the cancel flag turns `true`; never when the sender is
/// gone without cancelling.
pub(crate) async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
