//! Execution audit log
//!
//! Every tool invocation handled by the dispatcher produces exactly one
//! [`ExecutionAudit`] row, whatever the outcome. Rows are appended as JSON
//! lines to `<storage-root>/audit.jsonl` and never rewritten.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SkillError};

/// How the approval gate ended for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    /// Policy allowed the call outright.
    NotRequired,
    /// Allowed because the session approved this skill before.
    SessionReuse,
    /// A human approved the request.
    Approved,
    /// A human denied the request, no live stream was available, or the turn
    /// was cancelled while waiting.
    Denied,
    /// Nobody answered before the request expired.
    Expired,
    /// Policy refused the call; no request was created.
    PolicyDenied,
}

impl ApprovalOutcome {
    /// Snake-case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalOutcome::NotRequired => "not_required",
            ApprovalOutcome::SessionReuse => "session_reuse",
            ApprovalOutcome::Approved => "approved",
            ApprovalOutcome::Denied => "denied",
            ApprovalOutcome::Expired => "expired",
            ApprovalOutcome::PolicyDenied => "policy_denied",
        }
    }
}

/// One invocation record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAudit {
    pub id: Uuid,
    pub skill_id: Uuid,
    pub version_id: Uuid,
    #[serde(default)]
    pub approval_request_id: Option<Uuid>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub battle_run_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    pub tool_name: String,
    pub call_id: String,
    pub request: Value,
    pub response: Value,
    pub approval_outcome: ApprovalOutcome,
    pub platform: String,
    /// Wall time of the runtime execution only, `None` when nothing ran.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionAudit {
    /// Whether the invocation produced a successful result.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Query filter for [`AuditLogger::query`].
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub skill_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub tool_name: Option<String>,
    pub only_failures: bool,
    /// Newest rows kept; `None` keeps all.
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, row: &ExecutionAudit) -> bool {
        self.skill_id.map_or(true, |id| row.skill_id == id)
            && self
                .session_id
                .as_deref()
                .map_or(true, |s| row.session_id.as_deref() == Some(s))
            && self
                .tool_name
                .as_deref()
                .map_or(true, |t| row.tool_name.eq_ignore_ascii_case(t))
            && (!self.only_failures || !row.succeeded())
    }
}

/// Append-only JSON-lines audit sink.
#[derive(Debug)]
pub struct AuditLogger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLogger {
    /// Log to `path`, creating it on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row.
    pub async fn record(&self, row: &ExecutionAudit) -> Result<()> {
        let mut line = serde_json::to_string(row)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                SkillError::Config(format!(
                    "Failed to open audit log {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(
            audit = %row.id,
            tool = %row.tool_name,
            call_id = %row.call_id,
            outcome = row.approval_outcome.as_str(),
            failed = row.error.is_some(),
            "Wrote execution audit"
        );
        Ok(())
    }

    /// Rows matching `filter`, newest first. Unparseable lines are skipped.
    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<ExecutionAudit>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut rows = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ExecutionAudit>(line) {
                Ok(row) if filter.matches(&row) => rows.push(row),
                Ok(_) => {}
                Err(e) => warn!(line = index + 1, error = %e, "Skipping malformed audit row"),
            }
        }

        rows.reverse();
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn row(skill_id: Uuid, session: &str, error: Option<&str>) -> ExecutionAudit {
        ExecutionAudit {
            id: Uuid::new_v4(),
            skill_id,
            version_id: Uuid::new_v4(),
            approval_request_id: None,
            session_id: Some(session.to_string()),
            battle_run_id: None,
            message_id: None,
            tool_name: "demo_run".to_string(),
            call_id: "call-1".to_string(),
            request: json!({"x": 1}),
            response: json!({"ok": true}),
            approval_outcome: ApprovalOutcome::NotRequired,
            platform: "linux".to_string(),
            duration_ms: Some(12),
            error: error.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_query_newest_first() {
        let tmp = TempDir::new().unwrap();
        let logger = AuditLogger::new(tmp.path().join("audit.jsonl"));
        let skill = Uuid::new_v4();

        let first = row(skill, "s1", None);
        let second = row(skill, "s1", Some("boom"));
        logger.record(&first).await.unwrap();
        logger.record(&second).await.unwrap();
        logger.record(&row(Uuid::new_v4(), "s2", None)).await.unwrap();

        let all = logger
            .query(&AuditFilter {
                skill_id: Some(skill),
                ..AuditFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.id);
        assert_eq!(all[1].id, first.id);

        let failures = logger
            .query(&AuditFilter {
                only_failures: true,
                ..AuditFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_rows_are_appended_not_rewritten() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit.jsonl");
        let logger = AuditLogger::new(&path);
        logger.record(&row(Uuid::new_v4(), "s1", None)).await.unwrap();
        let before = std::fs::read_to_string(&path).unwrap();
        logger.record(&row(Uuid::new_v4(), "s1", None)).await.unwrap();
        let after = std::fs::read_to_string(&path).unwrap();

        assert!(after.starts_with(&before));
        assert_eq!(after.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_missing_log_and_malformed_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit.jsonl");
        let logger = AuditLogger::new(&path);
        assert!(logger.query(&AuditFilter::default()).await.unwrap().is_empty());

        logger.record(&row(Uuid::new_v4(), "s1", None)).await.unwrap();
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("not json\n");
        std::fs::write(&path, content).unwrap();

        let rows = logger
            .query(&AuditFilter {
                session_id: Some("s1".into()),
                limit: Some(10),
                ..AuditFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
