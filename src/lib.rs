//! Skillgate - skill installation, trust policy and sandboxed execution
//!
//! Installs third-party skill packages from repository snapshots, decides
//! per call whether a skill tool may run, asks a human when it must, and
//! runs the tool out of process with time and output limits. Every call
//! leaves an audit row.

pub mod approval;
pub mod audit;
pub mod builtin;
pub mod compat;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod installer;
pub mod lifecycle;
pub mod manifest;
pub mod policy;
pub mod sandbox;
pub mod security;
pub mod source;
pub mod store;

pub use approval::{ApprovalEvent, ApprovalNotifier, ApprovalWorkflow, ChannelNotifier};
pub use audit::{AuditFilter, AuditLogger, ExecutionAudit};
pub use config::Config;
pub use dispatch::{
    ConversationContext, DispatchServices, SkillToolRegistry, ToolCall, ToolCallResult,
    ToolDefinition,
};
pub use error::{Result, SkillError};
pub use installer::{InstallOutcome, Installer};
pub use lifecycle::SkillLifecycle;
pub use manifest::{Manifest, RiskLevel};
pub use policy::{evaluate, PolicyDecision};
pub use sandbox::SkillSandbox;
pub use source::{SourceFetcher, SourceRef};
pub use store::SkillStore;
