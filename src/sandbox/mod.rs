//! Runtime execution sandbox
//!
//! Runs one skill invocation as a child process:
//!
//! - the working directory is the installed package root;
//! - the JSON payload arrives on stdin and in `SKILL_PAYLOAD`;
//! - stdout must carry exactly one JSON object;
//! - wall-clock timeout and per-stream output ceilings are enforced;
//! - Python runtimes get a per-version dependency directory on
//!   `PYTHONPATH`, filled by bounded auto-repair rounds when the process
//!   dies on a missing module.

mod command;
mod process;
mod repair;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{Result, SkillError};
use crate::manifest::{Manifest, RuntimeKind};
use crate::security::resolve_within_root;

pub use command::{
    default_resolver, resolve_command, InterpreterResolver, PathInterpreter, ResolvedCommand,
    StaticInterpreter,
};
pub use process::ProcessOutput;
pub use repair::{
    detect_missing_modules, package_for_module, DependencyInstaller, PipInstaller, RepairAttempt,
};

#[cfg(test)]
pub use repair::MockDependencyInstaller;

pub(crate) use repair::tail;

use process::{run_process, RunLimits};

/// Environment variable carrying the JSON payload.
pub const PAYLOAD_ENV: &str = "SKILL_PAYLOAD";
/// Environment variable carrying the package root.
pub const PACKAGE_ROOT_ENV: &str = "SKILL_PACKAGE_ROOT";

const MIN_OUTPUT_BYTES: u64 = 1024;

/// One invocation to run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub skill_id: Uuid,
    pub version_id: Uuid,
    pub manifest: Manifest,
    pub package_root: PathBuf,
    pub payload: Value,
    /// Binding-level overrides, clamped to the configured maximums.
    pub timeout_secs: Option<u64>,
    pub max_output_bytes: Option<u64>,
    /// Calling user. Anonymous callers never trigger dependency installs.
    pub actor_id: Option<String>,
}

/// What a finished run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// The JSON object parsed from stdout, when the protocol was honoured.
    pub result: Option<Value>,
    pub repair_attempts: Vec<RepairAttempt>,
    pub timeout_secs: u64,
    pub duration_ms: u64,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.result.is_some()
    }

    /// Caller-facing description of a failed run.
    pub fn failure_message(&self) -> Option<String> {
        if self.succeeded() {
            return None;
        }
        let detail = tail(&self.stderr, 2000);
        let message = match self.exit_code {
            Some(0) if self.stdout_truncated => {
                "output exceeded the size limit before a complete JSON object was written".to_string()
            }
            Some(0) => "process did not print exactly one JSON object on stdout".to_string(),
            Some(code) => format!("process exited with status {}", code),
            None => "process was terminated by a signal".to_string(),
        };
        Some(if detail.is_empty() {
            message
        } else {
            format!("{}: {}", message, detail)
        })
    }
}

/// Runs skill processes.
pub struct SkillSandbox {
    config: RuntimeConfig,
    interpreter: Arc<dyn InterpreterResolver>,
    installer: Arc<dyn DependencyInstaller>,
    deps_root: PathBuf,
}

impl SkillSandbox {
    pub fn new(
        config: RuntimeConfig,
        interpreter: Arc<dyn InterpreterResolver>,
        installer: Arc<dyn DependencyInstaller>,
        deps_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            interpreter,
            installer,
            deps_root: deps_root.into(),
        }
    }

    /// Sandbox with the configured interpreter and pip-based repair.
    pub fn from_config(config: RuntimeConfig, deps_root: impl Into<PathBuf>) -> Self {
        let interpreter: Arc<dyn InterpreterResolver> =
            Arc::from(default_resolver(config.python_interpreter.clone()));
        let installer = Arc::new(PipInstaller::new(
            Arc::clone(&interpreter),
            config.dependency_install_timeout_secs,
        ));
        Self::new(config, interpreter, installer, deps_root)
    }

    /// Per-version dependency directory.
    pub fn deps_dir(&self, skill_id: Uuid, version_id: Uuid) -> PathBuf {
        self.deps_root
            .join(skill_id.to_string())
            .join(version_id.to_string())
    }

    /// Effective timeout: override, manifest, then default; clamped.
    pub fn effective_timeout(&self, request: &ExecutionRequest) -> u64 {
        request
            .timeout_secs
            .or(request.manifest.runtime.timeout_secs)
            .unwrap_or(self.config.default_timeout_secs)
            .clamp(1, self.config.max_timeout_secs.max(1))
    }

    /// Effective per-stream output ceiling; clamped.
    pub fn effective_output_limit(&self, request: &ExecutionRequest) -> u64 {
        let max = self.config.max_output_bytes.max(MIN_OUTPUT_BYTES);
        request
            .max_output_bytes
            .or(request.manifest.runtime.max_output_bytes)
            .unwrap_or(self.config.default_max_output_bytes)
            .clamp(MIN_OUTPUT_BYTES, max)
    }

    /// Run the invocation, repairing missing Python dependencies between
    /// attempts.
    ///
    /// A completed run is `Ok` whether or not it succeeded; inspect
    /// [`ExecutionReport::succeeded`]. Spawn failures, timeouts and
    /// cancellation are `Err`.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<ExecutionReport> {
        let runtime = &request.manifest.runtime;
        let entry = resolve_within_root(&request.package_root, &request.manifest.entry)?;
        let command = resolve_command(runtime, entry.as_path(), self.interpreter.as_ref())?;

        let limits = RunLimits {
            timeout_secs: self.effective_timeout(request),
            max_output_bytes: usize::try_from(self.effective_output_limit(request))
                .unwrap_or(usize::MAX),
        };
        let deps_dir = self.deps_dir(request.skill_id, request.version_id);
        let env = self.build_env(request, &deps_dir)?;
        let payload = serde_json::to_vec(&request.payload)?;

        let repairable = runtime.kind == RuntimeKind::Python && is_known_actor(request.actor_id.as_deref());
        let started = Instant::now();
        let mut attempts: Vec<RepairAttempt> = Vec::new();

        loop {
            let output = run_process(
                &command,
                &request.package_root,
                &env,
                payload.clone(),
                limits,
                cancel,
            )
            .await?;

            if output.success() || !repairable || attempts.len() as u32 >= self.config.max_repair_rounds {
                return Ok(report(output, attempts, limits.timeout_secs, started.elapsed()));
            }

            let modules = detect_missing_modules(&output.stderr);
            if modules.is_empty() {
                return Ok(report(output, attempts, limits.timeout_secs, started.elapsed()));
            }

            let round = attempts.len() as u32 + 1;
            let packages: Vec<String> = modules
                .iter()
                .map(|m| package_for_module(m, &request.manifest.dependencies))
                .collect();
            info!(
                skill = %request.manifest.id,
                round = round,
                packages = ?packages,
                "Missing Python modules, attempting repair"
            );

            match self.installer.install(&packages, &deps_dir).await {
                Ok(()) => attempts.push(RepairAttempt {
                    round,
                    modules,
                    packages,
                    success: true,
                    error: None,
                }),
                Err(e) => {
                    warn!(skill = %request.manifest.id, error = %e, "Dependency repair failed");
                    let mut output = output;
                    if !output.stderr.is_empty() && !output.stderr.ends_with('\n') {
                        output.stderr.push('\n');
                    }
                    output
                        .stderr
                        .push_str(&format!("[auto-repair round {}] {}\n", round, e));
                    attempts.push(RepairAttempt {
                        round,
                        modules,
                        packages,
                        success: false,
                        error: Some(e.to_string()),
                    });
                    return Ok(report(output, attempts, limits.timeout_secs, started.elapsed()));
                }
            }
        }
    }

    fn build_env(&self, request: &ExecutionRequest, deps_dir: &Path) -> Result<Vec<(String, String)>> {
        let root = request.package_root.to_string_lossy().into_owned();
        let mut env = vec![
            (PAYLOAD_ENV.to_string(), request.payload.to_string()),
            (PACKAGE_ROOT_ENV.to_string(), root),
        ];
        for (key, value) in &request.manifest.runtime.env {
            if key == PAYLOAD_ENV || key == PACKAGE_ROOT_ENV {
                debug!(key = %key, "Ignoring reserved runtime env entry");
                continue;
            }
            env.push((key.clone(), value.clone()));
        }

        if request.manifest.runtime.kind == RuntimeKind::Python {
            let mut paths = vec![deps_dir.to_path_buf()];
            let inherited = request
                .manifest
                .runtime
                .env
                .get("PYTHONPATH")
                .cloned()
                .or_else(|| std::env::var("PYTHONPATH").ok());
            if let Some(existing) = inherited {
                paths.extend(std::env::split_paths(&existing));
            }
            let joined = std::env::join_paths(paths)
                .map_err(|e| SkillError::Runtime(format!("Invalid PYTHONPATH: {}", e)))?;
            env.retain(|(k, _)| k != "PYTHONPATH");
            env.push(("PYTHONPATH".to_string(), joined.to_string_lossy().into_owned()));
            env.push(("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()));
            env.push(("PYTHONUNBUFFERED".to_string(), "1".to_string()));
            env.push(("PYTHONIOENCODING".to_string(), "utf-8".to_string()));
        }
        Ok(env)
    }
}

/// Anonymous (or missing) actors never trigger installs.
pub fn is_known_actor(actor: Option<&str>) -> bool {
    match actor.map(str::trim) {
        None | Some("") => false,
        Some(a) => !a.eq_ignore_ascii_case("anonymous"),
    }
}

fn report(
    output: ProcessOutput,
    repair_attempts: Vec<RepairAttempt>,
    timeout_secs: u64,
    elapsed: Duration,
) -> ExecutionReport {
    let result = if output.success() && !output.stdout_truncated {
        parse_single_object(&output.stdout)
    } else {
        None
    };
    ExecutionReport {
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        stdout_truncated: output.stdout_truncated,
        stderr_truncated: output.stderr_truncated,
        result,
        repair_attempts,
        timeout_secs,
        duration_ms: elapsed.as_millis() as u64,
    }
}

fn parse_single_object(stdout: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(stdout.trim()) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}
