//! Missing-dependency detection and installation for Python runtimes.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

use super::command::InterpreterResolver;
use crate::error::{Result, SkillError};

static MISSING_MODULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:ModuleNotFoundError: No module named |ImportError: No module named )['"]?([A-Za-z_][A-Za-z0-9_.]*)['"]?"#,
    )
    .unwrap()
});

/// Import names whose distribution is published under another name.
const MODULE_PACKAGES: &[(&str, &str)] = &[
    ("PIL", "pillow"),
    ("bs4", "beautifulsoup4"),
    ("cv2", "opencv-python"),
    ("dateutil", "python-dateutil"),
    ("docx", "python-docx"),
    ("dotenv", "python-dotenv"),
    ("fitz", "pymupdf"),
    ("jwt", "pyjwt"),
    ("magic", "python-magic"),
    ("pptx", "python-pptx"),
    ("serial", "pyserial"),
    ("sklearn", "scikit-learn"),
    ("skimage", "scikit-image"),
    ("yaml", "pyyaml"),
    ("Crypto", "pycryptodome"),
    ("OpenSSL", "pyopenssl"),
];

/// Top-level module names reported missing, deduplicated, in order of
/// appearance.
pub fn detect_missing_modules(output: &str) -> Vec<String> {
    let mut modules: Vec<String> = Vec::new();
    for caps in MISSING_MODULE.captures_iter(output) {
        let top = caps[1].split('.').next().unwrap_or_default().to_string();
        if !top.is_empty() && !modules.contains(&top) {
            modules.push(top);
        }
    }
    modules
}

/// Package to install for `module`: a declared dependency of the same
/// name first, then the alias table, then the module name itself.
pub fn package_for_module(module: &str, declared: &[String]) -> String {
    let wanted = normalize_distribution(module);
    let alias = MODULE_PACKAGES
        .iter()
        .find(|(name, _)| *name == module)
        .map(|(_, package)| *package);

    for requirement in declared {
        let name = normalize_distribution(requirement_name(requirement));
        if name == wanted || alias.is_some_and(|a| normalize_distribution(a) == name) {
            return requirement.trim().to_string();
        }
    }

    alias.map(str::to_string).unwrap_or_else(|| module.to_string())
}

fn requirement_name(requirement: &str) -> &str {
    let requirement = requirement.trim();
    let end = requirement
        .find(|c: char| matches!(c, '<' | '>' | '=' | '!' | '~' | ';' | '[' | ' ' | '@'))
        .unwrap_or(requirement.len());
    &requirement[..end]
}

fn normalize_distribution(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace(['-', '.'], "_")
}

/// One install round, reported back with the execution result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAttempt {
    pub round: u32,
    pub modules: Vec<String>,
    pub packages: Vec<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Installs packages into a per-version target directory.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn install(&self, packages: &[String], target: &Path) -> Result<()>;
}

/// `python -m pip install --target <dir>` with a timeout.
pub struct PipInstaller {
    interpreter: Arc<dyn InterpreterResolver>,
    timeout: Duration,
}

impl PipInstaller {
    pub fn new(interpreter: Arc<dyn InterpreterResolver>, timeout_secs: u64) -> Self {
        Self {
            interpreter,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl DependencyInstaller for PipInstaller {
    async fn install(&self, packages: &[String], target: &Path) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let python = self.interpreter.python()?;
        tokio::fs::create_dir_all(target).await?;

        info!(packages = ?packages, target = %target.display(), "Installing skill dependencies");

        let mut cmd = Command::new(&python);
        cmd.args(["-m", "pip", "install", "--disable-pip-version-check", "--no-input", "--target"])
            .arg(target)
            .args(packages)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| SkillError::Runtime(format!("Failed to run pip: {}", e)))?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                SkillError::Runtime(format!(
                    "pip install timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| SkillError::Runtime(format!("pip install failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(packages = ?packages, status = %output.status, "pip install failed");
            return Err(SkillError::Runtime(format!(
                "pip install {} failed ({}): {}",
                packages.join(" "),
                output.status,
                tail(&stderr, 800)
            )));
        }
        Ok(())
    }
}

/// Last `max` bytes of `text`, on a char boundary.
pub(crate) fn tail(text: &str, max: usize) -> &str {
    let text = text.trim_end();
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
