//! Command resolution per runtime kind.

use std::path::{Path, PathBuf};

use crate::error::{Result, SkillError};
use crate::manifest::{RuntimeKind, RuntimeSpec};

/// Locates the managed Python interpreter.
///
/// Injected into the sandbox so tests and deployments can substitute the
/// interpreter without touching process-global state.
pub trait InterpreterResolver: Send + Sync {
    /// Path of the interpreter to run Python entries with.
    fn python(&self) -> Result<PathBuf>;
}

/// Always answers with one configured path.
#[derive(Debug, Clone)]
pub struct StaticInterpreter(pub PathBuf);

impl InterpreterResolver for StaticInterpreter {
    fn python(&self) -> Result<PathBuf> {
        Ok(self.0.clone())
    }
}

/// Searches `PATH` for the first available candidate.
#[derive(Debug, Clone)]
pub struct PathInterpreter {
    candidates: Vec<String>,
}

impl Default for PathInterpreter {
    fn default() -> Self {
        let candidates = if cfg!(windows) {
            vec!["python".to_string(), "py".to_string()]
        } else {
            vec!["python3".to_string(), "python".to_string()]
        };
        Self { candidates }
    }
}

impl InterpreterResolver for PathInterpreter {
    fn python(&self) -> Result<PathBuf> {
        self.candidates
            .iter()
            .find_map(|name| find_in_path(name))
            .ok_or_else(|| {
                SkillError::Runtime(format!(
                    "No Python interpreter found on PATH (tried {})",
                    self.candidates.join(", ")
                ))
            })
    }
}

/// Explicit interpreter from config, else a `PATH` search.
pub fn default_resolver(explicit: Option<PathBuf>) -> Box<dyn InterpreterResolver> {
    match explicit {
        Some(path) => Box::new(StaticInterpreter(path)),
        None => Box::new(PathInterpreter::default()),
    }
}

fn find_in_path(bin: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(bin);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let candidate = dir.join(format!("{}.exe", bin));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Program and argument vector of a child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Build the command line for `spec` running the absolute `entry` path.
///
/// - `python`: the interpreter (or `command` override) against the entry.
/// - `shell`: `sh` (or `command`) / PowerShell `-File` with the entry and
///   each argument passed as a single argument.
/// - `command`: the platform command shell running `command` (or the
///   entry) followed by the quoted arguments.
pub fn resolve_command(
    spec: &RuntimeSpec,
    entry: &Path,
    interpreter: &dyn InterpreterResolver,
) -> Result<ResolvedCommand> {
    let entry_text = entry.to_string_lossy().into_owned();

    match spec.kind {
        RuntimeKind::Python => {
            let program = match spec.command.as_deref().filter(|c| !c.trim().is_empty()) {
                Some(command) => PathBuf::from(command),
                None => interpreter.python()?,
            };
            let mut args = vec![entry_text];
            args.extend(spec.args.iter().cloned());
            Ok(ResolvedCommand { program, args })
        }
        RuntimeKind::Shell => {
            let shell = spec.command.as_deref().filter(|c| !c.trim().is_empty());
            let mut args = Vec::with_capacity(spec.args.len() + 1);
            args.push(entry_text);
            args.extend(spec.args.iter().cloned());
            Ok(platform_shell(shell, args))
        }
        RuntimeKind::Command => {
            let head = spec
                .command
                .clone()
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| quote_one(&entry_text));
            let line = if spec.args.is_empty() {
                head
            } else {
                format!("{} {}", head, quote_all(&spec.args))
            };
            Ok(command_shell(line))
        }
    }
}

#[cfg(not(windows))]
fn platform_shell(shell: Option<&str>, args: Vec<String>) -> ResolvedCommand {
    ResolvedCommand {
        program: PathBuf::from(shell.unwrap_or("sh")),
        args,
    }
}

#[cfg(windows)]
fn platform_shell(shell: Option<&str>, args: Vec<String>) -> ResolvedCommand {
    let mut full = vec![
        "-NoProfile".to_string(),
        "-NonInteractive".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-File".to_string(),
    ];
    full.extend(args);
    ResolvedCommand {
        program: PathBuf::from(shell.unwrap_or("powershell")),
        args: full,
    }
}

#[cfg(not(windows))]
fn command_shell(line: String) -> ResolvedCommand {
    ResolvedCommand {
        program: PathBuf::from("sh"),
        args: vec!["-c".to_string(), line],
    }
}

#[cfg(windows)]
fn command_shell(line: String) -> ResolvedCommand {
    ResolvedCommand {
        program: PathBuf::from("cmd"),
        args: vec!["/C".to_string(), line],
    }
}

#[cfg(not(windows))]
fn quote_one(word: &str) -> String {
    shell_words::quote(word).into_owned()
}

#[cfg(windows)]
fn quote_one(word: &str) -> String {
    format!("'{}'", word.replace('\'', "''"))
}

fn quote_all(words: &[String]) -> String {
    words
        .iter()
        .map(|w| quote_one(w))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spec(kind: RuntimeKind, command: Option<&str>, args: &[&str]) -> RuntimeSpec {
        let mut spec = RuntimeSpec::new(kind);
        spec.command = command.map(str::to_string);
        spec.args = args.iter().map(|a| a.to_string()).collect();
        spec
    }

    #[test]
    fn test_python_uses_resolver() {
        let resolver = StaticInterpreter(PathBuf::from("/opt/py/bin/python3"));
        let cmd = resolve_command(
            &spec(RuntimeKind::Python, None, &["--fast"]),
            Path::new("/pkg/main.py"),
            &resolver,
        )
        .unwrap();
        assert_eq!(cmd.program, PathBuf::from("/opt/py/bin/python3"));
        assert_eq!(cmd.args, vec!["/pkg/main.py", "--fast"]);
    }

    #[test]
    fn test_python_command_override() {
        let resolver = StaticInterpreter(PathBuf::from("/unused"));
        let cmd = resolve_command(
            &spec(RuntimeKind::Python, Some("/usr/bin/pypy3"), &[]),
            Path::new("/pkg/main.py"),
            &resolver,
        )
        .unwrap();
        assert_eq!(cmd.program, PathBuf::from("/usr/bin/pypy3"));
    }

    #[test]
    fn test_shell_passes_single_arguments() {
        let resolver = StaticInterpreter(PathBuf::from("/unused"));
        let cmd = resolve_command(
            &spec(RuntimeKind::Shell, None, &["two words", "it's"]),
            Path::new("/pkg dir/run.sh"),
            &resolver,
        )
        .unwrap();
        assert_eq!(cmd.program, PathBuf::from("sh"));
        assert_eq!(cmd.args, vec!["/pkg dir/run.sh", "two words", "it's"]);

        let bash = resolve_command(
            &spec(RuntimeKind::Shell, Some("bash"), &[]),
            Path::new("/pkg/run.sh"),
            &resolver,
        )
        .unwrap();
        assert_eq!(bash.program, PathBuf::from("bash"));
    }

    #[test]
    fn test_command_quotes_arguments() {
        let resolver = StaticInterpreter(PathBuf::from("/unused"));
        let cmd = resolve_command(
            &spec(RuntimeKind::Command, None, &["it's", "$HOME"]),
            Path::new("/pkg dir/run"),
            &resolver,
        )
        .unwrap();
        let parsed = shell_words::split(&cmd.args[1]).unwrap();
        assert_eq!(parsed, vec!["/pkg dir/run", "it's", "$HOME"]);
    }

    #[test]
    fn test_command_runs_through_shell() {
        let resolver = StaticInterpreter(PathBuf::from("/unused"));
        let cmd = resolve_command(
            &spec(RuntimeKind::Command, Some("node index.js"), &["a b"]),
            Path::new("/pkg/index.js"),
            &resolver,
        )
        .unwrap();
        assert_eq!(cmd.args, vec!["-c", "node index.js 'a b'"]);

        let bare = resolve_command(
            &spec(RuntimeKind::Command, None, &[]),
            Path::new("/pkg/run"),
            &resolver,
        )
        .unwrap();
        assert_eq!(bare.args, vec!["-c", "/pkg/run"]);
    }

    #[test]
    fn test_path_interpreter_reports_missing() {
        let resolver = PathInterpreter {
            candidates: vec!["definitely-not-a-real-python-binary".to_string()],
        };
        assert!(resolver.python().is_err());
    }
}
