//! Path validation utilities for secure file operations
//!
//! This module resolves untrusted relative paths (archive entry names,
//! caller-requested sibling files) against a root directory and refuses any
//! path whose resolved location escapes that root. Resolution is lexical so
//! it works for files that do not exist yet, which is the zip-slip case.
//! The deepest part of the result that already exists is then canonicalized
//! and compared against the canonical root, which catches symlinks that
//! point outside.

use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SkillError};

/// A validated path that is guaranteed to be within its root.
///
/// This struct can only be created through `resolve_within_root`, ensuring
/// that any `SafePath` instance represents a path that has been verified to
/// stay inside the allowed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafePath {
    path: PathBuf,
    relative: String,
}

impl SafePath {
    /// Returns a reference to the underlying absolute path.
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// Normalized `/`-separated path relative to the root.
    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// Converts the SafePath into a PathBuf.
    pub fn into_path_buf(self) -> PathBuf {
        self.path
    }
}

impl AsRef<Path> for SafePath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Resolves `relative` against `root`, failing closed when it escapes.
///
/// Backslashes are treated as separators on every platform so that entries
/// produced on Windows cannot smuggle `..\` past a Unix check.
///
/// # Errors
///
/// * `SkillError::SecurityViolation` - absolute paths, drive prefixes, any
///   `..` that climbs above `root`, or an existing symlink inside `root`
///   that leads out of it.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use skillgate::security::resolve_within_root;
///
/// let ok = resolve_within_root(Path::new("/scratch"), "src/main.py").unwrap();
/// assert!(ok.as_path().starts_with("/scratch"));
///
/// assert!(resolve_within_root(Path::new("/scratch"), "../../etc/passwd").is_err());
/// ```
pub fn resolve_within_root(root: &Path, relative: &str) -> Result<SafePath> {
    let normalized = normalize_relative(relative)?;

    let mut resolved = root.to_path_buf();
    for segment in normalized.split('/').filter(|s| !s.is_empty()) {
        resolved.push(segment);
    }

    if let Some(existing) = resolved
        .ancestors()
        .take_while(|p| p.starts_with(root) && *p != root)
        .find(|p| p.exists())
    {
        let real_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let real = existing.canonicalize()?;
        if !real.starts_with(&real_root) {
            return Err(SkillError::SecurityViolation(format!(
                "Path escapes root: {} resolves to {}, not within {}",
                relative,
                real.display(),
                root.display()
            )));
        }
    }

    Ok(SafePath {
        path: resolved,
        relative: normalized,
    })
}

/// Lexically normalizes an untrusted relative path into `a/b/c` form.
///
/// `.` segments are dropped and `..` pops the previous segment. A `..` with
/// nothing left to pop, an absolute path or a Windows drive prefix is a
/// `SecurityViolation`.
pub fn normalize_relative(relative: &str) -> Result<String> {
    let unified = relative.replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return Err(SkillError::SecurityViolation(format!(
            "Absolute path not allowed: {}",
            relative
        )));
    }

    let mut segments: Vec<String> = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => segments.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            Component::ParentDir => {
                if segments.pop().is_none() {
                    return Err(SkillError::SecurityViolation(format!(
                        "Path traversal outside root: {}",
                        relative
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SkillError::SecurityViolation(format!(
                    "Absolute path not allowed: {}",
                    relative
                )));
            }
        }
    }

    Ok(segments.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_valid_relative_path() {
        let temp = tempdir().unwrap();
        let safe = resolve_within_root(temp.path(), "src/main.py").unwrap();
        assert_eq!(safe.as_path(), temp.path().join("src").join("main.py"));
        assert_eq!(safe.relative(), "src/main.py");
    }

    #[test]
    fn test_traversal_with_double_dots() {
        let temp = tempdir().unwrap();
        let result = resolve_within_root(temp.path(), "../../../etc/passwd");
        assert!(matches!(result, Err(SkillError::SecurityViolation(_))));
    }

    #[test]
    fn test_nested_traversal_escaping() {
        let temp = tempdir().unwrap();
        let result = resolve_within_root(temp.path(), "a/b/c/../../../../etc/passwd");
        assert!(result.is_err());
    }

    #[test]
    fn test_inner_parent_that_stays_inside_is_allowed() {
        let temp = tempdir().unwrap();
        let safe = resolve_within_root(temp.path(), "a/b/../c.txt").unwrap();
        assert_eq!(safe.relative(), "a/c.txt");
    }

    #[test]
    fn test_windows_style_traversal() {
        let temp = tempdir().unwrap();
        let result = resolve_within_root(temp.path(), "..\\..\\etc\\passwd");
        assert!(result.is_err());
    }

    #[test]
    fn test_absolute_and_drive_paths_rejected() {
        let temp = tempdir().unwrap();
        assert!(resolve_within_root(temp.path(), "/etc/passwd").is_err());
        assert!(resolve_within_root(temp.path(), "C:\\Windows\\system32").is_err());
        assert!(resolve_within_root(temp.path(), "c:/temp").is_err());
    }

    #[test]
    fn test_current_directory_reference() {
        let temp = tempdir().unwrap();
        let safe = resolve_within_root(temp.path(), "./file.txt").unwrap();
        assert_eq!(safe.relative(), "file.txt");
    }

    #[test]
    fn test_empty_path_resolves_to_root() {
        let temp = tempdir().unwrap();
        let safe = resolve_within_root(temp.path(), "").unwrap();
        assert_eq!(safe.as_path(), temp.path());
        assert_eq!(safe.relative(), "");
    }

    #[test]
    fn test_safe_path_conversion() {
        let temp = tempdir().unwrap();
        let safe = resolve_within_root(temp.path(), "test.txt").unwrap();

        assert!(safe.as_path().ends_with("test.txt"));
        let path_ref: &Path = safe.as_ref();
        assert!(path_ref.ends_with("test.txt"));
        assert!(safe.into_path_buf().ends_with("test.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_leaving_root_is_rejected() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("pkg");
        let outside = temp.path().join("outside");
        std::fs::create_dir_all(root.join("lib")).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("secret.txt"), "x").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("escape")).unwrap();
        std::os::unix::fs::symlink(outside.join("secret.txt"), root.join("secret.txt")).unwrap();
        std::os::unix::fs::symlink(root.join("lib"), root.join("alias")).unwrap();

        for path in ["escape", "escape/secret.txt", "escape/not-yet.txt", "secret.txt"] {
            let err = resolve_within_root(&root, path).unwrap_err();
            assert!(matches!(err, SkillError::SecurityViolation(_)), "{}", path);
        }

        assert!(resolve_within_root(&root, "alias/main.py").is_ok());
        assert!(resolve_within_root(&root, "lib/new/file.py").is_ok());
    }
}
