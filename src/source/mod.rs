//! Remote skill sources
//!
//! A source reference names a directory inside a hosted repository at a
//! given ref. Two spellings are accepted:
//!
//! ```text
//! owner/repo@ref[:subdir]
//! https://github.com/owner/repo/(tree|blob)/ref/path...
//! ```
//!
//! In the URL form, a trailing instruction file name (e.g. `SKILL.md`) is
//! dropped and its parent directory becomes the subdirectory.

mod fetch;

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;

use crate::error::{Result, SkillError};

pub use fetch::{extract_archive, ArchiveFetcher, ExtractLimits, ExtractSummary, HttpArchiveFetcher, SourceFetcher};

#[cfg(test)]
pub use fetch::MockArchiveFetcher;

/// File names recognized as natural-language instruction documents.
pub const INSTRUCTION_FILE_NAMES: [&str; 3] = ["SKILL.md", "skill.md", "Skill.md"];

/// Default canonical code-hosting domain.
pub const DEFAULT_WEB_HOST: &str = "github.com";

static PLAIN_REF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<owner>[A-Za-z0-9][A-Za-z0-9-]{0,38})/(?P<repo>[A-Za-z0-9_.-]{1,100})@(?P<ref>[A-Za-z0-9_.][A-Za-z0-9_./-]{0,254})(?::(?P<subdir>[^:]*))?$",
    )
    .unwrap()
});

static SEGMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap());

/// A parsed source reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Branch, tag or commit.
    pub git_ref: String,
    /// Normalized subdirectory (`a/b`), `None` for the repository root.
    pub subdir: Option<String>,
}

impl SourceRef {
    /// Parse a source reference against the default web host.
    pub fn parse(input: &str) -> Result<Self> {
        Self::parse_with_host(input, DEFAULT_WEB_HOST)
    }

    /// Parse a source reference, accepting URLs only on `web_host`.
    pub fn parse_with_host(input: &str, web_host: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SkillError::Source("Empty source reference".to_string()));
        }

        if input.starts_with("http://") || input.starts_with("https://") {
            return Self::parse_url(input, web_host);
        }

        let captures = PLAIN_REF_RE.captures(input).ok_or_else(|| {
            SkillError::Source(format!(
                "Invalid source reference '{}': expected owner/repo@ref[:subdir] or a {} URL",
                input, web_host
            ))
        })?;

        let git_ref = captures["ref"].trim_end_matches('/').to_string();
        check_ref(&git_ref, input)?;
        let subdir = match captures.name("subdir") {
            Some(m) => normalize_subdir(m.as_str())?,
            None => None,
        };

        Ok(Self {
            owner: captures["owner"].to_string(),
            repo: strip_git_suffix(&captures["repo"]).to_string(),
            git_ref,
            subdir,
        })
    }

    fn parse_url(input: &str, web_host: &str) -> Result<Self> {
        let url = Url::parse(input)
            .map_err(|e| SkillError::Source(format!("Invalid source URL '{}': {}", input, e)))?;

        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let expected = web_host.to_ascii_lowercase();
        if host != expected && host != format!("www.{}", expected) {
            return Err(SkillError::Source(format!(
                "Unsupported source host '{}': only {} URLs are accepted",
                host, web_host
            )));
        }

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        if segments.len() < 4 {
            return Err(SkillError::Source(format!(
                "Source URL '{}' must look like https://{}/owner/repo/tree/ref[/path]",
                input, web_host
            )));
        }

        let (owner, repo, mode, git_ref) = (segments[0], segments[1], segments[2], segments[3]);
        if mode != "tree" && mode != "blob" {
            return Err(SkillError::Source(format!(
                "Unsupported URL mode '{}' in '{}': expected tree or blob",
                mode, input
            )));
        }
        for (label, value) in [("owner", owner), ("repo", repo)] {
            if !SEGMENT_RE.is_match(value) {
                return Err(SkillError::Source(format!(
                    "Invalid {} '{}' in source URL",
                    label, value
                )));
            }
        }
        check_ref(git_ref, input)?;

        let mut rest: Vec<&str> = segments[4..].to_vec();
        if rest
            .last()
            .map(|last| INSTRUCTION_FILE_NAMES.contains(last))
            .unwrap_or(false)
        {
            rest.pop();
        }
        let subdir = normalize_subdir(&rest.join("/"))?;

        Ok(Self {
            owner: owner.to_string(),
            repo: strip_git_suffix(repo).to_string(),
            git_ref: git_ref.to_string(),
            subdir,
        })
    }

    /// Archive endpoint URL for this reference.
    pub fn archive_url(&self, base_url: &str) -> String {
        format!(
            "{}/{}/{}/zip/{}",
            base_url.trim_end_matches('/'),
            self.owner,
            self.repo,
            self.git_ref
        )
    }

    /// Canonical `owner/repo@ref[:subdir]` locator.
    pub fn locator(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.repo, self.git_ref)?;
        if let Some(subdir) = &self.subdir {
            write!(f, ":{}", subdir)?;
        }
        Ok(())
    }
}

/// Normalize a subdirectory: strip surrounding slashes and reject `.`/`..`
/// segments. An empty result means the repository root.
pub fn normalize_subdir(raw: &str) -> Result<Option<String>> {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.contains('\\') {
        return Err(SkillError::Source(format!(
            "Invalid subdirectory '{}': backslashes are not allowed",
            raw
        )));
    }

    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segment == "." || segment == ".." {
            return Err(SkillError::Source(format!(
                "Invalid subdirectory '{}': '.' and '..' segments are not allowed",
                raw
            )));
        }
        segments.push(segment);
    }

    Ok(Some(segments.join("/")))
}

fn check_ref(git_ref: &str, input: &str) -> Result<()> {
    if git_ref.is_empty() || git_ref.split('/').any(|s| s == ".." || s == ".") {
        return Err(SkillError::Source(format!(
            "Invalid ref in source reference '{}'",
            input
        )));
    }
    Ok(())
}

fn strip_git_suffix(repo: &str) -> &str {
    repo.strip_suffix(".git").unwrap_or(repo)
}
