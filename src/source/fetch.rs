//! Source archive download and extraction
//!
//! Snapshots are fetched as zip archives from the code host's archive
//! endpoint and unpacked into a fresh scratch directory. Every entry is
//! stripped of its synthetic top-level folder, optionally restricted to the
//! requested subdirectory, then resolved against the scratch root; an entry
//! that would land outside the root aborts the whole extraction before it is
//! written.

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::config::FetchConfig;
use crate::error::{Result, SkillError};
use crate::security::resolve_within_root;

use super::SourceRef;

const FETCH_USER_AGENT: &str = concat!("skillgate/", env!("CARGO_PKG_VERSION"));
const SYMLINK_MODE: u32 = 0o120000;
const FILE_TYPE_MASK: u32 = 0o170000;

/// Downloads the raw archive bytes for a source reference.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    /// Download the zip snapshot of `source`.
    async fn download(&self, source: &SourceRef, token: Option<String>) -> Result<Vec<u8>>;
}

/// `ArchiveFetcher` backed by the host's HTTP archive endpoint.
pub struct HttpArchiveFetcher {
    client: Client,
    base_url: String,
    max_bytes: u64,
}

impl HttpArchiveFetcher {
    /// Create a fetcher from the fetch configuration.
    pub fn new(config: &FetchConfig) -> Self {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: config.archive_base_url.clone(),
            max_bytes: config.max_archive_bytes,
        }
    }
}

#[async_trait]
impl ArchiveFetcher for HttpArchiveFetcher {
    async fn download(&self, source: &SourceRef, token: Option<String>) -> Result<Vec<u8>> {
        let url = source.archive_url(&self.base_url);
        debug!(url = %url, "Downloading source archive");

        let mut request = self
            .client
            .get(&url)
            .header("User-Agent", FETCH_USER_AGENT)
            .header("Accept", "application/zip");
        if let Some(token) = token.as_deref().filter(|t| !t.trim().is_empty()) {
            request = request.bearer_auth(token);
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| SkillError::Source(format!("Archive request for {} failed: {}", source, e)))?;

        if !response.status().is_success() {
            return Err(SkillError::Source(format!(
                "Archive download for {} failed: HTTP {}",
                source,
                response.status()
            )));
        }
        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(SkillError::Source(format!(
                    "Archive for {} is {} bytes, above the {} byte limit",
                    source, length, self.max_bytes
                )));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| SkillError::Source(format!("Archive download for {} failed: {}", source, e)))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(SkillError::Source(format!(
                    "Archive for {} exceeds the {} byte limit",
                    source, self.max_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        info!(source = %source, bytes = body.len(), "Downloaded source archive");
        Ok(body)
    }
}

/// Extraction ceilings.
#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    /// Maximum number of archive entries.
    pub max_entries: usize,
    /// Maximum total uncompressed bytes written.
    pub max_total_bytes: u64,
}

impl From<&FetchConfig> for ExtractLimits {
    fn from(config: &FetchConfig) -> Self {
        Self {
            max_entries: config.max_entries,
            max_total_bytes: config.max_archive_bytes,
        }
    }
}

/// What an extraction wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Files written.
    pub files: usize,
    /// Total bytes written.
    pub bytes: u64,
}

/// Downloads a source reference and unpacks it into a scratch directory.
///
/// The returned `TempDir` is owned by the caller; dropping it removes the
/// scratch directory.
pub struct SourceFetcher {
    fetcher: Arc<dyn ArchiveFetcher>,
    config: FetchConfig,
}

impl SourceFetcher {
    /// Create a source fetcher over an archive fetcher.
    pub fn new(fetcher: Arc<dyn ArchiveFetcher>, config: FetchConfig) -> Self {
        Self { fetcher, config }
    }

    /// Create a source fetcher that downloads over HTTP.
    pub fn http(config: FetchConfig) -> Self {
        let fetcher = Arc::new(HttpArchiveFetcher::new(&config));
        Self::new(fetcher, config)
    }

    /// Fetch `source` into a fresh scratch directory.
    pub async fn fetch(&self, source: &SourceRef, token: Option<&str>) -> Result<TempDir> {
        let token = token
            .map(str::to_string)
            .or_else(|| self.config.token.clone());
        let bytes = self.fetcher.download(source, token).await?;

        let scratch = tempfile::Builder::new()
            .prefix("skillgate-fetch-")
            .tempdir()?;
        let dest = scratch.path().to_path_buf();
        let subdir = source.subdir.clone();
        let limits = ExtractLimits::from(&self.config);

        let summary = tokio::task::spawn_blocking(move || {
            extract_archive(&bytes, &dest, subdir.as_deref(), limits)
        })
        .await
        .map_err(|e| SkillError::Source(format!("Extraction task failed: {}", e)))??;

        info!(
            source = %source,
            files = summary.files,
            bytes = summary.bytes,
            scratch = %scratch.path().display(),
            "Extracted source archive"
        );
        Ok(scratch)
    }
}

/// Extract a zip snapshot into `dest`.
///
/// The first path component of every entry is stripped. When `subdir` is
/// given, only entries below it are kept and they are written relative to
/// it. Any entry resolving outside `dest` fails the extraction.
pub fn extract_archive(
    bytes: &[u8],
    dest: &Path,
    subdir: Option<&str>,
    limits: ExtractLimits,
) -> Result<ExtractSummary> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    if archive.len() > limits.max_entries {
        return Err(SkillError::Source(format!(
            "Archive has {} entries, above the {} entry limit",
            archive.len(),
            limits.max_entries
        )));
    }

    let prefix = subdir.map(|s| format!("{}/", s.trim_matches('/')));
    let mut summary = ExtractSummary::default();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let raw_name = entry.name().replace('\\', "/");

        let Some((_, rest)) = raw_name.split_once('/') else {
            continue;
        };
        let relative = match &prefix {
            Some(prefix) => match rest.strip_prefix(prefix.as_str()) {
                Some(inner) => inner,
                None => continue,
            },
            None => rest,
        };
        if relative.trim_matches('/').is_empty() {
            continue;
        }

        let target = resolve_within_root(dest, relative).map_err(|e| {
            warn!(entry = %raw_name, "Rejected unsafe archive entry");
            SkillError::Source(format!("Unsafe archive entry '{}': {}", raw_name, e))
        })?;

        if entry.is_dir() {
            std::fs::create_dir_all(target.as_path())?;
            continue;
        }
        if entry
            .unix_mode()
            .map(|mode| mode & FILE_TYPE_MASK == SYMLINK_MODE)
            .unwrap_or(false)
        {
            warn!(entry = %raw_name, "Skipping symlink archive entry");
            continue;
        }

        let remaining = limits.max_total_bytes.saturating_sub(summary.bytes);
        if entry.size() > remaining {
            return Err(SkillError::Source(format!(
                "Archive expands beyond the {} byte limit",
                limits.max_total_bytes
            )));
        }

        if let Some(parent) = target.as_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut output = std::fs::File::create(target.as_path())?;
        let written = std::io::copy(&mut (&mut entry).take(remaining + 1), &mut output)?;
        if written > remaining {
            drop(output);
            let _ = std::fs::remove_file(target.as_path());
            return Err(SkillError::Source(format!(
                "Archive expands beyond the {} byte limit",
                limits.max_total_bytes
            )));
        }

        summary.files += 1;
        summary.bytes += written;
    }

    if summary.files == 0 {
        return Err(SkillError::Source(match subdir {
            Some(subdir) => format!("Subdirectory '{}' not found in archive", subdir),
            None => "Archive contains no files".to_string(),
        }));
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, content) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    fn limits() -> ExtractLimits {
        ExtractLimits {
            max_entries: 100,
            max_total_bytes: 1024 * 1024,
        }
    }

    #[test]
    fn test_strips_top_level_folder() {
        let bytes = build_zip(&[
            ("repo-main/", ""),
            ("repo-main/skill.json", "{}"),
            ("repo-main/src/main.py", "print('hi')"),
        ]);
        let tmp = TempDir::new().unwrap();
        let summary = extract_archive(&bytes, tmp.path(), None, limits()).unwrap();

        assert_eq!(summary.files, 2);
        assert!(tmp.path().join("skill.json").is_file());
        assert!(tmp.path().join("src/main.py").is_file());
    }

    #[test]
    fn test_restricts_to_subdirectory() {
        let bytes = build_zip(&[
            ("repo-main/README.md", "root"),
            ("repo-main/skills/pdf/SKILL.md", "pdf"),
            ("repo-main/skills/pdf/lib/util.py", "x = 1"),
            ("repo-main/skills/pdfx/other.md", "no"),
        ]);
        let tmp = TempDir::new().unwrap();
        let summary = extract_archive(&bytes, tmp.path(), Some("skills/pdf"), limits()).unwrap();

        assert_eq!(summary.files, 2);
        assert!(tmp.path().join("SKILL.md").is_file());
        assert!(tmp.path().join("lib/util.py").is_file());
        assert!(!tmp.path().join("README.md").exists());
        assert!(!tmp.path().join("other.md").exists());
    }

    #[test]
    fn test_traversal_entry_is_rejected_and_not_written() {
        let outer = TempDir::new().unwrap();
        let dest = outer.path().join("scratch");
        std::fs::create_dir_all(&dest).unwrap();

        let bytes = build_zip(&[
            ("repo-main/ok.txt", "fine"),
            ("repo-main/../../escaped.txt", "evil"),
        ]);
        let err = extract_archive(&bytes, &dest, None, limits()).unwrap_err();

        assert!(matches!(err, SkillError::Source(_)));
        assert!(err.to_string().contains("Unsafe archive entry"));
        assert!(!outer.path().join("escaped.txt").exists());
        assert!(!dest.join("escaped.txt").exists());
    }

    #[test]
    fn test_traversal_inside_subdirectory_is_rejected() {
        let outer = TempDir::new().unwrap();
        let dest = outer.path().join("scratch");
        std::fs::create_dir_all(&dest).unwrap();

        let bytes = build_zip(&[("repo-main/sub/../../../../evil.sh", "rm -rf")]);
        let result = extract_archive(&bytes, &dest, Some("sub"), limits());

        assert!(result.is_err());
        assert!(!outer.path().join("evil.sh").exists());
    }

    #[test]
    fn test_missing_subdirectory_is_an_error() {
        let bytes = build_zip(&[("repo-main/a.txt", "a")]);
        let tmp = TempDir::new().unwrap();
        let err = extract_archive(&bytes, tmp.path(), Some("nope"), limits()).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_entry_and_size_limits() {
        let bytes = build_zip(&[("r/a.txt", "aaaa"), ("r/b.txt", "bbbb")]);
        let tmp = TempDir::new().unwrap();

        let few_entries = ExtractLimits {
            max_entries: 1,
            max_total_bytes: 1024,
        };
        assert!(extract_archive(&bytes, tmp.path(), None, few_entries).is_err());

        let few_bytes = ExtractLimits {
            max_entries: 10,
            max_total_bytes: 6,
        };
        assert!(extract_archive(&bytes, tmp.path(), None, few_bytes).is_err());
    }

    #[tokio::test]
    async fn test_source_fetcher_uses_configured_token_and_extracts() {
        let bytes = build_zip(&[("repo-main/skills/x/SKILL.md", "# X")]);
        let mut fetcher = MockArchiveFetcher::new();
        fetcher
            .expect_download()
            .withf(|source, token| source.repo == "repo" && token.as_deref() == Some("cfg-token"))
            .times(1)
            .returning(move |_, _| Ok(bytes.clone()));

        let config = FetchConfig {
            token: Some("cfg-token".to_string()),
            ..FetchConfig::default()
        };
        let source_fetcher = SourceFetcher::new(Arc::new(fetcher), config);
        let source = SourceRef::parse("owner/repo@main:skills/x").unwrap();

        let scratch = source_fetcher.fetch(&source, None).await.unwrap();
        assert!(scratch.path().join("SKILL.md").is_file());

        let path = scratch.path().to_path_buf();
        drop(scratch);
        assert!(!path.exists());
    }
}
