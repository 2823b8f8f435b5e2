//! Compatibility adapter for instruction-only packages
//!
//! Many published skill packages carry no native manifest, only a Markdown
//! instruction document with YAML front-matter:
//!
//! ```text
//! ---
//! name: PDF Tools
//! description: Work with PDF files
//! ---
//! # PDF Tools
//!
//! Use pypdf to ...
//! ```
//!
//! The adapter synthesizes a single-tool manifest for such a package and
//! writes a generated runner next to the document. The tool returns the
//! instructions (full or trimmed) and can inline a few sibling files.

mod template;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::manifest::{validate_manifest, Manifest, RiskLevel, RuntimeKind, RuntimeSpec, ToolDescriptor};
use crate::source::{SourceRef, INSTRUCTION_FILE_NAMES};

pub use template::{render_runner, RUNNER_ENTRY};

const FALLBACK_SLUG: &str = "imported-skill";
const RESERVED_PREFIX: &str = "ext-";
const MAX_SLUG_LEN: usize = 64;
const MAX_DISPLAY_NAME_LEN: usize = 128;
const MAX_DESCRIPTION_LEN: usize = 2048;
const MAX_TOOL_DESCRIPTION_LEN: usize = 4096;

static FRONT_MATTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\x{FEFF}?---\r?\n(.*?)\r?\n---[ \t]*(?:\r?\n|$)").unwrap());

static SEMVER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+(?:[-+][0-9A-Za-z.+-]+)?$").unwrap());

/// Instruction document split into front-matter fields and body.
#[derive(Debug, Clone, Default)]
struct InstructionDoc {
    fields: BTreeMap<String, String>,
    body: String,
}

impl InstructionDoc {
    fn parse(raw: &str) -> Self {
        let Some(captures) = FRONT_MATTER_RE.captures(raw) else {
            return Self {
                fields: BTreeMap::new(),
                body: raw.trim().to_string(),
            };
        };
        let (Some(front), Some(full)) = (captures.get(1), captures.get(0)) else {
            return Self::default();
        };

        let fields = match serde_yaml::from_str::<serde_yaml::Value>(front.as_str()) {
            Ok(serde_yaml::Value::Mapping(map)) => map
                .into_iter()
                .filter_map(|(k, v)| Some((k.as_str()?.to_ascii_lowercase(), scalar_text(&v)?)))
                .collect(),
            Ok(_) => BTreeMap::new(),
            Err(e) => {
                warn!(error = %e, "Ignoring unparseable instruction front-matter");
                BTreeMap::new()
            }
        };

        Self {
            fields,
            body: raw[full.end()..].trim().to_string(),
        }
    }

    fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn first_heading(&self) -> Option<String> {
        self.body.lines().find_map(|line| {
            let line = line.trim();
            let text = line.strip_prefix('#')?.trim_start_matches('#').trim();
            (!text.is_empty()).then(|| text.to_string())
        })
    }

    fn first_paragraph(&self) -> Option<String> {
        let mut paragraph: Vec<&str> = Vec::new();
        let mut in_code = false;
        for line in self.body.lines() {
            let line = line.trim();
            if line.starts_with("```") {
                in_code = !in_code;
                continue;
            }
            if in_code || line.starts_with('#') {
                if !paragraph.is_empty() {
                    break;
                }
                continue;
            }
            if line.is_empty() {
                if !paragraph.is_empty() {
                    break;
                }
                continue;
            }
            paragraph.push(line);
        }
        (!paragraph.is_empty()).then(|| paragraph.join(" "))
    }
}

/// Synthesizes manifests for packages that only ship an instruction document.
#[derive(Debug, Clone, Default)]
pub struct CompatAdapter {
    reserved: HashSet<String>,
}

impl CompatAdapter {
    /// Create an adapter that keeps clear of the given built-in slugs.
    pub fn new<I, S>(reserved: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reserved: reserved.into_iter().map(Into::into).collect(),
        }
    }

    /// Reserve one more slug.
    pub fn reserve(&mut self, slug: impl Into<String>) {
        self.reserved.insert(slug.into());
    }

    /// Adapt the package at `package_root`.
    ///
    /// Returns `Ok(None)` when the package has no instruction document. On
    /// success the runner has been written to [`RUNNER_ENTRY`] inside the
    /// package.
    pub fn adapt(&self, package_root: &Path, source: &SourceRef) -> Result<Option<Manifest>> {
        let Some(instruction_file) = find_instruction_file(package_root) else {
            debug!(root = %package_root.display(), "No instruction document found");
            return Ok(None);
        };

        let raw = std::fs::read_to_string(package_root.join(instruction_file))?;
        let doc = InstructionDoc::parse(&raw);

        let id = self.derive_slug(doc.field("name"), source);
        let name = truncate_chars(
            &doc.field("title")
                .map(str::to_string)
                .or_else(|| doc.first_heading())
                .or_else(|| doc.field("name").map(str::to_string))
                .unwrap_or_else(|| id.clone()),
            MAX_DISPLAY_NAME_LEN,
        );
        let description = truncate_chars(
            &doc.field("description")
                .map(str::to_string)
                .or_else(|| doc.first_paragraph())
                .unwrap_or_else(|| format!("Instructions imported from {}", source)),
            MAX_DESCRIPTION_LEN,
        );
        let version = match doc.field("version") {
            Some(v) if SEMVER_RE.is_match(v) => v.to_string(),
            _ => derived_version(&raw),
        };

        let runner_path = package_root.join(RUNNER_ENTRY);
        if let Some(parent) = runner_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&runner_path, render_runner(&id, instruction_file))?;

        let tool = ToolDescriptor {
            name: id.replace('-', "_"),
            description: truncate_chars(
                &format!(
                    "Load the '{}' skill instructions. {} Pass mode=summary for a trimmed copy and files=[...] to inline package files.",
                    name, description
                ),
                MAX_TOOL_DESCRIPTION_LEN,
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "mode": {
                        "type": "string",
                        "enum": ["full", "summary"],
                        "description": "full returns the whole document, summary a trimmed copy"
                    },
                    "files": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Package-relative files to inline"
                    },
                    "query": {
                        "type": "string",
                        "description": "What the instructions are needed for"
                    }
                }
            }),
            aliases: Vec::new(),
        };

        let manifest = Manifest {
            id,
            name,
            version,
            entry: RUNNER_ENTRY.to_string(),
            description,
            tools: vec![tool],
            dependencies: Vec::new(),
            capabilities: vec!["instructions".to_string()],
            runtime: RuntimeSpec::new(RuntimeKind::Python),
            permissions: vec!["read:package".to_string()],
            platforms: Vec::new(),
            risk_level: RiskLevel::Low,
        };
        validate_manifest(&manifest)?;

        info!(
            skill = %manifest.id,
            version = %manifest.version,
            instructions = instruction_file,
            "Synthesized manifest from instruction document"
        );
        Ok(Some(manifest))
    }

    fn derive_slug(&self, declared_name: Option<&str>, source: &SourceRef) -> String {
        let from_source = || {
            let mut base = format!("{}-{}", source.owner, source.repo);
            if let Some(last) = source.subdir.as_deref().and_then(|s| s.rsplit('/').next()) {
                base.push('-');
                base.push_str(last);
            }
            kebab_case(&base)
        };

        let slug = declared_name
            .and_then(kebab_case)
            .or_else(from_source)
            .unwrap_or_else(|| FALLBACK_SLUG.to_string());

        if !self.reserved.contains(&slug) {
            return slug;
        }

        let prefixed = truncate_chars(&format!("{}{}", RESERVED_PREFIX, slug), MAX_SLUG_LEN);
        let mut candidate = prefixed.clone();
        let mut n = 2;
        while self.reserved.contains(&candidate) {
            candidate = format!("{}-{}", prefixed, n);
            n += 1;
        }
        warn!(slug = %slug, renamed = %candidate, "Imported skill slug collides with a built-in");
        candidate
    }
}

fn find_instruction_file(root: &Path) -> Option<&'static str> {
    INSTRUCTION_FILE_NAMES
        .iter()
        .copied()
        .find(|name| root.join(name).is_file())
}

fn scalar_text(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Lowercase, ASCII alphanumerics separated by single dashes.
fn kebab_case(input: &str) -> Option<String> {
    let mut out = String::new();
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if out.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    let out = out.trim_end_matches('-').to_string();
    (!out.is_empty()).then_some(out)
}

/// `1.0.0+<short content hash>`, so edited documents get a new version.
fn derived_version(raw: &str) -> String {
    let digest = hex::encode(Sha256::digest(raw.as_bytes()));
    format!("1.0.0+{}", &digest[..12])
}

fn truncate_chars(input: &str, max: usize) -> String {
    match input.char_indices().nth(max) {
        Some((idx, _)) => input[..idx].trim_end().to_string(),
        None => input.to_string(),
    }
}
