//! Manifest parsing and validation
//!
//! Manifests arrive as JSON or YAML text. Parsing happens in two passes: a
//! structural pass over the raw document that reports the exact field path
//! of the first problem, then a typed pass over the deserialized `Manifest`
//! that enforces lengths, patterns and tool-name uniqueness.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SkillError};
use crate::security::normalize_relative;

use super::types::{normalize_tool_name, Manifest, RiskLevel, RuntimeKind};

/// Manifest filenames tried, in order, at the root of a package.
pub const MANIFEST_CANDIDATES: [&str; 4] =
    ["skill.json", "skill.yaml", "skill.yml", "manifest.json"];

pub const MAX_ID_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = 128;
pub const MAX_VERSION_LEN: usize = 64;
pub const MAX_ENTRY_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 2048;
pub const MAX_TOOLS: usize = 32;
pub const MAX_TOOL_NAME_LEN: usize = 128;
pub const MAX_TOOL_DESCRIPTION_LEN: usize = 4096;
pub const MAX_ALIASES: usize = 8;
pub const MAX_RUNTIME_ARGS: usize = 32;
pub const MAX_RUNTIME_ARG_LEN: usize = 1024;
pub const MAX_RUNTIME_ENV: usize = 64;
pub const MAX_TIMEOUT_SECS: u64 = 600;
pub const MIN_OUTPUT_BYTES: u64 = 1024;
pub const MAX_OUTPUT_BYTES: u64 = 16 * 1024 * 1024;
pub const MAX_DEPENDENCIES: usize = 64;

static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").unwrap());
static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+(?:[-+][0-9A-Za-z.+-]+)?$").unwrap());
static TOOL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap());
static ENV_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());
static DEPENDENCY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*(?:\[[A-Za-z0-9,_-]+\])?(?:[<>=!~]=?[0-9A-Za-z.*+-]+)?$").unwrap());

/// Parse and validate manifest text.
///
/// `source_label` names where the text came from (a file path, a source
/// reference) and is included in syntax errors.
///
/// # Errors
/// `SkillError::Manifest` naming the offending field path.
pub fn parse_manifest(text: &str, source_label: &str) -> Result<Manifest> {
    let mut document = parse_document(text, source_label)?;
    check_document(&document)?;
    drop_nulls(&mut document);

    let manifest: Manifest = serde_json::from_value(document)
        .map_err(|e| SkillError::manifest("$", format!("{}: {}", source_label, e)))?;
    let manifest = normalize(manifest);
    validate_manifest(&manifest)?;

    debug!(
        skill = %manifest.id,
        version = %manifest.version,
        tools = manifest.tools.len(),
        source = %source_label,
        "Parsed manifest"
    );
    Ok(manifest)
}

/// Locate and parse the first native manifest file in `dir`.
///
/// Returns `Ok(None)` when none of the candidate filenames exist.
pub fn load_manifest_from_dir(dir: &Path) -> Result<Option<(Manifest, String)>> {
    for candidate in MANIFEST_CANDIDATES {
        let path = dir.join(candidate);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)?;
        let manifest = parse_manifest(&text, &path.display().to_string())?;
        return Ok(Some((manifest, candidate.to_string())));
    }
    Ok(None)
}

/// Validate a typed manifest for correctness and safety.
///
/// Performs the following checks:
/// - identity, name, version and entry are present and within length ceilings
/// - 1 to 32 tools, names at most 128 characters, object input schemas
/// - tool names and aliases are unique ignoring case
/// - runtime arguments, environment, timeout and output ceiling are bounded
pub fn validate_manifest(manifest: &Manifest) -> Result<()> {
    check_string("id", &manifest.id, MAX_ID_LEN)?;
    if !ID_RE.is_match(&manifest.id) {
        return Err(SkillError::manifest(
            "id",
            format!(
                "invalid id '{}': lowercase letters, digits, '-' and '_' only",
                manifest.id
            ),
        ));
    }
    check_string("name", &manifest.name, MAX_NAME_LEN)?;
    check_string("version", &manifest.version, MAX_VERSION_LEN)?;
    if !VERSION_RE.is_match(&manifest.version) {
        return Err(SkillError::manifest(
            "version",
            format!("'{}' is not a semantic version", manifest.version),
        ));
    }
    check_string("entry", &manifest.entry, MAX_ENTRY_LEN)?;
    match normalize_relative(&manifest.entry) {
        Ok(normalized) if !normalized.is_empty() => {}
        _ => {
            return Err(SkillError::manifest(
                "entry",
                format!("'{}' must be a relative path inside the package", manifest.entry),
            ))
        }
    }
    if manifest.description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(SkillError::manifest(
            "description",
            format!("longer than {} characters", MAX_DESCRIPTION_LEN),
        ));
    }

    if manifest.tools.is_empty() {
        return Err(SkillError::manifest("tools", "at least one tool is required"));
    }
    if manifest.tools.len() > MAX_TOOLS {
        return Err(SkillError::manifest(
            "tools",
            format!("at most {} tools are allowed", MAX_TOOLS),
        ));
    }

    let mut seen: HashMap<String, String> = HashMap::new();
    for (index, tool) in manifest.tools.iter().enumerate() {
        let field = format!("tools[{}]", index);
        check_tool_name(&format!("{}.name", field), &tool.name)?;
        if tool.description.chars().count() > MAX_TOOL_DESCRIPTION_LEN {
            return Err(SkillError::manifest(
                format!("{}.description", field),
                format!("longer than {} characters", MAX_TOOL_DESCRIPTION_LEN),
            ));
        }
        if !tool.input_schema.is_object() {
            return Err(SkillError::manifest(
                format!("{}.input_schema", field),
                "must be a JSON object schema",
            ));
        }
        if tool.aliases.len() > MAX_ALIASES {
            return Err(SkillError::manifest(
                format!("{}.aliases", field),
                format!("at most {} aliases are allowed", MAX_ALIASES),
            ));
        }
        for (alias_index, alias) in tool.aliases.iter().enumerate() {
            check_tool_name(&format!("{}.aliases[{}]", field, alias_index), alias)?;
        }

        for (name_index, name) in tool.all_names().enumerate() {
            let key = normalize_tool_name(name);
            let name_field = if name_index == 0 {
                format!("{}.name", field)
            } else {
                format!("{}.aliases[{}]", field, name_index - 1)
            };
            if let Some(previous) = seen.get(&key) {
                return Err(SkillError::manifest(
                    name_field,
                    format!(
                        "duplicate tool name '{}' (conflicts with '{}')",
                        name, previous
                    ),
                ));
            }
            seen.insert(key, name.to_string());
        }
    }

    let runtime = &manifest.runtime;
    if let Some(command) = &runtime.command {
        check_string("runtime.command", command, MAX_RUNTIME_ARG_LEN)?;
    }
    if runtime.args.len() > MAX_RUNTIME_ARGS {
        return Err(SkillError::manifest(
            "runtime.args",
            format!("at most {} arguments are allowed", MAX_RUNTIME_ARGS),
        ));
    }
    for (index, arg) in runtime.args.iter().enumerate() {
        if arg.chars().count() > MAX_RUNTIME_ARG_LEN {
            return Err(SkillError::manifest(
                format!("runtime.args[{}]", index),
                format!("longer than {} characters", MAX_RUNTIME_ARG_LEN),
            ));
        }
    }
    if runtime.env.len() > MAX_RUNTIME_ENV {
        return Err(SkillError::manifest(
            "runtime.env",
            format!("at most {} variables are allowed", MAX_RUNTIME_ENV),
        ));
    }
    for (key, value) in &runtime.env {
        if !ENV_KEY_RE.is_match(key) {
            return Err(SkillError::manifest(
                format!("runtime.env.{}", key),
                "invalid environment variable name",
            ));
        }
        if value.chars().count() > MAX_RUNTIME_ARG_LEN {
            return Err(SkillError::manifest(
                format!("runtime.env.{}", key),
                format!("longer than {} characters", MAX_RUNTIME_ARG_LEN),
            ));
        }
    }
    if let Some(timeout) = runtime.timeout_secs {
        if timeout == 0 || timeout > MAX_TIMEOUT_SECS {
            return Err(SkillError::manifest(
                "runtime.timeout_secs",
                format!("must be between 1 and {}", MAX_TIMEOUT_SECS),
            ));
        }
    }
    if let Some(limit) = runtime.max_output_bytes {
        if !(MIN_OUTPUT_BYTES..=MAX_OUTPUT_BYTES).contains(&limit) {
            return Err(SkillError::manifest(
                "runtime.max_output_bytes",
                format!("must be between {} and {}", MIN_OUTPUT_BYTES, MAX_OUTPUT_BYTES),
            ));
        }
    }
    if manifest.dependencies.len() > MAX_DEPENDENCIES {
        return Err(SkillError::manifest(
            "dependencies",
            format!("at most {} dependencies are allowed", MAX_DEPENDENCIES),
        ));
    }
    for (index, dependency) in manifest.dependencies.iter().enumerate() {
        if !DEPENDENCY_RE.is_match(dependency) {
            return Err(SkillError::manifest(
                format!("dependencies[{}]", index),
                format!("'{}' is not a valid package requirement", dependency),
            ));
        }
    }

    Ok(())
}

fn parse_document(text: &str, source_label: &str) -> Result<Value> {
    let trimmed = text.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        return Err(SkillError::manifest(
            "$",
            format!("{}: manifest is empty", source_label),
        ));
    }

    let parsed = if trimmed.starts_with('{') {
        serde_json::from_str::<Value>(trimmed)
            .map_err(|e| SkillError::manifest("$", format!("{}: invalid JSON: {}", source_label, e)))
    } else {
        serde_yaml::from_str::<Value>(trimmed)
            .map_err(|e| SkillError::manifest("$", format!("{}: invalid YAML: {}", source_label, e)))
    }?;

    if !parsed.is_object() {
        return Err(SkillError::manifest(
            "$",
            format!("{}: manifest must be an object", source_label),
        ));
    }
    Ok(parsed)
}

/// Structural checks on the raw document, so that type mismatches are
/// reported with a field path instead of a serde message.
fn check_document(document: &Value) -> Result<()> {
    for field in ["id", "name", "version", "entry"] {
        match document.get(field) {
            Some(Value::String(_)) => {}
            Some(_) => return Err(SkillError::manifest(field, "must be a string")),
            None => return Err(SkillError::manifest(field, "is required")),
        }
    }
    if let Some(value) = document.get("description") {
        if !value.is_string() && !value.is_null() {
            return Err(SkillError::manifest("description", "must be a string"));
        }
    }

    let tools = match document.get("tools") {
        Some(Value::Array(tools)) => tools,
        Some(_) => return Err(SkillError::manifest("tools", "must be an array")),
        None => return Err(SkillError::manifest("tools", "is required")),
    };
    for (index, tool) in tools.iter().enumerate() {
        let field = format!("tools[{}]", index);
        let Some(object) = tool.as_object() else {
            return Err(SkillError::manifest(field, "must be an object"));
        };
        match object.get("name") {
            Some(Value::String(_)) => {}
            _ => return Err(SkillError::manifest(format!("{}.name", field), "must be a string")),
        }
        match object.get("input_schema") {
            Some(Value::Object(schema)) => {
                if let Some(kind) = schema.get("type") {
                    if kind != "object" {
                        return Err(SkillError::manifest(
                            format!("{}.input_schema.type", field),
                            "must be \"object\"",
                        ));
                    }
                }
            }
            Some(_) => {
                return Err(SkillError::manifest(
                    format!("{}.input_schema", field),
                    "must be a JSON object schema",
                ))
            }
            None => {
                return Err(SkillError::manifest(
                    format!("{}.input_schema", field),
                    "is required",
                ))
            }
        }
        check_string_array(object.get("aliases"), &format!("{}.aliases", field))?;
    }

    let runtime = match document.get("runtime") {
        Some(Value::Object(runtime)) => runtime,
        Some(_) => return Err(SkillError::manifest("runtime", "must be an object")),
        None => return Err(SkillError::manifest("runtime", "is required")),
    };
    match runtime.get("type") {
        Some(Value::String(kind)) if RuntimeKind::LABELS.contains(&kind.as_str()) => {}
        Some(Value::String(kind)) => {
            return Err(SkillError::manifest(
                "runtime.type",
                format!(
                    "unsupported runtime '{}' (expected one of: {})",
                    kind,
                    RuntimeKind::LABELS.join(", ")
                ),
            ))
        }
        _ => return Err(SkillError::manifest("runtime.type", "is required")),
    }
    check_string_array(runtime.get("args"), "runtime.args")?;
    if let Some(env) = runtime.get("env").filter(|v| !v.is_null()) {
        let Some(env) = env.as_object() else {
            return Err(SkillError::manifest("runtime.env", "must be an object"));
        };
        for (key, value) in env {
            if !value.is_string() {
                return Err(SkillError::manifest(
                    format!("runtime.env.{}", key),
                    "must be a string",
                ));
            }
        }
    }
    for field in ["timeout_secs", "max_output_bytes"] {
        if let Some(value) = runtime.get(field).filter(|v| !v.is_null()) {
            if !value.is_u64() {
                return Err(SkillError::manifest(
                    format!("runtime.{}", field),
                    "must be a positive integer",
                ));
            }
        }
    }

    for field in ["dependencies", "capabilities", "permissions", "platforms"] {
        check_string_array(document.get(field), field)?;
    }

    if let Some(risk) = document.get("risk_level").filter(|v| !v.is_null()) {
        match risk.as_str().and_then(RiskLevel::parse) {
            Some(_) => {}
            None => {
                return Err(SkillError::manifest(
                    "risk_level",
                    "must be one of: low, medium, high, critical",
                ))
            }
        }
    }

    Ok(())
}

/// Optional keys set to `null` count as absent, so their serde defaults
/// apply. Required keys were already checked.
fn drop_nulls(document: &mut Value) {
    fn strip(value: &mut Value) {
        if let Value::Object(map) = value {
            map.retain(|_, v| !v.is_null());
        }
    }
    strip(document);
    if let Some(runtime) = document.get_mut("runtime") {
        strip(runtime);
    }
    if let Some(Value::Array(tools)) = document.get_mut("tools") {
        tools.iter_mut().for_each(strip);
    }
}

fn check_string_array(value: Option<&Value>, field: &str) -> Result<()> {
    match value {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Array(items)) => {
            for (index, item) in items.iter().enumerate() {
                if !item.is_string() {
                    return Err(SkillError::manifest(
                        format!("{}[{}]", field, index),
                        "must be a string",
                    ));
                }
            }
            Ok(())
        }
        Some(_) => Err(SkillError::manifest(field, "must be an array of strings")),
    }
}

fn check_string(field: &str, value: &str, max_len: usize) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SkillError::manifest(field, "must not be empty"));
    }
    if value.chars().count() > max_len {
        return Err(SkillError::manifest(
            field,
            format!("longer than {} characters", max_len),
        ));
    }
    Ok(())
}

fn check_tool_name(field: &str, name: &str) -> Result<()> {
    check_string(field, name, MAX_TOOL_NAME_LEN)?;
    if !TOOL_NAME_RE.is_match(name) {
        return Err(SkillError::manifest(
            field,
            format!(
                "invalid tool name '{}': letters, digits, '_', '.' and '-' only",
                name
            ),
        ));
    }
    Ok(())
}

fn normalize(mut manifest: Manifest) -> Manifest {
    manifest.id = manifest.id.trim().to_string();
    manifest.name = manifest.name.trim().to_string();
    manifest.version = manifest.version.trim().to_string();
    manifest.entry = manifest.entry.trim().to_string();
    manifest.description = manifest.description.trim().to_string();
    for tool in &mut manifest.tools {
        tool.name = tool.name.trim().to_string();
        for alias in &mut tool.aliases {
            *alias = alias.trim().to_string();
        }
    }
    manifest
}
