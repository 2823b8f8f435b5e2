//! Generated runner script for instruction-only skill packages.
//!
//! The runner is kept as data: a constant Python template with `{{...}}`
//! placeholders that [`render_runner`] fills in before the script is written
//! next to the instruction document.

use crate::sandbox::{PACKAGE_ROOT_ENV, PAYLOAD_ENV};

/// Relative entry path of the generated runner inside the package.
pub const RUNNER_ENTRY: &str = ".skillgate/runner.py";

/// Files the runner may inline per call.
pub const MAX_INLINE_FILES: usize = 8;

/// Byte ceiling per inlined file.
pub const MAX_INLINE_BYTES: usize = 64 * 1024;

/// Characters kept in `summary` mode.
pub const SUMMARY_CHARS: usize = 4000;

const RUNNER_TEMPLATE: &str = r#"#!/usr/bin/env python3
# Generated by skillgate for skill "{{SKILL_ID}}". Do not edit.
import json
import os
import sys

INSTRUCTION_FILE = "{{INSTRUCTION_FILE}}"
MAX_INLINE_FILES = {{MAX_INLINE_FILES}}
MAX_INLINE_BYTES = {{MAX_INLINE_BYTES}}
SUMMARY_CHARS = {{SUMMARY_CHARS}}


def package_root():
    here = os.path.dirname(os.path.abspath(__file__))
    return os.path.realpath(os.environ.get("{{PACKAGE_ROOT_ENV}}") or os.path.dirname(here))


def read_payload():
    raw = os.environ.get("{{PAYLOAD_ENV}}")
    if not raw:
        raw = sys.stdin.read()
    if not raw or not raw.strip():
        return {}
    data = json.loads(raw)
    if not isinstance(data, dict):
        return {}
    arguments = data.get("arguments")
    return arguments if isinstance(arguments, dict) else data


def inside(root, candidate):
    resolved = os.path.realpath(os.path.join(root, candidate))
    return resolved == root or resolved.startswith(root + os.sep), resolved


def inline_files(root, requested):
    files = []
    skipped = []
    for name in requested[:MAX_INLINE_FILES]:
        if not isinstance(name, str) or not name.strip():
            continue
        name = name.replace("\\", "/").lstrip("/")
        ok, resolved = inside(root, name)
        if not ok or not os.path.isfile(resolved):
            skipped.append(name)
            continue
        with open(resolved, "rb") as handle:
            data = handle.read(MAX_INLINE_BYTES + 1)
        files.append({
            "path": name,
            "content": data[:MAX_INLINE_BYTES].decode("utf-8", errors="replace"),
            "truncated": len(data) > MAX_INLINE_BYTES,
        })
    skipped.extend(n for n in requested[MAX_INLINE_FILES:] if isinstance(n, str))
    return files, skipped


def main():
    try:
        payload = read_payload()
    except ValueError as exc:
        json.dump({"ok": False, "error": "invalid payload: %s" % exc}, sys.stdout)
        return 1

    root = package_root()
    with open(os.path.join(root, INSTRUCTION_FILE), "r", encoding="utf-8", errors="replace") as handle:
        instructions = handle.read()

    mode = payload.get("mode") or "full"
    truncated = False
    if mode == "summary" and len(instructions) > SUMMARY_CHARS:
        instructions = instructions[:SUMMARY_CHARS]
        truncated = True

    requested = payload.get("files") or []
    if not isinstance(requested, list):
        requested = []
    files, skipped = inline_files(root, requested)

    json.dump({
        "ok": True,
        "skill": "{{SKILL_ID}}",
        "mode": mode,
        "query": payload.get("query"),
        "instructions": instructions,
        "truncated": truncated,
        "files": files,
        "skipped_files": skipped,
    }, sys.stdout)
    return 0


if __name__ == "__main__":
    sys.exit(main())
"#;

/// Fill the runner template for `skill_id`, reading `instruction_file`.
pub fn render_runner(skill_id: &str, instruction_file: &str) -> String {
    RUNNER_TEMPLATE
        .replace("{{SKILL_ID}}", &escape_py(skill_id))
        .replace("{{INSTRUCTION_FILE}}", &escape_py(instruction_file))
        .replace("{{PAYLOAD_ENV}}", PAYLOAD_ENV)
        .replace("{{PACKAGE_ROOT_ENV}}", PACKAGE_ROOT_ENV)
        .replace("{{MAX_INLINE_FILES}}", &MAX_INLINE_FILES.to_string())
        .replace("{{MAX_INLINE_BYTES}}", &MAX_INLINE_BYTES.to_string())
        .replace("{{SUMMARY_CHARS}}", &SUMMARY_CHARS.to_string())
}

fn escape_py(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
