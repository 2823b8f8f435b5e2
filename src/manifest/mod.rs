//! Skill manifests
//!
//! A manifest is the declarative description of a skill package: identity,
//! tool list, runtime spec, managed dependencies and risk level. Manifests
//! live at the package root under one of [`MANIFEST_CANDIDATES`] and may be
//! written in JSON or YAML.
//!
//! # Example skill.yaml
//!
//! ```yaml
//! id: weather
//! name: Weather
//! version: 1.0.0
//! entry: main.py
//! risk_level: medium
//! dependencies: [requests]
//! tools:
//!   - name: get_forecast
//!     description: Forecast for a city
//!     input_schema:
//!       type: object
//!       properties:
//!         city: { type: string }
//! runtime:
//!   type: python
//!   timeout_secs: 30
//! ```

pub mod types;
mod validate;

pub use types::{
    current_platform, normalize_tool_name, Manifest, RiskLevel, RuntimeKind, RuntimeSpec,
    ToolDescriptor,
};
pub use validate::{load_manifest_from_dir, parse_manifest, validate_manifest, MANIFEST_CANDIDATES};
