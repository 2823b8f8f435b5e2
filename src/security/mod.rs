//! Path-safety primitives shared by archive extraction and the compatibility
//! runner.

pub mod path;

pub use path::{normalize_relative, resolve_within_root, SafePath};
