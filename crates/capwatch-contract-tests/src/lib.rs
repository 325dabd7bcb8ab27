//! Helpers for validating wire fixtures against the schemas in `contracts/`.

use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use serde_json::Value;

/// Root of the `contracts/` directory.
pub fn contracts_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../contracts")
}

/// Reads and parses a JSON file relative to `contracts/`.
///
/// # Panics
/// Panics when the file is unreadable or not JSON; fixtures are test inputs.
pub fn load_json(relative: &str) -> Value {
    let path = contracts_dir().join(relative);
    let raw = std::fs::read_to_string(&path)
        .unwrap_or_else(|error| panic!("{} should be readable: {error}", path.display()));
    serde_json::from_str(&raw)
        .unwrap_or_else(|error| panic!("{} should be valid JSON: {error}", path.display()))
}

/// Compiles `contracts/<name>.schema.json`.
///
/// # Panics
/// Panics when the schema does not compile.
pub fn compile_validator(name: &str) -> JSONSchema {
    let schema = load_json(&format!("{name}.schema.json"));
    JSONSchema::compile(&schema)
        .unwrap_or_else(|error| panic!("{name} schema should compile: {error}"))
}

/// Loads `contracts/fixtures/<name>.json`.
pub fn fixture(name: &str) -> Value {
    load_json(&format!("fixtures/{name}.json"))
}
