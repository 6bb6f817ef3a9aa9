//! Output schemas shipped with the binary and materialized into the schema dir.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::debug;

use crate::core::types::SchemaName;

const INTAKE_SCHEMA: &str = include_str!("../../schemas/intake.schema.json");
const STAGE_SCHEMA: &str = include_str!("../../schemas/stage.schema.json");
const REVIEW_SCHEMA: &str = include_str!("../../schemas/review.schema.json");
const TEST_RUN_SCHEMA: &str = include_str!("../../schemas/test_run.schema.json");
const TEST_VALIDATION_SCHEMA: &str = include_str!("../../schemas/test_validation.schema.json");
const PUBLISH_SCHEMA: &str = include_str!("../../schemas/publish.schema.json");

pub fn embedded(name: SchemaName) -> &'static str {
    match name {
        SchemaName::Intake => INTAKE_SCHEMA,
        SchemaName::Stage => STAGE_SCHEMA,
        SchemaName::Review => REVIEW_SCHEMA,
        SchemaName::TestRun => TEST_RUN_SCHEMA,
        SchemaName::TestValidation => TEST_VALIDATION_SCHEMA,
        SchemaName::Publish => PUBLISH_SCHEMA,
    }
}

pub fn schema_path(dir: &Path, name: SchemaName) -> PathBuf {
    dir.join(name.file_name())
}

/// Write every embedded schema into `dir`.
///
/// Existing files are left alone unless `force` is set, so operators can
/// tighten or relax a schema locally. Returns the paths that were written.
pub fn ensure_schemas(dir: &Path, force: bool) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("create schema dir {}", dir.display()))?;
    let mut written = Vec::new();
    for name in SchemaName::ALL {
        let path = schema_path(dir, name);
        if path.exists() && !force {
            continue;
        }
        fs::write(&path, embedded(name))
            .with_context(|| format!("write schema {}", path.display()))?;
        debug!(path = %path.display(), "wrote schema");
        written.push(path);
    }
    Ok(written)
}

/// Validate `value` against the schema file at `schema_path`.
///
/// `Ok(violations)` lists every violation; an empty list means valid. `Err`
/// means the schema itself could not be read or compiled.
pub fn violations(schema_path: &Path, value: &Value) -> Result<Vec<String>> {
    let contents = fs::read_to_string(schema_path)
        .with_context(|| format!("read schema {}", schema_path.display()))?;
    let schema: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse schema {}", schema_path.display()))?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    Ok(compiled
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect())
}
