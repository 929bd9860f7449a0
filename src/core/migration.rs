use super::document::{CURRENT_DOCUMENT_VERSION, ProjectDocument};
use super::{Result, VaultError};
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub type DocumentMigrationFn = Arc<dyn Fn(&mut Map<String, JsonValue>) -> Result<()> + Send + Sync>;

/// One schema bump applied to the raw JSON form of a document.
#[derive(Clone)]
pub struct SchemaMigrationStep {
    pub from_version: u32,
    pub to_version: u32,
    migrator: DocumentMigrationFn,
}

impl std::fmt::Debug for SchemaMigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaMigrationStep")
            .field("from_version", &self.from_version)
            .field("to_version", &self.to_version)
            .finish()
    }
}

impl SchemaMigrationStep {
    pub fn new<F>(from_version: u32, to_version: u32, migrator: F) -> Self
    where
        F: Fn(&mut Map<String, JsonValue>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            from_version,
            to_version,
            migrator: Arc::new(migrator),
        }
    }
}

/// Ordered chain of schema bumps up to `current_version`.
#[derive(Debug, Clone)]
pub struct SchemaMigrationPlan {
    current_version: u32,
    steps: Vec<SchemaMigrationStep>,
}

impl SchemaMigrationPlan {
    pub fn new(current_version: u32) -> Self {
        Self {
            current_version,
            steps: Vec::new(),
        }
    }

    /// The plan for documents written by every released schema.
    pub fn documents() -> Self {
        let mut plan = Self::new(CURRENT_DOCUMENT_VERSION);
        plan.steps.push(SchemaMigrationStep::new(1, 2, migrate_v1_cut_list));
        plan
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    pub fn with_step(mut self, step: SchemaMigrationStep) -> Result<Self> {
        self.steps.push(step);
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.current_version == 0 {
            return Err(VaultError::Migration("schema version must be >= 1".to_string()));
        }

        let mut seen_from = HashSet::<u32>::new();
        for step in &self.steps {
            if step.from_version == 0 || step.to_version <= step.from_version {
                return Err(VaultError::Migration(format!(
                    "migration step {} -> {} is invalid",
                    step.from_version, step.to_version
                )));
            }
            if step.to_version > self.current_version {
                return Err(VaultError::Migration(format!(
                    "migration step {} -> {} exceeds current schema version {}",
                    step.from_version, step.to_version, self.current_version
                )));
            }
            if !seen_from.insert(step.from_version) {
                return Err(VaultError::Migration(format!(
                    "duplicate migration step starting at version {}",
                    step.from_version
                )));
            }
        }
        Ok(())
    }

    fn resolve_chain(&self, from_version: u32) -> Result<Vec<&SchemaMigrationStep>> {
        let by_from: HashMap<u32, &SchemaMigrationStep> =
            self.steps.iter().map(|step| (step.from_version, step)).collect();

        let mut cursor = from_version;
        let mut chain = Vec::new();
        while cursor < self.current_version {
            let step = by_from.get(&cursor).copied().ok_or_else(|| {
                VaultError::Migration(format!(
                    "no migration path from schema version {} to {}",
                    cursor, self.current_version
                ))
            })?;
            chain.push(step);
            cursor = step.to_version;
        }
        Ok(chain)
    }

    /// Migrates a raw document to the current schema and decodes it.
    ///
    /// Documents without a `version` field are version 1. Documents newer than
    /// the plan are decoded as-is; unknown fields survive in `extra`.
    pub fn decode_document(&self, raw: JsonValue) -> Result<ProjectDocument> {
        let JsonValue::Object(mut map) = raw else {
            return Err(VaultError::Serialization(
                "project document must be a JSON object".to_string(),
            ));
        };

        let from_version = map
            .get("version")
            .and_then(JsonValue::as_u64)
            .map(|v| v as u32)
            .unwrap_or(1)
            .max(1);

        if from_version < self.current_version {
            for step in self.resolve_chain(from_version)? {
                (step.migrator)(&mut map)?;
                map.insert("version".to_string(), JsonValue::from(step.to_version));
            }
        }

        Ok(serde_json::from_value(JsonValue::Object(map))?)
    }
}

/// v1 kept cuts under `cuts` with their final image in `imageUrl`.
fn migrate_v1_cut_list(map: &mut Map<String, JsonValue>) -> Result<()> {
    if let Some(cuts) = map.remove("cuts") {
        if !map.contains_key("script") {
            map.insert("script".to_string(), cuts);
        }
    }

    if let Some(JsonValue::Array(cuts)) = map.get_mut("script") {
        for cut in cuts.iter_mut() {
            let Some(cut) = cut.as_object_mut() else {
                continue;
            };
            if let Some(image) = cut.remove("imageUrl") {
                cut.entry("finalImageUrl".to_string()).or_insert(image);
            }
        }
    }
    Ok(())
}
