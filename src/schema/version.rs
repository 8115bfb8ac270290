//! Version chains and migration-on-read.
//!
//! A chain is an ordered list of schema versions plus one migration
//! lifting a row of any version to the latest shape. The `_v` string
//! field discriminates versions; its absence selects the untagged first
//! version. Reads validate against the matching version, migrate, then
//! validate against the latest; storage is never rewritten.

use std::sync::Arc;

use serde_json::Value;

use crate::schema::{FieldDef, Issue, SchemaError, Validator, VERSION_FIELD};

/// Materialized row (or object-valued KV setting) as a JSON object.
pub type RowMap = serde_json::Map<String, Value>;

/// One version of a table or KV value schema.
#[derive(Debug, Clone)]
pub struct VersionSchema {
    /// `_v` discriminant; `None` only for the first version.
    pub tag: Option<String>,
    pub fields: Vec<FieldDef>,
}

impl VersionSchema {
    /// First, untagged version.
    pub fn v1(fields: Vec<FieldDef>) -> Self {
        Self { tag: None, fields }
    }

    pub fn tagged(tag: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self { tag: Some(tag.into()), fields }
    }
}

type MigrateFn = Arc<dyn Fn(RowMap) -> RowMap + Send + Sync>;

/// Outcome of reading a raw row through a chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainRead {
    /// The row matched a version and now has the latest shape.
    Valid(RowMap),
    /// The row matched no version; storage is left untouched.
    Invalid { issues: Vec<Issue> },
}

/// Ordered schema versions with compiled validators and the migration.
#[derive(Clone)]
pub struct VersionChain {
    versions: Arc<Vec<VersionSchema>>,
    validators: Arc<Vec<Validator>>,
    migrate: Option<MigrateFn>,
}

impl std::fmt::Debug for VersionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionChain")
            .field("versions", &self.versions)
            .field("has_migrate", &self.migrate.is_some())
            .finish()
    }
}

impl VersionChain {
    /// Chain of one untagged version, no migration.
    pub fn single(fields: Vec<FieldDef>) -> Self {
        let versions = vec![VersionSchema::v1(fields)];
        let validators = versions.iter().map(|v| Validator::compile(&v.fields)).collect();
        Self {
            versions: Arc::new(versions),
            validators: Arc::new(validators),
            migrate: None,
        }
    }

    pub fn new<F>(id: &str, versions: Vec<VersionSchema>, migrate: F) -> Result<Self, SchemaError>
    where
        F: Fn(RowMap) -> RowMap + Send + Sync + 'static,
    {
        if versions.is_empty() {
            return Err(SchemaError::EmptyVersionChain { id: id.to_string() });
        }
        if versions.len() >= 2 && versions.last().map(|v| v.tag.is_none()).unwrap_or(true) {
            return Err(SchemaError::MissingVersionTag {
                id: id.to_string(),
                count: versions.len(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for version in &versions {
            let discriminant = version.tag.clone().unwrap_or_default();
            if !seen.insert(discriminant) {
                return Err(SchemaError::DuplicateVersionTag {
                    id: id.to_string(),
                    tag: version.tag.clone().unwrap_or_else(|| "<none>".to_string()),
                });
            }
        }
        let validators = versions.iter().map(|v| Validator::compile(&v.fields)).collect();
        Ok(Self {
            versions: Arc::new(versions),
            validators: Arc::new(validators),
            migrate: Some(Arc::new(migrate)),
        })
    }

    pub fn versions(&self) -> &[VersionSchema] {
        &self.versions
    }

    pub fn latest(&self) -> &VersionSchema {
        self.versions.last().expect("chain is never empty")
    }

    pub fn latest_validator(&self) -> &Validator {
        self.validators.last().expect("chain is never empty")
    }

    /// Lift a raw stored row to the latest shape.
    ///
    /// Deterministic and total over rows matching any declared version;
    /// anything else comes back `Invalid` with the version's issues.
    pub fn read(&self, raw: RowMap) -> ChainRead {
        let tag = raw.get(VERSION_FIELD).and_then(Value::as_str);
        let matched = self
            .versions
            .iter()
            .position(|v| v.tag.as_deref() == tag);
        let Some(idx) = matched else {
            return ChainRead::Invalid {
                issues: vec![Issue {
                    path: VERSION_FIELD.to_string(),
                    message: match tag {
                        Some(t) => format!("unknown version tag `{t}`"),
                        None => "row carries no version tag and the chain has no untagged version"
                            .to_string(),
                    },
                    expected: "a declared version".to_string(),
                }],
            };
        };

        let issues = self.validators[idx].errors(&raw);
        if !issues.is_empty() {
            return ChainRead::Invalid { issues };
        }

        let latest_idx = self.versions.len() - 1;
        let mut row = raw;
        if idx != latest_idx {
            let migrate = self.migrate.as_ref().expect("multi-version chain has a migration");
            row = migrate(row);
            if let Some(tag) = &self.latest().tag {
                row.insert(VERSION_FIELD.to_string(), Value::String(tag.clone()));
            }
            let issues = self.latest_validator().errors(&row);
            if !issues.is_empty() {
                return ChainRead::Invalid { issues };
            }
        }
        self.latest_validator().apply_defaults(&mut row);
        ChainRead::Valid(row)
    }
}
