//! Schema definitions for tables and KV settings.
//!
//! Definitions are plain data; validators are compiled from them once per
//! helper and shared. Versioned definitions carry a chain of schemas plus
//! a migration function lifting any version's row to the latest shape.
//! Migration runs on read, never on write.

mod validator;
mod version;

pub use validator::{validate_value, Issue, RowDiagnostics, Validator};
pub use version::{ChainRead, RowMap, VersionChain, VersionSchema};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::keys::FieldId;

/// Discriminant key identifying which schema version a stored row matches.
pub const VERSION_FIELD: &str = "_v";

/// Key under which a row's identifier appears in materialized rows. Not a
/// stored cell; injected on read and stripped on write.
pub const ROW_ID_FIELD: &str = "id";

/// Value types a field can take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    /// Plain string.
    Text,
    /// Markdown-ish string; validated as text, rendered by the app.
    RichText,
    /// Whole number (i64 range).
    Integer,
    /// Any JSON number.
    Real,
    Boolean,
    /// RFC 3339 timestamp string.
    Date,
    /// One of a fixed set of strings.
    Select { options: Vec<String> },
    /// String array; bounded to `options` when given, free-form otherwise.
    Tags { options: Option<Vec<String>> },
    /// Any JSON value; nested structure is the application's concern.
    Json,
}

impl FieldType {
    /// Human-readable name used in validation issues.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::RichText => "richtext",
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Select { .. } => "select",
            Self::Tags { .. } => "tags",
            Self::Json => "json",
        }
    }
}

/// One field of a table schema (or the value shape of a KV entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub id: FieldId,
    #[serde(flatten)]
    pub field_type: FieldType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldDef {
    pub fn new(id: FieldId, field_type: FieldType) -> Self {
        Self { id, field_type, nullable: false, default: None, description: None }
    }

    pub fn text(id: &str) -> Self {
        Self::new(FieldId::new(id).expect("valid field id"), FieldType::Text)
    }

    pub fn richtext(id: &str) -> Self {
        Self::new(FieldId::new(id).expect("valid field id"), FieldType::RichText)
    }

    pub fn integer(id: &str) -> Self {
        Self::new(FieldId::new(id).expect("valid field id"), FieldType::Integer)
    }

    pub fn real(id: &str) -> Self {
        Self::new(FieldId::new(id).expect("valid field id"), FieldType::Real)
    }

    pub fn boolean(id: &str) -> Self {
        Self::new(FieldId::new(id).expect("valid field id"), FieldType::Boolean)
    }

    pub fn date(id: &str) -> Self {
        Self::new(FieldId::new(id).expect("valid field id"), FieldType::Date)
    }

    pub fn select(id: &str, options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(
            FieldId::new(id).expect("valid field id"),
            FieldType::Select { options: options.into_iter().map(Into::into).collect() },
        )
    }

    pub fn tags(id: &str) -> Self {
        Self::new(FieldId::new(id).expect("valid field id"), FieldType::Tags { options: None })
    }

    pub fn bounded_tags(id: &str, options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(
            FieldId::new(id).expect("valid field id"),
            FieldType::Tags { options: Some(options.into_iter().map(Into::into).collect()) },
        )
    }

    pub fn json(id: &str) -> Self {
        Self::new(FieldId::new(id).expect("valid field id"), FieldType::Json)
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Schema definition problems, reported when a workspace is assembled.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaError {
    #[error("duplicate table id `{id}`")]
    DuplicateTable { id: String },
    #[error("duplicate field `{field}` in table `{table}`")]
    DuplicateField { table: String, field: String },
    #[error("field `{field}` in table `{table}` is reserved")]
    ReservedField { table: String, field: String },
    #[error("version chain for `{id}` must not be empty")]
    EmptyVersionChain { id: String },
    #[error("latest version of `{id}` must carry a `_v` tag when the chain has {count} versions")]
    MissingVersionTag { id: String, count: usize },
    #[error("duplicate version tag `{tag}` in `{id}`")]
    DuplicateVersionTag { id: String, tag: String },
    #[error("duplicate kv key `{key}`")]
    DuplicateKvKey { key: String },
}

/// Definition of one table: identity, display metadata and the version
/// chain its rows are validated and migrated against.
#[derive(Clone)]
pub struct TableDefinition {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    chain: VersionChain,
}

impl TableDefinition {
    /// Single-version table.
    pub fn new(id: impl Into<String>, fields: Vec<FieldDef>) -> Result<Self, SchemaError> {
        let id = id.into();
        let chain = VersionChain::single(fields);
        Self::build(id, chain)
    }

    /// Multi-version table with a migration lifting any version's row to
    /// the latest shape.
    pub fn versioned<F>(
        id: impl Into<String>,
        versions: Vec<VersionSchema>,
        migrate: F,
    ) -> Result<Self, SchemaError>
    where
        F: Fn(RowMap) -> RowMap + Send + Sync + 'static,
    {
        let id = id.into();
        let chain = VersionChain::new(&id, versions, migrate)?;
        Self::build(id, chain)
    }

    fn build(id: String, chain: VersionChain) -> Result<Self, SchemaError> {
        for schema in chain.versions() {
            validate_fields(&id, &schema.fields)?;
        }
        Ok(Self { name: id.clone(), id, description: None, icon: None, chain })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn chain(&self) -> &VersionChain {
        &self.chain
    }

    /// Fields of the latest schema version.
    pub fn fields(&self) -> &[FieldDef] {
        &self.chain.latest().fields
    }
}

impl std::fmt::Debug for TableDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("versions", &self.chain.versions().len())
            .finish()
    }
}

fn validate_fields(table: &str, fields: &[FieldDef]) -> Result<(), SchemaError> {
    let mut seen = std::collections::HashSet::new();
    for field in fields {
        let id = field.id.as_str();
        if id == ROW_ID_FIELD || id == VERSION_FIELD {
            return Err(SchemaError::ReservedField {
                table: table.to_string(),
                field: id.to_string(),
            });
        }
        if !seen.insert(id) {
            return Err(SchemaError::DuplicateField {
                table: table.to_string(),
                field: id.to_string(),
            });
        }
    }
    Ok(())
}

/// Definition of one KV setting: key, value shape, and (for object-valued
/// settings) an optional version chain applied on read.
#[derive(Clone)]
pub struct KvEntryDef {
    pub key: FieldId,
    pub field: FieldDef,
    chain: Option<VersionChain>,
}

impl KvEntryDef {
    pub fn new(key: &str, field_type: FieldType) -> Result<Self, crate::error::Error> {
        let key = FieldId::new(key)?;
        let field = FieldDef::new(key.clone(), field_type);
        Ok(Self { key, field, chain: None })
    }

    pub fn nullable(mut self) -> Self {
        self.field.nullable = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.field.default = Some(value);
        self
    }

    /// Attach a version chain for object-valued settings; reads validate
    /// against the union and migrate to the latest shape.
    pub fn versioned<F>(
        mut self,
        versions: Vec<VersionSchema>,
        migrate: F,
    ) -> Result<Self, SchemaError>
    where
        F: Fn(RowMap) -> RowMap + Send + Sync + 'static,
    {
        self.chain = Some(VersionChain::new(self.key.as_str(), versions, migrate)?);
        Ok(self)
    }

    pub fn chain(&self) -> Option<&VersionChain> {
        self.chain.as_ref()
    }
}

impl std::fmt::Debug for KvEntryDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvEntryDef")
            .field("key", &self.key)
            .field("type", &self.field.field_type.name())
            .finish()
    }
}

/// Everything a workspace holds: identity, tables and KV settings.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceDefinition {
    pub id: String,
    pub tables: Vec<TableDefinition>,
    pub kv: Vec<KvEntryDef>,
}

impl WorkspaceDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), tables: Vec::new(), kv: Vec::new() }
    }

    pub fn with_table(mut self, table: TableDefinition) -> Self {
        self.tables.push(table);
        self
    }

    pub fn with_kv(mut self, entry: KvEntryDef) -> Self {
        self.kv.push(entry);
        self
    }

    /// Whole-definition validation: duplicate table ids and KV keys.
    /// Field-level problems are caught at table construction.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut table_ids = std::collections::HashSet::new();
        for table in &self.tables {
            if !table_ids.insert(table.id.as_str()) {
                return Err(SchemaError::DuplicateTable { id: table.id.clone() });
            }
        }
        let mut kv_keys = std::collections::HashSet::new();
        for entry in &self.kv {
            if !kv_keys.insert(entry.key.as_str()) {
                return Err(SchemaError::DuplicateKvKey { key: entry.key.to_string() });
            }
        }
        Ok(())
    }
}
