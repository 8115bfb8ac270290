//! Branded identifiers and the cell-key codec.
//!
//! Table data is addressed by flat string keys of the form
//! `{row_id}:{field_id}`. Row and field identifiers are validated at
//! construction so a well-formed cell key always round-trips through
//! parse and construct.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reserved separator between the row and field parts of a cell key.
pub const KEY_SEPARATOR: char = ':';

/// Length of generated row identifiers.
const ROW_ID_LEN: usize = 12;

fn validate_part(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid_key(value, "must not be empty"));
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(Error::invalid_key(value, "must not contain `:`"));
    }
    Ok(())
}

/// Opaque identifier for one running client instance.
///
/// Stable for the process lifetime; used as the tie-breaker in LWW
/// ordering, compared by lexicographic byte order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::invalid_key(id, "must not be empty"));
        }
        Ok(Self(id))
    }

    /// Generate a fresh actor id for this process.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row identifier. Non-empty, never contains the reserved separator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(String);

impl RowId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_part(&id)?;
        Ok(Self(id))
    }

    /// Generate a 12-character alphanumeric row id from the thread CSPRNG.
    pub fn generate() -> Self {
        let id: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ROW_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Field identifier. Same constraints as [`RowId`].
///
/// Reserved names such as `_v` are legal here; tables decide whether to
/// admit them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldId(String);

impl FieldId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_part(&id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FieldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of one cell: `{row_id}:{field_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellKey {
    pub row: RowId,
    pub field: FieldId,
}

impl CellKey {
    pub fn new(row: RowId, field: FieldId) -> Self {
        Self { row, field }
    }

    /// Parse a flat key back into its row and field parts.
    ///
    /// Fails when the separator is missing, a part is empty, or the field
    /// part contains another separator.
    pub fn parse(key: &str) -> Result<Self> {
        let (row, field) = key
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| Error::invalid_key(key, "missing `:` separator"))?;
        Ok(Self {
            row: RowId::new(row)?,
            field: FieldId::new(field)?,
        })
    }

    pub fn encode(&self) -> String {
        format!("{}{}{}", self.row, KEY_SEPARATOR, self.field)
    }
}

impl std::fmt::Display for CellKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Prefix shared by every cell of one row: `{row_id}:`.
pub fn row_prefix(row: &RowId) -> String {
    format!("{}{}", row, KEY_SEPARATOR)
}

/// Pure prefix check used by row scans.
pub fn has_prefix(key: &str, prefix: &str) -> bool {
    key.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_id_rejects_separator() {
        assert!(RowId::new("a:b").is_err());
        assert!(RowId::new("").is_err());
        assert!(RowId::new("p1").is_ok());
    }

    #[test]
    fn test_field_id_allows_reserved_names() {
        assert!(FieldId::new("_v").is_ok());
        assert!(FieldId::new("_order").is_ok());
        assert!(FieldId::new("a:b").is_err());
    }

    #[test]
    fn test_cell_key_round_trip() {
        let key = CellKey::new(RowId::new("p1").unwrap(), FieldId::new("title").unwrap());
        let encoded = key.encode();
        assert_eq!(encoded, "p1:title");
        let parsed = CellKey::parse(&encoded).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_cell_key_parse_rejects_malformed() {
        assert!(CellKey::parse("noseparator").is_err());
        assert!(CellKey::parse(":field").is_err());
        assert!(CellKey::parse("row:").is_err());
        assert!(CellKey::parse("row:fi:eld").is_err());
    }

    #[test]
    fn test_row_prefix_matches_cells() {
        let row = RowId::new("p1").unwrap();
        let prefix = row_prefix(&row);
        assert!(has_prefix("p1:title", &prefix));
        assert!(!has_prefix("p10:title", &prefix));
    }

    #[test]
    fn test_generated_row_ids_are_alphanumeric() {
        for _ in 0..100 {
            let id = RowId::generate();
            assert_eq!(id.as_str().len(), 12);
            assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_generated_row_ids_are_distinct() {
        let a = RowId::generate();
        let b = RowId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_actor_id_ordering_is_lexicographic() {
        let a = ActorId::new("actor-a").unwrap();
        let b = ActorId::new("actor-b").unwrap();
        assert!(b > a);
    }
}
