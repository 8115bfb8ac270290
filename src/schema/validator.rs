//! Compiled schema validators.
//!
//! A validator checks a materialized row (a JSON object of field values)
//! against one schema version. Fields present in storage but absent from
//! the schema are advisory only; they never fail validation and are
//! surfaced through [`RowDiagnostics`].

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::schema::{FieldDef, FieldType, RowMap, ROW_ID_FIELD, VERSION_FIELD};

/// One validation problem.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Issue {
    /// Field path the issue applies to (field id, or `<root>`).
    pub path: String,
    pub message: String,
    /// What the schema expected at that path.
    pub expected: String,
}

impl Issue {
    fn new(path: impl Into<String>, message: impl Into<String>, expected: impl Into<String>) -> Self {
        Self { path: path.into(), message: message.into(), expected: expected.into() }
    }
}

/// Advisory view of how a row relates to the schema beyond validity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowDiagnostics {
    /// Fields present in storage but not declared by the schema.
    pub extra_fields: Vec<String>,
    /// Declared fields with no stored cell.
    pub missing_fields: Vec<String>,
}

/// Validator compiled from one schema version's field list.
///
/// Immutable and cheap to clone; helpers compile their validators once at
/// construction and share them.
#[derive(Clone)]
pub struct Validator {
    fields: Arc<Vec<FieldDef>>,
    by_id: Arc<HashMap<String, usize>>,
}

impl Validator {
    pub fn compile(fields: &[FieldDef]) -> Self {
        let by_id = fields
            .iter()
            .enumerate()
            .map(|(idx, field)| (field.id.as_str().to_string(), idx))
            .collect();
        Self { fields: Arc::new(fields.to_vec()), by_id: Arc::new(by_id) }
    }

    pub fn check(&self, row: &RowMap) -> bool {
        self.errors(row).is_empty()
    }

    /// All validation issues for `row`, empty when valid.
    pub fn errors(&self, row: &RowMap) -> Vec<Issue> {
        let mut issues = Vec::new();
        for field in self.fields.iter() {
            match row.get(field.id.as_str()) {
                Some(value) => {
                    if let Some(issue) = validate_value(field, value) {
                        issues.push(issue);
                    }
                }
                None => {
                    if field.default.is_none() && !field.nullable {
                        issues.push(Issue::new(
                            field.id.as_str(),
                            "missing required field",
                            field.field_type.name(),
                        ));
                    }
                }
            }
        }
        issues
    }

    /// Extra/missing field view; never affects validity for extras.
    pub fn diagnostics(&self, row: &RowMap) -> RowDiagnostics {
        let mut diagnostics = RowDiagnostics::default();
        for key in row.keys() {
            if key == ROW_ID_FIELD || key == VERSION_FIELD {
                continue;
            }
            if !self.by_id.contains_key(key) {
                diagnostics.extra_fields.push(key.clone());
            }
        }
        for field in self.fields.iter() {
            if !row.contains_key(field.id.as_str()) {
                diagnostics.missing_fields.push(field.id.as_str().to_string());
            }
        }
        diagnostics.extra_fields.sort();
        diagnostics.missing_fields.sort();
        diagnostics
    }

    /// Fill declared defaults into fields the row is missing.
    pub(crate) fn apply_defaults(&self, row: &mut RowMap) {
        for field in self.fields.iter() {
            if row.contains_key(field.id.as_str()) {
                continue;
            }
            if let Some(default) = &field.default {
                row.insert(field.id.as_str().to_string(), default.clone());
            }
        }
    }
}

/// Check one value against one field definition.
pub fn validate_value(field: &FieldDef, value: &Value) -> Option<Issue> {
    if value.is_null() {
        if field.nullable {
            return None;
        }
        return Some(Issue::new(
            field.id.as_str(),
            "null not allowed",
            field.field_type.name(),
        ));
    }

    let path = field.id.as_str();
    let expected = field.field_type.name();
    match &field.field_type {
        FieldType::Text | FieldType::RichText => {
            if !value.is_string() {
                return Some(Issue::new(path, "expected a string", expected));
            }
        }
        FieldType::Integer => {
            let ok = value.as_i64().is_some();
            if !ok {
                return Some(Issue::new(path, "expected a whole number", expected));
            }
        }
        FieldType::Real => {
            if !value.is_number() {
                return Some(Issue::new(path, "expected a number", expected));
            }
        }
        FieldType::Boolean => {
            if !value.is_boolean() {
                return Some(Issue::new(path, "expected a boolean", expected));
            }
        }
        FieldType::Date => match value.as_str() {
            Some(s) if chrono::DateTime::parse_from_rfc3339(s).is_ok() => {}
            _ => {
                return Some(Issue::new(path, "expected an RFC 3339 timestamp", expected));
            }
        },
        FieldType::Select { options } => match value.as_str() {
            Some(s) if options.iter().any(|o| o == s) => {}
            _ => {
                return Some(Issue::new(
                    path,
                    format!("expected one of {options:?}"),
                    expected,
                ));
            }
        },
        FieldType::Tags { options } => {
            let Some(items) = value.as_array() else {
                return Some(Issue::new(path, "expected an array of strings", expected));
            };
            for (idx, item) in items.iter().enumerate() {
                let Some(s) = item.as_str() else {
                    return Some(Issue::new(
                        format!("{path}[{idx}]"),
                        "expected a string",
                        expected,
                    ));
                };
                if let Some(allowed) = options {
                    if !allowed.iter().any(|o| o == s) {
                        return Some(Issue::new(
                            format!("{path}[{idx}]"),
                            format!("expected one of {allowed:?}"),
                            expected,
                        ));
                    }
                }
            }
        }
        FieldType::Json => {}
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDef;
    use serde_json::json;

    fn row(value: Value) -> RowMap {
        value.as_object().unwrap().clone()
    }

    fn validator() -> Validator {
        Validator::compile(&[
            FieldDef::text("title"),
            FieldDef::integer("views").with_default(json!(0)),
            FieldDef::boolean("published").nullable(),
            FieldDef::select("status", ["draft", "live"]),
            FieldDef::tags("labels"),
            FieldDef::date("created_at"),
        ])
    }

    #[test]
    fn test_valid_row_passes() {
        let v = validator();
        let row = row(json!({
            "title": "Hello",
            "views": 3,
            "published": null,
            "status": "draft",
            "labels": ["a"],
            "created_at": "2026-01-01T00:00:00Z",
        }));
        assert!(v.check(&row), "{:?}", v.errors(&row));
    }

    #[test]
    fn test_type_mismatches_are_reported_with_paths() {
        let v = validator();
        let row = row(json!({
            "title": 7,
            "views": "many",
            "status": "archived",
            "labels": ["a", 3],
            "created_at": "yesterday",
        }));
        let issues = v.errors(&row);
        let paths: Vec<&str> = issues.iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"title"));
        assert!(paths.contains(&"views"));
        assert!(paths.contains(&"status"));
        assert!(paths.contains(&"labels[1]"));
        assert!(paths.contains(&"created_at"));
    }

    #[test]
    fn test_missing_required_field_is_invalid() {
        let v = Validator::compile(&[FieldDef::text("title")]);
        let issues = v.errors(&RowMap::new());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "title");
        assert_eq!(issues[0].expected, "text");
    }

    #[test]
    fn test_missing_field_with_default_or_nullable_is_valid() {
        let v = Validator::compile(&[
            FieldDef::integer("views").with_default(json!(0)),
            FieldDef::text("subtitle").nullable(),
        ]);
        assert!(v.check(&RowMap::new()));
    }

    #[test]
    fn test_extra_fields_are_advisory_only() {
        let v = Validator::compile(&[FieldDef::text("title")]);
        let row = row(json!({"title": "ok", "legacy": true}));
        assert!(v.check(&row));
        let diagnostics = v.diagnostics(&row);
        assert_eq!(diagnostics.extra_fields, vec!["legacy"]);
        assert!(diagnostics.missing_fields.is_empty());
    }

    #[test]
    fn test_diagnostics_lists_missing_fields() {
        let v = validator();
        let diagnostics = v.diagnostics(&row(json!({"title": "x"})));
        assert!(diagnostics.missing_fields.contains(&"views".to_string()));
        assert!(!diagnostics.missing_fields.contains(&"title".to_string()));
    }

    #[test]
    fn test_apply_defaults_fills_missing_fields_only() {
        let v = validator();
        let mut row = row(json!({"title": "x", "status": "draft"}));
        v.apply_defaults(&mut row);
        assert_eq!(row["views"], json!(0));
        assert_eq!(row["title"], json!("x"));
        assert!(!row.contains_key("published"));
    }

    #[test]
    fn test_bounded_tags_reject_unknown_values() {
        let field = FieldDef::bounded_tags("labels", ["red", "blue"]);
        assert!(validate_value(&field, &json!(["red"])).is_none());
        assert!(validate_value(&field, &json!(["green"])).is_some());
    }

    #[test]
    fn test_nullable_accepts_null_for_any_type() {
        for field in [
            FieldDef::text("f").nullable(),
            FieldDef::integer("f").nullable(),
            FieldDef::date("f").nullable(),
            FieldDef::json("f").nullable(),
        ] {
            assert!(validate_value(&field, &Value::Null).is_none());
        }
    }
}
