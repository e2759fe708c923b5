//! Field schema for sortable keys

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{IngestError, IngestResult};

/// Primitive type of one key field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int32,
    Int64,
    /// Milliseconds since the Unix epoch, UTC
    Timestamp,
}

impl FieldType {
    /// Encoded width in bytes, `None` for length-prefixed strings
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            FieldType::String => None,
            FieldType::Int32 => Some(4),
            FieldType::Int64 | FieldType::Timestamp => Some(8),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "string" | "str" | "text" => Ok(FieldType::String),
            "int32" | "int" | "integer" => Ok(FieldType::Int32),
            "int64" | "long" | "bigint" => Ok(FieldType::Int64),
            "timestamp" | "ts" | "datetime" => Ok(FieldType::Timestamp),
            other => Err(IngestError::config(format!("Unknown field type '{}'", other))),
        }
    }
}

/// One named, typed field of a schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// chrono format string, only meaningful for timestamp fields
    pub format: Option<String>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            format: None,
        }
    }

    pub fn timestamp(name: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Timestamp,
            format: Some(format.into()),
        }
    }
}

/// Ordered, immutable field schema shared by every key of one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<FieldDef>,
}

impl Schema {
    /// Build a schema, rejecting empty or duplicate field names
    pub fn new(fields: Vec<FieldDef>) -> IngestResult<Self> {
        if fields.is_empty() {
            return Err(IngestError::config("Schema must declare at least one field"));
        }

        let mut seen = HashSet::new();
        for field in &fields {
            if field.name.trim().is_empty() {
                return Err(IngestError::config("Schema field names must not be empty"));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(IngestError::config(format!(
                    "Duplicate schema field '{}'",
                    field.name
                )));
            }
            if field.format.is_some() && field.field_type != FieldType::Timestamp {
                return Err(IngestError::config(format!(
                    "Field '{}' has a format but is not a timestamp",
                    field.name
                )));
            }
        }

        let schema = Self { fields };
        for warning in schema.layout_warnings() {
            tracing::warn!(%warning, "Key layout does not sort by value");
        }
        Ok(schema)
    }

    /// Parse `name:type[:format]` entries separated by commas
    ///
    /// The format part may itself contain colons, e.g.
    /// `id:int64,seen:timestamp:%Y-%m-%d %H:%M:%S`.
    pub fn parse(spec: &str) -> IngestResult<Self> {
        let fields = spec
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let mut parts = entry.splitn(3, ':');
                let name = parts.next().unwrap_or_default().trim();
                let field_type = parts
                    .next()
                    .ok_or_else(|| {
                        IngestError::config(format!("Schema entry '{}' has no type", entry))
                    })?
                    .parse::<FieldType>()?;
                let format = parts.next().map(|f| f.to_string());
                Ok(FieldDef {
                    name: name.to_string(),
                    field_type,
                    format,
                })
            })
            .collect::<IngestResult<Vec<_>>>()?;

        Self::new(fields)
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Bytes taken by the fixed-width fields alone
    pub fn fixed_size(&self) -> usize {
        self.fields
            .iter()
            .map(|f| f.field_type.fixed_width().unwrap_or(4))
            .sum()
    }

    /// Variable-width fields followed by other fields break byte ordering
    ///
    /// A length prefix makes "b" sort before "aa", so only a trailing string
    /// field keeps byte order equal to value order.
    pub fn layout_warnings(&self) -> Vec<String> {
        let last = self.fields.len().saturating_sub(1);
        self.fields
            .iter()
            .enumerate()
            .filter(|(i, f)| f.field_type == FieldType::String && *i != last)
            .map(|(_, f)| {
                format!(
                    "string field '{}' is not the last field; keys order by length before content",
                    f.name
                )
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schema_with_colon_in_format() {
        let schema = Schema::parse("id:int64, seen:timestamp:%Y-%m-%d %H:%M:%S,name:string").unwrap();
        assert_eq!(schema.len(), 3);
        let seen = schema.field("seen").unwrap();
        assert_eq!(seen.field_type, FieldType::Timestamp);
        assert_eq!(seen.format.as_deref(), Some("%Y-%m-%d %H:%M:%S"));
        assert!(schema.layout_warnings().is_empty());
    }

    #[test]
    fn test_duplicate_and_empty_schemas_rejected() {
        assert!(Schema::parse("a:int32,a:int64").is_err());
        assert!(Schema::parse("").is_err());
        assert!(Schema::parse("a").is_err());
        assert!(Schema::parse("a:float").is_err());
    }

    #[test]
    fn test_format_only_on_timestamps() {
        let err = Schema::new(vec![FieldDef {
            name: "n".into(),
            field_type: FieldType::Int32,
            format: Some("%Y".into()),
        }]);
        assert!(err.is_err());
    }

    #[test]
    fn test_leading_string_field_is_flagged() {
        let schema = Schema::parse("name:string,age:int32").unwrap();
        let warnings = schema.layout_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("'name'"));
        assert_eq!(schema.fixed_size(), 8);
    }
}
