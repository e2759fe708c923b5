//! Building keys from tokenized rows

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use super::{FieldDef, FieldType, Schema, SortableKey, Value};
use crate::error::{IngestError, IngestResult};
use crate::tokenizer::{normalize_header, SourceRecord};

/// Parse one token as the declared type of `def`
pub fn parse_value(def: &FieldDef, token: &str) -> IngestResult<Value> {
    let bad = |reason: &dyn std::fmt::Display| {
        IngestError::encoding(format!(
            "field '{}' cannot parse '{}' as {}: {}",
            def.name, token, def.field_type, reason
        ))
    };

    match def.field_type {
        FieldType::String => Ok(Value::Str(token.to_string())),
        FieldType::Int32 => token.trim().parse::<i32>().map(Value::Int32).map_err(|e| bad(&e)),
        FieldType::Int64 => token.trim().parse::<i64>().map(Value::Int64).map_err(|e| bad(&e)),
        FieldType::Timestamp => parse_timestamp(token.trim(), def.format.as_deref())
            .map(Value::timestamp)
            .ok_or_else(|| bad(&"unrecognized timestamp")),
    }
}

fn parse_timestamp(token: &str, format: Option<&str>) -> Option<DateTime<Utc>> {
    match format {
        Some(fmt) => NaiveDateTime::parse_from_str(token, fmt)
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(token, fmt)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
            .map(|naive| Utc.from_utc_datetime(&naive)),
        None => DateTime::parse_from_rfc3339(token)
            .map(|ts| ts.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                token
                    .parse::<i64>()
                    .ok()
                    .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            }),
    }
}

/// Maps schema fields onto source columns and builds keys from rows
///
/// Each field reads the column whose normalized header equals the field
/// name, unless rebound with [`KeyBuilder::bind`].
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    schema: Arc<Schema>,
    bindings: HashMap<String, String>,
}

impl KeyBuilder {
    pub fn new(schema: Arc<Schema>) -> Self {
        let bindings = schema
            .fields()
            .iter()
            .map(|f| (f.name.clone(), normalize_header(&f.name)))
            .collect();
        Self { schema, bindings }
    }

    /// Read `field` from the column named `column` (normalized on the way in)
    pub fn bind(mut self, field: &str, column: &str) -> IngestResult<Self> {
        if !self.schema.contains(field) {
            return Err(IngestError::config(format!(
                "Cannot bind unknown field '{}'",
                field
            )));
        }
        self.bindings
            .insert(field.to_string(), normalize_header(column));
        Ok(self)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Column each field is read from
    pub fn column_for(&self, field: &str) -> Option<&str> {
        self.bindings.get(field).map(String::as_str)
    }

    pub fn build(&self, record: &SourceRecord) -> IngestResult<SortableKey> {
        self.schema
            .fields()
            .iter()
            .map(|def| {
                let column = self.column_for(&def.name).unwrap_or(def.name.as_str());
                let token = record.token(column).ok_or_else(|| {
                    IngestError::encoding(format!(
                        "field '{}' expects column '{}', not present in {} line {}",
                        def.name, column, record.header.source_file, record.line
                    ))
                })?;
                Ok((def.name.clone(), parse_value(def, token)?))
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tokenizer::DelimitedReader;
    use std::io::Cursor;
    use std::path::PathBuf;

    fn first_record(text: &str) -> SourceRecord {
        DelimitedReader::new(Cursor::new(text.as_bytes().to_vec()), PathBuf::from("in.csv"), b',')
            .unwrap()
            .next_record()
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_build_key_from_record() {
        let schema = Arc::new(Schema::parse("name:string,age:int32").unwrap());
        let record = first_record("Name,Age\nJohn Doe, 25\n");

        let key = KeyBuilder::new(schema).build(&record).unwrap();
        assert_eq!(key.get("name"), Some(&Value::from("John Doe")));
        assert_eq!(key.get("age"), Some(&Value::Int32(25)));
    }

    #[test]
    fn test_rebound_column() {
        let schema = Arc::new(Schema::parse("id:int64").unwrap());
        let record = first_record("Order ID,x\n99,y\n");

        let builder = KeyBuilder::new(schema).bind("id", "Order ID").unwrap();
        assert_eq!(builder.column_for("id"), Some("order_id"));
        assert_eq!(builder.build(&record).unwrap().get("id"), Some(&Value::Int64(99)));
        assert!(KeyBuilder::new(Arc::new(Schema::parse("id:int64").unwrap()))
            .bind("nope", "x")
            .is_err());
    }

    #[test]
    fn test_timestamp_formats() {
        let day = FieldDef::timestamp("day", "%Y-%m-%d");
        let parsed = parse_value(&day, "2024-03-09").unwrap();
        assert_eq!(
            parsed,
            Value::Timestamp(Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap())
        );

        let full = FieldDef::timestamp("at", "%Y-%m-%d %H:%M:%S");
        assert!(parse_value(&full, "2024-03-09 10:11:12").is_ok());

        let bare = FieldDef::new("at", FieldType::Timestamp);
        assert_eq!(
            parse_value(&bare, "1700000000000").unwrap(),
            Value::Timestamp(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap())
        );
        assert!(parse_value(&bare, "2024-03-09T10:00:00Z").is_ok());
        assert!(parse_value(&bare, "yesterday").is_err());

        let precise = parse_value(&bare, "2024-03-09T10:11:20.123456789Z").unwrap();
        assert_eq!(
            precise,
            Value::Timestamp(Utc.timestamp_millis_opt(1_709_979_080_123).unwrap())
        );
    }

    #[test]
    fn test_bad_token_is_encoding_error() {
        let schema = Arc::new(Schema::parse("age:int32").unwrap());
        let record = first_record("age\nold\n");
        let err = KeyBuilder::new(schema).build(&record).unwrap_err();
        assert!(matches!(err, IngestError::Encoding(ref m) if m.contains("'old'")));
    }
}
