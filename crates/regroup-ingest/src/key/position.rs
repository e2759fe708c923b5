//! Position strings
//!
//! The position is the externally visible ordering token of a produced
//! message: selected key fields rendered and joined with `.`. A position part
//! may instead come from a generator, invoked once per call.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use super::{Schema, SortableKey};
use crate::context::RunContext;
use crate::error::{IngestError, IngestResult};

/// Synthetic source of a position part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeneratorKind {
    /// Monotonic counter owned by the run context
    Sequence,
    /// UUIDv7, ordered by creation time
    TimeOrdered,
    /// UUIDv4
    Random,
}

impl GeneratorKind {
    pub fn generate(self, ctx: &RunContext) -> String {
        match self {
            GeneratorKind::Sequence => ctx.next_sequence().to_string(),
            GeneratorKind::TimeOrdered => Uuid::now_v7().to_string(),
            GeneratorKind::Random => Uuid::new_v4().to_string(),
        }
    }
}

impl FromStr for GeneratorKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "@sequence" | "@seq" => Ok(GeneratorKind::Sequence),
            "@uuid7" | "@time" => Ok(GeneratorKind::TimeOrdered),
            "@uuid" | "@random" => Ok(GeneratorKind::Random),
            other => Err(IngestError::config(format!("Unknown position generator '{}'", other))),
        }
    }
}

impl fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeneratorKind::Sequence => f.write_str("@sequence"),
            GeneratorKind::TimeOrdered => f.write_str("@uuid7"),
            GeneratorKind::Random => f.write_str("@uuid"),
        }
    }
}

/// One part of a position
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PositionField {
    /// Value of a stored key field
    Stored(String),
    /// Value produced by a generator at position time
    Generated(GeneratorKind),
}

/// Ordered list of position parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionSpec {
    parts: Vec<PositionField>,
}

impl PositionSpec {
    pub fn new(parts: Vec<PositionField>) -> IngestResult<Self> {
        if parts.is_empty() {
            return Err(IngestError::config("Position needs at least one part"));
        }
        Ok(Self { parts })
    }

    /// Position made of stored fields only
    pub fn of_fields<S: AsRef<str>>(fields: &[S]) -> IngestResult<Self> {
        Self::new(
            fields
                .iter()
                .map(|f| PositionField::Stored(f.as_ref().to_string()))
                .collect(),
        )
    }

    /// Parse a comma-separated list of field names and `@generator` tokens
    pub fn parse(spec: &str) -> IngestResult<Self> {
        let parts = spec
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| {
                if p.starts_with('@') {
                    p.parse().map(PositionField::Generated)
                } else {
                    Ok(PositionField::Stored(p.to_string()))
                }
            })
            .collect::<IngestResult<Vec<_>>>()?;
        Self::new(parts)
    }

    pub fn parts(&self) -> &[PositionField] {
        &self.parts
    }

    /// True when the position is a pure function of the key
    pub fn is_deterministic(&self) -> bool {
        self.parts
            .iter()
            .all(|p| matches!(p, PositionField::Stored(_)))
    }

    /// Every stored part must name a schema field
    pub fn validate(&self, schema: &Schema) -> IngestResult<()> {
        for part in &self.parts {
            if let PositionField::Stored(name) = part {
                if !schema.contains(name) {
                    return Err(IngestError::config(format!(
                        "Position field '{}' is not in the schema",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Render the position of `key`
    ///
    /// Generated parts are produced fresh on every call and cannot be
    /// recovered from the key's bytes.
    pub fn position(&self, key: &SortableKey, schema: &Schema, ctx: &RunContext) -> IngestResult<String> {
        let mut rendered = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            match part {
                PositionField::Stored(name) => {
                    let value = key.get(name).ok_or_else(|| {
                        IngestError::encoding(format!("position field '{}' has no value", name))
                    })?;
                    let format = schema.field(name).and_then(|f| f.format.as_deref());
                    rendered.push(value.render(format));
                },
                PositionField::Generated(kind) => rendered.push(kind.generate(ctx)),
            }
        }
        Ok(rendered.join("."))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_position_of_stored_fields() {
        let schema = Schema::parse("name:string,age:int32").unwrap();
        let key = SortableKey::new().with("name", "John Doe").with("age", 25);
        let spec = PositionSpec::of_fields(&["name", "age"]).unwrap();
        let ctx = RunContext::new("people");

        assert!(spec.is_deterministic());
        assert_eq!(spec.position(&key, &schema, &ctx).unwrap(), "John Doe.25");
        assert_eq!(spec.position(&key, &schema, &ctx).unwrap(), "John Doe.25");
    }

    #[test]
    fn test_timestamp_position_uses_field_format() {
        let schema = Schema::parse("day:timestamp:%Y%m%d,id:int64").unwrap();
        let key = SortableKey::new()
            .with("day", Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap())
            .with("id", 7i64);
        let spec = PositionSpec::parse("day,id").unwrap();

        let position = spec.position(&key, &schema, &RunContext::new("t")).unwrap();
        assert_eq!(position, "20240309.7");
    }

    #[test]
    fn test_sequence_generator_advances_per_call() {
        let schema = Schema::parse("id:int64").unwrap();
        let key = SortableKey::new().with("id", 1i64);
        let spec = PositionSpec::parse("id,@sequence").unwrap();
        let ctx = RunContext::new("t");

        assert!(!spec.is_deterministic());
        let first = spec.position(&key, &schema, &ctx).unwrap();
        let second = spec.position(&key, &schema, &ctx).unwrap();
        assert_eq!(first, "1.1");
        assert_eq!(second, "1.2");
    }

    #[test]
    fn test_validate_and_missing_values() {
        let schema = Schema::parse("id:int64").unwrap();
        assert!(PositionSpec::parse("nope").unwrap().validate(&schema).is_err());
        assert!(PositionSpec::parse("@bogus").is_err());
        assert!(PositionSpec::parse(" , ").is_err());

        let spec = PositionSpec::parse("id").unwrap();
        let err = spec
            .position(&SortableKey::new(), &schema, &RunContext::new("t"))
            .unwrap_err();
        assert!(matches!(err, IngestError::Encoding(_)));
    }

    #[test]
    fn test_uuid_generators_are_distinct() {
        let ctx = RunContext::new("t");
        let a = GeneratorKind::TimeOrdered.generate(&ctx);
        let b = GeneratorKind::TimeOrdered.generate(&ctx);
        assert_ne!(a, b);
        assert_eq!(GeneratorKind::Random.generate(&ctx).len(), 36);
    }
}
