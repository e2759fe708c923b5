//! Per-message manifest
//!
//! Every output message carries two fields: the rendered content and a JSON
//! manifest describing where it came from and how to verify it.

use chrono::{DateTime, Utc};
use regroup_common::checksum::{digest_bytes, ChecksumAlgorithm};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{IngestError, IngestResult};
use crate::staging::{
    META_DELIMITER, META_SOURCE_COLUMNS, META_SOURCE_FILE, META_SOURCE_PATH, META_TARGET_COLUMNS,
};
use crate::tokenizer::{join_fields, SourceHeader};

/// Message field holding the rendered rows
pub const CONTENT_FIELD: &str = "content";
/// Message field holding the serialized [`Manifest`]
pub const MANIFEST_FIELD: &str = "manifest";

pub const CONTENT_TYPE: &str = "text/csv";
pub const CHARSET: &str = "utf-8";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source: String,
    pub target: String,
}

/// Source file a message was cut from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_path: String,
    pub source_file: String,
    pub delimiter: String,
    pub columns: Vec<ColumnMapping>,
}

impl Provenance {
    pub fn from_header(header: &SourceHeader) -> Self {
        Self {
            source_path: header.source_path.clone(),
            source_file: header.source_file.clone(),
            delimiter: header.delimiter_char().to_string(),
            columns: header
                .columns
                .iter()
                .map(|c| ColumnMapping {
                    source: c.name.clone(),
                    target: c.normalized.clone(),
                })
                .collect(),
        }
    }

    /// Rebuild from the staged meta record
    pub fn from_meta(meta: &BTreeMap<String, String>) -> IngestResult<Self> {
        let get = |key: &str| {
            meta.get(key)
                .cloned()
                .ok_or_else(|| IngestError::staging(format!("meta record lacks '{}'", key)))
        };

        let sources: Vec<String> = serde_json::from_str(&get(META_SOURCE_COLUMNS)?)?;
        let targets: Vec<String> = serde_json::from_str(&get(META_TARGET_COLUMNS)?)?;
        if sources.len() != targets.len() {
            return Err(IngestError::staging(format!(
                "meta record maps {} source columns onto {} targets",
                sources.len(),
                targets.len()
            )));
        }

        Ok(Self {
            source_path: get(META_SOURCE_PATH)?,
            source_file: get(META_SOURCE_FILE)?,
            delimiter: get(META_DELIMITER)?,
            columns: sources
                .into_iter()
                .zip(targets)
                .map(|(source, target)| ColumnMapping { source, target })
                .collect(),
        })
    }

    /// Header entries written once per staged topic
    pub fn to_meta(&self) -> IngestResult<Vec<(&'static str, String)>> {
        let sources: Vec<&str> = self.columns.iter().map(|c| c.source.as_str()).collect();
        let targets: Vec<&str> = self.columns.iter().map(|c| c.target.as_str()).collect();
        Ok(vec![
            (META_SOURCE_FILE, self.source_file.clone()),
            (META_SOURCE_PATH, self.source_path.clone()),
            (META_DELIMITER, self.delimiter.clone()),
            (META_SOURCE_COLUMNS, serde_json::to_string(&sources)?),
            (META_TARGET_COLUMNS, serde_json::to_string(&targets)?),
        ])
    }

    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter.bytes().next().unwrap_or(b',')
    }

    /// Original header line, re-joined with the source delimiter
    pub fn header_line(&self) -> String {
        let names: Vec<&str> = self.columns.iter().map(|c| c.source.as_str()).collect();
        join_fields(&names, self.delimiter_byte())
    }

    /// Header line followed by `rows`, one per line
    pub fn render<'a>(&self, rows: impl IntoIterator<Item = &'a str>) -> String {
        let mut content = self.header_line();
        content.push('\n');
        for row in rows {
            content.push_str(row);
            content.push('\n');
        }
        content
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub topic: String,
    pub position: String,
    pub content_key: String,
    pub provenance: Provenance,
    pub content_type: String,
    pub content_length: usize,
    pub charset: String,
    pub digest_algorithm: ChecksumAlgorithm,
    pub digest: String,
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    /// Describe `content` as published under `position`
    pub fn describe(topic: &str, position: &str, provenance: &Provenance, content: &[u8]) -> Self {
        Self {
            topic: topic.to_string(),
            position: position.to_string(),
            content_key: CONTENT_FIELD.to_string(),
            provenance: provenance.clone(),
            content_type: CONTENT_TYPE.to_string(),
            content_length: content.len(),
            charset: CHARSET.to_string(),
            digest_algorithm: ChecksumAlgorithm::Sha256,
            digest: digest_bytes(content, ChecksumAlgorithm::Sha256),
            created_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> IngestResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> IngestResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Check `content` against the recorded length and digest
    pub fn verify(&self, content: &[u8]) -> IngestResult<()> {
        if content.len() != self.content_length {
            return Err(IngestError::decoding(format!(
                "content is {} bytes, manifest says {}",
                content.len(),
                self.content_length
            )));
        }
        regroup_common::checksum::verify_bytes(content, &self.digest, self.digest_algorithm)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tokenizer::DelimitedReader;
    use std::io::Cursor;
    use std::path::PathBuf;

    fn provenance() -> Provenance {
        let reader = DelimitedReader::new(
            Cursor::new(b"First Name;Age\nJohn;25\n".to_vec()),
            PathBuf::from("/in/people.csv"),
            b';',
        )
        .unwrap();
        Provenance::from_header(reader.header())
    }

    #[test]
    fn test_meta_round_trip() {
        let original = provenance();
        let meta: BTreeMap<String, String> = original
            .to_meta()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let restored = Provenance::from_meta(&meta).unwrap();
        assert_eq!(restored, original);
        assert_eq!(restored.columns[0].target, "first_name");
        assert_eq!(restored.header_line(), "First Name;Age");
    }

    #[test]
    fn test_incomplete_meta_rejected() {
        let mut meta = BTreeMap::new();
        meta.insert(META_SOURCE_FILE.to_string(), "x.csv".to_string());
        assert!(matches!(
            Provenance::from_meta(&meta),
            Err(IngestError::StagingIo(_))
        ));
    }

    #[test]
    fn test_render_and_describe() {
        let provenance = provenance();
        let content = provenance.render(["John;25", "Ann;31"]);
        assert_eq!(content, "First Name;Age\nJohn;25\nAnn;31\n");

        let manifest = Manifest::describe("people", "John.25", &provenance, content.as_bytes());
        assert_eq!(manifest.content_key, CONTENT_FIELD);
        assert_eq!(manifest.content_length, content.len());
        assert_eq!(manifest.provenance.delimiter, ";");
        manifest.verify(content.as_bytes()).unwrap();
        assert!(manifest.verify(b"tampered").is_err());

        let parsed = Manifest::from_json(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(parsed, manifest);
    }
}
