//! Delimited source reader
//!
//! Turns a delimited text file into [`SourceRecord`]s: one per data row, each
//! carrying the file's header mapping and a `has_next` flag so downstream
//! stages can spot the last row without buffering.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter, WriterBuilder};

use crate::error::{IngestError, IngestResult};

/// One header column of a source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub index: usize,
    pub name: String,
    pub normalized: String,
}

/// Header of one source file, shared by all of its records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceHeader {
    pub source_file: String,
    pub source_path: String,
    pub delimiter: u8,
    pub columns: Vec<Column>,
}

impl SourceHeader {
    /// Column by normalized name
    pub fn column(&self, normalized: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.normalized == normalized)
    }

    pub fn delimiter_char(&self) -> char {
        self.delimiter as char
    }

    /// Original header names joined with the source delimiter
    pub fn header_line(&self) -> String {
        let names: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        join_fields(&names, self.delimiter)
    }
}

/// One tokenized data row
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub header: Arc<SourceHeader>,
    pub tokens: Vec<String>,
    /// Row re-serialized with the source delimiter
    pub row_text: String,
    /// 1-based line of the row in its file, header excluded
    pub line: u64,
    pub has_next: bool,
}

impl SourceRecord {
    /// Token under the column with normalized name `column`
    pub fn token(&self, column: &str) -> Option<&str> {
        self.header
            .column(column)
            .and_then(|c| self.tokens.get(c.index))
            .map(String::as_str)
    }
}

/// Collapse a header name to lowercase alphanumerics separated by `_`
pub fn normalize_header(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Join fields into one delimited line, quoting where needed
pub fn join_fields<S: AsRef<str>>(fields: &[S], delimiter: u8) -> String {
    let mut writer = WriterBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .from_writer(Vec::new());
    let joined = writer
        .write_record(fields.iter().map(|f| f.as_ref()))
        .ok()
        .and_then(|_| writer.into_inner().ok())
        .and_then(|bytes| String::from_utf8(bytes).ok());

    match joined {
        Some(line) => line.trim_end_matches(['\r', '\n']).to_string(),
        None => fields
            .iter()
            .map(|f| f.as_ref())
            .collect::<Vec<_>>()
            .join(&(delimiter as char).to_string()),
    }
}

/// Streaming reader over one delimited file
pub struct DelimitedReader<R: Read> {
    header: Arc<SourceHeader>,
    rows: StringRecordsIntoIter<R>,
    lookahead: Option<StringRecord>,
    line: u64,
}

impl DelimitedReader<File> {
    pub fn open(path: impl AsRef<Path>, delimiter: u8) -> IngestResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::new(file, path.to_path_buf(), delimiter)
    }
}

impl<R: Read> DelimitedReader<R> {
    /// Wrap `reader`, consuming its header row
    pub fn new(reader: R, path: PathBuf, delimiter: u8) -> IngestResult<Self> {
        let mut csv = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(false)
            .from_reader(reader);

        let names = csv.headers()?.clone();
        if names.is_empty() {
            return Err(IngestError::Tokenize(format!(
                "{} has no header row",
                path.display()
            )));
        }

        let columns = names
            .iter()
            .enumerate()
            .map(|(index, name)| Column {
                index,
                name: name.to_string(),
                normalized: normalize_header(name),
            })
            .collect();

        let header = Arc::new(SourceHeader {
            source_file: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            source_path: path.display().to_string(),
            delimiter,
            columns,
        });

        let mut rows = csv.into_records();
        let lookahead = rows.next().transpose()?;

        Ok(Self {
            header,
            rows,
            lookahead,
            line: 0,
        })
    }

    pub fn header(&self) -> &Arc<SourceHeader> {
        &self.header
    }

    /// Next record, `None` once the file is exhausted
    pub fn next_record(&mut self) -> IngestResult<Option<SourceRecord>> {
        let Some(current) = self.lookahead.take() else {
            return Ok(None);
        };
        self.lookahead = self.rows.next().transpose()?;
        self.line += 1;

        let tokens: Vec<String> = current.iter().map(str::to_string).collect();
        Ok(Some(SourceRecord {
            header: Arc::clone(&self.header),
            row_text: join_fields(&tokens, self.header.delimiter),
            tokens,
            line: self.line,
            has_next: self.lookahead.is_some(),
        }))
    }
}

impl<R: Read> Iterator for DelimitedReader<R> {
    type Item = IngestResult<SourceRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
