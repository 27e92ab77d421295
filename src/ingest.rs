//! Validation and row extraction for delimited-text sources.

use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info};

use crate::catalog::FieldSpec;
use crate::error::{EngineError, Result};
use crate::package::Source;
use crate::values::infer_type;

/// Rows inspected when inferring column types.
pub const SAMPLE_SIZE: usize = 1000;

/// One source record keyed by field name. Cells are raw text; typing happens
/// when the row is written to a fact table.
pub type Row = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct ValidatedSource {
    pub source: Source,
    pub fields: Vec<FieldSpec>,
    delimiter: u8,
}

impl ValidatedSource {
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }
}

/// Column name derived from a header title: lower case, runs of anything but
/// ASCII letters and digits collapsed to `_`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_separator = false;
    for c in title.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('_');
            }
            pending_separator = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }
    slug
}

fn sniff_delimiter(data: &[u8]) -> u8 {
    let first_line = data.split(|b| *b == b'\n').next().unwrap_or_default();
    [b',', b';', b'\t']
        .into_iter()
        .max_by_key(|d| first_line.iter().filter(|b| *b == d).count())
        .filter(|d| first_line.contains(d))
        .unwrap_or(b',')
}

fn reader(data: Bytes, delimiter: u8) -> csv::Reader<Cursor<Bytes>> {
    csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_reader(Cursor::new(data))
}

/// Checks the header row and infers a field list from a sample of records.
pub fn validate_table(source: Source) -> Result<ValidatedSource> {
    let delimiter = sniff_delimiter(source.data());
    let mut reader = reader(source.data().clone(), delimiter);

    let headers = reader
        .headers()
        .map_err(|e| EngineError::schema(format!("unreadable header row: {}", e)))?
        .clone();

    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(EngineError::schema(format!(
            "{} has no header row",
            source.filename
        )));
    }

    let mut names = HashSet::new();
    let mut titles = Vec::with_capacity(headers.len());
    for (index, header) in headers.iter().enumerate() {
        let title = header.trim_start_matches('\u{feff}').trim().to_string();
        if title.is_empty() {
            return Err(EngineError::schema(format!(
                "column {} has an empty header",
                index + 1
            )));
        }
        let name = slugify(&title);
        if name.is_empty() {
            return Err(EngineError::schema(format!(
                "header '{}' does not yield a usable column name",
                title
            )));
        }
        if !names.insert(name.clone()) {
            return Err(EngineError::schema(format!(
                "duplicate column name '{}' (from header '{}')",
                name, title
            )));
        }
        titles.push((name, title));
    }

    let mut samples: Vec<Vec<String>> = vec![Vec::new(); titles.len()];
    for record in reader.records().take(SAMPLE_SIZE) {
        // ragged records are reported by load_table with their position
        let Ok(record) = record else { continue };
        for (column, value) in record.iter().enumerate().take(titles.len()) {
            samples[column].push(value.to_string());
        }
    }

    let fields: Vec<FieldSpec> = titles
        .into_iter()
        .zip(samples)
        .map(|((name, title), values)| FieldSpec {
            field_type: infer_type(values.iter().map(String::as_str)),
            name,
            title,
        })
        .collect();

    info!(
        "Validated {} with {} columns",
        source.filename,
        fields.len()
    );
    debug!("Fields of {}: {:?}", source.filename, fields);

    Ok(ValidatedSource {
        source,
        fields,
        delimiter,
    })
}

/// One-shot iterator over the records of a validated source.
pub struct RowIter {
    records: csv::StringRecordsIntoIter<Cursor<Bytes>>,
    names: Arc<[String]>,
    position: usize,
}

impl Iterator for RowIter {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        self.position += 1;
        Some(match record {
            Ok(record) => Ok(self
                .names
                .iter()
                .cloned()
                .zip(record.iter().map(str::to_string))
                .collect()),
            Err(e) => Err(EngineError::schema(format!(
                "row {} is malformed: {}",
                self.position, e
            ))),
        })
    }
}

/// Lazily yields the rows of `source`. Each call starts again from the first record.
pub fn load_table(source: &ValidatedSource) -> RowIter {
    RowIter {
        records: reader(source.source.data().clone(), source.delimiter).into_records(),
        names: source.field_names().into(),
        position: 0,
    }
}
