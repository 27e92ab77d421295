use chrono::{DateTime, Utc};
use datafusion::arrow::array::{
    Array, ArrayRef, BooleanBuilder, Date32Builder, Float64Builder, Int64Array, Int64Builder,
    StringBuilder,
};
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::datasource::file_format::parquet::ParquetFormat;
use datafusion::datasource::listing::{
    ListingOptions, ListingTable, ListingTableConfig, ListingTableUrl,
};
use datafusion::execution::context::SessionContext;
use datafusion::parquet::arrow::ArrowWriter;
use object_store::path::Path as ObjectPath;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{FieldSpec, FieldType};
use crate::error::{EngineError, Result};
use crate::ingest::Row;
use crate::storage::Warehouse;
use crate::values::{
    date_to_days, is_blank, parse_boolean, parse_date, parse_decimal, parse_integer,
};

pub const DEFAULT_BATCH_SIZE: usize = 10_000;

const MARKER_FILE: &str = "_schema.json";
const SLUG_LENGTH: usize = 40;

/// Physical table name for a dataset name. Distinct names map to distinct tables
/// even when their slugs agree, through the UUIDv5 suffix.
pub fn table_name(dataset_name: &str) -> String {
    let slug: String = dataset_name
        .chars()
        .take(SLUG_LENGTH)
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, dataset_name.as_bytes())
        .simple()
        .to_string();
    format!("fact_{}_{}", slug, &digest[..12])
}

/// Written next to the data parts. Its presence is what makes a table exist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableMarker {
    pub dataset: String,
    pub table: String,
    pub fields: Vec<FieldSpec>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub rows: usize,
    pub batches: usize,
}

#[derive(Debug, Clone)]
pub struct FactTable {
    dataset_name: String,
    table_name: String,
    warehouse: Warehouse,
    batch_size: usize,
}

fn arrow_type(field_type: FieldType) -> DataType {
    match field_type {
        FieldType::String => DataType::Utf8,
        FieldType::Integer => DataType::Int64,
        FieldType::Decimal => DataType::Float64,
        FieldType::Boolean => DataType::Boolean,
        FieldType::Date => DataType::Date32,
    }
}

pub fn arrow_schema(fields: &[FieldSpec]) -> SchemaRef {
    Arc::new(Schema::new(
        fields
            .iter()
            .map(|f| Field::new(&f.name, arrow_type(f.field_type), true))
            .collect::<Vec<_>>(),
    ))
}

/// Failure to convert one row: its position and the reason.
type RowError = (usize, String);

fn build_column(field: &FieldSpec, rows: &[(usize, Row)]) -> Result<ArrayRef, RowError> {
    let cells = rows
        .iter()
        .map(|(position, row)| (*position, row.get(&field.name).map(String::as_str)));
    let invalid = |position: usize, value: &str| {
        (
            position,
            format!(
                "value '{}' in column '{}' is not a valid {}",
                value, field.name, field.field_type
            ),
        )
    };

    let array: ArrayRef = match field.field_type {
        FieldType::String => {
            let mut builder = StringBuilder::new();
            for (_, cell) in cells {
                match cell {
                    Some(value) if !is_blank(value) => builder.append_value(value),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        FieldType::Integer => {
            let mut builder = Int64Builder::with_capacity(rows.len());
            for (position, cell) in cells {
                match cell {
                    Some(value) if !is_blank(value) => builder.append_value(
                        parse_integer(value).ok_or_else(|| invalid(position, value))?,
                    ),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        FieldType::Decimal => {
            let mut builder = Float64Builder::with_capacity(rows.len());
            for (position, cell) in cells {
                match cell {
                    Some(value) if !is_blank(value) => builder.append_value(
                        parse_decimal(value).ok_or_else(|| invalid(position, value))?,
                    ),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        FieldType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(rows.len());
            for (position, cell) in cells {
                match cell {
                    Some(value) if !is_blank(value) => builder.append_value(
                        parse_boolean(value).ok_or_else(|| invalid(position, value))?,
                    ),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        FieldType::Date => {
            let mut builder = Date32Builder::with_capacity(rows.len());
            for (position, cell) in cells {
                match cell {
                    Some(value) if !is_blank(value) => builder.append_value(date_to_days(
                        parse_date(value).ok_or_else(|| invalid(position, value))?,
                    )),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
    };
    Ok(array)
}

fn rows_to_batch(
    schema: &SchemaRef,
    fields: &[FieldSpec],
    rows: &[(usize, Row)],
) -> Result<RecordBatch, RowError> {
    let known: HashSet<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    let mut errors: Vec<RowError> = rows
        .iter()
        .find_map(|(position, row)| {
            row.keys()
                .find(|k| !known.contains(k.as_str()))
                .map(|unknown| (*position, format!("unknown column '{}'", unknown)))
        })
        .into_iter()
        .collect();

    // the earliest bad row wins, whichever column it is in
    let mut columns = Vec::with_capacity(fields.len());
    for field in fields {
        match build_column(field, rows) {
            Ok(column) => columns.push(column),
            Err(e) => errors.push(e),
        }
    }
    if let Some(e) = errors.into_iter().min_by_key(|(position, _)| *position) {
        return Err(e);
    }

    RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| (rows.first().map(|(p, _)| *p).unwrap_or(0), e.to_string()))
}

fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(buffer)
}

impl FactTable {
    pub fn new(dataset_name: &str, warehouse: Warehouse) -> Self {
        Self {
            dataset_name: dataset_name.to_string(),
            table_name: table_name(dataset_name),
            warehouse,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn dataset_name(&self) -> &str {
        &self.dataset_name
    }

    fn directory(&self) -> String {
        format!("facts/{}", self.table_name)
    }

    fn marker_path(&self) -> ObjectPath {
        self.warehouse
            .path(&format!("{}/{}", self.directory(), MARKER_FILE))
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(self.marker().await?.is_some())
    }

    /// The marker of this table, if it exists and belongs to this dataset.
    pub async fn marker(&self) -> Result<Option<TableMarker>> {
        let Some(bytes) = self.warehouse.get(&self.marker_path()).await? else {
            return Ok(None);
        };
        let marker: TableMarker = serde_json::from_slice(&bytes)?;
        if marker.dataset != self.dataset_name {
            return Err(EngineError::TableNameCollision {
                table: self.table_name.clone(),
                existing: marker.dataset,
                requested: self.dataset_name.clone(),
            });
        }
        Ok(Some(marker))
    }

    /// Columns of the physical table, `None` when it does not exist.
    pub async fn fields(&self) -> Result<Option<Vec<FieldSpec>>> {
        Ok(self.marker().await?.map(|m| m.fields))
    }

    fn check_fields(&self, fields: &[FieldSpec]) -> Result<()> {
        if fields.is_empty() {
            return Err(EngineError::validation(format!(
                "cannot create {} without columns",
                self.table_name
            )));
        }
        let mut seen = HashSet::new();
        for field in fields {
            if field.name.is_empty() || !seen.insert(field.name.as_str()) {
                return Err(EngineError::validation(format!(
                    "invalid or duplicate column name '{}' for {}",
                    field.name, self.table_name
                )));
            }
        }
        Ok(())
    }

    async fn write_marker(&self, fields: &[FieldSpec]) -> Result<()> {
        let marker = TableMarker {
            dataset: self.dataset_name.clone(),
            table: self.table_name.clone(),
            fields: fields.to_vec(),
            created_at: Utc::now(),
        };
        self.warehouse
            .put(&self.marker_path(), serde_json::to_vec_pretty(&marker)?)
            .await
    }

    /// Creates the empty table. A no-op when the table already exists.
    pub async fn create(&self, fields: &[FieldSpec]) -> Result<()> {
        self.check_fields(fields)?;

        if let Some(existing) = self.marker().await? {
            if existing.fields != fields {
                warn!(
                    "Fact table {} already exists with different columns; keeping existing layout",
                    self.table_name
                );
            } else {
                debug!("Fact table {} already exists", self.table_name);
            }
            return Ok(());
        }

        self.write_marker(fields).await?;
        info!(
            "Created fact table {} for dataset {}",
            self.table_name, self.dataset_name
        );
        Ok(())
    }

    /// Destroys all rows and recreates the table with `fields`.
    pub async fn reset(&self, fields: &[FieldSpec]) -> Result<()> {
        self.check_fields(fields)?;
        // refuses to wipe a table owned by another dataset
        self.marker().await?;

        let removed = self
            .warehouse
            .delete_prefix(&self.warehouse.path(&self.directory()))
            .await?;
        self.write_marker(fields).await?;
        info!(
            "Reset fact table {} ({} objects removed)",
            self.table_name, removed
        );
        Ok(())
    }

    /// Removes the table and all of its rows. Returns whether it existed.
    pub async fn drop(&self) -> Result<bool> {
        if self.marker().await?.is_none() {
            return Ok(false);
        }
        self.warehouse
            .delete_prefix(&self.warehouse.path(&self.directory()))
            .await?;
        info!("Dropped fact table {}", self.table_name);
        Ok(true)
    }

    /// Appends rows in batches of `batch_size`. Every batch is committed as one
    /// object; a bad row discards its batch and stops the load, earlier batches stay.
    pub async fn load_iter<I>(&self, rows: I) -> Result<LoadReport>
    where
        I: IntoIterator<Item = Result<Row>>,
    {
        let marker = self
            .marker()
            .await?
            .ok_or_else(|| EngineError::validation(format!(
                "fact table {} does not exist",
                self.table_name
            )))?;
        let schema = arrow_schema(&marker.fields);
        let load_id = Uuid::new_v4().simple().to_string();

        let mut report = LoadReport::default();
        let mut buffer: Vec<(usize, Row)> = Vec::with_capacity(self.batch_size);

        for (index, row) in rows.into_iter().enumerate() {
            let position = index + 1;
            match row {
                Ok(row) => buffer.push((position, row)),
                Err(e) => return Err(self.load_failed(position, &report, e.to_string())),
            }
            if buffer.len() >= self.batch_size {
                self.commit_batch(&schema, &marker.fields, &load_id, &buffer, &mut report)
                    .await?;
                buffer.clear();
            }
        }
        if !buffer.is_empty() {
            self.commit_batch(&schema, &marker.fields, &load_id, &buffer, &mut report)
                .await?;
        }

        info!(
            "Loaded {} rows in {} batches into {}",
            report.rows, report.batches, self.table_name
        );
        Ok(report)
    }

    fn load_failed(&self, row: usize, report: &LoadReport, message: String) -> EngineError {
        warn!(
            "Load into {} failed at row {}: {}",
            self.table_name, row, message
        );
        EngineError::LoadFailed {
            table: self.table_name.clone(),
            row,
            committed_rows: report.rows,
            message,
        }
    }

    async fn commit_batch(
        &self,
        schema: &SchemaRef,
        fields: &[FieldSpec],
        load_id: &str,
        rows: &[(usize, Row)],
        report: &mut LoadReport,
    ) -> Result<()> {
        let batch = rows_to_batch(schema, fields, rows)
            .map_err(|(position, message)| self.load_failed(position, report, message))?;
        let bytes = encode_parquet(&batch)?;
        let path = self.warehouse.path(&format!(
            "{}/part-{}-{:06}.parquet",
            self.directory(),
            load_id,
            report.batches
        ));
        self.warehouse.put(&path, bytes).await?;

        report.rows += batch.num_rows();
        report.batches += 1;
        debug!(
            "Committed batch {} ({} rows) to {}",
            report.batches,
            batch.num_rows(),
            self.table_name
        );
        Ok(())
    }

    /// Registers the table in `ctx` under its physical name.
    pub async fn register(&self, ctx: &SessionContext) -> Result<()> {
        let marker = self
            .marker()
            .await?
            .ok_or_else(|| EngineError::validation(format!(
                "fact table {} does not exist",
                self.table_name
            )))?;

        let table_url =
            ListingTableUrl::parse(self.warehouse.directory_url(&self.directory()))?;
        let listing_options = ListingOptions::new(Arc::new(ParquetFormat::default()))
            .with_file_extension(".parquet");
        let config = ListingTableConfig::new(table_url)
            .with_listing_options(listing_options)
            .with_schema(arrow_schema(&marker.fields));
        let table = ListingTable::try_new(config)?;

        ctx.register_table(self.table_name.as_str(), Arc::new(table))?;
        Ok(())
    }

    pub async fn count(&self) -> Result<usize> {
        let ctx = self.warehouse.session()?;
        self.register(&ctx).await?;

        let batches = ctx
            .sql(&format!("SELECT COUNT(*) AS n FROM \"{}\"", self.table_name))
            .await?
            .collect()
            .await?;

        let count = batches
            .first()
            .and_then(|b| b.column(0).as_any().downcast_ref::<Int64Array>())
            .filter(|a| !a.is_empty())
            .map(|a| a.value(0))
            .unwrap_or(0);
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_deterministic_and_distinct() {
        assert_eq!(table_name("cra-2010"), table_name("cra-2010"));
        assert!(table_name("cra-2010").starts_with("fact_cra_2010_"));
        // same slug, different datasets
        assert_ne!(table_name("cra-2010"), table_name("cra_2010"));
    }

    #[test]
    fn rejects_values_that_do_not_fit() {
        let fields = vec![
            FieldSpec::new("year", FieldType::Integer),
            FieldSpec::new("amount", FieldType::Decimal),
        ];
        let schema = arrow_schema(&fields);
        let good: Row = [("year", "2010"), ("amount", "1.5")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let bad: Row = [("year", "twenty"), ("amount", "")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let batch = rows_to_batch(&schema, &fields, &[(1, good.clone())]).unwrap();
        assert_eq!(batch.num_rows(), 1);

        let (position, message) =
            rows_to_batch(&schema, &fields, &[(1, good), (2, bad)]).unwrap_err();
        assert_eq!(position, 2);
        assert!(message.contains("year"));
    }

    #[test]
    fn reports_the_earliest_bad_row_across_columns() {
        let fields = vec![
            FieldSpec::new("year", FieldType::Integer),
            FieldSpec::new("amount", FieldType::Decimal),
        ];
        let schema = arrow_schema(&fields);
        let row = |year: &str, amount: &str| -> Row {
            [("year", year), ("amount", amount)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        let rows = vec![
            (1, row("2010", "1.5")),
            (2, row("2011", "2.5")),
            (3, row("2012", "lots")),
            (4, row("soon", "4.5")),
        ];

        let (position, message) = rows_to_batch(&schema, &fields, &rows).unwrap_err();

        assert_eq!(position, 3);
        assert!(message.contains("amount"));
    }
}
