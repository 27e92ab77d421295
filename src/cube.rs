use datafusion::arrow::json::writer::JsonArray;
use datafusion::arrow::json::WriterBuilder;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::execution::context::SessionContext;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::fact_table::FactTable;
use crate::model::{Attribute, DimensionalModel, COUNT_AGGREGATE};
use crate::storage::Warehouse;

pub const DEFAULT_PAGE_SIZE: usize = 10_000;
pub const MAX_PAGE_SIZE: usize = 100_000;

pub type Cell = Map<String, Value>;

/// Equality filter on a dimension attribute, written `ref:value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cut {
    pub reference: String,
    pub value: String,
}

impl Cut {
    pub fn new(reference: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            value: value.into(),
        }
    }

    pub fn parse(cut: &str) -> Result<Self> {
        match cut.split_once(':') {
            Some((reference, value)) if !reference.trim().is_empty() => {
                Ok(Self::new(reference.trim(), value))
            }
            _ => Err(EngineError::validation(format!(
                "cut '{}' must have the form ref:value",
                cut
            ))),
        }
    }
}

impl std::fmt::Display for Cut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.reference, self.value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AggregateQuery {
    /// `measure.sum|avg|min|max` or `_count`. Empty means every measure sum and `_count`.
    pub aggregates: Vec<String>,
    pub cuts: Vec<Cut>,
    /// `dimension` or `dimension.attribute`.
    pub drilldowns: Vec<String>,
    /// 1-based.
    pub page: usize,
    pub pagesize: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateResult {
    pub total_cell_count: usize,
    pub page: usize,
    pub pagesize: usize,
    pub aggregates: Vec<String>,
    pub drilldowns: Vec<String>,
    pub cuts: Vec<String>,
    pub summary: Cell,
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FactsResult {
    pub total_fact_count: usize,
    pub page: usize,
    pub pagesize: usize,
    pub data: Vec<Cell>,
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn page_bounds(page: usize, pagesize: Option<usize>) -> (usize, usize) {
    let page = page.max(1);
    let pagesize = pagesize
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    (page, pagesize)
}

/// Rows to skip before `page`; saturates for page numbers past any real result.
fn page_offset(page: usize, pagesize: usize) -> usize {
    page.saturating_sub(1).saturating_mul(pagesize)
}

fn batches_to_cells(batches: &[RecordBatch]) -> Result<Vec<Cell>> {
    let mut buffer = Vec::new();
    {
        let mut writer = WriterBuilder::new()
            .with_explicit_nulls(true)
            .build::<_, JsonArray>(&mut buffer);
        let refs: Vec<&RecordBatch> = batches.iter().collect();
        writer.write_batches(&refs)?;
        writer.finish()?;
    }
    if buffer.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(&buffer)?)
}

/// Aggregation gateway over one fact table shaped by a dimensional model.
/// Cheap to build; every instance owns a private query session.
pub struct Cube {
    fact_table: FactTable,
    model: Arc<DimensionalModel>,
    ctx: SessionContext,
}

impl Cube {
    pub async fn open(
        warehouse: &Warehouse,
        fact_table: FactTable,
        model: Arc<DimensionalModel>,
    ) -> Result<Self> {
        let ctx = warehouse.session()?;
        fact_table.register(&ctx).await?;
        Ok(Self {
            fact_table,
            model,
            ctx,
        })
    }

    pub fn model(&self) -> &Arc<DimensionalModel> {
        &self.model
    }

    pub fn fact_table(&self) -> &FactTable {
        &self.fact_table
    }

    fn table(&self) -> String {
        quote(self.fact_table.table_name())
    }

    async fn run(&self, sql: &str) -> Result<Vec<Cell>> {
        debug!("Running cube query on {}: {}", self.fact_table.table_name(), sql);

        let df = self
            .ctx
            .sql(sql)
            .await
            .map_err(|e| EngineError::QueryExecutionFailed {
                message: e.to_string(),
            })?;
        let batches = df
            .collect()
            .await
            .map_err(|e| EngineError::QueryExecutionFailed {
                message: e.to_string(),
            })?;

        batches_to_cells(&batches)
    }

    fn resolve_aggregate(&self, reference: &str) -> Result<String> {
        if reference == COUNT_AGGREGATE {
            return Ok("COUNT(*)".to_string());
        }
        let (measure_name, function) = reference.split_once('.').unwrap_or((reference, "sum"));
        let measure = self.model.measure(measure_name).ok_or_else(|| {
            EngineError::validation(format!("unknown measure in aggregate '{}'", reference))
        })?;
        let function = match function {
            "sum" => "SUM",
            "avg" => "AVG",
            "min" => "MIN",
            "max" => "MAX",
            other => {
                return Err(EngineError::validation(format!(
                    "unknown aggregate function '{}' in '{}'",
                    other, reference
                )))
            }
        };
        Ok(format!("{}({})", function, quote(&measure.column)))
    }

    fn default_aggregates(&self) -> Vec<String> {
        self.model
            .measures()
            .iter()
            .map(|m| format!("{}.sum", m.name))
            .chain(std::iter::once(COUNT_AGGREGATE.to_string()))
            .collect()
    }

    /// `WHERE` clause for a set of cuts. Cuts on the same attribute are alternatives.
    fn where_clause(&self, cuts: &[Cut]) -> Result<String> {
        if cuts.is_empty() {
            return Ok(String::new());
        }
        let mut by_column: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for cut in cuts {
            let attribute = self.model.attribute(&cut.reference)?;
            by_column
                .entry(attribute.column.clone())
                .or_default()
                .push(literal(&cut.value));
        }
        let conditions: Vec<String> = by_column
            .iter()
            .map(|(column, values)| {
                format!(
                    "CAST({} AS VARCHAR) IN ({})",
                    quote(column),
                    values.join(", ")
                )
            })
            .collect();
        Ok(format!(" WHERE {}", conditions.join(" AND ")))
    }

    fn resolve_drilldowns(&self, drilldowns: &[String]) -> Result<Vec<&Attribute>> {
        let mut attributes: Vec<&Attribute> = Vec::new();
        for reference in drilldowns {
            let attribute = self.model.attribute(reference)?;
            if !attributes.iter().any(|a| a.reference() == attribute.reference()) {
                attributes.push(attribute);
            }
        }
        Ok(attributes)
    }

    /// Aggregates measures over the drilldown attributes. Cells come back ordered
    /// by the drilldown values, so equal inputs give equal pages.
    pub async fn query(&self, query: &AggregateQuery) -> Result<AggregateResult> {
        let aggregates = if query.aggregates.is_empty() {
            self.default_aggregates()
        } else {
            query.aggregates.clone()
        };
        let aggregate_exprs = aggregates
            .iter()
            .map(|reference| {
                Ok(format!(
                    "{} AS {}",
                    self.resolve_aggregate(reference)?,
                    quote(reference)
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let drilldowns = self.resolve_drilldowns(&query.drilldowns)?;
        let where_clause = self.where_clause(&query.cuts)?;
        let (page, pagesize) = page_bounds(query.page, query.pagesize);

        let summary_sql = format!(
            "SELECT {} FROM {}{}",
            aggregate_exprs.join(", "),
            self.table(),
            where_clause
        );
        let summary = self.run(&summary_sql).await?.into_iter().next().unwrap_or_default();

        let cells = if drilldowns.is_empty() {
            vec![summary.clone()]
        } else {
            let select: Vec<String> = drilldowns
                .iter()
                .map(|a| format!("{} AS {}", quote(&a.column), quote(&a.reference())))
                .chain(aggregate_exprs.iter().cloned())
                .collect();
            let group_by: Vec<String> = drilldowns.iter().map(|a| quote(&a.column)).collect();
            let order_by: Vec<String> = drilldowns
                .iter()
                .map(|a| format!("{} ASC NULLS FIRST", quote(&a.reference())))
                .collect();
            let sql = format!(
                "SELECT {} FROM {}{} GROUP BY {} ORDER BY {}",
                select.join(", "),
                self.table(),
                where_clause,
                group_by.join(", "),
                order_by.join(", ")
            );
            self.run(&sql).await?
        };

        let total_cell_count = cells.len();
        let cells = cells
            .into_iter()
            .skip(page_offset(page, pagesize))
            .take(pagesize)
            .collect();

        info!(
            "Aggregated {} over {:?}: {} cells",
            self.fact_table.table_name(),
            query.drilldowns,
            total_cell_count
        );

        Ok(AggregateResult {
            total_cell_count,
            page,
            pagesize,
            aggregates,
            drilldowns: drilldowns.iter().map(|a| a.reference()).collect(),
            cuts: query.cuts.iter().map(Cut::to_string).collect(),
            summary,
            cells,
        })
    }

    /// Distinct members of a dimension with all of its attributes, or the distinct
    /// values of one attribute for a `dimension.attribute` reference.
    pub async fn members(&self, reference: &str, cuts: &[Cut]) -> Result<Vec<Cell>> {
        let (attributes, order_by): (Vec<&Attribute>, &Attribute) =
            if reference.contains('.') {
                let attribute = self.model.attribute(reference)?;
                (vec![attribute], attribute)
            } else {
                let dimension = self.model.dimension(reference).ok_or_else(|| {
                    EngineError::validation(format!("unknown dimension '{}'", reference))
                })?;
                (dimension.attributes.iter().collect(), dimension.key())
            };
        let select: Vec<String> = attributes
            .iter()
            .map(|a| format!("{} AS {}", quote(&a.column), quote(&a.reference())))
            .collect();
        let sql = format!(
            "SELECT DISTINCT {} FROM {}{} ORDER BY {} ASC NULLS FIRST",
            select.join(", "),
            self.table(),
            self.where_clause(cuts)?,
            quote(&order_by.reference())
        );
        self.run(&sql).await
    }

    /// Raw fact rows, ordered by every column.
    pub async fn facts(
        &self,
        cuts: &[Cut],
        page: usize,
        pagesize: Option<usize>,
    ) -> Result<FactsResult> {
        let (page, pagesize) = page_bounds(page, pagesize);
        let where_clause = self.where_clause(cuts)?;

        let count_sql = format!(
            "SELECT COUNT(*) AS n FROM {}{}",
            self.table(),
            where_clause
        );
        let total_fact_count = self
            .run(&count_sql)
            .await?
            .first()
            .and_then(|row| row.get("n"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;

        let offset = page_offset(page, pagesize);
        if offset >= total_fact_count {
            return Ok(FactsResult {
                total_fact_count,
                page,
                pagesize,
                data: Vec::new(),
            });
        }

        let order_by: Vec<String> = self
            .fact_table
            .fields()
            .await?
            .unwrap_or_default()
            .iter()
            .map(|f| format!("{} ASC NULLS FIRST", quote(&f.name)))
            .collect();
        let sql = format!(
            "SELECT * FROM {}{} ORDER BY {} LIMIT {} OFFSET {}",
            self.table(),
            where_clause,
            order_by.join(", "),
            pagesize,
            offset
        );

        Ok(FactsResult {
            total_fact_count,
            page,
            pagesize,
            data: self.run(&sql).await?,
        })
    }

    /// Distinct key values per dimension, from a single scan of the fact table.
    pub async fn compute_cardinalities(&self) -> Result<BTreeMap<String, u64>> {
        let dimensions = self.model.dimensions();
        if dimensions.is_empty() {
            return Ok(BTreeMap::new());
        }

        let select: Vec<String> = dimensions
            .iter()
            .map(|d| format!("COUNT(DISTINCT {}) AS {}", quote(&d.key().column), quote(&d.name)))
            .collect();
        let sql = format!("SELECT {} FROM {}", select.join(", "), self.table());
        let row = self.run(&sql).await?.into_iter().next().unwrap_or_default();

        let cardinalities: BTreeMap<String, u64> = dimensions
            .iter()
            .map(|d| {
                let count = row.get(&d.name).and_then(Value::as_u64).unwrap_or(0);
                (d.name.clone(), count)
            })
            .collect();

        info!(
            "Computed cardinalities for {}: {:?}",
            self.fact_table.table_name(),
            cardinalities
        );
        Ok(cardinalities)
    }
}
