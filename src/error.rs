use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Dataset not found: {name}")]
    DatasetNotFound { name: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid tabular source: {message}")]
    Schema { message: String },

    #[error("Dataset name already in use: {name}")]
    Conflict { name: String },

    #[error("Load into {table} failed at row {row}: {message} ({committed_rows} rows committed before the failing batch)")]
    LoadFailed {
        table: String,
        row: usize,
        committed_rows: usize,
        message: String,
    },

    #[error("Fact table {table} is owned by dataset {existing}, cannot be used for {requested}")]
    TableNameCollision {
        table: String,
        existing: String,
        requested: String,
    },

    #[error("Query execution failed: {message}")]
    QueryExecutionFailed { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("IO error: {message}")]
    IoError { message: String },

    #[error("DataFusion error: {0}")]
    DataFusionError(#[from] datafusion::error::DataFusionError),

    #[error("Arrow error: {0}")]
    ArrowError(#[from] datafusion::arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    ParquetError(#[from] datafusion::parquet::errors::ParquetError),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Internal server error: {message}")]
    InternalError { message: String },
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation {
            message: message.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        EngineError::Schema {
            message: message.into(),
        }
    }

    /// True for errors caused by bad caller input rather than the backing stores.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::Validation { .. } | EngineError::Schema { .. }
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::IoError {
            message: err.to_string(),
        }
    }
}

impl From<object_store::Error> for EngineError {
    fn from(err: object_store::Error) -> Self {
        EngineError::Storage {
            message: err.to_string(),
        }
    }
}

impl From<diesel::result::Error> for EngineError {
    fn from(err: diesel::result::Error) -> Self {
        EngineError::Database {
            message: err.to_string(),
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
