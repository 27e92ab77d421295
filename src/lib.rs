pub mod access;
pub mod catalog;
pub mod config;
pub mod cube;
pub mod database;
pub mod error;
pub mod fact_table;
pub mod ingest;
pub mod model;
pub mod models;
pub mod package;
pub mod registry;
pub mod schema;
pub mod storage;
pub mod store;
pub mod values;
pub mod worker;

pub use access::Viewer;
pub use catalog::{Dataset, FieldSpec, FieldType};
pub use config::Config;
pub use cube::{AggregateQuery, Cube, Cut};
pub use error::{EngineError, Result};
pub use fact_table::FactTable;
pub use model::DimensionalModel;
pub use registry::{DatasetRegistry, LoadMode};
pub use storage::Warehouse;
