#![allow(dead_code)]

use serde_json::Value;
use spend_engine::package::Source;
use spend_engine::store::MemoryDatasetStore;
use spend_engine::{DatasetRegistry, Warehouse};
use std::path::PathBuf;
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

pub fn fixture_path(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(relative)
}

pub fn fixture_json(relative: &str) -> Value {
    let raw = std::fs::read_to_string(fixture_path(relative)).expect("fixture is readable");
    serde_json::from_str(&raw).expect("fixture is valid JSON")
}

/// Registry over a fresh in-memory store and warehouse.
pub fn init_registry() -> DatasetRegistry {
    init_test_logging();
    let warehouse = Warehouse::in_memory().expect("in-memory warehouse");
    DatasetRegistry::new(Arc::new(MemoryDatasetStore::new()), warehouse).with_batch_size(2)
}

/// Copies a data fixture into a new source package.
pub async fn load_fixture(registry: &DatasetRegistry, name: &str) -> Source {
    registry
        .package()
        .ingest_path(fixture_path(&format!("data/{}", name)))
        .await
        .expect("fixture ingested")
}

pub fn manifest(name: &str) -> Value {
    serde_json::json!({
        "dataset": {
            "name": name,
            "label": format!("Dataset {}", name),
            "currency": "EUR"
        }
    })
}
