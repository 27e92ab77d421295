use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::access::Viewer;
use crate::catalog::{Dataset, DatasetPatch, DatasetView, Manifest};
use crate::config::Config;
use crate::cube::Cube;
use crate::database::PgDatasetStore;
use crate::error::{EngineError, Result};
use crate::fact_table::{FactTable, LoadReport, DEFAULT_BATCH_SIZE};
use crate::ingest::{load_table, validate_table};
use crate::model::DimensionalModel;
use crate::package::{Source, SourcePackage};
use crate::storage::Warehouse;
use crate::store::{DatasetStore, MemoryDatasetStore};

/// Resolves the public API location of a dataset.
pub trait ApiUrlResolver: Send + Sync {
    fn dataset_url(&self, name: &str) -> String;
}

pub struct BaseUrlResolver {
    base: String,
}

impl BaseUrlResolver {
    pub fn new(base_url: &str) -> Result<Self> {
        let url = Url::parse(base_url).map_err(|e| EngineError::ConfigError {
            message: format!("Invalid API base URL '{}': {}", base_url, e),
        })?;
        Ok(Self {
            base: url.as_str().trim_end_matches('/').to_string(),
        })
    }

    /// Host-relative URLs, for deployments behind a proxy.
    pub fn relative() -> Self {
        Self {
            base: "/api/3".to_string(),
        }
    }
}

impl ApiUrlResolver for BaseUrlResolver {
    fn dataset_url(&self, name: &str) -> String {
        format!("{}/datasets/{}", self.base, name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Empty the fact table first.
    #[default]
    Replace,
    Append,
}

/// Owns the dataset lifecycle and ties datasets to their fact tables, models and cubes.
pub struct DatasetRegistry {
    store: Arc<dyn DatasetStore>,
    warehouse: Warehouse,
    urls: Arc<dyn ApiUrlResolver>,
    batch_size: usize,
}

impl DatasetRegistry {
    pub fn new(store: Arc<dyn DatasetStore>, warehouse: Warehouse) -> Self {
        Self {
            store,
            warehouse,
            urls: Arc::new(BaseUrlResolver::relative()),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub async fn connect(config: &Config) -> Result<Self> {
        info!("Initializing dataset registry");

        let store: Arc<dyn DatasetStore> = match &config.database_url {
            Some(database_url) => Arc::new(PgDatasetStore::new(database_url).await?),
            None => {
                warn!("DATABASE_URL not set, datasets are kept in memory only");
                Arc::new(MemoryDatasetStore::new())
            }
        };
        let warehouse =
            Warehouse::from_url(&config.warehouse_url)?.with_memory_limit(config.memory_limit);

        let mut registry = Self::new(store, warehouse).with_batch_size(config.load_batch_size);
        if let Some(base) = &config.api_base_url {
            registry = registry.with_url_resolver(Arc::new(BaseUrlResolver::new(base)?));
        }

        info!("Dataset registry initialized successfully");
        Ok(registry)
    }

    pub fn with_url_resolver(mut self, urls: Arc<dyn ApiUrlResolver>) -> Self {
        self.urls = urls;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn DatasetStore> {
        &self.store
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    pub fn package(&self) -> SourcePackage {
        SourcePackage::new(self.warehouse.clone())
    }

    /// Registers a dataset from an ingestion manifest. No fact table is created.
    pub async fn create(&self, manifest: Value) -> Result<Dataset> {
        let manifest = Manifest::from_value(manifest)?;
        let dataset = Dataset::from_manifest(manifest)?;

        if self.store.get_by_name(&dataset.name).await?.is_some() {
            return Err(EngineError::Conflict {
                name: dataset.name.clone(),
            });
        }
        self.store.insert(&dataset).await?;

        info!("Dataset {} created ({})", dataset.name, dataset.id);
        Ok(dataset)
    }

    /// Applies the attribute keys present in `patch`. `dataset` is only changed
    /// once the store accepted the new state.
    pub async fn update(&self, dataset: &mut Dataset, patch: Value) -> Result<()> {
        let patch = DatasetPatch::from_value(patch)?;
        let mut updated = dataset.clone();
        if !updated.apply_patch(&patch)? {
            debug!("Update of {} changed nothing", dataset.name);
            return Ok(());
        }
        updated.touch();
        self.store.save(&updated).await?;
        *dataset = updated;
        Ok(())
    }

    pub async fn lookup_by_name(&self, name: &str) -> Result<Option<Dataset>> {
        self.store.get_by_name(name).await
    }

    /// Like [`lookup_by_name`](Self::lookup_by_name), for callers that need the dataset.
    pub async fn get(&self, name: &str) -> Result<Dataset> {
        self.lookup_by_name(name)
            .await?
            .ok_or_else(|| EngineError::DatasetNotFound {
                name: name.to_string(),
            })
    }

    /// Datasets the viewer may see; ordered by label, then name, when `ordered`.
    pub async fn list_visible(&self, viewer: &Viewer, ordered: bool) -> Result<Vec<Dataset>> {
        let mut datasets = self.store.list_visible(viewer).await?;
        if ordered {
            datasets.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.name.cmp(&b.name)));
        }
        Ok(datasets)
    }

    pub async fn is_visible(&self, dataset: &Dataset, viewer: &Viewer) -> Result<bool> {
        let managers = self.store.managers(&dataset.id).await?;
        Ok(viewer.visibility(dataset.private, &managers).allows_read())
    }

    pub async fn can_write(&self, dataset: &Dataset, viewer: &Viewer) -> Result<bool> {
        let managers = self.store.managers(&dataset.id).await?;
        Ok(viewer.visibility(dataset.private, &managers).allows_write())
    }

    pub async fn add_manager(&self, dataset: &Dataset, account_id: Uuid) -> Result<()> {
        self.store.add_manager(&dataset.id, account_id).await?;
        info!("Account {} now manages {}", account_id, dataset.name);
        Ok(())
    }

    pub async fn remove_manager(&self, dataset: &Dataset, account_id: Uuid) -> Result<bool> {
        self.store.remove_manager(&dataset.id, account_id).await
    }

    pub async fn managers(&self, dataset: &Dataset) -> Result<Vec<Uuid>> {
        self.store.managers(&dataset.id).await
    }

    /// Drops the fact table, then the dataset row and its manager assignments.
    pub async fn delete(&self, dataset: Dataset) -> Result<()> {
        self.fact_table(&dataset).drop().await?;
        self.store.delete(&dataset.id).await?;
        info!("Dataset {} deleted", dataset.name);
        Ok(())
    }

    pub fn fact_table(&self, dataset: &Dataset) -> FactTable {
        FactTable::new(&dataset.name, self.warehouse.clone()).with_batch_size(self.batch_size)
    }

    /// The dataset's model, built on first use and memoized on the dataset.
    /// `None` while there is no fact table or no usable schema section.
    pub async fn model(&self, dataset: &mut Dataset) -> Result<Option<Arc<DimensionalModel>>> {
        let Some(spec) = dataset.model_spec().filter(|s| s.is_object()).cloned() else {
            return Ok(None);
        };

        // the memoized model is only valid while its table is still there
        let fact_table = self.fact_table(dataset);
        let Some(fields) = fact_table.fields().await? else {
            if dataset.cached_model().is_some() {
                debug!("Fact table of {} is gone, dropping memoized model", dataset.name);
                dataset.invalidate_model();
            }
            debug!("No fact table for {}, model not materialized", dataset.name);
            return Ok(None);
        };
        if let Some(model) = dataset.cached_model() {
            return Ok(Some(model));
        }

        match DimensionalModel::bind(&spec, fact_table.table_name(), &fields) {
            Ok(model) => {
                let model = Arc::new(model);
                dataset.cache_model(model.clone());
                Ok(Some(model))
            }
            Err(e) if e.is_validation() => {
                debug!("Model of {} is not usable: {}", dataset.name, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Explains why a schema would not materialize for this dataset.
    pub async fn validate_model(&self, dataset: &Dataset, spec: &Value) -> Result<DimensionalModel> {
        let fact_table = self.fact_table(dataset);
        let fields = fact_table.fields().await?.ok_or_else(|| {
            EngineError::validation(format!("dataset {} has no fact table yet", dataset.name))
        })?;
        DimensionalModel::bind(spec, fact_table.table_name(), &fields)
    }

    pub async fn cube(&self, dataset: &mut Dataset) -> Result<Option<Cube>> {
        match self.model(dataset).await? {
            Some(model) => Ok(Some(
                Cube::open(&self.warehouse, self.fact_table(dataset), model).await?,
            )),
            None => Ok(None),
        }
    }

    /// Stores a new schema section, then recomputes cardinalities when the model
    /// materializes. The schema write stands even if the recomputation fails.
    pub async fn assign_model(
        &self,
        dataset: &mut Dataset,
        spec: Value,
    ) -> Result<Option<BTreeMap<String, u64>>> {
        let mut updated = dataset.clone();
        updated.set_model_spec(spec);
        updated.touch();
        self.store.save(&updated).await?;
        *dataset = updated;
        info!("Model assigned to {}", dataset.name);

        self.refresh_cardinalities(dataset).await
    }

    pub async fn refresh_cardinalities(
        &self,
        dataset: &mut Dataset,
    ) -> Result<Option<BTreeMap<String, u64>>> {
        let Some(cube) = self.cube(dataset).await? else {
            debug!("{} has no model, skipping cardinalities", dataset.name);
            return Ok(None);
        };
        let cardinalities = cube.compute_cardinalities().await?;

        let mut updated = dataset.clone();
        updated.data.cardinalities = cardinalities.clone();
        updated.touch();
        self.store.save(&updated).await?;
        *dataset = updated;

        Ok(Some(cardinalities))
    }

    /// Validates a stored source, records its fields on the dataset and loads it
    /// into the fact table. Cardinalities are refreshed when a model is present;
    /// a failed refresh is logged and leaves the previous counts in place.
    pub async fn load_source(
        &self,
        dataset: &mut Dataset,
        source: Source,
        mode: LoadMode,
    ) -> Result<LoadReport> {
        info!(
            "Loading {} ({} bytes) into {}",
            source.filename,
            source.size_bytes(),
            dataset.name
        );
        let validated = validate_table(source)?;

        let fact_table = self.fact_table(dataset);
        match mode {
            LoadMode::Replace => fact_table.reset(&validated.fields).await?,
            LoadMode::Append => fact_table.create(&validated.fields).await?,
        }
        // an appended source is stored in the existing layout
        let fields = fact_table
            .fields()
            .await?
            .unwrap_or_else(|| validated.fields.clone());

        let mut updated = dataset.clone();
        updated.set_fields(fields);
        updated.touch();
        self.store.save(&updated).await?;
        *dataset = updated;

        let report = fact_table.load_iter(load_table(&validated)).await?;

        let mut updated = dataset.clone();
        updated.touch();
        self.store.save(&updated).await?;
        *dataset = updated;

        // rows are committed here; a failed refresh keeps the previous counts
        if dataset.model_spec().is_some() {
            if let Err(e) = self.refresh_cardinalities(dataset).await {
                warn!(
                    "Loaded {} rows into {} but refreshing cardinalities failed: {}",
                    report.rows, dataset.name, e
                );
            }
        }
        Ok(report)
    }

    pub async fn to_dict(&self, dataset: &mut Dataset) -> Result<DatasetView> {
        let has_model = self.model(dataset).await?.is_some();
        Ok(DatasetView {
            label: dataset.label.clone(),
            name: dataset.name.clone(),
            description: dataset.description.clone(),
            currency: dataset.currency.clone(),
            category: dataset.category.clone(),
            private: dataset.private,
            created_at: dataset.created_at,
            updated_at: dataset.updated_at,
            languages: dataset.languages.iter().cloned().collect(),
            territories: dataset.territories.iter().cloned().collect(),
            has_model,
            api_url: self.urls.dataset_url(&dataset.name),
        })
    }

    /// The whole metadata document with the projection under `dataset`.
    pub async fn to_full_dict(&self, dataset: &mut Dataset) -> Result<Value> {
        let view = self.to_dict(dataset).await?;
        let mut full = match serde_json::to_value(&dataset.data)? {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        full.insert("dataset".to_string(), serde_json::to_value(view)?);
        Ok(Value::Object(full))
    }
}
