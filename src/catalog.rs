use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{DimensionalModel, ModelCache};

pub const MAX_NAME_LENGTH: usize = 255;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Decimal,
    Boolean,
    Date,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Decimal => "decimal",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Decimal)
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Column descriptor discovered while validating a source, or declared in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: FieldType,
}

fn default_field_type() -> FieldType {
    FieldType::String
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        Self {
            title: name.clone(),
            name,
            field_type,
        }
    }
}

/// The metadata document persisted with every dataset row.
///
/// All sections are written together in a single store write, so a reader never
/// observes the field list of one revision next to the schema of another.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DatasetData {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cardinalities: BTreeMap<String, u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Attribute patch for a dataset. Keys absent from the source document stay `None`
/// and leave the attribute untouched; an explicit `null` clears optional text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatasetPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub label: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub currency: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub category: Option<Option<String>>,
    #[serde(default)]
    pub private: Option<bool>,
    #[serde(default)]
    pub languages: Option<BTreeSet<String>>,
    #[serde(default)]
    pub territories: Option<BTreeSet<String>>,
}

fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl DatasetPatch {
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(EngineError::validation("dataset attributes must be an object"));
        }
        serde_json::from_value(value)
            .map_err(|e| EngineError::validation(format!("invalid dataset attributes: {}", e)))
    }
}

/// Ingestion manifest: a `dataset` attribute section plus optional `fields`, `model`
/// and any other sections, which are kept verbatim in the dataset document.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub dataset: Option<DatasetPatch>,
    #[serde(flatten)]
    pub data: DatasetData,
}

impl Manifest {
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(EngineError::validation("manifest must be an object"));
        }
        serde_json::from_value(value)
            .map_err(|e| EngineError::validation(format!("invalid manifest: {}", e)))
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(EngineError::validation("dataset name must not be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(EngineError::validation(format!(
            "dataset name exceeds {} characters",
            MAX_NAME_LENGTH
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(EngineError::validation(format!(
            "dataset name '{}' may only contain letters, digits, '-' and '_'",
            name
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub currency: Option<String>,
    pub category: Option<String>,
    pub private: bool,
    pub languages: BTreeSet<String>,
    pub territories: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data: DatasetData,
    model_version: u64,
    model_cache: ModelCache,
}

impl Dataset {
    pub fn new(name: impl Into<String>, data: DatasetData) -> Self {
        let now = Utc::now();
        Self {
            id: format!("ds_{}", Uuid::new_v4().simple()),
            name: name.into(),
            label: None,
            description: None,
            currency: None,
            category: None,
            private: false,
            languages: BTreeSet::new(),
            territories: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            data,
            model_version: 0,
            model_cache: ModelCache::default(),
        }
    }

    /// Builds a dataset from a manifest. The name is checked here; uniqueness is
    /// the store's concern.
    pub fn from_manifest(manifest: Manifest) -> Result<Self> {
        let attributes = manifest
            .dataset
            .ok_or_else(|| EngineError::validation("manifest has no 'dataset' section"))?;
        let name = attributes
            .name
            .clone()
            .ok_or_else(|| EngineError::validation("manifest dataset has no 'name'"))?;
        validate_name(&name)?;

        let mut dataset = Dataset::new(name, manifest.data);
        dataset.apply_patch(&attributes)?;
        Ok(dataset)
    }

    /// Rebuilds a dataset from persisted state.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        id: String,
        name: String,
        label: Option<String>,
        description: Option<String>,
        currency: Option<String>,
        category: Option<String>,
        private: bool,
        languages: BTreeSet<String>,
        territories: BTreeSet<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        data: DatasetData,
    ) -> Self {
        Self {
            id,
            name,
            label,
            description,
            currency,
            category,
            private,
            languages,
            territories,
            created_at,
            updated_at,
            data,
            model_version: 0,
            model_cache: ModelCache::default(),
        }
    }

    /// Applies the keys present in `patch`. Returns whether anything changed.
    pub fn apply_patch(&mut self, patch: &DatasetPatch) -> Result<bool> {
        if let Some(name) = &patch.name {
            if name != &self.name {
                return Err(EngineError::validation(format!(
                    "dataset name is immutable ('{}' cannot become '{}')",
                    self.name, name
                )));
            }
        }

        let before = (
            self.label.clone(),
            self.description.clone(),
            self.currency.clone(),
            self.category.clone(),
            self.private,
            self.languages.clone(),
            self.territories.clone(),
        );

        if let Some(label) = &patch.label {
            self.label = label.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(currency) = &patch.currency {
            self.currency = currency.clone();
        }
        if let Some(category) = &patch.category {
            self.category = category.clone();
        }
        if let Some(private) = patch.private {
            self.private = private;
        }
        if let Some(languages) = &patch.languages {
            self.languages = languages.clone();
        }
        if let Some(territories) = &patch.territories {
            self.territories = territories.clone();
        }

        let after = (
            self.label.clone(),
            self.description.clone(),
            self.currency.clone(),
            self.category.clone(),
            self.private,
            self.languages.clone(),
            self.territories.clone(),
        );
        Ok(before != after)
    }

    /// Bumps the cache-invalidation timestamp. Never moves backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = now.max(self.updated_at).max(self.created_at);
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.data.fields
    }

    pub fn set_fields(&mut self, fields: Vec<FieldSpec>) {
        self.data.fields = fields;
        self.invalidate_model();
    }

    pub fn model_spec(&self) -> Option<&Value> {
        self.data.model.as_ref()
    }

    /// Replaces the schema section. Stale cardinalities go with the old schema.
    pub fn set_model_spec(&mut self, model: Value) {
        self.data.model = Some(model);
        self.data.cardinalities.clear();
        self.invalidate_model();
    }

    pub fn cardinalities(&self) -> &BTreeMap<String, u64> {
        &self.data.cardinalities
    }

    pub fn model_version(&self) -> u64 {
        self.model_version
    }

    /// Drops the memoized model. Called whenever the schema section or the
    /// existence of the fact table changes.
    pub fn invalidate_model(&mut self) {
        self.model_version += 1;
        self.model_cache.clear();
    }

    pub fn cached_model(&self) -> Option<Arc<DimensionalModel>> {
        self.model_cache.get(self.model_version)
    }

    pub(crate) fn cache_model(&mut self, model: Arc<DimensionalModel>) {
        self.model_cache.store(self.model_version, model);
    }

    /// Copy of the persisted state only, without the derived model handle.
    pub fn detached(&self) -> Self {
        let mut copy = self.clone();
        copy.model_version = 0;
        copy.model_cache = ModelCache::default();
        copy
    }
}

/// Stable public projection of a dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetView {
    pub label: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub currency: Option<String>,
    pub category: Option<String>,
    pub private: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub languages: Vec<String>,
    pub territories: Vec<String>,
    pub has_model: bool,
    pub api_url: String,
}
