use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::catalog::{Dataset, DatasetData};
use crate::error::EngineError;
use crate::schema::{dataset_managers, datasets};

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = datasets)]
#[diesel(primary_key(id))]
pub struct DatasetRow {
    pub id: String,
    pub name: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub currency: Option<String>,
    pub category: Option<String>,
    pub private: bool,
    pub languages: Vec<String>,
    pub territories: Vec<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = datasets)]
pub struct NewDatasetRow<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub label: Option<&'a str>,
    pub description: Option<&'a str>,
    pub currency: Option<&'a str>,
    pub category: Option<&'a str>,
    pub private: bool,
    pub languages: Vec<String>,
    pub territories: Vec<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything but the identity and name, written in one UPDATE.
#[derive(AsChangeset)]
#[diesel(table_name = datasets)]
#[diesel(treat_none_as_null = true)]
pub struct DatasetChanges<'a> {
    pub label: Option<&'a str>,
    pub description: Option<&'a str>,
    pub currency: Option<&'a str>,
    pub category: Option<&'a str>,
    pub private: bool,
    pub languages: Vec<String>,
    pub territories: Vec<String>,
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = dataset_managers)]
pub struct ManagerRow {
    pub dataset_id: String,
    pub account_id: Uuid,
}

impl<'a> NewDatasetRow<'a> {
    pub fn from_dataset(dataset: &'a Dataset) -> Result<Self, EngineError> {
        Ok(Self {
            id: &dataset.id,
            name: &dataset.name,
            label: dataset.label.as_deref(),
            description: dataset.description.as_deref(),
            currency: dataset.currency.as_deref(),
            category: dataset.category.as_deref(),
            private: dataset.private,
            languages: dataset.languages.iter().cloned().collect(),
            territories: dataset.territories.iter().cloned().collect(),
            data: serde_json::to_value(&dataset.data)?,
            created_at: dataset.created_at,
            updated_at: dataset.updated_at,
        })
    }
}

impl<'a> DatasetChanges<'a> {
    pub fn from_dataset(dataset: &'a Dataset) -> Result<Self, EngineError> {
        Ok(Self {
            label: dataset.label.as_deref(),
            description: dataset.description.as_deref(),
            currency: dataset.currency.as_deref(),
            category: dataset.category.as_deref(),
            private: dataset.private,
            languages: dataset.languages.iter().cloned().collect(),
            territories: dataset.territories.iter().cloned().collect(),
            data: serde_json::to_value(&dataset.data)?,
            updated_at: dataset.updated_at,
        })
    }
}

impl TryFrom<DatasetRow> for Dataset {
    type Error = EngineError;

    fn try_from(row: DatasetRow) -> Result<Self, Self::Error> {
        let data: DatasetData = serde_json::from_value(row.data)?;

        Ok(Dataset::restore(
            row.id,
            row.name,
            row.label,
            row.description,
            row.currency,
            row.category,
            row.private,
            row.languages.into_iter().collect(),
            row.territories.into_iter().collect(),
            row.created_at,
            row.updated_at,
            data,
        ))
    }
}
