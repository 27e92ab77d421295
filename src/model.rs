//! Dimensional model: dimensions and measures bound to the columns of a fact table.
//!
//! The persisted schema section of a dataset is authoritative; a
//! [`DimensionalModel`] is only ever derived from it and can be rebuilt at any time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::catalog::FieldSpec;
use crate::error::{EngineError, Result};

pub const COUNT_AGGREGATE: &str = "_count";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributeSpec {
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DimensionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_attribute: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasureSpec {
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelSpec {
    #[serde(default)]
    pub dimensions: BTreeMap<String, DimensionSpec>,
    #[serde(default)]
    pub measures: BTreeMap<String, MeasureSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub dimension: String,
    pub name: String,
    pub column: String,
    pub label: String,
}

impl Attribute {
    /// Reference used in drilldowns, cuts and result cells: `dimension.attribute`.
    pub fn reference(&self) -> String {
        format!("{}.{}", self.dimension, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub label: String,
    pub attributes: Vec<Attribute>,
    pub key_attribute: String,
    pub label_attribute: String,
}

impl Dimension {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn key(&self) -> &Attribute {
        // key_attribute is checked against the attribute list at parse time
        self.attribute(&self.key_attribute)
            .unwrap_or(&self.attributes[0])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    pub name: String,
    pub label: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionalModel {
    fact_table: String,
    dimensions: Vec<Dimension>,
    measures: Vec<Measure>,
}

fn check_ref_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('.') || name.contains(':') || name.starts_with('_') {
        return Err(EngineError::validation(format!(
            "invalid {} name '{}': must be non-empty, not start with '_' and not contain '.' or ':'",
            kind, name
        )));
    }
    Ok(())
}

impl DimensionalModel {
    /// Parses and structurally validates a schema section for the given fact table.
    /// Column existence is not checked here; see [`DimensionalModel::bind`].
    pub fn parse(spec: &Value, fact_table: &str) -> Result<Self> {
        if !spec.is_object() {
            return Err(EngineError::validation("model must be a JSON object"));
        }
        let spec: ModelSpec = serde_json::from_value(spec.clone())
            .map_err(|e| EngineError::validation(format!("invalid model: {}", e)))?;

        if spec.dimensions.is_empty() && spec.measures.is_empty() {
            return Err(EngineError::validation(
                "model defines neither dimensions nor measures",
            ));
        }

        let mut dimensions = Vec::with_capacity(spec.dimensions.len());
        for (name, dim) in &spec.dimensions {
            check_ref_name("dimension", name)?;
            if spec.measures.contains_key(name) {
                return Err(EngineError::validation(format!(
                    "'{}' is defined as both a dimension and a measure",
                    name
                )));
            }
            if dim.attributes.is_empty() {
                return Err(EngineError::validation(format!(
                    "dimension '{}' has no attributes",
                    name
                )));
            }

            let attributes: Vec<Attribute> = dim
                .attributes
                .iter()
                .map(|(attr_name, attr)| {
                    check_ref_name("attribute", attr_name)?;
                    Ok(Attribute {
                        dimension: name.clone(),
                        name: attr_name.clone(),
                        column: attr.column.clone(),
                        label: attr.label.clone().unwrap_or_else(|| attr_name.clone()),
                    })
                })
                .collect::<Result<_>>()?;

            let key_attribute = match &dim.key_attribute {
                Some(key) => key.clone(),
                None => attributes[0].name.clone(),
            };
            let label_attribute = dim
                .label_attribute
                .clone()
                .unwrap_or_else(|| key_attribute.clone());
            for attr in [&key_attribute, &label_attribute] {
                if !dim.attributes.contains_key(attr) {
                    return Err(EngineError::validation(format!(
                        "dimension '{}' refers to unknown attribute '{}'",
                        name, attr
                    )));
                }
            }

            dimensions.push(Dimension {
                name: name.clone(),
                label: dim.label.clone().unwrap_or_else(|| name.clone()),
                attributes,
                key_attribute,
                label_attribute,
            });
        }

        let mut measures = Vec::with_capacity(spec.measures.len());
        for (name, measure) in &spec.measures {
            check_ref_name("measure", name)?;
            measures.push(Measure {
                name: name.clone(),
                label: measure.label.clone().unwrap_or_else(|| name.clone()),
                column: measure.column.clone(),
            });
        }

        Ok(Self {
            fact_table: fact_table.to_string(),
            dimensions,
            measures,
        })
    }

    /// Parses the schema and checks every referenced column against the fact table.
    pub fn bind(spec: &Value, fact_table: &str, fields: &[FieldSpec]) -> Result<Self> {
        let model = Self::parse(spec, fact_table)?;
        model.check_columns(fields)?;
        Ok(model)
    }

    pub fn check_columns(&self, fields: &[FieldSpec]) -> Result<()> {
        let find = |column: &str| fields.iter().find(|f| f.name == column);

        for dim in &self.dimensions {
            for attr in &dim.attributes {
                if find(&attr.column).is_none() {
                    return Err(EngineError::validation(format!(
                        "attribute '{}' refers to column '{}' which is not in fact table {}",
                        attr.reference(),
                        attr.column,
                        self.fact_table
                    )));
                }
            }
        }
        for measure in &self.measures {
            match find(&measure.column) {
                None => {
                    return Err(EngineError::validation(format!(
                        "measure '{}' refers to column '{}' which is not in fact table {}",
                        measure.name, measure.column, self.fact_table
                    )))
                }
                Some(field) if !field.field_type.is_numeric() => {
                    return Err(EngineError::validation(format!(
                        "measure '{}' refers to non-numeric column '{}' ({})",
                        measure.name, measure.column, field.field_type
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn fact_table(&self) -> &str {
        &self.fact_table
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn measures(&self) -> &[Measure] {
        &self.measures
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn measure(&self, name: &str) -> Option<&Measure> {
        self.measures.iter().find(|m| m.name == name)
    }

    /// Resolves `dimension` (its key attribute) or `dimension.attribute`.
    pub fn attribute(&self, reference: &str) -> Result<&Attribute> {
        let (dim_name, attr_name) = match reference.split_once('.') {
            Some((dim, attr)) => (dim, Some(attr)),
            None => (reference, None),
        };
        let dimension = self.dimension(dim_name).ok_or_else(|| {
            EngineError::validation(format!("unknown dimension reference '{}'", reference))
        })?;
        match attr_name {
            None => Ok(dimension.key()),
            Some(attr) => dimension.attribute(attr).ok_or_else(|| {
                EngineError::validation(format!("unknown attribute reference '{}'", reference))
            }),
        }
    }
}

/// Memo slot for a materialized model, tagged with the schema version it was
/// built from. A slot built for an older version is never handed out.
#[derive(Debug, Clone, Default)]
pub struct ModelCache {
    slot: Option<(u64, Arc<DimensionalModel>)>,
}

impl ModelCache {
    pub fn get(&self, version: u64) -> Option<Arc<DimensionalModel>> {
        match &self.slot {
            Some((built_for, model)) if *built_for == version => Some(model.clone()),
            _ => None,
        }
    }

    pub fn store(&mut self, version: u64, model: Arc<DimensionalModel>) {
        self.slot = Some((version, model));
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}
