use std::collections::HashMap;

use crate::{
    crs::crs_utils::Crs,
    error::{Result, SpatialJoinError},
};

use super::feature::{Feature, FieldType, FieldValue, Fid, Schema};

/// Features from one input source, kept in insertion order and addressable by fid.
#[derive(Debug, Clone)]
pub struct FeatureCollection {
    name: String,
    crs: Option<Crs>,
    schema: Schema,
    features: Vec<Feature>,
    positions: HashMap<Fid, usize>,
}

impl FeatureCollection {
    /// Create an empty collection. `name` only appears in log and error messages.
    pub fn new(name: impl Into<String>, crs: Option<Crs>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            crs,
            schema,
            features: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn crs(&self) -> Option<Crs> {
        self.crs
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Add a feature after validating its properties against the schema.
    pub fn insert(&mut self, mut feature: Feature) -> Result<()> {
        if self.positions.contains_key(&feature.fid) {
            return Err(SpatialJoinError::DuplicateFid {
                fid: feature.fid,
                collection: self.name.clone(),
            });
        }
        feature.conform_to(&self.schema, &self.name)?;
        self.positions.insert(feature.fid, self.features.len());
        self.features.push(feature);
        Ok(())
    }

    pub fn get(&self, fid: Fid) -> Option<&Feature> {
        self.positions
            .get(&fid)
            .and_then(|position| self.features.get(*position))
    }

    pub fn contains(&self, fid: Fid) -> bool {
        self.positions.contains_key(&fid)
    }

    /// Features in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }

    /// Schema-checked attribute access. A misspelled field name is an error rather than a miss.
    pub fn value(&self, fid: Fid, field: &str) -> Result<Option<&FieldValue>> {
        self.ensure_field(field)?;
        Ok(self.get(fid).and_then(|feature| feature.property(field)))
    }

    pub fn ensure_field(&self, field: &str) -> Result<FieldType> {
        self.schema
            .field_type(field)
            .ok_or_else(|| SpatialJoinError::UnknownField {
                field: field.to_string(),
                collection: self.name.clone(),
            })
    }

    /// Declare a new attribute. Existing features get `Null` for it. Declaring a field that already
    /// exists with the same type is a no-op.
    pub fn add_field(&mut self, name: &str, field_type: FieldType) -> Result<()> {
        if let Some(existing) = self.schema.field_type(name) {
            if existing == field_type {
                return Ok(());
            }
            return Err(SpatialJoinError::DuplicateField {
                field: name.to_string(),
            });
        }
        self.schema.add_field(name, field_type)?;
        for feature in self.features.iter_mut() {
            feature.set_property(name, FieldValue::Null);
        }
        Ok(())
    }

    /// Set an attribute on an existing feature, type-checked against the schema.
    pub fn set_value(&mut self, fid: Fid, field: &str, value: FieldValue) -> Result<()> {
        let expected = self.ensure_field(field)?;
        if let Some(found) = value.field_type() {
            if found != expected {
                return Err(SpatialJoinError::TypeMismatch {
                    fid,
                    field: field.to_string(),
                    expected,
                    found,
                });
            }
        }
        let position = *self.positions.get(&fid).ok_or_else(|| {
            SpatialJoinError::Configuration(format!(
                "feature {} does not exist in '{}'",
                fid, self.name
            ))
        })?;
        self.features[position].set_property(field, value);
        Ok(())
    }

    /// Keep only the features for which `keep` returns true, preserving order.
    pub fn retain(&mut self, mut keep: impl FnMut(&Feature) -> bool) {
        self.features.retain(|feature| keep(feature));
        self.positions = self
            .features
            .iter()
            .enumerate()
            .map(|(position, feature)| (feature.fid, position))
            .collect();
    }
}
