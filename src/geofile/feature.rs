use std::{collections::HashMap, fmt};

use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::{Result, SpatialJoinError};

/// Feature identifier, unique within one collection for the lifetime of a run.
pub type Fid = u64;

/// Semantic type of a feature attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Str,
    Int,
    Float,
    Date,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Str => "str",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Date => "date",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    Null,
}

impl FieldValue {
    /// Type of the value, `None` for `Null` which fits every field.
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            FieldValue::Str(_) => Some(FieldType::Str),
            FieldValue::Int(_) => Some(FieldType::Int),
            FieldValue::Float(_) => Some(FieldType::Float),
            FieldValue::Date(_) => Some(FieldType::Date),
            FieldValue::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(value) => write!(f, "{}", value),
            FieldValue::Int(value) => write!(f, "{}", value),
            FieldValue::Float(value) => write!(f, "{}", value),
            FieldValue::Date(value) => write!(f, "{}", value.format("%Y-%m-%d")),
            FieldValue::Null => Ok(()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        FieldValue::Date(value)
    }
}

/// Ordered declaration of the attributes carried by the features of one collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: Vec<(String, FieldType)>,
}

impl Schema {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Build a schema from `(name, type)` pairs, rejecting repeated names.
    pub fn from_fields<S: Into<String>>(
        fields: impl IntoIterator<Item = (S, FieldType)>,
    ) -> Result<Self> {
        let mut schema = Self::new();
        for (name, field_type) in fields {
            schema.add_field(name, field_type)?;
        }
        Ok(schema)
    }

    pub fn add_field(&mut self, name: impl Into<String>, field_type: FieldType) -> Result<()> {
        let name = name.into();
        if self.field_type(&name).is_some() {
            return Err(SpatialJoinError::DuplicateField { field: name });
        }
        self.fields.push((name, field_type));
        Ok(())
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|(field_name, _)| field_name == name)
            .map(|(_, field_type)| *field_type)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldType)> {
        self.fields
            .iter()
            .map(|(name, field_type)| (name.as_str(), *field_type))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub fid: Fid,
    /// `None` for a null geometry. Such features are kept but never take part in a join.
    pub geometry: Option<geo::Geometry>,
    properties: HashMap<String, FieldValue>,
}

impl Feature {
    pub fn new(fid: Fid, geometry: Option<geo::Geometry>) -> Self {
        Self {
            fid,
            geometry,
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Raw property access. Prefer `FeatureCollection::value`, which checks the name against the
    /// schema.
    pub fn property(&self, name: &str) -> Option<&FieldValue> {
        self.properties.get(name)
    }

    /// Check the properties against `schema`: unknown names and wrong types are errors, declared
    /// fields that are missing become `Null`.
    pub(crate) fn conform_to(&mut self, schema: &Schema, collection: &str) -> Result<()> {
        for (name, value) in &self.properties {
            let expected = schema
                .field_type(name)
                .ok_or_else(|| SpatialJoinError::UnknownField {
                    field: name.clone(),
                    collection: collection.to_string(),
                })?;
            if let Some(found) = value.field_type() {
                if found != expected {
                    return Err(SpatialJoinError::TypeMismatch {
                        fid: self.fid,
                        field: name.clone(),
                        expected,
                        found,
                    });
                }
            }
        }
        for (name, _) in schema.fields() {
            self.properties
                .entry(name.to_string())
                .or_insert(FieldValue::Null);
        }
        Ok(())
    }

    pub(crate) fn set_property(&mut self, name: &str, value: FieldValue) {
        self.properties.insert(name.to_string(), value);
    }
}
