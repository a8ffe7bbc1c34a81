use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fs::read_to_string,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use serde::Deserialize;

use crate::{
    crs::crs_utils::Crs,
    geofile::feature::{FieldType, Schema},
    spatial::{
        annotate::MissingMatchPolicy,
        join::{Cardinality, Predicate},
    },
};

/// One declared attribute of a layer, e.g. `{name: geoid, type: str}`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// A GeoJSON input. Without `fields` the schema is inferred from the file.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct LayerConfig {
    pub path: PathBuf,
    /// Overrides the CRS declared in the file.
    #[serde(default)]
    pub crs: Option<Crs>,
    /// Fields to load, in output order. Properties not listed are ignored.
    #[serde(default)]
    pub fields: Option<Vec<FieldConfig>>,
}

impl LayerConfig {
    /// The declared schema, `None` when it should be inferred.
    pub fn schema(&self) -> anyhow::Result<Option<Schema>> {
        match &self.fields {
            Some(fields) => Ok(Some(Schema::from_fields(
                fields
                    .iter()
                    .map(|field| (field.name.clone(), field.field_type)),
            )?)),
            None => Ok(None),
        }
    }
}

/// One step of a fallback chain: copy `field` from the matching feature of `layer`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct LookupConfig {
    pub layer: String,
    pub field: String,
    /// Appended to the copied value, e.g. " County".
    #[serde(default)]
    pub suffix: Option<String>,
}

/// One output attribute, filled from the first lookup layer that matches.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct JoinConfig {
    pub output_field: String,
    /// How many targets a source feature may match, see `Cardinality`.
    pub cardinality: Cardinality,
    /// Match within this distance instead of by intersection.
    #[serde(default)]
    pub distance: Option<f64>,
    pub on_missing: MissingMatchPolicy,
    pub lookups: Vec<LookupConfig>,
}

impl JoinConfig {
    /// Within-distance when `distance` is set, intersection otherwise.
    pub fn predicate(&self) -> Predicate {
        match self.distance {
            Some(distance) => Predicate::WithinDistance(distance),
            None => Predicate::Intersects,
        }
    }
}

/// Distance from every source feature to the nearest feature of `layer`, written to the float
/// field `output_field`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DistanceConfig {
    pub output_field: String,
    pub layer: String,
}

/// Counts of features per distinct value of `fields`, written as a two column CSV.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CountsConfig {
    pub path: PathBuf,
    pub fields: Vec<String>,
    pub header: [String; 2],
}

/// Where the results of a run go.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct OutputConfig {
    /// GeoJSON file receiving the annotated source features.
    pub features: PathBuf,
    #[serde(default)]
    pub counts: Option<CountsConfig>,
}

/// One run: the source layer, the reference layers, and what to derive from them.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub source: LayerConfig,
    /// Reference layers by name.
    pub layers: BTreeMap<String, LayerConfig>,
    #[serde(default)]
    pub joins: Vec<JoinConfig>,
    #[serde(default)]
    pub distances: Vec<DistanceConfig>,
    pub output: OutputConfig,
}

impl Config {
    /// Read and validate a YAML config. Relative paths are taken relative to the config file.
    pub fn from_file(config_filepath: &Path) -> anyhow::Result<Self> {
        if !config_filepath.exists() {
            return Err(anyhow!("Config file {:?} not found", config_filepath));
        }
        let config_contents = read_to_string(config_filepath)
            .with_context(|| format!("Reading config file {:?}", config_filepath))?;
        let mut config = Self::from_yaml(&config_contents)?;
        if let Some(config_dir) = config_filepath.parent() {
            config.resolve_paths(config_dir);
        }
        Ok(config)
    }

    /// Parse and validate without touching the filesystem. Paths stay as written.
    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(contents).context("Parsing config")?;
        config.validate()?;
        Ok(config)
    }

    /// Names of the layers that some join or distance uses, in name order.
    pub fn used_layers(&self) -> BTreeSet<&str> {
        self.joins
            .iter()
            .flat_map(|join| join.lookups.iter().map(|lookup| lookup.layer.as_str()))
            .chain(self.distances.iter().map(|distance| distance.layer.as_str()))
            .collect()
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.joins.is_empty() && self.distances.is_empty() {
            return Err(anyhow!("At least one join or distance must be configured"));
        }
        let mut output_fields = HashSet::new();
        for join in &self.joins {
            if !output_fields.insert(join.output_field.as_str()) {
                return Err(anyhow!(
                    "Output field '{}' is produced by more than one join",
                    join.output_field
                ));
            }
            if join.lookups.is_empty() {
                return Err(anyhow!("Join '{}' has no lookups", join.output_field));
            }
            if let Some(distance) = join.distance {
                if !distance.is_finite() || distance < 0.0 {
                    return Err(anyhow!(
                        "Join '{}' distance must be finite and non-negative, got {}",
                        join.output_field,
                        distance
                    ));
                }
            }
            for lookup in &join.lookups {
                if !self.layers.contains_key(&lookup.layer) {
                    return Err(anyhow!(
                        "Join '{}' looks up undeclared layer '{}'",
                        join.output_field,
                        lookup.layer
                    ));
                }
            }
        }
        for distance in &self.distances {
            if !output_fields.insert(distance.output_field.as_str()) {
                return Err(anyhow!(
                    "Output field '{}' is produced more than once",
                    distance.output_field
                ));
            }
            if !self.layers.contains_key(&distance.layer) {
                return Err(anyhow!(
                    "Distance '{}' measures to undeclared layer '{}'",
                    distance.output_field,
                    distance.layer
                ));
            }
        }
        for (name, layer) in &self.layers {
            layer
                .schema()
                .with_context(|| format!("Fields of layer '{}'", name))?;
        }
        if let Some(source_schema) = self.source.schema().context("Fields of source")? {
            if let Some(counts) = &self.output.counts {
                for field in &counts.fields {
                    if source_schema.field_type(field).is_none()
                        && !output_fields.contains(field.as_str())
                    {
                        return Err(anyhow!(
                            "Counted field '{}' is neither a source field nor an output field",
                            field
                        ));
                    }
                }
            }
        }
        let used = self.used_layers();
        for name in self.layers.keys() {
            if !used.contains(name.as_str()) {
                log::warn!("Layer '{}' is declared but not used by any join", name);
            }
        }
        Ok(())
    }

    fn resolve_paths(&mut self, config_dir: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = config_dir.join(&*path);
            }
        };
        resolve(&mut self.source.path);
        for layer in self.layers.values_mut() {
            resolve(&mut layer.path);
        }
        resolve(&mut self.output.features);
        if let Some(counts) = &mut self.output.counts {
            resolve(&mut counts.path);
        }
    }
}
