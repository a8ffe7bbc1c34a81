use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use indicatif::ProgressBar;
use rayon::prelude::*;

use crate::{
    config::{Config, JoinConfig, LayerConfig},
    crs::crs_utils::ensure_same_crs,
    error::SpatialJoinError,
    geofile::{
        counts_csv::write_counts_csv,
        feature_collection::FeatureCollection,
        geojson::{read_feature_collection, write_feature_collection},
    },
    spatial::{
        annotate::{
            annotate, annotate_nearest_distance, count_by_fields, AnnotationSummary, RegionLookup,
        },
        index::SpatialIndex,
        join::{join_with_predicate, JoinMapping},
        nearest::nearest,
    },
};

const SOURCE_NAME: &str = "source";

/// What one run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Annotation results per output field, in join order.
    pub annotations: Vec<(String, AnnotationSummary)>,
    /// Number of features given a distance, per output field.
    pub distances: Vec<(String, usize)>,
    pub features_written: usize,
    pub counts_written: Option<usize>,
}

fn read_layer(name: &str, layer: &LayerConfig) -> anyhow::Result<FeatureCollection> {
    let schema = layer
        .schema()
        .with_context(|| format!("Fields of layer '{}'", name))?;
    read_feature_collection(&layer.path, name, layer.crs, schema.as_ref())
        .with_context(|| format!("Reading layer '{}'", name))
}

/// Run every configured join and distance against the source layer, then write the annotated
/// features and the optional counts table.
pub fn run(config: &Config) -> anyhow::Result<PipelineSummary> {
    let mut source = read_layer(SOURCE_NAME, &config.source)?;

    let mut layers: BTreeMap<&str, FeatureCollection> = BTreeMap::new();
    for name in config.used_layers() {
        let layer_config = config
            .layers
            .get(name)
            .ok_or_else(|| anyhow!("Layer '{}' is not declared", name))?;
        let layer = read_layer(name, layer_config)?;
        ensure_same_crs(source.name(), source.crs(), layer.name(), layer.crs())?;
        layers.insert(name, layer);
    }

    log::info!("Building spatial indexes for {} layers", layers.len());
    let indexes: BTreeMap<&str, SpatialIndex> = layers
        .par_iter()
        .map(|(name, layer)| (*name, SpatialIndex::build(layer)))
        .collect();

    let mut summary = PipelineSummary::default();
    for join_config in &config.joins {
        let mappings = join_lookups(&source, join_config, &layers, &indexes)?;
        let lookups = join_config
            .lookups
            .iter()
            .zip(&mappings)
            .map(|(lookup, mapping)| {
                Ok(RegionLookup {
                    target: layers
                        .get(lookup.layer.as_str())
                        .ok_or_else(|| anyhow!("Layer '{}' was not read", lookup.layer))?,
                    mapping,
                    field: lookup.field.clone(),
                    suffix: lookup.suffix.clone(),
                })
            })
            .collect::<anyhow::Result<Vec<RegionLookup>>>()?;
        let annotation = annotate(
            &mut source,
            &join_config.output_field,
            &lookups,
            join_config.on_missing,
        )
        .with_context(|| format!("Annotating '{}'", join_config.output_field))?;
        log::info!(
            "'{}': {} matched, {} by fallback, {} without a match",
            join_config.output_field,
            annotation.matched,
            annotation.fallback,
            annotation.missing
        );
        summary
            .annotations
            .push((join_config.output_field.clone(), annotation));
    }

    for distance_config in &config.distances {
        let layer_name = distance_config.layer.as_str();
        let (target, target_index) = match (layers.get(layer_name), indexes.get(layer_name)) {
            (Some(target), Some(target_index)) => (target, target_index),
            _ => return Err(anyhow!("Layer '{}' was not read", layer_name)),
        };
        let nearest = nearest(&source, target, target_index)
            .with_context(|| format!("Measuring '{}'", distance_config.output_field))?;
        let measured =
            annotate_nearest_distance(&mut source, &distance_config.output_field, &nearest)
                .with_context(|| format!("Annotating '{}'", distance_config.output_field))?;
        log::info!(
            "'{}': {} of {} features measured",
            distance_config.output_field,
            measured,
            source.len()
        );
        summary
            .distances
            .push((distance_config.output_field.clone(), measured));
    }

    write_feature_collection(&source, &config.output.features)?;
    summary.features_written = source.len();

    if let Some(counts_config) = &config.output.counts {
        let counts = count_by_fields(&source, &counts_config.fields)?;
        write_counts_csv(&counts, &counts_config.path, &counts_config.header)?;
        summary.counts_written = Some(counts.len());
    }
    Ok(summary)
}

/// Join the source against every lookup layer of one join, one mapping per lookup.
fn join_lookups(
    source: &FeatureCollection,
    join_config: &JoinConfig,
    layers: &BTreeMap<&str, FeatureCollection>,
    indexes: &BTreeMap<&str, SpatialIndex>,
) -> anyhow::Result<Vec<JoinMapping>> {
    log::info!(
        "Joining '{}' against {} layers",
        join_config.output_field,
        join_config.lookups.len()
    );
    let bar = ProgressBar::new(join_config.lookups.len() as u64);
    let mappings = join_config
        .lookups
        .par_iter()
        .map(|lookup| {
            let (target, target_index) = match (
                layers.get(lookup.layer.as_str()),
                indexes.get(lookup.layer.as_str()),
            ) {
                (Some(target), Some(target_index)) => (target, target_index),
                _ => {
                    return Err(SpatialJoinError::Configuration(format!(
                        "layer '{}' was not read",
                        lookup.layer
                    )))
                }
            };
            let mapping = join_with_predicate(
                source,
                target,
                target_index,
                join_config.cardinality,
                join_config.predicate(),
            );
            bar.inc(1);
            mapping
        })
        .collect::<Result<Vec<JoinMapping>, SpatialJoinError>>()
        .with_context(|| format!("Joining '{}'", join_config.output_field))?;
    bar.finish_and_clear();
    Ok(mappings)
}
