use std::collections::HashMap;

use geo::{CoordsIter, Geometry, Intersects, Rect};
use serde::Deserialize;

use crate::{
    crs::crs_utils::ensure_same_crs,
    error::{Result, SpatialJoinError},
    geofile::{
        feature::{Feature, Fid},
        feature_collection::FeatureCollection,
    },
};

use super::{
    geometry::{expand_rect, finite_bounding_rect, geometry_distance, invalid_reason, summarize},
    index::SpatialIndex,
};

/// How many target matches a source feature may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    /// Targets are disjoint (e.g. census tracts): at most one match, a second one is an error.
    One,
    /// The first match in index order wins, further matches are ignored.
    First,
    /// Every match is kept.
    Many,
}

/// Exact test applied to each bounding-box candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Predicate {
    Intersects,
    /// Geometries are at most this far apart, in CRS units. Replaces buffering one side and
    /// intersecting.
    WithinDistance(f64),
}

impl Predicate {
    fn validate(&self) -> Result<()> {
        match self {
            Predicate::Intersects => Ok(()),
            Predicate::WithinDistance(distance) if distance.is_finite() && *distance >= 0.0 => {
                Ok(())
            }
            Predicate::WithinDistance(distance) => Err(SpatialJoinError::Configuration(format!(
                "join distance must be finite and non-negative, got {}",
                distance
            ))),
        }
    }

    fn query_rect(&self, rect: Rect) -> Rect {
        match self {
            Predicate::Intersects => rect,
            Predicate::WithinDistance(distance) => expand_rect(rect, *distance),
        }
    }

    fn matches(&self, source: &Geometry, target: &Geometry) -> bool {
        match self {
            Predicate::Intersects => source.intersects(target),
            Predicate::WithinDistance(distance) => geometry_distance(source, target)
                .map_or(false, |separation| separation <= *distance),
        }
    }
}

/// Result of an explicit lookup in a [`JoinMapping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMatch<'a> {
    Found(&'a [Fid]),
    NotFound,
}

/// Source fid to matching target fid(s). Sources without a match have no entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinMapping {
    Single(HashMap<Fid, Fid>),
    Multiple(HashMap<Fid, Vec<Fid>>),
}

impl JoinMapping {
    fn empty(cardinality: Cardinality) -> Self {
        match cardinality {
            Cardinality::One | Cardinality::First => JoinMapping::Single(HashMap::new()),
            Cardinality::Many => JoinMapping::Multiple(HashMap::new()),
        }
    }

    pub fn lookup(&self, source_fid: Fid) -> JoinMatch<'_> {
        let found = match self {
            JoinMapping::Single(mapping) => mapping.get(&source_fid).map(std::slice::from_ref),
            JoinMapping::Multiple(mapping) => mapping.get(&source_fid).map(Vec::as_slice),
        };
        match found {
            Some(fids) => JoinMatch::Found(fids),
            None => JoinMatch::NotFound,
        }
    }

    pub fn contains(&self, source_fid: Fid) -> bool {
        matches!(self.lookup(source_fid), JoinMatch::Found(_))
    }

    pub fn len(&self) -> usize {
        match self {
            JoinMapping::Single(mapping) => mapping.len(),
            JoinMapping::Multiple(mapping) => mapping.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_single(&self) -> bool {
        matches!(self, JoinMapping::Single(_))
    }
}

/// Join `source` against `target` with an intersection test. See [`join_with_predicate`].
pub fn join(
    source: &FeatureCollection,
    target: &FeatureCollection,
    target_index: &SpatialIndex,
    cardinality: Cardinality,
) -> Result<JoinMapping> {
    join_with_predicate(
        source,
        target,
        target_index,
        cardinality,
        Predicate::Intersects,
    )
}

/// Match every source feature against the target features whose bounding boxes overlap its own,
/// keeping the candidates that pass `predicate`.
///
/// The CRS of source, target and index must agree. Source features with a null or empty geometry
/// are skipped. Invalid geometries met during the exact test abort the join, as does a second
/// match under [`Cardinality::One`].
pub fn join_with_predicate(
    source: &FeatureCollection,
    target: &FeatureCollection,
    target_index: &SpatialIndex,
    cardinality: Cardinality,
    predicate: Predicate,
) -> Result<JoinMapping> {
    ensure_index_matches(source, target, target_index)?;
    predicate.validate()?;

    let mut mapping = JoinMapping::empty(cardinality);
    for source_feature in source.iter() {
        let source_geometry = match usable_source_geometry(source, source_feature)? {
            Some(geometry) => geometry,
            None => continue,
        };
        let source_rect = finite_bounding_rect(source_geometry).ok_or_else(|| {
            invalid_geometry(source_feature.fid, source_geometry, "geometry has no extent")
        })?;

        let mut matched: Vec<Fid> = Vec::new();
        for target_fid in target_index.query(&predicate.query_rect(source_rect)) {
            let target_feature = indexed_feature(target, target_index, target_fid)?;
            let target_geometry = match &target_feature.geometry {
                Some(geometry) => geometry,
                None => continue,
            };
            check_geometry(target_fid, target_geometry)?;
            if !predicate.matches(source_geometry, target_geometry) {
                continue;
            }
            matched.push(target_fid);
            if cardinality == Cardinality::First {
                break;
            }
        }

        if matched.is_empty() {
            continue;
        }
        match (&mut mapping, cardinality) {
            (JoinMapping::Single(_), Cardinality::One) if matched.len() > 1 => {
                return Err(SpatialJoinError::MultipleMatches {
                    source_fid: source_feature.fid,
                    target_fids: matched,
                });
            }
            (JoinMapping::Single(single), _) => {
                single.insert(source_feature.fid, matched[0]);
            }
            (JoinMapping::Multiple(multiple), _) => {
                multiple.insert(source_feature.fid, matched);
            }
        }
    }
    log::info!(
        "Matched {} of {} features of '{}' against '{}'",
        mapping.len(),
        source.len(),
        source.name(),
        target.name()
    );
    Ok(mapping)
}

/// CRS checks shared by every index-backed operation: source and target must agree, and the
/// index must have been built from `target`.
pub(super) fn ensure_index_matches(
    source: &FeatureCollection,
    target: &FeatureCollection,
    target_index: &SpatialIndex,
) -> Result<()> {
    ensure_same_crs(source.name(), source.crs(), target.name(), target.crs())?;
    if target_index.crs() != target.crs() || target_index.len() > target.len() {
        return Err(SpatialJoinError::IndexMismatch {
            index_name: target_index.collection_name().to_string(),
            target_name: target.name().to_string(),
            reason: format!(
                "index holds {} features, target has {}",
                target_index.len(),
                target.len()
            ),
        });
    }
    Ok(())
}

pub(super) fn indexed_feature<'a>(
    target: &'a FeatureCollection,
    target_index: &SpatialIndex,
    fid: Fid,
) -> Result<&'a Feature> {
    target.get(fid).ok_or_else(|| SpatialJoinError::IndexMismatch {
        index_name: target_index.collection_name().to_string(),
        target_name: target.name().to_string(),
        reason: format!("indexed feature {} is not in the target", fid),
    })
}

/// Geometry of a source feature that can take part in an index-backed operation. Null and empty
/// geometries are skipped with a warning, non-finite ones are an error.
pub(super) fn usable_source_geometry<'a>(
    source: &FeatureCollection,
    feature: &'a Feature,
) -> Result<Option<&'a Geometry>> {
    let geometry = match &feature.geometry {
        Some(geometry) => geometry,
        None => {
            log::warn!(
                "Skipping feature {} of '{}', it has no geometry",
                feature.fid,
                source.name()
            );
            return Ok(None);
        }
    };
    if geometry.coords_count() == 0 {
        log::warn!(
            "Skipping feature {} of '{}', its geometry is empty",
            feature.fid,
            source.name()
        );
        return Ok(None);
    }
    check_geometry(feature.fid, geometry)?;
    Ok(Some(geometry))
}

pub(super) fn check_geometry(fid: Fid, geometry: &Geometry) -> Result<()> {
    match invalid_reason(geometry) {
        Some(reason) => Err(invalid_geometry(fid, geometry, reason)),
        None => Ok(()),
    }
}

pub(super) fn invalid_geometry(fid: Fid, geometry: &Geometry, reason: &str) -> SpatialJoinError {
    SpatialJoinError::InvalidGeometry {
        fid,
        summary: summarize(geometry),
        reason: reason.to_string(),
    }
}
