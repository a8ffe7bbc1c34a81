use std::collections::HashMap;

use geo::{Geometry, Point};

use crate::{
    error::Result,
    geofile::{feature::Fid, feature_collection::FeatureCollection},
};

use super::{
    geometry::{expand_rect, finite_bounding_rect, geometry_distance},
    index::SpatialIndex,
    join::{
        check_geometry, ensure_index_matches, indexed_feature, invalid_geometry,
        usable_source_geometry,
    },
};

/// The target feature closest to a source feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestMatch {
    pub fid: Fid,
    pub distance: f64,
}

/// For every source feature, the nearest target feature and the exact distance to it.
///
/// Point sources walk the index in order of bounding box distance and stop as soon as no box
/// can hold anything closer. Other geometries search a window around their bounding box that
/// doubles until it is known to contain the nearest target. On ties the candidate seen first
/// wins. Sources with a null or empty geometry, and every source when the target is empty, have
/// no entry.
pub fn nearest(
    source: &FeatureCollection,
    target: &FeatureCollection,
    target_index: &SpatialIndex,
) -> Result<HashMap<Fid, NearestMatch>> {
    ensure_index_matches(source, target, target_index)?;

    let mut nearest = HashMap::with_capacity(source.len());
    for source_feature in source.iter() {
        let source_geometry = match usable_source_geometry(source, source_feature)? {
            Some(geometry) => geometry,
            None => continue,
        };
        let found = match source_geometry {
            Geometry::Point(point) => {
                nearest_to_point(point, source_geometry, target, target_index)?
            }
            _ => nearest_in_window(source_feature.fid, source_geometry, target, target_index)?,
        };
        if let Some(found) = found {
            nearest.insert(source_feature.fid, found);
        }
    }
    log::info!(
        "Found the nearest feature of '{}' for {} of {} features of '{}'",
        target.name(),
        nearest.len(),
        source.len(),
        source.name()
    );
    Ok(nearest)
}

fn target_distance(
    source_geometry: &Geometry,
    target: &FeatureCollection,
    target_index: &SpatialIndex,
    target_fid: Fid,
) -> Result<Option<f64>> {
    match &indexed_feature(target, target_index, target_fid)?.geometry {
        Some(geometry) => {
            check_geometry(target_fid, geometry)?;
            Ok(geometry_distance(source_geometry, geometry))
        }
        None => Ok(None),
    }
}

fn keep_closer(best: &mut Option<NearestMatch>, fid: Fid, distance: f64) {
    if best.map_or(true, |best| distance < best.distance) {
        *best = Some(NearestMatch { fid, distance });
    }
}

fn nearest_to_point(
    point: &Point,
    source_geometry: &Geometry,
    target: &FeatureCollection,
    target_index: &SpatialIndex,
) -> Result<Option<NearestMatch>> {
    let mut best: Option<NearestMatch> = None;
    for (target_fid, bbox_distance) in target_index.nearest_by_bbox(point) {
        if best.map_or(false, |best| best.distance <= bbox_distance) {
            break;
        }
        if let Some(distance) =
            target_distance(source_geometry, target, target_index, target_fid)?
        {
            keep_closer(&mut best, target_fid, distance);
        }
    }
    Ok(best)
}

fn nearest_in_window(
    source_fid: Fid,
    source_geometry: &Geometry,
    target: &FeatureCollection,
    target_index: &SpatialIndex,
) -> Result<Option<NearestMatch>> {
    let extent = match target_index.extent() {
        Some(extent) => extent,
        None => return Ok(None),
    };
    let source_rect = finite_bounding_rect(source_geometry).ok_or_else(|| {
        invalid_geometry(source_fid, source_geometry, "geometry has no extent")
    })?;

    // Start from the gap between the source box and the index extent.
    let gap_x = (extent.min().x - source_rect.max().x)
        .max(source_rect.min().x - extent.max().x)
        .max(0.0);
    let gap_y = (extent.min().y - source_rect.max().y)
        .max(source_rect.min().y - extent.max().y)
        .max(0.0);
    let mut radius = gap_x
        .hypot(gap_y)
        .max(extent.width().max(extent.height()) / 64.0);
    if radius <= 0.0 {
        radius = 1.0;
    }

    loop {
        let window = expand_rect(source_rect, radius);
        let mut best: Option<NearestMatch> = None;
        for target_fid in target_index.query(&window) {
            if let Some(distance) =
                target_distance(source_geometry, target, target_index, target_fid)?
            {
                keep_closer(&mut best, target_fid, distance);
            }
        }
        // Anything within `radius` of the source has a box inside the window.
        if best.map_or(false, |best| best.distance <= radius) {
            return Ok(best);
        }
        let covers_extent = window.min().x <= extent.min().x
            && window.min().y <= extent.min().y
            && window.max().x >= extent.max().x
            && window.max().y >= extent.max().y;
        if covers_extent {
            return Ok(best);
        }
        radius *= 2.0;
    }
}
