use geo::{Point, Rect};
use rstar::{
    primitives::{GeomWithData, Rectangle},
    PointDistance, RTree, AABB,
};

use crate::{
    crs::crs_utils::Crs,
    geofile::{feature::Fid, feature_collection::FeatureCollection},
};

use super::geometry::finite_bounding_rect;

type IndexedEnvelope = GeomWithData<Rectangle<[f64; 2]>, Fid>;

/// R-tree over the bounding boxes of a feature collection. Answers which features *might*
/// intersect a query box; exact tests are left to the join.
pub struct SpatialIndex {
    rtree: RTree<IndexedEnvelope>,
    skipped: Vec<Fid>,
    collection_name: String,
    crs: Option<Crs>,
}

impl SpatialIndex {
    /// Index every feature of `features` by its bounding box.
    ///
    /// Features with a null, empty or non-finite geometry are skipped with a warning and never
    /// take part in a join. An empty collection gives an index that answers every query with no
    /// candidates.
    pub fn build(features: &FeatureCollection) -> Self {
        let mut skipped = Vec::new();
        let mut envelopes = Vec::with_capacity(features.len());
        for feature in features.iter() {
            match feature.geometry.as_ref().and_then(finite_bounding_rect) {
                Some(rect) => envelopes.push(IndexedEnvelope::new(
                    Rectangle::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                    feature.fid,
                )),
                None => {
                    log::warn!(
                        "Feature {} of '{}' has a null, empty or invalid geometry, it will not be indexed",
                        feature.fid,
                        features.name()
                    );
                    skipped.push(feature.fid);
                }
            }
        }
        log::debug!(
            "Indexed {} of {} features of '{}'",
            envelopes.len(),
            features.len(),
            features.name()
        );
        Self {
            rtree: RTree::bulk_load(envelopes),
            skipped,
            collection_name: features.name().to_string(),
            crs: features.crs(),
        }
    }

    /// Fids of the indexed features whose bounding box intersects `bbox`, in the tree's native
    /// order. Each call starts a fresh traversal.
    pub fn query(&self, bbox: &Rect) -> impl Iterator<Item = Fid> + '_ {
        let envelope =
            AABB::from_corners([bbox.min().x, bbox.min().y], [bbox.max().x, bbox.max().y]);
        self.rtree
            .locate_in_envelope_intersecting(&envelope)
            .map(|entry| entry.data)
    }

    /// Indexed fids ordered by the distance from `point` to their bounding box, nearest first,
    /// together with that distance. It is a lower bound of the distance to the geometry itself.
    pub fn nearest_by_bbox(&self, point: &Point) -> impl Iterator<Item = (Fid, f64)> + '_ {
        let query_point = [point.x(), point.y()];
        self.rtree
            .nearest_neighbor_iter(&query_point)
            .map(move |entry| (entry.data, entry.geom().distance_2(&query_point).sqrt()))
    }

    /// Bounding box around every indexed feature, `None` for an empty index.
    pub fn extent(&self) -> Option<Rect> {
        if self.is_empty() {
            return None;
        }
        let envelope = self.rtree.root().envelope();
        Some(Rect::new(
            (envelope.lower()[0], envelope.lower()[1]),
            (envelope.upper()[0], envelope.upper()[1]),
        ))
    }

    /// Number of indexed features.
    pub fn len(&self) -> usize {
        self.rtree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.rtree.size() == 0
    }

    /// Fids left out of the index because their geometry was unusable.
    pub fn skipped(&self) -> &[Fid] {
        &self.skipped
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn crs(&self) -> Option<Crs> {
        self.crs
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use approx::assert_abs_diff_eq;
    use geo::{point, polygon, Geometry, LineString, Rect};
    use rstest::rstest;

    use crate::geofile::{
        feature::{Feature, Fid, Schema},
        feature_collection::FeatureCollection,
    };

    use super::SpatialIndex;

    fn square(min_x: f64, min_y: f64, size: f64) -> Geometry {
        Geometry::Polygon(polygon![
            (x: min_x, y: min_y),
            (x: min_x + size, y: min_y),
            (x: min_x + size, y: min_y + size),
            (x: min_x, y: min_y + size),
        ])
    }

    fn grid_of_squares() -> FeatureCollection {
        let mut squares = FeatureCollection::new("squares", None, Schema::new());
        for row in 0..10 {
            for column in 0..10 {
                let fid = (row * 10 + column) as Fid;
                let geometry = square(column as f64 * 2.0, row as f64 * 2.0, 1.0);
                squares.insert(Feature::new(fid, Some(geometry))).unwrap();
            }
        }
        squares
    }

    #[rstest]
    #[case(Rect::new((-100.0, -100.0), (100.0, 100.0)))]
    #[case(Rect::new((0.0, 0.0), (0.0, 0.0)))]
    #[case(Rect::new((f64::MIN, f64::MIN), (f64::MAX, f64::MAX)))]
    fn test_empty_index_returns_no_candidates(#[case] bbox: Rect) {
        let empty = FeatureCollection::new("empty", None, Schema::new());
        let index = SpatialIndex::build(&empty);
        assert!(index.is_empty());
        assert_eq!(0, index.query(&bbox).count());
    }

    #[test]
    fn test_every_feature_is_indexed_once() {
        let squares = grid_of_squares();
        let index = SpatialIndex::build(&squares);
        assert_eq!(squares.len(), index.len());

        let everything = Rect::new((-1.0, -1.0), (100.0, 100.0));
        let mut fids: Vec<Fid> = index.query(&everything).collect();
        fids.sort();
        assert_eq!((0..100).collect::<Vec<Fid>>(), fids);
    }

    #[rstest]
    #[case(Rect::new((0.5, 0.5), (0.6, 0.6)), vec![0])]
    #[case(Rect::new((1.0, 1.0), (2.0, 2.0)), vec![0, 1, 10, 11])]
    #[case(Rect::new((1.2, 1.2), (1.8, 1.8)), vec![])]
    #[case(Rect::new((18.0, 18.0), (30.0, 30.0)), vec![99])]
    fn test_query_returns_overlapping_boxes(#[case] bbox: Rect, #[case] expected: Vec<Fid>) {
        let index = SpatialIndex::build(&grid_of_squares());
        let fids: HashSet<Fid> = index.query(&bbox).collect();
        assert_eq!(expected.into_iter().collect::<HashSet<Fid>>(), fids);
    }

    #[test]
    fn test_query_is_restartable() {
        let index = SpatialIndex::build(&grid_of_squares());
        let bbox = Rect::new((1.0, 1.0), (2.0, 2.0));
        let first: HashSet<Fid> = index.query(&bbox).collect();
        let second: HashSet<Fid> = index.query(&bbox).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_nearest_by_bbox_is_ordered_by_box_distance() {
        let index = SpatialIndex::build(&grid_of_squares());
        let nearest: Vec<(Fid, f64)> = index
            .nearest_by_bbox(&point!(x: 4.5, y: -3.0))
            .take(3)
            .collect();
        assert_eq!(2, nearest[0].0);
        assert_abs_diff_eq!(3.0, nearest[0].1, epsilon = 1e-9);
        assert!(nearest.windows(2).all(|pair| pair[0].1 <= pair[1].1));

        let empty = SpatialIndex::build(&FeatureCollection::new("empty", None, Schema::new()));
        assert_eq!(0, empty.nearest_by_bbox(&point!(x: 0.0, y: 0.0)).count());
    }

    #[test]
    fn test_extent_covers_all_features() {
        let index = SpatialIndex::build(&grid_of_squares());
        assert_eq!(Some(Rect::new((0.0, 0.0), (19.0, 19.0))), index.extent());
        let empty = SpatialIndex::build(&FeatureCollection::new("empty", None, Schema::new()));
        assert_eq!(None, empty.extent());
    }

    #[test]
    fn test_null_and_empty_geometries_are_skipped() {
        let mut features = FeatureCollection::new("stops", None, Schema::new());
        features
            .insert(Feature::new(1, Some(square(0.0, 0.0, 1.0))))
            .unwrap();
        features.insert(Feature::new(2, None)).unwrap();
        features
            .insert(Feature::new(
                3,
                Some(Geometry::LineString(LineString::new(vec![]))),
            ))
            .unwrap();
        features
            .insert(Feature::new(
                4,
                Some(Geometry::Point(geo::Point::new(f64::INFINITY, 0.0))),
            ))
            .unwrap();

        let index = SpatialIndex::build(&features);
        assert_eq!(1, index.len());
        assert_eq!(&[2, 3, 4], index.skipped());
    }
}
