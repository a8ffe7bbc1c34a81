use std::borrow::Cow;

use geo::{BoundingRect, CoordsIter, EuclideanDistance, Geometry, LineString, Point, Polygon, Rect};

/// Bounding box of a geometry, `None` when the geometry is empty or has non-finite coordinates.
pub fn finite_bounding_rect(geometry: &Geometry) -> Option<Rect> {
    let rect = geometry.bounding_rect()?;
    let (min, max) = (rect.min(), rect.max());
    if [min.x, min.y, max.x, max.y].iter().all(|v| v.is_finite()) {
        Some(rect)
    } else {
        None
    }
}

/// Why a geometry cannot take part in an exact test, if it cannot.
pub fn invalid_reason(geometry: &Geometry) -> Option<&'static str> {
    if geometry.coords_count() == 0 {
        return Some("geometry is empty");
    }
    if geometry
        .coords_iter()
        .any(|coord| !coord.x.is_finite() || !coord.y.is_finite())
    {
        return Some("geometry has non-finite coordinates");
    }
    None
}

/// Grow a rectangle by `distance` on every side.
pub fn expand_rect(rect: Rect, distance: f64) -> Rect {
    Rect::new(
        (rect.min().x - distance, rect.min().y - distance),
        (rect.max().x + distance, rect.max().y + distance),
    )
}

/// Short description for error messages: geometry type, coordinate count and extent.
pub fn summarize(geometry: &Geometry) -> String {
    let kind = geometry_type_name(geometry);
    match geometry.bounding_rect() {
        Some(rect) => format!(
            "{} with {} coordinates, bbox ({}, {}, {}, {})",
            kind,
            geometry.coords_count(),
            rect.min().x,
            rect.min().y,
            rect.max().x,
            rect.max().y
        ),
        None => format!("empty {}", kind),
    }
}

pub fn geometry_type_name(geometry: &Geometry) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

/// A measurable piece of a geometry. Multi-geometries are split into their members, lines become
/// two-point line strings, rects and triangles become polygons.
enum Part<'a> {
    Point(Point),
    LineString(Cow<'a, LineString>),
    Polygon(Cow<'a, Polygon>),
}

fn collect_parts<'a>(geometry: &'a Geometry, parts: &mut Vec<Part<'a>>) {
    match geometry {
        Geometry::Point(point) => parts.push(Part::Point(*point)),
        Geometry::Line(line) => parts.push(Part::LineString(Cow::Owned(LineString::new(vec![
            line.start, line.end,
        ])))),
        Geometry::LineString(line_string) => push_line_string(line_string, parts),
        Geometry::Polygon(polygon) => push_polygon(polygon, parts),
        Geometry::MultiPoint(points) => parts.extend(points.iter().map(|point| Part::Point(*point))),
        Geometry::MultiLineString(line_strings) => {
            for line_string in line_strings.iter() {
                push_line_string(line_string, parts);
            }
        }
        Geometry::MultiPolygon(polygons) => {
            for polygon in polygons.iter() {
                push_polygon(polygon, parts);
            }
        }
        Geometry::Rect(rect) => parts.push(Part::Polygon(Cow::Owned(rect.to_polygon()))),
        Geometry::Triangle(triangle) => {
            parts.push(Part::Polygon(Cow::Owned(triangle.to_polygon())))
        }
        Geometry::GeometryCollection(collection) => {
            for member in collection.iter() {
                collect_parts(member, parts);
            }
        }
    }
}

fn push_line_string<'a>(line_string: &'a LineString, parts: &mut Vec<Part<'a>>) {
    match line_string.0.as_slice() {
        [] => {}
        [coord] => parts.push(Part::Point(Point::from(*coord))),
        _ => parts.push(Part::LineString(Cow::Borrowed(line_string))),
    }
}

fn push_polygon<'a>(polygon: &'a Polygon, parts: &mut Vec<Part<'a>>) {
    if !polygon.exterior().0.is_empty() {
        parts.push(Part::Polygon(Cow::Borrowed(polygon)));
    }
}

fn part_distance(a: &Part, b: &Part) -> f64 {
    match (a, b) {
        (Part::Point(a), Part::Point(b)) => a.euclidean_distance(b),
        (Part::Point(point), Part::LineString(line_string))
        | (Part::LineString(line_string), Part::Point(point)) => {
            point.euclidean_distance(&**line_string)
        }
        (Part::Point(point), Part::Polygon(polygon))
        | (Part::Polygon(polygon), Part::Point(point)) => point.euclidean_distance(&**polygon),
        (Part::LineString(a), Part::LineString(b)) => (**a).euclidean_distance(&**b),
        (Part::LineString(line_string), Part::Polygon(polygon))
        | (Part::Polygon(polygon), Part::LineString(line_string)) => {
            (**line_string).euclidean_distance(&**polygon)
        }
        (Part::Polygon(a), Part::Polygon(b)) => (**a).euclidean_distance(&**b),
    }
}

/// Smallest Euclidean distance between two geometries, zero when they touch, cross or one lies
/// inside the other. `None` when either geometry has no coordinates.
pub fn geometry_distance(a: &Geometry, b: &Geometry) -> Option<f64> {
    let mut a_parts = Vec::new();
    collect_parts(a, &mut a_parts);
    let mut b_parts = Vec::new();
    collect_parts(b, &mut b_parts);
    a_parts
        .iter()
        .flat_map(|a_part| b_parts.iter().map(move |b_part| part_distance(a_part, b_part)))
        .min_by(|x, y| x.total_cmp(y))
}
