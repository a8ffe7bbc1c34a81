use std::{fs, path::Path};

use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use geojson::{feature::Id, GeoJson};
use serde_json::{json, Map, Value};

use crate::crs::crs_utils::Crs;

use super::{
    feature::{Feature, FieldType, FieldValue, Fid, Schema},
    feature_collection::FeatureCollection,
};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Read a GeoJSON FeatureCollection from `filepath`.
///
/// Numeric feature ids become fids when every feature has one, otherwise features are numbered
/// from zero in file order. `crs` overrides a legacy "crs" member in the file. Only the fields of
/// `schema` are loaded; without a schema one is inferred from the property values.
pub fn read_feature_collection(
    filepath: &Path,
    name: &str,
    crs: Option<Crs>,
    schema: Option<&Schema>,
) -> anyhow::Result<FeatureCollection> {
    let contents = fs::read_to_string(filepath)
        .with_context(|| format!("Reading GeoJSON file {:?}", filepath))?;
    let geojson_features = match contents
        .parse::<GeoJson>()
        .with_context(|| format!("Parsing {:?} as GeoJSON", filepath))?
    {
        GeoJson::FeatureCollection(feature_collection) => feature_collection,
        GeoJson::Feature(_) | GeoJson::Geometry(_) => {
            return Err(anyhow!(
                "{:?} must contain a FeatureCollection",
                filepath
            ))
        }
    };

    let file_crs = match &geojson_features.foreign_members {
        Some(members) => crs_from_member(members)?,
        None => None,
    };
    let crs = match (crs, file_crs) {
        (Some(configured), Some(declared)) if configured != declared => {
            log::warn!(
                "{:?} declares {} but {} is configured, using {}",
                filepath,
                declared,
                configured,
                configured
            );
            Some(configured)
        }
        (configured, declared) => configured.or(declared),
    };

    let schema = match schema {
        Some(schema) => schema.clone(),
        None => infer_schema(&geojson_features.features)?,
    };

    let numeric_ids: Option<Vec<Fid>> = geojson_features
        .features
        .iter()
        .map(|feature| match &feature.id {
            Some(Id::Number(number)) => number.as_u64(),
            _ => None,
        })
        .collect();

    let mut collection = FeatureCollection::new(name, crs, schema.clone());
    for (position, geojson_feature) in geojson_features.features.into_iter().enumerate() {
        let fid = match &numeric_ids {
            Some(ids) => ids[position],
            None => position as Fid,
        };
        let geometry = match geojson_feature.geometry {
            Some(geometry) => Some(
                geo::Geometry::<f64>::try_from(geometry)
                    .map_err(|err| anyhow!("Could not decode geometry of feature {}, {}", fid, err))?,
            ),
            None => None,
        };
        let mut feature = Feature::new(fid, geometry);
        if let Some(properties) = &geojson_feature.properties {
            for (field, field_type) in schema.fields() {
                let value = match properties.get(field) {
                    Some(value) => json_to_field_value(value, field_type)
                        .with_context(|| format!("Feature {} field '{}'", fid, field))?,
                    None => FieldValue::Null,
                };
                feature = feature.with_property(field, value);
            }
        }
        collection.insert(feature)?;
    }
    log::info!(
        "Read {} features from {:?} ({})",
        collection.len(),
        filepath,
        crs.map_or("unknown CRS".to_string(), |crs| crs.to_string())
    );
    Ok(collection)
}

/// Write `collection` as a GeoJSON FeatureCollection, properties in schema order.
pub fn write_feature_collection(
    collection: &FeatureCollection,
    output_filepath: &Path,
) -> anyhow::Result<()> {
    let features: Vec<geojson::Feature> = collection
        .iter()
        .map(|feature| {
            let mut properties = Map::new();
            for (field, _) in collection.schema().fields() {
                let value = feature.property(field).unwrap_or(&FieldValue::Null);
                properties.insert(field.to_string(), field_value_to_json(value));
            }
            geojson::Feature {
                bbox: None,
                geometry: feature.geometry.as_ref().map(geojson::Geometry::from),
                id: Some(Id::Number(feature.fid.into())),
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    let foreign_members = collection.crs().map(|crs| {
        let mut members = Map::new();
        members.insert(
            "crs".to_string(),
            json!({
                "type": "name",
                "properties": {"name": format!("urn:ogc:def:crs:EPSG::{}", crs.epsg_code())}
            }),
        );
        members
    });
    let feature_collection = geojson::FeatureCollection {
        bbox: None,
        features,
        foreign_members,
    };

    log::info!(
        "Writing {} features to {:?}",
        collection.len(),
        output_filepath
    );
    let geojson_contents = GeoJson::from(feature_collection);
    fs::write(output_filepath, geojson_contents.to_string())
        .with_context(|| format!("Writing GeoJSON file {:?}", output_filepath))
}

/// Read the legacy `"crs": {"type": "name", "properties": {"name": ...}}` member.
fn crs_from_member(members: &Map<String, Value>) -> anyhow::Result<Option<Crs>> {
    match members
        .get("crs")
        .and_then(|crs| crs.pointer("/properties/name"))
        .and_then(Value::as_str)
    {
        Some(name) => Ok(Some(name.parse()?)),
        None => Ok(None),
    }
}

/// Derive a schema from the first non-null value of every property. Integer fields that later
/// hold a fractional number become float fields. Booleans, arrays and objects are not supported
/// and are left out.
fn infer_schema(features: &[geojson::Feature]) -> anyhow::Result<Schema> {
    let mut fields: Vec<(String, FieldType)> = Vec::new();
    for properties in features.iter().filter_map(|feature| feature.properties.as_ref()) {
        for (name, value) in properties {
            let inferred = match value {
                Value::String(_) => FieldType::Str,
                Value::Number(number) if number.is_i64() || number.is_u64() => FieldType::Int,
                Value::Number(_) => FieldType::Float,
                _ => continue,
            };
            match fields.iter_mut().find(|(field, _)| field == name) {
                Some((_, field_type)) => {
                    if *field_type == FieldType::Int && inferred == FieldType::Float {
                        *field_type = FieldType::Float;
                    } else if *field_type != inferred
                        && !(*field_type == FieldType::Float && inferred == FieldType::Int)
                    {
                        return Err(anyhow!(
                            "Property '{}' holds both {} and {} values",
                            name,
                            field_type,
                            inferred
                        ));
                    }
                }
                None => fields.push((name.clone(), inferred)),
            }
        }
    }
    Ok(Schema::from_fields(fields)?)
}

fn json_to_field_value(value: &Value, field_type: FieldType) -> anyhow::Result<FieldValue> {
    if value.is_null() {
        return Ok(FieldValue::Null);
    }
    let field_value = match field_type {
        FieldType::Str => value.as_str().map(FieldValue::from),
        FieldType::Int => value.as_i64().map(FieldValue::Int),
        FieldType::Float => value.as_f64().map(FieldValue::Float),
        FieldType::Date => match value.as_str() {
            Some(text) => Some(FieldValue::Date(
                NaiveDate::parse_from_str(text, DATE_FORMAT)
                    .with_context(|| format!("Parsing date '{}'", text))?,
            )),
            None => None,
        },
    };
    field_value.ok_or_else(|| anyhow!("Expected a {} value, got {}", field_type, value))
}

fn field_value_to_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::Str(text) => Value::String(text.clone()),
        FieldValue::Int(number) => Value::from(*number),
        FieldValue::Float(number) => serde_json::Number::from_f64(*number)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        FieldValue::Date(date) => Value::String(date.format(DATE_FORMAT).to_string()),
        FieldValue::Null => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::NaiveDate;
    use geo::{point, Geometry};
    use testdir::testdir;

    use crate::{
        crs::crs_utils::Crs,
        geofile::{
            feature::{Feature, FieldType, FieldValue, Schema},
            feature_collection::FeatureCollection,
        },
    };

    use super::{read_feature_collection, write_feature_collection};

    const STOPS_GEOJSON: &str = r#"{
        "type": "FeatureCollection",
        "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::2913"}},
        "features": [
            {"type": "Feature", "geometry": {"type": "Point", "coordinates": [7650000.0, 680000.0]},
             "properties": {"stop_id": 13, "name": "Gateway TC", "vend_dist": 6000}},
            {"type": "Feature", "geometry": null,
             "properties": {"stop_id": 14, "name": null, "vend_dist": 120.5}}
        ]
    }"#;

    #[test]
    fn test_read_infers_schema_and_positions() {
        let test_dir = testdir!();
        let filepath = test_dir.join("stops.geojson");
        fs::write(&filepath, STOPS_GEOJSON).unwrap();

        let stops = read_feature_collection(&filepath, "stops", None, None).unwrap();
        assert_eq!(Some(Crs::from_epsg(2913)), stops.crs());
        assert_eq!(Some(FieldType::Int), stops.schema().field_type("stop_id"));
        assert_eq!(Some(FieldType::Float), stops.schema().field_type("vend_dist"));
        assert_eq!(Some(FieldType::Str), stops.schema().field_type("name"));

        let fids: Vec<u64> = stops.iter().map(|feature| feature.fid).collect();
        assert_eq!(vec![0, 1], fids);
        assert_eq!(
            Some(Geometry::Point(point!(x: 7650000.0, y: 680000.0))),
            stops.get(0).unwrap().geometry
        );
        assert!(stops.get(1).unwrap().geometry.is_none());
        assert_eq!(Some(&FieldValue::Float(6000.0)), stops.value(0, "vend_dist").unwrap());
        assert_eq!(Some(&FieldValue::Null), stops.value(1, "name").unwrap());
    }

    #[test]
    fn test_read_with_declared_schema_checks_types() {
        let test_dir = testdir!();
        let filepath = test_dir.join("stops.geojson");
        fs::write(&filepath, STOPS_GEOJSON).unwrap();

        let schema = Schema::from_fields([("name", FieldType::Int)]).unwrap();
        let result = read_feature_collection(&filepath, "stops", None, Some(&schema));
        assert!(result.is_err());

        let schema = Schema::from_fields([("stop_id", FieldType::Int)]).unwrap();
        let stops = read_feature_collection(&filepath, "stops", None, Some(&schema)).unwrap();
        assert_eq!(1, stops.schema().len());
    }

    #[test]
    fn test_write_then_read_keeps_fids_properties_and_crs() {
        let schema = Schema::from_fields([
            ("geoid", FieldType::Str),
            ("begin_date", FieldType::Date),
            ("riders", FieldType::Int),
        ])
        .unwrap();
        let mut points = FeatureCollection::new("points", Some(Crs::from_epsg(2913)), schema.clone());
        points
            .insert(
                Feature::new(17, Some(Geometry::Point(point!(x: 1.5, y: 2.5))))
                    .with_property("geoid", "410510001001")
                    .with_property("begin_date", NaiveDate::from_ymd_opt(2015, 5, 1).unwrap())
                    .with_property("riders", 220_i64),
            )
            .unwrap();
        points.insert(Feature::new(40, None)).unwrap();

        let test_dir = testdir!();
        let filepath = test_dir.join("points.geojson");
        write_feature_collection(&points, &filepath).unwrap();
        let read_back = read_feature_collection(&filepath, "points", None, Some(&schema)).unwrap();

        assert_eq!(Some(Crs::from_epsg(2913)), read_back.crs());
        let fids: Vec<u64> = read_back.iter().map(|feature| feature.fid).collect();
        assert_eq!(vec![17, 40], fids);
        assert_eq!(points.get(17), read_back.get(17));
        assert_eq!(Some(&FieldValue::Null), read_back.value(40, "riders").unwrap());
    }
}
