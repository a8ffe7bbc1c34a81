use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Deserialize;

use crate::{
    error::{Result, SpatialJoinError},
    geofile::{
        feature::{FieldType, FieldValue, Fid},
        feature_collection::FeatureCollection,
    },
};

use super::{
    join::{JoinMapping, JoinMatch},
    nearest::NearestMatch,
};

/// One step of a fallback chain: copy `field` from the `target` features that `mapping` matched.
pub struct RegionLookup<'a> {
    pub target: &'a FeatureCollection,
    pub mapping: &'a JoinMapping,
    pub field: String,
    /// Appended to every value found through this lookup, e.g. " County".
    pub suffix: Option<String>,
}

/// What to do with a source feature that none of the lookups matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingMatchPolicy {
    /// Remove the feature from the source collection.
    Drop,
    /// Keep the feature with a null value, replacing any value it already had.
    Keep,
    /// Abort the run.
    Fail,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationSummary {
    /// Matched by the first lookup of the chain.
    pub matched: usize,
    /// Matched by a later lookup of the chain.
    pub fallback: usize,
    /// Not matched at all, then dropped or kept with a null value according to the policy.
    pub missing: usize,
}

/// Write the value of the first matching lookup into `output_field` of every source feature.
///
/// Single matches copy the target's value as is. Multiple matches are written as their string
/// values joined with ", ". The output field is added to the source schema.
pub fn annotate(
    source: &mut FeatureCollection,
    output_field: &str,
    lookups: &[RegionLookup],
    on_missing: MissingMatchPolicy,
) -> Result<AnnotationSummary> {
    if lookups.is_empty() {
        return Err(SpatialJoinError::Configuration(format!(
            "no lookups given for field '{}'",
            output_field
        )));
    }
    let output_type = output_field_type(lookups)?;

    // Resolve every value before touching the source.
    let mut summary = AnnotationSummary::default();
    let mut values: Vec<(Fid, FieldValue)> = Vec::with_capacity(source.len());
    let mut unmatched: HashSet<Fid> = HashSet::new();
    for feature in source.iter() {
        match resolve(feature.fid, lookups, output_type)? {
            Some((0, value)) => {
                summary.matched += 1;
                values.push((feature.fid, value));
            }
            Some((_, value)) => {
                summary.fallback += 1;
                values.push((feature.fid, value));
            }
            None => {
                if on_missing == MissingMatchPolicy::Fail {
                    return Err(SpatialJoinError::MissingMatch {
                        fid: feature.fid,
                        field: output_field.to_string(),
                    });
                }
                summary.missing += 1;
                unmatched.insert(feature.fid);
            }
        }
    }

    source.add_field(output_field, output_type)?;
    for (fid, value) in values {
        source.set_value(fid, output_field, value)?;
    }
    if on_missing == MissingMatchPolicy::Keep {
        // An existing field still holds its old values.
        for fid in &unmatched {
            source.set_value(*fid, output_field, FieldValue::Null)?;
        }
    }
    if on_missing == MissingMatchPolicy::Drop && !unmatched.is_empty() {
        log::info!(
            "Dropping {} features of '{}' without a match for '{}'",
            unmatched.len(),
            source.name(),
            output_field
        );
        source.retain(|feature| !unmatched.contains(&feature.fid));
    }
    log::debug!("Annotated '{}': {:?}", output_field, summary);
    Ok(summary)
}

/// The common type of the looked-up fields, or `str` when values get decorated or concatenated.
fn output_field_type(lookups: &[RegionLookup]) -> Result<FieldType> {
    let mut field_types = Vec::with_capacity(lookups.len());
    for lookup in lookups {
        field_types.push(lookup.target.ensure_field(&lookup.field)?);
    }
    let plain = lookups
        .iter()
        .all(|lookup| lookup.suffix.is_none() && lookup.mapping.is_single());
    let first = field_types[0];
    if plain && field_types.iter().all(|field_type| *field_type == first) {
        Ok(first)
    } else {
        Ok(FieldType::Str)
    }
}

/// Position of the lookup that matched, with the value it produced.
fn resolve(
    fid: Fid,
    lookups: &[RegionLookup],
    output_type: FieldType,
) -> Result<Option<(usize, FieldValue)>> {
    for (position, lookup) in lookups.iter().enumerate() {
        let target_fids = match lookup.mapping.lookup(fid) {
            JoinMatch::Found(target_fids) => target_fids,
            JoinMatch::NotFound => continue,
        };
        let mut target_values = Vec::with_capacity(target_fids.len());
        for target_fid in target_fids {
            if let Some(value) = lookup.target.value(*target_fid, &lookup.field)? {
                target_values.push(value);
            }
        }
        let value = match (output_type, target_values.as_slice()) {
            (FieldType::Str, _) => {
                let text = target_values
                    .iter()
                    .filter(|value| !value.is_null())
                    .map(|value| format!("{}{}", value, lookup.suffix.as_deref().unwrap_or("")))
                    .collect::<Vec<String>>()
                    .join(", ");
                if text.is_empty() {
                    FieldValue::Null
                } else {
                    FieldValue::Str(text)
                }
            }
            (_, [value]) => (*value).clone(),
            _ => FieldValue::Null,
        };
        return Ok(Some((position, value)));
    }
    Ok(None)
}

/// Write the distance to the nearest target feature into the float field `output_field`.
/// Features without a nearest target get `Null`. Returns how many features got a distance.
pub fn annotate_nearest_distance(
    source: &mut FeatureCollection,
    output_field: &str,
    nearest: &HashMap<Fid, NearestMatch>,
) -> Result<usize> {
    source.add_field(output_field, FieldType::Float)?;
    let fids: Vec<Fid> = source.iter().map(|feature| feature.fid).collect();
    let mut measured = 0;
    for fid in fids {
        let value = match nearest.get(&fid) {
            Some(found) => {
                measured += 1;
                FieldValue::Float(found.distance)
            }
            None => FieldValue::Null,
        };
        source.set_value(fid, output_field, value)?;
    }
    Ok(measured)
}

/// Number of features carrying each distinct non-null value of the given fields. Values of all
/// fields are tallied together, so block group and tract ids end up in one table.
pub fn count_by_fields(
    collection: &FeatureCollection,
    fields: &[String],
) -> Result<BTreeMap<String, usize>> {
    for field in fields {
        collection.ensure_field(field)?;
    }
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for feature in collection.iter() {
        for field in fields {
            if let Some(value) = feature.property(field) {
                if !value.is_null() {
                    *counts.entry(value.to_string()).or_insert(0) += 1;
                }
            }
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use geo::{point, polygon, Geometry};
    use rstest::rstest;

    use crate::{
        error::{ErrorKind, SpatialJoinError},
        geofile::{
            feature::{Feature, FieldType, FieldValue, Fid, Schema},
            feature_collection::FeatureCollection,
        },
        spatial::{
            index::SpatialIndex,
            join::{join, Cardinality, JoinMapping},
            nearest::NearestMatch,
        },
    };

    use super::{
        annotate, annotate_nearest_distance, count_by_fields, AnnotationSummary,
        MissingMatchPolicy, RegionLookup,
    };

    fn square(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Geometry {
        Geometry::Polygon(polygon![
            (x: min_x, y: min_y),
            (x: max_x, y: min_y),
            (x: max_x, y: max_y),
            (x: min_x, y: max_y),
        ])
    }

    fn regions(name: &str, field: &str, regions: Vec<(Fid, Geometry, &str)>) -> FeatureCollection {
        let schema = Schema::from_fields([(field, FieldType::Str)]).unwrap();
        let mut collection = FeatureCollection::new(name, None, schema);
        for (fid, geometry, value) in regions {
            collection
                .insert(Feature::new(fid, Some(geometry)).with_property(field, value))
                .unwrap();
        }
        collection
    }

    fn stops() -> FeatureCollection {
        let schema = Schema::from_fields([("stop_id", FieldType::Int)]).unwrap();
        let mut stops = FeatureCollection::new("stops", None, schema);
        for (fid, x, y) in [(0, 1.0, 1.0), (1, 15.0, 1.0), (2, 50.0, 50.0)] {
            stops
                .insert(
                    Feature::new(fid, Some(Geometry::Point(point!(x: x, y: y))))
                        .with_property("stop_id", 1000 + fid as i64),
                )
                .unwrap();
        }
        stops
    }

    fn cities() -> FeatureCollection {
        regions(
            "cities",
            "CITYNAME",
            vec![(1, square(0.0, 0.0, 10.0, 10.0), "Portland")],
        )
    }

    fn counties() -> FeatureCollection {
        regions(
            "counties",
            "COUNTY",
            vec![
                (1, square(0.0, 0.0, 10.0, 10.0), "Multnomah"),
                (2, square(10.0, 0.0, 20.0, 10.0), "Washington"),
            ],
        )
    }

    fn join_one(source: &FeatureCollection, target: &FeatureCollection) -> JoinMapping {
        let index = SpatialIndex::build(target);
        join(source, target, &index, Cardinality::One).unwrap()
    }

    #[rstest]
    #[case(MissingMatchPolicy::Keep, 3)]
    #[case(MissingMatchPolicy::Drop, 2)]
    fn test_city_then_county_fallback(
        #[case] on_missing: MissingMatchPolicy,
        #[case] expected_len: usize,
    ) {
        let mut stops = stops();
        let (cities, counties) = (cities(), counties());
        let city_mapping = join_one(&stops, &cities);
        let county_mapping = join_one(&stops, &counties);
        let lookups = [
            RegionLookup {
                target: &cities,
                mapping: &city_mapping,
                field: "CITYNAME".to_string(),
                suffix: None,
            },
            RegionLookup {
                target: &counties,
                mapping: &county_mapping,
                field: "COUNTY".to_string(),
                suffix: Some(" County".to_string()),
            },
        ];

        let summary = annotate(&mut stops, "city_county", &lookups, on_missing).unwrap();
        assert_eq!(
            AnnotationSummary {
                matched: 1,
                fallback: 1,
                missing: 1
            },
            summary
        );
        assert_eq!(expected_len, stops.len());
        assert_eq!(
            Some(&FieldValue::from("Portland")),
            stops.value(0, "city_county").unwrap()
        );
        assert_eq!(
            Some(&FieldValue::from("Washington County")),
            stops.value(1, "city_county").unwrap()
        );
        let missing = stops.value(2, "city_county").unwrap();
        match on_missing {
            MissingMatchPolicy::Drop => assert_eq!(None, missing),
            _ => assert_eq!(Some(&FieldValue::Null), missing),
        }
    }

    #[test]
    fn test_keep_policy_clears_value_from_earlier_run() {
        let mut stops = stops();
        stops.add_field("city", FieldType::Str).unwrap();
        for fid in [0, 1, 2] {
            stops
                .set_value(fid, "city", FieldValue::from("Gresham"))
                .unwrap();
        }
        let cities = cities();
        let mapping = join_one(&stops, &cities);
        let lookups = [RegionLookup {
            target: &cities,
            mapping: &mapping,
            field: "CITYNAME".to_string(),
            suffix: None,
        }];

        annotate(&mut stops, "city", &lookups, MissingMatchPolicy::Keep).unwrap();
        assert_eq!(
            Some(&FieldValue::from("Portland")),
            stops.value(0, "city").unwrap()
        );
        assert_eq!(Some(&FieldValue::Null), stops.value(1, "city").unwrap());
        assert_eq!(Some(&FieldValue::Null), stops.value(2, "city").unwrap());
    }

    #[test]
    fn test_nearest_distance_is_written_as_float() {
        let mut stops = stops();
        let nearest = HashMap::from([
            (
                0,
                NearestMatch {
                    fid: 7,
                    distance: 120.5,
                },
            ),
            (
                2,
                NearestMatch {
                    fid: 8,
                    distance: 6000.0,
                },
            ),
        ]);
        let measured = annotate_nearest_distance(&mut stops, "vend_dist", &nearest).unwrap();
        assert_eq!(2, measured);
        assert_eq!(Some(FieldType::Float), stops.schema().field_type("vend_dist"));
        assert_eq!(
            Some(&FieldValue::Float(120.5)),
            stops.value(0, "vend_dist").unwrap()
        );
        assert_eq!(Some(&FieldValue::Null), stops.value(1, "vend_dist").unwrap());
        assert_eq!(
            Some(&FieldValue::Float(6000.0)),
            stops.value(2, "vend_dist").unwrap()
        );
    }

    #[test]
    fn test_fail_policy_names_unmatched_feature() {
        let mut stops = stops();
        let cities = cities();
        let mapping = join_one(&stops, &cities);
        let lookups = [RegionLookup {
            target: &cities,
            mapping: &mapping,
            field: "CITYNAME".to_string(),
            suffix: None,
        }];
        let err = annotate(&mut stops, "city", &lookups, MissingMatchPolicy::Fail).unwrap_err();
        assert_eq!(ErrorKind::DataConsistency, err.kind());
        assert!(matches!(err, SpatialJoinError::MissingMatch { fid: 1, .. }));
        // Nothing is written when the run fails.
        assert!(stops.schema().field_type("city").is_none());
    }

    #[test]
    fn test_single_match_keeps_target_type() {
        let mut stops = stops();
        let schema = Schema::from_fields([("min_pov", FieldType::Int)]).unwrap();
        let mut block_groups = FeatureCollection::new("block_groups", None, schema);
        block_groups
            .insert(
                Feature::new(3, Some(square(0.0, 0.0, 20.0, 10.0))).with_property("min_pov", 1_i64),
            )
            .unwrap();
        let mapping = join_one(&stops, &block_groups);
        let lookups = [RegionLookup {
            target: &block_groups,
            mapping: &mapping,
            field: "min_pov".to_string(),
            suffix: None,
        }];
        annotate(&mut stops, "t6_status", &lookups, MissingMatchPolicy::Keep).unwrap();
        assert_eq!(Some(FieldType::Int), stops.schema().field_type("t6_status"));
        assert_eq!(Some(&FieldValue::Int(1)), stops.value(0, "t6_status").unwrap());
    }

    #[test]
    fn test_many_matches_are_joined_as_text() {
        let mut stops = stops();
        let stations = regions(
            "stations",
            "STATION",
            vec![
                (1, square(0.0, 0.0, 5.0, 5.0), "Gateway"),
                (2, square(-5.0, -5.0, 2.0, 2.0), "Rose Quarter"),
            ],
        );
        let index = SpatialIndex::build(&stations);
        let mapping = join(&stops, &stations, &index, Cardinality::Many).unwrap();
        let lookups = [RegionLookup {
            target: &stations,
            mapping: &mapping,
            field: "STATION".to_string(),
            suffix: None,
        }];
        annotate(&mut stops, "stations", &lookups, MissingMatchPolicy::Drop).unwrap();
        assert_eq!(1, stops.len());
        let text = stops.value(0, "stations").unwrap().unwrap().to_string();
        let mut names: Vec<&str> = text.split(", ").collect();
        names.sort();
        assert_eq!(vec!["Gateway", "Rose Quarter"], names);
    }

    #[test]
    fn test_misspelled_lookup_field_is_an_error() {
        let mut stops = stops();
        let cities = cities();
        let mapping = join_one(&stops, &cities);
        let lookups = [RegionLookup {
            target: &cities,
            mapping: &mapping,
            field: "CITY_NAME".to_string(),
            suffix: None,
        }];
        let err = annotate(&mut stops, "city", &lookups, MissingMatchPolicy::Keep).unwrap_err();
        assert!(matches!(err, SpatialJoinError::UnknownField { .. }));
    }

    #[test]
    fn test_count_by_fields_tallies_all_fields() {
        let schema =
            Schema::from_fields([("bg", FieldType::Str), ("tract", FieldType::Str)]).unwrap();
        let mut points = FeatureCollection::new("census_points", None, schema);
        let rows = [
            (0, "410510001001", "41051000100"),
            (1, "410510001001", "41051000100"),
            (2, "410510001002", "41051000100"),
        ];
        for (fid, bg, tract) in rows {
            points
                .insert(
                    Feature::new(fid, None)
                        .with_property("bg", bg)
                        .with_property("tract", tract),
                )
                .unwrap();
        }
        points.insert(Feature::new(3, None)).unwrap();

        let counts =
            count_by_fields(&points, &["bg".to_string(), "tract".to_string()]).unwrap();
        let expected: BTreeMap<String, usize> = HashMap::from([
            ("410510001001".to_string(), 2),
            ("410510001002".to_string(), 1),
            ("41051000100".to_string(), 3),
        ])
        .into_iter()
        .collect();
        assert_eq!(expected, counts);
        assert!(count_by_fields(&points, &["geoid".to_string()]).is_err());
    }
}
