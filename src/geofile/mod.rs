pub mod counts_csv;
pub mod feature;
pub mod feature_collection;
pub mod geojson;
