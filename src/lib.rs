extern crate log;
pub mod config;
pub mod crs;
pub mod error;
pub mod geofile;
pub mod pipeline;
pub mod spatial;
