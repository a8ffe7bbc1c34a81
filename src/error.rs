use std::fmt;

use crate::crs::crs_utils::Crs;
use crate::geofile::feature::{FieldType, Fid};

/// Broad classification of a [`SpatialJoinError`], used by callers that only care about which
/// part of the run needs fixing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller asked for something inconsistent (CRS mismatch, wrong index, bad parameters).
    Configuration,
    /// A geometry could not be used in an exact test.
    Geometry,
    /// The data contradicts what the caller declared about it, e.g. overlapping "disjoint" regions.
    DataConsistency,
    /// A feature does not fit the collection's declared schema.
    Schema,
}

#[derive(thiserror::Error, Debug)]
pub enum SpatialJoinError {
    #[error("invalid join configuration: {0}")]
    Configuration(String),
    #[error("coordinate reference systems do not match: {source_name} is {source_crs}, {target_name} is {target_crs}")]
    CrsMismatch {
        source_name: String,
        source_crs: CrsLabel,
        target_name: String,
        target_crs: CrsLabel,
    },
    #[error("spatial index was built from '{index_name}' but is being used to join against '{target_name}': {reason}")]
    IndexMismatch {
        index_name: String,
        target_name: String,
        reason: String,
    },
    #[error("invalid geometry for feature {fid} ({summary}): {reason}")]
    InvalidGeometry {
        fid: Fid,
        summary: String,
        reason: String,
    },
    #[error("source feature {source_fid} intersects more than one target feature ({}) although targets are expected to be disjoint, examine the input data", join_fids(.target_fids))]
    MultipleMatches {
        source_fid: Fid,
        target_fids: Vec<Fid>,
    },
    #[error("source feature {fid} has no spatial match for field '{field}'")]
    MissingMatch { fid: Fid, field: String },
    #[error("feature id {fid} appears more than once in '{collection}'")]
    DuplicateFid { fid: Fid, collection: String },
    #[error("field '{field}' is not part of the schema of '{collection}'")]
    UnknownField { field: String, collection: String },
    #[error("field '{field}' is declared more than once")]
    DuplicateField { field: String },
    #[error("feature {fid} field '{field}' should be {expected} but was {found}")]
    TypeMismatch {
        fid: Fid,
        field: String,
        expected: FieldType,
        found: FieldType,
    },
}

impl SpatialJoinError {
    pub fn kind(&self) -> ErrorKind {
        use SpatialJoinError::*;
        match self {
            Configuration(_) | CrsMismatch { .. } | IndexMismatch { .. } => {
                ErrorKind::Configuration
            }
            InvalidGeometry { .. } => ErrorKind::Geometry,
            MultipleMatches { .. } | MissingMatch { .. } => ErrorKind::DataConsistency,
            DuplicateFid { .. }
            | UnknownField { .. }
            | DuplicateField { .. }
            | TypeMismatch { .. } => ErrorKind::Schema,
        }
    }
}

/// Display helper for an optional CRS in error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrsLabel(pub Option<Crs>);

impl fmt::Display for CrsLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(crs) => write!(f, "{}", crs),
            None => write!(f, "unknown"),
        }
    }
}

fn join_fids(fids: &[Fid]) -> String {
    fids.iter()
        .map(|fid| fid.to_string())
        .collect::<Vec<String>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, SpatialJoinError>;
