use std::{fmt, str::FromStr};

use anyhow::anyhow;
use serde::Deserialize;

use crate::error::{CrsLabel, SpatialJoinError};

pub type EpsgCode = u32;

/// A coordinate reference system identified by its EPSG authority code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct Crs(EpsgCode);

impl Crs {
    pub fn from_epsg(code: EpsgCode) -> Self {
        Self(code)
    }

    pub fn epsg_code(&self) -> EpsgCode {
        self.0
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", epsg_code_to_authority_string(self.0))
    }
}

impl FromStr for Crs {
    type Err = anyhow::Error;

    /// Accepts "EPSG:2913", "urn:ogc:def:crs:EPSG::2913" and a bare "2913".
    fn from_str(value: &str) -> anyhow::Result<Self> {
        let trimmed = value.trim();
        let code = if trimmed.chars().all(|c| c.is_ascii_digit()) {
            trimmed
        } else {
            if !trimmed.to_ascii_uppercase().contains("EPSG") {
                return Err(anyhow!("Only EPSG coordinate systems are supported, got '{}'", value));
            }
            trimmed
                .rsplit(':')
                .next()
                .ok_or_else(|| anyhow!("CRS '{}' does not end with an EPSG code", value))?
        };
        let code: EpsgCode = code
            .parse()
            .map_err(|err| anyhow!("Could not parse EPSG code from '{}', {}", value, err))?;
        Ok(Self(code))
    }
}

impl TryFrom<String> for Crs {
    type Error = anyhow::Error;

    fn try_from(value: String) -> anyhow::Result<Self> {
        value.parse()
    }
}

pub fn epsg_code_to_authority_string(code: EpsgCode) -> String {
    format!("EPSG:{}", code)
}

/// Check that two named datasets share a coordinate reference system. Nothing is reprojected; a
/// difference is reported as a configuration error.
///
/// Two unknown CRSs are accepted, since nothing can be said about them. One known and one unknown
/// CRS cannot be verified and are rejected.
pub fn ensure_same_crs(
    source_name: &str,
    source_crs: Option<Crs>,
    target_name: &str,
    target_crs: Option<Crs>,
) -> Result<(), SpatialJoinError> {
    if source_crs == target_crs {
        return Ok(());
    }
    Err(SpatialJoinError::CrsMismatch {
        source_name: source_name.to_string(),
        source_crs: CrsLabel(source_crs),
        target_name: target_name.to_string(),
        target_crs: CrsLabel(target_crs),
    })
}
