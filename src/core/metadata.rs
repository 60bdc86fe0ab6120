use crate::types::{MaeError, MaeResult, METADATA_WIDTH};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Which metadata blocks are written into the 8-wide encoding.
///
/// A disabled block is left as zeros so the encoder can still run with
/// partial metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFlags {
    /// Populate the lat/lon block (columns 0..4)
    pub include_latlon: bool,
    /// Populate the hour/week block (columns 4..8)
    pub include_time: bool,
}

impl MetadataFlags {
    /// Both blocks populated
    pub fn all() -> Self {
        Self { include_latlon: true, include_time: true }
    }

    /// Both blocks zeroed
    pub fn none() -> Self {
        Self { include_latlon: false, include_time: false }
    }

    /// Lat/lon populated, time zeroed.
    ///
    /// This is what existing trained weights were fitted against.
    pub fn reference() -> Self {
        Self { include_latlon: true, include_time: false }
    }
}

impl Default for MetadataFlags {
    fn default() -> Self {
        Self::reference()
    }
}

/// Encode acquisition time and location into cyclic features.
///
/// `time` is [B, 2] (hour in [0, 24), week in [0, 52)), `latlon` is [B, 2] in
/// degrees. Output row layout:
/// `[sin lat, cos lat, sin lon, cos lon, sin hour, cos hour, sin week, cos week]`.
pub fn encode_metadata(
    time: ArrayView2<f32>,
    latlon: ArrayView2<f32>,
    flags: MetadataFlags,
) -> MaeResult<Array2<f32>> {
    let batch = time.nrows();
    if time.ncols() != 2 || latlon.dim() != (batch, 2) {
        return Err(MaeError::Shape(format!(
            "time and latlon must both be [B, 2], got {:?} and {:?}",
            time.shape(),
            latlon.shape()
        )));
    }

    let mut encoded = Array2::<f32>::zeros((batch, METADATA_WIDTH));

    for b in 0..batch {
        if flags.include_latlon {
            let lat = latlon[[b, 0]].to_radians();
            let lon = latlon[[b, 1]].to_radians();
            encoded[[b, 0]] = lat.sin();
            encoded[[b, 1]] = lat.cos();
            encoded[[b, 2]] = lon.sin();
            encoded[[b, 3]] = lon.cos();
        }

        if flags.include_time {
            let hour = time[[b, 0]] * 2.0 * PI / 24.0;
            let week = time[[b, 1]] * 2.0 * PI / 52.0;
            encoded[[b, 4]] = hour.sin();
            encoded[[b, 5]] = hour.cos();
            encoded[[b, 6]] = week.sin();
            encoded[[b, 7]] = week.cos();
        }
    }

    Ok(encoded)
}
