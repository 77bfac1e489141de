// src/weights.rs
//
// Latitude weights for gridded fields. The engine multiplies the anomaly by
// whatever weights it is given, so area weighting of a regular lat/lon grid
// is `sqrt_coslat`, not `coslat`.

use crate::error::{EofError, Result};
use ndarray::{Array1, ArrayD, ArrayView1, IxDyn};

/// Which latitude weighting to build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatitudeWeighting {
    /// `cos(lat)`.
    CosLat,
    /// `sqrt(cos(lat))`, the conventional EOF area weighting.
    SqrtCosLat,
}

fn check_latitudes(latitudes_deg: ArrayView1<f64>) -> Result<()> {
    if latitudes_deg
        .iter()
        .any(|&lat| !lat.is_finite() || !(-90.0..=90.0).contains(&lat))
    {
        return Err(EofError::invalid(
            "latitudes must be finite and within [-90, 90] degrees",
        ));
    }
    Ok(())
}

/// Cosine of latitude (degrees). Tiny negative values at the poles are clamped to zero.
pub fn coslat(latitudes_deg: ArrayView1<f64>) -> Result<Array1<f64>> {
    check_latitudes(latitudes_deg)?;
    Ok(latitudes_deg.mapv(|lat| lat.to_radians().cos().max(0.0)))
}

/// Square root of the cosine of latitude (degrees).
pub fn sqrt_coslat(latitudes_deg: ArrayView1<f64>) -> Result<Array1<f64>> {
    Ok(coslat(latitudes_deg)?.mapv(f64::sqrt))
}

/// Builds a weight array over a full spatial grid from a latitude vector.
///
/// * `spatial_shape` - shape of the spatial dimensions of the field (without the time axis).
/// * `lat_axis` - which spatial axis runs along latitude.
///
/// The result has exactly `spatial_shape` and can be passed as `EofOptions::weights`.
pub fn latitude_weights(
    latitudes_deg: ArrayView1<f64>,
    spatial_shape: &[usize],
    lat_axis: usize,
    weighting: LatitudeWeighting,
) -> Result<ArrayD<f64>> {
    if lat_axis >= spatial_shape.len() {
        return Err(EofError::invalid(format!(
            "latitude axis {} is out of range for a spatial shape of rank {}",
            lat_axis,
            spatial_shape.len()
        )));
    }
    if spatial_shape[lat_axis] != latitudes_deg.len() {
        return Err(EofError::invalid(format!(
            "latitude vector has length {} but spatial axis {} has length {}",
            latitudes_deg.len(),
            lat_axis,
            spatial_shape[lat_axis]
        )));
    }
    let per_lat = match weighting {
        LatitudeWeighting::CosLat => coslat(latitudes_deg)?,
        LatitudeWeighting::SqrtCosLat => sqrt_coslat(latitudes_deg)?,
    };
    Ok(ArrayD::from_shape_fn(IxDyn(spatial_shape), |idx| {
        per_lat[idx[lat_axis]]
    }))
}
