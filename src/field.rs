// src/field.rs

use crate::error::{EofError, Result};
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayD, ArrayView2, ArrayViewD, Axis, Dimension, IxDyn};
use serde::{Deserialize, Serialize};

/// How the anomaly field is formed from the input field.
#[derive(Clone, Debug, Default)]
pub enum Centering {
    /// Remove the temporal mean at every retained spatial point.
    #[default]
    TimeMean,
    /// Remove a caller-supplied mean, broadcastable to the spatial shape.
    Supplied(ArrayD<f64>),
    /// The input already holds anomalies; use it as-is.
    None,
}

/// What to do with a spatial point that is missing at some, but not all, time steps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MissingPolicy {
    /// A point missing at any time step is dropped from the decomposition
    /// and reported as missing in every output.
    #[default]
    ExcludeAnyMissing,
    /// Missing values must occupy the same points at every time step;
    /// anything else is rejected as invalid input.
    Consistent,
}

/// Shape bookkeeping that maps between the caller's grid and the
/// (time, retained-space) matrix the decomposition works on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldLayout {
    /// Shape of the spatial dimensions (everything after the time axis).
    pub(crate) spatial_shape: Vec<usize>,
    /// Flat (row-major) indices of the spatial points used in the decomposition.
    pub(crate) retained: Vec<usize>,
    /// Value written at missing points of every output.
    pub(crate) fill_value: f64,
}

impl FieldLayout {
    pub fn spatial_shape(&self) -> &[usize] {
        &self.spatial_shape
    }

    pub fn n_space(&self) -> usize {
        self.spatial_shape.iter().product()
    }

    pub fn n_retained(&self) -> usize {
        self.retained.len()
    }

    /// Scatters rows of retained-point values back onto the full grid.
    ///
    /// `rows` has shape `(n, n_retained)`; the result has shape `(n, spatial…)`
    /// with the fill value at every point that was not retained.
    pub fn scatter(&self, rows: ArrayView2<f64>) -> ArrayD<f64> {
        let mut source_column = vec![None; self.n_space()];
        for (src_col, &dst_col) in self.retained.iter().enumerate() {
            source_column[dst_col] = Some(src_col);
        }
        let mut shape = Vec::with_capacity(self.spatial_shape.len() + 1);
        shape.push(rows.nrows());
        shape.extend_from_slice(&self.spatial_shape);
        ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
            let point = idx
                .slice()
                .iter()
                .skip(1)
                .zip(&self.spatial_shape)
                .fold(0, |flat, (&i, &len)| flat * len + i);
            match source_column[point] {
                Some(col) => rows[[idx[0], col]],
                None => self.fill_value,
            }
        })
    }

    /// Picks the retained columns out of a `(n, n_space)` matrix.
    pub fn gather(&self, flat: ArrayView2<f64>) -> Array2<f64> {
        flat.select(Axis(1), &self.retained)
    }
}

/// A field after flattening, missing-value resolution and centering.
#[derive(Debug)]
pub(crate) struct ResolvedField {
    pub layout: FieldLayout,
    /// Unweighted anomaly at retained points, shape `(n_time, n_retained)`.
    pub anomaly: Array2<f64>,
    /// Weights broadcast over the full grid, flattened.
    pub weights: Option<Array1<f64>>,
}

/// Splits a field shape into its time length and spatial shape.
pub(crate) fn split_shape(shape: &[usize]) -> Result<(usize, Vec<usize>)> {
    if shape.len() < 2 {
        return Err(EofError::invalid(format!(
            "field must have a time axis and at least one spatial axis, got shape {:?}",
            shape
        )));
    }
    Ok((shape[0], shape[1..].to_vec()))
}

/// Flattens a `(time, spatial…)` array to `(time, space)` in logical (row-major) order.
pub(crate) fn flatten_field(field: &ArrayViewD<f64>) -> Result<Array2<f64>> {
    let (n_time, spatial_shape) = split_shape(field.shape())?;
    let n_space: usize = spatial_shape.iter().product();
    Array2::from_shape_vec((n_time, n_space), field.iter().copied().collect())
        .map_err(|e| EofError::invalid(format!("failed to flatten field: {}", e)))
}

/// Broadcasts `values` (numpy trailing-axis rules) over `spatial_shape` and flattens.
pub(crate) fn broadcast_spatial<T: Clone>(
    values: &ArrayD<T>,
    spatial_shape: &[usize],
    what: &str,
) -> Result<Array1<T>> {
    let view = values.broadcast(IxDyn(spatial_shape)).ok_or_else(|| {
        EofError::invalid(format!(
            "{} with shape {:?} cannot be broadcast to the spatial shape {:?}",
            what,
            values.shape(),
            spatial_shape
        ))
    })?;
    Ok(view.iter().cloned().collect())
}

/// Validates weights and broadcasts them over the spatial grid.
pub(crate) fn resolve_weights(weights: &ArrayD<f64>, spatial_shape: &[usize]) -> Result<Array1<f64>> {
    let flat = broadcast_spatial(weights, spatial_shape, "weights")?;
    if flat.iter().any(|&w| !w.is_finite() || w < 0.0) {
        return Err(EofError::invalid(
            "weights must be finite and non-negative",
        ));
    }
    Ok(flat)
}

/// Builds the per-element missing indicator for a flattened field.
fn missing_indicator(
    flat: &Array2<f64>,
    field_shape: &[usize],
    missing_value: Option<f64>,
    mask: Option<&ArrayD<bool>>,
) -> Result<Array2<bool>> {
    let mut missing = flat.mapv(|v| v.is_nan() || missing_value.map_or(false, |mv| v == mv));
    if let Some(mask) = mask {
        let view = mask.broadcast(IxDyn(field_shape)).ok_or_else(|| {
            EofError::invalid(format!(
                "mask with shape {:?} matches neither the spatial nor the full field shape {:?}",
                mask.shape(),
                field_shape
            ))
        })?;
        for (m, &masked) in missing.iter_mut().zip(view.iter()) {
            *m |= masked;
        }
    }
    Ok(missing)
}

/// Chooses the spatial points that take part in the decomposition.
fn retained_points(missing: &Array2<bool>, policy: MissingPolicy) -> Result<Vec<usize>> {
    let n_time = missing.nrows();
    let mut retained = Vec::with_capacity(missing.ncols());
    let mut partially_missing = 0usize;
    for (idx, column) in missing.columns().into_iter().enumerate() {
        let n_missing = column.iter().filter(|&&m| m).count();
        if n_missing == 0 {
            retained.push(idx);
        } else if n_missing < n_time {
            match policy {
                MissingPolicy::Consistent => {
                    return Err(EofError::invalid(format!(
                        "spatial point {} is missing at {} of {} time steps; missing values must be in the same locations at every time",
                        idx, n_missing, n_time
                    )));
                }
                MissingPolicy::ExcludeAnyMissing => partially_missing += 1,
            }
        }
    }
    if partially_missing > 0 {
        warn!(
            "Excluded {} spatial points that are missing at some time steps.",
            partially_missing
        );
    }
    Ok(retained)
}

/// Flattens the field, resolves missing values, validates the remaining data
/// and forms the unweighted anomaly.
pub(crate) fn resolve_field(
    field: &ArrayViewD<f64>,
    weights: Option<&ArrayD<f64>>,
    center: &Centering,
    missing_value: Option<f64>,
    mask: Option<&ArrayD<bool>>,
    policy: MissingPolicy,
) -> Result<ResolvedField> {
    let (n_time, spatial_shape) = split_shape(field.shape())?;
    if n_time < 2 {
        return Err(EofError::invalid(format!(
            "the time dimension must have length >= 2, got {}",
            n_time
        )));
    }

    let flat = flatten_field(field)?;
    let weights = weights
        .map(|w| resolve_weights(w, &spatial_shape))
        .transpose()?;

    let missing = missing_indicator(&flat, field.shape(), missing_value, mask)?;
    let retained = retained_points(&missing, policy)?;
    debug!(
        "Resolved missing-value mask: {} of {} spatial points retained.",
        retained.len(),
        flat.ncols()
    );
    if retained.is_empty() {
        return Err(EofError::invalid(
            "no spatial point has valid data at every time step",
        ));
    }

    let layout = FieldLayout {
        spatial_shape,
        retained,
        fill_value: missing_value.unwrap_or(f64::NAN),
    };
    let mut anomaly = layout.gather(flat.view());
    if anomaly.iter().any(|v| !v.is_finite()) {
        return Err(EofError::invalid("field contains infinite values"));
    }

    match center {
        Centering::TimeMean => {
            let mean = anomaly
                .mean_axis(Axis(0))
                .ok_or_else(|| EofError::invalid("failed to compute the temporal mean"))?;
            anomaly -= &mean;
        }
        Centering::Supplied(mean) => {
            let full = broadcast_spatial(mean, &layout.spatial_shape, "supplied mean")?;
            let mean = full.select(Axis(0), &layout.retained);
            if mean.iter().any(|v| !v.is_finite()) {
                return Err(EofError::invalid(
                    "supplied mean is not finite at every retained point",
                ));
            }
            anomaly -= &mean;
        }
        Centering::None => {}
    }

    Ok(ResolvedField {
        layout,
        anomaly,
        weights,
    })
}
