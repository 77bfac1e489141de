// src/stats.rs

use crate::error::{EofError, Result};
use crate::field::flatten_field;
use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, ArrayViewD, Axis, IxDyn};

// A series counts as constant when its centred sum of squares is this small
// relative to its raw sum of squares.
const CONSTANT_SERIES_RATIO: f64 = 1e-20;

/// Centres each column and reports which columns carry usable variance.
fn centered_columns(data: ArrayView2<f64>) -> (Array2<f64>, Array1<f64>, Vec<bool>) {
    let n = data.nrows() as f64;
    let mut centered = data.to_owned();
    for mut column in centered.columns_mut() {
        let mean = column.sum() / n;
        column.mapv_inplace(|v| v - mean);
    }
    let sum_sq = centered.map_axis(Axis(0), |c| c.dot(&c));
    let varying = data
        .columns()
        .into_iter()
        .zip(sum_sq.iter())
        .map(|(raw, &ss)| {
            let raw_ss = raw.dot(&raw);
            column_is_finite(raw) && ss > CONSTANT_SERIES_RATIO * raw_ss.max(f64::MIN_POSITIVE)
        })
        .collect();
    (centered, sum_sq, varying)
}

fn column_is_finite(column: ArrayView1<f64>) -> bool {
    column.iter().all(|v| v.is_finite())
}

/// Pearson correlation between each column of `series` `(n, k)` and each
/// column of `data` `(n, p)`, returned as `(k, p)`.
///
/// Entries are NaN where either series is constant or the data column
/// holds non-finite values. Finite entries are clamped to [-1, 1].
pub(crate) fn correlation_rows(series: ArrayView2<f64>, data: ArrayView2<f64>) -> Array2<f64> {
    let (series_c, series_ss, series_varying) = centered_columns(series);
    let (data_c, data_ss, data_varying) = centered_columns(data);
    let mut out = series_c.t().dot(&data_c);
    for ((i, j), value) in out.indexed_iter_mut() {
        *value = if series_varying[i] && data_varying[j] {
            (*value / (series_ss[i].sqrt() * data_ss[j].sqrt())).clamp(-1.0, 1.0)
        } else {
            f64::NAN
        };
    }
    out
}

/// Covariance between each column of `series` `(n, k)` and each column of
/// `data` `(n, p)`, normalised by `n - ddof`, returned as `(k, p)`.
pub(crate) fn covariance_rows(series: ArrayView2<f64>, data: ArrayView2<f64>, ddof: usize) -> Array2<f64> {
    let denom = (data.nrows() - ddof) as f64;
    let (series_c, _, _) = centered_columns(series);
    let (data_c, _, _) = centered_columns(data);
    let mut out = series_c.t().dot(&data_c) / denom;
    for (j, column) in data.columns().into_iter().enumerate() {
        if !column_is_finite(column) {
            out.column_mut(j).fill(f64::NAN);
        }
    }
    out
}

fn check_series(series: &ArrayView2<f64>, field: &ArrayViewD<f64>, ddof: usize) -> Result<()> {
    let n_time = field.shape().first().copied().unwrap_or(0);
    if series.nrows() != n_time {
        return Err(EofError::invalid(format!(
            "series have {} time steps but the field has {}",
            series.nrows(),
            n_time
        )));
    }
    if ddof >= n_time {
        return Err(EofError::invalid(format!(
            "ddof ({}) must be smaller than the number of time steps ({})",
            ddof, n_time
        )));
    }
    Ok(())
}

fn reshape_map(rows: Array2<f64>, spatial_shape: &[usize]) -> Result<ArrayD<f64>> {
    let mut shape = vec![rows.nrows()];
    shape.extend_from_slice(spatial_shape);
    rows.into_shape_with_order(IxDyn(&shape))
        .map_err(|e| EofError::invalid(format!("failed to reshape map: {}", e)))
}

/// Correlation map between a set of time series and a field.
///
/// * `series` - shape `(n_time, k)`, e.g. PCs.
/// * `field` - shape `(n_time, spatial…)`.
///
/// Returns `(k, spatial…)` Pearson correlations; NaN where either series is
/// constant or the field is missing (non-finite) at that point.
pub fn correlation_map(series: ArrayView2<f64>, field: ArrayViewD<f64>) -> Result<ArrayD<f64>> {
    check_series(&series, &field, 1)?;
    let flat = flatten_field(&field)?;
    reshape_map(correlation_rows(series, flat.view()), &field.shape()[1..])
}

/// Covariance map between a set of time series and a field, normalised by `n_time - ddof`.
pub fn covariance_map(series: ArrayView2<f64>, field: ArrayViewD<f64>, ddof: usize) -> Result<ArrayD<f64>> {
    check_series(&series, &field, ddof)?;
    let flat = flatten_field(&field)?;
    reshape_map(covariance_rows(series, flat.view(), ddof), &field.shape()[1..])
}
