// Empirical orthogonal function (EOF) analysis

use crate::error::{EofError, Result};
use crate::field::{flatten_field, resolve_field, Centering, FieldLayout, MissingPolicy};
use crate::linalg_backends::{BackendSVD, LinAlgBackendProvider, ThinSvdOutput};
use crate::stats::{correlation_rows, covariance_rows};
use log::{debug, info};
use ndarray::{s, Array1, Array2, ArrayD, ArrayView, ArrayView1, ArrayViewD, Axis, Dimension, IxDyn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::Instant;

// Singular values below this fraction of the largest are treated as zero when
// regressing zero-weight points onto the PCs.
const RELATIVE_SINGULAR_VALUE_FLOOR: f64 = 1e-12;

/// Options controlling how an [`Eof`] solver is built.
///
/// All fields are public; start from `EofOptions::default()` and override
/// what you need.
#[derive(Clone, Debug)]
pub struct EofOptions {
    /// Weights multiplied directly onto the anomaly before the decomposition.
    /// Must be finite, non-negative and broadcastable to the spatial shape.
    /// For area weighting of a lat/lon grid pass `sqrt(cos(lat))`
    /// (see [`crate::weights::sqrt_coslat`]).
    pub weights: Option<ArrayD<f64>>,
    /// How the anomaly is formed. Defaults to removing the temporal mean.
    pub center: Centering,
    /// Delta degrees of freedom: eigenvalues are `σ² / (n_time - ddof)`.
    pub ddof: usize,
    /// Sentinel value treated as missing, in addition to NaN. When set it is
    /// also written at missing points of every output.
    pub missing_value: Option<f64>,
    /// Explicit missing mask (`true` = missing), shaped like the spatial
    /// grid (static) or like the whole field (per time step).
    pub mask: Option<ArrayD<bool>>,
    /// Handling of points that are missing at only some time steps. By
    /// default they are excluded like points missing at every step.
    pub missing_policy: MissingPolicy,
}

impl Default for EofOptions {
    fn default() -> Self {
        EofOptions {
            weights: None,
            center: Centering::TimeMean,
            ddof: 1,
            missing_value: None,
            mask: None,
            missing_policy: MissingPolicy::ExcludeAnyMissing,
        }
    }
}

/// Scaling applied to EOF patterns (numeric codes 0, 1, 2).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EofScaling {
    /// Orthonormal under the weighted inner product.
    #[default]
    Unscaled,
    /// Divided by the square root of the eigenvalue.
    DivideBySqrtEigenvalue,
    /// Multiplied by the square root of the eigenvalue.
    MultiplyBySqrtEigenvalue,
}

/// Scaling applied to PC time series (numeric codes 0, 1, 2).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PcScaling {
    /// `U Σ` from the decomposition.
    #[default]
    Raw,
    /// Divided by the square root of the eigenvalue: unit variance.
    Unit,
    /// Multiplied by the square root of the eigenvalue.
    Scaled,
}

impl TryFrom<u8> for EofScaling {
    type Error = EofError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(EofScaling::Unscaled),
            1 => Ok(EofScaling::DivideBySqrtEigenvalue),
            2 => Ok(EofScaling::MultiplyBySqrtEigenvalue),
            other => Err(EofError::invalid(format!(
                "invalid EOF scaling code {}, expected 0, 1 or 2",
                other
            ))),
        }
    }
}

impl TryFrom<u8> for PcScaling {
    type Error = EofError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(PcScaling::Raw),
            1 => Ok(PcScaling::Unit),
            2 => Ok(PcScaling::Scaled),
            other => Err(EofError::invalid(format!(
                "invalid PC scaling code {}, expected 0, 1 or 2",
                other
            ))),
        }
    }
}

#[derive(Clone, Copy)]
enum SqrtEigenvalue {
    Keep,
    Divide,
    Multiply,
}

impl From<EofScaling> for SqrtEigenvalue {
    fn from(scaling: EofScaling) -> Self {
        match scaling {
            EofScaling::Unscaled => SqrtEigenvalue::Keep,
            EofScaling::DivideBySqrtEigenvalue => SqrtEigenvalue::Divide,
            EofScaling::MultiplyBySqrtEigenvalue => SqrtEigenvalue::Multiply,
        }
    }
}

impl From<PcScaling> for SqrtEigenvalue {
    fn from(scaling: PcScaling) -> Self {
        match scaling {
            PcScaling::Raw => SqrtEigenvalue::Keep,
            PcScaling::Unit => SqrtEigenvalue::Divide,
            PcScaling::Scaled => SqrtEigenvalue::Multiply,
        }
    }
}

impl SqrtEigenvalue {
    /// Factor for one mode. Dividing by a zero eigenvalue yields zero.
    fn factor(self, eigenvalue: f64) -> f64 {
        let root = eigenvalue.max(0.0).sqrt();
        match self {
            SqrtEigenvalue::Keep => 1.0,
            SqrtEigenvalue::Divide if root > 0.0 => 1.0 / root,
            SqrtEigenvalue::Divide => 0.0,
            SqrtEigenvalue::Multiply => root,
        }
    }
}

/// Index of the largest-magnitude entry; the first one wins ties.
fn largest_magnitude_index(row: ArrayView1<f64>) -> usize {
    let mut best_index = 0;
    let mut best_abs = f64::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v.abs() > best_abs {
            best_index = i;
            best_abs = v.abs();
        }
    }
    best_index
}

/// Removes the weights from the weighted patterns `vt`.
///
/// At positive-weight points this is `vt / w`. A zero-weight point has no
/// component in the weighted SVD, so its anomaly is regressed onto the
/// normalised PCs instead, `aᵗ U Σ⁻¹`. Modes with a vanishing singular value
/// contribute zero there.
fn unweighted_patterns(
    vt: &Array2<f64>,
    u: &Array2<f64>,
    s: &Array1<f64>,
    anomaly: &Array2<f64>,
    weights: Option<&Array1<f64>>,
) -> Array2<f64> {
    let Some(weights) = weights else {
        return vt.clone();
    };
    let floor = s.first().copied().unwrap_or(0.0) * RELATIVE_SINGULAR_VALUE_FLOOR;
    let mut patterns = vt.clone();
    for (j, &w) in weights.iter().enumerate() {
        if w > 0.0 {
            patterns.column_mut(j).mapv_inplace(|v| v / w);
        } else {
            let series = anomaly.column(j);
            for mode in 0..s.len() {
                patterns[[mode, j]] = if s[mode] > floor {
                    series.dot(&u.column(mode)) / s[mode]
                } else {
                    0.0
                };
            }
        }
    }
    patterns
}

/// EOF solver for a gridded space-time field.
///
/// Construction performs the whole decomposition eagerly and caches it; every
/// query afterwards slices the cache, so queries are pure and a solver can be
/// shared read-only between threads.
///
/// The input is `(time, spatial…)`. The engine removes the temporal mean at
/// each point, multiplies by the weights, and takes a thin SVD
/// `A = U Σ Vᵗ` of the `(time, retained-space)` matrix. Rows of `Vᵗ` are the
/// EOFs in weighted space, `U Σ` are the raw PCs and `λ = σ² / (n_time - ddof)`
/// are the eigenvalues.
///
/// Sign convention: each mode is oriented so that its largest-magnitude
/// weighted loading is positive (the first such point if several tie). The
/// PC is flipped together with its EOF.
///
/// # Examples
///
/// ```
/// use efficient_eof::{Eof, EofOptions, EofScaling, PcScaling};
/// use ndarray::array;
///
/// let field = array![
///     [1.0, 2.0, 0.5],
///     [2.0, 4.0, 1.0],
///     [0.0, 1.0, 0.0],
///     [1.5, 3.5, 0.8],
/// ];
/// let solver = Eof::new(field.view(), EofOptions::default()).unwrap();
/// let eof1 = solver.eofs(1, EofScaling::Unscaled).unwrap();
/// let pc1 = solver.pcs(1, PcScaling::Unit).unwrap();
/// assert_eq!(eof1.shape(), &[1, 3]);
/// assert_eq!(pc1.dim(), (4, 1));
/// ```
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Eof {
    /// Grid shape and the points that took part in the decomposition.
    layout: FieldLayout,
    n_time: usize,
    ddof: usize,
    /// Weights broadcast over the full spatial grid, flattened.
    weights: Option<Array1<f64>>,
    /// Unweighted anomaly at retained points.
    /// Shape: (n_time, n_retained)
    anomaly: Array2<f64>,
    /// Rows of `Vᵗ`: EOFs in weighted space, orthonormal.
    /// Shape: (rank, n_retained)
    weighted_eofs: Array2<f64>,
    /// EOFs with the weights removed.
    /// Shape: (rank, n_retained)
    eofs: Array2<f64>,
    /// Raw PCs, `U Σ`.
    /// Shape: (n_time, rank)
    pcs: Array2<f64>,
    /// Shape: (rank)
    eigenvalues: Array1<f64>,
    total_variance: f64,
}

impl Eof {
    /// Builds a solver with default options (temporal-mean removal, no weights,
    /// NaN as the only missing-value marker, `ddof = 1`).
    pub fn from_field<D: Dimension>(field: ArrayView<'_, f64, D>) -> Result<Self> {
        Self::new(field, EofOptions::default())
    }

    /// Builds a solver and performs the full decomposition.
    ///
    /// * `field` - array of shape `(n_time, spatial…)` with at least one spatial axis.
    /// * `options` - weights, centering, missing-value handling and `ddof`.
    ///
    /// Points missing at any time step are excluded from the decomposition
    /// and reported as missing in every output (unless
    /// `MissingPolicy::Consistent` asks for partially missing points to be rejected).
    ///
    /// # Errors
    /// - `InvalidInput` if the field has no spatial axis, fewer than 2 time steps,
    ///   `ddof >= n_time`, weights/mask/mean that do not fit the grid, negative or
    ///   non-finite weights, infinite data, missing values that move between time
    ///   steps (only under `MissingPolicy::Consistent`), no usable point, or zero
    ///   total variance.
    /// - `NumericalInstability` if the SVD fails or returns non-finite values.
    pub fn new<D: Dimension>(field: ArrayView<'_, f64, D>, options: EofOptions) -> Result<Self> {
        let start_time = Instant::now();
        let field = field.into_dyn();
        let resolved = resolve_field(
            &field,
            options.weights.as_ref(),
            &options.center,
            options.missing_value,
            options.mask.as_ref(),
            options.missing_policy,
        )?;
        let layout = resolved.layout;
        let anomaly = resolved.anomaly;
        let n_time = anomaly.nrows();
        let ddof = options.ddof;
        if ddof >= n_time {
            return Err(EofError::invalid(format!(
                "ddof ({}) must be smaller than the number of time steps ({})",
                ddof, n_time
            )));
        }

        let retained_weights = resolved
            .weights
            .as_ref()
            .map(|w| w.select(Axis(0), &layout.retained));
        let weighted_anomaly = match &retained_weights {
            Some(w) => {
                debug!("Applying weights to {} retained points.", w.len());
                &anomaly * w
            }
            None => anomaly.clone(),
        };

        let ThinSvdOutput { mut u, s, mut vt } =
            LinAlgBackendProvider::new().thin_svd(weighted_anomaly)?;
        if s.iter().chain(u.iter()).chain(vt.iter()).any(|v| !v.is_finite()) {
            return Err(EofError::NumericalInstability(
                "SVD returned non-finite values".to_string(),
            ));
        }
        let rank = s.len();

        for mode in 0..rank {
            let pivot = largest_magnitude_index(vt.row(mode));
            if vt[[mode, pivot]] < 0.0 {
                vt.row_mut(mode).mapv_inplace(|v| -v);
                u.column_mut(mode).mapv_inplace(|v| -v);
            }
        }

        let pcs = &u * &s;
        let eigenvalues = s.mapv(|sv| sv * sv / (n_time - ddof) as f64);
        let total_variance = eigenvalues.sum();
        if !(total_variance > 0.0) {
            return Err(EofError::invalid(
                "the weighted anomaly field has zero total variance",
            ));
        }
        let eofs = unweighted_patterns(&vt, &u, &s, &anomaly, retained_weights.as_ref());

        info!(
            "Computed {} EOF modes from {} time steps x {} retained points (of {}) in {:?}",
            rank,
            n_time,
            layout.n_retained(),
            layout.n_space(),
            start_time.elapsed()
        );

        Ok(Self {
            layout,
            n_time,
            ddof,
            weights: resolved.weights,
            anomaly,
            weighted_eofs: vt,
            eofs,
            pcs,
            eigenvalues,
            total_variance,
        })
    }

    /// Number of time steps.
    pub fn n_time(&self) -> usize {
        self.n_time
    }

    /// Shape of the spatial grid (without the time axis).
    pub fn spatial_shape(&self) -> &[usize] {
        self.layout.spatial_shape()
    }

    /// Number of spatial points that took part in the decomposition.
    pub fn n_retained(&self) -> usize {
        self.layout.n_retained()
    }

    /// Number of modes available, `min(n_time, n_retained)`.
    pub fn rank(&self) -> usize {
        self.eigenvalues.len()
    }

    /// Delta degrees of freedom used for the eigenvalues and PC scaling.
    pub fn ddof(&self) -> usize {
        self.ddof
    }

    fn check_modes(&self, requested: usize) -> Result<()> {
        if requested == 0 || requested > self.rank() {
            return Err(EofError::OutOfRange {
                requested,
                available: self.rank(),
            });
        }
        Ok(())
    }

    fn scatter_with_fill(&self, mut rows: Array2<f64>) -> ArrayD<f64> {
        let fill = self.layout.fill_value;
        if !fill.is_nan() {
            rows.mapv_inplace(|v| if v.is_nan() { fill } else { v });
        }
        self.layout.scatter(rows.view())
    }

    /// The first `neofs` EOF patterns, shape `(neofs, spatial…)`.
    ///
    /// With `EofScaling::Unscaled` the patterns are orthonormal under the
    /// weighted inner product (multiply by the weights, then take the dot
    /// product). Missing points carry the fill value.
    ///
    /// # Errors
    /// `OutOfRange` if `neofs` is zero or exceeds [`Eof::rank`].
    pub fn eofs(&self, neofs: usize, scaling: EofScaling) -> Result<ArrayD<f64>> {
        self.check_modes(neofs)?;
        let scaling = SqrtEigenvalue::from(scaling);
        let mut patterns = self.eofs.slice(s![..neofs, ..]).to_owned();
        for (mut row, &eigenvalue) in patterns.rows_mut().into_iter().zip(self.eigenvalues.iter()) {
            row *= scaling.factor(eigenvalue);
        }
        Ok(self.scatter_with_fill(patterns))
    }

    /// The first `npcs` PC time series, shape `(n_time, npcs)`.
    ///
    /// `PcScaling::Unit` gives series with unit variance (using the solver's
    /// `ddof`); modes with a zero eigenvalue come back as zeros.
    ///
    /// # Errors
    /// `OutOfRange` if `npcs` is zero or exceeds [`Eof::rank`].
    pub fn pcs(&self, npcs: usize, scaling: PcScaling) -> Result<Array2<f64>> {
        self.check_modes(npcs)?;
        let scaling = SqrtEigenvalue::from(scaling);
        let mut series = self.pcs.slice(s![.., ..npcs]).to_owned();
        for (mut column, &eigenvalue) in series.columns_mut().into_iter().zip(self.eigenvalues.iter()) {
            column *= scaling.factor(eigenvalue);
        }
        Ok(series)
    }

    /// EOFs expressed as the Pearson correlation between each PC and the
    /// unweighted anomaly series at every point, shape `(neofs, spatial…)`.
    ///
    /// Independent of weights and scaling. Points whose anomaly is constant in
    /// time, and missing points, carry the fill value.
    pub fn eofs_as_correlation(&self, neofs: usize) -> Result<ArrayD<f64>> {
        self.check_modes(neofs)?;
        let correlation = correlation_rows(self.pcs.slice(s![.., ..neofs]), self.anomaly.view());
        Ok(self.scatter_with_fill(correlation))
    }

    /// EOFs expressed as the covariance between each (scaled) PC and the
    /// unweighted anomaly series at every point, normalised by `n_time - ddof`.
    /// Shape `(neofs, spatial…)`.
    pub fn eofs_as_covariance(&self, neofs: usize, pc_scaling: PcScaling) -> Result<ArrayD<f64>> {
        let series = self.pcs(neofs, pc_scaling)?;
        let covariance = covariance_rows(series.view(), self.anomaly.view(), self.ddof);
        Ok(self.scatter_with_fill(covariance))
    }

    /// The first `neigs` eigenvalues, `σ² / (n_time - ddof)`, in descending order.
    pub fn eigenvalues(&self, neigs: usize) -> Result<Array1<f64>> {
        self.check_modes(neigs)?;
        Ok(self.eigenvalues.slice(s![..neigs]).to_owned())
    }

    /// Fraction of the total variance explained by each of the first `neigs` modes.
    ///
    /// Non-increasing; sums to 1 when `neigs` equals [`Eof::rank`].
    pub fn variance_fraction(&self, neigs: usize) -> Result<Array1<f64>> {
        Ok(self.eigenvalues(neigs)? / self.total_variance)
    }

    /// Total variance of the weighted anomaly: the sum of all eigenvalues.
    pub fn total_anomaly_variance(&self) -> f64 {
        self.total_variance
    }

    /// Typical errors of the first `neigs` eigenvalues after North et al. (1982),
    /// `λ · sqrt(2 / n_time)`.
    ///
    /// With `vf_scaled` the errors are divided by the total variance so they
    /// can be compared with [`Eof::variance_fraction`].
    pub fn north_test(&self, neigs: usize, vf_scaled: bool) -> Result<Array1<f64>> {
        let factor = (2.0 / self.n_time as f64).sqrt();
        let mut errors = self.eigenvalues(neigs)? * factor;
        if vf_scaled {
            errors /= self.total_variance;
        }
        Ok(errors)
    }

    /// Unweighted anomaly rebuilt from the first `neofs` modes,
    /// shape `(n_time, spatial…)`.
    ///
    /// With all modes this reproduces [`Eof::anomaly`] at every point with a
    /// positive weight. At zero-weight points it gives the least-squares
    /// projection of the anomaly onto the PCs, which is exact only when that
    /// series lies in their span.
    pub fn reconstructed_field(&self, neofs: usize) -> Result<ArrayD<f64>> {
        self.check_modes(neofs)?;
        let reconstruction = self
            .pcs
            .slice(s![.., ..neofs])
            .dot(&self.eofs.slice(s![..neofs, ..]));
        Ok(self.scatter_with_fill(reconstruction))
    }

    /// Projects a field onto the first `neofs` EOFs, giving pseudo-PCs of shape
    /// `(n, neofs)`.
    ///
    /// `field` is either one time step shaped like the spatial grid, or
    /// `(n, spatial…)`. It should already be an anomaly; no mean is removed.
    /// With `weighted` the solver's weights are applied to it first; pass
    /// `false` if the field is already weighted. The projection uses the
    /// weighted-space EOFs, so projecting [`Eof::anomaly`] with `weighted`
    /// reproduces `pcs(neofs, PcScaling::Raw)`. `eof_scaling` scales the result
    /// the way it scales the patterns.
    ///
    /// # Errors
    /// - `InvalidInput` if the spatial shape differs from the solver's or the
    ///   field is missing at a point the solver used.
    /// - `OutOfRange` for an invalid `neofs`.
    pub fn project_field<D: Dimension>(
        &self,
        field: ArrayView<'_, f64, D>,
        neofs: usize,
        eof_scaling: EofScaling,
        weighted: bool,
    ) -> Result<Array2<f64>> {
        self.check_modes(neofs)?;
        let field: ArrayViewD<f64> = field.into_dyn();
        let field = if field.shape() == self.spatial_shape() {
            field.insert_axis(Axis(0))
        } else {
            field
        };
        if field.ndim() < 2 || &field.shape()[1..] != self.spatial_shape() {
            return Err(EofError::invalid(format!(
                "field with shape {:?} does not match the solver's spatial shape {:?}",
                field.shape(),
                self.spatial_shape()
            )));
        }
        let flat = flatten_field(&field)?;
        let mut values = self.layout.gather(flat.view());
        let fill = self.layout.fill_value;
        if values.iter().any(|&v| !v.is_finite() || v == fill) {
            return Err(EofError::invalid(
                "the projected field has missing values at points used by the solver",
            ));
        }
        if weighted {
            if let Some(weights) = &self.weights {
                values *= &weights.select(Axis(0), &self.layout.retained);
            }
        }
        let mut projected = values.dot(&self.weighted_eofs.slice(s![..neofs, ..]).t());
        let scaling = SqrtEigenvalue::from(eof_scaling);
        for (mut column, &eigenvalue) in projected.columns_mut().into_iter().zip(self.eigenvalues.iter()) {
            column *= scaling.factor(eigenvalue);
        }
        Ok(projected)
    }

    /// The weights used by the solver over the full spatial grid, or `None`
    /// if the decomposition was unweighted.
    pub fn weights(&self) -> Option<ArrayD<f64>> {
        self.weights.as_ref().and_then(|w| {
            w.clone()
                .into_shape_with_order(IxDyn(self.spatial_shape()))
                .ok()
        })
    }

    /// The unweighted anomaly that was decomposed, shape `(n_time, spatial…)`.
    pub fn anomaly(&self) -> ArrayD<f64> {
        self.scatter_with_fill(self.anomaly.clone())
    }

    /// Saves the decomposition to a file using bincode.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or serialization fails.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| EofError::Serialization(format!("Failed to serialize EOF model: {}", e)))?;
        Ok(())
    }

    /// Loads a decomposition previously written by [`Eof::save_model`].
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or decoded, or if the loaded
    /// model is internally inconsistent (`InvalidInput`).
    pub fn load_model<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let model: Eof = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| EofError::Serialization(format!("Failed to deserialize EOF model: {}", e)))?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        let n_space = self.layout.n_space();
        let n_retained = self.layout.n_retained();
        let rank = self.eigenvalues.len();

        if self.n_time < 2 || self.ddof >= self.n_time {
            return Err(EofError::invalid(format!(
                "Loaded EOF model has invalid time length {} or ddof {}",
                self.n_time, self.ddof
            )));
        }
        if n_retained == 0
            || self.layout.retained.windows(2).any(|w| w[0] >= w[1])
            || self.layout.retained.iter().any(|&idx| idx >= n_space)
        {
            return Err(EofError::invalid(
                "Loaded EOF model has invalid retained point indices",
            ));
        }
        if rank != self.n_time.min(n_retained)
            || self.anomaly.dim() != (self.n_time, n_retained)
            || self.weighted_eofs.dim() != (rank, n_retained)
            || self.eofs.dim() != (rank, n_retained)
            || self.pcs.dim() != (self.n_time, rank)
        {
            return Err(EofError::invalid(
                "Loaded EOF model has inconsistent array dimensions",
            ));
        }
        if let Some(weights) = &self.weights {
            if weights.len() != n_space || weights.iter().any(|&w| !w.is_finite() || w < 0.0) {
                return Err(EofError::invalid(
                    "Loaded EOF model has invalid weights",
                ));
            }
        }
        if self.eigenvalues.iter().any(|&v| !v.is_finite() || v < 0.0)
            || !(self.total_variance > 0.0)
        {
            return Err(EofError::invalid(
                "Loaded EOF model has invalid eigenvalues",
            ));
        }
        Ok(())
    }
}
