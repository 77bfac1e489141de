// src/linalg_backends.rs

use crate::error::{EofError, Result};
use ndarray::{Array1, Array2};

/// Output of a thin Singular Value Decomposition `A = U Σ Vᵗ`.
///
/// For an `(m, n)` input with `r = min(m, n)`:
/// `u` is `(m, r)`, `s` is `(r)` in descending order and `vt` is `(r, n)`.
#[derive(Debug)]
pub struct ThinSvdOutput {
    pub u: Array2<f64>,
    pub s: Array1<f64>,
    pub vt: Array2<f64>,
}

/// Trait for thin Singular Value Decomposition.
pub trait BackendSVD {
    fn thin_svd(&self, matrix: Array2<f64>) -> Result<ThinSvdOutput>;
}

fn empty_svd(nrows: usize, ncols: usize) -> ThinSvdOutput {
    let k_dim = nrows.min(ncols);
    ThinSvdOutput {
        u: Array2::zeros((nrows, k_dim)),
        s: Array1::zeros(k_dim),
        vt: Array2::zeros((k_dim, ncols)),
    }
}

// --- NdarrayLinAlgBackend: LAPACK divide-and-conquer SVD through ndarray-linalg ---
use ndarray_linalg::{JobSvd, SVDDCInto};

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

impl BackendSVD for NdarrayLinAlgBackend {
    fn thin_svd(&self, matrix: Array2<f64>) -> Result<ThinSvdOutput> {
        let (nrows, ncols) = matrix.dim();
        if matrix.is_empty() {
            return Ok(empty_svd(nrows, ncols));
        }
        let (u, s, vt) = matrix
            .svddc_into(JobSvd::Some)
            .map_err(|e| EofError::NumericalInstability(format!("LAPACK SVD failed: {}", e)))?;
        let u = u.ok_or_else(|| {
            EofError::NumericalInstability("LAPACK SVD did not return U".to_string())
        })?;
        let vt = vt.ok_or_else(|| {
            EofError::NumericalInstability("LAPACK SVD did not return V^T".to_string())
        })?;
        Ok(ThinSvdOutput { u, s, vt })
    }
}

// --- FaerLinAlgBackend: pure-Rust SVD ---
#[cfg(feature = "backend_faer")]
mod faer_specific_code {
    use super::{empty_svd, BackendSVD, ThinSvdOutput};
    use crate::error::{EofError, Result};
    use bytemuck::Pod;
    use faer::linalg::solvers::Svd as FaerSolverSvd;
    use faer::traits::num_traits::Zero;
    use faer::traits::ComplexField;
    use faer::MatRef;
    use ndarray::{Array1, Array2, ShapeBuilder};

    #[derive(Debug, Default, Copy, Clone)]
    pub struct FaerLinAlgBackend;

    fn faer_mat_to_ndarray<F: ComplexField + Copy + Pod + Zero>(faer_mat: MatRef<'_, F>) -> Result<Array2<F>> {
        let nrows = faer_mat.nrows();
        let ncols = faer_mat.ncols();
        let mut data_vec = Vec::with_capacity(nrows * ncols);
        for j in 0..ncols {
            for i in 0..nrows {
                data_vec.push(unsafe { *faer_mat.get_unchecked(i, j) });
            }
        }
        Array2::from_shape_vec((nrows, ncols).f(), data_vec).map_err(|e| {
            EofError::NumericalInstability(format!(
                "Failed to convert a {}x{} faer matrix to ndarray: {}",
                nrows, ncols, e
            ))
        })
    }

    fn faer_col_to_ndarray_vec<F: ComplexField + Copy + Pod + Zero>(faer_col: faer::ColRef<'_, F>) -> Array1<F> {
        (0..faer_col.nrows())
            .map(|i| unsafe { *faer_col.get_unchecked(i) })
            .collect()
    }

    impl BackendSVD for FaerLinAlgBackend {
        fn thin_svd(&self, matrix: Array2<f64>) -> Result<ThinSvdOutput> {
            let (nrows, ncols) = matrix.dim();
            if matrix.is_empty() {
                return Ok(empty_svd(nrows, ncols));
            }
            // faer views need contiguous storage; standard layout is guaranteed here.
            let matrix = matrix.as_standard_layout().into_owned();
            let slice = matrix.as_slice_memory_order().ok_or_else(|| {
                EofError::NumericalInstability(format!(
                    "Failed to get a contiguous slice from a {}x{} matrix",
                    nrows, ncols
                ))
            })?;
            let faer_mat_view = faer::MatRef::from_row_major_slice(slice, nrows, ncols);

            let svd_solver_instance = FaerSolverSvd::new_thin(faer_mat_view)
                .map_err(|e| EofError::NumericalInstability(format!("faer SVD failed: {:?}", e)))?;

            let s = faer_col_to_ndarray_vec(svd_solver_instance.S().column_vector());
            let u = faer_mat_to_ndarray(svd_solver_instance.U().as_ref())?;
            let vt = faer_mat_to_ndarray(svd_solver_instance.V().as_ref())?.t().into_owned();

            Ok(ThinSvdOutput { u, s, vt })
        }
    }
}

/// Dispatches to the backend selected by compile-time feature flags.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider;

impl LinAlgBackendProvider {
    pub fn new() -> Self {
        Self
    }
}

impl BackendSVD for LinAlgBackendProvider {
    fn thin_svd(&self, matrix: Array2<f64>) -> Result<ThinSvdOutput> {
        #[cfg(feature = "backend_faer")]
        {
            faer_specific_code::FaerLinAlgBackend.thin_svd(matrix)
        }
        #[cfg(not(feature = "backend_faer"))]
        {
            NdarrayLinAlgBackend.thin_svd(matrix)
        }
    }
}
