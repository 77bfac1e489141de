// Leading EOF of a synthetic monthly sea-surface-temperature anomaly field.
//
// Run with `cargo run --example sst_leading_mode`.

use efficient_eof::weights::{latitude_weights, LatitudeWeighting};
use efficient_eof::{Eof, EofOptions, PcScaling};
use ndarray::{Array1, Array3, Axis};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use std::f64::consts::PI;
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    let (n_time, n_lat, n_lon) = (240, 19, 36);
    let lats = Array1::linspace(-45.0, 45.0, n_lat);
    let lons = Array1::linspace(120.0, 290.0, n_lon);

    // An equatorial warm pattern with an irregular 3-5 year cycle plus noise.
    let signal = Array1::from_shape_fn(n_time, |t| {
        let t = t as f64;
        (2.0 * PI * t / 44.0).sin() + 0.4 * (2.0 * PI * t / 61.0).cos()
    });
    let noise = Array3::random((n_time, n_lat, n_lon), Normal::new(0.0, 0.3)?);
    let mut sst = Array3::from_shape_fn((n_time, n_lat, n_lon), |(t, i, j)| {
        let lat: f64 = lats[i];
        let lon: f64 = lons[j];
        let pattern = (-(lat / 10.0).powi(2)).exp() * (-((lon - 230.0) / 40.0).powi(2)).exp();
        26.0 + 2.0 * pattern * signal[t]
    });
    sst += &noise;

    // Mark a land block as missing at every time step.
    for mut step in sst.axis_iter_mut(Axis(0)) {
        for i in 12..16 {
            for j in 30..34 {
                step[[i, j]] = f64::NAN;
            }
        }
    }

    let weights = latitude_weights(lats.view(), &[n_lat, n_lon], 0, LatitudeWeighting::SqrtCosLat)?;
    let solver = Eof::new(
        sst.view(),
        EofOptions {
            weights: Some(weights),
            ..EofOptions::default()
        },
    )?;

    let variance_fraction = solver.variance_fraction(3)?;
    println!(
        "Solver: {} time steps, {} of {} points used, rank {}",
        solver.n_time(),
        solver.n_retained(),
        n_lat * n_lon,
        solver.rank()
    );
    println!("Variance fractions of the leading modes: {:.4}", variance_fraction);

    let correlation = solver.eofs_as_correlation(1)?;
    let equator = correlation.index_axis(Axis(0), 0).index_axis(Axis(0), n_lat / 2).to_owned();
    println!("EOF1 as correlation along the equator: {:.2}", equator);

    let pc1 = solver.pcs(1, PcScaling::Unit)?;
    println!("First 12 months of PC1 (unit variance): {:.2}", pc1.column(0).slice(ndarray::s![..12]));

    let errors = solver.north_test(3, true)?;
    println!("North et al. typical errors (variance fraction): {:.4}", errors);
    Ok(())
}
