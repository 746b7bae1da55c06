//! Redshift bookkeeping along the line-of-sight axis.
//!
//! Light-cone pixels are evenly spaced in comoving distance, so the redshift of
//! each slice follows from the background cosmology of the simulation that made
//! the cube. A tabulated profile can stand in when the cosmology is not known.

use std::path::Path;

use ndarray::Array1;

use crate::error::{MockError, Result};
use crate::record::LabelVector;

const SPEED_OF_LIGHT_KM_S: f64 = 299_792.458;
const DISTANCE_TABLE_STEPS: usize = 20_000;

pub const DEFAULT_H0: f64 = 67.74;
pub const DEFAULT_Z_START: f64 = 5.0;
pub const DEFAULT_Z_MAX: f64 = 35.05;
/// Photons plus three massless neutrino species for Planck 2015 (h = 0.6774).
pub const PLANCK15_OMEGA_R: f64 = 9.1e-5;

pub trait RedshiftProvider: Send + Sync {
    /// Redshift of each of the `los_len` line-of-sight pixels of a cube whose
    /// pixels are `cell_size` Mpc on a side.
    fn profile(&self, los_len: usize, cell_size: f64, label: &LabelVector) -> Result<Vec<f64>>;
}

/// Comoving distance as a function of redshift for a flat ΛCDM universe.
#[derive(Clone, Debug)]
pub struct DistanceTable {
    redshifts: Vec<f64>,
    distances: Vec<f64>,
}

impl DistanceTable {
    /// Ω_Λ closes the budget: Ω_Λ = 1 − Ω_m − Ω_r.
    pub fn flat_lcdm(h0: f64, omega_m: f64, omega_r: f64, z_max: f64) -> Result<Self> {
        if !(omega_m > 0.0 && omega_m <= 1.0) {
            return Err(MockError::Configuration(format!(
                "Omega_m must lie in (0, 1], got {omega_m}"
            )));
        }
        if !(omega_r >= 0.0 && omega_m + omega_r <= 1.0) {
            return Err(MockError::Configuration(format!(
                "Omega_r ({omega_r}) must be non-negative and leave Omega_m + Omega_r <= 1"
            )));
        }
        if !(h0 > 0.0) || !(z_max > 0.0) {
            return Err(MockError::Configuration(format!(
                "H0 ({h0}) and z_max ({z_max}) must be positive"
            )));
        }
        let hubble_distance = SPEED_OF_LIGHT_KM_S / h0;
        let inverse_e = |z: f64| {
            let a = 1.0 + z;
            let a3 = a.powi(3);
            1.0 / (omega_r * a3 * a + omega_m * a3 + (1.0 - omega_m - omega_r)).sqrt()
        };

        let step = z_max / DISTANCE_TABLE_STEPS as f64;
        let mut redshifts = Vec::with_capacity(DISTANCE_TABLE_STEPS + 1);
        let mut distances = Vec::with_capacity(DISTANCE_TABLE_STEPS + 1);
        let mut acc = 0.0;
        redshifts.push(0.0);
        distances.push(0.0);
        for i in 0..DISTANCE_TABLE_STEPS {
            let z0 = i as f64 * step;
            let z1 = z0 + step;
            // Simpson's rule on each step
            acc += step / 6.0 * (inverse_e(z0) + 4.0 * inverse_e(z0 + 0.5 * step) + inverse_e(z1));
            redshifts.push(z1);
            distances.push(acc * hubble_distance);
        }
        Ok(Self {
            redshifts,
            distances,
        })
    }

    pub fn max_redshift(&self) -> f64 {
        self.redshifts[self.redshifts.len() - 1]
    }

    #[cfg(test)]
    pub fn max_distance(&self) -> f64 {
        self.distances[self.distances.len() - 1]
    }

    /// Comoving distance in Mpc.
    pub fn distance(&self, z: f64) -> Result<f64> {
        lookup(&self.redshifts, &self.distances, z).ok_or_else(|| {
            MockError::Configuration(format!(
                "redshift {z} lies outside the distance table (0..{})",
                self.max_redshift()
            ))
        })
    }

    pub fn redshift(&self, distance: f64) -> Result<f64> {
        lookup(&self.distances, &self.redshifts, distance).ok_or_else(|| {
            MockError::Configuration(format!(
                "comoving distance {distance:.3} Mpc lies beyond z = {}",
                self.max_redshift()
            ))
        })
    }
}

/// Linear interpolation of `ys` at `x` over ascending `xs`; `None` outside the range.
fn lookup(xs: &[f64], ys: &[f64], x: f64) -> Option<f64> {
    let last = xs.len().checked_sub(1)?;
    if !(x >= xs[0] && x <= xs[last]) {
        return None;
    }
    if x == xs[last] {
        return Some(ys[last]);
    }
    let upper = xs.partition_point(|&v| v <= x);
    let lower = upper - 1;
    let t = (x - xs[lower]) / (xs[upper] - xs[lower]);
    Some(ys[lower] + t * (ys[upper] - ys[lower]))
}

/// Redshifts of evenly spaced comoving slices, using the cube's own Ω_m label.
///
/// The background is flat with matter, radiation (`omega_r`, Planck 2015 by
/// default) and Λ. Massive-neutrino corrections are left out.
#[derive(Clone, Debug)]
pub struct CosmologyRedshifts {
    pub h0: f64,
    pub omega_r: f64,
    pub z_start: f64,
    pub z_max: f64,
}

impl Default for CosmologyRedshifts {
    fn default() -> Self {
        Self {
            h0: DEFAULT_H0,
            omega_r: PLANCK15_OMEGA_R,
            z_start: DEFAULT_Z_START,
            z_max: DEFAULT_Z_MAX,
        }
    }
}

impl RedshiftProvider for CosmologyRedshifts {
    fn profile(&self, los_len: usize, cell_size: f64, label: &LabelVector) -> Result<Vec<f64>> {
        let omega_m = label.omega_m().ok_or_else(|| {
            MockError::Configuration("label vector carries no Omega_m parameter".to_string())
        })?;
        let table = DistanceTable::flat_lcdm(self.h0, omega_m, self.omega_r, self.z_max)?;
        let origin = table.distance(self.z_start)?;
        (0..los_len)
            .map(|i| table.redshift(origin + i as f64 * cell_size))
            .collect()
    }
}

/// One fixed profile shared by every cube.
#[derive(Clone, Debug)]
pub struct TabulatedRedshifts {
    profile: Vec<f64>,
}

impl TabulatedRedshifts {
    pub fn new(profile: Vec<f64>) -> Self {
        Self { profile }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let values: Array1<f64> = ndarray_npy::read_npy(path)?;
        Ok(Self::new(values.to_vec()))
    }
}

impl RedshiftProvider for TabulatedRedshifts {
    fn profile(&self, los_len: usize, _cell_size: f64, _label: &LabelVector) -> Result<Vec<f64>> {
        if self.profile.len() != los_len {
            return Err(MockError::ShapeMismatch(format!(
                "tabulated redshift profile has {} entries, cube has {} line-of-sight pixels",
                self.profile.len(),
                los_len
            )));
        }
        Ok(self.profile.clone())
    }
}

/// Checks the reference sub-band redshifts: non-empty and strictly ascending,
/// the order the segmenter walks them in.
pub fn validate_boundaries(boundaries: &[f64]) -> Result<()> {
    if boundaries.is_empty() {
        return Err(MockError::Configuration(
            "sub-band boundary table is empty".to_string(),
        ));
    }
    if let Some(pos) = boundaries.windows(2).position(|w| !(w[0] < w[1])) {
        return Err(MockError::Configuration(format!(
            "sub-band boundary redshifts must be strictly ascending: {} then {} at index {}",
            boundaries[pos],
            boundaries[pos + 1],
            pos + 1
        )));
    }
    Ok(())
}

/// Loads the reference sub-band redshifts from a 1-D `.npy` file.
pub fn load_boundaries(path: &Path) -> Result<Vec<f64>> {
    if !path.is_file() {
        return Err(MockError::Configuration(format!(
            "sub-band boundary table {} not found",
            path.display()
        )));
    }
    let values: Array1<f64> = ndarray_npy::read_npy(path)?;
    let boundaries = values.to_vec();
    validate_boundaries(&boundaries)?;
    Ok(boundaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn label_with_omega_m(omega_m: f32) -> LabelVector {
        LabelVector {
            parameters: vec![2.0, omega_m, 40.0, 500.0, 4.7, 30.0],
            ..LabelVector::default()
        }
    }

    #[test]
    fn matter_only_distance_matches_closed_form() {
        let table = DistanceTable::flat_lcdm(70.0, 1.0, 0.0, 20.0).unwrap();
        let hubble_distance = SPEED_OF_LIGHT_KM_S / 70.0;
        for z in [0.5_f64, 3.0, 7.25, 19.0] {
            let exact = 2.0 * hubble_distance * (1.0 - 1.0 / (1.0 + z).sqrt());
            assert_relative_eq!(table.distance(z).unwrap(), exact, max_relative = 1e-6);
            assert_relative_eq!(table.redshift(exact).unwrap(), z, max_relative = 1e-5);
        }
        assert!(table.distance(25.0).is_err());
        assert!(table.redshift(table.max_distance() + 1.0).is_err());
    }

    #[test]
    fn profile_starts_at_z_start_and_increases() {
        let provider = CosmologyRedshifts::default();
        let cell = 200.0 / 140.0;
        let profile = provider.profile(500, cell, &label_with_omega_m(0.31)).unwrap();
        assert_eq!(profile.len(), 500);
        assert_relative_eq!(profile[0], DEFAULT_Z_START, max_relative = 1e-9);
        assert!(profile.windows(2).all(|w| w[1] > w[0]));
        // Denser matter means less distance per unit redshift, so redshift grows faster.
        let dense = provider.profile(500, cell, &label_with_omega_m(0.4)).unwrap();
        assert!(dense[499] > profile[499]);
    }

    #[test]
    fn profile_beyond_table_is_rejected() {
        let provider = CosmologyRedshifts {
            z_max: 6.0,
            ..CosmologyRedshifts::default()
        };
        assert!(matches!(
            provider.profile(100, 50.0, &label_with_omega_m(0.3)),
            Err(MockError::Configuration(_))
        ));
    }

    #[test]
    fn invalid_omega_m_is_rejected() {
        let provider = CosmologyRedshifts::default();
        assert!(provider.profile(4, 1.0, &label_with_omega_m(0.0)).is_err());
        assert!(provider.profile(4, 1.0, &LabelVector::default()).is_err());
    }

    #[test]
    fn tabulated_profile_must_match_cube() {
        let provider = TabulatedRedshifts::new(vec![5.0, 5.1, 5.2]);
        assert_eq!(provider.profile(3, 1.0, &LabelVector::default()).unwrap().len(), 3);
        assert!(matches!(
            provider.profile(4, 1.0, &LabelVector::default()),
            Err(MockError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn boundaries_round_trip_through_npy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redshifts.npy");
        ndarray_npy::write_npy(&path, &ndarray::array![5.0, 5.5, 6.2, 7.0]).unwrap();
        assert_eq!(load_boundaries(&path).unwrap(), vec![5.0, 5.5, 6.2, 7.0]);
        assert!(matches!(
            load_boundaries(&dir.path().join("absent.npy")),
            Err(MockError::Configuration(_))
        ));
    }

    #[test]
    fn boundaries_must_ascend() {
        assert!(validate_boundaries(&[5.0, 6.0, 7.0]).is_ok());
        assert!(validate_boundaries(&[5.0]).is_ok());
        assert!(validate_boundaries(&[]).is_err());
        assert!(validate_boundaries(&[5.0, 5.0]).is_err());
        assert!(validate_boundaries(&[5.0, 7.0, 6.0]).is_err());
        assert!(matches!(
            validate_boundaries(&[10.0, 5.0, 0.0]),
            Err(MockError::Configuration(_))
        ));
    }

    #[test]
    fn descending_boundary_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redshifts.npy");
        ndarray_npy::write_npy(&path, &ndarray::array![7.0, 6.2, 5.5, 5.0]).unwrap();
        assert!(matches!(
            load_boundaries(&path),
            Err(MockError::Configuration(_))
        ));
    }

    #[test]
    fn radiation_shortens_distances() {
        let dust = DistanceTable::flat_lcdm(DEFAULT_H0, 0.31, 0.0, 40.0).unwrap();
        let hot = DistanceTable::flat_lcdm(DEFAULT_H0, 0.31, PLANCK15_OMEGA_R, 40.0).unwrap();
        let (d_low, d_high) = (dust.distance(35.0).unwrap(), hot.distance(35.0).unwrap());
        assert!(d_high < d_low);
        // Sub-percent at these redshifts.
        assert!((d_low - d_high) / d_low < 1e-2);
        assert!(DistanceTable::flat_lcdm(DEFAULT_H0, 1.0, 1e-4, 10.0).is_err());
        assert!(DistanceTable::flat_lcdm(DEFAULT_H0, 0.3, -1e-4, 10.0).is_err());
    }
}
