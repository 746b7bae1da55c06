//! Thermal-noise injection for one line-of-sight sub-volume.
//!
//! The sub-volume is transformed to Fourier space, each mode receives a
//! complex Gaussian draw whose variance follows the sub-band's sensitivity
//! table at that mode's radial wavenumber, and the result is transformed back.
//! Modes whose tabulated error reaches the mask threshold are zeroed outright,
//! signal included.

use std::f64::consts::PI;

use log::debug;
use ndarray::{Array3, ArrayView3, Zip};
use num_complex::Complex;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{MockError, Result};
use crate::fft::{real_wavenumbers, wavenumbers, CubeFft};
use crate::sensitivity::SensitivityTable;

pub const DEFAULT_MASK_THRESHOLD: f64 = 1000.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoiseSummary {
    pub noisy_modes: usize,
    pub masked_modes: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct NoiseSynthesizer {
    cell_size: f64,
    mask_threshold: f64,
}

impl NoiseSynthesizer {
    /// `cell_size` is the comoving side of one pixel in Mpc.
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size,
            mask_threshold: DEFAULT_MASK_THRESHOLD,
        }
    }

    pub fn with_mask_threshold(mut self, mask_threshold: f64) -> Self {
        self.mask_threshold = mask_threshold;
        self
    }

    /// Radial wavenumber `|k|` of every mode in the half-spectrum of a cube of `shape`.
    pub fn wavenumber_field(&self, shape: (usize, usize, usize)) -> Array3<f64> {
        let (dx, dy, dz) = shape;
        let kx = wavenumbers(dx, self.cell_size);
        let ky = wavenumbers(dy, self.cell_size);
        let kz = real_wavenumbers(dz, self.cell_size);
        Array3::from_shape_fn((dx, dy, kz.len()), |(i, j, l)| {
            (kx[i] * kx[i] + ky[j] * ky[j] + kz[l] * kz[l]).sqrt()
        })
    }

    /// Produces the noisy counterpart of `subvolume`.
    pub fn synthesize<R: Rng + ?Sized>(
        &self,
        subvolume: ArrayView3<'_, f64>,
        table: &SensitivityTable,
        rng: &mut R,
    ) -> Result<Array3<f64>> {
        let shape = subvolume.dim();
        if shape.0 == 0 || shape.1 == 0 || shape.2 == 0 {
            return Err(MockError::ShapeMismatch(format!(
                "sub-volume {shape:?} has an empty axis"
            )));
        }
        let fft = CubeFft::new(shape);
        let mut spectrum = fft.forward(subvolume)?;
        let summary = self.inject_noise(&mut spectrum, shape, table, rng)?;
        debug!(
            "sub-volume {:?}: {} noisy modes, {} masked modes",
            shape, summary.noisy_modes, summary.masked_modes
        );
        fft.inverse(spectrum)
    }

    /// Adds noise to (or masks) every mode of a half-spectrum of a cube of `shape`.
    pub fn inject_noise<R: Rng + ?Sized>(
        &self,
        spectrum: &mut Array3<Complex<f64>>,
        shape: (usize, usize, usize),
        table: &SensitivityTable,
        rng: &mut R,
    ) -> Result<NoiseSummary> {
        let kmag = self.wavenumber_field(shape);
        if spectrum.dim() != kmag.dim() {
            return Err(MockError::ShapeMismatch(format!(
                "half-spectrum {:?} does not belong to a cube of {:?}",
                spectrum.dim(),
                shape
            )));
        }
        let errors = table.interpolate_field(&kmag)?;

        let cell_volume = self.cell_size.powi(3);
        let volume = (shape.0 * shape.1 * shape.2) as f64 * cell_volume;
        let zero = Complex::new(0.0, 0.0);
        let mut summary = NoiseSummary::default();

        Zip::from(spectrum)
            .and(&kmag)
            .and(&errors)
            .for_each(|mode, &k, &err| {
                let noise = if k > 0.0 {
                    let amplitude = (PI * PI * volume / k.powi(3) * err).sqrt();
                    let re: f64 = rng.sample(StandardNormal);
                    let im: f64 = rng.sample(StandardNormal);
                    Complex::new(re, im) * amplitude
                } else {
                    zero
                };
                if err >= self.mask_threshold {
                    *mode = zero;
                    summary.masked_modes += 1;
                } else {
                    *mode += noise / cell_volume;
                    summary.noisy_modes += 1;
                }
            });
        Ok(summary)
    }
}
