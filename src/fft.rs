use std::f64::consts::PI;
use std::sync::Arc;

use ndarray::{Array3, ArrayView1, ArrayView3, Axis};
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::error::{MockError, Result};

/// Plans for a real-input 3D transform over a `(dx, dy, dz)` cube.
///
/// The last axis goes through the real/half-spectrum transform, the two
/// leading axes through full complex transforms, which gives the same layout
/// and scaling as numpy's `rfftn`/`irfftn`.
pub struct CubeFft {
    shape: (usize, usize, usize),
    forward_r2c: Arc<dyn RealToComplex<f64>>,
    inverse_c2r: Arc<dyn ComplexToReal<f64>>,
    forward_x: Arc<dyn Fft<f64>>,
    inverse_x: Arc<dyn Fft<f64>>,
    forward_y: Arc<dyn Fft<f64>>,
    inverse_y: Arc<dyn Fft<f64>>,
}

impl CubeFft {
    pub fn new(shape: (usize, usize, usize)) -> Self {
        let (dx, dy, dz) = shape;
        let mut planner_c2c = FftPlanner::new();
        let mut planner_r2c = RealFftPlanner::new();

        Self {
            shape,
            forward_r2c: planner_r2c.plan_fft_forward(dz),
            inverse_c2r: planner_r2c.plan_fft_inverse(dz),
            forward_x: planner_c2c.plan_fft_forward(dx),
            inverse_x: planner_c2c.plan_fft_inverse(dx),
            forward_y: planner_c2c.plan_fft_forward(dy),
            inverse_y: planner_c2c.plan_fft_inverse(dy),
        }
    }

    /// Number of non-negative frequencies kept along the last axis.
    pub fn half_len(&self) -> usize {
        self.shape.2 / 2 + 1
    }

    /// Unnormalised forward transform producing the `(dx, dy, dz/2 + 1)` half-spectrum.
    pub fn forward(&self, cube: ArrayView3<'_, f64>) -> Result<Array3<Complex<f64>>> {
        if cube.dim() != self.shape {
            return Err(MockError::ShapeMismatch(format!(
                "forward transform planned for {:?}, got {:?}",
                self.shape,
                cube.dim()
            )));
        }
        let (dx, dy, _) = self.shape;
        let mut spectrum = Array3::<Complex<f64>>::zeros((dx, dy, self.half_len()));

        let mut line = self.forward_r2c.make_input_vec();
        let mut half = self.forward_r2c.make_output_vec();
        let mut scratch = self.forward_r2c.make_scratch_vec();
        for (input, mut output) in cube
            .lanes(Axis(2))
            .into_iter()
            .zip(spectrum.lanes_mut(Axis(2)))
        {
            for (dst, &src) in line.iter_mut().zip(input.iter()) {
                *dst = src;
            }
            self.forward_r2c
                .process_with_scratch(&mut line, &mut half, &mut scratch)?;
            output.assign(&ArrayView1::from(&half[..]));
        }

        transform_axis(&mut spectrum, Axis(1), self.forward_y.as_ref());
        transform_axis(&mut spectrum, Axis(0), self.forward_x.as_ref());
        Ok(spectrum)
    }

    /// Inverse of [`CubeFft::forward`], scaled by `1 / (dx * dy * dz)`.
    pub fn inverse(&self, mut spectrum: Array3<Complex<f64>>) -> Result<Array3<f64>> {
        let (dx, dy, dz) = self.shape;
        if spectrum.dim() != (dx, dy, self.half_len()) {
            return Err(MockError::ShapeMismatch(format!(
                "inverse transform expects half-spectrum {:?}, got {:?}",
                (dx, dy, self.half_len()),
                spectrum.dim()
            )));
        }

        transform_axis(&mut spectrum, Axis(0), self.inverse_x.as_ref());
        transform_axis(&mut spectrum, Axis(1), self.inverse_y.as_ref());

        let mut cube = Array3::<f64>::zeros(self.shape);
        let scale = 1.0 / (dx * dy * dz) as f64;
        let mut half = self.inverse_c2r.make_input_vec();
        let mut line = self.inverse_c2r.make_output_vec();
        let mut scratch = self.inverse_c2r.make_scratch_vec();
        for (input, mut output) in spectrum
            .lanes(Axis(2))
            .into_iter()
            .zip(cube.lanes_mut(Axis(2)))
        {
            for (dst, &src) in half.iter_mut().zip(input.iter()) {
                *dst = src;
            }
            // A real output needs purely real DC and (for even lengths) Nyquist bins.
            half[0].im = 0.0;
            if dz % 2 == 0 {
                let nyquist_idx = dz / 2;
                half[nyquist_idx].im = 0.0;
            }
            self.inverse_c2r
                .process_with_scratch(&mut half, &mut line, &mut scratch)?;
            for (dst, &src) in output.iter_mut().zip(line.iter()) {
                *dst = src * scale;
            }
        }
        Ok(cube)
    }
}

fn transform_axis(spectrum: &mut Array3<Complex<f64>>, axis: Axis, plan: &dyn Fft<f64>) {
    let zero = Complex::new(0.0, 0.0);
    let mut buffer = vec![zero; spectrum.len_of(axis)];
    let mut scratch = vec![zero; plan.get_inplace_scratch_len()];
    for mut lane in spectrum.lanes_mut(axis) {
        for (dst, src) in buffer.iter_mut().zip(lane.iter()) {
            *dst = *src;
        }
        plan.process_with_scratch(&mut buffer, &mut scratch);
        for (dst, src) in lane.iter_mut().zip(buffer.iter()) {
            *dst = *src;
        }
    }
}

/// Sample frequencies of a full-length transform, numpy `fftfreq` ordering.
pub fn fftfreq(n: usize, spacing: f64) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    let scale = 1.0 / (n as f64 * spacing);
    let positive = (n - 1) / 2 + 1;
    (0..n)
        .map(|i| {
            let index = if i < positive {
                i as f64
            } else {
                i as f64 - n as f64
            };
            index * scale
        })
        .collect()
}

/// Non-negative sample frequencies of a real transform (numpy `rfftfreq`).
pub fn rfftfreq(n: usize, spacing: f64) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    let scale = 1.0 / (n as f64 * spacing);
    (0..n / 2 + 1).map(|i| i as f64 * scale).collect()
}

/// Angular wavenumbers (rad / length unit) of a full transform over `n` cells.
pub fn wavenumbers(n: usize, cell_size: f64) -> Vec<f64> {
    fftfreq(n, cell_size / (2.0 * PI))
}

/// Angular wavenumbers of the half-spectrum axis of a real transform.
pub fn real_wavenumbers(n: usize, cell_size: f64) -> Vec<f64> {
    rfftfreq(n, cell_size / (2.0 * PI))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn naive_dft(cube: &Array3<f64>) -> Array3<Complex<f64>> {
        let (dx, dy, dz) = cube.dim();
        Array3::from_shape_fn((dx, dy, dz / 2 + 1), |(u, v, w)| {
            let mut acc = Complex::new(0.0, 0.0);
            for ((x, y, z), &value) in cube.indexed_iter() {
                let phase = -2.0
                    * PI
                    * ((u * x) as f64 / dx as f64
                        + (v * y) as f64 / dy as f64
                        + (w * z) as f64 / dz as f64);
                acc += Complex::from_polar(value, phase);
            }
            acc
        })
    }

    #[test]
    fn forward_matches_direct_dft() {
        let cube = Array3::from_shape_fn((3, 4, 5), |(x, y, z)| {
            (x as f64 * 0.7 - y as f64 * 0.3 + (z * z) as f64 * 0.11).sin()
        });
        let fft = CubeFft::new(cube.dim());
        let fast = fft.forward(cube.view()).unwrap();
        let slow = naive_dft(&cube);
        assert_eq!(fast.dim(), (3, 4, 3));
        for (a, b) in fast.iter().zip(slow.iter()) {
            assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-9);
            assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-9);
        }
    }

    #[test]
    fn sinusoid_round_trip() {
        let (dx, dy, dz) = (6, 6, 8);
        let cube = Array3::from_shape_fn((dx, dy, dz), |(x, y, z)| {
            3.0 * (2.0 * PI * (x as f64 / dx as f64 + 2.0 * z as f64 / dz as f64)).cos()
                + 0.5 * y as f64
        });
        let fft = CubeFft::new(cube.dim());
        let spectrum = fft.forward(cube.view()).unwrap();
        let back = fft.inverse(spectrum).unwrap();
        for (a, b) in back.iter().zip(cube.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn odd_line_of_sight_round_trip() {
        let cube = Array3::from_shape_fn((4, 4, 7), |(x, y, z)| (x * 7 + y * 3 + z) as f64);
        let fft = CubeFft::new(cube.dim());
        let back = fft.inverse(fft.forward(cube.view()).unwrap()).unwrap();
        for (a, b) in back.iter().zip(cube.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn rejects_wrong_shape() {
        let fft = CubeFft::new((4, 4, 4));
        let cube = Array3::<f64>::zeros((4, 4, 5));
        assert!(matches!(
            fft.forward(cube.view()),
            Err(MockError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn frequency_grids_follow_numpy_layout() {
        assert_eq!(fftfreq(4, 1.0), vec![0.0, 0.25, -0.5, -0.25]);
        assert_eq!(fftfreq(5, 0.5), vec![0.0, 0.4, 0.8, -0.8, -0.4]);
        assert_eq!(rfftfreq(5, 1.0), vec![0.0, 0.2, 0.4]);
        assert_eq!(rfftfreq(1, 1.0), vec![0.0]);
        assert!(fftfreq(0, 1.0).is_empty());

        let k = wavenumbers(4, 2.0);
        assert_abs_diff_eq!(k[1], 2.0 * PI / 8.0, epsilon = 1e-12);
        assert_abs_diff_eq!(real_wavenumbers(8, 2.0)[4], PI / 2.0, epsilon = 1e-12);
    }
}
