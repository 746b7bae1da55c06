//! Per-cube orchestration and the batch loop.
//!
//! Each cube is cut into sub-band sub-volumes along the line of sight, the
//! sub-volumes receive noise in parallel on the rayon pool, and the noisy
//! pieces are stitched back together. Records stream in from a reader thread
//! and leave through a single writer.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use log::{debug, info, warn};
use ndarray::{Array3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::config::RunConfig;
use crate::error::{MockError, Result};
use crate::noise::{NoiseSynthesizer, DEFAULT_MASK_THRESHOLD};
use crate::plot::{plot_log_curves, plot_multi_series_f64_x, BLUE, RED};
use crate::reassemble::reassemble;
use crate::record::{LabelVector, LightconeRecord, RecordReader, RecordWriter};
use crate::redshift::{
    validate_boundaries, CosmologyRedshifts, RedshiftProvider, TabulatedRedshifts,
};
use crate::segment::{segment_lightcone, split_subvolumes, SubVolumeRange};
use crate::sensitivity::{ForegroundModel, SensitivityCatalog, SensitivityTable};

const RECORD_QUEUE_DEPTH: usize = 2;
const CUBE_SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;
const BAND_SEED_MIX: u64 = 0xC2B2_AE3D_27D4_EB4F;

/// A finished mock and the bookkeeping that produced it.
#[derive(Clone, Debug)]
pub struct MockCube {
    pub cube: Array3<f64>,
    pub profile: Vec<f64>,
    pub ranges: Vec<SubVolumeRange>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchSummary {
    pub output: PathBuf,
    pub cubes: usize,
}

pub struct MockPipeline {
    model: ForegroundModel,
    tables: Vec<SensitivityTable>,
    boundaries: Vec<f64>,
    redshifts: Box<dyn RedshiftProvider>,
    box_length_mpc: f64,
    mask_threshold: f64,
    seed: Option<u64>,
    transverse: Option<(usize, usize)>,
}

impl MockPipeline {
    /// `tables[i]` serves sub-band `i`; bands without a table fail when first used.
    pub fn new(
        model: ForegroundModel,
        tables: Vec<SensitivityTable>,
        boundaries: Vec<f64>,
        redshifts: Box<dyn RedshiftProvider>,
    ) -> Result<Self> {
        validate_boundaries(&boundaries)?;
        Ok(Self {
            model,
            tables,
            boundaries,
            redshifts,
            box_length_mpc: crate::config::DEFAULT_BOX_LENGTH_MPC,
            mask_threshold: DEFAULT_MASK_THRESHOLD,
            seed: None,
            transverse: None,
        })
    }

    /// Loads one table per boundary from the catalog and picks the redshift source.
    pub fn from_config(
        cfg: &RunConfig,
        catalog: &SensitivityCatalog,
        boundaries: Vec<f64>,
    ) -> Result<Self> {
        catalog.ensure_covers(boundaries.len())?;
        let tables = (0..boundaries.len())
            .map(|band| catalog.load(band))
            .collect::<Result<Vec<_>>>()?;
        let redshifts: Box<dyn RedshiftProvider> = match &cfg.redshifts {
            Some(path) => Box::new(TabulatedRedshifts::load(path)?),
            None => Box::new(CosmologyRedshifts {
                h0: cfg.h0,
                z_start: cfg.z_start,
                z_max: cfg.z_max,
                ..CosmologyRedshifts::default()
            }),
        };
        Ok(Self::new(catalog.model(), tables, boundaries, redshifts)?
            .with_box_length(cfg.box_length_mpc)
            .with_mask_threshold(cfg.mask_threshold)
            .with_seed(cfg.seed))
    }

    pub fn with_box_length(mut self, box_length_mpc: f64) -> Self {
        self.box_length_mpc = box_length_mpc;
        self
    }

    pub fn with_mask_threshold(mut self, mask_threshold: f64) -> Self {
        self.mask_threshold = mask_threshold;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    fn table(&self, band: usize) -> Result<&SensitivityTable> {
        self.tables.get(band).ok_or(MockError::MissingTable {
            model: self.model,
            index: band,
        })
    }

    fn band_rng(&self, cube: usize, band: usize) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(
                seed ^ (cube as u64).wrapping_mul(CUBE_SEED_MIX)
                    ^ (band as u64 + 1).wrapping_mul(BAND_SEED_MIX),
            ),
            None => StdRng::from_entropy(),
        }
    }

    fn check_transverse(&mut self, shape: (usize, usize, usize)) -> Result<()> {
        let (dx, dy, dz) = shape;
        if dx == 0 || dy == 0 || dz == 0 {
            return Err(MockError::ShapeMismatch(format!(
                "light-cone {shape:?} has an empty axis"
            )));
        }
        match self.transverse {
            None => self.transverse = Some((dx, dy)),
            Some(expected) if expected != (dx, dy) => {
                return Err(MockError::ShapeMismatch(format!(
                    "transverse shape changed from {expected:?} to {:?}",
                    (dx, dy)
                )));
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Turns one noiseless light-cone into its mock observation.
    pub fn process_cube(
        &mut self,
        index: usize,
        cube: &Array3<f64>,
        label: &LabelVector,
    ) -> Result<MockCube> {
        let shape = cube.dim();
        self.check_transverse(shape)?;
        let cell_size = self.box_length_mpc / shape.0 as f64;

        let profile = self.redshifts.profile(shape.2, cell_size, label)?;
        if profile.len() != shape.2 {
            return Err(MockError::ShapeMismatch(format!(
                "redshift profile has {} entries, cube has {} line-of-sight pixels",
                profile.len(),
                shape.2
            )));
        }
        let ranges = segment_lightcone(&profile, &self.boundaries);
        let views = split_subvolumes(cube.view(), &ranges)?;
        for range in &ranges {
            debug!(
                "cube {index}: sub-band {} covers pixels {}..{} (z {:.3}..{:.3})",
                range.band,
                range.start,
                range.end(),
                profile[range.start.min(shape.2 - 1)],
                profile[range.end().saturating_sub(1).min(shape.2 - 1)]
            );
        }

        let synthesizer = NoiseSynthesizer::new(cell_size).with_mask_threshold(self.mask_threshold);
        let this = &*self;
        let parts = views
            .into_par_iter()
            .zip(ranges.par_iter())
            .map(|(view, range)| {
                let table = this.table(range.band).map_err(|e| e.in_band(range.band))?;
                let mut rng = this.band_rng(index, range.band);
                synthesizer
                    .synthesize(view, table, &mut rng)
                    .map_err(|e| e.in_band(range.band))
            })
            .collect::<Result<Vec<_>>>()?;

        let mock = reassemble(&parts, shape)?;
        Ok(MockCube {
            cube: mock,
            profile,
            ranges,
        })
    }

    /// Processes every record of `input` into `output`.
    ///
    /// On failure the records already written are kept and the error names the cube.
    pub fn run_batch(
        &mut self,
        input: &Path,
        output: &Path,
        plot_dir: Option<&Path>,
    ) -> Result<BatchSummary> {
        let reader = RecordReader::open(input)?;
        if let Some(n) = reader.expected_records() {
            info!("{}: {} light-cones", input.display(), n);
        }
        let (tx, rx) = mpsc::sync_channel::<Result<LightconeRecord>>(RECORD_QUEUE_DEPTH);
        let producer = thread::spawn(move || {
            for record in reader {
                let failed = record.is_err();
                if tx.send(record).is_err() || failed {
                    // Receiver hung up or the stream is broken.
                    break;
                }
            }
        });

        let mut writer = RecordWriter::create(output)?;
        let drained = self.drain(&rx, &mut writer, plot_dir);
        drop(rx);
        let joined = producer.join();
        let closed = writer.close();

        let cubes = drained?;
        if joined.is_err() {
            return Err(MockError::Record(format!(
                "reader thread for {} panicked",
                input.display()
            )));
        }
        let output = closed?;
        info!("wrote {} mock light-cones to {}", cubes, output.display());
        Ok(BatchSummary { output, cubes })
    }

    fn drain(
        &mut self,
        rx: &mpsc::Receiver<Result<LightconeRecord>>,
        writer: &mut RecordWriter,
        plot_dir: Option<&Path>,
    ) -> Result<usize> {
        for (index, record) in rx.iter().enumerate() {
            let record = record.map_err(|e| e.in_cube(index))?;
            let mock = self
                .process_cube(index, &record.cube, &record.label)
                .map_err(|e| e.in_cube(index))?;
            writer
                .write(&mock.cube, &record.label)
                .map_err(|e| e.in_cube(index))?;
            info!(
                "cube {index}: {} sub-bands, mean signal {:.4}, mean mock {:.4}",
                mock.ranges.len(),
                record.cube.mean().unwrap_or(0.0),
                mock.cube.mean().unwrap_or(0.0)
            );
            if let Some(dir) = plot_dir {
                let path = dir.join(format!("cube_{index:04}_los_mean.png"));
                if let Err(e) = plot_los_means(&mock.profile, &record.cube, &mock.cube, &path) {
                    warn!("cube {index}: {e}");
                }
            }
        }
        Ok(writer.records_written() as usize)
    }

    /// Writes the error curve of every loaded sub-band table.
    pub fn plot_sensitivity(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("sensitivity_{}.png", self.model));
        let labels: Vec<String> = self
            .boundaries
            .iter()
            .enumerate()
            .take(self.tables.len())
            .map(|(band, z)| format!("band {band} (z = {z:.2})"))
            .collect();
        let curves: Vec<(&[f64], &[f64], String)> = self
            .tables
            .iter()
            .zip(labels)
            .map(|(table, label)| (table.ks(), table.errors(), label))
            .collect();
        plot_log_curves(&curves, &path, "k [1/Mpc]", "log10 error [mK^2]")
            .map_err(|e| MockError::Plot(e.to_string()))?;
        Ok(path)
    }
}

/// Mean brightness of every line-of-sight slice.
pub fn los_mean(cube: &Array3<f64>) -> Vec<f64> {
    cube.mean_axis(Axis(0))
        .and_then(|plane| plane.mean_axis(Axis(0)))
        .map(|means| means.to_vec())
        .unwrap_or_default()
}

fn plot_los_means(
    profile: &[f64],
    signal: &Array3<f64>,
    mock: &Array3<f64>,
    path: &Path,
) -> Result<()> {
    let signal_mean = los_mean(signal);
    let mock_mean = los_mean(mock);
    plot_multi_series_f64_x(
        profile,
        &[
            (signal_mean.as_slice(), &BLUE, "signal"),
            (mock_mean.as_slice(), &RED, "mock"),
        ],
        path,
        "redshift",
        "mean brightness temperature [mK]",
    )
    .map_err(|e| MockError::Plot(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const PROFILE: [f64; 8] = [1.0, 1.5, 2.0, 2.4, 3.0, 3.5, 4.0, 4.5];

    fn pipeline(tables: Vec<SensitivityTable>) -> MockPipeline {
        MockPipeline::new(
            ForegroundModel::Opt,
            tables,
            vec![0.0, 5.0, 10.0],
            Box::new(TabulatedRedshifts::new(PROFILE.to_vec())),
        )
        .unwrap()
        .with_box_length(8.0)
    }

    fn ramp_cube(offset: f64) -> Array3<f64> {
        Array3::from_shape_fn((4, 4, 8), |(i, j, k)| offset + (i + 2 * j) as f64 * 0.25 + k as f64)
    }

    #[test]
    fn zero_error_tables_reproduce_constant_cube() {
        let mut pipeline = pipeline(vec![SensitivityTable::constant(0.0); 2]);
        let cube = Array3::from_elem((4, 4, 8), 3.0);
        let mock = pipeline.process_cube(0, &cube, &LabelVector::default()).unwrap();
        let lengths: Vec<usize> = mock.ranges.iter().map(|r| r.len).collect();
        assert_eq!(lengths, vec![4, 4]);
        assert_eq!(mock.cube.dim(), cube.dim());
        for (a, b) in mock.cube.iter().zip(cube.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
        }
    }

    #[test]
    fn noisy_mock_keeps_shape_and_slice_means() {
        let mut pipeline = pipeline(vec![SensitivityTable::constant(5.0); 2]).with_seed(Some(3));
        let cube = ramp_cube(0.0);
        let mock = pipeline.process_cube(0, &cube, &LabelVector::default()).unwrap();
        assert_eq!(mock.cube.dim(), cube.dim());
        assert!(mock.cube.iter().zip(cube.iter()).any(|(a, b)| (a - b).abs() > 1e-6));
        // The k = 0 mode of each sub-volume is untouched, so each sub-volume mean survives.
        for range in &mock.ranges {
            let slice = ndarray::s![.., .., range.start..range.end()];
            assert_abs_diff_eq!(
                mock.cube.slice(slice).mean().unwrap(),
                cube.slice(slice).mean().unwrap(),
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn saturated_tables_blank_the_cube() {
        let mut pipeline = pipeline(vec![SensitivityTable::constant(5000.0); 2]);
        let mock = pipeline
            .process_cube(0, &ramp_cube(1.0), &LabelVector::default())
            .unwrap();
        assert!(mock.cube.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn seeded_runs_repeat_and_vary_per_cube() {
        let tables = vec![SensitivityTable::constant(2.0); 2];
        let cube = ramp_cube(0.0);
        let label = LabelVector::default();
        let a = pipeline(tables.clone()).with_seed(Some(11)).process_cube(0, &cube, &label).unwrap();
        let b = pipeline(tables.clone()).with_seed(Some(11)).process_cube(0, &cube, &label).unwrap();
        let c = pipeline(tables).with_seed(Some(11)).process_cube(1, &cube, &label).unwrap();
        assert_eq!(a.cube, b.cube);
        assert_ne!(a.cube, c.cube);
    }

    #[test]
    fn missing_table_is_reported_with_its_band() {
        let mut pipeline = pipeline(vec![SensitivityTable::constant(0.0)]);
        let err = pipeline
            .process_cube(0, &ramp_cube(0.0), &LabelVector::default())
            .unwrap_err();
        assert!(matches!(
            err,
            MockError::SubBand { band: 1, ref source }
                if matches!(**source, MockError::MissingTable { index: 1, .. })
        ));
    }

    #[test]
    fn transverse_shape_must_not_change() {
        let mut pipeline = pipeline(vec![SensitivityTable::constant(0.0); 2]);
        let label = LabelVector::default();
        pipeline.process_cube(0, &ramp_cube(0.0), &label).unwrap();
        let narrow = Array3::zeros((2, 4, 8));
        assert!(matches!(
            pipeline.process_cube(1, &narrow, &label),
            Err(MockError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn profile_length_must_match_cube() {
        let mut pipeline = pipeline(vec![SensitivityTable::constant(0.0); 2]);
        let short = Array3::zeros((4, 4, 6));
        assert!(matches!(
            pipeline.process_cube(0, &short, &LabelVector::default()),
            Err(MockError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn descending_boundaries_are_rejected_up_front() {
        let built = MockPipeline::new(
            ForegroundModel::Opt,
            vec![SensitivityTable::constant(0.0); 3],
            vec![10.0, 5.0, 0.0],
            Box::new(TabulatedRedshifts::new(PROFILE.to_vec())),
        );
        assert!(matches!(built, Err(MockError::Configuration(_))));
    }

    #[test]
    fn crossing_at_first_pixel_is_rejected() {
        let mut pipeline = MockPipeline::new(
            ForegroundModel::Mod,
            vec![SensitivityTable::constant(0.0); 2],
            vec![0.0, 5.0],
            Box::new(TabulatedRedshifts::new(vec![6.0; 8])),
        )
        .unwrap();
        let err = pipeline
            .process_cube(0, &ramp_cube(0.0), &LabelVector::default())
            .unwrap_err();
        assert!(matches!(err, MockError::SubBand { band: 0, .. }));
    }

    #[test]
    fn slice_means_follow_line_of_sight() {
        let cube = Array3::from_shape_fn((2, 3, 4), |(i, j, k)| (i + j) as f64 + 10.0 * k as f64);
        let means = los_mean(&cube);
        assert_eq!(means.len(), 4);
        assert_abs_diff_eq!(means[0], 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(means[3], 31.5, epsilon = 1e-12);
    }

    fn sample_label() -> LabelVector {
        LabelVector {
            parameters: vec![2.0, 0.31, 40.0, 500.0, 4.7, 30.0],
            tau: 0.06,
            xh_history: vec![0.9, 0.4],
            xh_redshifts: vec![9.0, 7.0],
        }
    }

    fn write_input(path: &Path, cubes: &[Array3<f64>]) {
        let mut writer = RecordWriter::create(path).unwrap();
        for cube in cubes {
            writer.write(cube, &sample_label()).unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn batch_round_trips_through_record_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.lcr");
        let output = dir.path().join("out.lcr");
        let cubes = [ramp_cube(0.0), ramp_cube(5.0)];
        write_input(&input, &cubes);

        let mut pipeline = pipeline(vec![SensitivityTable::constant(0.0); 2]);
        let summary = pipeline.run_batch(&input, &output, None).unwrap();
        assert_eq!(summary, BatchSummary { output: output.clone(), cubes: 2 });

        let reader = RecordReader::open(&output).unwrap();
        assert_eq!(reader.expected_records(), Some(2));
        let records: Vec<LightconeRecord> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        for (record, cube) in records.iter().zip(cubes.iter()) {
            assert_eq!(record.label, sample_label());
            for (a, b) in record.cube.iter().zip(cube.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn failed_batch_keeps_earlier_records() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.lcr");
        let output = dir.path().join("out.lcr");
        write_input(&input, &[ramp_cube(0.0), Array3::zeros((2, 2, 8)), ramp_cube(1.0)]);

        let mut pipeline = pipeline(vec![SensitivityTable::constant(0.0); 2]);
        let err = pipeline.run_batch(&input, &output, None).unwrap_err();
        assert!(matches!(err, MockError::Cube { index: 1, .. }));

        let records: Vec<_> = RecordReader::open(&output)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 1);
    }
}
