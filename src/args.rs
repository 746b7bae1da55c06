use std::path::{Path, PathBuf};

use clap::Parser;

use crate::error::{MockError, Result};
use crate::sensitivity::{ForegroundModel, TableOrder};

pub const RECORD_EXTENSION: &str = "lcr";

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Inject instrumental thermal noise into simulated 21-cm light-cones",
    long_about = None,
    arg_required_else_help = true,
    after_help = "Examples:\n  lightcone_mocks 0 --model opt\n  lightcone_mocks 3 --model mod --catalog calcfiles --boundaries simulations/redshifts5.npy\n  lightcone_mocks 0 --config mocks.cfg --seed 42 --plot plots\n"
)]
pub struct Args {
    /// Index of the input record file (name-sorted *.lcr files in --input-dir)
    pub batch: Option<usize>,

    /// Foreground model selecting the sensitivity catalog
    #[arg(long, value_enum, default_value_t = ForegroundModel::Opt)]
    pub model: ForegroundModel,

    /// Run file with key = value settings (overridden by flags)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Root of the sensitivity catalog (contains <model>_mocks/)
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// .npy file with the reference sub-band redshifts
    #[arg(long)]
    pub boundaries: Option<PathBuf>,

    /// .npy line-of-sight redshift profile used instead of the cosmology
    #[arg(long)]
    pub redshifts: Option<PathBuf>,

    /// Directory holding the noiseless light-cone record files
    #[arg(long)]
    pub input_dir: Option<PathBuf>,

    /// Directory receiving the mock record file
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Transverse comoving box length in Mpc
    #[arg(long)]
    pub box_length: Option<f64>,

    /// Error level at or above which Fourier modes are zeroed
    #[arg(long)]
    pub threshold: Option<f64>,

    /// How catalog file names map onto sub-band indices
    #[arg(long, value_enum)]
    pub table_order: Option<TableOrder>,

    /// Seed for reproducible noise (default: fresh entropy every run)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of worker threads (default: all cores)
    #[arg(long)]
    pub cpu: Option<usize>,

    /// Write diagnostic plots into this directory
    #[arg(long)]
    pub plot: Option<PathBuf>,
}

pub fn resolve_cpu(requested: Option<usize>, available: usize) -> Result<usize> {
    match requested {
        None => Ok(available.max(1)),
        Some(0) => Err(MockError::Configuration("--cpu must be at least 1".to_string())),
        Some(n) if n > available => Err(MockError::Configuration(format!(
            "--cpu value ({n}) exceeds the number of available cores ({available})"
        ))),
        Some(n) => Ok(n),
    }
}

/// Name-sorted record files of the input directory.
pub fn list_record_files(input_dir: &Path) -> Result<Vec<PathBuf>> {
    if !input_dir.is_dir() {
        return Err(MockError::Configuration(format!(
            "input directory {} does not exist",
            input_dir.display()
        )));
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(input_dir)? {
        let path = entry?.path();
        let is_record = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(RECORD_EXTENSION))
            .unwrap_or(false);
        if is_record && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn resolve_batch(input_dir: &Path, batch: Option<usize>) -> Result<PathBuf> {
    let batch = batch.ok_or_else(|| {
        MockError::Configuration("no input batch selected (positional index)".to_string())
    })?;
    let files = list_record_files(input_dir)?;
    if files.is_empty() {
        return Err(MockError::Configuration(format!(
            "no *.{RECORD_EXTENSION} files in {}",
            input_dir.display()
        )));
    }
    files.get(batch).cloned().ok_or_else(|| {
        MockError::Configuration(format!(
            "batch {batch} out of range: {} has {} record files",
            input_dir.display(),
            files.len()
        ))
    })
}

/// Output path mirroring the input file name inside `output_dir`.
pub fn resolve_output_path(output_dir: &Path, input: &Path) -> Result<PathBuf> {
    let name = input.file_name().ok_or_else(|| {
        MockError::Configuration(format!("input {} has no file name", input.display()))
    })?;
    std::fs::create_dir_all(output_dir)?;
    Ok(output_dir.join(name))
}
