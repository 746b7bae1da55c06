use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::args::Args;
use crate::error::{MockError, Result};
use crate::noise::DEFAULT_MASK_THRESHOLD;
use crate::redshift::{DEFAULT_H0, DEFAULT_Z_MAX, DEFAULT_Z_START};
use crate::sensitivity::{ForegroundModel, TableOrder};

pub const DEFAULT_BOX_LENGTH_MPC: f64 = 200.0;

/// Settings for one run: built-in defaults, then the run file, then CLI flags.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub model: ForegroundModel,
    pub catalog: PathBuf,
    pub boundaries: PathBuf,
    pub redshifts: Option<PathBuf>,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub plot_dir: Option<PathBuf>,
    /// Comoving side of the transverse field of view (Mpc)
    pub box_length_mpc: f64,
    pub z_start: f64,
    pub z_max: f64,
    pub h0: f64,
    pub mask_threshold: f64,
    pub seed: Option<u64>,
    pub table_order: TableOrder,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: ForegroundModel::Opt,
            catalog: PathBuf::from("calcfiles"),
            boundaries: PathBuf::from("simulations/redshifts5.npy"),
            redshifts: None,
            input_dir: PathBuf::from("simulations/output"),
            output_dir: PathBuf::from("output"),
            plot_dir: None,
            box_length_mpc: DEFAULT_BOX_LENGTH_MPC,
            z_start: DEFAULT_Z_START,
            z_max: DEFAULT_Z_MAX,
            h0: DEFAULT_H0,
            mask_threshold: DEFAULT_MASK_THRESHOLD,
            seed: None,
            table_order: TableOrder::default(),
        }
    }
}

fn parse_value<T: std::str::FromStr>(params: &HashMap<String, String>, keys: &[&str]) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    for key in keys {
        if let Some(value) = params.get(*key) {
            return value.trim().parse::<T>().map(Some).map_err(|e| {
                MockError::Configuration(format!("run file key '{key}' = '{value}': {e}"))
            });
        }
    }
    Ok(None)
}

fn path_value(params: &HashMap<String, String>, keys: &[&str]) -> Option<PathBuf> {
    keys.iter()
        .find_map(|key| params.get(*key))
        .map(PathBuf::from)
}

/// Reads `key = value` lines. Keys are case-insensitive and ignore `_` and `-`;
/// `#` starts a comment.
pub fn parse_run_file(path: &Path) -> Result<HashMap<String, String>> {
    let file = File::open(path).map_err(|e| {
        MockError::Configuration(format!("cannot open run file {}: {e}", path.display()))
    })?;
    let reader = BufReader::new(file);
    let mut params = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some(index) = line.find('=') else {
            return Err(MockError::Configuration(format!(
                "run file {}: expected 'key = value', got '{line}'",
                path.display()
            )));
        };
        let (key, value) = line.split_at(index);
        let key = key.trim().to_ascii_lowercase().replace(['_', '-'], "");
        let value = value
            .trim_start_matches('=')
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        params.insert(key, value);
    }
    Ok(params)
}

impl RunConfig {
    pub fn apply_run_file(&mut self, params: &HashMap<String, String>) -> Result<()> {
        if let Some(path) = path_value(params, &["catalog", "calcfiles"]) {
            self.catalog = path;
        }
        if let Some(path) = path_value(params, &["boundaries", "boxredshifts"]) {
            self.boundaries = path;
        }
        if let Some(path) = path_value(params, &["redshifts", "lightconeredshifts"]) {
            self.redshifts = Some(path);
        }
        if let Some(path) = path_value(params, &["inputdir", "input"]) {
            self.input_dir = path;
        }
        if let Some(path) = path_value(params, &["outputdir", "output"]) {
            self.output_dir = path;
        }
        if let Some(value) = parse_value(params, &["boxlength", "boxlen"])? {
            self.box_length_mpc = value;
        }
        if let Some(value) = parse_value(params, &["zstart", "redshift"])? {
            self.z_start = value;
        }
        if let Some(value) = parse_value(params, &["zmax", "maxredshift"])? {
            self.z_max = value;
        }
        if let Some(value) = parse_value(params, &["h0", "hubble"])? {
            self.h0 = value;
        }
        if let Some(value) = parse_value(params, &["threshold", "maskthreshold"])? {
            self.mask_threshold = value;
        }
        if let Some(value) = parse_value(params, &["seed"])? {
            self.seed = Some(value);
        }
        if let Some(value) = params.get("tableorder") {
            self.table_order = TableOrder::parse(value)?;
        }
        Ok(())
    }

    pub fn from_args(args: &Args) -> Result<Self> {
        let mut cfg = Self {
            model: args.model,
            ..Self::default()
        };
        if let Some(path) = &args.config {
            cfg.apply_run_file(&parse_run_file(path)?)?;
        }
        if let Some(path) = &args.catalog {
            cfg.catalog = path.clone();
        }
        if let Some(path) = &args.boundaries {
            cfg.boundaries = path.clone();
        }
        if let Some(path) = &args.redshifts {
            cfg.redshifts = Some(path.clone());
        }
        if let Some(path) = &args.input_dir {
            cfg.input_dir = path.clone();
        }
        if let Some(path) = &args.output_dir {
            cfg.output_dir = path.clone();
        }
        if let Some(value) = args.box_length {
            cfg.box_length_mpc = value;
        }
        if let Some(value) = args.threshold {
            cfg.mask_threshold = value;
        }
        if let Some(value) = args.table_order {
            cfg.table_order = value;
        }
        if args.seed.is_some() {
            cfg.seed = args.seed;
        }
        cfg.plot_dir = args.plot.clone();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.box_length_mpc > 0.0) {
            return Err(MockError::Configuration(format!(
                "box length must be positive, got {}",
                self.box_length_mpc
            )));
        }
        if !(self.z_max > self.z_start && self.z_start >= 0.0) {
            return Err(MockError::Configuration(format!(
                "need 0 <= z_start < z_max, got z_start = {}, z_max = {}",
                self.z_start, self.z_max
            )));
        }
        if !(self.h0 > 0.0) {
            return Err(MockError::Configuration(format!("H0 must be positive, got {}", self.h0)));
        }
        if self.mask_threshold.is_nan() {
            return Err(MockError::Configuration("mask threshold is NaN".to_string()));
        }
        Ok(())
    }
}
