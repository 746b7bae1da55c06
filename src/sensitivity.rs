//! Per-sub-band thermal-noise sensitivity tables.
//!
//! Each sub-band of the instrument has a 21cmSense-style `.npz` archive holding
//! `ks` (radial wavenumber, Mpc⁻¹, ascending) and `T_errs` (noise error on the
//! power spectrum at that wavenumber). A catalog directory holds one archive per
//! sub-band for every foreground model variant.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use ndarray::{Array1, Array3};
use ndarray_npy::NpzReader;

use crate::error::{MockError, Result};

const KS_KEY: &str = "ks";
const ERRORS_KEY: &str = "T_errs";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum)]
pub enum ForegroundModel {
    /// Optimistic foreground avoidance
    Opt,
    /// Moderate foreground avoidance
    Mod,
}

impl ForegroundModel {
    pub fn as_str(self) -> &'static str {
        match self {
            ForegroundModel::Opt => "opt",
            ForegroundModel::Mod => "mod",
        }
    }
}

impl fmt::Display for ForegroundModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order in which catalog files map onto sub-band indices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum TableOrder {
    /// Reverse file-name order (21cmSense names sort by frequency)
    #[default]
    Descending,
    Ascending,
}

impl TableOrder {
    pub fn parse(value: &str) -> Result<Self> {
        <TableOrder as ValueEnum>::from_str(value, true).map_err(|_| {
            MockError::Configuration(format!(
                "table order must be 'descending' or 'ascending', got '{value}'"
            ))
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SensitivityTable {
    ks: Vec<f64>,
    errors: Vec<f64>,
}

impl SensitivityTable {
    /// Pairs wavenumbers with noise errors. `ks` must be non-decreasing.
    pub fn new(ks: Vec<f64>, errors: Vec<f64>) -> std::result::Result<Self, String> {
        if ks.len() != errors.len() {
            return Err(format!(
                "{} wavenumbers but {} error values",
                ks.len(),
                errors.len()
            ));
        }
        if let Some(pos) = ks.windows(2).position(|w| !(w[0] <= w[1])) {
            return Err(format!(
                "wavenumbers not ascending at index {}: {} > {}",
                pos + 1,
                ks[pos],
                ks[pos + 1]
            ));
        }
        Ok(Self { ks, errors })
    }

    /// Same error everywhere.
    #[cfg(test)]
    pub fn constant(error: f64) -> Self {
        Self {
            ks: vec![0.0, 1.0],
            errors: vec![error, error],
        }
    }

    pub fn ks(&self) -> &[f64] {
        &self.ks
    }

    pub fn errors(&self) -> &[f64] {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.ks.is_empty()
    }

    /// Linear interpolation, clamped to the end values outside the tabulated range.
    #[cfg(test)]
    pub fn interpolate(&self, k: f64) -> Result<f64> {
        if self.is_empty() {
            return Err(MockError::InterpolationRange);
        }
        Ok(self.interpolate_clamped(k))
    }

    /// Interpolates every entry of a wavenumber field.
    pub fn interpolate_field(&self, k: &Array3<f64>) -> Result<Array3<f64>> {
        if self.is_empty() {
            return Err(MockError::InterpolationRange);
        }
        Ok(k.mapv(|value| self.interpolate_clamped(value)))
    }

    fn interpolate_clamped(&self, k: f64) -> f64 {
        let last = self.ks.len() - 1;
        if k <= self.ks[0] {
            return self.errors[0];
        }
        if k >= self.ks[last] {
            return self.errors[last];
        }
        // ks[upper - 1] <= k < ks[upper]
        let upper = self.ks.partition_point(|&x| x <= k);
        let lower = upper - 1;
        let (k0, k1) = (self.ks[lower], self.ks[upper]);
        let (e0, e1) = (self.errors[lower], self.errors[upper]);
        e0 + (e1 - e0) * (k - k0) / (k1 - k0)
    }
}

/// Reads the `ks` / `T_errs` pair from a sensitivity archive.
pub fn read_table(path: &Path) -> Result<SensitivityTable> {
    let malformed = |reason: String| MockError::MalformedTable {
        path: path.to_path_buf(),
        reason,
    };
    let file = File::open(path)?;
    let mut npz = NpzReader::new(BufReader::new(file))?;
    let names = npz.names()?;
    let find = |key: &str| {
        names
            .iter()
            .find(|name| name.as_str() == key || name.trim_end_matches(".npy") == key)
            .cloned()
            .ok_or_else(|| malformed(format!("missing array '{key}'")))
    };
    let ks_name = find(KS_KEY)?;
    let errors_name = find(ERRORS_KEY)?;

    let ks: Array1<f64> = npz.by_name(&ks_name)?;
    let errors: Array1<f64> = npz.by_name(&errors_name)?;
    if ks.is_empty() {
        return Err(malformed("table is empty".to_string()));
    }
    SensitivityTable::new(ks.to_vec(), errors.to_vec()).map_err(malformed)
}

/// The ordered set of sensitivity archives for one foreground model.
#[derive(Clone, Debug)]
pub struct SensitivityCatalog {
    model: ForegroundModel,
    files: Vec<PathBuf>,
}

impl SensitivityCatalog {
    /// Scans `<root>/<model>_mocks/` for `*.npz` files tagged `_<model>_`.
    pub fn discover(root: &Path, model: ForegroundModel, order: TableOrder) -> Result<Self> {
        let dir = root.join(format!("{model}_mocks"));
        if !dir.is_dir() {
            return Err(MockError::Configuration(format!(
                "sensitivity catalog directory {} does not exist",
                dir.display()
            )));
        }
        let tag = format!("_{model}_");
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let is_npz = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("npz"))
                .unwrap_or(false);
            if is_npz && name.contains(&tag) {
                files.push(path);
            }
        }
        files.sort();
        if order == TableOrder::Descending {
            files.reverse();
        }
        if files.is_empty() {
            return Err(MockError::MissingTable { model, index: 0 });
        }
        Ok(Self { model, files })
    }

    pub fn model(&self) -> ForegroundModel {
        self.model
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn path(&self, index: usize) -> Result<&Path> {
        self.files
            .get(index)
            .map(PathBuf::as_path)
            .ok_or(MockError::MissingTable {
                model: self.model,
                index,
            })
    }

    /// Fails with the first absent index when fewer than `bands` tables exist.
    pub fn ensure_covers(&self, bands: usize) -> Result<()> {
        if self.files.len() < bands {
            return Err(MockError::MissingTable {
                model: self.model,
                index: self.files.len(),
            });
        }
        Ok(())
    }

    pub fn load(&self, index: usize) -> Result<SensitivityTable> {
        let path = self.path(index)?;
        if !path.is_file() {
            return Err(MockError::MissingTable {
                model: self.model,
                index,
            });
        }
        read_table(path)
    }
}
