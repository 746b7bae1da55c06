use std::error::Error;
use std::path::PathBuf;

use thiserror::Error;

use crate::sensitivity::ForegroundModel;

pub type DynError = Box<dyn Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum MockError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no sensitivity table for sub-band {index} (model '{model}')")]
    MissingTable { model: ForegroundModel, index: usize },

    #[error("malformed sensitivity table {}: {reason}", path.display())]
    MalformedTable { path: PathBuf, reason: String },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("cannot interpolate against an empty sensitivity table")]
    InterpolationRange,

    #[error("record file error: {0}")]
    Record(String),

    #[error("plot: {0}")]
    Plot(String),

    #[error("cube {index}: {source}")]
    Cube {
        index: usize,
        #[source]
        source: Box<MockError>,
    },

    #[error("sub-band {band}: {source}")]
    SubBand {
        band: usize,
        #[source]
        source: Box<MockError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("reading .npy: {0}")]
    Npy(#[from] ndarray_npy::ReadNpyError),

    #[error("reading .npz: {0}")]
    Npz(#[from] ndarray_npy::ReadNpzError),

    #[error("fft: {0}")]
    Fft(#[from] realfft::FftError),
}

impl MockError {
    pub fn in_cube(self, index: usize) -> Self {
        MockError::Cube {
            index,
            source: Box::new(self),
        }
    }

    pub fn in_band(self, band: usize) -> Self {
        MockError::SubBand {
            band,
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, MockError>;
