use ndarray::{s, ArrayView3};

use crate::error::{MockError, Result};

/// A run of line-of-sight pixels served by one sub-band.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubVolumeRange {
    pub band: usize,
    pub start: usize,
    pub len: usize,
}

impl SubVolumeRange {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Splits a redshift profile into sub-band ranges.
///
/// A new range starts at the first pixel whose redshift exceeds the midpoint
/// between the current and the next boundary; at most one boundary is crossed
/// per pixel. The last range runs through the final pixel inclusive.
pub fn segment_lightcone(profile: &[f64], boundaries: &[f64]) -> Vec<SubVolumeRange> {
    if profile.is_empty() {
        return Vec::new();
    }
    let mut ranges = Vec::new();
    let mut band = 0;
    let mut start = 0;
    for (x, &z) in profile.iter().enumerate() {
        if band + 1 < boundaries.len() && z > (boundaries[band] + boundaries[band + 1]) / 2.0 {
            ranges.push(SubVolumeRange {
                band,
                start,
                len: x - start,
            });
            band += 1;
            start = x;
        }
    }
    let last = profile.len() - 1;
    ranges.push(SubVolumeRange {
        band,
        start,
        len: last - start + 1,
    });
    ranges
}

/// Checks that `ranges` tile `[0, extent)` in order without gaps or overlaps.
pub fn check_coverage(ranges: &[SubVolumeRange], extent: usize) -> Result<()> {
    let mut cursor = 0;
    for range in ranges {
        if range.start != cursor {
            return Err(MockError::ShapeMismatch(format!(
                "sub-band {} starts at pixel {} but the previous range ended at {}",
                range.band, range.start, cursor
            )));
        }
        cursor = range.end();
    }
    if cursor != extent {
        return Err(MockError::ShapeMismatch(format!(
            "sub-volumes cover {cursor} line-of-sight pixels, cube has {extent}"
        )));
    }
    Ok(())
}

/// Views of `cube` along the line-of-sight axis, one per range.
pub fn split_subvolumes<'a>(
    cube: ArrayView3<'a, f64>,
    ranges: &[SubVolumeRange],
) -> Result<Vec<ArrayView3<'a, f64>>> {
    check_coverage(ranges, cube.len_of(ndarray::Axis(2)))?;
    Ok(ranges
        .iter()
        .map(|range| cube.slice_move(s![.., .., range.start..range.end()]))
        .collect())
}
