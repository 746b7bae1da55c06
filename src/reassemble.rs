use ndarray::{concatenate, Array3, ArrayView3, Axis};

use crate::error::{MockError, Result};

/// Stitches noisy sub-volumes back together along the line-of-sight axis.
pub fn reassemble(parts: &[Array3<f64>], expected: (usize, usize, usize)) -> Result<Array3<f64>> {
    if parts.is_empty() {
        return Err(MockError::ShapeMismatch(
            "no sub-volumes to reassemble".to_string(),
        ));
    }
    let views: Vec<ArrayView3<'_, f64>> = parts.iter().map(|p| p.view()).collect();
    let cube = concatenate(Axis(2), &views).map_err(|e| {
        MockError::ShapeMismatch(format!("cannot concatenate sub-volumes: {e}"))
    })?;
    if cube.dim() != expected {
        return Err(MockError::ShapeMismatch(format!(
            "reassembled light-cone is {:?}, input was {:?}",
            cube.dim(),
            expected
        )));
    }
    Ok(cube)
}
