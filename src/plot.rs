use std::path::Path;

use plotters::prelude::PathElement;
use plotters::prelude::*;

pub use plotters::prelude::{RGBColor, BLUE, RED};

use crate::error::DynError;

const PLOT_FONT_SCALE: f64 = 1.2;
const LOG_FLOOR: f64 = 1e-6;

fn scaled_font_size(base: i32) -> i32 {
    ((base as f64) * PLOT_FONT_SCALE).round() as i32
}

fn scaled_area_size(base: i32) -> i32 {
    ((base as f64) * PLOT_FONT_SCALE).round() as i32
}

fn value_range<'a>(values: impl Iterator<Item = &'a f64>) -> Option<(f64, f64)> {
    let (min, max) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if min > max {
        return None;
    }
    if min == max {
        return Some((min - 0.5, max + 0.5));
    }
    Some((min, max))
}

/// Several series sharing one x axis.
pub fn plot_multi_series_f64_x(
    x_vals: &[f64],
    series: &[(&[f64], &RGBColor, &str)],
    filename: &Path,
    x_label: &str,
    y_label: &str,
) -> Result<(), DynError> {
    if series.is_empty() {
        return Err("No series provided to plot".into());
    }
    for (data_series, _, _) in series.iter() {
        if data_series.len() != x_vals.len() {
            return Err("X-value vector length does not match data length".into());
        }
    }
    let (x_min, x_max) = value_range(x_vals.iter()).ok_or("No data points to plot")?;
    let (min_val, max_val) = value_range(series.iter().flat_map(|(s, _, _)| s.iter()))
        .ok_or("No finite values to plot")?;

    let root = BitMapBackend::new(filename, (1280, 720)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .x_label_area_size(scaled_area_size(40))
        .y_label_area_size(scaled_area_size(60))
        .build_cartesian_2d(x_min..x_max, min_val..max_val)?;

    chart
        .configure_mesh()
        .x_desc(x_label)
        .y_desc(y_label)
        .label_style(("sans-serif", scaled_font_size(20)).into_font())
        .axis_desc_style(("sans-serif", scaled_font_size(24)).into_font())
        .light_line_style(WHITE.mix(0.0))
        .draw()?;

    for (data_series, color, label) in series.iter() {
        chart
            .draw_series(LineSeries::new(
                x_vals.iter().zip(data_series.iter()).map(|(x, y)| (*x, *y)),
                *color,
            ))?
            .label(*label)
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 10, y)], *color));
    }

    chart
        .configure_series_labels()
        .border_style(BLACK)
        .background_style(WHITE.mix(0.8))
        .label_font(("sans-serif", scaled_font_size(20)).into_font())
        .draw()?;

    root.present()?;
    Ok(())
}

/// Curves with their own x samples; y is drawn as log10 (floored at 1e-6).
pub fn plot_log_curves(
    curves: &[(&[f64], &[f64], String)],
    filename: &Path,
    x_label: &str,
    y_label: &str,
) -> Result<(), DynError> {
    if curves.is_empty() {
        return Err("No curves provided to plot".into());
    }
    for (xs, ys, label) in curves.iter() {
        if xs.len() != ys.len() {
            return Err(format!("Curve '{label}' has mismatched x/y lengths").into());
        }
    }
    let log_curves: Vec<Vec<f64>> = curves
        .iter()
        .map(|(_, ys, _)| ys.iter().map(|y| y.max(LOG_FLOOR).log10()).collect())
        .collect();
    let (x_min, x_max) =
        value_range(curves.iter().flat_map(|(xs, _, _)| xs.iter())).ok_or("No data points to plot")?;
    let (min_val, max_val) =
        value_range(log_curves.iter().flatten()).ok_or("No finite values to plot")?;

    let root = BitMapBackend::new(filename, (1280, 720)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .x_label_area_size(scaled_area_size(40))
        .y_label_area_size(scaled_area_size(60))
        .build_cartesian_2d(x_min..x_max, min_val..max_val)?;

    chart
        .configure_mesh()
        .x_desc(x_label)
        .y_desc(y_label)
        .label_style(("sans-serif", scaled_font_size(20)).into_font())
        .axis_desc_style(("sans-serif", scaled_font_size(24)).into_font())
        .light_line_style(WHITE.mix(0.0))
        .draw()?;

    for (idx, ((xs, _, label), ys)) in curves.iter().zip(log_curves.iter()).enumerate() {
        let color = Palette99::pick(idx).to_rgba();
        chart
            .draw_series(LineSeries::new(
                xs.iter().zip(ys.iter()).map(|(x, y)| (*x, *y)),
                color,
            ))?
            .label(label.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 10, y)], color));
    }

    chart
        .configure_series_labels()
        .border_style(BLACK)
        .background_style(WHITE.mix(0.8))
        .label_font(("sans-serif", scaled_font_size(16)).into_font())
        .draw()?;

    root.present()?;
    Ok(())
}
