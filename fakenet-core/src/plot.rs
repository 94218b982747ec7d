use crate::error::{Error, Result};
use crate::metrics::MetricSeries;
use plotters::prelude::*;
use std::path::{Path, PathBuf};

const SIZE: (u32, u32) = (1000, 500);

/// Renders `loss.png` and `accuracy.png` into `dir`.
pub fn render(dir: &Path, series: &MetricSeries) -> Result<Vec<PathBuf>> {
    let loss = dir.join("loss.png");
    line_chart(
        &loss,
        "Training and Validation Loss",
        "Loss",
        series.train_loss(),
        series.valid_loss(),
    )?;
    let accuracy = dir.join("accuracy.png");
    line_chart(
        &accuracy,
        "Training and Validation accuracy",
        "accuracy",
        series.train_accuracy(),
        series.valid_accuracy(),
    )?;
    Ok(vec![loss, accuracy])
}

fn line_chart(path: &Path, title: &str, y_desc: &str, train: &[f64], valid: &[f64]) -> Result<()> {
    let err = |e: &dyn std::fmt::Display| Error::Plot {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let x_max = train.len().max(valid.len()).max(2) - 1;
    let (y_min, y_max) = bounds(train.iter().chain(valid));

    let root = BitMapBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(|e| err(&e))?;
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .caption(title, ("sans-serif", 24.0))
        .set_label_area_size(LabelAreaPosition::Left, 60)
        .set_label_area_size(LabelAreaPosition::Bottom, 40)
        .build_cartesian_2d(0..x_max, y_min..y_max)
        .map_err(|e| err(&e))?;
    chart
        .configure_mesh()
        .x_desc("iterations")
        .y_desc(y_desc)
        .draw()
        .map_err(|e| err(&e))?;

    for (label, values, color) in [("val", valid, BLUE), ("train", train, RED)] {
        chart
            .draw_series(LineSeries::new(values.iter().copied().enumerate(), color))
            .map_err(|e| err(&e))?
            .label(label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }
    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(|e| err(&e))?;

    root.present().map_err(|e| err(&e))
}

/// Value range padded so a flat series still gets a visible axis.
fn bounds<'a>(values: impl Iterator<Item = &'a f64>) -> (f64, f64) {
    let (min, max) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        });
    if min > max {
        return (0., 1.);
    }
    let pad = ((max - min) * 0.05).max(1e-3);
    (min - pad, max + pad)
}
