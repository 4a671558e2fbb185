//! Chart preparation and rendering.
//!
//! A parameter is drawn with one of the four [`ChartShape`]s. Preparation
//! turns the validated rows of a sheet into points; rendering draws them as
//! a line with markers into a PNG.

use std::collections::BTreeMap;
use std::io::Cursor;

use chrono::{Datelike, Days, NaiveDate};
use image::{DynamicImage, ImageOutputFormat, RgbImage};
use plotters::prelude::*;

use crate::cache::ReportKind;
use crate::error::{AppError, AppResult};
use crate::sites::{ChartShape, Site};
use crate::store::{MeasurementRow, SiteSheet, Status};

/// Configuration options for chart rendering
#[derive(Clone, Debug)]
pub struct GraphOptions {
    /// Title displayed at the top of the chart
    pub title: String,

    /// Label for the X-axis
    pub x_label: String,

    /// Label for the Y-axis
    pub y_label: String,

    /// Width of the image in pixels
    pub width: u32,

    /// Height of the image in pixels
    pub height: u32,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            title: String::new(),
            x_label: String::new(),
            y_label: String::new(),
            width: 1000,
            height: 500,
        }
    }
}

impl GraphOptions {
    /// Titles and size for `parameter` on the given page.
    pub fn for_parameter(site: Site, parameter: &str, shape: ChartShape, kind: ReportKind, year: i32) -> Self {
        let (title, x_label, y_label) = match (kind, shape) {
            (ReportKind::Visualisation, ChartShape::WeeklyDosage) => (
                format!("{} hebdomadaire ({})", parameter, site),
                "Semaine",
                parameter.to_string(),
            ),
            (ReportKind::Visualisation, ChartShape::WeeklyAggregate) => (
                format!("Consommation hebdomadaire de {} ({})", parameter, site),
                "Semaine",
                "Consommation".to_string(),
            ),
            (ReportKind::Visualisation, ChartShape::DailyDelta) => (
                format!("Variation journalière de {} - {}", parameter, site),
                "",
                String::new(),
            ),
            (ReportKind::Visualisation, ChartShape::DailyRaw) => {
                (format!("Mesure de {} - {}", parameter, site), "", String::new())
            }
            (ReportKind::Report, ChartShape::WeeklyDosage) => (
                format!("{} - {} (année {})", site, parameter, year),
                "Semaine",
                String::new(),
            ),
            (ReportKind::Report, ChartShape::WeeklyAggregate) => (
                format!("{} - {} hebdo (année {})", site, parameter, year),
                "Semaine",
                String::new(),
            ),
            (ReportKind::Report, ChartShape::DailyDelta) => {
                (format!("{} - Delta {}", site, parameter), "", String::new())
            }
            (ReportKind::Report, ChartShape::DailyRaw) => {
                (format!("{} - {}", site, parameter), "", String::new())
            }
        };

        let (width, height) = match kind {
            ReportKind::Visualisation => (1000, 500),
            ReportKind::Report => (800, 400),
        };

        GraphOptions {
            title,
            x_label: x_label.to_string(),
            y_label,
            width,
            height,
        }
    }
}

/// How x coordinates are labelled.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum XAxis {
    /// x is an ISO week number, shown as `S12`.
    Weeks,
    /// x is a day offset from the given date, shown as `dd/mm`.
    Days(NaiveDate),
}

impl XAxis {
    pub fn label(self, x: f64) -> String {
        match self {
            XAxis::Weeks => format!("S{}", x.round() as i64),
            XAxis::Days(origin) => {
                let offset = x.round();
                if offset < 0.0 {
                    return String::new();
                }
                origin
                    .checked_add_days(Days::new(offset as u64))
                    .map(|d| d.format("%d/%m").to_string())
                    .unwrap_or_default()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChartData {
    pub axis: XAxis,
    pub points: Vec<(f64, f64)>,
}

impl ChartData {
    fn bounds(&self) -> (std::ops::Range<f64>, std::ops::Range<f64>) {
        if self.points.is_empty() {
            return (0.0..1.0, 0.0..1.0);
        }
        let fold = |pick: fn(&(f64, f64)) -> f64| {
            self.points
                .iter()
                .map(pick)
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
        };
        let (x_min, x_max) = fold(|p| p.0);
        let (y_min, y_max) = fold(|p| p.1);

        let x_range = if x_min == x_max {
            x_min - 1.0..x_max + 1.0
        } else {
            x_min - 0.5..x_max + 0.5
        };
        let pad = ((y_max - y_min) * 0.05).max(if y_min == y_max { 1.0 } else { 0.0 });
        (x_range, y_min - pad..y_max + pad)
    }
}

/// Validated rows with a readable date, oldest first.
pub fn validated_rows(sheet: &SiteSheet) -> Vec<&MeasurementRow> {
    let mut rows: Vec<&MeasurementRow> = sheet
        .rows
        .iter()
        .filter(|row| row.status == Status::Validated)
        .collect();
    rows.sort_by_key(|row| row.date);
    rows
}

fn reading(row: &MeasurementRow, parameter: &str) -> f64 {
    row.number(parameter).unwrap_or(0.0)
}

/// Monday readings of `year`, as (ISO week, value).
pub fn weekly_dosage(rows: &[&MeasurementRow], parameter: &str, year: i32) -> Vec<(u32, f64)> {
    rows.iter()
        .filter(|row| row.date.year() == year && row.date.weekday() == chrono::Weekday::Mon)
        .map(|row| (row.date.iso_week().week(), reading(row, parameter)))
        .collect()
}

/// Sum of the readings of `year` per ISO week.
pub fn weekly_aggregate(rows: &[&MeasurementRow], parameter: &str, year: i32) -> Vec<(u32, f64)> {
    let mut weeks: BTreeMap<u32, f64> = BTreeMap::new();
    for row in rows.iter().filter(|row| row.date.year() == year) {
        *weeks.entry(row.date.iso_week().week()).or_default() += reading(row, parameter);
    }
    weeks.into_iter().collect()
}

fn in_period(row: &MeasurementRow, year: i32, week: Option<u32>) -> bool {
    row.date.year() == year && week.is_none_or(|w| row.date.iso_week().week() == w)
}

/// Readings of the period as (date, value).
pub fn daily_raw(rows: &[&MeasurementRow], parameter: &str, year: i32, week: Option<u32>) -> Vec<(NaiveDate, f64)> {
    rows.iter()
        .filter(|row| in_period(row, year, week))
        .map(|row| (row.date, reading(row, parameter)))
        .collect()
}

/// Day-to-day differences of a counter over the period; the first day is 0.
pub fn daily_delta(rows: &[&MeasurementRow], parameter: &str, year: i32, week: Option<u32>) -> Vec<(NaiveDate, f64)> {
    let raw = daily_raw(rows, parameter, year, week);
    let mut previous: Option<f64> = None;
    raw.into_iter()
        .map(|(date, value)| {
            let delta = previous.map_or(0.0, |p| value - p);
            previous = Some(value);
            (date, delta)
        })
        .collect()
}

/// Points for `parameter` drawn as `shape`. Weekly shapes always span the
/// whole year and ignore `week`.
pub fn prepare(sheet: &SiteSheet, parameter: &str, shape: ChartShape, year: i32, week: Option<u32>) -> ChartData {
    let rows = validated_rows(sheet);
    let weekly = |points: Vec<(u32, f64)>| ChartData {
        axis: XAxis::Weeks,
        points: points.into_iter().map(|(w, v)| (w as f64, v)).collect(),
    };
    let daily = |points: Vec<(NaiveDate, f64)>| {
        let origin = points.first().map(|(d, _)| *d).unwrap_or(NaiveDate::MIN);
        ChartData {
            axis: XAxis::Days(origin),
            points: points
                .into_iter()
                .map(|(d, v)| ((d - origin).num_days() as f64, v))
                .collect(),
        }
    };

    match shape {
        ChartShape::WeeklyDosage => weekly(weekly_dosage(&rows, parameter, year)),
        ChartShape::WeeklyAggregate => weekly(weekly_aggregate(&rows, parameter, year)),
        ChartShape::DailyDelta => daily(daily_delta(&rows, parameter, year, week)),
        ChartShape::DailyRaw => daily(daily_raw(&rows, parameter, year, week)),
    }
}

fn chart_err<E: std::fmt::Display>(err: E) -> AppError {
    AppError::Chart(err.to_string())
}

/// Draws `data` and returns the PNG bytes.
///
/// Rendering happens in an RGB buffer; no temporary file is involved, so
/// concurrent requests cannot clobber each other's images.
pub fn render_png(data: &ChartData, options: &GraphOptions) -> AppResult<Vec<u8>> {
    let (width, height) = (options.width, options.height);
    let mut buffer = vec![0u8; (width * height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (width, height)).into_drawing_area();
        root.fill(&WHITE).map_err(chart_err)?;

        let (x_range, y_range) = data.bounds();
        let mut chart = ChartBuilder::on(&root)
            .caption(&options.title, ("sans-serif", 22).into_font())
            .margin(10)
            .x_label_area_size(40)
            .y_label_area_size(60)
            .build_cartesian_2d(x_range, y_range)
            .map_err(chart_err)?;

        let axis = data.axis;
        let x_formatter = |x: &f64| axis.label(*x);
        chart
            .configure_mesh()
            .x_desc(&options.x_label)
            .y_desc(&options.y_label)
            .x_labels(data.points.len().clamp(2, 12))
            .x_label_formatter(&x_formatter)
            .draw()
            .map_err(chart_err)?;

        if data.points.is_empty() {
            root.draw(&Text::new(
                "Aucune donnée",
                (width as i32 / 2 - 60, height as i32 / 2),
                ("sans-serif", 20).into_font(),
            ))
            .map_err(chart_err)?;
        } else {
            chart
                .draw_series(LineSeries::new(data.points.iter().copied(), &BLUE))
                .map_err(chart_err)?;
            chart
                .draw_series(data.points.iter().map(|&(x, y)| Circle::new((x, y), 3, BLUE.filled())))
                .map_err(chart_err)?;
        }

        root.present().map_err(chart_err)?;
    }

    let image = RgbImage::from_raw(width, height, buffer)
        .ok_or_else(|| AppError::Chart("bitmap size mismatch".to_string()))?;
    let mut png = Vec::new();
    DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)?;
    Ok(png)
}
