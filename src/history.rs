//! history readings -> chart series
//!
//! the backend returns the last N readings newest-first. charts want them
//! oldest-first, and a reading whose timestamp cannot be parsed has no place
//! on a time axis, so it is dropped.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::domain::SensorSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartPoint {
    pub at: DateTime<Utc>,
    /// short axis label, HH:MM
    pub label: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub light: Option<f64>,
    pub soil: Option<f64>,
}

pub type ChartSeries = Vec<ChartPoint>;

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // backend rows without an offset are utc
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn to_chart_series(newest_first: Vec<SensorSnapshot>) -> ChartSeries {
    newest_first
        .into_iter()
        .rev()
        .filter_map(|reading| {
            let at = parse_timestamp(reading.timestamp.as_deref()?)?;
            Some(ChartPoint {
                at,
                label: at.format("%H:%M").to_string(),
                temperature: reading.temperature,
                humidity: reading.humidity,
                light: reading.light,
                soil: reading.soil,
            })
        })
        .collect()
}
