//! Analyzer contract and the reference peak-current analyzer
//!
//! An analyzer is a pure function from raw file text and parameters to an
//! [`AnalysisResult`]. Malformed input yields an error-status result, never
//! a panic; the dispatcher still contains a panic if one slips through.

use crate::types::{AnalysisParams, AnalysisResult};

/// Turns raw measurement text into a result
pub trait Analyzer: Send + Sync + std::fmt::Debug {
    /// Analyze one file
    fn analyze(&self, raw: &str, params: &AnalysisParams) -> AnalysisResult;

    /// Name for logs
    fn name(&self) -> &'static str {
        "analyzer"
    }
}

/// Microamps per amp
const MICRO: f64 = 1e6;

/// Most electrode columns the reference analyzer reads
pub const MAX_ELECTRODES: usize = 256;

/// Column layout read from the analyzer-specific parameters
#[derive(Debug, Clone, Copy, PartialEq)]
struct Layout {
    delimiter: Delimiter,
    /// 0-based
    voltage_column: usize,
    /// 0-based
    current_column: usize,
    spacing: usize,
    electrodes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delimiter {
    Whitespace,
    Tab,
    Comma,
}

impl Delimiter {
    fn from_code(code: Option<f64>) -> Self {
        match code.map(|c| c.round() as i64) {
            Some(2) => Self::Tab,
            Some(3) => Self::Comma,
            _ => Self::Whitespace,
        }
    }

    fn split(self, line: &str) -> Vec<&str> {
        match self {
            Self::Whitespace => line.split_whitespace().collect(),
            Self::Tab => trim_leading_empty(line.split('\t')),
            Self::Comma => trim_leading_empty(line.split(',')),
        }
    }
}

fn trim_leading_empty<'a>(fields: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    fields.skip_while(|f| f.trim().is_empty()).collect()
}

fn column(params: &AnalysisParams, key: &str, default: usize) -> usize {
    params
        .extra_f64(key)
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map_or(default, |v| v.round() as usize)
}

impl Layout {
    fn from_params(params: &AnalysisParams) -> Self {
        Self {
            delimiter: Delimiter::from_code(params.extra_f64("delimiter")),
            voltage_column: column(params, "voltage_column", 1).saturating_sub(1),
            current_column: column(params, "current_column", 2).saturating_sub(1),
            spacing: column(params, "spacing_index", 1).max(1),
            electrodes: column(params, "num_electrodes", 1).max(1),
        }
    }

    fn current_col(&self, electrode: usize) -> usize {
        self.current_column + electrode * self.spacing
    }
}

fn parse_number(field: &str) -> Option<f64> {
    field.trim().replace(',', "").parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Skip a Gamry `.dta` header: data starts two lines after `CURVE TABLE`
fn data_lines<'a>(raw: &'a str, extension: &str) -> Vec<&'a str> {
    let lines: Vec<&str> = raw.lines().collect();
    if !extension.eq_ignore_ascii_case(".dta") {
        return lines;
    }
    let start = lines
        .iter()
        .position(|l| l.contains("CURVE") && l.contains("TABLE"))
        .map(|i| i + 2)
        .or_else(|| {
            lines.iter().position(|l| {
                l.trim_start()
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_digit() || c == '-' || c == '+')
            })
        })
        .unwrap_or(0);
    lines.into_iter().skip(start).collect()
}

/// Potentials and per-electrode currents (µA) parsed from the file
fn read_columns(raw: &str, layout: &Layout, extension: &str) -> (Vec<f64>, Vec<Vec<f64>>) {
    let mut potentials = Vec::new();
    let mut currents = vec![Vec::new(); layout.electrodes];
    for line in data_lines(raw, extension) {
        let fields = layout.delimiter.split(line);
        if fields.len() <= layout.voltage_column.max(layout.current_column) {
            continue;
        }
        let Some(potential) = parse_number(fields[layout.voltage_column]) else {
            continue;
        };
        let row: Option<Vec<f64>> = (0..layout.electrodes)
            .map(|e| match fields.get(layout.current_col(e)) {
                Some(field) => parse_number(field).map(|a| a * MICRO),
                // missing trailing electrode columns read as zero
                None => Some(0.0),
            })
            .collect();
        let Some(row) = row else {
            continue;
        };
        potentials.push(potential);
        for (series, value) in currents.iter_mut().zip(row) {
            series.push(value);
        }
    }
    (potentials, currents)
}

/// Peak current above a linear baseline within a potential window
///
/// Reads delimited numeric columns (potential plus one current column per
/// electrode), scales currents to µA, averages electrodes or takes the
/// selected one, and reports the largest height above the straight line
/// joining the window's end points.
///
/// Settings read from the analyzer-specific parameters: `delimiter`
/// (1 space, 2 tab, 3 comma), `voltage_column`, `current_column`
/// (1-based), `spacing_index`, `num_electrodes`, `cutoff_frequency`,
/// `low_xstart`/`low_xend`/`high_xstart`/`high_xend` and
/// `peak_min_voltage`/`peak_max_voltage`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeakCurrentAnalyzer;

impl PeakCurrentAnalyzer {
    fn window(params: &AnalysisParams, min: f64, max: f64) -> (f64, f64) {
        let cutoff = params.extra_f64("cutoff_frequency").unwrap_or(500.0);
        let high = params.frequency.is_some_and(|f| f64::from(f) > cutoff);
        let (start_key, end_key) = if high {
            ("high_xstart", "high_xend")
        } else {
            ("low_xstart", "low_xend")
        };
        let start = params.extra_f64(start_key).unwrap_or(max);
        let end = params.extra_f64(end_key).unwrap_or(min);
        let mut lo = start.min(end);
        let mut hi = start.max(end);
        if let Some(floor) = params.extra_f64("peak_min_voltage") {
            lo = lo.max(floor);
        }
        if let Some(ceiling) = params.extra_f64("peak_max_voltage") {
            hi = hi.min(ceiling);
        }
        (lo, hi)
    }
}

impl Analyzer for PeakCurrentAnalyzer {
    fn analyze(&self, raw: &str, params: &AnalysisParams) -> AnalysisResult {
        let layout = Layout::from_params(params);
        if layout.electrodes > MAX_ELECTRODES {
            return AnalysisResult::error(format!(
                "Electrode count {} exceeds the supported maximum of {MAX_ELECTRODES}.",
                layout.electrodes
            ));
        }
        let (potentials, per_electrode) = read_columns(raw, &layout, &params.file_extension);

        let currents: Vec<f64> = match params.selected_electrode {
            Some(e) => {
                let e = e as usize;
                let Some(series) = per_electrode.get(e) else {
                    return AnalysisResult::error(format!(
                        "Electrode validation failed: file contains {} electrodes, but electrode {} was requested.",
                        layout.electrodes,
                        e + 1
                    ))
                    .with_meta("detectedElectrodes", layout.electrodes as u64);
                };
                series.clone()
            }
            None => {
                #[allow(clippy::cast_precision_loss)]
                let n = per_electrode.len() as f64;
                (0..potentials.len())
                    .map(|i| per_electrode.iter().map(|s| s[i]).sum::<f64>() / n)
                    .collect()
            }
        };

        if potentials.is_empty() {
            return AnalysisResult::warning(0.0, "No valid data found.")
                .with_meta("warningType", "no_data");
        }

        let mut points: Vec<(f64, f64)> = potentials.into_iter().zip(currents).collect();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        let min = points[0].0;
        let max = points[points.len() - 1].0;
        let (lo, hi) = Self::window(params, min, max);
        points.retain(|(p, _)| (lo..=hi).contains(p));

        if points.is_empty() {
            return AnalysisResult::warning(0.0, "No data in specified potential range.")
                .with_meta("warningType", "no_data_in_range");
        }
        if points.len() < 3 {
            return AnalysisResult::warning(0.0, "Too few points in potential range.")
                .with_meta("warningType", "too_few_points")
                .with_meta("points", points.len() as u64);
        }

        let (p0, i0) = points[0];
        let (p1, i1) = points[points.len() - 1];
        let slope = if (p1 - p0).abs() > f64::EPSILON {
            (i1 - i0) / (p1 - p0)
        } else {
            0.0
        };
        let (peak_potential, peak_current, height) = points
            .iter()
            .map(|&(p, i)| (p, i, i - (i0 + slope * (p - p0))))
            .fold((p0, i0, f64::NEG_INFINITY), |best, cur| {
                if cur.2 > best.2 {
                    cur
                } else {
                    best
                }
            });

        let result = if height > 0.0 {
            AnalysisResult::success(height).with_meta("message", "Analysis successful.")
        } else {
            AnalysisResult::warning(0.0, "No peak above baseline.")
                .with_meta("warningType", "no_peak")
        };
        result
            .with_meta("peakPotential", peak_potential)
            .with_meta("peakCurrent", peak_current)
            .with_meta("points", points.len() as u64)
    }

    fn name(&self) -> &'static str {
        "peak-current"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AnalysisStatus;
    use serde_json::json;

    /// Triangle peak of height 3e-6 A at 0.3 V on a flat baseline
    const TRIANGLE: &str = "0.0 1e-6\n0.1 1e-6\n0.2 2.5e-6\n0.3 4e-6\n0.4 2.5e-6\n0.5 1e-6\n";

    fn params(extra: serde_json::Value) -> AnalysisParams {
        let mut params = AnalysisParams::new(vec![10], 1).for_frequency(10);
        if let serde_json::Value::Object(map) = extra {
            params.extra = map;
        }
        params
    }

    #[test]
    fn finds_peak_height_in_microamps() {
        let result = PeakCurrentAnalyzer.analyze(TRIANGLE, &params(json!({})));
        assert_eq!(result.status, AnalysisStatus::Success);
        assert!((result.value - 3.0).abs() < 1e-9, "value {}", result.value);
        assert_eq!(result.metadata["peakPotential"], json!(0.3));
    }

    #[test]
    fn averages_electrodes() {
        let raw = "0.0,1e-6,3e-6\n0.1,2e-6,6e-6\n0.2,1e-6,3e-6\n";
        let p = params(json!({ "delimiter": 3, "num_electrodes": 2 }));
        let result = PeakCurrentAnalyzer.analyze(raw, &p);
        // average trace 2, 4, 2 -> height 2
        assert!((result.value - 2.0).abs() < 1e-9);

        let single = PeakCurrentAnalyzer.analyze(raw, &p.clone().with_electrode(0));
        assert!((single.value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_electrode_is_error() {
        let p = params(json!({})).with_electrode(3);
        let result = PeakCurrentAnalyzer.analyze(TRIANGLE, &p);
        assert_eq!(result.status, AnalysisStatus::Error);
        assert!(result.message().unwrap().contains("electrode 4"));
    }

    #[test]
    fn absurd_electrode_count_is_an_error() {
        let p = params(json!({ "num_electrodes": 4.0e12 }));
        let result = PeakCurrentAnalyzer.analyze(TRIANGLE, &p);
        assert_eq!(result.status, AnalysisStatus::Error);
        assert!(result.message().unwrap().contains("supported maximum"));
    }

    #[test]
    fn garbage_is_a_warning_not_a_panic() {
        let result = PeakCurrentAnalyzer.analyze("not numbers\n\u{0}\n,,,\n", &params(json!({})));
        assert_eq!(result.status, AnalysisStatus::Warning);
        assert_eq!(result.message(), Some("No valid data found."));
    }

    #[test]
    fn window_excludes_points() {
        let p = params(json!({ "low_xstart": 5.0, "low_xend": 4.0 }));
        let result = PeakCurrentAnalyzer.analyze(TRIANGLE, &p);
        assert_eq!(result.metadata["warningType"], json!("no_data_in_range"));
    }

    #[test]
    fn dta_header_is_skipped() {
        let raw = format!("EXPLAIN\nTAG\tSWV\nCURVE\tTABLE\n\tPt\tV\tA\n{}", TRIANGLE);
        let mut p = params(json!({}));
        p.file_extension = ".dta".into();
        let result = PeakCurrentAnalyzer.analyze(&raw, &p);
        assert_eq!(result.status, AnalysisStatus::Success);
    }
}
