//! Trend calculation over accumulated peak values
//!
//! For each configured frequency the report holds the raw peak per file
//! position, the same series normalized to the value at the normalization
//! point, and the low/high frequency ratio series.

use crate::types::{AccumulatedResult, AnalysisParams};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Largest number of (frequency, position) cells a report may hold
pub const MAX_TREND_CELLS: usize = 1 << 20;

/// Trend series for viewers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendReport {
    /// 1-based file positions
    pub x_axis_values: Vec<u32>,
    /// Peak per position, per frequency
    pub peak_current_trends: BTreeMap<u32, Vec<Option<f64>>>,
    /// Peak divided by the normalization reference, per frequency
    pub normalized_peak_trends: BTreeMap<u32, Vec<Option<f64>>>,
    /// Lowest-frequency peak over highest-frequency peak
    pub kdm_trend: Vec<Option<f64>>,
}

/// Compute trends from accumulated values
///
/// Only values carrying a usable status and matching the params' electrode
/// selection contribute. Returns `None` when no frequencies are configured
/// or the series would exceed [`MAX_TREND_CELLS`].
#[must_use]
pub fn calculate_trends(
    results: &[AccumulatedResult],
    params: &AnalysisParams,
) -> Option<TrendReport> {
    let mut frequencies = params.frequencies.clone();
    frequencies.sort_unstable();
    frequencies.dedup();
    let (&low, &high) = (frequencies.first()?, frequencies.last()?);

    let num_files = params.num_files as usize;
    if num_files.saturating_mul(frequencies.len()) > MAX_TREND_CELLS {
        tracing::warn!(
            num_files,
            frequencies = frequencies.len(),
            "trend request too large, skipped"
        );
        return None;
    }
    let mut peaks: BTreeMap<u32, Vec<Option<f64>>> = frequencies
        .iter()
        .map(|&f| (f, vec![None; num_files]))
        .collect();

    for acc in results {
        if acc.key.electrode != params.selected_electrode || !acc.result.status.has_value() {
            continue;
        }
        let Some(series) = peaks.get_mut(&acc.key.frequency) else {
            continue;
        };
        let position = acc.key.file_index as usize;
        if (1..=num_files).contains(&position) {
            series[position - 1] = Some(acc.result.value);
        }
    }

    let norm_index = (params.normalization_point as usize).checked_sub(1);
    let normalized = peaks
        .iter()
        .map(|(&freq, series)| {
            let factor = norm_index
                .and_then(|i| series.get(i).copied().flatten())
                .filter(|v| *v != 0.0)
                .unwrap_or(1.0);
            (freq, series.iter().map(|p| p.map(|v| v / factor)).collect())
        })
        .collect();

    let kdm_trend = (0..num_files)
        .map(|i| {
            let low_peak = peaks.get(&low).and_then(|s| s[i])?;
            let high_peak = peaks.get(&high).and_then(|s| s[i])?;
            (high_peak != 0.0).then(|| low_peak / high_peak)
        })
        .collect();

    Some(TrendReport {
        x_axis_values: (1..=params.num_files).collect(),
        peak_current_trends: peaks,
        normalized_peak_trends: normalized,
        kdm_trend,
    })
}
