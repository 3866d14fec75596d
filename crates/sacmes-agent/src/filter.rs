//! Matching filenames against the server's filter set

use sacmes_core::{extension_of, FilterSpec, MeasurementName};
use std::collections::HashSet;

/// Compiled form of a [`FilterSpec`]
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSet {
    handle: String,
    extension: String,
    frequencies: HashSet<u32>,
    range: std::ops::RangeInclusive<u32>,
}

impl FilterSet {
    /// Compile a spec received with `set-filters`
    #[must_use]
    pub fn new(spec: &FilterSpec) -> Self {
        let extension = if spec.file_extension.starts_with('.') {
            spec.file_extension.to_ascii_lowercase()
        } else {
            format!(".{}", spec.file_extension.to_ascii_lowercase())
        };
        Self {
            handle: spec.handle.clone(),
            extension,
            frequencies: spec.frequencies.iter().copied().collect(),
            range: spec.range_start..=spec.range_end,
        }
    }

    /// Parsed name when `filename` should be sent, `None` otherwise
    ///
    /// A file matches when it starts with the handle, carries the required
    /// extension, parses as a measurement name with an index inside the
    /// range and, if a frequency set is given, a frequency from that set.
    #[must_use]
    pub fn matches(&self, filename: &str) -> Option<MeasurementName> {
        if self.handle.is_empty() || !filename.starts_with(&self.handle) {
            return None;
        }
        if extension_of(filename)? != self.extension {
            return None;
        }
        let name = MeasurementName::parse(filename)?;
        if !self.range.contains(&name.index) {
            return None;
        }
        if !self.frequencies.is_empty() && !self.frequencies.contains(&name.frequency?) {
            return None;
        }
        Some(name)
    }
}
