//! Delivery ordering

use crate::filter::FilterSet;
use std::collections::BTreeMap;

/// Order matching files for sending
///
/// Files are grouped by file index and groups go out in ascending index
/// order, so every frequency of measurement `n` reaches the server before
/// any file of measurement `n + 1`. Names are sorted inside a group.
/// Non-matching names are dropped.
#[must_use]
pub fn plan_delivery<I, S>(filenames: I, filters: &FilterSet) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut groups: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for filename in filenames {
        let filename = filename.into();
        if let Some(name) = filters.matches(&filename) {
            groups.entry(name.index).or_default().push(filename);
        }
    }
    groups
        .into_values()
        .flat_map(|mut group| {
            group.sort();
            group.dedup();
            group
        })
        .collect()
}
