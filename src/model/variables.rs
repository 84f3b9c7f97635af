//! Variable name assignment (`v1`, `v2`, ...)
//!
//! A name is handed out once, when an indicator joins an achievement, and is
//! never rewritten afterwards. Formulas written against `v3` keep pointing at
//! the same node even after `v1` and `v2` are removed.

use std::collections::HashSet;

use super::types::AchievementIndicator;

/// Lowest free `v{n}` with `n >= position + 1`
pub fn next_variable_name<'a, I>(used: I, position: usize) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let used: HashSet<&str> = used.into_iter().collect();
    let mut n = position + 1;
    loop {
        let candidate = format!("v{}", n);
        if !used.contains(candidate.as_str()) {
            return candidate;
        }
        n += 1;
    }
}

/// Assign names to every unnamed indicator, in list order
///
/// Already named indicators keep their names; blank names count as missing.
pub fn assign_variable_names(indicators: &mut [AchievementIndicator]) {
    let mut used: HashSet<String> = indicators
        .iter()
        .filter_map(|i| i.variable_name.clone())
        .filter(|n| !n.trim().is_empty())
        .collect();

    for (position, indicator) in indicators.iter_mut().enumerate() {
        let named = indicator
            .variable_name
            .as_deref()
            .map(|n| !n.trim().is_empty())
            .unwrap_or(false);
        if named {
            continue;
        }

        let name = next_variable_name(used.iter().map(String::as_str), position);
        log::debug!("Assigned variable {} to indicator at position {}", name, position);
        used.insert(name.clone());
        indicator.variable_name = Some(name);
    }
}

/// First name that appears more than once, if any
pub fn find_duplicate_name(indicators: &[AchievementIndicator]) -> Option<String> {
    let mut seen = HashSet::new();
    indicators
        .iter()
        .filter_map(|i| i.variable_name.as_deref())
        .find(|name| !seen.insert(*name))
        .map(str::to_string)
}
