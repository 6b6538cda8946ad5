// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Numeric suffix handling for segment file names.
//!
//! Segments are named `<name>_<suffix>`. Both resume-after-restart and eviction order
//! depend on the suffix, so the extraction rule is fixed: the maximal run of ASCII digits
//! at the very end of the file name. A name without trailing digits has suffix 0.

use std::sync::OnceLock;

use regex::Regex;

fn trailing_digits() -> &'static Regex {
    static TRAILING_DIGITS: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    let regex =
        TRAILING_DIGITS.get_or_init(|| Regex::new("[0-9]+$").expect("static regex is valid"));
    regex
}

/// Returns the numeric suffix of a segment file name.
///
/// ```
/// use segment_store::suffix::trailing_suffix;
///
/// assert_eq!(trailing_suffix("events_12"), 12);
/// assert_eq!(trailing_suffix("events_v2_007"), 7);
/// assert_eq!(trailing_suffix("events_"), 0);
/// ```
pub fn trailing_suffix(file_name: &str) -> u64 {
    trailing_digits()
        .find(file_name)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(0)
}

/// Returns the suffix of `file_name` when it is a segment of the store called `name`.
///
/// Only `<name>_<digits>` qualifies, so `events_v2_40` and `events_backup` are not
/// segments of `events`.
///
/// ```
/// use segment_store::suffix::segment_suffix;
///
/// assert_eq!(segment_suffix("events_12", "events"), Some(12));
/// assert_eq!(segment_suffix("events_v2_40", "events"), None);
/// assert_eq!(segment_suffix("events_", "events"), None);
/// ```
pub fn segment_suffix(file_name: &str, name: &str) -> Option<u64> {
    let digits = file_name.strip_prefix(name)?.strip_prefix('_')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Sorts file names ascending by numeric suffix, so `name_9` comes before `name_10`.
///
/// The sort is stable: names sharing a suffix keep their relative order.
pub fn sort_by_suffix(files: &mut [String]) {
    files.sort_by_key(|name| trailing_suffix(name));
}
