//! Dotted-numeric version comparison.
//!
//! Upstream versions are freeform strings; comparison splits on dots and
//! compares the numeric components, treating missing components as zero.
//! Non-numeric components are ignored, which is good enough for picking
//! the highest release token out of a download listing.

use std::cmp::Ordering;

/// Compare two version strings numerically by dotted components.
pub fn compare(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .filter_map(|s| {
                let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
                digits.parse().ok()
            })
            .collect()
    };

    let a_parts = parse(a);
    let b_parts = parse(b);

    for i in 0..a_parts.len().max(b_parts.len()) {
        let av = a_parts.get(i).copied().unwrap_or(0);
        let bv = b_parts.get(i).copied().unwrap_or(0);
        match av.cmp(&bv) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

/// Whether `latest` is strictly newer than `current`.
pub fn is_newer(current: &str, latest: &str) -> bool {
    compare(latest, current) == Ordering::Greater
}
