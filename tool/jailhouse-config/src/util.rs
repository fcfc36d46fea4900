//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

pub fn str_to_bool(s: &str) -> Option<bool> {
    match s {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Zero is not a power of two.
pub fn is_power_of_two(n: u64) -> bool {
    n != 0 && n & (n - 1) == 0
}

/// Whether `[start1, end1)` and `[start2, end2)` share an address.
pub fn ranges_overlap(start1: u64, end1: u64, start2: u64, end2: u64) -> bool {
    start1 < end2 && start2 < end1
}

/// Sort-and-sweep over half-open intervals `(start, end, tag)`.
///
/// Intervals are visited by ascending start while the set of intervals that
/// are still open is maintained. Each overlapping pair is returned exactly
/// once, ordered by the start of its members. Empty intervals never overlap.
pub fn overlapping_pairs<T: Copy>(mut intervals: Vec<(u64, u64, T)>) -> Vec<(T, T)> {
    intervals.retain(|(start, end, _)| start < end);
    intervals.sort_by_key(|(start, end, _)| (*start, *end));

    let mut open: Vec<(u64, u64, T)> = Vec::new();
    let mut pairs = Vec::new();
    for interval in intervals {
        let (start, _, tag) = interval;
        open.retain(|(_, end, _)| *end > start);
        for (_, _, other) in &open {
            pairs.push((*other, tag));
        }
        open.push(interval);
    }

    pairs
}

/// Product a 'human readable' string for the size, using the largest
/// power-of-two unit that represents it exactly.
pub fn human_size(size: u64) -> String {
    for (bits, label) in [
        (60, "EiB"),
        (50, "PiB"),
        (40, "TiB"),
        (30, "GiB"),
        (20, "MiB"),
        (10, "KiB"),
    ] {
        let base = 1u64 << bits;
        if size >= base && size.is_multiple_of(base) {
            return format!("{} {}", comma_sep_u64(size / base), label);
        }
    }

    format!("{} bytes", comma_sep_u64(size))
}

/// Take an integer, such as 1000000 and add commas such as:
/// 1,000,000.
pub fn comma_sep_u64(n: u64) -> String {
    let mut s = String::new();
    for (i, val) in n.to_string().chars().rev().enumerate() {
        if i != 0 && i % 3 == 0 {
            s.insert(0, ',');
        }
        s.insert(0, val);
    }

    s
}

/// Format a list of interrupt lines compactly, folding consecutive numbers
/// into ranges: `32-35,40`.
pub fn fold_ranges(values: &[u64]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut i = 0;
    while i < values.len() {
        let first = values[i];
        let mut last = first;
        while i + 1 < values.len() && values[i + 1] == last + 1 {
            i += 1;
            last = values[i];
        }
        if first == last {
            parts.push(first.to_string());
        } else {
            parts.push(format!("{first}-{last}"));
        }
        i += 1;
    }

    parts.join(",")
}
