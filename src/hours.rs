//! Weekly operating hours, expanded into concrete UTC spans.

use crate::engine::{merge_overlapping, subtract_intervals};
use crate::model::{DAY_MS, Ms, OperatingWindow, Span};

/// Day of week for a timestamp, 0 = Monday. 1970-01-01 was a Thursday.
pub fn weekday(t: Ms) -> u8 {
    (t.div_euclid(DAY_MS) + 3).rem_euclid(7) as u8
}

/// Start of the UTC day containing `t`.
pub fn day_start(t: Ms) -> Ms {
    t.div_euclid(DAY_MS) * DAY_MS
}

pub fn validate_windows(hours: &[OperatingWindow]) -> Result<(), &'static str> {
    for w in hours {
        if w.weekday > 6 {
            return Err("weekday must be 0 (Monday) through 6 (Sunday)");
        }
        if w.open < 0 || w.close > DAY_MS || w.open >= w.close {
            return Err("window must satisfy 0 <= open < close <= 24h");
        }
    }
    Ok(())
}

/// Open time inside `query`, sorted and merged. No windows means always open.
pub fn open_spans(hours: &[OperatingWindow], query: &Span) -> Vec<Span> {
    if hours.is_empty() {
        return vec![*query];
    }
    let mut spans = Vec::new();
    let mut day = day_start(query.start);
    while day < query.end {
        let wd = weekday(day);
        for w in hours.iter().filter(|w| w.weekday == wd) {
            let occurrence = Span::new(day + w.open, day + w.close);
            if let Some(clamped) = occurrence.intersect(query) {
                spans.push(clamped);
            }
        }
        day += DAY_MS;
    }
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// True when every instant of `span` falls inside an operating window.
pub fn covers(hours: &[OperatingWindow], span: &Span) -> bool {
    if hours.is_empty() {
        return true;
    }
    let open = open_spans(hours, span);
    subtract_intervals(&[*span], &open).is_empty()
}
