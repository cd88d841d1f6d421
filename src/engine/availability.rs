use crate::hours;
use crate::model::*;

// ── Availability ──────────────────────────────────────────────────

/// Free time on a resource inside `query`.
///
/// Operating hours minus every instant where active bookings (stretched by
/// the turnover buffer) already fill capacity. A saturated region also
/// blocks the `buffer` ms before it, so any span returned here can take a
/// booking whose own turnover still fits. Holds that expired at or before
/// `now` are ignored. Spans shorter than `min_duration` are dropped.
pub fn availability(rs: &ResourceState, query: &Span, min_duration: Ms, now: Ms) -> Vec<Span> {
    if !rs.active {
        return Vec::new();
    }
    let open = hours::open_spans(&rs.hours, query);
    if open.is_empty() {
        return open;
    }

    let buffer = rs.buffer();
    let search = Span::new(query.start.saturating_sub(buffer), query.end.saturating_add(buffer));
    let claims = buffered_claims(rs, &search, now);

    let blocked: Vec<Span> = compute_saturated_spans(&claims, rs.capacity)
        .into_iter()
        .map(|s| Span::new(s.start.saturating_sub(buffer), s.end))
        .collect();
    let blocked = merge_overlapping(&blocked);

    subtract_intervals(&open, &blocked)
        .into_iter()
        .filter(|s| s.duration_ms() >= min_duration.max(1))
        .collect()
}

/// Live bookings overlapping `search`, each stretched by the buffer, sorted.
pub(crate) fn buffered_claims(rs: &ResourceState, search: &Span, now: Ms) -> Vec<Span> {
    let buffer = rs.buffer();
    let mut claims: Vec<Span> = rs
        .active_overlapping(search)
        .filter(|b| !is_lapsed_hold(b, now))
        .map(|b| b.span.with_buffer(buffer))
        .collect();
    claims.sort_by_key(|s| s.start);
    claims
}

/// A pending hold whose deadline has passed no longer claims time.
pub(crate) fn is_lapsed_hold(booking: &Booking, now: Ms) -> bool {
    booking.status == BookingStatus::Pending
        && booking.hold_expires_at.is_some_and(|exp| exp <= now)
}

/// Merge sorted overlapping or adjacent spans into disjoint spans.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut out = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = to_remove[j];
            if r.start > cursor {
                out.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            out.push(Span::new(cursor, b.end));
        }
    }

    out
}

/// Sweep line over `claims`: the merged regions where at least `capacity`
/// of them are in force at once. Input need not be sorted.
pub fn compute_saturated_spans(claims: &[Span], capacity: u32) -> Vec<Span> {
    if claims.is_empty() || capacity == 0 {
        return Vec::new();
    }
    if capacity == 1 {
        let mut sorted = claims.to_vec();
        sorted.sort_by_key(|s| s.start);
        return merge_overlapping(&sorted);
    }

    // Ends sort before starts at the same instant: half-open spans that
    // touch do not stack.
    let mut edges: Vec<(Ms, i32)> = Vec::with_capacity(claims.len() * 2);
    for c in claims {
        edges.push((c.start, 1));
        edges.push((c.end, -1));
    }
    edges.sort_unstable();

    let mut regions = Vec::new();
    let mut depth: i64 = 0;
    let mut opened: Option<Ms> = None;

    for (at, delta) in edges {
        depth += i64::from(delta);
        if depth >= i64::from(capacity) {
            opened.get_or_insert(at);
        } else if let Some(start) = opened.take()
            && at > start
        {
            regions.push(Span::new(start, at));
        }
    }

    merge_overlapping(&regions)
}
