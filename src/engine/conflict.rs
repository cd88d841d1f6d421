use ulid::Ulid;

use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::availability::{compute_saturated_spans, is_lapsed_hold};
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Shape and range of a caller-supplied interval.
/// Ordered and inside the representable calendar; arithmetic on the
/// result cannot overflow.
pub(crate) fn validate_query_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end).ok_or(EngineError::InvalidInterval("end must be after start"))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidInterval("timestamp out of range"));
    }
    Ok(span)
}

pub(crate) fn validate_interval(start: Ms, end: Ms, min_ms: Ms, max_ms: Ms) -> Result<Span, EngineError> {
    let span = validate_query_span(start, end)?;
    if span.duration_ms() < min_ms {
        return Err(EngineError::InvalidInterval("shorter than the minimum booking length"));
    }
    if span.duration_ms() > max_ms {
        return Err(EngineError::InvalidInterval("longer than the maximum booking length"));
    }
    Ok(span)
}

/// Outcome of checking a candidate interval against a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clear,
    /// Held by bookings the requester may not displace.
    HardConflict(Vec<Ulid>),
    /// Displacing exactly these bookings makes room.
    PreemptableConflict(Vec<Ulid>),
}

/// A live booking that competes with the candidate, stretched by the buffer.
struct Claim<'a> {
    booking: &'a Booking,
    span: Span,
}

/// Decide whether `span` can be booked at `priority` on `rs`.
///
/// Every booking, candidate included, carries `buffer_after` of turnover, so
/// two bookings collide when `a.start < b.end + buffer && b.start < a.end + buffer`.
/// When capacity is already full somewhere inside the candidate, victims are
/// picked greedily (lowest priority first, then most recently created) until
/// it no longer is. Holds that lapsed at or before `now` are not counted.
pub fn evaluate(rs: &ResourceState, span: &Span, priority: Priority, now: Ms) -> Verdict {
    let buffer = rs.buffer();
    let candidate = span.with_buffer(buffer);
    let search = Span::new(span.start.saturating_sub(buffer), candidate.end);

    let mut claims: Vec<Claim<'_>> = rs
        .active_overlapping(&search)
        .filter(|b| !is_lapsed_hold(b, now))
        .map(|b| Claim {
            booking: b,
            span: b.span.with_buffer(buffer),
        })
        .filter(|c| c.span.overlaps(&candidate))
        .collect();

    let initial = saturated_within(&claims, rs.capacity, &candidate);
    if initial.is_empty() {
        return Verdict::Clear;
    }

    let mut chosen = Vec::new();
    let mut hot = initial.clone();
    while !hot.is_empty() {
        let victim = claims
            .iter()
            .enumerate()
            .filter(|(_, c)| priority.can_preempt(c.booking.priority))
            .filter(|(_, c)| hot.iter().any(|h| h.overlaps(&c.span)))
            .min_by(|(_, a), (_, b)| {
                a.booking
                    .priority
                    .cmp(&b.booking.priority)
                    .then(b.booking.created_at.cmp(&a.booking.created_at))
                    .then(b.booking.id.cmp(&a.booking.id))
            })
            .map(|(i, _)| i);

        let Some(i) = victim else {
            let blocking = rs
                .active_overlapping(&search)
                .filter(|b| !is_lapsed_hold(b, now))
                .filter(|b| {
                    let s = b.span.with_buffer(buffer);
                    initial.iter().any(|h| h.overlaps(&s))
                })
                .map(|b| b.id)
                .collect();
            return Verdict::HardConflict(blocking);
        };
        chosen.push(claims.swap_remove(i).booking.id);
        hot = saturated_within(&claims, rs.capacity, &candidate);
    }

    Verdict::PreemptableConflict(chosen)
}

/// Saturated regions of `claims`, clipped to `window`.
fn saturated_within(claims: &[Claim<'_>], capacity: u32, window: &Span) -> Vec<Span> {
    let spans: Vec<Span> = claims.iter().map(|c| c.span).collect();
    compute_saturated_spans(&spans, capacity)
        .iter()
        .filter_map(|s| s.intersect(window))
        .collect()
}
