use ulid::Ulid;

use crate::index::IndexEntry;
use crate::ledger::Ledger;
use crate::limits::*;
use crate::model::*;

use super::availability::{availability, is_lapsed_hold};
use super::conflict::{Verdict, evaluate, now_ms, validate_query_span};
use super::{Engine, EngineError};

impl Engine {
    /// Free time on a resource between `start` and `end`, keeping only spans
    /// of at least `min_duration`. Empty for an inactive resource.
    pub async fn query_availability(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        let query = validate_query_span(start, end)?;
        if query.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let guard = self.acquire_read(resource_id).await?;
        Ok(availability(&guard, &query, min_duration, now_ms()))
    }

    /// Every ledger record for a resource, in sequence order.
    pub async fn booking_history(&self, resource_id: Ulid) -> Result<Vec<LedgerRecord>, EngineError> {
        if !self.state.contains_key(&resource_id) {
            return Err(EngineError::InvalidResource(resource_id, "unknown resource"));
        }
        let path = self.config.ledger_path.clone();
        tokio::task::spawn_blocking(move || Ledger::replay_resource(&path, resource_id))
            .await
            .map_err(|e| EngineError::LedgerError(e.to_string()))?
            .map_err(|e| EngineError::LedgerError(e.to_string()))
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let resource_id = self.resource_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let guard = self.acquire_read(resource_id).await?;
        guard.bookings.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// All bookings on a resource, terminal ones included, by start time.
    pub async fn bookings(&self, resource_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let guard = self.acquire_read(resource_id).await?;
        let mut out: Vec<Booking> = guard.bookings.values().cloned().collect();
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    /// Pending and confirmed bookings, by start time.
    pub async fn active_bookings(&self, resource_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let guard = self.acquire_read(resource_id).await?;
        Ok(guard
            .index
            .entries()
            .iter()
            .filter_map(|e| guard.bookings.get(&e.booking_id).cloned())
            .collect())
    }

    /// Active bookings whose interval intersects `span`, by start time.
    pub async fn overlaps(&self, resource_id: Ulid, span: Span) -> Result<Vec<Ulid>, EngineError> {
        let span = validate_query_span(span.start, span.end)?;
        let guard = self.acquire_read(resource_id).await?;
        Ok(guard.index.overlaps(&span))
    }

    /// What `request_booking` would decide right now, without booking.
    pub async fn evaluate(&self, resource_id: Ulid, span: Span, priority: Priority) -> Result<Verdict, EngineError> {
        let span = validate_query_span(span.start, span.end)?;
        let guard = self.acquire_read(resource_id).await?;
        Ok(evaluate(&guard, &span, priority, now_ms()))
    }

    pub async fn index_snapshot(&self, resource_id: Ulid) -> Result<Vec<IndexEntry>, EngineError> {
        let guard = self.acquire_read(resource_id).await?;
        Ok(guard.index.entries().to_vec())
    }

    /// `(booking, resource)` for every hold that lapsed at or before `now`.
    /// Resources locked right now are skipped; the next sweep finds them.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        self.collect_active(|b| is_lapsed_hold(b, now))
    }

    /// Confirmed bookings that ended at or before `now`.
    pub fn collect_finished(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        self.collect_active(|b| b.status == BookingStatus::Confirmed && b.span.end <= now)
    }

    fn collect_active(&self, pick: impl Fn(&Booking) -> bool) -> Vec<(Ulid, Ulid)> {
        let mut out = Vec::new();
        for entry in self.state.iter() {
            let Ok(guard) = entry.value().try_read() else {
                continue;
            };
            out.extend(
                guard
                    .index
                    .entries()
                    .iter()
                    .filter_map(|e| guard.bookings.get(&e.booking_id))
                    .filter(|b| pick(b))
                    .map(|b| (b.id, guard.id)),
            );
        }
        out
    }
}
