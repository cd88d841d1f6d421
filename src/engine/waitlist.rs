use std::sync::Arc;

use ulid::Ulid;

use crate::limits::MAX_WAITLIST_ENTRIES;
use crate::model::*;
use crate::observability::{WAITLIST_DEPTH, WAITLIST_PLACEMENTS_TOTAL};
use crate::waitlist::{WaitTarget, WaitlistEntry};

use super::availability::availability;
use super::conflict::{Verdict, evaluate, now_ms, validate_interval};
use super::mutations::validate_requester;
use super::{Engine, EngineError};

impl Engine {
    /// Put a request on the waitlist. A zero ticket is assigned the next one in
    /// line; `enqueued_at` of zero is stamped with the current time.
    pub async fn enqueue_waitlist(&self, mut entry: WaitlistEntry) -> Result<Ulid, EngineError> {
        validate_requester(&entry.requester)?;
        validate_interval(
            entry.window.start,
            entry.window.end,
            self.config.min_booking_ms,
            crate::limits::MAX_QUERY_WINDOW_MS,
        )?;
        if entry.duration < self.config.min_booking_ms
            || entry.duration > self.config.max_booking_ms
            || entry.duration > entry.window.duration_ms()
        {
            return Err(EngineError::InvalidInterval(
                "duration must fit the window and the booking length limits",
            ));
        }
        if let WaitTarget::Resource(rid) = entry.target {
            let info = self.resource_info(rid).await?;
            if !info.active {
                return Err(EngineError::InvalidResource(rid, "resource is inactive"));
            }
        }
        if self.waitlist.contains(&entry.id) || self.booking_to_resource.contains_key(&entry.id) {
            return Err(EngineError::AlreadyExists(entry.id));
        }
        if entry.enqueued_at == 0 {
            entry.enqueued_at = now_ms();
        }
        self.enqueue_entry(entry)
    }

    pub(super) fn enqueue_entry(&self, entry: WaitlistEntry) -> Result<Ulid, EngineError> {
        if self.waitlist.len() >= MAX_WAITLIST_ENTRIES {
            return Err(EngineError::LimitExceeded("waitlist is full"));
        }
        tracing::debug!(entry = %entry.id, requester = %entry.requester, window = %entry.window, "waitlisted");
        let id = self.waitlist.insert(entry);
        metrics::gauge!(WAITLIST_DEPTH).set(self.waitlist.len() as f64);
        Ok(id)
    }

    pub fn withdraw_waitlist(&self, id: Ulid) -> Result<WaitlistEntry, EngineError> {
        let entry = self.waitlist.remove(&id).ok_or(EngineError::NotFound(id))?;
        metrics::gauge!(WAITLIST_DEPTH).set(self.waitlist.len() as f64);
        Ok(entry)
    }

    /// Waiting entries, in the order they would be offered.
    pub fn waitlist_entries(&self) -> Vec<WaitlistEntry> {
        self.waitlist.snapshot()
    }

    /// Offer `freed` on a resource to the waitlist. Returns the bookings made.
    pub async fn on_capacity_freed(self: &Arc<Self>, resource_id: Ulid, freed: Span) -> Result<Vec<Ulid>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::InvalidResource(resource_id, "unknown resource"))?;
        let guard = self.acquire_write(resource_id, rs, None).await?;
        self.run_locked(guard, move |engine, mut guard| async move {
            Ok(engine.reoffer_locked(&mut guard, freed).await)
        })
        .await
    }

    /// Walk the compatible entries in priority-then-ticket order and book
    /// each into the first free slot of its window. Offers never preempt.
    /// The caller holds the resource's write lock.
    pub(super) async fn reoffer_locked(&self, rs: &mut ResourceState, freed: Span) -> Vec<Ulid> {
        let mut placed = Vec::new();
        if !rs.active || self.waitlist.is_empty() {
            return placed;
        }

        for candidate in self.waitlist.compatible(rs.id, rs.kind, &freed) {
            let Some(entry) = self.waitlist.claim(&candidate.id) else {
                continue;
            };
            let now = now_ms();
            let Some(slot) = first_fit(rs, &entry, now) else {
                self.waitlist.restore(entry);
                continue;
            };

            let booking = Booking {
                id: Ulid::new(),
                resource_id: rs.id,
                requester: entry.requester.clone(),
                span: slot,
                priority: entry.priority,
                status: BookingStatus::Confirmed,
                created_at: now,
                hold_expires_at: None,
                superseded_by: None,
                cancel_reason: None,
            };
            let booking_id = booking.id;
            if let Err(e) = self.persist_and_apply(rs, Event::BookingCreated { booking }).await {
                tracing::warn!(entry = %entry.id, "waitlist placement failed: {e}");
                self.waitlist.restore(entry);
                break;
            }

            tracing::info!(
                resource = %rs.id,
                booking = %booking_id,
                entry = %entry.id,
                displaced = ?entry.displaced,
                "waitlist entry placed"
            );
            metrics::counter!(WAITLIST_PLACEMENTS_TOTAL).increment(1);
            placed.push(booking_id);
        }

        metrics::gauge!(WAITLIST_DEPTH).set(self.waitlist.len() as f64);
        placed
    }
}

/// Earliest slot of `entry.duration` inside its window that books cleanly.
fn first_fit(rs: &ResourceState, entry: &WaitlistEntry, now: Ms) -> Option<Span> {
    availability(rs, &entry.window, entry.duration, now)
        .into_iter()
        .map(|free| Span::new(free.start, free.start + entry.duration))
        .find(|slot| {
            rs.index.check(slot, rs.capacity, &[]).is_ok()
                && evaluate(rs, slot, entry.priority, now) == Verdict::Clear
        })
}
