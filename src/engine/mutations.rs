use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::hours;
use crate::index::IndexError;
use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKING_REQUESTS_TOTAL, PREEMPTIONS_TOTAL};
use crate::waitlist::{WaitTarget, WaitlistEntry};

use super::availability::is_lapsed_hold;
use super::conflict::{Verdict, evaluate, now_ms, validate_interval, validate_query_span};
use super::{Engine, EngineError};

pub(super) fn validate_requester(requester: &str) -> Result<(), EngineError> {
    if requester.trim().is_empty() {
        return Err(EngineError::InvalidInterval("requester must not be empty"));
    }
    if requester.len() > MAX_REQUESTER_LEN {
        return Err(EngineError::LimitExceeded("requester too long"));
    }
    Ok(())
}

fn index_conflict(e: IndexError) -> EngineError {
    match e {
        IndexError::IntervalConflict(id) => EngineError::IntervalConflict(id),
    }
}

fn outcome(label: &'static str) {
    metrics::counter!(BOOKING_REQUESTS_TOTAL, "outcome" => label).increment(1);
}

impl Engine {
    /// Book `req.start..req.end` on a resource, preempting if the request is
    /// an emergency and only lower-priority bookings stand in the way.
    pub async fn request_booking(self: &Arc<Self>, req: BookingRequest) -> Result<BookingReceipt, EngineError> {
        self.place_request(req, None).await
    }

    /// As `request_booking`, but gives up with `Withdrawn` if `withdraw` is
    /// cancelled while still waiting for the resource's lock.
    pub async fn request_booking_cancellable(
        self: &Arc<Self>,
        req: BookingRequest,
        withdraw: &CancellationToken,
    ) -> Result<BookingReceipt, EngineError> {
        self.place_request(req, Some(withdraw)).await
    }

    async fn place_request(
        self: &Arc<Self>,
        req: BookingRequest,
        withdraw: Option<&CancellationToken>,
    ) -> Result<BookingReceipt, EngineError> {
        validate_requester(&req.requester)?;
        let rs = self
            .get_resource(&req.resource_id)
            .ok_or(EngineError::InvalidResource(req.resource_id, "unknown resource"))?;
        let guard = self.acquire_write(req.resource_id, rs, withdraw).await?;
        self.run_locked(guard, move |engine, mut guard| async move {
            engine.place_locked(&mut guard, req).await
        })
        .await
    }

    async fn place_locked(&self, rs: &mut ResourceState, req: BookingRequest) -> Result<BookingReceipt, EngineError> {
        if !rs.active {
            return Err(EngineError::InvalidResource(rs.id, "resource is inactive"));
        }
        // Hours are judged first; a malformed interval has no hours to judge.
        let span = validate_query_span(req.start, req.end)?;
        if !hours::covers(&rs.hours, &span) {
            return Err(EngineError::OutsideOperatingHours(span));
        }
        validate_interval(req.start, req.end, self.config.min_booking_ms, self.config.max_booking_ms)?;
        let now = now_ms();
        if let Some(deadline) = req.hold_until
            && deadline <= now
        {
            return Err(EngineError::InvalidInterval("hold deadline already passed"));
        }
        if rs.index.len() >= MAX_ACTIVE_BOOKINGS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many active bookings on resource"));
        }
        let id = req.id.unwrap_or_else(Ulid::new);
        if self.booking_to_resource.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let booking = Booking {
            id,
            resource_id: rs.id,
            requester: req.requester.clone(),
            span,
            priority: req.priority,
            status: if req.hold_until.is_some() {
                BookingStatus::Pending
            } else {
                BookingStatus::Confirmed
            },
            created_at: now,
            hold_expires_at: req.hold_until,
            superseded_by: None,
            cancel_reason: None,
        };

        match evaluate(rs, &span, req.priority, now) {
            Verdict::Clear => {
                self.expire_lapsed_holds(rs, &span, now).await?;
                rs.index.check(&span, rs.capacity, &[]).map_err(index_conflict)?;
                let status = booking.status;
                self.persist_and_apply(rs, Event::BookingCreated { booking }).await?;
                outcome(if status == BookingStatus::Pending { "held" } else { "confirmed" });
                Ok(BookingReceipt {
                    booking_id: id,
                    resource_id: rs.id,
                    status,
                    preempted: Vec::new(),
                })
            }
            Verdict::PreemptableConflict(victims) => {
                self.expire_lapsed_holds(rs, &span, now).await?;
                rs.index.check(&span, rs.capacity, &victims).map_err(index_conflict)?;
                let status = booking.status;
                let event = Event::Preemption {
                    booking,
                    superseded: victims.clone(),
                };
                self.persist_and_apply(rs, event).await?;

                tracing::info!(resource = %rs.id, booking = %id, preempted = victims.len(), "emergency preempted bookings");
                metrics::counter!(PREEMPTIONS_TOTAL).increment(victims.len() as u64);
                outcome("preempting");

                // The displaced keep a claim on their original slot.
                for victim in &victims {
                    let Some(b) = rs.bookings.get(victim) else { continue };
                    let entry = WaitlistEntry {
                        id: Ulid::new(),
                        requester: b.requester.clone(),
                        target: WaitTarget::Resource(rs.id),
                        window: b.span,
                        duration: b.span.duration_ms(),
                        priority: b.priority,
                        enqueued_at: now,
                        ticket: 0,
                        displaced: Some(b.id),
                    };
                    if let Err(e) = self.enqueue_entry(entry) {
                        tracing::warn!(booking = %victim, "could not waitlist preempted booking: {e}");
                    }
                }

                Ok(BookingReceipt {
                    booking_id: id,
                    resource_id: rs.id,
                    status,
                    preempted: victims,
                })
            }
            Verdict::HardConflict(conflicting) => {
                outcome("conflict");
                let waitlisted = if req.waitlist_on_conflict {
                    let entry = WaitlistEntry {
                        id: Ulid::new(),
                        requester: req.requester,
                        target: WaitTarget::Resource(rs.id),
                        window: span,
                        duration: span.duration_ms(),
                        priority: req.priority,
                        enqueued_at: now,
                        ticket: 0,
                        displaced: None,
                    };
                    Some(self.enqueue_entry(entry)?)
                } else {
                    None
                };
                Err(EngineError::Conflict {
                    conflicting,
                    waitlisted,
                })
            }
        }
    }

    /// Cancel a pending or confirmed booking and offer the freed time to the
    /// waitlist. Returns the booking's resource.
    pub async fn cancel_booking(self: &Arc<Self>, id: Ulid, reason: impl Into<String>) -> Result<Ulid, EngineError> {
        let reason = reason.into();
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("cancellation reason too long"));
        }
        let (resource_id, guard) = self.resolve_booking_write(&id).await?;
        self.run_locked(guard, move |engine, mut guard| async move {
            engine.cancel_locked(&mut guard, id, resource_id, reason).await
        })
        .await
    }

    async fn cancel_locked(
        &self,
        rs: &mut ResourceState,
        id: Ulid,
        resource_id: Ulid,
        reason: String,
    ) -> Result<Ulid, EngineError> {
        let booking = rs.bookings.get(&id).ok_or(EngineError::NotFound(id))?;
        if !booking.status.is_active() {
            return Err(EngineError::InvalidState {
                id,
                status: booking.status,
            });
        }
        let freed = booking.span;

        self.persist_and_apply(
            rs,
            Event::BookingCancelled {
                id,
                resource_id,
                reason,
            },
        )
        .await?;
        self.reoffer_locked(rs, freed).await;
        Ok(resource_id)
    }

    /// Turn a pending hold into a confirmed booking. A hold past its
    /// deadline is cancelled instead and reported as `HoldExpired`.
    pub async fn confirm_booking(self: &Arc<Self>, id: Ulid) -> Result<Ulid, EngineError> {
        let (resource_id, guard) = self.resolve_booking_write(&id).await?;
        self.run_locked(guard, move |engine, mut guard| async move {
            engine.confirm_locked(&mut guard, id, resource_id).await
        })
        .await
    }

    async fn confirm_locked(&self, rs: &mut ResourceState, id: Ulid, resource_id: Ulid) -> Result<Ulid, EngineError> {
        let booking = rs.bookings.get(&id).ok_or(EngineError::NotFound(id))?;
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::InvalidState {
                id,
                status: booking.status,
            });
        }

        let now = now_ms();
        if is_lapsed_hold(booking, now) {
            let freed = booking.span;
            self.persist_and_apply(
                rs,
                Event::BookingCancelled {
                    id,
                    resource_id,
                    reason: "hold expired".into(),
                },
            )
            .await?;
            self.reoffer_locked(rs, freed).await;
            return Err(EngineError::HoldExpired(id));
        }

        self.persist_and_apply(rs, Event::BookingConfirmed { id, resource_id })
            .await?;
        Ok(resource_id)
    }

    /// Mark a confirmed booking finished. Whatever is left of its interval
    /// from now on is offered to the waitlist.
    pub async fn complete_booking(self: &Arc<Self>, id: Ulid) -> Result<Ulid, EngineError> {
        let (resource_id, guard) = self.resolve_booking_write(&id).await?;
        self.run_locked(guard, move |engine, mut guard| async move {
            engine.complete_locked(&mut guard, id, resource_id).await
        })
        .await
    }

    async fn complete_locked(&self, rs: &mut ResourceState, id: Ulid, resource_id: Ulid) -> Result<Ulid, EngineError> {
        let booking = rs.bookings.get(&id).ok_or(EngineError::NotFound(id))?;
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::InvalidState {
                id,
                status: booking.status,
            });
        }
        let span = booking.span;

        self.persist_and_apply(rs, Event::BookingCompleted { id, resource_id })
            .await?;
        if let Some(rest) = Span::try_new(span.start.max(now_ms()), span.end) {
            self.reoffer_locked(rs, rest).await;
        }
        Ok(resource_id)
    }

    /// Cancel a hold if it lapsed at or before `now`. `Ok(false)` when it
    /// was confirmed, cancelled or still live in the meantime.
    pub async fn expire_hold(self: &Arc<Self>, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let (resource_id, guard) = self.resolve_booking_write(&id).await?;
        self.run_locked(guard, move |engine, mut guard| async move {
            engine.expire_locked(&mut guard, id, resource_id, now).await
        })
        .await
    }

    async fn expire_locked(
        &self,
        rs: &mut ResourceState,
        id: Ulid,
        resource_id: Ulid,
        now: Ms,
    ) -> Result<bool, EngineError> {
        let Some(booking) = rs.bookings.get(&id) else {
            return Ok(false);
        };
        if !is_lapsed_hold(booking, now) {
            return Ok(false);
        }
        let freed = booking.span;
        self.persist_and_apply(
            rs,
            Event::BookingCancelled {
                id,
                resource_id,
                reason: "hold expired".into(),
            },
        )
        .await?;
        self.reoffer_locked(rs, freed).await;
        Ok(true)
    }

    /// Cancel lapsed holds that would otherwise still sit in the index
    /// where `span` (with turnover) is about to go.
    async fn expire_lapsed_holds(&self, rs: &mut ResourceState, span: &Span, now: Ms) -> Result<(), EngineError> {
        let buffer = rs.buffer();
        let search = Span::new(span.start.saturating_sub(buffer), span.end.saturating_add(buffer));
        let lapsed: Vec<Ulid> = rs
            .active_overlapping(&search)
            .filter(|b| is_lapsed_hold(b, now))
            .map(|b| b.id)
            .collect();
        for id in lapsed {
            let resource_id = rs.id;
            self.persist_and_apply(
                rs,
                Event::BookingCancelled {
                    id,
                    resource_id,
                    reason: "hold expired".into(),
                },
            )
            .await?;
        }
        Ok(())
    }
}
