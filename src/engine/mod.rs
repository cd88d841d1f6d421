mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod registry;
mod waitlist;
#[cfg(test)]
mod tests;

pub use availability::{availability, compute_saturated_spans, merge_overlapping, subtract_intervals};
pub use conflict::{Verdict, evaluate};
pub use error::EngineError;

use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::ledger::Ledger;
use crate::model::*;
use crate::notify::{Notice, NotifyHub};
use crate::waitlist::Waitlist;

use conflict::now_ms;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit ledger channel ──────────────────────────

struct LedgerAppend {
    record: LedgerRecord,
    response: oneshot::Sender<io::Result<()>>,
}

/// Background task that owns the ledger and batches appends for group commit.
/// 1. Block until the first append arrives.
/// 2. Drain every append already queued behind it.
/// 3. Buffer the batch and fsync once.
/// 4. Answer every sender with the batch's result.
async fn ledger_writer_loop(mut ledger: Ledger, mut rx: mpsc::Receiver<LedgerAppend>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        metrics::histogram!(crate::observability::LEDGER_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut ledger, &batch);
        metrics::histogram!(crate::observability::LEDGER_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!(path = %ledger.path().display(), "ledger flush failed: {e}");
        }

        for append in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = append.response.send(r);
        }
    }
    tracing::debug!(records = ledger.appended(), "ledger writer stopped");
}

fn flush_batch(ledger: &mut Ledger, batch: &[LedgerAppend]) -> io::Result<()> {
    let mut append_err = None;
    for append in batch {
        if let Err(e) = ledger.append_buffered(&append.record) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so a half-written batch is not
    // carried into the next one.
    let flush_err = ledger.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

/// The allocation engine: every resource's bookings behind its own lock,
/// with the ledger as the source of truth.
pub struct Engine {
    pub state: DashMap<Ulid, SharedResourceState>,
    ledger_tx: mpsc::Sender<LedgerAppend>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → resource id
    pub(super) booking_to_resource: DashMap<Ulid, Ulid>,
    pub(super) waitlist: Waitlist,
    pub(super) config: EngineConfig,
}

/// Apply a recorded event to a resource. The caller holds its write lock.
fn apply_to_resource(rs: &mut ResourceState, event: &Event, booking_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ResourceUpdated {
            name,
            capacity,
            buffer_after,
            hours,
            ..
        } => {
            rs.name = name.clone();
            rs.capacity = *capacity;
            rs.buffer_after = *buffer_after;
            rs.hours = hours.clone();
        }
        Event::ResourceDeactivated { .. } => rs.active = false,
        Event::ResourceReactivated { .. } => rs.active = true,
        Event::BookingCreated { booking } => admit(rs, booking, booking_map),
        Event::BookingConfirmed { id, .. } => {
            if let Some(b) = rs.bookings.get_mut(id) {
                b.status = BookingStatus::Confirmed;
                b.hold_expires_at = None;
            }
        }
        Event::Preemption { booking, superseded } => {
            for victim in superseded {
                rs.index.remove(victim);
                if let Some(b) = rs.bookings.get_mut(victim) {
                    b.status = BookingStatus::Preempted;
                    b.superseded_by = Some(booking.id);
                }
            }
            admit(rs, booking, booking_map);
        }
        Event::BookingCancelled { id, reason, .. } => {
            rs.index.remove(id);
            if let Some(b) = rs.bookings.get_mut(id) {
                b.status = BookingStatus::Cancelled;
                b.cancel_reason = Some(reason.clone());
            }
        }
        Event::BookingCompleted { id, .. } => {
            rs.index.remove(id);
            if let Some(b) = rs.bookings.get_mut(id) {
                b.status = BookingStatus::Completed;
            }
        }
        // Registration is handled at the DashMap level, not here
        Event::ResourceRegistered { .. } => {}
    }
}

fn admit(rs: &mut ResourceState, booking: &Booking, booking_map: &DashMap<Ulid, Ulid>) {
    if booking.status.is_active() {
        rs.index.insert_unchecked(booking.span, booking.id);
    }
    booking_map.insert(booking.id, rs.id);
    rs.bookings.insert(booking.id, booking.clone());
}

/// Notices owed to requesters once `event` has been applied to `rs`.
fn notices_for(rs: &ResourceState, event: &Event) -> Vec<Notice> {
    let booking = |id: &Ulid| rs.bookings.get(id);
    match event {
        Event::BookingCreated { booking: b } if b.status == BookingStatus::Confirmed => {
            vec![Notice::confirmed(b)]
        }
        Event::BookingConfirmed { id, .. } => booking(id).map(Notice::confirmed).into_iter().collect(),
        Event::Preemption { booking: b, superseded } => {
            let mut out = vec![Notice::confirmed(b)];
            out.extend(superseded.iter().filter_map(booking).map(|victim| Notice::BookingPreempted {
                booking_id: victim.id,
                resource_id: rs.id,
                requester: victim.requester.clone(),
                superseded_by: b.id,
            }));
            out
        }
        Event::BookingCancelled { id, reason, .. } => booking(id)
            .map(|b| Notice::BookingCancelled {
                booking_id: b.id,
                resource_id: rs.id,
                requester: b.requester.clone(),
                reason: reason.clone(),
            })
            .into_iter()
            .collect(),
        Event::BookingCompleted { id, .. } => booking(id)
            .map(|b| Notice::BookingCompleted {
                booking_id: b.id,
                resource_id: rs.id,
                requester: b.requester.clone(),
            })
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

impl Engine {
    /// Replay the ledger at `config.ledger_path`, then start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(config: EngineConfig, notify: Arc<NotifyHub>) -> io::Result<Self> {
        if let Some(dir) = config.ledger_path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        let records = Ledger::replay(&config.ledger_path)?;
        let ledger = Ledger::open(&config.ledger_path)?;
        let (ledger_tx, ledger_rx) = mpsc::channel(4096);
        tokio::spawn(ledger_writer_loop(ledger, ledger_rx));

        let engine = Self {
            state: DashMap::new(),
            ledger_tx,
            notify,
            booking_to_resource: DashMap::new(),
            waitlist: Waitlist::new(),
            config,
        };

        // Sole owner of these Arcs during replay, so try_write never
        // contends. Never block here: this may run inside an async context.
        for record in &records {
            match &record.event {
                Event::ResourceRegistered { id, spec } => {
                    let mut rs = ResourceState::new(*id, spec.clone());
                    rs.next_seq = record.seq + 1;
                    engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                }
                other => {
                    let Some(rs_arc) = engine.get_resource(&record.resource_id) else {
                        tracing::warn!(resource = %record.resource_id, seq = record.seq, "ledger record for unregistered resource, skipped");
                        continue;
                    };
                    if let Ok(mut guard) = rs_arc.try_write() {
                        apply_to_resource(&mut guard, other, &engine.booking_to_resource);
                        guard.next_seq = guard.next_seq.max(record.seq + 1);
                    }
                }
            }
        }

        tracing::info!(
            resources = engine.state.len(),
            bookings = engine.booking_to_resource.len(),
            records = records.len(),
            "ledger replayed"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Write a record through the background group-commit writer.
    async fn ledger_append(&self, record: &LedgerRecord) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.ledger_tx
            .send(LedgerAppend {
                record: record.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::LedgerError("ledger writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::LedgerError("ledger writer dropped response".into()))?
            .map_err(|e| EngineError::LedgerError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn resource_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_resource.get(booking_id).map(|e| *e.value())
    }

    /// Ledger-append, apply, notify. Write-ahead: nothing changes in memory
    /// unless the record is durable.
    pub(super) async fn persist_and_apply(&self, rs: &mut ResourceState, event: Event) -> Result<(), EngineError> {
        let record = LedgerRecord {
            resource_id: rs.id,
            seq: rs.next_seq,
            at: now_ms(),
            event,
        };
        self.ledger_append(&record).await?;
        rs.next_seq += 1;
        apply_to_resource(rs, &record.event, &self.booking_to_resource);
        for notice in notices_for(rs, &record.event) {
            self.notify.publish(notice);
        }
        Ok(())
    }

    /// Run the rest of a write on its own task, which owns the lock until
    /// `body` finishes. Dropping the caller's future from here on cannot
    /// leave a durable record unapplied.
    pub(super) async fn run_locked<T, F, Fut>(
        self: &Arc<Self>,
        guard: OwnedRwLockWriteGuard<ResourceState>,
        body: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce(Arc<Engine>, OwnedRwLockWriteGuard<ResourceState>) -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(body(self.clone(), guard))
            .await
            .map_err(|e| EngineError::LedgerError(format!("locked section aborted: {e}")))?
    }

    /// Take a resource's write lock, waiting at most `lock_timeout`.
    ///
    /// A cancelled `withdraw` token aborts the wait with `Withdrawn`. Once the
    /// lock is held the token is no longer consulted.
    pub(super) async fn acquire_write(
        &self,
        resource_id: Ulid,
        rs: SharedResourceState,
        withdraw: Option<&CancellationToken>,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let acquire = tokio::time::timeout(self.config.lock_timeout, rs.write_owned());
        let acquired = match withdraw {
            None => acquire.await,
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(EngineError::Withdrawn),
                    r = acquire => r,
                }
            }
        };
        acquired.map_err(|_| self.busy(resource_id))
    }

    pub(super) async fn acquire_read(
        &self,
        resource_id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<ResourceState>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::InvalidResource(resource_id, "unknown resource"))?;
        tokio::time::timeout(self.config.lock_timeout, rs.read_owned())
            .await
            .map_err(|_| self.busy(resource_id))
    }

    fn busy(&self, resource_id: Ulid) -> EngineError {
        metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
        tracing::warn!(resource = %resource_id, timeout_ms = self.config.lock_timeout.as_millis() as u64, "lock wait timed out");
        EngineError::Busy(resource_id)
    }

    /// Lookup booking → resource, get resource, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .resource_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = self.acquire_write(resource_id, rs, None).await?;
        Ok((resource_id, guard))
    }
}
