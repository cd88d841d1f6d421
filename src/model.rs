use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::index::IntervalIndex;

/// Unix milliseconds, UTC. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied bounds.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Overlapping part of two spans, if any.
    pub fn intersect(&self, other: &Span) -> Option<Span> {
        Span::try_new(self.start.max(other.start), self.end.min(other.end))
    }

    /// The span stretched by `buffer` ms at the end (turnover time).
    pub fn with_buffer(&self, buffer: Ms) -> Span {
        Span::new(self.start, self.end + buffer)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Enumerations ─────────────────────────────────────────────────

/// Urgency of a request. The derived order is the preemption order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Routine,
    Urgent,
    Emergency,
}

impl Priority {
    /// Preemption table: only emergencies displace, and only lower classes.
    pub fn can_preempt(self, held: Priority) -> bool {
        self == Priority::Emergency && held < Priority::Emergency
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Routine => "routine",
            Priority::Urgent => "urgent",
            Priority::Emergency => "emergency",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "routine" => Ok(Priority::Routine),
            "urgent" => Ok(Priority::Urgent),
            "emergency" => Ok(Priority::Emergency),
            other => Err(format!(
                "invalid priority '{other}': expected routine, urgent or emergency"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// A clinician's appointment calendar.
    Provider,
    Bed,
    Theatre,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Provider => "provider",
            ResourceKind::Bed => "bed",
            ResourceKind::Theatre => "theatre",
        }
    }

    /// Beds and theatres are exclusively held; only calendars may double-book.
    pub fn allows_shared_capacity(self) -> bool {
        matches!(self, ResourceKind::Provider)
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "provider" => Ok(ResourceKind::Provider),
            "bed" => Ok(ResourceKind::Bed),
            "theatre" | "theater" => Ok(ResourceKind::Theatre),
            other => Err(format!(
                "invalid resource kind '{other}': expected provider, bed or theatre"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Preempted,
    Completed,
}

impl BookingStatus {
    /// Pending and confirmed bookings hold the resource.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Preempted => "preempted",
            BookingStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One weekly availability window, as offsets from UTC midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatingWindow {
    /// 0 = Monday … 6 = Sunday.
    pub weekday: u8,
    pub open: Ms,
    pub close: Ms,
}

impl OperatingWindow {
    pub fn new(weekday: u8, open: Ms, close: Ms) -> Self {
        Self { weekday, open, close }
    }

    /// The same hours on every day of the week.
    pub fn every_day(open: Ms, close: Ms) -> Vec<Self> {
        (0..7).map(|d| Self::new(d, open, close)).collect()
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub requester: String,
    pub span: Span,
    pub priority: Priority,
    pub status: BookingStatus,
    pub created_at: Ms,
    /// Set while the booking is a pending hold.
    pub hold_expires_at: Option<Ms>,
    pub superseded_by: Option<Ulid>,
    pub cancel_reason: Option<String>,
}

/// What a caller presents to the allocation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    /// Caller-chosen id; generated when absent.
    pub id: Option<Ulid>,
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub requester: String,
    pub priority: Priority,
    /// Create a pending hold that must be confirmed before this instant.
    pub hold_until: Option<Ms>,
    /// Join the waitlist when the request hits a hard conflict.
    pub waitlist_on_conflict: bool,
}

impl BookingRequest {
    pub fn new(
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        requester: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            id: None,
            resource_id,
            start,
            end,
            requester: requester.into(),
            priority,
            hold_until: None,
            waitlist_on_conflict: false,
        }
    }

    pub fn with_id(mut self, id: Ulid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn held_until(mut self, expires_at: Ms) -> Self {
        self.hold_until = Some(expires_at);
        self
    }

    pub fn or_waitlist(mut self) -> Self {
        self.waitlist_on_conflict = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub booking_id: Ulid,
    pub resource_id: Ulid,
    pub status: BookingStatus,
    /// Bookings displaced by this one; the caller notifies their holders.
    pub preempted: Vec<Ulid>,
}

// ── Resource state ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub name: Option<String>,
    /// Max concurrent active bookings (default 1).
    pub capacity: u32,
    /// Turnover time in ms after each booking ends (e.g. bed cleaning).
    pub buffer_after: Option<Ms>,
    /// Empty means always open.
    pub hours: Vec<OperatingWindow>,
    pub active: bool,
    /// Active bookings, ordered by start.
    pub index: IntervalIndex,
    /// Every booking ever made on this resource, terminal ones included.
    pub bookings: HashMap<Ulid, Booking>,
    /// Sequence number of the next ledger record for this resource.
    pub next_seq: u64,
}

impl ResourceState {
    pub fn new(id: Ulid, spec: ResourceSpec) -> Self {
        Self {
            id,
            kind: spec.kind,
            name: spec.name,
            capacity: spec.capacity,
            buffer_after: spec.buffer_after,
            hours: spec.hours,
            active: true,
            index: IntervalIndex::new(),
            bookings: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn buffer(&self) -> Ms {
        self.buffer_after.unwrap_or(0)
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            kind: self.kind,
            name: self.name.clone(),
            capacity: self.capacity,
            buffer_after: self.buffer_after,
            hours: self.hours.clone(),
            active: self.active,
        }
    }

    /// Active bookings whose span intersects `query`, in start order.
    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.index
            .overlapping(query)
            .filter_map(|entry| self.bookings.get(&entry.booking_id))
    }
}

/// Registration parameters of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    pub name: Option<String>,
    pub capacity: u32,
    pub buffer_after: Option<Ms>,
    pub hours: Vec<OperatingWindow>,
}

impl ResourceSpec {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            name: None,
            capacity: 1,
            buffer_after: None,
            hours: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn buffer_after(mut self, buffer: Ms) -> Self {
        self.buffer_after = Some(buffer);
        self
    }

    pub fn hours(mut self, hours: Vec<OperatingWindow>) -> Self {
        self.hours = hours;
        self
    }
}

// ── Ledger records ───────────────────────────────────────────────

/// State transitions, flat with no nesting. This is the ledger payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        id: Ulid,
        spec: ResourceSpec,
    },
    ResourceUpdated {
        id: Ulid,
        name: Option<String>,
        capacity: u32,
        buffer_after: Option<Ms>,
        hours: Vec<OperatingWindow>,
    },
    ResourceDeactivated {
        id: Ulid,
    },
    ResourceReactivated {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingConfirmed {
        id: Ulid,
        resource_id: Ulid,
    },
    /// The new booking and everything it displaced, committed as one record.
    Preemption {
        booking: Booking,
        superseded: Vec<Ulid>,
    },
    BookingCancelled {
        id: Ulid,
        resource_id: Ulid,
        reason: String,
    },
    BookingCompleted {
        id: Ulid,
        resource_id: Ulid,
    },
}

impl Event {
    pub fn label(&self) -> &'static str {
        match self {
            Event::ResourceRegistered { .. } => "resource_registered",
            Event::ResourceUpdated { .. } => "resource_updated",
            Event::ResourceDeactivated { .. } => "resource_deactivated",
            Event::ResourceReactivated { .. } => "resource_reactivated",
            Event::BookingCreated { .. } => "booking_created",
            Event::BookingConfirmed { .. } => "booking_confirmed",
            Event::Preemption { .. } => "preemption",
            Event::BookingCancelled { .. } => "booking_cancelled",
            Event::BookingCompleted { .. } => "booking_completed",
        }
    }

    /// The booking this event is primarily about, if any.
    pub fn booking_id(&self) -> Option<Ulid> {
        match self {
            Event::BookingCreated { booking } | Event::Preemption { booking, .. } => Some(booking.id),
            Event::BookingConfirmed { id, .. }
            | Event::BookingCancelled { id, .. }
            | Event::BookingCompleted { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// One ledger entry, keyed by `(resource_id, seq)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub resource_id: Ulid,
    pub seq: u64,
    pub at: Ms,
    pub event: Event,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub name: Option<String>,
    pub capacity: u32,
    pub buffer_after: Option<Ms>,
    pub hours: Vec<OperatingWindow>,
    pub active: bool,
}
