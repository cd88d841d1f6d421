use ulid::Ulid;

use crate::model::{BookingStatus, Span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Unknown or inactive resource.
    InvalidResource(Ulid, &'static str),
    InvalidResourceSpec(&'static str),
    OutsideOperatingHours(Span),
    InvalidInterval(&'static str),
    /// Capacity is held by bookings the request may not displace.
    Conflict {
        conflicting: Vec<Ulid>,
        /// Waitlist entry created for the rejected request, if it asked for one.
        waitlisted: Option<Ulid>,
    },
    /// The resource's lock could not be taken in time. Nothing was changed.
    Busy(Ulid),
    NotFound(Ulid),
    InvalidState {
        id: Ulid,
        status: BookingStatus,
    },
    HoldExpired(Ulid),
    AlreadyExists(Ulid),
    IntervalConflict(Ulid),
    /// The caller withdrew before the resource's lock was acquired.
    Withdrawn,
    LimitExceeded(&'static str),
    LedgerError(String),
}

impl EngineError {
    /// Only lock contention is worth retrying; everything else will fail the
    /// same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Busy(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidResource(id, why) => write!(f, "invalid resource {id}: {why}"),
            EngineError::InvalidResourceSpec(msg) => write!(f, "invalid resource definition: {msg}"),
            EngineError::OutsideOperatingHours(span) => {
                write!(f, "interval {span} is outside the resource's operating hours")
            }
            EngineError::InvalidInterval(msg) => write!(f, "invalid interval: {msg}"),
            EngineError::Conflict {
                conflicting,
                waitlisted,
            } => {
                let ids: Vec<String> = conflicting.iter().map(Ulid::to_string).collect();
                write!(f, "conflict with bookings: {}", ids.join(", "))?;
                if let Some(entry) = waitlisted {
                    write!(f, " (waitlisted as {entry})")?;
                }
                Ok(())
            }
            EngineError::Busy(id) => write!(f, "resource {id} is busy, try again"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::InvalidState { id, status } => {
                write!(f, "booking {id} is {status}")
            }
            EngineError::HoldExpired(id) => write!(f, "hold {id} has expired"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::IntervalConflict(id) => write!(f, "interval collides with booking {id}"),
            EngineError::Withdrawn => write!(f, "request withdrawn before it was applied"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::LedgerError(e) => write!(f, "ledger error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
