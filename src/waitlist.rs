//! Requests waiting for capacity to free up.
//!
//! Held in memory only. Entries are offered in priority order, then by the
//! ticket handed out on enqueue, so equal-priority requests are first come,
//! first served.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{Ms, Priority, ResourceKind, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitTarget {
    Resource(Ulid),
    /// Any resource of this kind will do.
    Kind(ResourceKind),
}

impl WaitTarget {
    pub fn matches(&self, resource_id: Ulid, kind: ResourceKind) -> bool {
        match self {
            WaitTarget::Resource(id) => *id == resource_id,
            WaitTarget::Kind(k) => *k == kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub requester: String,
    pub target: WaitTarget,
    /// Range the booking has to fall inside.
    pub window: Span,
    /// Desired length. Equal to the window's length for a fixed interval.
    pub duration: Ms,
    pub priority: Priority,
    pub enqueued_at: Ms,
    pub ticket: u64,
    /// The preempted booking this entry stands in for.
    pub displaced: Option<Ulid>,
}

impl WaitlistEntry {
    /// Whether capacity freed over `freed` on this resource is of any use here.
    pub fn wants(&self, resource_id: Ulid, kind: ResourceKind, freed: &Span) -> bool {
        self.target.matches(resource_id, kind) && self.window.overlaps(freed)
    }

    /// Offer order: higher priority first, then earlier ticket.
    fn offer_key(&self) -> (std::cmp::Reverse<Priority>, u64) {
        (std::cmp::Reverse(self.priority), self.ticket)
    }
}

#[derive(Default)]
pub struct Waitlist {
    entries: DashMap<Ulid, WaitlistEntry>,
    next_ticket: AtomicU64,
}

impl Waitlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.entries.contains_key(id)
    }

    pub fn next_ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::Relaxed)
    }

    /// Add an entry. A zero ticket is replaced by a fresh one.
    pub fn insert(&self, mut entry: WaitlistEntry) -> Ulid {
        if entry.ticket == 0 {
            entry.ticket = self.next_ticket() + 1;
        }
        let id = entry.id;
        self.entries.insert(id, entry);
        id
    }

    pub fn remove(&self, id: &Ulid) -> Option<WaitlistEntry> {
        self.entries.remove(id).map(|(_, e)| e)
    }

    /// Take an entry out for an offer. `None` when another offer got there first.
    pub fn claim(&self, id: &Ulid) -> Option<WaitlistEntry> {
        self.remove(id)
    }

    /// Put back an entry whose offer fell through, keeping its place in line.
    pub fn restore(&self, entry: WaitlistEntry) {
        self.entries.insert(entry.id, entry);
    }

    /// Entries that could use `freed` on this resource, in offer order.
    pub fn compatible(&self, resource_id: Ulid, kind: ResourceKind, freed: &Span) -> Vec<WaitlistEntry> {
        let mut hits: Vec<WaitlistEntry> = self
            .entries
            .iter()
            .filter(|e| e.wants(resource_id, kind, freed))
            .map(|e| e.value().clone())
            .collect();
        hits.sort_by_key(WaitlistEntry::offer_key);
        hits
    }

    /// Every entry, in offer order.
    pub fn snapshot(&self) -> Vec<WaitlistEntry> {
        let mut all: Vec<WaitlistEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(WaitlistEntry::offer_key);
        all
    }
}
