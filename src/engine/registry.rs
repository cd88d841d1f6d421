use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::hours;
use crate::limits::*;
use crate::model::*;

use super::conflict::validate_query_span;
use super::{Engine, EngineError, compute_saturated_spans};

fn validate_spec(spec: &ResourceSpec) -> Result<(), EngineError> {
    if spec.capacity == 0 || spec.capacity > MAX_CAPACITY {
        return Err(EngineError::InvalidResourceSpec("capacity must be between 1 and 1024"));
    }
    if spec.capacity > 1 && !spec.kind.allows_shared_capacity() {
        return Err(EngineError::InvalidResourceSpec("beds and theatres hold one booking at a time"));
    }
    if let Some(name) = &spec.name
        && name.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("resource name too long"));
    }
    if spec.buffer_after.is_some_and(|b| !(0..=DAY_MS).contains(&b)) {
        return Err(EngineError::InvalidResourceSpec("buffer_after must be between 0 and 24h"));
    }
    if spec.hours.len() > MAX_OPERATING_WINDOWS {
        return Err(EngineError::LimitExceeded("too many operating windows"));
    }
    hours::validate_windows(&spec.hours).map_err(EngineError::InvalidResourceSpec)
}

/// Refuse a capacity, buffer or hours change that the active bookings would
/// no longer fit.
fn ensure_bookings_fit(
    rs: &ResourceState,
    capacity: u32,
    buffer_after: Option<Ms>,
    hours: &[OperatingWindow],
) -> Result<(), EngineError> {
    let buffer = buffer_after.unwrap_or(0);
    let claims: Vec<Span> = rs
        .index
        .entries()
        .iter()
        .map(|e| e.span.with_buffer(buffer))
        .collect();
    if !compute_saturated_spans(&claims, capacity + 1).is_empty() {
        return Err(EngineError::InvalidResourceSpec(
            "existing bookings exceed the new capacity",
        ));
    }
    if rs.index.entries().iter().any(|e| !hours::covers(hours, &e.span)) {
        return Err(EngineError::InvalidResourceSpec(
            "existing bookings fall outside the new operating hours",
        ));
    }
    Ok(())
}

impl Engine {
    pub async fn register_resource(self: &Arc<Self>, id: Ulid, spec: ResourceSpec) -> Result<(), EngineError> {
        validate_spec(&spec)?;
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let rs = Arc::new(RwLock::new(ResourceState::new(id, spec.clone())));
        // Claim the id before writing so a concurrent registration of the same
        // id sees it taken. Anyone who finds it waits on our write lock.
        let guard = rs.clone().write_owned().await;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(rs);
            }
        }

        self.run_locked(guard, move |engine, mut guard| async move {
            if let Err(e) = engine.persist_and_apply(&mut guard, Event::ResourceRegistered { id, spec }).await {
                guard.active = false;
                engine.state.remove(&id);
                return Err(e);
            }
            tracing::info!(resource = %id, kind = guard.kind.as_str(), "resource registered");
            Ok(())
        })
        .await
    }

    /// Change name, capacity, buffer or hours. The kind is fixed at registration.
    /// Refused if the active bookings would no longer fit.
    pub async fn update_resource(self: &Arc<Self>, id: Ulid, spec: ResourceSpec) -> Result<(), EngineError> {
        validate_spec(&spec)?;
        let rs = self
            .get_resource(&id)
            .ok_or(EngineError::InvalidResource(id, "unknown resource"))?;
        let guard = self.acquire_write(id, rs, None).await?;
        self.run_locked(guard, move |engine, mut guard| async move {
            if guard.kind != spec.kind {
                return Err(EngineError::InvalidResourceSpec("resource kind cannot change"));
            }
            ensure_bookings_fit(&guard, spec.capacity, spec.buffer_after, &spec.hours)?;

            let event = Event::ResourceUpdated {
                id,
                name: spec.name,
                capacity: spec.capacity,
                buffer_after: spec.buffer_after,
                hours: spec.hours,
            };
            engine.persist_and_apply(&mut guard, event).await
        })
        .await
    }

    /// Add weekly windows to a resource's hours.
    pub async fn add_operating_hours(
        self: &Arc<Self>,
        id: Ulid,
        windows: Vec<OperatingWindow>,
    ) -> Result<(), EngineError> {
        self.rewrite_hours(id, |hours| hours.extend(windows)).await
    }

    /// Drop all windows, leaving the resource always open.
    pub async fn clear_operating_hours(self: &Arc<Self>, id: Ulid) -> Result<(), EngineError> {
        self.rewrite_hours(id, |hours| hours.clear()).await
    }

    async fn rewrite_hours(
        self: &Arc<Self>,
        id: Ulid,
        edit: impl FnOnce(&mut Vec<OperatingWindow>) + Send + 'static,
    ) -> Result<(), EngineError> {
        let rs = self
            .get_resource(&id)
            .ok_or(EngineError::InvalidResource(id, "unknown resource"))?;
        let guard = self.acquire_write(id, rs, None).await?;
        self.run_locked(guard, move |engine, mut guard| async move {
            let mut hours = guard.hours.clone();
            edit(&mut hours);
            if hours.len() > MAX_OPERATING_WINDOWS {
                return Err(EngineError::LimitExceeded("too many operating windows"));
            }
            hours::validate_windows(&hours).map_err(EngineError::InvalidResourceSpec)?;
            ensure_bookings_fit(&guard, guard.capacity, guard.buffer_after, &hours)?;

            let event = Event::ResourceUpdated {
                id,
                name: guard.name.clone(),
                capacity: guard.capacity,
                buffer_after: guard.buffer_after,
                hours,
            };
            engine.persist_and_apply(&mut guard, event).await
        })
        .await
    }

    /// Stop taking new bookings. Existing bookings are untouched.
    pub async fn deactivate_resource(self: &Arc<Self>, id: Ulid) -> Result<(), EngineError> {
        self.set_active(id, false).await
    }

    pub async fn reactivate_resource(self: &Arc<Self>, id: Ulid) -> Result<(), EngineError> {
        self.set_active(id, true).await
    }

    async fn set_active(self: &Arc<Self>, id: Ulid, active: bool) -> Result<(), EngineError> {
        let rs = self
            .get_resource(&id)
            .ok_or(EngineError::InvalidResource(id, "unknown resource"))?;
        let guard = self.acquire_write(id, rs, None).await?;
        self.run_locked(guard, move |engine, mut guard| async move {
            if guard.active == active {
                return Ok(());
            }
            let event = if active {
                Event::ResourceReactivated { id }
            } else {
                Event::ResourceDeactivated { id }
            };
            engine.persist_and_apply(&mut guard, event).await?;
            tracing::info!(resource = %id, active, "resource availability changed");
            Ok(())
        })
        .await
    }

    pub async fn resource_info(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let guard = self.acquire_read(id).await?;
        Ok(guard.info())
    }

    /// All resources, ordered by id.
    pub async fn list_resources(&self) -> Result<Vec<ResourceInfo>, EngineError> {
        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.resource_info(id).await?);
        }
        Ok(out)
    }

    /// True iff every instant of `span` falls inside the resource's weekly windows.
    pub async fn is_within_operating_hours(&self, id: Ulid, span: Span) -> Result<bool, EngineError> {
        let span = validate_query_span(span.start, span.end)?;
        if span.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let guard = self.acquire_read(id).await?;
        Ok(hours::covers(&guard.hours, &span))
    }
}
