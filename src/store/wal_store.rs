use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::warn;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::{BookingFilter, BookingStore, InsertOutcome, StoreError};

pub type SharedServiceState = Arc<RwLock<ServiceState>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One write and fsync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

/// Every sender learns exactly what reached the disk: a caller whose events
/// fail to encode is refused alone, and a failed write is rolled back before
/// the rest of the batch is refused.
fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut frames = Vec::new();
    let mut count = 0u64;
    let mut written = Vec::with_capacity(batch.len());
    for (events, tx) in batch {
        match crate::wal::encode_events(&events) {
            Ok(bytes) => {
                frames.extend_from_slice(&bytes);
                count += events.len() as u64;
                written.push(tx);
            }
            Err(e) => {
                warn!("WAL append refused: {e}");
                let _ = tx.send(Err(e));
            }
        }
    }
    if written.is_empty() {
        return;
    }

    let result = wal.append_frames(&frames, count);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for tx in written {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Apply a per-service event to its state. Caller holds the write lock.
fn apply_to_service(st: &mut ServiceState, event: &Event, entity_map: &DashMap<Ulid, ServiceId>) {
    match event {
        Event::WindowAdded { window } => {
            st.insert_window(*window);
            entity_map.insert(window.id, window.service_id);
        }
        Event::WindowRemoved { id, .. } => {
            st.remove_window(*id);
            entity_map.remove(id);
        }
        Event::BookingsConfirmed { service_id, bookings } => {
            for booking in bookings {
                if let Err(holder) = st.insert_booking(booking.clone()) {
                    warn!(
                        "booking {} at {} on service {service_id} shadows holder {holder}; skipped",
                        booking.id, booking.span.start
                    );
                    continue;
                }
                entity_map.insert(booking.id, *service_id);
            }
        }
        Event::BookingCancelled { id, .. } => {
            st.cancel_booking(*id);
        }
        // Created/Deleted are handled at the DashMap level.
        Event::ServiceCreated { .. } | Event::ServiceDeleted { .. } => {}
    }
}

/// Write-ahead-logged in-memory store. One `RwLock` per service; a booking
/// commit holds its service's write lock across re-check, WAL append and apply.
pub struct WalStore {
    services: DashMap<ServiceId, SharedServiceState>,
    /// Window/booking id → owning service.
    entity_to_service: DashMap<Ulid, ServiceId>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared; compaction holds it exclusively so no append
    /// slips between the snapshot and the file swap.
    compaction_gate: RwLock<()>,
    /// Held from the existence check through the WAL append of a new service.
    create_lock: Mutex<()>,
}

impl WalStore {
    /// Replay `wal_path` and start the writer task. Needs a Tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            services: DashMap::new(),
            entity_to_service: DashMap::new(),
            wal_tx,
            compaction_gate: RwLock::new(()),
            create_lock: Mutex::new(()),
        };

        // Sole owner of these Arcs during replay, so try_write never contends.
        // Never blocking_write here: this may run inside an async context.
        for event in &events {
            match event {
                Event::ServiceCreated { service } => {
                    let st = ServiceState::new(service.clone());
                    store.services.insert(service.id, Arc::new(RwLock::new(st)));
                }
                Event::ServiceDeleted { id } => store.drop_service(id),
                other => {
                    let Some(entry) = store.services.get(&other.service_id()) else {
                        continue;
                    };
                    let shared = entry.clone();
                    drop(entry);
                    match shared.try_write() {
                        Ok(mut guard) => apply_to_service(&mut guard, other, &store.entity_to_service),
                        Err(_) => warn!("replay: service {} locked, event skipped", other.service_id()),
                    }
                }
            }
        }

        Ok(store)
    }

    fn get(&self, id: &ServiceId) -> Option<SharedServiceState> {
        self.services.get(id).map(|e| e.value().clone())
    }

    fn drop_service(&self, id: &ServiceId) {
        if let Some((_, shared)) = self.services.remove(id) {
            if let Ok(guard) = shared.try_read() {
                for w in &guard.windows {
                    self.entity_to_service.remove(&w.id);
                }
                for b in &guard.bookings {
                    self.entity_to_service.remove(&b.id);
                }
            }
        }
    }

    async fn wal_append(&self, events: Vec<Event>) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// WAL-append then apply, under the caller's write lock.
    async fn persist_and_apply(&self, st: &mut ServiceState, event: Event) -> Result<(), StoreError> {
        self.wal_append(vec![event.clone()]).await?;
        apply_to_service(st, &event, &self.entity_to_service);
        Ok(())
    }

    async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(ServiceId, OwnedRwLockWriteGuard<ServiceState>), StoreError> {
        let service_id = self
            .entity_to_service
            .get(entity_id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(*entity_id))?;
        let shared = self.get(&service_id).ok_or(StoreError::NotFound(service_id))?;
        Ok((service_id, shared.write_owned().await))
    }

    /// Rewrite the WAL with just enough events to rebuild the current state.
    /// Cancelled bookings are kept.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.write().await;

        let mut ids: Vec<ServiceId> = self.services.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut events = Vec::new();
        for id in ids {
            let Some(shared) = self.get(&id) else { continue };
            let guard = shared.read().await;
            events.push(Event::ServiceCreated {
                service: guard.service.clone(),
            });
            events.extend(guard.windows.iter().map(|w| Event::WindowAdded { window: *w }));
            if !guard.bookings.is_empty() {
                events.push(Event::BookingsConfirmed {
                    service_id: id,
                    bookings: guard.bookings.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn validate_window(window: &AvailabilityWindow) -> Result<(), StoreError> {
    let Span { start, end } = window.span;
    if start >= end {
        return Err(StoreError::InvalidWindow(format!(
            "window {} must start before it ends",
            window.id
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(StoreError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_WINDOW_SPAN_MS {
        return Err(StoreError::LimitExceeded("window too wide"));
    }
    Ok(())
}

/// Storage-level uniqueness check: a start may be held by one booking only,
/// counting rows already stored and rows inside the same batch.
fn check_unique(st: &ServiceState, service_id: ServiceId, bookings: &[Booking]) -> Result<(), StoreError> {
    let mut seen = HashSet::new();
    let mut dupes = Vec::new();
    for b in bookings.iter().filter(|b| b.status.holds_slot()) {
        if st.is_claimed(b.span.start) || !seen.insert(b.span.start) {
            dupes.push(b.span.start);
        }
    }
    if dupes.is_empty() {
        Ok(())
    } else {
        Err(StoreError::UniqueViolation { service_id, starts: dupes })
    }
}

#[async_trait]
impl BookingStore for WalStore {
    async fn find_service(&self, id: ServiceId) -> Result<Option<Service>, StoreError> {
        let Some(shared) = self.get(&id) else {
            return Ok(None);
        };
        let guard = shared.read().await;
        Ok(Some(guard.service.clone()))
    }

    async fn list_services(&self) -> Result<Vec<Service>, StoreError> {
        let shared: Vec<SharedServiceState> = self.services.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for st in shared {
            out.push(st.read().await.service.clone());
        }
        out.sort_by_key(|s| s.id);
        Ok(out)
    }

    async fn find_windows_overlapping(
        &self,
        service_id: ServiceId,
        span: Span,
    ) -> Result<Vec<AvailabilityWindow>, StoreError> {
        let Some(shared) = self.get(&service_id) else {
            return Ok(vec![]);
        };
        let guard = shared.read().await;
        Ok(guard.windows_overlapping(&span).copied().collect())
    }

    async fn find_bookings_starting_within(
        &self,
        service_id: ServiceId,
        range: Span,
    ) -> Result<Vec<Booking>, StoreError> {
        let Some(shared) = self.get(&service_id) else {
            return Ok(vec![]);
        };
        let guard = shared.read().await;
        Ok(guard.bookings_starting_within(&range).cloned().collect())
    }

    async fn insert_bookings_if_none_exist(
        &self,
        service_id: ServiceId,
        mut bookings: Vec<Booking>,
    ) -> Result<InsertOutcome, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let shared = self.get(&service_id).ok_or(StoreError::NotFound(service_id))?;
        let mut guard = shared.write().await;
        if guard.bookings.len() + bookings.len() > MAX_BOOKINGS_PER_SERVICE {
            return Err(StoreError::LimitExceeded("too many bookings on service"));
        }
        let starts: Vec<Ms> = bookings.iter().map(|b| b.span.start).collect();
        let claimed = guard.claimed_starts(&starts);
        if !claimed.is_empty() {
            return Ok(InsertOutcome::AlreadyClaimed(claimed));
        }
        check_unique(&guard, service_id, &bookings)?;

        bookings.sort_by_key(|b| b.span.start);
        let event = Event::BookingsConfirmed {
            service_id,
            bookings: bookings.clone(),
        };
        self.persist_and_apply(&mut guard, event).await?;
        Ok(InsertOutcome::Inserted(bookings))
    }

    async fn find_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        let Some(service_id) = self.entity_to_service.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(shared) = self.get(&service_id) else {
            return Ok(None);
        };
        let guard = shared.read().await;
        Ok(guard.booking(id).cloned())
    }

    async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, StoreError> {
        let shared: Vec<SharedServiceState> = match filter.service_id {
            Some(id) => self.get(&id).into_iter().collect(),
            None => self.services.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for st in shared {
            let guard = st.read().await;
            out.extend(guard.bookings.iter().filter(|b| filter.matches(b)).cloned());
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    async fn cancel_booking(&self, id: Ulid) -> Result<Booking, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let (service_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(id).cloned().ok_or(StoreError::NotFound(id))?;
        if booking.status == BookingStatus::Cancelled {
            return Ok(booking);
        }
        self.persist_and_apply(&mut guard, Event::BookingCancelled { id, service_id })
            .await?;
        guard.booking(id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn create_service(&self, service: Service) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.read().await;
        let _creating = self.create_lock.lock().await;
        if self.services.len() >= MAX_SERVICES {
            return Err(StoreError::LimitExceeded("too many services"));
        }
        if service.name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(StoreError::LimitExceeded("service name too long"));
        }
        if self.services.contains_key(&service.id) {
            return Err(StoreError::AlreadyExists(service.id));
        }
        let id = service.id;
        self.wal_append(vec![Event::ServiceCreated {
            service: service.clone(),
        }])
        .await?;
        self.services
            .insert(id, Arc::new(RwLock::new(ServiceState::new(service))));
        Ok(())
    }

    async fn delete_service(&self, id: ServiceId) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.read().await;
        let shared = self.get(&id).ok_or(StoreError::NotFound(id))?;
        // Wait out in-flight commits on this service.
        let guard = shared.write().await;
        self.wal_append(vec![Event::ServiceDeleted { id }]).await?;
        for w in &guard.windows {
            self.entity_to_service.remove(&w.id);
        }
        for b in &guard.bookings {
            self.entity_to_service.remove(&b.id);
        }
        drop(guard);
        self.services.remove(&id);
        Ok(())
    }

    async fn add_windows(&self, windows: Vec<AvailabilityWindow>) -> Result<(), StoreError> {
        if windows.is_empty() {
            return Ok(());
        }
        if windows.len() > MAX_WINDOWS_PER_INSERT {
            return Err(StoreError::LimitExceeded("too many windows in one insert"));
        }
        for w in &windows {
            validate_window(w)?;
            if self.entity_to_service.contains_key(&w.id) {
                return Err(StoreError::AlreadyExists(w.id));
            }
        }
        let _gate = self.compaction_gate.read().await;

        // Lock every touched service in sorted order to avoid deadlocks.
        let mut by_service: BTreeMap<ServiceId, Vec<AvailabilityWindow>> = BTreeMap::new();
        for w in windows {
            by_service.entry(w.service_id).or_default().push(w);
        }
        let mut guards = Vec::with_capacity(by_service.len());
        for (service_id, batch) in &by_service {
            let shared = self.get(service_id).ok_or(StoreError::NotFound(*service_id))?;
            let guard = shared.write_owned().await;
            if guard.windows.len() + batch.len() > MAX_WINDOWS_PER_SERVICE {
                return Err(StoreError::LimitExceeded("too many windows on service"));
            }
            guards.push(guard);
        }

        let events: Vec<Event> = by_service
            .values()
            .flatten()
            .map(|w| Event::WindowAdded { window: *w })
            .collect();
        self.wal_append(events).await?;
        for (guard, batch) in guards.iter_mut().zip(by_service.values()) {
            for w in batch {
                apply_to_service(guard, &Event::WindowAdded { window: *w }, &self.entity_to_service);
            }
        }
        Ok(())
    }

    async fn remove_window(&self, id: Ulid) -> Result<ServiceId, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let (service_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.windows.iter().any(|w| w.id == id) {
            return Err(StoreError::NotFound(id));
        }
        self.persist_and_apply(&mut guard, Event::WindowRemoved { id, service_id })
            .await?;
        Ok(service_id)
    }
}
