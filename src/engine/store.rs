use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::conflict::collides;
use super::EngineError;

/// Persistence seen by the engine. Every call is a suspension point.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_facility(&self, id: Ulid) -> Result<Facility, EngineError>;

    async fn insert_facility(&self, facility: Facility) -> Result<(), EngineError>;

    /// Insert or replace the given weekdays on a facility.
    async fn set_operating_hours(
        &self,
        facility_id: Ulid,
        hours: Vec<OperatingHour>,
    ) -> Result<(), EngineError>;

    async fn get_facility_request(&self, id: Ulid) -> Result<FacilityRequest, EngineError>;

    async fn facility_request_with_facility(
        &self,
        id: Ulid,
    ) -> Result<FacilityRequestWithFacility, EngineError>;

    /// APPROVED requests on `facility_id` whose window collides with `window`.
    async fn count_approved_overlap(&self, facility_id: Ulid, window: Window) -> Result<u64, EngineError>;

    /// New request in PENDING.
    async fn insert_facility_request(
        &self,
        event_id: EventId,
        facility_id: Ulid,
        window: Window,
    ) -> Result<FacilityRequest, EngineError>;

    /// Move a PENDING request to `status`. Returns rows affected: 0 when the
    /// request is missing or no longer PENDING.
    async fn update_status(
        &self,
        id: Ulid,
        status: Status,
        reject_reason: Option<String>,
    ) -> Result<u64, EngineError>;

    /// APPROVED requests on `facility_id` starting inside `range`.
    async fn list_approved_requests(
        &self,
        facility_id: Ulid,
        range: Window,
    ) -> Result<Vec<FacilityRequest>, EngineError>;
}

// ── In-memory tables ─────────────────────────────────────────────

pub struct FacilityState {
    pub facility: Facility,
    /// Sorted by `start`.
    pub requests: Vec<FacilityRequest>,
}

impl FacilityState {
    fn new(facility: Facility) -> Self {
        Self { facility, requests: Vec::new() }
    }

    fn insert_request(&mut self, request: FacilityRequest) {
        let pos = self.requests.partition_point(|r| r.start <= request.start);
        self.requests.insert(pos, request);
    }

    fn request_mut(&mut self, id: Ulid) -> Option<&mut FacilityRequest> {
        self.requests.iter_mut().find(|r| r.id == id)
    }

    fn approved(&self) -> impl Iterator<Item = &FacilityRequest> {
        self.requests.iter().filter(|r| r.status == Status::Approved)
    }
}

pub type SharedFacilityState = Arc<RwLock<FacilityState>>;

enum WalCommand {
    Append {
        event: Event,
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

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut pending = Some(cmd);
        let mut batch = Vec::new();
        while let Some(cmd) = pending.take() {
            match cmd {
                WalCommand::Append { event, response } => {
                    batch.push((event, response));
                    pending = rx.try_recv().ok();
                }
                other => {
                    flush_batch(&mut wal, &mut batch);
                    handle_control(&mut wal, other);
                }
            }
        }
        flush_batch(&mut wal, &mut batch);
    }
}

fn flush_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't ride along
    // with the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

fn apply_event(
    facilities: &DashMap<Ulid, SharedFacilityState>,
    request_index: &DashMap<Ulid, Ulid>,
    state: Option<&mut FacilityState>,
    event: &Event,
) {
    match (event, state) {
        (
            Event::FacilityRegistered { id, organization_id, name, latitude, longitude, description },
            _,
        ) => {
            let facility = Facility {
                id: *id,
                organization_id: *organization_id,
                name: name.clone(),
                latitude: *latitude,
                longitude: *longitude,
                description: description.clone(),
                operating_hours: OperatingHours::new(),
            };
            facilities.insert(*id, Arc::new(RwLock::new(FacilityState::new(facility))));
        }
        (Event::OperatingHoursSet { hours, .. }, Some(state)) => {
            for h in hours {
                state.facility.operating_hours.set(*h);
            }
        }
        (Event::RequestCreated { id, event_id, facility_id, start, finish }, Some(state)) => {
            state.insert_request(FacilityRequest {
                id: *id,
                event_id: *event_id,
                facility_id: *facility_id,
                status: Status::Pending,
                reject_reason: None,
                start: *start,
                finish: *finish,
            });
            request_index.insert(*id, *facility_id);
        }
        (Event::RequestStatusChanged { id, status, reject_reason }, Some(state)) => {
            if let Some(request) = state.request_mut(*id) {
                request.status = *status;
                request.reject_reason = reject_reason.clone();
            }
        }
        // Record for a facility we never saw registered: nothing to apply to.
        (_, None) => {}
    }
}

/// Facility id an event applies to, for events that mutate existing state.
fn event_facility_id(event: &Event, request_index: &DashMap<Ulid, Ulid>) -> Option<Ulid> {
    match event {
        Event::FacilityRegistered { .. } => None,
        Event::OperatingHoursSet { facility_id, .. }
        | Event::RequestCreated { facility_id, .. } => Some(*facility_id),
        Event::RequestStatusChanged { id, .. } => request_index.get(id).map(|e| *e.value()),
    }
}

/// DashMap tables made durable by the WAL. Each facility and its requests sit
/// behind one RwLock; writers hold it across the WAL append.
pub struct InMemoryStore {
    facilities: DashMap<Ulid, SharedFacilityState>,
    /// Reverse lookup: request id → facility id
    request_index: DashMap<Ulid, Ulid>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Writers share it; compaction takes it exclusively so the snapshot
    /// and the rewritten log agree.
    compaction_gate: RwLock<()>,
}

impl InMemoryStore {
    /// Replay `wal_path` and start the WAL writer task. Must be called inside
    /// a tokio runtime.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            facilities: DashMap::new(),
            request_index: DashMap::new(),
            wal_tx,
            compaction_gate: RwLock::new(()),
        };

        // Sole owner of every lock here, so try_write always succeeds. Never
        // block: this may run inside an async context.
        for event in &events {
            match event_facility_id(event, &store.request_index) {
                None => apply_event(&store.facilities, &store.request_index, None, event),
                Some(fid) => {
                    let Some(shared) = store.facility(&fid) else { continue };
                    let mut guard = shared
                        .try_write()
                        .map_err(|_| io::Error::other("replay: facility lock contended"))?;
                    apply_event(&store.facilities, &store.request_index, Some(&mut *guard), event);
                }
            }
        }
        tracing::info!(
            "store replayed {} events: {} facilities, {} requests",
            events.len(),
            store.facilities.len(),
            store.request_index.len()
        );
        Ok(store)
    }

    fn facility(&self, id: &Ulid) -> Option<SharedFacilityState> {
        self.facilities.get(id).map(|e| e.value().clone())
    }

    fn shared_facility(&self, id: Ulid) -> Result<SharedFacilityState, EngineError> {
        self.facility(&id).ok_or(EngineError::NotFound("facility"))
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("WAL writer dropped response".into()))?
            .map_err(EngineError::from)
    }

    /// WAL-append then apply, with the facility's write lock held by the caller.
    async fn persist_and_apply(&self, state: &mut FacilityState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_event(&self.facilities, &self.request_index, Some(state), event);
        Ok(())
    }

    /// Events that rebuild the current tables from nothing.
    async fn snapshot(&self) -> Vec<Event> {
        let shared: Vec<SharedFacilityState> =
            self.facilities.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for state in shared {
            let guard = state.read().await;
            let f = &guard.facility;
            events.push(Event::FacilityRegistered {
                id: f.id,
                organization_id: f.organization_id,
                name: f.name.clone(),
                latitude: f.latitude,
                longitude: f.longitude,
                description: f.description.clone(),
            });
            if !f.operating_hours.is_empty() {
                events.push(Event::OperatingHoursSet {
                    facility_id: f.id,
                    hours: f.operating_hours.iter().copied().collect(),
                });
            }
            for r in &guard.requests {
                events.push(Event::RequestCreated {
                    id: r.id,
                    event_id: r.event_id,
                    facility_id: r.facility_id,
                    start: r.start,
                    finish: r.finish,
                });
                if r.status != Status::Pending {
                    events.push(Event::RequestStatusChanged {
                        id: r.id,
                        status: r.status,
                        reject_reason: r.reject_reason.clone(),
                    });
                }
            }
        }
        events
    }

    pub async fn appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("WAL writer dropped response".into()))
    }

    /// Rewrite the WAL as a snapshot of the current tables.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let events = self.snapshot().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("WAL writer dropped response".into()))?
            .map_err(EngineError::from)
    }
}

/// Compact the WAL whenever more than `threshold` appends accumulated.
pub async fn run_compactor(store: Arc<InMemoryStore>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        match store.appends_since_compact().await {
            Ok(n) if n > threshold => match store.compact().await {
                Ok(()) => tracing::info!("compacted WAL after {n} appends"),
                Err(e) => tracing::error!("WAL compaction failed: {e:?}"),
            },
            Ok(_) => {}
            Err(e) => {
                tracing::error!("compactor stopping: {e:?}");
                return;
            }
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_facility(&self, id: Ulid) -> Result<Facility, EngineError> {
        let state = self.shared_facility(id)?;
        let guard = state.read().await;
        Ok(guard.facility.clone())
    }

    async fn insert_facility(&self, facility: Facility) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        if self.facilities.contains_key(&facility.id) {
            return Err(EngineError::AlreadyExists(format!("facility {}", facility.id)));
        }
        let registered = Event::FacilityRegistered {
            id: facility.id,
            organization_id: facility.organization_id,
            name: facility.name.clone(),
            latitude: facility.latitude,
            longitude: facility.longitude,
            description: facility.description.clone(),
        };
        self.wal_append(&registered).await?;
        apply_event(&self.facilities, &self.request_index, None, &registered);

        if !facility.operating_hours.is_empty() {
            let state = self.shared_facility(facility.id)?;
            let mut guard = state.write().await;
            let hours = Event::OperatingHoursSet {
                facility_id: facility.id,
                hours: facility.operating_hours.iter().copied().collect(),
            };
            self.persist_and_apply(&mut guard, &hours).await?;
        }
        Ok(())
    }

    async fn set_operating_hours(
        &self,
        facility_id: Ulid,
        hours: Vec<OperatingHour>,
    ) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let state = self.shared_facility(facility_id)?;
        let mut guard = state.write().await;
        let event = Event::OperatingHoursSet { facility_id, hours };
        self.persist_and_apply(&mut guard, &event).await
    }

    async fn get_facility_request(&self, id: Ulid) -> Result<FacilityRequest, EngineError> {
        Ok(self.facility_request_with_facility(id).await?.request)
    }

    async fn facility_request_with_facility(
        &self,
        id: Ulid,
    ) -> Result<FacilityRequestWithFacility, EngineError> {
        let facility_id = self
            .request_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound("facility request"))?;
        let state = self.shared_facility(facility_id)?;
        let guard = state.read().await;
        let request = guard
            .requests
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(EngineError::NotFound("facility request"))?;
        Ok(FacilityRequestWithFacility { request, facility: guard.facility.clone() })
    }

    async fn count_approved_overlap(&self, facility_id: Ulid, window: Window) -> Result<u64, EngineError> {
        let state = self.shared_facility(facility_id)?;
        let guard = state.read().await;
        Ok(guard
            .approved()
            .filter(|r| collides(&window, &r.window()))
            .count() as u64)
    }

    async fn insert_facility_request(
        &self,
        event_id: EventId,
        facility_id: Ulid,
        window: Window,
    ) -> Result<FacilityRequest, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let state = self.shared_facility(facility_id)?;
        let mut guard = state.write().await;
        let id = Ulid::new();
        let event = Event::RequestCreated {
            id,
            event_id,
            facility_id,
            start: window.start,
            finish: window.finish,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(FacilityRequest {
            id,
            event_id,
            facility_id,
            status: Status::Pending,
            reject_reason: None,
            start: window.start,
            finish: window.finish,
        })
    }

    async fn update_status(
        &self,
        id: Ulid,
        status: Status,
        reject_reason: Option<String>,
    ) -> Result<u64, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let Some(facility_id) = self.request_index.get(&id).map(|e| *e.value()) else {
            return Ok(0);
        };
        let state = self.shared_facility(facility_id)?;
        let mut guard = state.write().await;
        // WHERE id = $1 AND status = 'PENDING'
        match guard.requests.iter().find(|r| r.id == id) {
            Some(r) if r.status == Status::Pending => {}
            _ => return Ok(0),
        }
        let event = Event::RequestStatusChanged { id, status, reject_reason };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(1)
    }

    async fn list_approved_requests(
        &self,
        facility_id: Ulid,
        range: Window,
    ) -> Result<Vec<FacilityRequest>, EngineError> {
        let state = self.shared_facility(facility_id)?;
        let guard = state.read().await;
        Ok(guard
            .approved()
            .filter(|r| r.start >= range.start && r.start < range.finish)
            .cloned()
            .collect())
    }
}
