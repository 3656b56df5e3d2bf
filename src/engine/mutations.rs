use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::authorize::enforce;
use super::conflict::validate_window;
use super::{Engine, EngineError};

/// Input for registering a facility.
#[derive(Debug, Clone)]
pub struct NewFacility {
    pub organization_id: OrganizationId,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub description: String,
    pub operating_hours: Vec<OperatingHour>,
}

fn check_operating_hours(hours: &[OperatingHour]) -> Result<(), EngineError> {
    let mut seen = HashSet::new();
    for h in hours {
        if h.start_hour >= h.finish_hour || h.finish_hour > HOURS_PER_DAY {
            return Err(EngineError::invalid(format!(
                "operating hours {}-{} on {} are out of range",
                h.start_hour,
                h.finish_hour,
                h.day.as_str()
            )));
        }
        if !seen.insert(h.day) {
            return Err(EngineError::invalid(format!(
                "{} is listed more than once",
                h.day.as_str()
            )));
        }
    }
    Ok(())
}

fn check_new_facility(f: &NewFacility) -> Result<(), EngineError> {
    if f.name.trim().is_empty() {
        return Err(EngineError::invalid("facility name is empty"));
    }
    if f.name.len() > MAX_NAME_LEN {
        return Err(EngineError::invalid("facility name too long"));
    }
    if f.description.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::invalid("description too long"));
    }
    if !(-90.0..=90.0).contains(&f.latitude) || !(-180.0..=180.0).contains(&f.longitude) {
        return Err(EngineError::invalid("coordinates out of range"));
    }
    check_operating_hours(&f.operating_hours)
}

impl Engine {
    /// Book `window` on a facility for an event. The new request is PENDING.
    pub async fn create_request(
        &self,
        actor: ActorId,
        event_id: EventId,
        facility_id: Ulid,
        window: Window,
    ) -> Result<FacilityRequest, EngineError> {
        let facility = self.store.get_facility(facility_id).await?;
        validate_window(&window, &facility.operating_hours, self.now())?;

        let decision = self.can_create(actor, event_id, facility_id, window).await;
        enforce("create", actor, decision)?;

        let request = self
            .store
            .insert_facility_request(event_id, facility_id, window)
            .await?;
        tracing::debug!(actor, request_id = %request.id, "facility request created");
        Ok(request)
    }

    pub async fn approve_request(&self, actor: ActorId, id: Ulid) -> Result<FacilityRequest, EngineError> {
        let request = self.store.get_facility_request(id).await?;
        let decision = self.can_approve(actor, &request).await;
        enforce("approve", actor, decision)?;
        self.transition(request, Status::Approved, None).await
    }

    pub async fn reject_request(
        &self,
        actor: ActorId,
        id: Ulid,
        reason: String,
    ) -> Result<FacilityRequest, EngineError> {
        if reason.len() > MAX_REJECT_REASON_LEN {
            return Err(EngineError::invalid("reject reason too long"));
        }
        let request = self.store.get_facility_request(id).await?;
        let decision = self.can_reject(actor, &request).await;
        enforce("reject", actor, decision)?;
        self.transition(request, Status::Rejected, Some(reason)).await
    }

    /// Guarded PENDING → `status`. Losing a race to another transition
    /// affects no row and reads as NotFound.
    pub(super) async fn transition(
        &self,
        request: FacilityRequest,
        status: Status,
        reject_reason: Option<String>,
    ) -> Result<FacilityRequest, EngineError> {
        let rows = self
            .store
            .update_status(request.id, status, reject_reason.clone())
            .await?;
        if rows != 1 {
            return Err(EngineError::NotFound("facility request"));
        }
        tracing::debug!(request_id = %request.id, status = status.as_str(), "facility request transitioned");
        Ok(FacilityRequest { status, reject_reason, ..request })
    }

    pub async fn register_facility(&self, actor: ActorId, new: NewFacility) -> Result<Facility, EngineError> {
        check_new_facility(&new)?;
        let decision = self.can_update_facility(actor, new.organization_id).await;
        enforce("register_facility", actor, decision)?;

        let facility = Facility {
            id: Ulid::new(),
            organization_id: new.organization_id,
            name: new.name,
            latitude: new.latitude,
            longitude: new.longitude,
            description: new.description,
            operating_hours: new.operating_hours.into_iter().collect(),
        };
        self.store.insert_facility(facility.clone()).await?;
        tracing::info!(actor, facility_id = %facility.id, "facility registered");
        Ok(facility)
    }

    /// Insert or replace the listed weekdays. Other weekdays stay as they are.
    pub async fn set_operating_hours(
        &self,
        actor: ActorId,
        facility_id: Ulid,
        hours: Vec<OperatingHour>,
    ) -> Result<Facility, EngineError> {
        check_operating_hours(&hours)?;
        let facility = self.store.get_facility(facility_id).await?;
        let decision = self.can_update_facility(actor, facility.organization_id).await;
        enforce("set_operating_hours", actor, decision)?;

        self.store.set_operating_hours(facility_id, hours).await?;
        self.store.get_facility(facility_id).await
    }
}
