use ulid::Ulid;

use crate::model::*;

use super::authorize::enforce;
use super::availability::{apply_requests, build_empty_grid, check_query_horizon, day_bounds};
use super::{Engine, EngineError};

impl Engine {
    pub async fn facility_info(&self, id: Ulid) -> Result<Facility, EngineError> {
        self.store.get_facility(id).await
    }

    pub async fn view_request(&self, actor: ActorId, id: Ulid) -> Result<FacilityRequest, EngineError> {
        Ok(self.view_request_with_facility(actor, id).await?.request)
    }

    /// A request together with its facility, for actors who may see it.
    pub async fn view_request_with_facility(
        &self,
        actor: ActorId,
        id: Ulid,
    ) -> Result<FacilityRequestWithFacility, EngineError> {
        let joined = self.store.facility_request_with_facility(id).await?;
        let decision = self.can_view(actor, &joined.request, &joined.facility).await;
        enforce("view", actor, decision)?;
        Ok(joined)
    }

    /// Hour-by-hour free/busy grid for every day of `range`.
    pub async fn compute_availability(
        &self,
        facility_id: Ulid,
        range: Window,
    ) -> Result<AvailabilityGrid, EngineError> {
        check_query_horizon(&range, self.now())?;

        let (facility, approved) = tokio::join!(
            self.store.get_facility(facility_id),
            self.store.list_approved_requests(facility_id, day_bounds(&range)),
        );
        let (facility, approved) = (facility?, approved?);

        let mut grid = build_empty_grid(&range, &facility.operating_hours);
        apply_requests(&mut grid, range.start, &facility.operating_hours, &approved);
        Ok(grid)
    }
}
