use std::future::Future;

use tokio::sync::oneshot;

use crate::model::*;

use super::conflict::has_overlap;
use super::{Engine, EngineError};

const BOOKED: &str = "Facility is booked at that time";

/// Why an operation was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    Permission(Permission),
    AlreadyExists(String),
}

impl Denial {
    pub fn into_error(self) -> EngineError {
        match self {
            Denial::Permission(p) => EngineError::PermissionDenied(p),
            Denial::AlreadyExists(what) => EngineError::AlreadyExists(what),
        }
    }
}

/// Outcome of an authorization. A failure is the `Err` side of the
/// surrounding `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Deny(Denial),
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit)
    }

    /// `Ok(())` on admit, the denial as an error otherwise.
    pub fn into_result(self) -> Result<(), EngineError> {
        match self {
            Decision::Admit => Ok(()),
            Decision::Deny(denial) => Err(denial.into_error()),
        }
    }
}

fn denied(permission: Permission) -> Decision {
    Decision::Deny(Denial::Permission(permission))
}

type Slot<T> = oneshot::Receiver<Result<T, EngineError>>;

/// Run one check on its own task; its result comes back through the slot.
fn spawn_check<T, F>(check: F) -> Slot<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T, EngineError>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tx.send(check.await);
    });
    rx
}

fn unwrap_slot<T>(received: Result<Result<T, EngineError>, oneshot::error::RecvError>) -> Result<T, EngineError> {
    received.map_err(|_| EngineError::Internal("check task dropped its result".into()))?
}

async fn settle<T>(slot: Slot<T>) -> Result<T, EngineError> {
    unwrap_slot(slot.await)
}

/// Count and log a decision, then turn a denial into its error.
pub(crate) fn enforce(
    operation: &'static str,
    actor: ActorId,
    outcome: Result<Decision, EngineError>,
) -> Result<(), EngineError> {
    let label = match &outcome {
        Ok(Decision::Admit) => "admit",
        Ok(Decision::Deny(_)) => "deny",
        Err(_) => "fail",
    };
    metrics::counter!(
        crate::observability::DECISIONS_TOTAL,
        "operation" => operation,
        "outcome" => label
    )
    .increment(1);
    match &outcome {
        Err(e) => tracing::warn!(actor, operation, "authorization failed: {e}"),
        Ok(decision) => tracing::debug!(actor, operation, ?decision, "authorization decided"),
    }
    outcome?.into_result()
}

impl Engine {
    /// May `actor` book `window` on the facility for `event_id`?
    ///
    /// The overlap check starts first; the event is resolved meanwhile so the
    /// permission and ownership checks can target its organization.
    pub async fn can_create(
        &self,
        actor: ActorId,
        event_id: EventId,
        facility_id: ulid::Ulid,
        window: Window,
    ) -> Result<Decision, EngineError> {
        let store = self.store.clone();
        let overlap = spawn_check(async move { has_overlap(store.as_ref(), facility_id, window).await });

        let event = self.directory.participant.get_event(event_id).await?;

        let permission = self.directory.permission.clone();
        let permitted = spawn_check(async move {
            permission
                .has_permission(actor, event.organization_id, Permission::UpdateEvent)
                .await
        });
        let organizer = self.directory.organizer.clone();
        let owns = spawn_check(async move {
            organizer.has_event(event.organization_id, actor, event_id).await
        });

        let outcomes = (settle(permitted).await, settle(owns).await, settle(overlap).await);
        match outcomes {
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => Err(e),
            (Ok(permitted), Ok(owns), Ok(overlap)) => Ok(if !(permitted && owns) {
                denied(Permission::UpdateEvent)
            } else if overlap {
                Decision::Deny(Denial::AlreadyExists(BOOKED.into()))
            } else {
                Decision::Admit
            }),
        }
    }

    /// May `actor` approve `request`? Only approved-booking collisions are
    /// rechecked, not the calendar rules.
    pub async fn can_approve(
        &self,
        actor: ActorId,
        request: &FacilityRequest,
    ) -> Result<Decision, EngineError> {
        let (store, permission) = (self.store.clone(), self.directory.permission.clone());
        let facility_id = request.facility_id;
        let permitted = spawn_check(async move {
            let facility = store.get_facility(facility_id).await?;
            permission
                .has_permission(actor, facility.organization_id, Permission::UpdateFacility)
                .await
        });
        let store = self.store.clone();
        let window = request.window();
        let overlap = spawn_check(async move { has_overlap(store.as_ref(), facility_id, window).await });

        match (settle(permitted).await, settle(overlap).await) {
            (Err(e), _) | (_, Err(e)) => Err(e),
            (Ok(false), _) => Ok(denied(Permission::UpdateFacility)),
            (Ok(true), Ok(true)) => Ok(Decision::Deny(Denial::AlreadyExists(BOOKED.into()))),
            (Ok(true), Ok(false)) => Ok(Decision::Admit),
        }
    }

    /// May `actor` reject `request`? Each step waits on the previous one.
    pub async fn can_reject(
        &self,
        actor: ActorId,
        request: &FacilityRequest,
    ) -> Result<Decision, EngineError> {
        let facility = self.store.get_facility(request.facility_id).await?;
        self.can_update_facility(actor, facility.organization_id).await
    }

    /// UPDATE_FACILITY on `organization`.
    pub async fn can_update_facility(
        &self,
        actor: ActorId,
        organization: OrganizationId,
    ) -> Result<Decision, EngineError> {
        let permitted = self
            .directory
            .permission
            .has_permission(actor, organization, Permission::UpdateFacility)
            .await?;
        Ok(if permitted { Decision::Admit } else { denied(Permission::UpdateFacility) })
    }

    /// May `actor` view `request` on `facility`? Admits as soon as either the
    /// event-side or the facility-side permission comes back true.
    ///
    /// When neither admits the denial always names UPDATE_EVENT, whichever
    /// side actually said no. An error only surfaces if nothing admitted.
    pub async fn can_view(
        &self,
        actor: ActorId,
        request: &FacilityRequest,
        facility: &Facility,
    ) -> Result<Decision, EngineError> {
        let (participant, permission) =
            (self.directory.participant.clone(), self.directory.permission.clone());
        let event_id = request.event_id;
        let mut via_event = spawn_check(async move {
            let event = participant.get_event(event_id).await?;
            permission
                .has_permission(actor, event.organization_id, Permission::UpdateEvent)
                .await
        });
        let permission = self.directory.permission.clone();
        let organization = facility.organization_id;
        let mut via_facility = spawn_check(async move {
            permission
                .has_permission(actor, organization, Permission::UpdateFacility)
                .await
        });

        let (mut event_done, mut facility_done) = (false, false);
        let mut first_error = None;
        while !(event_done && facility_done) {
            let received = tokio::select! {
                r = &mut via_event, if !event_done => {
                    event_done = true;
                    r
                }
                r = &mut via_facility, if !facility_done => {
                    facility_done = true;
                    r
                }
            };
            match unwrap_slot(received) {
                Ok(true) => return Ok(Decision::Admit),
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(denied(Permission::UpdateEvent)),
        }
    }
}
