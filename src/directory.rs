//! Clients for the services that own actors, organizations and events.
//!
//! The engine only sees the three traits. [`StaticDirectory`] answers from
//! in-memory tables and backs tests and single-node setups; [`RemoteDirectory`]
//! forwards each call to a collaborator gateway over TCP, one JSON document per
//! length-delimited frame.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::engine::EngineError;
use crate::limits::MAX_DIRECTORY_FRAME_LEN;
use crate::model::*;

#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn has_permission(
        &self,
        actor: ActorId,
        organization: OrganizationId,
        permission: Permission,
    ) -> Result<bool, EngineError>;
}

#[async_trait]
pub trait OrganizerService: Send + Sync {
    /// Whether `event` belongs to `organization`, as asserted on behalf of `actor`.
    async fn has_event(
        &self,
        organization: OrganizationId,
        actor: ActorId,
        event: EventId,
    ) -> Result<bool, EngineError>;
}

#[async_trait]
pub trait ParticipantService: Send + Sync {
    async fn get_event(&self, event: EventId) -> Result<EventInfo, EngineError>;
}

/// The three collaborators the engine talks to.
#[derive(Clone)]
pub struct Directory {
    pub permission: Arc<dyn PermissionService>,
    pub organizer: Arc<dyn OrganizerService>,
    pub participant: Arc<dyn ParticipantService>,
}

impl Directory {
    /// Use one value for all three roles.
    pub fn shared<T>(svc: Arc<T>) -> Self
    where
        T: PermissionService + OrganizerService + ParticipantService + 'static,
    {
        Self {
            permission: svc.clone(),
            organizer: svc.clone(),
            participant: svc,
        }
    }
}

// ── Static tables ────────────────────────────────────────────────

/// Which collaborator call a failure or delay applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Probe {
    Permission(Permission),
    Organizer,
    Participant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct Grant {
    pub actor: ActorId,
    pub organization: OrganizationId,
    pub permission: Permission,
}

/// Deterministic directory. Loadable from JSON:
///
/// ```json
/// {
///   "grants": [{"actor": 1, "organization": 10, "permission": "UPDATE_EVENT"}],
///   "events": {"100": 10},
///   "owned_events": [[10, 100]]
/// }
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StaticDirectory {
    grants: HashSet<Grant>,
    /// event id → owning organization
    events: HashMap<EventId, OrganizationId>,
    /// (organization, event) pairs the organizer service vouches for
    owned_events: HashSet<(OrganizationId, EventId)>,
    #[serde(skip)]
    failing: HashSet<Probe>,
    #[serde(skip)]
    delays: HashMap<Probe, Duration>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn grant(mut self, actor: ActorId, organization: OrganizationId, permission: Permission) -> Self {
        self.grants.insert(Grant { actor, organization, permission });
        self
    }

    /// Register an event with the participant service and vouch for its
    /// ownership with the organizer service.
    pub fn event(mut self, event: EventId, organization: OrganizationId) -> Self {
        self.events.insert(event, organization);
        self.owned_events.insert((organization, event));
        self
    }

    /// Register an event the organizer service does not vouch for.
    pub fn unowned_event(mut self, event: EventId, organization: OrganizationId) -> Self {
        self.events.insert(event, organization);
        self
    }

    /// Calls to `probe` fail as if the service were unreachable.
    pub fn failing(mut self, probe: Probe) -> Self {
        self.failing.insert(probe);
        self
    }

    /// Calls to `probe` answer after `delay`.
    pub fn delayed(mut self, probe: Probe, delay: Duration) -> Self {
        self.delays.insert(probe, delay);
        self
    }

    async fn probe(&self, probe: Probe) -> Result<(), EngineError> {
        if let Some(delay) = self.delays.get(&probe) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(&probe) {
            return Err(EngineError::Unavailable(format!("{probe:?} unreachable")));
        }
        Ok(())
    }
}

#[async_trait]
impl PermissionService for StaticDirectory {
    async fn has_permission(
        &self,
        actor: ActorId,
        organization: OrganizationId,
        permission: Permission,
    ) -> Result<bool, EngineError> {
        self.probe(Probe::Permission(permission)).await?;
        Ok(self.grants.contains(&Grant { actor, organization, permission }))
    }
}

#[async_trait]
impl OrganizerService for StaticDirectory {
    async fn has_event(
        &self,
        organization: OrganizationId,
        _actor: ActorId,
        event: EventId,
    ) -> Result<bool, EngineError> {
        self.probe(Probe::Organizer).await?;
        Ok(self.owned_events.contains(&(organization, event)))
    }
}

#[async_trait]
impl ParticipantService for StaticDirectory {
    async fn get_event(&self, event: EventId) -> Result<EventInfo, EngineError> {
        self.probe(Probe::Participant).await?;
        self.events
            .get(&event)
            .map(|&organization_id| EventInfo { id: event, organization_id })
            .ok_or(EngineError::NotFound("event"))
    }
}

// ── Remote gateway ───────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum DirectoryCall {
    HasPermission {
        actor: ActorId,
        organization: OrganizationId,
        permission: Permission,
    },
    HasEvent {
        organization: OrganizationId,
        actor: ActorId,
        event: EventId,
    },
    GetEvent {
        event: EventId,
    },
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DirectoryReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventInfo>,
    /// `"not_found"` is reported as NotFound, anything else as Unavailable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn directory_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_DIRECTORY_FRAME_LEN)
        .new_codec()
}

pub struct RemoteDirectory {
    addr: String,
}

impl RemoteDirectory {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    async fn call(&self, call: &DirectoryCall) -> Result<DirectoryReply, EngineError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| unavailable(&self.addr, e))?;
        let mut framed = Framed::new(stream, directory_codec());

        let body = serde_json::to_vec(call).map_err(|e| EngineError::Internal(e.to_string()))?;
        framed
            .send(Bytes::from(body))
            .await
            .map_err(|e| unavailable(&self.addr, e))?;

        let frame = framed
            .next()
            .await
            .ok_or_else(|| EngineError::Unavailable(format!("{}: connection closed", self.addr)))?
            .map_err(|e| unavailable(&self.addr, e))?;
        let reply: DirectoryReply = serde_json::from_slice(&frame)
            .map_err(|e| EngineError::Unavailable(format!("{}: bad reply: {e}", self.addr)))?;

        match reply.error.as_deref() {
            None => Ok(reply),
            Some("not_found") => Err(EngineError::NotFound("event")),
            Some(other) => Err(EngineError::Unavailable(format!("{}: {other}", self.addr))),
        }
    }

    async fn call_bool(&self, call: DirectoryCall) -> Result<bool, EngineError> {
        self.call(&call).await?.ok.ok_or_else(|| {
            EngineError::Unavailable(format!("{}: reply missing `ok`", self.addr))
        })
    }
}

fn unavailable(addr: &str, e: impl std::fmt::Display) -> EngineError {
    tracing::warn!("directory {addr} unreachable: {e}");
    EngineError::Unavailable(format!("{addr}: {e}"))
}

#[async_trait]
impl PermissionService for RemoteDirectory {
    async fn has_permission(
        &self,
        actor: ActorId,
        organization: OrganizationId,
        permission: Permission,
    ) -> Result<bool, EngineError> {
        self.call_bool(DirectoryCall::HasPermission { actor, organization, permission })
            .await
    }
}

#[async_trait]
impl OrganizerService for RemoteDirectory {
    async fn has_event(
        &self,
        organization: OrganizationId,
        actor: ActorId,
        event: EventId,
    ) -> Result<bool, EngineError> {
        self.call_bool(DirectoryCall::HasEvent { organization, actor, event })
            .await
    }
}

#[async_trait]
impl ParticipantService for RemoteDirectory {
    async fn get_event(&self, event: EventId) -> Result<EventInfo, EngineError> {
        self.call(&DirectoryCall::GetEvent { event })
            .await?
            .event
            .ok_or_else(|| EngineError::Unavailable(format!("{}: reply missing `event`", self.addr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Serves `dir` over the gateway protocol until the test ends.
    async fn spawn_gateway(dir: Arc<StaticDirectory>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let dir = dir.clone();
                tokio::spawn(async move {
                    let mut framed = Framed::new(socket, directory_codec());
                    let Some(Ok(frame)) = framed.next().await else { return };
                    let call: DirectoryCall = serde_json::from_slice(&frame).unwrap();
                    let reply = match call {
                        DirectoryCall::HasPermission { actor, organization, permission } => {
                            let ok = dir.has_permission(actor, organization, permission).await.unwrap();
                            DirectoryReply { ok: Some(ok), ..Default::default() }
                        }
                        DirectoryCall::HasEvent { organization, actor, event } => {
                            let ok = dir.has_event(organization, actor, event).await.unwrap();
                            DirectoryReply { ok: Some(ok), ..Default::default() }
                        }
                        DirectoryCall::GetEvent { event } => match dir.get_event(event).await {
                            Ok(info) => DirectoryReply { event: Some(info), ..Default::default() },
                            Err(_) => DirectoryReply { error: Some("not_found".into()), ..Default::default() },
                        },
                    };
                    let body = serde_json::to_vec(&reply).unwrap();
                    framed.send(Bytes::from(body)).await.unwrap();
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn static_grants() {
        let dir = StaticDirectory::new()
            .grant(1, 10, Permission::UpdateEvent)
            .event(100, 10)
            .unowned_event(200, 10);

        assert!(dir.has_permission(1, 10, Permission::UpdateEvent).await.unwrap());
        assert!(!dir.has_permission(1, 10, Permission::UpdateFacility).await.unwrap());
        assert!(!dir.has_permission(2, 10, Permission::UpdateEvent).await.unwrap());
        assert!(dir.has_event(10, 1, 100).await.unwrap());
        assert!(!dir.has_event(10, 1, 200).await.unwrap());
        assert_eq!(dir.get_event(200).await.unwrap().organization_id, 10);
        assert!(matches!(dir.get_event(999).await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn static_failure_switch() {
        let dir = StaticDirectory::new()
            .grant(1, 10, Permission::UpdateEvent)
            .failing(Probe::Permission(Permission::UpdateEvent));
        assert!(matches!(
            dir.has_permission(1, 10, Permission::UpdateEvent).await,
            Err(EngineError::Unavailable(_))
        ));
        // Other capabilities still answer.
        assert!(!dir.has_permission(1, 10, Permission::UpdateFacility).await.unwrap());
    }

    #[test]
    fn static_from_json() {
        let path = std::env::temp_dir().join("facility_test_directory.json");
        std::fs::write(
            &path,
            r#"{
                "grants": [{"actor": 1, "organization": 10, "permission": "UPDATE_FACILITY"}],
                "events": {"100": 10},
                "owned_events": [[10, 100]]
            }"#,
        )
        .unwrap();
        let dir = StaticDirectory::from_json_file(&path).unwrap();
        assert!(dir.grants.contains(&Grant { actor: 1, organization: 10, permission: Permission::UpdateFacility }));
        assert_eq!(dir.events.get(&100), Some(&10));
        assert!(dir.owned_events.contains(&(10, 100)));
    }

    #[test]
    fn call_wire_format() {
        let call = DirectoryCall::HasPermission {
            actor: 1,
            organization: 2,
            permission: Permission::UpdateEvent,
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "method": "has_permission",
                "actor": 1,
                "organization": 2,
                "permission": "UPDATE_EVENT"
            })
        );
    }

    #[tokio::test]
    async fn remote_roundtrip_through_gateway() {
        let dir = Arc::new(
            StaticDirectory::new()
                .grant(1, 10, Permission::UpdateFacility)
                .event(100, 10),
        );
        let addr = spawn_gateway(dir).await;
        let remote = RemoteDirectory::new(addr);

        assert!(remote.has_permission(1, 10, Permission::UpdateFacility).await.unwrap());
        assert!(!remote.has_permission(1, 10, Permission::UpdateEvent).await.unwrap());
        assert!(remote.has_event(10, 1, 100).await.unwrap());
        assert_eq!(
            remote.get_event(100).await.unwrap(),
            EventInfo { id: 100, organization_id: 10 }
        );
        assert!(matches!(remote.get_event(5).await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn remote_unreachable_is_unavailable() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().to_string()
        };
        let remote = RemoteDirectory::new(addr);
        assert!(matches!(
            remote.has_permission(1, 1, Permission::UpdateEvent).await,
            Err(EngineError::Unavailable(_))
        ));
    }
}
