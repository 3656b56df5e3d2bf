mod authorize;
mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
pub mod store;

pub use authorize::{Decision, Denial};
pub use availability::{apply_requests, build_empty_grid};
pub use error::EngineError;
pub use mutations::NewFacility;
pub use store::{run_compactor, InMemoryStore, Store};

use std::sync::Arc;

use chrono::Utc;

use crate::directory::Directory;
use crate::model::Instant;

/// Booking operations over a store and the collaborator services.
///
/// Nothing here is shared between operations except the store; every call
/// fans its checks out onto fresh tasks.
pub struct Engine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) directory: Directory,
    clock: fn() -> Instant,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, directory: Directory) -> Self {
        Self::with_clock(store, directory, Utc::now)
    }

    /// Same as `new` with a fixed notion of "now" for the calendar rules.
    pub fn with_clock(store: Arc<dyn Store>, directory: Directory, clock: fn() -> Instant) -> Self {
        Self { store, directory, clock }
    }

    pub(crate) fn now(&self) -> Instant {
        (self.clock)()
    }
}
