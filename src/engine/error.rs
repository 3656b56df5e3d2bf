use crate::model::Permission;

#[derive(Debug)]
pub enum EngineError {
    /// Missing facility / request / event.
    NotFound(&'static str),
    /// The actor lacks the named capability.
    PermissionDenied(Permission),
    /// The window collides with an approved booking.
    AlreadyExists(String),
    /// Malformed window or date rule violation.
    InvalidArgument(String),
    /// A collaborator service could not be reached.
    Unavailable(String),
    /// Store failure; the cause is kept for logs only.
    Internal(String),
}

impl EngineError {
    /// Stable SQLSTATE sent to wire clients, one per variant.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "P0002",
            EngineError::PermissionDenied(_) => "42501",
            EngineError::AlreadyExists(_) => "23P01",
            EngineError::InvalidArgument(_) => "22023",
            EngineError::Unavailable(_) => "08006",
            EngineError::Internal(_) => "XX000",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::PermissionDenied(_) => "permission_denied",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::Unavailable(_) => "unavailable",
            EngineError::Internal(_) => "internal",
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(what) => write!(f, "{what}: not found"),
            EngineError::PermissionDenied(p) => write!(f, "{} is denied", p.as_str()),
            EngineError::AlreadyExists(what) => write!(f, "{what}: already exists"),
            EngineError::InvalidArgument(msg) => write!(f, "input error: {msg}"),
            EngineError::Unavailable(msg) => write!(f, "service error: {msg}"),
            // The cause never leaves the process.
            EngineError::Internal(_) => write!(f, "internal store error"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Internal(e.to_string())
    }
}
