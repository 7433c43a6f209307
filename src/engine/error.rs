use ulid::Ulid;

use crate::directory::DirectoryError;
use crate::model::ResourceKind;

/// Which resource clashed, and with which existing booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictReport {
    pub kind: ResourceKind,
    pub resource_id: Ulid,
    pub booking_id: Ulid,
}

impl std::fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} is already booked by {}",
            self.kind, self.resource_id, self.booking_id
        )
    }
}

#[derive(Debug)]
pub enum EngineError {
    Validation(String),
    LimitExceeded(&'static str),
    Conflict(ConflictReport),
    NotFound(Ulid),
    StoreUnavailable(String),
}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::LimitExceeded(_) => "limit",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid booking: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Conflict(report) => write!(f, "scheduling conflict: {report}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<DirectoryError> for EngineError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::NotFound(_, id) => EngineError::NotFound(id),
            DirectoryError::Unavailable(msg) => EngineError::StoreUnavailable(msg),
        }
    }
}
