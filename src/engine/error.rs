use thiserror::Error;
use ulid::Ulid;

use crate::model::AppointmentStatus;
use crate::registry::RegistryError;

/// Caller-facing classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    StaffBranchMismatch,
    /// Overlap or unavailability; the caller should pick another slot.
    Conflict,
    CannotCancel,
    CannotReschedule,
    DuplicateRule,
    /// The service is missing, retired, or owned by another tenant.
    ServiceNotFound,
    AccessDenied,
    /// Persistence or collaborator failure; retry later without changing the request.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::StaffBranchMismatch => "staff_branch_mismatch",
            Self::Conflict => "conflict",
            Self::CannotCancel => "cannot_cancel",
            Self::CannotReschedule => "cannot_reschedule",
            Self::DuplicateRule => "duplicate_rule",
            Self::ServiceNotFound => "service_not_found",
            Self::AccessDenied => "access_denied",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("service duration must be positive, got {0} minutes")]
    InvalidDuration(i64),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Ulid },
    #[error("service not found: {0}")]
    ServiceNotFound(Ulid),
    #[error("access denied to {entity}: {id}")]
    AccessDenied { entity: &'static str, id: Ulid },
    #[error("staff {staff_id} does not belong to branch {branch_id}")]
    StaffBranchMismatch { staff_id: Ulid, branch_id: Ulid },
    #[error("staff {0} is unavailable at the requested time")]
    StaffUnavailable(Ulid),
    #[error("conflict with existing allocation: {0}")]
    Conflict(Ulid),
    #[error("cannot cancel appointment in status {0}")]
    CannotCancel(AppointmentStatus),
    #[error("cannot reschedule appointment in status {0}")]
    CannotReschedule(AppointmentStatus),
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    #[error("duplicate rule: {0}")]
    DuplicateRule(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("WAL error: {0}")]
    Wal(String),
}

impl EngineError {
    pub(crate) fn not_found(entity: &'static str, id: Ulid) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_)
            | Self::InvalidDuration(_)
            | Self::InvalidTransition { .. }
            | Self::LimitExceeded(_) => ErrorKind::InvalidInput,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ServiceNotFound(_) => ErrorKind::ServiceNotFound,
            Self::AccessDenied { .. } => ErrorKind::AccessDenied,
            Self::StaffBranchMismatch { .. } => ErrorKind::StaffBranchMismatch,
            Self::StaffUnavailable(_) | Self::Conflict(_) => ErrorKind::Conflict,
            Self::CannotCancel(_) => ErrorKind::CannotCancel,
            Self::CannotReschedule(_) => ErrorKind::CannotReschedule,
            Self::DuplicateRule(_) => ErrorKind::DuplicateRule,
            Self::Registry(_) | Self::Wal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }
}
