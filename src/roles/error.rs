use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::{DatabaseError, RequestStatus};
use crate::platform::PlatformError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Permission,
    Conflict,
    /// Retryable platform or connection failures. Logged, never shown to users.
    Transient,
    Internal,
}

#[derive(Debug, Error)]
pub enum RoleError {
    #[error("{0}")]
    Validation(String),
    #[error("that role does not exist in this server")]
    RoleNotFound,
    #[error("the role for this request no longer exists")]
    RoleGone,
    #[error("you already have this role")]
    AlreadyHasRole,
    #[error("you can request another role <t:{}:R>", .next_allowed.timestamp())]
    OnCooldown { next_allowed: DateTime<Utc> },
    #[error("you already have a pending request for this role")]
    DuplicatePending,
    #[error("no pending request matches that id")]
    RequestNotFound,
    #[error("{matches} pending requests match that id, use a longer id")]
    AmbiguousRequestId { matches: usize },
    #[error("this request has already been {status}")]
    AlreadyResolved { status: RequestStatus },
    #[error("this request has expired")]
    RequestExpired,
    #[error("{0}")]
    PermissionDenied(String),
    #[error("that member is not in this server")]
    MemberNotFound,
    #[error("that role already belongs to the {tier} tier")]
    RoleInAnotherTier { tier: String },
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl RoleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoleError::Validation(_) | RoleError::AlreadyHasRole => ErrorKind::Validation,
            RoleError::RoleNotFound
            | RoleError::RoleGone
            | RoleError::RequestNotFound
            | RoleError::MemberNotFound => ErrorKind::NotFound,
            RoleError::PermissionDenied(_) => ErrorKind::Permission,
            RoleError::OnCooldown { .. }
            | RoleError::DuplicatePending
            | RoleError::AmbiguousRequestId { .. }
            | RoleError::AlreadyResolved { .. }
            | RoleError::RequestExpired
            | RoleError::RoleInAnotherTier { .. } => ErrorKind::Conflict,
            RoleError::Platform(PlatformError::Request(_))
            | RoleError::Database(DatabaseError::Connection(_)) => ErrorKind::Transient,
            RoleError::Platform(_) | RoleError::Database(_) => ErrorKind::Internal,
        }
    }

    /// Whether the message is safe and useful to show the invoking user.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Transient | ErrorKind::Internal)
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        RoleError::Validation(message.into())
    }
}
