//! Error types

use crate::core_id::CoreId;
use crate::status::Status;
use serde::{Deserialize, Serialize};

/// Coarse error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    TranslationUnsupported,
    ResourceUnavailable,
    CollaboratorFailure,
    ProtocolIntegrity,
}

/// Remote-core errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Translation of {addr:#010x} is not supported outside the tiler window")]
    TranslationUnsupported { addr: u32 },
    #[error("Shared region index {0} is already registered")]
    DuplicateIndex(u16),
    #[error("Failed to open {core}: {status}")]
    OpenFailed { core: CoreId, status: Status },
    #[error("{op} is not valid for {core} in state {state}")]
    InvalidState {
        core: CoreId,
        op: &'static str,
        state: &'static str,
    },
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("{op} failed: {status}")]
    Collaborator { op: &'static str, status: Status },
    #[error("Data integrity failure: expected id {expected}, received {received}")]
    ProtocolIntegrity { expected: u16, received: u16 },
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn collaborator(op: &'static str, status: Status) -> Self {
        Self::Collaborator { op, status }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_)
            | Error::DuplicateIndex(_)
            | Error::InvalidState { .. }
            | Error::Config(_) => ErrorKind::InvalidArgument,
            Error::TranslationUnsupported { .. } => ErrorKind::TranslationUnsupported,
            Error::OpenFailed { .. } | Error::ResourceUnavailable(_) | Error::Cancelled => {
                ErrorKind::ResourceUnavailable
            }
            Error::Collaborator { .. } => ErrorKind::CollaboratorFailure,
            Error::ProtocolIntegrity { .. } => ErrorKind::ProtocolIntegrity,
        }
    }

    /// Only a resource that does not exist yet is worth retrying; a core
    /// owned by another session or a cancelled wait is not
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::ResourceUnavailable(_))
    }

    /// Collaborator status, if this error carries one
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::OpenFailed { status, .. } | Error::Collaborator { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
