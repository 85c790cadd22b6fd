//! Error taxonomy of the node agent.
//!
//! Every layer has its own `thiserror` enum; they all funnel into
//! [`NodeError`], which is the only type converted into a gRPC `Status`.

use thiserror::Error;
use tonic::{Code, Status};

use crate::connector::StoreError;
use crate::filesystem::FsError;
use crate::host::HostError;
use crate::mount::MountError;
use crate::session::SessionError;

#[derive(Error, Debug)]
pub enum NodeError {
    /// Missing or malformed request field. The caller must fix the request.
    #[error("{0}")]
    InvalidArgument(String),

    /// Storage portals could not be reached. Safe to retry.
    #[error("{0}")]
    Unavailable(String),

    /// Filesystem consistency check failed. Needs an operator.
    #[error("Filesystem seems to be corrupted: {0}")]
    DataLoss(String),

    /// Host configuration or kernel modules are missing.
    #[error("{0}")]
    FailedPrecondition(String),

    /// Unexpected tool failure, carries the tool's diagnostic output.
    #[error("{0}")]
    Internal(String),

    #[error("{0} is unimplemented and should not be called")]
    Unimplemented(&'static str),

    /// The admission gate is exhausted.
    #[error("node busy: too many concurrent volume publications, try again later")]
    Busy,
}

impl NodeError {
    pub fn code(&self) -> Code {
        match self {
            NodeError::InvalidArgument(_) => Code::InvalidArgument,
            NodeError::Unavailable(_) => Code::Unavailable,
            NodeError::DataLoss(_) => Code::DataLoss,
            NodeError::FailedPrecondition(_) => Code::FailedPrecondition,
            NodeError::Internal(_) => Code::Internal,
            NodeError::Unimplemented(_) => Code::Unimplemented,
            NodeError::Busy => Code::Aborted,
        }
    }

    /// Short label used as the metrics status.
    pub fn label(&self) -> &'static str {
        match self {
            NodeError::InvalidArgument(_) => "invalid_argument",
            NodeError::Unavailable(_) => "unavailable",
            NodeError::DataLoss(_) => "data_loss",
            NodeError::FailedPrecondition(_) => "failed_precondition",
            NodeError::Internal(_) => "internal",
            NodeError::Unimplemented(_) => "unimplemented",
            NodeError::Busy => "busy",
        }
    }
}

impl From<NodeError> for Status {
    fn from(err: NodeError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        NodeError::Internal(err.to_string())
    }
}

impl From<SessionError> for NodeError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Connect { .. } => NodeError::Unavailable(err.to_string()),
            _ => NodeError::Internal(err.to_string()),
        }
    }
}

impl From<FsError> for NodeError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::Corrupted { .. } => NodeError::DataLoss(err.to_string()),
            _ => NodeError::Internal(err.to_string()),
        }
    }
}

impl From<MountError> for NodeError {
    fn from(err: MountError) -> Self {
        NodeError::Internal(err.to_string())
    }
}

impl From<HostError> for NodeError {
    fn from(err: HostError) -> Self {
        NodeError::FailedPrecondition(err.to_string())
    }
}
