//! RPC-facing error taxonomy.
//!
//! Every backend, mount and handle failure is classified into a [`CsiError`]
//! before it leaves a service method, and `From<CsiError> for Status` is the
//! only place gRPC codes are chosen.

use thiserror::Error;
use tonic::Status;

use crate::backend::BackendError;
use crate::handle::HandleError;
use crate::mount::MountError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CsiError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    Aborted(String),

    #[error("{0}")]
    Unimplemented(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CsiError>;

impl CsiError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        CsiError::InvalidArgument(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        CsiError::NotFound(message.into())
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        CsiError::FailedPrecondition(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CsiError::Internal(message.into())
    }

    /// Label used for the `status` dimension of operation metrics.
    pub fn code_name(&self) -> &'static str {
        match self {
            CsiError::InvalidArgument(_) => "invalid_argument",
            CsiError::NotFound(_) => "not_found",
            CsiError::AlreadyExists(_) => "already_exists",
            CsiError::FailedPrecondition(_) => "failed_precondition",
            CsiError::Aborted(_) => "aborted",
            CsiError::Unimplemented(_) => "unimplemented",
            CsiError::Internal(_) => "internal",
        }
    }
}

impl From<CsiError> for Status {
    fn from(err: CsiError) -> Self {
        match err {
            CsiError::InvalidArgument(m) => Status::invalid_argument(m),
            CsiError::NotFound(m) => Status::not_found(m),
            CsiError::AlreadyExists(m) => Status::already_exists(m),
            CsiError::FailedPrecondition(m) => Status::failed_precondition(m),
            CsiError::Aborted(m) => Status::aborted(m),
            CsiError::Unimplemented(m) => Status::unimplemented(m),
            CsiError::Internal(m) => Status::internal(m),
        }
    }
}

impl From<BackendError> for CsiError {
    fn from(err: BackendError) -> Self {
        let message = err.to_string();
        match err {
            BackendError::NotFound(_) => CsiError::NotFound(message),
            BackendError::AlreadyExists(_) => CsiError::AlreadyExists(message),
            BackendError::InvalidArgument(_) => CsiError::InvalidArgument(message),
            BackendError::InvalidToken(_) => CsiError::Aborted(message),
            BackendError::Unavailable(_) => CsiError::FailedPrecondition(message),
            BackendError::Api { .. } | BackendError::Malformed(_) => CsiError::Internal(message),
        }
    }
}

impl From<MountError> for CsiError {
    fn from(err: MountError) -> Self {
        let message = err.to_string();
        match err {
            MountError::NotMounted(_) | MountError::Busy(_) => {
                CsiError::FailedPrecondition(message)
            }
            MountError::PathNotFound(_) => CsiError::NotFound(message),
            MountError::UnsupportedFsType(_) => CsiError::InvalidArgument(message),
            MountError::CommandFailed { .. } | MountError::Io(_) => CsiError::Internal(message),
        }
    }
}

impl From<HandleError> for CsiError {
    fn from(err: HandleError) -> Self {
        CsiError::InvalidArgument(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_backend_error_mapping() {
        let cases = [
            (BackendError::NotFound("export 3".into()), tonic::Code::NotFound),
            (
                BackendError::AlreadyExists("quota".into()),
                tonic::Code::AlreadyExists,
            ),
            (
                BackendError::InvalidArgument("size".into()),
                tonic::Code::InvalidArgument,
            ),
            (BackendError::InvalidToken("zz".into()), tonic::Code::Aborted),
            (
                BackendError::Unavailable("refused".into()),
                tonic::Code::FailedPrecondition,
            ),
            (
                BackendError::Api {
                    status: 500,
                    message: "boom".into(),
                },
                tonic::Code::Internal,
            ),
            (BackendError::Malformed("json".into()), tonic::Code::Internal),
        ];

        for (err, code) in cases {
            let status: Status = CsiError::from(err).into();
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn test_mount_error_mapping() {
        let err = CsiError::from(MountError::UnsupportedFsType("ntfs".into()));
        assert_eq!(err.code_name(), "invalid_argument");

        let err = CsiError::from(MountError::CommandFailed {
            command: "mount".into(),
            stderr: "access denied".into(),
        });
        assert_eq!(err.code_name(), "internal");
        assert!(err.to_string().contains("access denied"));

        let err = CsiError::from(MountError::PathNotFound(PathBuf::from("/x")));
        assert_eq!(err.code_name(), "not_found");
    }

    #[test]
    fn test_handle_error_is_invalid_argument() {
        let err = CsiError::from(HandleError::EmptyField {
            field: "volume name",
        });
        let status: Status = err.into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(status.message(), "volume name must not be empty");
    }
}
