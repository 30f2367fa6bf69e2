//! Client-side error surface. One enum end to end: transport failures and
//! protocol statuses funnel into it, and the FUSE layer lowers it to an errno.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("not found")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("already exists")]
    AlreadyExists,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("not supported")]
    Unsupported,

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("protocol: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Translate a non-success protocol status.
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            403 => ClientError::PermissionDenied,
            404 => ClientError::NotFound,
            409 => ClientError::AlreadyExists,
            400 => ClientError::InvalidArgument,
            405 => ClientError::Unsupported,
            other => ClientError::Status(other),
        }
    }

    /// The errno reported to the kernel for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            ClientError::NotFound => libc::ENOENT,
            ClientError::PermissionDenied => libc::EPERM,
            ClientError::AlreadyExists => libc::EEXIST,
            ClientError::InvalidArgument => libc::EINVAL,
            ClientError::Unsupported => libc::ENOSYS,
            ClientError::Status(_) | ClientError::Transport(_) | ClientError::Protocol(_) => {
                libc::EIO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_translation() {
        assert_eq!(ClientError::from_status(StatusCode::FORBIDDEN).errno(), libc::EPERM);
        assert_eq!(ClientError::from_status(StatusCode::NOT_FOUND).errno(), libc::ENOENT);
        assert_eq!(ClientError::from_status(StatusCode::CONFLICT).errno(), libc::EEXIST);
        assert_eq!(ClientError::from_status(StatusCode::BAD_REQUEST).errno(), libc::EINVAL);
        assert_eq!(
            ClientError::from_status(StatusCode::METHOD_NOT_ALLOWED).errno(),
            libc::ENOSYS
        );
        assert_eq!(
            ClientError::from_status(StatusCode::INTERNAL_SERVER_ERROR).errno(),
            libc::EIO
        );
        assert_eq!(ClientError::from_status(StatusCode::IM_A_TEAPOT).errno(), libc::EIO);
    }

    #[test]
    fn protocol_faults_are_io() {
        assert_eq!(ClientError::Protocol("bad listing".into()).errno(), libc::EIO);
    }
}
