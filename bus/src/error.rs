//! Error type shared by every bus operation.

use std::{io, path::PathBuf};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The deadline of a timed operation passed before it completed
    #[error("deadline elapsed")]
    TimedOut,

    /// A non-blocking operation would have had to wait
    #[error("operation would block")]
    WouldBlock,

    /// A signal arrived while waiting and the session does not retry
    #[error("interrupted by signal")]
    Interrupted,

    /// The semaphore array or the segment no longer exists
    #[error("bus has been removed")]
    Removed,

    #[error("malformed bus {}: {reason}", .path.display())]
    MalformedHandle { path: PathBuf, reason: String },

    #[error("bus {} already exists", .0.display())]
    Exists(PathBuf),

    #[error("message of {len} bytes does not fit in {capacity} bytes")]
    MessageTooLong { len: usize, capacity: usize },

    #[error("message contains a NUL byte")]
    InteriorNul,

    #[error("bus was opened read-only")]
    ReadOnly,

    #[error("shared memory holds no terminated message")]
    Unterminated,

    #[error("callback failed")]
    Callback(#[source] anyhow::Error),

    #[error("{op}: {source}")]
    Os {
        op: &'static str,
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn os(op: &'static str, source: impl Into<io::Error>) -> Self {
        let source = source.into();
        match source.raw_os_error() {
            Some(libc::EIDRM) => Self::Removed,
            _ => Self::Os { op, source },
        }
    }

    pub(crate) fn last_os(op: &'static str) -> Self {
        Self::os(op, io::Error::last_os_error())
    }

    /// The errno this error corresponds to, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::TimedOut | Self::WouldBlock => Some(libc::EAGAIN),
            Self::Interrupted => Some(libc::EINTR),
            Self::Removed => Some(libc::EIDRM),
            Self::Exists(_) => Some(libc::EEXIST),
            Self::MessageTooLong { .. } => Some(libc::EMSGSIZE),
            Self::Os { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
