use std::io;

use thiserror::Error;

/// Abstract failure class of a replica operation, independent of transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VioErrorKind {
    NoMemory,
    NoSpace,
    QuotaExceeded,
    AlreadyExists,
    NotFound,
    InvalidArgument,
    NotEmpty,
    Io,
    UserAbort,
    General,
}

impl VioErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VioErrorKind::NoMemory => "no memory",
            VioErrorKind::NoSpace => "no space left",
            VioErrorKind::QuotaExceeded => "quota exceeded",
            VioErrorKind::AlreadyExists => "already exists",
            VioErrorKind::NotFound => "not found",
            VioErrorKind::InvalidArgument => "invalid argument",
            VioErrorKind::NotEmpty => "directory not empty",
            VioErrorKind::Io => "i/o error",
            VioErrorKind::UserAbort => "aborted by user",
            VioErrorKind::General => "general error",
        }
    }
}

/// Failure value of a replica operation: an abstract kind plus the
/// transport-specific message.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct VioError {
    pub kind: VioErrorKind,
    pub message: String,
}

impl VioError {
    pub fn new(kind: VioErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn aborted() -> Self {
        Self::new(VioErrorKind::UserAbort, "transfer aborted by user")
    }

    pub fn from_io(err: &io::Error) -> Self {
        let kind = match err.raw_os_error() {
            Some(libc::ENOMEM) => VioErrorKind::NoMemory,
            Some(libc::ENOSPC) => VioErrorKind::NoSpace,
            Some(libc::EDQUOT) => VioErrorKind::QuotaExceeded,
            Some(libc::EEXIST) => VioErrorKind::AlreadyExists,
            Some(libc::ENOENT) => VioErrorKind::NotFound,
            Some(libc::EINVAL) => VioErrorKind::InvalidArgument,
            Some(libc::ENOTEMPTY) => VioErrorKind::NotEmpty,
            Some(libc::EIO) => VioErrorKind::Io,
            _ => match err.kind() {
                io::ErrorKind::AlreadyExists => VioErrorKind::AlreadyExists,
                io::ErrorKind::NotFound => VioErrorKind::NotFound,
                io::ErrorKind::InvalidInput => VioErrorKind::InvalidArgument,
                _ => VioErrorKind::General,
            },
        };
        Self::new(kind, err.to_string())
    }
}

impl From<io::Error> for VioError {
    fn from(err: io::Error) -> Self {
        Self::from_io(&err)
    }
}

/// Stable status taxonomy reported to the caller of a propagation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusCode {
    #[default]
    Ok,
    MemoryError,
    OpenError,
    PropagateError,
    ParamError,
    Unsuccessful,
    Aborted,
}

/// How a classified failure affects the run as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Abort the whole propagation.
    Fatal,
    /// Record the failure, continue with the next entry.
    Soft,
    /// Silent skip, no writeback change.
    Ignore,
}

/// Map a failure kind to its status code and severity.
///
/// `NoSpace`/`QuotaExceeded` are only fatal when they surface at close time;
/// see [`close_severity`].
pub fn classify(kind: VioErrorKind) -> (StatusCode, Severity) {
    match kind {
        VioErrorKind::NoMemory => (StatusCode::MemoryError, Severity::Fatal),
        VioErrorKind::UserAbort => (StatusCode::Aborted, Severity::Fatal),
        VioErrorKind::InvalidArgument => (StatusCode::ParamError, Severity::Soft),
        _ => (StatusCode::PropagateError, Severity::Soft),
    }
}

/// Severity of a failure raised while closing a destination handle. Running
/// out of space or quota at that point means nothing further can be written.
pub fn close_severity(kind: VioErrorKind) -> Severity {
    match kind {
        VioErrorKind::NoSpace | VioErrorKind::QuotaExceeded => Severity::Fatal,
        VioErrorKind::NoMemory | VioErrorKind::UserAbort => Severity::Fatal,
        _ => Severity::Soft,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fatal_kinds() {
        assert_eq!(
            classify(VioErrorKind::NoMemory),
            (StatusCode::MemoryError, Severity::Fatal)
        );
        assert_eq!(
            classify(VioErrorKind::UserAbort),
            (StatusCode::Aborted, Severity::Fatal)
        );
    }

    #[test]
    fn space_errors_are_only_fatal_at_close() {
        let (_, severity) = classify(VioErrorKind::NoSpace);
        assert_eq!(severity, Severity::Soft);
        assert_eq!(close_severity(VioErrorKind::NoSpace), Severity::Fatal);
        assert_eq!(close_severity(VioErrorKind::QuotaExceeded), Severity::Fatal);
        assert_eq!(close_severity(VioErrorKind::Io), Severity::Soft);
    }

    #[test]
    fn maps_errno_to_kind() {
        let err = io::Error::from_raw_os_error(libc::ENOTEMPTY);
        assert_eq!(VioError::from_io(&err).kind, VioErrorKind::NotEmpty);
        let err = io::Error::from_raw_os_error(libc::EDQUOT);
        assert_eq!(VioError::from_io(&err).kind, VioErrorKind::QuotaExceeded);
    }
}
