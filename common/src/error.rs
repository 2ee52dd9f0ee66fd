use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification used by the worker error boundary to decide
/// between retry, skip and abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried on the next cycle (vanished files, brief permission races).
    Transient,
    /// Disk or quota exhaustion; sleep and retry.
    Resource,
    /// Bad rule set or option; the entry is skipped.
    Config,
    /// Malformed on-disk record; the record is discarded.
    Integrity,
    /// The process cannot continue.
    Fatal,
}

#[derive(Debug, Error)]
pub enum AfdError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("configuration error in {file}: {message}")]
    Config { file: String, message: String },

    #[error("malformed {log} record: {reason}")]
    Integrity { log: &'static str, reason: String },

    #[error("failed to attach {what} at {}: {source}", path.display())]
    Attach {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, AfdError>;

impl AfdError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        AfdError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn config(file: impl Into<String>, message: impl Into<String>) -> Self {
        AfdError::Config {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn integrity(log: &'static str, reason: impl Into<String>) -> Self {
        AfdError::Integrity {
            log,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AfdError::Io { source, .. } => classify(source),
            AfdError::Config { .. } => ErrorKind::Config,
            AfdError::Integrity { .. } => ErrorKind::Integrity,
            AfdError::Attach { .. } | AfdError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            AfdError::Io { source, .. } | AfdError::Attach { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            AfdError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Maps an OS error onto the retry taxonomy.
pub fn classify(err: &io::Error) -> ErrorKind {
    match err.raw_os_error() {
        Some(libc::ENOSPC) | Some(libc::EDQUOT) => ErrorKind::Resource,
        _ => ErrorKind::Transient,
    }
}

impl From<io::Error> for AfdError {
    fn from(source: io::Error) -> Self {
        AfdError::Io {
            context: "i/o error".to_string(),
            source,
        }
    }
}

/// `anyhow`-style context for plain `io::Result`s.
pub trait IoContext<T> {
    fn io_context<C: Into<String>>(self, context: C) -> Result<T>;

    fn with_io_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| AfdError::io(context, e))
    }

    fn with_io_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|e| AfdError::io(f(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enospc_is_resource() {
        let err = AfdError::io("mkdir", io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));
    }

    #[test]
    fn test_enoent_is_transient() {
        let err: AfdError = io::Error::from_raw_os_error(libc::ENOENT).into();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_not_found());
    }

    #[test]
    fn test_attach_is_fatal() {
        let err = AfdError::Attach {
            what: "status table",
            path: PathBuf::from("/nonexistent"),
            source: io::Error::from_raw_os_error(libc::EACCES),
        };
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.to_string().contains("/nonexistent"));
    }
}
