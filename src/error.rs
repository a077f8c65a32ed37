//! The error type shared across the control plane

use std::fmt;

/// The portable error taxonomy from the error handling design
///
/// This is kept separate from [`Error`] so callers can match on a small,
/// stable set of kinds without string-matching a display message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The requested endpoint/worker/spec does not exist
    NotFound,
    /// Re-deploying an endpoint that already exists
    AlreadyExists,
    /// The caller passed a malformed or inconsistent argument
    InvalidArgument,
    /// This back-end does not implement the requested capability
    Unsupported,
    /// The back-end could not be reached or returned a transient failure
    BackendUnavailable,
    /// The operation did not complete before its deadline
    Timeout,
    /// The caller is not authorized for this operation
    PermissionDenied,
    /// An unexpected, non-portable failure
    Internal,
}

impl ErrorKind {
    /// Get this kind as a stable string, useful for structured log fields
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::BackendUnavailable => "BackendUnavailable",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::Internal => "Internal",
        }
    }
}

/// An error from anywhere in the control plane
///
/// One variant per upstream error source plus a `Portable` variant for
/// errors we raise ourselves with an explicit [`ErrorKind`].
#[derive(Debug)]
pub enum Error {
    /// An error we raised ourselves with a known taxonomy kind
    Portable { kind: ErrorKind, msg: String },
    /// An error from an HTTP call to a remote provider
    Reqwest(reqwest::Error),
    /// An error from the kubernetes client
    K8s(kube::Error),
    /// An error loading or parsing configuration
    Config(config::ConfigError),
    /// An error (de)serializing JSON
    Serde(serde_json::Error),
    /// An error (de)serializing YAML
    SerdeYaml(serde_yaml::Error),
    /// An IO error
    Io(std::io::Error),
    /// An error joining a spawned tokio task
    Join(tokio::task::JoinError),
    /// An error parsing a timestamp
    ChronoParse(chrono::ParseError),
}

impl Error {
    /// Build a new portable error with an explicit kind
    pub fn new<T: Into<String>>(kind: ErrorKind, msg: T) -> Self {
        Error::Portable {
            kind,
            msg: msg.into(),
        }
    }

    /// Shorthand for [`ErrorKind::NotFound`]
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::new(ErrorKind::NotFound, msg)
    }

    /// Shorthand for [`ErrorKind::Unsupported`]
    pub fn unsupported<T: Into<String>>(msg: T) -> Self {
        Error::new(ErrorKind::Unsupported, msg)
    }

    /// Shorthand for [`ErrorKind::InvalidArgument`]
    pub fn invalid<T: Into<String>>(msg: T) -> Self {
        Error::new(ErrorKind::InvalidArgument, msg)
    }

    /// Get the taxonomy kind for this error, best-effort for wrapped errors
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Portable { kind, .. } => *kind,
            Error::Reqwest(err) if err.is_timeout() => ErrorKind::Timeout,
            Error::Reqwest(_) => ErrorKind::BackendUnavailable,
            Error::K8s(_) => ErrorKind::BackendUnavailable,
            Error::Config(_) | Error::Serde(_) | Error::SerdeYaml(_) => ErrorKind::InvalidArgument,
            Error::Io(_) | Error::Join(_) | Error::ChronoParse(_) => ErrorKind::Internal,
        }
    }

    /// Get a user-safe message for this error
    #[must_use]
    pub fn msg(&self) -> String {
        match self {
            Error::Portable { msg, .. } => msg.clone(),
            Error::Reqwest(err) => err.to_string(),
            Error::K8s(err) => err.to_string(),
            Error::Config(err) => err.to_string(),
            Error::Serde(err) => err.to_string(),
            Error::SerdeYaml(err) => err.to_string(),
            Error::Io(err) => err.to_string(),
            Error::Join(err) => err.to_string(),
            Error::ChronoParse(err) => err.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind().as_str(), self.msg())
    }
}

impl std::error::Error for Error {}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Reqwest(err)
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Error::K8s(err)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::SerdeYaml(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Join(err)
    }
}

impl From<chrono::ParseError> for Error {
    fn from(err: chrono::ParseError) -> Self {
        Error::ChronoParse(err)
    }
}
