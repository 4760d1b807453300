//! Unified error types for the Burrow workspace.
//!
//! Every crate reports failures through [`BurrowError`]. Errors that cross
//! the control channel are flattened into a [`RemoteError`] and rebuilt on
//! the client, so a caller sees the same variant whether it talks to a
//! local manager or to a proxy.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BurrowError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A caller-supplied value was rejected.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the rejected value.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A permission or capability error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// An attach handshake presented an unknown or expired token.
    #[error("invalid attach token")]
    InvalidToken,

    /// A versioned write lost an optimistic-concurrency race.
    #[error("stale write to {key}: version mismatch")]
    StaleWrite {
        /// Key whose version did not match.
        key: String,
    },

    /// A result or session limit was exceeded.
    #[error("resource exhausted: {message}")]
    ResourceExhausted {
        /// Which limit was hit.
        message: String,
    },

    /// A peer could not be reached or the connection failed mid-call.
    #[error("transport error talking to {addr}: {message}")]
    Transport {
        /// Address of the peer.
        addr: String,
        /// Description of the failure.
        message: String,
    },

    /// The container runtime failed to materialize or run something.
    #[error("runtime error: {message}")]
    Runtime {
        /// Description of the runtime failure.
        message: String,
    },

    /// An internal invariant was violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BurrowError>;

/// Stable, serializable classification of a [`BurrowError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`BurrowError::Io`].
    Io,
    /// See [`BurrowError::Config`].
    Config,
    /// See [`BurrowError::InvalidArgument`].
    InvalidArgument,
    /// See [`BurrowError::NotFound`].
    NotFound,
    /// See [`BurrowError::PermissionDenied`].
    PermissionDenied,
    /// See [`BurrowError::Serialization`].
    Serialization,
    /// See [`BurrowError::InvalidToken`].
    InvalidToken,
    /// See [`BurrowError::StaleWrite`].
    StaleWrite,
    /// See [`BurrowError::ResourceExhausted`].
    ResourceExhausted,
    /// See [`BurrowError::Transport`].
    Transport,
    /// See [`BurrowError::Runtime`].
    Runtime,
    /// See [`BurrowError::Internal`].
    Internal,
}

impl BurrowError {
    /// Returns the classification of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::Config { .. } => ErrorKind::Config,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::Serialization { .. } => ErrorKind::Serialization,
            Self::InvalidToken => ErrorKind::InvalidToken,
            Self::StaleWrite { .. } => ErrorKind::StaleWrite,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Runtime { .. } => ErrorKind::Runtime,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns `true` for errors that mean the peer was unreachable rather
    /// than that it refused the request.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Returns `true` if this is a [`BurrowError::NotFound`].
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Builds the error reported when a mutex was poisoned by a panicking
    /// holder.
    pub fn lock_poisoned(what: &str) -> Self {
        Self::Internal {
            message: format!("{what} lock poisoned"),
        }
    }

    /// Wraps an I/O error with the path (or peer) it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Wire form of a [`BurrowError`]: the structured reason attached to every
/// failed remote call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable message, as rendered on the remote side.
    pub message: String,
    /// Resource type for `not_found` errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Identifier the error concerns (missing id, stale key, peer address).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl From<&BurrowError> for RemoteError {
    fn from(err: &BurrowError) -> Self {
        let (resource, subject) = match err {
            BurrowError::NotFound { kind, id } => (Some((*kind).to_string()), Some(id.clone())),
            BurrowError::StaleWrite { key } => (None, Some(key.clone())),
            BurrowError::Transport { addr, .. } => (None, Some(addr.clone())),
            BurrowError::Io { path, .. } => (None, Some(path.display().to_string())),
            _ => (None, None),
        };
        let message = match err {
            BurrowError::Config { message }
            | BurrowError::InvalidArgument { message }
            | BurrowError::PermissionDenied { message }
            | BurrowError::ResourceExhausted { message }
            | BurrowError::Transport { message, .. }
            | BurrowError::Runtime { message }
            | BurrowError::Internal { message } => message.clone(),
            other => other.to_string(),
        };
        Self {
            kind: err.kind(),
            message,
            resource,
            subject,
        }
    }
}

impl From<RemoteError> for BurrowError {
    fn from(remote: RemoteError) -> Self {
        let RemoteError {
            kind,
            message,
            resource,
            subject,
        } = remote;
        match kind {
            ErrorKind::NotFound => Self::NotFound {
                kind: resource_kind(resource.as_deref()),
                id: subject.unwrap_or_default(),
            },
            ErrorKind::InvalidToken => Self::InvalidToken,
            ErrorKind::StaleWrite => Self::StaleWrite {
                key: subject.unwrap_or_default(),
            },
            ErrorKind::Transport => Self::Transport {
                addr: subject.unwrap_or_default(),
                message,
            },
            ErrorKind::Io => Self::Io {
                path: subject.unwrap_or_default().into(),
                source: std::io::Error::other(message),
            },
            ErrorKind::Config => Self::Config { message },
            ErrorKind::InvalidArgument => Self::InvalidArgument { message },
            ErrorKind::PermissionDenied => Self::PermissionDenied { message },
            ErrorKind::ResourceExhausted => Self::ResourceExhausted { message },
            ErrorKind::Runtime => Self::Runtime { message },
            ErrorKind::Serialization | ErrorKind::Internal => Self::Internal { message },
        }
    }
}

/// Maps a resource name received over the wire back to the static names
/// used locally.
fn resource_kind(name: Option<&str>) -> &'static str {
    match name {
        Some("container") => "container",
        Some("task") => "task",
        Some("key") => "key",
        Some("node") => "node",
        Some("token") => "token",
        _ => "resource",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_survives_the_wire() {
        let err = BurrowError::NotFound {
            kind: "task",
            id: "4242".into(),
        };
        let wire = serde_json::to_string(&RemoteError::from(&err)).unwrap();
        let back: BurrowError = serde_json::from_str::<RemoteError>(&wire).unwrap().into();
        assert_eq!(back.to_string(), err.to_string());
        assert!(back.is_not_found());
    }

    #[test]
    fn resource_exhausted_keeps_message() {
        let err = BurrowError::ResourceExhausted {
            message: "more than 64 results".into(),
        };
        let back = BurrowError::from(RemoteError::from(&err));
        assert_eq!(back.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(back.to_string(), err.to_string());
    }

    #[test]
    fn unknown_resource_names_fold_to_generic() {
        assert_eq!(resource_kind(Some("volume")), "resource");
        assert_eq!(resource_kind(None), "resource");
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::StaleWrite).unwrap();
        assert_eq!(json, "\"stale_write\"");
    }
}
