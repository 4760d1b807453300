//! Control channel wire format.
//!
//! Every message is one JSON object on its own line. A request carries a
//! caller-chosen id and a call tagged by method name:
//!
//! ```text
//! {"id":7,"call":{"method":"task_start","params":{"id":"n1,3","task":{"args":["/bin/sh"]}}}}
//! ```
//!
//! and the response echoes the id with either a value or a structured
//! error:
//!
//! ```text
//! {"id":7,"outcome":{"ok":"4242"}}
//! {"id":7,"outcome":{"err":{"kind":"not_found","message":"...","resource":"container","subject":"n1,3"}}}
//! ```
//!
//! Responses may arrive out of order; the id pairs them with requests.

use std::fmt;
use std::io::{self, BufRead, Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use burrow_common::constants::ATTACH_TOKEN_LEN;
use burrow_common::error::{BurrowError, RemoteError, Result};
use burrow_common::types::{CntrSpec, Taskinfo};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, unique per connection.
    pub id: u64,
    /// The operation to perform.
    pub call: Call,
}

/// Operations served by a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Call {
    /// Node identity.
    Id,
    /// Create a container.
    Create {
        /// Creation input.
        spec: CntrSpec,
    },
    /// Destroy a container.
    Delete {
        /// Container id.
        id: String,
    },
    /// List containers matching a query.
    List {
        /// Query expression.
        query: String,
    },
    /// Replace a container's tags.
    Config {
        /// Container id.
        id: String,
        /// New tag set.
        tags: Vec<String>,
    },
    /// Describe a container.
    ContainerMeta {
        /// Container id.
        id: String,
    },
    /// Start a task.
    TaskStart {
        /// Container id.
        id: String,
        /// Process to run.
        task: Taskinfo,
    },
    /// Stop one task.
    TaskStop {
        /// Container id.
        id: String,
        /// Task id.
        task: String,
        /// Kill instead of terminate.
        kill: bool,
    },
    /// Stop every task of a container.
    TaskStopAll {
        /// Container id.
        id: String,
        /// Kill instead of terminate.
        kill: bool,
    },
    /// Wait for every task of a container to finish.
    TaskWait {
        /// Container id.
        id: String,
    },
    /// List live task ids.
    TaskList {
        /// Container id.
        id: String,
    },
    /// Issue an attach token for a live task.
    AttachToken {
        /// Container id.
        id: String,
        /// Task id.
        task: String,
    },
}

impl Call {
    /// Method name as it appears on the wire.
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Create { .. } => "create",
            Self::Delete { .. } => "delete",
            Self::List { .. } => "list",
            Self::Config { .. } => "config",
            Self::ContainerMeta { .. } => "container_meta",
            Self::TaskStart { .. } => "task_start",
            Self::TaskStop { .. } => "task_stop",
            Self::TaskStopAll { .. } => "task_stop_all",
            Self::TaskWait { .. } => "task_wait",
            Self::TaskList { .. } => "task_list",
            Self::AttachToken { .. } => "attach_token",
        }
    }
}

/// A response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this answers.
    pub id: u64,
    /// Result of the call.
    pub outcome: Outcome,
}

/// Result of a call as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The call succeeded with this value.
    Ok(Value),
    /// The call failed for this reason.
    Err(RemoteError),
}

impl Outcome {
    /// Builds the outcome of a handled call.
    pub fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(e) => Self::Err(RemoteError::from(&e)),
        }
    }

    /// Decodes the value into `T`, or rebuilds the remote error.
    ///
    /// # Errors
    ///
    /// Returns the remote error, or a serialization error if the value
    /// does not have the expected shape.
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Self::Ok(value) => Ok(serde_json::from_value(value)?),
            Self::Err(remote) => Err(remote.into()),
        }
    }
}

/// Writes one frame and flushes it.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> io::Result<()> {
    let mut payload = serde_json::to_vec(message).map_err(io::Error::other)?;
    payload.push(b'\n');
    writer.write_all(&payload)?;
    writer.flush()
}

/// Reads one frame. Returns `None` on a clean end of stream.
///
/// # Errors
///
/// Returns [`io::ErrorKind::InvalidData`] for oversized or malformed
/// frames and [`io::ErrorKind::UnexpectedEof`] for a truncated one.
pub fn read_frame<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    let mut line = Vec::new();
    let limit = u64::try_from(MAX_FRAME_LEN).unwrap_or(u64::MAX) + 1;
    let n = reader.by_ref().take(limit).read_until(b'\n', &mut line)?;
    if n == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        if line.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
        }
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    serde_json::from_slice(&line)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Opaque credential exchanged for an attach session; base64 on the
/// control channel, raw bytes on the attach connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachToken(pub [u8; ATTACH_TOKEN_LEN]);

impl AttachToken {
    /// Generates a random token.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// Raw token bytes as written on the attach connection.
    pub const fn as_bytes(&self) -> &[u8; ATTACH_TOKEN_LEN] {
        &self.0
    }
}

impl fmt::Debug for AttachToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AttachToken(..)")
    }
}

impl Serialize for AttachToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for AttachToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let raw = STANDARD.decode(encoded).map_err(serde::de::Error::custom)?;
        let bytes = <[u8; ATTACH_TOKEN_LEN]>::try_from(raw.as_slice())
            .map_err(|_| serde::de::Error::invalid_length(raw.len(), &"16 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Answer to [`Call::AttachToken`]: the token and where to present it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachGrant {
    /// Credential to write as the first bytes of the attach connection.
    pub token: AttachToken,
    /// Attach listener address of the issuing node.
    pub attach_addr: String,
}

/// Maps an I/O failure on a peer connection to a transport error.
pub(crate) fn transport(addr: &str, err: impl fmt::Display) -> BurrowError {
    BurrowError::Transport {
        addr: addr.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    #[test]
    fn call_uses_method_and_params() {
        let request = Request {
            id: 3,
            call: Call::TaskStop {
                id: "n1,2".into(),
                task: "77".into(),
                kill: true,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["call"]["method"], "task_stop");
        assert_eq!(json["call"]["params"]["task"], "77");
        assert_eq!(request.call.method(), "task_stop");
    }

    #[test]
    fn unit_call_needs_no_params() {
        let request: Request = serde_json::from_str(r#"{"id":1,"call":{"method":"id"}}"#).unwrap();
        assert!(matches!(request.call, Call::Id));
    }

    #[test]
    fn error_outcome_rebuilds_typed_error() {
        let outcome = Outcome::from_result(Err(BurrowError::NotFound {
            kind: "container",
            id: "n1,9".into(),
        }));
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.starts_with(r#"{"err":"#));
        let back: Outcome = serde_json::from_str(&json).unwrap();
        let err = back.into_result::<String>().unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "container not found: n1,9");
    }

    #[test]
    fn frames_are_newline_delimited() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Call::TaskWait { id: "a,1".into() }).unwrap();
        write_frame(&mut buf, &Call::Id).unwrap();
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 2);

        let mut reader = BufReader::new(Cursor::new(buf));
        let first: Call = read_frame(&mut reader).unwrap().unwrap();
        assert!(matches!(first, Call::TaskWait { .. }));
        let second: Call = read_frame(&mut reader).unwrap().unwrap();
        assert!(matches!(second, Call::Id));
        assert!(read_frame::<_, Call>(&mut reader).unwrap().is_none());
    }

    #[test]
    fn truncated_and_garbled_frames_fail() {
        let mut reader = BufReader::new(Cursor::new(b"{\"id\":1".to_vec()));
        let err = read_frame::<_, Request>(&mut reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let mut reader = BufReader::new(Cursor::new(b"not json\n".to_vec()));
        let err = read_frame::<_, Request>(&mut reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn token_is_base64_of_sixteen_bytes() {
        let token = AttachToken([7; ATTACH_TOKEN_LEN]);
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, format!("\"{}\"", STANDARD.encode([7_u8; 16])));
        let back: AttachToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);

        let short = format!("\"{}\"", STANDARD.encode([1_u8; 4]));
        assert!(serde_json::from_str::<AttachToken>(&short).is_err());
    }

    #[test]
    fn random_tokens_differ() {
        assert_ne!(AttachToken::random(), AttachToken::random());
    }
}
