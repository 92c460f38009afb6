//! Wire format encoding and decoding.
//!
//! Requests travel bridge -> worker as one JSON object per line:
//! ```text
//! {"id": "<uuid>", "command": "<name>", <command-specific fields>}\n
//! ```
//!
//! Responses travel worker -> bridge as a JSON object that may span several
//! lines, terminated by a sentinel:
//! ```text
//! {"id": "<uuid>", "result": {...}}__END__
//! ```
//!
//! Only the sentinel determines a message boundary.

use std::path::PathBuf;

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{BridgeError, Result};

/// Default response sentinel.
pub const DEFAULT_SENTINEL: &str = "__END__";

/// Default hard ceiling for undecoded worker output (2 MiB).
pub const DEFAULT_MAX_INBOUND_BUFFER: usize = 2 * 1024 * 1024;

/// Id used by the shutdown command. Never allocated to a caller.
pub const EXIT_REQUEST_ID: &str = "exit";

/// Command asking the worker to exit cleanly.
pub const EXIT_COMMAND: &str = "exit";

#[derive(Serialize)]
struct WireRequest<'a> {
    id: &'a str,
    command: &'a str,
    #[serde(flatten)]
    fields: &'a Map<String, Value>,
}

/// Encode a request line into `buf` (appends, terminating `\n` included).
///
/// Object params are flattened next to `id` and `command`. Any other value is
/// sent under a `params` key. A params object carrying its own `id` or
/// `command` key is rejected, since the worker could not tell them apart.
pub fn encode_request_into(
    buf: &mut BytesMut,
    id: &str,
    command: &str,
    params: &Value,
) -> Result<()> {
    let wrapped;
    let fields = match params {
        Value::Object(map) => {
            if map.contains_key("id") || map.contains_key("command") {
                return Err(BridgeError::InvalidParams(format!(
                    "params for '{}' must not contain reserved keys `id` or `command`",
                    command
                )));
            }
            map
        }
        Value::Null => {
            wrapped = Map::new();
            &wrapped
        }
        other => {
            let mut map = Map::new();
            map.insert("params".to_string(), other.clone());
            wrapped = map;
            &wrapped
        }
    };

    let request = WireRequest {
        id,
        command,
        fields,
    };

    serde_json::to_writer((&mut *buf).writer(), &request)?;
    buf.put_u8(b'\n');
    Ok(())
}

/// Encode the shutdown command.
pub fn encode_exit_request() -> BytesMut {
    let mut buf = BytesMut::with_capacity(48);
    // Null params cannot fail to encode.
    let _ = encode_request_into(&mut buf, EXIT_REQUEST_ID, EXIT_COMMAND, &Value::Null);
    buf
}

/// A decoded worker response.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Request id the worker is answering. Missing or non-string ids cannot
    /// be routed.
    pub id: Option<String>,
    /// Successful result payload.
    pub result: Option<Value>,
    /// Error payload; any truthy value marks the response as failed.
    pub error: Option<Value>,
    /// Path of a file holding the real response, when the worker could not
    /// deliver it over stdout.
    pub file_response: Option<PathBuf>,
}

impl Message {
    /// Parse one candidate frame.
    ///
    /// Only invalid JSON is an error. Valid JSON of the wrong shape (not an
    /// object, or an id that is not a string) yields a message without an
    /// id, which is dropped as unroutable.
    pub fn parse(candidate: &[u8]) -> Result<Self> {
        serde_json::from_slice::<Value>(candidate)
            .map(Self::from_value)
            .map_err(|e| BridgeError::Decode(e.to_string()))
    }

    /// Interpret an already-parsed JSON value as a response.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return Self::default();
        };
        let id = match map.remove("id") {
            Some(Value::String(id)) => Some(id),
            _ => None,
        };
        let file_response = match map.remove("file_response") {
            Some(Value::String(path)) => Some(PathBuf::from(path)),
            _ => None,
        };
        Self {
            id,
            result: map.remove("result"),
            error: map.remove("error"),
            file_response,
        }
    }

    /// Whether the real payload lives in a side file.
    pub fn is_file_fallback(&self) -> bool {
        self.file_response.is_some()
    }

    /// Convert into the outcome delivered to the caller.
    ///
    /// Falsy error values (`null`, `false`, `0`, `""`) count as no error.
    pub fn into_outcome(self) -> Result<Value> {
        match self.error {
            Some(error) if is_truthy(&error) => match error {
                Value::String(message) => Err(BridgeError::Worker(message)),
                other => Err(BridgeError::Worker(other.to_string())),
            },
            _ => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
