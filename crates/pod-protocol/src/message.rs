//! Record types for the pod control protocol
//!
//! Three kinds of record travel over the connection, all UTF-8 JSON objects:
//!
//! - [`Request`]: `{"method": ..., "args": [...], "id": n}`. Sent by the
//!   client. The `id` is omitted entirely for fire-and-forget requests
//!   (the `open` handshake).
//! - [`Response`]: `{"id": n, "body": ..., "err": ...}`. Sent by the server,
//!   exactly one per identified request, in any order relative to other
//!   responses.
//! - [`Event`]: `{"name": ..., "body": ...}`. Sent by the server at any
//!   time, never carries an `id`.
//!
//! Inbound records are classified by the presence of the `id` field, see
//! [`Inbound`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ProtocolError;

/// Method names understood by the pod server.
pub mod method {
    /// Handshake, fire-and-forget. Must be the first record on the wire.
    pub const OPEN: &str = "open";
    /// Returns the current pod snapshot list.
    pub const LIST_PODS: &str = "listPods";
    /// `[name]` -> new pod id.
    pub const CREATE_POD: &str = "createPod";
    /// `[name]` -> empty body.
    pub const STOP_POD: &str = "stopPod";
    /// `[name]` -> empty body.
    pub const REMOVE_POD: &str = "removePod";
    /// `[name]` -> empty body.
    pub const RESTART_POD: &str = "restartPod";
    /// `[name]` -> attached pod id. Re-targets the output event stream.
    pub const ATTACH_TO_POD: &str = "attachToPod";
    /// `[base64 bytes]` -> empty body. Forwards input to the attached pod.
    pub const SEND_TO_POD: &str = "sendToPod";
    /// `[podId, dstPath, base64 bytes]` -> empty body.
    pub const UPLOAD_TO_POD: &str = "uploadToPod";
}

/// Event names emitted by the pod server.
pub mod event {
    /// Output chunk from an attached pod, body is [`PodOutput`](super::PodOutput).
    pub const POD_OUT: &str = "podOut";
}

/// Correlation identifier tying a request to its eventual response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Create a new request ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A method call sent by the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Method name, see [`method`]
    pub method: String,
    /// Positional arguments, opaque at this layer
    #[serde(default)]
    pub args: Vec<Value>,
    /// Correlation id; absent for fire-and-forget requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl Request {
    /// Create an identified request that expects a response
    pub fn new(method: impl Into<String>, args: Vec<Value>, id: RequestId) -> Self {
        Self {
            method: method.into(),
            args,
            id: Some(id),
        }
    }

    /// Create a fire-and-forget request (no id, no response will arrive)
    pub fn fire_and_forget(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
            id: None,
        }
    }
}

/// A reply to an identified request
///
/// The server fills `err` with its zero value (an empty string) on success,
/// so presence of the field alone does not indicate failure. Use
/// [`Response::remote_error`] to classify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id of the request this answers
    pub id: RequestId,
    /// Error payload, if the call failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<Value>,
    /// Method-specific result, if the call succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Response {
    /// The error payload, if this response indicates failure.
    ///
    /// `null` and `""` both count as success (the latter is the Go server's
    /// zero value for an absent error).
    pub fn remote_error(&self) -> Option<&Value> {
        match &self.err {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(v) => Some(v),
        }
    }
}

/// An unsolicited notification from the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event name, see [`event`]
    pub name: String,
    /// Event payload
    #[serde(default)]
    pub body: Value,
}

/// An inbound record, classified by the presence of the `id` field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    /// A reply to an in-flight request
    Response(Response),
    /// An unsolicited event
    Event(Event),
}

/// A pod as reported by `listPods`
///
/// Read-only projection of server state; the client holds no independent
/// source of truth and always reflects the last reported snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PodRepr")]
pub struct Pod {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
    pub status: String,
}

/// Accepts both observed `listPods` row shapes: a bare container id string
/// (older servers) or the full object.
#[derive(Deserialize)]
#[serde(untagged)]
enum PodRepr {
    Id(String),
    Full {
        #[serde(default)]
        id: String,
        #[serde(default)]
        names: Vec<String>,
        #[serde(default)]
        image: String,
        #[serde(default)]
        state: String,
        #[serde(default)]
        status: String,
    },
}

impl From<PodRepr> for Pod {
    fn from(repr: PodRepr) -> Self {
        match repr {
            PodRepr::Id(id) => Pod {
                id,
                ..Pod::default()
            },
            PodRepr::Full {
                id,
                names,
                image,
                state,
                status,
            } => Pod {
                id,
                names,
                image,
                state,
                status,
            },
        }
    }
}

/// Body of a `listPods` response
///
/// The server marshals an empty list as `"pods": null`, so the field
/// tolerates both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodListBody {
    #[serde(default, deserialize_with = "nullable_pods")]
    pub pods: Vec<Pod>,
}

fn nullable_pods<'de, D>(deserializer: D) -> Result<Vec<Pod>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let pods: Option<Vec<Pod>> = Option::deserialize(deserializer)?;
    Ok(pods.unwrap_or_default())
}

/// Body of a `createPod` / `attachToPod` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodIdBody {
    #[serde(rename = "podId")]
    pub pod_id: String,
}

/// Body of a `podOut` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodOutput {
    /// Pod the chunk belongs to; older servers omit it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Base64-encoded output bytes
    pub data: String,
}

impl PodOutput {
    /// Decode the base64 payload into raw output bytes
    pub fn decode_data(&self) -> Result<Vec<u8>, ProtocolError> {
        use base64::Engine;
        Ok(base64::engine::general_purpose::STANDARD.decode(&self.data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_and_forget_omits_id() {
        let req = Request::fire_and_forget(method::OPEN, vec![]);
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"method":"open","args":[]}"#);
    }

    #[test]
    fn test_identified_request_shape() {
        let req = Request::new(method::CREATE_POD, vec!["bob".into()], RequestId::new(3));
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"method":"createPod","args":["bob"],"id":3}"#);
    }

    #[test]
    fn test_inbound_classification() {
        let inbound: Inbound = serde_json::from_str(r#"{"id":7,"err":"","body":null}"#).unwrap();
        assert!(matches!(inbound, Inbound::Response(ref r) if r.id == RequestId::new(7)));

        let inbound: Inbound =
            serde_json::from_str(r#"{"name":"podOut","body":{"data":"aGk="}}"#).unwrap();
        assert!(matches!(inbound, Inbound::Event(ref e) if e.name == event::POD_OUT));
    }

    #[test]
    fn test_empty_err_is_success() {
        let res: Response = serde_json::from_str(r#"{"id":1,"err":"","body":null}"#).unwrap();
        assert!(res.remote_error().is_none());

        let res: Response = serde_json::from_str(r#"{"id":1,"err":null}"#).unwrap();
        assert!(res.remote_error().is_none());

        let res: Response =
            serde_json::from_str(r#"{"id":1,"err":{"message":"not found"}}"#).unwrap();
        assert_eq!(
            res.remote_error().unwrap()["message"],
            Value::from("not found")
        );
    }

    #[test]
    fn test_pod_row_shapes() {
        let pod: Pod = serde_json::from_str(r#""abc123""#).unwrap();
        assert_eq!(pod.id, "abc123");
        assert!(pod.names.is_empty());

        let pod: Pod = serde_json::from_str(
            r#"{"id":"abc123","names":["/bob"],"image":"alpine","state":"running","status":"Up 2 minutes"}"#,
        )
        .unwrap();
        assert_eq!(pod.names, vec!["/bob"]);
        assert_eq!(pod.state, "running");
    }

    #[test]
    fn test_pod_list_body_tolerates_null() {
        let body: PodListBody = serde_json::from_str(r#"{"pods":null}"#).unwrap();
        assert!(body.pods.is_empty());

        let body: PodListBody = serde_json::from_str("{}").unwrap();
        assert!(body.pods.is_empty());
    }

    #[test]
    fn test_pod_output_decode() {
        let out: PodOutput =
            serde_json::from_str(r#"{"id":"abc123","data":"aGk="}"#).unwrap();
        assert_eq!(out.decode_data().unwrap(), b"hi");

        let out: PodOutput = serde_json::from_str(r#"{"data":"dGhlcmU="}"#).unwrap();
        assert!(out.id.is_none());
        assert_eq!(out.decode_data().unwrap(), b"there");
    }
}
