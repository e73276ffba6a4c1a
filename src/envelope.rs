//! Wire schema of a single RPC message and correlation ids.
//!
//! ```text
//! Request:  { id, jsonrpc?: "2.0", method: "query"|"mutation"|"subscription"|"subscription.stop",
//!             params?: { path, input? } }
//! Response: { id, result?: { type?: "data"|"started"|"stopped", data? },
//!             error?: { code, message, data?: { code, httpStatus?, stack?, path?, cause? } } }
//! ```
//!
//! Every message is wrapped as `{ "port-rpc": <message> }` so that it can
//! share a port with unrelated traffic.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RpcError;

/// key of the transport level envelope
pub const PROTOCOL_KEY: &str = "port-rpc";

/// Request-side method of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// read-only procedure call
    #[serde(rename = "query")]
    Query,
    /// state-changing procedure call
    #[serde(rename = "mutation")]
    Mutation,
    /// start a stream of values
    #[serde(rename = "subscription")]
    Subscription,
    /// stop a running stream, carries the id of the subscription
    #[serde(rename = "subscription.stop")]
    SubscriptionStop,
}

impl Method {
    /// wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Query => "query",
            Method::Mutation => "mutation",
            Method::Subscription => "subscription",
            Method::SubscriptionStop => "subscription.stop",
        }
    }
}

/// Target and input of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Params {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

impl Request {
    /// build a procedure invocation
    pub fn call(id: &str, method: Method, path: &str, input: Value) -> Self {
        Request {
            id: id.to_owned(),
            jsonrpc: Some("2.0".to_owned()),
            method,
            params: Some(Params {
                path: path.to_owned(),
                input: Some(input),
            }),
        }
    }

    /// build the cancellation of the subscription `id`
    pub fn stop(id: &str) -> Self {
        Request {
            id: id.to_owned(),
            jsonrpc: Some("2.0".to_owned()),
            method: Method::SubscriptionStop,
            params: None,
        }
    }
}

/// Kind of a successful response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Data,
    Started,
    Stopped,
}

/// Success payload of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ResultKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Metadata of a failure response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    #[serde(rename = "httpStatus", default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Failure payload of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorData>,
}

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

/// What a response tells the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Data(Value),
    Started,
    Stopped,
    Failed(ErrorShape),
}

impl Response {
    /// a `data` response
    pub fn data(id: &str, data: Value) -> Self {
        Response::result(id, ResultKind::Data, Some(data))
    }

    /// the `started` acknowledgement of a subscription
    pub fn started(id: &str) -> Self {
        Response::result(id, ResultKind::Started, None)
    }

    /// the `stopped` acknowledgement of a subscription
    pub fn stopped(id: &str) -> Self {
        Response::result(id, ResultKind::Stopped, None)
    }

    /// a failure response
    pub fn error(id: &str, error: ErrorShape) -> Self {
        Response {
            id: id.to_owned(),
            result: None,
            error: Some(error),
        }
    }

    fn result(id: &str, kind: ResultKind, data: Option<Value>) -> Self {
        Response {
            id: id.to_owned(),
            result: Some(ResultPayload {
                kind: Some(kind),
                data,
            }),
            error: None,
        }
    }

    /// Classify the response, an error wins over a result and a result
    /// without a type is plain data.
    pub fn into_outcome(self) -> Outcome {
        if let Some(error) = self.error {
            return Outcome::Failed(error);
        }
        match self.result {
            Some(ResultPayload {
                kind: Some(ResultKind::Started),
                ..
            }) => Outcome::Started,
            Some(ResultPayload {
                kind: Some(ResultKind::Stopped),
                ..
            }) => Outcome::Stopped,
            Some(ResultPayload { data, .. }) => Outcome::Data(data.unwrap_or(Value::Null)),
            None => Outcome::Data(Value::Null),
        }
    }
}

/// Put a message into the transport level envelope.
pub fn wrap<T: Serialize>(msg: &T) -> Result<Value, RpcError> {
    let mut map = serde_json::Map::with_capacity(1);
    map.insert(PROTOCOL_KEY.to_owned(), serde_json::to_value(msg)?);
    Ok(Value::Object(map))
}

/// Take a message out of the transport level envelope.
///
/// Returns `None` for unrelated traffic.
pub fn unwrap(value: Value) -> Option<Value> {
    match value {
        Value::Object(mut map) => map.remove(PROTOCOL_KEY),
        _ => None,
    }
}

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate a correlation id.
///
/// `<millis>-<sequence>-<random>` in hex, unique within one process and
/// unlikely to collide across processes sharing a host.
pub fn next_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{millis:x}-{seq:x}-{:08x}", rand::random::<u32>())
}
