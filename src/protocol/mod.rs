//! Wire protocol: versioned JSON envelopes over a full-duplex text channel.
//!
//! Every frame is a JSON object `{ "version": 15, "kind": ..., "payload":
//! ..., "closure"?: ... }`. The closure is an opaque correlation id minted
//! per request; responses echo it, while server-initiated `data` frames
//! carry none.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::acl::Acl;

/// Protocol revision spoken by this client. Frames carrying any other
/// version are rejected as malformed.
pub const PROTOCOL_VERSION: u64 = 15;

/// Requests emitted by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum Request {
    #[serde(rename = "pub")]
    Pub {
        path: Vec<String>,
        #[serde(rename = "deletePath")]
        delete_path: bool,
        cts: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(
            rename = "assumeACL",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        assume_acl: Option<Acl>,
    },
    #[serde(rename = "sub")]
    Sub { path: Vec<String> },
    #[serde(rename = "unsub")]
    Unsub { path: Vec<String> },
    #[serde(rename = "getAcls")]
    GetAcls {},
    #[serde(rename = "advance")]
    Advance { pattern: Vec<String>, rvts: u64 },
    #[serde(rename = "fetch")]
    Fetch { vts: Vec<u64> },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Pub { .. } => "pub",
            Request::Sub { .. } => "sub",
            Request::Unsub { .. } => "unsub",
            Request::GetAcls {} => "getAcls",
            Request::Advance { .. } => "advance",
            Request::Fetch { .. } => "fetch",
        }
    }
}

/// Responses and server-initiated messages understood by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum Response {
    /// Request acknowledgement. A non-zero `code` is a server-side failure.
    #[serde(rename = "happy")]
    Happy {
        code: i64,
        #[serde(default)]
        msg: String,
    },
    /// Internal server error.
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        msg: String,
    },
    /// Unsolicited value push for a subscribed key.
    #[serde(rename = "data")]
    Data(Value),
    #[serde(rename = "advanceResponse")]
    Advance {
        #[serde(default)]
        vts: Vec<u64>,
        #[serde(default)]
        maxvts: Option<u64>,
    },
    #[serde(rename = "fetchResponse")]
    Fetch { response: Vec<Value> },
    #[serde(rename = "getAclsResponse")]
    GetAcls { acls: Vec<String> },
    /// Session establishment acknowledgement.
    #[serde(rename = "connectResponse")]
    Connect {
        uuid: String,
        uid: String,
        #[serde(default)]
        expires: Option<u64>,
    },
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Happy { .. } => "happy",
            Response::Error { .. } => "error",
            Response::Data(_) => "data",
            Response::Advance { .. } => "advanceResponse",
            Response::Fetch { .. } => "fetchResponse",
            Response::GetAcls { .. } => "getAclsResponse",
            Response::Connect { .. } => "connectResponse",
        }
    }
}

/// A versioned value observed from the server for one concrete key.
///
/// `data` is carried verbatim; [`Value::data_json`] offers a structured
/// view that is only populated when the text parses as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Value {
    pub key: String,
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub acl_id: String,
    pub creator: String,
    pub cts: u64,
    pub vts: u64,
    pub stable: bool,
}

impl Value {
    /// Whether this value is a deletion marker.
    pub fn is_tombstone(&self) -> bool {
        !self.exists
    }

    /// Structured view of `data`. `None` when the value is a tombstone or
    /// the text is not valid JSON; the raw text is never lost either way.
    pub fn data_json(&self) -> Option<serde_json::Value> {
        self.data
            .as_deref()
            .and_then(|text| serde_json::from_str(text).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unsupported protocol version {0}")]
    Version(u64),
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    version: u64,
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    closure: Option<String>,
}

const REQUEST_KINDS: &[&str] = &["pub", "sub", "unsub", "getAcls", "advance", "fetch"];
const RESPONSE_KINDS: &[&str] = &[
    "happy",
    "error",
    "data",
    "advanceResponse",
    "fetchResponse",
    "getAclsResponse",
    "connectResponse",
];

/// Serializes an outbound request under the given closure id.
pub fn encode_request(request: &Request, closure: &str) -> String {
    encode(request, Some(closure))
}

/// Serializes a server-side message, with an optional closure echo.
pub fn encode_response(response: &Response, closure: Option<&str>) -> String {
    encode(response, closure)
}

fn encode<M: Serialize>(message: &M, closure: Option<&str>) -> String {
    let mut envelope = serde_json::to_value(message).expect("message serialization is infallible");
    let object = envelope
        .as_object_mut()
        .expect("tagged messages serialize to objects");
    object.insert("version".into(), json!(PROTOCOL_VERSION));
    if let Some(closure) = closure {
        object.insert("closure".into(), json!(closure));
    }
    envelope.to_string()
}

/// Parses an inbound frame into a closure id and a typed response.
pub fn decode_response(text: &str) -> Result<(Option<String>, Response), DecodeError> {
    let (closure, kind, payload) = decode_raw(text, RESPONSE_KINDS)?;
    let response = serde_json::from_value(json!({ "kind": kind, "payload": payload }))
        .map_err(|err| DecodeError::Malformed(err.to_string()))?;
    Ok((closure, response))
}

/// Parses a frame the way a server would. Exists for protocol tests and
/// in-process test servers.
pub fn decode_request(text: &str) -> Result<(Option<String>, Request), DecodeError> {
    let (closure, kind, payload) = decode_raw(text, REQUEST_KINDS)?;
    let request = serde_json::from_value(json!({ "kind": kind, "payload": payload }))
        .map_err(|err| DecodeError::Malformed(err.to_string()))?;
    Ok((closure, request))
}

fn decode_raw(
    text: &str,
    known: &[&str],
) -> Result<(Option<String>, String, serde_json::Value), DecodeError> {
    let raw: RawEnvelope =
        serde_json::from_str(text).map_err(|err| DecodeError::Malformed(err.to_string()))?;
    if raw.version != PROTOCOL_VERSION {
        return Err(DecodeError::Version(raw.version));
    }
    if !known.contains(&raw.kind.as_str()) {
        return Err(DecodeError::UnknownKind(raw.kind));
    }
    Ok((raw.closure, raw.kind, raw.payload))
}
