use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FsError;
use crate::transport::Payload;

/// Binary responses carry an 8-byte header: 4 reserved bytes, then the
/// request id as a big-endian u32, then the raw payload.
pub const BINARY_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsOp {
    Stat,
    Files,
    Read,
    Write,
    Remove,
}

/// One filesystem request as it appears on the wire. Bulk data travels in
/// `b` as base64 so the message stays valid channel text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsRequest {
    pub op: FsOp,
    pub path: String,
    pub rid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ListOptions>,
}

/// Listing options pushed down to the remote endpoint. `sort` is the field
/// name, prefixed with `-` for descending order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
}

/// A JSON response correlated back to its request by `rid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsResponse {
    pub rid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Immutable snapshot returned by `stat` and `files`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub updated_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Path suffix of a pre-rendered thumbnail stream for this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// Messages exchanged on the control channel, dispatched by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    Auth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fingerprint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hmac: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        request_services: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    AuthResult {
        result: bool,
        #[serde(default)]
        services: Option<Vec<String>>,
    },
    #[serde(rename_all = "camelCase")]
    Redirect { room_id: String },
    #[serde(rename_all = "camelCase")]
    Rpc {
        name: String,
        req_id: u64,
        params: Value,
    },
    #[serde(rename_all = "camelCase")]
    RpcResult {
        req_id: u64,
        #[serde(default)]
        value: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
}

/// Response body decoded at the transport boundary: either the JSON `data`
/// of a text response or the raw payload of a binary frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcData {
    Json(Value),
    Bytes(Vec<u8>),
}

/// One settled response: request id plus the outcome for its pending entry.
#[derive(Debug)]
pub struct RpcReply {
    pub rid: u32,
    pub result: Result<RpcData, FsError>,
}

/// Decodes either framing into the unified reply shape.
pub fn decode_reply(payload: &Payload) -> Result<RpcReply, FsError> {
    match payload {
        Payload::Text(text) => {
            let res: FsResponse =
                serde_json::from_str(text).map_err(|e| FsError::protocol(e.to_string()))?;
            let result = match res.error {
                Some(err) => Err(FsError::Remote(error_code(&err))),
                None => Ok(RpcData::Json(res.data.unwrap_or(Value::Null))),
            };
            Ok(RpcReply { rid: res.rid, result })
        }
        Payload::Binary(buf) => {
            let (rid, data) = decode_binary_frame(buf)?;
            Ok(RpcReply {
                rid,
                result: Ok(RpcData::Bytes(data.to_vec())),
            })
        }
    }
}

pub fn decode_binary_frame(buf: &[u8]) -> Result<(u32, &[u8]), FsError> {
    if buf.len() < BINARY_HEADER_LEN {
        return Err(FsError::protocol("short binary frame"));
    }
    let rid = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok((rid, &buf[BINARY_HEADER_LEN..]))
}

pub fn encode_binary_frame(rid: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(BINARY_HEADER_LEN + payload.len());
    frame.extend_from_slice(&[0u8; 4]);
    frame.extend_from_slice(&rid.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn to_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn from_base64(encoded: &str) -> Result<Vec<u8>, FsError> {
    BASE64
        .decode(encoded)
        .map_err(|e| FsError::protocol(e.to_string()))
}

pub(crate) fn error_code(err: &Value) -> String {
    match err {
        Value::String(code) => code.clone(),
        other => other.to_string(),
    }
}
