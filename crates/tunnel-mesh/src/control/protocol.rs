//! Messages exchanged on the control channel (JSON-RPC 2.0 envelopes).

use crate::error::MeshError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::Ipv4Addr;

pub const JSONRPC_VERSION: &str = "2.0";

/// Returns the configuration snapshot.
pub const METHOD_SYNC: &str = "ConfigServer.Sync";

/// Resolves a private IP (u32, network byte order) to a mapping record.
pub const METHOD_MAPPING: &str = "DatastoreServer.Mapping";

/// Records one stat. Sent as a notification.
pub const METHOD_SINK: &str = "AggServer.Sink";

pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// No record for the requested address.
pub const MAPPING_NOT_FOUND: i32 = -32000;

/// A call, or a notification when `id` is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl Request {
    pub fn call(method: &str, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id: Some(id),
        }
    }

    pub fn notify(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: Some(params),
            id: None,
        }
    }
}

/// Answer to a call; exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: u64,
}

impl Response {
    pub fn new(id: u64, outcome: Result<Value, RpcError>) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(error) => (None, Some(error)),
        };
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
            error,
            id,
        }
    }

    /// A missing result is read as `null`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<RpcError> for MeshError {
    fn from(error: RpcError) -> Self {
        MeshError::Rpc {
            code: error.code,
            message: error.message,
        }
    }
}

/// Wire form of a mapping lookup key.
pub fn encode_address(ip: Ipv4Addr) -> u32 {
    u32::from_be_bytes(ip.octets())
}

/// Inverse of [`encode_address`].
pub fn decode_address(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(raw.to_be_bytes())
}
