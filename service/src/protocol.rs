//! IPC protocol types for the catalog service.
//!
//! JSON-RPC-lite envelope: `{id, method, params}` in, `{id, result}` or
//! `{id, error: {code, message, data?}}` out, one JSON object per line.

use instrux_catalog::{GroomMode, InstructionEntry, ItemError};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Error codes (JSON-RPC error.code)
// ─────────────────────────────────────────────────────────────────────────────

/// Standard JSON-RPC errors.
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;
pub const ERR_INTERNAL: i64 = -32603;

/// Catalog-specific error codes.
pub const ERR_NOT_FOUND: i64 = -32001;
pub const ERR_VALIDATION: i64 = -32002;
pub const ERR_MUTATION_DISABLED: i64 = -32003;
pub const ERR_INTEGRITY: i64 = -32004;
pub const ERR_IO: i64 = -32005;

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcErrorResponse {
    pub id: RequestId,
    pub error: JsonRpcError,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloParams {
    pub protocol_version: String,
    #[serde(default)]
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResult {
    pub protocol_version: String,
    pub service_version: String,
    pub mutation_enabled: bool,
    pub capabilities: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// instructions/*
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddParams {
    pub entry: InstructionEntry,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddResult {
    pub id: String,
    pub created: bool,
    pub overwritten: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Why the entry was skipped (`CONFLICT`), absent otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ItemError>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportParams {
    pub entries: Vec<InstructionEntry>,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParams {
    pub entry: InstructionEntry,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveParams {
    pub ids: Vec<String>,
    #[serde(default)]
    pub missing_ok: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroomParams {
    #[serde(default)]
    pub mode: GroomMode,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportParams {
    #[serde(default)]
    pub summary: bool,
}

/// `instructions/dispatch` selector; the remaining params depend on the action.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchAction {
    pub action: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetParams {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchParams {
    #[serde(alias = "query")]
    pub q: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemsResult<T> {
    pub count: usize,
    pub items: Vec<T>,
}

impl<T> From<Vec<T>> for ItemsResult<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            count: items.len(),
            items,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// usage/*, metrics/*, health/*
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct TrackParams {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackResult {
    pub tracked: bool,
}

fn default_hotset_limit() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct HotsetParams {
    #[serde(default = "default_hotset_limit")]
    pub limit: usize,
}

impl Default for HotsetParams {
    fn default() -> Self {
        Self {
            limit: default_hotset_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub status: String,
    pub uptime_s: u64,
    pub version: String,
}
