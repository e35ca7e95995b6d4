//! JSON wire types: WebSocket event-stream messages and REST bodies.
//!
//! Request bodies use `Option` fields and are validated by hand so that a
//! missing or malformed field surfaces as 400 rather than a serde rejection.

use serde::{Deserialize, Serialize};

/// Server → client event stream. PTY bytes travel base64-encoded.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsMessage {
    #[serde(rename_all = "camelCase")]
    Data {
        session_id: String,
        data: String,
        sequence: i64,
        timestamp_ms: i64,
        echo_of_input: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        original_source: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Name {
        session_id: String,
        new_name: String,
        working_dir: String,
        timestamp_ms: i64,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        session_id: String,
        error: String,
        timestamp_ms: i64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub name: Option<String>,
    pub working_dir: Option<String>,
    pub cols: Option<u32>,
    pub rows: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameBody {
    pub new_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachBody {
    pub conn_id: Option<String>,
    pub cols: Option<u32>,
    pub rows: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeBody {
    pub conn_id: Option<String>,
    pub cols: Option<u32>,
    pub rows: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputBody {
    pub conn_id: Option<String>,
    pub input: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub start_seq: Option<i64>,
    pub end_seq: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub session_id: Option<String>,
    pub conn_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryChunk {
    pub sequence: i64,
    pub data: String,
    pub timestamp_ms: i64,
}
