//! Wire protocol between the stream bridge and the node bootstrap script.
//!
//! Messages are newline-delimited JSON (NDJSON), one object per line, in
//! both directions over the child's stdin and stdout.

use serde::{Deserialize, Serialize};

use crate::EvalStatus;

/// Requests written to the backend's input channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Evaluate `code` in the persistent context.
    Eval {
        id: u64,
        code: String,
        /// Upper bound for synchronous execution inside the engine.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

/// Replies read from the backend's output channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// Written once at startup, after the engine is listening for input.
    Ready { version: String },

    /// The single result for the request with the same id.
    Result {
        id: u64,
        status: EvalStatus,
        text: String,
    },

    /// The engine could not parse a request line.
    ProtocolError { message: String },
}

impl Request {
    /// Serialize request to JSON line (with newline terminator).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse request from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl Reply {
    /// Serialize reply to JSON line (with newline terminator).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse reply from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
