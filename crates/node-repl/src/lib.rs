//! node-repl - Notebook controller backed by a persistent Node.js session.
//!
//! Cells submitted by a notebook host are evaluated one at a time inside a
//! single long-lived `node` process. The process runs a small bootstrap
//! script that owns a `vm` context, so bindings created by one cell are
//! visible to the next.
//!
//! The pieces, leaves first:
//!
//! - [`protocol`]: NDJSON messages exchanged with the bootstrap script
//! - [`bridge`]: turns the process' stdin/stdout streams into one awaitable
//!   call per cell
//! - [`backend`]: spawns and owns the node process (the session)
//! - [`executor`]: runs batches of cells sequentially and produces
//!   execution records
//! - [`surface`]: opens or reveals the single interactive surface
//! - [`extension`]: activation, command registration and teardown

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod backend;
pub mod bridge;
pub mod executor;
pub mod extension;
pub mod protocol;
pub mod settings;
pub mod surface;
pub mod tools;

pub use backend::{Evaluator, NodeSession, SessionConfig, SessionError};
pub use bridge::{BridgeError, StreamBridge};
pub use executor::{
    spawn_executor, Cell, CellExecutor, CellOutput, ExecutionEvent, ExecutionRecord,
    ExecutorHandle,
};
pub use extension::{ControllerInfo, Extension, OPEN_COMMAND};
pub use surface::{InteractiveSurface, NotebookHost, SurfaceManager};

/// Outcome classification reported by the evaluation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    /// Code ran to completion.
    Ok,
    /// Code threw, or failed to compile.
    Error,
    /// Code ended mid-statement and needs more input.
    Incomplete,
}

impl std::fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalStatus::Ok => write!(f, "ok"),
            EvalStatus::Error => write!(f, "error"),
            EvalStatus::Incomplete => write!(f, "incomplete"),
        }
    }
}

/// The text captured for one submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub status: EvalStatus,
    /// Printed output followed by the inspected completion value, untrimmed.
    pub text: String,
}

impl Evaluation {
    pub fn is_ok(&self) -> bool {
        self.status == EvalStatus::Ok
    }
}

/// Get the directory holding node-repl's configuration.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("node-repl")
}
