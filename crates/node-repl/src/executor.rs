//! Cell execution: turns batches of cells into finalized execution records.
//!
//! Cells are evaluated strictly one after another. Each cell gets one
//! [`ExecutionRecord`] which is started, given exactly one output item, and
//! ended before the next cell is submitted.
//!
//! [`spawn_executor`] moves a [`CellExecutor`] into its own task and hands
//! back a handle; batches sent through the handle are queued, so two user
//! actions never interleave their cells.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::Evaluator;
use crate::bridge::BridgeError;
use crate::{EvalStatus, Evaluation};

/// MIME type of a plain text output item.
pub const TEXT_PLAIN: &str = "text/plain";

/// MIME type hosts render as an error affordance.
pub const ERROR_MIME: &str = "application/vnd.code.notebook.error";

/// Prefix of the error output produced for code that ended mid-statement.
pub const INCOMPLETE_PREFIX: &str = "Incomplete statement: ";

/// Capacity of the executor's command channel.
const COMMAND_CHANNEL_SIZE: usize = 32;

/// One unit of submitted source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub id: String,
    pub source: String,
}

impl Cell {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
        }
    }

    /// Create a cell with a fresh random id.
    pub fn from_source(source: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), source)
    }
}

/// A single output item attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellOutput {
    pub mime: String,
    pub text: String,
}

impl CellOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            mime: TEXT_PLAIN.to_string(),
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            mime: ERROR_MIME.to_string(),
            text: text.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.mime == ERROR_MIME
    }
}

/// The host-visible state of one cell's execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub cell_id: String,
    /// 1-based position across the lifetime of the executor.
    pub execution_order: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outputs: Vec<CellOutput>,
    /// `None` while running.
    pub success: Option<bool>,
    /// What the backend reported. `None` while running or when no reply came back.
    #[serde(default)]
    pub status: Option<EvalStatus>,
}

impl ExecutionRecord {
    fn start(cell_id: &str, execution_order: u64) -> Self {
        Self {
            cell_id: cell_id.to_string(),
            execution_order,
            started_at: Utc::now(),
            ended_at: None,
            outputs: Vec::new(),
            success: None,
            status: None,
        }
    }

    fn replace_output(&mut self, output: CellOutput) {
        self.outputs = vec![output];
    }

    fn end(&mut self, success: bool) {
        self.ended_at = Some(Utc::now());
        self.success = Some(success);
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Whether the cell failed only because its code was cut short.
    pub fn needs_more_input(&self) -> bool {
        self.status == Some(EvalStatus::Incomplete)
    }

    /// Text of the record's output item, if any.
    pub fn output_text(&self) -> Option<&str> {
        self.outputs.first().map(|o| o.text.as_str())
    }
}

/// Progress notifications emitted while a batch runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Started { cell_id: String, execution_order: u64 },
    Finished { record: ExecutionRecord },
}

/// Map an evaluation outcome to the record's single output and success flag.
fn output_for(result: Result<Evaluation, BridgeError>) -> (CellOutput, bool) {
    match result {
        Ok(Evaluation {
            status: EvalStatus::Ok,
            text,
        }) => (CellOutput::text(text.trim()), true),
        Ok(Evaluation {
            status: EvalStatus::Error,
            text,
        }) => (CellOutput::error(text.trim()), false),
        Ok(Evaluation {
            status: EvalStatus::Incomplete,
            text,
        }) => (
            CellOutput::error(format!("{}{}", INCOMPLETE_PREFIX, text.trim())),
            false,
        ),
        Err(e) => (CellOutput::error(e.to_string()), false),
    }
}

/// Runs cells against an [`Evaluator`], one at a time.
pub struct CellExecutor<E> {
    evaluator: E,
    execution_count: u64,
    events: Option<mpsc::UnboundedSender<ExecutionEvent>>,
}

impl<E: Evaluator> CellExecutor<E> {
    pub fn new(evaluator: E) -> Self {
        Self {
            evaluator,
            execution_count: 0,
            events: None,
        }
    }

    /// Send [`ExecutionEvent`]s to `events` as cells start and finish.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Number of cells executed so far.
    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn into_inner(self) -> E {
        self.evaluator
    }

    fn emit(&mut self, event: ExecutionEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                warn!("[executor] Event listener went away");
                self.events = None;
            }
        }
    }

    /// Evaluate one cell and return its finalized record.
    pub async fn execute_cell(&mut self, cell: &Cell) -> ExecutionRecord {
        self.execution_count += 1;
        let mut record = ExecutionRecord::start(&cell.id, self.execution_count);
        self.emit(ExecutionEvent::Started {
            cell_id: cell.id.clone(),
            execution_order: record.execution_order,
        });

        let result = self.evaluator.evaluate(&cell.source).await;
        match &result {
            Ok(evaluation) => record.status = Some(evaluation.status),
            Err(e) => error!("[executor] Cell {} failed to evaluate: {}", cell.id, e),
        }

        let (output, success) = output_for(result);
        record.replace_output(output);
        record.end(success);

        info!(
            "[executor] Cell {} finished: order={} success={}",
            cell.id, record.execution_order, success
        );
        self.emit(ExecutionEvent::Finished {
            record: record.clone(),
        });
        record
    }

    /// Evaluate `cells` in order. Records come back in the same order.
    pub async fn execute_cells(&mut self, cells: &[Cell]) -> Vec<ExecutionRecord> {
        let mut records = Vec::with_capacity(cells.len());
        for cell in cells {
            records.push(self.execute_cell(cell).await);
        }
        records
    }
}

/// Error type for executor handle operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Executor has stopped")]
    Stopped,
}

enum ExecutorCommand<E> {
    Execute {
        cells: Vec<Cell>,
        reply: oneshot::Sender<Vec<ExecutionRecord>>,
    },
    Shutdown {
        reply: oneshot::Sender<E>,
    },
}

/// Handle to an executor running in its own task.
pub struct ExecutorHandle<E> {
    tx: mpsc::Sender<ExecutorCommand<E>>,
    task: JoinHandle<()>,
}

impl<E> ExecutorHandle<E> {
    /// Queue a batch and wait for all of its records.
    pub async fn execute(&self, cells: Vec<Cell>) -> Result<Vec<ExecutionRecord>, ExecutorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ExecutorCommand::Execute { cells, reply })
            .await
            .map_err(|_| ExecutorError::Stopped)?;
        rx.await.map_err(|_| ExecutorError::Stopped)
    }

    /// Stop after any queued batches and hand back the evaluator.
    pub async fn shutdown(self) -> Result<E, ExecutorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ExecutorCommand::Shutdown { reply })
            .await
            .map_err(|_| ExecutorError::Stopped)?;
        let evaluator = rx.await.map_err(|_| ExecutorError::Stopped)?;
        let _ = self.task.await;
        Ok(evaluator)
    }
}

/// Spawn the executor task. Returns a handle for submitting batches.
pub fn spawn_executor<E>(executor: CellExecutor<E>) -> ExecutorHandle<E>
where
    E: Evaluator + 'static,
{
    let (tx, mut rx) = mpsc::channel::<ExecutorCommand<E>>(COMMAND_CHANNEL_SIZE);

    let task = tokio::spawn(async move {
        let mut executor = executor;
        info!("[executor] Executor started");

        while let Some(cmd) = rx.recv().await {
            match cmd {
                ExecutorCommand::Execute { cells, reply } => {
                    info!("[executor] Executing batch of {} cells", cells.len());
                    let records = executor.execute_cells(&cells).await;
                    if reply.send(records).is_err() {
                        warn!("[executor] Batch requester went away before completion");
                    }
                }
                ExecutorCommand::Shutdown { reply } => {
                    info!("[executor] Shutting down");
                    let _ = reply.send(executor.into_inner());
                    return;
                }
            }
        }

        info!("[executor] Command channel closed");
    });

    ExecutorHandle { tx, task }
}
