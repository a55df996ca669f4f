//! The evaluation backend: one long-lived `node` process per session.
//!
//! The process runs the embedded bootstrap script, which keeps a single
//! `vm` context alive for the lifetime of the session. Bindings created by
//! one submission stay visible to every later one. Thrown errors are caught
//! inside the script and reported as results, so user code cannot take the
//! session down.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bridge::{BridgeError, StreamBridge};
use crate::Evaluation;

/// Script run by `node -e`. Speaks the NDJSON protocol in [`crate::protocol`].
pub const BOOTSTRAP_SCRIPT: &str = include_str!("bootstrap.js");

/// Default per-submission evaluation timeout.
pub const DEFAULT_EVAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time allowed for node to start and report ready.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `shutdown` waits for node to exit after closing its stdin.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Anything that can evaluate source text against a persistent context.
///
/// Implementations must keep state between calls and must report thrown
/// errors through [`Evaluation::status`] rather than failing the call.
pub trait Evaluator: Send {
    fn evaluate(
        &mut self,
        code: &str,
    ) -> impl Future<Output = Result<Evaluation, BridgeError>> + Send;
}

/// How to launch a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub node_path: PathBuf,
    /// Extra arguments placed before `-e`.
    pub node_args: Vec<String>,
    pub eval_timeout: Duration,
    pub startup_timeout: Duration,
}

impl SessionConfig {
    pub fn new(node_path: impl Into<PathBuf>) -> Self {
        Self {
            node_path: node_path.into(),
            node_args: Vec::new(),
            eval_timeout: DEFAULT_EVAL_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }
}

/// Error type for session lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("node process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("node did not become ready: {0}")]
    NotReady(#[source] BridgeError),

    #[error("Failed to stop node: {0}")]
    Shutdown(#[source] std::io::Error),
}

/// A running node process and the bridge driving it.
pub struct NodeSession {
    id: String,
    started_at: DateTime<Utc>,
    child: Child,
    bridge: StreamBridge<ChildStdin>,
    stderr_task: JoinHandle<()>,
}

impl NodeSession {
    /// Spawn node and wait until the bootstrap script reports ready.
    pub async fn start(config: &SessionConfig) -> Result<Self, SessionError> {
        let id = Uuid::new_v4().to_string();
        info!(
            "[session] Starting {} for session {}",
            config.node_path.display(),
            id
        );

        let mut child = Command::new(&config.node_path)
            .args(&config.node_args)
            .arg("-e")
            .arg(BOOTSTRAP_SCRIPT)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SessionError::Spawn {
                path: config.node_path.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(SessionError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SessionError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SessionError::MissingPipe("stderr"))?;

        let stderr_task = tokio::spawn(forward_stderr(stderr, id.clone()));

        let mut bridge = StreamBridge::new(stdin, stdout, config.eval_timeout);
        if let Err(e) = bridge.wait_ready(config.startup_timeout).await {
            stderr_task.abort();
            return Err(SessionError::NotReady(e));
        }

        info!(
            "[session] Session {} ready (node {})",
            id,
            bridge.version().unwrap_or("unknown")
        );

        Ok(Self {
            id,
            started_at: Utc::now(),
            child,
            bridge,
            stderr_task,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Node version reported at startup.
    pub fn version(&self) -> &str {
        self.bridge.version().unwrap_or("unknown")
    }

    /// Whether the node process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Close node's stdin and wait for it to exit, killing it if it lingers.
    pub async fn shutdown(self) -> Result<(), SessionError> {
        let NodeSession {
            id,
            mut child,
            bridge,
            stderr_task,
            ..
        } = self;

        // Closing stdin makes the bootstrap script exit on its own
        drop(bridge);

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!("[session] Session {} exited: {}", id, status),
            Ok(Err(e)) => return Err(SessionError::Shutdown(e)),
            Err(_) => {
                warn!("[session] Session {} did not exit, killing", id);
                child.kill().await.map_err(SessionError::Shutdown)?;
            }
        }

        stderr_task.abort();
        Ok(())
    }
}

impl Evaluator for NodeSession {
    async fn evaluate(&mut self, code: &str) -> Result<Evaluation, BridgeError> {
        let evaluation = self.bridge.submit(code).await?;
        debug!(
            "[session] Session {} evaluated: status={}",
            self.id, evaluation.status
        );
        Ok(evaluation)
    }
}

async fn forward_stderr(stderr: ChildStderr, session_id: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!("[session] {} stderr: {}", session_id, line);
    }
}
