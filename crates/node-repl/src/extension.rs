//! Controller registration, command dispatch and teardown.
//!
//! [`Extension::activate`] starts the node session, spawns the executor and
//! registers the controller plus its single command. The host then routes
//! cell batches to [`Extension::execute`] and command invocations to
//! [`Extension::run_command`].

use anyhow::{anyhow, Result};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::backend::{Evaluator, NodeSession};
use crate::executor::{
    spawn_executor, Cell, CellExecutor, ExecutionEvent, ExecutionRecord, ExecutorHandle,
};
use crate::settings::ReplSettings;
use crate::surface::{InteractiveSurface, NotebookHost, SurfaceManager};
use crate::tools;

/// Command that opens or reveals the interactive surface.
pub const OPEN_COMMAND: &str = "simple-node-repl.new";

pub const CONTROLLER_ID: &str = "nodeREPL";
pub const VIEW_TYPE: &str = "interactive";
pub const LANGUAGE: &str = "javascript";
pub const LABEL: &str = "Node REPL";
pub const DESCRIPTION: &str = "Node.js REPL";
pub const EXTENSION_ID: &str = "rebornix.simple-node-repl";

/// Identity the controller registers with the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub id: String,
    pub view_type: String,
    pub supported_languages: Vec<String>,
    pub label: String,
    pub description: String,
    pub extension_id: String,
}

impl Default for ControllerInfo {
    fn default() -> Self {
        Self {
            id: CONTROLLER_ID.to_string(),
            view_type: VIEW_TYPE.to_string(),
            supported_languages: vec![LANGUAGE.to_string()],
            label: LABEL.to_string(),
            description: DESCRIPTION.to_string(),
            extension_id: EXTENSION_ID.to_string(),
        }
    }
}

/// A registered controller with its executor and surface.
pub struct Extension<E> {
    controller: ControllerInfo,
    executor: ExecutorHandle<E>,
    surfaces: SurfaceManager,
}

impl Extension<NodeSession> {
    /// Locate node, start the session and register the controller.
    pub async fn activate(
        settings: &ReplSettings,
        events: Option<mpsc::UnboundedSender<ExecutionEvent>>,
    ) -> Result<Self> {
        let node = tools::find_node(settings.node_path.as_deref()).await?;
        let session = NodeSession::start(&settings.session_config(&node.path)).await?;
        Ok(Self::register(session, events))
    }
}

impl<E> Extension<E>
where
    E: Evaluator + 'static,
{
    /// Register the controller around an already running evaluator.
    pub fn register(evaluator: E, events: Option<mpsc::UnboundedSender<ExecutionEvent>>) -> Self {
        let mut executor = CellExecutor::new(evaluator);
        if let Some(events) = events {
            executor = executor.with_events(events);
        }

        let controller = ControllerInfo::default();
        info!(
            "[extension] Registered controller {} ({}) for {:?}",
            controller.id, controller.view_type, controller.supported_languages
        );

        Self {
            controller,
            executor: spawn_executor(executor),
            surfaces: SurfaceManager::new(),
        }
    }

    pub fn controller(&self) -> &ControllerInfo {
        &self.controller
    }

    /// Commands contributed by the extension.
    pub fn commands(&self) -> &'static [&'static str] {
        &[OPEN_COMMAND]
    }

    pub fn surface(&self) -> Option<&InteractiveSurface> {
        self.surfaces.surface()
    }

    /// Execute a batch of cells, in order.
    pub async fn execute(&self, cells: Vec<Cell>) -> Result<Vec<ExecutionRecord>> {
        Ok(self.executor.execute(cells).await?)
    }

    /// Dispatch a command invocation from the host.
    pub async fn run_command<H: NotebookHost>(
        &mut self,
        command: &str,
        host: &mut H,
    ) -> Result<InteractiveSurface> {
        match command {
            OPEN_COMMAND => self.surfaces.open_or_reveal(host, &self.controller).await,
            other => Err(anyhow!("unknown command: {}", other)),
        }
    }

    /// The host closed the interactive surface.
    pub fn surface_closed(&mut self) {
        if let Some(surface) = self.surfaces.forget() {
            info!("[extension] Surface {} closed", surface.document_uri);
        }
    }

    /// Stop the executor and return the evaluator for teardown.
    pub async fn deactivate(self) -> Result<E> {
        info!("[extension] Deactivating {}", self.controller.id);
        Ok(self.executor.shutdown().await?)
    }
}
