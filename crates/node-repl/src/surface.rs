//! Lifecycle of the single interactive surface bound to the controller.
//!
//! The first invocation asks the host to open a surface; later invocations
//! reuse it. Every invocation then reveals the surface and re-selects the
//! controller as its kernel.

use std::future::Future;

use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};

use crate::extension::ControllerInfo;

/// How strongly the host should prefer a controller for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerAffinity {
    Default,
    Preferred,
}

/// Handle to an interactive surface opened by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractiveSurface {
    /// Identifies the editor showing the surface.
    pub editor_id: String,
    /// Identifies the notebook document behind the editor.
    pub document_uri: String,
}

/// The operations the lifecycle manager needs from a notebook host.
pub trait NotebookHost: Send {
    /// Open a new interactive surface bound to `controller`.
    fn open_interactive(
        &mut self,
        controller: &ControllerInfo,
        title: &str,
    ) -> impl Future<Output = Result<InteractiveSurface>> + Send;

    /// Bring the surface's document into view.
    fn show_document(
        &mut self,
        surface: &InteractiveSurface,
    ) -> impl Future<Output = Result<()>> + Send;

    fn update_affinity(
        &mut self,
        surface: &InteractiveSurface,
        controller: &ControllerInfo,
        affinity: ControllerAffinity,
    ) -> Result<()>;

    /// Make `controller` the active kernel of the surface.
    fn select_kernel(
        &mut self,
        surface: &InteractiveSurface,
        controller: &ControllerInfo,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Owns the (at most one) interactive surface.
#[derive(Debug, Default)]
pub struct SurfaceManager {
    surface: Option<InteractiveSurface>,
}

impl SurfaceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn surface(&self) -> Option<&InteractiveSurface> {
        self.surface.as_ref()
    }

    /// Open the surface if needed, then reveal it and bind the controller.
    pub async fn open_or_reveal<H: NotebookHost>(
        &mut self,
        host: &mut H,
        controller: &ControllerInfo,
    ) -> Result<InteractiveSurface> {
        let surface = match self.surface.take() {
            Some(surface) => {
                info!("[surface] Revealing {}", surface.document_uri);
                surface
            }
            None => {
                let surface = host.open_interactive(controller, &controller.label).await?;
                info!(
                    "[surface] Opened {} in editor {}",
                    surface.document_uri, surface.editor_id
                );
                surface
            }
        };
        // Keep the surface even if revealing it fails below
        self.surface = Some(surface.clone());

        host.show_document(&surface).await?;
        host.update_affinity(&surface, controller, ControllerAffinity::Default)?;
        host.select_kernel(&surface, controller).await?;

        Ok(surface)
    }

    /// Drop the remembered surface after the host closed it.
    pub fn forget(&mut self) -> Option<InteractiveSurface> {
        self.surface.take()
    }
}
