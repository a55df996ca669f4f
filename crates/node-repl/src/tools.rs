//! Locating a usable `node` binary.
//!
//! Lookup order: an explicitly configured path, then `$NODE_REPL_NODE`,
//! then `node` on `PATH`. A candidate is accepted only if `--version`
//! succeeds and reports at least [`NODE_MIN_MAJOR_VERSION`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use log::{debug, info, warn};

/// Environment variable overriding the node binary.
pub const NODE_PATH_ENV: &str = "NODE_REPL_NODE";

/// Oldest node major version whose `vm` module supports everything the
/// bootstrap script uses.
pub const NODE_MIN_MAJOR_VERSION: u32 = 16;

/// A node binary that answered `--version`.
#[derive(Debug, Clone)]
pub struct NodeBinary {
    pub path: PathBuf,
    pub version: String,
}

/// Parse the major version from `node --version` output (e.g. "v20.11.0").
pub fn parse_node_major_version(version_output: &str) -> Option<u32> {
    version_output
        .trim()
        .strip_prefix('v')?
        .split('.')
        .next()?
        .parse()
        .ok()
}

fn candidates(configured: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = configured {
        candidates.push(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(NODE_PATH_ENV) {
        if !path.trim().is_empty() {
            candidates.push(PathBuf::from(path));
        }
    }
    candidates.push(PathBuf::from("node"));
    candidates
}

async fn probe(path: &Path) -> Result<NodeBinary> {
    let output = tokio::process::Command::new(path)
        .arg("--version")
        .output()
        .await
        .map_err(|e| anyhow!("failed to run {}: {}", path.display(), e))?;

    if !output.status.success() {
        return Err(anyhow!(
            "{} --version exited with {}",
            path.display(),
            output.status
        ));
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let major = parse_node_major_version(&version)
        .ok_or_else(|| anyhow!("unrecognized node version output: {:?}", version))?;
    if major < NODE_MIN_MAJOR_VERSION {
        return Err(anyhow!(
            "{} is node {}, need v{} or newer",
            path.display(),
            version,
            NODE_MIN_MAJOR_VERSION
        ));
    }

    Ok(NodeBinary {
        path: path.to_path_buf(),
        version,
    })
}

/// Find a usable node binary.
pub async fn find_node(configured: Option<&Path>) -> Result<NodeBinary> {
    let mut last_error = None;
    for candidate in candidates(configured) {
        debug!("[tools] Probing node at {}", candidate.display());
        match probe(&candidate).await {
            Ok(node) => {
                info!("[tools] Using node {} at {}", node.version, node.path.display());
                return Ok(node);
            }
            Err(e) => {
                warn!("[tools] Skipping {}: {}", candidate.display(), e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("no node binary found")))
}
