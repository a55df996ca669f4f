//! node-repl CLI entry point.
//!
//! Acts as a terminal notebook host: it activates the controller, opens the
//! interactive surface and feeds cells from stdin or from a file.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use node_repl::executor::ExecutionRecord;
use node_repl::settings::{self, ReplSettings};
use node_repl::surface::ControllerAffinity;
use node_repl::{
    Cell, ControllerInfo, Extension, InteractiveSurface, NodeSession, NotebookHost, OPEN_COMMAND,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

/// Marker line separating cells in a script file.
const CELL_MARKER: &str = "// %%";

#[derive(Parser, Debug)]
#[command(name = "node-repl")]
#[command(about = "Evaluate notebook cells in a persistent Node.js session")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Node binary to use (overrides settings and $NODE_REPL_NODE)
    #[arg(long, global = true)]
    node: Option<PathBuf>,

    /// Per-cell evaluation timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Interactive session reading cells from stdin (default)
    Repl,

    /// Run a script whose cells are separated by `// %%` lines
    Run {
        file: PathBuf,

        /// Print execution records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the settings file location and effective settings
    Settings,
}

/// Terminal stand-in for a notebook editor.
#[derive(Default)]
struct TerminalHost {
    verbose: bool,
}

impl NotebookHost for TerminalHost {
    async fn open_interactive(
        &mut self,
        controller: &ControllerInfo,
        title: &str,
    ) -> Result<InteractiveSurface> {
        let surface = InteractiveSurface {
            editor_id: Uuid::new_v4().to_string(),
            document_uri: format!("{}:{}", controller.view_type, title),
        };
        if self.verbose {
            eprintln!("{} ({})", controller.label, controller.description);
        }
        Ok(surface)
    }

    async fn show_document(&mut self, surface: &InteractiveSurface) -> Result<()> {
        info!("Showing {}", surface.document_uri);
        Ok(())
    }

    fn update_affinity(
        &mut self,
        surface: &InteractiveSurface,
        controller: &ControllerInfo,
        affinity: ControllerAffinity,
    ) -> Result<()> {
        info!(
            "Affinity of {} for {}: {:?}",
            controller.id, surface.document_uri, affinity
        );
        Ok(())
    }

    async fn select_kernel(
        &mut self,
        surface: &InteractiveSurface,
        controller: &ControllerInfo,
    ) -> Result<()> {
        info!("Selected {} for editor {}", controller.id, surface.editor_id);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut settings = settings::load_settings();
    if let Some(node) = cli.node.clone() {
        settings.node_path = Some(node);
    }
    if let Some(timeout) = cli.timeout {
        settings.eval_timeout_secs = timeout;
    }

    match cli.command {
        None | Some(Commands::Repl) => repl(&settings).await,
        Some(Commands::Run { file, json }) => run_file(&settings, &file, json).await,
        Some(Commands::Settings) => show_settings(&settings),
    }
}

async fn repl(settings: &ReplSettings) -> Result<()> {
    let mut extension = Extension::activate(settings, None).await?;
    let mut host = TerminalHost { verbose: true };
    extension.run_command(OPEN_COMMAND, &mut host).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut buffer = String::new();

    loop {
        prompt(if buffer.is_empty() { "> " } else { "... " })?;

        let Some(line) = lines.next_line().await? else {
            break;
        };

        if buffer.is_empty() {
            match line.trim() {
                "" => continue,
                ".exit" => break,
                ".open" => {
                    extension.run_command(OPEN_COMMAND, &mut host).await?;
                    continue;
                }
                _ => {}
            }
        }

        buffer.push_str(&line);
        buffer.push('\n');

        let records = extension.execute(vec![Cell::from_source(buffer.as_str())]).await?;
        // Keep reading lines until the statement is complete
        if records.iter().any(ExecutionRecord::needs_more_input) && !line.trim().is_empty() {
            continue;
        }
        for record in &records {
            print_record(record);
        }
        buffer.clear();
    }

    shutdown(extension).await
}

async fn run_file(settings: &ReplSettings, file: &Path, json: bool) -> Result<()> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let cells = split_cells(&source);

    let extension = Extension::activate(settings, None).await?;
    let records = extension.execute(cells).await?;
    shutdown(extension).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        for record in &records {
            print_record(record);
        }
    }

    if records.iter().any(|r| r.success != Some(true)) {
        std::process::exit(1);
    }
    Ok(())
}

fn show_settings(settings: &ReplSettings) -> Result<()> {
    println!("Settings file: {}", settings::settings_path().display());
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}

async fn shutdown(extension: Extension<NodeSession>) -> Result<()> {
    let session = extension.deactivate().await?;
    session.shutdown().await?;
    Ok(())
}

/// Split a script into cells on `// %%` lines, dropping empty cells.
fn split_cells(source: &str) -> Vec<Cell> {
    let mut cells = Vec::new();
    let mut current = String::new();

    let mut flush = |current: &mut String| {
        if !current.trim().is_empty() {
            cells.push(Cell::new(format!("cell-{}", cells.len() + 1), current.clone()));
        }
        current.clear();
    };

    for line in source.lines() {
        if line.trim_start().starts_with(CELL_MARKER) {
            flush(&mut current);
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    flush(&mut current);

    cells
}

fn prompt(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

fn print_record(record: &ExecutionRecord) {
    for output in &record.outputs {
        if output.text.is_empty() {
            continue;
        }
        if output.is_error() {
            eprintln!("{}", output.text);
        } else {
            println!("{}", output.text);
        }
    }
}
