//! typst-oxide CLI tool
//!
//! Command-line interface for indexing and querying a workspace of Typst notes.
//!
//! ## Commands
//!
//! - `init <root>`: Write a default `.typst-oxide.toml`
//! - `index <root>`: Scan the workspace and summarize diagnostics
//! - `watch <root>`: Keep the index in sync until Ctrl-C
//! - `links`, `backlinks`, `diagnostics <file>`: Per-note queries
//! - `graph <root>`: The link graph as JSON
//! - `metadata [file]`: Metadata of one note or all of them

use clap::{Parser, Subcommand};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use typst_oxide::{
    config::{ConfigProvider, IndexConfig, TomlConfigProvider},
    coordinator::Coordinator,
    diagnostic::Severity,
    extract::ConfiguredMetadata,
    query::{GraphScope, Link, QueryService},
    resolver::{LabelResolution, Resolution},
    watch::WatchService,
    IndexError,
};

#[derive(Parser)]
#[command(name = "typst-oxide")]
#[command(author, version, about = "An incremental knowledge index over Typst notes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration file into a workspace
    Init {
        root: PathBuf,
    },

    /// Index a workspace and display a diagnostics summary
    Index {
        root: PathBuf,

        /// Re-parse every note, even unchanged ones
        #[arg(short, long)]
        force: bool,
    },

    /// Watch a workspace and keep its index up to date
    Watch {
        root: PathBuf,
    },

    /// References written in a note
    Links {
        file: PathBuf,

        /// Workspace root (defaults to the current directory)
        #[arg(short, long)]
        root: Option<PathBuf>,
    },

    /// References pointing at a note
    Backlinks {
        file: PathBuf,

        #[arg(short, long)]
        root: Option<PathBuf>,
    },

    /// Print the link graph as JSON
    Graph {
        root: PathBuf,

        /// Restrict the graph to the neighborhood of this note
        #[arg(long)]
        center: Option<PathBuf>,

        #[arg(long, default_value_t = 1)]
        depth: usize,
    },

    /// Diagnostics of a note
    Diagnostics {
        file: PathBuf,

        #[arg(short, long)]
        root: Option<PathBuf>,
    },

    /// Metadata of a note, or of every note
    Metadata {
        file: Option<PathBuf>,

        #[arg(short, long)]
        root: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // The watch service owns its runtime, so it must start outside ours
    if let Commands::Watch { root } = cli.command {
        return watch(root);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli.command))?;
    Ok(())
}

async fn open(root: &Path) -> Result<(Coordinator<ConfiguredMetadata>, QueryService), IndexError> {
    let config = TomlConfigProvider::for_workspace(root).load()?;
    let coordinator = Coordinator::open(root, config, None).await?;
    let query = QueryService::new(coordinator.store().clone());
    Ok((coordinator, query))
}

/// Open the workspace and bring its index up to date before querying it.
async fn open_fresh(
    root: Option<PathBuf>,
) -> Result<(Coordinator<ConfiguredMetadata>, QueryService), Box<dyn std::error::Error>> {
    let root = match root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let (coordinator, query) = open(&root).await?;
    if let Err(e) = coordinator.scan(false).await {
        tracing::warn!("Index refresh finished with errors: {e}");
    }
    Ok((coordinator, query))
}

fn describe(link: &Link) -> String {
    let outcome = match &link.resolution {
        Resolution::File { path, label } => {
            let label = match label {
                Some(LabelResolution::Found { .. }) => "",
                Some(LabelResolution::Missing) => " (label missing)",
                None => "",
            };
            format!("{}{label}", path.display())
        }
        Resolution::External { target } => format!("external file {target}"),
        Resolution::Ambiguous { candidates } => format!("ambiguous ({} notes)", candidates.len()),
        Resolution::Unresolved => "unresolved".to_string(),
    };
    format!(
        "{}:{}  [[{}]] -> {outcome}",
        link.position.line,
        link.position.column,
        link.display_text()
    )
}

async fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Init { root } => {
            let provider = TomlConfigProvider::for_workspace(&root);
            if provider.path().exists() {
                println!("{} already exists", provider.path().display());
            } else {
                provider.save(&IndexConfig::default())?;
                println!("Wrote {}", provider.path().display());
            }
        }

        Commands::Watch { .. } => return Err("watch cannot run inside an async runtime".into()),

        Commands::Index { root, force } => {
            let (coordinator, query) = open(&root).await?;
            let summary = coordinator.scan(force).await?;
            let diagnostics = query.all_diagnostics().await?;
            let errors = diagnostics
                .iter()
                .filter(|d| d.severity() == Severity::Error)
                .count();
            for diagnostic in &diagnostics {
                println!("{diagnostic}");
            }
            println!("\n=== Index Results ===");
            println!("Indexed: {}", summary.indexed);
            println!("Unchanged: {}", summary.skipped);
            println!("Failed: {}", summary.failed);
            println!("Removed: {}", summary.removed);
            println!("Diagnostics: {} ({errors} errors)", diagnostics.len());
            coordinator.store().close().await;
        }

        Commands::Links { file, root } => {
            let (_coordinator, query) = open_fresh(root).await?;
            let file = std::path::absolute(&file)?;
            let links = query
                .forward_links(&file)
                .await
                .ok_or_else(|| IndexError::NotFound(format!("{file:?} is not indexed")))?;
            for link in &links {
                println!("{}", describe(link));
            }
        }

        Commands::Backlinks { file, root } => {
            let (_coordinator, query) = open_fresh(root).await?;
            let file = std::path::absolute(&file)?;
            let links = query
                .backlinks(&file)
                .await
                .ok_or_else(|| IndexError::NotFound(format!("{file:?} is not indexed")))?;
            for link in &links {
                println!("{}  {}", link.source.display(), describe(link));
            }
        }

        Commands::Graph {
            root,
            center,
            depth,
        } => {
            let (_coordinator, query) = open_fresh(Some(root)).await?;
            let scope = match center {
                Some(center) => GraphScope::Neighborhood {
                    center: std::path::absolute(&center)?,
                    depth,
                },
                None => GraphScope::All,
            };
            let graph = query.graph(&scope).await?;
            println!("{}", serde_json::to_string_pretty(&graph)?);
        }

        Commands::Diagnostics { file, root } => {
            let (_coordinator, query) = open_fresh(root).await?;
            let file = std::path::absolute(&file)?;
            for diagnostic in query.diagnostics(&file).await? {
                println!("{diagnostic}");
            }
        }

        Commands::Metadata { file, root } => {
            let (_coordinator, query) = open_fresh(root).await?;
            let file = file.map(std::path::absolute).transpose()?;
            let entries = query.metadata(file.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }
    Ok(())
}

fn watch(root: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let event_handle = std::thread::spawn(move || {
        while let Some(event) = rx.blocking_recv() {
            println!("[Event] {event}");
        }
    });

    let service = WatchService::new(root, Some(tx))?;
    service.start()?;
    println!(
        "Watching {} for changes. Press Ctrl-C to stop.",
        service.root().display()
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    service.stop()?;
    drop(service);
    if event_handle.join().is_err() {
        tracing::warn!("Event printer thread panicked");
    }
    println!("Shutdown complete");
    Ok(())
}
