use deckpack::bridge::CommandResult;
use deckpack::config::Config;
use deckpack::hash::content_hash;
use deckpack::Workspace;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "deckpack", version, about = "Slide project archive and asset manager")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a project (container or legacy JSON) and print its document
    Open {
        /// Project file to open
        archive: PathBuf,
    },
    /// Package a document and its inline images into a project container
    Pack {
        /// Document JSON, inline `data:` images allowed
        document: PathBuf,
        /// Destination container path
        out: PathBuf,
    },
    /// Extract one asset from a project
    Asset {
        /// Project file to open
        archive: PathBuf,
        /// Asset reference, e.g. `asset://img_<hash>.png`
        reference: String,
        /// Write the bytes here instead of reporting their size
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the content hash of a file
    Hash {
        file: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct PackSummary {
    path: PathBuf,
    assets: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AssetSummary {
    reference: String,
    bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    written_to: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        // stdout carries command results.
        let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| deckpack::deckpack_home().join("config.yaml"));

    let ok = match cli.command {
        Command::Hash { file } => {
            let result: CommandResult<String> = hash_file(&file).await.into();
            emit(result)?
        }
        command => {
            let config = Config::load(&config_path).await?;
            let workspace = Workspace::new(&config);
            info!(root = %workspace.root().display(), "workspace ready");
            let ok = run(&workspace, command).await?;
            workspace.shutdown().await;
            ok
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Run a command that needs a workspace session.
async fn run(workspace: &Workspace, command: Command) -> anyhow::Result<bool> {
    match command {
        Command::Open { archive } => {
            let opened = workspace.open_project(&archive).await;
            if opened.is_ok() {
                let assets = workspace.list_assets().await?.len();
                info!(path = %archive.display(), assets, "project loaded");
            }
            let result: CommandResult<deckpack::Document> =
                opened.map(|doc| (*doc).clone()).into();
            emit(result)
        }
        Command::Pack { document, out } => {
            let result: CommandResult<PackSummary> = pack(workspace, &document, &out).await.into();
            emit(result)
        }
        Command::Asset {
            archive,
            reference,
            out,
        } => {
            let result: CommandResult<AssetSummary> =
                extract_asset(workspace, &archive, &reference, out).await.into();
            emit(result)
        }
        Command::Hash { file } => {
            let result: CommandResult<String> = hash_file(&file).await.into();
            emit(result)
        }
    }
}

/// Print `result` as JSON on stdout and report whether it succeeded.
fn emit<T: Serialize>(result: CommandResult<T>) -> anyhow::Result<bool> {
    let text = serde_json::to_string_pretty(&result).context("failed to encode result")?;
    println!("{text}");
    Ok(result.ok)
}

async fn hash_file(path: &Path) -> anyhow::Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(content_hash(&bytes))
}

/// Open `document` (migrating inline images into the session) and save
/// it as a container at `out`.
async fn pack(workspace: &Workspace, document: &Path, out: &Path) -> anyhow::Result<PackSummary> {
    let doc = workspace
        .open_project(document)
        .await
        .with_context(|| format!("failed to load {}", document.display()))?;
    workspace
        .save_project(out, &doc)
        .await
        .with_context(|| format!("failed to write {}", out.display()))?;
    Ok(PackSummary {
        path: out.to_path_buf(),
        assets: workspace.list_assets().await?,
    })
}

async fn extract_asset(
    workspace: &Workspace,
    archive: &Path,
    reference: &str,
    out: Option<PathBuf>,
) -> deckpack::Result<AssetSummary> {
    workspace.open_project(archive).await?;
    let bytes = workspace.resolve_asset(reference).await?;
    if let Some(dest) = &out {
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| deckpack::ArchiveError::Io {
                context: format!("write {}", dest.display()),
                source: e,
            })?;
    }
    Ok(AssetSummary {
        reference: reference.to_string(),
        bytes: bytes.len(),
        written_to: out,
    })
}
