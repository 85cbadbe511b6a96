//! Main module for the `hsmcp` CLI.
//!
//! Drives the embedding engine from the command line: every invocation loads
//! the persisted index (if any), runs one command through the same tools the
//! MCP server uses, and writes the index back after a mutating command.
//!
//! # Examples
//!
//! ```sh
//! hsmcp init
//! hsmcp build --entity-type contacts --input contacts.json
//! hsmcp search "vp of engineering at a fintech" -k 5 -t 0.4
//! hsmcp stats
//! hsmcp clear
//! ```

use clap::Parser;
use hubspot_mcp::commands::{Cli, Commands, IndexCommand};
use hubspot_mcp::config::{self, HubSpotMcpConfig};
use hubspot_mcp::entity::parse_entities;
use hubspot_mcp::manager::{EmbeddingManager, IndexPaths};
use hubspot_mcp::tools::{
    EmbeddingManagementTool, ManagementAction, ManagementRequest, SearchRequest,
    SemanticSearchTool,
};
use hubspot_mcp::config_dir;
use once_cell::sync::OnceCell;
use std::{
    error::Error,
    fs,
    path::Path,
    sync::Arc,
};
use tracing::{debug, info, warn};

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        // stdout carries command output; logs go to stderr
        tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    });
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

/// Parses the command line, loads configuration and index, and runs the command.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded, the index path
/// cannot be resolved, an input file cannot be read, or persisting the index fails.
/// Failures inside the embedding engine are reported as text by the tools.
async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => config_dir()?.join("config.yaml"),
    };

    match cli.command {
        Commands::Init => init(&config_path),
        Commands::Index(command) => execute(command, &config_path).await,
    }
}

/// Runs an index command against the configured index.
///
/// A saved index that fails to load is never overwritten by `build`; only
/// `clear` removes the files.
async fn execute(command: IndexCommand, config_path: &Path) -> Result<(), Box<dyn Error>> {
    let config = if config_path.exists() {
        debug!("Loading config from: {}", config_path.display());
        let path = config_path
            .to_str()
            .ok_or("config path is not valid UTF-8")?;
        config::load_config(path)?
    } else {
        debug!("No config at {}, using defaults", config_path.display());
        HubSpotMcpConfig::default()
    };
    let embeddings = config.embeddings;
    let index_path = embeddings.resolved_index_path()?;

    let manager = Arc::new(EmbeddingManager::from_config(&embeddings)?);
    let load_error = if IndexPaths::new(&index_path).exists() {
        manager.load_index(&index_path).err()
    } else {
        None
    };
    if let Some(e) = &load_error {
        warn!(error = %e, "could not load the saved index, starting empty");
    }
    let manage = EmbeddingManagementTool::new(Arc::clone(&manager));

    match command {
        IndexCommand::Build {
            entity_type,
            input,
            rebuild,
        } => {
            if let Some(e) = load_error {
                return Err(format!(
                    "saved index at {} could not be loaded ({e}); fix it or run `hsmcp clear` first",
                    index_path.display()
                )
                .into());
            }
            let entities = parse_entities(&fs::read_to_string(&input)?)?;
            info!(
                count = entities.len(),
                %entity_type,
                input = %input.display(),
                "read entities"
            );
            let request = if rebuild {
                ManagementRequest::rebuild(entity_type, entities)
            } else {
                ManagementRequest::build(entity_type, entities)
            };
            println!("{}", manage.call(request).await);
            if manager.save_if_ready(&index_path)? {
                debug!("Saved index to {}", index_path.display());
            }
        }
        IndexCommand::Search {
            query,
            limit,
            threshold,
            entity_type,
        } => {
            let search = SemanticSearchTool::new(Arc::clone(&manager))
                .with_defaults(embeddings.default_limit, embeddings.default_threshold);
            let request = SearchRequest {
                query,
                entity_type,
                limit,
                threshold,
            };
            println!("{}", search.call(request).await);
        }
        IndexCommand::Stats => {
            println!(
                "{}",
                manage
                    .call(ManagementRequest::action(ManagementAction::Stats))
                    .await
            );
        }
        IndexCommand::Clear => {
            println!(
                "{}",
                manage
                    .call(ManagementRequest::action(ManagementAction::Clear))
                    .await
            );
            IndexPaths::new(&index_path).remove()?;
            debug!("Removed index files at {}", index_path.display());
        }
    }

    Ok(())
}

/// Writes a default configuration file unless one already exists.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created, or the
/// configuration cannot be serialized to YAML.
fn init(config_path: &Path) -> Result<(), Box<dyn Error>> {
    if config_path.exists() {
        info!("Config already exists at {}", config_path.display());
        return Ok(());
    }
    if let Some(parent) = config_path.parent() {
        info!("Creating config directory: {}", parent.display());
        fs::create_dir_all(parent)?;
    }
    info!("Creating config file: {}", config_path.display());
    let config_yaml = serde_yaml::to_string(&HubSpotMcpConfig::default())?;
    fs::write(config_path, config_yaml)?;
    println!("Wrote {}", config_path.display());
    Ok(())
}
