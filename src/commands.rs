//! This module defines the command-line interface for `hsmcp` using `clap`.
//!
//! It provides a [`Cli`] struct that represents the parsed command-line arguments,
//! and a [`Commands`] enum with the available subcommands and their options.
//!
//! # Examples
//!
//! ```no_run
//! use clap::Parser;
//! use hubspot_mcp::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Init => println!("writing default config"),
//!     Commands::Index(command) => println!("running {command:?}"),
//! }
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::entity::EntityType;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Config file to use instead of `<config_dir>/config.yaml`.
    #[arg(long, short = 'c', global = true, env = "HSMCP_CONFIG")]
    pub config: Option<PathBuf>,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Write a default configuration file.
    Init,

    #[command(flatten)]
    Index(IndexCommand),
}

/// Subcommands that operate on the saved embedding index.
#[derive(Subcommand, Debug)]
pub enum IndexCommand {
    /// Embed CRM entities from a JSON file and add them to the index.
    ///
    /// The file holds either an array of `{id, properties}` records or a
    /// HubSpot list response with a `results` array.
    #[clap(name = "build", alias = "b")]
    Build {
        #[arg(long, short = 'e')]
        entity_type: EntityType,

        #[arg(long, short = 'i')]
        input: PathBuf,

        /// Replace every indexed entity of this type instead of appending.
        #[arg(long)]
        rebuild: bool,
    },

    /// Find the entities most similar to a query.
    #[clap(name = "search", alias = "s")]
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(short = 'k', long)]
        limit: Option<usize>,

        /// Minimum similarity score in `(0, 1]`.
        #[arg(short = 't', long)]
        threshold: Option<f32>,

        #[arg(long, short = 'e')]
        entity_type: Option<EntityType>,
    },

    /// Show index status and counts.
    Stats,

    /// Drop the index and its cache, including the files on disk.
    Clear,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_build_with_rebuild_flag() {
        let cli = Cli::parse_from([
            "hsmcp", "build", "--entity-type", "Deals", "--input", "deals.json", "--rebuild",
        ]);
        match cli.command {
            Commands::Index(IndexCommand::Build {
                entity_type,
                input,
                rebuild,
            }) => {
                assert_eq!(entity_type, EntityType::Deals);
                assert_eq!(input, PathBuf::from("deals.json"));
                assert!(rebuild);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_search_options_and_global_config() {
        let cli = Cli::parse_from([
            "hsmcp", "search", "fintech in Berlin", "-k", "3", "-t", "0.4", "-e", "companies",
            "--config", "/tmp/hsmcp.yaml",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/hsmcp.yaml")));
        match cli.command {
            Commands::Index(IndexCommand::Search {
                query,
                limit,
                threshold,
                entity_type,
            }) => {
                assert_eq!(query, "fintech in Berlin");
                assert_eq!(limit, Some(3));
                assert_eq!(threshold, Some(0.4));
                assert_eq!(entity_type, Some(EntityType::Companies));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn init_and_index_commands_share_one_level() {
        assert!(matches!(Cli::parse_from(["hsmcp", "init"]).command, Commands::Init));
        assert!(matches!(
            Cli::parse_from(["hsmcp", "clear"]).command,
            Commands::Index(IndexCommand::Clear)
        ));
        assert!(matches!(
            Cli::parse_from(["hsmcp", "s", "acme"]).command,
            Commands::Index(IndexCommand::Search { .. })
        ));
    }

    #[test]
    fn rejects_unknown_entity_type() {
        assert!(Cli::try_parse_from(["hsmcp", "build", "-e", "tickets", "-i", "x.json"]).is_err());
    }
}
