//! Vararray Worker main executable

pub mod common;
pub mod err;
pub mod export;
pub mod meta;
pub mod query;
pub mod storage;

use clap::{Args, Parser, Subcommand};

/// CLI parser based on clap.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Variant array query and export worker",
    long_about = "Queries and exports over columnar variant array workspaces"
)]
struct Cli {
    /// Commonly used arguments
    #[command(flatten)]
    common: common::Args,

    /// The sub command to run
    #[command(subcommand)]
    command: Commands,
}

/// Enum supporting the parsing of top-level commands.
#[derive(Debug, Subcommand)]
enum Commands {
    /// Query-related commands.
    Query(Query),
    /// Export-related commands.
    Export(Export),
}

/// Parsing of "query *" sub commands.
#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct Query {
    /// The sub command to run
    #[command(subcommand)]
    command: QueryCommands,
}

/// Enum supporting the parsing of "query *" sub commands.
#[derive(Debug, Subcommand)]
enum QueryCommands {
    Variants(query::VariantsArgs),
    Calls(query::CallsArgs),
}

/// Parsing of "export *" sub commands.
#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct Export {
    /// The sub command to run
    #[command(subcommand)]
    command: ExportCommands,
}

/// Enum supporting the parsing of "export *" sub commands.
#[derive(Debug, Subcommand)]
enum ExportCommands {
    Vcf(export::vcf::Args),
    Plink(export::plink::Args),
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Build a tracing subscriber according to the configuration in `cli.common`.
    let collector = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(match cli.common.verbose.log_level() {
            Some(level) => match level {
                log::Level::Error => tracing::Level::ERROR,
                log::Level::Warn => tracing::Level::WARN,
                log::Level::Info => tracing::Level::INFO,
                log::Level::Debug => tracing::Level::DEBUG,
                log::Level::Trace => tracing::Level::TRACE,
            },
            None => tracing::Level::INFO,
        })
        .compact()
        .finish();

    // Install collector and go into sub commands.
    tracing::subscriber::with_default(collector, || {
        tracing::info!("vararray-worker {} starting", common::worker_version());
        match &cli.command {
            Commands::Query(query) => match &query.command {
                QueryCommands::Variants(args) => {
                    query::run_variants(&cli.common, args)?;
                }
                QueryCommands::Calls(args) => {
                    query::run_calls(&cli.common, args)?;
                }
            },
            Commands::Export(export) => match &export.command {
                ExportCommands::Vcf(args) => {
                    export::vcf::run(&cli.common, args)?;
                }
                ExportCommands::Plink(args) => {
                    export::plink::run(&cli.common, args)?;
                }
            },
        }

        tracing::info!("All done. Have a nice day!");
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}
