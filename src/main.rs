//! # gofi CLI
//!
//! The `gofi` binary runs the collector and provides the client-side tools
//! that feed it.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gofi init` | Create the SQLite catalog and its schema |
//! | `gofi serve` | Run the snapshot receivers and the HTTP catalog view |
//! | `gofi stats` | Print catalog totals and a per-machine breakdown |
//! | `gofi query` | Run a catalog query from the command line |
//! | `gofi import <file>` | Merge a local snapshot file into the catalog |
//! | `gofi scan <root>` | Build a snapshot from a local directory |
//! | `gofi send <file>` | Push a snapshot to a collector |
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`
//! (default `gofi=info`).

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gofi::codec::SnapshotFormat;
use gofi::config;
use gofi::merge;
use gofi::migrate;
use gofi::progress::ProgressMode;
use gofi::query;
use gofi::scan::{self, ScanOptions};
use gofi::server;
use gofi::stats;
use gofi::store::Catalog;
use gofi::transfer;

/// gofi: collect file inventories from many machines into one catalog.
#[derive(Parser)]
#[command(name = "gofi", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gofi.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the catalog schema. Safe to run repeatedly.
    Init,

    /// Run the snapshot receiver, the datagram receiver and the HTTP server.
    Serve,

    /// Show catalog totals and per-machine counts.
    Stats,

    /// Query the catalog with the same parameters the HTTP view accepts.
    Query {
        /// Query parameters as `key=value` pairs (limit, order_by, order,
        /// filetype, machine, filemime).
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// Print the full view as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Merge a local snapshot file into the catalog.
    Import {
        /// Snapshot file (SQLite or JSON).
        file: PathBuf,

        /// Progress output on stderr.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Build a snapshot of a local directory tree. Needs no config file.
    Scan {
        /// Directory to scan.
        root: PathBuf,

        /// Output snapshot path.
        #[arg(long)]
        out: PathBuf,

        /// Machine name recorded on every entry.
        #[arg(long)]
        machine: String,

        /// Address recorded on every entry.
        #[arg(long)]
        ip: String,

        /// Snapshot shape.
        #[arg(long, value_enum, default_value = "sqlite")]
        format: FormatArg,

        /// Mark entries as living on this external device.
        #[arg(long)]
        external: Option<String>,

        /// Glob patterns (relative to root) to skip.
        #[arg(long = "exclude")]
        exclude_globs: Vec<String>,

        /// Follow symbolic links.
        #[arg(long)]
        follow_symlinks: bool,

        /// Record a SHA-256 of each file's contents.
        #[arg(long)]
        hash: bool,
    },

    /// Send a snapshot file to a collector. Needs no config file.
    Send {
        /// Snapshot file to send.
        file: PathBuf,

        /// Collector address.
        #[arg(long, default_value = "127.0.0.1:1985")]
        addr: String,

        /// Name announced in the transfer header (defaults to the file name).
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Sqlite,
    Json,
}

impl From<FormatArg> for SnapshotFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Sqlite => SnapshotFormat::Relational,
            FormatArg::Json => SnapshotFormat::FlatList,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

/// Parse a `key=value` pair for `--param` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gofi=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    match cli.command {
        Commands::Scan {
            root,
            out,
            machine,
            ip,
            format,
            external,
            exclude_globs,
            follow_symlinks,
            hash,
        } => {
            let options = ScanOptions {
                root,
                machine,
                ip,
                external,
                exclude_globs,
                follow_symlinks,
                hash,
            };
            return scan::run_scan(&options, &out, format.into()).await;
        }
        Commands::Send { file, addr, name } => {
            let size = transfer::send_file(&addr, &file, name.as_deref()).await?;
            println!("sent {} ({} bytes) to {}", file.display(), size, addr);
            return Ok(());
        }
        command => run_with_config(&cli.config, command).await,
    }
}

async fn run_with_config(config_path: &std::path::Path, command: Commands) -> anyhow::Result<()> {
    let cfg = config::load_config(config_path)?;

    match command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Catalog initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Query { params, json } => {
            query::run_query_cmd(&cfg, params, json).await?;
        }
        Commands::Import { file, progress } => {
            let mode = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);
            let catalog = Catalog::open(&cfg).await?;
            let reporter = mode.reporter();
            let summary = merge::import_file(
                &catalog,
                &file,
                reporter.as_ref(),
                cfg.merge.progress_every,
            )
            .await;
            catalog.close().await;
            let summary = summary?;

            println!("import {}", file.display());
            println!("  processed: {}", summary.processed);
            println!("  inserted: {}", summary.inserted);
            println!("  already known: {}", summary.skipped);
            println!("  rejected: {}", summary.rejected);
            println!("ok");
        }
        Commands::Scan { .. } | Commands::Send { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
