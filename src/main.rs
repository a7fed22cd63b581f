//! pgrls command line
//!
//! Validates policy declarations and prints the DDL reconciliation would
//! issue, without touching a database.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pgrls::catalog::POLICIES_SQL;
use pgrls::common::memory::MemorySession;
use pgrls::common::RlsConfig;
use pgrls::RowSecurity;

#[derive(Parser, Debug)]
#[command(name = "pgrls")]
#[command(about = "PostgreSQL row level security from declarative policies", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "pgrls.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate and compile policy declarations
    Check {
        /// Policy declaration file
        policies: PathBuf,

        /// Print compiled policies as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the DDL reconciliation would issue against an empty catalog
    Plan {
        /// Policy declaration file
        policies: PathBuf,
    },
}

fn load(args: &Args, policies: &Path) -> anyhow::Result<RowSecurity> {
    let config = if args.config.exists() {
        RlsConfig::load(&args.config)?
    } else {
        info!("Using default configuration");
        RlsConfig::default()
    };
    let rls = RowSecurity::new(config)?;
    let entities = rls.load_declarations(policies)?;
    info!(entities, "Declarations registered");
    Ok(rls)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    match &args.command {
        Command::Check { policies, json } => {
            let rls = load(&args, policies)?;
            let compiled = rls.compile()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&compiled)?);
            } else {
                for entity in rls.registry().entities() {
                    println!(
                        "{} ({}): {} policies",
                        entity.name(),
                        entity.table(),
                        entity.policies().len()
                    );
                    for policy in entity.policies() {
                        let keys: Vec<&str> =
                            policy.context_keys().iter().map(|k| k.as_str()).collect();
                        println!(
                            "  {} {}: reads [{}]",
                            policy.name(),
                            policy.command(),
                            keys.join(", ")
                        );
                    }
                }
                println!("ok: {} policies compiled", compiled.len());
            }
        }
        Command::Plan { policies } => {
            let rls = load(&args, policies)?;
            let compiled = rls.compile()?;
            let mut session = MemorySession::new();
            rls.catalog().reconcile(&mut session, &rls.tables(), &compiled)?;
            for sql in session.ddl().into_iter().filter(|sql| *sql != POLICIES_SQL) {
                println!("{sql};");
            }
        }
    }

    Ok(())
}
