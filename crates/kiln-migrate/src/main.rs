//! Upgrade a kiln job database to the current schema version.
//!
//! The live database is never modified in place: it is cloned, migrated
//! stepwise, integrity-checked, and swapped in, with the original kept under
//! a `.backup` name. Exits 0 on success (including an already-current
//! database) and 1 on any failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use kiln_core::db::migrate::{migrate_database, MigrationOutcome};
use kiln_core::db::schema::SCHEMA_VERSION;

#[derive(Parser)]
#[command(name = "kiln-migrate", version, about = "Upgrade a kiln job database")]
struct Cli {
    /// Path to the job database (typically {workspace}/kiln.db)
    database: PathBuf,

    /// Log each migration step
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if !cli.database.exists() {
        eprintln!("kiln-migrate: {} does not exist", cli.database.display());
        return ExitCode::FAILURE;
    }

    match migrate_database(&cli.database) {
        Ok(MigrationOutcome::AlreadyCurrent { version }) => {
            println!("Database is already up to date (schema {version}).");
            ExitCode::SUCCESS
        }
        Ok(MigrationOutcome::Migrated { from, to }) => {
            println!("Migrated database from schema {from} to {to}.");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!(
                "kiln-migrate: failed to reach schema {SCHEMA_VERSION}: {:#}",
                anyhow::Error::new(err)
            );
            ExitCode::FAILURE
        }
    }
}
