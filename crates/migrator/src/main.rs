//! Operator entry point for schema migrations.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use migrator::{
    DirectoryMigrations, EmbeddedMigrations, MigrationSource, PostgresMigrationBackend,
    SchemaMigrator,
};
use storage::StorageConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Applies, reverts and inspects the order store schema.
#[derive(Parser, Debug)]
#[command(name = "migrate", version, about, long_about = None)]
struct Cli {
    /// PostgreSQL connection string.
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Read migrations from this directory instead of the embedded set.
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending migrations.
    Up {
        /// How many to apply; 0 applies all pending.
        #[arg(long, default_value_t = 0)]
        steps: i64,
    },
    /// Revert the most recently applied migrations.
    Down {
        /// How many to revert; 0 reverts one.
        #[arg(long, default_value_t = 1)]
        steps: i64,
    },
    /// Print the current version and the number of applied migrations.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "migration command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = StorageConfig::from_env();
    let database_url = resolve_database_url(cli.database_url, &config)
        .ok_or("--database-url or DATABASE_URL is required")?;

    let source: Box<dyn MigrationSource> = match cli.dir {
        Some(dir) => Box::new(DirectoryMigrations::new(dir)),
        None => Box::new(EmbeddedMigrations),
    };

    let pool = config.pool_options().connect(&database_url).await?;
    let migrator = SchemaMigrator::new(PostgresMigrationBackend::new(pool.clone()), source.as_ref())?;

    match cli.command {
        Commands::Up { steps } => {
            let applied = migrator.migrate_up(steps).await?;
            tracing::info!(applied, "migrate up finished");
        }
        Commands::Down { steps } => {
            let reverted = migrator.migrate_down(steps).await?;
            tracing::info!(reverted, "migrate down finished");
        }
        Commands::Status => {
            let status = migrator.status().await?;
            println!(
                "version={} applied={} pending={}",
                status.current_version, status.applied_count, status.pending_count
            );
        }
    }

    pool.close().await;
    Ok(())
}

/// The command line wins over the environment-loaded configuration.
fn resolve_database_url(flag: Option<String>, config: &StorageConfig) -> Option<String> {
    flag.filter(|url| !url.is_empty())
        .or_else(|| config.database_url.clone())
}
