use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;

use gator::commands::{self, Command, Session};
use gator::config::{self, Config, DATABASE_ENV};
use gator::storage::{Database, DatabaseError};

#[derive(Parser, Debug)]
#[command(name = "gator", version, about = "Multi-user RSS/Atom feed aggregator")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so command output on stdout stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gator=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config_dir = config::config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).with_context(|| {
            format!("Failed to create config directory {}", config_dir.display())
        })?;
    }

    // User-only access to the config directory (holds the database)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = config::config_file(&config_dir);
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let db_path = config.resolve_database_path(&config_dir, std::env::var(DATABASE_ENV).ok());
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    tracing::debug!(path = %db_path_str, "Opening database");

    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            anyhow::bail!("The database at {} is locked by another process", db_path_str)
        }
        Err(e) => return Err(e).context("Failed to open database"),
    };

    let mut session = Session::new(db, config, config_path);
    let mut stdout = std::io::stdout().lock();
    commands::execute(&mut session, args.command, &mut stdout).await
}
