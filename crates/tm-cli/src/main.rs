use std::io;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tm_cli::commands::{events, import, notify, purchases, sessions, status, timesheets};
use tm_cli::sink::sink_for;
use tm_cli::{Cli, Commands, Config, error_code};
use tm_core::{Actor, UserId};
use tm_db::Database;

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = Database::open_with(&config.database_path, config.busy_timeout())
        .with_context(|| format!("failed to open {}", config.database_path.display()))?
        .with_notification_attempts(config.notification_max_attempts);
    Ok((db, config))
}

fn resolve_actor(db: &Database, as_user: Option<&str>) -> Result<Actor> {
    let id = as_user.context("this command needs --as <USER_ID>")?;
    Ok(db.actor(&UserId::new(id)?)?)
}

/// Hands notices queued by the command to the configured channel.
///
/// Delivery failures stay in the outbox for `tm notify`.
fn flush_notifications(db: &mut Database, config: &Config) {
    let sink = sink_for(config);
    if let Err(err) = db.dispatch_notifications(sink.as_ref()) {
        tracing::warn!(error = %err, "notification dispatch failed");
    }
}

fn run(cli: &Cli) -> Result<()> {
    let Some(command) = &cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let mut stdout = io::stdout().lock();
    let (mut db, config) = open_database(cli.config.as_deref())?;
    match command {
        Commands::Status => status::run(&mut stdout, &db, &config)?,
        Commands::Import => {
            import::run(io::stdin().lock(), &mut stdout, &mut db, &config)?;
        }
        Commands::Notify => {
            let sink = sink_for(&config);
            notify::run(&mut stdout, &mut db, sink.as_ref())?;
        }
        Commands::Purchase { id, json } => {
            let actor = resolve_actor(&db, cli.as_user.as_deref())?;
            purchases::run(&mut stdout, &db, &actor, id, *json)?;
        }
        Commands::Events(action) => {
            let actor = resolve_actor(&db, cli.as_user.as_deref())?;
            events::run(&mut stdout, &mut db, &actor, action)?;
            flush_notifications(&mut db, &config);
        }
        Commands::Sessions(action) => {
            let actor = resolve_actor(&db, cli.as_user.as_deref())?;
            sessions::run(&mut stdout, &mut db, &actor, action)?;
            flush_notifications(&mut db, &config);
        }
        Commands::Timesheets(action) => {
            let actor = resolve_actor(&db, cli.as_user.as_deref())?;
            timesheets::run(&mut stdout, &mut db, &actor, action)?;
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panic if tracing is already initialized (e.g., in tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error[{}]: {err:#}", error_code(&err));
            ExitCode::FAILURE
        }
    }
}
