//! ebook-bridge entry point.

use clap::Parser;
use ebook_bridge::{
    AppError,
    auth::AuthService,
    config::{Cli, Command, Config, LibraryCommand, UserCommand},
    db::{Database, migrate::INITIAL_SCRIPT},
    library::CoverStore,
    router,
    watcher::{self, Ingestor, Watcher, remote::RemoteSource},
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Find or load config
    let mut config = match Config::resolve(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return Ok(report(Err(e))),
    };
    config.apply_env();

    let long_lived = matches!(cli.command, Command::Watch { .. } | Command::WatchS3);
    init_tracing(if long_lived {
        "ebook_bridge=info"
    } else {
        "ebook_bridge=warn"
    });

    // Handle command
    let result = match cli.command {
        Command::Db { mode } => {
            router::run_db(mode, &config.database.path, io::stdin().lock(), io::stdout().lock())
        }
        Command::S3Stream { key, range } => {
            let mut stdout = tokio::io::stdout();
            router::run_s3_stream(&config, &key, range.as_deref(), &mut stdout)
                .await
                .map(|_| ())
        }
        Command::ServeFile {
            path,
            file_type,
            range,
        } => {
            let mut stdout = tokio::io::stdout();
            router::run_serve_file(&path, file_type, range.as_deref(), &mut stdout)
                .await
                .map(|_| ())
        }
        Command::Migrate { db, script } => {
            let db = db.unwrap_or_else(|| config.database.path.clone());
            router::run_migrate(&db, script.as_deref()).map(|report| {
                println!(
                    "initial: {}, fixup: {} ({} duplicates removed), source columns: {}",
                    report.initial_applied,
                    report.unique_fixup_applied,
                    report.duplicates_removed,
                    report.source_columns_applied
                );
            })
        }
        Command::Watch { library, covers } => return cmd_watch(config, library, covers).await,
        Command::WatchS3 => return cmd_watch_s3(config).await,
        Command::User { action } => return cmd_user(action, &config).map(|()| ExitCode::SUCCESS),
        Command::Library { action } => {
            return cmd_library(action, &config).map(|()| ExitCode::SUCCESS);
        }
    };

    Ok(report(result))
}

/// Print a failed one-shot command in the `error[<kind>]: <message>` form.
fn report(result: Result<(), AppError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            eprintln!("error[{}]: {}", e.kind(), e);
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr; stdout carries protocol output.
fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

/// Open the database and bring its schema up to date.
fn open_database(config: &Config) -> anyhow::Result<Database> {
    let db = Database::open(&config.database.path)?;
    db.migrate(INITIAL_SCRIPT)?;
    Ok(db)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Watch the local library.
async fn cmd_watch(
    mut config: Config,
    library: Option<PathBuf>,
    covers: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    if let Some(path) = library {
        config.library.path = path;
    }
    if let Some(path) = covers {
        config.library.covers_dir = path;
    }

    // Book rows store absolute paths.
    let root = std::fs::canonicalize(&config.library.path).map_err(|e| {
        anyhow::anyhow!(
            "Library path {} is not accessible: {}",
            config.library.path.display(),
            e
        )
    })?;

    let db = open_database(&config)?;
    let ingestor = Ingestor::new(db, CoverStore::new(&config.library.covers_dir));

    tracing::info!(
        library = %root.display(),
        covers = %config.library.covers_dir.display(),
        database = %config.database.path.display(),
        interval_ms = config.scan.interval_ms,
        "Starting library watcher"
    );

    Watcher::new(
        ingestor,
        root,
        Duration::from_millis(config.scan.interval_ms.max(100)),
        config.scan.workers,
    )
    .run(shutdown_signal())
    .await?;

    Ok(ExitCode::SUCCESS)
}

/// Poll the configured bucket.
async fn cmd_watch_s3(config: Config) -> anyhow::Result<ExitCode> {
    let source = match RemoteSource::from_config(&config.s3) {
        Ok(source) => source,
        Err(e) => return Ok(report(Err(e))),
    };

    let db = open_database(&config)?;
    let ingestor = Ingestor::new(db, CoverStore::new(&config.library.covers_dir));

    tracing::info!(
        bucket = config.s3.bucket.as_deref().unwrap_or_default(),
        prefix = config.s3.prefix.as_deref().unwrap_or_default(),
        interval_secs = config.s3.poll_interval_secs,
        "Starting remote watcher"
    );

    watcher::remote::run(
        source,
        ingestor,
        Duration::from_secs(config.s3.poll_interval_secs.max(1)),
        shutdown_signal(),
    )
    .await;

    Ok(ExitCode::SUCCESS)
}

/// User management commands.
fn cmd_user(action: UserCommand, config: &Config) -> anyhow::Result<()> {
    let auth = AuthService::new(open_database(config)?);

    match action {
        UserCommand::Add {
            email,
            password,
            role,
            name,
        } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("Password: ")?,
            };

            let user = auth.create_user(&email, &password, &role, name.as_deref())?;
            println!(
                "Created user: {} (role: {}, id: {})",
                user.email, user.role, user.id
            );
        }

        UserCommand::List => {
            let users = auth.list_users()?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!("{:<32} {:<10} {:<36} CREATED", "EMAIL", "ROLE", "ID");
                println!("{}", "-".repeat(96));
                for user in users {
                    let created = chrono::DateTime::from_timestamp(user.created_at, 0)
                        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    println!(
                        "{:<32} {:<10} {:<36} {}",
                        user.email, user.role, user.id, created
                    );
                }
            }
        }
    }

    Ok(())
}

/// Library maintenance commands.
fn cmd_library(action: LibraryCommand, config: &Config) -> anyhow::Result<()> {
    let db = open_database(config)?;

    match action {
        LibraryCommand::Clear => {
            let ingestor = Ingestor::new(db.clone(), CoverStore::new(&config.library.covers_dir));
            let books = db.get_all_books()?;
            for book in &books {
                ingestor.remove(book)?;
            }
            let version = db.bump_library_version()?;
            println!("Removed {} books (library version {})", books.len(), version);
        }

        LibraryCommand::Version => {
            println!("{}", db.library_version()?);
        }
    }

    Ok(())
}

/// Prompt for password input.
fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut password = String::new();
    io::stdin().read_line(&mut password)?;

    Ok(password.trim().to_string())
}
