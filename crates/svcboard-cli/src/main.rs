use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use svcboard_core::FormConfiguration;
use svcboard_storage::{ListingService, PgListingStore};
use svcboard_web::auth::hash_password;
use svcboard_web::WebConfig;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "svcboard-cli")]
#[command(about = "Civic service opportunity board")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server (default).
    Serve,
    /// Apply database migrations to DATABASE_URL.
    Migrate,
    /// Print an argon2 hash for ADMIN_PASSWORD_HASH or the admin accounts table.
    HashPassword {
        #[arg(long)]
        password: String,
    },
    /// Write every stored listing to one CSV file.
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Store an admin account with a hashed password.
    CreateAdmin {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
}

fn init_logging(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"));
    let builder = fmt().with_env_filter(env_filter).with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
}

async fn connect_database(config: &WebConfig) -> Result<PgListingStore> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set for this command")?;
    let store = PgListingStore::connect(url).await?;
    store.migrate().await?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.log_json);
    let config = WebConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => svcboard_web::serve(config).await?,
        Commands::Migrate => {
            connect_database(&config).await?;
            println!("migrations applied");
        }
        Commands::HashPassword { password } => {
            println!("{}", hash_password(&password)?);
        }
        Commands::Export { out } => {
            let store = connect_database(&config).await?;
            let service = ListingService::new(
                Arc::new(store),
                FormConfiguration::new(Local::now().date_naive()),
            );
            let export = service.export_everything(Utc::now()).await?;
            let path = out.unwrap_or_else(|| PathBuf::from(&export.filename));
            tokio::fs::write(&path, &export.body)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), bytes = export.body.len(), "export written");
            println!("export written: {}", path.display());
        }
        Commands::CreateAdmin { username, password } => {
            let store = connect_database(&config).await?;
            let id = store
                .upsert_admin_account(username.trim(), &hash_password(&password)?)
                .await?;
            println!("admin account ready: id={id} username={}", username.trim());
        }
    }

    Ok(())
}
