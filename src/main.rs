use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use huddle_core::PrincipalId;
use huddle_engine::{RoomConfig, RoomService};
use huddle_server::{JwtAuthenticator, ServerConfig};
use huddle_settings::{HuddleSettings, SettingsOverrides, StoreBackend};
use huddle_store::{Database, MemoryGateway, PersistenceGateway, SqliteGateway};
use huddle_telemetry::TelemetryConfig;

/// Real-time room server.
#[derive(Parser)]
#[command(name = "huddle", version)]
struct Cli {
    /// Settings file. Defaults to ~/.huddle/settings.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (default).
    Serve(ServeArgs),
    /// Print a signed token for a user.
    Token {
        #[arg(long)]
        user: String,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, value_enum)]
    store: Option<Backend>,
    #[arg(long)]
    sqlite_path: Option<PathBuf>,
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long)]
    json_logs: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Memory,
    Sqlite,
}

impl ServeArgs {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            host: self.host.clone(),
            port: self.port,
            store_backend: self.store.map(|b| match b {
                Backend::Memory => StoreBackend::Memory,
                Backend::Sqlite => StoreBackend::Sqlite,
            }),
            sqlite_path: self.sqlite_path.clone(),
            log_level: self.log_level.clone(),
            json_logs: self.json_logs.then_some(true),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(huddle_settings::settings_path);

    match cli.command {
        Some(Command::Token { user }) => {
            let settings = match &cli.config {
                Some(path) => huddle_settings::load_settings_from_path(path)?,
                None => huddle_settings::load_settings()?,
            };
            let token = authenticator(&settings).issue(&PrincipalId::from_raw(user))?;
            println!("{token}");
            Ok(())
        }
        Some(Command::Serve(args)) => serve(&path, &args).await,
        None => serve(&path, &cli.serve).await,
    }
}

async fn serve(path: &std::path::Path, args: &ServeArgs) -> anyhow::Result<()> {
    let settings = huddle_settings::load(
        huddle_settings::figment(path, huddle_settings::ENV_PREFIX),
        &args.overrides(),
    )
    .with_context(|| format!("loading settings from {}", path.display()))?;

    let telemetry = huddle_telemetry::init_telemetry(TelemetryConfig {
        log_level: huddle_telemetry::parse_level(&settings.logging.level).unwrap_or(tracing::Level::INFO),
        json: settings.logging.json,
        ..Default::default()
    });
    tracing::debug!(
        filter = telemetry.filter(),
        from_env = telemetry.filter_from_env(),
        installed = telemetry.installed(),
        "Logging configured"
    );

    tracing::info!("Starting huddle server");
    if settings.auth.uses_dev_secret() {
        tracing::warn!("Using the built-in development JWT secret; set auth.jwt_secret for real deployments");
    }

    let gateway: Arc<dyn PersistenceGateway> = match settings.store.backend {
        StoreBackend::Memory => Arc::new(MemoryGateway::new()),
        StoreBackend::Sqlite => {
            let db = Database::open(&settings.store.sqlite_path)
                .with_context(|| format!("opening {}", settings.store.sqlite_path.display()))?;
            Arc::new(SqliteGateway::new(db))
        }
    };

    let service = Arc::new(RoomService::new(
        gateway,
        RoomConfig {
            event_buffer: settings.rooms.event_buffer,
            max_active_rooms: settings.rooms.max_active_rooms,
            bridge_shutdown_timeout: settings.rooms.bridge_shutdown_timeout(),
        },
    ));

    let config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        max_send_queue: settings.server.max_send_queue,
        heartbeat_interval: settings.server.heartbeat_interval(),
        cleanup_interval: Duration::from_secs(60),
    };
    let handle = huddle_server::start(config, Arc::clone(&service), Arc::new(authenticator(&settings)))
        .await
        .context("starting server")?;

    tracing::info!(port = handle.port, backend = ?settings.store.backend, "Huddle server ready");

    tokio::signal::ctrl_c().await.context("listening for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    service.shutdown();
    Ok(())
}

fn authenticator(settings: &HuddleSettings) -> JwtAuthenticator {
    JwtAuthenticator::new(
        &settings.auth.jwt_secret,
        settings.auth.issuer.clone(),
        settings.auth.token_ttl_secs,
    )
}
