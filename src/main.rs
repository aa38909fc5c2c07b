//! deckterm - terminal sessions for the deck IDE
//!
//! Spawns shells on pseudo-terminals, keeps them alive across browser
//! reconnects, and streams them to any number of WebSocket viewers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser as ClapParser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deckterm::{
    api::{self, auth::Credentials},
    config::{self, ConfigError, ServerConfig},
    deck::StaticDecks,
    gateway::Gateway,
    pty::PtySpawner,
    rate_limit::RateLimiter,
    reaper::IdleReaper,
    session::SessionRegistry,
    shell,
    shutdown::ShutdownCoordinator,
    store::{self, JsonDirStore, NullStore, SessionStore, StoreError},
};

/// deckterm - terminal sessions for the deck IDE
#[derive(ClapParser, Debug)]
#[command(name = "deckterm", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/WebSocket server
    Serve {
        /// Address to bind the HTTP/WebSocket API server
        #[arg(long, env = "DECKTERM_BIND", default_value = "127.0.0.1:8787")]
        bind: SocketAddr,

        /// Path to the TOML config file
        #[arg(long, env = "DECKTERM_CONFIG")]
        config: Option<PathBuf>,

        /// Basic-auth username (requires --password)
        #[arg(long, env = "DECKTERM_BASIC_AUTH_USER")]
        user: Option<String>,

        /// Basic-auth password (requires --user)
        #[arg(long, env = "DECKTERM_BASIC_AUTH_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Directory for persisted session records
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Shell to spawn (overrides $SHELL)
        #[arg(long)]
        shell: Option<String>,
    },

    /// Print the shell new terminals would start
    Shell,
}

#[derive(Error, Debug)]
pub enum DecktermError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() -> Result<(), DecktermError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Serve {
            bind,
            config,
            user,
            password,
            state_dir,
            shell,
        } => {
            let mut server_config = load_config(config)?;
            if user.is_some() || password.is_some() {
                server_config.auth.user = user;
                server_config.auth.password = password;
            }
            if state_dir.is_some() {
                server_config.state_dir = state_dir;
            }
            if shell.is_some() {
                server_config.engine.shell = shell;
            }
            server_config.validate()?;
            run_server(bind, server_config).await
        }
        Commands::Shell => {
            let resolved = shell::resolve();
            println!(
                "{} ({})",
                resolved,
                if shell::is_posix_like(&resolved) { "posix" } else { "non-posix" }
            );
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "deckterm=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// An explicit path must exist; the default location is optional.
fn load_config(path: Option<PathBuf>) -> Result<ServerConfig, ConfigError> {
    match path {
        Some(path) => ServerConfig::load(&path)?.ok_or_else(|| {
            ConfigError::ReadFailed(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            )
        }),
        None => match config::default_config_path() {
            Some(path) => Ok(ServerConfig::load(&path)?.unwrap_or_default()),
            None => Ok(ServerConfig::default()),
        },
    }
}

async fn run_server(bind: SocketAddr, server_config: ServerConfig) -> Result<(), DecktermError> {
    tracing::info!("deckterm server starting");

    let decks = Arc::new(StaticDecks::from_decks(server_config.decks.clone()));
    if decks.is_empty() {
        tracing::warn!("no decks configured; every create request will be rejected");
    }
    let engine = server_config.engine.clone();

    let (store, previous): (Arc<dyn SessionStore>, _) = match &server_config.state_dir {
        Some(dir) => {
            let store: Arc<dyn SessionStore> = Arc::new(JsonDirStore::open(dir)?);
            // Processes do not survive a restart; only their last output does.
            let previous = {
                let store = store.clone();
                let decks = decks.clone();
                let limit = engine.buffer_limit;
                tokio::task::spawn_blocking(move || store::reconcile(&*store, &*decks, limit)).await??
            };
            if !previous.is_empty() {
                tracing::info!(count = previous.len(), dir = %dir.display(), "restored terminal records from a previous run");
            }
            (store, previous)
        }
        None => (Arc::new(NullStore) as Arc<dyn SessionStore>, Vec::new()),
    };

    let registry = SessionRegistry::new(engine.clone(), decks, Arc::new(PtySpawner), store);
    registry.restore_previous(previous);
    tracing::info!(shell = %registry.shell(), "resolved default shell");

    let limiter = Arc::new(RateLimiter::new(Duration::from_secs(60)));
    let sweeper = limiter.start();
    let reaper = IdleReaper::start(registry.clone(), engine.reap_interval(), engine.idle_timeout());

    let credentials = server_config
        .credentials()
        .map(|(user, password)| Arc::new(Credentials::new(user, password)));
    if credentials.is_some() {
        tracing::info!("basic auth enabled");
    }

    let shutdown = ShutdownCoordinator::new();
    let state = api::AppState {
        registry: registry.clone(),
        gateway: Gateway::new(registry.clone(), limiter),
        shutdown: shutdown.clone(),
        credentials,
    };
    let app = api::router(
        state,
        api::RouterConfig {
            cors_origins: server_config.cors_origins.clone(),
        },
    );

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP/WS server listening");

    // Oneshot channel for server shutdown (Ctrl+C)
    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
    } else {
        tracing::info!("received Ctrl+C");
    }

    // Signal WebSocket handlers to send close frames
    shutdown.shutdown();
    if !shutdown.wait_for_all_closed(Duration::from_secs(2)).await {
        tracing::warn!(
            remaining = shutdown.active_connections(),
            "some connections did not close in time"
        );
    }
    let _ = server_shutdown_tx.send(());

    match http_handle.await? {
        Ok(()) => {}
        Err(e) => tracing::warn!(error = %e, "HTTP server exited with error"),
    }

    reaper.stop().await;
    sweeper.stop().await;
    let drained = registry.drain();
    registry.flush_store().await;
    tracing::info!(drained, "deckterm server exiting");
    Ok(())
}
