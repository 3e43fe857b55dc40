use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cloudfn::cli::Args;
use cloudfn::server::{create_router, AppState};
use cloudfn::settings::{load_settings_file, Settings};
use cloudfn::store::MemoryStore;
use cloudfn::substrate::RestSubstrate;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    // Resolve settings: file, then environment, then CLI flags
    let mut settings = match args.settings {
        Some(ref path) => match load_settings_file(path) {
            Ok(settings) => settings,
            Err(e) => {
                error!("Failed to load settings file {}: {}", path.display(), e);
                process::exit(1);
            }
        },
        None => Settings::default(),
    };
    settings.apply_env_overrides();
    if let Some(bind_addr) = args.bind_addr {
        settings.bind_addr = bind_addr;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }

    let substrate = match RestSubstrate::new(&settings) {
        Ok(substrate) => Arc::new(substrate),
        Err(e) => {
            error!("Failed to build substrate client: {}", e);
            process::exit(1);
        }
    };

    let addr = format!("{}:{}", settings.bind_addr, settings.port);
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(settings, store.clone(), store, substrate);

    if let Err(e) = state.lifecycle.ensure_namespace().await {
        error!("Failed to ensure substrate namespace: {}", e);
        process::exit(1);
    }

    info!("Starting cloudfn on {}", addr);

    let app = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  POST   /function/{{projectId}}                    - Create a function");
    info!("  POST   /function/{{projectId}}/{{codeId}}/build    - Build its image");
    info!("  POST   /function/{{projectId}}/{{codeId}}/deploy   - Deploy it");
    info!("  ANY    /serve/{{functionId}}/...                  - Invoke it");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        process::exit(1);
    }

    info!("Shut down cleanly");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install SIGINT handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
