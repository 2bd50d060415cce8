use hostlink_core::{
    ClipboardWatcher, HostServices, MessageRouter, Sandbox, ShellRunner, SystemSpawner,
    host_clipboard,
};
use hostlink_server::{build_app, config::Config};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "hostlink_server=debug,hostlink_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting hostlink server v{}", env!("CARGO_PKG_VERSION"));
    if config.uses_default_token() {
        warn!("SERVER_TOKEN is not set; anyone who knows the default token can connect");
    }

    let sandbox = match Sandbox::new(&config.root_dir) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Invalid sandbox root {:?}: {}", config.root_dir, e);
            std::process::exit(1);
        }
    };
    info!("Sandbox root: {:?}", sandbox.root());
    info!(
        "Shell allowed: {} (whitelist: {:?}), clipboard set allowed: {}",
        config.allow_shell, config.shell_whitelist, config.allow_remote_clipboard_set
    );
    info!("CORS origins: {:?}", config.cors_origins);

    let clipboard = host_clipboard();
    let shell = Arc::new(ShellRunner::new(
        config.shell_policy(),
        Arc::new(SystemSpawner::for_current_platform()),
        sandbox.root().to_path_buf(),
        config.shell_max_concurrent,
    ));
    let services = HostServices {
        sandbox: sandbox.clone(),
        clipboard: clipboard.clone(),
        shell,
    };
    let (relay, _router_task) = MessageRouter::spawn(config.router_config(), services);

    if config.clipboard_watcher {
        ClipboardWatcher::new(clipboard, config.clipboard_poll).spawn(relay.clone());
    }

    let app = build_app(&config, relay, sandbox);

    // Create listener
    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
