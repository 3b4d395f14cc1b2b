use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use wakegate::admin::{AdminServer, PKG_NAME, VERSION};
use wakegate::composer::Presentation;
use wakegate::config::Config;
use wakegate::control_plane::PterodactylClient;
use wakegate::engine::DecisionEngine;
use wakegate::gate::StartGate;
use wakegate::probe::ListPingProbe;
use wakegate::server::GatewayServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("wakegate=debug".parse()?),
        )
        .init();

    // Optional TOML file; the environment overrides it
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    match &config_path {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("Configuration loaded from environment"),
    }

    print_startup_banner(&config);

    let gateway_addr = config.gateway.bind_addr()?;

    let control_plane = PterodactylClient::new(&config.control_plane)?;
    let probe = ListPingProbe::from_config(&config.backend);
    let engine = Arc::new(
        DecisionEngine::new(
            Arc::new(control_plane),
            Arc::new(probe),
            StartGate::new(config.gateway.start_cooldown()),
            config.backend.public_address(),
        )
        .with_presentation(Presentation {
            version_name: config.gateway.version_name.clone(),
            max_players: config.gateway.max_players,
        }),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bind before spawning so a taken port fails startup
    let gateway = GatewayServer::new(gateway_addr, Arc::clone(&engine), shutdown_rx.clone())
        .with_client_timeout(config.gateway.client_timeout())
        .bind()
        .await
        .map_err(|e| {
            error!(addr = %gateway_addr, error = %e, "Failed to bind gateway listener");
            e
        })?;

    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.serve().await {
            error!(error = %e, "Gateway server error");
        }
    });

    let admin_handle = match config.admin.port {
        Some(port) => {
            let admin_addr = SocketAddr::from(([127, 0, 0, 1], port));
            let admin_token = config.admin.token.clone().unwrap_or_else(|| {
                let token = uuid::Uuid::new_v4().to_string();
                info!(token = %token, "Generated admin API token (set ADMIN_TOKEN to use a fixed value)");
                token
            });
            let admin_server =
                AdminServer::new(admin_addr, Arc::clone(&engine), shutdown_rx.clone(), admin_token);

            Some(tokio::spawn(async move {
                if let Err(e) = admin_server.run().await {
                    error!(error = %e, "Admin server error");
                }
            }))
        }
        None => None,
    };

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = gateway_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.gateway.bind,
        port = config.gateway.port,
        admin_port = ?config.admin.port,
        client_timeout_secs = config.gateway.client_timeout_secs,
        "Listener configuration"
    );
    info!(
        panel = %config.control_plane.base_url,
        server_id = %config.control_plane.server_id,
        request_timeout_secs = config.control_plane.request_timeout_secs,
        "Control plane"
    );
    info!(
        host = %config.backend.host,
        port = config.backend.port,
        public_address = %config.backend.public_address(),
        probe_timeout_ms = config.backend.probe_timeout_ms,
        "Game server"
    );
    info!(
        start_cooldown_secs = config.gateway.start_cooldown_secs,
        max_players = config.gateway.max_players,
        version_name = %config.gateway.version_name,
        "Start gate and presentation"
    );
    if !config.backend.online_mode {
        warn!("MINECRAFT_SERVER_ONLINE_MODE=false has no effect on the gateway");
    }
}
