mod config;

use borg::{
    AppState,
    auth::{CredentialRewriter, TokenCipher},
    build_metrics_layer_and_handle, build_metrics_router, build_router,
    discovery::start_discovery,
    registry::Registry,
    settings::ProxySettings,
    static_loader::load_static,
};
use clap::Parser as _;
use config::Config;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!(
        config = %config.config.display(),
        port = config.port,
        metrics = config.metrics,
        "Starting borg"
    );

    let mut settings = ProxySettings::from_file(&config.config).await?;
    if let Some(key) = &config.auth_key {
        settings.auth_key = Some(key.clone());
    }

    // Static backends are registered before anything can read the registry.
    let registry = Registry::new();
    let loaded = load_static(&settings.instances, &registry)?;
    info!("Registered {loaded} static backends");

    let cipher = settings
        .auth_key()
        .map(TokenCipher::from_base64)
        .transpose()?;
    if cipher.is_none() {
        warn!("No auth_key configured, caller credentials are not verified");
    }
    let rewriter = CredentialRewriter::new(
        cipher,
        settings.auth_prefix.clone(),
        settings.require_token,
    );

    let pool = config.pool_config();
    let shutdown = CancellationToken::new();

    let poller = start_discovery(&settings, pool, registry.clone(), shutdown.clone()).await;

    let app_state = AppState::new(registry, rewriter, &settings.dispatch, pool);
    let mut router = build_router(app_state);

    if config.metrics {
        let (prometheus_layer, handle) =
            build_metrics_layer_and_handle(config.metrics_prefix.clone());
        router = router.layer(prometheus_layer);

        let metrics_addr = format!("{}:{}", config.host, config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr).await?;
        info!("Metrics listening on {}", metrics_addr);
        let metrics_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, build_metrics_router(handle))
                .with_graceful_shutdown(metrics_shutdown.cancelled_owned())
                .await
            {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Borg listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Some(poller) = poller {
        poller.await?;
    }
    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM and cancels `shutdown`.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
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
    shutdown.cancel();
}
