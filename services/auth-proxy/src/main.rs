use std::sync::Arc;

use anyhow::{Context, Result};
use cluster_gate_auth_proxy::config::ProxyConfig;
use cluster_gate_auth_proxy::proxy::{Proxy, Reviewers};
use cluster_gate_auth_proxy::server::ProxyServer;
use cluster_gate_auth_proxy::shutdown::ShutdownHooks;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ProxyConfig::from_env().context("Failed to load configuration")?;

    init_tracing(&config.log_level);

    info!("cluster-gate-auth-proxy starting");
    info!(
        upstream = %config.upstream.url,
        tls = config.serving.tls_cert_path.is_some(),
        audit = config.audit.is_enabled(),
        "Configuration loaded"
    );

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    let config = Arc::new(config);
    let hooks = ShutdownHooks::new();

    let proxy = Proxy::new(Arc::clone(&config), Reviewers::default(), &hooks)
        .await
        .context("Failed to construct proxy")?;
    let proxy = Arc::new(proxy);

    let audit = proxy.audit();
    let (stop_audit, audit_stopped) = oneshot::channel::<()>();
    let audit_task = tokio::spawn(async move {
        let stop = async {
            let _ = audit_stopped.await;
        };
        if let Err(e) = audit.run(stop).await {
            error!("Audit backend stopped: {}", e);
        }
    });

    let server = ProxyServer::new(Arc::clone(&config), proxy).context("Failed to create proxy server")?;
    let served = server.run(shutdown_signal()).await;
    if let Err(ref e) = served {
        error!("Server error: {:#}", e);
    }

    // Delivery must stop before the audit hook drains what is left.
    let _ = stop_audit.send(());
    if let Err(e) = audit_task.await {
        warn!("Audit task ended abnormally: {}", e);
    }

    if let Err(e) = hooks.run_pre_shutdown_hooks().await {
        error!("Pre-shutdown hooks failed: {}", e);
    }

    info!("cluster-gate-auth-proxy stopped");
    served
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(true)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
