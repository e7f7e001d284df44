use anyhow::{Context, Result};
use filterproxy::{EngineCallbacks, EngineConfig, FilteringEngine};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FILTER_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { tokio::signal::ctrl_c().await };

    #[cfg(unix)]
    let terminate = async {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        term.recv().await;
        Ok::<_, std::io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    tokio::select! {
        res = ctrl_c => {
            res.context("Failed to install Ctrl+C handler")?;
            info!("Received Ctrl+C");
        }
        res = terminate => {
            res.context("Failed to install SIGTERM handler")?;
            info!("Received SIGTERM");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();

    let config = EngineConfig::from_env().context("Failed to load configuration")?;
    let filter_lists = config.filter_lists.clone();
    let trigger_lists = config.trigger_lists.clone();

    let engine = FilteringEngine::new(config, EngineCallbacks::default())
        .context("Failed to create filtering engine")?;

    for source in &filter_lists {
        match engine.load_filtering_list_from_file(&source.path, source.category, false) {
            Ok(_) => engine.set_category_enabled(source.category, true),
            Err(e) => warn!(path = %source.path.display(), error = %e, "Skipping filter list"),
        }
    }
    for source in &trigger_lists {
        match engine.load_text_triggers_from_file(&source.path, source.category, false) {
            Ok(_) => engine.set_category_enabled(source.category, true),
            Err(e) => warn!(path = %source.path.display(), error = %e, "Skipping trigger list"),
        }
    }

    let ca_export = std::env::var("FILTER_CA_EXPORT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("filterproxy-root-ca.pem"));
    std::fs::write(&ca_export, engine.root_certificate_pem())
        .with_context(|| format!("Failed to write root CA to {}", ca_export.display()))?;
    info!(path = %ca_export.display(), "Root CA written; install it as a trusted root in clients");

    engine.start().context("Failed to start filtering engine")?;
    info!(
        http_port = engine.http_listener_port(),
        https_port = engine.https_listener_port(),
        "filterd running"
    );

    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;
    signals.block_on(shutdown_signal())?;
    drop(signals);

    engine.stop();
    info!("filterd stopped");
    Ok(())
}
