use anyhow::{Context, Result};
use lab_api::{create_app, start_janitor_task, AppState, Config};
use lab_network::dns::{TechnitiumConfig, TechnitiumController};
use lab_network::firewall::{SophosConfig, SophosFirewall};
use lab_orchestrator::db::{backup_database, create_pool, run_migrations};
use lab_orchestrator::Provisioner;
use lab_provider::HypervisorRegistry;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = lab_logging::init_subscriber();

    info!("Starting lab-api service...");

    let config = Config::from_env()?;
    info!(
        bind_addr = %config.bind_addr,
        db_path = %config.db_path.display(),
        hypervisors = ?config.hypervisors,
        "Configuration loaded"
    );

    if let Some(backup) = backup_database(&config.db_path)? {
        info!("Database backed up to: {}", backup.display());
    }

    let pool = create_pool(&config.db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let hypervisors = HypervisorRegistry::from_env(&config.hypervisors)
        .context("Failed to configure hypervisor backends")?;
    let firewall = SophosFirewall::new(SophosConfig::from_env()?)
        .context("Failed to configure the firewall controller")?;
    let dns = TechnitiumController::new(TechnitiumConfig::from_env()?)
        .context("Failed to configure the DNS controller")?;

    let provisioner = Provisioner::new(
        pool,
        hypervisors,
        Arc::new(firewall),
        Arc::new(dns),
        config.provisioner_settings(),
    );

    tokio::spawn(start_janitor_task(
        provisioner.clone(),
        config.janitor_interval_secs,
    ));
    info!(
        "Janitor task started (interval: {}s)",
        config.janitor_interval_secs
    );

    let app = create_app(AppState::new(provisioner));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
