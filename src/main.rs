//! Fleet Runner daemon entry point.
//!
//! Startup order: logging, config, database (with migrations), remote client,
//! maintenance-mode wait, user bootstrap, system topology load, coordinator.
//! The process then blocks until SIGINT or SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn, Level};

use fleet_runner::client::Client;
use fleet_runner::error::ClientError;
use fleet_runner::{config::Config, coordinator, db};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("starting fleet-runner...");

    let config = Arc::new(Config::from_env()?);

    let pool = db::connect(&config.postgres_url).await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("unable to migrate database")?;

    if config.enable_reset {
        warn!("ENABLE_RESET is set, wiping all daemon tables");
        db::reset(&pool).await?;
    }

    let client = Client::new()?;

    match client.get_my_ip_address().await {
        Ok(resp) => info!(ip = %resp.ip, "external ip address"),
        Err(err) => warn!(%err, "unable to determine external ip address"),
    }

    // The game goes down for maintenance periodically; wait it out here
    // rather than letting the bootstrap fail.
    loop {
        match client.get_game_status().await {
            Ok(status) => {
                info!(status = %status.status, "game is up");
                break;
            }
            Err(ClientError::MaintenanceMode) => {
                info!("game is in maintenance mode, checking again in 60s");
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            }
            Err(err) => return Err(err).context("unable to get game status"),
        }
    }

    let (user, authorized) = coordinator::initialize_user(&pool, &client, &config).await?;
    info!(
        username = %user.username,
        credits = user.credits,
        ships = user.ships.len(),
        "user initialized"
    );

    // Route evaluation needs every location's coordinates before any agent
    // starts flying.
    let system = authorized
        .get_system(&config.system)
        .await
        .context("unable to get system")?;
    db::save_system(&pool, &system.system.symbol, &system.system.name).await?;

    let system_locations = authorized
        .get_system_locations(&config.system)
        .await
        .context("unable to get system locations")?
        .locations;

    for location in &system_locations {
        db::save_location(
            &pool,
            &config.system,
            &location.symbol,
            &location.name,
            &location.location_type,
            location.x,
            location.y,
        )
        .await?;
    }
    info!(count = system_locations.len(), system = %config.system, "system topology persisted");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator = tokio::spawn(coordinator::run(
        user,
        authorized,
        pool.clone(),
        config.clone(),
        system_locations,
        shutdown_rx,
    ));

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("caught SIGINT, exiting"),
        _ = sigterm.recv() => info!("caught SIGTERM, exiting"),
    }

    shutdown_tx.send(true).ok();
    coordinator.await.context("coordinator task panicked")??;

    Ok(())
}
