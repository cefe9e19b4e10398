//! User coordinator.
//!
//! One per account: bootstraps the user against the remote, spawns a ship
//! agent per ship, consumes agent messages, and applies the fleet policies
//! (buy ships while cash permits, pay down loans past a threshold). The
//! coordinator is the only writer of `user.credits` and `user.ships`.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::client::{AuthorizedClient, Client};
use crate::config::Config;
use crate::db;
use crate::purchase;
use crate::ship::ShipAgent;
use crate::types::{LocationData, RoleData, Ship, ShipMessage, User};

const SHIP_CHANNEL_CAPACITY: usize = 3;
const MESSAGE_CHANNEL_CAPACITY: usize = 10;

const STARTUP_LOAN_TYPE: &str = "STARTUP";

/// Load the user from the store, claiming the username on the remote first
/// if this is a fresh account, then sync credits, loans, and ships.
pub async fn initialize_user(
    pool: &PgPool,
    client: &Client,
    config: &Config,
) -> anyhow::Result<(User, AuthorizedClient)> {
    let new_ship_role = RoleData::Trader {
        system: config.system.clone(),
    };

    let db_user = match db::get_user(pool, &config.username).await? {
        Some(user) => user,
        None => {
            info!(username = %config.username, "claiming new username");
            let claimed = client
                .claim_username(&config.username)
                .await
                .context("unable to claim username")?;

            let user = db::save_user(pool, &config.username, &claimed.token, &new_ship_role).await?;
            info!(username = %config.username, "new user persisted");
            user
        }
    };

    let authorized = client.authorize(db_user.token.clone());

    let info = authorized
        .get_my_info()
        .await
        .context("unable to fetch account info")?;
    let mut credits = info.user.credits;

    let mut loans = authorized
        .get_my_loans()
        .await
        .context("unable to fetch loans")?
        .loans;

    // Sync the fleet. A ship seen for the first time gets the default role;
    // a known ship keeps whatever role the store already has for it.
    let remote_ships = authorized
        .get_my_ships()
        .await
        .context("unable to fetch ships")?
        .ships;

    for ship in &remote_ships {
        db::save_ship(pool, db_user.id, ship, &db_user.new_ship_role_data.0).await?;
    }

    let db_ships = db::get_user_ships(pool, db_user.id).await?;
    let ships: Vec<Ship> = remote_ships
        .into_iter()
        .map(|data| {
            let role = db_ships
                .iter()
                .find(|s| s.ship_id == data.id)
                .map(|s| s.role_data.0.clone())
                .unwrap_or_else(|| db_user.new_ship_role_data.0.clone());
            Ship::from_wire(db_user.id, &db_user.username, data, role)
        })
        .collect();

    if credits == 0 {
        info!(username = %db_user.username, "taking startup loan");
        let resp = authorized
            .create_loan(STARTUP_LOAN_TYPE)
            .await
            .context("unable to take startup loan")?;
        credits = resp.credits;
        loans = authorized.get_my_loans().await?.loans;
    }

    let outstanding_loans = loans.iter().filter(|l| !l.is_paid()).count();

    let user = User {
        id: db_user.id,
        username: db_user.username,
        token: db_user.token,
        new_ship_role: db_user.new_ship_role_data.0,
        credits,
        loans,
        outstanding_loans,
        ships,
    };

    Ok((user, authorized))
}

/// Run the coordinator until shutdown is signalled.
pub async fn run(
    mut user: User,
    client: AuthorizedClient,
    pool: PgPool,
    config: Arc<Config>,
    system_locations: Vec<LocationData>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (ships_tx, ships_rx) = mpsc::channel::<Ship>(SHIP_CHANNEL_CAPACITY);
    let (messages_tx, mut messages_rx) = mpsc::channel::<ShipMessage>(MESSAGE_CHANNEL_CAPACITY);

    let dispatcher = tokio::spawn(dispatch_agents(
        ships_rx,
        client.clone(),
        pool.clone(),
        messages_tx.clone(),
        config.clone(),
        shutdown.clone(),
    ));

    for ship in &user.ships {
        ships_tx.send(ship.clone()).await.ok();
    }

    // With zero ships, purchases are unrestricted (no docked-ship rule), so
    // this is the one chance to stock the first few ships cheaply before the
    // agents start flying them around.
    if user.ships.is_empty() {
        while user.credits > config.ship_purchase_reserve && user.ships.len() < config.ship_limit {
            match purchase_and_assign_ship(
                &mut user,
                &client,
                &pool,
                &config,
                &system_locations,
                &ships_tx,
            )
            .await
            {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    error!(username = %user.username, %err, "unable to purchase initial ships");
                    break;
                }
            }
        }
    }

    loop {
        if user.credits > config.ship_purchase_reserve && user.ships.len() < config.ship_limit {
            if let Err(err) = purchase_and_assign_ship(
                &mut user,
                &client,
                &pool,
                &config,
                &system_locations,
                &ships_tx,
            )
            .await
            {
                error!(username = %user.username, %err, "unable to purchase and assign ship");
            }
        }

        if user.credits > config.loan_payoff_threshold && user.outstanding_loans > 0 {
            if let Err(err) = pay_off_loan(&mut user, &client).await {
                error!(username = %user.username, %err, "unable to pay off loan");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            maybe = messages_rx.recv() => match maybe {
                Some(message) => handle_message(&mut user, &pool, message).await,
                None => break,
            },
        }
    }

    info!(username = %user.username, "coordinator shutting down");
    drop(ships_tx);
    dispatcher.await.context("dispatcher task panicked")?;

    Ok(())
}

/// Owns the supervision set: every ship fed through the channel becomes an
/// agent task; on shutdown the whole set is aborted and drained.
async fn dispatch_agents(
    mut ships: mpsc::Receiver<Ship>,
    client: AuthorizedClient,
    pool: PgPool,
    messages: mpsc::Sender<ShipMessage>,
    config: Arc<Config>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut agents = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            maybe = ships.recv() => match maybe {
                Some(ship) => {
                    info!(ship_id = %ship.id, role = ship.role.role_name(), "starting ship agent");
                    let agent = ShipAgent::new(
                        ship,
                        client.clone(),
                        pool.clone(),
                        messages.clone(),
                        config.clone(),
                    );
                    agents.spawn(agent.run());
                }
                None => break,
            },
        }
    }

    agents.shutdown().await;
}

/// Buy one ship, assign its role, persist it, and hand it to the dispatcher.
/// The purchase response's credit total is authoritative here; no
/// `UpdateCredits` message follows.
async fn purchase_and_assign_ship(
    user: &mut User,
    client: &AuthorizedClient,
    pool: &PgPool,
    config: &Config,
    system_locations: &[LocationData],
    ships_tx: &mpsc::Sender<Ship>,
) -> anyhow::Result<bool> {
    let purchased = match &config.new_ship_type {
        Some(ship_type) => {
            purchase::purchase_ship(client, user, &config.system, ship_type).await?
        }
        None => purchase::purchase_fastest_ship(client, user, &config.system).await?,
    };

    let Some((ship_data, new_credits)) = purchased else {
        return Ok(false);
    };

    let role = purchase::assign_role(&user.ships, system_locations, &config.system);
    info!(
        username = %user.username,
        ship_id = %ship_data.id,
        role = role.role_name(),
        "purchased and assigned new ship"
    );

    db::save_ship(pool, user.id, &ship_data, &role).await?;

    let ship = Ship::from_wire(user.id, &user.username, ship_data, role);
    ships_tx
        .send(ship.clone())
        .await
        .context("dispatcher is gone")?;

    user.ships.push(ship);
    user.credits = new_credits;

    db::save_user_stats(pool, user).await?;

    Ok(true)
}

async fn pay_off_loan(user: &mut User, client: &AuthorizedClient) -> anyhow::Result<()> {
    let Some(loan_id) = user
        .loans
        .iter()
        .find(|l| !l.is_paid())
        .map(|l| l.id.clone())
    else {
        user.outstanding_loans = 0;
        return Ok(());
    };

    let resp = client.pay_off_loan(&loan_id).await?;
    info!(username = %user.username, %loan_id, "paid off loan");

    user.credits = resp.credits;
    user.loans = resp.loans;
    user.outstanding_loans = user.loans.iter().filter(|l| !l.is_paid()).count();

    Ok(())
}

async fn handle_message(user: &mut User, pool: &PgPool, message: ShipMessage) {
    match message {
        ShipMessage::UpdateCredits { ship_id, credits } => {
            info!(username = %user.username, %ship_id, credits, "credits update from ship");
            user.credits = credits;

            if let Err(err) = db::save_user_stats(pool, user).await {
                warn!(username = %user.username, %err, "unable to save user stats");
            }
        }
        ShipMessage::Noop { .. } => {}
    }
}
