//! Per-ship agent.
//!
//! One long-lived task per ship. The agent exclusively owns its ship's
//! in-memory state and drives the role-specific trip loop, persisting every
//! step so a crashed process can pick up where it left off. Almost every
//! failure inside the loop is treated as transient: log, sleep, retry from
//! the top. The idempotent upserts and the at-most-one-active-flight-plan
//! invariant make those retries safe.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::client::AuthorizedClient;
use crate::config::Config;
use crate::db;
use crate::trade;
use crate::types::{FlightPlanData, RoleData, Ship, ShipMessage, GOOD_FUEL};

const RETRY_DELAY: Duration = Duration::from_secs(60);
const FUEL_BALANCER_IDLE: Duration = Duration::from_secs(6 * 60);

/// Below this quantity at the driest location, fuel balancing is worth doing.
const FUEL_SURPLUS_FLOOR: i32 = 3000;

/// Extract `N` from the game's `You require N more FUEL` rejection.
pub fn parse_required_fuel(message: &str) -> Option<i32> {
    let re = Regex::new(r"You require (\d+) more FUEL").expect("fuel pattern is valid");
    re.captures(message)?.get(1)?.as_str().parse().ok()
}

/// Order sizes for moving `quantity` of a good when the remote caps each
/// order at `loading_speed` units.
pub fn split_order(quantity: i32, loading_speed: i32) -> Vec<i32> {
    let mut chunks = Vec::new();
    let mut remaining = quantity;
    while remaining > 0 {
        let chunk = remaining.min(loading_speed);
        chunks.push(chunk);
        remaining -= chunk;
    }
    chunks
}

pub struct ShipAgent {
    ship: Ship,
    client: AuthorizedClient,
    pool: PgPool,
    messages: mpsc::Sender<ShipMessage>,
    config: Arc<Config>,
}

impl ShipAgent {
    pub fn new(
        ship: Ship,
        client: AuthorizedClient,
        pool: PgPool,
        messages: mpsc::Sender<ShipMessage>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            ship,
            client,
            pool,
            messages,
            config,
        }
    }

    pub async fn run(mut self) {
        self.preflight().await;

        match self.ship.role.clone() {
            RoleData::Trader { .. } => self.run_trader().await,
            RoleData::Scout { location, .. } => self.run_scout(&location).await,
            RoleData::FuelBalancer { system } => self.run_fuel_balancer(&system).await,
        }
    }

    /// Recover from a restart: wait out any in-flight plan, then make sure
    /// the ship starts with empty cargo.
    async fn preflight(&mut self) {
        match db::get_active_flight_plan(&self.pool, &self.ship.id).await {
            Ok(Some(plan)) => {
                info!(
                    ship_id = %self.ship.id,
                    destination = %plan.destination,
                    arrives_at = %plan.arrives_at,
                    "ship is in motion, waiting for arrival"
                );
                let remaining = plan.arrives_at - Utc::now();
                if let Ok(remaining) = remaining.to_std() {
                    sleep(remaining).await;
                }
                self.ship.location = plan.destination;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(ship_id = %self.ship.id, %err, "unable to look up active flight plan");
            }
        }

        if let Err(err) = self.empty_cargo().await {
            // The cargo may be partially unknown after a crash; resync and
            // let the role loop sort it out.
            warn!(ship_id = %self.ship.id, %err, "unable to empty cargo during preflight");
            if let Err(err) = self.reload_cargo().await {
                warn!(ship_id = %self.ship.id, %err, "unable to reload cargo during preflight");
            }
        }
    }

    async fn run_trader(&mut self) {
        let denylist = self.config.route_denylist.clone();

        loop {
            if self.ship.location.is_empty() {
                warn!(ship_id = %self.ship.id, "ship has forgotten its location, refetching");
                if let Err(err) = self.refresh_location().await {
                    warn!(ship_id = %self.ship.id, %err, "unable to refresh ship location");
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            }

            if let Err(err) = self.empty_cargo().await {
                warn!(ship_id = %self.ship.id, %err, "unable to empty cargo, resyncing");
                if let Err(err) = self.reload_cargo().await {
                    warn!(ship_id = %self.ship.id, %err, "unable to reload cargo");
                }
                sleep(RETRY_DELAY).await;
                continue;
            }

            let route = match trade::best_trading_route(
                &self.pool,
                &self.ship.location,
                self.ship.speed,
                &denylist,
            )
            .await
            {
                Ok(Some(route)) => route,
                Ok(None) => {
                    warn!(
                        ship_id = %self.ship.id,
                        location = %self.ship.location,
                        "no trade route found"
                    );
                    sleep(RETRY_DELAY).await;
                    continue;
                }
                Err(err) => {
                    warn!(ship_id = %self.ship.id, %err, "unable to evaluate trade routes");
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            if self.config.enable_trader {
                info!(
                    ship_id = %self.ship.id,
                    good = %route.good,
                    sell_location = %route.sell_location,
                    psvd = route.profit_speed_volume_distance,
                    "found a trade route"
                );
            }

            if let Err(err) = self.purchase_fuel_for_trip(&route.sell_location).await {
                warn!(ship_id = %self.ship.id, %err, "unable to purchase fuel for trip");
                sleep(RETRY_DELAY).await;
                continue;
            }

            let max_quantity = self.ship.space_available / route.volume_per_unit;
            if let Err(err) = self.purchase_good(&route.good, max_quantity).await {
                warn!(
                    ship_id = %self.ship.id,
                    good = %route.good,
                    quantity = max_quantity,
                    %err,
                    "unable to purchase trade good"
                );
                sleep(RETRY_DELAY).await;
                continue;
            }

            if let Err(err) = self.move_to_location(&route.sell_location).await {
                warn!(
                    ship_id = %self.ship.id,
                    destination = %route.sell_location,
                    %err,
                    "unable to move to sell location"
                );
                sleep(RETRY_DELAY).await;
                continue;
            }

            // The next iteration sells the cargo at the new location.
        }
    }

    async fn run_scout(&mut self, post: &str) {
        loop {
            if self.ship.location != post {
                if let Err(err) = self.empty_cargo().await {
                    warn!(ship_id = %self.ship.id, %err, "unable to empty cargo");
                    sleep(RETRY_DELAY).await;
                    continue;
                }

                if let Err(err) = self.purchase_fuel_for_trip(post).await {
                    warn!(ship_id = %self.ship.id, %err, "unable to purchase fuel for trip");
                    sleep(RETRY_DELAY).await;
                    continue;
                }

                if let Err(err) = self.move_to_location(post).await {
                    warn!(ship_id = %self.ship.id, destination = %post, %err, "unable to move to post");
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            }

            if self.config.enable_scouts {
                info!(ship_id = %self.ship.id, location = %self.ship.location, "collecting marketplace data");
            }

            let marketplace = match self.client.get_location_marketplace(&self.ship.location).await
            {
                Ok(resp) => resp.marketplace,
                Err(err) => {
                    warn!(ship_id = %self.ship.id, %err, "unable to get marketplace data");
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            if let Err(err) =
                db::save_marketplace_data(&self.pool, &self.ship.location, &marketplace).await
            {
                warn!(ship_id = %self.ship.id, %err, "unable to save marketplace data");
                sleep(RETRY_DELAY).await;
                continue;
            }

            self.messages
                .send(ShipMessage::Noop {
                    ship_id: self.ship.id.clone(),
                })
                .await
                .ok();

            sleep(RETRY_DELAY).await;
        }
    }

    /// Move fuel from the system's most-stocked location to its driest one.
    async fn run_fuel_balancer(&mut self, system: &str) {
        loop {
            let source = match db::get_location_with_most_fuel(&self.pool, system).await {
                Ok(Some(location)) => location,
                Ok(None) => {
                    warn!(ship_id = %self.ship.id, system, "no fuel market data for system yet");
                    sleep(RETRY_DELAY).await;
                    continue;
                }
                Err(err) => {
                    warn!(ship_id = %self.ship.id, %err, "unable to find location with most fuel");
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            let source_quantity =
                match db::get_location_good_quantity(&self.pool, &source, GOOD_FUEL).await {
                    Ok(Some(quantity)) => quantity,
                    Ok(None) => 0,
                    Err(err) => {
                        warn!(ship_id = %self.ship.id, %err, "unable to read fuel quantity");
                        sleep(RETRY_DELAY).await;
                        continue;
                    }
                };

            let sink = match db::get_location_with_least_fuel(&self.pool, system).await {
                Ok(Some(location)) => location,
                Ok(None) => {
                    sleep(RETRY_DELAY).await;
                    continue;
                }
                Err(err) => {
                    warn!(ship_id = %self.ship.id, %err, "unable to find location with least fuel");
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            let sink_quantity =
                match db::get_location_good_quantity(&self.pool, &sink, GOOD_FUEL).await {
                    Ok(Some(quantity)) => quantity,
                    Ok(None) => 0,
                    Err(err) => {
                        warn!(ship_id = %self.ship.id, %err, "unable to read fuel quantity");
                        sleep(RETRY_DELAY).await;
                        continue;
                    }
                };

            if sink_quantity > FUEL_SURPLUS_FLOOR {
                info!(
                    ship_id = %self.ship.id,
                    location = %sink,
                    quantity = sink_quantity,
                    "no fuel imbalance worth acting on"
                );
                sleep(FUEL_BALANCER_IDLE).await;
                continue;
            }

            if self.ship.location != source {
                let travel_fuel = match self.additional_fuel_required(&source).await {
                    Ok(quantity) => quantity,
                    Err(err) => {
                        warn!(ship_id = %self.ship.id, %err, "unable to get fuel required for trip");
                        sleep(RETRY_DELAY).await;
                        continue;
                    }
                };

                if travel_fuel > 0 {
                    if let Err(err) = self.purchase_good(GOOD_FUEL, travel_fuel).await {
                        warn!(ship_id = %self.ship.id, %err, "unable to purchase travel fuel");
                        sleep(RETRY_DELAY).await;
                        continue;
                    }
                }

                if let Err(err) = self.move_to_location(&source).await {
                    warn!(ship_id = %self.ship.id, destination = %source, %err, "unable to reach fuel source");
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            }

            let haul = self.ship.space_available.min(source_quantity);
            if let Err(err) = self.purchase_good(GOOD_FUEL, haul).await {
                warn!(ship_id = %self.ship.id, quantity = haul, %err, "unable to purchase fuel haul");
                sleep(RETRY_DELAY).await;
                continue;
            }

            if let Err(err) = self.move_to_location(&sink).await {
                warn!(ship_id = %self.ship.id, destination = %sink, %err, "unable to reach fuel sink");
                sleep(RETRY_DELAY).await;
                continue;
            }

            if let Err(err) = self.empty_cargo().await {
                warn!(ship_id = %self.ship.id, %err, "unable to sell fuel haul");
                sleep(RETRY_DELAY).await;
                continue;
            }
        }
    }

    async fn send_credits_update(&self, credits: i64) {
        self.messages
            .send(ShipMessage::UpdateCredits {
                ship_id: self.ship.id.clone(),
                credits,
            })
            .await
            .ok();
    }

    /// Issue one purchase order and record the transaction. Returns the new
    /// account credit total.
    async fn create_purchase_order(&mut self, good: &str, quantity: i32) -> anyhow::Result<i64> {
        anyhow::ensure!(
            quantity > 0,
            "refusing to create purchase order with quantity {}",
            quantity
        );

        let resp = self
            .client
            .create_purchase_order(&self.ship.id, good, quantity)
            .await?;

        self.ship.cargo = resp.ship.cargo;
        self.ship.space_available = resp.ship.space_available;

        db::save_transaction(
            &self.pool,
            db::Transaction {
                user_id: self.ship.user_id,
                ship_id: &self.ship.id,
                kind: "purchase",
                good,
                price_per_unit: resp.order.price_per_unit,
                quantity: resp.order.quantity,
                total: resp.order.total,
                location: resp.ship.location.as_deref().unwrap_or(&self.ship.location),
            },
        )
        .await?;

        Ok(resp.credits)
    }

    async fn create_sell_order(&mut self, good: &str, quantity: i32) -> anyhow::Result<i64> {
        anyhow::ensure!(
            quantity > 0,
            "refusing to create sell order with quantity {}",
            quantity
        );

        let resp = self
            .client
            .create_sell_order(&self.ship.id, good, quantity)
            .await?;

        self.ship.cargo = resp.ship.cargo;
        self.ship.space_available = resp.ship.space_available;

        db::save_transaction(
            &self.pool,
            db::Transaction {
                user_id: self.ship.user_id,
                ship_id: &self.ship.id,
                kind: "sell",
                good,
                price_per_unit: resp.order.price_per_unit,
                quantity: resp.order.quantity,
                total: resp.order.total,
                location: resp.ship.location.as_deref().unwrap_or(&self.ship.location),
            },
        )
        .await?;

        Ok(resp.credits)
    }

    /// Buy `quantity` of a good in orders no larger than the ship's loading
    /// speed, reporting credits after each order.
    async fn purchase_good(&mut self, good: &str, quantity: i32) -> anyhow::Result<()> {
        for chunk in split_order(quantity, self.ship.loading_speed) {
            let credits = self.create_purchase_order(good, chunk).await?;
            info!(
                ship_id = %self.ship.id,
                good,
                quantity = chunk,
                location = %self.ship.location,
                "purchased good"
            );
            self.send_credits_update(credits).await;
        }

        Ok(())
    }

    async fn sell_good(&mut self, good: &str, quantity: i32) -> anyhow::Result<()> {
        for chunk in split_order(quantity, self.ship.loading_speed) {
            let credits = self.create_sell_order(good, chunk).await?;
            info!(
                ship_id = %self.ship.id,
                good,
                quantity = chunk,
                location = %self.ship.location,
                "sold good"
            );
            self.send_credits_update(credits).await;
        }

        Ok(())
    }

    /// Sell everything currently recorded in the ship's cargo.
    async fn empty_cargo(&mut self) -> anyhow::Result<()> {
        let held: Vec<(String, i32)> = self
            .ship
            .cargo
            .iter()
            .map(|c| (c.good.clone(), c.quantity))
            .collect();

        for (good, quantity) in held {
            if quantity > 0 {
                self.sell_good(&good, quantity).await?;
            }
        }

        Ok(())
    }

    async fn reload_cargo(&mut self) -> anyhow::Result<()> {
        let resp = self.client.get_my_ship(&self.ship.id).await?;
        self.ship.cargo = resp.ship.cargo;
        self.ship.space_available = resp.ship.space_available;
        Ok(())
    }

    async fn refresh_location(&mut self) -> anyhow::Result<()> {
        let resp = self.client.get_my_ship(&self.ship.id).await?;
        let location = resp
            .ship
            .location
            .ok_or_else(|| anyhow::anyhow!("ship is still in transit"))?;

        self.ship.location = location;
        db::update_ship_location(&self.pool, &self.ship.id, &self.ship.location).await?;
        Ok(())
    }

    /// How much MORE fuel must be bought to fly to `destination`.
    ///
    /// Prefers the fuel table built up from past flight plans. With no
    /// history, probes the remote: sell all fuel, attempt the flight plan,
    /// and read the required quantity out of the expected rejection. The
    /// following fuel purchase then makes the real flight plan succeed,
    /// which populates the table for next time.
    async fn additional_fuel_required(&mut self, destination: &str) -> anyhow::Result<i32> {
        let current_fuel = self.ship.fuel_in_cargo();

        if let Some(required) = db::get_fuel_required(
            &self.pool,
            &self.ship.location,
            destination,
            &self.ship.ship_type,
        )
        .await?
        {
            return Ok((required - current_fuel).max(0));
        }

        if current_fuel > 0 {
            self.sell_good(GOOD_FUEL, current_fuel).await?;
        }

        let err = match self
            .client
            .create_flight_plan(&self.ship.id, destination)
            .await
        {
            Ok(_) => anyhow::bail!("fuel probe flight plan unexpectedly succeeded, ship is in motion"),
            Err(err) => err,
        };

        let message = err
            .remote_message()
            .ok_or_else(|| anyhow::anyhow!("fuel probe failed with unexpected error: {err}"))?;

        parse_required_fuel(message)
            .ok_or_else(|| anyhow::anyhow!("unable to parse required fuel from: {message}"))
    }

    async fn purchase_fuel_for_trip(&mut self, destination: &str) -> anyhow::Result<()> {
        let required = self.additional_fuel_required(destination).await?;
        info!(
            ship_id = %self.ship.id,
            origin = %self.ship.location,
            destination,
            required,
            "fuel required for trip"
        );

        if required > 0 {
            self.purchase_good(GOOD_FUEL, required).await?;
        }

        Ok(())
    }

    /// Create a flight plan on the remote and persist it. The ship's location
    /// empties (it is in flight) and the consumed fuel leaves its cargo.
    async fn create_flight_plan(&mut self, destination: &str) -> anyhow::Result<FlightPlanData> {
        let resp = self
            .client
            .create_flight_plan(&self.ship.id, destination)
            .await?;
        let plan = resp.flight_plan;

        self.ship.location = String::new();
        for cargo in &mut self.ship.cargo {
            if cargo.good == GOOD_FUEL {
                cargo.quantity -= plan.fuel_consumed;
            }
        }

        db::save_flight_plan(&self.pool, self.ship.user_id, &plan).await?;

        Ok(plan)
    }

    async fn move_to_location(&mut self, destination: &str) -> anyhow::Result<()> {
        let plan = self.create_flight_plan(destination).await?;

        info!(
            ship_id = %self.ship.id,
            destination,
            seconds = plan.time_remaining_in_seconds,
            "flight plan created, waiting for arrival"
        );
        sleep(Duration::from_secs(plan.time_remaining_in_seconds.max(0) as u64)).await;

        self.ship.location = destination.to_string();
        db::update_ship_location(&self.pool, &self.ship.id, destination).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_required_fuel() {
        assert_eq!(
            parse_required_fuel("You require 17 more FUEL to make this flight."),
            Some(17)
        );
        assert_eq!(parse_required_fuel("You require 1 more FUEL"), Some(1));
        assert_eq!(parse_required_fuel("Insufficient credits"), None);
        assert_eq!(parse_required_fuel("You require more FUEL"), None);
    }

    #[test]
    fn test_split_order_caps_at_loading_speed() {
        assert_eq!(split_order(70, 25), vec![25, 25, 20]);
        assert_eq!(split_order(25, 25), vec![25]);
        assert_eq!(split_order(10, 25), vec![10]);
    }

    #[test]
    fn test_split_order_zero_and_negative() {
        assert!(split_order(0, 25).is_empty());
        assert!(split_order(-5, 25).is_empty());
    }
}
