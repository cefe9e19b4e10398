//! Persistence gateway.
//!
//! Every function is one logical statement; callers can hand in the pool or a
//! transaction. Writes are idempotent on their natural keys so agent retries
//! stay safe.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgExecutor, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::types::{Cargo, FlightPlanData, MarketplaceEntry, RoleData, Ship, ShipData, User};

pub async fn connect(postgres_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(3))
        .connect(postgres_url)
        .await
        .context("unable to connect to postgres")?;

    Ok(pool)
}

/// Wipe every daemon table. Used when the game universe has been reset and
/// the account has to be claimed from scratch.
pub async fn reset(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        TRUNCATE daemon_user_stats, daemon_user_transaction, daemon_marketplace_latest,
                 daemon_marketplace, daemon_flight_plan, daemon_location, daemon_system,
                 daemon_user_ship, daemon_user
        "#,
    )
    .execute(pool)
    .await
    .context("unable to reset daemon tables")?;

    Ok(())
}

#[derive(Debug, Clone, FromRow)]
pub struct DbUser {
    pub id: Uuid,
    pub username: String,
    pub token: String,
    pub new_ship_role_data: Json<RoleData>,
}

pub async fn get_user<'a, E: PgExecutor<'a>>(
    db: E,
    username: &str,
) -> anyhow::Result<Option<DbUser>> {
    sqlx::query_as::<_, DbUser>(
        "SELECT id, username, token, new_ship_role_data FROM daemon_user WHERE username = $1",
    )
    .bind(username)
    .fetch_optional(db)
    .await
    .context("unable to get user from db")
}

pub async fn save_user<'a, E: PgExecutor<'a>>(
    db: E,
    username: &str,
    token: &str,
    new_ship_role: &RoleData,
) -> anyhow::Result<DbUser> {
    sqlx::query_as::<_, DbUser>(
        r#"
        INSERT INTO daemon_user (username, token, new_ship_role_data)
        VALUES ($1, $2, $3)
        RETURNING id, username, token, new_ship_role_data
        "#,
    )
    .bind(username)
    .bind(token)
    .bind(Json(new_ship_role))
    .fetch_one(db)
    .await
    .context("unable to save user to db")
}

#[derive(Debug, Clone, FromRow)]
pub struct DbShip {
    pub user_id: Uuid,
    pub ship_id: String,
    #[sqlx(rename = "type")]
    pub ship_type: String,
    pub class: String,
    pub max_cargo: i32,
    pub loading_speed: i32,
    pub speed: i32,
    pub manufacturer: String,
    pub plating: i32,
    pub weapons: i32,
    pub role_data: Json<RoleData>,
    pub location: String,
}

/// Upsert a ship on (user_id, ship_id). `role_data` is written only on first
/// insert; a conflicting update leaves it untouched so operator reassignments
/// survive restarts.
pub async fn save_ship<'a, E: PgExecutor<'a>>(
    db: E,
    user_id: Uuid,
    ship: &ShipData,
    role: &RoleData,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daemon_user_ship (
            user_id, ship_id, type, class, max_cargo, loading_speed, speed,
            manufacturer, plating, weapons, role_data, location
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (user_id, ship_id)
        DO UPDATE SET
            type = $3,
            class = $4,
            max_cargo = $5,
            loading_speed = $6,
            speed = $7,
            manufacturer = $8,
            plating = $9,
            weapons = $10,
            location = $12,
            modified_at = NOW()
        "#,
    )
    .bind(user_id)
    .bind(&ship.id)
    .bind(&ship.ship_type)
    .bind(&ship.class)
    .bind(ship.max_cargo)
    .bind(ship.loading_speed)
    .bind(ship.speed)
    .bind(&ship.manufacturer)
    .bind(ship.plating)
    .bind(ship.weapons)
    .bind(Json(role))
    .bind(ship.location.as_deref().unwrap_or(""))
    .execute(db)
    .await
    .context("unable to save ship to db")?;

    Ok(())
}

pub async fn get_user_ships<'a, E: PgExecutor<'a>>(
    db: E,
    user_id: Uuid,
) -> anyhow::Result<Vec<DbShip>> {
    sqlx::query_as::<_, DbShip>(
        r#"
        SELECT user_id, ship_id, type, class, max_cargo, loading_speed, speed,
               manufacturer, plating, weapons, role_data, location
        FROM daemon_user_ship
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_all(db)
    .await
    .context("unable to get user ships from db")
}

pub async fn update_ship_location<'a, E: PgExecutor<'a>>(
    db: E,
    ship_id: &str,
    location: &str,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE daemon_user_ship SET location = $2, modified_at = NOW() WHERE ship_id = $1")
        .bind(ship_id)
        .bind(location)
        .execute(db)
        .await
        .context("unable to update ship location in db")?;

    Ok(())
}

pub async fn save_system<'a, E: PgExecutor<'a>>(
    db: E,
    system: &str,
    name: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daemon_system (system, name) VALUES ($1, $2)
        ON CONFLICT (system) DO UPDATE SET name = $2
        "#,
    )
    .bind(system)
    .bind(name)
    .execute(db)
    .await
    .context("unable to save system to db")?;

    Ok(())
}

pub async fn save_location<'a, E: PgExecutor<'a>>(
    db: E,
    system: &str,
    symbol: &str,
    name: &str,
    location_type: &str,
    x: i32,
    y: i32,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daemon_location (system, location, location_name, location_type, x, y)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (system, location)
        DO UPDATE SET location_name = $3, location_type = $4, x = $5, y = $6
        "#,
    )
    .bind(system)
    .bind(symbol)
    .bind(name)
    .bind(location_type)
    .bind(x)
    .bind(y)
    .execute(db)
    .await
    .context("unable to save location to db")?;

    Ok(())
}

#[derive(Debug, Clone, FromRow)]
pub struct DbFlightPlan {
    pub id: String,
    pub user_id: Uuid,
    pub ship_id: String,
    pub origin: String,
    pub destination: String,
    pub distance: i32,
    pub fuel_consumed: i32,
    pub fuel_remaining: i32,
    pub time_remaining_in_seconds: i32,
    pub arrives_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

pub async fn save_flight_plan<'a, E: PgExecutor<'a>>(
    db: E,
    user_id: Uuid,
    plan: &FlightPlanData,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daemon_flight_plan (
            id, user_id, ship_id, origin, destination, distance, fuel_consumed,
            fuel_remaining, time_remaining_in_seconds, arrives_at, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(&plan.id)
    .bind(user_id)
    .bind(&plan.ship_id)
    .bind(&plan.departure)
    .bind(&plan.destination)
    .bind(plan.distance)
    .bind(plan.fuel_consumed)
    .bind(plan.fuel_remaining)
    .bind(plan.time_remaining_in_seconds)
    .bind(plan.arrives_at)
    .bind(plan.created_at)
    .execute(db)
    .await
    .context("unable to save flight plan to db")?;

    Ok(())
}

/// The unique plan for this ship still in the air, if any.
pub async fn get_active_flight_plan<'a, E: PgExecutor<'a>>(
    db: E,
    ship_id: &str,
) -> anyhow::Result<Option<DbFlightPlan>> {
    sqlx::query_as::<_, DbFlightPlan>(
        r#"
        SELECT id, user_id, ship_id, origin, destination, distance, fuel_consumed,
               fuel_remaining, time_remaining_in_seconds, arrives_at, created_at
        FROM daemon_flight_plan
        WHERE ship_id = $1 AND arrives_at > NOW()
        "#,
    )
    .bind(ship_id)
    .fetch_optional(db)
    .await
    .context("unable to get active flight plan from db")
}

/// Fuel consumed by any historical flight between these locations for this
/// ship type. Saves a probe against the remote when present.
pub async fn get_fuel_required<'a, E: PgExecutor<'a>>(
    db: E,
    origin: &str,
    destination: &str,
    ship_type: &str,
) -> anyhow::Result<Option<i32>> {
    sqlx::query_scalar::<_, i32>(
        r#"
        SELECT dfp.fuel_consumed
        FROM daemon_flight_plan dfp
        INNER JOIN daemon_user_ship dus
            ON dus.ship_id = dfp.ship_id
        WHERE dfp.origin = $1
            AND dfp.destination = $2
            AND dus.type = $3
        LIMIT 1
        "#,
    )
    .bind(origin)
    .bind(destination)
    .bind(ship_type)
    .fetch_optional(db)
    .await
    .context("unable to get fuel required from db")
}

/// Record a marketplace read: one append-only snapshot row plus an upsert of
/// the latest row per (location, good).
pub async fn save_marketplace_data(
    pool: &PgPool,
    location: &str,
    entries: &[MarketplaceEntry],
) -> anyhow::Result<()> {
    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO daemon_marketplace (
                location, good, purchase_price_per_unit, sell_price_per_unit,
                volume_per_unit, quantity_available
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(location)
        .bind(&entry.good)
        .bind(entry.purchase_price_per_unit)
        .bind(entry.sell_price_per_unit)
        .bind(entry.volume_per_unit)
        .bind(entry.quantity_available)
        .execute(pool)
        .await
        .context("unable to save marketplace snapshot row")?;

        sqlx::query(
            r#"
            INSERT INTO daemon_marketplace_latest (
                location, good, purchase_price_per_unit, sell_price_per_unit,
                volume_per_unit, quantity_available
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (location, good)
            DO UPDATE SET
                purchase_price_per_unit = $3,
                sell_price_per_unit = $4,
                volume_per_unit = $5,
                quantity_available = $6,
                created_at = NOW()
            "#,
        )
        .bind(location)
        .bind(&entry.good)
        .bind(entry.purchase_price_per_unit)
        .bind(entry.sell_price_per_unit)
        .bind(entry.volume_per_unit)
        .bind(entry.quantity_available)
        .execute(pool)
        .await
        .context("unable to upsert marketplace latest row")?;
    }

    Ok(())
}

#[derive(Debug, Clone, FromRow)]
pub struct RouteRow {
    pub purchase_location: String,
    pub purchase_location_type: String,
    pub sell_location: String,
    pub good: String,
    pub distance: f64,
    pub purchase_location_quantity: i32,
    pub sell_location_quantity: i32,
    pub purchase_price_per_unit: i32,
    pub sell_price_per_unit: i32,
    pub volume_per_unit: i32,
}

/// Every candidate trade from `origin`: its marketplace-latest rows crossed
/// with every other same-system location carrying the same good, with the
/// Euclidean distance computed from location coordinates.
pub async fn get_routes<'a, E: PgExecutor<'a>>(
    db: E,
    origin: &str,
) -> anyhow::Result<Vec<RouteRow>> {
    sqlx::query_as::<_, RouteRow>(
        r#"
        SELECT
            dml1.location AS purchase_location,
            from_dl.location_type AS purchase_location_type,
            dml2.location AS sell_location,
            dml2.good,
            SQRT(POW(from_dl.x - to_dl.x, 2) + POW(from_dl.y - to_dl.y, 2)) AS distance,
            dml1.quantity_available AS purchase_location_quantity,
            dml2.quantity_available AS sell_location_quantity,
            dml1.purchase_price_per_unit AS purchase_price_per_unit,
            dml2.sell_price_per_unit AS sell_price_per_unit,
            dml1.volume_per_unit AS volume_per_unit
        FROM daemon_marketplace_latest dml1
        CROSS JOIN daemon_marketplace_latest dml2
        INNER JOIN daemon_location from_dl
            ON from_dl.location = dml1.location
        INNER JOIN daemon_location to_dl
            ON to_dl.location = dml2.location
        WHERE dml1.location = $1
            AND from_dl.system = to_dl.system
            AND dml1.good = dml2.good
            AND dml1.location != dml2.location
        "#,
    )
    .bind(origin)
    .fetch_all(db)
    .await
    .context("unable to get routes from db")
}

pub async fn get_location_with_most_fuel<'a, E: PgExecutor<'a>>(
    db: E,
    system: &str,
) -> anyhow::Result<Option<String>> {
    sqlx::query_scalar::<_, String>(
        r#"
        SELECT dml.location
        FROM daemon_marketplace_latest dml
        INNER JOIN daemon_location dl
            ON dl.location = dml.location
        WHERE dl.system = $1 AND dml.good = 'FUEL'
        ORDER BY dml.quantity_available DESC
        LIMIT 1
        "#,
    )
    .bind(system)
    .fetch_optional(db)
    .await
    .context("unable to get location with most fuel")
}

pub async fn get_location_with_least_fuel<'a, E: PgExecutor<'a>>(
    db: E,
    system: &str,
) -> anyhow::Result<Option<String>> {
    sqlx::query_scalar::<_, String>(
        r#"
        SELECT dml.location
        FROM daemon_marketplace_latest dml
        INNER JOIN daemon_location dl
            ON dl.location = dml.location
        WHERE dl.system = $1 AND dml.good = 'FUEL'
        ORDER BY dml.quantity_available ASC
        LIMIT 1
        "#,
    )
    .bind(system)
    .fetch_optional(db)
    .await
    .context("unable to get location with least fuel")
}

pub async fn get_location_good_quantity<'a, E: PgExecutor<'a>>(
    db: E,
    location: &str,
    good: &str,
) -> anyhow::Result<Option<i32>> {
    sqlx::query_scalar::<_, i32>(
        "SELECT quantity_available FROM daemon_marketplace_latest WHERE location = $1 AND good = $2",
    )
    .bind(location)
    .bind(good)
    .fetch_optional(db)
    .await
    .context("unable to get good quantity at location")
}

#[derive(Debug, Clone)]
pub struct Transaction<'a> {
    pub user_id: Uuid,
    pub ship_id: &'a str,
    pub kind: &'a str,
    pub good: &'a str,
    pub price_per_unit: i32,
    pub quantity: i32,
    pub total: i32,
    pub location: &'a str,
}

pub async fn save_transaction<'a, E: PgExecutor<'a>>(
    db: E,
    tx: Transaction<'_>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daemon_user_transaction (
            user_id, ship_id, type, good, price_per_unit, quantity, total, location
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(tx.user_id)
    .bind(tx.ship_id)
    .bind(tx.kind)
    .bind(tx.good)
    .bind(tx.price_per_unit)
    .bind(tx.quantity)
    .bind(tx.total)
    .bind(tx.location)
    .execute(db)
    .await
    .context("unable to save transaction to db")?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct ShipStats<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    ship_type: &'a str,
    location: &'a str,
    loading_speed: i32,
    max_cargo: i32,
    cargo: &'a [Cargo],
    role_data: &'a RoleData,
}

/// Append a point-in-time snapshot of the account for the stats time series.
pub async fn save_user_stats<'a, E: PgExecutor<'a>>(db: E, user: &User) -> anyhow::Result<()> {
    let ships: Vec<ShipStats<'_>> = user
        .ships
        .iter()
        .map(|s: &Ship| ShipStats {
            id: &s.id,
            ship_type: &s.ship_type,
            location: &s.location,
            loading_speed: s.loading_speed,
            max_cargo: s.max_cargo,
            cargo: &s.cargo,
            role_data: &s.role,
        })
        .collect();

    sqlx::query(
        r#"
        INSERT INTO daemon_user_stats (user_id, credits, ship_count, ships)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(user.id)
    .bind(user.credits)
    .bind(user.ships.len() as i32)
    .bind(Json(ships))
    .execute(db)
    .await
    .context("unable to save user stats to db")?;

    Ok(())
}
