//! Domain and wire types shared across the daemon.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The one good the core logic names directly.
pub const GOOD_FUEL: &str = "FUEL";

/// Operating mode of a ship. Assigned when a ship is first persisted and
/// preserved across restarts, so operator reassignments stick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum RoleData {
    Trader { system: String },
    Scout { system: String, location: String },
    FuelBalancer { system: String },
}

impl RoleData {
    pub fn system(&self) -> &str {
        match self {
            RoleData::Trader { system } => system,
            RoleData::Scout { system, .. } => system,
            RoleData::FuelBalancer { system } => system,
        }
    }

    pub fn role_name(&self) -> &'static str {
        match self {
            RoleData::Trader { .. } => "Trader",
            RoleData::Scout { .. } => "Scout",
            RoleData::FuelBalancer { .. } => "FuelBalancer",
        }
    }
}

/// Message posted by a ship agent to its owning coordinator.
#[derive(Debug, Clone)]
pub enum ShipMessage {
    /// A credit-changing action completed; `credits` is the new account total.
    UpdateCredits { ship_id: String, credits: i64 },
    /// Nothing changed, but the coordinator should re-evaluate its policies.
    Noop { ship_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cargo {
    pub good: String,
    pub quantity: i32,
    pub total_volume: i32,
}

/// Ship state as the game server reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipData {
    pub id: String,
    /// Absent while the ship is in flight.
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub cargo: Vec<Cargo>,
    pub space_available: i32,
    #[serde(rename = "type")]
    pub ship_type: String,
    pub class: String,
    pub max_cargo: i32,
    pub loading_speed: i32,
    pub speed: i32,
    pub manufacturer: String,
    pub plating: i32,
    pub weapons: i32,
}

/// In-memory ship owned by exactly one agent for the process lifetime.
#[derive(Debug, Clone)]
pub struct Ship {
    pub user_id: Uuid,
    pub username: String,
    pub id: String,
    pub ship_type: String,
    pub class: String,
    /// Empty while the ship is in flight.
    pub location: String,
    pub loading_speed: i32,
    pub speed: i32,
    pub max_cargo: i32,
    pub space_available: i32,
    pub manufacturer: String,
    pub plating: i32,
    pub weapons: i32,
    pub cargo: Vec<Cargo>,
    pub role: RoleData,
}

impl Ship {
    pub fn from_wire(user_id: Uuid, username: &str, data: ShipData, role: RoleData) -> Self {
        Self {
            user_id,
            username: username.to_string(),
            id: data.id,
            ship_type: data.ship_type,
            class: data.class,
            location: data.location.unwrap_or_default(),
            loading_speed: data.loading_speed,
            speed: data.speed,
            max_cargo: data.max_cargo,
            space_available: data.space_available,
            manufacturer: data.manufacturer,
            plating: data.plating,
            weapons: data.weapons,
            cargo: data.cargo,
            role,
        }
    }

    pub fn fuel_in_cargo(&self) -> i32 {
        self.cargo
            .iter()
            .filter(|c| c.good == GOOD_FUEL)
            .map(|c| c.quantity)
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Loan {
    pub id: String,
    pub due: DateTime<Utc>,
    pub repayment_amount: i64,
    pub status: String,
    #[serde(rename = "type")]
    pub loan_type: String,
}

impl Loan {
    pub fn is_paid(&self) -> bool {
        self.status.contains("PAID")
    }
}

/// The user account as the coordinator sees it. `credits` is authoritative
/// only in memory; stats rows are append-only snapshots.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub token: String,
    pub new_ship_role: RoleData,
    pub credits: i64,
    pub loans: Vec<Loan>,
    pub outstanding_loans: usize,
    pub ships: Vec<Ship>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightPlanData {
    pub id: String,
    pub ship_id: String,
    pub fuel_consumed: i32,
    pub fuel_remaining: i32,
    pub time_remaining_in_seconds: i32,
    pub created_at: DateTime<Utc>,
    pub arrives_at: DateTime<Utc>,
    #[serde(default)]
    pub terminated_at: Option<DateTime<Utc>>,
    pub destination: String,
    pub departure: String,
    pub distance: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderData {
    pub good: String,
    pub quantity: i32,
    pub price_per_unit: i32,
    pub total: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceEntry {
    #[serde(rename = "symbol")]
    pub good: String,
    pub volume_per_unit: i32,
    pub purchase_price_per_unit: i32,
    pub sell_price_per_unit: i32,
    pub quantity_available: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationData {
    pub symbol: String,
    #[serde(rename = "type")]
    pub location_type: String,
    pub name: String,
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseLocation {
    pub system: String,
    pub location: String,
    pub price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipForSale {
    #[serde(rename = "type")]
    pub ship_type: String,
    pub class: String,
    pub max_cargo: i32,
    pub loading_speed: i32,
    pub speed: i32,
    pub manufacturer: String,
    pub plating: i32,
    pub weapons: i32,
    pub purchase_locations: Vec<PurchaseLocation>,
    #[serde(default)]
    pub restricted_goods: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_data_tagged_serde() {
        let scout = RoleData::Scout {
            system: "OE".to_string(),
            location: "OE-PM".to_string(),
        };

        let json = serde_json::to_value(&scout).unwrap();
        assert_eq!(json["role"], "Scout");
        assert_eq!(json["location"], "OE-PM");

        let back: RoleData = serde_json::from_value(json).unwrap();
        assert_eq!(back, scout);
    }

    #[test]
    fn test_loan_paid_status() {
        let mut loan = Loan {
            id: "loan-1".to_string(),
            due: Utc::now(),
            repayment_amount: 280_000,
            status: "CURRENT".to_string(),
            loan_type: "STARTUP".to_string(),
        };
        assert!(!loan.is_paid());

        loan.status = "PAID".to_string();
        assert!(loan.is_paid());

        loan.status = "PAID_OFF_EARLY".to_string();
        assert!(loan.is_paid());
    }

    #[test]
    fn test_fuel_in_cargo_sums_fuel_only() {
        let ship = Ship {
            user_id: Uuid::new_v4(),
            username: "tester".to_string(),
            id: "ship-1".to_string(),
            ship_type: "JW-MK-I".to_string(),
            class: "MK-I".to_string(),
            location: "OE-PM".to_string(),
            loading_speed: 25,
            speed: 1,
            max_cargo: 50,
            space_available: 20,
            manufacturer: "Jackshaw".to_string(),
            plating: 5,
            weapons: 5,
            cargo: vec![
                Cargo {
                    good: GOOD_FUEL.to_string(),
                    quantity: 12,
                    total_volume: 12,
                },
                Cargo {
                    good: "METALS".to_string(),
                    quantity: 18,
                    total_volume: 18,
                },
            ],
            role: RoleData::Trader {
                system: "OE".to_string(),
            },
        };

        assert_eq!(ship.fuel_in_cargo(), 12);
    }
}
