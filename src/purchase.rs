//! Ship purchasing and role assignment.

use anyhow::anyhow;
use tracing::info;

use crate::client::AuthorizedClient;
use crate::types::{LocationData, RoleData, Ship, ShipData, User};

/// Locations where the user currently has a docked ship. Ships can only be
/// purchased at these, except when the user has no ships at all.
async fn docked_locations(client: &AuthorizedClient) -> anyhow::Result<Vec<String>> {
    let current = client.get_my_ships().await?;
    Ok(current
        .ships
        .into_iter()
        .filter_map(|s| s.location)
        .filter(|l| !l.is_empty())
        .collect())
}

/// Buy the fastest affordable ship in `system`.
///
/// Returns `Ok(None)` when no purchase is currently possible because the
/// whole fleet is in flight; the caller retries later.
pub async fn purchase_fastest_ship(
    client: &AuthorizedClient,
    user: &User,
    system: &str,
) -> anyhow::Result<Option<(ShipData, i64)>> {
    let for_sale = client.get_ships_for_sale().await?;
    let docked = docked_locations(client).await?;

    if !user.ships.is_empty() && docked.is_empty() {
        info!(username = %user.username, "no docked ships, unable to purchase; will retry later");
        return Ok(None);
    }

    let mut best: Option<(i32, String, String)> = None;

    for offer in &for_sale.ships_for_sale {
        // Offers restricted to specific goods are skipped outright.
        if !offer.restricted_goods.is_empty() {
            continue;
        }

        for purchase_location in &offer.purchase_locations {
            if !docked.contains(&purchase_location.location) && !user.ships.is_empty() {
                continue;
            }

            if purchase_location.system != system {
                continue;
            }

            if user.credits < purchase_location.price {
                continue;
            }

            if best.as_ref().is_some_and(|(speed, _, _)| offer.speed < *speed) {
                continue;
            }

            best = Some((
                offer.speed,
                offer.ship_type.clone(),
                purchase_location.location.clone(),
            ));
        }
    }

    let (_, ship_type, location) = best.ok_or_else(|| {
        anyhow!(
            "unable to find a purchasable ship for {} in {}",
            user.username,
            system
        )
    })?;

    info!(username = %user.username, %ship_type, %location, "buying fastest ship");
    let resp = client.purchase_ship(&location, &ship_type).await?;

    Ok(Some((resp.ship, resp.credits)))
}

/// Buy a specific ship type in `system`. Restricted-goods offers are allowed
/// here since the operator asked for this type by name.
pub async fn purchase_ship(
    client: &AuthorizedClient,
    user: &User,
    system: &str,
    ship_type: &str,
) -> anyhow::Result<Option<(ShipData, i64)>> {
    let for_sale = client.get_ships_for_sale().await?;
    let docked = docked_locations(client).await?;

    if !user.ships.is_empty() && docked.is_empty() {
        info!(username = %user.username, "no docked ships, unable to purchase; will retry later");
        return Ok(None);
    }

    let mut found: Option<(String, i64)> = None;

    for offer in &for_sale.ships_for_sale {
        if offer.ship_type != ship_type {
            continue;
        }

        for purchase_location in &offer.purchase_locations {
            if !docked.contains(&purchase_location.location) && !user.ships.is_empty() {
                continue;
            }

            if purchase_location.system != system {
                continue;
            }

            if user.credits < purchase_location.price {
                continue;
            }

            found = Some((
                purchase_location.location.clone(),
                purchase_location.price,
            ));
        }
    }

    let (location, price) = found.ok_or_else(|| {
        anyhow!(
            "unable to find ship type {} for {} in {}",
            ship_type,
            user.username,
            system
        )
    })?;

    info!(username = %user.username, %ship_type, %location, price, "buying ship");
    let resp = client.purchase_ship(&location, ship_type).await?;

    Ok(Some((resp.ship, resp.credits)))
}

/// Pick the role for a newly purchased ship. The first ship always trades;
/// after that, each new ship scouts the first location in the system with no
/// scout assigned. Once every location is covered, fall back to trading.
pub fn assign_role(ships: &[Ship], system_locations: &[LocationData], system: &str) -> RoleData {
    if ships.is_empty() {
        return RoleData::Trader {
            system: system.to_string(),
        };
    }

    for location in system_locations {
        let covered = ships.iter().any(|s| {
            matches!(
                &s.role,
                RoleData::Scout { location: post, .. } if *post == location.symbol
            )
        });

        if !covered {
            return RoleData::Scout {
                system: system.to_string(),
                location: location.symbol.clone(),
            };
        }
    }

    RoleData::Trader {
        system: system.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn location(symbol: &str) -> LocationData {
        LocationData {
            symbol: symbol.to_string(),
            location_type: "PLANET".to_string(),
            name: symbol.to_string(),
            x: 0,
            y: 0,
        }
    }

    fn ship(role: RoleData) -> Ship {
        Ship {
            user_id: Uuid::new_v4(),
            username: "tester".to_string(),
            id: Uuid::new_v4().to_string(),
            ship_type: "JW-MK-I".to_string(),
            class: "MK-I".to_string(),
            location: "OE-PM".to_string(),
            loading_speed: 25,
            speed: 1,
            max_cargo: 50,
            space_available: 50,
            manufacturer: "Jackshaw".to_string(),
            plating: 5,
            weapons: 5,
            cargo: Vec::new(),
            role,
        }
    }

    #[test]
    fn test_first_ship_is_a_trader() {
        let role = assign_role(&[], &[location("OE-PM")], "OE");
        assert_eq!(
            role,
            RoleData::Trader {
                system: "OE".to_string()
            }
        );
    }

    #[test]
    fn test_next_ship_scouts_first_uncovered_location() {
        let ships = vec![
            ship(RoleData::Trader {
                system: "OE".to_string(),
            }),
            ship(RoleData::Scout {
                system: "OE".to_string(),
                location: "OE-PM".to_string(),
            }),
        ];
        let locations = vec![location("OE-PM"), location("OE-CR"), location("OE-KO")];

        let role = assign_role(&ships, &locations, "OE");
        assert_eq!(
            role,
            RoleData::Scout {
                system: "OE".to_string(),
                location: "OE-CR".to_string(),
            }
        );
    }

    #[test]
    fn test_all_locations_covered_falls_back_to_trader() {
        let ships = vec![
            ship(RoleData::Trader {
                system: "OE".to_string(),
            }),
            ship(RoleData::Scout {
                system: "OE".to_string(),
                location: "OE-PM".to_string(),
            }),
        ];
        let locations = vec![location("OE-PM")];

        let role = assign_role(&ships, &locations, "OE");
        assert_eq!(
            role,
            RoleData::Trader {
                system: "OE".to_string()
            }
        );
    }
}
