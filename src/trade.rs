//! Trade route evaluation.
//!
//! Pure ranking over the persisted marketplace-latest rows. The primary key
//! is psvd (profit * speed / (volume * distance)): a fast ship should prefer
//! a longer, richer run, a slow one the short hops.

use sqlx::PgPool;

use crate::db::{self, RouteRow};

/// A location won't fill a meaningful load below this quantity.
const MIN_PURCHASE_QUANTITY: i32 = 500;

#[derive(Debug, Clone)]
pub struct Route {
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
    pub cost_volume_distance: f64,
    pub profit_speed_volume_distance: f64,
}

impl Route {
    fn from_row(row: RouteRow, speed: i32) -> Self {
        let profit = f64::from(row.sell_price_per_unit - row.purchase_price_per_unit);
        let cost_volume_distance = profit / f64::from(row.volume_per_unit) / row.distance;
        let profit_speed_volume_distance =
            (profit * f64::from(speed)) / (f64::from(row.volume_per_unit) * row.distance);

        Self {
            purchase_location: row.purchase_location,
            purchase_location_type: row.purchase_location_type,
            sell_location: row.sell_location,
            good: row.good,
            distance: row.distance,
            purchase_location_quantity: row.purchase_location_quantity,
            sell_location_quantity: row.sell_location_quantity,
            purchase_price_per_unit: row.purchase_price_per_unit,
            sell_price_per_unit: row.sell_price_per_unit,
            volume_per_unit: row.volume_per_unit,
            cost_volume_distance,
            profit_speed_volume_distance,
        }
    }
}

/// Rank candidate routes for a ship of the given speed and pick the best.
///
/// Negative-profit routes are deliberately allowed through so a ship never
/// gets stranded at a location with no admissible trade at all.
pub fn best_route(rows: Vec<RouteRow>, speed: i32, denylist: &[String]) -> Option<Route> {
    let mut best: Option<Route> = None;

    for row in rows {
        let route = Route::from_row(row, speed);

        if denylist.iter().any(|loc| *loc == route.sell_location) {
            continue;
        }

        if route.purchase_location_quantity < MIN_PURCHASE_QUANTITY {
            continue;
        }

        match &best {
            Some(current)
                if route.profit_speed_volume_distance <= current.profit_speed_volume_distance => {}
            _ => best = Some(route),
        }
    }

    best
}

/// Fetch all routes from `origin` and rank them.
pub async fn best_trading_route(
    pool: &PgPool,
    origin: &str,
    speed: i32,
    denylist: &[String],
) -> anyhow::Result<Option<Route>> {
    let rows = db::get_routes(pool, origin).await?;
    Ok(best_route(rows, speed, denylist))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(
        purchase_location: &str,
        sell_location: &str,
        good: &str,
        distance: f64,
        purchase_price: i32,
        sell_price: i32,
        volume: i32,
        purchase_quantity: i32,
    ) -> RouteRow {
        RouteRow {
            purchase_location: purchase_location.to_string(),
            purchase_location_type: "PLANET".to_string(),
            sell_location: sell_location.to_string(),
            good: good.to_string(),
            distance,
            purchase_location_quantity: purchase_quantity,
            sell_location_quantity: 2000,
            purchase_price_per_unit: purchase_price,
            sell_price_per_unit: sell_price,
            volume_per_unit: volume,
        }
    }

    #[test]
    fn test_psvd_ranking_math() {
        // L1 at (10, 10), L2 at (-10, -10): distance sqrt(800)
        let distance = 800.0_f64.sqrt();
        let routes = vec![row("L1", "L2", "METALS", distance, 10, 13, 1, 1000)];

        let best = best_route(routes, 3, &[]).unwrap();
        assert_eq!(best.purchase_location, "L1");
        assert_eq!(best.sell_location, "L2");
        assert!((best.distance - 28.2843).abs() < 1e-4);
        assert!((best.profit_speed_volume_distance - 0.3182).abs() < 1e-4);
        assert!((best.cost_volume_distance - 0.1061).abs() < 1e-4);
    }

    #[test]
    fn test_selects_max_psvd() {
        let routes = vec![
            row("L1", "L2", "METALS", 10.0, 10, 12, 1, 1000),
            row("L1", "L3", "FOOD", 10.0, 10, 20, 1, 1000),
            row("L1", "L4", "DRONES", 10.0, 10, 15, 1, 1000),
        ];

        let best = best_route(routes, 2, &[]).unwrap();
        assert_eq!(best.sell_location, "L3");
        assert_eq!(best.good, "FOOD");
    }

    #[test]
    fn test_denylisted_sell_location_is_skipped() {
        let routes = vec![
            row("L1", "OE-W-XV", "METALS", 10.0, 10, 50, 1, 1000),
            row("L1", "L2", "METALS", 10.0, 10, 12, 1, 1000),
        ];

        let denylist = vec!["OE-W-XV".to_string()];
        let best = best_route(routes, 1, &denylist).unwrap();
        assert_eq!(best.sell_location, "L2");
    }

    #[test]
    fn test_thin_purchase_quantity_is_skipped() {
        let routes = vec![
            row("L1", "L2", "METALS", 10.0, 10, 50, 1, 499),
            row("L1", "L3", "METALS", 10.0, 10, 12, 1, 500),
        ];

        let best = best_route(routes, 1, &[]).unwrap();
        assert_eq!(best.sell_location, "L3");
    }

    #[test]
    fn test_negative_profit_route_is_admissible() {
        let routes = vec![row("L1", "L2", "METALS", 10.0, 20, 15, 1, 1000)];

        let best = best_route(routes, 1, &[]).unwrap();
        assert!(best.profit_speed_volume_distance < 0.0);
    }

    #[test]
    fn test_tie_break_keeps_first_encountered() {
        let routes = vec![
            row("L1", "L2", "METALS", 10.0, 10, 15, 1, 1000),
            row("L1", "L3", "METALS", 10.0, 10, 15, 1, 1000),
        ];

        let best = best_route(routes, 1, &[]).unwrap();
        assert_eq!(best.sell_location, "L2");
    }

    #[test]
    fn test_no_admissible_route() {
        let routes = vec![row("L1", "L2", "METALS", 10.0, 10, 15, 1, 100)];
        assert!(best_route(routes, 1, &[]).is_none());
    }
}
