//! Daemon configuration

use anyhow::anyhow;

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub username: String,
    pub postgres_url: String,
    /// System the daemon operates in. Single system only for now.
    pub system: String,
    /// Verbose logging for scout agents
    pub enable_scouts: bool,
    /// Verbose logging for trader agents
    pub enable_trader: bool,
    /// Truncate all daemon tables at startup (for game universe resets)
    pub enable_reset: bool,
    /// Upper bound on fleet size
    pub ship_limit: usize,
    /// Credits to keep in reserve; above this the coordinator buys ships
    pub ship_purchase_reserve: i64,
    /// Credits above which outstanding loans get paid off
    pub loan_payoff_threshold: i64,
    /// Ship type purchased by the fleet policy; empty picks the fastest ship
    pub new_ship_type: Option<String>,
    /// Sell locations excluded from route evaluation
    pub route_denylist: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let username = std::env::var("USERNAME")
            .map_err(|_| anyhow!("USERNAME environment variable required"))?;

        let postgres_url = std::env::var("POSTGRES_URL")
            .map_err(|_| anyhow!("POSTGRES_URL environment variable required"))?;

        let system = std::env::var("SYSTEM").unwrap_or_else(|_| "OE".to_string());

        let ship_limit = parse_var("SHIP_LIMIT", 20)?;
        let ship_purchase_reserve = parse_var("SHIP_PURCHASE_RESERVE", 50_000)?;
        let loan_payoff_threshold = parse_var("LOAN_PAYOFF_THRESHOLD", 1_000_000)?;

        let new_ship_type = match std::env::var("NEW_SHIP_TYPE") {
            Ok(t) if t.is_empty() => None,
            Ok(t) => Some(t),
            Err(_) => Some("JW-MK-I".to_string()),
        };

        let route_denylist = std::env::var("ROUTE_DENYLIST")
            .unwrap_or_else(|_| "OE-XV-91-2,OE-W-XV".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            username,
            postgres_url,
            system,
            enable_scouts: bool_var("ENABLE_SCOUTS"),
            enable_trader: bool_var("ENABLE_TRADER"),
            enable_reset: bool_var("ENABLE_RESET"),
            ship_limit,
            ship_purchase_reserve,
            loan_payoff_threshold,
            new_ship_type,
            route_denylist,
        })
    }
}

fn bool_var(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow!("invalid value for {}: {}", name, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        std::env::set_var("USERNAME", "tester");
        std::env::set_var("POSTGRES_URL", "postgres://localhost/fleet");

        let config = Config::from_env().unwrap();
        assert_eq!(config.system, "OE");
        assert_eq!(config.ship_limit, 20);
        assert_eq!(config.ship_purchase_reserve, 50_000);
        assert_eq!(config.loan_payoff_threshold, 1_000_000);
        assert_eq!(config.new_ship_type.as_deref(), Some("JW-MK-I"));
        assert_eq!(
            config.route_denylist,
            vec!["OE-XV-91-2".to_string(), "OE-W-XV".to_string()]
        );
        assert!(!config.enable_reset);
    }
}
