//! Fleet Runner
//!
//! Autonomous trading daemon for the SpaceTraders game API: one coordinator
//! per user account, one agent per ship, a single rate-limited gateway for
//! all outbound requests, and a Postgres knowledge base of market prices.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod purchase;
pub mod ship;
pub mod trade;
pub mod types;

pub use client::{AuthorizedClient, Client};
pub use config::Config;
pub use error::ClientError;
pub use ship::ShipAgent;
pub use trade::Route;
pub use types::{Cargo, Loan, RoleData, Ship, ShipMessage, User};
