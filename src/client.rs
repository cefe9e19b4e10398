//! Rate-limited client for the SpaceTraders game API.
//!
//! Every request in the process goes through one shared critical section: the
//! game applies a global per-token rate limit, so concurrent requests would
//! burn the budget racing each other. Serializing them keeps exactly one
//! request in flight and lets 429 back-off actually drain the limiter.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::types::{
    Cargo, FlightPlanData, Loan, LocationData, MarketplaceEntry, OrderData, ShipData, ShipForSale,
};

const DEFAULT_BASE_URL: &str = "https://api.spacetraders.io";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Genuine-error retries (500s) are capped at this many attempts.
const MAX_ATTEMPTS: u32 = 3;

/// 429 waits are flow control rather than failures, so they don't consume the
/// retry budget, but a single call still can't spin on them forever.
const RATE_LIMIT_DEADLINE: Duration = Duration::from_secs(60);

/// Unauthenticated client. All clones share the same serialization lock.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    gate: Arc<Mutex<()>>,
    token: Option<String>,
}

impl Client {
    pub fn new() -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);

        if let Ok(proxy) = std::env::var("HTTP_PROXY") {
            if !proxy.is_empty() {
                builder = builder.proxy(reqwest::Proxy::all(&proxy)?);
            }
        }

        Ok(Self {
            http: builder.build()?,
            base_url: DEFAULT_BASE_URL.to_string(),
            gate: Arc::new(Mutex::new(())),
            token: None,
        })
    }

    /// Override the default base url. Only used by tests.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Wrap this client with a bearer token for the account-scoped endpoints.
    /// The serialization lock is shared with the unauthenticated client.
    pub fn authorize(&self, token: impl Into<String>) -> AuthorizedClient {
        let mut client = self.clone();
        client.token = Some(token.into());
        AuthorizedClient { client }
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, ClientError> {
        // Absolute urls bypass the base url (the external-ip lookup needs this).
        let url = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        };

        // Held across the round-trip and the back-off sleeps below.
        let _gate = self.gate.lock().await;

        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("Content-Type", "application/json");
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_success() {
                let bytes = response.bytes().await?;
                return serde_json::from_slice(&bytes)
                    .map_err(|e| ClientError::UnableToDecodeResponse(e.to_string()));
            }

            match status.as_u16() {
                401 => return Err(ClientError::Unauthorized),
                429 => {
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<f64>().ok())
                        .ok_or_else(|| {
                            ClientError::UnableToDecodeResponse(
                                "unable to parse retry-after header as seconds".to_string(),
                            )
                        })?;

                    if started.elapsed() > RATE_LIMIT_DEADLINE {
                        return Err(ClientError::TooManyRetries);
                    }

                    let wait = Duration::from_millis((retry_after * 1000.0).round() as u64);
                    debug!(?wait, %method, %url, "rate limited, backing off");
                    sleep(wait).await;
                }
                500 => {
                    attempts += 1;
                    if attempts >= MAX_ATTEMPTS {
                        return Err(ClientError::TooManyRetries);
                    }

                    warn!(%method, %url, "internal server error, retrying in 2s");
                    sleep(Duration::from_secs(2)).await;
                }
                503 => return Err(ClientError::MaintenanceMode),
                _ => {
                    let bytes = response.bytes().await?;
                    let envelope: ErrorEnvelope = serde_json::from_slice(&bytes)
                        .map_err(|e| ClientError::UnableToDecodeResponse(e.to_string()))?;
                    return Err(ClientError::Remote {
                        message: envelope.error.message,
                        code: envelope.error.code,
                    });
                }
            }
        }
    }

    /// The client's current external ip address.
    pub async fn get_my_ip_address(&self) -> Result<MyIpAddressResponse, ClientError> {
        self.execute(Method::GET, "https://api.ipify.org?format=json", None)
            .await
    }

    /// Claim a username and receive its bearer token.
    pub async fn claim_username(
        &self,
        username: &str,
    ) -> Result<ClaimUsernameResponse, ClientError> {
        self.execute(Method::POST, &format!("/users/{}/token", username), None)
            .await
    }

    /// Current status of the game server. 503 surfaces as `MaintenanceMode`.
    pub async fn get_game_status(&self) -> Result<GameStatusResponse, ClientError> {
        self.execute(Method::GET, "/game/status", None).await
    }
}

/// Token-bearing client for all account, ship, and market operations.
#[derive(Clone)]
pub struct AuthorizedClient {
    client: Client,
}

impl AuthorizedClient {
    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, ClientError> {
        self.client.execute(method, path, body).await
    }

    fn encode<B: Serialize>(body: &B) -> Result<serde_json::Value, ClientError> {
        serde_json::to_value(body).map_err(ClientError::InvalidRequest)
    }

    pub async fn get_my_info(&self) -> Result<GetMyInfoResponse, ClientError> {
        self.execute(Method::GET, "/my/account", None).await
    }

    pub async fn get_my_loans(&self) -> Result<GetMyLoansResponse, ClientError> {
        self.execute(Method::GET, "/my/loans", None).await
    }

    pub async fn create_loan(&self, loan_type: &str) -> Result<CreateLoanResponse, ClientError> {
        let body = Self::encode(&CreateLoanRequest {
            loan_type: loan_type.to_string(),
        })?;
        self.execute(Method::POST, "/my/loans", Some(body)).await
    }

    pub async fn pay_off_loan(&self, loan_id: &str) -> Result<PayOffLoanResponse, ClientError> {
        self.execute(Method::PUT, &format!("/my/loans/{}", loan_id), None)
            .await
    }

    pub async fn get_my_ships(&self) -> Result<GetMyShipsResponse, ClientError> {
        self.execute(Method::GET, "/my/ships", None).await
    }

    pub async fn get_my_ship(&self, ship_id: &str) -> Result<GetMyShipResponse, ClientError> {
        self.execute(Method::GET, &format!("/my/ships/{}", ship_id), None)
            .await
    }

    pub async fn purchase_ship(
        &self,
        location: &str,
        ship_type: &str,
    ) -> Result<PurchaseShipResponse, ClientError> {
        let body = Self::encode(&PurchaseShipRequest {
            location: location.to_string(),
            ship_type: ship_type.to_string(),
        })?;
        self.execute(Method::POST, "/my/ships", Some(body)).await
    }

    pub async fn get_ships_for_sale(&self) -> Result<GetShipsForSaleResponse, ClientError> {
        self.execute(Method::GET, "/game/ships", None).await
    }

    pub async fn get_flight_plan(
        &self,
        flight_plan_id: &str,
    ) -> Result<FlightPlanResponse, ClientError> {
        self.execute(
            Method::GET,
            &format!("/my/flight-plans/{}", flight_plan_id),
            None,
        )
        .await
    }

    pub async fn create_flight_plan(
        &self,
        ship_id: &str,
        destination: &str,
    ) -> Result<FlightPlanResponse, ClientError> {
        let body = Self::encode(&CreateFlightPlanRequest {
            ship_id: ship_id.to_string(),
            destination: destination.to_string(),
        })?;
        self.execute(Method::POST, "/my/flight-plans", Some(body))
            .await
    }

    pub async fn create_purchase_order(
        &self,
        ship_id: &str,
        good: &str,
        quantity: i32,
    ) -> Result<OrderResponse, ClientError> {
        let body = Self::encode(&OrderRequest {
            ship_id: ship_id.to_string(),
            good: good.to_string(),
            quantity,
        })?;
        self.execute(Method::POST, "/my/purchase-orders", Some(body))
            .await
    }

    pub async fn create_sell_order(
        &self,
        ship_id: &str,
        good: &str,
        quantity: i32,
    ) -> Result<OrderResponse, ClientError> {
        let body = Self::encode(&OrderRequest {
            ship_id: ship_id.to_string(),
            good: good.to_string(),
            quantity,
        })?;
        self.execute(Method::POST, "/my/sell-orders", Some(body))
            .await
    }

    pub async fn get_location(&self, location: &str) -> Result<GetLocationResponse, ClientError> {
        self.execute(Method::GET, &format!("/locations/{}", location), None)
            .await
    }

    pub async fn get_location_marketplace(
        &self,
        location: &str,
    ) -> Result<GetLocationMarketplaceResponse, ClientError> {
        self.execute(
            Method::GET,
            &format!("/locations/{}/marketplace", location),
            None,
        )
        .await
    }

    pub async fn get_system(&self, system: &str) -> Result<GetSystemResponse, ClientError> {
        self.execute(Method::GET, &format!("/systems/{}", system), None)
            .await
    }

    pub async fn get_system_locations(
        &self,
        system: &str,
    ) -> Result<GetSystemLocationsResponse, ClientError> {
        self.execute(Method::GET, &format!("/systems/{}/locations", system), None)
            .await
    }

    pub async fn get_available_loans(&self) -> Result<GetAvailableLoansResponse, ClientError> {
        self.execute(Method::GET, "/types/loans", None).await
    }

    /// Inter-system travel. No role drives this yet.
    pub async fn warp_jump(&self, ship_id: &str) -> Result<FlightPlanResponse, ClientError> {
        let body = Self::encode(&WarpJumpRequest {
            ship_id: ship_id.to_string(),
        })?;
        self.execute(Method::POST, "/my/warp-jumps", Some(body))
            .await
    }
}

// Request bodies

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateFlightPlanRequest {
    ship_id: String,
    destination: String,
}

#[derive(Debug, Serialize)]
struct CreateLoanRequest {
    #[serde(rename = "type")]
    loan_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderRequest {
    ship_id: String,
    good: String,
    quantity: i32,
}

#[derive(Debug, Serialize)]
struct PurchaseShipRequest {
    location: String,
    #[serde(rename = "type")]
    ship_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WarpJumpRequest {
    ship_id: String,
}

// Response envelopes

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    code: i64,
}

#[derive(Debug, Deserialize)]
pub struct MyIpAddressResponse {
    pub ip: String,
}

#[derive(Debug, Deserialize)]
pub struct GameStatusResponse {
    pub status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedUser {
    pub username: String,
    pub credits: i64,
}

#[derive(Debug, Deserialize)]
pub struct ClaimUsernameResponse {
    pub token: String,
    pub user: ClaimedUser,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub username: String,
    pub credits: i64,
    pub ship_count: i32,
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
pub struct GetMyInfoResponse {
    pub user: AccountInfo,
}

#[derive(Debug, Deserialize)]
pub struct GetMyLoansResponse {
    pub loans: Vec<Loan>,
}

#[derive(Debug, Deserialize)]
pub struct CreateLoanResponse {
    pub credits: i64,
    pub loan: Loan,
}

#[derive(Debug, Deserialize)]
pub struct PayOffLoanResponse {
    pub credits: i64,
    pub loans: Vec<Loan>,
}

#[derive(Debug, Deserialize)]
pub struct GetMyShipsResponse {
    pub ships: Vec<ShipData>,
}

#[derive(Debug, Deserialize)]
pub struct GetMyShipResponse {
    pub ship: ShipData,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseShipResponse {
    pub credits: i64,
    pub ship: ShipData,
}

#[derive(Debug, Deserialize)]
pub struct GetShipsForSaleResponse {
    #[serde(rename = "ships")]
    pub ships_for_sale: Vec<ShipForSale>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightPlanResponse {
    pub flight_plan: FlightPlanData,
}

#[derive(Debug, Deserialize)]
pub struct OrderResponse {
    pub credits: i64,
    pub order: OrderData,
    pub ship: OrderShip,
}

/// Ship fields included in order responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderShip {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub cargo: Vec<Cargo>,
    pub space_available: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLocationResponse {
    pub location: LocationData,
    pub docked_ships: i32,
}

#[derive(Debug, Deserialize)]
pub struct GetLocationMarketplaceResponse {
    pub marketplace: Vec<MarketplaceEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SystemData {
    pub symbol: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct GetSystemResponse {
    pub system: SystemData,
}

#[derive(Debug, Deserialize)]
pub struct GetSystemLocationsResponse {
    pub locations: Vec<LocationData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableLoan {
    #[serde(rename = "type")]
    pub loan_type: String,
    pub amount: i64,
    pub rate: f64,
    pub term_in_days: i32,
    pub collateral_required: bool,
}

#[derive(Debug, Deserialize)]
pub struct GetAvailableLoansResponse {
    pub loans: Vec<AvailableLoan>,
}
