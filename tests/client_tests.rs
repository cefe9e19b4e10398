//! Client behavior against a local mock game server.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use fleet_runner::client::Client;
use fleet_runner::error::ClientError;
use fleet_runner::ship::parse_required_fuel;

async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    format!("http://{}", addr)
}

#[tokio::test]
async fn test_rate_limit_backoff_then_success() {
    let hits = Arc::new(AtomicU32::new(0));

    let app = Router::new().route(
        "/game/status",
        get({
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        (
                            StatusCode::TOO_MANY_REQUESTS,
                            [("retry-after", "0.005")],
                            r#"{"error": {"message": "Too many requests", "code": 42901}}"#,
                        )
                            .into_response()
                    } else {
                        Json(json!({"status": "ok"})).into_response()
                    }
                }
            }
        }),
    );

    let base_url = spawn_server(app).await;
    let client = Client::new().unwrap().with_base_url(&base_url);

    let started = Instant::now();
    let status = client.get_game_status().await.unwrap();

    assert_eq!(status.status, "ok");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= Duration::from_millis(5));
}

#[tokio::test]
async fn test_internal_server_errors_exhaust_retry_budget() {
    let hits = Arc::new(AtomicU32::new(0));

    let app = Router::new().route(
        "/game/status",
        get({
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
                }
            }
        }),
    );

    let base_url = spawn_server(app).await;
    let client = Client::new().unwrap().with_base_url(&base_url);

    let err = client.get_game_status().await.unwrap_err();

    assert!(matches!(err, ClientError::TooManyRetries), "got {err:?}");
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_invalid_json_response_is_terminal() {
    let hits = Arc::new(AtomicU32::new(0));

    let app = Router::new().route(
        "/game/status",
        get({
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::OK, "{this is invalid json}").into_response()
                }
            }
        }),
    );

    let base_url = spawn_server(app).await;
    let client = Client::new().unwrap().with_base_url(&base_url);

    let err = client.get_game_status().await.unwrap_err();

    assert!(
        matches!(err, ClientError::UnableToDecodeResponse(_)),
        "got {err:?}"
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1, "decode failures must not retry");
}

#[tokio::test]
async fn test_unauthorized_is_terminal() {
    let app = Router::new().route(
        "/my/account",
        get(|| async { (StatusCode::UNAUTHORIZED, "").into_response() }),
    );

    let base_url = spawn_server(app).await;
    let client = Client::new()
        .unwrap()
        .with_base_url(&base_url)
        .authorize("expired-token");

    let err = client.get_my_info().await.unwrap_err();
    assert!(matches!(err, ClientError::Unauthorized), "got {err:?}");
}

#[tokio::test]
async fn test_maintenance_mode_surfaces() {
    let app = Router::new().route(
        "/game/status",
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "").into_response() }),
    );

    let base_url = spawn_server(app).await;
    let client = Client::new().unwrap().with_base_url(&base_url);

    let err = client.get_game_status().await.unwrap_err();
    assert!(matches!(err, ClientError::MaintenanceMode), "got {err:?}");
}

#[tokio::test]
async fn test_remote_error_envelope_is_decoded() {
    let app = Router::new().route(
        "/game/status",
        get(|| async {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"message": "An error occurred", "code": 40001}})),
            )
                .into_response()
        }),
    );

    let base_url = spawn_server(app).await;
    let client = Client::new().unwrap().with_base_url(&base_url);

    let err = client.get_game_status().await.unwrap_err();
    match err {
        ClientError::Remote { message, code } => {
            assert_eq!(message, "An error occurred");
            assert_eq!(code, 40001);
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_bearer_token_is_sent() {
    let app = Router::new().route(
        "/my/account",
        get(|headers: HeaderMap| async move {
            let auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if auth != "Bearer test-token" {
                return (StatusCode::UNAUTHORIZED, "").into_response();
            }

            Json(json!({
                "user": {
                    "username": "tester",
                    "credits": 12345,
                    "shipCount": 1,
                    "joinedAt": "2021-05-01T00:00:00Z"
                }
            }))
            .into_response()
        }),
    );

    let base_url = spawn_server(app).await;
    let client = Client::new()
        .unwrap()
        .with_base_url(&base_url)
        .authorize("test-token");

    let info = client.get_my_info().await.unwrap();
    assert_eq!(info.user.username, "tester");
    assert_eq!(info.user.credits, 12345);
}

#[tokio::test]
async fn test_requests_are_strictly_serialized() {
    let in_flight = Arc::new(AtomicI32::new(0));
    let max_in_flight = Arc::new(AtomicI32::new(0));

    let app = Router::new().route(
        "/game/status",
        get({
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            move || {
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Json(json!({"status": "ok"})).into_response()
                }
            }
        }),
    );

    let base_url = spawn_server(app).await;
    let client = Client::new().unwrap().with_base_url(&base_url);

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let client = client.clone();
        tasks.push(tokio::spawn(
            async move { client.get_game_status().await },
        ));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(
        max_in_flight.load(Ordering::SeqCst),
        1,
        "the serialization lock must keep exactly one request in flight"
    );
}

#[tokio::test]
async fn test_claim_username() {
    let app = Router::new().route(
        "/users/{username}/token",
        post(|Path(username): Path<String>| async move {
            Json(json!({
                "token": "fresh-token",
                "user": {"username": username, "credits": 0}
            }))
        }),
    );

    let base_url = spawn_server(app).await;
    let client = Client::new().unwrap().with_base_url(&base_url);

    let claimed = client.claim_username("tester").await.unwrap();
    assert_eq!(claimed.token, "fresh-token");
    assert_eq!(claimed.user.username, "tester");
    assert_eq!(claimed.user.credits, 0);
}

#[tokio::test]
async fn test_purchase_order_round_trip() {
    let app = Router::new().route(
        "/my/purchase-orders",
        post(|Json(body): Json<serde_json::Value>| async move {
            assert_eq!(body["shipId"], "ship-1");
            assert_eq!(body["good"], "FUEL");
            assert_eq!(body["quantity"], 20);

            Json(json!({
                "credits": 99_880,
                "order": {"good": "FUEL", "quantity": 20, "pricePerUnit": 6, "total": 120},
                "ship": {
                    "location": "OE-PM",
                    "cargo": [{"good": "FUEL", "quantity": 20, "totalVolume": 20}],
                    "spaceAvailable": 30
                }
            }))
        }),
    );

    let base_url = spawn_server(app).await;
    let client = Client::new()
        .unwrap()
        .with_base_url(&base_url)
        .authorize("test-token");

    let resp = client
        .create_purchase_order("ship-1", "FUEL", 20)
        .await
        .unwrap();

    assert_eq!(resp.credits, 99_880);
    assert_eq!(resp.order.total, 120);
    assert_eq!(resp.ship.space_available, 30);
    assert_eq!(resp.ship.cargo[0].quantity, 20);
}

#[tokio::test]
async fn test_fuel_probe_rejection_carries_required_quantity() {
    let app = Router::new().route(
        "/my/flight-plans",
        post(|| async {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": {
                        "message": "You require 17 more FUEL to make this flight.",
                        "code": 3001
                    }
                })),
            )
                .into_response()
        }),
    );

    let base_url = spawn_server(app).await;
    let client = Client::new()
        .unwrap()
        .with_base_url(&base_url)
        .authorize("test-token");

    let err = client.create_flight_plan("ship-1", "OE-CR").await.unwrap_err();
    let message = err.remote_message().expect("remote message");

    assert_eq!(parse_required_fuel(message), Some(17));
}

#[tokio::test]
async fn test_marketplace_decodes() {
    let app = Router::new().route(
        "/locations/{location}/marketplace",
        get(|Path(location): Path<String>| async move {
            assert_eq!(location, "OE-PM");
            Json(json!({
                "marketplace": [
                    {
                        "symbol": "METALS",
                        "volumePerUnit": 1,
                        "purchasePricePerUnit": 10,
                        "sellPricePerUnit": 11,
                        "quantityAvailable": 1000
                    }
                ]
            }))
        }),
    );

    let base_url = spawn_server(app).await;
    let client = Client::new()
        .unwrap()
        .with_base_url(&base_url)
        .authorize("test-token");

    let resp = client.get_location_marketplace("OE-PM").await.unwrap();
    assert_eq!(resp.marketplace.len(), 1);
    assert_eq!(resp.marketplace[0].good, "METALS");
    assert_eq!(resp.marketplace[0].purchase_price_per_unit, 10);
}

#[tokio::test]
async fn test_location_and_loan_catalogs() {
    let app = Router::new()
        .route(
            "/locations/{location}",
            get(|Path(location): Path<String>| async move {
                Json(json!({
                    "location": {
                        "symbol": location,
                        "type": "PLANET",
                        "name": "Prime",
                        "x": 10,
                        "y": -5
                    },
                    "dockedShips": 3
                }))
            }),
        )
        .route(
            "/types/loans",
            get(|| async {
                Json(json!({
                    "loans": [{
                        "type": "STARTUP",
                        "amount": 200000,
                        "rate": 40.0,
                        "termInDays": 2,
                        "collateralRequired": false
                    }]
                }))
            }),
        )
        .route(
            "/my/flight-plans/{id}",
            get(|Path(id): Path<String>| async move {
                Json(json!({
                    "flightPlan": {
                        "id": id,
                        "shipId": "ship-1",
                        "fuelConsumed": 2,
                        "fuelRemaining": 0,
                        "timeRemainingInSeconds": 30,
                        "createdAt": "2021-05-01T00:00:00Z",
                        "arrivesAt": "2021-05-01T00:00:30Z",
                        "destination": "OE-CR",
                        "departure": "OE-PM",
                        "distance": 12
                    }
                }))
            }),
        );

    let base_url = spawn_server(app).await;
    let client = Client::new()
        .unwrap()
        .with_base_url(&base_url)
        .authorize("test-token");

    let location = client.get_location("OE-PM").await.unwrap();
    assert_eq!(location.location.symbol, "OE-PM");
    assert_eq!(location.location.x, 10);
    assert_eq!(location.docked_ships, 3);

    let loans = client.get_available_loans().await.unwrap();
    assert_eq!(loans.loans[0].loan_type, "STARTUP");
    assert_eq!(loans.loans[0].amount, 200000);

    let plan = client.get_flight_plan("plan-1").await.unwrap();
    assert_eq!(plan.flight_plan.id, "plan-1");
    assert_eq!(plan.flight_plan.departure, "OE-PM");
}

#[tokio::test]
async fn test_warp_jump_round_trip() {
    let app = Router::new().route(
        "/my/warp-jumps",
        post(|Json(body): Json<serde_json::Value>| async move {
            assert_eq!(body["shipId"], "ship-1");
            Json(json!({
                "flightPlan": {
                    "id": "warp-1",
                    "shipId": "ship-1",
                    "fuelConsumed": 40,
                    "fuelRemaining": 0,
                    "timeRemainingInSeconds": 120,
                    "createdAt": "2021-05-01T00:00:00Z",
                    "arrivesAt": "2021-05-01T00:02:00Z",
                    "destination": "XV-ST",
                    "departure": "OE-PM",
                    "distance": 0
                }
            }))
        }),
    );

    let base_url = spawn_server(app).await;
    let client = Client::new()
        .unwrap()
        .with_base_url(&base_url)
        .authorize("test-token");

    let resp = client.warp_jump("ship-1").await.unwrap();
    assert_eq!(resp.flight_plan.id, "warp-1");
    assert_eq!(resp.flight_plan.destination, "XV-ST");
    assert_eq!(resp.flight_plan.time_remaining_in_seconds, 120);
}
