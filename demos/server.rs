// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! REST API server example for the ridepool engine.
//!
//! Run with: `cargo run --example server -- --admin-pin 1234 --cron-secret s3cret`
//!
//! The caller identifies itself with an `x-user-id` header holding its user id.
//!
//! ## Endpoints
//!
//! - `POST /trips` - Create a trip (driver)
//! - `POST /trips/{id}/publish` - Open a trip for bookings (driver)
//! - `POST /trips/{id}/cancel` - Cancel a trip and all of its bookings (driver)
//! - `POST /bookings` - Request seats (rider)
//! - `POST /bookings/{id}/confirm` - Accept a booking (driver)
//! - `POST /bookings/{id}/cancel` - Cancel a booking (rider or driver)
//! - `GET /bookings/{id}/qr` - QR payload for a confirmed booking (rider)
//! - `POST /qr/redeem` - Scan a rider's QR payload and take payment (driver)
//! - `POST /wallets/{id}/top-up` - Record a gateway top-up
//! - `GET /wallets/{id}` - Wallet balances
//! - `POST /settlements/trigger` - Generate a settlement batch (scheduler, `x-cron-secret`)
//! - `POST /settlements/approve` - Approve, reject or retry a settlement (admin PIN)
//!
//! ## Example Usage
//!
//! ```bash
//! # Top up a rider
//! curl -X POST http://localhost:3000/wallets/$RIDER/top-up \
//!   -H "Content-Type: application/json" \
//!   -d '{"amount": "50.00", "reference": "pix-1", "gateway": {"status": "confirmed", "gateway_reference": "e2e-1"}}'
//!
//! # Book a seat
//! curl -X POST http://localhost:3000/bookings -H "x-user-id: $RIDER" \
//!   -H "Content-Type: application/json" -d "{\"trip_id\": \"$TRIP\", \"seats\": 1}"
//!
//! # Trigger yesterday's settlements
//! curl -X POST http://localhost:3000/settlements/trigger -H "x-cron-secret: s3cret"
//! ```

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::NaiveDate;
use clap::Parser;
use ridepool_engine::{
    ApprovalRequest, ApprovalResponse, Booking, BookingId, BookingRequest, Engine, EngineConfig,
    GatewayOutcome, MarketplaceError, PaymentReceipt, QrPayload, RedeemOutcome, TripCancellation,
    TripDraft, TripId, TripSnapshot, TriggerResponse, UserId, Wallet,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

// === Request/Response DTOs ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopUpRequest {
    pub amount: Decimal,
    pub reference: String,
    pub gateway: GatewayOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletResponse {
    pub user: UserId,
    pub available: Decimal,
    pub held: Decimal,
    pub total: Decimal,
    pub entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemResponse {
    pub success: bool,
    pub booking_id: BookingId,
    pub already_paid: bool,
    pub receipt: Option<PaymentReceipt>,
}

impl From<RedeemOutcome> for RedeemResponse {
    fn from(outcome: RedeemOutcome) -> Self {
        match outcome {
            RedeemOutcome::Paid(receipt) => Self {
                success: true,
                booking_id: receipt.booking_id,
                already_paid: false,
                receipt: Some(receipt),
            },
            RedeemOutcome::AlreadyPaid(booking_id) => Self {
                success: true,
                booking_id,
                already_paid: true,
                receipt: None,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerParams {
    pub date: Option<NaiveDate>,
}

/// Response body for errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: String,
}

// === Application State ===

/// Shared application state containing the marketplace engine.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

// === Error Handling ===

/// Wrapper for converting `MarketplaceError` into HTTP responses.
pub struct AppError(MarketplaceError);

impl From<MarketplaceError> for AppError {
    fn from(err: MarketplaceError) -> Self {
        AppError(err)
    }
}

fn status_for(error: &MarketplaceError) -> StatusCode {
    use MarketplaceError::*;
    match error {
        InvalidAmount | InvalidSeatCount | TokenInvalid => StatusCode::BAD_REQUEST,
        Unauthorized => StatusCode::UNAUTHORIZED,
        NotTripDriver | NotBookingRider => StatusCode::FORBIDDEN,
        TripNotFound | BookingNotFound | SettlementNotFound => StatusCode::NOT_FOUND,
        SeatsUnavailable { .. }
        | BookingNotPayable { .. }
        | Conflict
        | TripNotBookable { .. }
        | InvalidTripTransition { .. }
        | InvalidBookingTransition { .. }
        | InvalidSettlementTransition { .. }
        | DuplicateBooking => StatusCode::CONFLICT,
        InsufficientFunds { .. } | SelfBooking => StatusCode::UNPROCESSABLE_ENTITY,
        GatewayFailure(_) => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            status_for(&self.0),
            Json(ErrorResponse {
                success: false,
                error: self.0.to_string(),
                code: self.0.code().to_string(),
            }),
        )
            .into_response()
    }
}

/// Reads the caller's id from the `x-user-id` header.
fn caller(headers: &HeaderMap) -> Result<UserId, AppError> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or(AppError(MarketplaceError::Unauthorized))
}

// === Handlers ===

/// POST /trips - Create a trip for the calling driver.
async fn create_trip(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(draft): Json<TripDraft>,
) -> Result<(StatusCode, Json<TripSnapshot>), AppError> {
    let driver = caller(&headers)?;
    let trip = state.engine.create_trip(driver, draft)?;
    Ok((StatusCode::CREATED, Json(trip)))
}

/// POST /trips/{id}/publish
async fn publish_trip(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<TripId>,
) -> Result<Json<TripSnapshot>, AppError> {
    let driver = caller(&headers)?;
    Ok(Json(state.engine.publish_trip(&id, driver)?))
}

/// POST /trips/{id}/cancel
async fn cancel_trip(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<TripId>,
) -> Result<Json<TripCancellation>, AppError> {
    let driver = caller(&headers)?;
    Ok(Json(state.engine.cancel_trip(&id, driver)?))
}

/// POST /bookings - Request seats for the calling rider.
async fn create_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BookingRequest>,
) -> Result<(StatusCode, Json<Booking>), AppError> {
    let rider = caller(&headers)?;
    let booking = state.engine.book(rider, &request)?;
    Ok((StatusCode::CREATED, Json(booking)))
}

/// POST /bookings/{id}/confirm
async fn confirm_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<BookingId>,
) -> Result<Json<Booking>, AppError> {
    let driver = caller(&headers)?;
    Ok(Json(state.engine.confirm_booking(&id, driver)?))
}

/// POST /bookings/{id}/cancel - The booking's rider withdraws, or its driver cancels.
async fn cancel_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<BookingId>,
) -> Result<Json<Booking>, AppError> {
    let actor = caller(&headers)?;
    let booking = state.engine.booking(&id)?;
    let cancelled = if booking.rider_id == actor {
        state.engine.cancel_booking(&id, actor, None)?
    } else {
        state.engine.driver_cancel_booking(&id, actor, None)?
    };
    Ok(Json(cancelled))
}

/// GET /bookings/{id}/qr
async fn booking_qr(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<BookingId>,
) -> Result<Json<QrPayload>, AppError> {
    let rider = caller(&headers)?;
    Ok(Json(state.engine.issue_token(&id, rider)?))
}

/// POST /qr/redeem - Driver submits the scanned payload.
async fn redeem_qr(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<QrPayload>,
) -> Result<Json<RedeemResponse>, AppError> {
    let driver = caller(&headers)?;
    let outcome = state.engine.redeem_payload(&payload, driver)?;
    Ok(Json(RedeemResponse::from(outcome)))
}

/// POST /wallets/{id}/top-up - Record what the payment gateway reported.
async fn top_up(
    State(state): State<AppState>,
    Path(user): Path<UserId>,
    Json(request): Json<TopUpRequest>,
) -> Result<Json<WalletResponse>, AppError> {
    state
        .engine
        .top_up(user, request.amount, &request.gateway, &request.reference)?;
    let wallet = state.engine.ledger().wallet(user);
    Ok(Json(wallet_response(user, &wallet)))
}

/// GET /wallets/{id}
async fn get_wallet(
    State(state): State<AppState>,
    Path(user): Path<UserId>,
) -> Result<Json<WalletResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .engine
        .wallet(&user)
        .map(|wallet| Json(wallet_response(user, &wallet)))
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    success: false,
                    error: "Wallet not found".to_string(),
                    code: "WALLET_NOT_FOUND".to_string(),
                }),
            )
        })
}

fn wallet_response(user: UserId, wallet: &Wallet) -> WalletResponse {
    WalletResponse {
        user,
        available: wallet.available(),
        held: wallet.held(),
        total: wallet.balance(),
        entries: wallet.entries().len(),
    }
}

/// POST /settlements/trigger?date=YYYY-MM-DD
async fn trigger_settlements(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<TriggerParams>,
) -> Result<Json<TriggerResponse>, AppError> {
    let secret = headers
        .get("x-cron-secret")
        .and_then(|value| value.to_str().ok());
    Ok(Json(state.engine.trigger_settlements(secret, params.date)?))
}

/// POST /settlements/approve
async fn approve_settlement(
    State(state): State<AppState>,
    Json(request): Json<ApprovalRequest>,
) -> Result<Json<ApprovalResponse>, AppError> {
    Ok(Json(state.engine.handle_approval(&request)?))
}

// === Router ===

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/trips", post(create_trip))
        .route("/trips/{id}/publish", post(publish_trip))
        .route("/trips/{id}/cancel", post(cancel_trip))
        .route("/bookings", post(create_booking))
        .route("/bookings/{id}/confirm", post(confirm_booking))
        .route("/bookings/{id}/cancel", post(cancel_booking))
        .route("/bookings/{id}/qr", get(booking_qr))
        .route("/qr/redeem", post(redeem_qr))
        .route("/wallets/{id}/top-up", post(top_up))
        .route("/wallets/{id}", get(get_wallet))
        .route("/settlements/trigger", post(trigger_settlements))
        .route("/settlements/approve", post(approve_settlement))
        .with_state(state)
}

// === Main ===

#[derive(Parser, Debug)]
#[command(name = "ridepool-server")]
struct ServerArgs {
    #[arg(long, env = "RIDEPOOL_ADDR", default_value = "127.0.0.1:3000")]
    addr: String,

    /// PIN administrators present to approve settlements
    #[arg(long, env = "RIDEPOOL_ADMIN_PIN")]
    admin_pin: Option<String>,

    /// Shared secret the settlement scheduler sends as `x-cron-secret`
    #[arg(long, env = "RIDEPOOL_CRON_SECRET")]
    cron_secret: Option<String>,

    #[arg(long, env = "RIDEPOOL_TOKEN_SECRET", default_value = "ridepool-dev-token-secret")]
    token_secret: String,
}

impl ServerArgs {
    fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::default().with_token_secret(self.token_secret.clone());
        if let Some(pin) = &self.admin_pin {
            config = config.with_admin_pin(pin);
        }
        if let Some(secret) = &self.cron_secret {
            config = config.with_cron_secret(secret.clone());
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = ServerArgs::parse();
    let state = AppState {
        engine: Arc::new(Engine::with_config(args.config())),
    };

    let listener = TcpListener::bind(&args.addr).await?;
    info!(addr = %args.addr, "ridepool API server listening");

    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
