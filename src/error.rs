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

//! Error types for marketplace operations.
//!
//! Every failed mutation leaves all participating wallets, trips, bookings and
//! settlements exactly as they were before the call.

use rust_decimal::Decimal;
use thiserror::Error;

/// Marketplace operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarketplaceError {
    /// Not enough unsold seats on the trip. Retryable with fewer seats.
    #[error("only {available} seat(s) available, {requested} requested")]
    SeatsUnavailable { requested: u32, available: u32 },

    /// Wallet balance too low. Correctable by a top-up.
    #[error("insufficient funds: {needed} needed, {available} available")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    /// QR token does not resolve to a booking.
    #[error("invalid booking token")]
    TokenInvalid,

    /// The booking behind a valid token cannot be paid in its current state.
    #[error("booking is not payable (status: {status})")]
    BookingNotPayable { status: String },

    /// Optimistic concurrency retries exhausted.
    #[error("concurrent update conflict, retry later")]
    Conflict,

    /// External payment rail rejected or failed the request.
    #[error("payment gateway failure: {0}")]
    GatewayFailure(String),

    #[error("trip not found")]
    TripNotFound,

    #[error("booking not found")]
    BookingNotFound,

    #[error("settlement not found")]
    SettlementNotFound,

    /// Amount is zero, negative, or otherwise unusable.
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    #[error("invalid seat count (must be at least 1)")]
    InvalidSeatCount,

    #[error("trip is not accepting bookings (status: {status})")]
    TripNotBookable { status: String },

    #[error("trip cannot move from {from} to {to}")]
    InvalidTripTransition { from: String, to: String },

    #[error("booking cannot move from {from} to {to}")]
    InvalidBookingTransition { from: String, to: String },

    #[error("settlement in status {from} does not accept {action}")]
    InvalidSettlementTransition { from: String, action: String },

    /// Caller is not the driver who owns the trip.
    #[error("only the trip's driver may do this")]
    NotTripDriver,

    /// Caller is not the rider who owns the booking.
    #[error("only the booking's rider may do this")]
    NotBookingRider,

    #[error("drivers cannot book their own trip")]
    SelfBooking,

    #[error("rider already holds an open booking on this trip")]
    DuplicateBooking,

    /// Shared secret or admin PIN did not match.
    #[error("unauthorized")]
    Unauthorized,
}

impl MarketplaceError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SeatsUnavailable { .. } => "SEATS_UNAVAILABLE",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::BookingNotPayable { .. } => "BOOKING_NOT_PAYABLE",
            Self::Conflict => "CONFLICT",
            Self::GatewayFailure(_) => "GATEWAY_FAILURE",
            Self::TripNotFound => "TRIP_NOT_FOUND",
            Self::BookingNotFound => "BOOKING_NOT_FOUND",
            Self::SettlementNotFound => "SETTLEMENT_NOT_FOUND",
            Self::InvalidAmount => "INVALID_AMOUNT",
            Self::InvalidSeatCount => "INVALID_SEAT_COUNT",
            Self::TripNotBookable { .. } => "TRIP_NOT_BOOKABLE",
            Self::InvalidTripTransition { .. } => "INVALID_TRIP_TRANSITION",
            Self::InvalidBookingTransition { .. } => "INVALID_BOOKING_TRANSITION",
            Self::InvalidSettlementTransition { .. } => "INVALID_SETTLEMENT_TRANSITION",
            Self::NotTripDriver => "NOT_TRIP_DRIVER",
            Self::NotBookingRider => "NOT_BOOKING_RIDER",
            Self::SelfBooking => "SELF_BOOKING",
            Self::DuplicateBooking => "DUPLICATE_BOOKING",
            Self::Unauthorized => "UNAUTHORIZED",
        }
    }

    /// Whether the caller can reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict | Self::GatewayFailure(_))
    }
}
