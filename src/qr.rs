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

//! QR proof-of-booking payments.
//!
//! A rider shows a token for a confirmed booking; the driver scans it and
//! the fare moves from rider to driver. Tokens are not stored: each one is
//! `<booking id>.<keyed digest>` and is verified by recomputing the digest.
//!
//! Redemption holds the booking's lock from the "already paid?" check until
//! the booking is marked paid, so two scans of the same token cannot both
//! charge the rider. The ledger reference `ride_payment:<booking id>` makes
//! the transfer itself idempotent as well.

use crate::base::{BookingId, Clock, UserId};
use crate::booking::{Booking, BookingBook, BookingStatus};
use crate::error::MarketplaceError;
use crate::fees::{FeeSchedule, PaymentBreakdown};
use crate::inventory::SeatInventory;
use crate::ledger::{Ledger, TransferRequest};
use chrono::{DateTime, Utc};
use constant_time_eq::constant_time_eq;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DIGEST_HEX_LEN: usize = 32;

/// What the rider's phone renders as a QR code.
///
/// Only `token` is trusted. `amount` and `seats` are for display; the charge
/// is always recomputed from the stored booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub token: String,
    pub booking_id: BookingId,
    pub amount: Decimal,
    pub seats: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub booking_id: BookingId,
    pub rider_id: UserId,
    pub driver_id: UserId,
    pub breakdown: PaymentBreakdown,
    pub reference: String,
    pub paid_at: DateTime<Utc>,
    /// No confirmed, unpaid passenger is left on the trip.
    pub trip_fully_paid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemOutcome {
    /// The rider was charged by this call.
    Paid(PaymentReceipt),
    /// The booking had already been paid; nothing happened.
    AlreadyPaid(BookingId),
}

impl RedeemOutcome {
    pub fn booking_id(&self) -> BookingId {
        match self {
            Self::Paid(receipt) => receipt.booking_id,
            Self::AlreadyPaid(id) => *id,
        }
    }
}

/// Ledger reference used for a booking's payment.
pub fn payment_reference(booking: &BookingId) -> String {
    format!("ride_payment:{booking}")
}

pub struct QrProtocol {
    bookings: Arc<BookingBook>,
    inventory: Arc<SeatInventory>,
    ledger: Arc<Ledger>,
    fees: FeeSchedule,
    secret: String,
    clock: Arc<dyn Clock>,
}

impl QrProtocol {
    pub fn new(
        bookings: Arc<BookingBook>,
        inventory: Arc<SeatInventory>,
        ledger: Arc<Ledger>,
        fees: FeeSchedule,
        secret: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bookings,
            inventory,
            ledger,
            fees,
            secret: secret.into(),
            clock,
        }
    }

    fn digest(&self, booking: &BookingId) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(booking.to_string().as_bytes());
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(DIGEST_HEX_LEN);
        digest
    }

    /// Deterministic token for a booking; the same id always yields the same token.
    pub fn token_for(&self, booking: &BookingId) -> String {
        format!("{booking}.{}", self.digest(booking))
    }

    /// Maps a token back to its booking id.
    pub fn resolve(&self, token: &str) -> Result<BookingId, MarketplaceError> {
        let (id, digest) = token
            .trim()
            .split_once('.')
            .ok_or(MarketplaceError::TokenInvalid)?;
        let booking: BookingId = id.parse().map_err(|_| MarketplaceError::TokenInvalid)?;
        let expected = self.digest(&booking);
        if !constant_time_eq(digest.as_bytes(), expected.as_bytes()) {
            return Err(MarketplaceError::TokenInvalid);
        }
        Ok(booking)
    }

    /// Produces the QR payload for a confirmed booking. Rider only.
    pub fn issue(&self, booking_id: &BookingId, actor: UserId) -> Result<QrPayload, MarketplaceError> {
        let booking = self.bookings.get(booking_id)?;
        if booking.rider_id != actor {
            return Err(MarketplaceError::NotBookingRider);
        }
        if booking.status != BookingStatus::Confirmed || booking.is_paid() {
            return Err(MarketplaceError::BookingNotPayable {
                status: booking.status.to_string(),
            });
        }
        let breakdown = PaymentBreakdown::compute(booking.total_amount, &self.fees);
        Ok(QrPayload {
            token: self.token_for(booking_id),
            booking_id: *booking_id,
            amount: breakdown.rider_charge,
            seats: booking.seats_booked,
        })
    }

    /// Driver scans a rider's token.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::TokenInvalid`] - Token malformed, forged, or for an unknown booking.
    /// - [`MarketplaceError::NotTripDriver`] - Scanner does not drive this trip.
    /// - [`MarketplaceError::BookingNotPayable`] - Booking not confirmed, or trip not running.
    /// - [`MarketplaceError::InsufficientFunds`] - Rider cannot cover fare plus fee; booking unchanged.
    pub fn redeem(&self, token: &str, driver: UserId) -> Result<RedeemOutcome, MarketplaceError> {
        let booking_id = self.resolve(token)?;
        let handle = self
            .bookings
            .handle(&booking_id)
            .map_err(|_| MarketplaceError::TokenInvalid)?;

        let mut booking = handle.lock();
        if booking.driver_id != driver {
            return Err(MarketplaceError::NotTripDriver);
        }
        if booking.is_paid() {
            debug!(booking = %booking_id, "rescan of paid booking ignored");
            return Ok(RedeemOutcome::AlreadyPaid(booking_id));
        }
        if booking.status != BookingStatus::Confirmed {
            return Err(MarketplaceError::BookingNotPayable {
                status: booking.status.to_string(),
            });
        }
        let trip_status = self.inventory.trip(&booking.trip_id)?.status();
        if !trip_status.accepts_payments() {
            return Err(MarketplaceError::BookingNotPayable {
                status: format!("trip {trip_status}"),
            });
        }

        let breakdown = PaymentBreakdown::compute(booking.total_amount, &self.fees);
        let reference = payment_reference(&booking_id);
        let transfer = self.ledger.transfer(TransferRequest::ride_payment(
            booking.rider_id,
            booking.driver_id,
            &breakdown,
            reference.clone(),
        ));
        let outcome = match transfer {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(booking = %booking_id, %error, "scan payment failed");
                return Err(error);
            }
        };
        if outcome.is_duplicate() {
            warn!(booking = %booking_id, "payment already journaled, marking booking paid");
        }

        let paid_at = self.clock.now();
        booking.mark_paid(&breakdown, &reference, paid_at);
        let paid: Booking = booking.clone();
        drop(booking);

        self.inventory.invalidate_driver(paid.driver_id);
        let trip_fully_paid = self
            .bookings
            .for_trip(&paid.trip_id)
            .iter()
            .all(|b| b.status != BookingStatus::Confirmed);
        info!(
            booking = %booking_id,
            rider = %paid.rider_id,
            driver = %paid.driver_id,
            charged = %breakdown.rider_charge,
            earned = %breakdown.driver_receives,
            trip_fully_paid,
            "booking paid by scan"
        );

        Ok(RedeemOutcome::Paid(PaymentReceipt {
            booking_id,
            rider_id: paid.rider_id,
            driver_id: paid.driver_id,
            breakdown,
            reference,
            paid_at,
            trip_fully_paid,
        }))
    }

    /// Redeems a scanned payload, trusting only its token.
    pub fn redeem_payload(
        &self,
        payload: &QrPayload,
        driver: UserId,
    ) -> Result<RedeemOutcome, MarketplaceError> {
        if self.resolve(&payload.token)? != payload.booking_id {
            return Err(MarketplaceError::TokenInvalid);
        }
        self.redeem(&payload.token, driver)
    }
}
