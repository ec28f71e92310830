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

//! Booking lifecycle.
//!
//! ```text
//!   Pending ──confirm──► Confirmed ──scan paid──► Completed
//!      │                     │
//!      └──reject / cancel────┴──► Cancelled
//! ```
//!
//! Seats are taken from the trip only when the driver confirms, and given
//! back before a confirmed booking is cancelled. Every transition runs with
//! the booking's own lock held, so a seat reservation and the status change
//! that goes with it are never observed apart.

use crate::base::{BookingId, Clock, TripId, UserId};
use crate::error::MarketplaceError;
use crate::fees::{FeeSchedule, PaymentBreakdown};
use crate::inventory::{SeatInventory, TripSnapshot};
use crate::ledger::Ledger;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Still holds or may come to hold seats.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
}

/// A rider's request for seats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub trip_id: TripId,
    pub seats: u32,
    /// Rider asked to be picked up away from the trip's origin.
    #[serde(default)]
    pub custom_pickup: bool,
    /// Rider asked to be dropped off away from the trip's destination.
    #[serde(default)]
    pub custom_dropoff: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub trip_id: TripId,
    pub rider_id: UserId,
    pub driver_id: UserId,
    pub seats_booked: u32,
    pub base_amount: Decimal,
    pub pickup_fee: Decimal,
    pub dropoff_fee: Decimal,
    pub total_amount: Decimal,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    /// Driver's net share, set when the booking is paid.
    pub driver_receives: Option<Decimal>,
    pub payment_reference: Option<String>,
}

impl Booking {
    /// Seats this booking currently takes from the trip's inventory.
    pub fn seats_held(&self) -> u32 {
        match self.status {
            BookingStatus::Confirmed | BookingStatus::Completed => self.seats_booked,
            BookingStatus::Pending | BookingStatus::Cancelled => 0,
        }
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status == PaymentStatus::Paid
    }

    pub(crate) fn mark_paid(
        &mut self,
        breakdown: &PaymentBreakdown,
        reference: &str,
        at: DateTime<Utc>,
    ) {
        self.status = BookingStatus::Completed;
        self.payment_status = PaymentStatus::Paid;
        self.paid_at = Some(at);
        self.driver_receives = Some(breakdown.driver_receives);
        self.payment_reference = Some(reference.to_owned());
    }

    fn invalid(&self, to: BookingStatus) -> MarketplaceError {
        MarketplaceError::InvalidBookingTransition {
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }
}

/// Who is cancelling, for authorization and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Canceller {
    Rider(UserId),
    Driver(UserId),
    TripCancellation,
}

/// Outcome of cancelling a whole trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripCancellation {
    pub trip: TripSnapshot,
    pub cancelled_bookings: Vec<BookingId>,
    pub seats_released: u32,
}

/// Coordinates seat inventory and wallet checks for every booking.
pub struct BookingBook {
    bookings: DashMap<BookingId, Arc<Mutex<Booking>>>,
    by_trip: DashMap<TripId, Vec<BookingId>>,
    inventory: Arc<SeatInventory>,
    ledger: Arc<Ledger>,
    fees: FeeSchedule,
    clock: Arc<dyn Clock>,
}

impl BookingBook {
    pub fn new(
        inventory: Arc<SeatInventory>,
        ledger: Arc<Ledger>,
        fees: FeeSchedule,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bookings: DashMap::new(),
            by_trip: DashMap::new(),
            inventory,
            ledger,
            fees,
            clock,
        }
    }

    /// Creates a `Pending` booking. No seats are taken yet.
    ///
    /// The rider must be able to cover the fare plus the rider service fee
    /// right now; nothing is charged until the booking is scanned.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::InvalidSeatCount`] - Zero seats requested.
    /// - [`MarketplaceError::TripNotBookable`] - Trip has started, ended, or is being cancelled.
    /// - [`MarketplaceError::SelfBooking`] - Rider is the trip's driver.
    /// - [`MarketplaceError::SeatsUnavailable`] - More seats than currently unsold.
    /// - [`MarketplaceError::InsufficientFunds`] - Wallet below `total_amount` plus rider fee.
    /// - [`MarketplaceError::DuplicateBooking`] - Rider already has an open booking on the trip.
    pub fn create(
        &self,
        rider: UserId,
        request: &BookingRequest,
    ) -> Result<Booking, MarketplaceError> {
        if request.seats == 0 {
            return Err(MarketplaceError::InvalidSeatCount);
        }
        let trip = self.inventory.trip(&request.trip_id)?;
        if trip.driver_id() == rider {
            return Err(MarketplaceError::SelfBooking);
        }
        let available = trip.seats_available();
        if request.seats > available {
            return Err(MarketplaceError::SeatsUnavailable {
                requested: request.seats,
                available,
            });
        }

        let base_amount = trip.base_fare() * Decimal::from(request.seats);
        let pickup_fee = if request.custom_pickup {
            trip.pickup_fee().unwrap_or(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };
        let dropoff_fee = if request.custom_dropoff {
            trip.dropoff_fee().unwrap_or(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };
        let total_amount = base_amount + pickup_fee + dropoff_fee;
        self.ledger
            .ensure_funds(&rider, self.fees.required_balance(total_amount))?;

        let booking = Booking {
            id: BookingId::new(),
            trip_id: request.trip_id,
            rider_id: rider,
            driver_id: trip.driver_id(),
            seats_booked: request.seats,
            base_amount,
            pickup_fee,
            dropoff_fee,
            total_amount,
            status: BookingStatus::Pending,
            payment_status: PaymentStatus::Pending,
            created_at: self.clock.now(),
            confirmed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            paid_at: None,
            driver_receives: None,
            payment_reference: None,
        };

        {
            // Holding the trip's index entry orders this insert against a
            // concurrent trip cancellation and against the rider's other requests.
            let mut ids = self.by_trip.entry(request.trip_id).or_default();
            if !trip.is_bookable() {
                return Err(MarketplaceError::TripNotBookable {
                    status: trip.status().to_string(),
                });
            }
            let duplicate = ids.iter().any(|id| {
                self.bookings.get(id).is_some_and(|existing| {
                    let existing = existing.lock();
                    existing.rider_id == rider && existing.status.is_open()
                })
            });
            if duplicate {
                return Err(MarketplaceError::DuplicateBooking);
            }
            self.bookings
                .insert(booking.id, Arc::new(Mutex::new(booking.clone())));
            ids.push(booking.id);
        }

        self.inventory.invalidate_driver(booking.driver_id);
        info!(
            booking = %booking.id,
            trip = %booking.trip_id,
            %rider,
            seats = booking.seats_booked,
            total = %booking.total_amount,
            "booking requested"
        );
        Ok(booking)
    }

    /// Driver accepts a pending booking, taking its seats from the trip.
    ///
    /// On `SeatsUnavailable` the booking stays `Pending`.
    pub fn confirm(&self, id: &BookingId, actor: UserId) -> Result<Booking, MarketplaceError> {
        let handle = self.handle(id)?;
        let mut booking = handle.lock();
        if booking.driver_id != actor {
            return Err(MarketplaceError::NotTripDriver);
        }
        if booking.status != BookingStatus::Pending {
            return Err(booking.invalid(BookingStatus::Confirmed));
        }

        if let Err(error) = self
            .inventory
            .reserve_seats(&booking.trip_id, booking.seats_booked)
        {
            warn!(booking = %id, %error, "confirmation failed");
            return Err(error);
        }
        booking.status = BookingStatus::Confirmed;
        booking.confirmed_at = Some(self.clock.now());
        let confirmed = booking.clone();
        drop(booking);

        self.inventory.invalidate_driver(confirmed.driver_id);
        info!(booking = %id, seats = confirmed.seats_booked, "booking confirmed");
        Ok(confirmed)
    }

    /// Driver declines a booking. Seats are given back if it had been confirmed.
    pub fn reject(
        &self,
        id: &BookingId,
        actor: UserId,
        reason: &str,
    ) -> Result<Booking, MarketplaceError> {
        self.cancel(id, Canceller::Driver(actor), Some(reason))
    }

    pub fn rider_cancel(
        &self,
        id: &BookingId,
        actor: UserId,
        reason: Option<&str>,
    ) -> Result<Booking, MarketplaceError> {
        self.cancel(id, Canceller::Rider(actor), reason)
    }

    pub fn driver_cancel(
        &self,
        id: &BookingId,
        actor: UserId,
        reason: Option<&str>,
    ) -> Result<Booking, MarketplaceError> {
        self.cancel(id, Canceller::Driver(actor), reason)
    }

    fn cancel(
        &self,
        id: &BookingId,
        by: Canceller,
        reason: Option<&str>,
    ) -> Result<Booking, MarketplaceError> {
        let handle = self.handle(id)?;
        let mut booking = handle.lock();
        match by {
            Canceller::Rider(actor) if actor != booking.rider_id => {
                return Err(MarketplaceError::NotBookingRider);
            }
            Canceller::Driver(actor) if actor != booking.driver_id => {
                return Err(MarketplaceError::NotTripDriver);
            }
            _ => {}
        }
        if !booking.status.is_open() {
            return Err(booking.invalid(BookingStatus::Cancelled));
        }

        // Release first: if it fails the booking keeps its seats and status.
        if booking.status == BookingStatus::Confirmed {
            self.inventory
                .release_seats(&booking.trip_id, booking.seats_booked)?;
        }
        booking.status = BookingStatus::Cancelled;
        booking.cancelled_at = Some(self.clock.now());
        booking.cancellation_reason = reason.map(str::to_owned);
        let cancelled = booking.clone();
        drop(booking);

        self.inventory.invalidate_driver(cancelled.driver_id);
        info!(booking = %id, by = ?by, "booking cancelled");
        Ok(cancelled)
    }

    /// Cancels every open booking on the trip, then the trip itself.
    ///
    /// The trip is sealed first so no booking can be created or confirmed
    /// while the cascade runs.
    pub fn cancel_trip(
        &self,
        trip_id: &TripId,
        actor: UserId,
    ) -> Result<TripCancellation, MarketplaceError> {
        let trip = self.inventory.seal(trip_id, actor)?;
        let ids: Vec<BookingId> = self
            .by_trip
            .entry(*trip_id)
            .or_default()
            .clone();

        let mut cancelled_bookings = Vec::new();
        let mut seats_released = 0;
        for id in ids {
            let seats = match self.bookings.get(&id) {
                Some(handle) => handle.lock().seats_held(),
                None => continue,
            };
            match self.cancel(&id, Canceller::TripCancellation, Some("trip cancelled")) {
                Ok(_) => {
                    seats_released += seats;
                    cancelled_bookings.push(id);
                }
                Err(MarketplaceError::InvalidBookingTransition { .. }) => {}
                Err(error) => return Err(error),
            }
        }

        self.inventory.mark_cancelled(&trip);
        Ok(TripCancellation {
            trip: trip.snapshot(),
            cancelled_bookings,
            seats_released,
        })
    }

    pub(crate) fn handle(&self, id: &BookingId) -> Result<Arc<Mutex<Booking>>, MarketplaceError> {
        self.bookings
            .get(id)
            .map(|b| Arc::clone(b.value()))
            .ok_or(MarketplaceError::BookingNotFound)
    }

    pub fn get(&self, id: &BookingId) -> Result<Booking, MarketplaceError> {
        Ok(self.handle(id)?.lock().clone())
    }

    pub fn for_trip(&self, trip_id: &TripId) -> Vec<Booking> {
        let ids = self
            .by_trip
            .get(trip_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id).ok()).collect()
    }

    /// Paid bookings whose payment time falls in `[start, end)`.
    pub fn paid_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Booking> {
        let handles: Vec<_> = self
            .bookings
            .iter()
            .map(|b| Arc::clone(b.value()))
            .collect();
        handles
            .iter()
            .filter_map(|handle| {
                let booking = handle.lock();
                let in_window = booking
                    .paid_at
                    .is_some_and(|paid| paid >= start && paid < end);
                (booking.is_paid() && in_window).then(|| booking.clone())
            })
            .collect()
    }

    pub fn all(&self) -> Vec<Booking> {
        let handles: Vec<_> = self
            .bookings
            .iter()
            .map(|b| Arc::clone(b.value()))
            .collect();
        handles.iter().map(|h| h.lock().clone()).collect()
    }
}
