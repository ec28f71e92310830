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

//! Trips and their seat inventory.
//!
//! Trip lifecycle:
//!
//! ```text
//!   Pending ──publish──► Active ──start──► InProgress ──complete──► Completed
//!      │                   │
//!      └──────cancel───────┴──► Cancelled
//! ```
//!
//! `seats_available` is a lock-free counter updated by compare-and-swap with
//! a bounded number of retries. Reservations additionally hold the trip's
//! status lock for reading, so a trip being cancelled (which takes it for
//! writing) never gains new reservations after it has been sealed.

use crate::base::{Clock, TripId, UserId};
use crate::error::MarketplaceError;
use crate::fees::is_whole_cents;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Pending,
    Active,
    InProgress,
    Completed,
    Cancelled,
}

impl TripStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Riders may book and drivers may confirm.
    pub fn accepts_bookings(self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }

    /// Proof-of-booking scans may be redeemed.
    pub fn accepts_payments(self) -> bool {
        matches!(self, Self::Active | Self::InProgress)
    }

    fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active)
                | (Self::Active, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::Pending | Self::Active, Self::Cancelled)
        )
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub point: GeoPoint,
    pub address: String,
}

/// What a driver submits when publishing a trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripDraft {
    pub origin: Place,
    pub destination: Place,
    #[serde(default)]
    pub waypoints: Vec<Place>,
    pub seats_total: u32,
    pub base_fare: Decimal,
    #[serde(default)]
    pub pickup_fee: Option<Decimal>,
    #[serde(default)]
    pub dropoff_fee: Option<Decimal>,
}

impl TripDraft {
    fn validate(&self) -> Result<(), MarketplaceError> {
        if self.seats_total == 0 {
            return Err(MarketplaceError::InvalidSeatCount);
        }
        if self.base_fare <= Decimal::ZERO || !is_whole_cents(self.base_fare) {
            return Err(MarketplaceError::InvalidAmount);
        }
        let malformed =
            |fee: Option<Decimal>| fee.is_some_and(|f| f < Decimal::ZERO || !is_whole_cents(f));
        if malformed(self.pickup_fee) || malformed(self.dropoff_fee) {
            return Err(MarketplaceError::InvalidAmount);
        }
        Ok(())
    }
}

/// Unsold-seat counter with optimistic concurrency.
#[derive(Debug)]
pub struct SeatCounter {
    total: u32,
    available: AtomicU32,
}

impl SeatCounter {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            available: AtomicU32::new(total),
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn available(&self) -> u32 {
        self.available.load(Ordering::Acquire)
    }

    /// Takes `n` seats if at least `n` remain. Returns the seats left.
    pub fn reserve(&self, n: u32, max_retries: u32) -> Result<u32, MarketplaceError> {
        if n == 0 {
            return Err(MarketplaceError::InvalidSeatCount);
        }
        let mut current = self.available.load(Ordering::Acquire);
        for attempt in 0..max_retries {
            if current < n {
                return Err(MarketplaceError::SeatsUnavailable {
                    requested: n,
                    available: current,
                });
            }
            match self.available.compare_exchange(
                current,
                current - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current - n),
                Err(actual) => {
                    debug!(attempt, expected = current, actual, "seat reservation conflict");
                    current = actual;
                }
            }
        }
        Err(MarketplaceError::Conflict)
    }

    /// Returns `n` seats, never exceeding the total. Returns the seats left.
    pub fn release(&self, n: u32, max_retries: u32) -> Result<u32, MarketplaceError> {
        if n == 0 {
            return Err(MarketplaceError::InvalidSeatCount);
        }
        let mut current = self.available.load(Ordering::Acquire);
        for attempt in 0..max_retries {
            let next = current.saturating_add(n).min(self.total);
            if next < current.saturating_add(n) {
                warn!(
                    released = n,
                    current,
                    total = self.total,
                    "seat release clamped at trip capacity"
                );
            }
            if next == current {
                return Ok(current);
            }
            match self.available.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => {
                    debug!(attempt, expected = current, actual, "seat release conflict");
                    current = actual;
                }
            }
        }
        Err(MarketplaceError::Conflict)
    }
}

#[derive(Debug, Clone, Copy)]
struct TripState {
    status: TripStatus,
    /// Set once cancellation begins; no reservation succeeds afterwards.
    sealed: bool,
}

/// A driver-owned route offer.
#[derive(Debug)]
pub struct Trip {
    id: TripId,
    driver_id: UserId,
    origin: Place,
    destination: Place,
    waypoints: Vec<Place>,
    seats: SeatCounter,
    base_fare: Decimal,
    pickup_fee: Option<Decimal>,
    dropoff_fee: Option<Decimal>,
    state: RwLock<TripState>,
    created_at: DateTime<Utc>,
}

impl Trip {
    pub fn id(&self) -> TripId {
        self.id
    }

    pub fn driver_id(&self) -> UserId {
        self.driver_id
    }

    pub fn seats_total(&self) -> u32 {
        self.seats.total()
    }

    pub fn seats_available(&self) -> u32 {
        self.seats.available()
    }

    pub fn base_fare(&self) -> Decimal {
        self.base_fare
    }

    pub fn pickup_fee(&self) -> Option<Decimal> {
        self.pickup_fee
    }

    pub fn dropoff_fee(&self) -> Option<Decimal> {
        self.dropoff_fee
    }

    pub fn status(&self) -> TripStatus {
        self.state.read().status
    }

    /// Accepting bookings and not being cancelled.
    pub fn is_bookable(&self) -> bool {
        let state = self.state.read();
        state.status.accepts_bookings() && !state.sealed
    }

    pub fn snapshot(&self) -> TripSnapshot {
        TripSnapshot {
            id: self.id,
            driver_id: self.driver_id,
            origin: self.origin.clone(),
            destination: self.destination.clone(),
            waypoints: self.waypoints.clone(),
            seats_total: self.seats.total(),
            seats_available: self.seats.available(),
            base_fare: self.base_fare,
            pickup_fee: self.pickup_fee,
            dropoff_fee: self.dropoff_fee,
            status: self.status(),
            created_at: self.created_at,
        }
    }

    fn ensure_driver(&self, actor: UserId) -> Result<(), MarketplaceError> {
        if actor != self.driver_id {
            return Err(MarketplaceError::NotTripDriver);
        }
        Ok(())
    }
}

/// Point-in-time copy of a trip for callers and serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripSnapshot {
    pub id: TripId,
    pub driver_id: UserId,
    pub origin: Place,
    pub destination: Place,
    pub waypoints: Vec<Place>,
    pub seats_total: u32,
    pub seats_available: u32,
    pub base_fare: Decimal,
    pub pickup_fee: Option<Decimal>,
    pub dropoff_fee: Option<Decimal>,
    pub status: TripStatus,
    pub created_at: DateTime<Utc>,
}

/// Owns trips and is the only writer of their seat counts.
pub struct SeatInventory {
    trips: DashMap<TripId, Arc<Trip>>,
    /// Driver -> current non-terminal trip. Read-only convenience; never used
    /// for seat or balance decisions.
    current_trip_cache: DashMap<UserId, Option<TripId>>,
    max_retries: u32,
    clock: Arc<dyn Clock>,
}

impl SeatInventory {
    pub fn new(max_retries: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            trips: DashMap::new(),
            current_trip_cache: DashMap::new(),
            max_retries: max_retries.max(1),
            clock,
        }
    }

    pub fn create_trip(
        &self,
        driver: UserId,
        draft: TripDraft,
    ) -> Result<TripSnapshot, MarketplaceError> {
        draft.validate()?;
        let trip = Arc::new(Trip {
            id: TripId::new(),
            driver_id: driver,
            origin: draft.origin,
            destination: draft.destination,
            waypoints: draft.waypoints,
            seats: SeatCounter::new(draft.seats_total),
            base_fare: draft.base_fare,
            pickup_fee: draft.pickup_fee,
            dropoff_fee: draft.dropoff_fee,
            state: RwLock::new(TripState {
                status: TripStatus::Pending,
                sealed: false,
            }),
            created_at: self.clock.now(),
        });
        let snapshot = trip.snapshot();
        self.trips.insert(trip.id, trip);
        self.invalidate_driver(driver);
        info!(trip = %snapshot.id, %driver, seats = snapshot.seats_total, fare = %snapshot.base_fare, "trip created");
        Ok(snapshot)
    }

    pub fn trip(&self, id: &TripId) -> Result<Arc<Trip>, MarketplaceError> {
        self.trips
            .get(id)
            .map(|t| Arc::clone(t.value()))
            .ok_or(MarketplaceError::TripNotFound)
    }

    pub fn snapshot(&self, id: &TripId) -> Result<TripSnapshot, MarketplaceError> {
        Ok(self.trip(id)?.snapshot())
    }

    /// Takes `n` seats from a bookable trip.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::TripNotBookable`] - Trip has started, ended, or is being cancelled.
    /// - [`MarketplaceError::SeatsUnavailable`] - Fewer than `n` seats remain.
    /// - [`MarketplaceError::Conflict`] - Retries exhausted under contention.
    pub fn reserve_seats(&self, trip_id: &TripId, n: u32) -> Result<u32, MarketplaceError> {
        let trip = self.trip(trip_id)?;
        let state = trip.state.read();
        if !state.status.accepts_bookings() || state.sealed {
            return Err(MarketplaceError::TripNotBookable {
                status: state.status.to_string(),
            });
        }
        let left = trip.seats.reserve(n, self.max_retries)?;
        debug!(trip = %trip_id, reserved = n, left, "seats reserved");
        Ok(left)
    }

    /// Returns `n` seats to the trip, clamped at its capacity.
    pub fn release_seats(&self, trip_id: &TripId, n: u32) -> Result<u32, MarketplaceError> {
        let trip = self.trip(trip_id)?;
        let left = trip.seats.release(n, self.max_retries)?;
        debug!(trip = %trip_id, released = n, left, "seats released");
        Ok(left)
    }

    /// `Pending -> Active`.
    pub fn publish_trip(
        &self,
        trip_id: &TripId,
        actor: UserId,
    ) -> Result<TripSnapshot, MarketplaceError> {
        self.transition(trip_id, actor, TripStatus::Active)
    }

    /// `Active -> InProgress`.
    pub fn start_trip(
        &self,
        trip_id: &TripId,
        actor: UserId,
    ) -> Result<TripSnapshot, MarketplaceError> {
        self.transition(trip_id, actor, TripStatus::InProgress)
    }

    /// `InProgress -> Completed`.
    pub fn complete_trip(
        &self,
        trip_id: &TripId,
        actor: UserId,
    ) -> Result<TripSnapshot, MarketplaceError> {
        self.transition(trip_id, actor, TripStatus::Completed)
    }

    fn transition(
        &self,
        trip_id: &TripId,
        actor: UserId,
        next: TripStatus,
    ) -> Result<TripSnapshot, MarketplaceError> {
        let trip = self.trip(trip_id)?;
        trip.ensure_driver(actor)?;
        {
            let mut state = trip.state.write();
            if state.sealed || !state.status.can_become(next) {
                return Err(MarketplaceError::InvalidTripTransition {
                    from: state.status.to_string(),
                    to: next.to_string(),
                });
            }
            state.status = next;
        }
        self.invalidate_driver(trip.driver_id);
        info!(trip = %trip_id, status = %next, "trip status changed");
        Ok(trip.snapshot())
    }

    /// First half of a cancellation: stop the trip from taking new reservations.
    ///
    /// Sealing an already sealed (but not yet cancelled) trip succeeds so an
    /// interrupted cancellation can be re-run.
    pub(crate) fn seal(&self, trip_id: &TripId, actor: UserId) -> Result<Arc<Trip>, MarketplaceError> {
        let trip = self.trip(trip_id)?;
        trip.ensure_driver(actor)?;
        {
            let mut state = trip.state.write();
            if !state.status.can_become(TripStatus::Cancelled) {
                return Err(MarketplaceError::InvalidTripTransition {
                    from: state.status.to_string(),
                    to: TripStatus::Cancelled.to_string(),
                });
            }
            state.sealed = true;
        }
        self.invalidate_driver(trip.driver_id);
        Ok(trip)
    }

    /// Second half of a cancellation, after every booking has been unwound.
    pub(crate) fn mark_cancelled(&self, trip: &Trip) {
        trip.state.write().status = TripStatus::Cancelled;
        self.invalidate_driver(trip.driver_id);
        info!(trip = %trip.id, "trip cancelled");
    }

    /// The driver's earliest-created trip that has not ended.
    pub fn current_trip(&self, driver: UserId) -> Option<TripId> {
        *self
            .current_trip_cache
            .entry(driver)
            .or_insert_with(|| {
                self.trips
                    .iter()
                    .filter(|t| t.driver_id == driver && !t.status().is_terminal())
                    .min_by_key(|t| t.created_at)
                    .map(|t| t.id)
            })
    }

    /// Drops the cached current trip for `driver`.
    ///
    /// Called synchronously after every trip or booking mutation.
    pub fn invalidate_driver(&self, driver: UserId) {
        self.current_trip_cache.remove(&driver);
    }

    pub fn trips(&self) -> Vec<Arc<Trip>> {
        self.trips.iter().map(|t| Arc::clone(t.value())).collect()
    }
}
