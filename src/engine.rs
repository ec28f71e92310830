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

//! Marketplace engine.
//!
//! The [`Engine`] wires the components together and is the API that the CLI,
//! the HTTP demo and the integration tests drive:
//!
//! - **Seat inventory**: trips and their lock-free seat counters.
//! - **Bookings**: the request/confirm/cancel state machine.
//! - **Ledger**: wallets and reference-keyed transfers.
//! - **QR protocol**: proof-of-booking tokens and scan-to-pay.
//! - **Settlements**: daily payout batches and their approval workflow.
//!
//! # Thread Safety
//!
//! Every component is shared behind an [`Arc`] and synchronizes internally,
//! so a single `Engine` can be used from many threads at once.

use crate::base::{BookingId, Clock, SettlementId, SystemClock, TripId, UserId};
use crate::booking::{Booking, BookingBook, BookingRequest, BookingStatus, TripCancellation};
use crate::config::{EngineConfig, pin_digest};
use crate::error::MarketplaceError;
use crate::inventory::{SeatInventory, TripDraft, TripSnapshot};
use crate::journal::TransferOutcome;
use crate::ledger::{GatewayOutcome, Ledger, TransferRequest};
use crate::qr::{QrPayload, QrProtocol, RedeemOutcome};
use crate::settlement::{
    ApprovalRequest, ApprovalResponse, GenerationOutcome, InstantGateway, LogNotifier,
    PayoutGateway, Settlement, SettlementDesk, SettlementNotifier, TriggerResponse,
};
use crate::transaction::Transaction;
use crate::wallet::Wallet;
use chrono::NaiveDate;
use constant_time_eq::constant_time_eq;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::warn;

/// Ride-pooling marketplace core.
///
/// # Invariants
///
/// - For every trip, `seats_total - seats_available` equals the seats of its
///   confirmed and completed bookings.
/// - Every wallet's balance is non-negative and equals the replay of its
///   completed entries.
/// - A booking is paid at most once; a settlement batch exists at most once per date.
pub struct Engine {
    config: EngineConfig,
    ledger: Arc<Ledger>,
    inventory: Arc<SeatInventory>,
    bookings: Arc<BookingBook>,
    qr: QrProtocol,
    settlements: SettlementDesk,
}

impl Engine {
    /// Creates an engine with default configuration, the system clock and a
    /// payout gateway that confirms immediately.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::assemble(
            config,
            Arc::new(SystemClock),
            Arc::new(InstantGateway),
            Arc::new(LogNotifier),
        )
    }

    /// Builds an engine around the given collaborators.
    pub fn assemble(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PayoutGateway>,
        notifier: Arc<dyn SettlementNotifier>,
    ) -> Self {
        let ledger = Arc::new(Ledger::new(UserId::new(), Arc::clone(&clock)));
        let inventory = Arc::new(SeatInventory::new(
            config.max_cas_retries,
            Arc::clone(&clock),
        ));
        let bookings = Arc::new(BookingBook::new(
            Arc::clone(&inventory),
            Arc::clone(&ledger),
            config.fees,
            Arc::clone(&clock),
        ));
        let qr = QrProtocol::new(
            Arc::clone(&bookings),
            Arc::clone(&inventory),
            Arc::clone(&ledger),
            config.fees,
            config.token_secret.clone(),
            Arc::clone(&clock),
        );
        let settlements = SettlementDesk::new(
            Arc::clone(&bookings),
            Arc::clone(&ledger),
            config.fees,
            gateway,
            notifier,
            clock,
        );
        Self {
            config,
            ledger,
            inventory,
            bookings,
            qr,
            settlements,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn inventory(&self) -> &SeatInventory {
        &self.inventory
    }

    pub fn bookings(&self) -> &BookingBook {
        &self.bookings
    }

    pub fn qr(&self) -> &QrProtocol {
        &self.qr
    }

    pub fn settlements(&self) -> &SettlementDesk {
        &self.settlements
    }

    // Trips

    pub fn create_trip(
        &self,
        driver: UserId,
        draft: TripDraft,
    ) -> Result<TripSnapshot, MarketplaceError> {
        self.inventory.create_trip(driver, draft)
    }

    pub fn publish_trip(&self, trip: &TripId, actor: UserId) -> Result<TripSnapshot, MarketplaceError> {
        self.inventory.publish_trip(trip, actor)
    }

    pub fn start_trip(&self, trip: &TripId, actor: UserId) -> Result<TripSnapshot, MarketplaceError> {
        self.inventory.start_trip(trip, actor)
    }

    pub fn complete_trip(&self, trip: &TripId, actor: UserId) -> Result<TripSnapshot, MarketplaceError> {
        self.inventory.complete_trip(trip, actor)
    }

    /// Cancels the trip and every open booking on it.
    pub fn cancel_trip(
        &self,
        trip: &TripId,
        actor: UserId,
    ) -> Result<TripCancellation, MarketplaceError> {
        self.bookings.cancel_trip(trip, actor)
    }

    pub fn trip(&self, trip: &TripId) -> Result<TripSnapshot, MarketplaceError> {
        self.inventory.snapshot(trip)
    }

    pub fn current_trip(&self, driver: UserId) -> Option<TripId> {
        self.inventory.current_trip(driver)
    }

    // Bookings

    pub fn book(&self, rider: UserId, request: &BookingRequest) -> Result<Booking, MarketplaceError> {
        self.bookings.create(rider, request)
    }

    pub fn confirm_booking(&self, id: &BookingId, driver: UserId) -> Result<Booking, MarketplaceError> {
        self.bookings.confirm(id, driver)
    }

    pub fn reject_booking(
        &self,
        id: &BookingId,
        driver: UserId,
        reason: &str,
    ) -> Result<Booking, MarketplaceError> {
        self.bookings.reject(id, driver, reason)
    }

    /// Rider withdraws their own booking.
    pub fn cancel_booking(
        &self,
        id: &BookingId,
        rider: UserId,
        reason: Option<&str>,
    ) -> Result<Booking, MarketplaceError> {
        self.bookings.rider_cancel(id, rider, reason)
    }

    pub fn driver_cancel_booking(
        &self,
        id: &BookingId,
        driver: UserId,
        reason: Option<&str>,
    ) -> Result<Booking, MarketplaceError> {
        self.bookings.driver_cancel(id, driver, reason)
    }

    pub fn booking(&self, id: &BookingId) -> Result<Booking, MarketplaceError> {
        self.bookings.get(id)
    }

    // Wallets

    pub fn top_up(
        &self,
        user: UserId,
        amount: Decimal,
        outcome: &GatewayOutcome,
        reference: &str,
    ) -> Result<TransferOutcome, MarketplaceError> {
        self.ledger.record_top_up(user, amount, outcome, reference)
    }

    pub fn transfer(&self, request: TransferRequest) -> Result<TransferOutcome, MarketplaceError> {
        self.ledger.transfer(request)
    }

    pub fn wallet(&self, user: &UserId) -> Option<Arc<Wallet>> {
        self.ledger.get_wallet(user)
    }

    pub fn balance(&self, user: &UserId) -> Decimal {
        self.ledger
            .get_wallet(user)
            .map(|w| w.balance())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn statement(&self, user: &UserId) -> Vec<Transaction> {
        self.ledger.statement(user)
    }

    // QR payments

    pub fn issue_token(&self, booking: &BookingId, rider: UserId) -> Result<QrPayload, MarketplaceError> {
        self.qr.issue(booking, rider)
    }

    pub fn redeem_token(&self, token: &str, driver: UserId) -> Result<RedeemOutcome, MarketplaceError> {
        self.qr.redeem(token, driver)
    }

    pub fn redeem_payload(
        &self,
        payload: &QrPayload,
        driver: UserId,
    ) -> Result<RedeemOutcome, MarketplaceError> {
        self.qr.redeem_payload(payload, driver)
    }

    // Settlements

    pub fn generate_settlements(&self, date: NaiveDate) -> GenerationOutcome {
        self.settlements.generate(date)
    }

    /// Scheduler entry point. `date` defaults to yesterday.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::Unauthorized`] - A cron secret is configured and `secret` does not match it.
    pub fn trigger_settlements(
        &self,
        secret: Option<&str>,
        date: Option<NaiveDate>,
    ) -> Result<TriggerResponse, MarketplaceError> {
        if let Some(expected) = &self.config.cron_secret {
            let presented = secret.unwrap_or_default();
            if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
                warn!("settlement trigger with bad secret");
                return Err(MarketplaceError::Unauthorized);
            }
        }
        let date = date.unwrap_or_else(|| self.settlements.yesterday());
        let outcome = self.settlements.generate(date);
        Ok(TriggerResponse::from(&outcome.batch))
    }

    /// Admin approval entry point.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::Unauthorized`] - No admin PIN configured, or the PIN is wrong.
    /// - Any error of [`SettlementDesk::act`].
    pub fn handle_approval(
        &self,
        request: &ApprovalRequest,
    ) -> Result<ApprovalResponse, MarketplaceError> {
        let Some(expected) = &self.config.admin_pin_digest else {
            return Err(MarketplaceError::Unauthorized);
        };
        let presented = pin_digest(&request.admin_pin);
        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            warn!(settlement = %request.settlement_id, "settlement approval with bad PIN");
            return Err(MarketplaceError::Unauthorized);
        }
        let settlement = self.settlements.act(&request.settlement_id, request.action)?;
        Ok(ApprovalResponse::from(&settlement))
    }

    pub fn settlement(&self, id: &SettlementId) -> Result<Settlement, MarketplaceError> {
        self.settlements.get(id)
    }

    /// Checks the seat and ledger invariants and returns a description of
    /// every violation found. Empty means consistent.
    ///
    /// Intended for tests and diagnostics on a quiescent engine.
    pub fn audit(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let bookings = self.bookings.all();

        for trip in self.inventory.trips() {
            let available = trip.seats_available();
            if available > trip.seats_total() {
                violations.push(format!(
                    "trip {}: {available} seats available of {}",
                    trip.id(),
                    trip.seats_total()
                ));
            }
            let held: u32 = bookings
                .iter()
                .filter(|b| b.trip_id == trip.id())
                .filter(|b| matches!(b.status, BookingStatus::Confirmed | BookingStatus::Completed))
                .map(|b| b.seats_booked)
                .sum();
            if trip.seats_total().saturating_sub(available) != held {
                violations.push(format!(
                    "trip {}: {} seats taken but bookings hold {held}",
                    trip.id(),
                    trip.seats_total().saturating_sub(available)
                ));
            }
        }

        for (user, wallet) in self.ledger.wallets() {
            let balance = wallet.balance();
            if wallet.available() < Decimal::ZERO || wallet.held() < Decimal::ZERO {
                violations.push(format!("wallet {user}: negative balance"));
            }
            if wallet.replay_balance() != balance {
                violations.push(format!(
                    "wallet {user}: balance {balance} but entries replay to {}",
                    wallet.replay_balance()
                ));
            }
        }
        violations
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
