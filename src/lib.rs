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

//! # Ridepool Engine
//!
//! Core of a ride-pooling marketplace: drivers publish trips with a fixed
//! number of seats, riders book seats, and payment happens when the driver
//! scans the rider's QR code at pickup. Drivers are paid out daily.
//!
//! ## Core Components
//!
//! - [`Engine`]: Facade over all components
//! - [`SeatInventory`]: Trips and their atomic seat counters
//! - [`BookingBook`]: Booking state machine
//! - [`Ledger`]: Wallets and idempotent transfers
//! - [`QrProtocol`]: Proof-of-booking tokens and scan-to-pay
//! - [`SettlementDesk`]: Daily settlement batches and payouts
//! - [`MarketplaceError`]: Every failure the core reports
//!
//! ## Example
//!
//! ```
//! use ridepool_engine::{
//!     BookingRequest, Engine, GatewayOutcome, GeoPoint, Place, RedeemOutcome, TripDraft, UserId,
//! };
//! use rust_decimal_macros::dec;
//!
//! let engine = Engine::new();
//! let driver = UserId::new();
//! let rider = UserId::new();
//! let stop = |address: &str| Place {
//!     point: GeoPoint { lat: -23.55, lng: -46.63 },
//!     address: address.to_owned(),
//! };
//!
//! let trip = engine
//!     .create_trip(driver, TripDraft {
//!         origin: stop("Paulista"),
//!         destination: stop("Pinheiros"),
//!         waypoints: vec![],
//!         seats_total: 3,
//!         base_fare: dec!(20.00),
//!         pickup_fee: None,
//!         dropoff_fee: None,
//!     })
//!     .unwrap();
//! engine.publish_trip(&trip.id, driver).unwrap();
//!
//! let confirmed = GatewayOutcome::Confirmed { gateway_reference: "pix-1".into() };
//! engine.top_up(rider, dec!(50.00), &confirmed, "topup-1").unwrap();
//!
//! let booking = engine
//!     .book(rider, &BookingRequest {
//!         trip_id: trip.id,
//!         seats: 1,
//!         custom_pickup: false,
//!         custom_dropoff: false,
//!     })
//!     .unwrap();
//! engine.confirm_booking(&booking.id, driver).unwrap();
//!
//! // At pickup the driver scans the rider's code.
//! let payload = engine.issue_token(&booking.id, rider).unwrap();
//! let outcome = engine.redeem_payload(&payload, driver).unwrap();
//! assert!(matches!(outcome, RedeemOutcome::Paid(_)));
//!
//! assert_eq!(engine.balance(&rider), dec!(29.50));
//! assert_eq!(engine.balance(&driver), dec!(18.50));
//! ```
//!
//! ## Thread Safety
//!
//! All state lives in concurrent maps with per-entity locks; seat counters
//! are updated lock-free. The engine can be shared across threads.

mod base;
pub mod booking;
pub mod config;
mod engine;
pub mod error;
pub mod fees;
pub mod inventory;
mod journal;
pub mod ledger;
pub mod qr;
pub mod settlement;
mod transaction;
mod wallet;

pub use base::{BatchId, BookingId, Clock, EntryId, FixedClock, SettlementId, SystemClock, TripId, UserId};
pub use booking::{Booking, BookingBook, BookingRequest, BookingStatus, PaymentStatus, TripCancellation};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::MarketplaceError;
pub use fees::{FeeSchedule, PaymentBreakdown};
pub use inventory::{GeoPoint, Place, SeatInventory, TripDraft, TripSnapshot, TripStatus};
pub use journal::{Receipt, TransferOutcome};
pub use ledger::{GatewayOutcome, Ledger, TransferRequest};
pub use qr::{PaymentReceipt, QrPayload, QrProtocol, RedeemOutcome};
pub use settlement::{
    ApprovalAction, ApprovalRequest, ApprovalResponse, BatchStatus, GatewayError, GatewayReceipt,
    GenerationOutcome, InstantGateway, LogNotifier, PayoutGateway, PayoutRequest, Settlement,
    SettlementBatch, SettlementDesk, SettlementNotifier, SettlementStatus, TriggerResponse,
};
pub use transaction::{Transaction, TransactionKind, TransactionStatus};
pub use wallet::Wallet;
