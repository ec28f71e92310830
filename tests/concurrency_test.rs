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

//! Races between many threads on the same trip, booking, wallet or date.
//!
//! Every test finishes by checking the seat and ledger invariants with
//! [`Engine::audit`].

use chrono::{NaiveDate, TimeZone, Utc};
use rayon::prelude::*;
use ridepool_engine::{
    BookingId, BookingRequest, BookingStatus, Engine, EngineConfig, FixedClock, GatewayOutcome,
    GeoPoint, InstantGateway, LogNotifier, MarketplaceError, Place, RedeemOutcome,
    TransactionKind, TransferRequest, TripDraft, TripId, UserId,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

fn engine() -> Engine {
    // Plenty of CAS headroom so contention shows up as SeatsUnavailable, not Conflict.
    let config = EngineConfig {
        max_cas_retries: 10_000,
        ..EngineConfig::default()
    };
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 18, 0, 0).unwrap());
    Engine::assemble(
        config,
        Arc::new(clock),
        Arc::new(InstantGateway),
        Arc::new(LogNotifier),
    )
}

fn place() -> Place {
    Place {
        point: GeoPoint { lat: 0.0, lng: 0.0 },
        address: "Terminal".into(),
    }
}

fn open_trip(engine: &Engine, driver: UserId, seats: u32) -> TripId {
    let trip = engine
        .create_trip(
            driver,
            TripDraft {
                origin: place(),
                destination: place(),
                waypoints: vec![],
                seats_total: seats,
                base_fare: dec!(10.00),
                pickup_fee: None,
                dropoff_fee: None,
            },
        )
        .unwrap();
    engine.publish_trip(&trip.id, driver).unwrap();
    trip.id
}

fn fund(engine: &Engine, user: UserId, amount: Decimal) {
    engine
        .top_up(
            user,
            amount,
            &GatewayOutcome::Confirmed {
                gateway_reference: "gw".into(),
            },
            &format!("seed:{user}"),
        )
        .unwrap();
}

fn pending_booking(engine: &Engine, trip: TripId, seats: u32) -> BookingId {
    let rider = UserId::new();
    fund(engine, rider, dec!(100.00));
    engine
        .book(
            rider,
            &BookingRequest {
                trip_id: trip,
                seats,
                custom_pickup: false,
                custom_dropoff: false,
            },
        )
        .unwrap()
        .id
}

#[test]
fn racing_confirmations_sell_exactly_the_seats_available() {
    const RIDERS: usize = 32;
    let engine = engine();
    let driver = UserId::new();
    let trip = open_trip(&engine, driver, 4);
    let bookings: Vec<BookingId> = (0..RIDERS).map(|_| pending_booking(&engine, trip, 1)).collect();

    let barrier = Barrier::new(RIDERS);
    let confirmed = AtomicUsize::new(0);
    let sold_out = AtomicUsize::new(0);
    thread::scope(|s| {
        for id in &bookings {
            let (engine, barrier, confirmed, sold_out) = (&engine, &barrier, &confirmed, &sold_out);
            s.spawn(move || {
                barrier.wait();
                match engine.confirm_booking(id, driver) {
                    Ok(_) => {
                        confirmed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(MarketplaceError::SeatsUnavailable { .. }) => {
                        sold_out.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                }
            });
        }
    });

    assert_eq!(confirmed.load(Ordering::SeqCst), 4);
    assert_eq!(sold_out.load(Ordering::SeqCst), RIDERS - 4);
    assert_eq!(engine.trip(&trip).unwrap().seats_available, 0);
    assert!(engine.audit().is_empty(), "{:?}", engine.audit());
}

#[test]
fn two_seat_race_after_third_rider_took_half() {
    let engine = engine();
    let driver = UserId::new();
    let trip = open_trip(&engine, driver, 4);
    let early = pending_booking(&engine, trip, 2);
    let a = pending_booking(&engine, trip, 2);
    let b = pending_booking(&engine, trip, 2);
    engine.confirm_booking(&early, driver).unwrap();

    let barrier = Barrier::new(2);
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = [a, b]
            .into_iter()
            .map(|id| {
                let (engine, barrier) = (&engine, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    engine.confirm_booking(&id, driver)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(MarketplaceError::SeatsUnavailable { requested: 2, .. })
    )));
    assert_eq!(engine.trip(&trip).unwrap().seats_available, 0);
    assert!(engine.audit().is_empty());
}

#[test]
fn duplicate_scans_charge_once() {
    const SCANNERS: usize = 24;
    let engine = engine();
    let driver = UserId::new();
    let trip = open_trip(&engine, driver, 2);
    let booking = pending_booking(&engine, trip, 1);
    engine.confirm_booking(&booking, driver).unwrap();
    let rider = engine.booking(&booking).unwrap().rider_id;
    let token = engine.qr().token_for(&booking);

    let barrier = Barrier::new(SCANNERS);
    let paid = AtomicUsize::new(0);
    let already = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..SCANNERS {
            s.spawn(|| {
                barrier.wait();
                match engine.redeem_token(&token, driver).unwrap() {
                    RedeemOutcome::Paid(_) => paid.fetch_add(1, Ordering::SeqCst),
                    RedeemOutcome::AlreadyPaid(_) => already.fetch_add(1, Ordering::SeqCst),
                };
            });
        }
    });

    assert_eq!(paid.load(Ordering::SeqCst), 1);
    assert_eq!(already.load(Ordering::SeqCst), SCANNERS - 1);
    assert_eq!(engine.balance(&rider), dec!(89.75));
    assert_eq!(engine.balance(&driver), dec!(9.25));
    let charges = engine
        .statement(&rider)
        .iter()
        .filter(|e| e.kind == TransactionKind::RidePayment)
        .count();
    assert_eq!(charges, 1);
}

#[test]
fn concurrent_transfers_conserve_money() {
    const USERS: usize = 8;
    let engine = engine();
    let users: Vec<UserId> = (0..USERS).map(|_| UserId::new()).collect();
    for user in &users {
        fund(&engine, *user, dec!(100.00));
    }
    let before = engine.ledger().total_balance();

    (0..2_000usize).into_par_iter().for_each(|i| {
        let from = users[i % USERS];
        let to = users[(i * 7 + 3) % USERS];
        if from == to {
            return;
        }
        let request = TransferRequest::new(
            from,
            to,
            Decimal::new((i % 900 + 1) as i64, 2),
            TransactionKind::RidePayment,
            format!("ring:{i}"),
        );
        // Transfers that would overdraw are simply rejected.
        let _ = engine.transfer(request);
    });

    assert_eq!(engine.ledger().total_balance(), before);
    for user in &users {
        assert!(engine.balance(user) >= Decimal::ZERO);
    }
    assert!(engine.audit().is_empty(), "{:?}", engine.audit());
}

#[test]
fn retried_transfer_reference_applies_once_under_contention() {
    let engine = engine();
    let from = UserId::new();
    let to = UserId::new();
    fund(&engine, from, dec!(50.00));

    let applied = AtomicUsize::new(0);
    (0..64).into_par_iter().for_each(|_| {
        let outcome = engine
            .transfer(TransferRequest::new(
                from,
                to,
                dec!(5.00),
                TransactionKind::RidePayment,
                "same-reference",
            ))
            .unwrap();
        if !outcome.is_duplicate() {
            applied.fetch_add(1, Ordering::SeqCst);
        }
    });

    assert_eq!(applied.load(Ordering::SeqCst), 1);
    assert_eq!(engine.balance(&from), dec!(45.00));
    assert_eq!(engine.balance(&to), dec!(5.00));
}

#[test]
fn bookings_racing_a_trip_cancellation_all_end_cancelled() {
    const RIDERS: usize = 16;
    let engine = engine();
    let driver = UserId::new();
    let trip = open_trip(&engine, driver, 8);
    let riders: Vec<UserId> = (0..RIDERS)
        .map(|_| {
            let rider = UserId::new();
            fund(&engine, rider, dec!(100.00));
            rider
        })
        .collect();

    let barrier = Barrier::new(RIDERS + 1);
    thread::scope(|s| {
        for rider in &riders {
            let (engine, barrier) = (&engine, &barrier);
            s.spawn(move || {
                barrier.wait();
                let request = BookingRequest {
                    trip_id: trip,
                    seats: 1,
                    custom_pickup: false,
                    custom_dropoff: false,
                };
                if let Ok(booking) = engine.book(*rider, &request) {
                    let _ = engine.confirm_booking(&booking.id, driver);
                }
            });
        }
        s.spawn(|| {
            barrier.wait();
            engine.cancel_trip(&trip, driver).unwrap();
        });
    });

    for booking in engine.bookings().for_trip(&trip) {
        assert_eq!(booking.status, BookingStatus::Cancelled);
    }
    assert_eq!(engine.trip(&trip).unwrap().seats_available, 8);
    assert!(engine.audit().is_empty(), "{:?}", engine.audit());
}

#[test]
fn concurrent_triggers_create_one_batch() {
    let engine = engine();
    let driver = UserId::new();
    let trip = open_trip(&engine, driver, 4);
    for _ in 0..3 {
        let booking = pending_booking(&engine, trip, 1);
        engine.confirm_booking(&booking, driver).unwrap();
        let token = engine.qr().token_for(&booking);
        engine.redeem_token(&token, driver).unwrap();
    }
    let day = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();

    let responses: Vec<_> = (0..16)
        .into_par_iter()
        .map(|_| engine.trigger_settlements(None, Some(day)).unwrap())
        .collect();

    let first = &responses[0];
    assert!(responses.iter().all(|r| r.batch_id == first.batch_id));
    assert_eq!(engine.settlements().batches().len(), 1);
    let settlements = engine.settlements().for_batch(&first.batch_id);
    let total: Decimal = settlements.iter().map(|s| s.payout_amount).sum();
    assert_eq!(settlements.len(), 1);
    assert_eq!(total, first.total_amount);
    assert_eq!(first.total_amount, dec!(25.67));
}
