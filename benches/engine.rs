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

//! Benchmarks for the marketplace engine.
//!
//! Run with: cargo bench
//!
//! Benchmarks include:
//! - Single-threaded wallet transfers
//! - Seat reservation under contention
//! - Scan-to-pay from booking to payment
//! - Settlement generation over a day of rides
//! - Scaling with number of threads

use chrono::{NaiveDate, TimeZone, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rayon::prelude::*;
use ridepool_engine::inventory::SeatCounter;
use ridepool_engine::{
    BookingId, BookingRequest, Engine, EngineConfig, FixedClock, GatewayOutcome, GeoPoint,
    InstantGateway, LogNotifier, Place, TransactionKind, TransferRequest, TripDraft, TripId,
    UserId,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

// =============================================================================
// Helper Functions
// =============================================================================

fn engine() -> Engine {
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
    let config = EngineConfig {
        max_cas_retries: 1_000,
        ..EngineConfig::default()
    };
    Engine::assemble(
        config,
        Arc::new(clock),
        Arc::new(InstantGateway),
        Arc::new(LogNotifier),
    )
}

fn funded(engine: &Engine, cents: i64) -> UserId {
    let user = UserId::new();
    engine
        .top_up(
            user,
            Decimal::new(cents, 2),
            &GatewayOutcome::Confirmed {
                gateway_reference: "bench".into(),
            },
            &format!("seed:{user}"),
        )
        .unwrap();
    user
}

fn open_trip(engine: &Engine, driver: UserId, seats: u32) -> TripId {
    let stop = Place {
        point: GeoPoint { lat: 0.0, lng: 0.0 },
        address: "Stop".into(),
    };
    let trip = engine
        .create_trip(
            driver,
            TripDraft {
                origin: stop.clone(),
                destination: stop,
                waypoints: vec![],
                seats_total: seats,
                base_fare: Decimal::new(1500, 2),
                pickup_fee: None,
                dropoff_fee: None,
            },
        )
        .unwrap();
    engine.publish_trip(&trip.id, driver).unwrap();
    trip.id
}

fn book(engine: &Engine, trip: TripId) -> BookingId {
    let rider = funded(engine, 100_000);
    let request = BookingRequest {
        trip_id: trip,
        seats: 1,
        custom_pickup: false,
        custom_dropoff: false,
    };
    engine.book(rider, &request).unwrap().id
}

fn transfer(from: UserId, to: UserId, n: u32) -> TransferRequest {
    TransferRequest::new(
        from,
        to,
        Decimal::new(1, 2),
        TransactionKind::RidePayment,
        format!("bench:{n}"),
    )
}

// =============================================================================
// Single-Threaded Benchmarks
// =============================================================================

fn bench_single_transfer(c: &mut Criterion) {
    c.bench_function("single_transfer", |b| {
        let engine = engine();
        let from = funded(&engine, 1_000_000_000);
        let to = UserId::new();
        let mut n = 0u32;
        b.iter(|| {
            n += 1;
            engine.transfer(black_box(transfer(from, to, n))).unwrap();
        })
    });
}

fn bench_duplicate_transfer(c: &mut Criterion) {
    c.bench_function("duplicate_transfer", |b| {
        let engine = engine();
        let from = funded(&engine, 100_000);
        let to = UserId::new();
        engine.transfer(transfer(from, to, 0)).unwrap();
        b.iter(|| {
            let outcome = engine.transfer(black_box(transfer(from, to, 0))).unwrap();
            black_box(outcome.is_duplicate());
        })
    });
}

fn bench_transfer_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("transfer_throughput");

    for count in [100, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let engine = engine();
                let from = funded(&engine, 1_000_000);
                let to = UserId::new();
                for n in 0..count {
                    engine.transfer(transfer(from, to, n)).unwrap();
                }
                black_box(&engine);
            })
        });
    }
    group.finish();
}

// =============================================================================
// Booking and Payment Benchmarks
// =============================================================================

fn bench_ride_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("ride_lifecycle");

    group.bench_function("book_confirm", |b| {
        b.iter_batched(
            || {
                let engine = engine();
                let driver = UserId::new();
                let trip = open_trip(&engine, driver, 4);
                let rider = funded(&engine, 100_000);
                (engine, driver, trip, rider)
            },
            |(engine, driver, trip, rider)| {
                let request = BookingRequest {
                    trip_id: trip,
                    seats: 1,
                    custom_pickup: false,
                    custom_dropoff: false,
                };
                let booking = engine.book(rider, &request).unwrap();
                engine.confirm_booking(black_box(&booking.id), driver).unwrap();
            },
            criterion::BatchSize::SmallInput,
        )
    });

    group.bench_function("scan_to_pay", |b| {
        b.iter_batched(
            || {
                let engine = engine();
                let driver = UserId::new();
                let trip = open_trip(&engine, driver, 4);
                let booking = book(&engine, trip);
                engine.confirm_booking(&booking, driver).unwrap();
                let token = engine.qr().token_for(&booking);
                (engine, driver, token)
            },
            |(engine, driver, token)| {
                engine.redeem_token(black_box(&token), driver).unwrap();
            },
            criterion::BatchSize::SmallInput,
        )
    });

    group.bench_function("rescan", |b| {
        let engine = engine();
        let driver = UserId::new();
        let trip = open_trip(&engine, driver, 4);
        let booking = book(&engine, trip);
        engine.confirm_booking(&booking, driver).unwrap();
        let token = engine.qr().token_for(&booking);
        engine.redeem_token(&token, driver).unwrap();
        b.iter(|| {
            engine.redeem_token(black_box(&token), driver).unwrap();
        })
    });

    group.finish();
}

// =============================================================================
// Multi-Threaded Benchmarks
// =============================================================================

fn bench_seat_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("seat_contention");

    for seats in [10u32, 100, 1_000].iter() {
        group.throughput(Throughput::Elements(*seats as u64));
        group.bench_with_input(BenchmarkId::from_parameter(seats), seats, |b, &seats| {
            b.iter(|| {
                let counter = SeatCounter::new(seats);
                // Twice as many takers as seats; half must lose.
                (0..seats * 2).into_par_iter().for_each(|_| {
                    let _ = counter.reserve(1, 1_000);
                });
                black_box(counter.available());
            })
        });
    }
    group.finish();
}

fn bench_parallel_confirmations(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_confirmations");

    for riders in [10usize, 100, 500].iter() {
        group.throughput(Throughput::Elements(*riders as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(riders),
            riders,
            |b, &riders| {
                b.iter_batched(
                    || {
                        let engine = engine();
                        let driver = UserId::new();
                        let trip = open_trip(&engine, driver, (riders / 2) as u32);
                        let bookings: Vec<BookingId> =
                            (0..riders).map(|_| book(&engine, trip)).collect();
                        (Arc::new(engine), driver, bookings)
                    },
                    |(engine, driver, bookings)| {
                        bookings.par_iter().for_each(|id| {
                            let _ = engine.confirm_booking(id, driver);
                        });
                        black_box(&engine);
                    },
                    criterion::BatchSize::SmallInput,
                )
            },
        );
    }
    group.finish();
}

fn bench_parallel_scans(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_scans");

    for drivers in [10usize, 100].iter() {
        let rides = drivers * 4;
        group.throughput(Throughput::Elements(rides as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(drivers),
            drivers,
            |b, &drivers| {
                b.iter_batched(
                    || {
                        let engine = engine();
                        let mut tokens = Vec::with_capacity(drivers * 4);
                        for _ in 0..drivers {
                            let driver = UserId::new();
                            let trip = open_trip(&engine, driver, 4);
                            for _ in 0..4 {
                                let booking = book(&engine, trip);
                                engine.confirm_booking(&booking, driver).unwrap();
                                tokens.push((driver, engine.qr().token_for(&booking)));
                            }
                        }
                        (engine, tokens)
                    },
                    |(engine, tokens)| {
                        tokens.par_iter().for_each(|(driver, token)| {
                            engine.redeem_token(token, *driver).unwrap();
                        });
                        black_box(&engine);
                    },
                    criterion::BatchSize::SmallInput,
                )
            },
        );
    }
    group.finish();
}

// =============================================================================
// Scaling Benchmarks
// =============================================================================

fn bench_thread_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_scaling");
    let total_transfers = 20_000u32;

    for num_threads in [1, 2, 4, 8].iter() {
        group.throughput(Throughput::Elements(total_transfers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            num_threads,
            |b, &num_threads| {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .build()
                    .unwrap();

                b.iter(|| {
                    let engine = engine();
                    let wallets: Vec<UserId> =
                        (0..100).map(|_| funded(&engine, 1_000_000)).collect();
                    let counter = AtomicU32::new(0);

                    pool.install(|| {
                        (0..total_transfers).into_par_iter().for_each(|i| {
                            let n = counter.fetch_add(1, Ordering::Relaxed);
                            let from = wallets[i as usize % wallets.len()];
                            let to = wallets[(i as usize + 1) % wallets.len()];
                            let _ = engine.transfer(transfer(from, to, n));
                        });
                    });

                    black_box(&engine);
                })
            },
        );
    }
    group.finish();
}

// =============================================================================
// Settlement Benchmarks
// =============================================================================

fn bench_settlement_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("settlement_generation");
    let day = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();

    for drivers in [10usize, 100].iter() {
        group.throughput(Throughput::Elements(*drivers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(drivers),
            drivers,
            |b, &drivers| {
                b.iter_batched(
                    || {
                        let engine = engine();
                        for _ in 0..drivers {
                            let driver = UserId::new();
                            let trip = open_trip(&engine, driver, 3);
                            for _ in 0..3 {
                                let booking = book(&engine, trip);
                                engine.confirm_booking(&booking, driver).unwrap();
                                let token = engine.qr().token_for(&booking);
                                engine.redeem_token(&token, driver).unwrap();
                            }
                        }
                        engine
                    },
                    |engine| {
                        let outcome = engine.generate_settlements(black_box(day));
                        black_box(outcome.batch.total_amount);
                    },
                    criterion::BatchSize::SmallInput,
                )
            },
        );
    }
    group.finish();
}

// =============================================================================
// Criterion Groups
// =============================================================================

criterion_group!(
    single_threaded,
    bench_single_transfer,
    bench_duplicate_transfer,
    bench_transfer_throughput,
);

criterion_group!(rides, bench_ride_lifecycle,);

criterion_group!(
    multi_threaded,
    bench_seat_contention,
    bench_parallel_confirmations,
    bench_parallel_scans,
);

criterion_group!(scaling, bench_thread_scaling,);

criterion_group!(settlement, bench_settlement_generation,);

criterion_main!(single_threaded, rides, multi_threaded, scaling, settlement);
