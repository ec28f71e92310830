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

use chrono::NaiveDate;
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use ridepool_engine::{
    BookingId, BookingRequest, Engine, EngineConfig, GatewayOutcome, GeoPoint, MarketplaceError,
    Place, TripDraft, TripId, UserId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Ridepool - replay a marketplace command log
///
/// Reads commands from a CSV file, applies them to an in-memory marketplace
/// and writes every wallet to stdout as CSV.
#[derive(Parser, Debug)]
#[command(name = "ridepool")]
#[command(about = "Replays ride-pooling marketplace command CSVs", long_about = None)]
struct Args {
    /// Path to CSV file with commands
    ///
    /// Expected format: op,actor,trip,booking,seats,amount[,fee]
    /// Example: cargo run -- commands.csv > wallets.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Generate the settlement batch for this date (YYYY-MM-DD) after replaying
    #[arg(long, value_name = "DATE")]
    settle: Option<NaiveDate>,

    /// Secret mixed into QR tokens
    #[arg(long, env = "RIDEPOOL_TOKEN_SECRET", default_value = "ridepool-cli")]
    token_secret: String,

    /// Seat-counter compare-and-swap attempts before reporting a conflict
    #[arg(long, env = "RIDEPOOL_MAX_CAS_RETRIES", default_value_t = EngineConfig::DEFAULT_MAX_CAS_RETRIES)]
    max_cas_retries: u32,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let config = EngineConfig {
        max_cas_retries: args.max_cas_retries,
        ..EngineConfig::default()
    }
    .with_token_secret(args.token_secret);

    let replay = match replay_commands(Engine::with_config(config), BufReader::new(file)) {
        Ok(replay) => replay,
        Err(e) => {
            eprintln!("Error processing commands: {}", e);
            process::exit(1);
        }
    };

    if let Some(date) = args.settle {
        let outcome = replay.engine.generate_settlements(date);
        info!(
            %date,
            settlements = outcome.batch.settlement_count,
            total = %outcome.batch.total_amount,
            "settlement batch ready"
        );
    }

    if let Err(e) = write_wallets(&replay, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Raw CSV record matching the input format.
///
/// Fields: `op, actor, trip, booking, seats, amount[, fee]`. Actors, trips and
/// bookings are free-form labels; each new label gets a fresh id.
#[derive(Debug, Deserialize)]
struct CsvRecord {
    op: String,
    actor: String,
    #[serde(default)]
    trip: String,
    #[serde(default)]
    booking: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    seats: Option<u32>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<Decimal>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    fee: Option<Decimal>,
}

#[derive(Error, Debug)]
enum CommandError {
    #[error("unknown op '{0}'")]
    UnknownOp(String),
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("unknown {kind} '{label}'")]
    UnknownLabel { kind: &'static str, label: String },
    #[error(transparent)]
    Marketplace(#[from] MarketplaceError),
}

/// An engine plus the label-to-id mappings of the replayed log.
pub struct Replay {
    pub engine: Engine,
    users: HashMap<String, UserId>,
    trips: HashMap<String, TripId>,
    bookings: HashMap<String, BookingId>,
}

impl Replay {
    fn new(engine: Engine) -> Self {
        Self {
            engine,
            users: HashMap::new(),
            trips: HashMap::new(),
            bookings: HashMap::new(),
        }
    }

    fn user(&mut self, label: &str) -> UserId {
        *self.users.entry(label.to_owned()).or_default()
    }

    fn trip(&self, label: &str) -> Result<TripId, CommandError> {
        self.trips
            .get(label)
            .copied()
            .ok_or_else(|| CommandError::UnknownLabel {
                kind: "trip",
                label: label.to_owned(),
            })
    }

    fn booking(&self, label: &str) -> Result<BookingId, CommandError> {
        self.bookings
            .get(label)
            .copied()
            .ok_or_else(|| CommandError::UnknownLabel {
                kind: "booking",
                label: label.to_owned(),
            })
    }

    pub fn user_id(&self, label: &str) -> Option<UserId> {
        self.users.get(label).copied()
    }

    fn apply(&mut self, line: usize, record: &CsvRecord) -> Result<(), CommandError> {
        let actor = self.user(&record.actor);
        let engine = &self.engine;
        match record.op.to_lowercase().as_str() {
            "top_up" => {
                let amount = record.amount.ok_or(CommandError::Missing("amount"))?;
                let outcome = GatewayOutcome::Confirmed {
                    gateway_reference: format!("cli:{line}"),
                };
                engine.top_up(actor, amount, &outcome, &format!("top_up:{line}"))?;
            }
            "trip" => {
                let stop = |address: String| Place {
                    point: GeoPoint { lat: 0.0, lng: 0.0 },
                    address,
                };
                let trip = engine.create_trip(
                    actor,
                    TripDraft {
                        origin: stop(format!("{} origin", record.trip)),
                        destination: stop(format!("{} destination", record.trip)),
                        waypoints: vec![],
                        seats_total: record.seats.ok_or(CommandError::Missing("seats"))?,
                        base_fare: record.amount.ok_or(CommandError::Missing("amount"))?,
                        pickup_fee: record.fee,
                        dropoff_fee: None,
                    },
                )?;
                self.trips.insert(record.trip.clone(), trip.id);
            }
            "publish" => {
                engine.publish_trip(&self.trip(&record.trip)?, actor)?;
            }
            "start" => {
                engine.start_trip(&self.trip(&record.trip)?, actor)?;
            }
            "complete" => {
                engine.complete_trip(&self.trip(&record.trip)?, actor)?;
            }
            "cancel_trip" => {
                engine.cancel_trip(&self.trip(&record.trip)?, actor)?;
            }
            op @ ("book" | "book_pickup") => {
                let request = BookingRequest {
                    trip_id: self.trip(&record.trip)?,
                    seats: record.seats.ok_or(CommandError::Missing("seats"))?,
                    custom_pickup: op == "book_pickup",
                    custom_dropoff: false,
                };
                let booking = engine.book(actor, &request)?;
                self.bookings.insert(record.booking.clone(), booking.id);
            }
            "confirm" => {
                engine.confirm_booking(&self.booking(&record.booking)?, actor)?;
            }
            "reject" => {
                engine.reject_booking(&self.booking(&record.booking)?, actor, "rejected")?;
            }
            "cancel" => {
                engine.cancel_booking(&self.booking(&record.booking)?, actor, None)?;
            }
            "driver_cancel" => {
                engine.driver_cancel_booking(&self.booking(&record.booking)?, actor, None)?;
            }
            "scan" => {
                let id = self.booking(&record.booking)?;
                let rider = engine.booking(&id)?.rider_id;
                let payload = engine.issue_token(&id, rider)?;
                engine.redeem_payload(&payload, actor)?;
            }
            other => return Err(CommandError::UnknownOp(other.to_owned())),
        }
        Ok(())
    }
}

/// Replays commands from a CSV reader.
///
/// Rows are streamed. Malformed rows and rejected commands are logged and
/// skipped; they never stop the replay.
///
/// # CSV Format
///
/// Expected columns: `op, actor, trip, booking, seats, amount[, fee]`
/// - `op`: top_up, trip, publish, start, complete, cancel_trip, book,
///   book_pickup, confirm, reject, cancel, driver_cancel, scan
/// - `actor`: label of the user issuing the command
/// - `trip` / `booking`: labels, bound by the `trip` and `book` ops
/// - `seats`: seat count for `trip` and `book`
/// - `amount`: top-up amount, or base fare for `trip`
/// - `fee`: optional custom pickup fee for `trip`
///
/// # Example
///
/// ```csv
/// op,actor,trip,booking,seats,amount
/// top_up,rita,,,,50.00
/// trip,dave,t1,,3,20.00
/// publish,dave,t1,,,
/// book,rita,t1,b1,1,
/// confirm,dave,,b1,,
/// scan,dave,,b1,,
/// ```
///
/// # Errors
///
/// Returns a CSV error only if the header cannot be read.
pub fn replay_commands<R: Read>(engine: Engine, reader: R) -> Result<Replay, csv::Error> {
    let mut replay = Replay::new(engine);

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);
    rdr.headers()?;

    for (index, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let line = index + 2;
        match result {
            Ok(record) => {
                if let Err(e) = replay.apply(line, &record) {
                    warn!(line, op = %record.op, actor = %record.actor, error = %e, "skipping command");
                }
            }
            Err(e) => {
                warn!(line, error = %e, "skipping malformed row");
            }
        }
    }

    Ok(replay)
}

#[derive(Debug, Serialize)]
struct WalletRow<'a> {
    user: &'a str,
    available: Decimal,
    held: Decimal,
    total: Decimal,
    entries: usize,
}

/// Fixed two-decimal rendering, so zero prints as `0.00`.
fn cents(amount: Decimal) -> Decimal {
    let mut amount = amount;
    amount.rescale(2);
    amount
}

/// Writes one CSV row per known wallet, ordered by label, platform last.
///
/// # CSV Format
///
/// Columns: `user, available, held, total, entries`
///
/// ```csv
/// user,available,held,total,entries
/// dave,18.50,0.00,18.50,1
/// rita,29.50,0.00,29.50,2
/// platform,2.00,0.00,2.00,1
/// ```
pub fn write_wallets<W: Write>(replay: &Replay, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    let mut labels: Vec<(&str, UserId)> = replay
        .users
        .iter()
        .map(|(label, id)| (label.as_str(), *id))
        .collect();
    labels.sort();
    labels.push(("platform", replay.engine.ledger().platform_account()));

    for (label, id) in labels {
        let Some(wallet) = replay.engine.wallet(&id) else {
            continue;
        };
        wtr.serialize(WalletRow {
            user: label,
            available: cents(wallet.available()),
            held: cents(wallet.held()),
            total: cents(wallet.balance()),
            entries: wallet.entries().len(),
        })?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ridepool_engine::{BookingStatus, RedeemOutcome};
    use rust_decimal_macros::dec;
    use std::io::Cursor;

    const HEADER: &str = "op,actor,trip,booking,seats,amount,fee\n";

    fn run(body: &str) -> Replay {
        let csv = format!("{HEADER}{body}");
        replay_commands(Engine::new(), Cursor::new(csv)).unwrap()
    }

    fn balance(replay: &Replay, label: &str) -> Decimal {
        replay.engine.balance(&replay.user_id(label).unwrap())
    }

    #[test]
    fn top_up_credits_wallet() {
        let replay = run("top_up,rita,,,,50.00,\n");
        assert_eq!(balance(&replay, "rita"), dec!(50.00));
    }

    #[test]
    fn full_ride_moves_money() {
        let replay = run("top_up,rita,,,,50.00,\n\
                          trip,dave,t1,,3,20.00,\n\
                          publish,dave,t1,,,,\n\
                          book,rita,t1,b1,1,,\n\
                          confirm,dave,,b1,,,\n\
                          scan,dave,,b1,,,\n");
        assert_eq!(balance(&replay, "rita"), dec!(29.50));
        assert_eq!(balance(&replay, "dave"), dec!(18.50));
        let platform = replay.engine.ledger().platform_account();
        assert_eq!(replay.engine.balance(&platform), dec!(2.00));
    }

    #[test]
    fn pickup_fee_is_added_to_fare() {
        let replay = run("top_up,rita,,,,50.00,\n\
                          trip,dave,t1,,3,20.00,5.00\n\
                          publish,dave,t1,,,,\n\
                          book_pickup,rita,t1,b1,1,,\n");
        let id = replay.bookings["b1"];
        assert_eq!(replay.engine.booking(&id).unwrap().total_amount, dec!(25.00));
    }

    #[test]
    fn rejected_commands_are_skipped() {
        let replay = run("top_up,rita,,,,5.00,\n\
                          trip,dave,t1,,3,20.00,\n\
                          book,rita,t1,b1,1,,\n\
                          top_up,rita,,,,,\n\
                          fly,rita,,,,,\n\
                          top_up,sam,,,,7.00,\n");
        assert!(replay.bookings.is_empty());
        assert_eq!(balance(&replay, "rita"), dec!(5.00));
        assert_eq!(balance(&replay, "sam"), dec!(7.00));
    }

    #[test]
    fn rescan_does_not_charge_twice() {
        let replay = run("top_up,rita,,,,50.00,\n\
                          trip,dave,t1,,3,20.00,\n\
                          publish,dave,t1,,,,\n\
                          book,rita,t1,b1,1,,\n\
                          confirm,dave,,b1,,,\n\
                          scan,dave,,b1,,,\n\
                          scan,dave,,b1,,,\n");
        assert_eq!(balance(&replay, "rita"), dec!(29.50));
        let id = replay.bookings["b1"];
        let token = replay.engine.qr().token_for(&id);
        let dave = replay.user_id("dave").unwrap();
        assert_eq!(
            replay.engine.redeem_token(&token, dave),
            Ok(RedeemOutcome::AlreadyPaid(id))
        );
    }

    #[test]
    fn cancel_trip_cascades() {
        let replay = run("top_up,rita,,,,50.00,\n\
                          trip,dave,t1,,3,20.00,\n\
                          book,rita,t1,b1,2,,\n\
                          confirm,dave,,b1,,,\n\
                          cancel_trip,dave,t1,,,,\n");
        let booking = replay.engine.booking(&replay.bookings["b1"]).unwrap();
        assert_eq!(booking.status, BookingStatus::Cancelled);
        let trip = replay.engine.trip(&replay.trips["t1"]).unwrap();
        assert_eq!(trip.seats_available, 3);
    }

    #[test]
    fn write_wallets_to_csv() {
        let replay = run("top_up,rita,,,,50.00,\n\
                          trip,dave,t1,,3,20.00,\n\
                          publish,dave,t1,,,,\n\
                          book,rita,t1,b1,1,,\n\
                          confirm,dave,,b1,,,\n\
                          scan,dave,,b1,,,\n");
        let mut output = Vec::new();
        write_wallets(&replay, &mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "user,available,held,total,entries");
        assert_eq!(lines[1], "dave,18.50,0.00,18.50,1");
        assert_eq!(lines[2], "rita,29.50,0.00,29.50,2");
        assert_eq!(lines[3], "platform,2.00,0.00,2.00,1");
    }
}
