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

//! Daily driver settlements.
//!
//! [`SettlementDesk::generate`] rolls every booking paid on a date up into
//! one [`Settlement`] per driver, grouped under a [`SettlementBatch`] that is
//! unique per date. An admin then approves each settlement, which pays the
//! driver out through a [`PayoutGateway`]:
//!
//! ```text
//!   Pending ──approve──► Processing ──┬──► Completed
//!      │                     ▲        └──► Failed ──┐
//!      │                     └──────retry───────────┘
//!      └──reject──► Cancelled
//! ```
//!
//! Approval is stamped in `approved_at`. A payout the gateway confirmed but
//! the ledger refused lands in `Failed` with its `payment_reference` set; a
//! retry then only journals it.

use crate::base::{BatchId, BookingId, Clock, SettlementId, UserId};
use crate::booking::BookingBook;
use crate::error::MarketplaceError;
use crate::fees::{FeeSchedule, PaymentBreakdown};
use crate::ledger::Ledger;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    /// Not set by [`SettlementDesk`], which records approval in `approved_at`.
    Approved,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl SettlementStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// No settlement has been acted on.
    Pending,
    Processing,
    /// Every settlement was paid or cancelled.
    Completed,
    /// Every settlement is done and at least one failed.
    Failed,
}

/// One driver's payout for one settlement date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: SettlementId,
    pub batch_id: BatchId,
    pub driver_id: UserId,
    pub settlement_date: NaiveDate,
    /// Sum of what the driver received for the day's paid bookings.
    pub gross_earnings: Decimal,
    pub platform_fee: Decimal,
    pub payout_amount: Decimal,
    pub booking_ids: Vec<BookingId>,
    pub status: SettlementStatus,
    pub payment_reference: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Settlement {
    fn invalid(&self, action: ApprovalAction) -> MarketplaceError {
        MarketplaceError::InvalidSettlementTransition {
            from: self.status.to_string(),
            action: action.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementBatch {
    pub id: BatchId,
    pub settlement_date: NaiveDate,
    pub settlement_ids: Vec<SettlementId>,
    pub settlement_count: usize,
    pub total_gross: Decimal,
    pub total_platform_fee: Decimal,
    /// Equals the sum of `payout_amount` over the batch's settlements.
    pub total_amount: Decimal,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    pub batch: SettlementBatch,
    /// `false` when the batch for the date already existed.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Reject,
    Retry,
}

impl fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Retry => "retry",
        };
        f.write_str(s)
    }
}

/// Body of a settlement trigger call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub success: bool,
    pub settlements_created: usize,
    pub total_amount: Decimal,
    pub batch_id: BatchId,
}

impl From<&SettlementBatch> for TriggerResponse {
    fn from(batch: &SettlementBatch) -> Self {
        Self {
            success: true,
            settlements_created: batch.settlement_count,
            total_amount: batch.total_amount,
            batch_id: batch.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub settlement_id: SettlementId,
    pub admin_pin: String,
    pub action: ApprovalAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub success: bool,
    pub status: SettlementStatus,
    pub payment_reference: Option<String>,
}

impl From<&Settlement> for ApprovalResponse {
    fn from(settlement: &Settlement) -> Self {
        Self {
            success: true,
            status: settlement.status,
            payment_reference: settlement.payment_reference.clone(),
        }
    }
}

/// Tells administrators a batch is waiting for approval.
pub trait SettlementNotifier: Send + Sync {
    fn settlements_ready(&self, batch: &SettlementBatch);
}

/// Logs new batches.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl SettlementNotifier for LogNotifier {
    fn settlements_ready(&self, batch: &SettlementBatch) {
        info!(
            batch = %batch.id,
            date = %batch.settlement_date,
            settlements = batch.settlement_count,
            total = %batch.total_amount,
            "settlements ready for approval"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub settlement_id: SettlementId,
    pub driver_id: UserId,
    pub amount: Decimal,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayReceipt {
    pub payment_reference: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct GatewayError {
    pub message: String,
}

impl GatewayError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// External payment rail that sends money to a driver's bank account.
pub trait PayoutGateway: Send + Sync {
    fn payout(&self, request: &PayoutRequest) -> Result<GatewayReceipt, GatewayError>;
}

/// Confirms every payout immediately. Used by the CLI and the demo server.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantGateway;

impl PayoutGateway for InstantGateway {
    fn payout(&self, request: &PayoutRequest) -> Result<GatewayReceipt, GatewayError> {
        Ok(GatewayReceipt {
            payment_reference: format!("instant:{}", request.reference),
        })
    }
}

pub struct SettlementDesk {
    bookings: Arc<BookingBook>,
    ledger: Arc<Ledger>,
    fees: FeeSchedule,
    settlements: DashMap<SettlementId, Arc<Mutex<Settlement>>>,
    batches: DashMap<NaiveDate, SettlementBatch>,
    batch_dates: DashMap<BatchId, NaiveDate>,
    generation: Mutex<()>,
    gateway: Arc<dyn PayoutGateway>,
    notifier: Arc<dyn SettlementNotifier>,
    clock: Arc<dyn Clock>,
}

impl SettlementDesk {
    pub fn new(
        bookings: Arc<BookingBook>,
        ledger: Arc<Ledger>,
        fees: FeeSchedule,
        gateway: Arc<dyn PayoutGateway>,
        notifier: Arc<dyn SettlementNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bookings,
            ledger,
            fees,
            settlements: DashMap::new(),
            batches: DashMap::new(),
            batch_dates: DashMap::new(),
            generation: Mutex::new(()),
            gateway,
            notifier,
            clock,
        }
    }

    /// The day before the clock's current UTC date.
    pub fn yesterday(&self) -> NaiveDate {
        let today = self.clock.now().date_naive();
        today.pred_opt().unwrap_or(today)
    }

    /// Creates the batch for `date`, or returns the existing one untouched.
    ///
    /// A date with no paid bookings still gets an (empty) batch so the call
    /// stays idempotent.
    pub fn generate(&self, date: NaiveDate) -> GenerationOutcome {
        let _generation = self.generation.lock();
        if let Some(existing) = self.batches.get(&date) {
            info!(%date, batch = %existing.id, "settlement batch already exists");
            return GenerationOutcome {
                batch: existing.clone(),
                created: false,
            };
        }

        let start = date.and_time(NaiveTime::MIN).and_utc();
        let end = start + TimeDelta::days(1);
        let mut per_driver: BTreeMap<UserId, (Decimal, Vec<BookingId>)> = BTreeMap::new();
        for booking in self.bookings.paid_between(start, end) {
            let earned = booking.driver_receives.unwrap_or_else(|| {
                PaymentBreakdown::compute(booking.total_amount, &self.fees).driver_receives
            });
            let (gross, ids) = per_driver.entry(booking.driver_id).or_default();
            *gross += earned;
            ids.push(booking.id);
        }

        let now = self.clock.now();
        let batch_id = BatchId::new();
        let settlements: Vec<Settlement> = per_driver
            .into_iter()
            .filter_map(|(driver_id, (gross, booking_ids))| {
                let platform_fee = self.fees.settlement_fee(gross);
                if gross - platform_fee <= Decimal::ZERO {
                    warn!(%date, driver = %driver_id, %gross, "nothing to pay out after settlement fee");
                    return None;
                }
                Some(Settlement {
                    id: SettlementId::new(),
                    batch_id,
                    driver_id,
                    settlement_date: date,
                    gross_earnings: gross,
                    platform_fee,
                    payout_amount: gross - platform_fee,
                    booking_ids,
                    status: SettlementStatus::Pending,
                    payment_reference: None,
                    error_message: None,
                    created_at: now,
                    updated_at: now,
                    approved_at: None,
                    paid_at: None,
                })
            })
            .collect();

        let batch = SettlementBatch {
            id: batch_id,
            settlement_date: date,
            settlement_ids: settlements.iter().map(|s| s.id).collect(),
            settlement_count: settlements.len(),
            total_gross: settlements.iter().map(|s| s.gross_earnings).sum(),
            total_platform_fee: settlements.iter().map(|s| s.platform_fee).sum(),
            total_amount: settlements.iter().map(|s| s.payout_amount).sum(),
            status: BatchStatus::Pending,
            created_at: now,
        };

        // The batch row goes in last: once it is visible, all of its
        // settlements are too.
        for settlement in settlements {
            self.settlements
                .insert(settlement.id, Arc::new(Mutex::new(settlement)));
        }
        self.batch_dates.insert(batch.id, date);
        self.batches.insert(date, batch.clone());

        info!(
            %date,
            batch = %batch.id,
            settlements = batch.settlement_count,
            total = %batch.total_amount,
            "settlement batch generated"
        );
        self.notifier.settlements_ready(&batch);
        GenerationOutcome {
            batch,
            created: true,
        }
    }

    /// Approves a pending settlement and pays it out.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::InsufficientFunds`] - Driver's wallet no longer holds the gross; settlement unchanged.
    /// - [`MarketplaceError::GatewayFailure`] - Payout rejected; settlement recorded as `failed`.
    pub fn approve(&self, id: &SettlementId) -> Result<Settlement, MarketplaceError> {
        self.act(id, ApprovalAction::Approve)
    }

    /// Cancels a pending settlement without paying it.
    pub fn reject(&self, id: &SettlementId) -> Result<Settlement, MarketplaceError> {
        self.act(id, ApprovalAction::Reject)
    }

    /// Re-sends a failed payout.
    pub fn retry(&self, id: &SettlementId) -> Result<Settlement, MarketplaceError> {
        self.act(id, ApprovalAction::Retry)
    }

    pub fn act(
        &self,
        id: &SettlementId,
        action: ApprovalAction,
    ) -> Result<Settlement, MarketplaceError> {
        let handle = self.handle(id)?;
        let result = {
            let mut settlement = handle.lock();
            match (action, settlement.status) {
                (ApprovalAction::Approve, SettlementStatus::Pending)
                | (ApprovalAction::Retry, SettlementStatus::Failed) => {
                    self.pay_out(&mut settlement, action)
                }
                (ApprovalAction::Reject, SettlementStatus::Pending) => {
                    settlement.status = SettlementStatus::Cancelled;
                    settlement.updated_at = self.clock.now();
                    info!(settlement = %id, "settlement rejected");
                    Ok(settlement.clone())
                }
                _ => return Err(settlement.invalid(action)),
            }
        };
        self.refresh_batch(id);
        result
    }

    fn pay_out(
        &self,
        settlement: &mut Settlement,
        action: ApprovalAction,
    ) -> Result<Settlement, MarketplaceError> {
        Ledger::check_payout(settlement.payout_amount, settlement.platform_fee)?;

        // The gateway already sent this payout; only the ledger side is missing.
        if let Some(sent) = settlement.payment_reference.clone() {
            settlement.status = SettlementStatus::Processing;
            settlement.updated_at = self.clock.now();
            return self.record_payout(settlement, sent);
        }

        self.ledger
            .hold(settlement.driver_id, settlement.gross_earnings)?;

        let now = self.clock.now();
        if action == ApprovalAction::Approve {
            settlement.approved_at = Some(now);
        }
        settlement.status = SettlementStatus::Processing;
        settlement.updated_at = now;

        let request = PayoutRequest {
            settlement_id: settlement.id,
            driver_id: settlement.driver_id,
            amount: settlement.payout_amount,
            reference: payout_reference(&settlement.id),
        };
        match self.gateway.payout(&request) {
            Ok(receipt) => self.record_payout(settlement, receipt.payment_reference),
            Err(failure) => {
                self.ledger
                    .release(settlement.driver_id, settlement.gross_earnings)?;
                settlement.status = SettlementStatus::Failed;
                settlement.error_message = Some(failure.message.clone());
                settlement.updated_at = self.clock.now();
                warn!(settlement = %settlement.id, error = %failure, "payout failed");
                Err(MarketplaceError::GatewayFailure(failure.message))
            }
        }
    }

    /// Journals a payout the gateway confirmed.
    ///
    /// If the ledger refuses, the settlement is marked `failed` with the
    /// gateway's reference kept and the driver's gross still held, so a
    /// retry records it without paying twice.
    fn record_payout(
        &self,
        settlement: &mut Settlement,
        payment_reference: String,
    ) -> Result<Settlement, MarketplaceError> {
        settlement.payment_reference = Some(payment_reference);
        let recorded = self.ledger.pay_out_held(
            settlement.driver_id,
            settlement.payout_amount,
            settlement.platform_fee,
            &payout_reference(&settlement.id),
        );
        let now = self.clock.now();
        settlement.updated_at = now;
        if let Err(err) = recorded {
            error!(settlement = %settlement.id, %err, "payout sent but not recorded");
            settlement.status = SettlementStatus::Failed;
            settlement.error_message = Some(format!("payout sent but not recorded: {err}"));
            return Err(err);
        }
        settlement.status = SettlementStatus::Completed;
        settlement.error_message = None;
        settlement.paid_at = Some(now);
        info!(
            settlement = %settlement.id,
            driver = %settlement.driver_id,
            amount = %settlement.payout_amount,
            "settlement paid out"
        );
        Ok(settlement.clone())
    }

    fn refresh_batch(&self, id: &SettlementId) {
        let Some(batch_id) = self.get(id).ok().map(|s| s.batch_id) else {
            return;
        };
        let Some(date) = self.batch_dates.get(&batch_id).map(|d| *d) else {
            return;
        };
        if let Some(mut batch) = self.batches.get_mut(&date) {
            let statuses: Vec<SettlementStatus> = batch
                .settlement_ids
                .iter()
                .filter_map(|id| self.get(id).ok().map(|s| s.status))
                .collect();
            batch.status = batch_status(&statuses);
        }
    }

    fn handle(&self, id: &SettlementId) -> Result<Arc<Mutex<Settlement>>, MarketplaceError> {
        self.settlements
            .get(id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(MarketplaceError::SettlementNotFound)
    }

    pub fn get(&self, id: &SettlementId) -> Result<Settlement, MarketplaceError> {
        Ok(self.handle(id)?.lock().clone())
    }

    pub fn batch(&self, date: &NaiveDate) -> Option<SettlementBatch> {
        self.batches.get(date).map(|b| b.clone())
    }

    pub fn batch_by_id(&self, id: &BatchId) -> Option<SettlementBatch> {
        let date = self.batch_dates.get(id).map(|d| *d)?;
        self.batch(&date)
    }

    pub fn for_batch(&self, id: &BatchId) -> Vec<Settlement> {
        self.batch_by_id(id)
            .map(|batch| {
                batch
                    .settlement_ids
                    .iter()
                    .filter_map(|id| self.get(id).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn batches(&self) -> Vec<SettlementBatch> {
        let mut batches: Vec<_> = self.batches.iter().map(|b| b.clone()).collect();
        batches.sort_by_key(|b| b.settlement_date);
        batches
    }
}

fn payout_reference(id: &SettlementId) -> String {
    format!("settlement:{id}")
}

fn batch_status(statuses: &[SettlementStatus]) -> BatchStatus {
    if statuses.iter().all(|s| *s == SettlementStatus::Pending) {
        BatchStatus::Pending
    } else if statuses.iter().all(|s| s.is_terminal()) {
        BatchStatus::Completed
    } else if statuses
        .iter()
        .all(|s| s.is_terminal() || *s == SettlementStatus::Failed)
    {
        BatchStatus::Failed
    } else {
        BatchStatus::Processing
    }
}
