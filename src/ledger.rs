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

//! Wallet ledger.
//!
//! The [`Ledger`] owns every wallet and is the only path through which a
//! balance changes. Each mutation:
//!
//! 1. locks all participating wallets in ascending [`UserId`] order,
//! 2. claims its reference in the [`TransferJournal`],
//! 3. validates every debit before applying anything,
//! 4. applies debits and credits and journals one entry per side.
//!
//! Because validation happens before the first write and all wallets stay
//! locked until the last one, a partially applied transfer is never
//! observable.
//!
//! A transfer may credit less than it debits; the difference goes to the
//! platform wallet, so money is conserved across the ledger.

use crate::base::{Clock, UserId};
use crate::error::MarketplaceError;
use crate::fees::{PaymentBreakdown, is_whole_cents};
use crate::journal::{Receipt, TransferJournal, TransferOutcome};
use crate::transaction::{Transaction, TransactionKind};
use crate::wallet::{Wallet, WalletData};
use dashmap::DashMap;
use parking_lot::MutexGuard;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A wallet-to-wallet money movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub from: UserId,
    pub to: UserId,
    /// Taken from `from`.
    pub debit_amount: Decimal,
    /// Given to `to`. Must not exceed `debit_amount`.
    pub credit_amount: Decimal,
    pub debit_kind: TransactionKind,
    pub credit_kind: TransactionKind,
    /// Unique per logical payment event.
    pub reference: String,
}

impl TransferRequest {
    /// A plain transfer where both sides see the same amount.
    pub fn new(
        from: UserId,
        to: UserId,
        amount: Decimal,
        kind: TransactionKind,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            from,
            to,
            debit_amount: amount,
            credit_amount: amount,
            debit_kind: kind,
            credit_kind: kind,
            reference: reference.into(),
        }
    }

    /// Rider pays `rider_charge`, driver receives `driver_receives`, the
    /// platform keeps the rest.
    pub fn ride_payment(
        rider: UserId,
        driver: UserId,
        breakdown: &PaymentBreakdown,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            from: rider,
            to: driver,
            debit_amount: breakdown.rider_charge,
            credit_amount: breakdown.driver_receives,
            debit_kind: TransactionKind::RidePayment,
            credit_kind: TransactionKind::RideEarnings,
            reference: reference.into(),
        }
    }

    fn platform_fee(&self) -> Decimal {
        self.debit_amount - self.credit_amount
    }
}

/// Result reported by the external payment gateway for a money movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GatewayOutcome {
    Confirmed { gateway_reference: String },
    Declined { reason: String },
}

type Guards<'a> = BTreeMap<UserId, MutexGuard<'a, WalletData>>;

/// Looks up a wallet that is part of the current lock set.
fn locked<'g, 'a>(
    guards: &'g mut Guards<'a>,
    user: UserId,
) -> Result<&'g mut WalletData, MarketplaceError> {
    // Every participant is locked before the closure that calls this runs.
    guards
        .get_mut(&user)
        .map(|guard| &mut **guard)
        .ok_or(MarketplaceError::Conflict)
}

/// Owns all wallets and the reference journal.
pub struct Ledger {
    wallets: DashMap<UserId, Arc<Wallet>>,
    journal: TransferJournal,
    platform: UserId,
    clock: Arc<dyn Clock>,
}

impl Ledger {
    pub fn new(platform: UserId, clock: Arc<dyn Clock>) -> Self {
        let wallets = DashMap::new();
        wallets.insert(platform, Arc::new(Wallet::new(platform)));
        Self {
            wallets,
            journal: TransferJournal::new(),
            platform,
            clock,
        }
    }

    /// The wallet that collects platform fees.
    pub fn platform_account(&self) -> UserId {
        self.platform
    }

    /// Returns the user's wallet, creating an empty one on first use.
    pub fn wallet(&self, user: UserId) -> Arc<Wallet> {
        self.wallets
            .entry(user)
            .or_insert_with(|| Arc::new(Wallet::new(user)))
            .clone()
    }

    pub fn get_wallet(&self, user: &UserId) -> Option<Arc<Wallet>> {
        self.wallets.get(user).map(|w| Arc::clone(w.value()))
    }

    /// Available balance, zero for users without a wallet.
    pub fn available(&self, user: &UserId) -> Decimal {
        self.get_wallet(user)
            .map(|w| w.available())
            .unwrap_or(Decimal::ZERO)
    }

    /// Fails with `InsufficientFunds` unless the user could pay `amount` right now.
    ///
    /// Nothing is reserved; a later transfer re-checks under lock.
    pub fn ensure_funds(&self, user: &UserId, amount: Decimal) -> Result<(), MarketplaceError> {
        let available = self.available(user);
        if available < amount {
            return Err(MarketplaceError::InsufficientFunds {
                needed: amount,
                available,
            });
        }
        Ok(())
    }

    /// Snapshot of all wallets, ordered by user id.
    pub fn wallets(&self) -> Vec<(UserId, Arc<Wallet>)> {
        let mut all: Vec<_> = self
            .wallets
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub fn statement(&self, user: &UserId) -> Vec<Transaction> {
        self.get_wallet(user)
            .map(|w| w.entries())
            .unwrap_or_default()
    }

    /// Balance recomputed from the user's completed entries.
    pub fn replay_balance(&self, user: &UserId) -> Decimal {
        self.get_wallet(user)
            .map(|w| w.replay_balance())
            .unwrap_or(Decimal::ZERO)
    }

    /// Sum of every wallet balance.
    pub fn total_balance(&self) -> Decimal {
        self.wallets.iter().map(|w| w.value().balance()).sum()
    }

    pub fn receipt(&self, reference: &str) -> Option<Receipt> {
        self.journal.get(reference)
    }

    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    /// Resolves wallets for `users`, deduplicated and in lock order.
    fn participants(&self, users: &[UserId]) -> Vec<(UserId, Arc<Wallet>)> {
        let mut ids = users.to_vec();
        ids.sort();
        ids.dedup();
        ids.into_iter().map(|id| (id, self.wallet(id))).collect()
    }

    /// Moves money between two wallets as one atomic unit.
    ///
    /// A request whose reference has already been applied returns
    /// [`TransferOutcome::Duplicate`] with the original receipt and moves
    /// nothing.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::InvalidAmount`] - Non-positive or sub-cent amounts, or a credit larger than the debit.
    /// - [`MarketplaceError::InsufficientFunds`] - `from` cannot cover the debit.
    pub fn transfer(&self, request: TransferRequest) -> Result<TransferOutcome, MarketplaceError> {
        if request.debit_amount <= Decimal::ZERO
            || request.credit_amount <= Decimal::ZERO
            || request.credit_amount > request.debit_amount
            || !is_whole_cents(request.debit_amount)
            || !is_whole_cents(request.credit_amount)
        {
            return Err(MarketplaceError::InvalidAmount);
        }

        let fee = request.platform_fee();
        let mut users = vec![request.from, request.to];
        if fee > Decimal::ZERO {
            users.push(self.platform);
        }

        let now = self.clock.now();
        let wallets = self.participants(&users);
        let mut guards: Guards<'_> = wallets.iter().map(|(id, w)| (*id, w.lock())).collect();

        let outcome = self.journal.apply_once(&request.reference, || {
            locked(&mut guards, request.from)?.ensure_available(request.debit_amount)?;

            // Nothing below can fail once the debit is known to be covered.
            locked(&mut guards, request.from)?.debit(
                request.debit_amount,
                request.debit_kind,
                &request.reference,
                now,
            )?;
            locked(&mut guards, request.to)?.credit(
                request.credit_amount,
                request.credit_kind,
                &request.reference,
                now,
            )?;
            if fee > Decimal::ZERO {
                locked(&mut guards, self.platform)?.credit(
                    fee,
                    TransactionKind::PlatformFee,
                    &request.reference,
                    now,
                )?;
            }

            Ok(Receipt {
                reference: request.reference.clone(),
                kind: request.debit_kind,
                from: Some(request.from),
                to: Some(request.to),
                debited: request.debit_amount,
                credited: request.credit_amount,
                platform_fee: fee,
                recorded_at: now,
            })
        });

        match &outcome {
            Ok(TransferOutcome::Applied(receipt)) => info!(
                reference = %receipt.reference,
                from = %request.from,
                to = %request.to,
                debited = %receipt.debited,
                credited = %receipt.credited,
                "transfer applied"
            ),
            Ok(TransferOutcome::Duplicate(_)) => {
                debug!(reference = %request.reference, "transfer already applied")
            }
            Err(error) => {
                warn!(reference = %request.reference, from = %request.from, %error, "transfer rejected")
            }
        }
        outcome
    }

    /// Records the result of a gateway top-up.
    ///
    /// A confirmed top-up credits the wallet once per reference. A declined
    /// one is journaled as a failed entry and surfaces as
    /// [`MarketplaceError::GatewayFailure`]; the reference stays free so the
    /// rider can retry.
    pub fn record_top_up(
        &self,
        user: UserId,
        amount: Decimal,
        outcome: &GatewayOutcome,
        reference: &str,
    ) -> Result<TransferOutcome, MarketplaceError> {
        if amount <= Decimal::ZERO || !is_whole_cents(amount) {
            return Err(MarketplaceError::InvalidAmount);
        }
        let now = self.clock.now();
        let wallet = self.wallet(user);
        let mut data = wallet.lock();

        match outcome {
            GatewayOutcome::Declined { reason } => {
                if let Some(receipt) = self.journal.get(reference) {
                    return Ok(TransferOutcome::Duplicate(receipt));
                }
                data.record_failed(amount, TransactionKind::TopUp, reference, now);
                warn!(%user, %amount, reference, reason = %reason, "top-up declined by gateway");
                Err(MarketplaceError::GatewayFailure(reason.clone()))
            }
            GatewayOutcome::Confirmed { gateway_reference } => {
                let outcome = self.journal.apply_once(reference, || {
                    data.credit(amount, TransactionKind::TopUp, reference, now)?;
                    Ok(Receipt {
                        reference: reference.to_owned(),
                        kind: TransactionKind::TopUp,
                        from: None,
                        to: Some(user),
                        debited: Decimal::ZERO,
                        credited: amount,
                        platform_fee: Decimal::ZERO,
                        recorded_at: now,
                    })
                })?;
                if !outcome.is_duplicate() {
                    info!(%user, %amount, reference, gateway_reference = %gateway_reference, "top-up credited");
                }
                Ok(outcome)
            }
        }
    }

    /// Reserves `amount` of the user's available balance for a payout.
    pub fn hold(&self, user: UserId, amount: Decimal) -> Result<(), MarketplaceError> {
        let wallet = self.wallet(user);
        wallet.lock().hold_funds(amount)?;
        debug!(%user, %amount, "funds held");
        Ok(())
    }

    /// Returns previously held funds to the available balance.
    pub fn release(&self, user: UserId, amount: Decimal) -> Result<(), MarketplaceError> {
        let wallet = self.wallet(user);
        wallet.lock().release_funds(amount)?;
        debug!(%user, %amount, "held funds released");
        Ok(())
    }

    /// Amounts [`Ledger::pay_out_held`] accepts: a positive payout and a
    /// non-negative fee, both in whole cents.
    pub fn check_payout(payout: Decimal, fee: Decimal) -> Result<(), MarketplaceError> {
        if payout <= Decimal::ZERO
            || fee < Decimal::ZERO
            || !is_whole_cents(payout)
            || !is_whole_cents(fee)
        {
            return Err(MarketplaceError::InvalidAmount);
        }
        Ok(())
    }

    /// Pays out held funds through the gateway after it confirmed success.
    ///
    /// `payout + fee` leaves the user's held balance; `fee` is credited to
    /// the platform wallet.
    pub fn pay_out_held(
        &self,
        user: UserId,
        payout: Decimal,
        fee: Decimal,
        reference: &str,
    ) -> Result<TransferOutcome, MarketplaceError> {
        Self::check_payout(payout, fee)?;
        let gross = payout + fee;
        let now = self.clock.now();
        let wallets = self.participants(&[user, self.platform]);
        let mut guards: Guards<'_> = wallets.iter().map(|(id, w)| (*id, w.lock())).collect();

        let outcome = self.journal.apply_once(reference, || {
            locked(&mut guards, user)?.ensure_held(gross)?;

            locked(&mut guards, user)?.spend_held(payout, TransactionKind::Payout, reference, now)?;
            if fee > Decimal::ZERO {
                locked(&mut guards, user)?.spend_held(
                    fee,
                    TransactionKind::SettlementFee,
                    reference,
                    now,
                )?;
                locked(&mut guards, self.platform)?.credit(
                    fee,
                    TransactionKind::SettlementFee,
                    reference,
                    now,
                )?;
            }

            Ok(Receipt {
                reference: reference.to_owned(),
                kind: TransactionKind::Payout,
                from: Some(user),
                to: None,
                debited: gross,
                credited: payout,
                platform_fee: fee,
                recorded_at: now,
            })
        })?;

        if !outcome.is_duplicate() {
            info!(%user, %payout, %fee, reference, "payout recorded");
        }
        Ok(outcome)
    }
}
