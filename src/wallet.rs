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

//! Per-user prepaid wallets.
//!
//! A wallet keeps an `available` balance, a `held` balance reserved for an
//! in-flight payout, and the append-only list of entries that produced them.
//!
//! ```text
//!   credit ──► available ──hold──► held ──settle──► (paid out)
//!                  ▲                 │
//!                  └─────release─────┘
//! ```
//!
//! Wallets are only mutated through [`crate::Ledger`], which locks every
//! participating wallet before touching any of them.
//!
//! # Example
//!
//! ```
//! use rust_decimal_macros::dec;
//! use ridepool_engine::{UserId, Wallet};
//!
//! let wallet = Wallet::new(UserId::new());
//! assert_eq!(wallet.balance(), dec!(0.00));
//! ```

use crate::base::UserId;
use crate::error::MarketplaceError;
use crate::transaction::{Transaction, TransactionKind};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rust_decimal::Decimal;
use serde::ser::{Serialize, SerializeStruct, Serializer};

#[derive(Debug)]
pub(crate) struct WalletData {
    user_id: UserId,
    available: Decimal,
    held: Decimal,
    entries: Vec<Transaction>,
}

impl WalletData {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            available: Decimal::ZERO,
            held: Decimal::ZERO,
            entries: Vec::new(),
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.available >= Decimal::ZERO,
            "Invariant violated: available balance went negative: {}",
            self.available
        );
        debug_assert!(
            self.held >= Decimal::ZERO,
            "Invariant violated: held balance went negative: {}",
            self.held
        );
    }

    pub(crate) fn user_id(&self) -> UserId {
        self.user_id
    }

    pub(crate) fn available(&self) -> Decimal {
        self.available
    }

    pub(crate) fn held(&self) -> Decimal {
        self.held
    }

    /// Fails unless `amount` can be debited from the available balance.
    pub(crate) fn ensure_available(&self, amount: Decimal) -> Result<(), MarketplaceError> {
        if amount <= Decimal::ZERO {
            return Err(MarketplaceError::InvalidAmount);
        }
        if self.available < amount {
            return Err(MarketplaceError::InsufficientFunds {
                needed: amount,
                available: self.available,
            });
        }
        Ok(())
    }

    /// Increases available balance and journals a positive entry.
    pub(crate) fn credit(
        &mut self,
        amount: Decimal,
        kind: TransactionKind,
        reference: &str,
        at: DateTime<Utc>,
    ) -> Result<(), MarketplaceError> {
        if amount <= Decimal::ZERO {
            return Err(MarketplaceError::InvalidAmount);
        }
        self.available += amount;
        self.entries
            .push(Transaction::completed(self.user_id, kind, amount, reference, at));
        self.assert_invariants();
        Ok(())
    }

    /// Decreases available balance and journals a negative entry.
    pub(crate) fn debit(
        &mut self,
        amount: Decimal,
        kind: TransactionKind,
        reference: &str,
        at: DateTime<Utc>,
    ) -> Result<(), MarketplaceError> {
        self.ensure_available(amount)?;
        self.available -= amount;
        self.entries
            .push(Transaction::completed(self.user_id, kind, -amount, reference, at));
        self.assert_invariants();
        Ok(())
    }

    /// Moves funds from available to held.
    pub(crate) fn hold_funds(&mut self, amount: Decimal) -> Result<(), MarketplaceError> {
        self.ensure_available(amount)?;
        self.available -= amount;
        self.held += amount;
        self.assert_invariants();
        Ok(())
    }

    /// Moves funds from held back to available.
    pub(crate) fn release_funds(&mut self, amount: Decimal) -> Result<(), MarketplaceError> {
        self.ensure_held(amount)?;
        self.held -= amount;
        self.available += amount;
        self.assert_invariants();
        Ok(())
    }

    /// Removes funds from held and journals the outflow.
    pub(crate) fn spend_held(
        &mut self,
        amount: Decimal,
        kind: TransactionKind,
        reference: &str,
        at: DateTime<Utc>,
    ) -> Result<(), MarketplaceError> {
        self.ensure_held(amount)?;
        self.held -= amount;
        self.entries
            .push(Transaction::completed(self.user_id, kind, -amount, reference, at));
        self.assert_invariants();
        Ok(())
    }

    pub(crate) fn ensure_held(&self, amount: Decimal) -> Result<(), MarketplaceError> {
        if amount <= Decimal::ZERO {
            return Err(MarketplaceError::InvalidAmount);
        }
        if self.held < amount {
            return Err(MarketplaceError::InsufficientFunds {
                needed: amount,
                available: self.held,
            });
        }
        Ok(())
    }

    /// Journals an entry that never touched the balance (e.g. a declined top-up).
    pub(crate) fn record_failed(
        &mut self,
        amount: Decimal,
        kind: TransactionKind,
        reference: &str,
        at: DateTime<Utc>,
    ) {
        self.entries
            .push(Transaction::failed(self.user_id, kind, amount, reference, at));
    }
}

/// A user's prepaid wallet.
#[derive(Debug)]
pub struct Wallet {
    inner: Mutex<WalletData>,
}

impl Wallet {
    const DECIMAL_PRECISION: u32 = 2;

    pub fn new(user_id: UserId) -> Self {
        Self {
            inner: Mutex::new(WalletData::new(user_id)),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.inner.lock().user_id
    }

    pub fn available(&self) -> Decimal {
        self.inner.lock().available
    }

    pub fn held(&self) -> Decimal {
        self.inner.lock().held
    }

    /// Returns `available + held`.
    pub fn balance(&self) -> Decimal {
        let data = self.inner.lock();
        data.available + data.held
    }

    /// Snapshot of every entry in insertion order.
    pub fn entries(&self) -> Vec<Transaction> {
        self.inner.lock().entries.clone()
    }

    /// Recomputes the balance from the journal alone.
    pub fn replay_balance(&self) -> Decimal {
        self.inner
            .lock()
            .entries
            .iter()
            .map(Transaction::signed_effect)
            .sum()
    }

    fn fixed(amount: Decimal) -> Decimal {
        let mut amount = amount;
        amount.rescale(Self::DECIMAL_PRECISION);
        amount
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, WalletData> {
        self.inner.lock()
    }
}

impl Serialize for Wallet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let data = self.inner.lock();
        let mut state = serializer.serialize_struct("Wallet", 5)?;
        state.serialize_field("user", &data.user_id)?;
        state.serialize_field("available", &Wallet::fixed(data.available))?;
        state.serialize_field("held", &Wallet::fixed(data.held))?;
        state.serialize_field("total", &Wallet::fixed(data.available + data.held))?;
        state.serialize_field("entries", &data.entries.len())?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionStatus;
    use rust_decimal_macros::dec;

    fn funded(amount: Decimal) -> WalletData {
        let mut data = WalletData::new(UserId::new());
        data.credit(amount, TransactionKind::TopUp, "seed", Utc::now())
            .unwrap();
        data
    }

    #[test]
    fn debit_refuses_to_go_negative() {
        let mut data = funded(dec!(10.00));
        let result = data.debit(dec!(10.25), TransactionKind::RidePayment, "r", Utc::now());
        assert_eq!(
            result,
            Err(MarketplaceError::InsufficientFunds {
                needed: dec!(10.25),
                available: dec!(10.00)
            })
        );
        assert_eq!(data.available, dec!(10.00));
        assert_eq!(data.entries.len(), 1);
    }

    #[test]
    fn credit_rejects_non_positive_amounts() {
        let mut data = WalletData::new(UserId::new());
        assert_eq!(
            data.credit(Decimal::ZERO, TransactionKind::TopUp, "r", Utc::now()),
            Err(MarketplaceError::InvalidAmount)
        );
        assert_eq!(
            data.credit(dec!(-1), TransactionKind::TopUp, "r", Utc::now()),
            Err(MarketplaceError::InvalidAmount)
        );
        assert!(data.entries.is_empty());
    }

    #[test]
    fn hold_release_round_trip() {
        let mut data = funded(dec!(100.00));
        data.hold_funds(dec!(30.00)).unwrap();
        assert_eq!(data.available, dec!(70.00));
        assert_eq!(data.held, dec!(30.00));

        data.release_funds(dec!(30.00)).unwrap();
        assert_eq!(data.available, dec!(100.00));
        assert_eq!(data.held, Decimal::ZERO);
    }

    #[test]
    fn spend_held_journals_outflow() {
        let mut data = funded(dec!(100.00));
        data.hold_funds(dec!(40.00)).unwrap();
        data.spend_held(dec!(40.00), TransactionKind::Payout, "p", Utc::now())
            .unwrap();
        assert_eq!(data.held, Decimal::ZERO);
        assert_eq!(data.available, dec!(60.00));
        assert_eq!(data.entries.last().unwrap().amount, dec!(-40.00));
    }

    #[test]
    fn spend_held_requires_enough_held() {
        let mut data = funded(dec!(100.00));
        data.hold_funds(dec!(10.00)).unwrap();
        let result = data.spend_held(dec!(20.00), TransactionKind::Payout, "p", Utc::now());
        assert!(matches!(result, Err(MarketplaceError::InsufficientFunds { .. })));
        assert_eq!(data.held, dec!(10.00));
    }

    #[test]
    fn failed_entry_is_journaled_without_moving_balance() {
        let mut data = WalletData::new(UserId::new());
        data.record_failed(dec!(50.00), TransactionKind::TopUp, "t", Utc::now());
        assert_eq!(data.available, Decimal::ZERO);
        assert_eq!(data.entries[0].status, TransactionStatus::Failed);
    }

    #[test]
    fn replay_matches_balance() {
        let wallet = Wallet::new(UserId::new());
        {
            let mut data = wallet.lock();
            data.credit(dec!(50.00), TransactionKind::TopUp, "a", Utc::now())
                .unwrap();
            data.debit(dec!(20.50), TransactionKind::RidePayment, "b", Utc::now())
                .unwrap();
            data.hold_funds(dec!(5.00)).unwrap();
            data.record_failed(dec!(99.00), TransactionKind::TopUp, "c", Utc::now());
        }
        assert_eq!(wallet.balance(), dec!(29.50));
        assert_eq!(wallet.replay_balance(), wallet.balance());
    }

    // === Serialization Tests ===

    #[test]
    fn serializer_rounds_to_cents() {
        let wallet = Wallet::new(UserId::new());
        {
            let mut data = wallet.lock();
            data.available = dec!(12.345);
            data.held = dec!(0.001);
        }

        let json = serde_json::to_string(&wallet).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        // Banker's rounding from round_dp: 12.345 -> 12.34
        assert_eq!(parsed["available"].as_str().unwrap(), "12.34");
        assert_eq!(parsed["held"].as_str().unwrap(), "0.00");
        assert_eq!(parsed["total"].as_str().unwrap(), "12.35");
        assert_eq!(parsed["entries"], 0);
    }
}
