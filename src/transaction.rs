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

//! Ledger entries.
//!
//! A [`Transaction`] is an immutable, signed record of one balance change on
//! one wallet. A wallet's balance always equals the sum of the amounts of its
//! [`TransactionStatus::Completed`] entries.

use crate::base::{EntryId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Rider pays for a scanned booking.
    RidePayment,
    /// Driver's share of a scanned booking.
    RideEarnings,
    /// Platform's cut of a scanned booking.
    PlatformFee,
    /// Money in from the external gateway.
    TopUp,
    /// Money out to a driver through the external gateway.
    Payout,
    /// Platform's cut taken when a settlement is paid out.
    SettlementFee,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RidePayment => "ride_payment",
            Self::RideEarnings => "ride_earnings",
            Self::PlatformFee => "platform_fee",
            Self::TopUp => "top_up",
            Self::Payout => "payout",
            Self::SettlementFee => "settlement_fee",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Applied to the balance.
    Completed,
    /// Recorded for audit only; the balance did not move.
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: EntryId,
    pub user_id: UserId,
    pub kind: TransactionKind,
    /// Signed: credits are positive, debits negative.
    pub amount: Decimal,
    pub status: TransactionStatus,
    /// Shared by every entry belonging to the same logical payment event.
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub(crate) fn completed(
        user_id: UserId,
        kind: TransactionKind,
        amount: Decimal,
        reference: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EntryId::new(),
            user_id,
            kind,
            amount,
            status: TransactionStatus::Completed,
            reference: reference.to_owned(),
            created_at,
        }
    }

    pub(crate) fn failed(
        user_id: UserId,
        kind: TransactionKind,
        amount: Decimal,
        reference: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: TransactionStatus::Failed,
            ..Self::completed(user_id, kind, amount, reference, created_at)
        }
    }

    /// Amount this entry contributes to the balance.
    pub fn signed_effect(&self) -> Decimal {
        match self.status {
            TransactionStatus::Completed => self.amount,
            TransactionStatus::Failed => Decimal::ZERO,
        }
    }

    pub fn is_credit(&self) -> bool {
        self.amount > Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn failed_entries_do_not_affect_balance() {
        let entry = Transaction::failed(
            UserId::new(),
            TransactionKind::TopUp,
            dec!(25.00),
            "topup:1",
            Utc::now(),
        );
        assert_eq!(entry.signed_effect(), Decimal::ZERO);
        assert_eq!(entry.status, TransactionStatus::Failed);
    }

    #[test]
    fn debits_are_negative() {
        let entry = Transaction::completed(
            UserId::new(),
            TransactionKind::RidePayment,
            dec!(-20.50),
            "ride_payment:x",
            Utc::now(),
        );
        assert!(!entry.is_credit());
        assert_eq!(entry.signed_effect(), dec!(-20.50));
    }

    #[test]
    fn kinds_serialize_snake_case() {
        let json = serde_json::to_string(&TransactionKind::RideEarnings).unwrap();
        assert_eq!(json, "\"ride_earnings\"");
        assert_eq!(TransactionKind::SettlementFee.to_string(), "settlement_fee");
    }
}
