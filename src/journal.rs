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

//! Reference-keyed journal of applied money movements.
//!
//! Every ledger mutation carries a reference that is unique per logical
//! payment event. The journal remembers the receipt of each applied
//! reference so a retried call is answered with the original receipt instead
//! of moving money a second time.

use crate::base::UserId;
use crate::transaction::TransactionKind;
use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What a single applied reference did to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub reference: String,
    pub kind: TransactionKind,
    /// `None` for money entering from the gateway.
    pub from: Option<UserId>,
    /// `None` for money leaving through the gateway.
    pub to: Option<UserId>,
    pub debited: Decimal,
    pub credited: Decimal,
    pub platform_fee: Decimal,
    pub recorded_at: DateTime<Utc>,
}

/// Result of a ledger call that carries a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Money moved now.
    Applied(Receipt),
    /// The reference had already been applied; nothing moved.
    Duplicate(Receipt),
}

impl TransferOutcome {
    pub fn receipt(&self) -> &Receipt {
        match self {
            Self::Applied(receipt) | Self::Duplicate(receipt) => receipt,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// A thread-safe reference journal with duplicate detection.
///
/// Combines a [`DashMap`] for O(1) duplicate checking with a [`SegQueue`]
/// to preserve application order.
#[derive(Debug)]
pub struct TransferJournal {
    receipts: DashMap<String, Receipt>,
    order: SegQueue<String>,
}

impl TransferJournal {
    pub fn new() -> Self {
        Self {
            receipts: DashMap::new(),
            order: SegQueue::new(),
        }
    }

    /// Applies `apply` exactly once per reference.
    ///
    /// The shard holding `reference` stays locked while `apply` runs, so a
    /// concurrent call with the same reference waits and then observes the
    /// receipt. If `apply` fails nothing is recorded and the reference stays
    /// free for a retry.
    ///
    /// `apply` must not call back into the journal.
    pub fn apply_once<E>(
        &self,
        reference: &str,
        apply: impl FnOnce() -> Result<Receipt, E>,
    ) -> Result<TransferOutcome, E> {
        match self.receipts.entry(reference.to_owned()) {
            Entry::Occupied(existing) => Ok(TransferOutcome::Duplicate(existing.get().clone())),
            Entry::Vacant(slot) => {
                let receipt = apply()?;
                slot.insert(receipt.clone());
                self.order.push(reference.to_owned());
                Ok(TransferOutcome::Applied(receipt))
            }
        }
    }

    pub fn get(&self, reference: &str) -> Option<Receipt> {
        self.receipts.get(reference).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for TransferJournal {
    fn default() -> Self {
        Self::new()
    }
}
