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

//! Platform fee schedule and per-payment breakdowns.
//!
//! Every fee is rounded to cents on its own before being combined, so the
//! figures a rider sees on the QR screen and the figures the ledger journals
//! are identical no matter which one is computed first.
//!
//! ```
//! use ridepool_engine::{FeeSchedule, PaymentBreakdown};
//! use rust_decimal_macros::dec;
//!
//! let breakdown = PaymentBreakdown::compute(dec!(20.00), &FeeSchedule::default());
//! assert_eq!(breakdown.rider_charge, dec!(20.50));
//! assert_eq!(breakdown.driver_receives, dec!(18.50));
//! ```

use crate::error::MarketplaceError;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Rounds a money amount to whole cents, half away from zero.
pub fn to_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// True when `amount` carries no fraction of a cent.
pub fn is_whole_cents(amount: Decimal) -> bool {
    amount.round_dp(2) == amount
}

/// Percentage rates the platform charges.
///
/// Every rate lies in `[0, 1)`, so a fee never swallows the amount it is
/// taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeSchedule {
    /// Service fee added on top of the fare and charged to the rider.
    rider_fee_rate: Decimal,
    /// Commission withheld from the fare before it reaches the driver.
    driver_fee_rate: Decimal,
    /// Reconciliation fee taken from a driver's gross earnings at settlement.
    settlement_fee_rate: Decimal,
}

impl FeeSchedule {
    pub const DEFAULT_RIDER_FEE_RATE: Decimal = dec!(0.025);
    pub const DEFAULT_DRIVER_FEE_RATE: Decimal = dec!(0.075);
    pub const DEFAULT_SETTLEMENT_FEE_RATE: Decimal = dec!(0.075);

    /// # Errors
    ///
    /// - [`MarketplaceError::InvalidAmount`] - A rate is negative or not below one.
    pub fn new(
        rider_fee_rate: Decimal,
        driver_fee_rate: Decimal,
        settlement_fee_rate: Decimal,
    ) -> Result<Self, MarketplaceError> {
        let in_range = |rate: Decimal| rate >= Decimal::ZERO && rate < Decimal::ONE;
        if !(in_range(rider_fee_rate) && in_range(driver_fee_rate) && in_range(settlement_fee_rate)) {
            return Err(MarketplaceError::InvalidAmount);
        }
        Ok(Self {
            rider_fee_rate,
            driver_fee_rate,
            settlement_fee_rate,
        })
    }

    pub fn rider_fee_rate(&self) -> Decimal {
        self.rider_fee_rate
    }

    pub fn driver_fee_rate(&self) -> Decimal {
        self.driver_fee_rate
    }

    pub fn settlement_fee_rate(&self) -> Decimal {
        self.settlement_fee_rate
    }

    pub fn rider_fee(&self, total: Decimal) -> Decimal {
        to_cents(total * self.rider_fee_rate)
    }

    pub fn driver_fee(&self, total: Decimal) -> Decimal {
        to_cents(total * self.driver_fee_rate)
    }

    pub fn settlement_fee(&self, gross: Decimal) -> Decimal {
        to_cents(gross * self.settlement_fee_rate)
    }

    /// Wallet balance a rider must hold before a booking of `total` is accepted.
    pub fn required_balance(&self, total: Decimal) -> Decimal {
        total + self.rider_fee(total)
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            rider_fee_rate: Self::DEFAULT_RIDER_FEE_RATE,
            driver_fee_rate: Self::DEFAULT_DRIVER_FEE_RATE,
            settlement_fee_rate: Self::DEFAULT_SETTLEMENT_FEE_RATE,
        }
    }
}

/// How a single booking payment is split between rider, driver and platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentBreakdown {
    pub total_amount: Decimal,
    pub rider_fee: Decimal,
    pub driver_fee: Decimal,
    /// Debited from the rider.
    pub rider_charge: Decimal,
    /// Credited to the driver.
    pub driver_receives: Decimal,
    /// Credited to the platform wallet.
    pub platform_fee: Decimal,
}

impl PaymentBreakdown {
    pub fn compute(total_amount: Decimal, schedule: &FeeSchedule) -> Self {
        let rider_fee = schedule.rider_fee(total_amount);
        let driver_fee = schedule.driver_fee(total_amount);
        Self {
            total_amount,
            rider_fee,
            driver_fee,
            rider_charge: total_amount + rider_fee,
            driver_receives: total_amount - driver_fee,
            platform_fee: rider_fee + driver_fee,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twenty_dollar_fare_breakdown() {
        let b = PaymentBreakdown::compute(dec!(20.00), &FeeSchedule::default());
        assert_eq!(b.rider_fee, dec!(0.50));
        assert_eq!(b.driver_fee, dec!(1.50));
        assert_eq!(b.rider_charge, dec!(20.50));
        assert_eq!(b.driver_receives, dec!(18.50));
        assert_eq!(b.platform_fee, dec!(2.00));
    }

    #[test]
    fn breakdown_conserves_money() {
        let b = PaymentBreakdown::compute(dec!(13.37), &FeeSchedule::default());
        assert_eq!(b.rider_charge, b.driver_receives + b.platform_fee);
    }

    #[test]
    fn fees_round_half_away_from_zero() {
        // 0.30 * 0.025 = 0.0075 -> 0.01
        assert_eq!(FeeSchedule::default().rider_fee(dec!(0.30)), dec!(0.01));
        // 0.10 * 0.075 = 0.0075 -> 0.01
        assert_eq!(FeeSchedule::default().driver_fee(dec!(0.10)), dec!(0.01));
    }

    #[test]
    fn required_balance_includes_rider_fee() {
        assert_eq!(
            FeeSchedule::default().required_balance(dec!(10.00)),
            dec!(10.25)
        );
    }

    #[test]
    fn rates_must_be_below_one() {
        assert!(FeeSchedule::new(dec!(0.025), dec!(0.075), dec!(0.999)).is_ok());
        assert_eq!(
            FeeSchedule::new(dec!(0.025), dec!(0.075), dec!(1)),
            Err(MarketplaceError::InvalidAmount)
        );
        assert_eq!(
            FeeSchedule::new(dec!(-0.01), dec!(0.075), dec!(0.075)),
            Err(MarketplaceError::InvalidAmount)
        );
        assert_eq!(
            FeeSchedule::new(dec!(0.025), dec!(1.5), dec!(0.075)),
            Err(MarketplaceError::InvalidAmount)
        );
    }

    #[test]
    fn sub_cent_amounts_are_detected() {
        assert!(is_whole_cents(dec!(10.00)));
        assert!(is_whole_cents(dec!(10.000)));
        assert!(is_whole_cents(dec!(7)));
        assert!(!is_whole_cents(dec!(10.005)));
    }

    #[test]
    fn settlement_fee_on_net_earnings() {
        assert_eq!(FeeSchedule::default().settlement_fee(dec!(18.50)), dec!(1.39));
    }
}
