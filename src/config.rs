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

//! Engine configuration.
//!
//! Binaries populate this from flags and environment variables with `clap`;
//! tests use [`EngineConfig::default`] and override single fields.

use crate::fees::FeeSchedule;
use sha2::{Digest, Sha256};

/// Tunables and secrets for an [`crate::Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub fees: FeeSchedule,
    /// Compare-and-swap attempts on a seat counter before giving up with `Conflict`.
    pub max_cas_retries: u32,
    /// Key mixed into every QR token digest.
    pub token_secret: String,
    /// SHA-256 hex digest of the admin PIN required to approve settlements.
    pub admin_pin_digest: Option<String>,
    /// Shared secret expected from the settlement scheduler, if any.
    pub cron_secret: Option<String>,
}

impl EngineConfig {
    pub const DEFAULT_MAX_CAS_RETRIES: u32 = 16;

    pub fn with_admin_pin(mut self, pin: &str) -> Self {
        self.admin_pin_digest = Some(pin_digest(pin));
        self
    }

    pub fn with_cron_secret(mut self, secret: impl Into<String>) -> Self {
        self.cron_secret = Some(secret.into());
        self
    }

    pub fn with_token_secret(mut self, secret: impl Into<String>) -> Self {
        self.token_secret = secret.into();
        self
    }

    pub fn with_fees(mut self, fees: FeeSchedule) -> Self {
        self.fees = fees;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fees: FeeSchedule::default(),
            max_cas_retries: Self::DEFAULT_MAX_CAS_RETRIES,
            token_secret: String::from("ridepool-dev-token-secret"),
            admin_pin_digest: None,
            cron_secret: None,
        }
    }
}

/// Hex SHA-256 digest of an admin PIN.
pub fn pin_digest(pin: &str) -> String {
    hex::encode(Sha256::digest(pin.as_bytes()))
}
