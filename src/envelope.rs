// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright © 2024 RemasteredArch
//
// This file is part of smtp_intake.
//
// smtp_intake is free software: you can redistribute it and/or modify it under the terms of the
// GNU Affero General Public License as published by the Free Software Foundation, either version
// 3 of the License, or (at your option) any later version.
//
// smtp_intake is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See
// the GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License along with
// smtp_intake. If not, see <https://www.gnu.org/licenses/>.

//! The sender/recipient pair of a message and everything a persistence worker needs to store it.
//!
//! Address handling here is intentionally shallow: the `MAIL FROM:` and `RCPT TO:` arguments only
//! need to yield a non-empty local part and a non-empty host. Full RFC 5321 path syntax is not
//! checked.

use std::fmt::Display;

use sha2::{Digest, Sha256};

use crate::{context::ConnectionId, error::EnvelopeError};

/// A `user@host` pair extracted from a path argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub user: String,
    pub host: String,
}

impl Address {
    /// Extract an address from a `MAIL FROM:`/`RCPT TO:` argument.
    ///
    /// The first `<user@host>` wins; without angle brackets, the argument is split on `@` and the
    /// first two parts are used.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::InvalidAddress`] if either part would be empty.
    pub fn extract(argument: &str) -> Result<Self, EnvelopeError> {
        let argument = argument.trim();

        // Once there are angle brackets, only their contents count.
        let (user, host) = if argument.contains('<') {
            bracketed(argument).unwrap_or_default()
        } else {
            let mut parts = argument.split('@');
            match (parts.next(), parts.next()) {
                (Some(user), Some(host)) => (user, host),
                _ => ("", ""),
            }
        };

        let (user, host) = (user.trim(), host.trim());

        if user.is_empty() || host.is_empty() {
            return Err(EnvelopeError::InvalidAddress {
                user: user.to_string(),
                host: host.to_string(),
                address: argument.to_string(),
            });
        }

        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
        })
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// The `user` and `host` of the first `<user@host>` in `argument`.
fn bracketed(argument: &str) -> Option<(&str, &str)> {
    let start = argument.find('<')? + 1;
    let rest = &argument[start..];
    let inner = &rest[..rest.find('>')?];

    let (user, host) = inner.split_once('@')?;

    (!user.is_empty() && !host.is_empty()).then_some((user, host))
}

/// Check that both envelope paths yield an [`Address`].
///
/// # Errors
///
/// The first [`EnvelopeError`], sender first.
pub fn validate(mail_from: &str, rcpt_to: &str) -> Result<(Address, Address), EnvelopeError> {
    Ok((Address::extract(mail_from)?, Address::extract(rcpt_to)?))
}

/// One fully received message, moved to a persistence worker by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub connection_id: ConnectionId,
    pub mail_from: Address,
    pub rcpt_to: Address,
    /// The unfolded `Subject:` header value, empty if there was none.
    pub subject: String,
    /// The mail data with the final `".\r\n"` line removed.
    pub body: Vec<u8>,
    /// The queue id reported to the client.
    pub hash: String,
    pub remote_addr: String,
    pub helo: String,
    pub tls_on: bool,
}

/// Derive the queue id reported in `250 OK : queued as <hash>`.
///
/// Mixing in a nanosecond timestamp keeps ids distinct for identical resends.
#[must_use]
pub fn queue_id(rcpt_to: &Address, mail_from: &Address, subject: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();

    for part in [
        rcpt_to.to_string().as_bytes(),
        mail_from.to_string().as_bytes(),
        subject.as_bytes(),
        timestamp.to_string().as_bytes(),
    ] {
        hasher.update(part);
    }

    hex::encode(&hasher.finalize()[..16])
}
