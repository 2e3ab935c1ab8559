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

//! Semantic checks that serde cannot express.
//!
//! Returns all validation errors, not just the first, so one edit fixes a broken file.

use std::net::SocketAddr;

use super::Config;
use crate::error::ValidationError;

/// Check value ranges and cross-field requirements of an already-deserialized [`Config`].
///
/// # Errors
///
/// Every [`ValidationError`] found, in field order.
pub fn validate_config(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let server = &config.server;

    if config.save_workers_size == 0 {
        errors.push(ValidationError::Zero {
            field: "save_workers_size",
        });
    }

    if server.host_name.trim().is_empty() {
        errors.push(ValidationError::EmptyHostName);
    }

    for (field, value) in [
        ("max_size", server.max_size),
        ("max_clients", server.max_clients),
    ] {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    if server.timeout == 0 {
        errors.push(ValidationError::Zero { field: "timeout" });
    }

    if server.listen_interface.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::ListenInterface(
            server.listen_interface.clone(),
        ));
    }

    if server.tls_enabled() {
        if server.private_key_file.is_none() {
            errors.push(ValidationError::MissingKeyFile("private_key_file"));
        }
        if server.public_key_file.is_none() {
            errors.push(ValidationError::MissingKeyFile("public_key_file"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
