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

//! Storage backends run by persistence workers.

use std::sync::Arc;

use crate::{envelope::Envelope, error::BackendError};

/// Stores one message.
///
/// Called from a worker thread, never from the async runtime, so implementations may block.
pub trait Backend: Send + Sync {
    /// The name this backend is selected by in configuration.
    fn name(&self) -> &'static str;

    /// Store `envelope`.
    ///
    /// # Errors
    ///
    /// A [`BackendError`] if the message was not stored. The client is told the transaction failed.
    fn save(&self, envelope: &Envelope) -> Result<(), BackendError>;
}

/// Accepts every message and keeps none of them.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend;

impl Backend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn save(&self, envelope: &Envelope) -> Result<(), BackendError> {
        tracing::debug!(hash = %envelope.hash, "Discarding message");
        Ok(())
    }
}

/// Accepts every message and logs a summary of it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugBackend;

impl Backend for DebugBackend {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn save(&self, envelope: &Envelope) -> Result<(), BackendError> {
        tracing::info!(
            connection_id = %envelope.connection_id,
            hash = %envelope.hash,
            mail_from = %envelope.mail_from,
            rcpt_to = %envelope.rcpt_to,
            subject = %envelope.subject,
            helo = %envelope.helo,
            remote_addr = %envelope.remote_addr,
            tls = envelope.tls_on,
            bytes = envelope.body.len(),
            "Received message"
        );

        Ok(())
    }
}

/// Look up a backend by its configured name.
///
/// # Errors
///
/// [`BackendError::UnknownBackend`] if no backend has that name.
pub fn by_name(name: &str) -> Result<Arc<dyn Backend>, BackendError> {
    match name {
        "null" => Ok(Arc::new(NullBackend)),
        "debug" => Ok(Arc::new(DebugBackend)),
        other => Err(BackendError::UnknownBackend(other.to_string())),
    }
}
