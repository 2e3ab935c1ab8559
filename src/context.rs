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

//! State shared by every connection of one server.
//!
//! There is no global state: [`ServerContext`] is built once at startup, wrapped in an
//! [`Arc`](std::sync::Arc), and handed to each connection task.

use std::{
    fmt::Display,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio_rustls::TlsAcceptor;

use crate::{
    admission::Admission, config::ServerConfig, error::TlsError, persistence::PersistenceGateway,
    tls,
};

/// Identifies one connection in logs, the greeting banner and saved envelopes.
///
/// Unique per [`ServerContext`], increasing in accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a connection needs besides its own stream.
pub struct ServerContext {
    config: ServerConfig,
    tls: Option<TlsAcceptor>,
    gateway: PersistenceGateway,
    admission: Admission,
    next_id: AtomicU64,
}

impl ServerContext {
    pub const fn new(
        config: ServerConfig,
        tls: Option<TlsAcceptor>,
        gateway: PersistenceGateway,
        admission: Admission,
    ) -> Self {
        Self {
            config,
            tls,
            gateway,
            admission,
            next_id: AtomicU64::new(1),
        }
    }

    /// Build a context from configuration, loading the certificate and key if any TLS mode is
    /// enabled and sizing the [`Admission`] pool from `max_clients`.
    ///
    /// # Errors
    ///
    /// A [`TlsError`] if TLS is enabled and the acceptor cannot be built.
    pub fn from_config(
        config: ServerConfig,
        gateway: PersistenceGateway,
    ) -> Result<Self, TlsError> {
        let tls = match (&config.public_key_file, &config.private_key_file) {
            (Some(certificate), Some(key)) if config.tls_enabled() => Some(
                tls::acceptor_from_files(certificate, key, config.client_ca_file.as_deref())?,
            ),
            _ => None,
        };

        let admission = Admission::new(config.max_clients);

        Ok(Self::new(config, tls, gateway, admission))
    }

    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The acceptor for `STARTTLS` and implicit TLS, if a certificate is loaded.
    pub const fn tls(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    pub const fn gateway(&self) -> &PersistenceGateway {
        &self.gateway
    }

    pub const fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Whether `STARTTLS` should be advertised and accepted on a plaintext connection.
    pub const fn offers_starttls(&self) -> bool {
        self.config.start_tls_on && self.tls.is_some()
    }

    /// Hand out the next [`ConnectionId`].
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("config", &self.config)
            .field("tls", &self.tls.is_some())
            .field("gateway", &self.gateway)
            .field("admission", &self.admission)
            .field("next_id", &self.next_id)
            .finish()
    }
}
