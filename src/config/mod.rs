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

//! Server configuration.
//!
//! ```text
//! config file (TOML)
//!     → load_config (read & deserialize)
//!     → validation.rs (semantic checks)
//!     → Config (immutable, consumed once at startup)
//! ```
//!
//! Every field has a default, so an empty file is a valid (plaintext, loopback-only) setup.

use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

pub use self::validation::validate_config;
use crate::{error::ConfigError, timeouts};

mod validation;

/// Root configuration: the server plus the persistence side it hands messages to.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Name of the persistence backend, see [`crate::persistence::backend::by_name`].
    pub backend_name: String,

    /// Number of persistence worker threads, which is also the job queue's capacity.
    pub save_workers_size: usize,

    /// Log at debug level.
    pub verbose: bool,

    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_name: "null".to_string(),
            save_workers_size: 4,
            verbose: false,
            server: ServerConfig::default(),
        }
    }
}

/// Settings for the SMTP listener and its connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Whether this server should run at all.
    pub is_enabled: bool,

    /// Identity used in the greeting banner and `HELO`/`EHLO` replies.
    pub host_name: String,

    /// Maximum message size in bytes, advertised with `SIZE`.
    pub max_size: usize,

    /// PEM private key for TLS.
    pub private_key_file: Option<PathBuf>,

    /// PEM certificate chain for TLS.
    pub public_key_file: Option<PathBuf>,

    /// PEM bundle of CAs trusted to sign client certificates. Client certificates are always
    /// optional; when this is set, presented ones must verify against it.
    pub client_ca_file: Option<PathBuf>,

    /// Per-read and per-write network deadline, in seconds.
    pub timeout: u64,

    /// Address to listen on (e.g., `"0.0.0.0:25"`).
    pub listen_interface: String,

    /// Offer `STARTTLS`.
    pub start_tls_on: bool,

    /// Perform the TLS handshake immediately after accepting, before the greeting.
    pub tls_always_on: bool,

    /// What to do when a `STARTTLS` handshake fails.
    pub tls_failure: TlsFailurePolicy,

    /// Maximum simultaneous connections.
    pub max_clients: usize,

    /// Where the daemon writes its log. Standard error when unset.
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            is_enabled: true,
            host_name: "localhost".to_string(),
            max_size: 10 * 1024 * 1024,
            private_key_file: None,
            public_key_file: None,
            client_ca_file: None,
            timeout: timeouts::SERVER_TIMEOUT.as_secs(),
            listen_interface: "127.0.0.1:2525".to_string(),
            start_tls_on: false,
            tls_always_on: false,
            tls_failure: TlsFailurePolicy::default(),
            max_clients: 500,
            log_file: None,
        }
    }
}

impl ServerConfig {
    /// The per-operation network deadline.
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Whether any TLS mode is enabled, and so a certificate must be loaded.
    pub const fn tls_enabled(&self) -> bool {
        self.start_tls_on || self.tls_always_on
    }
}

/// Reaction to a failed `STARTTLS` handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsFailurePolicy {
    /// Close the connection. The byte stream is in an unknown state after a failed handshake.
    #[default]
    Close,
    /// Stay in the upgrade state and attempt the handshake again, without replying.
    Retry,
    /// Reply `454` and return to reading plaintext commands.
    Reject,
}

/// Parse and validate a configuration from TOML text.
///
/// # Errors
///
/// [`ConfigError::Parse`] for malformed TOML, [`ConfigError::Validation`] with every semantic
/// problem found.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Load and validate configuration from a TOML file.
///
/// # Errors
///
/// [`ConfigError::Io`] if the file cannot be read, otherwise see [`parse_config`].
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)?;

    parse_config(&content)
}
