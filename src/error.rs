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

//! Error types for the server.
//!
//! Errors that a client can cause are handled inside the connection that caused them. Only
//! [`ServerError`] escapes to the caller of [`crate::serve`].

use std::path::PathBuf;

use thiserror::Error;

/// Why [`crate::framer::Framer::read_until`] stopped before finding its suffix.
#[derive(Error, Debug)]
pub enum FramingError {
    /// The byte ceiling was reached before the suffix.
    ///
    /// Distinct from [`Self::EndOfStream`]: the peer is still connected, it just sent more than
    /// the server is willing to buffer.
    #[error("line too long (limit of {limit} bytes exceeded)")]
    LimitExceeded { limit: usize },

    /// The peer closed its half of the stream.
    #[error("end of stream")]
    EndOfStream,

    /// No bytes arrived within the per-read deadline.
    #[error("read timed out")]
    TimedOut,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The envelope could not be turned into `user@host` pairs.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("invalid address [{user}@{host}] address: {address}")]
    InvalidAddress {
        user: String,
        host: String,
        address: String,
    },
}

/// Failures while building a TLS acceptor or upgrading a connection.
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("could not read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("invalid PEM data: {0}")]
    Pem(std::io::Error),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("client certificate verifier rejected: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("handshake failed: {0}")]
    Handshake(std::io::Error),

    #[error("handshake timed out")]
    HandshakeTimedOut,

    #[error("transport is already encrypted")]
    AlreadyEncrypted,
}

/// A single semantic problem with an otherwise well-formed configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },

    #[error("`listen_interface` is not a socket address: {0}")]
    ListenInterface(String),

    #[error("`host_name` must not be empty")]
    EmptyHostName,

    #[error("TLS is enabled but `{0}` is not set")]
    MissingKeyFile(&'static str),
}

/// Failure loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure reported by a persistence [`crate::persistence::Backend`].
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend {0:?} not found")]
    UnknownBackend(String),

    #[error("storage failed: {0}")]
    Storage(String),
}

/// Errors that prevent the server from starting.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
}
