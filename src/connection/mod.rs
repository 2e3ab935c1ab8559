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

//! Handles TCP connections as SMTP sessions.
//!
//! See [`handle`].
//!
//! ```text
//! Greeting ──▶ Command ◀──▶ Data
//!                 ▲ │
//!                 │ ▼
//!               StartTls
//! ```
//!
//! Any state can ask for the session to end ([`state::Connection::kill`]). That is checked once
//! per pass, after the pending reply is written.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

use self::{
    state::{Connection, State},
    transport::Transport,
};
use crate::{
    config::TlsFailurePolicy,
    context::ServerContext,
    error::{FramingError, TlsError},
    framer::Framer,
    str::{max_lengths, CRLF},
    tls,
};

mod command;
mod data;
pub mod state;
pub mod transport;

/// Ceiling on engine passes for one connection, however it behaves.
pub const MAX_ITERATIONS: usize = 1_000;

/// Handle a stream as an SMTP session, until it ends.
///
/// Never fails: every error is answered on the stream or ends the session, and the reason it
/// ended is returned.
pub async fn handle<S>(stream: S, peer: SocketAddr, context: Arc<ServerContext>) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = context.next_connection_id();
    let span = tracing::info_span!("connection", connection_id = %id, peer_addr = %peer);

    async move {
        tracing::info!("Connection opened");

        let mut connection = Connection::new(id, peer.to_string());
        let close_reason = run(&mut connection, stream, &context).await;

        tracing::info!(?close_reason, "Connection closed");
        close_reason
    }
    .instrument(span)
    .await
}

/// The engine loop.
async fn run<S>(connection: &mut Connection, stream: S, context: &ServerContext) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let timeout = context.config().timeout();
    let mut framer = Framer::with_timeout(Transport::Plain(stream), timeout);

    if context.config().tls_always_on {
        let Some(acceptor) = context.tls() else {
            tracing::error!("Implicit TLS is enabled without a certificate");
            return CloseReason::TlsFailed;
        };

        match upgrade(framer, acceptor, timeout).await {
            Ok(upgraded) => framer = upgraded,
            Err((err, _)) => {
                tracing::warn!(%err, "Implicit TLS handshake failed");
                return CloseReason::TlsFailed;
            }
        }

        connection.tls_on = true;
    }

    for _ in 0..MAX_ITERATIONS {
        match connection.state {
            State::Greeting => {
                connection.reply(greeting(connection, context));
                connection.state = State::Command;
            }
            State::Command => {
                framer.set_limit(max_lengths::COMMAND_LINE);

                match framer.read_until(CRLF.as_bytes()).await {
                    Ok(line) => command::handle(connection, &line, context),
                    Err(FramingError::LimitExceeded { limit }) => {
                        tracing::warn!(limit, "Command line too long");
                        connection.reply("500 Line too long");
                        connection.kill(CloseReason::LineTooLong);
                    }
                    Err(err) => return CloseReason::from(err),
                }
            }
            State::Data => {
                if let Some(reason) = data::receive(connection, &mut framer, context).await {
                    return reason;
                }
            }
            State::StartTls => {
                let Some(acceptor) = context.tls() else {
                    return CloseReason::TlsFailed;
                };

                match upgrade(framer, acceptor, timeout).await {
                    Ok(upgraded) => {
                        framer = upgraded;
                        connection.tls_on = true;
                        // A new session starts, as if the client had just connected.
                        connection.reset();
                        connection.helo.clear();
                        connection.state = State::Command;
                        tracing::debug!("Connection upgraded to TLS");
                    }
                    Err((err, stream)) => {
                        tracing::warn!(%err, policy = ?context.config().tls_failure, "TLS handshake failed");

                        let Some(stream) = stream else {
                            return CloseReason::TlsFailed;
                        };
                        framer = stream;

                        match context.config().tls_failure {
                            TlsFailurePolicy::Close => return CloseReason::TlsFailed,
                            TlsFailurePolicy::Retry => (),
                            TlsFailurePolicy::Reject => {
                                connection.reply("454 TLS not available due to temporary reason");
                                connection.state = State::Command;
                            }
                        }
                    }
                }
            }
        }

        if let Some(response) = connection.take_response() {
            if let Err(reason) = write_response(framer.get_mut(), &response, timeout).await {
                return reason;
            }
        }

        if let Some(reason) = connection.close_reason() {
            // The reply is already out, so a failed shutdown changes nothing.
            if let Ok(Err(err)) = tokio::time::timeout(timeout, framer.get_mut().shutdown()).await {
                tracing::debug!(%err, "Shutdown after final reply failed");
            }
            return reason;
        }
    }

    tracing::warn!(iterations = MAX_ITERATIONS, "Iteration limit reached");
    CloseReason::IterationLimit
}

/// The `220` banner.
fn greeting(connection: &Connection, context: &ServerContext) -> String {
    format!(
        "220 {} ESMTP smtp_intake #{} ({}) {}",
        context.config().host_name,
        connection.id,
        context.admission().active(),
        chrono::Local::now().to_rfc2822()
    )
}

/// Write `response` in full within `timeout`.
async fn write_response<W>(stream: &mut W, response: &str, timeout: Duration) -> Result<(), CloseReason>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await
    };

    match tokio::time::timeout(timeout, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(CloseReason::from_io(&err)),
        Err(_elapsed) => Err(CloseReason::TimedOut),
    }
}

type Upgrade<S> = Result<Framer<Transport<S>>, (TlsError, Option<Framer<Transport<S>>>)>;

/// Replace a plaintext framer with one reading through TLS.
///
/// Anything the client pipelined after `STARTTLS` is dropped: it was sent in the clear and must
/// not be read as if it had been encrypted. On failure the plaintext framer is returned if the
/// stream survived.
async fn upgrade<S>(framer: Framer<Transport<S>>, acceptor: &TlsAcceptor, timeout: Duration) -> Upgrade<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (transport, leftover) = framer.into_inner();

    if !leftover.is_empty() {
        tracing::debug!(bytes = leftover.len(), "Discarding plaintext pipelined before handshake");
    }

    let stream = match transport {
        Transport::Plain(stream) => stream,
        encrypted @ Transport::Tls(_) => {
            return Err((
                TlsError::AlreadyEncrypted,
                Some(Framer::with_timeout(encrypted, timeout)),
            ))
        }
    };

    match tls::upgrade(stream, acceptor, timeout).await {
        Ok(stream) => Ok(Framer::with_timeout(
            Transport::Tls(Box::new(stream)),
            timeout,
        )),
        Err((err, stream)) => Err((
            err,
            stream.map(|stream| Framer::with_timeout(Transport::Plain(stream), timeout)),
        )),
    }
}

/// Indicates why a connection was closed.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum CloseReason {
    /// The SMTP client requested to quit the session.
    Quit,
    /// A command line exceeded the line ceiling.
    LineTooLong,
    /// The message exceeded the hard size ceiling.
    DataLimitExceeded,
    /// Too many unrecognized commands in a row.
    TooManyErrors,
    /// The TCP connection was ended by the client.
    ClosedByClient,
    /// No read or write completed within the network deadline.
    TimedOut,
    /// A TLS handshake failed and the connection could not continue.
    TlsFailed,
    /// The engine ran [`MAX_ITERATIONS`] passes.
    IterationLimit,
    /// An I/O error occurred.
    Error(std::io::ErrorKind),
}

impl CloseReason {
    /// Whether `err` means the peer went away rather than something failing locally.
    pub fn is_disconnect(err: &std::io::Error) -> bool {
        use std::io::ErrorKind;

        matches!(
            err.kind(),
            ErrorKind::ConnectionAborted
                | ErrorKind::ConnectionReset
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof
        )
    }

    fn from_io(err: &std::io::Error) -> Self {
        if Self::is_disconnect(err) {
            Self::ClosedByClient
        } else {
            Self::Error(err.kind())
        }
    }
}

impl From<FramingError> for CloseReason {
    fn from(err: FramingError) -> Self {
        match err {
            FramingError::LimitExceeded { .. } => Self::LineTooLong,
            FramingError::EndOfStream => Self::ClosedByClient,
            FramingError::TimedOut => Self::TimedOut,
            FramingError::Io(err) => Self::from_io(&err),
        }
    }
}
