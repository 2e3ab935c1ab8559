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

//! An SMTP intake server.
//!
//! Accepts TCP connections, runs each as an SMTP session (optionally upgraded to TLS), and hands
//! every received message to a pool of persistence workers, replying to the client only once the
//! message is stored or the wait for it timed out.
//!
//! ```text
//! Listener ──Slot──▶ connection::handle ──Envelope──▶ PersistenceGateway ──▶ WorkerPool
//!  (admission)        (Framer, TLS upgrade)             (bounded queue + ack)    (Backend)
//! ```
//!
//! See [`serve`].

#![warn(clippy::nursery, clippy::pedantic)]
#![cfg_attr(debug_assertions, allow(clippy::missing_errors_doc))]

use std::{io, sync::Arc};

use futures_core::Stream;
use futures_util::{pin_mut, StreamExt};
use tokio::task::JoinHandle;

pub use self::{
    admission::{Admission, Listener},
    config::{Config, ServerConfig},
    connection::CloseReason,
    context::ServerContext,
    persistence::{PersistenceGateway, WorkerPool},
};

pub mod admission;
pub mod config;
pub mod connection;
pub mod context;
pub mod envelope;
pub mod error;
pub mod framer;
pub mod persistence;
pub mod str;
#[cfg(test)]
mod test;
pub mod timeouts;
pub mod tls;

/// Accept connections from `listener` and run each as an SMTP session on its own task.
///
/// Yields one [`JoinHandle`] per accepted connection, or the error from a failed accept. Ends once
/// the listener's [`Admission`] pool is closed.
pub fn listen(
    listener: Listener,
    context: Arc<ServerContext>,
) -> impl Stream<Item = io::Result<JoinHandle<CloseReason>>> {
    async_stream::stream! {
        loop {
            match listener.accept().await {
                Ok(Some((stream, peer, slot))) => {
                    let context = Arc::clone(&context);

                    yield Ok(tokio::spawn(async move {
                        let close_reason = connection::handle(stream, peer, context).await;
                        // Held until the session is over, then returned to the pool.
                        drop(slot);
                        close_reason
                    }));
                }
                Ok(None) => break,
                Err(err) => yield Err(err),
            }
        }
    }
}

/// Run the accept loop until the listener's [`Admission`] pool is closed.
///
/// Failed accepts are logged and do not stop the loop. Sessions still running when this returns
/// are left to finish on their own.
pub async fn serve(listener: Listener, context: Arc<ServerContext>) {
    let sessions = listen(listener, context);
    pin_mut!(sessions);

    while let Some(session) = sessions.next().await {
        if let Err(err) = session {
            tracing::warn!(%err, "Failed to accept connection");
        }
    }

    tracing::info!("Stopped accepting connections");
}
