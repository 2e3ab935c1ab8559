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

//! The per-connection record the engine and command handlers share.

use super::CloseReason;
use crate::{context::ConnectionId, str::CRLF};

/// Where a connection is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The banner has not been sent yet.
    Greeting,
    /// Waiting for a command line.
    Command,
    /// Reading mail data after `354`.
    Data,
    /// `STARTTLS` was accepted, the handshake is next.
    StartTls,
}

/// Everything known about one SMTP session.
///
/// Owned by the task running the session; only it reads or writes this.
#[derive(Debug)]
pub struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) state: State,
    /// The peer address, or the one a proxy asserted with `XCLIENT`.
    pub(crate) address: String,
    /// The identity from the last `HELO`/`EHLO`.
    pub(crate) helo: String,
    /// The raw `MAIL FROM:` argument.
    pub(crate) mail_from: String,
    /// The raw `RCPT TO:` argument. The last one wins.
    pub(crate) rcpt_to: String,
    /// The `Subject:` of the last message received.
    pub(crate) subject: String,
    pub(crate) tls_on: bool,
    /// Unrecognized commands since the last recognized one.
    pub(crate) errors: u32,
    /// Reply lines not yet written, each ending in `CRLF`.
    response: String,
    kill: Option<CloseReason>,
}

impl Connection {
    pub const fn new(id: ConnectionId, address: String) -> Self {
        Self {
            id,
            state: State::Greeting,
            address,
            helo: String::new(),
            mail_from: String::new(),
            rcpt_to: String::new(),
            subject: String::new(),
            tls_on: false,
            errors: 0,
            response: String::new(),
            kill: None,
        }
    }

    /// Queue one reply line. The line ending is added here.
    pub fn reply(&mut self, line: impl AsRef<str>) {
        self.response.push_str(line.as_ref());
        self.response.push_str(CRLF);
    }

    /// Take every queued reply line, if there are any.
    pub fn take_response(&mut self) -> Option<String> {
        if self.response.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.response))
        }
    }

    /// Ask for the session to end once the pending reply is written.
    ///
    /// The first reason sticks; a killed connection cannot be revived.
    pub fn kill(&mut self, reason: CloseReason) {
        self.kill.get_or_insert(reason);
    }

    pub const fn close_reason(&self) -> Option<CloseReason> {
        self.kill
    }

    /// Forget the sender and recipient.
    pub fn reset(&mut self) {
        self.mail_from.clear();
        self.rcpt_to.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn connection() -> Connection {
        Connection::new(ConnectionId::new(1), "127.0.0.1:4000".to_string())
    }

    #[test]
    fn test_response_buffer() {
        let mut connection = connection();
        assert_eq!(connection.take_response(), None);

        connection.reply("250-first");
        connection.reply(String::from("250 second"));
        assert_eq!(
            connection.take_response().as_deref(),
            Some("250-first\r\n250 second\r\n")
        );
        assert_eq!(connection.take_response(), None);
    }

    #[test]
    fn test_kill_is_monotonic() {
        let mut connection = connection();
        assert_eq!(connection.close_reason(), None);

        connection.kill(CloseReason::TooManyErrors);
        connection.kill(CloseReason::Quit);

        assert_eq!(connection.close_reason(), Some(CloseReason::TooManyErrors));
    }

    #[test]
    fn test_reset_keeps_session_identity() {
        let mut connection = connection();
        connection.helo = "client.example".to_string();
        connection.mail_from = "<a@b.com>".to_string();
        connection.rcpt_to = "<c@d.com>".to_string();
        connection.tls_on = true;

        connection.reset();

        assert!(connection.mail_from.is_empty() && connection.rcpt_to.is_empty());
        assert_eq!(connection.helo, "client.example");
        assert!(connection.tls_on);
    }
}
