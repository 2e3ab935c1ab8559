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

//! Handles responding to particular commands from SMTP clients.
//!
//! Handlers only update the [`Connection`] and queue reply lines; the engine writes them.

use ascii::AsciiStr;

use super::{
    super::{
        state::{Connection, State},
        CloseReason,
    },
    Command,
};
use crate::context::ServerContext;

/// How many unrecognized commands in a row are answered before the connection is dropped.
const MAX_UNRECOGNIZED: u32 = 3;

/// Reply to an unrecognized command from a client.
///
/// [RFC 5321 section 4.2.4](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.2.4).
pub fn unrecognized(connection: &mut Connection) {
    connection.errors += 1;

    if connection.errors > MAX_UNRECOGNIZED {
        connection.reply("500 Too many unrecognized commands");
        connection.kill(CloseReason::TooManyErrors);
    } else {
        connection.reply("500 Unrecognized command");
    }
}

/// Reply to the hello (`HELO`) command from a client.
///
/// [RFC 5321 section 4.1.1.1](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.1).
pub fn hello(connection: &mut Connection, command: &Command, context: &ServerContext) {
    connection.helo = argument(command);

    connection.reply(format!(
        "250 {} Hello {}",
        context.config().host_name,
        connection.helo
    ));
}

/// Reply to the extended hello (`EHLO`) command from a client, listing the extensions on offer.
///
/// [RFC 5321 section 4.1.1.1](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.1).
pub fn extended_hello(connection: &mut Connection, command: &Command, context: &ServerContext) {
    connection.helo = argument(command);

    connection.reply(format!(
        "250-{} Hello {}[{}]",
        context.config().host_name,
        connection.helo,
        connection.address
    ));
    connection.reply(format!("250-SIZE {}", context.config().max_size));
    connection.reply("250-PIPELINING");
    if context.offers_starttls() && !connection.tls_on {
        connection.reply("250-STARTTLS");
    }
    connection.reply("250 HELP");
}

/// [RFC 5321 section 4.1.1.8](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.8).
pub fn help(connection: &mut Connection) {
    connection.reply("214 OK");
}

/// [RFC 5321 section 4.1.1.2](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.2).
pub fn mail_from(connection: &mut Connection, command: &Command) {
    connection.mail_from = argument(command);

    connection.reply("250 OK");
}

/// Reply to `XCLIENT ADDR=<address>` from a trusted proxy, recording the address it asserts as
/// the client's.
///
/// Only the first token after `ADDR=` is used; other attributes are ignored.
pub fn xclient(connection: &mut Connection, command: &Command) {
    let address = command
        .argument()
        .map(AsciiStr::as_str)
        .and_then(|argument| {
            if !argument.get(..5)?.eq_ignore_ascii_case("ADDR=") {
                return None;
            }

            argument[5..].split_whitespace().next()
        });

    match address {
        Some(address) => {
            tracing::debug!(%address, previous = %connection.address, "Client address overridden");
            connection.address = address.to_string();
            connection.reply("250 OK");
        }
        None => connection.reply("501 Syntax: XCLIENT ADDR=<address>"),
    }
}

/// [RFC 5321 section 4.1.1.3](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.3).
///
/// Only one recipient is kept; a later `RCPT TO:` replaces an earlier one.
pub fn rcpt_to(connection: &mut Connection, command: &Command) {
    connection.rcpt_to = argument(command);

    connection.reply("250 Accepted");
}

/// [RFC 5321 section 4.1.1.9](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.9).
pub fn noop(connection: &mut Connection) {
    connection.reply("250 OK");
}

/// [RFC 5321 section 4.1.1.5](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.5).
pub fn reset(connection: &mut Connection) {
    connection.reset();

    connection.reply("250 OK");
}

/// [RFC 5321 section 4.1.1.4](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.4).
pub fn data(connection: &mut Connection) {
    connection.reply("354 Enter message, ending with \".\" on a line by itself");
    connection.state = State::Data;
}

/// [RFC 3207 section 4](https://www.rfc-editor.org/rfc/rfc3207.html#section-4).
pub fn start_tls(connection: &mut Connection) {
    connection.reply("220 Ready to start TLS");
    connection.state = State::StartTls;
}

/// Reply to the quit (`QUIT`) command from a client.
///
/// [RFC 5321 section 4.1.1.10](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.10).
pub fn quit(connection: &mut Connection) {
    connection.reply("221 Bye");
    connection.kill(CloseReason::Quit);
}

/// The command's argument as an owned string, empty if there is none.
fn argument(command: &Command) -> String {
    command
        .argument()
        .map(ToString::to_string)
        .unwrap_or_default()
}
