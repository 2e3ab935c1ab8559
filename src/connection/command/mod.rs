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

//! Handles responding to a command from an SMTP client.
//!
//! See [`handle`].

use std::{
    fmt::{Debug, Display},
    ops::Range,
};

use ascii::{AsciiStr, AsciiString, IntoAsciiString};

use super::state::Connection;
use crate::context::ServerContext;

mod commands;

/// Queue the reply to one command line from the client.
///
/// `line` is the raw line including its `CRLF`.
pub fn handle(connection: &mut Connection, line: &[u8], context: &ServerContext) {
    let command = match parse(line) {
        Ok(command) => command,
        Err(err) => {
            tracing::debug!(%err, "Rejected command line");
            return commands::unrecognized(connection);
        }
    };

    tracing::debug!(verb = %command.verb(), "Command");

    match command.verb() {
        Verb::Helo => commands::hello(connection, &command, context),
        Verb::Ehlo => commands::extended_hello(connection, &command, context),
        Verb::Help => commands::help(connection),
        Verb::MailFrom => commands::mail_from(connection, &command),
        Verb::Xclient => commands::xclient(connection, &command),
        Verb::RcptTo => commands::rcpt_to(connection, &command),
        Verb::Noop => commands::noop(connection),
        Verb::Rset => commands::reset(connection),
        Verb::Data => commands::data(connection),
        Verb::StartTls if context.offers_starttls() && !connection.tls_on => {
            commands::start_tls(connection);
        }
        // Not on offer, so it is no more recognized than gibberish.
        Verb::StartTls => return commands::unrecognized(connection),
        Verb::Quit => commands::quit(connection),
    }

    connection.errors = 0;
}

/// The commands this server understands.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Verb {
    Helo,
    Ehlo,
    Help,
    MailFrom,
    Xclient,
    RcptTo,
    Noop,
    Rset,
    Data,
    StartTls,
    Quit,
}

impl Verb {
    /// Every verb, in the order lines are matched against them.
    pub const ALL: [Self; 11] = [
        Self::Helo,
        Self::Ehlo,
        Self::Help,
        Self::MailFrom,
        Self::Xclient,
        Self::RcptTo,
        Self::Noop,
        Self::Rset,
        Self::Data,
        Self::StartTls,
        Self::Quit,
    ];

    /// The text a line must start with (ignoring case) to be this command.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Helo => "HELO",
            Self::Ehlo => "EHLO",
            Self::Help => "HELP",
            Self::MailFrom => "MAIL FROM:",
            Self::Xclient => "XCLIENT",
            Self::RcptTo => "RCPT TO:",
            Self::Noop => "NOOP",
            Self::Rset => "RSET",
            Self::Data => "DATA",
            Self::StartTls => "STARTTLS",
            Self::Quit => "QUIT",
        }
    }

    /// Where the argument starts in the trimmed line, for commands that take one.
    const fn argument_offset(self) -> Option<usize> {
        match self {
            Self::Helo | Self::Ehlo => Some(5),
            Self::MailFrom => Some(10),
            Self::RcptTo | Self::Xclient => Some(8),
            _ => None,
        }
    }

    /// Find the verb `line` starts with.
    fn classify(line: &AsciiStr) -> Option<Self> {
        Self::ALL.into_iter().find(|verb| {
            line.as_str()
                .get(..verb.prefix().len())
                .is_some_and(|head| head.eq_ignore_ascii_case(verb.prefix()))
        })
    }
}

impl Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Parse a line as a command.
fn parse(line: &[u8]) -> Result<Command, CommandError> {
    /// Trim the line of leading and trailing whitespace, including the line ending.
    ///
    /// Returns `None` if the string is empty or only whitespace.
    fn trim(str: &AsciiStr) -> Option<Range<usize>> {
        // The index of the first byte that isn't whitespace.
        let leading_whitespace_len = str
            .as_str()
            .find(|c: char| !c.is_ascii_whitespace())
            .unwrap_or(str.len());
        // The index after the last byte that isn't whitespace.
        let trailing_whitespace_len = str.trim_end().len();

        let range = leading_whitespace_len..trailing_whitespace_len;

        if range.is_empty() {
            None
        } else {
            Some(range)
        }
    }

    if line.is_empty() {
        return Err(CommandError::Empty);
    }

    // RFC 5321 uses US-ASCII, specifically ANSI X3.4-1968 (reference 6).
    //
    // https://www.rfc-editor.org/rfc/rfc5321.html#ref-6
    let line = line
        .to_vec()
        .into_ascii_string()
        .map_err(|_| CommandError::NonAscii)?;

    let trimmed = trim(&line).ok_or(CommandError::OnlyWhitespace)?;
    let trimmed_str = &line[trimmed.clone()];

    let verb = Verb::classify(trimmed_str).ok_or(CommandError::Unrecognized)?;

    // The argument range is found on the trimmed string, then shifted to point into the line.
    let argument = verb.argument_offset().and_then(|offset| {
        let rest = trimmed_str.as_str().get(offset..)?;
        let start = offset + (rest.len() - rest.trim_start().len());

        (start < trimmed_str.len()).then(|| trimmed.start + start..trimmed.end)
    });

    Ok(Command {
        line,
        trimmed,
        verb,
        argument,
    })
}

/// One command line from the client.
#[derive(PartialEq, Eq, Clone)]
pub struct Command {
    /// The entire line, unmodified.
    line: AsciiString,
    /// The range over [`Self::line`] without leading and trailing whitespace.
    trimmed: Range<usize>,
    verb: Verb,
    /// The range over [`Self::line`] containing the argument, if there is a non-empty one.
    argument: Option<Range<usize>>,
}

impl Command {
    /// Get the line with leading and trailing whitespace stripped.
    pub fn trimmed(&self) -> &AsciiStr {
        self.get(&self.trimmed)
    }

    pub const fn verb(&self) -> Verb {
        self.verb
    }

    /// Get the text following the verb, with surrounding whitespace removed.
    ///
    /// Case is preserved: the local part of an address is case-sensitive.
    pub fn argument(&self) -> Option<&AsciiStr> {
        let range = self.argument.as_ref()?;

        Some(self.get(range))
    }

    /// Get a range of the internal [`AsciiString`] as a string slice.
    fn get(&self, range: &Range<usize>) -> &AsciiStr {
        &self.line[range.clone()]
    }
}

impl Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("line", &self.line)
            .field("trimmed", &self.trimmed)
            .field("trimmed()", &self.trimmed())
            .field("verb", &self.verb)
            .field("argument", &self.argument)
            .field("argument()", &self.argument())
            .finish()
    }
}

/// Possible error states encountered when trying to convert a line into a [`Command`].
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum CommandError {
    /// Function was passed a line that is empty.
    Empty,
    /// Function was passed a line that consists of only whitespace.
    OnlyWhitespace,
    /// The line contains bytes outside of US-ASCII.
    NonAscii,
    /// The line does not start with any [`Verb`].
    Unrecognized,
}

impl Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Empty => "empty command",
            Self::OnlyWhitespace => "command consists only of whitespace",
            Self::NonAscii => "invalid character",
            Self::Unrecognized => "command not recognized",
        })
    }
}

impl std::error::Error for CommandError {}
