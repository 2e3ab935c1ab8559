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

//! The `DATA` phase: reading the message, scanning its subject, and handing it to persistence.

use tokio::io::AsyncRead;

use super::{
    state::{Connection, State},
    CloseReason,
};
use crate::{
    context::ServerContext,
    envelope::{self, Envelope},
    error::FramingError,
    framer::Framer,
    persistence::SaveOutcome,
    str::{max_lengths, strip_data_terminator, strip_line_ending, DATA_TERMINATOR},
};

/// Read one message and queue the reply for it.
///
/// Always leaves the connection in [`State::Command`]. Returns `Some` only when the transport is
/// gone and the session must end without another reply.
///
/// Size is checked twice. A body over `max_size` is read to its end and answered with `552`,
/// keeping the connection. Only the hard ceiling stops the read, with `550 Error: DATA limit
/// exceeded`, and closes the connection.
pub async fn receive<R>(
    connection: &mut Connection,
    framer: &mut Framer<R>,
    context: &ServerContext,
) -> Option<CloseReason>
where
    R: AsyncRead + Unpin,
{
    let max_size = context.config().max_size;
    framer.set_limit(max_lengths::data_ceiling(max_size));

    let mut subject = SubjectScanner::default();
    let result = framer
        .read_until_with(DATA_TERMINATOR.as_bytes(), |line| subject.scan(line))
        .await;

    connection.state = State::Command;
    connection.subject = subject.finish();

    let block = match result {
        Ok(block) => block,
        Err(FramingError::LimitExceeded { limit }) => {
            tracing::warn!(limit, "Message exceeded the hard size limit");
            connection.reply("550 Error: DATA limit exceeded");
            connection.kill(CloseReason::DataLimitExceeded);
            return None;
        }
        Err(FramingError::Io(err)) if !CloseReason::is_disconnect(&err) => {
            tracing::warn!(%err, "Reading message failed");
            connection.reply(format!("451 Error: {err}"));
            return None;
        }
        Err(err) => return Some(CloseReason::from(err)),
    };

    let body = strip_data_terminator(&block);

    if body.len() > max_size {
        tracing::info!(size = body.len(), max_size, "Message rejected as too large");
        connection.reply(format!("552 Error: maximum DATA size exceeded ({max_size})"));
        return None;
    }

    let (mail_from, rcpt_to) = match envelope::validate(&connection.mail_from, &connection.rcpt_to) {
        Ok(addresses) => addresses,
        Err(err) => {
            tracing::info!(%err, "Message rejected");
            connection.reply(format!("550 Error: {err}"));
            return None;
        }
    };

    let timestamp = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    let hash = envelope::queue_id(&rcpt_to, &mail_from, &connection.subject, timestamp);

    let envelope = Envelope {
        connection_id: connection.id,
        mail_from,
        rcpt_to,
        subject: connection.subject.clone(),
        body: body.to_vec(),
        hash: hash.clone(),
        remote_addr: connection.address.clone(),
        helo: connection.helo.clone(),
        tls_on: connection.tls_on,
    };

    match context.gateway().submit(envelope).await {
        SaveOutcome::Saved => {
            tracing::info!(%hash, size = body.len(), "Message queued");
            connection.reply(format!("250 OK : queued as {hash}"));
        }
        SaveOutcome::Failed => connection.reply("554 Error: transaction failed"),
        SaveOutcome::TimedOut => connection.reply("554 Error: transaction timeout"),
    }

    None
}

/// Picks the `Subject:` header out of message lines as they are read.
///
/// Folded continuation lines (starting with a space or tab) are joined to the value without
/// their line break. Only the first `Subject:` header counts.
#[derive(Debug, Default)]
pub struct SubjectScanner {
    subject: Option<String>,
    /// Whether the previous line belonged to the subject.
    folding: bool,
}

impl SubjectScanner {
    const HEADER: &'static [u8] = b"subject: ";

    /// Look at one physical line, including its line ending.
    pub fn scan(&mut self, line: &[u8]) {
        match &mut self.subject {
            None => {
                let Some(value) = line
                    .get(..Self::HEADER.len())
                    .filter(|head| head.eq_ignore_ascii_case(Self::HEADER))
                    .map(|_| &line[Self::HEADER.len()..])
                else {
                    return;
                };

                self.subject = Some(line_text(value));
                self.folding = true;
            }
            Some(subject) if self.folding => {
                if line.starts_with(b" ") || line.starts_with(b"\t") {
                    subject.push_str(&line_text(line));
                } else {
                    self.folding = false;
                }
            }
            Some(_) => (),
        }
    }

    /// The subject found, or an empty string.
    pub fn finish(self) -> String {
        self.subject.unwrap_or_default()
    }
}

/// `line` without its line ending, decoded leniently.
fn line_text(line: &[u8]) -> String {
    strip_line_ending(&String::from_utf8_lossy(line)).to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    fn scan(lines: &[&str]) -> String {
        let mut scanner = SubjectScanner::default();
        for line in lines {
            scanner.scan(line.as_bytes());
        }

        scanner.finish()
    }

    #[test]
    fn test_subject() {
        assert_eq!(
            scan(&["From: a@b.com\r\n", "Subject: Hello\r\n", "\r\n", "Body\r\n"]),
            "Hello"
        );
        assert_eq!(scan(&["SUBJECT: shouting\r\n"]), "shouting");
        assert_eq!(scan(&["From: a@b.com\r\n", "\r\n"]), "");
    }

    #[test]
    fn test_folded_subject() {
        assert_eq!(scan(&["Subject: Hello\r\n", " World\r\n"]), "Hello World");
        assert_eq!(
            scan(&["Subject: one\r\n", "\ttwo\r\n", " three\r\n", "To: c@d.com\r\n", " four\r\n"]),
            "one\ttwo three"
        );
    }

    #[test]
    fn test_first_subject_wins() {
        assert_eq!(
            scan(&["Subject: first\r\n", "X-Other: x\r\n", "Subject: second\r\n"]),
            "first"
        );
    }

    #[test]
    fn test_header_needs_space_after_colon() {
        assert_eq!(scan(&["Subject:tight\r\n"]), "");
    }
}
