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

//! Byte-limited, suffix-terminated reads over a stream.
//!
//! SMTP frames input two ways. Commands are single `CRLF` lines with a small ceiling, mail data is
//! a block ended by a line holding only `.` with a ceiling derived from the configured message
//! size. [`Framer`] handles both with one adjustable budget, so the engine only swaps the limit
//! and the suffix between states.
//!
//! See [`Framer::read_until`].

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    error::FramingError,
    str::{max_lengths, CRLF},
};


/// How many bytes to request from the stream per read.
const READ_CHUNK: usize = 4_096;

/// Wraps a byte stream and reads it in units ending with a caller-chosen suffix.
///
/// The remaining-byte budget ([`Self::set_limit`]) counts bytes handed out, not bytes pulled from
/// the stream, so input a client pipelined ahead of time is held in the buffer and only charged
/// against the limit in force when it is actually read.
#[derive(Debug)]
pub struct Framer<R> {
    inner: R,
    /// Bytes read from `inner` but not yet returned.
    buffer: Vec<u8>,
    /// Index of the first unreturned byte in `buffer`.
    position: usize,
    /// Bytes that may still be returned before [`FramingError::LimitExceeded`].
    remaining: usize,
    /// The value most recently passed to [`Self::set_limit`], for error reporting.
    limit: usize,
    /// Deadline applied to every read from `inner`.
    timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> Framer<R> {
    /// Wrap `inner` with the command-line ceiling and no read deadline.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(READ_CHUNK),
            position: 0,
            remaining: max_lengths::COMMAND_LINE,
            limit: max_lengths::COMMAND_LINE,
            timeout: None,
        }
    }

    /// Wrap `inner`, failing any single read from it that takes longer than `timeout`.
    pub fn with_timeout(inner: R, timeout: Duration) -> Self {
        let mut framer = Self::new(inner);
        framer.timeout = Some(timeout);
        framer
    }

    /// Replace the remaining-byte budget.
    ///
    /// Bytes already buffered are kept.
    pub fn set_limit(&mut self, limit: usize) {
        self.remaining = limit;
        self.limit = limit;
    }

    /// The budget left before [`FramingError::LimitExceeded`].
    pub const fn remaining(&self) -> usize {
        self.remaining
    }

    /// Bytes read from the stream that have not been returned yet.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[self.position..]
    }

    /// Get the underlying stream, for writing replies.
    ///
    /// Reading from it directly bypasses the buffer and the limit.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Unwrap the stream, returning it together with any bytes that were buffered but not read.
    pub fn into_inner(self) -> (R, Vec<u8>) {
        let leftover = self.buffer[self.position..].to_vec();
        (self.inner, leftover)
    }

    /// Read until the accumulated unit ends with `suffix`.
    ///
    /// Returns the unit including `suffix`.
    ///
    /// Every read is assumed to begin at a line boundary, so a suffix that begins with [`CRLF`]
    /// also matches a unit equal to the rest of that suffix. This is what lets `".\r\n"` right after
    /// the `DATA` command end an empty message.
    ///
    /// # Errors
    ///
    /// - [`FramingError::LimitExceeded`] if the budget runs out first. The partial unit is dropped.
    /// - [`FramingError::EndOfStream`] if the peer closes the stream first.
    /// - [`FramingError::TimedOut`] if a single read exceeds the configured deadline.
    /// - [`FramingError::Io`] for any other I/O error from the stream.
    pub async fn read_until(&mut self, suffix: &[u8]) -> Result<Vec<u8>, FramingError> {
        self.read_until_with(suffix, |_| ()).await
    }

    /// Like [`Self::read_until`], but also passes every complete physical line (ending in `LF`,
    /// including it) to `on_line` as soon as it has been read.
    ///
    /// # Errors
    ///
    /// See [`Self::read_until`].
    pub async fn read_until_with<F>(
        &mut self,
        suffix: &[u8],
        mut on_line: F,
    ) -> Result<Vec<u8>, FramingError>
    where
        F: FnMut(&[u8]),
    {
        let mut unit = Vec::new();
        let mut line_start = 0;

        loop {
            while self.position < self.buffer.len() {
                if self.remaining == 0 {
                    return Err(FramingError::LimitExceeded { limit: self.limit });
                }

                let byte = self.buffer[self.position];
                self.position += 1;
                self.remaining -= 1;
                unit.push(byte);

                if byte == b'\n' {
                    on_line(&unit[line_start..]);
                    line_start = unit.len();
                }

                if is_terminated(&unit, suffix) {
                    return Ok(unit);
                }
            }

            // Budget spent without the suffix; more input cannot help.
            if self.remaining == 0 {
                return Err(FramingError::LimitExceeded { limit: self.limit });
            }

            self.fill().await?;
        }
    }

    /// Replace the (fully consumed) buffer with fresh bytes from the stream.
    async fn fill(&mut self) -> Result<(), FramingError> {
        self.buffer.resize(READ_CHUNK, 0);
        self.position = 0;

        let read = self.inner.read(&mut self.buffer);
        let result = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, read).await {
                Ok(result) => result.map_err(FramingError::from),
                Err(_elapsed) => Err(FramingError::TimedOut),
            },
            None => read.await.map_err(FramingError::from),
        };

        // On failure nothing was read; the zeroed space must not look like buffered input.
        let read_bytes = result.inspect_err(|_| self.buffer.clear())?;
        self.buffer.truncate(read_bytes);

        if read_bytes == 0 {
            return Err(FramingError::EndOfStream);
        }

        Ok(())
    }
}

/// Whether `unit` is complete for `suffix`, treating the start of `unit` as a line boundary.
fn is_terminated(unit: &[u8], suffix: &[u8]) -> bool {
    if unit.ends_with(suffix) {
        return true;
    }

    suffix
        .strip_prefix(CRLF.as_bytes())
        .is_some_and(|rest| !rest.is_empty() && unit == rest)
}
