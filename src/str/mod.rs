// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright © 2024 RemasteredArch
// Copyright © 2024 Jaxydog
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

//! Wire-level string constants and helpers shared by the framer and the protocol engine.

pub mod max_lengths;

/// The only line ending [RFC 5321 section 2.3.8](https://www.rfc-editor.org/rfc/rfc5321.html#section-2.3.8)
/// recognizes.
pub const CRLF: &str = "\r\n";

/// Terminates the mail data block: a line consisting solely of a period.
///
/// [RFC 5321 § 4.1.1.4](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.4).
pub const DATA_TERMINATOR: &str = "\r\n.\r\n";

/// Strip one trailing [`CRLF`] (or a lone `LF`) from `line`, if present.
#[must_use]
pub fn strip_line_ending(line: &str) -> &str {
    line.strip_suffix(CRLF)
        .or_else(|| line.strip_suffix('\n'))
        .unwrap_or(line)
}

/// Remove the final `".\r\n"` line from a block read up to and including [`DATA_TERMINATOR`].
///
/// The `CRLF` that ended the last content line is kept. A block that does not end with the
/// terminator is returned unchanged.
#[must_use]
pub fn strip_data_terminator(block: &[u8]) -> &[u8] {
    // The final content line's `CRLF` belongs to the message, only `".\r\n"` is framing.
    const DOT_LINE: &[u8] = b".\r\n";

    if block == DOT_LINE {
        return &[];
    }

    if block.ends_with(DATA_TERMINATOR.as_bytes()) {
        &block[..block.len() - DOT_LINE.len()]
    } else {
        block
    }
}
