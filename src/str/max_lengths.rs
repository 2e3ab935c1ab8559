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

//! The byte ceilings the server enforces while framing client input.
//!
//! [RFC 5321 section 4.5.3.1](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.5.3.1)
//! defines *minimum* values that both parties must handle. The server is free to accept more, and
//! does for command lines, since some clients send long `XCLIENT` or `MAIL FROM` parameters.

/// The maximum length of a command line (including the verb and line ending sequence) in
/// bytes.
///
/// Twice [RFC 5321 § 4.5.3.1.4](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.5.3.1.4).
pub const COMMAND_LINE: usize = 1_024;

/// Allowance added on top of the configured maximum message size to form the hard ceiling while
/// reading mail data.
///
/// Transfer encodings and added headers make a message larger on the wire than the size the
/// client advertised, so a body only breaks the connection once it overruns the configured
/// maximum by more than this.
pub const DATA_OVERHEAD: usize = 1_024_000;

/// The hard ceiling for a mail data block given the configured maximum message size.
#[must_use]
pub const fn data_ceiling(max_size: usize) -> usize {
    max_size.saturating_add(DATA_OVERHEAD)
}
