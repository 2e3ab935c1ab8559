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

//! Fixed wait ceilings used by the server.
//!
//! The per-operation network deadline is configurable (`timeout` in
//! [`crate::config::ServerConfig`]); [`SERVER_TIMEOUT`] is only its default. The persistence
//! acknowledgment wait is separate from it.
//!
//! Note that, when testing, all timeouts are overridden to [`EXPECTED`]; because a testing
//! environment can be expected to have better performance than the real world.

/// A very strict timeout for how long participants should wait for anything.
///
/// This is for identifying unusual performance for testing and logging.
pub const EXPECTED: std::time::Duration = std::time::Duration::from_secs(3);

/// Generate `const` items with [`std::time::Duration`] values in seconds, optionally including
/// documentation comments.
macro_rules! second_durations {
        [$(
            $( #[$attr:meta] )*
            $label:ident = $seconds:expr
        ),+ ,] => {
            $(
                $( #[$attr] )*
                #[cfg(not(test))]
                pub const $label: ::std::time::Duration =
                    ::std::time::Duration::from_secs($seconds);

                // For stricter performance checks during testing.
                $( #[$attr] )*
                #[cfg(test)]
                pub const $label: ::std::time::Duration =
                    $crate::timeouts::EXPECTED;
            )+
        };
    }

second_durations![
    /// The minimum length a server should wait for the next command from a client, and the
    /// default per-read and per-write deadline.
    ///
    /// [RFC 5321 § 4.5.3.2.7](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.5.3.2.7).
    SERVER_TIMEOUT = 5 * 60,
    /// How long a connection waits for a persistence worker to acknowledge its message before
    /// telling the client the transaction timed out.
    ///
    /// The job is not cancelled when this elapses; its outcome is simply no longer observed.
    SAVE_ACKNOWLEDGEMENT = 30,
];
