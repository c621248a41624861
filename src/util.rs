// Copyright 2021 Locha Mesh Developers <contact@locha.io>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Utilities

use std::fmt::Write;

/// Run `attempt` up to `attempts` times until it produces a value.
///
/// An error stops the loop right away. Returns `Ok(None)` when every
/// attempt came back empty.
pub fn retry<T, E, F>(attempts: usize, mut attempt: F) -> Result<Option<T>, E>
where
    F: FnMut(usize) -> Result<Option<T>, E>,
{
    for i in 0..attempts {
        if let Some(value) = attempt(i)? {
            return Ok(Some(value));
        }
        log::trace!("attempt #{} of {} failed", i + 1, attempts);
    }

    Ok(None)
}

/// Whether every byte is 0xFF.
#[inline]
pub fn is_erased(data: &[u8]) -> bool {
    data.iter().all(|b| *b == 0xFF)
}

/// Format a row as `OFFSET: XX XX ... |ascii|` for trace logs.
pub fn hex_row(offset: u32, row: &[u8]) -> String {
    let mut line = String::with_capacity(12 + row.len() * 4);
    let _ = write!(line, "{:08X}:", offset);
    for byte in row {
        let _ = write!(line, " {:02X}", byte);
    }
    line.push_str("  |");
    line.extend(row.iter().map(|b| {
        if b.is_ascii_graphic() || *b == b' ' {
            char::from(*b)
        } else {
            '.'
        }
    }));
    line.push('|');
    line
}
