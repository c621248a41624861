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

//! Verification window.
//!
//! Parts of the flash may hold a bootblock or an emulated EEPROM area that
//! the current image didn't program. The image has erased bytes there, so
//! comparing them would always fail. Firmware builds embed ASCII markers at
//! known alignments that tell where those areas are:
//!
//! - `BS<d|B><d><d>` ends a bootblock at the bottom of the flash.
//! - `AS<d><d><d>` ends the application area.
//!
//! The emulated EEPROM area is also found on the live device through its
//! `0x53FF` ID words. When nothing is found the whole flash is verified.

use std::{fmt, io};

use crate::flags::Flags;

/// ID word of an emulated EEPROM area.
const EEPS_ID: u16 = 0x53FF;
const EEPS_PTR_MSK: u32 = 0xFFF8_0000;
const EEPS_PTR_TAG: u32 = 0x0800_0000;
const EEPS_OFFSET_MSK: u32 = 0x0007_FFFF;

const SCAN_STEP: u32 = 1024;
const MIN_BOOTBLOCK: u32 = 128;

/// Byte range of the flash to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: u32,
    pub end: u32,
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}h..{:08X}h", self.start, self.end)
    }
}

fn marker_at(image: &[u8], end: u32, first: u8, second: u8, third: fn(u8) -> bool) -> bool {
    let end = end as usize;
    if end < 6 || end > image.len() {
        return false;
    }

    let m = &image[end - 6..end - 1];
    m[0] == first
        && m[1] == second
        && third(m[2])
        && m[3].is_ascii_digit()
        && m[4].is_ascii_digit()
}

fn bootblock_marker(image: &[u8], end: u32) -> bool {
    marker_at(image, end, b'B', b'S', |c| c.is_ascii_digit() || c == b'B')
}

fn app_end_marker(image: &[u8], end: u32) -> bool {
    marker_at(image, end, b'A', b'S', |c| c.is_ascii_digit())
}

/// Find the verification window for `image` on a flash of `flash_size`
/// bytes.
///
/// `read_word` reads a word, by word address, from the live device. It is
/// only used to look for an emulated EEPROM area.
pub fn resolve<F>(
    image: &[u8],
    flash_size: u32,
    flags: Flags,
    mut read_word: F,
) -> io::Result<Window>
where
    F: FnMut(u32) -> io::Result<u16>,
{
    let mut window = Window {
        start: 0,
        end: flash_size,
    };

    let bb = flags.contains(Flags::BB_SUPPORT);
    let bottom = flags.contains(Flags::BB_BOTTOM);
    let update = flags.contains(Flags::BOOTBLOCK_UPDATE);

    if bb && bottom && !update {
        let mut size = MIN_BOOTBLOCK;
        loop {
            if bootblock_marker(image, size) {
                window.start = size;
            }
            size = if size >= SCAN_STEP { size + SCAN_STEP } else { size << 1 };
            if window.start != 0 || size >= flash_size {
                break;
            }
        }
    }

    if flags.contains(Flags::EEEP_SUPPORT) && (!bb || bottom) {
        let mut app_end = flash_size;
        loop {
            if app_end_marker(image, app_end) {
                window.end = app_end;
            }
            app_end = app_end.saturating_sub(SCAN_STEP);
            if window.end != flash_size || app_end == 0 {
                break;
            }
        }

        // An image holding only a bootblock has no marker, look for the
        // emulated EEPROM area on the device.
        if window.end == flash_size {
            probe_eeprom_area(flash_size, &mut window, &mut read_word)?;
        }
    }

    if bb && !bottom && !update {
        let mut size = 0;
        let mut app_end = flash_size;
        loop {
            if app_end_marker(image, app_end) {
                window.end = app_end;
            }
            size = if size == 0 { MIN_BOOTBLOCK } else { size << 1 };
            app_end = flash_size.saturating_sub(size);
            if window.end != flash_size || size > SCAN_STEP {
                break;
            }
        }
    }

    log::debug!("verification window {}", window);
    Ok(window)
}

fn probe_eeprom_area<F>(
    flash_size: u32,
    window: &mut Window,
    read_word: &mut F,
) -> io::Result<()>
where
    F: FnMut(u32) -> io::Result<u16>,
{
    // Upper ID at the top of the flash points to the start of the area.
    let top = flash_size.saturating_sub(6);
    if read_word(top / 2)? == EEPS_ID {
        if let Some(start) = read_pointer(read_word, flash_size - 2, flash_size - 4)? {
            if start < flash_size && start > window.start {
                window.end = start;
                return Ok(());
            }
        }
    }

    // Lower ID at a 1 KiB boundary points to the upper ID. The pointer
    // words follow the ID, low word first.
    let mut app_end = match flash_size.checked_sub(SCAN_STEP) {
        Some(a) => a,
        None => return Ok(()),
    };
    loop {
        if read_word(app_end / 2)? == EEPS_ID
            && read_pointer(read_word, app_end + 4, app_end + 2)? == Some(top)
        {
            window.end = app_end;
            return Ok(());
        }
        app_end = match app_end.checked_sub(SCAN_STEP) {
            Some(a) if a > window.start => a,
            _ => return Ok(()),
        };
    }
}

/// Flash offset stored in two words at byte addresses `hi` and `lo`.
fn read_pointer<F>(read_word: &mut F, hi: u32, lo: u32) -> io::Result<Option<u32>>
where
    F: FnMut(u32) -> io::Result<u16>,
{
    let ptr = (u32::from(read_word(hi / 2)?) << 16) | u32::from(read_word(lo / 2)?);
    Ok(if ptr & EEPS_PTR_MSK == EEPS_PTR_TAG {
        Some(ptr & EEPS_OFFSET_MSK)
    } else {
        None
    })
}
