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

//! Fuse safety net.
//!
//! Without a bootblock emulating the serial programming protocol, updates
//! need the external reset pin and the SPI programming interface of the
//! controller, so fuse settings disabling either are refused. The board
//! controller has no external clock source, so the clock selection is always
//! forced to the internal calibrated oscillator.

use crate::{
    device::{DeviceDescriptor, FuseBit, FuseByte},
    flags::Flags,
};

/// Value to program into `fuse` instead of `value`.
///
/// The second element tells if some requested setting was replaced.
pub fn protect(
    device: &DeviceDescriptor,
    fuse: FuseByte,
    value: u8,
    flags: Flags,
) -> (u8, bool) {
    if flags.contains(Flags::NO_FUSE_PROTECTION) {
        return (value, false);
    }

    let in_byte =
        |bit: Option<FuseBit>| bit.filter(|b| b.byte == fuse).map(|b| b.mask);

    let mut value = value;
    let mut ignored = false;

    if !flags.contains(Flags::BB_SUPPORT) {
        // Programmed (zero) RSTDISBL disables the reset pin.
        if let Some(mask) = in_byte(device.rstdisbl) {
            if value & mask == 0 {
                value |= mask;
                ignored = true;
            }
        }
        // Unprogrammed (one) SPIEN disables serial programming.
        if let Some(mask) = in_byte(device.spien) {
            if value & mask != 0 {
                value &= !mask;
                ignored = true;
            }
        }
    }

    if let Some(mask) = in_byte(device.cksel) {
        if value & mask != device.int_calib {
            value = (value & !mask) | device.int_calib;
            ignored = true;
        }
    }

    if ignored {
        log::debug!("fuse {}: requested value replaced by {:02X}h", fuse, value);
    }

    (value, ignored)
}
