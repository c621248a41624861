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

//! # Device table
//!
//! Every controller the programmer knows, keyed by the 24-bit signature the
//! controller reports in serial programming mode. For the 32-bit controllers
//! the signature is synthesized by the board controller firmware from the
//! vendor ID, family, memory size and package.

use std::fmt;

use bitflags::bitflags;

use crate::family::Family;

/// One of the three fuse bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FuseByte {
    Extended,
    High,
    Low,
}

impl FuseByte {
    pub const ALL: [FuseByte; 3] = [FuseByte::Extended, FuseByte::High, FuseByte::Low];

    /// Index into a `[extended, high, low]` array.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            FuseByte::Extended => 0,
            FuseByte::High => 1,
            FuseByte::Low => 2,
        }
    }
}

impl fmt::Display for FuseByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            FuseByte::Extended => "X",
            FuseByte::High => "H",
            FuseByte::Low => "L",
        };
        f.write_str(letter)
    }
}

/// A bit field inside one of the fuse bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuseBit {
    pub byte: FuseByte,
    pub mask: u8,
}

/// Lock bits controlling access through the external programming interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockMode {
    pub mask: u8,
    /// Value of the masked bits when programming is allowed.
    pub prog_enabled: u8,
    /// Value of the masked bits when the firmware is protected.
    pub prog_disabled: u8,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        const BOOTBLOCK = 0x01;
        const BOOTBLOCK_BOTTOM = 0x02;
        const EEPROM_EMULATION = 0x04;
        const SPM_EXT = 0x08;
        const DISABLE_CMD = 0x10;
        const SKIP_ERASED = 0x20;
    }
}

/// Geometry and fuse layout of a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: &'static str,
    pub signature: u32,
    pub family: Family,
    pub flash_size: u32,
    pub flash_page_size: u32,
    pub eeprom_size: u32,
    pub eesave: Option<FuseBit>,
    pub spien: Option<FuseBit>,
    pub rstdisbl: Option<FuseBit>,
    pub cksel: Option<FuseBit>,
    /// CKSEL value selecting the internal calibrated oscillator.
    pub int_calib: u8,
    pub lock_mode: LockMode,
    /// Start of the manufacturing data window in EEPROM.
    pub mfg_start: u32,
}

impl DeviceDescriptor {
    #[inline]
    pub fn capabilities(&self) -> Capabilities {
        self.family.capabilities()
    }
}

const fn fuse(byte: FuseByte, mask: u8) -> Option<FuseBit> {
    Some(FuseBit { byte, mask })
}

const AVR_LOCK_MODE: LockMode = LockMode {
    mask: 0x03,
    prog_enabled: 0x03,
    prog_disabled: 0x00,
};

const NO_LOCK_MODE: LockMode = LockMode {
    mask: 0x00,
    prog_enabled: 0x00,
    prog_disabled: 0x00,
};

const fn avr_x8(
    name: &'static str,
    signature: u32,
    flash_size: u32,
    flash_page_size: u32,
    eeprom_size: u32,
) -> DeviceDescriptor {
    DeviceDescriptor {
        name,
        signature,
        family: Family::AvrX8,
        flash_size,
        flash_page_size,
        eeprom_size,
        eesave: fuse(FuseByte::High, 0x08),
        spien: fuse(FuseByte::High, 0x20),
        rstdisbl: fuse(FuseByte::High, 0x80),
        cksel: fuse(FuseByte::Low, 0x0F),
        int_calib: 0x02,
        lock_mode: AVR_LOCK_MODE,
        mfg_start: 0,
    }
}

const fn avr_x5p(
    name: &'static str,
    signature: u32,
    flash_size: u32,
    eeprom_size: u32,
) -> DeviceDescriptor {
    DeviceDescriptor {
        name,
        signature,
        family: Family::AvrX5P,
        flash_size,
        flash_page_size: 128,
        eeprom_size,
        eesave: fuse(FuseByte::High, 0x08),
        spien: fuse(FuseByte::High, 0x20),
        rstdisbl: fuse(FuseByte::Extended, 0x01),
        cksel: fuse(FuseByte::Low, 0x0F),
        int_calib: 0x02,
        lock_mode: AVR_LOCK_MODE,
        mfg_start: 0x100,
    }
}

const fn mec170x(name: &'static str, signature: u32) -> DeviceDescriptor {
    DeviceDescriptor {
        name,
        signature,
        family: Family::Mec170x,
        flash_size: 2 * 1024 * 1024,
        flash_page_size: 256,
        eeprom_size: 2 * 1024,
        eesave: fuse(FuseByte::High, 0x01),
        spien: None,
        rstdisbl: None,
        cksel: None,
        int_calib: 0,
        lock_mode: NO_LOCK_MODE,
        mfg_start: 0,
    }
}

const STM32F100R8: DeviceDescriptor = DeviceDescriptor {
    name: "STM32F100R8",
    signature: 0x23_0020,
    family: Family::Stm32,
    flash_size: 64 * 1024,
    flash_page_size: 1024,
    eeprom_size: 256,
    eesave: fuse(FuseByte::High, 0x01),
    spien: None,
    rstdisbl: None,
    cksel: None,
    int_calib: 0,
    lock_mode: LockMode {
        mask: 0x01,
        prog_enabled: 0x01,
        prog_disabled: 0x00,
    },
    mfg_start: 0,
};

const TM4E1231H6ZRB: DeviceDescriptor = DeviceDescriptor {
    name: "TM4E1231H6ZRB",
    signature: 0x46_E13B,
    family: Family::Tiva,
    flash_size: 256 * 1024,
    flash_page_size: 128,
    eeprom_size: 256,
    eesave: fuse(FuseByte::High, 0x01),
    spien: None,
    rstdisbl: None,
    cksel: None,
    int_calib: 0,
    lock_mode: NO_LOCK_MODE,
    mfg_start: 0,
};

/// All known controllers, sorted by signature.
#[rustfmt::skip]
pub static DEVICES: [DeviceDescriptor; 26] = [
    avr_x8("ATmega48",    0x05_921E,  4 * 1024,  64,  256),
    avr_x8("ATmega168",   0x06_941E, 16 * 1024, 128,  512),
    avr_x5p("ATmega165P", 0x07_941E, 16 * 1024,       512),
    avr_x8("ATmega48PA",  0x0A_921E,  4 * 1024,  64,  256),
    avr_x8("ATmega88",    0x0A_931E,  8 * 1024,  64,  512),
    avr_x8("ATmega168PA", 0x0B_941E, 16 * 1024, 128,  512),
    avr_x5p("ATmega325P", 0x0D_951E, 32 * 1024,      1024),
    avr_x8("ATmega88PA",  0x0F_931E,  8 * 1024,  64,  512),
    avr_x8("ATmega328P",  0x0F_951E, 32 * 1024, 128, 1024),
    mec170x("MEC1701HSZ", 0x11_1B45),
    mec170x("MEC1703HSZ", 0x11_1C45),
    mec170x("MEC1705HSZ", 0x11_2045),
    mec170x("MEC1706HSZ", 0x11_2145),
    mec170x("MEC1704HSZ", 0x11_2245),
    mec170x("MEC1701KSZ", 0x12_1B45),
    mec170x("MEC1703KSZ", 0x12_1C45),
    mec170x("MEC1705KSZ", 0x12_2045),
    mec170x("MEC1706KSZ", 0x12_2145),
    mec170x("MEC1704KSZ", 0x12_2245),
    mec170x("MEC1701QSZ", 0x13_1B45),
    mec170x("MEC1703QSZ", 0x13_1C45),
    mec170x("MEC1705QSZ", 0x13_2045),
    mec170x("MEC1706QSZ", 0x13_2145),
    mec170x("MEC1704QSZ", 0x13_2245),
    STM32F100R8,
    TM4E1231H6ZRB,
];

/// Find a controller by its signature.
pub fn lookup(signature: u32) -> Option<&'static DeviceDescriptor> {
    DEVICES
        .binary_search_by_key(&signature, |d| d.signature)
        .ok()
        .map(|i| &DEVICES[i])
}

/// Find a controller by name, ignoring case.
pub fn by_name(name: &str) -> Option<&'static DeviceDescriptor> {
    DEVICES.iter().find(|d| d.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_table_is_sorted() {
        for pair in DEVICES.windows(2) {
            assert!(
                pair[0].signature < pair[1].signature,
                "{} must come after {}",
                pair[0].name,
                pair[1].name
            );
        }
    }

    #[test]
    fn test_lookup() {
        let dev = lookup(0x05_921E).unwrap();
        assert_eq!(dev.name, "ATmega48");
        assert_eq!(dev.flash_size, 4096);
        assert_eq!(dev.flash_page_size, 64);

        // 0x45 | MEC1706 | 480K SRAM | 144 WFBGA
        let dev = lookup(0x45 | 0x2100 | 0x03_0000 | 0x10_0000).unwrap();
        assert_eq!(dev.name, "MEC1706QSZ");

        assert!(lookup(0x00_0000).is_none());
        assert!(lookup(0xFF_FFFF).is_none());
    }

    #[test]
    fn test_fuse_layout() {
        let dev = by_name("atmega325p").unwrap();
        assert_eq!(
            dev.rstdisbl,
            Some(FuseBit {
                byte: FuseByte::Extended,
                mask: 0x01
            })
        );
        assert_eq!(dev.mfg_start, 0x100);
        assert!(dev.capabilities().contains(Capabilities::BOOTBLOCK));

        let dev = by_name("STM32F100R8").unwrap();
        assert!(dev.spien.is_none());
        assert!(dev.cksel.is_none());
        assert_eq!(dev.lock_mode.mask, 0x01);
    }

    #[test]
    fn test_page_size_divides_flash() {
        for dev in DEVICES.iter() {
            assert_eq!(dev.flash_size % dev.flash_page_size, 0, "{}", dev.name);
            assert!(dev.flash_size as usize <= crate::constants::MAX_FLS_SIZE);
            assert!(dev.eeprom_size <= crate::constants::MAX_EEP_SIZE);
        }
    }
}
