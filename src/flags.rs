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

use bitflags::bitflags;

use crate::device::FuseByte;

bitflags! {
    /// Run flags.
    ///
    /// The low half carries the switches given by the caller, the high half
    /// carries state the engine derives while it runs. Use
    /// [`Flags::from_user`] to build the flags of a new run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u32 {
        /// Suppress progress output.
        const SILENT = 0x0000_0001;
        /// Log every protocol exchange.
        const VERBOSE = 0x0000_0002;
        /// Unattended run, never prompt.
        const BATCH = 0x0000_0004;
        /// Skip all verification.
        const SKIP_VERIFY = 0x0000_0008;
        /// Skip erased (0xFF) data during verification and, on the fast
        /// path, during programming.
        const SKIP_VERIFY_FF = 0x0000_0010;
        /// Erase the EEPROM even if EESAVE preserves it.
        const EEP_ERASE = 0x0000_0020;
        /// Allow writes to the manufacturing window of the EEPROM.
        const MFG_WRITE = 0x0000_0040;
        /// Bypass the fuse safety net.
        const NO_FUSE_PROTECTION = 0x0000_0080;
        /// The image updates the bootblock too.
        const BOOTBLOCK_UPDATE = 0x0000_0100;
        /// Ignore a compatibility ID mismatch.
        const CID_OVERRIDE = 0x0000_0200;
        /// Enable the board controller bootloader.
        const BOOTLOADER_ENABLE = 0x0000_0400;
        /// Disable the board controller bootloader.
        const BOOTLOADER_DISABLE = 0x0000_0800;

        const PROG_ENABLED = 0x0001_0000;
        const FLS_PROG_REQ = 0x0002_0000;
        const EEP_PROG_REQ = 0x0004_0000;
        const FUSE_X_PROG_REQ = 0x0008_0000;
        const FUSE_H_PROG_REQ = 0x0010_0000;
        const FUSE_L_PROG_REQ = 0x0020_0000;
        const LOCKS_PROG_REQ = 0x0040_0000;
        const CHIP_ERASE_REQ = 0x0080_0000;
        const EEP_ERASED = 0x0100_0000;
        const BB_SUPPORT = 0x0200_0000;
        const BB_BOTTOM = 0x0400_0000;
        const EEEP_SUPPORT = 0x0800_0000;
        const SPM_EXT_SUPPORT = 0x1000_0000;
        const DISABLE_CMD = 0x2000_0000;

        /// Every switch a caller may set.
        const USER = Self::SILENT.bits()
            | Self::VERBOSE.bits()
            | Self::BATCH.bits()
            | Self::SKIP_VERIFY.bits()
            | Self::SKIP_VERIFY_FF.bits()
            | Self::EEP_ERASE.bits()
            | Self::MFG_WRITE.bits()
            | Self::NO_FUSE_PROTECTION.bits()
            | Self::BOOTBLOCK_UPDATE.bits()
            | Self::CID_OVERRIDE.bits()
            | Self::BOOTLOADER_ENABLE.bits()
            | Self::BOOTLOADER_DISABLE.bits();

        /// Any fuse byte requested.
        const FUSES_PROG_REQ = Self::FUSE_X_PROG_REQ.bits()
            | Self::FUSE_H_PROG_REQ.bits()
            | Self::FUSE_L_PROG_REQ.bits();
    }
}

impl Flags {
    /// Flags for a new run, keeping only the caller switches.
    pub fn from_user(flags: Flags) -> Flags {
        flags & Flags::USER
    }

    /// The `*_PROG_REQ` flag of a fuse byte.
    pub fn fuse_request(fuse: FuseByte) -> Flags {
        match fuse {
            FuseByte::Extended => Flags::FUSE_X_PROG_REQ,
            FuseByte::High => Flags::FUSE_H_PROG_REQ,
            FuseByte::Low => Flags::FUSE_L_PROG_REQ,
        }
    }

    /// Whether any verification skip switch is set.
    pub fn skips_verification(&self) -> bool {
        self.intersects(Flags::SKIP_VERIFY | Flags::SKIP_VERIFY_FF)
    }
}

impl Default for Flags {
    fn default() -> Self {
        Flags::empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_user_strips_engine_state() {
        let flags = Flags::BATCH
            | Flags::PROG_ENABLED
            | Flags::CHIP_ERASE_REQ
            | Flags::EEP_ERASED;
        assert_eq!(Flags::from_user(flags), Flags::BATCH);
    }

    #[test]
    fn test_user_and_engine_bits_are_disjoint() {
        let engine = Flags::all() - Flags::USER;
        assert!(!engine.is_empty());
        assert!(!engine.intersects(Flags::USER));
        assert!(engine.contains(Flags::FUSES_PROG_REQ));
    }
}
