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

//! Command words of the serial programming protocol emulated by the board
//! controller, plus the board controller commands used around it.

// 32-bit serial programming instructions. Operands are OR'ed in by the
// caller, addresses are shifted into bits 23..8.
pub const SPM_PROG_ENABLE: u32           = 0xAC53_0000;
pub const SPM_PROG_ENABLE_OKAY_MSK: u32  = 0x0000_FF00;
pub const SPM_PROG_ENABLE_OKAY: u32      = 0x0000_5300;
pub const SPM_PROG_DISABLE: u32          = 0x0000_0000;
pub const SPM_CHIP_ERASE: u32            = 0xAC80_0000;
pub const SPM_POLL_RDY_BUSY: u32         = 0xF000_0000;
pub const SPM_BUSY: u32                  = 0x0000_0001;

pub const SPM_LD_EXT_ADDR: u32           = 0x4D00_0000;
pub const SPM_LD_PROG_MEM_PAGE_LO: u32   = 0x4000_0000;
pub const SPM_LD_PROG_MEM_PAGE_HI: u32   = 0x4800_0000;
pub const SPM_WR_PROG_MEM_PAGE: u32      = 0x4C00_0000;
pub const SPM_RD_PROG_MEM_LO: u32        = 0x2000_0000;
pub const SPM_RD_PROG_MEM_HI: u32        = 0x2800_0000;

pub const SPM_RD_EEPROM: u32             = 0xA000_0000;
pub const SPM_WR_EEPROM: u32             = 0xC000_0000;

pub const SPM_RD_LOCK_BITS: u32          = 0x5800_0000;
pub const SPM_WR_LOCK_BITS: u32          = 0xACE0_00C0;
pub const SPM_LOCK_BITS_MSK: u32         = 0x0000_00FF;

pub const SPM_RD_SIGNATURE_BYTE: u32     = 0x3000_0000;

pub const SPM_WR_FUSE_BITS_LO: u32       = 0xACA0_0000;
pub const SPM_WR_FUSE_BITS_HI: u32       = 0xACA8_0000;
pub const SPM_WR_FUSE_BITS_EX: u32       = 0xACA4_0000;
pub const SPM_RD_FUSE_BITS_LO: u32       = 0x5000_0000;
pub const SPM_RD_FUSE_BITS_HI: u32       = 0x5808_0000;
pub const SPM_RD_FUSE_BITS_EX: u32       = 0x5008_0000;

// Board controller commands.
pub const CGBC_CMD_GET_FW_REV: u8        = 0x21;
pub const CGBC_CMD_SYS_FLAGS_1: u8       = 0x2B;
pub const CGBC_CMD_SPI_TIMING: u8        = 0x32;
pub const CGBC_CMD_AVR_SPM_EXT: u8       = 0x9F;

/// "POST end" bit of the system flags 1 register.
pub const CGBC_SYS_POST_END: u8          = 0x04;

// Sub-commands of `CGBC_CMD_AVR_SPM_EXT`.
pub const SPM_EXT_FLS_ADDR: u8           = 0x00;
pub const SPM_EXT_FLS_STAT: u8           = 0x01;
pub const SPM_EXT_FLS_RD32: u8           = 0x02;
pub const SPM_EXT_FLS_WR32: u8           = 0x03;

// Flash controller states reported by `SPM_EXT_FLS_STAT`.
pub const SPM_EXT_FLS_IDL: u8            = 0x00;
pub const SPM_EXT_FLS_BSY: u8            = 0x01;
pub const SPM_EXT_FLS_ERR: u8            = 0x02;

/// Bytes moved by one `SPM_EXT_FLS_RD32`/`SPM_EXT_FLS_WR32` command.
pub const SPM_EXT_BLOCK_SIZE: usize      = 32;

// Board controller status byte.
pub const CGBC_STAT_MSK: u8              = 0xC0;
pub const CGBC_RDY_STAT: u8              = 0x40;
pub const CGBC_DAT_PENDING: u8           = 0x20;
pub const CGBC_DAT_CNT_MSK: u8           = 0x1F;

// Board controller flags register on its internal I2C bus.
pub const CGBC_I2C_ADDR: u8              = 0xC0;
pub const CGBC_FLAGS_1_REG: u8           = 0x05;
pub const CGBC_FLAGS_1_BLDR_ENABLE: u8   = 0x08;
pub const CGBC_FLAGS_1_BB_UPDATE: u8     = 0x80;

/// Default clock edge delay, in microseconds.
pub const DEFAULT_EDGE_DELAY: u32        = 15;
/// Default delay between bytes, in microseconds.
pub const DEFAULT_BYTE_DELAY: u32        = 0;

// Worst case operation times, in milliseconds, for devices without busy
// polling.
pub const MAX_ERASE_TIME: u64            = 90;
pub const MAX_FLS_PROG_TIME: u64         = 50;
pub const MAX_EEP_PROG_TIME: u64         = 90;
pub const MAX_FUSE_PROG_TIME: u64        = 50;

/// Busy polls, one per millisecond, before a busy device is a fault.
pub const MAX_BUSY_POLLS: u32            = 1999;
/// Polls of the fast path flash controller before it is a fault.
pub const MAX_FLS_STAT_POLLS: u32        = 2000;

/// Program enable attempts.
pub const PROG_ENABLE_RETRIES: usize     = 4;
/// Settle time after releasing the bus, before the POST end signal.
pub const RELEASE_DELAY_MS: u64          = 1000;

/// Largest flash of all supported devices.
pub const MAX_FLS_SIZE: usize            = 2 * 1024 * 1024;
/// Largest EEPROM of all supported devices.
pub const MAX_EEP_SIZE: u32              = 2 * 1024;
/// Maximum EEPROM entries of one image.
pub const MAX_EEP_ENTRIES: usize         = 2 * 1024;
/// Size of the manufacturing data window in EEPROM.
pub const MFG_EEP_SIZE: u32              = 64;
