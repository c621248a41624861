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

//! # Board controller programming library
//!
//! In-system programmer for the board controllers found on embedded
//! computer modules. The board controller is updated through the serial
//! programming protocol of its microcontroller, either in real ISP mode or
//! emulated by a bootblock, which the host drives through a [`Transport`].
//!
//! # Supported controllers
//!
//! - ATmega48/88/168/328 and ATmega165P/325P.
//! - STM32F100R8 and TM4E1231H6ZRB, with the bootblock emulating ISP.
//! - MEC170x, using the block oriented flash commands.
//!
//! See [`device::DEVICES`] for the full table.
//!
//! # Example
//!
//! ```no_run
//! use bcprog::{sim::SimulatedBoard, update, Flags, NullFrontend};
//!
//! let board = SimulatedBoard::new(bcprog::device::by_name("ATmega48").unwrap());
//! let report = update(board, "cgbcp.dat", Flags::BATCH, &mut NullFrontend)?;
//! println!("updated {}", report.device);
//! # Ok::<(), bcprog::Error>(())
//! ```

use std::{io, time::Duration};

#[rustfmt::skip]
pub mod constants;
pub mod device;
pub mod image;
pub mod sim;
pub mod util;

mod engine;
mod error;
mod family;
mod flags;
mod fuse;
mod transport;
mod update;
mod window;

pub use self::{
    engine::EngineContext,
    error::{DataError, Error, ErrorClass, Mismatch, Warning},
    family::{Family, ParseFamilyError},
    flags::Flags,
    image::FirmwareImage,
    transport::{Status, Timing, Transport},
    update::{
        update, update_image, Frontend, NullFrontend, Phase, Question, Report,
    },
};

use self::{constants::*, device::FuseByte};

/// Cached extended address that no flash access uses.
const NO_EXT_ADDR: u32 = u32::MAX;

/// Serial programming driver over a [`Transport`].
///
/// Every method is a single protocol step. Sequencing, retries and error
/// mapping live in the engine.
pub struct Programmer<T> {
    transport: T,
    timing: Timing,
    ext_addr: u32,
    poll_busy: bool,
    verbose: bool,
}

impl<T> Programmer<T>
where
    T: Transport,
{
    /// Create a new `Programmer` with default timing.
    pub fn new(transport: T) -> Self {
        Programmer {
            transport,
            timing: Timing::default(),
            ext_addr: NO_EXT_ADDR,
            poll_busy: false,
            verbose: false,
        }
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn set_timing(&mut self, timing: Timing) {
        self.timing = timing;
    }

    /// Poll the busy flag instead of waiting a fixed time.
    ///
    /// Only bootblock emulated ISP reports a live busy flag.
    pub fn set_busy_polling(&mut self, enabled: bool) {
        self.poll_busy = enabled;
    }

    /// Log exchanges at debug level instead of trace.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    pub fn sleep_ms(&mut self, ms: u64) {
        self.transport.sleep(Duration::from_millis(ms));
    }

    /// Exchange one command word.
    pub fn xfer(&mut self, cmd: u32) -> io::Result<u32> {
        let res = self.transport.exchange32(cmd, self.timing)?;
        if self.verbose {
            log::debug!("{:08X} {:08X}", cmd, res);
        } else {
            log::trace!("{:08X} {:08X}", cmd, res);
        }
        Ok(res)
    }

    /// Pull select and reset low.
    pub fn init_bus(&mut self) -> io::Result<()> {
        self.transport.set_select(false)?;
        self.transport.set_reset(false)
    }

    /// Release the reset line.
    pub fn release_reset(&mut self) -> io::Result<()> {
        self.transport.set_reset(true)
    }

    /// One program enable handshake, `true` if the target acknowledged.
    pub fn program_enable(&mut self) -> io::Result<bool> {
        // The target forgets the extended address across a reset.
        self.ext_addr = NO_EXT_ADDR;
        self.init_bus()?;
        self.sleep_ms(1);
        self.release_reset()?;
        self.sleep_ms(21);

        let res = self.xfer(SPM_PROG_ENABLE)?;
        Ok(res & SPM_PROG_ENABLE_OKAY_MSK == SPM_PROG_ENABLE_OKAY)
    }

    pub fn program_disable(&mut self) -> io::Result<()> {
        self.xfer(SPM_PROG_DISABLE).map(|_| ())
    }

    /// Signal the board controller that the update cycle is over.
    pub fn post_end(&mut self) -> io::Result<Status> {
        let write = [CGBC_CMD_SYS_FLAGS_1, 0xFF, CGBC_SYS_POST_END];
        let mut read = [0u8; 1];
        self.transport.command(&write, &mut read)
    }

    /// Read the 24-bit device signature.
    pub fn read_signature(&mut self) -> io::Result<u32> {
        let mut signature = 0u32;
        for index in (0..3u32).rev() {
            let res = self.xfer(SPM_RD_SIGNATURE_BYTE | (index << 8))?;
            signature |= (res & 0xFF) << (index * 8);
        }
        Ok(signature)
    }

    /// Wait for the last write to finish, `false` if the device stayed busy.
    pub fn wait_ready(&mut self, max_time_ms: u64) -> io::Result<bool> {
        if !self.poll_busy {
            self.sleep_ms(max_time_ms);
            return Ok(true);
        }

        for _ in 0..MAX_BUSY_POLLS {
            self.sleep_ms(1);
            if self.xfer(SPM_POLL_RDY_BUSY)? & SPM_BUSY == 0 {
                return Ok(true);
            }
        }

        log::debug!("device still busy after {} polls", MAX_BUSY_POLLS);
        Ok(false)
    }

    pub fn chip_erase(&mut self) -> io::Result<()> {
        self.xfer(SPM_CHIP_ERASE).map(|_| ())
    }

    pub fn read_locks(&mut self) -> io::Result<u8> {
        Ok((self.xfer(SPM_RD_LOCK_BITS)? & SPM_LOCK_BITS_MSK) as u8)
    }

    pub fn write_locks(&mut self, locks: u8) -> io::Result<()> {
        self.xfer(SPM_WR_LOCK_BITS | u32::from(locks)).map(|_| ())
    }

    pub fn read_fuse(&mut self, fuse: FuseByte) -> io::Result<u8> {
        let cmd = match fuse {
            FuseByte::Extended => SPM_RD_FUSE_BITS_EX,
            FuseByte::High => SPM_RD_FUSE_BITS_HI,
            FuseByte::Low => SPM_RD_FUSE_BITS_LO,
        };
        Ok(self.xfer(cmd)? as u8)
    }

    pub fn write_fuse(&mut self, fuse: FuseByte, value: u8) -> io::Result<()> {
        let cmd = match fuse {
            FuseByte::Extended => SPM_WR_FUSE_BITS_EX,
            FuseByte::High => SPM_WR_FUSE_BITS_HI,
            FuseByte::Low => SPM_WR_FUSE_BITS_LO,
        };
        self.xfer(cmd | u32::from(value)).map(|_| ())
    }

    pub fn read_eeprom(&mut self, address: u32) -> io::Result<u8> {
        Ok(self.xfer(SPM_RD_EEPROM | (address << 8))? as u8)
    }

    pub fn write_eeprom(&mut self, address: u32, value: u8) -> io::Result<()> {
        self.xfer(SPM_WR_EEPROM | (address << 8) | u32::from(value))
            .map(|_| ())
    }

    fn load_ext_addr(&mut self, ext: u32) -> io::Result<()> {
        if self.ext_addr != ext {
            self.ext_addr = ext;
            self.xfer(SPM_LD_EXT_ADDR | (ext << 8))?;
        }
        Ok(())
    }

    /// Fill the page buffer with `page` and commit it at byte `address`.
    ///
    /// The caller waits for the commit with [`Programmer::wait_ready`].
    pub fn write_flash_page(&mut self, address: u32, page: &[u8]) -> io::Result<()> {
        for (i, word) in page.chunks(2).enumerate() {
            let i = (i as u32) << 8;
            self.xfer(SPM_LD_PROG_MEM_PAGE_LO | i | u32::from(word[0]))?;
            let hi = word.get(1).copied().unwrap_or(0xFF);
            self.xfer(SPM_LD_PROG_MEM_PAGE_HI | i | u32::from(hi))?;
        }

        self.load_ext_addr(address >> 17)?;
        self.xfer(SPM_WR_PROG_MEM_PAGE | (((address >> 1) & 0xFFFF) << 8))?;
        Ok(())
    }

    /// Read the flash word at word address `word_address`.
    pub fn read_flash_word(&mut self, word_address: u32) -> io::Result<u16> {
        self.load_ext_addr(word_address >> 16)?;
        let address = (word_address & 0xFFFF) << 8;
        let lo = self.xfer(SPM_RD_PROG_MEM_LO | address)? & 0xFF;
        let hi = self.xfer(SPM_RD_PROG_MEM_HI | address)? & 0xFF;
        Ok((lo | (hi << 8)) as u16)
    }

    /// Query the SPI edge delay configured in the board controller.
    pub fn spi_edge_delay(&mut self) -> io::Result<Option<u32>> {
        let mut read = [0u8; 2];
        let status = self.transport.command(&[CGBC_CMD_SPI_TIMING], &mut read)?;
        Ok(match status.data_count() {
            Some(n) if n >= 1 => Some(u32::from(read[0] >> 4)),
            _ => None,
        })
    }

    /// Query the compatibility ID of the running firmware.
    pub fn firmware_cid(&mut self) -> io::Result<Option<u8>> {
        let mut read = [0u8; 4];
        let status = self.transport.command(&[CGBC_CMD_GET_FW_REV], &mut read)?;
        Ok(match status.data_count() {
            Some(n) if n >= 3 => Some(read[3]),
            _ => None,
        })
    }

    pub fn read_flags_register(&mut self) -> io::Result<u8> {
        self.transport.read_register(CGBC_I2C_ADDR, CGBC_FLAGS_1_REG)
    }

    pub fn write_flags_register(&mut self, value: u8) -> io::Result<()> {
        self.transport
            .write_register(CGBC_I2C_ADDR, CGBC_FLAGS_1_REG, value)
    }

    /// Flash controller state and page size of the block protocol.
    ///
    /// Reports [`SPM_EXT_FLS_ERR`] when the query itself fails.
    pub fn flash_status(&mut self) -> io::Result<(u8, u32)> {
        let mut read = [0u8; 5];
        let status = self
            .transport
            .command(&[CGBC_CMD_AVR_SPM_EXT, SPM_EXT_FLS_STAT], &mut read)?;
        if status.data_count() != Some(4) {
            return Ok((SPM_EXT_FLS_ERR, 0));
        }

        let page_size = u32::from_le_bytes([read[1], read[2], read[3], read[4]]);
        Ok((read[0], page_size))
    }

    /// Set the flash address of the block protocol, `false` if rejected.
    pub fn set_flash_address(&mut self, address: u32) -> io::Result<bool> {
        let mut write = [0u8; 6];
        write[0] = CGBC_CMD_AVR_SPM_EXT;
        write[1] = SPM_EXT_FLS_ADDR;
        write[2..].copy_from_slice(&address.to_le_bytes());
        let status = self.transport.command(&write, &mut [])?;
        log::trace!("flash address {:#X}: {:?}", address, status);
        Ok(status.is_ready())
    }

    /// Write one block at the current flash address, which then advances.
    pub fn write_block(&mut self, block: &[u8]) -> io::Result<bool> {
        if block.len() > SPM_EXT_BLOCK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block of {} bytes, at most {} allowed", block.len(), SPM_EXT_BLOCK_SIZE),
            ));
        }

        let mut write = [0xFFu8; SPM_EXT_BLOCK_SIZE + 2];
        write[0] = CGBC_CMD_AVR_SPM_EXT;
        write[1] = SPM_EXT_FLS_WR32;
        write[2..2 + block.len()].copy_from_slice(block);
        let status = self.transport.command(&write, &mut [])?;
        Ok(status.is_ready())
    }

    /// Read one block at the current flash address, which then advances.
    pub fn read_block(&mut self, block: &mut [u8]) -> io::Result<bool> {
        if block.len() != SPM_EXT_BLOCK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block of {} bytes, {} required", block.len(), SPM_EXT_BLOCK_SIZE),
            ));
        }

        let status = self
            .transport
            .command(&[CGBC_CMD_AVR_SPM_EXT, SPM_EXT_FLS_RD32], block)?;
        Ok(status.data_count() == Some((SPM_EXT_BLOCK_SIZE - 1) as u8))
    }
}
