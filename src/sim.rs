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

//! # Simulated board controller
//!
//! In-memory board controller answering the serial programming protocol and
//! the board controller commands like the real firmware does. Flash writes
//! can only clear bits, a chip erase restores them. Delays are accounted but
//! never slept.

use std::{io, time::Duration};

use crate::{
    constants::*,
    device::{DeviceDescriptor, FuseByte},
    family::Family,
    transport::{Status, Timing, Transport},
};

/// Status of a rejected board controller command.
const CGBC_ERR_STAT: u8 = 0x80;

/// In-memory [`Transport`] for a [`DeviceDescriptor`].
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    device: &'static DeviceDescriptor,
    signature: u32,
    flash: Vec<u8>,
    eeprom: Vec<u8>,
    fuses: [u8; 3],
    locks: u8,
    page_buffer: Vec<u8>,
    ext_addr: u32,
    shift: [u8; 4],
    shifted: usize,
    prog_mode: bool,
    busy: u32,
    busy_polls: u32,
    stuck_busy: bool,
    unresponsive: bool,
    enable_failures: usize,
    fast_addr: u32,
    fast_busy: u32,
    fast_error: bool,
    edge_delay: Option<u32>,
    cid: Option<u8>,
    flags_register: u8,
    bootloader_switch: bool,
    fuses_frozen: bool,
    elapsed: Duration,
    // Recorded activity.
    exchanges: Vec<(u32, u32)>,
    page_writes: Vec<u32>,
    block_writes: Vec<u32>,
    eeprom_writes: Vec<u32>,
    fuse_writes: Vec<(FuseByte, u8)>,
    lock_writes: Vec<u8>,
    erases: usize,
    disables: usize,
    post_ends: usize,
}

impl SimulatedBoard {
    /// A blank controller with the factory fuses of its family.
    pub fn new(device: &'static DeviceDescriptor) -> Self {
        let fuses = match device.family {
            Family::AvrX8 | Family::AvrX5P => [0xFF, 0xD7, 0xE2],
            _ => [0xFF, 0xFE, 0xFF],
        };

        SimulatedBoard {
            device,
            signature: device.signature,
            flash: vec![0xFF; device.flash_size as usize],
            eeprom: vec![0xFF; device.eeprom_size as usize],
            fuses,
            locks: 0xFF,
            page_buffer: vec![0xFF; device.flash_page_size as usize],
            ext_addr: 0,
            shift: [0; 4],
            shifted: 0,
            prog_mode: false,
            busy: 0,
            busy_polls: 1,
            stuck_busy: false,
            unresponsive: false,
            enable_failures: 0,
            fast_addr: 0,
            fast_busy: 0,
            fast_error: false,
            edge_delay: Some(DEFAULT_EDGE_DELAY),
            cid: None,
            flags_register: 0,
            bootloader_switch: true,
            fuses_frozen: false,
            elapsed: Duration::from_secs(0),
            exchanges: Vec::new(),
            page_writes: Vec::new(),
            block_writes: Vec::new(),
            eeprom_writes: Vec::new(),
            fuse_writes: Vec::new(),
            lock_writes: Vec::new(),
            erases: 0,
            disables: 0,
            post_ends: 0,
        }
    }

    pub fn device(&self) -> &'static DeviceDescriptor {
        self.device
    }

    /// Report another signature than the device's.
    pub fn set_signature(&mut self, signature: u32) {
        self.signature = signature;
    }

    pub fn set_fuse(&mut self, fuse: FuseByte, value: u8) {
        self.fuses[fuse.index()] = value;
    }

    pub fn set_locks(&mut self, locks: u8) {
        self.locks = locks;
    }

    /// Compatibility ID reported by the running firmware.
    pub fn set_cid(&mut self, cid: Option<u8>) {
        self.cid = cid;
    }

    pub fn set_edge_delay(&mut self, edge_delay: u32) {
        self.edge_delay = Some(edge_delay);
    }

    /// Answer every ISP byte with 0xFF.
    pub fn set_unresponsive(&mut self, unresponsive: bool) {
        self.unresponsive = unresponsive;
    }

    /// Reject the next `count` program enable handshakes.
    pub fn fail_program_enable(&mut self, count: usize) {
        self.enable_failures = count;
    }

    /// Never finish a write.
    pub fn set_stuck_busy(&mut self, stuck: bool) {
        self.stuck_busy = stuck;
    }

    /// Busy polls answered as busy after each write.
    pub fn set_busy_polls(&mut self, polls: u32) {
        self.busy_polls = polls;
    }

    /// Make the block protocol flash controller report an error.
    pub fn set_flash_controller_error(&mut self, error: bool) {
        self.fast_error = error;
    }

    /// Whether the firmware honors the bootloader enable bit.
    pub fn set_bootloader_switch_supported(&mut self, supported: bool) {
        self.bootloader_switch = supported;
    }

    /// Accept fuse writes without changing the fuses.
    pub fn set_fuse_writes_ignored(&mut self, ignored: bool) {
        self.fuses_frozen = ignored;
    }

    /// Preload flash contents, bypassing the protocol.
    pub fn load_flash(&mut self, offset: usize, data: &[u8]) {
        self.flash[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Preload EEPROM contents, bypassing the protocol.
    pub fn load_eeprom(&mut self, offset: usize, data: &[u8]) {
        self.eeprom[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    pub fn eeprom(&self) -> &[u8] {
        &self.eeprom
    }

    pub fn fuse(&self, fuse: FuseByte) -> u8 {
        self.fuses[fuse.index()]
    }

    pub fn locks(&self) -> u8 {
        self.locks
    }

    pub fn flags_register(&self) -> u8 {
        self.flags_register
    }

    pub fn is_programming(&self) -> bool {
        self.prog_mode
    }

    /// Every ISP exchange as `(command, response)`.
    pub fn exchanges(&self) -> &[(u32, u32)] {
        &self.exchanges
    }

    /// Byte address of every committed flash page.
    pub fn page_writes(&self) -> &[u32] {
        &self.page_writes
    }

    /// Byte address of every block written through the block protocol.
    pub fn block_writes(&self) -> &[u32] {
        &self.block_writes
    }

    pub fn eeprom_writes(&self) -> &[u32] {
        &self.eeprom_writes
    }

    pub fn fuse_writes(&self) -> &[(FuseByte, u8)] {
        &self.fuse_writes
    }

    pub fn lock_writes(&self) -> &[u8] {
        &self.lock_writes
    }

    pub fn erase_count(&self) -> usize {
        self.erases
    }

    pub fn disable_count(&self) -> usize {
        self.disables
    }

    pub fn post_end_count(&self) -> usize {
        self.post_ends
    }

    /// Total time spent in [`Transport::sleep`].
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    fn eesave_preserves(&self) -> bool {
        match self.device.eesave {
            Some(bit) => self.fuses[bit.byte.index()] & bit.mask == 0,
            None => false,
        }
    }

    fn start_write(&mut self) {
        self.busy = self.busy_polls;
    }

    fn chip_erase(&mut self) {
        self.flash.iter_mut().for_each(|b| *b = 0xFF);
        if !self.eesave_preserves() {
            self.eeprom.iter_mut().for_each(|b| *b = 0xFF);
        }
        self.locks = 0xFF;
        self.erases += 1;
        self.start_write();
    }

    fn commit_page(&mut self, word_address: u32) {
        let page_size = self.device.flash_page_size as usize;
        let base = (word_address as usize * 2) & !(page_size - 1);
        if base + page_size <= self.flash.len() {
            for (dst, src) in self.flash[base..base + page_size]
                .iter_mut()
                .zip(self.page_buffer.iter())
            {
                *dst &= *src;
            }
            self.page_writes.push(base as u32);
        }
        self.page_buffer.iter_mut().for_each(|b| *b = 0xFF);
        self.start_write();
    }

    fn flash_byte(&self, address: usize) -> u8 {
        self.flash.get(address).copied().unwrap_or(0xFF)
    }

    /// Execute a complete ISP command word, returning the last response byte.
    fn execute(&mut self, cmd: u32) -> u8 {
        let [c0, c1, c2, c3] = cmd.to_be_bytes();
        let address = (cmd >> 8) & 0xFFFF;

        if c0 == 0xAC && c1 == 0x53 {
            if self.enable_failures > 0 {
                self.enable_failures -= 1;
            } else {
                self.prog_mode = true;
            }
            return c2;
        }
        if !self.prog_mode {
            return 0x00;
        }

        match (c0, c1) {
            (0x00, _) if cmd == SPM_PROG_DISABLE => {
                self.prog_mode = false;
                self.disables += 1;
                0x00
            }
            (0xAC, 0x80) => {
                self.chip_erase();
                0x00
            }
            (0xAC, 0xE0) => {
                self.locks &= c3;
                self.lock_writes.push(c3);
                self.start_write();
                0x00
            }
            (0xAC, 0xA0) | (0xAC, 0xA8) | (0xAC, 0xA4) => {
                let fuse = match c1 {
                    0xA0 => FuseByte::Low,
                    0xA8 => FuseByte::High,
                    _ => FuseByte::Extended,
                };
                if !self.fuses_frozen {
                    self.fuses[fuse.index()] = c3;
                }
                self.fuse_writes.push((fuse, c3));
                self.start_write();
                0x00
            }
            (0xF0, _) => {
                if self.stuck_busy {
                    1
                } else if self.busy > 0 {
                    self.busy -= 1;
                    1
                } else {
                    0
                }
            }
            (0x4D, _) => {
                self.ext_addr = u32::from(c2);
                0x00
            }
            (0x40, _) | (0x48, _) => {
                let i = usize::from(c2) * 2 + if c0 == 0x48 { 1 } else { 0 };
                if let Some(b) = self.page_buffer.get_mut(i) {
                    *b = c3;
                }
                0x00
            }
            (0x4C, _) => {
                self.commit_page((self.ext_addr << 16) | address);
                0x00
            }
            (0x20, _) | (0x28, _) => {
                let word = ((self.ext_addr << 16) | address) as usize;
                self.flash_byte(word * 2 + if c0 == 0x28 { 1 } else { 0 })
            }
            (0xA0, _) => self.eeprom.get(address as usize).copied().unwrap_or(0xFF),
            (0xC0, _) => {
                if let Some(b) = self.eeprom.get_mut(address as usize) {
                    *b = c3;
                }
                self.eeprom_writes.push(address);
                self.start_write();
                0x00
            }
            (0x30, _) => {
                let index = u32::from(c2 & 0x03);
                (self.signature >> (index * 8)) as u8
            }
            (0x58, 0x00) => self.locks,
            (0x58, 0x08) => self.fuses[FuseByte::High.index()],
            (0x50, 0x00) => self.fuses[FuseByte::Low.index()],
            (0x50, 0x08) => self.fuses[FuseByte::Extended.index()],
            _ => {
                log::trace!("simulator: unknown command {:08X}", cmd);
                0x00
            }
        }
    }

    fn block_command(&mut self, write: &[u8], read: &mut [u8]) -> Status {
        if !self.device.family.supports_spm_ext() || write.len() < 2 {
            return Status(CGBC_ERR_STAT);
        }

        match write[1] {
            SPM_EXT_FLS_ADDR if write.len() == 6 => {
                self.fast_addr =
                    u32::from_le_bytes([write[2], write[3], write[4], write[5]]);
                Status::ready(0)
            }
            SPM_EXT_FLS_STAT if read.len() >= 5 => {
                let state = if self.fast_error {
                    SPM_EXT_FLS_ERR
                } else if self.fast_busy > 0 {
                    self.fast_busy -= 1;
                    SPM_EXT_FLS_BSY
                } else {
                    SPM_EXT_FLS_IDL
                };
                read[0] = state;
                read[1..5].copy_from_slice(&self.device.flash_page_size.to_le_bytes());
                Status::ready(5)
            }
            SPM_EXT_FLS_RD32 if read.len() >= SPM_EXT_BLOCK_SIZE => {
                let base = self.fast_addr as usize;
                for (i, b) in read[..SPM_EXT_BLOCK_SIZE].iter_mut().enumerate() {
                    *b = self.flash_byte(base + i);
                }
                self.fast_addr += SPM_EXT_BLOCK_SIZE as u32;
                Status::ready(SPM_EXT_BLOCK_SIZE)
            }
            SPM_EXT_FLS_WR32 if write.len() == SPM_EXT_BLOCK_SIZE + 2 => {
                let base = self.fast_addr as usize;
                if base + SPM_EXT_BLOCK_SIZE > self.flash.len() {
                    return Status(CGBC_ERR_STAT);
                }
                for (dst, src) in self.flash[base..base + SPM_EXT_BLOCK_SIZE]
                    .iter_mut()
                    .zip(write[2..].iter())
                {
                    *dst &= *src;
                }
                self.block_writes.push(self.fast_addr);
                self.fast_addr += SPM_EXT_BLOCK_SIZE as u32;
                self.fast_busy = self.busy_polls;
                Status::ready(0)
            }
            _ => Status(CGBC_ERR_STAT),
        }
    }
}

impl Transport for SimulatedBoard {
    fn set_select(&mut self, _high: bool) -> io::Result<()> {
        self.shifted = 0;
        Ok(())
    }

    fn set_reset(&mut self, high: bool) -> io::Result<()> {
        if !high {
            self.prog_mode = false;
        }
        Ok(())
    }

    fn transfer_byte(&mut self, value: u8, _timing: Timing) -> io::Result<u8> {
        let index = self.shifted;
        self.shift[index] = value;
        self.shifted = (index + 1) % 4;

        // The target echoes the previous byte while a command is shifted in.
        let out = match index {
            0 => 0x00,
            1 => self.shift[0],
            2 if self.shift[..2] == [0xAC, 0x53] && self.enable_failures > 0 => 0x00,
            2 => self.shift[1],
            _ => {
                let cmd = u32::from_be_bytes(self.shift);
                if self.unresponsive {
                    self.exchanges.push((cmd, 0xFFFF_FFFF));
                    return Ok(0xFF);
                }
                let rejected = self.shift[..2] == [0xAC, 0x53] && self.enable_failures > 0;
                let echo = [self.shift[0], if rejected { 0x00 } else { self.shift[1] }];
                let result = self.execute(cmd);
                let response = u32::from_be_bytes([0x00, echo[0], echo[1], result]);
                self.exchanges.push((cmd, response));
                result
            }
        };

        Ok(if self.unresponsive { 0xFF } else { out })
    }

    fn command(&mut self, write: &[u8], read: &mut [u8]) -> io::Result<Status> {
        let status = match write.first().copied() {
            Some(CGBC_CMD_SPI_TIMING) => match self.edge_delay {
                Some(edge) if read.len() >= 2 => {
                    read[0] = (edge << 4) as u8;
                    read[1] = 0x00;
                    Status::ready(2)
                }
                _ => Status(CGBC_ERR_STAT),
            },
            Some(CGBC_CMD_GET_FW_REV) if read.len() >= 4 => {
                read[..3].copy_from_slice(b"X10");
                match self.cid {
                    Some(cid) => {
                        read[3] = cid;
                        Status::ready(4)
                    }
                    None => Status::ready(2),
                }
            }
            Some(CGBC_CMD_SYS_FLAGS_1) if write.get(2) == Some(&CGBC_SYS_POST_END) => {
                self.post_ends += 1;
                if let Some(b) = read.first_mut() {
                    *b = 0x00;
                }
                Status::ready(1)
            }
            Some(CGBC_CMD_AVR_SPM_EXT) => self.block_command(write, read),
            _ => Status(CGBC_ERR_STAT),
        };

        log::trace!("simulator: command {:02X?} -> {:?}", write, status);
        Ok(status)
    }

    fn read_register(&mut self, address: u8, register: u8) -> io::Result<u8> {
        if (address, register) != (CGBC_I2C_ADDR, CGBC_FLAGS_1_REG) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no register {:#04X} at {:#04X}", register, address),
            ));
        }

        Ok(self.flags_register)
    }

    fn write_register(
        &mut self,
        address: u8,
        register: u8,
        value: u8,
    ) -> io::Result<()> {
        if (address, register) != (CGBC_I2C_ADDR, CGBC_FLAGS_1_REG) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no register {:#04X} at {:#04X}", register, address),
            ));
        }

        self.flags_register = if self.bootloader_switch {
            value
        } else {
            (value & !CGBC_FLAGS_1_BLDR_ENABLE)
                | (self.flags_register & CGBC_FLAGS_1_BLDR_ENABLE)
        };
        Ok(())
    }

    fn sleep(&mut self, duration: Duration) {
        self.elapsed += duration;
    }
}
