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

//! # Programming engine
//!
//! [`EngineContext`] holds the whole state of one run: the driver, the image,
//! the run flags and what was read from the controller. Each phase is a
//! method that either does its work or returns the [`Error`] ending the run.
//! Phases that don't apply to the image or the controller return `Ok(())`
//! right away, so the orchestrator calls all of them in a fixed order.
//!
//! Dropping the context leaves programming mode if it was entered.

use std::io;

use crate::{
    constants::*,
    device::{self, Capabilities, DeviceDescriptor, FuseBit, FuseByte},
    error::{Error, Mismatch, Warning},
    flags::Flags,
    fuse,
    image::FirmwareImage,
    transport::{Timing, Transport},
    update::{Frontend, Phase, Question, Report},
    util,
    window::{self, Window},
    Programmer,
};

/// Run flags raised by each controller capability.
const CAPABILITY_FLAGS: [(Capabilities, Flags); 6] = [
    (Capabilities::BOOTBLOCK, Flags::BB_SUPPORT),
    (Capabilities::BOOTBLOCK_BOTTOM, Flags::BB_BOTTOM),
    (Capabilities::EEPROM_EMULATION, Flags::EEEP_SUPPORT),
    (Capabilities::SPM_EXT, Flags::SPM_EXT_SUPPORT),
    (Capabilities::DISABLE_CMD, Flags::DISABLE_CMD),
    (Capabilities::SKIP_ERASED, Flags::SKIP_VERIFY_FF),
];

/// State of one programming run.
pub struct EngineContext<'a, T>
where
    T: Transport,
{
    prog: Programmer<T>,
    image: &'a FirmwareImage,
    frontend: &'a mut dyn Frontend,
    flags: Flags,
    phase: Option<Phase>,
    device: Option<&'static DeviceDescriptor>,
    signature: u32,
    locks: u8,
    fuses: [u8; 3],
    written: [u8; 3],
    code_size: u32,
    pages_written: usize,
    eeprom_written: usize,
    erased: bool,
    warnings: Vec<Warning>,
}

impl<'a, T> EngineContext<'a, T>
where
    T: Transport,
{
    /// Start a run of `image` over `transport`.
    ///
    /// Engine state bits in `flags` are dropped, the sections present in
    /// the image are added.
    pub fn new(
        transport: T,
        image: &'a FirmwareImage,
        flags: Flags,
        frontend: &'a mut dyn Frontend,
    ) -> Self {
        let flags = Flags::from_user(flags) | image.requested();

        let mut prog = Programmer::new(transport);
        prog.set_verbose(flags.contains(Flags::VERBOSE));

        EngineContext {
            prog,
            image,
            frontend,
            flags,
            phase: None,
            device: None,
            signature: 0,
            locks: 0xFF,
            fuses: [0xFF; 3],
            written: [0xFF; 3],
            code_size: image.code_size(),
            pages_written: 0,
            eeprom_written: 0,
            erased: false,
            warnings: Vec::new(),
        }
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// The identified controller, if any.
    pub fn device(&self) -> Option<&'static DeviceDescriptor> {
        self.device
    }

    pub fn programmer(&self) -> &Programmer<T> {
        &self.prog
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Summary of the run so far.
    pub fn report(&self) -> Report {
        Report {
            device: self.device.map_or("", |d| d.name),
            signature: self.signature,
            code_size: self.code_size,
            pages_written: self.pages_written,
            eeprom_bytes_written: self.eeprom_written,
            erased: self.erased,
            warnings: self.warnings.clone(),
        }
    }

    fn silent(&self) -> bool {
        self.flags.contains(Flags::SILENT)
    }

    fn begin(&mut self, phase: Phase) {
        log::debug!("{}", phase);
        self.phase = Some(phase);
        if !self.silent() {
            self.frontend.begin(phase);
        }
    }

    fn passed(&mut self) {
        if let Some(phase) = self.phase.take() {
            if !self.silent() {
                self.frontend.passed(phase);
            }
        }
    }

    fn advance(&mut self, done: u32, total: u32) {
        if !self.silent() {
            self.frontend.advance(u64::from(done), u64::from(total));
        }
    }

    fn warn(&mut self, warning: Warning) {
        log::warn!("{}", warning);
        self.warnings.push(warning);
        self.frontend.warning(warning);
    }

    /// Report `error` as the outcome of the current phase.
    pub fn fail(&mut self, error: &Error) {
        log::debug!("run failed: {}", error);
        if let Some(phase) = self.phase.take() {
            if !self.silent() {
                self.frontend.failed(phase, error);
            }
        }
    }

    fn identified(&self) -> Result<&'static DeviceDescriptor, Error> {
        self.device.ok_or(Error::UnknownDevice(self.signature))
    }

    /// Whether a chip erase wipes the EEPROM, i.e. EESAVE is unprogrammed.
    fn eeprom_unprotected(&self, device: &DeviceDescriptor) -> bool {
        device
            .eesave
            .map_or(false, |bit| self.fuses[bit.byte.index()] & bit.mask != 0)
    }

    fn in_mfg_window(&self, device: &DeviceDescriptor, address: u32) -> bool {
        !self.flags.contains(Flags::MFG_WRITE)
            && address >= device.mfg_start
            && address < device.mfg_start + MFG_EEP_SIZE
    }

    fn skips_page(&self, page: &[u8]) -> bool {
        self.flags.contains(Flags::SKIP_VERIFY_FF) && util::is_erased(page)
    }

    /// Open the transport.
    pub fn connect(&mut self) -> Result<(), Error> {
        self.begin(Phase::ConnectingInterface);
        self.prog
            .transport_mut()
            .connect()
            .map_err(Error::Interface)?;
        self.passed();
        Ok(())
    }

    /// Adopt the SPI edge delay configured in the board controller.
    ///
    /// Never fails, the defaults stay when the controller doesn't answer.
    pub fn check_timing(&mut self) -> Result<(), Error> {
        match self.prog.spi_edge_delay() {
            Ok(Some(edge_delay)) => {
                log::debug!("SPI edge delay {} us", edge_delay);
                let timing = Timing {
                    edge_delay,
                    ..self.prog.timing()
                };
                self.prog.set_timing(timing);
            }
            Ok(None) => log::debug!("SPI timing not reported, keeping defaults"),
            Err(e) => log::warn!("SPI timing query failed: {}", e),
        }
        Ok(())
    }

    /// Compare the compatibility ID of the running firmware with the image.
    pub fn check_compatibility(&mut self) -> Result<(), Error> {
        self.begin(Phase::CheckingCompatibility);

        let image = self.image.cid();
        // A controller that can't report its revision has an unknown CID.
        let running = match self.prog.firmware_cid() {
            Ok(cid) => cid,
            Err(e) => {
                log::warn!("firmware revision query failed: {}", e);
                None
            }
        };
        if let Some(running) = running {
            log::debug!("compatibility ID: controller {}, image {}", running, image);
            if i32::from(running) != image {
                if !self.flags.contains(Flags::CID_OVERRIDE) {
                    return Err(Error::Compatibility { running, image });
                }
                log::warn!("compatibility ID mismatch overridden");
            }
        }

        self.passed();
        Ok(())
    }

    /// Switch the bootloader if requested and enter programming mode.
    pub fn enable_programming(&mut self) -> Result<(), Error> {
        self.begin(Phase::EnteringProgrammingMode);

        self.switch_bootloader()?;
        if self.flags.contains(Flags::BOOTBLOCK_UPDATE) {
            self.request_bootblock_update();
        }

        let prog = &mut self.prog;
        let acked = util::retry(PROG_ENABLE_RETRIES, |attempt| {
            log::debug!("program enable, attempt #{}", attempt + 1);
            prog.program_enable()
                .map(|ok| if ok { Some(()) } else { None })
        })?;

        if acked.is_none() {
            log::debug!("no program enable acknowledge");
            if let Err(e) = self.release_target() {
                log::warn!("couldn't release the controller: {}", e);
            }
            return Err(Error::ProgEnable);
        }

        self.flags |= Flags::PROG_ENABLED;
        self.passed();
        Ok(())
    }

    fn switch_bootloader(&mut self) -> Result<(), Error> {
        let enable = self.flags.contains(Flags::BOOTLOADER_ENABLE);
        if !enable && !self.flags.contains(Flags::BOOTLOADER_DISABLE) {
            return Ok(());
        }

        match self.write_bootloader_bit(enable) {
            Ok(true) => Ok(()),
            Ok(false) => {
                log::debug!("bootloader enable bit didn't stick");
                Err(Error::ProgEnable)
            }
            Err(e) => {
                log::debug!("flags register access failed: {}", e);
                Err(Error::ProgEnable)
            }
        }
    }

    fn write_bootloader_bit(&mut self, enable: bool) -> io::Result<bool> {
        let current = self.prog.read_flags_register()?;
        let value = if enable {
            current | CGBC_FLAGS_1_BLDR_ENABLE
        } else {
            current & !CGBC_FLAGS_1_BLDR_ENABLE
        };
        self.prog.write_flags_register(value)?;

        let readback = self.prog.read_flags_register()?;
        Ok((readback ^ value) & CGBC_FLAGS_1_BLDR_ENABLE == 0)
    }

    fn request_bootblock_update(&mut self) {
        let prog = &mut self.prog;
        let res = prog
            .read_flags_register()
            .and_then(|value| prog.write_flags_register(value | CGBC_FLAGS_1_BB_UPDATE));
        if let Err(e) = res {
            log::warn!("bootblock update request failed: {}", e);
        }
    }

    /// Read the signature and look the controller up.
    pub fn identify(&mut self) -> Result<(), Error> {
        self.begin(Phase::CheckingControllerType);

        self.signature = self.prog.read_signature()?;
        let device =
            device::lookup(self.signature).ok_or(Error::UnknownDevice(self.signature))?;

        let caps = device.capabilities();
        for (cap, flag) in CAPABILITY_FLAGS.iter() {
            if caps.contains(*cap) {
                self.flags |= *flag;
            }
        }
        self.prog
            .set_busy_polling(self.flags.contains(Flags::BB_SUPPORT));
        self.device = Some(device);

        log::info!(
            "found {} (signature {:06X}h, {})",
            device.name,
            self.signature,
            device.family
        );
        self.phase = None;
        if !self.silent() {
            self.frontend.identified(device);
        }
        Ok(())
    }

    /// Check the image against the flash and EEPROM of the controller.
    pub fn check_space(&mut self) -> Result<(), Error> {
        let device = self.identified()?;

        if self.flags.contains(Flags::FLS_PROG_REQ) {
            self.begin(Phase::CheckingFlashSpace);
            if self.code_size > device.flash_size {
                return Err(Error::FlashSpace {
                    code_size: self.code_size,
                    flash_size: device.flash_size,
                });
            }
            self.passed();
        }

        if self.flags.contains(Flags::EEP_PROG_REQ) {
            self.begin(Phase::CheckingEepromSpace);
            let required = self
                .image
                .eeprom()
                .iter()
                .map(|e| e.address + 1)
                .max()
                .unwrap_or(0);
            if required > device.eeprom_size {
                return Err(Error::EepromSpace {
                    required,
                    eeprom_size: device.eeprom_size,
                });
            }
            self.passed();
        }

        Ok(())
    }

    /// Read locks and fuses, decide on the chip erase and protect the
    /// EEPROM from it.
    pub fn check_locks_and_fuses(&mut self) -> Result<(), Error> {
        let device = self.identified()?;
        self.begin(Phase::CheckingLocksAndFuses);

        self.locks = self.prog.read_locks()?;
        for fuse in FuseByte::ALL.iter().copied() {
            self.fuses[fuse.index()] = self.prog.read_fuse(fuse)?;
        }
        log::debug!(
            "locks {:02X}h, fuses X {:02X}h H {:02X}h L {:02X}h",
            self.locks,
            self.fuses[0],
            self.fuses[1],
            self.fuses[2]
        );
        self.passed();

        let lock_bits = self.image.lock_bits();
        if !self.flags.contains(Flags::FLS_PROG_REQ) && self.locks & lock_bits == self.locks {
            log::debug!("no chip erase needed");
            return Ok(());
        }
        self.flags |= Flags::CHIP_ERASE_REQ;

        let eesave = match device.eesave {
            Some(bit) => bit,
            None => return Ok(()),
        };
        if !self.eeprom_unprotected(device) || self.flags.contains(Flags::EEP_ERASE) {
            return Ok(());
        }

        log::warn!("EESAVE is not programmed, the chip erase destroys the EEPROM");
        let batch = self.flags.contains(Flags::BATCH);
        let mode = device.lock_mode;

        if self.locks & mode.mask != mode.prog_enabled {
            let answer = if batch {
                None
            } else {
                self.frontend.confirm(Question::ContinueWithoutEesave)
            };
            match answer {
                Some(true) => Ok(()),
                Some(false) => Err(Error::Aborted),
                None => Err(Error::BadFuses),
            }
        } else {
            let answer = if batch {
                None
            } else {
                self.frontend.confirm(Question::PreserveEeprom)
            };
            match answer {
                Some(true) => self.set_eesave(eesave),
                Some(false) => Ok(()),
                None => Err(Error::BadFuses),
            }
        }
    }

    fn set_eesave(&mut self, bit: FuseBit) -> Result<(), Error> {
        self.begin(Phase::ProgrammingEesave);

        let index = bit.byte.index();
        self.prog.write_fuse(bit.byte, self.fuses[index] & !bit.mask)?;
        if !self.prog.wait_ready(MAX_FUSE_PROG_TIME)? {
            return Err(Error::SetEesave);
        }

        self.fuses[index] = self.prog.read_fuse(bit.byte)?;
        if self.fuses[index] & bit.mask != 0 {
            return Err(Error::SetEesave);
        }

        self.passed();
        Ok(())
    }

    fn clear_eesave(&mut self, bit: FuseBit) -> Result<(), Error> {
        self.begin(Phase::ResettingEesave);

        let index = bit.byte.index();
        self.prog.write_fuse(bit.byte, self.fuses[index] | bit.mask)?;
        if !self.prog.wait_ready(MAX_FUSE_PROG_TIME)? {
            return Err(Error::ClearEesave);
        }

        self.fuses[index] = self.prog.read_fuse(bit.byte)?;
        if self.fuses[index] & bit.mask == 0 {
            return Err(Error::ClearEesave);
        }

        self.passed();
        Ok(())
    }

    /// Erase the chip if the lock and fuse check asked for it.
    pub fn erase_chip(&mut self) -> Result<(), Error> {
        if !self.flags.contains(Flags::CHIP_ERASE_REQ) {
            return Ok(());
        }

        let device = self.identified()?;
        if self.eeprom_unprotected(device) {
            self.flags |= Flags::EEP_ERASED;
            self.begin(Phase::ErasingFlashAndEeprom);
        } else {
            self.begin(Phase::ErasingFlash);
        }

        self.prog.chip_erase()?;
        if !self.prog.wait_ready(MAX_ERASE_TIME)? {
            return Err(Error::Erase);
        }
        // Chip erase clears the lock bits.
        self.locks = 0xFF;
        self.erased = true;

        self.passed();
        Ok(())
    }

    /// Erase the EEPROM on request even though EESAVE preserves it.
    pub fn erase_eeprom(&mut self) -> Result<(), Error> {
        let device = self.identified()?;
        let bit = match device.eesave {
            Some(bit) => bit,
            None => return Ok(()),
        };
        if !self.flags.contains(Flags::EEP_ERASE) || self.eeprom_unprotected(device) {
            return Ok(());
        }

        match self.clear_eesave(bit) {
            Ok(()) => self.erase_chip(),
            // The EEPROM erase as a whole failed.
            Err(Error::ClearEesave) => Err(Error::Erase),
            Err(e) => Err(e),
        }
    }

    /// Check that an erase which included the EEPROM left it blank.
    pub fn verify_eeprom_clean(&mut self) -> Result<(), Error> {
        if !self.flags.contains(Flags::EEP_ERASED) || self.flags.skips_verification() {
            return Ok(());
        }

        let device = self.identified()?;
        self.begin(Phase::VerifyingCleanEeprom);

        for address in 0..device.eeprom_size {
            let found = self.prog.read_eeprom(address)?;
            if found != 0xFF {
                return Err(Error::EepromNotClean(Mismatch::Byte {
                    offset: address,
                    expected: 0xFF,
                    found,
                }));
            }
            self.advance(address + 1, device.eeprom_size);
        }

        self.passed();
        Ok(())
    }

    /// Page size of the block protocol, if the controller offers it.
    fn block_page_size(&mut self) -> Result<Option<u32>, Error> {
        if !self.flags.contains(Flags::SPM_EXT_SUPPORT) {
            return Ok(None);
        }

        let (state, page_size) = self.prog.flash_status()?;
        if state == SPM_EXT_FLS_ERR
            || page_size < SPM_EXT_BLOCK_SIZE as u32
            || !page_size.is_power_of_two()
            || page_size as usize > MAX_FLS_SIZE
        {
            log::debug!(
                "block protocol unavailable (state {:02X}h, page size {}), using page writes",
                state,
                page_size
            );
            return Ok(None);
        }

        Ok(Some(page_size))
    }

    /// Program the flash, skipping erased pages.
    pub fn program_flash(&mut self) -> Result<(), Error> {
        if !self.flags.contains(Flags::FLS_PROG_REQ) {
            return Ok(());
        }

        if let Some(page_size) = self.block_page_size()? {
            return self.program_flash_blocks(page_size);
        }

        let page_size = self.identified()?.flash_page_size;
        let code_size = self.code_size;
        let image = self.image;
        self.begin(Phase::ProgrammingFlash);

        for offset in (0..code_size).step_by(page_size as usize) {
            let page = page_at(image, offset, page_size);
            if !util::is_erased(page) {
                self.prog.write_flash_page(offset, page)?;
                if !self.prog.wait_ready(MAX_FLS_PROG_TIME)? {
                    return Err(Error::ProgramFlash { offset });
                }
                self.pages_written += 1;
            }
            self.advance((offset + page_size).min(code_size), code_size);
        }

        self.passed();
        Ok(())
    }

    fn program_flash_blocks(&mut self, page_size: u32) -> Result<(), Error> {
        let code_size = self.code_size;
        let image = self.image;
        self.begin(Phase::ProgrammingFlash);

        let mut addressed = false;
        let mut offset = 0;
        while offset < code_size {
            let page = page_at(image, offset, page_size);
            if self.skips_page(page) {
                addressed = false;
            } else {
                if !addressed {
                    if !self.prog.set_flash_address(offset)? {
                        return Err(Error::ProgramFlash { offset });
                    }
                    addressed = true;
                }
                for block in page.chunks(SPM_EXT_BLOCK_SIZE) {
                    if !self.prog.write_block(block)? {
                        return Err(Error::ProgramFlash { offset });
                    }
                }
                self.pages_written += 1;
            }
            offset += page_size;
            self.advance(offset.min(code_size), code_size);
        }

        self.wait_flash_idle(code_size)?;
        self.passed();
        Ok(())
    }

    fn wait_flash_idle(&mut self, offset: u32) -> Result<(), Error> {
        for _ in 0..MAX_FLS_STAT_POLLS {
            match self.prog.flash_status()?.0 {
                SPM_EXT_FLS_IDL => return Ok(()),
                SPM_EXT_FLS_BSY => self.prog.sleep_ms(1),
                state => {
                    log::debug!("flash controller state {:02X}h", state);
                    return Err(Error::ProgramFlash { offset });
                }
            }
        }

        log::debug!("flash controller still busy");
        Err(Error::ProgramFlash { offset })
    }

    /// Write the EEPROM entries, leaving the manufacturing window alone.
    pub fn program_eeprom(&mut self) -> Result<(), Error> {
        if !self.flags.contains(Flags::EEP_PROG_REQ) {
            return Ok(());
        }

        let device = self.identified()?;
        let image = self.image;
        let entries = image.eeprom();
        let total = entries.len() as u32;
        self.begin(Phase::ProgrammingEeprom);

        for (i, entry) in entries.iter().enumerate() {
            if self.in_mfg_window(device, entry.address) {
                log::trace!("EEPROM {:04X}h holds manufacturing data", entry.address);
            } else {
                self.prog.write_eeprom(entry.address, entry.value)?;
                if !self.prog.wait_ready(MAX_EEP_PROG_TIME)? {
                    return Err(Error::ProgramEeprom {
                        address: entry.address,
                    });
                }
                self.eeprom_written += 1;
            }
            self.advance(i as u32 + 1, total);
        }

        self.passed();
        Ok(())
    }

    /// Apply the fuse masks of the image through the safety net.
    pub fn program_fuses(&mut self) -> Result<(), Error> {
        if !self.flags.intersects(Flags::FUSES_PROG_REQ) {
            return Ok(());
        }

        let device = self.identified()?;
        self.begin(Phase::ProgrammingFuses);

        let mut ignored = false;
        for fuse in FuseByte::ALL.iter().copied() {
            if !self.flags.contains(Flags::fuse_request(fuse)) {
                continue;
            }

            let current = self.prog.read_fuse(fuse)?;
            let requested = self.image.fuse_masks(fuse).apply(current);
            let (value, replaced) = fuse::protect(device, fuse, requested, self.flags);
            ignored |= replaced;

            log::debug!("fuse {}: {:02X}h -> {:02X}h", fuse, current, value);
            self.prog.write_fuse(fuse, value)?;
            if !self.prog.wait_ready(MAX_FUSE_PROG_TIME)? {
                return Err(Error::WriteFuse(fuse));
            }
            self.written[fuse.index()] = value;
        }

        self.passed();
        if ignored {
            self.warn(Warning::FuseSettingsIgnored);
        }
        Ok(())
    }

    /// Compare the flash inside the verification window with the image.
    pub fn verify_flash(&mut self) -> Result<(), Error> {
        if !self.flags.contains(Flags::FLS_PROG_REQ) || self.flags.contains(Flags::SKIP_VERIFY) {
            return Ok(());
        }

        let device = self.identified()?;
        let block_page = self.block_page_size()?;
        self.begin(Phase::VerifyingFlash);

        let image = self.image;
        let flash = &image.flash()[..device.flash_size as usize];
        let flags = self.flags;
        let prog = &mut self.prog;
        let window =
            window::resolve(flash, device.flash_size, flags, |word| prog.read_flash_word(word))?;
        log::info!("verifying FLASH {}", window);

        match block_page {
            Some(page_size) => self.verify_flash_blocks(window, page_size)?,
            None => self.verify_flash_words(window)?,
        }

        self.passed();
        Ok(())
    }

    fn verify_flash_words(&mut self, window: Window) -> Result<(), Error> {
        let image = self.image;
        let flash = image.flash();
        let skip_erased = self.flags.contains(Flags::SKIP_VERIFY_FF);
        let total = window.end - window.start;

        for offset in (window.start..window.end).step_by(2) {
            let at = |i: u32| flash.get(i as usize).copied().unwrap_or(0xFF);
            let expected = u16::from_le_bytes([at(offset), at(offset + 1)]);

            if !(skip_erased && expected == 0xFFFF) {
                let found = self.prog.read_flash_word(offset / 2)?;
                if found != expected {
                    return Err(Error::VerifyFlash(Mismatch::Word {
                        offset,
                        expected,
                        found,
                    }));
                }
            }

            let done = offset - window.start;
            if done % 256 == 0 {
                self.advance(done, total);
            }
        }

        self.advance(total, total);
        Ok(())
    }

    fn verify_flash_blocks(&mut self, window: Window, page_size: u32) -> Result<(), Error> {
        let image = self.image;
        let total = window.end - window.start;
        let mut block = [0u8; SPM_EXT_BLOCK_SIZE];

        let mut addressed = false;
        let mut offset = window.start;
        while offset < window.end {
            let page = page_at(image, offset, page_size);
            if self.skips_page(page) {
                addressed = false;
            } else {
                if !addressed {
                    if !self.prog.set_flash_address(offset)? {
                        return Err(Error::ProgramFlash { offset });
                    }
                    addressed = true;
                }

                for (i, expected) in page.chunks(SPM_EXT_BLOCK_SIZE).enumerate() {
                    let at = offset + (i * SPM_EXT_BLOCK_SIZE) as u32;
                    if !self.prog.read_block(&mut block)? {
                        return Err(Error::VerifyFlash(Mismatch::ReadFailed { offset: at }));
                    }

                    let diff = expected.iter().zip(block.iter()).position(|(e, f)| e != f);
                    if let Some(j) = diff {
                        return Err(Error::VerifyFlash(Mismatch::Byte {
                            offset: at + j as u32,
                            expected: expected[j],
                            found: block[j],
                        }));
                    }
                }
            }

            offset += page_size;
            self.advance((offset - window.start).min(total), total);
        }

        Ok(())
    }

    /// Read back the EEPROM entries that were written.
    pub fn verify_eeprom(&mut self) -> Result<(), Error> {
        if !self.flags.contains(Flags::EEP_PROG_REQ) || self.flags.contains(Flags::SKIP_VERIFY) {
            return Ok(());
        }

        let device = self.identified()?;
        let image = self.image;
        let entries = image.eeprom();
        let total = entries.len() as u32;
        let skip_erased = self.flags.contains(Flags::SKIP_VERIFY_FF | Flags::EEP_ERASED);
        self.begin(Phase::VerifyingEeprom);

        for (i, entry) in entries.iter().enumerate() {
            let skipped = self.in_mfg_window(device, entry.address)
                || (skip_erased && entry.value == 0xFF);
            if !skipped {
                let found = self.prog.read_eeprom(entry.address)?;
                if found != entry.value {
                    return Err(Error::VerifyEeprom(Mismatch::Byte {
                        offset: entry.address,
                        expected: entry.value,
                        found,
                    }));
                }
            }
            self.advance(i as u32 + 1, total);
        }

        self.passed();
        Ok(())
    }

    /// Read back the fuse bytes that were written.
    pub fn verify_fuses(&mut self) -> Result<(), Error> {
        if !self.flags.intersects(Flags::FUSES_PROG_REQ) || self.flags.contains(Flags::SKIP_VERIFY) {
            return Ok(());
        }

        self.begin(Phase::VerifyingFuses);

        for fuse in FuseByte::ALL.iter().copied() {
            if !self.flags.contains(Flags::fuse_request(fuse)) {
                continue;
            }

            let found = self.prog.read_fuse(fuse)?;
            let expected = self.written[fuse.index()];
            self.fuses[fuse.index()] = found;
            if found != expected {
                return Err(Error::VerifyFuses(Mismatch::Fuse {
                    fuse,
                    expected,
                    found,
                }));
            }
        }

        self.passed();
        Ok(())
    }

    pub fn program_locks(&mut self) -> Result<(), Error> {
        if !self.flags.contains(Flags::LOCKS_PROG_REQ) {
            return Ok(());
        }

        self.begin(Phase::ProgrammingLocks);
        self.prog.write_locks(self.image.lock_bits())?;
        if !self.prog.wait_ready(MAX_FUSE_PROG_TIME)? {
            return Err(Error::WriteLocks);
        }

        self.passed();
        Ok(())
    }

    /// Read back the lock bits and warn if they leave the firmware readable.
    pub fn verify_locks(&mut self) -> Result<(), Error> {
        let device = self.identified()?;

        if self.flags.contains(Flags::LOCKS_PROG_REQ) {
            self.begin(Phase::VerifyingLocks);
            let expected = self.image.lock_bits();
            self.locks = self.prog.read_locks()?;
            if self.locks != expected {
                return Err(Error::VerifyLocks(Mismatch::Locks {
                    expected,
                    found: self.locks,
                }));
            }
            self.passed();
        }

        let mode = device.lock_mode;
        if self.locks & mode.mask != mode.prog_disabled {
            self.warn(Warning::FirmwareUnprotected);
        }
        Ok(())
    }

    /// Leave programming mode and let the controller restart its firmware.
    ///
    /// Does nothing unless programming mode was entered. Failures are
    /// logged, there is nothing left to do about them.
    pub fn cleanup(&mut self) {
        if !self.flags.contains(Flags::PROG_ENABLED) {
            return;
        }
        self.flags.remove(Flags::PROG_ENABLED);

        if self.flags.contains(Flags::DISABLE_CMD) {
            if let Err(e) = self.prog.program_disable() {
                log::warn!("program disable failed: {}", e);
            }
        }
        if let Err(e) = self.release_target() {
            log::warn!("couldn't release the controller: {}", e);
        }
    }

    fn release_target(&mut self) -> io::Result<()> {
        self.prog.init_bus()?;
        self.prog.sleep_ms(RELEASE_DELAY_MS);
        let status = self.prog.post_end()?;
        log::trace!("post end: {:?}", status);
        Ok(())
    }
}

impl<'a, T> Drop for EngineContext<'a, T>
where
    T: Transport,
{
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn page_at(image: &FirmwareImage, offset: u32, size: u32) -> &[u8] {
    let flash = image.flash();
    let start = (offset as usize).min(flash.len());
    let end = (offset as usize + size as usize).min(flash.len());
    &flash[start..end]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{sim::SimulatedBoard, update::NullFrontend};

    fn new_board(name: &str) -> SimulatedBoard {
        SimulatedBoard::new(device::by_name(name).unwrap())
    }

    #[test]
    fn test_timing_from_controller() {
        let image = FirmwareImage::new().unwrap();
        let mut board = new_board("ATmega48");
        board.set_edge_delay(7);

        let mut frontend = NullFrontend;
        let mut ctx = EngineContext::new(&mut board, &image, Flags::BATCH, &mut frontend);
        ctx.check_timing().unwrap();
        assert_eq!(ctx.programmer().timing().edge_delay, 7);
        assert_eq!(ctx.programmer().timing().byte_delay, DEFAULT_BYTE_DELAY);
    }

    #[test]
    fn test_caller_cannot_set_engine_state() {
        let image = FirmwareImage::new().unwrap();
        let mut board = new_board("ATmega48");

        let mut frontend = NullFrontend;
        let ctx = EngineContext::new(
            &mut board,
            &image,
            Flags::BATCH | Flags::PROG_ENABLED | Flags::CHIP_ERASE_REQ,
            &mut frontend,
        );
        assert_eq!(ctx.flags(), Flags::BATCH);
    }

    #[test]
    fn test_identify_sets_capability_flags() {
        let image = FirmwareImage::new().unwrap();

        let mut board = new_board("MEC1704KSZ");
        let mut frontend = NullFrontend;
        let mut ctx = EngineContext::new(&mut board, &image, Flags::BATCH, &mut frontend);
        ctx.enable_programming().unwrap();
        ctx.identify().unwrap();
        assert_eq!(ctx.device().map(|d| d.name), Some("MEC1704KSZ"));
        assert!(ctx.flags().contains(
            Flags::SPM_EXT_SUPPORT | Flags::DISABLE_CMD | Flags::SKIP_VERIFY_FF
        ));
        assert!(!ctx.flags().contains(Flags::BB_SUPPORT));
        drop(ctx);

        let mut board = new_board("STM32F100R8");
        let mut ctx = EngineContext::new(&mut board, &image, Flags::BATCH, &mut frontend);
        ctx.enable_programming().unwrap();
        ctx.identify().unwrap();
        assert!(ctx
            .flags()
            .contains(Flags::BB_SUPPORT | Flags::BB_BOTTOM | Flags::EEEP_SUPPORT));
        assert!(!ctx.flags().contains(Flags::SPM_EXT_SUPPORT));
    }

    #[test]
    fn test_drop_leaves_programming_mode() {
        let image = FirmwareImage::new().unwrap();
        let mut board = new_board("MEC1701HSZ");

        let mut frontend = NullFrontend;
        let mut ctx = EngineContext::new(&mut board, &image, Flags::BATCH, &mut frontend);
        ctx.enable_programming().unwrap();
        ctx.identify().unwrap();
        drop(ctx);

        assert_eq!(board.disable_count(), 1);
        assert_eq!(board.post_end_count(), 1);
        assert!(!board.is_programming());
    }

    #[test]
    fn test_cleanup_runs_once() {
        let image = FirmwareImage::new().unwrap();
        let mut board = new_board("ATmega48");

        let mut frontend = NullFrontend;
        let mut ctx = EngineContext::new(&mut board, &image, Flags::BATCH, &mut frontend);
        ctx.enable_programming().unwrap();
        ctx.cleanup();
        ctx.cleanup();
        drop(ctx);

        assert_eq!(board.post_end_count(), 1);
        assert_eq!(board.disable_count(), 0);
    }

    #[test]
    fn test_matching_locks_need_no_erase() {
        let mut image = FirmwareImage::new().unwrap();
        image.set_lock_bits(0xFC);

        let mut board = new_board("ATmega88");
        board.set_locks(0xFC);
        let mut frontend = NullFrontend;
        let mut ctx = EngineContext::new(&mut board, &image, Flags::BATCH, &mut frontend);
        ctx.enable_programming().unwrap();
        ctx.identify().unwrap();
        ctx.check_locks_and_fuses().unwrap();
        assert!(!ctx.flags().contains(Flags::CHIP_ERASE_REQ));

        ctx.erase_chip().unwrap();
        assert!(!ctx.report().erased);
    }

    #[test]
    fn test_new_lock_bits_need_erase() {
        let mut image = FirmwareImage::new().unwrap();
        image.set_lock_bits(0xFC);

        let mut board = new_board("ATmega88");
        let mut frontend = NullFrontend;
        let mut ctx = EngineContext::new(&mut board, &image, Flags::BATCH, &mut frontend);
        ctx.enable_programming().unwrap();
        ctx.identify().unwrap();
        ctx.check_locks_and_fuses().unwrap();
        assert!(ctx.flags().contains(Flags::CHIP_ERASE_REQ));
    }

    #[test]
    fn test_eeprom_erase_clears_eesave() {
        let mut image = FirmwareImage::new().unwrap();
        image.write_flash(0, &[0x00; 64]).unwrap();

        let mut board = new_board("ATmega168");
        board.load_eeprom(0x10, &[0x42]);
        let mut frontend = NullFrontend;
        let mut ctx = EngineContext::new(
            &mut board,
            &image,
            Flags::BATCH | Flags::EEP_ERASE,
            &mut frontend,
        );
        ctx.enable_programming().unwrap();
        ctx.identify().unwrap();
        ctx.check_locks_and_fuses().unwrap();
        ctx.erase_chip().unwrap();
        assert!(!ctx.flags().contains(Flags::EEP_ERASED));
        ctx.erase_eeprom().unwrap();
        assert!(ctx.flags().contains(Flags::EEP_ERASED));
        ctx.verify_eeprom_clean().unwrap();
        drop(ctx);

        assert_eq!(board.erase_count(), 2);
        assert_eq!(board.fuse(FuseByte::High) & 0x08, 0x08);
        assert_eq!(board.eeprom()[0x10], 0xFF);
    }

    #[test]
    fn test_eeprom_erase_fails_when_eesave_sticks() {
        let mut image = FirmwareImage::new().unwrap();
        image.write_flash(0, &[0x00; 64]).unwrap();

        let mut board = new_board("ATmega168");
        board.set_fuse_writes_ignored(true);
        let mut frontend = NullFrontend;
        let mut ctx = EngineContext::new(
            &mut board,
            &image,
            Flags::BATCH | Flags::EEP_ERASE,
            &mut frontend,
        );
        ctx.enable_programming().unwrap();
        ctx.identify().unwrap();
        ctx.check_locks_and_fuses().unwrap();
        ctx.erase_chip().unwrap();

        let err = ctx.erase_eeprom().unwrap_err();
        assert!(matches!(err, Error::Erase));
        assert_eq!(err.code(), 64);
        drop(ctx);

        assert_eq!(board.erase_count(), 1);
        assert_eq!(board.fuse(FuseByte::High) & 0x08, 0x00);
    }

    fn stm32_image() -> FirmwareImage {
        let mut image = FirmwareImage::new().unwrap();
        // Bootblock marker ending at 128, application right above.
        image.write_flash(122, b"BS100").unwrap();
        image.write_flash(128, &[0x42; 128]).unwrap();
        image
    }

    #[test]
    fn test_bottom_bootblock_not_verified() {
        let image = stm32_image();

        let mut board = new_board("STM32F100R8");
        board.load_flash(0, &[0x00; 128]);
        board.load_flash(128, &[0x42; 128]);

        let mut frontend = NullFrontend;
        let mut ctx = EngineContext::new(&mut board, &image, Flags::BATCH, &mut frontend);
        ctx.enable_programming().unwrap();
        ctx.identify().unwrap();
        ctx.verify_flash().unwrap();
    }

    #[test]
    fn test_bootblock_update_verifies_bootblock() {
        let image = stm32_image();

        let mut board = new_board("STM32F100R8");
        board.load_flash(0, &[0x00; 128]);
        board.load_flash(128, &[0x42; 128]);

        let mut frontend = NullFrontend;
        let mut ctx = EngineContext::new(
            &mut board,
            &image,
            Flags::BATCH | Flags::BOOTBLOCK_UPDATE,
            &mut frontend,
        );
        ctx.enable_programming().unwrap();
        ctx.identify().unwrap();
        let err = ctx.verify_flash().unwrap_err();
        assert!(matches!(
            err,
            Error::VerifyFlash(Mismatch::Word {
                offset: 0,
                expected: 0xFFFF,
                found: 0x0000
            })
        ));
    }

    #[test]
    fn test_block_verify_reports_first_difference() {
        let mut image = FirmwareImage::new().unwrap();
        image.write_flash(0x300, &[0x5A; 64]).unwrap();

        let mut board = new_board("MEC1706QSZ");
        board.load_flash(0x300, &[0x5A; 64]);
        board.load_flash(0x321, &[0x00]);

        let mut frontend = NullFrontend;
        let mut ctx = EngineContext::new(&mut board, &image, Flags::BATCH, &mut frontend);
        ctx.enable_programming().unwrap();
        ctx.identify().unwrap();
        let err = ctx.verify_flash().unwrap_err();
        assert!(matches!(
            err,
            Error::VerifyFlash(Mismatch::Byte {
                offset: 0x321,
                expected: 0x5A,
                found: 0x00
            })
        ));
    }

    #[test]
    fn test_fuse_verify_uses_written_value() {
        let mut image = FirmwareImage::new().unwrap();
        image.set_fuse_masks(
            FuseByte::Extended,
            crate::image::FuseMasks { and: 0xF9, or: 0x00 },
        );

        let mut board = new_board("ATmega168");
        let mut frontend = NullFrontend;
        let mut ctx = EngineContext::new(&mut board, &image, Flags::BATCH, &mut frontend);
        ctx.enable_programming().unwrap();
        ctx.identify().unwrap();
        ctx.program_fuses().unwrap();
        ctx.verify_fuses().unwrap();
        assert!(ctx.warnings().is_empty());
        drop(ctx);

        assert_eq!(board.fuse_writes(), &[(FuseByte::Extended, 0xF9)]);
    }
}
