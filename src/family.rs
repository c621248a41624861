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

use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use crate::device::Capabilities;

/// Silicon family of a board controller.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Family {
    /// ATmega48/88/168/328 microcontrollers, programmed in real ISP mode.
    AvrX8,
    /// ATmega165P/325P microcontrollers with a bootblock emulating ISP.
    AvrX5P,
    /// STM32 value line controllers.
    Stm32,
    /// Tiva embedded controllers.
    Tiva,
    /// MEC170x embedded controllers.
    Mec170x,
}

impl Family {
    /// Whether a bootblock emulates the serial programming protocol, in
    /// which case external reset and ISP pins are not needed for updates.
    #[inline]
    pub fn supports_bootblock(&self) -> bool {
        matches!(*self, Family::AvrX5P | Family::Stm32 | Family::Tiva)
    }

    /// Whether the bootblock lives at the bottom of the flash.
    ///
    /// - **Note:** only meaningful if [`Family::supports_bootblock`].
    #[inline]
    pub fn bootblock_at_bottom(&self) -> bool {
        matches!(*self, Family::Stm32 | Family::Tiva)
    }

    /// Whether the EEPROM is emulated inside the flash array.
    #[inline]
    pub fn supports_eeprom_emulation(&self) -> bool {
        matches!(*self, Family::Stm32 | Family::Tiva)
    }

    /// Whether the block oriented flash commands are available.
    #[inline]
    pub fn supports_spm_ext(&self) -> bool {
        matches!(*self, Family::Mec170x)
    }

    /// Whether leaving programming mode needs an explicit disable command.
    #[inline]
    pub fn needs_disable_command(&self) -> bool {
        matches!(*self, Family::Mec170x)
    }

    /// Whether erased flash is never compared nor written.
    #[inline]
    pub fn skips_erased_flash(&self) -> bool {
        matches!(*self, Family::Mec170x)
    }

    pub fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::empty();
        caps.set(Capabilities::BOOTBLOCK, self.supports_bootblock());
        caps.set(
            Capabilities::BOOTBLOCK_BOTTOM,
            self.supports_bootblock() && self.bootblock_at_bottom(),
        );
        caps.set(
            Capabilities::EEPROM_EMULATION,
            self.supports_eeprom_emulation(),
        );
        caps.set(Capabilities::SPM_EXT, self.supports_spm_ext());
        caps.set(Capabilities::DISABLE_CMD, self.needs_disable_command());
        caps.set(Capabilities::SKIP_ERASED, self.skips_erased_flash());
        caps
    }
}

impl Display for Family {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Family::AvrX8 => "avr-x8",
            Family::AvrX5P => "avr-x5p",
            Family::Stm32 => "stm32",
            Family::Tiva => "tiva",
            Family::Mec170x => "mec170x",
        };
        fmt.write_str(name)
    }
}

#[derive(Debug)]
pub struct ParseFamilyError;

impl Display for ParseFamilyError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "invalid value, family must be one of: `avr-x8`, `avr-x5p`, `stm32`, `tiva` or `mec170x`")
    }
}

impl Error for ParseFamilyError {}

impl FromStr for Family {
    type Err = ParseFamilyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avr-x8" | "AVR-X8" => Ok(Family::AvrX8),
            "avr-x5p" | "AVR-X5P" => Ok(Family::AvrX5P),
            "stm32" | "STM32" => Ok(Family::Stm32),
            "tiva" | "TIVA" => Ok(Family::Tiva),
            "mec170x" | "MEC170X" => Ok(Family::Mec170x),
            _ => Err(ParseFamilyError),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        for family in &[
            Family::AvrX8,
            Family::AvrX5P,
            Family::Stm32,
            Family::Tiva,
            Family::Mec170x,
        ] {
            assert_eq!(family.to_string().parse::<Family>().unwrap(), *family);
        }
        assert!("cc26x2".parse::<Family>().is_err());
    }

    #[test]
    fn test_capabilities() {
        assert!(Family::AvrX8.capabilities().is_empty());
        assert_eq!(Family::AvrX5P.capabilities(), Capabilities::BOOTBLOCK);
        assert_eq!(
            Family::Stm32.capabilities(),
            Capabilities::BOOTBLOCK
                | Capabilities::BOOTBLOCK_BOTTOM
                | Capabilities::EEPROM_EMULATION
        );
        assert_eq!(
            Family::Mec170x.capabilities(),
            Capabilities::SPM_EXT
                | Capabilities::DISABLE_CMD
                | Capabilities::SKIP_ERASED
        );
    }
}
