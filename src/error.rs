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

//! Result types of a programming run.

use std::{fmt, io, path::PathBuf};

use thiserror::Error;

use crate::device::FuseByte;

/// Errors of a programming run.
///
/// Every variant maps to a stable numeric code, see [`Error::code`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("program aborted")]
    Aborted,
    #[error("file I/O error on {}", display_path(.path))]
    File {
        path: Option<PathBuf>,
        #[source]
        source: io::Error,
    },
    #[error("memory allocation error")]
    Allocation,
    #[error("invalid data in {} (line {line}): {kind}", display_name(.file))]
    Data {
        file: Option<String>,
        line: usize,
        kind: DataError,
    },
    #[error("system interface error")]
    Interface(#[source] io::Error),
    #[error("incompatible data file (controller CID {running}, file CID {image})")]
    Compatibility { running: u8, image: i32 },
    #[error("device programming error (programming mode not entered)")]
    ProgEnable,
    #[error("unknown controller type (signature {0:06X}h)")]
    UnknownDevice(u32),
    #[error("EEPROM is unprotected")]
    BadFuses,
    #[error("device programming error (EESAVE fuse not set)")]
    SetEesave,
    #[error("device programming error (chip erase)")]
    Erase,
    #[error("device programming error (EESAVE fuse not cleared)")]
    ClearEesave,
    #[error("verification failed ({0})")]
    EepromNotClean(Mismatch),
    #[error("program code exceeds FLASH space ({code_size} > {flash_size} bytes)")]
    FlashSpace { code_size: u32, flash_size: u32 },
    #[error("device programming error (FLASH page {offset:08X}h)")]
    ProgramFlash { offset: u32 },
    #[error("program data exceeds EEPROM space ({required} > {eeprom_size} bytes)")]
    EepromSpace { required: u32, eeprom_size: u32 },
    #[error("device programming error (EEPROM address {address:04X}h)")]
    ProgramEeprom { address: u32 },
    #[error("device programming error (fuse byte {0})")]
    WriteFuse(FuseByte),
    #[error("verification failed ({0})")]
    VerifyFlash(Mismatch),
    #[error("verification failed ({0})")]
    VerifyEeprom(Mismatch),
    #[error("verification failed ({0})")]
    VerifyFuses(Mismatch),
    #[error("device programming error (lock bits)")]
    WriteLocks,
    #[error("verification failed ({0})")]
    VerifyLocks(Mismatch),
    #[error("transport error")]
    Transport(#[from] io::Error),
}

/// Reason of an [`Error::Data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("line is neither a tag nor a record")]
    Syntax,
    #[error("malformed record")]
    Record,
    #[error("checksum mismatch")]
    Checksum,
    #[error("unsupported record type {0:02X}h")]
    RecordType(u8),
    #[error("data record outside of a known section")]
    NoSection,
    #[error("fuse and lock records need one byte at address 0")]
    FuseRecordShape,
    #[error("program code exceeds FLASH space")]
    FlashSize,
    #[error("program data exceeds EEPROM space")]
    EepromSize,
}

/// Classification of [`Error`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad image file, nothing was sent to the hardware.
    Input,
    /// Wrong or unknown controller.
    Identification,
    /// The hardware didn't behave, the device state is unknown.
    Protocol,
    /// The device was written but the read back differs.
    Verification,
    /// The user declined to continue.
    Aborted,
}

impl Error {
    /// Numeric error code, compatible with the exit codes of the DOS and
    /// Windows programming tools.
    pub fn code(&self) -> i32 {
        match self {
            Error::Aborted => 1,
            Error::File { .. } => 5,
            Error::Allocation => 8,
            Error::Data { kind, .. } => match kind {
                DataError::FlashSize => 15,
                DataError::EepromSize => 16,
                _ => 14,
            },
            Error::Interface(_) => 20,
            Error::Compatibility { .. } => 23,
            Error::ProgEnable => 26,
            Error::UnknownDevice(_) => 29,
            Error::BadFuses => 57,
            Error::SetEesave => 60,
            Error::Erase => 64,
            Error::ClearEesave => 67,
            Error::EepromNotClean(_) => 70,
            Error::FlashSpace { .. } => 73,
            Error::ProgramFlash { .. } => 76,
            Error::EepromSpace { .. } => 79,
            Error::ProgramEeprom { .. } => 82,
            Error::WriteFuse(FuseByte::Extended) => 85,
            Error::WriteFuse(FuseByte::High) => 86,
            Error::WriteFuse(FuseByte::Low) => 87,
            Error::VerifyFlash(_) => 91,
            Error::VerifyEeprom(_) => 94,
            Error::VerifyFuses(_) => 97,
            Error::WriteLocks => 100,
            Error::VerifyLocks(_) => 103,
            Error::Transport(_) => 106,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Aborted => ErrorClass::Aborted,
            Error::File { .. }
            | Error::Allocation
            | Error::Data { .. }
            | Error::FlashSpace { .. }
            | Error::EepromSpace { .. } => ErrorClass::Input,
            Error::Compatibility { .. } | Error::UnknownDevice(_) => {
                ErrorClass::Identification
            }
            Error::EepromNotClean(_)
            | Error::VerifyFlash(_)
            | Error::VerifyEeprom(_)
            | Error::VerifyFuses(_)
            | Error::VerifyLocks(_) => ErrorClass::Verification,
            _ => ErrorClass::Protocol,
        }
    }

    /// Whether the device was written but couldn't be confirmed.
    pub fn is_verification(&self) -> bool {
        self.class() == ErrorClass::Verification
    }
}

/// Read back differs from what was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mismatch {
    Byte { offset: u32, expected: u8, found: u8 },
    Word { offset: u32, expected: u16, found: u16 },
    Fuse { fuse: FuseByte, expected: u8, found: u8 },
    Locks { expected: u8, found: u8 },
    /// A flash page couldn't be read back at all.
    ReadFailed { offset: u32 },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Mismatch::Byte { offset, expected, found } if offset > 0xFFFF => {
                write!(
                    f,
                    "offset: {:08X}h  expected: {:02X}h  found: {:02X}h",
                    offset, expected, found
                )
            }
            Mismatch::Byte { offset, expected, found } => write!(
                f,
                "offset: {:04X}h  expected: {:02X}h  found: {:02X}h",
                offset, expected, found
            ),
            Mismatch::Word { offset, expected, found } => write!(
                f,
                "offset: {:04X}h  expected: {:04X}h  found: {:04X}h",
                offset, expected, found
            ),
            Mismatch::Fuse { fuse, expected, found } => write!(
                f,
                "fuses: {}  expected: {:02X}h  found: {:02X}h",
                fuse, expected, found
            ),
            Mismatch::Locks { expected, found } => {
                write!(f, "expected: {:02X}h  found: {:02X}h", expected, found)
            }
            Mismatch::ReadFailed { offset } => {
                write!(f, "flash page read error at {:08X}h", offset)
            }
        }
    }
}

/// Advisory results, they don't fail a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Warning {
    /// The fuse safety net replaced some requested fuse bits.
    FuseSettingsIgnored,
    /// The lock bits leave the firmware readable.
    FirmwareUnprotected,
}

impl Warning {
    pub fn code(&self) -> i32 {
        match self {
            Warning::FuseSettingsIgnored => 89,
            Warning::FirmwareUnprotected => 105,
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::FuseSettingsIgnored => {
                write!(f, "Some fuse settings were ignored.")
            }
            Warning::FirmwareUnprotected => {
                write!(f, "The controller firmware is unprotected.")
            }
        }
    }
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => p.display().to_string(),
        None => String::from("<stream>"),
    }
}

fn display_name(name: &Option<String>) -> &str {
    name.as_deref().unwrap_or("<stream>")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mismatch_display() {
        let m = Mismatch::Word {
            offset: 0x10,
            expected: 0x1234,
            found: 0xFFFF,
        };
        assert_eq!(
            m.to_string(),
            "offset: 0010h  expected: 1234h  found: FFFFh"
        );

        let m = Mismatch::Byte {
            offset: 0x0001_0000,
            expected: 0x00,
            found: 0x01,
        };
        assert_eq!(
            m.to_string(),
            "offset: 00010000h  expected: 00h  found: 01h"
        );

        let m = Mismatch::Fuse {
            fuse: FuseByte::High,
            expected: 0xD7,
            found: 0xDF,
        };
        assert_eq!(m.to_string(), "fuses: H  expected: D7h  found: DFh");
    }

    #[test]
    fn test_classes() {
        assert_eq!(Error::Aborted.class(), ErrorClass::Aborted);
        assert_eq!(Error::UnknownDevice(0).class(), ErrorClass::Identification);
        assert_eq!(Error::ProgEnable.class(), ErrorClass::Protocol);
        assert!(Error::VerifyLocks(Mismatch::Locks {
            expected: 0xFC,
            found: 0xFF
        })
        .is_verification());
        assert_eq!(
            Error::Data {
                file: None,
                line: 3,
                kind: DataError::Checksum
            }
            .class(),
            ErrorClass::Input
        );
    }

    #[test]
    fn test_codes() {
        assert_eq!(Error::WriteFuse(FuseByte::Low).code(), 87);
        assert_eq!(
            Error::Data {
                file: None,
                line: 1,
                kind: DataError::FlashSize
            }
            .code(),
            15
        );
        assert_eq!(Warning::FirmwareUnprotected.code(), 105);
    }
}
