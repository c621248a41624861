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

//! # Firmware images
//!
//! Board controller firmware is distributed as `.DAT` files: Intel HEX
//! records split into sections by tag lines. A tag line starts with `;`, a
//! record line with `:`.
//!
//! ```text
//! ;CGBCPX12.DAT CID 3
//! ;FLASH Code
//! :100000000C9434000C9446000C9446000C9446006A
//! :00000001FF
//! ;EEPROM Data
//! :03000000AABBCCCC
//! ;High Fuse Bits AND Mask
//! :01000000D728
//! ;Lock Bits
//! :01000000FC03
//! ```
//!
//! Unknown tags are accepted and start an unknown section, records inside it
//! are rejected.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Write},
    path::Path,
};

use crate::{
    constants::{MAX_EEP_ENTRIES, MAX_EEP_SIZE, MAX_FLS_SIZE},
    device::FuseByte,
    error::{DataError, Error},
    flags::Flags,
    util,
};

const REVISION_TAGS: [(&str, RevisionTag); 2] =
    [("CGBCP", RevisionTag::Cgbc), ("GEN5P", RevisionTag::Gen5)];
const FLASH_TAG: &str = "FLASH Code";
const EEPROM_TAG: &str = "EEPROM Data";
const LOCKS_TAG: &str = "Lock Bits";
const CID_MARKER: &[u8] = b".DAT CID ";

/// Data bytes per record written by [`FirmwareImage::write_to`].
const RECORD_SIZE: usize = 16;

const REC_DATA: u8 = 0x00;
const REC_EOF: u8 = 0x01;
const REC_EXT_SEGMENT: u8 = 0x02;
const REC_START_SEGMENT: u8 = 0x03;
const REC_EXT_LINEAR: u8 = 0x04;
const REC_START_LINEAR: u8 = 0x05;

/// Revision tag flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionTag {
    /// `;CGBCP`
    Cgbc,
    /// `;GEN5P`
    Gen5,
}

/// Firmware revision carried by the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revision {
    pub tag: RevisionTag,
    pub feature: char,
    pub major: char,
    pub minor: char,
}

/// A single EEPROM byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EepromEntry {
    pub address: u32,
    pub value: u8,
}

/// AND/OR masks applied to the current value of a fuse byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuseMasks {
    pub and: u8,
    pub or: u8,
}

impl FuseMasks {
    #[inline]
    pub fn apply(&self, current: u8) -> u8 {
        (current & self.and) | self.or
    }
}

impl Default for FuseMasks {
    fn default() -> Self {
        FuseMasks { and: 0xFF, or: 0x00 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Revision,
    Flash,
    Eeprom,
    FuseAnd(FuseByte),
    FuseOr(FuseByte),
    Locks,
}

impl Section {
    fn from_tag(tag: &str) -> Section {
        if REVISION_TAGS.iter().any(|(t, _)| tag.starts_with(t)) {
            return Section::Revision;
        }
        if tag.starts_with(FLASH_TAG) {
            return Section::Flash;
        }
        if tag.starts_with(EEPROM_TAG) {
            return Section::Eeprom;
        }
        if tag.starts_with(LOCKS_TAG) {
            return Section::Locks;
        }
        for fuse in FuseByte::ALL.iter().copied() {
            if tag.starts_with(&fuse_tag(fuse, "AND")) {
                return Section::FuseAnd(fuse);
            }
            if tag.starts_with(&fuse_tag(fuse, "OR")) {
                return Section::FuseOr(fuse);
            }
        }

        Section::None
    }
}

fn fuse_tag(fuse: FuseByte, op: &str) -> String {
    let name = match fuse {
        FuseByte::Extended => "Extended",
        FuseByte::High => "High",
        FuseByte::Low => "Low",
    };
    format!("{} Fuse Bits {} Mask", name, op)
}

#[derive(Debug)]
struct Record {
    address: u16,
    kind: u8,
    data: Vec<u8>,
}

/// Contents of a firmware data file.
#[derive(Clone)]
pub struct FirmwareImage {
    flash: Vec<u8>,
    eeprom: Vec<EepromEntry>,
    fuses: [FuseMasks; 3],
    lock_bits: u8,
    revision: Option<Revision>,
    cid: i32,
    requested: Flags,
}

impl FirmwareImage {
    /// An empty image, requesting nothing.
    pub fn new() -> Result<FirmwareImage, Error> {
        let mut flash = Vec::new();
        flash
            .try_reserve_exact(MAX_FLS_SIZE)
            .map_err(|_| Error::Allocation)?;
        flash.resize(MAX_FLS_SIZE, 0xFF);

        let mut eeprom = Vec::new();
        eeprom
            .try_reserve_exact(MAX_EEP_ENTRIES)
            .map_err(|_| Error::Allocation)?;

        Ok(FirmwareImage {
            flash,
            eeprom,
            fuses: [FuseMasks::default(); 3],
            lock_bits: 0xFF,
            revision: None,
            cid: -1,
            requested: Flags::empty(),
        })
    }

    /// Read a data file from disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FirmwareImage, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::File {
            path: Some(path.to_path_buf()),
            source: e,
        })?;

        let name = path.display().to_string();
        Self::parse(BufReader::new(file), Some(name), Some(path))
    }

    /// Read a data file from a stream.
    pub fn load<R: BufRead>(reader: R) -> Result<FirmwareImage, Error> {
        Self::parse(reader, None, None)
    }

    fn parse<R: BufRead>(
        mut reader: R,
        name: Option<String>,
        path: Option<&Path>,
    ) -> Result<FirmwareImage, Error> {
        let mut image = FirmwareImage::new()?;
        let mut section = Section::None;
        let mut bias = 0u32;
        let mut line = String::new();
        let mut line_no = 0usize;

        loop {
            line.clear();
            let n = reader.read_line(&mut line).map_err(|e| Error::File {
                path: path.map(Path::to_path_buf),
                source: e,
            })?;
            if n == 0 {
                break;
            }
            line_no += 1;

            let data_error = |kind| Error::Data {
                file: name.clone(),
                line: line_no,
                kind,
            };

            let text = line.trim_end_matches(|c| c == '\r' || c == '\n');
            if text.trim().is_empty() {
                continue;
            }

            if let Some(tag) = text.strip_prefix(';') {
                section = Section::from_tag(tag);
                if section == Section::Revision {
                    image.parse_revision(text.as_bytes());
                }
                log::trace!("line {}: section {:?}", line_no, section);
                continue;
            }

            let hex = text
                .strip_prefix(':')
                .ok_or_else(|| data_error(DataError::Syntax))?;
            if section == Section::None {
                return Err(data_error(DataError::NoSection));
            }

            let record = parse_record(hex).map_err(data_error)?;
            match record.kind {
                REC_DATA => {
                    let mut address = u32::from(record.address);
                    if section == Section::Flash {
                        address += bias;
                    }
                    image
                        .handle_data(section, address, &record.data)
                        .map_err(data_error)?;
                }
                REC_EOF | REC_START_SEGMENT | REC_START_LINEAR => (),
                REC_EXT_SEGMENT => {
                    bias = (extended_address(&record).map_err(data_error)? << 4)
                        & 0x00FF_FFFF;
                }
                REC_EXT_LINEAR => {
                    bias = (extended_address(&record).map_err(data_error)?
                        << 16)
                        & 0x00FF_FFFF;
                }
                kind => return Err(data_error(DataError::RecordType(kind))),
            }
        }

        image.dump();
        Ok(image)
    }

    fn parse_revision(&mut self, line: &[u8]) {
        let at = |i: usize| line.get(i).map(|b| char::from(*b)).unwrap_or(' ');
        let tag = REVISION_TAGS
            .iter()
            .find(|(t, _)| line[1..].starts_with(t.as_bytes()))
            .map(|(_, tag)| *tag)
            .unwrap_or(RevisionTag::Cgbc);

        self.revision = Some(Revision {
            tag,
            feature: at(6),
            major: at(7),
            minor: at(8),
        });

        if line.len() >= 18 && &line[9..18] == CID_MARKER {
            self.cid = atoi(&line[18..]);
        }
    }

    fn handle_data(
        &mut self,
        section: Section,
        address: u32,
        data: &[u8],
    ) -> Result<(), DataError> {
        match section {
            Section::Flash => {
                self.write_flash(address, data)?;
            }
            Section::Eeprom => {
                if address as usize + data.len() > MAX_EEP_SIZE as usize {
                    return Err(DataError::EepromSize);
                }
                for (i, value) in data.iter().enumerate() {
                    self.push_eeprom(address + i as u32, *value)?;
                }
            }
            Section::FuseAnd(fuse) => {
                self.fuses[fuse.index()].and = single_byte(address, data)?;
                self.requested |= Flags::fuse_request(fuse);
            }
            Section::FuseOr(fuse) => {
                self.fuses[fuse.index()].or = single_byte(address, data)?;
                self.requested |= Flags::fuse_request(fuse);
            }
            Section::Locks => {
                self.lock_bits = single_byte(address, data)?;
                self.requested |= Flags::LOCKS_PROG_REQ;
            }
            // Data under the revision tag carries nothing we use.
            Section::Revision | Section::None => (),
        }

        Ok(())
    }

    /// Copy `data` into the flash buffer at `offset`.
    pub fn write_flash(&mut self, offset: u32, data: &[u8]) -> Result<(), DataError> {
        let start = offset as usize;
        let end = start + data.len();
        if end > MAX_FLS_SIZE {
            return Err(DataError::FlashSize);
        }

        self.flash[start..end].copy_from_slice(data);
        self.requested |= Flags::FLS_PROG_REQ;
        Ok(())
    }

    /// Append an EEPROM byte.
    pub fn push_eeprom(&mut self, address: u32, value: u8) -> Result<(), DataError> {
        if address >= MAX_EEP_SIZE || self.eeprom.len() >= MAX_EEP_ENTRIES {
            return Err(DataError::EepromSize);
        }

        self.eeprom.push(EepromEntry { address, value });
        self.requested |= Flags::EEP_PROG_REQ;
        Ok(())
    }

    /// Request a fuse byte update.
    pub fn set_fuse_masks(&mut self, fuse: FuseByte, masks: FuseMasks) {
        self.fuses[fuse.index()] = masks;
        self.requested |= Flags::fuse_request(fuse);
    }

    /// Request a lock bits update.
    pub fn set_lock_bits(&mut self, locks: u8) {
        self.lock_bits = locks;
        self.requested |= Flags::LOCKS_PROG_REQ;
    }

    /// The whole flash buffer, erased bytes are 0xFF.
    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    /// Offset of the last non erased flash byte plus one.
    pub fn code_size(&self) -> u32 {
        self.flash
            .iter()
            .rposition(|b| *b != 0xFF)
            .map(|i| i as u32 + 1)
            .unwrap_or(0)
    }

    pub fn eeprom(&self) -> &[EepromEntry] {
        &self.eeprom
    }

    pub fn fuse_masks(&self, fuse: FuseByte) -> FuseMasks {
        self.fuses[fuse.index()]
    }

    /// Requested lock bits, 0xFF when the image has no lock section.
    pub fn lock_bits(&self) -> u8 {
        self.lock_bits
    }

    pub fn revision(&self) -> Option<Revision> {
        self.revision
    }

    /// Compatibility ID, `-1` if the image doesn't carry one.
    pub fn cid(&self) -> i32 {
        self.cid
    }

    pub fn set_cid(&mut self, cid: i32) {
        self.cid = cid;
    }

    /// Sections present in the image, as `*_PROG_REQ` flags.
    pub fn requested(&self) -> Flags {
        self.requested
    }

    fn dump(&self) {
        log::debug!(
            "image: code size {} bytes, {} EEPROM entries, requested {:?}",
            self.code_size(),
            self.eeprom.len(),
            self.requested
        );

        if !log::log_enabled!(log::Level::Trace) {
            return;
        }

        for (i, row) in self.flash.chunks(RECORD_SIZE).enumerate() {
            if !util::is_erased(row) {
                log::trace!("{}", util::hex_row((i * RECORD_SIZE) as u32, row));
            }
        }
        for entry in &self.eeprom {
            log::trace!("EEPROM {:04X}: {:02X}", entry.address, entry.value);
        }
    }

    /// Write the image back in `.DAT` format.
    pub fn write_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        if let Some(rev) = self.revision {
            let tag = match rev.tag {
                RevisionTag::Cgbc => "CGBCP",
                RevisionTag::Gen5 => "GEN5P",
            };
            write!(w, ";{}{}{}{}", tag, rev.feature, rev.major, rev.minor)?;
            if self.cid >= 0 {
                write!(w, ".DAT CID {}", self.cid)?;
            }
            writeln!(w)?;
        }

        if self.requested.contains(Flags::FLS_PROG_REQ) {
            writeln!(w, ";{}", FLASH_TAG)?;
            let mut segment = 0u32;
            for (i, row) in self.flash.chunks(RECORD_SIZE).enumerate() {
                if util::is_erased(row) {
                    continue;
                }
                let offset = (i * RECORD_SIZE) as u32;
                if offset >> 16 != segment {
                    segment = offset >> 16;
                    let upper = (segment as u16).to_be_bytes();
                    write_record(&mut w, 0, REC_EXT_LINEAR, &upper)?;
                }
                write_record(&mut w, offset as u16, REC_DATA, row)?;
            }
            write_record(&mut w, 0, REC_EOF, &[])?;
        }

        if self.requested.contains(Flags::EEP_PROG_REQ) {
            writeln!(w, ";{}", EEPROM_TAG)?;
            let mut start = 0;
            while start < self.eeprom.len() {
                // Merge runs of consecutive addresses into one record.
                let base = self.eeprom[start].address;
                let mut end = start + 1;
                while end < self.eeprom.len()
                    && end - start < RECORD_SIZE
                    && self.eeprom[end].address == base + (end - start) as u32
                {
                    end += 1;
                }
                let data: Vec<u8> =
                    self.eeprom[start..end].iter().map(|e| e.value).collect();
                write_record(&mut w, base as u16, REC_DATA, &data)?;
                start = end;
            }
            write_record(&mut w, 0, REC_EOF, &[])?;
        }

        for fuse in FuseByte::ALL.iter().copied() {
            if self.requested.contains(Flags::fuse_request(fuse)) {
                let masks = self.fuses[fuse.index()];
                writeln!(w, ";{}", fuse_tag(fuse, "AND"))?;
                write_record(&mut w, 0, REC_DATA, &[masks.and])?;
                writeln!(w, ";{}", fuse_tag(fuse, "OR"))?;
                write_record(&mut w, 0, REC_DATA, &[masks.or])?;
            }
        }

        if self.requested.contains(Flags::LOCKS_PROG_REQ) {
            writeln!(w, ";{}", LOCKS_TAG)?;
            write_record(&mut w, 0, REC_DATA, &[self.lock_bits])?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for FirmwareImage {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("FirmwareImage")
            .field("code_size", &self.code_size())
            .field("eeprom", &self.eeprom.len())
            .field("fuses", &self.fuses)
            .field("lock_bits", &self.lock_bits)
            .field("revision", &self.revision)
            .field("cid", &self.cid)
            .field("requested", &self.requested)
            .finish()
    }
}

fn single_byte(address: u32, data: &[u8]) -> Result<u8, DataError> {
    match data {
        [value] if address == 0 => Ok(*value),
        _ => Err(DataError::FuseRecordShape),
    }
}

fn extended_address(record: &Record) -> Result<u32, DataError> {
    match record.data.as_slice() {
        [hi, lo, ..] => Ok(u32::from(u16::from_be_bytes([*hi, *lo]))),
        _ => Err(DataError::Record),
    }
}

/// Decode `LLAAAATT<data>CC`, everything after the colon.
fn parse_record(hex: &str) -> Result<Record, DataError> {
    let hex = hex.trim_end();
    if hex.len() < 10 || hex.len() % 2 != 0 {
        return Err(DataError::Record);
    }

    let bytes = hex
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
        })
        .collect::<Option<Vec<u8>>>()
        .ok_or(DataError::Record)?;

    let len = usize::from(bytes[0]);
    if bytes.len() != len + 5 {
        return Err(DataError::Record);
    }

    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        return Err(DataError::Checksum);
    }

    Ok(Record {
        address: u16::from_be_bytes([bytes[1], bytes[2]]),
        kind: bytes[3],
        data: bytes[4..4 + len].to_vec(),
    })
}

fn write_record<W: Write>(
    w: &mut W,
    address: u16,
    kind: u8,
    data: &[u8],
) -> io::Result<()> {
    let [hi, lo] = address.to_be_bytes();
    let mut sum = (data.len() as u8).wrapping_add(hi).wrapping_add(lo).wrapping_add(kind);
    write!(w, ":{:02X}{:04X}{:02X}", data.len(), address, kind)?;
    for byte in data {
        sum = sum.wrapping_add(*byte);
        write!(w, "{:02X}", byte)?;
    }
    writeln!(w, "{:02X}", 0u8.wrapping_sub(sum))
}

/// Leading decimal integer, `0` if there is none.
fn atoi(s: &[u8]) -> i32 {
    let s = std::str::from_utf8(s).unwrap_or("").trim_start();
    let end = s
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or_else(|| s.len());
    s[..end].parse().unwrap_or(0)
}
