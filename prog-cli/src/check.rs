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

use std::path::PathBuf;

use bcprog::{device::FuseByte, image::RevisionTag, FirmwareImage, Flags};

use anyhow::{Context, Result};
use clap::ArgMatches;

/// Check subcommand entry point.
pub fn check(matches: &ArgMatches<'_>) -> Result<()> {
    let path: PathBuf = matches
        .value_of("FILE")
        .context("Data file path required")?
        .parse()
        .context("Invalid data file path")?;

    let image = FirmwareImage::open(&path)?;
    let requested = image.requested();

    println!("Data file:       `{}`", path.display());

    match image.revision() {
        Some(rev) => {
            let tag = match rev.tag {
                RevisionTag::Cgbc => "CGBCP",
                RevisionTag::Gen5 => "GEN5P",
            };
            println!("Revision:        {}{}{}{}", tag, rev.feature, rev.major, rev.minor);
        }
        None => println!("Revision:        none"),
    }

    if image.cid() < 0 {
        println!("CID:             none");
    } else {
        println!("CID:             {}", image.cid());
    }

    if requested.contains(Flags::FLS_PROG_REQ) {
        println!("Code size:       {} bytes", image.code_size());
    }
    if requested.contains(Flags::EEP_PROG_REQ) {
        println!("EEPROM entries:  {}", image.eeprom().len());
    }

    for &fuse in FuseByte::ALL.iter() {
        if requested.contains(Flags::fuse_request(fuse)) {
            let masks = image.fuse_masks(fuse);
            println!(
                "Fuse {}:          AND {:02X}h  OR {:02X}h",
                fuse, masks.and, masks.or
            );
        }
    }

    if requested.contains(Flags::LOCKS_PROG_REQ) {
        println!("Lock bits:       {:02X}h", image.lock_bits());
    }

    Ok(())
}
