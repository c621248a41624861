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

use bcprog::{device::DEVICES, Family};

use anyhow::{Context, Result};
use clap::ArgMatches;

/// Devices subcommand entry point.
pub fn list(matches: &ArgMatches<'_>) -> Result<()> {
    let family = match matches.value_of("family") {
        Some(f) => Some(f.parse::<Family>().context("Invalid --family")?),
        None => None,
    };

    println!(
        "{:<14} {:<9} {:<8} {:>7} {:>5} {:>7}",
        "Controller", "Signature", "Family", "FLASH", "Page", "EEPROM"
    );

    for device in DEVICES.iter() {
        if family.map_or(false, |f| f != device.family) {
            continue;
        }

        println!(
            "{:<14} {:06X}h   {:<8} {:>6}K {:>5} {:>7}",
            device.name,
            device.signature,
            device.family.to_string(),
            device.flash_size / 1024,
            device.flash_page_size,
            device.eeprom_size,
        );
    }

    Ok(())
}
