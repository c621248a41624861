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
    io::{self, BufRead, Write},
    path::PathBuf,
};

use bcprog::{
    device::{self, DeviceDescriptor},
    sim::SimulatedBoard,
    Error, Flags, Frontend, Phase, Question, Warning,
};

use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use indicatif::{ProgressBar, ProgressStyle};

const PHASE_WIDTH: usize = 40;

/// Flash subcommand entry point.
pub fn flash(matches: &ArgMatches<'_>, verbose: bool) -> Result<()> {
    let opts = FlashOpts::from_matches(matches, verbose)?;

    let device = match opts.simulate {
        Some(ref name) => device::by_name(name).with_context(|| {
            format!("Unknown controller `{}`, see `bcprog devices`", name)
        })?,
        None => bail!(
            "No system interface driver available, use --simulate <DEVICE> to program a simulated controller"
        ),
    };

    log::info!("Data file: `{}`", opts.data_path.display());
    log::info!("Simulated controller: {}", device.name);
    log::debug!("Flags: {:?}", opts.flags);

    let board = SimulatedBoard::new(device);
    let mut console = Console::new();
    let report = bcprog::update(board, &opts.data_path, opts.flags, &mut console)?;

    if !opts.flags.contains(Flags::SILENT) {
        println!();
        println!("Controller:      {} ({:06X}h)", report.device, report.signature);
        println!("Code size:       {} bytes", report.code_size);
        println!("Pages written:   {}", report.pages_written);
        println!("EEPROM written:  {} bytes", report.eeprom_bytes_written);
        println!("Chip erased:     {}", if report.erased { "yes" } else { "no" });
    }

    Ok(())
}

struct FlashOpts {
    data_path: PathBuf,
    simulate: Option<String>,
    flags: Flags,
}

impl FlashOpts {
    pub fn from_matches(matches: &ArgMatches<'_>, verbose: bool) -> Result<FlashOpts> {
        let switches = [
            ("batch", Flags::BATCH),
            ("fast", Flags::SKIP_VERIFY),
            ("quick", Flags::SKIP_VERIFY_FF),
            ("silent", Flags::SILENT),
            ("bootblock", Flags::BOOTBLOCK_UPDATE),
            ("bldr-enable", Flags::BOOTLOADER_ENABLE),
            ("bldr-disable", Flags::BOOTLOADER_DISABLE),
            ("erase-eeprom", Flags::EEP_ERASE),
            ("mfg-write", Flags::MFG_WRITE),
            ("no-fuse-protection", Flags::NO_FUSE_PROTECTION),
            ("cid-override", Flags::CID_OVERRIDE),
        ];

        let mut flags = Flags::empty();
        for &(name, flag) in switches.iter() {
            flags.set(flag, matches.is_present(name));
        }
        flags.set(Flags::VERBOSE, verbose);

        Ok(FlashOpts {
            data_path: matches
                .value_of("FILE")
                .context("Data file path required")?
                .parse()
                .context("Invalid data file path")?,
            simulate: matches.value_of("simulate").map(str::to_owned),
            flags,
        })
    }
}

/// Terminal frontend: one dotted line per phase, a progress bar for the
/// long ones and y/n prompts on stdin.
struct Console {
    bar: Option<ProgressBar>,
    line_open: bool,
}

impl Console {
    fn new() -> Console {
        Console {
            bar: None,
            line_open: false,
        }
    }

    fn open_line(&mut self, phase: Phase) {
        print!("{:.<width$} ", format!("{} ", phase), width = PHASE_WIDTH);
        let _ = io::stdout().flush();
        self.line_open = true;
    }

    fn close_line(&mut self, phase: Phase, outcome: &str) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
            self.open_line(phase);
        }
        if self.line_open {
            println!("{}", outcome);
            self.line_open = false;
        }
    }

    fn break_line(&mut self) {
        if self.line_open {
            println!();
            self.line_open = false;
        }
    }
}

impl Frontend for Console {
    fn begin(&mut self, phase: Phase) {
        self.break_line();
        self.open_line(phase);
    }

    fn advance(&mut self, done: u64, total: u64) {
        if self.bar.is_none() {
            self.break_line();
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("  [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                    .progress_chars("#>-"),
            );
            self.bar = Some(bar);
        }

        if let Some(ref bar) = self.bar {
            bar.set_length(total);
            bar.set_position(done);
        }
    }

    fn passed(&mut self, phase: Phase) {
        self.close_line(phase, &passed());
    }

    fn failed(&mut self, phase: Phase, _error: &Error) {
        self.close_line(phase, &failed());
    }

    fn identified(&mut self, device: &DeviceDescriptor) {
        self.close_line(Phase::CheckingControllerType, device.name);
    }

    fn warning(&mut self, warning: Warning) {
        self.break_line();
        println!("Warning: {}", warning);
    }

    fn confirm(&mut self, question: Question) -> Option<bool> {
        self.break_line();

        if let Question::ContinueWithoutEesave = question {
            println!("The EESAVE fuse can't be set, the EEPROM will be erased.");
        }

        let stdin = io::stdin();
        let mut answer = String::new();
        loop {
            print!("{} (y/n) ", question);
            let _ = io::stdout().flush();

            answer.clear();
            match stdin.lock().read_line(&mut answer) {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }

            match answer.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return Some(true),
                "n" | "no" => return Some(false),
                _ => continue,
            }
        }
    }
}

#[cfg(unix)]
fn passed() -> String {
    ansi_term::Colour::Green.bold().paint("PASSED").to_string()
}

#[cfg(not(unix))]
fn passed() -> String {
    "PASSED".to_owned()
}

#[cfg(unix)]
fn failed() -> String {
    ansi_term::Colour::Red.bold().paint("FAILED").to_string()
}

#[cfg(not(unix))]
fn failed() -> String {
    "FAILED".to_owned()
}
