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

use std::{env, process};

use anyhow::Result;
use clap::{crate_authors, crate_version, App, AppSettings, Arg, SubCommand};

mod check;
mod flash;
mod list;

const LOG_ENV: &str = "BCPROG_LOG";

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);

        let code = e
            .downcast_ref::<bcprog::Error>()
            .map(bcprog::Error::code)
            .unwrap_or(1);
        process::exit(code);
    }
}

fn run() -> Result<()> {
    let args = cli().get_matches();

    // -v (debug), -vv (trace), unless the environment already says otherwise.
    let verbosity = match args.subcommand() {
        (_, Some(m)) => m.occurrences_of("verbose").max(args.occurrences_of("verbose")),
        _ => args.occurrences_of("verbose"),
    };
    if verbosity > 0 && env::var_os(LOG_ENV).is_none() {
        let level = if verbosity > 1 { "trace" } else { "debug" };
        env::set_var(LOG_ENV, level);
    }

    #[cfg(feature = "pretty-env-logger")]
    pretty_env_logger::init_custom_env(LOG_ENV);
    #[cfg(not(feature = "pretty-env-logger"))]
    env_logger::init_from_env(LOG_ENV);

    match args.subcommand() {
        ("flash", Some(m)) => flash::flash(m, verbosity > 0)?,
        ("check", Some(m)) => check::check(m)?,
        ("devices", Some(m)) => list::list(m)?,
        _ => {
            println!("Error: Sub-command required");
            println!("{}", args.usage());
        }
    }

    Ok(())
}

fn cli() -> App<'static, 'static> {
    let app = App::new("Board Controller In-System Programmer")
        .usage("bcprog [OPTIONS] [SUBCOMMAND]")
        .setting(AppSettings::ColoredHelp)
        .version(crate_version!())
        .author(crate_authors!())
        .about("Updates the firmware of the board controller from a .DAT file")
        .arg(
            opt("verbose", "Use verbose output: -v (debug), -vv (trace). Also logs every ISP exchange")
                .short("v")
                .multiple(true)
                .global(true)
        )
        .subcommand(
            SubCommand::with_name("flash")
                .about("Program a .DAT file into the board controller")
                .setting(AppSettings::ColoredHelp)
                .arg(
                    Arg::with_name("FILE")
                        .required(true)
                        .takes_value(true)
                        .help("Firmware data file")
                )
                .arg(
                    opt("simulate", "Program a simulated controller of the given type, see `bcprog devices`")
                        .takes_value(true)
                        .value_name("DEVICE")
                )
                .arg(opt("batch", "Never prompt, fail where a decision is needed").short("b"))
                .arg(opt("fast", "Skip all verification").short("f"))
                .arg(opt("quick", "Skip erased bytes during verification").short("q"))
                .arg(opt("silent", "Don't show progress").short("s"))
                .arg(opt("bootblock", "Update the bootblock too"))
                .arg(
                    opt("bldr-enable", "Enable the board controller bootloader")
                        .conflicts_with("bldr-disable")
                )
                .arg(opt("bldr-disable", "Disable the board controller bootloader"))
                .arg(opt("erase-eeprom", "Erase the EEPROM even if EESAVE preserves it").hidden(true))
                .arg(opt("mfg-write", "Write the EEPROM manufacturing data").hidden(true))
                .arg(opt("no-fuse-protection", "Don't protect the critical fuse bits").hidden(true))
                .arg(opt("cid-override", "Ignore a compatibility ID mismatch").hidden(true))
        )
        .subcommand(
            SubCommand::with_name("check")
                .about("Show the contents of a .DAT file")
                .setting(AppSettings::ColoredHelp)
                .arg(
                    Arg::with_name("FILE")
                        .required(true)
                        .takes_value(true)
                        .help("Firmware data file")
                )
        )
        .subcommand(
            SubCommand::with_name("devices")
                .about("List the supported controllers")
                .setting(AppSettings::ColoredHelp)
                .arg(
                    opt("family", "Only list one family: avr-x8, avr-x5p, stm32, tiva or mec170x")
                        .takes_value(true)
                )
        );

    // When double clicking the binary the binary will be paused. Useful on
    // windows, since the Console window will be closed inmediately.
    #[cfg(windows)]
    let app = app.setting(AppSettings::WaitOnError);

    app
}

fn opt(name: &'static str, help: &'static str) -> Arg<'static, 'static> {
    Arg::with_name(name).long(name).help(help)
}
