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

//! # Update orchestration
//!
//! Runs the phases of the [`EngineContext`] in their fixed order, stopping
//! at the first failure. Programming mode is always left before returning,
//! whatever the outcome.

use std::{fmt, path::Path};

use crate::{
    device::DeviceDescriptor,
    engine::EngineContext,
    error::{Error, Warning},
    flags::Flags,
    image::FirmwareImage,
    transport::Transport,
};

/// Steps of a run, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    ReadingDataFile,
    ConnectingInterface,
    CheckingCompatibility,
    EnteringProgrammingMode,
    CheckingControllerType,
    CheckingFlashSpace,
    CheckingEepromSpace,
    CheckingLocksAndFuses,
    ProgrammingEesave,
    ErasingFlash,
    ErasingFlashAndEeprom,
    ResettingEesave,
    VerifyingCleanEeprom,
    ProgrammingFlash,
    ProgrammingEeprom,
    ProgrammingFuses,
    VerifyingFlash,
    VerifyingEeprom,
    VerifyingFuses,
    ProgrammingLocks,
    VerifyingLocks,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::ReadingDataFile => "Reading data file",
            Phase::ConnectingInterface => "Connecting system interface",
            Phase::CheckingCompatibility => "Checking compatibility",
            Phase::EnteringProgrammingMode => "Entering programming mode",
            Phase::CheckingControllerType => "Checking controller type",
            Phase::CheckingFlashSpace => "Checking FLASH space",
            Phase::CheckingEepromSpace => "Checking EEPROM space",
            Phase::CheckingLocksAndFuses => "Checking locks and fuses",
            Phase::ProgrammingEesave => "Programming EESAVE fuse",
            Phase::ErasingFlash => "Erasing FLASH",
            Phase::ErasingFlashAndEeprom => "Erasing FLASH and EEPROM",
            Phase::ResettingEesave => "Resetting EESAVE fuse",
            Phase::VerifyingCleanEeprom => "Verifying clean EEPROM",
            Phase::ProgrammingFlash => "Programming FLASH",
            Phase::ProgrammingEeprom => "Programming EEPROM",
            Phase::ProgrammingFuses => "Programming fuse bits",
            Phase::VerifyingFlash => "Verifying FLASH",
            Phase::VerifyingEeprom => "Verifying EEPROM",
            Phase::VerifyingFuses => "Verifying fuse bits",
            Phase::ProgrammingLocks => "Programming lock bits",
            Phase::VerifyingLocks => "Verifying lock bits",
        };
        f.write_str(s)
    }
}

/// Decisions the engine asks the user for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Question {
    /// EESAVE is not programmed and the locks forbid changing it, so the
    /// chip erase destroys the EEPROM.
    ContinueWithoutEesave,
    /// EESAVE is not programmed but can be set before the chip erase.
    PreserveEeprom,
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Question::ContinueWithoutEesave => f.write_str("Do you want to continue?"),
            Question::PreserveEeprom => f.write_str(
                "Do you want to preserve the content of the EEPROM by setting the EESAVE fuse?",
            ),
        }
    }
}

/// User facing side of a run.
///
/// Every method has a do-nothing default, so a frontend only implements
/// what it displays.
pub trait Frontend {
    /// A phase started.
    fn begin(&mut self, _phase: Phase) {}

    /// Progress inside the current phase.
    fn advance(&mut self, _done: u64, _total: u64) {}

    /// The current phase succeeded.
    fn passed(&mut self, _phase: Phase) {}

    /// The current phase failed, `error` is returned right after.
    fn failed(&mut self, _phase: Phase, _error: &Error) {}

    /// The controller was identified. Replaces [`Frontend::passed`] for
    /// [`Phase::CheckingControllerType`].
    fn identified(&mut self, _device: &DeviceDescriptor) {}

    fn warning(&mut self, _warning: Warning) {}

    /// Ask a yes/no question.
    ///
    /// `None` means nobody can answer, and the engine takes the safe path
    /// it takes for batch runs.
    fn confirm(&mut self, _question: Question) -> Option<bool> {
        None
    }
}

/// A [`Frontend`] that shows nothing and never answers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFrontend;

impl Frontend for NullFrontend {}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Name of the identified controller.
    pub device: &'static str,
    pub signature: u32,
    pub code_size: u32,
    pub pages_written: usize,
    pub eeprom_bytes_written: usize,
    /// Whether a chip erase was issued.
    pub erased: bool,
    pub warnings: Vec<Warning>,
}

/// Load the data file at `path` and program it through `transport`.
pub fn update<T, P>(
    transport: T,
    path: P,
    flags: Flags,
    frontend: &mut dyn Frontend,
) -> Result<Report, Error>
where
    T: Transport,
    P: AsRef<Path>,
{
    let silent = flags.contains(Flags::SILENT);

    if !silent {
        frontend.begin(Phase::ReadingDataFile);
    }
    let image = match FirmwareImage::open(path) {
        Ok(image) => image,
        Err(e) => {
            if !silent {
                frontend.failed(Phase::ReadingDataFile, &e);
            }
            return Err(e);
        }
    };
    if !silent {
        frontend.passed(Phase::ReadingDataFile);
    }

    update_image(transport, &image, flags, frontend)
}

/// Program an already loaded `image` through `transport`.
pub fn update_image<T>(
    transport: T,
    image: &FirmwareImage,
    flags: Flags,
    frontend: &mut dyn Frontend,
) -> Result<Report, Error>
where
    T: Transport,
{
    let mut ctx = EngineContext::new(transport, image, flags, frontend);

    let res = run(&mut ctx);
    if let Err(ref e) = res {
        ctx.fail(e);
    }
    ctx.cleanup();

    res.map(|_| ctx.report())
}

fn run<T: Transport>(ctx: &mut EngineContext<'_, T>) -> Result<(), Error> {
    ctx.connect()?;
    ctx.check_timing()?;
    ctx.check_compatibility()?;
    ctx.enable_programming()?;
    ctx.identify()?;
    ctx.check_space()?;
    ctx.check_locks_and_fuses()?;
    ctx.erase_chip()?;
    ctx.erase_eeprom()?;
    ctx.verify_eeprom_clean()?;
    ctx.program_flash()?;
    ctx.program_eeprom()?;
    ctx.program_fuses()?;
    ctx.verify_flash()?;
    ctx.verify_eeprom()?;
    ctx.verify_fuses()?;
    ctx.program_locks()?;
    ctx.verify_locks()
}

#[cfg(test)]
mod test {
    use std::{io, time::Duration};

    use super::*;
    use crate::{
        constants::*,
        transport::{Status, Timing},
        device::{self, FuseByte},
        error::Mismatch,
        image::{FirmwareImage, FuseMasks},
        sim::SimulatedBoard,
    };

    fn new_board(name: &str) -> SimulatedBoard {
        SimulatedBoard::new(device::by_name(name).unwrap())
    }

    fn image_with_flash(data: &[u8]) -> FirmwareImage {
        let mut image = FirmwareImage::new().unwrap();
        image.write_flash(0, data).unwrap();
        image
    }

    /// Records everything the engine shows and answers questions from a
    /// script.
    #[derive(Default)]
    struct Recorder {
        begun: Vec<Phase>,
        passed: Vec<Phase>,
        failed: Vec<Phase>,
        identified: Option<&'static str>,
        warnings: Vec<Warning>,
        questions: Vec<Question>,
        answers: Vec<bool>,
    }

    impl Frontend for Recorder {
        fn begin(&mut self, phase: Phase) {
            self.begun.push(phase);
        }

        fn passed(&mut self, phase: Phase) {
            self.passed.push(phase);
        }

        fn failed(&mut self, phase: Phase, _error: &Error) {
            self.failed.push(phase);
        }

        fn identified(&mut self, device: &DeviceDescriptor) {
            self.identified = device::by_name(device.name).map(|d| d.name);
        }

        fn warning(&mut self, warning: Warning) {
            self.warnings.push(warning);
        }

        fn confirm(&mut self, question: Question) -> Option<bool> {
            self.questions.push(question);
            if self.answers.is_empty() {
                None
            } else {
                Some(self.answers.remove(0))
            }
        }
    }

    fn is_erase(cmd: u32) -> bool {
        cmd == SPM_CHIP_ERASE
    }

    fn is_mutation(cmd: u32) -> bool {
        let op = cmd >> 24;
        is_erase(cmd)
            || cmd & 0xFFF0_0000 == 0xACA0_0000
            || cmd & 0xFFFF_0000 == 0xACE0_0000
            || op == 0x4C
            || op == 0xC0
    }

    #[test]
    fn test_flash_pages_written_and_verified() {
        let data: Vec<u8> = (0..=255u8).collect();
        let image = image_with_flash(&data);

        let mut board = new_board("ATmega48");
        let report =
            update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).unwrap();

        assert_eq!(report.device, "ATmega48");
        assert_eq!(report.code_size, 256);
        assert_eq!(report.pages_written, 4);
        assert!(report.erased);
        assert_eq!(board.page_writes(), &[0, 64, 128, 192]);
        assert_eq!(&board.flash()[..256], &data[..]);
        assert_eq!(board.erase_count(), 1);
    }

    #[test]
    fn test_erased_pages_are_skipped() {
        let mut image = FirmwareImage::new().unwrap();
        image.write_flash(0, &[0x12; 64]).unwrap();
        image.write_flash(192, &[0x34; 64]).unwrap();

        let mut board = new_board("ATmega48");
        let report =
            update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).unwrap();

        assert_eq!(report.pages_written, 2);
        assert_eq!(board.page_writes(), &[0, 192]);
    }

    #[test]
    fn test_eeprom_entries_written() {
        let mut image = FirmwareImage::new().unwrap();
        for (address, value) in [(0, 0xAA), (1, 0xBB), (2, 0xCC)].iter() {
            image.push_eeprom(*address, *value).unwrap();
        }

        let mut board = new_board("ATmega165P");
        let report = update_image(
            &mut board,
            &image,
            Flags::BATCH | Flags::SKIP_VERIFY_FF,
            &mut NullFrontend,
        )
        .unwrap();

        assert_eq!(report.eeprom_bytes_written, 3);
        assert_eq!(board.eeprom_writes(), &[0, 1, 2]);
        assert_eq!(&board.eeprom()[..3], &[0xAA, 0xBB, 0xCC]);
        // The three reads of the verification pass.
        let reads = board
            .exchanges()
            .iter()
            .filter(|(cmd, _)| cmd >> 24 == 0xA0)
            .count();
        assert_eq!(reads, 3);
    }

    #[test]
    fn test_unknown_signature_touches_nothing() {
        let image = image_with_flash(&[0x00; 64]);

        let mut board = new_board("ATmega48");
        board.set_signature(0x00_0000);
        let err =
            update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).unwrap_err();

        assert!(matches!(err, Error::UnknownDevice(0)));
        assert_eq!(err.code(), 29);
        assert!(!board.exchanges().iter().any(|(cmd, _)| is_mutation(*cmd)));
        assert_eq!(board.erase_count(), 0);
        // Cleanup still ran.
        assert_eq!(board.post_end_count(), 1);
        assert!(!board.is_programming());
    }

    #[test]
    fn test_noop_update_skips_erase() {
        let mut image = FirmwareImage::new().unwrap();
        image.set_lock_bits(0xFF);

        let mut board = new_board("ATmega48");
        let report =
            update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).unwrap();

        assert!(!report.erased);
        assert_eq!(board.erase_count(), 0);
        assert!(!board.exchanges().iter().any(|(cmd, _)| is_erase(*cmd)));
    }

    #[test]
    fn test_fuse_safety_net_on_transmitted_byte() {
        let mut image = FirmwareImage::new().unwrap();
        // Clears RSTDISBL (0x80) and requests an external clock.
        image.set_fuse_masks(FuseByte::High, FuseMasks { and: 0x5F, or: 0x00 });
        image.set_fuse_masks(FuseByte::Low, FuseMasks { and: 0xF0, or: 0x00 });

        let mut board = new_board("ATmega48");
        let mut recorder = Recorder::default();
        let report = update_image(&mut board, &image, Flags::BATCH, &mut recorder).unwrap();

        // 0xD7 & 0x5F = 0x57, RSTDISBL forced back on.
        assert_eq!(
            board.fuse_writes(),
            &[(FuseByte::High, 0xD7), (FuseByte::Low, 0xE2)]
        );
        assert_eq!(board.fuse(FuseByte::High), 0xD7);
        assert_eq!(report.warnings, vec![
            Warning::FuseSettingsIgnored,
            Warning::FirmwareUnprotected
        ]);
        assert_eq!(recorder.warnings, report.warnings);
    }

    #[test]
    fn test_fuse_safety_net_bypassed() {
        let mut image = FirmwareImage::new().unwrap();
        image.set_fuse_masks(FuseByte::Low, FuseMasks { and: 0xF0, or: 0x00 });

        let mut board = new_board("ATmega48");
        update_image(
            &mut board,
            &image,
            Flags::BATCH | Flags::NO_FUSE_PROTECTION,
            &mut NullFrontend,
        )
        .unwrap();

        assert_eq!(board.fuse_writes(), &[(FuseByte::Low, 0xE0)]);
    }

    #[test]
    fn test_cid_mismatch() {
        let mut image = image_with_flash(&[0x00; 64]);
        image.set_cid(7);

        let mut board = new_board("ATmega48");
        board.set_cid(Some(8));
        let err =
            update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).unwrap_err();
        assert!(matches!(err, Error::Compatibility { running: 8, image: 7 }));
        assert!(board.exchanges().is_empty());
        assert_eq!(board.post_end_count(), 0);

        let report = update_image(
            &mut board,
            &image,
            Flags::BATCH | Flags::CID_OVERRIDE,
            &mut NullFrontend,
        )
        .unwrap();
        assert_eq!(report.pages_written, 1);
    }

    #[test]
    fn test_unknown_running_cid_passes() {
        let image = image_with_flash(&[0x00; 64]);
        let mut board = new_board("ATmega48");
        board.set_cid(None);
        assert!(update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).is_ok());
    }

    /// Board whose firmware revision query fails at the transport level.
    struct NoRevision(SimulatedBoard);

    impl Transport for NoRevision {
        fn connect(&mut self) -> io::Result<()> {
            self.0.connect()
        }

        fn set_select(&mut self, high: bool) -> io::Result<()> {
            self.0.set_select(high)
        }

        fn set_reset(&mut self, high: bool) -> io::Result<()> {
            self.0.set_reset(high)
        }

        fn transfer_byte(&mut self, value: u8, timing: Timing) -> io::Result<u8> {
            self.0.transfer_byte(value, timing)
        }

        fn command(&mut self, write: &[u8], read: &mut [u8]) -> io::Result<Status> {
            if write.first() == Some(&CGBC_CMD_GET_FW_REV) {
                return Err(io::Error::new(io::ErrorKind::Other, "no revision"));
            }
            self.0.command(write, read)
        }

        fn read_register(&mut self, address: u8, register: u8) -> io::Result<u8> {
            self.0.read_register(address, register)
        }

        fn write_register(&mut self, address: u8, register: u8, value: u8) -> io::Result<()> {
            self.0.write_register(address, register, value)
        }

        fn sleep(&mut self, duration: Duration) {
            self.0.sleep(duration)
        }
    }

    #[test]
    fn test_failed_revision_query_is_unknown_cid() {
        let mut image = image_with_flash(&[0x00; 64]);
        image.set_cid(7);

        let mut board = NoRevision(new_board("ATmega48"));
        let mut frontend = Recorder::default();
        let report = update_image(&mut board, &image, Flags::BATCH, &mut frontend).unwrap();

        assert!(frontend.passed.contains(&Phase::CheckingCompatibility));
        assert_eq!(report.pages_written, 1);
        assert_eq!(board.0.page_writes(), &[0]);
    }

    #[test]
    fn test_program_enable_retries_exhausted() {
        let image = image_with_flash(&[0x00; 64]);

        let mut board = new_board("ATmega48");
        board.fail_program_enable(PROG_ENABLE_RETRIES);
        let err =
            update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).unwrap_err();

        assert!(matches!(err, Error::ProgEnable));
        let attempts = board
            .exchanges()
            .iter()
            .filter(|(cmd, _)| *cmd == SPM_PROG_ENABLE)
            .count();
        assert_eq!(attempts, PROG_ENABLE_RETRIES);
        assert_eq!(board.post_end_count(), 1);
        assert!(board.elapsed().as_millis() >= u128::from(RELEASE_DELAY_MS));
    }

    #[test]
    fn test_program_enable_retry_succeeds() {
        let image = image_with_flash(&[0x00; 64]);

        let mut board = new_board("ATmega48");
        board.fail_program_enable(PROG_ENABLE_RETRIES - 1);
        assert!(update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).is_ok());
        assert_eq!(board.post_end_count(), 1);
    }

    fn unprotected_eeprom_board(locked: bool) -> SimulatedBoard {
        let mut board = new_board("ATmega48");
        // EESAVE unprogrammed.
        board.set_fuse(FuseByte::High, 0xDF);
        board.load_eeprom(0, &[0x5A]);
        if locked {
            board.set_locks(0xFC);
        }
        board
    }

    #[test]
    fn test_eesave_checkpoint_in_batch_mode() {
        let image = image_with_flash(&[0x00; 64]);
        let mut board = unprotected_eeprom_board(false);

        let err =
            update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).unwrap_err();
        assert!(matches!(err, Error::BadFuses));
        assert_eq!(board.erase_count(), 0);
        assert_eq!(board.eeprom()[0], 0x5A);
    }

    #[test]
    fn test_eesave_checkpoint_erase_requested() {
        let image = image_with_flash(&[0x00; 64]);
        let mut board = unprotected_eeprom_board(false);

        let report = update_image(
            &mut board,
            &image,
            Flags::BATCH | Flags::EEP_ERASE,
            &mut NullFrontend,
        )
        .unwrap();
        assert!(report.erased);
        assert_eq!(board.eeprom()[0], 0xFF);
    }

    #[test]
    fn test_eesave_preserved_on_request() {
        let image = image_with_flash(&[0x00; 64]);
        let mut board = unprotected_eeprom_board(false);
        let mut recorder = Recorder {
            answers: vec![true],
            ..Recorder::default()
        };

        update_image(&mut board, &image, Flags::empty(), &mut recorder).unwrap();

        assert_eq!(recorder.questions, vec![Question::PreserveEeprom]);
        assert!(recorder.passed.contains(&Phase::ProgrammingEesave));
        assert!(recorder.begun.contains(&Phase::ErasingFlash));
        assert_eq!(board.fuse(FuseByte::High) & 0x08, 0);
        assert_eq!(board.eeprom()[0], 0x5A);
    }

    #[test]
    fn test_eesave_declined_erases_eeprom() {
        let image = image_with_flash(&[0x00; 64]);
        let mut board = unprotected_eeprom_board(false);
        let mut recorder = Recorder {
            answers: vec![false],
            ..Recorder::default()
        };

        update_image(&mut board, &image, Flags::empty(), &mut recorder).unwrap();

        assert!(recorder.begun.contains(&Phase::ErasingFlashAndEeprom));
        assert!(recorder.passed.contains(&Phase::VerifyingCleanEeprom));
        assert_eq!(board.eeprom()[0], 0xFF);
    }

    #[test]
    fn test_locked_device_prompt_declined_aborts() {
        let image = image_with_flash(&[0x00; 64]);
        let mut board = unprotected_eeprom_board(true);
        let mut recorder = Recorder {
            answers: vec![false],
            ..Recorder::default()
        };

        let err = update_image(&mut board, &image, Flags::empty(), &mut recorder).unwrap_err();

        assert!(matches!(err, Error::Aborted));
        assert_eq!(recorder.questions, vec![Question::ContinueWithoutEesave]);
        assert!(recorder.passed.contains(&Phase::CheckingLocksAndFuses));
        assert!(recorder.failed.is_empty());
        assert_eq!(board.erase_count(), 0);
        assert_eq!(board.post_end_count(), 1);
    }

    #[test]
    fn test_locked_device_prompt_accepted() {
        let image = image_with_flash(&[0x00; 64]);
        let mut board = unprotected_eeprom_board(true);
        let mut recorder = Recorder {
            answers: vec![true],
            ..Recorder::default()
        };

        update_image(&mut board, &image, Flags::empty(), &mut recorder).unwrap();
        assert_eq!(board.erase_count(), 1);
        assert_eq!(board.eeprom()[0], 0xFF);
    }

    #[test]
    fn test_manufacturing_window_left_alone() {
        let mut image = FirmwareImage::new().unwrap();
        image.push_eeprom(0x0FF, 0x11).unwrap();
        image.push_eeprom(0x100, 0x22).unwrap();
        image.push_eeprom(0x13F, 0x33).unwrap();
        image.push_eeprom(0x140, 0x44).unwrap();

        let mut board = new_board("ATmega165P");
        let report =
            update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).unwrap();
        assert_eq!(report.eeprom_bytes_written, 2);
        assert_eq!(board.eeprom_writes(), &[0x0FF, 0x140]);

        let mut board = new_board("ATmega165P");
        let report = update_image(
            &mut board,
            &image,
            Flags::BATCH | Flags::MFG_WRITE,
            &mut NullFrontend,
        )
        .unwrap();
        assert_eq!(report.eeprom_bytes_written, 4);
        assert_eq!(board.eeprom()[0x100], 0x22);
    }

    #[test]
    fn test_eeprom_space_checked_before_erase() {
        let mut image = image_with_flash(&[0x00; 64]);
        image.push_eeprom(0x100, 0x01).unwrap();

        let mut board = new_board("ATmega48");
        let err =
            update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).unwrap_err();
        assert!(matches!(err, Error::EepromSpace { required: 0x101, eeprom_size: 256 }));
        assert_eq!(board.erase_count(), 0);
    }

    #[test]
    fn test_flash_space_checked_before_erase() {
        let image = image_with_flash(&[0x00; 8 * 1024]);

        let mut board = new_board("ATmega48");
        let err =
            update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).unwrap_err();
        assert!(matches!(err, Error::FlashSpace { code_size: 8192, flash_size: 4096 }));
        assert_eq!(board.erase_count(), 0);
    }

    #[test]
    fn test_block_protocol() {
        let mut image = FirmwareImage::new().unwrap();
        image.write_flash(0, &[0x11; 256]).unwrap();
        image.write_flash(0x1000, &[0x22; 100]).unwrap();

        let mut board = new_board("MEC1705QSZ");
        let report =
            update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).unwrap();

        assert_eq!(report.pages_written, 2);
        assert!(board.page_writes().is_empty());
        // One page of eight blocks per non erased page.
        assert_eq!(board.block_writes().len(), 16);
        assert_eq!(board.block_writes()[8], 0x1000);
        assert_eq!(&board.flash()[0x1000..0x1064], &[0x22; 100][..]);
        // Explicit program disable on the way out.
        assert_eq!(board.disable_count(), 1);
    }

    #[test]
    fn test_eeprom_verify_mismatch() {
        let mut image = FirmwareImage::new().unwrap();
        // Written twice, the second value wins.
        image.push_eeprom(0x50, 0x00).unwrap();
        image.push_eeprom(0x50, 0xFF).unwrap();

        let mut board = new_board("ATmega48");
        let err =
            update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).unwrap_err();

        assert!(err.is_verification());
        assert!(matches!(
            err,
            Error::VerifyEeprom(Mismatch::Byte {
                offset: 0x50,
                expected: 0x00,
                found: 0xFF
            })
        ));
    }

    #[test]
    fn test_flash_controller_error_falls_back_to_pages() {
        let image = image_with_flash(&[0x00; 64]);

        let mut board = new_board("MEC1701HSZ");
        board.set_flash_controller_error(true);
        let report = update_image(
            &mut board,
            &image,
            Flags::BATCH | Flags::SKIP_VERIFY,
            &mut NullFrontend,
        )
        .unwrap();

        assert!(board.block_writes().is_empty());
        assert_eq!(board.page_writes(), &[0]);
        assert_eq!(report.pages_written, 1);
    }

    #[test]
    fn test_unprotected_firmware_warning() {
        let mut image = image_with_flash(&[0x00; 64]);
        image.set_lock_bits(0xFC);

        let mut board = new_board("ATmega48");
        let report =
            update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).unwrap();
        assert!(report.warnings.is_empty());
        assert_eq!(board.lock_writes(), &[0xFC]);

        let image = image_with_flash(&[0x00; 64]);
        let mut board = new_board("ATmega48");
        let report =
            update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).unwrap();
        assert_eq!(report.warnings, vec![Warning::FirmwareUnprotected]);
    }

    #[test]
    fn test_busy_timeout() {
        let image = image_with_flash(&[0x00; 128]);

        let mut board = new_board("ATmega325P");
        board.set_stuck_busy(true);
        let err =
            update_image(&mut board, &image, Flags::BATCH, &mut NullFrontend).unwrap_err();

        assert!(matches!(err, Error::Erase));
        assert_eq!(err.class(), crate::ErrorClass::Protocol);
        assert_eq!(board.post_end_count(), 1);
    }

    #[test]
    fn test_bootloader_switch() {
        let image = image_with_flash(&[0x00; 64]);

        let mut board = new_board("ATmega48");
        update_image(
            &mut board,
            &image,
            Flags::BATCH | Flags::BOOTLOADER_ENABLE,
            &mut NullFrontend,
        )
        .unwrap();
        assert_eq!(board.flags_register() & CGBC_FLAGS_1_BLDR_ENABLE, 0x08);

        let mut board = new_board("ATmega48");
        board.set_bootloader_switch_supported(false);
        let err = update_image(
            &mut board,
            &image,
            Flags::BATCH | Flags::BOOTLOADER_ENABLE,
            &mut NullFrontend,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ProgEnable));
    }

    #[test]
    fn test_bootblock_update_request() {
        let image = image_with_flash(&[0x00; 128]);

        let mut board = new_board("ATmega165P");
        update_image(
            &mut board,
            &image,
            Flags::BATCH | Flags::BOOTBLOCK_UPDATE,
            &mut NullFrontend,
        )
        .unwrap();
        assert_eq!(board.flags_register() & CGBC_FLAGS_1_BB_UPDATE, 0x80);
    }

    #[test]
    fn test_phases_reported_in_order() {
        let image = image_with_flash(&[0x00; 64]);
        let mut board = new_board("ATmega48");
        let mut recorder = Recorder::default();

        update_image(&mut board, &image, Flags::BATCH, &mut recorder).unwrap();

        assert_eq!(recorder.identified, Some("ATmega48"));
        assert_eq!(
            recorder.begun,
            vec![
                Phase::ConnectingInterface,
                Phase::CheckingCompatibility,
                Phase::EnteringProgrammingMode,
                Phase::CheckingControllerType,
                Phase::CheckingFlashSpace,
                Phase::CheckingLocksAndFuses,
                Phase::ErasingFlash,
                Phase::ProgrammingFlash,
                Phase::VerifyingFlash,
            ]
        );
        assert!(!recorder.passed.contains(&Phase::CheckingControllerType));
        assert!(recorder.failed.is_empty());
    }

    #[test]
    fn test_silent_run() {
        let image = image_with_flash(&[0x00; 64]);
        let mut board = new_board("ATmega48");
        let mut recorder = Recorder::default();

        let report = update_image(
            &mut board,
            &image,
            Flags::BATCH | Flags::SILENT,
            &mut recorder,
        )
        .unwrap();

        assert!(recorder.begun.is_empty());
        assert!(recorder.identified.is_none());
        assert_eq!(recorder.warnings, report.warnings);
    }

    #[test]
    fn test_missing_file() {
        let mut recorder = Recorder::default();
        let err = update(
            new_board("ATmega48"),
            "/nonexistent/cgbcp.dat",
            Flags::BATCH,
            &mut recorder,
        )
        .unwrap_err();

        assert_eq!(err.code(), 5);
        assert_eq!(recorder.failed, vec![Phase::ReadingDataFile]);
    }
}
