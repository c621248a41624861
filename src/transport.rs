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

//! # Transport
//!
//! The programmer talks to the board controller through two channels: a bit
//! banged SPI link carrying the ISP command words, and the board controller
//! command interface used for status queries and the fast block protocol.
//! Hardware drivers implement [`Transport`], tests use
//! [`SimulatedBoard`](crate::sim::SimulatedBoard).

use std::{fmt, io, thread, time::Duration};

use crate::constants::{
    CGBC_DAT_CNT_MSK, CGBC_DAT_PENDING, CGBC_RDY_STAT, CGBC_STAT_MSK,
    DEFAULT_BYTE_DELAY, DEFAULT_EDGE_DELAY,
};

/// SPI clock timing used for each transferred byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub edge_delay: u32,
    pub byte_delay: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            edge_delay: DEFAULT_EDGE_DELAY,
            byte_delay: DEFAULT_BYTE_DELAY,
        }
    }
}

/// Status byte returned by a board controller command.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u8);

impl Status {
    /// Status of a completed command with `pending` response bytes.
    pub fn ready(pending: usize) -> Status {
        match pending {
            0 => Status(CGBC_RDY_STAT),
            n => Status(
                CGBC_RDY_STAT | CGBC_DAT_PENDING | ((n - 1) as u8 & CGBC_DAT_CNT_MSK),
            ),
        }
    }

    #[inline]
    pub fn is_ready(self) -> bool {
        self.0 & CGBC_STAT_MSK == CGBC_RDY_STAT
    }

    /// Number of response bytes minus one, `None` when the command
    /// failed or returned nothing.
    #[inline]
    pub fn data_count(self) -> Option<u8> {
        if self.is_ready() && self.0 & CGBC_DAT_PENDING != 0 {
            Some(self.0 & CGBC_DAT_CNT_MSK)
        } else {
            None
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status({:#04X})", self.0)
    }
}

/// Access to the board controller.
///
/// All methods block until the hardware answered. Implementations are not
/// expected to be reentrant, the programmer holds exclusive use of the
/// transport for a whole run.
pub trait Transport {
    /// Open the system interface.
    fn connect(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Drive the slave select line of the ISP link.
    fn set_select(&mut self, high: bool) -> io::Result<()>;

    /// Drive the reset line of the target controller.
    fn set_reset(&mut self, high: bool) -> io::Result<()>;

    /// Shift one byte out and return the byte shifted in.
    fn transfer_byte(&mut self, value: u8, timing: Timing) -> io::Result<u8>;

    /// Exchange a 32-bit ISP command word, most significant byte first.
    fn exchange32(&mut self, command: u32, timing: Timing) -> io::Result<u32> {
        let mut response = 0u32;
        for byte in command.to_be_bytes().iter() {
            response = (response << 8) | u32::from(self.transfer_byte(*byte, timing)?);
        }
        Ok(response)
    }

    /// Send a board controller command, filling `read` with the response.
    fn command(&mut self, write: &[u8], read: &mut [u8]) -> io::Result<Status>;

    /// Read a register of a device on the board controller internal bus.
    fn read_register(&mut self, address: u8, register: u8) -> io::Result<u8>;

    /// Write a register of a device on the board controller internal bus.
    fn write_register(
        &mut self,
        address: u8,
        register: u8,
        value: u8,
    ) -> io::Result<()>;

    /// Wait, all protocol delays go through here.
    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn connect(&mut self) -> io::Result<()> {
        (**self).connect()
    }

    fn set_select(&mut self, high: bool) -> io::Result<()> {
        (**self).set_select(high)
    }

    fn set_reset(&mut self, high: bool) -> io::Result<()> {
        (**self).set_reset(high)
    }

    fn transfer_byte(&mut self, value: u8, timing: Timing) -> io::Result<u8> {
        (**self).transfer_byte(value, timing)
    }

    fn exchange32(&mut self, command: u32, timing: Timing) -> io::Result<u32> {
        (**self).exchange32(command, timing)
    }

    fn command(&mut self, write: &[u8], read: &mut [u8]) -> io::Result<Status> {
        (**self).command(write, read)
    }

    fn read_register(&mut self, address: u8, register: u8) -> io::Result<u8> {
        (**self).read_register(address, register)
    }

    fn write_register(
        &mut self,
        address: u8,
        register: u8,
        value: u8,
    ) -> io::Result<()> {
        (**self).write_register(address, register, value)
    }

    fn sleep(&mut self, duration: Duration) {
        (**self).sleep(duration)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_decoding() {
        let status = Status(0x40 | 0x20 | 0x03);
        assert!(status.is_ready());
        assert_eq!(status.data_count(), Some(3));

        assert_eq!(Status(0x40).data_count(), None);
        assert_eq!(Status(0x80 | 0x20 | 0x03).data_count(), None);
        assert!(!Status(0xC0).is_ready());
    }

    #[test]
    fn test_status_ready() {
        assert_eq!(Status::ready(0), Status(0x40));
        assert_eq!(Status::ready(5).data_count(), Some(4));
        assert_eq!(Status::ready(32).data_count(), Some(31));
    }

    struct Echo(Vec<u8>);

    impl Transport for Echo {
        fn set_select(&mut self, _high: bool) -> io::Result<()> {
            Ok(())
        }

        fn set_reset(&mut self, _high: bool) -> io::Result<()> {
            Ok(())
        }

        fn transfer_byte(&mut self, value: u8, _timing: Timing) -> io::Result<u8> {
            self.0.push(value);
            Ok(value.wrapping_add(1))
        }

        fn command(&mut self, _write: &[u8], _read: &mut [u8]) -> io::Result<Status> {
            Ok(Status::ready(0))
        }

        fn read_register(&mut self, _address: u8, _register: u8) -> io::Result<u8> {
            Ok(0)
        }

        fn write_register(&mut self, _: u8, _: u8, _: u8) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_exchange32_is_msb_first() {
        let mut echo = Echo(Vec::new());
        let response = echo.exchange32(0xAC53_0000, Timing::default()).unwrap();
        assert_eq!(echo.0, vec![0xAC, 0x53, 0x00, 0x00]);
        assert_eq!(response, 0xAD54_0101);
    }
}
