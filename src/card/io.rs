//! Command framing, response polling and data-token plumbing.

use super::{SdCard, CMD55, TOKEN_SINGLE};
use crate::config::READ_TIMEOUT_MS;
use crate::error::Error;
use crate::link::Link;

/// CRC-7 over polynomial x^7 + x^3 + 1, shifted left with the mandatory
/// stop bit. Required by the card for CMD0 and CMD8; we frame every
/// command with it since the cost is negligible.
pub(super) fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        let mut d = byte;
        for _ in 0..8 {
            crc <<= 1;
            if (d & 0x80) ^ (crc & 0x80) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

/// Map a failed data-token wait to an error kind. `0xFF` means the token
/// never arrived; a byte with the high three bits clear is an error token
/// carrying the failure class.
pub(super) fn classify_read_token(token: u8) -> Error {
    if token == 0xFF {
        return Error::Timeout;
    }
    if token & 0xE0 == 0 {
        if token & 0x08 != 0 {
            // Address out of range.
            return Error::Command;
        }
        if token & 0x04 != 0 {
            // Card ECC failed.
            return Error::Read;
        }
        if token & 0x02 != 0 {
            return Error::Crc;
        }
        return Error::Read;
    }
    Error::Spi
}

impl<L: Link> SdCard<L> {
    /// Send a 6-byte command frame and poll for the R1 byte. Chip-select
    /// stays asserted so response payloads and data tokens can follow;
    /// callers finish with [`SdCard::end_transaction`].
    pub(super) fn command(&mut self, cmd: u8, arg: u32) -> u8 {
        let mut frame = [
            0x40 | cmd,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            0,
        ];
        frame[5] = crc7(&frame[..5]);

        self.link.cs_assert();
        for byte in frame {
            self.link.transfer(byte);
        }

        // R1 arrives within 8 clocks; its top bit is always clear.
        let mut r1 = 0xFF;
        for _ in 0..8 {
            r1 = self.link.transfer(0xFF);
            if r1 & 0x80 == 0 {
                break;
            }
        }
        r1
    }

    /// CMD55-prefixed application command.
    pub(super) fn acmd(&mut self, cmd: u8, arg: u32) -> u8 {
        let r1 = self.command(CMD55, 0);
        self.end_transaction();
        if r1 > 1 {
            return r1;
        }
        self.command(cmd, arg)
    }

    /// Read `buf.len()` further response bytes (R3/R7 payloads).
    pub(super) fn read_extra(&mut self, buf: &mut [u8]) {
        for slot in buf.iter_mut() {
            *slot = self.link.transfer(0xFF);
        }
    }

    /// Release chip-select and clock one trailing byte so the card lets
    /// go of its output line.
    pub(super) fn end_transaction(&mut self) {
        self.link.cs_deassert();
        self.link.transfer(0xFF);
    }

    /// Poll for a data token. Returns the first non-`0xFF` byte, or
    /// `0xFF` if the timeout elapsed first.
    pub(super) fn wait_token(&mut self, timeout_ms: u32) -> u8 {
        let start = self.link.millis();
        loop {
            let token = self.link.transfer(0xFF);
            if token != 0xFF {
                return token;
            }
            if self.link.millis().wrapping_sub(start) >= timeout_ms {
                return 0xFF;
            }
        }
    }

    /// Poll until the card releases its busy signal (drives `0xFF`).
    pub(super) fn wait_ready(&mut self, timeout_ms: u32) -> bool {
        let start = self.link.millis();
        loop {
            if self.link.transfer(0xFF) == 0xFF {
                return true;
            }
            if self.link.millis().wrapping_sub(start) >= timeout_ms {
                return false;
            }
        }
    }

    /// Read a 16-byte register (CSD/CID) over the data-token protocol.
    /// The caller has already issued the command and checked R1.
    pub(super) fn read_register(&mut self, out: &mut [u8; 16]) -> Result<(), Error> {
        let token = self.wait_token(READ_TIMEOUT_MS);
        if token != TOKEN_SINGLE {
            return Err(classify_read_token(token));
        }
        self.link.transfer_bulk(None, Some(out));
        self.discard_crc();
        Ok(())
    }

    /// Clock past the 16-bit data CRC, which SPI mode leaves unchecked.
    pub(super) fn discard_crc(&mut self) {
        self.link.transfer(0xFF);
        self.link.transfer(0xFF);
    }
}
