//! Hardware contract between the engine and the board.
//!
//! The integrator implements [`Link`] once per platform: raw byte
//! clocking, chip-select, a millisecond clock, and optional slot hints.
//! Everything above this trait is portable.

use crate::time::DateTime;

/// Blocking SPI link to the card slot.
///
/// The required entry points are the engine's only suspension points;
/// they may block but must eventually return. The chip-select line is
/// owned by the card layer: implementations toggle it only when asked.
pub trait Link {
    /// Bring the SPI bus up at (at most) the requested clock rate.
    /// Returns the rate actually achieved in Hz.
    fn spi_init(&mut self, hz: u32) -> u32;

    /// Clock one byte out while clocking one byte in.
    fn transfer(&mut self, byte: u8) -> u8;

    /// Bulk full-duplex transfer. With `tx` absent, clock out `0xFF`
    /// filler; with `rx` absent, discard the incoming bytes. When both
    /// are present they must be the same length.
    fn transfer_bulk(&mut self, tx: Option<&[u8]>, rx: Option<&mut [u8]>);

    /// Pull chip-select low (addressed).
    fn cs_assert(&mut self);

    /// Release chip-select high.
    fn cs_deassert(&mut self);

    /// Block for at least `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32);

    /// Monotonic millisecond counter. Wrapping is fine; the engine only
    /// ever subtracts nearby readings.
    fn millis(&mut self) -> u32;

    /// Card-presence hint. Boards without a detect switch leave the
    /// default, which reports a card as always present.
    fn card_present(&mut self) -> bool {
        true
    }

    /// Write-protect hint; defaults to writable.
    fn write_protected(&mut self) -> bool {
        false
    }

    /// Wall clock for directory timestamps. Boards without an RTC get
    /// the fixed FAT epoch.
    fn now(&mut self) -> DateTime {
        DateTime::EPOCH
    }
}
