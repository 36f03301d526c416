//! Build-time tunables.
//!
//! These mirror the limits the engine was sized for; reduce the path and
//! name maxima to trade capability for RAM on very small targets.

/// Maximum printable path length, including the leading `/`.
pub const MAX_PATH: usize = 256;

/// Maximum file name length (8.3 needs 12, LFN runs up to 255).
pub const MAX_NAME: usize = 255;

/// Maximum long-file-name fragments per entry (13 UTF-16 units each).
pub const MAX_LFN_SLOTS: usize = 20;

/// SPI clock used for card detection. The SD specification caps the
/// identification phase at 400 kHz.
pub const SPI_INIT_HZ: u32 = 400_000;

/// Default data clock after initialization when the caller passes 0.
pub const SPI_FAST_HZ: u32 = 4_000_000;

/// Hard ceiling on the data clock; SPI-mode cards top out at 25 MHz.
pub const SPI_MAX_HZ: u32 = 25_000_000;

/// Card initialization (ACMD41 loop) timeout.
pub const INIT_TIMEOUT_MS: u32 = 1_000;

/// Single data-token read timeout.
pub const READ_TIMEOUT_MS: u32 = 200;

/// Per-sector write/busy timeout.
pub const WRITE_TIMEOUT_MS: u32 = 500;

/// Erase completion timeout. Large erase ranges are genuinely slow.
pub const ERASE_TIMEOUT_MS: u32 = 30_000;
