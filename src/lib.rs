//! SD/MMC SPI driver with a FAT12/16/32 filesystem engine.
//!
//! The crate is split into two layers joined by a hardware contract:
//!
//! - [`link::Link`] — the SPI/clock/chip-select seam the integrator
//!   implements for their board.
//! - [`card::SdCard`] — SD/MMC initialization and raw 512-byte sector
//!   access over that link.
//! - [`fat::Volume`] — the FAT volume engine: mount, directories, long
//!   file names, path resolution and byte-granular file I/O.
//!
//! All card and volume operations are blocking and run to completion on
//! the caller's context; the only points the engine waits at are the
//! `Link` entry points.

#![cfg_attr(not(test), no_std)]

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Enable at most one of the `log` and `defmt-log` features");

#[cfg(feature = "defmt-log")]
macro_rules! trace {
    ($($arg:tt)+) => (defmt::trace!($($arg)+));
}
#[cfg(feature = "defmt-log")]
macro_rules! debug {
    ($($arg:tt)+) => (defmt::debug!($($arg)+));
}
#[cfg(feature = "defmt-log")]
macro_rules! warn {
    ($($arg:tt)+) => (defmt::warn!($($arg)+));
}

#[cfg(feature = "log")]
macro_rules! trace {
    ($($arg:tt)+) => (log::trace!($($arg)+));
}
#[cfg(feature = "log")]
macro_rules! debug {
    ($($arg:tt)+) => (log::debug!($($arg)+));
}
#[cfg(feature = "log")]
macro_rules! warn {
    ($($arg:tt)+) => (log::warn!($($arg)+));
}

#[cfg(not(any(feature = "defmt-log", feature = "log")))]
macro_rules! trace {
    ($($arg:tt)+) => {{
        let _ = format_args!($($arg)+);
    }};
}
#[cfg(not(any(feature = "defmt-log", feature = "log")))]
macro_rules! debug {
    ($($arg:tt)+) => {{
        let _ = format_args!($($arg)+);
    }};
}
#[cfg(not(any(feature = "defmt-log", feature = "log")))]
macro_rules! warn {
    ($($arg:tt)+) => {{
        let _ = format_args!($($arg)+);
    }};
}

pub mod card;
pub mod config;
pub mod error;
pub mod fat;
pub mod link;
pub mod time;

pub use card::{CardState, CardType, SdCard};
pub use error::Error;
pub use fat::{Dir, FatType, File, FileInfo, OpenMode, SeekFrom, Volume, VolumeInfo};
pub use link::Link;
pub use time::DateTime;

/// Sector size in bytes. SD cards in SPI mode always transfer 512-byte
/// blocks and the FAT layout here assumes the same.
pub const SECTOR_SIZE: usize = 512;
