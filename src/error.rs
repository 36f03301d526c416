//! Crate-wide error taxonomy.

/// Everything that can go wrong between the SPI wire and a file handle.
///
/// Hardware kinds come out of the card layer, filesystem and file kinds
/// out of the volume engine. Every kind has a stable short label for
/// shells and logs, see [`Error::label`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// No card detected in the slot.
    NoCard,
    /// SPI transfer or data-response failure.
    Spi,
    /// Operation did not complete within its timeout.
    Timeout,
    /// CRC check failed.
    Crc,
    /// Card rejected the 2.7-3.6 V range.
    Voltage,
    /// Initialization sequence failed.
    Init,
    /// Command returned a nonzero R1 after initialization.
    Command,
    /// Card is write protected.
    WriteProtect,
    /// Card stayed busy.
    Busy,
    /// Data read failed (error token).
    Read,
    /// Data write failed.
    Write,
    /// Erase sequence failed.
    Erase,

    /// No filesystem signature found.
    NoFs,
    /// Boot record present but invalid.
    InvalidFs,
    /// Recognizable but not a FAT filesystem.
    NotFat,
    /// FAT table is corrupt (cyclic or out-of-range chain).
    FatCorrupt,
    /// No free clusters left.
    Full,
    /// Fixed FAT12/16 root directory is full.
    RootFull,

    /// Path component not found.
    NotFound,
    /// Target already exists.
    Exists,
    /// Expected a file, found a directory.
    NotFile,
    /// Expected a directory, found a file.
    NotDir,
    /// Directory has entries besides `.` and `..`.
    DirNotEmpty,
    /// Name cannot be expressed as an 8.3 entry.
    InvalidName,
    /// Path exceeds [`crate::config::MAX_PATH`].
    PathTooLong,
    /// Too many open handles.
    TooManyOpen,
    /// Handle is closed or was never opened.
    InvalidHandle,
    /// Read started at or past end of file.
    Eof,
    /// Write attempted on a read-only handle.
    ReadOnly,
    /// Seek target out of range.
    Seek,
    /// File is locked by another handle.
    Locked,

    /// Invalid argument.
    InvalidParam,
    /// Out of memory.
    OutOfMemory,
    /// Volume is not mounted.
    NotMounted,
    /// Volume is already mounted.
    AlreadyMounted,
    /// Feature not supported by this build.
    NotSupported,
    /// Unclassified failure.
    General,
    /// Engine bug; should not be reachable.
    Internal,
}

impl Error {
    /// Stable short English label for this kind.
    pub fn label(self) -> &'static str {
        match self {
            Error::NoCard => "no card",
            Error::Spi => "SPI error",
            Error::Timeout => "timeout",
            Error::Crc => "CRC error",
            Error::Voltage => "voltage not supported",
            Error::Init => "init failed",
            Error::Command => "command failed",
            Error::WriteProtect => "write protected",
            Error::Busy => "card busy",
            Error::Read => "read error",
            Error::Write => "write error",
            Error::Erase => "erase error",
            Error::NoFs => "no filesystem",
            Error::InvalidFs => "invalid filesystem",
            Error::NotFat => "not a FAT filesystem",
            Error::FatCorrupt => "FAT corrupt",
            Error::Full => "filesystem full",
            Error::RootFull => "root directory full",
            Error::NotFound => "not found",
            Error::Exists => "already exists",
            Error::NotFile => "not a file",
            Error::NotDir => "not a directory",
            Error::DirNotEmpty => "directory not empty",
            Error::InvalidName => "invalid name",
            Error::PathTooLong => "path too long",
            Error::TooManyOpen => "too many open files",
            Error::InvalidHandle => "invalid handle",
            Error::Eof => "end of file",
            Error::ReadOnly => "read only",
            Error::Seek => "seek error",
            Error::Locked => "file locked",
            Error::InvalidParam => "invalid parameter",
            Error::OutOfMemory => "out of memory",
            Error::NotMounted => "not mounted",
            Error::AlreadyMounted => "already mounted",
            Error::NotSupported => "not supported",
            Error::General => "general error",
            Error::Internal => "internal error",
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}
