//! SD/MMC protocol layer: initialization state machine and raw sector
//! access over a [`Link`].

use crate::config::{ERASE_TIMEOUT_MS, READ_TIMEOUT_MS, SPI_MAX_HZ, WRITE_TIMEOUT_MS};
use crate::error::Error;
use crate::link::Link;
use crate::time::DateTime;
use crate::SECTOR_SIZE;

mod init;
mod io;
mod regs;

pub(crate) const CMD0: u8 = 0; // GO_IDLE_STATE
pub(crate) const CMD1: u8 = 1; // SEND_OP_COND (MMC)
pub(crate) const CMD8: u8 = 8; // SEND_IF_COND
pub(crate) const CMD9: u8 = 9; // SEND_CSD
pub(crate) const CMD10: u8 = 10; // SEND_CID
pub(crate) const CMD12: u8 = 12; // STOP_TRANSMISSION
pub(crate) const CMD16: u8 = 16; // SET_BLOCKLEN
pub(crate) const CMD17: u8 = 17; // READ_SINGLE_BLOCK
pub(crate) const CMD18: u8 = 18; // READ_MULTIPLE_BLOCK
pub(crate) const CMD24: u8 = 24; // WRITE_BLOCK
pub(crate) const CMD25: u8 = 25; // WRITE_MULTIPLE_BLOCK
pub(crate) const CMD32: u8 = 32; // ERASE_WR_BLK_START
pub(crate) const CMD33: u8 = 33; // ERASE_WR_BLK_END
pub(crate) const CMD38: u8 = 38; // ERASE
pub(crate) const CMD55: u8 = 55; // APP_CMD
pub(crate) const CMD58: u8 = 58; // READ_OCR
pub(crate) const ACMD23: u8 = 23; // SET_WR_BLK_ERASE_COUNT
pub(crate) const ACMD41: u8 = 41; // SD_SEND_OP_COND

pub(crate) const R1_IDLE: u8 = 0x01;
pub(crate) const R1_ILLEGAL_CMD: u8 = 0x04;

pub(crate) const TOKEN_SINGLE: u8 = 0xFE;
pub(crate) const TOKEN_MULTI_WRITE: u8 = 0xFC;
pub(crate) const TOKEN_STOP: u8 = 0xFD;

pub(crate) const OCR_CCS: u8 = 0x40; // Card Capacity Status, top OCR byte

/// Detected card flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum CardType {
    /// Nothing initialized yet.
    None,
    /// MultiMediaCard, initialized via CMD1.
    Mmc,
    /// SD v1.x, byte addressed, up to 2 GB.
    SdV1,
    /// SD v2.0 standard capacity.
    SdV2,
    /// High capacity (2-32 GB), block addressed.
    Sdhc,
    /// Extended capacity (beyond 32 GB), block addressed.
    Sdxc,
}

impl CardType {
    /// Human-readable card-type name.
    pub fn name(self) -> &'static str {
        match self {
            CardType::None => "None",
            CardType::Mmc => "MMC",
            CardType::SdV1 => "SD v1.x",
            CardType::SdV2 => "SD v2.0",
            CardType::Sdhc => "SDHC",
            CardType::Sdxc => "SDXC",
        }
    }
}

/// Protocol state machine. Transient per-operation states are visible
/// only while an operation is in flight on the caller's own context, so
/// external observers normally see `Uninit` or `Ready`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum CardState {
    Uninit,
    Idle,
    Initializing,
    Ready,
    Reading,
    MultiReading,
    Writing,
    MultiWriting,
    Erasing,
}

/// An SD/MMC card behind an SPI link.
pub struct SdCard<L: Link> {
    link: L,
    state: CardState,
    card_type: CardType,
    spi_hz: u32,
    capacity: u64,
    sector_count: u32,
    block_size: u16,
    block_addressing: bool,
    cid: [u8; 16],
    csd: [u8; 16],
    reads: u32,
    writes: u32,
    errors: u32,
}

impl<L: Link> SdCard<L> {
    /// Wrap a link. The card is untouched until [`SdCard::init`].
    pub fn new(link: L) -> Self {
        Self {
            link,
            state: CardState::Uninit,
            card_type: CardType::None,
            spi_hz: 0,
            capacity: 0,
            sector_count: 0,
            block_size: SECTOR_SIZE as u16,
            block_addressing: false,
            cid: [0; 16],
            csd: [0; 16],
            reads: 0,
            writes: 0,
            errors: 0,
        }
    }

    /// Forget the card without touching the medium.
    pub fn deinit(&mut self) {
        self.state = CardState::Uninit;
    }

    /// Initialized and still physically present.
    pub fn ready(&mut self) -> bool {
        self.state == CardState::Ready && self.link.card_present()
    }

    /// Re-clock the link, capped at the SPI-mode ceiling. Returns the
    /// rate achieved.
    pub fn set_speed(&mut self, hz: u32) -> u32 {
        let target = hz.min(SPI_MAX_HZ);
        self.spi_hz = self.link.spi_init(target);
        self.spi_hz
    }

    pub fn state(&self) -> CardState {
        self.state
    }

    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Capacity in bytes, from the CSD.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn sector_count(&self) -> u32 {
        self.sector_count
    }

    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    /// True when block-command arguments are sector indices rather than
    /// byte offsets (SDHC/SDXC).
    pub fn block_addressing(&self) -> bool {
        self.block_addressing
    }

    /// Raw 16-byte card identification register.
    pub fn cid(&self) -> &[u8; 16] {
        &self.cid
    }

    /// Raw 16-byte card specific data register.
    pub fn csd(&self) -> &[u8; 16] {
        &self.csd
    }

    /// Current link clock in Hz.
    pub fn spi_hz(&self) -> u32 {
        self.spi_hz
    }

    /// Sectors read since init.
    pub fn reads(&self) -> u32 {
        self.reads
    }

    /// Sectors written since init.
    pub fn writes(&self) -> u32 {
        self.writes
    }

    /// Failed operations since init.
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Borrow the link, e.g. to reach board-specific hints.
    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Give the link back, e.g. to hand the bus to another device.
    pub fn into_link(self) -> L {
        self.link
    }

    pub(crate) fn now(&mut self) -> DateTime {
        self.link.now()
    }

    /// Read one 512-byte sector.
    pub fn read_sector(&mut self, sector: u32, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() != SECTOR_SIZE {
            return Err(Error::InvalidParam);
        }
        self.require_ready()?;
        self.state = CardState::Reading;
        let result = self.read_sector_inner(sector, buf);
        self.finish_op(result)
    }

    /// Read `buf.len() / 512` consecutive sectors, using CMD18 when more
    /// than one is requested.
    pub fn read_sectors(&mut self, sector: u32, buf: &mut [u8]) -> Result<(), Error> {
        if buf.is_empty() || buf.len() % SECTOR_SIZE != 0 {
            return Err(Error::InvalidParam);
        }
        if buf.len() == SECTOR_SIZE {
            return self.read_sector(sector, buf);
        }
        self.require_ready()?;
        self.state = CardState::MultiReading;
        let result = self.read_sectors_inner(sector, buf);
        self.finish_op(result)
    }

    /// Write one 512-byte sector.
    pub fn write_sector(&mut self, sector: u32, buf: &[u8]) -> Result<(), Error> {
        if buf.len() != SECTOR_SIZE {
            return Err(Error::InvalidParam);
        }
        self.require_ready()?;
        if self.link.write_protected() {
            return Err(Error::WriteProtect);
        }
        self.state = CardState::Writing;
        let result = self.write_sector_inner(sector, buf);
        self.finish_op(result)
    }

    /// Write `buf.len() / 512` consecutive sectors, using CMD25 when more
    /// than one is supplied.
    pub fn write_sectors(&mut self, sector: u32, buf: &[u8]) -> Result<(), Error> {
        if buf.is_empty() || buf.len() % SECTOR_SIZE != 0 {
            return Err(Error::InvalidParam);
        }
        if buf.len() == SECTOR_SIZE {
            return self.write_sector(sector, buf);
        }
        self.require_ready()?;
        if self.link.write_protected() {
            return Err(Error::WriteProtect);
        }
        self.state = CardState::MultiWriting;
        let result = self.write_sectors_inner(sector, buf);
        self.finish_op(result)
    }

    /// Erase the inclusive sector range `start..=end`.
    pub fn erase(&mut self, start: u32, end: u32) -> Result<(), Error> {
        if end < start {
            return Err(Error::InvalidParam);
        }
        self.require_ready()?;
        if self.link.write_protected() {
            return Err(Error::WriteProtect);
        }
        self.state = CardState::Erasing;
        let result = self.erase_inner(start, end);
        self.finish_op(result)
    }

    /// Sector index to wire address, depending on the addressing mode.
    fn address(&self, sector: u32) -> u32 {
        if self.block_addressing {
            sector
        } else {
            sector.wrapping_mul(SECTOR_SIZE as u32)
        }
    }

    /// Card removal is checked at the start of every external operation;
    /// a pulled card drops the state machine back to `Uninit`.
    fn require_ready(&mut self) -> Result<(), Error> {
        if !self.link.card_present() {
            self.state = CardState::Uninit;
            return Err(Error::NoCard);
        }
        if self.state != CardState::Ready {
            return Err(Error::Init);
        }
        Ok(())
    }

    fn finish_op(&mut self, result: Result<(), Error>) -> Result<(), Error> {
        if self.state != CardState::Uninit {
            self.state = CardState::Ready;
        }
        if result.is_err() {
            self.errors = self.errors.wrapping_add(1);
        }
        result
    }

    fn erase_inner(&mut self, start: u32, end: u32) -> Result<(), Error> {
        let start_addr = self.address(start);
        let end_addr = self.address(end);

        let r1 = self.command(CMD32, start_addr);
        self.end_transaction();
        if r1 != 0 {
            return Err(Error::Command);
        }

        let r1 = self.command(CMD33, end_addr);
        self.end_transaction();
        if r1 != 0 {
            return Err(Error::Command);
        }

        let r1 = self.command(CMD38, 0);
        if r1 != 0 {
            self.end_transaction();
            return Err(Error::Command);
        }
        if !self.wait_ready(ERASE_TIMEOUT_MS) {
            self.end_transaction();
            return Err(Error::Timeout);
        }
        self.end_transaction();
        Ok(())
    }

    fn read_sector_inner(&mut self, sector: u32, buf: &mut [u8]) -> Result<(), Error> {
        let addr = self.address(sector);
        let r1 = self.command(CMD17, addr);
        if r1 != 0 {
            self.end_transaction();
            trace!("CMD17 rejected: {:#04x}", r1);
            return Err(Error::Command);
        }

        let token = self.wait_token(READ_TIMEOUT_MS);
        if token != TOKEN_SINGLE {
            self.end_transaction();
            return Err(io::classify_read_token(token));
        }

        self.link.transfer_bulk(None, Some(buf));
        self.discard_crc();
        self.end_transaction();
        self.reads = self.reads.wrapping_add(1);
        Ok(())
    }

    fn read_sectors_inner(&mut self, sector: u32, buf: &mut [u8]) -> Result<(), Error> {
        let addr = self.address(sector);
        let r1 = self.command(CMD18, addr);
        if r1 != 0 {
            self.end_transaction();
            return Err(Error::Command);
        }

        let mut result = Ok(());
        for chunk in buf.chunks_exact_mut(SECTOR_SIZE) {
            let token = self.wait_token(READ_TIMEOUT_MS);
            if token != TOKEN_SINGLE {
                result = Err(io::classify_read_token(token));
                break;
            }
            self.link.transfer_bulk(None, Some(chunk));
            self.discard_crc();
            self.reads = self.reads.wrapping_add(1);
        }

        // Stop transmission regardless of how the block loop ended.
        self.command(CMD12, 0);
        self.wait_ready(READ_TIMEOUT_MS);
        self.end_transaction();
        result
    }

    fn write_sector_inner(&mut self, sector: u32, buf: &[u8]) -> Result<(), Error> {
        let addr = self.address(sector);
        let r1 = self.command(CMD24, addr);
        if r1 != 0 {
            self.end_transaction();
            trace!("CMD24 rejected: {:#04x}", r1);
            return Err(Error::Command);
        }

        self.link.transfer(0xFF);
        self.link.transfer(TOKEN_SINGLE);
        self.link.transfer_bulk(Some(buf), None);
        self.discard_crc();

        let response = self.link.transfer(0xFF) & 0x1F;
        if response != 0x05 {
            self.end_transaction();
            warn!("write data rejected: {:#04x}", response);
            return Err(Error::Spi);
        }

        if !self.wait_ready(WRITE_TIMEOUT_MS) {
            self.end_transaction();
            return Err(Error::Timeout);
        }
        self.end_transaction();
        self.writes = self.writes.wrapping_add(1);
        Ok(())
    }

    fn write_sectors_inner(&mut self, sector: u32, buf: &[u8]) -> Result<(), Error> {
        // Pre-erase hint; cards that reject it still accept the write.
        let count = (buf.len() / SECTOR_SIZE) as u32;
        self.acmd(ACMD23, count);
        self.end_transaction();

        let addr = self.address(sector);
        let r1 = self.command(CMD25, addr);
        if r1 != 0 {
            self.end_transaction();
            return Err(Error::Command);
        }

        let mut result = Ok(());
        for chunk in buf.chunks_exact(SECTOR_SIZE) {
            self.link.transfer(0xFF);
            self.link.transfer(TOKEN_MULTI_WRITE);
            self.link.transfer_bulk(Some(chunk), None);
            self.discard_crc();

            let response = self.link.transfer(0xFF) & 0x1F;
            if response != 0x05 {
                result = Err(Error::Spi);
                break;
            }
            if !self.wait_ready(WRITE_TIMEOUT_MS) {
                result = Err(Error::Timeout);
                break;
            }
            self.writes = self.writes.wrapping_add(1);
        }

        self.link.transfer(TOKEN_STOP);
        self.link.transfer(0xFF);
        self.wait_ready(WRITE_TIMEOUT_MS);
        self.end_transaction();
        result
    }
}
