//! Card bring-up: the identification and capacity discovery sequence.

use super::{
    CardState, CardType, SdCard, ACMD41, CMD0, CMD1, CMD10, CMD16, CMD58, CMD8, CMD9, OCR_CCS,
    R1_IDLE, R1_ILLEGAL_CMD,
};
use crate::config::{INIT_TIMEOUT_MS, SPI_FAST_HZ, SPI_INIT_HZ, SPI_MAX_HZ};
use crate::error::Error;
use crate::link::Link;
use crate::SECTOR_SIZE;

const SDXC_THRESHOLD_BYTES: u64 = 32 * 1024 * 1024 * 1024;

impl<L: Link> SdCard<L> {
    /// Run the full initialization sequence and ramp the link to
    /// `fast_hz` (0 picks the default data clock, capped at 25 MHz).
    ///
    /// Identification happens at 400 kHz: wake clocks, CMD0 reset, CMD8
    /// voltage check (which also splits v1 from v2 cards), the ACMD41
    /// loop with a CMD1 fallback for MMC, then OCR, CSD and CID reads.
    pub fn init(&mut self, fast_hz: u32) -> Result<(), Error> {
        self.state = CardState::Uninit;
        self.card_type = CardType::None;
        self.capacity = 0;
        self.sector_count = 0;
        self.block_size = SECTOR_SIZE as u16;
        self.block_addressing = false;
        self.cid = [0; 16];
        self.csd = [0; 16];
        self.reads = 0;
        self.writes = 0;
        self.errors = 0;

        if !self.link.card_present() {
            debug!("init: no card detected");
            return Err(Error::NoCard);
        }

        self.spi_hz = self.link.spi_init(SPI_INIT_HZ);
        debug!("init: link at {} Hz", self.spi_hz);

        // The card needs at least 74 clocks without being addressed
        // before it accepts commands.
        self.link.delay_ms(10);
        self.link.cs_deassert();
        for _ in 0..10 {
            self.link.transfer(0xFF);
        }

        let r1 = self.command(CMD0, 0);
        self.end_transaction();
        if r1 != R1_IDLE {
            debug!("init: CMD0 failed: {:#04x}", r1);
            return Err(Error::Init);
        }
        self.state = CardState::Idle;

        // CMD8 argument: 2.7-3.6 V range plus the 0xAA echo pattern.
        let r1 = self.command(CMD8, 0x0000_01AA);
        if r1 == R1_IDLE {
            let mut r7 = [0u8; 4];
            self.read_extra(&mut r7);
            self.end_transaction();
            if r7[2] != 0x01 || r7[3] != 0xAA {
                debug!("init: CMD8 echo mismatch");
                return Err(Error::Voltage);
            }
            self.card_type = CardType::SdV2;
        } else if r1 & R1_ILLEGAL_CMD != 0 {
            self.end_transaction();
            self.card_type = CardType::SdV1;
        } else {
            self.end_transaction();
            return Err(Error::Init);
        }

        self.state = CardState::Initializing;
        let acmd41_arg = if self.card_type == CardType::SdV2 {
            // Host supports high capacity.
            0x4000_0000
        } else {
            0
        };
        let start = self.link.millis();
        let mut r1;
        loop {
            r1 = self.acmd(ACMD41, acmd41_arg);
            self.end_transaction();
            if r1 == 0 {
                break;
            }
            if r1 & R1_ILLEGAL_CMD != 0 {
                // Not an SD card; MMC initializes with CMD1 instead.
                let cmd1_r1 = self.command(CMD1, 0);
                self.end_transaction();
                if cmd1_r1 == 0 {
                    self.card_type = CardType::Mmc;
                    r1 = 0;
                    break;
                }
            }
            self.link.delay_ms(10);
            if self.link.millis().wrapping_sub(start) >= INIT_TIMEOUT_MS {
                break;
            }
        }
        if r1 != 0 {
            debug!("init: ACMD41 timed out: {:#04x}", r1);
            return Err(Error::Timeout);
        }

        if self.card_type == CardType::SdV2 {
            let r1 = self.command(CMD58, 0);
            if r1 == 0 {
                let mut ocr = [0u8; 4];
                self.read_extra(&mut ocr);
                self.end_transaction();
                if ocr[0] & OCR_CCS != 0 {
                    self.block_addressing = true;
                    self.card_type = CardType::Sdhc;
                }
            } else {
                self.end_transaction();
            }
        }

        if !self.block_addressing {
            let r1 = self.command(CMD16, SECTOR_SIZE as u32);
            self.end_transaction();
            if r1 != 0 {
                debug!("init: CMD16 rejected: {:#04x}", r1);
            }
        }

        self.read_csd()?;
        self.read_cid()?;

        let target = if fast_hz == 0 { SPI_FAST_HZ } else { fast_hz };
        self.spi_hz = self.link.spi_init(target.min(SPI_MAX_HZ));

        self.state = CardState::Ready;
        debug!(
            "init: {} at {} Hz, {} bytes ({} sectors)",
            self.card_type.name(),
            self.spi_hz,
            self.capacity,
            self.sector_count
        );
        Ok(())
    }

    fn read_csd(&mut self) -> Result<(), Error> {
        let r1 = self.command(CMD9, 0);
        if r1 != 0 {
            self.end_transaction();
            return Err(Error::Init);
        }
        let mut csd = [0u8; 16];
        let read = self.read_register(&mut csd);
        self.end_transaction();
        read?;
        self.csd = csd;

        let sectors = super::regs::csd_sector_count(&csd).ok_or(Error::Init)?;
        self.sector_count = sectors;
        self.capacity = u64::from(sectors) * SECTOR_SIZE as u64;
        if self.capacity > SDXC_THRESHOLD_BYTES {
            self.card_type = CardType::Sdxc;
        }
        Ok(())
    }

    fn read_cid(&mut self) -> Result<(), Error> {
        let r1 = self.command(CMD10, 0);
        if r1 != 0 {
            self.end_transaction();
            return Err(Error::Init);
        }
        let mut cid = [0u8; 16];
        let read = self.read_register(&mut cid);
        self.end_transaction();
        read?;
        self.cid = cid;
        Ok(())
    }
}
