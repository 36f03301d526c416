//! Shared test fixtures: a byte-level SPI SD-card simulator behind the
//! `Link` trait, and FAT12/16/32 image builders.

#![allow(dead_code)]

use std::collections::VecDeque;

use byteorder::{ByteOrder, LittleEndian};
use sdfs::{DateTime, Link};

pub const SECTOR: usize = 512;

/// What flavor of card the simulator pretends to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimCard {
    /// CMD8 rejected with the illegal-command bit, byte addressed.
    SdV1,
    /// CMD8 accepted, standard capacity (OCR CCS clear), byte addressed.
    SdV2,
    /// CMD8 accepted, CCS set, block addressed.
    Sdhc,
    /// CMD8 and ACMD41 rejected; initializes via CMD1.
    Mmc,
}

struct WriteState {
    lba: u32,
    multi: bool,
    token_seen: bool,
    collected: Vec<u8>,
}

/// In-memory SD card that speaks the SPI-mode protocol one byte at a
/// time, backed by a plain sector vector.
pub struct SimLink {
    pub image: Vec<u8>,
    pub kind: SimCard,
    pub present: bool,
    pub write_protect: bool,
    pub wall_clock: DateTime,
    millis: u32,
    spi_hz: u32,
    cs_low: bool,
    idle: bool,
    acmd41_polls_left: u32,
    app_cmd: bool,
    cmd: [u8; 6],
    cmd_len: usize,
    out: VecDeque<u8>,
    write: Option<WriteState>,
    multi_read: Option<u32>,
    erase_start: Option<u32>,
    erase_end: Option<u32>,
}

fn crc7(data: &[u8]) -> u8 {
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

impl SimLink {
    pub fn new(kind: SimCard, image: Vec<u8>) -> Self {
        assert_eq!(image.len() % SECTOR, 0, "image must be sector aligned");
        Self {
            image,
            kind,
            present: true,
            write_protect: false,
            wall_clock: DateTime {
                year: 2024,
                month: 3,
                day: 15,
                hour: 10,
                minute: 30,
                second: 24,
            },
            millis: 0,
            spi_hz: 0,
            cs_low: false,
            idle: false,
            acmd41_polls_left: 2,
            app_cmd: false,
            cmd: [0; 6],
            cmd_len: 0,
            out: VecDeque::new(),
            write: None,
            multi_read: None,
            erase_start: None,
            erase_end: None,
        }
    }

    pub fn sector(&self, lba: u32) -> &[u8] {
        &self.image[lba as usize * SECTOR..(lba as usize + 1) * SECTOR]
    }

    fn block_addressed(&self) -> bool {
        self.kind == SimCard::Sdhc
    }

    fn addr_to_lba(&self, arg: u32) -> u32 {
        if self.block_addressed() {
            arg
        } else {
            arg / SECTOR as u32
        }
    }

    fn respond(&mut self, r1: u8) {
        self.out.push_back(0xFF);
        self.out.push_back(r1);
    }

    fn respond_with(&mut self, r1: u8, extra: &[u8]) {
        self.respond(r1);
        self.out.extend(extra.iter().copied());
    }

    fn push_data_block(&mut self, data: &[u8]) {
        self.out.push_back(0xFF);
        self.out.push_back(0xFE);
        self.out.extend(data.iter().copied());
        self.out.push_back(0x00);
        self.out.push_back(0x00);
    }

    fn push_sector(&mut self, lba: u32) {
        let start = lba as usize * SECTOR;
        assert!(
            start + SECTOR <= self.image.len(),
            "read past end of simulated card: lba {lba}"
        );
        let sector: Vec<u8> = self.image[start..start + SECTOR].to_vec();
        self.push_data_block(&sector);
    }

    fn make_csd(&self) -> [u8; 16] {
        let sectors = (self.image.len() / SECTOR) as u32;
        let mut csd = [0u8; 16];
        if self.block_addressed() {
            // CSD v2: C_SIZE in 512 KiB units.
            assert_eq!(sectors % 1024, 0, "SDHC sim image must be 512 KiB aligned");
            let c_size = sectors / 1024 - 1;
            csd[0] = 0x40;
            csd[7] = ((c_size >> 16) & 0x3F) as u8;
            csd[8] = (c_size >> 8) as u8;
            csd[9] = c_size as u8;
        } else {
            // CSD v1 with READ_BL_LEN = 9; find a multiplier that fits.
            let mut mult = 0u32;
            loop {
                assert!(mult <= 7, "cannot encode sim capacity in CSD v1");
                let unit = 1u32 << (mult + 2);
                if sectors % unit == 0 && sectors / unit <= 4096 {
                    break;
                }
                mult += 1;
            }
            let c_size = sectors / (1 << (mult + 2)) - 1;
            csd[5] = 9;
            csd[6] = ((c_size >> 10) & 0x03) as u8;
            csd[7] = (c_size >> 2) as u8;
            csd[8] = ((c_size & 0x03) as u8) << 6;
            csd[9] = ((mult >> 1) & 0x03) as u8;
            csd[10] = ((mult & 1) as u8) << 7;
        }
        csd
    }

    fn make_cid(&self) -> [u8; 16] {
        let mut cid = [0u8; 16];
        cid[0] = 0x03;
        cid[1..3].copy_from_slice(b"SD");
        cid[3..8].copy_from_slice(b"SIM01");
        cid
    }

    fn exec_command(&mut self) {
        let frame = self.cmd;
        let cmd = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        assert_eq!(frame[5], crc7(&frame[..5]), "bad CRC-7 on CMD{cmd}");

        let app = self.app_cmd;
        self.app_cmd = false;

        match (app, cmd) {
            (false, 0) => {
                self.idle = true;
                self.acmd41_polls_left = 2;
                self.respond(0x01);
            }
            (false, 8) => match self.kind {
                SimCard::SdV1 | SimCard::Mmc => self.respond(0x05),
                _ => {
                    assert_eq!(arg, 0x0000_01AA, "unexpected CMD8 argument");
                    self.respond_with(0x01, &[0x00, 0x00, 0x01, 0xAA]);
                }
            },
            (false, 55) => {
                self.app_cmd = true;
                self.respond(if self.idle { 0x01 } else { 0x00 });
            }
            (true, 41) => match self.kind {
                SimCard::Mmc => self.respond(0x05),
                _ => {
                    if self.acmd41_polls_left > 0 {
                        self.acmd41_polls_left -= 1;
                        self.respond(0x01);
                    } else {
                        self.idle = false;
                        self.respond(0x00);
                    }
                }
            },
            (false, 1) => match self.kind {
                SimCard::Mmc => {
                    self.idle = false;
                    self.respond(0x00);
                }
                _ => self.respond(0x05),
            },
            (false, 58) => {
                let ocr0 = if self.block_addressed() { 0xC0 } else { 0x80 };
                self.respond_with(0x00, &[ocr0, 0xFF, 0x80, 0x00]);
            }
            (false, 16) => self.respond(if arg == SECTOR as u32 { 0x00 } else { 0x40 }),
            (false, 9) => {
                let csd = self.make_csd();
                self.respond(0x00);
                self.push_data_block(&csd);
            }
            (false, 10) => {
                let cid = self.make_cid();
                self.respond(0x00);
                self.push_data_block(&cid);
            }
            (false, 17) => {
                let lba = self.addr_to_lba(arg);
                self.respond(0x00);
                self.push_sector(lba);
            }
            (false, 18) => {
                let lba = self.addr_to_lba(arg);
                self.respond(0x00);
                self.push_sector(lba);
                self.multi_read = Some(lba + 1);
            }
            (false, 12) => {
                self.multi_read = None;
                self.out.clear();
                // Stuff byte, gap, R1, one busy byte.
                self.out.extend([0xFF, 0xFF, 0x00, 0x00]);
            }
            (false, 24) => {
                let lba = self.addr_to_lba(arg);
                self.respond(0x00);
                self.write = Some(WriteState {
                    lba,
                    multi: false,
                    token_seen: false,
                    collected: Vec::new(),
                });
            }
            (false, 25) => {
                let lba = self.addr_to_lba(arg);
                self.respond(0x00);
                self.write = Some(WriteState {
                    lba,
                    multi: true,
                    token_seen: false,
                    collected: Vec::new(),
                });
            }
            (true, 23) => self.respond(0x00),
            (false, 32) => {
                self.erase_start = Some(self.addr_to_lba(arg));
                self.respond(0x00);
            }
            (false, 33) => {
                self.erase_end = Some(self.addr_to_lba(arg));
                self.respond(0x00);
            }
            (false, 38) => {
                let (start, end) = (
                    self.erase_start.take().expect("CMD38 without CMD32"),
                    self.erase_end.take().expect("CMD38 without CMD33"),
                );
                for lba in start..=end {
                    let base = lba as usize * SECTOR;
                    self.image[base..base + SECTOR].fill(0);
                }
                self.respond(0x00);
                self.out.push_back(0x00); // busy
            }
            _ => self.respond(0x04),
        }
    }

    fn feed(&mut self, byte: u8) {
        if let Some(mut write) = self.write.take() {
            if !write.token_seen {
                match byte {
                    0xFF => {}
                    0xFE if !write.multi => write.token_seen = true,
                    0xFC if write.multi => write.token_seen = true,
                    0xFD if write.multi => {
                        // Stop token ends the multi-block write.
                        self.out.push_back(0x00); // busy while finishing
                        return;
                    }
                    other => panic!("unexpected write token {other:#04x}"),
                }
                self.write = Some(write);
                return;
            }

            write.collected.push(byte);
            if write.collected.len() == SECTOR + 2 {
                let base = write.lba as usize * SECTOR;
                assert!(
                    base + SECTOR <= self.image.len(),
                    "write past end of simulated card: lba {}",
                    write.lba
                );
                self.image[base..base + SECTOR].copy_from_slice(&write.collected[..SECTOR]);
                self.out.push_back(0x05); // data accepted
                self.out.push_back(0x00); // busy
                if write.multi {
                    write.lba += 1;
                    write.token_seen = false;
                    write.collected.clear();
                    self.write = Some(write);
                }
            } else {
                self.write = Some(write);
            }
            return;
        }

        if self.cmd_len == 0 {
            if byte != 0xFF && byte & 0xC0 == 0x40 {
                self.cmd[0] = byte;
                self.cmd_len = 1;
            }
            return;
        }

        self.cmd[self.cmd_len] = byte;
        self.cmd_len += 1;
        if self.cmd_len == 6 {
            self.cmd_len = 0;
            self.exec_command();
        }
    }
}

impl Link for SimLink {
    fn spi_init(&mut self, hz: u32) -> u32 {
        self.spi_hz = hz;
        hz
    }

    fn transfer(&mut self, byte: u8) -> u8 {
        if !self.cs_low {
            return 0xFF;
        }
        // Lazily stream further blocks of a CMD18 once the queue drains.
        if self.out.is_empty()
            && self.write.is_none()
            && self.cmd_len == 0
            && byte == 0xFF
        {
            if let Some(lba) = self.multi_read {
                self.push_sector(lba);
                self.multi_read = Some(lba + 1);
            }
        }
        let out = self.out.pop_front().unwrap_or(0xFF);
        self.feed(byte);
        out
    }

    fn transfer_bulk(&mut self, tx: Option<&[u8]>, rx: Option<&mut [u8]>) {
        match (tx, rx) {
            (Some(tx), Some(rx)) => {
                assert_eq!(tx.len(), rx.len());
                for (t, r) in tx.iter().zip(rx.iter_mut()) {
                    *r = self.transfer(*t);
                }
            }
            (Some(tx), None) => {
                for &t in tx {
                    self.transfer(t);
                }
            }
            (None, Some(rx)) => {
                for r in rx.iter_mut() {
                    *r = self.transfer(0xFF);
                }
            }
            (None, None) => {}
        }
    }

    fn cs_assert(&mut self) {
        self.cs_low = true;
    }

    fn cs_deassert(&mut self) {
        self.cs_low = false;
        self.cmd_len = 0;
        self.out.clear();
        self.write = None;
        self.multi_read = None;
    }

    fn delay_ms(&mut self, ms: u32) {
        self.millis = self.millis.wrapping_add(ms);
    }

    fn millis(&mut self) -> u32 {
        self.millis = self.millis.wrapping_add(1);
        self.millis
    }

    fn card_present(&mut self) -> bool {
        self.present
    }

    fn write_protected(&mut self) -> bool {
        self.write_protect
    }

    fn now(&mut self) -> DateTime {
        self.wall_clock
    }
}

/// Layout summary for an image produced by the format helpers, relative
/// to the start of the volume (add the partition offset for MBR images).
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub reserved: u32,
    pub num_fats: u32,
    pub sectors_per_fat: u32,
    pub root_entries: u32,
    pub sectors_per_cluster: u32,
    pub total_sectors: u32,
}

impl Geometry {
    pub fn fat_start(&self) -> u32 {
        self.reserved
    }

    pub fn root_start(&self) -> u32 {
        self.reserved + self.num_fats * self.sectors_per_fat
    }

    pub fn root_sectors(&self) -> u32 {
        (self.root_entries * 32 + SECTOR as u32 - 1) / SECTOR as u32
    }

    pub fn data_start(&self) -> u32 {
        self.root_start() + self.root_sectors()
    }

    pub fn cluster_count(&self) -> u32 {
        (self.total_sectors - self.data_start()) / self.sectors_per_cluster
    }

    pub fn cluster_sector(&self, cluster: u32) -> u32 {
        self.data_start() + (cluster - 2) * self.sectors_per_cluster
    }

    /// Raw FAT16 entry straight from an image.
    pub fn fat16_entry(&self, image: &[u8], copy: u32, cluster: u32) -> u16 {
        let base =
            (self.fat_start() + copy * self.sectors_per_fat) as usize * SECTOR + cluster as usize * 2;
        LittleEndian::read_u16(&image[base..base + 2])
    }

    /// Raw FAT32 entry straight from an image.
    pub fn fat32_entry(&self, image: &[u8], copy: u32, cluster: u32) -> u32 {
        let base =
            (self.fat_start() + copy * self.sectors_per_fat) as usize * SECTOR + cluster as usize * 4;
        LittleEndian::read_u32(&image[base..base + 4])
    }
}

pub fn blank_image(sectors: u32) -> Vec<u8> {
    vec![0u8; sectors as usize * SECTOR]
}

fn common_bpb(boot: &mut [u8], spc: u8, reserved: u16, root_entries: u16, total: u32) {
    boot[0] = 0xEB;
    boot[1] = 0x3C;
    boot[2] = 0x90;
    boot[3..11].copy_from_slice(b"MSDOS5.0");
    LittleEndian::write_u16(&mut boot[11..13], SECTOR as u16);
    boot[13] = spc;
    LittleEndian::write_u16(&mut boot[14..16], reserved);
    boot[16] = 2;
    LittleEndian::write_u16(&mut boot[17..19], root_entries);
    if total < 0x10000 {
        LittleEndian::write_u16(&mut boot[19..21], total as u16);
    } else {
        LittleEndian::write_u32(&mut boot[32..36], total);
    }
    boot[21] = 0xF8;
    LittleEndian::write_u16(&mut boot[24..26], 63);
    LittleEndian::write_u16(&mut boot[26..28], 255);
    boot[510] = 0x55;
    boot[511] = 0xAA;
}

/// Lay down a FAT16 volume at the start of `image`.
pub fn format_fat16(image: &mut [u8], spc: u8, label: &[u8; 11], serial: u32) -> Geometry {
    let total = (image.len() / SECTOR) as u32;
    let reserved = 1u32;
    let root_entries = 512u32;
    let root_sectors = root_entries * 32 / SECTOR as u32;

    let mut spf = 1u32;
    loop {
        let clusters = (total - reserved - 2 * spf - root_sectors) / u32::from(spc);
        let needed = ((clusters + 2) * 2 + SECTOR as u32 - 1) / SECTOR as u32;
        if needed <= spf {
            break;
        }
        spf = needed;
    }

    let geo = Geometry {
        reserved,
        num_fats: 2,
        sectors_per_fat: spf,
        root_entries,
        sectors_per_cluster: u32::from(spc),
        total_sectors: total,
    };
    assert!(
        (4085..65525).contains(&geo.cluster_count()),
        "geometry is not FAT16: {} clusters",
        geo.cluster_count()
    );

    common_bpb(image, spc, reserved as u16, root_entries as u16, total);
    LittleEndian::write_u16(&mut image[22..24], spf as u16);
    image[38] = 0x29;
    LittleEndian::write_u32(&mut image[39..43], serial);
    image[43..54].copy_from_slice(label);
    image[54..62].copy_from_slice(b"FAT16   ");

    for copy in 0..2u32 {
        let base = (reserved + copy * spf) as usize * SECTOR;
        LittleEndian::write_u16(&mut image[base..base + 2], 0xFFF8);
        LittleEndian::write_u16(&mut image[base + 2..base + 4], 0xFFFF);
    }
    geo
}

/// Lay down a FAT12 volume at the start of `image`.
pub fn format_fat12(image: &mut [u8], spc: u8, label: &[u8; 11], serial: u32) -> Geometry {
    let total = (image.len() / SECTOR) as u32;
    let reserved = 1u32;
    let root_entries = 224u32;
    let root_sectors = (root_entries * 32 + SECTOR as u32 - 1) / SECTOR as u32;

    let mut spf = 1u32;
    loop {
        let clusters = (total - reserved - 2 * spf - root_sectors) / u32::from(spc);
        let needed = ((clusters + 2) * 3 / 2 + SECTOR as u32 - 1) / SECTOR as u32;
        if needed <= spf {
            break;
        }
        spf = needed;
    }

    let geo = Geometry {
        reserved,
        num_fats: 2,
        sectors_per_fat: spf,
        root_entries,
        sectors_per_cluster: u32::from(spc),
        total_sectors: total,
    };
    assert!(
        geo.cluster_count() < 4085,
        "geometry is not FAT12: {} clusters",
        geo.cluster_count()
    );

    common_bpb(image, spc, reserved as u16, root_entries as u16, total);
    LittleEndian::write_u16(&mut image[22..24], spf as u16);
    image[38] = 0x29;
    LittleEndian::write_u32(&mut image[39..43], serial);
    image[43..54].copy_from_slice(label);
    image[54..62].copy_from_slice(b"FAT12   ");

    for copy in 0..2u32 {
        let base = (reserved + copy * spf) as usize * SECTOR;
        image[base] = 0xF8;
        image[base + 1] = 0xFF;
        image[base + 2] = 0xFF;
    }
    geo
}

/// Lay down a FAT32 volume at the start of `image`.
pub fn format_fat32(image: &mut [u8], spc: u8, label: &[u8; 11], serial: u32) -> Geometry {
    let total = (image.len() / SECTOR) as u32;
    let reserved = 32u32;

    let mut spf = 1u32;
    loop {
        let clusters = (total - reserved - 2 * spf) / u32::from(spc);
        let needed = ((clusters + 2) * 4 + SECTOR as u32 - 1) / SECTOR as u32;
        if needed <= spf {
            break;
        }
        spf = needed;
    }

    let geo = Geometry {
        reserved,
        num_fats: 2,
        sectors_per_fat: spf,
        root_entries: 0,
        sectors_per_cluster: u32::from(spc),
        total_sectors: total,
    };
    assert!(
        geo.cluster_count() >= 65525,
        "geometry is not FAT32: {} clusters",
        geo.cluster_count()
    );

    common_bpb(image, spc, reserved as u16, 0, total);
    LittleEndian::write_u32(&mut image[32..36], total);
    LittleEndian::write_u32(&mut image[36..40], spf);
    LittleEndian::write_u32(&mut image[44..48], 2); // root cluster
    image[66] = 0x29;
    LittleEndian::write_u32(&mut image[67..71], serial);
    image[71..82].copy_from_slice(label);
    image[82..90].copy_from_slice(b"FAT32   ");

    for copy in 0..2u32 {
        let base = (reserved + copy * spf) as usize * SECTOR;
        LittleEndian::write_u32(&mut image[base..base + 4], 0x0FFF_FFF8);
        LittleEndian::write_u32(&mut image[base + 4..base + 8], 0x0FFF_FFFF);
        LittleEndian::write_u32(&mut image[base + 8..base + 12], 0x0FFF_FFFF); // root dir EOC
    }
    geo
}

/// Wrap a formatted volume behind an MBR whose first partition starts at
/// `start_lba`.
pub fn wrap_in_mbr(volume: Vec<u8>, start_lba: u32, partition_type: u8) -> Vec<u8> {
    let mut image = blank_image(start_lba + (volume.len() / SECTOR) as u32);
    let entry = 446;
    image[entry] = 0x80;
    image[entry + 4] = partition_type;
    LittleEndian::write_u32(&mut image[entry + 8..entry + 12], start_lba);
    LittleEndian::write_u32(
        &mut image[entry + 12..entry + 16],
        (volume.len() / SECTOR) as u32,
    );
    image[510] = 0x55;
    image[511] = 0xAA;
    let start = start_lba as usize * SECTOR;
    image[start..start + volume.len()].copy_from_slice(&volume);
    image
}
