//! Card-layer tests: initialization variants, sector I/O, counters and
//! the removal/write-protect paths, all against the SPI simulator.

mod common;

use common::{blank_image, SimCard, SimLink, SECTOR};
use sdfs::{CardState, CardType, Error, SdCard};

fn init_card(kind: SimCard, sectors: u32) -> SdCard<SimLink> {
    let mut card = SdCard::new(SimLink::new(kind, blank_image(sectors)));
    card.init(0).expect("init failed");
    card
}

#[test]
fn initializes_sdhc() {
    let card = init_card(SimCard::Sdhc, 65536);
    assert_eq!(card.card_type(), CardType::Sdhc);
    assert_eq!(card.state(), CardState::Ready);
    assert!(card.block_addressing());
    assert_eq!(card.capacity(), 65536 * SECTOR as u64);
    assert_eq!(card.sector_count(), 65536);
    assert_eq!(card.block_size(), 512);
}

#[test]
fn initializes_sd_v2_standard_capacity() {
    let card = init_card(SimCard::SdV2, 65536);
    assert_eq!(card.card_type(), CardType::SdV2);
    assert!(!card.block_addressing());
    assert_eq!(card.capacity(), 65536 * SECTOR as u64);
}

#[test]
fn cmd8_rejection_classifies_v1() {
    let card = init_card(SimCard::SdV1, 16384);
    assert_eq!(card.card_type(), CardType::SdV1);
    assert!(!card.block_addressing());
}

#[test]
fn acmd41_rejection_falls_back_to_mmc() {
    let card = init_card(SimCard::Mmc, 16384);
    assert_eq!(card.card_type(), CardType::Mmc);
}

#[test]
fn init_without_card_reports_no_card() {
    let mut link = SimLink::new(SimCard::Sdhc, blank_image(2048));
    link.present = false;
    let mut card = SdCard::new(link);
    assert_eq!(card.init(0), Err(Error::NoCard));
    assert_eq!(card.state(), CardState::Uninit);
}

#[test]
fn reads_what_was_written() {
    let mut card = init_card(SimCard::Sdhc, 4096);

    let mut pattern = [0u8; SECTOR];
    for (i, byte) in pattern.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    card.write_sector(17, &pattern).unwrap();

    let mut readback = [0u8; SECTOR];
    card.read_sector(17, &mut readback).unwrap();
    assert_eq!(readback[..], pattern[..]);
    assert_eq!(card.reads(), 1);
    assert_eq!(card.writes(), 1);
    assert_eq!(card.errors(), 0);
}

#[test]
fn byte_addressed_card_round_trips_too() {
    let mut card = init_card(SimCard::SdV1, 16384);
    let data = [0xA5u8; SECTOR];
    card.write_sector(100, &data).unwrap();
    let mut readback = [0u8; SECTOR];
    card.read_sector(100, &mut readback).unwrap();
    assert_eq!(readback[..], data[..]);
}

#[test]
fn multi_block_round_trip() {
    let mut card = init_card(SimCard::Sdhc, 4096);

    let mut data = vec![0u8; SECTOR * 5];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i % 241) as u8;
    }
    card.write_sectors(40, &data).unwrap();

    let mut readback = vec![0u8; SECTOR * 5];
    card.read_sectors(40, &mut readback).unwrap();
    assert_eq!(readback, data);
    assert_eq!(card.reads(), 5);
    assert_eq!(card.writes(), 5);
}

#[test]
fn erase_zeroes_the_range() {
    let mut card = init_card(SimCard::Sdhc, 4096);
    let data = [0xEEu8; SECTOR];
    for sector in 10..13 {
        card.write_sector(sector, &data).unwrap();
    }
    card.erase(10, 12).unwrap();

    let mut readback = [0u8; SECTOR];
    for sector in 10..13 {
        card.read_sector(sector, &mut readback).unwrap();
        assert_eq!(readback, [0u8; SECTOR]);
    }
}

#[test]
fn write_protect_blocks_writes() {
    let mut card = init_card(SimCard::Sdhc, 2048);
    card.link_write_protect(true);
    let data = [0u8; SECTOR];
    assert_eq!(card.write_sector(5, &data), Err(Error::WriteProtect));
    let mut buf = [0u8; SECTOR];
    assert!(card.read_sector(5, &mut buf).is_ok());
}

#[test]
fn removal_drops_to_uninit() {
    let mut card = init_card(SimCard::Sdhc, 2048);
    assert!(card.ready());

    card.link_present(false);
    let mut buf = [0u8; SECTOR];
    assert_eq!(card.read_sector(0, &mut buf), Err(Error::NoCard));
    assert_eq!(card.state(), CardState::Uninit);
    assert!(!card.ready());

    // Operations after removal keep failing until a re-init.
    assert_eq!(card.write_sector(0, &buf), Err(Error::NoCard));
}

#[test]
fn operations_before_init_report_init() {
    let mut card = SdCard::new(SimLink::new(SimCard::Sdhc, blank_image(2048)));
    let mut buf = [0u8; SECTOR];
    assert_eq!(card.read_sector(0, &mut buf), Err(Error::Init));
}

#[test]
fn set_speed_caps_at_spi_ceiling() {
    let mut card = init_card(SimCard::Sdhc, 2048);
    assert_eq!(card.set_speed(50_000_000), 25_000_000);
    assert_eq!(card.set_speed(8_000_000), 8_000_000);
}

#[test]
fn rejects_unaligned_buffers() {
    let mut card = init_card(SimCard::Sdhc, 2048);
    let mut short_buf = [0u8; 100];
    assert_eq!(card.read_sector(0, &mut short_buf), Err(Error::InvalidParam));
    assert_eq!(card.read_sectors(0, &mut short_buf), Err(Error::InvalidParam));
}

// Small helpers so tests can flip link-level hints behind the card.
trait LinkHints {
    fn link_present(&mut self, present: bool);
    fn link_write_protect(&mut self, wp: bool);
}

impl LinkHints for SdCard<SimLink> {
    fn link_present(&mut self, present: bool) {
        self.link_mut().present = present;
    }

    fn link_write_protect(&mut self, wp: bool) {
        self.link_mut().write_protect = wp;
    }
}
