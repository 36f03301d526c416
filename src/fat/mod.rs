//! FAT volume engine: boot-record parsing, FAT table access, directory
//! iteration, path resolution and file I/O.

use byteorder::{ByteOrder, LittleEndian};
use heapless::String;

use crate::card::{CardType, SdCard};
use crate::config::MAX_PATH;
use crate::error::Error;
use crate::link::Link;
use crate::SECTOR_SIZE;

mod dir;
mod file;
mod names;
mod path;
mod table;

pub use dir::{Dir, FileInfo};
pub use file::{File, OpenMode, SeekFrom};

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
/// All four low attribute bits set marks a long-file-name fragment.
pub const ATTR_LONG_NAME: u8 = 0x0F;

/// "No sector buffered" marker for the FAT and file sector buffers.
pub(crate) const SECTOR_NONE: u32 = 0xFFFF_FFFF;
/// Free-cluster count not yet computed.
pub(crate) const FREE_UNKNOWN: u32 = 0xFFFF_FFFF;

/// MBR partition type bytes this engine recognizes as FAT.
const FAT_PARTITION_TYPES: [u8; 6] = [0x01, 0x04, 0x06, 0x0B, 0x0C, 0x0E];

/// FAT width, decided purely by data-cluster count (the Microsoft rule).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
    /// Recognized on some large cards but not implemented here.
    ExFat,
}

impl FatType {
    /// The type decision depends on nothing but the cluster count.
    pub fn from_cluster_count(count: u32) -> FatType {
        if count < 4085 {
            FatType::Fat12
        } else if count < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    /// Entry values at or above this mark end-of-chain.
    pub(crate) fn eoc_threshold(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF8,
            FatType::Fat16 => 0xFFF8,
            _ => 0x0FFF_FFF8,
        }
    }

    /// The end-of-chain value written when terminating a chain.
    pub(crate) fn eoc_value(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FFF,
            FatType::Fat16 => 0xFFFF,
            _ => 0x0FFF_FFFF,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FatType::Fat12 => "FAT12",
            FatType::Fat16 => "FAT16",
            FatType::Fat32 => "FAT32",
            FatType::ExFat => "exFAT",
        }
    }
}

/// Combined card and volume summary.
#[derive(Clone, Debug)]
pub struct VolumeInfo {
    pub card_type: CardType,
    pub card_size: u64,
    pub sector_count: u32,
    pub fat_type: FatType,
    pub label: String<11>,
    pub serial: u32,
    pub total_bytes: u64,
    pub cluster_size: u32,
    pub total_clusters: u32,
    /// `None` until a free-count scan has run.
    pub free_clusters: Option<u32>,
    pub free_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
}

/// A mounted (or mountable) FAT volume on an [`SdCard`].
///
/// The volume owns the card plus one shared FAT sector buffer; file and
/// directory handles carry their own buffers and are passed back into
/// the volume for every operation.
pub struct Volume<L: Link> {
    card: SdCard<L>,
    mounted: bool,
    fat_type: FatType,
    sectors_per_cluster: u8,
    reserved_sectors: u16,
    num_fats: u8,
    root_entry_count: u16,
    total_sectors: u32,
    sectors_per_fat: u32,
    root_cluster: u32,
    partition_start: u32,
    fat_start_sector: u32,
    root_start_sector: u32,
    data_start_sector: u32,
    cluster_count: u32,
    cluster_size: u32,
    volume_label: String<11>,
    volume_serial: u32,
    cwd_cluster: u32,
    cwd_path: String<MAX_PATH>,
    free_clusters: u32,
    last_alloc_cluster: u32,
    fat_buffer: [u8; SECTOR_SIZE],
    fat_buffer_sector: u32,
    fat_buffer_dirty: bool,
}

impl<L: Link> Volume<L> {
    /// Wrap an initialized card. Nothing touches the medium until
    /// [`Volume::mount`].
    pub fn new(card: SdCard<L>) -> Self {
        Self {
            card,
            mounted: false,
            fat_type: FatType::Fat16,
            sectors_per_cluster: 0,
            reserved_sectors: 0,
            num_fats: 0,
            root_entry_count: 0,
            total_sectors: 0,
            sectors_per_fat: 0,
            root_cluster: 0,
            partition_start: 0,
            fat_start_sector: 0,
            root_start_sector: 0,
            data_start_sector: 0,
            cluster_count: 0,
            cluster_size: 0,
            volume_label: String::new(),
            volume_serial: 0,
            cwd_cluster: 0,
            cwd_path: String::new(),
            free_clusters: FREE_UNKNOWN,
            last_alloc_cluster: 1,
            fat_buffer: [0; SECTOR_SIZE],
            fat_buffer_sector: SECTOR_NONE,
            fat_buffer_dirty: false,
        }
    }

    /// Parse the boot record (behind an MBR when one is present), derive
    /// the volume layout and decide the FAT width.
    pub fn mount(&mut self) -> Result<(), Error> {
        if self.mounted {
            return Err(Error::AlreadyMounted);
        }

        let mut boot = [0u8; SECTOR_SIZE];
        self.card.read_sector(0, &mut boot)?;

        let mut partition_start = 0u32;
        if boot[510] == 0x55 && boot[511] == 0xAA {
            let part_type = boot[446 + 4];
            if FAT_PARTITION_TYPES.contains(&part_type) {
                partition_start = LittleEndian::read_u32(&boot[446 + 8..446 + 12]);
                self.card.read_sector(partition_start, &mut boot)?;
            }
        }
        if boot[510] != 0x55 || boot[511] != 0xAA {
            return Err(Error::NoFs);
        }

        let bytes_per_sector = LittleEndian::read_u16(&boot[11..13]);
        if bytes_per_sector != SECTOR_SIZE as u16 {
            return Err(Error::InvalidFs);
        }
        let sectors_per_cluster = boot[13];
        if sectors_per_cluster == 0
            || !sectors_per_cluster.is_power_of_two()
            || sectors_per_cluster > 128
        {
            return Err(Error::InvalidFs);
        }
        let reserved_sectors = LittleEndian::read_u16(&boot[14..16]);
        let num_fats = boot[16];
        if reserved_sectors == 0 || num_fats == 0 {
            return Err(Error::InvalidFs);
        }
        let root_entry_count = LittleEndian::read_u16(&boot[17..19]);

        let mut total_sectors = u32::from(LittleEndian::read_u16(&boot[19..21]));
        if total_sectors == 0 {
            total_sectors = LittleEndian::read_u32(&boot[32..36]);
        }
        let mut sectors_per_fat = u32::from(LittleEndian::read_u16(&boot[22..24]));
        if sectors_per_fat == 0 {
            sectors_per_fat = LittleEndian::read_u32(&boot[36..40]);
        }
        if total_sectors == 0 || sectors_per_fat == 0 {
            return Err(Error::InvalidFs);
        }

        let fat_start = partition_start + u32::from(reserved_sectors);
        let root_sectors =
            (u32::from(root_entry_count) * 32 + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32;
        let root_start = fat_start + u32::from(num_fats) * sectors_per_fat;
        let mut data_start = root_start + root_sectors;

        let used = data_start - partition_start;
        if total_sectors <= used {
            return Err(Error::InvalidFs);
        }
        let data_sectors = total_sectors - used;
        let cluster_count = data_sectors / u32::from(sectors_per_cluster);
        if cluster_count == 0 {
            return Err(Error::InvalidFs);
        }

        let fat_type = FatType::from_cluster_count(cluster_count);
        let mut root_cluster = 0;
        if fat_type == FatType::Fat32 {
            root_cluster = LittleEndian::read_u32(&boot[44..48]);
            if root_cluster < 2 {
                return Err(Error::InvalidFs);
            }
            // FAT32 has no fixed root run; data begins right after the FATs.
            data_start = root_start;
        }

        let label_offset = if fat_type == FatType::Fat32 { 71 } else { 43 };
        let serial_offset = if fat_type == FatType::Fat32 { 67 } else { 39 };
        let mut label: String<11> = String::new();
        let raw_label = &boot[label_offset..label_offset + 11];
        let label_len = raw_label
            .iter()
            .rposition(|&b| b != b' ')
            .map_or(0, |i| i + 1);
        for &b in &raw_label[..label_len] {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            };
            let _ = label.push(c);
        }

        self.fat_type = fat_type;
        self.sectors_per_cluster = sectors_per_cluster;
        self.reserved_sectors = reserved_sectors;
        self.num_fats = num_fats;
        self.root_entry_count = root_entry_count;
        self.total_sectors = total_sectors;
        self.sectors_per_fat = sectors_per_fat;
        self.root_cluster = root_cluster;
        self.partition_start = partition_start;
        self.fat_start_sector = fat_start;
        self.root_start_sector = root_start;
        self.data_start_sector = data_start;
        self.cluster_count = cluster_count;
        self.cluster_size = u32::from(sectors_per_cluster) * SECTOR_SIZE as u32;
        self.volume_label = label;
        self.volume_serial = LittleEndian::read_u32(&boot[serial_offset..serial_offset + 4]);
        self.cwd_cluster = self.root_dir_cluster();
        self.cwd_path.clear();
        let _ = self.cwd_path.push('/');
        self.free_clusters = FREE_UNKNOWN;
        self.last_alloc_cluster = 1;
        self.fat_buffer_sector = SECTOR_NONE;
        self.fat_buffer_dirty = false;
        self.mounted = true;

        debug!(
            "mounted {}: {} clusters of {} bytes, label {:?}",
            fat_type.name(),
            cluster_count,
            self.cluster_size,
            self.volume_label.as_str()
        );
        Ok(())
    }

    /// Flush the FAT buffer (and its mirrors) and drop the mounted flag.
    pub fn unmount(&mut self) -> Result<(), Error> {
        if !self.mounted {
            return Err(Error::NotMounted);
        }
        self.flush_fat()?;
        self.mounted = false;
        Ok(())
    }

    /// Flush pending FAT mutations without unmounting.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.require_mounted()?;
        self.flush_fat()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Volume label, trailing spaces trimmed.
    pub fn label(&self) -> &str {
        self.volume_label.as_str()
    }

    pub fn serial(&self) -> u32 {
        self.volume_serial
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    /// Allocation unit size in bytes.
    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    /// Total data-cluster count.
    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    /// Printable current working directory.
    pub fn getcwd(&self) -> &str {
        self.cwd_path.as_str()
    }

    /// Free space in bytes. Scans the whole FAT on first use and caches
    /// the count; allocation and freeing keep the cache current.
    pub fn free_bytes(&mut self) -> Result<u64, Error> {
        self.require_mounted()?;
        let free = self.free_cluster_count()?;
        Ok(u64::from(free) * u64::from(self.cluster_size))
    }

    /// Card and volume summary in one record.
    pub fn info(&mut self) -> Result<VolumeInfo, Error> {
        self.require_mounted()?;
        let free_clusters = if self.free_clusters == FREE_UNKNOWN {
            None
        } else {
            Some(self.free_clusters)
        };
        let total_bytes = u64::from(self.cluster_count) * u64::from(self.cluster_size);
        let free_bytes = free_clusters.map(|c| u64::from(c) * u64::from(self.cluster_size));
        Ok(VolumeInfo {
            card_type: self.card.card_type(),
            card_size: self.card.capacity(),
            sector_count: self.card.sector_count(),
            fat_type: self.fat_type,
            label: self.volume_label.clone(),
            serial: self.volume_serial,
            total_bytes,
            cluster_size: self.cluster_size,
            total_clusters: self.cluster_count,
            free_clusters,
            free_bytes,
            used_bytes: free_bytes.map(|f| total_bytes - f),
        })
    }

    /// Change the working directory.
    pub fn chdir(&mut self, dirpath: &str) -> Result<(), Error> {
        self.require_mounted()?;
        let normalized = path::normalize(self.cwd_path.as_str(), dirpath)?;
        let resolved = self.resolve(dirpath)?;
        if !resolved.info.is_dir() {
            return Err(Error::NotDir);
        }
        self.cwd_cluster = if resolved.info.first_cluster >= 2 {
            resolved.info.first_cluster
        } else {
            self.root_dir_cluster()
        };
        self.cwd_path = normalized;
        Ok(())
    }

    /// Look a path up without opening it.
    pub fn stat(&mut self, path_str: &str) -> Result<FileInfo, Error> {
        self.require_mounted()?;
        Ok(self.resolve(path_str)?.info)
    }

    /// True when the path resolves to an existing file or directory.
    pub fn exists(&mut self, path_str: &str) -> bool {
        self.mounted && self.resolve(path_str).is_ok()
    }

    /// Borrow the underlying card, e.g. for counters.
    pub fn card(&self) -> &SdCard<L> {
        &self.card
    }

    pub fn card_mut(&mut self) -> &mut SdCard<L> {
        &mut self.card
    }

    /// Give the card back. Unmount first if anything was written.
    pub fn into_card(self) -> SdCard<L> {
        self.card
    }

    /// Cluster the root directory lives in: the boot-record value on
    /// FAT32, the synthetic 0 for the fixed FAT12/16 root run.
    pub(crate) fn root_dir_cluster(&self) -> u32 {
        if self.fat_type == FatType::Fat32 {
            self.root_cluster
        } else {
            0
        }
    }

    pub(crate) fn require_mounted(&self) -> Result<(), Error> {
        if self.mounted {
            Ok(())
        } else {
            Err(Error::NotMounted)
        }
    }

    /// Sectors occupied by the fixed FAT12/16 root directory.
    pub(crate) fn root_dir_sectors(&self) -> u32 {
        (u32::from(self.root_entry_count) * 32 + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32
    }
}
