//! Directory handles and entry iteration, including long-file-name
//! assembly across cluster boundaries.

use byteorder::{ByteOrder, LittleEndian};

use super::names::LfnState;
use super::{Volume, ATTR_DIRECTORY, ATTR_HIDDEN, ATTR_LONG_NAME, ATTR_READ_ONLY, ATTR_VOLUME_ID};
use crate::config::MAX_NAME;
use crate::error::Error;
use crate::link::Link;
use crate::time::DateTime;
use crate::SECTOR_SIZE;

pub(super) const DIR_ENTRY_SIZE: usize = 32;

pub(super) const END_OF_DIR: u8 = 0x00;
pub(super) const FREE_ENTRY: u8 = 0xE5;

// Field offsets within a 32-byte directory entry.
pub(super) const OFF_ATTR: usize = 11;
pub(super) const OFF_CREATE_TENTH: usize = 13;
pub(super) const OFF_CREATE_TIME: usize = 14;
pub(super) const OFF_CREATE_DATE: usize = 16;
pub(super) const OFF_ACCESS_DATE: usize = 18;
pub(super) const OFF_CLUSTER_HI: usize = 20;
pub(super) const OFF_MODIFY_TIME: usize = 22;
pub(super) const OFF_MODIFY_DATE: usize = 24;
pub(super) const OFF_CLUSTER_LO: usize = 26;
pub(super) const OFF_SIZE: usize = 28;

/// One directory entry as seen by callers.
#[derive(Clone, Debug)]
pub struct FileInfo {
    name: [u8; MAX_NAME],
    name_len: u8,
    /// Raw attribute bits.
    pub attr: u8,
    /// File size in bytes; 0 for directories.
    pub size: u32,
    /// First data cluster, 0 when the file is empty.
    pub first_cluster: u32,
    pub created: DateTime,
    pub modified: DateTime,
    /// Access stamps carry a date only; the time half is zero.
    pub accessed: DateTime,
    pub(super) short_name: [u8; 11],
    pub(super) dir_sector: u32,
    pub(super) dir_offset: u16,
}

impl FileInfo {
    pub(super) fn empty() -> Self {
        Self {
            name: [0; MAX_NAME],
            name_len: 0,
            attr: 0,
            size: 0,
            first_cluster: 0,
            created: DateTime::EPOCH,
            modified: DateTime::EPOCH,
            accessed: DateTime::EPOCH,
            short_name: [b' '; 11],
            dir_sector: 0,
            dir_offset: 0,
        }
    }

    /// Synthetic record for the volume root.
    pub(super) fn root(cluster: u32) -> Self {
        let mut info = Self::empty();
        info.name[0] = b'/';
        info.name_len = 1;
        info.attr = ATTR_DIRECTORY;
        info.first_cluster = cluster;
        info
    }

    /// Display name: the long name when one was assembled, the lowercased
    /// 8.3 rendering otherwise.
    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }

    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_hidden(&self) -> bool {
        self.attr & ATTR_HIDDEN != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.attr & ATTR_READ_ONLY != 0
    }
}

/// An open directory iterator with its own sector buffer.
pub struct Dir {
    pub(super) is_open: bool,
    pub(super) first_cluster: u32,
    pub(super) current_cluster: u32,
    pub(super) current_sector: u32,
    pub(super) entry_offset: u16,
    pub(super) buffer: [u8; SECTOR_SIZE],
}

impl<L: Link> Volume<L> {
    /// Open a directory for iteration. `""` and `"/"` open the root.
    pub fn opendir(&mut self, dirpath: &str) -> Result<Dir, Error> {
        self.require_mounted()?;

        let cluster = if dirpath.is_empty() || dirpath == "/" {
            self.root_dir_cluster()
        } else {
            let resolved = self.resolve(dirpath)?;
            if !resolved.info.is_dir() {
                return Err(Error::NotDir);
            }
            if resolved.cluster >= 2 {
                resolved.cluster
            } else {
                self.root_dir_cluster()
            }
        };

        self.open_dir_cluster(cluster)
    }

    /// Yield the next real entry, or `Err(Eof)` when the directory is
    /// exhausted. Long-name fragments are folded into the entry that
    /// follows them; volume labels and free slots are skipped.
    pub fn readdir(&mut self, dir: &mut Dir) -> Result<FileInfo, Error> {
        self.require_mounted()?;
        if !dir.is_open {
            return Err(Error::InvalidHandle);
        }

        let mut lfn = LfnState::new();
        loop {
            if usize::from(dir.entry_offset) >= SECTOR_SIZE && !self.dir_next_sector(dir)? {
                return Err(Error::Eof);
            }

            let base = usize::from(dir.entry_offset);
            dir.entry_offset += DIR_ENTRY_SIZE as u16;
            let first = dir.buffer[base];

            if first == END_OF_DIR {
                return Err(Error::Eof);
            }
            if first == FREE_ENTRY {
                lfn.clear();
                continue;
            }

            let attr = dir.buffer[base + OFF_ATTR];
            if attr & ATTR_LONG_NAME == ATTR_LONG_NAME {
                lfn.consume(&dir.buffer[base..base + DIR_ENTRY_SIZE]);
                continue;
            }
            if attr & ATTR_VOLUME_ID != 0 {
                lfn.clear();
                continue;
            }

            return Ok(parse_entry(
                &dir.buffer[base..base + DIR_ENTRY_SIZE],
                &lfn,
                dir.current_sector,
                base as u16,
            ));
        }
    }

    /// Close the handle. Directory iteration never dirties its buffer,
    /// so there is nothing to flush.
    pub fn closedir(&mut self, dir: &mut Dir) {
        dir.is_open = false;
    }

    /// Build a directory handle positioned at the start of `cluster`
    /// (0 meaning the fixed FAT12/16 root run).
    pub(super) fn open_dir_cluster(&mut self, cluster: u32) -> Result<Dir, Error> {
        let current_sector = if cluster == 0 {
            self.root_start_sector
        } else {
            self.cluster_to_sector(cluster)?
        };

        let mut dir = Dir {
            is_open: true,
            first_cluster: cluster,
            current_cluster: cluster,
            current_sector,
            entry_offset: 0,
            buffer: [0; SECTOR_SIZE],
        };
        self.card.read_sector(current_sector, &mut dir.buffer)?;
        Ok(dir)
    }

    /// Advance to the directory's next sector; `false` when the fixed
    /// root run or the cluster chain ends.
    pub(super) fn dir_next_sector(&mut self, dir: &mut Dir) -> Result<bool, Error> {
        dir.entry_offset = 0;

        if dir.first_cluster == 0 {
            let limit = self.root_start_sector + self.root_dir_sectors();
            dir.current_sector += 1;
            if dir.current_sector >= limit {
                return Ok(false);
            }
        } else {
            let cluster_start = self.cluster_to_sector(dir.current_cluster)?;
            let sector_in_cluster = dir.current_sector - cluster_start + 1;
            if sector_in_cluster >= u32::from(self.sectors_per_cluster) {
                match self.next_cluster(dir.current_cluster)? {
                    Some(next) => {
                        dir.current_cluster = next;
                        dir.current_sector = self.cluster_to_sector(next)?;
                    }
                    None => return Ok(false),
                }
            } else {
                dir.current_sector += 1;
            }
        }

        self.card.read_sector(dir.current_sector, &mut dir.buffer)?;
        Ok(true)
    }
}

/// Decode a 32-byte 8.3 entry into an info record, taking the display
/// name from `lfn` when it holds a complete run for this entry.
pub(super) fn parse_entry(entry: &[u8], lfn: &LfnState, sector: u32, offset: u16) -> FileInfo {
    let mut info = FileInfo::empty();
    info.short_name.copy_from_slice(&entry[..11]);

    let mut name = [0u8; MAX_NAME];
    let len = lfn.take_name(&info.short_name, &mut name);
    info.name = name;
    info.name_len = len as u8;

    info.attr = entry[OFF_ATTR];
    info.size = LittleEndian::read_u32(&entry[OFF_SIZE..OFF_SIZE + 4]);
    info.first_cluster = (u32::from(LittleEndian::read_u16(
        &entry[OFF_CLUSTER_HI..OFF_CLUSTER_HI + 2],
    )) << 16)
        | u32::from(LittleEndian::read_u16(
            &entry[OFF_CLUSTER_LO..OFF_CLUSTER_LO + 2],
        ));
    info.created = DateTime::from_fat(
        LittleEndian::read_u16(&entry[OFF_CREATE_DATE..OFF_CREATE_DATE + 2]),
        LittleEndian::read_u16(&entry[OFF_CREATE_TIME..OFF_CREATE_TIME + 2]),
    );
    info.modified = DateTime::from_fat(
        LittleEndian::read_u16(&entry[OFF_MODIFY_DATE..OFF_MODIFY_DATE + 2]),
        LittleEndian::read_u16(&entry[OFF_MODIFY_TIME..OFF_MODIFY_TIME + 2]),
    );
    info.accessed = DateTime::from_fat(
        LittleEndian::read_u16(&entry[OFF_ACCESS_DATE..OFF_ACCESS_DATE + 2]),
        0,
    );
    info.dir_sector = sector;
    info.dir_offset = offset;
    info
}

/// Write a fresh 8.3 entry into a sector image.
pub(super) fn write_entry(
    sector: &mut [u8],
    offset: usize,
    short_name: &[u8; 11],
    attr: u8,
    first_cluster: u32,
    size: u32,
    stamp: DateTime,
) {
    let entry = &mut sector[offset..offset + DIR_ENTRY_SIZE];
    entry.fill(0);
    entry[..11].copy_from_slice(short_name);
    entry[OFF_ATTR] = attr;
    entry[OFF_CREATE_TENTH] = 0;
    let date = stamp.fat_date();
    let time = stamp.fat_time();
    LittleEndian::write_u16(&mut entry[OFF_CREATE_TIME..OFF_CREATE_TIME + 2], time);
    LittleEndian::write_u16(&mut entry[OFF_CREATE_DATE..OFF_CREATE_DATE + 2], date);
    LittleEndian::write_u16(&mut entry[OFF_ACCESS_DATE..OFF_ACCESS_DATE + 2], date);
    LittleEndian::write_u16(&mut entry[OFF_MODIFY_TIME..OFF_MODIFY_TIME + 2], time);
    LittleEndian::write_u16(&mut entry[OFF_MODIFY_DATE..OFF_MODIFY_DATE + 2], date);
    set_entry_cluster(sector, offset, first_cluster);
    LittleEndian::write_u32(
        &mut sector[offset + OFF_SIZE..offset + OFF_SIZE + 4],
        size,
    );
}

/// Patch the split first-cluster field of an existing entry.
pub(super) fn set_entry_cluster(sector: &mut [u8], offset: usize, cluster: u32) {
    LittleEndian::write_u16(
        &mut sector[offset + OFF_CLUSTER_HI..offset + OFF_CLUSTER_HI + 2],
        (cluster >> 16) as u16,
    );
    LittleEndian::write_u16(
        &mut sector[offset + OFF_CLUSTER_LO..offset + OFF_CLUSTER_LO + 2],
        cluster as u16,
    );
}

/// Free an 8.3 entry in a sector image together with any long-name
/// fragments immediately preceding it.
pub(super) fn clear_entry_run(sector: &mut [u8], offset: usize) {
    sector[offset] = FREE_ENTRY;
    clear_preceding_lfn(sector, offset);
}

/// Mark long-name fragments directly before an entry free, walking
/// backward until a non-LFN entry or the start of the sector.
pub(super) fn clear_preceding_lfn(sector: &mut [u8], offset: usize) {
    let mut pos = offset;
    while pos >= DIR_ENTRY_SIZE {
        pos -= DIR_ENTRY_SIZE;
        let first = sector[pos];
        let attr = sector[pos + OFF_ATTR];
        if first == FREE_ENTRY || first == END_OF_DIR || attr & ATTR_LONG_NAME != ATTR_LONG_NAME {
            break;
        }
        sector[pos] = FREE_ENTRY;
    }
}
