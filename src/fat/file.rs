//! File handles and byte-granular file I/O, plus the namespace
//! operations (create, unlink, rename, mkdir, rmdir).

use byteorder::{ByteOrder, LittleEndian};

use super::dir::{
    clear_entry_run, clear_preceding_lfn, set_entry_cluster, write_entry, DIR_ENTRY_SIZE,
    END_OF_DIR, FREE_ENTRY, OFF_MODIFY_DATE, OFF_MODIFY_TIME, OFF_SIZE,
};
use super::path::{normalize, split_parent};
use super::{names, Volume, ATTR_ARCHIVE, ATTR_DIRECTORY, SECTOR_NONE};
use crate::error::Error;
use crate::link::Link;
use crate::time::DateTime;
use crate::SECTOR_SIZE;

/// Open-mode flag set. Any combination is accepted except the
/// contradictions rejected by validation: `EXCL` without `CREATE`, and
/// `TRUNCATE` without a writable mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct OpenMode(u8);

impl OpenMode {
    pub const READ: OpenMode = OpenMode(0x01);
    pub const WRITE: OpenMode = OpenMode(0x02);
    pub const APPEND: OpenMode = OpenMode(0x04);
    pub const CREATE: OpenMode = OpenMode(0x08);
    pub const TRUNCATE: OpenMode = OpenMode(0x10);
    pub const EXCL: OpenMode = OpenMode(0x20);

    pub fn contains(self, flags: OpenMode) -> bool {
        self.0 & flags.0 == flags.0
    }

    pub fn intersects(self, flags: OpenMode) -> bool {
        self.0 & flags.0 != 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    fn writable(self) -> bool {
        self.intersects(OpenMode::WRITE | OpenMode::APPEND)
    }

    fn validate(self) -> Result<(), Error> {
        if !self.intersects(OpenMode::READ | OpenMode::WRITE | OpenMode::APPEND) {
            return Err(Error::InvalidParam);
        }
        if self.contains(OpenMode::EXCL) && !self.contains(OpenMode::CREATE) {
            return Err(Error::InvalidParam);
        }
        if self.contains(OpenMode::TRUNCATE) && !self.writable() {
            return Err(Error::InvalidParam);
        }
        Ok(())
    }
}

impl core::ops::BitOr for OpenMode {
    type Output = OpenMode;
    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for OpenMode {
    fn bitor_assign(&mut self, rhs: OpenMode) {
        self.0 |= rhs.0;
    }
}

/// Seek origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum SeekFrom {
    Start(u32),
    Current(i32),
    End(i32),
}

/// An open file with its own 512-byte write-back sector buffer.
///
/// `cluster_offset` tracks the byte offset from the start of
/// `current_cluster`; after a seek past the end of the cluster chain it
/// may exceed the cluster size, recording how far past the chain the
/// position sits until a write materializes the missing clusters.
#[derive(Debug)]
pub struct File {
    pub(super) is_open: bool,
    pub(super) mode: OpenMode,
    pub(super) first_cluster: u32,
    pub(super) current_cluster: u32,
    pub(super) cluster_offset: u32,
    pub(super) position: u32,
    pub(super) file_size: u32,
    pub(super) dir_sector: u32,
    pub(super) dir_offset: u16,
    pub(super) buffer: [u8; SECTOR_SIZE],
    pub(super) buffer_sector: u32,
    pub(super) buffer_dirty: bool,
}

impl File {
    fn closed() -> Self {
        Self {
            is_open: false,
            mode: OpenMode(0),
            first_cluster: 0,
            current_cluster: 0,
            cluster_offset: 0,
            position: 0,
            file_size: 0,
            dir_sector: 0,
            dir_offset: 0,
            buffer: [0; SECTOR_SIZE],
            buffer_sector: SECTOR_NONE,
            buffer_dirty: false,
        }
    }

    /// Current byte position.
    pub fn tell(&self) -> u32 {
        self.position
    }

    /// Cached file size in bytes.
    pub fn size(&self) -> u32 {
        self.file_size
    }

    /// Positioned at or past the end of the file.
    pub fn eof(&self) -> bool {
        self.position >= self.file_size
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }
}

impl<L: Link> Volume<L> {
    /// Open a file. `CREATE` makes a fresh 8.3 entry when the path does
    /// not resolve; `TRUNCATE` drops an existing file's data; `APPEND`
    /// positions at the current end.
    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<File, Error> {
        self.require_mounted()?;
        mode.validate()?;

        let mut file = File::closed();
        match self.resolve(path) {
            Ok(resolved) => {
                if resolved.info.is_dir() {
                    return Err(Error::NotFile);
                }
                if mode.contains(OpenMode::CREATE) && mode.contains(OpenMode::EXCL) {
                    return Err(Error::Exists);
                }

                file.first_cluster = resolved.info.first_cluster;
                file.current_cluster = resolved.info.first_cluster;
                file.file_size = resolved.info.size;
                file.dir_sector = resolved.info.dir_sector;
                file.dir_offset = resolved.info.dir_offset;

                if mode.contains(OpenMode::TRUNCATE) {
                    if file.first_cluster >= 2 {
                        self.free_chain(file.first_cluster)?;
                    }
                    file.first_cluster = 0;
                    file.current_cluster = 0;
                    file.file_size = 0;
                    self.update_entry(file.dir_sector, file.dir_offset, 0, 0, None)?;
                }
            }
            Err(Error::NotFound) if mode.contains(OpenMode::CREATE) => {
                let (sector, offset, _) = self.create_entry(path, 0)?;
                file.dir_sector = sector;
                file.dir_offset = offset;
            }
            Err(e) => return Err(e),
        }

        file.mode = mode;
        file.is_open = true;

        if mode.contains(OpenMode::APPEND) {
            file.position = file.file_size;
            if file.first_cluster >= 2 {
                // Walk to the cluster holding the current end.
                let mut cluster = file.first_cluster;
                let mut pos = 0u32;
                let mut steps = 0u32;
                while pos + self.cluster_size <= file.file_size {
                    if steps > self.cluster_count + 2 {
                        return Err(Error::FatCorrupt);
                    }
                    steps += 1;
                    match self.next_cluster(cluster)? {
                        Some(next) => {
                            cluster = next;
                            pos += self.cluster_size;
                        }
                        None => break,
                    }
                }
                file.current_cluster = cluster;
                file.cluster_offset = file.file_size - pos;
            } else {
                file.cluster_offset = file.position;
            }
        }

        Ok(file)
    }

    /// Flush the handle and, for writable modes, write the entry's
    /// cluster pointer, size and modification stamp back to disk.
    pub fn close(&mut self, file: &mut File) -> Result<(), Error> {
        if !file.is_open {
            return Err(Error::InvalidHandle);
        }
        self.require_mounted()?;
        self.flush_file_buffer(file)?;

        if file.mode.writable() {
            let stamp = self.card.now();
            self.update_entry(
                file.dir_sector,
                file.dir_offset,
                file.first_cluster,
                file.file_size,
                Some(stamp),
            )?;
        }
        file.is_open = false;
        Ok(())
    }

    /// Read up to `out.len()` bytes from the current position, stopping
    /// at the file size. A read beginning at or past the end is `Eof`.
    pub fn read(&mut self, file: &mut File, out: &mut [u8]) -> Result<usize, Error> {
        self.require_mounted()?;
        if !file.is_open {
            return Err(Error::InvalidHandle);
        }
        if !file.mode.contains(OpenMode::READ) {
            return Err(Error::InvalidParam);
        }
        if file.position >= file.file_size {
            return Err(Error::Eof);
        }

        let limit = (file.file_size - file.position) as usize;
        let mut remaining = out.len().min(limit);
        let mut total = 0usize;

        while remaining > 0 {
            if file.cluster_offset >= self.cluster_size {
                match self.next_cluster(file.current_cluster)? {
                    Some(next) => {
                        file.current_cluster = next;
                        file.cluster_offset -= self.cluster_size;
                    }
                    None => break,
                }
            }
            if file.current_cluster < 2 {
                break;
            }

            let sector = self.cluster_to_sector(file.current_cluster)?
                + file.cluster_offset / SECTOR_SIZE as u32;
            let offset_in_sector = (file.cluster_offset as usize) % SECTOR_SIZE;

            if file.buffer_sector != sector {
                self.flush_file_buffer(file)?;
                self.card.read_sector(sector, &mut file.buffer)?;
                file.buffer_sector = sector;
            }

            let chunk = (SECTOR_SIZE - offset_in_sector).min(remaining);
            out[total..total + chunk]
                .copy_from_slice(&file.buffer[offset_in_sector..offset_in_sector + chunk]);

            total += chunk;
            remaining -= chunk;
            file.position += chunk as u32;
            file.cluster_offset += chunk as u32;
        }

        if total == 0 && !out.is_empty() {
            // The chain ended before the recorded file size.
            return Err(Error::Eof);
        }
        Ok(total)
    }

    /// Write at the current position, allocating and zero-filling
    /// clusters as the chain grows. Full-sector stretches bypass the
    /// handle buffer; partial sectors go through read-modify-write.
    pub fn write(&mut self, file: &mut File, data: &[u8]) -> Result<usize, Error> {
        self.require_mounted()?;
        if !file.is_open {
            return Err(Error::InvalidHandle);
        }
        if !file.mode.writable() {
            return Err(Error::ReadOnly);
        }

        let mut total = 0usize;
        while total < data.len() {
            if file.first_cluster < 2 {
                let cluster = self.alloc_cluster(0)?;
                self.zero_cluster(cluster)?;
                file.first_cluster = cluster;
                file.current_cluster = cluster;
                // cluster_offset already tracks the position for a file
                // with no clusters.
            }

            let mut steps = 0u32;
            while file.cluster_offset >= self.cluster_size {
                if steps > self.cluster_count + 2 {
                    return Err(Error::FatCorrupt);
                }
                steps += 1;
                let next = match self.next_cluster(file.current_cluster)? {
                    Some(next) => next,
                    None => {
                        let fresh = self.alloc_cluster(file.current_cluster)?;
                        self.zero_cluster(fresh)?;
                        fresh
                    }
                };
                file.current_cluster = next;
                file.cluster_offset -= self.cluster_size;
            }

            let sector = self.cluster_to_sector(file.current_cluster)?
                + file.cluster_offset / SECTOR_SIZE as u32;
            let offset_in_sector = (file.cluster_offset as usize) % SECTOR_SIZE;
            let remaining = data.len() - total;

            let chunk;
            if offset_in_sector == 0 && remaining >= SECTOR_SIZE {
                // Whole sector: skip the buffer entirely.
                self.flush_file_buffer(file)?;
                self.card
                    .write_sector(sector, &data[total..total + SECTOR_SIZE])?;
                if file.buffer_sector == sector {
                    file.buffer_sector = SECTOR_NONE;
                }
                chunk = SECTOR_SIZE;
            } else {
                if file.buffer_sector != sector {
                    self.flush_file_buffer(file)?;
                    self.card.read_sector(sector, &mut file.buffer)?;
                    file.buffer_sector = sector;
                }
                chunk = (SECTOR_SIZE - offset_in_sector).min(remaining);
                file.buffer[offset_in_sector..offset_in_sector + chunk]
                    .copy_from_slice(&data[total..total + chunk]);
                file.buffer_dirty = true;
            }

            total += chunk;
            file.position += chunk as u32;
            file.cluster_offset += chunk as u32;
            if file.position > file.file_size {
                file.file_size = file.position;
            }
        }

        Ok(total)
    }

    /// Move the position. Read-only handles clamp to the file size;
    /// writable handles may seek past the end, deferring allocation to
    /// the next write. Returns the new position.
    pub fn seek(&mut self, file: &mut File, from: SeekFrom) -> Result<u32, Error> {
        self.require_mounted()?;
        if !file.is_open {
            return Err(Error::InvalidHandle);
        }

        let target = match from {
            SeekFrom::Start(pos) => i64::from(pos),
            SeekFrom::Current(delta) => i64::from(file.position) + i64::from(delta),
            SeekFrom::End(delta) => i64::from(file.file_size) + i64::from(delta),
        };
        if target < 0 || target > i64::from(u32::MAX) {
            return Err(Error::Seek);
        }
        let mut new_pos = target as u32;
        if !file.mode.writable() && new_pos > file.file_size {
            new_pos = file.file_size;
        }

        if new_pos < file.position || new_pos == 0 {
            file.current_cluster = file.first_cluster;
            file.cluster_offset = 0;
            file.position = 0;
        }

        let mut steps = 0u32;
        while file.position < new_pos && file.current_cluster >= 2 {
            if steps > self.cluster_count + 2 {
                return Err(Error::FatCorrupt);
            }
            steps += 1;

            if file.cluster_offset >= self.cluster_size {
                match self.next_cluster(file.current_cluster)? {
                    Some(next) => {
                        file.current_cluster = next;
                        file.cluster_offset -= self.cluster_size;
                    }
                    None => break,
                }
                continue;
            }

            let remaining_in_cluster = self.cluster_size - file.cluster_offset;
            let to_advance = new_pos - file.position;
            if to_advance >= remaining_in_cluster {
                file.position += remaining_in_cluster;
                file.cluster_offset += remaining_in_cluster;
            } else {
                file.position = new_pos;
                file.cluster_offset += to_advance;
            }
        }

        // Past the end of the chain (writable seek past EOF, or a file
        // with no clusters yet): the offset carries the gap.
        if file.position < new_pos {
            file.cluster_offset += new_pos - file.position;
            file.position = new_pos;
        }

        Ok(file.position)
    }

    /// Flush the handle's buffered sector and the shared FAT buffer.
    pub fn flush(&mut self, file: &mut File) -> Result<(), Error> {
        self.require_mounted()?;
        if !file.is_open {
            return Err(Error::InvalidHandle);
        }
        self.flush_file_buffer(file)?;
        self.flush_fat()
    }

    /// Cut the file at the current position. Clusters are the allocation
    /// unit: the cluster containing the position is kept (its tail bytes
    /// included) and everything beyond is freed.
    pub fn truncate(&mut self, file: &mut File) -> Result<(), Error> {
        self.require_mounted()?;
        if !file.is_open {
            return Err(Error::InvalidHandle);
        }
        if !file.mode.writable() {
            return Err(Error::ReadOnly);
        }

        if file.current_cluster >= 2 && file.position < file.file_size {
            let eoc = self.fat_type.eoc_value();
            if file.cluster_offset == 0 && file.position > 0 {
                // Position sits on a cluster boundary: the current
                // cluster is the first one past the new end. Terminate
                // its predecessor and free from here on.
                let mut prev = file.first_cluster;
                let mut steps = 0u32;
                loop {
                    if steps > self.cluster_count + 2 {
                        return Err(Error::FatCorrupt);
                    }
                    steps += 1;
                    match self.next_cluster(prev)? {
                        Some(next) if next == file.current_cluster => break,
                        Some(next) => prev = next,
                        None => return Err(Error::FatCorrupt),
                    }
                }
                self.free_chain(file.current_cluster)?;
                self.set_fat_entry(prev, eoc)?;
                file.current_cluster = prev;
                file.cluster_offset = self.cluster_size;
            } else if let Some(next) = self.next_cluster(file.current_cluster)? {
                self.free_chain(next)?;
                self.set_fat_entry(file.current_cluster, eoc)?;
            }
        }

        file.file_size = file.position;
        Ok(())
    }

    /// Remove a file: free its chain and mark its 8.3 entry (plus any
    /// preceding long-name fragments) free.
    pub fn unlink(&mut self, path: &str) -> Result<(), Error> {
        self.require_mounted()?;
        let resolved = self.resolve(path)?;
        if resolved.info.is_dir() {
            return Err(Error::NotFile);
        }
        if resolved.info.first_cluster >= 2 {
            self.free_chain(resolved.info.first_cluster)?;
        }
        self.clear_entry(resolved.info.dir_sector, resolved.info.dir_offset)
    }

    /// Rename within one directory: rewrite the 8.3 name in place and
    /// invalidate any long-name fragments tied to the old name.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), Error> {
        self.require_mounted()?;
        let from_canonical = normalize(self.cwd_path.as_str(), from)?;
        let to_canonical = normalize(self.cwd_path.as_str(), to)?;
        let (from_parent, _) = split_parent(from_canonical.as_str());
        let (to_parent, to_base) = split_parent(to_canonical.as_str());
        if to_base.is_empty() {
            return Err(Error::InvalidName);
        }
        if !from_parent.eq_ignore_ascii_case(to_parent) {
            // Cross-directory moves would need a copy-then-unlink dance.
            return Err(Error::NotSupported);
        }
        if self.resolve_canonical(to_canonical.as_str()).is_ok() {
            return Err(Error::Exists);
        }

        let resolved = self.resolve_canonical(from_canonical.as_str())?;
        let short = names::basename_to_short(to_base.as_bytes())?;

        let mut sector = [0u8; SECTOR_SIZE];
        self.card.read_sector(resolved.info.dir_sector, &mut sector)?;
        let offset = usize::from(resolved.info.dir_offset);
        sector[offset..offset + 11].copy_from_slice(&short);
        clear_preceding_lfn(&mut sector, offset);
        self.card.write_sector(resolved.info.dir_sector, &sector)
    }

    /// Create a directory containing `.` and `..`.
    pub fn mkdir(&mut self, path: &str) -> Result<(), Error> {
        self.require_mounted()?;
        if self.resolve(path).is_ok() {
            return Err(Error::Exists);
        }

        let (entry_sector, entry_offset, parent_cluster) =
            self.create_entry(path, ATTR_DIRECTORY)?;

        let cluster = match self.alloc_cluster(0) {
            Ok(cluster) => cluster,
            Err(e) => {
                // Roll the fresh entry back so the name does not dangle.
                self.clear_entry(entry_sector, entry_offset)?;
                return Err(e);
            }
        };
        self.zero_cluster(cluster)?;

        // `..` of a directory directly under the root stores cluster 0.
        let dotdot = if parent_cluster == self.root_dir_cluster() {
            0
        } else {
            parent_cluster
        };
        let stamp = self.card.now();
        let mut first = [0u8; SECTOR_SIZE];
        write_entry(&mut first, 0, b".          ", ATTR_DIRECTORY, cluster, 0, stamp);
        write_entry(
            &mut first,
            DIR_ENTRY_SIZE,
            b"..         ",
            ATTR_DIRECTORY,
            dotdot,
            0,
            stamp,
        );
        let first_sector = self.cluster_to_sector(cluster)?;
        self.card.write_sector(first_sector, &first)?;

        let mut sector = [0u8; SECTOR_SIZE];
        self.card.read_sector(entry_sector, &mut sector)?;
        set_entry_cluster(&mut sector, usize::from(entry_offset), cluster);
        self.card.write_sector(entry_sector, &sector)
    }

    /// Remove a directory that holds nothing but `.` and `..`.
    pub fn rmdir(&mut self, path: &str) -> Result<(), Error> {
        self.require_mounted()?;
        let canonical = normalize(self.cwd_path.as_str(), path)?;
        if canonical.as_str() == "/" {
            return Err(Error::InvalidParam);
        }
        let resolved = self.resolve_canonical(canonical.as_str())?;
        if !resolved.info.is_dir() {
            return Err(Error::NotDir);
        }

        if resolved.info.first_cluster >= 2 {
            let mut dir = self.open_dir_cluster(resolved.info.first_cluster)?;
            loop {
                match self.readdir(&mut dir) {
                    Ok(child) => {
                        let name = child.name();
                        if name != "." && name != ".." {
                            return Err(Error::DirNotEmpty);
                        }
                    }
                    Err(Error::Eof) => break,
                    Err(e) => return Err(e),
                }
            }
            self.free_chain(resolved.info.first_cluster)?;
        }

        self.clear_entry(resolved.info.dir_sector, resolved.info.dir_offset)
    }

    /// Make a fresh 8.3 entry in the path's parent directory. Returns the
    /// entry's sector, byte offset, and the parent's first cluster.
    fn create_entry(&mut self, path: &str, attr: u8) -> Result<(u32, u16, u32), Error> {
        let canonical = normalize(self.cwd_path.as_str(), path)?;
        let (parent_path, base) = split_parent(canonical.as_str());
        if base.is_empty() {
            return Err(Error::InvalidName);
        }
        let short = names::basename_to_short(base.as_bytes())?;

        let parent = self.resolve_canonical(parent_path)?;
        if !parent.info.is_dir() {
            return Err(Error::NotDir);
        }
        let parent_cluster = if parent.info.first_cluster >= 2 {
            parent.info.first_cluster
        } else {
            self.root_dir_cluster()
        };

        let mut dir = self.open_dir_cluster(parent_cluster)?;
        let slot_offset;
        loop {
            if usize::from(dir.entry_offset) >= SECTOR_SIZE {
                if !self.dir_next_sector(&mut dir)? {
                    if dir.first_cluster == 0 {
                        // The FAT12/16 root is a fixed-size run.
                        return Err(Error::RootFull);
                    }
                    let fresh = self.alloc_cluster(dir.current_cluster)?;
                    self.zero_cluster(fresh)?;
                    dir.current_cluster = fresh;
                    dir.current_sector = self.cluster_to_sector(fresh)?;
                    dir.entry_offset = 0;
                    self.card.read_sector(dir.current_sector, &mut dir.buffer)?;
                }
            }

            let base_off = usize::from(dir.entry_offset);
            let first = dir.buffer[base_off];
            if first == FREE_ENTRY || first == END_OF_DIR {
                slot_offset = base_off;
                break;
            }
            dir.entry_offset += DIR_ENTRY_SIZE as u16;
        }

        let stamp = self.card.now();
        write_entry(
            &mut dir.buffer,
            slot_offset,
            &short,
            attr | ATTR_ARCHIVE,
            0,
            0,
            stamp,
        );
        self.card.write_sector(dir.current_sector, &dir.buffer)?;
        Ok((dir.current_sector, slot_offset as u16, parent_cluster))
    }

    /// Patch an existing entry's cluster pointer and size, optionally
    /// restamping the modification time.
    fn update_entry(
        &mut self,
        entry_sector: u32,
        entry_offset: u16,
        first_cluster: u32,
        size: u32,
        stamp: Option<DateTime>,
    ) -> Result<(), Error> {
        let mut sector = [0u8; SECTOR_SIZE];
        self.card.read_sector(entry_sector, &mut sector)?;
        let offset = usize::from(entry_offset);
        set_entry_cluster(&mut sector, offset, first_cluster);
        LittleEndian::write_u32(&mut sector[offset + OFF_SIZE..offset + OFF_SIZE + 4], size);
        if let Some(stamp) = stamp {
            LittleEndian::write_u16(
                &mut sector[offset + OFF_MODIFY_DATE..offset + OFF_MODIFY_DATE + 2],
                stamp.fat_date(),
            );
            LittleEndian::write_u16(
                &mut sector[offset + OFF_MODIFY_TIME..offset + OFF_MODIFY_TIME + 2],
                stamp.fat_time(),
            );
        }
        self.card.write_sector(entry_sector, &sector)
    }

    fn clear_entry(&mut self, entry_sector: u32, entry_offset: u16) -> Result<(), Error> {
        let mut sector = [0u8; SECTOR_SIZE];
        self.card.read_sector(entry_sector, &mut sector)?;
        clear_entry_run(&mut sector, usize::from(entry_offset));
        self.card.write_sector(entry_sector, &sector)
    }

    /// Fill a whole cluster with zeros, one shared zero sector at a time.
    pub(super) fn zero_cluster(&mut self, cluster: u32) -> Result<(), Error> {
        let zero = [0u8; SECTOR_SIZE];
        let start = self.cluster_to_sector(cluster)?;
        for i in 0..u32::from(self.sectors_per_cluster) {
            self.card.write_sector(start + i, &zero)?;
        }
        Ok(())
    }

    fn flush_file_buffer(&mut self, file: &mut File) -> Result<(), Error> {
        if file.buffer_dirty && file.buffer_sector != SECTOR_NONE {
            self.card.write_sector(file.buffer_sector, &file.buffer)?;
            file.buffer_dirty = false;
        }
        Ok(())
    }
}
