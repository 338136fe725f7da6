//! Directory entries, 8.3 names, and path resolution.

use bitflags::bitflags;
use log::warn;

use crate::common::{ErrorCode, Result};
use crate::endian::{U16, U32};
use crate::fs::device::{BlockDevice, SECTOR_SIZE};
use crate::fs::volume::Volume;
use crate::pod::{self, Pod};

/// Directory entries per sector.
pub(crate) const ENTRIES_PER_SECTOR: u32 = (SECTOR_SIZE / 32) as u32;

/// First name byte marking the end of a directory.
const NAME_END: u8 = 0x00;

/// First name byte marking a deleted entry.
const NAME_DELETED: u8 = 0xE5;

bitflags! {
    /// FAT directory-entry attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

/// All four low attribute bits set marks a long-file-name entry, which the
/// volume layer traverses past but never consumes.
const ATTR_LFN: u8 = 0x0F;

/// An on-disk 32-byte FAT directory entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DirEntry {
    pub name: [u8; 11],
    pub attr: u8,
    pub nt_reserved: u8,
    pub crt_time_tenth: u8,
    pub crt_time: U16,
    pub crt_date: U16,
    pub lst_acc_date: U16,
    pub fst_clus_hi: U16,
    pub wrt_time: U16,
    pub wrt_date: U16,
    pub fst_clus_lo: U16,
    pub file_size: U32,
}

unsafe impl Pod for DirEntry {}

impl DirEntry {
    pub(crate) fn zeroed() -> DirEntry {
        DirEntry {
            name: [0; 11],
            attr: 0,
            nt_reserved: 0,
            crt_time_tenth: 0,
            crt_time: U16::default(),
            crt_date: U16::default(),
            lst_acc_date: U16::default(),
            fst_clus_hi: U16::default(),
            wrt_time: U16::default(),
            wrt_date: U16::default(),
            fst_clus_lo: U16::default(),
            file_size: U32::default(),
        }
    }

    #[inline]
    pub fn first_cluster(&self) -> u32 {
        ((self.fst_clus_hi.get() as u32) << 16) | self.fst_clus_lo.get() as u32
    }

    #[inline]
    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.fst_clus_hi.set((cluster >> 16) as u16);
        self.fst_clus_lo.set(cluster as u16);
    }

    #[inline]
    pub fn is_directory(&self) -> bool {
        self.attr & Attributes::DIRECTORY.bits() != 0
    }

    fn is_lfn(&self) -> bool {
        self.attr & ATTR_LFN == ATTR_LFN
    }

    fn is_volume_label(&self) -> bool {
        self.attr & Attributes::VOLUME_ID.bits() != 0
    }
}

/// Where a directory entry lives: the cluster of its directory and the
/// entry index within that cluster. File handles keep this so `close` can
/// patch the size and first-cluster fields back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirSlot {
    pub cluster: u32,
    pub index: u32,
}

/// One entry of a directory listing.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub size: u32,
    pub attr: Attributes,
    pub first_cluster: u32,
}

/// Pack a path component into the padded 11-byte 8.3 form, uppercased.
///
/// Overlong stems and extensions truncate rather than fail (so
/// `blink.mimi` and `BLINK.MIM` are the same file); both the create and
/// lookup paths go through this, which keeps truncation consistent.
pub fn short_name(component: &str) -> Result<[u8; 11]> {
    let mut out = [b' '; 11];
    let (stem, ext) = match component.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (component, ""),
    };
    if stem.is_empty() {
        return Err(ErrorCode::Inval);
    }
    for (i, b) in stem.bytes().take(8).enumerate() {
        if b < 0x20 || b"\"*+,./:;<=>?[\\]|".contains(&b) {
            return Err(ErrorCode::Inval);
        }
        out[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().take(3).enumerate() {
        if b < 0x20 || b"\"*+,./:;<=>?[\\]|".contains(&b) {
            return Err(ErrorCode::Inval);
        }
        out[8 + i] = b.to_ascii_uppercase();
    }
    Ok(out)
}

/// Render a padded 11-byte name back to `NAME.EXT` form.
pub fn display_name(raw: &[u8; 11]) -> String {
    let stem = core::str::from_utf8(&raw[..8]).unwrap_or("").trim_end();
    let ext = core::str::from_utf8(&raw[8..]).unwrap_or("").trim_end();
    if ext.is_empty() {
        stem.to_string()
    } else {
        format!("{}.{}", stem, ext)
    }
}

fn entry_at(sector: &[u8; SECTOR_SIZE], index: u32) -> DirEntry {
    let offset = index as usize * 32;
    // A 32-byte read at a 32-byte boundary of a sector never fails.
    match pod::from_bytes::<DirEntry>(&sector[offset..]) {
        Ok(entry) => *entry,
        Err(()) => DirEntry::zeroed(),
    }
}

impl<D: BlockDevice> Volume<D> {
    /// Scan one directory chain for an 8.3 name. Returns the entry and its
    /// slot, or `None` at end of directory.
    pub(crate) fn find_in_dir(
        &mut self,
        dir_cluster: u32,
        name: &[u8; 11],
    ) -> Result<Option<(DirEntry, DirSlot)>> {
        let mut cluster = dir_cluster;
        loop {
            for index in 0..self.sectors_per_cluster * ENTRIES_PER_SECTOR {
                let lba = self.cluster_to_lba(cluster) + index / ENTRIES_PER_SECTOR;
                let sector = self.sector(lba)?;
                let entry = entry_at(sector, index % ENTRIES_PER_SECTOR);
                if entry.name[0] == NAME_END {
                    return Ok(None);
                }
                if entry.name[0] == NAME_DELETED || entry.is_lfn() || entry.is_volume_label() {
                    continue;
                }
                if entry.name == *name {
                    return Ok(Some((entry, DirSlot { cluster, index })));
                }
            }
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(None),
            }
        }
    }

    /// Resolve a `/`-separated path to its directory entry and slot.
    ///
    /// An empty path (or `/`) has no entry and resolves to `Noent`; use
    /// [`Volume::resolve_dir`] for directory clusters.
    pub(crate) fn resolve_path(&mut self, path: &str) -> Result<(DirEntry, DirSlot)> {
        let mut dir_cluster = self.root_cluster();
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        if components.peek().is_none() {
            return Err(ErrorCode::Noent);
        }
        loop {
            // peek() above and below guarantees a component here.
            let component = match components.next() {
                Some(c) => c,
                None => return Err(ErrorCode::Noent),
            };
            let name = short_name(component)?;
            let (entry, slot) = self
                .find_in_dir(dir_cluster, &name)?
                .ok_or(ErrorCode::Noent)?;
            if components.peek().is_none() {
                return Ok((entry, slot));
            }
            if !entry.is_directory() {
                return Err(ErrorCode::Notdir);
            }
            dir_cluster = entry.first_cluster();
        }
    }

    /// Resolve a path to a directory cluster. Empty and `/` resolve to the
    /// root.
    pub(crate) fn resolve_dir(&mut self, path: &str) -> Result<u32> {
        if path.split('/').all(|c| c.is_empty()) {
            return Ok(self.root_cluster());
        }
        let (entry, _) = self.resolve_path(path)?;
        if !entry.is_directory() {
            return Err(ErrorCode::Notdir);
        }
        Ok(entry.first_cluster())
    }

    /// Create a fresh zero-length file entry in the directory at
    /// `dir_cluster`. The caller has already checked the name is free.
    pub(crate) fn create_entry(&mut self, dir_cluster: u32, name: &[u8; 11]) -> Result<DirSlot> {
        let mut cluster = dir_cluster;
        loop {
            for index in 0..self.sectors_per_cluster * ENTRIES_PER_SECTOR {
                let lba = self.cluster_to_lba(cluster) + index / ENTRIES_PER_SECTOR;
                let sector = self.sector(lba)?;
                let first = sector[index as usize % ENTRIES_PER_SECTOR as usize * 32];
                if first == NAME_END || first == NAME_DELETED {
                    let slot = DirSlot { cluster, index };
                    self.write_entry(&slot, |entry| {
                        *entry = DirEntry::zeroed();
                        entry.name = *name;
                        entry.attr = Attributes::ARCHIVE.bits();
                        entry.set_first_cluster(0);
                        entry.file_size.set(0);
                    })?;
                    self.flush()?;
                    return Ok(slot);
                }
            }
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => {
                    warn!("create_entry: directory full");
                    return Err(ErrorCode::Nomem);
                }
            }
        }
    }

    /// Patch the directory entry at `slot` in place.
    pub(crate) fn write_entry(
        &mut self,
        slot: &DirSlot,
        patch: impl FnOnce(&mut DirEntry),
    ) -> Result<()> {
        let lba = self.cluster_to_lba(slot.cluster) + slot.index / ENTRIES_PER_SECTOR;
        let offset = (slot.index % ENTRIES_PER_SECTOR) as usize * 32;
        let sector = self.sector_mut(lba)?;
        match pod::from_bytes_mut::<DirEntry>(&mut sector[offset..]) {
            Ok(entry) => {
                patch(entry);
                Ok(())
            }
            Err(()) => Err(ErrorCode::Corrupt),
        }
    }

    /// List a directory, skipping deleted, LFN, and volume-label entries.
    pub fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntryInfo>> {
        let mut cluster = self.resolve_dir(path)?;
        let mut out = Vec::new();
        'chain: loop {
            for index in 0..self.sectors_per_cluster * ENTRIES_PER_SECTOR {
                let lba = self.cluster_to_lba(cluster) + index / ENTRIES_PER_SECTOR;
                let sector = self.sector(lba)?;
                let entry = entry_at(sector, index % ENTRIES_PER_SECTOR);
                if entry.name[0] == NAME_END {
                    break 'chain;
                }
                if entry.name[0] == NAME_DELETED || entry.is_lfn() || entry.is_volume_label() {
                    continue;
                }
                out.push(DirEntryInfo {
                    name: display_name(&entry.name),
                    size: entry.file_size.get(),
                    attr: Attributes::from_bits_truncate(entry.attr),
                    first_cluster: entry.first_cluster(),
                });
            }
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names() {
        assert_eq!(short_name("main.c").unwrap(), *b"MAIN    C  ");
        assert_eq!(short_name("BLINK.MIM").unwrap(), *b"BLINK   MIM");
        assert_eq!(short_name("noext").unwrap(), *b"NOEXT      ");
        // Overlong parts truncate, identically on every path.
        assert_eq!(short_name("blink.mimi").unwrap(), *b"BLINK   MIM");
        assert_eq!(short_name("toolongname.c").unwrap(), *b"TOOLONGNC  ");
        assert!(short_name("").is_err());
        assert!(short_name("bad:name").is_err());
    }

    #[test]
    fn display_names() {
        assert_eq!(display_name(b"MAIN    C  "), "MAIN.C");
        assert_eq!(display_name(b"NOEXT      "), "NOEXT");
    }

    #[test]
    fn entry_size() {
        assert_eq!(core::mem::size_of::<DirEntry>(), 32);
    }
}
