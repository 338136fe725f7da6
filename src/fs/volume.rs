//! FAT32 volume state: mount, the one-sector write-back cache, and the
//! file allocation table.

use log::{debug, warn};

use crate::common::{ErrorCode, Result};
use crate::fs::device::{BlockDevice, SECTOR_SIZE};

/// End-of-chain sentinel written when a cluster is allocated.
pub const FAT_EOC: u32 = 0x0FFF_FFFF;

/// Only the low 28 bits of a FAT32 entry are significant.
const FAT_MASK: u32 = 0x0FFF_FFFF;

/// Any masked value at or above this terminates a chain.
const FAT_EOC_MIN: u32 = 0x0FFF_FFF8;

/// MBR partition types accepted as FAT32.
const PART_TYPES: [u8; 4] = [0x0B, 0x0C, 0x1B, 0x1C];

#[inline]
pub(crate) fn is_eoc(entry: u32) -> bool {
    (entry & FAT_MASK) >= FAT_EOC_MIN
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// The single cached sector. All volume reads and writes go through it;
/// a miss flushes the previous sector first if it is dirty.
#[derive(Debug)]
struct SectorCache {
    buf: [u8; SECTOR_SIZE],
    lba: u32,
    valid: bool,
    dirty: bool,
}

impl SectorCache {
    fn new() -> Self {
        SectorCache {
            buf: [0; SECTOR_SIZE],
            lba: 0,
            valid: false,
            dirty: false,
        }
    }
}

/// A mounted FAT32 volume over a block device.
#[derive(Debug)]
pub struct Volume<D> {
    pub(crate) dev: D,
    /// LBA of the boot sector (0 for superfloppy layouts).
    pub(crate) part_start: u32,
    pub(crate) sectors_per_cluster: u32,
    pub(crate) fat_start: u32,
    pub(crate) fat_size: u32,
    pub(crate) root_cluster: u32,
    pub(crate) data_start: u32,
    pub(crate) total_clusters: u32,
    cache: SectorCache,
}

impl<D: BlockDevice> Volume<D> {
    /// Mount the volume: detect an MBR, parse the BIOS Parameter Block,
    /// and derive the layout.
    pub fn mount(mut dev: D) -> Result<Self> {
        let mut sector = [0; SECTOR_SIZE];
        dev.read_sector(0, &mut sector)?;

        let mut part_start = 0;
        let has_signature = sector[510] == 0x55 && sector[511] == 0xAA;
        let is_boot_sector = sector[0] == 0xEB || sector[0] == 0xE9;
        if has_signature && !is_boot_sector {
            // Master Boot Record: take the first partition entry.
            let entry = &sector[446..462];
            let part_type = entry[4];
            if !PART_TYPES.contains(&part_type) {
                warn!("mount: unsupported partition type {:#04x}", part_type);
                return Err(ErrorCode::Corrupt);
            }
            part_start = read_u32(entry, 8);
            dev.read_sector(part_start, &mut sector)?;
        }

        let bytes_per_sector = read_u16(&sector, 11);
        let sectors_per_cluster = sector[13] as u32;
        let reserved_sectors = read_u16(&sector, 14) as u32;
        let num_fats = sector[16] as u32;
        let total_sectors_16 = read_u16(&sector, 19) as u32;
        let fat_size = read_u32(&sector, 36);
        let root_cluster = read_u32(&sector, 44);
        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16
        } else {
            read_u32(&sector, 32)
        };

        if bytes_per_sector as usize != SECTOR_SIZE || sectors_per_cluster == 0 || fat_size == 0 {
            warn!(
                "mount: bad BPB (bps={}, spc={}, fat_size={})",
                bytes_per_sector, sectors_per_cluster, fat_size
            );
            return Err(ErrorCode::Corrupt);
        }

        let fat_start = part_start + reserved_sectors;
        let data_start = fat_start + num_fats * fat_size;
        let total_clusters = (total_sectors - (data_start - part_start)) / sectors_per_cluster;

        debug!(
            "mount: part_start={} fat_start={} data_start={} clusters={}",
            part_start, fat_start, data_start, total_clusters
        );

        Ok(Volume {
            dev,
            part_start,
            sectors_per_cluster,
            fat_start,
            fat_size,
            root_cluster,
            data_start,
            total_clusters,
            cache: SectorCache::new(),
        })
    }

    /// Bytes per cluster.
    #[inline]
    pub fn bytes_per_cluster(&self) -> u32 {
        self.sectors_per_cluster * SECTOR_SIZE as u32
    }

    /// First cluster of the root directory.
    #[inline]
    pub fn root_cluster(&self) -> u32 {
        self.root_cluster
    }

    /// LBA of the first sector of a cluster.
    #[inline]
    pub(crate) fn cluster_to_lba(&self, cluster: u32) -> u32 {
        self.data_start + (cluster - 2) * self.sectors_per_cluster
    }

    /// Write the cached sector back if it is dirty.
    pub fn flush(&mut self) -> Result<()> {
        if self.cache.valid && self.cache.dirty {
            let lba = self.cache.lba;
            self.dev.write_sector(lba, &self.cache.buf)?;
            self.cache.dirty = false;
        }
        Ok(())
    }

    fn fill_cache(&mut self, lba: u32) -> Result<()> {
        if self.cache.valid && self.cache.lba == lba {
            return Ok(());
        }
        self.flush()?;
        self.dev.read_sector(lba, &mut self.cache.buf)?;
        self.cache.lba = lba;
        self.cache.valid = true;
        self.cache.dirty = false;
        Ok(())
    }

    /// Read access to the sector at `lba` through the cache.
    pub(crate) fn sector(&mut self, lba: u32) -> Result<&[u8; SECTOR_SIZE]> {
        self.fill_cache(lba)?;
        Ok(&self.cache.buf)
    }

    /// Write access to the sector at `lba` through the cache. The sector
    /// is read first so untouched bytes survive; the cache becomes dirty.
    pub(crate) fn sector_mut(&mut self, lba: u32) -> Result<&mut [u8; SECTOR_SIZE]> {
        self.fill_cache(lba)?;
        self.cache.dirty = true;
        Ok(&mut self.cache.buf)
    }

    /// Write access to a zeroed cache line for the sector at `lba`, without
    /// reading the device first. Only valid when the caller accounts for
    /// the full sector.
    pub(crate) fn sector_overwrite(&mut self, lba: u32) -> Result<&mut [u8; SECTOR_SIZE]> {
        if !(self.cache.valid && self.cache.lba == lba) {
            self.flush()?;
            self.cache.lba = lba;
            self.cache.valid = true;
        }
        self.cache.buf = [0; SECTOR_SIZE];
        self.cache.dirty = true;
        Ok(&mut self.cache.buf)
    }

    fn fat_location(&self, cluster: u32) -> (u32, usize) {
        let byte = cluster * 4;
        (
            self.fat_start + byte / SECTOR_SIZE as u32,
            (byte % SECTOR_SIZE as u32) as usize,
        )
    }

    /// Read the FAT entry for `cluster` (low 28 bits).
    pub(crate) fn fat_entry(&mut self, cluster: u32) -> Result<u32> {
        if cluster < 2 || cluster >= self.total_clusters + 2 {
            return Err(ErrorCode::Corrupt);
        }
        let (lba, offset) = self.fat_location(cluster);
        let sector = self.sector(lba)?;
        Ok(read_u32(sector, offset) & FAT_MASK)
    }

    /// Set the FAT entry for `cluster`, preserving the reserved high bits.
    pub(crate) fn set_fat_entry(&mut self, cluster: u32, value: u32) -> Result<()> {
        if cluster < 2 || cluster >= self.total_clusters + 2 {
            return Err(ErrorCode::Corrupt);
        }
        let (lba, offset) = self.fat_location(cluster);
        let sector = self.sector_mut(lba)?;
        let old = read_u32(sector, offset);
        let new = (old & !FAT_MASK) | (value & FAT_MASK);
        sector[offset..offset + 4].copy_from_slice(&new.to_le_bytes());
        Ok(())
    }

    /// The cluster following `cluster` in its chain, or `None` at the end.
    pub(crate) fn next_cluster(&mut self, cluster: u32) -> Result<Option<u32>> {
        let entry = self.fat_entry(cluster)?;
        if is_eoc(entry) {
            Ok(None)
        } else if entry < 2 || entry >= self.total_clusters + 2 {
            Err(ErrorCode::Corrupt)
        } else {
            Ok(Some(entry))
        }
    }

    /// Allocate a free cluster, stamp it end-of-chain, and return it.
    ///
    /// The scan is linear from cluster 2, matching the allocator this
    /// volume's images are written by.
    pub(crate) fn alloc_cluster(&mut self) -> Result<u32> {
        for cluster in 2..self.total_clusters + 2 {
            if self.fat_entry(cluster)? == 0 {
                self.set_fat_entry(cluster, FAT_EOC)?;
                return Ok(cluster);
            }
        }
        warn!("alloc_cluster: FAT full");
        Err(ErrorCode::Nomem)
    }

    /// Zero-fill every sector of a cluster.
    pub(crate) fn zero_cluster(&mut self, cluster: u32) -> Result<()> {
        let lba = self.cluster_to_lba(cluster);
        for i in 0..self.sectors_per_cluster {
            self.sector_overwrite(lba + i)?;
        }
        Ok(())
    }

    /// Number of clusters in the chain starting at `cluster`; 0 for the
    /// null cluster.
    pub fn chain_length(&mut self, cluster: u32) -> Result<u32> {
        let mut count = 0;
        let mut cur = cluster;
        while cur != 0 {
            count += 1;
            if count > self.total_clusters {
                return Err(ErrorCode::Corrupt);
            }
            match self.next_cluster(cur)? {
                Some(next) => cur = next,
                None => break,
            }
        }
        Ok(count)
    }

    /// Unmount: flush the cache and hand the device back.
    pub fn unmount(mut self) -> Result<D> {
        self.flush()?;
        Ok(self.dev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::device::RamDisk;
    use crate::fs::format::format;

    fn fresh_volume() -> Volume<RamDisk> {
        let mut disk = RamDisk::new(4096);
        format(&mut disk, "TEST").unwrap();
        Volume::mount(disk).unwrap()
    }

    #[test]
    fn mount_rejects_garbage() {
        let disk = RamDisk::new(64);
        assert!(Volume::mount(disk).is_err());
    }

    #[test]
    fn fat_chain_walk() {
        let mut vol = fresh_volume();
        let a = vol.alloc_cluster().unwrap();
        let b = vol.alloc_cluster().unwrap();
        assert_ne!(a, b);
        vol.set_fat_entry(a, b).unwrap();
        assert_eq!(vol.next_cluster(a).unwrap(), Some(b));
        assert_eq!(vol.next_cluster(b).unwrap(), None);
    }

    #[test]
    fn cache_write_back() {
        let mut vol = fresh_volume();
        let lba = vol.data_start;
        vol.sector_mut(lba).unwrap()[0] = 0xAB;
        // Touching a different sector must flush the dirty one first.
        let other = vol.sector(lba + 1).unwrap();
        assert_eq!(other[0], 0);
        let mut raw = [0; SECTOR_SIZE];
        vol.dev.read_sector(lba, &mut raw).unwrap();
        assert_eq!(raw[0], 0xAB);
    }

    #[test]
    fn allocation_is_linear_from_two() {
        let mut vol = fresh_volume();
        // Cluster 2 is the root directory, so the first free one is 3.
        assert_eq!(vol.alloc_cluster().unwrap(), 3);
        assert_eq!(vol.alloc_cluster().unwrap(), 4);
    }
}
