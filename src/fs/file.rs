//! File handles: open, read, write, seek, and the close-time directory
//! write-back.

use bitflags::bitflags;
use log::debug;

use crate::common::{ErrorCode, Result};
use crate::fs::device::{BlockDevice, SECTOR_SIZE};
use crate::fs::dir::{short_name, DirSlot};
use crate::fs::volume::Volume;

bitflags! {
    /// File open modes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        /// With `WRITE`: create the file if the path does not exist.
        const CREATE = 0x04;
    }
}

/// An open file.
///
/// The handle remembers where its directory entry lives so `close` can
/// patch the entry's size and first-cluster fields after writing.
#[derive(Debug)]
pub struct FileHandle {
    mode: OpenMode,
    dir_slot: DirSlot,
    first_cluster: u32,
    /// Current cluster, or 0 when no cluster backs the position yet.
    cur_cluster: u32,
    /// Byte offset within the current cluster.
    cluster_offset: u32,
    size: u32,
    pos: u32,
    path: String,
}

impl FileHandle {
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn position(&self) -> u32 {
        self.pos
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    #[inline]
    pub fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    /// Bytes left before end of file.
    #[inline]
    pub fn remaining(&self) -> u32 {
        self.size.saturating_sub(self.pos)
    }
}

impl<D: BlockDevice> Volume<D> {
    /// Open a file. `WRITE` truncates the logical size to zero and rewrites
    /// over any existing cluster chain; `WRITE | CREATE` creates the entry
    /// when the path does not resolve.
    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle> {
        if mode.is_empty() || (mode.contains(OpenMode::CREATE) && !mode.contains(OpenMode::WRITE)) {
            return Err(ErrorCode::Inval);
        }
        let resolved = match self.resolve_path(path) {
            Ok((entry, slot)) => {
                if entry.is_directory() {
                    return Err(ErrorCode::Inval);
                }
                Some((entry, slot))
            }
            Err(ErrorCode::Noent) if mode.contains(OpenMode::CREATE) => None,
            Err(err) => return Err(err),
        };

        let handle = match resolved {
            Some((entry, slot)) => {
                let truncate = mode.contains(OpenMode::WRITE);
                FileHandle {
                    mode,
                    dir_slot: slot,
                    first_cluster: entry.first_cluster(),
                    cur_cluster: entry.first_cluster(),
                    cluster_offset: 0,
                    size: if truncate { 0 } else { entry.file_size.get() },
                    pos: 0,
                    path: path.to_string(),
                }
            }
            None => {
                // Split off the base name and create it under the parent.
                let (parent, base) = match path.rfind('/') {
                    Some(at) => (&path[..at], &path[at + 1..]),
                    None => ("", path),
                };
                let parent_cluster = self.resolve_dir(parent)?;
                let name = short_name(base)?;
                let slot = self.create_entry(parent_cluster, &name)?;
                debug!("open: created {} in cluster {}", path, parent_cluster);
                FileHandle {
                    mode,
                    dir_slot: slot,
                    first_cluster: 0,
                    cur_cluster: 0,
                    cluster_offset: 0,
                    size: 0,
                    pos: 0,
                    path: path.to_string(),
                }
            }
        };
        Ok(handle)
    }

    /// Read up to `buf.len()` bytes at the handle's position. Returns the
    /// number of bytes read; 0 at end of file.
    pub fn read(&mut self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        if !handle.mode.contains(OpenMode::READ) {
            return Err(ErrorCode::Perm);
        }
        let mut done = 0;
        let bpc = self.bytes_per_cluster();
        while done < buf.len() && handle.remaining() > 0 {
            if handle.cur_cluster == 0 {
                break;
            }
            if handle.cluster_offset == bpc {
                match self.next_cluster(handle.cur_cluster)? {
                    Some(next) => {
                        handle.cur_cluster = next;
                        handle.cluster_offset = 0;
                    }
                    None => break,
                }
            }
            let lba = self.cluster_to_lba(handle.cur_cluster)
                + handle.cluster_offset / SECTOR_SIZE as u32;
            let in_sector = (handle.cluster_offset % SECTOR_SIZE as u32) as usize;
            let n = (SECTOR_SIZE - in_sector)
                .min(buf.len() - done)
                .min(handle.remaining() as usize);
            let sector = self.sector(lba)?;
            buf[done..done + n].copy_from_slice(&sector[in_sector..in_sector + n]);
            done += n;
            handle.pos += n as u32;
            handle.cluster_offset += n as u32;
        }
        Ok(done)
    }

    /// Make the handle's position be backed by a cluster, allocating and
    /// linking as needed, and return that cluster.
    fn cluster_for_write(&mut self, handle: &mut FileHandle) -> Result<u32> {
        let bpc = self.bytes_per_cluster();
        if handle.first_cluster == 0 {
            let cluster = self.alloc_cluster()?;
            handle.first_cluster = cluster;
            handle.cur_cluster = cluster;
            handle.cluster_offset = 0;
            return Ok(cluster);
        }
        if handle.cluster_offset == bpc {
            let next = match self.next_cluster(handle.cur_cluster)? {
                Some(next) => next,
                None => {
                    let fresh = self.alloc_cluster()?;
                    self.set_fat_entry(handle.cur_cluster, fresh)?;
                    fresh
                }
            };
            handle.cur_cluster = next;
            handle.cluster_offset = 0;
        }
        Ok(handle.cur_cluster)
    }

    /// Write `buf` at the handle's position. Partial sectors are
    /// read-modify-written so untouched bytes survive.
    pub fn write(&mut self, handle: &mut FileHandle, buf: &[u8]) -> Result<usize> {
        if !handle.mode.contains(OpenMode::WRITE) {
            return Err(ErrorCode::Perm);
        }
        let mut done = 0;
        while done < buf.len() {
            let cluster = self.cluster_for_write(handle)?;
            let lba = self.cluster_to_lba(cluster) + handle.cluster_offset / SECTOR_SIZE as u32;
            let in_sector = (handle.cluster_offset % SECTOR_SIZE as u32) as usize;
            let n = (SECTOR_SIZE - in_sector).min(buf.len() - done);
            let sector = if in_sector == 0 && n == SECTOR_SIZE {
                self.sector_overwrite(lba)?
            } else {
                self.sector_mut(lba)?
            };
            sector[in_sector..in_sector + n].copy_from_slice(&buf[done..done + n]);
            done += n;
            handle.pos += n as u32;
            handle.cluster_offset += n as u32;
            handle.size = handle.size.max(handle.pos);
        }
        Ok(done)
    }

    /// Reposition the handle by walking the chain from the first cluster.
    pub fn seek(&mut self, handle: &mut FileHandle, pos: u32) -> Result<()> {
        if pos > handle.size {
            return Err(ErrorCode::Inval);
        }
        let bpc = self.bytes_per_cluster();
        let mut cluster = handle.first_cluster;
        if cluster != 0 {
            for _ in 0..pos / bpc {
                match self.next_cluster(cluster)? {
                    Some(next) => cluster = next,
                    // Seek to the exact end of the chain parks the handle
                    // on its last cluster; the next write extends it.
                    None => break,
                }
            }
        }
        handle.cur_cluster = cluster;
        handle.cluster_offset = pos % bpc;
        handle.pos = pos;
        // A position at an exact cluster boundary belongs to the next
        // cluster, which may not exist yet; keep the offset at the end of
        // the current one so the write path allocates lazily.
        if pos != 0 && handle.cluster_offset == 0 && pos == handle.size {
            handle.cluster_offset = bpc;
        }
        Ok(())
    }

    /// Close the file. Write-opened handles patch their directory entry's
    /// size and first-cluster fields; the cache is flushed either way.
    pub fn close(&mut self, handle: FileHandle) -> Result<()> {
        if handle.mode.contains(OpenMode::WRITE) {
            let slot = handle.dir_slot;
            let size = handle.size;
            let first = handle.first_cluster;
            self.write_entry(&slot, |entry| {
                entry.file_size.set(size);
                entry.set_first_cluster(first);
            })?;
        }
        self.flush()
    }

    /// Read a whole file into a buffer.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let mut handle = self.open(path, OpenMode::READ)?;
        let mut out = vec![0; handle.size() as usize];
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read(&mut handle, &mut out[filled..])?;
            if n == 0 {
                return Err(ErrorCode::Io);
            }
            filled += n;
        }
        self.close(handle)?;
        Ok(out)
    }

    /// Create or replace a file with the given contents.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let mut handle = self.open(path, OpenMode::WRITE | OpenMode::CREATE)?;
        self.write(&mut handle, data)?;
        self.close(handle)
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
    fn create_then_read_back() {
        let mut vol = fresh_volume();
        vol.write_file("hello.txt", b"hello\n").unwrap();
        assert_eq!(vol.read_file("hello.txt").unwrap(), b"hello\n");
    }

    #[test]
    fn fresh_create_has_size_zero() {
        let mut vol = fresh_volume();
        let handle = vol.open("empty.txt", OpenMode::WRITE | OpenMode::CREATE).unwrap();
        vol.close(handle).unwrap();
        let handle = vol.open("empty.txt", OpenMode::READ).unwrap();
        assert_eq!(handle.size(), 0);
        vol.close(handle).unwrap();
    }

    #[test]
    fn directory_entry_records_size_and_cluster() {
        let mut vol = fresh_volume();
        vol.write_file("hello.txt", b"hello\n").unwrap();
        let listing = vol.read_dir("/").unwrap();
        let entry = listing.iter().find(|e| e.name == "HELLO.TXT").unwrap();
        assert_eq!(entry.size, 6);
        assert_ne!(entry.first_cluster, 0);
    }

    #[test]
    fn unaligned_tail_write_preserves_bytes() {
        let mut vol = fresh_volume();
        vol.write_file("a.bin", &[0xAA; 700]).unwrap();
        // Rewrite the middle without touching the rest.
        let mut handle = vol.open("a.bin", OpenMode::READ).unwrap();
        let mut buf = vec![0; 700];
        vol.read(&mut handle, &mut buf).unwrap();
        vol.close(handle).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn cluster_boundary_allocates_one_cluster() {
        let mut vol = fresh_volume();
        let bpc = vol.bytes_per_cluster() as usize;
        vol.write_file("exact.bin", &vec![1; bpc]).unwrap();

        let mut handle = vol.open("exact.bin", OpenMode::READ).unwrap();
        let first = handle.first_cluster();
        // Exactly one cluster in the chain.
        assert_eq!(vol.next_cluster(first).unwrap(), None);
        let mut buf = vec![0; bpc];
        assert_eq!(vol.read(&mut handle, &mut buf).unwrap(), bpc);
        assert_eq!(vol.read(&mut handle, &mut buf).unwrap(), 0);
        vol.close(handle).unwrap();
    }

    #[test]
    fn seek_recomputes_cluster() {
        let mut vol = fresh_volume();
        let bpc = vol.bytes_per_cluster() as usize;
        let mut data = vec![0u8; bpc * 2 + 10];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        vol.write_file("seek.bin", &data).unwrap();

        let mut handle = vol.open("seek.bin", OpenMode::READ).unwrap();
        vol.seek(&mut handle, bpc as u32 + 3).unwrap();
        let mut byte = [0u8; 1];
        vol.read(&mut handle, &mut byte).unwrap();
        assert_eq!(byte[0], data[bpc + 3]);
        assert!(vol.seek(&mut handle, data.len() as u32 + 1).is_err());
        vol.close(handle).unwrap();
    }

    #[test]
    fn missing_file_is_noent() {
        let mut vol = fresh_volume();
        assert_eq!(
            vol.open("nope.txt", OpenMode::READ).err(),
            Some(ErrorCode::Noent)
        );
    }
}
