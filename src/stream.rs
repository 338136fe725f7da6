//! Buffered byte streams over file handles.
//!
//! The compiler passes do all their file I/O through these. A stream owns
//! a small buffer and a [`FileHandle`]; the volume is passed into each
//! operation, so a pass can hold one stream per working file without
//! borrowing the volume for the stream's lifetime.

use crate::common::{ErrorCode, Result};
use crate::fs::{BlockDevice, FileHandle, OpenMode, Volume};

/// Stream buffer size in bytes. One sector's worth keeps the refill and
/// spill paths aligned with the volume cache.
pub const STREAM_BUF_LEN: usize = 512;

#[derive(Debug, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

/// A buffered reader or writer over one file.
#[derive(Debug)]
pub struct Stream {
    handle: FileHandle,
    direction: Direction,
    buf: Vec<u8>,
    /// Next unread index (read streams only).
    pos: usize,
    eof: bool,
}

impl Stream {
    /// Open a buffered reader.
    pub fn open_read<D: BlockDevice>(vol: &mut Volume<D>, path: &str) -> Result<Stream> {
        let handle = vol.open(path, OpenMode::READ)?;
        Ok(Stream {
            handle,
            direction: Direction::Read,
            buf: Vec::with_capacity(STREAM_BUF_LEN),
            pos: 0,
            eof: false,
        })
    }

    /// Open a buffered writer, creating the file if needed.
    pub fn open_write<D: BlockDevice>(vol: &mut Volume<D>, path: &str) -> Result<Stream> {
        let handle = vol.open(path, OpenMode::WRITE | OpenMode::CREATE)?;
        Ok(Stream {
            handle,
            direction: Direction::Write,
            buf: Vec::with_capacity(STREAM_BUF_LEN),
            pos: 0,
            eof: false,
        })
    }

    /// True once a read has hit end of file.
    #[inline]
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// The logical byte position, accounting for buffered data.
    pub fn position(&self) -> u32 {
        match self.direction {
            Direction::Read => self.handle.position() - (self.buf.len() - self.pos) as u32,
            Direction::Write => self.handle.position() + self.buf.len() as u32,
        }
    }

    /// The file size as seen through this stream.
    pub fn size(&self) -> u32 {
        match self.direction {
            Direction::Read => self.handle.size(),
            Direction::Write => self.handle.size().max(self.position()),
        }
    }

    fn refill<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<usize> {
        self.buf.resize(STREAM_BUF_LEN, 0);
        let n = vol.read(&mut self.handle, &mut self.buf)?;
        self.buf.truncate(n);
        self.pos = 0;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    /// Read one byte, or `None` at end of file.
    pub fn getc<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<Option<u8>> {
        if self.direction != Direction::Read {
            return Err(ErrorCode::Perm);
        }
        if self.pos == self.buf.len() && self.refill(vol)? == 0 {
            return Ok(None);
        }
        let byte = self.buf[self.pos];
        self.pos += 1;
        Ok(Some(byte))
    }

    /// Push the last byte back. Only works within the current buffer.
    pub fn ungetc(&mut self) -> bool {
        if self.direction == Direction::Read && self.pos > 0 {
            self.pos -= 1;
            true
        } else {
            false
        }
    }

    /// Read up to `out.len()` bytes.
    pub fn read<D: BlockDevice>(&mut self, vol: &mut Volume<D>, out: &mut [u8]) -> Result<usize> {
        if self.direction != Direction::Read {
            return Err(ErrorCode::Perm);
        }
        let mut done = 0;
        while done < out.len() {
            if self.pos == self.buf.len() && self.refill(vol)? == 0 {
                break;
            }
            let n = (self.buf.len() - self.pos).min(out.len() - done);
            out[done..done + n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            done += n;
        }
        Ok(done)
    }

    /// Append one byte, spilling the buffer when full.
    pub fn putc<D: BlockDevice>(&mut self, vol: &mut Volume<D>, byte: u8) -> Result<()> {
        if self.direction != Direction::Write {
            return Err(ErrorCode::Perm);
        }
        if self.buf.len() == STREAM_BUF_LEN {
            self.flush(vol)?;
        }
        self.buf.push(byte);
        Ok(())
    }

    /// Append a byte slice.
    pub fn write<D: BlockDevice>(&mut self, vol: &mut Volume<D>, data: &[u8]) -> Result<()> {
        for &byte in data {
            self.putc(vol, byte)?;
        }
        Ok(())
    }

    /// Write any buffered bytes through to the file. Idempotent; a no-op
    /// on read streams.
    pub fn flush<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<()> {
        if self.direction == Direction::Write && !self.buf.is_empty() {
            vol.write(&mut self.handle, &self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Reposition the stream. Write streams spill first; read streams drop
    /// their buffer.
    pub fn seek<D: BlockDevice>(&mut self, vol: &mut Volume<D>, pos: u32) -> Result<()> {
        match self.direction {
            Direction::Write => self.flush(vol)?,
            Direction::Read => {
                self.buf.clear();
                self.pos = 0;
                self.eof = false;
            }
        }
        vol.seek(&mut self.handle, pos)
    }

    /// Flush and close the underlying file.
    pub fn close<D: BlockDevice>(mut self, vol: &mut Volume<D>) -> Result<()> {
        self.flush(vol)?;
        vol.close(self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{format, RamDisk};

    fn fresh_volume() -> Volume<RamDisk> {
        let mut disk = RamDisk::new(4096);
        format(&mut disk, "TEST").unwrap();
        Volume::mount(disk).unwrap()
    }

    #[test]
    fn getc_and_ungetc() {
        let mut vol = fresh_volume();
        vol.write_file("in.txt", b"ab").unwrap();
        let mut stream = Stream::open_read(&mut vol, "in.txt").unwrap();
        assert_eq!(stream.getc(&mut vol).unwrap(), Some(b'a'));
        assert!(stream.ungetc());
        assert_eq!(stream.getc(&mut vol).unwrap(), Some(b'a'));
        assert_eq!(stream.getc(&mut vol).unwrap(), Some(b'b'));
        assert_eq!(stream.getc(&mut vol).unwrap(), None);
        assert!(stream.eof());
        stream.close(&mut vol).unwrap();
    }

    #[test]
    fn spill_and_read_back() {
        let mut vol = fresh_volume();
        let mut stream = Stream::open_write(&mut vol, "out.bin").unwrap();
        for i in 0..2000u32 {
            stream.putc(&mut vol, i as u8).unwrap();
        }
        assert_eq!(stream.position(), 2000);
        stream.close(&mut vol).unwrap();

        let data = vol.read_file("out.bin").unwrap();
        assert_eq!(data.len(), 2000);
        assert!(data.iter().enumerate().all(|(i, &b)| b == i as u8));
    }

    #[test]
    fn header_patch_via_seek() {
        let mut vol = fresh_volume();
        let mut stream = Stream::open_write(&mut vol, "hdr.bin").unwrap();
        stream.write(&mut vol, &[0; 16]).unwrap();
        stream.write(&mut vol, b"payload").unwrap();
        stream.seek(&mut vol, 0).unwrap();
        stream.write(&mut vol, b"0123456789abcdef").unwrap();
        stream.close(&mut vol).unwrap();

        let data = vol.read_file("hdr.bin").unwrap();
        assert_eq!(&data[..16], b"0123456789abcdef");
        assert_eq!(&data[16..], b"payload");
    }

    #[test]
    fn double_flush_is_single_flush() {
        let mut vol = fresh_volume();
        let mut stream = Stream::open_write(&mut vol, "f.bin").unwrap();
        stream.write(&mut vol, b"abc").unwrap();
        stream.flush(&mut vol).unwrap();
        stream.flush(&mut vol).unwrap();
        stream.close(&mut vol).unwrap();
        assert_eq!(vol.read_file("f.bin").unwrap(), b"abc");
    }
}
