//! Byte-level access to on-disk records.
//!
//! Every record type in the MIMI formats is `#[repr(C)]` over byte
//! arrays and the little-endian wrappers in [`crate::endian`]. Such a
//! type has alignment 1, no padding, and no invalid bit patterns, so a
//! reference can move between a record and its bytes at any file
//! offset. These helpers package that cast up once, behind the [`Pod`]
//! marker; nothing here copies.

use core::{fmt, mem, result, slice};

type Result<T> = result::Result<T, ()>;

/// Marker for record types whose values are plain bytes.
///
/// An implementation promises the layout contract above: `#[repr(C)]`
/// or `#[repr(transparent)]`, no padding, and every bit pattern valid.
/// The record types in [`crate::mimi`] and the wrappers in
/// [`crate::endian`] qualify by construction.
pub unsafe trait Pod: Copy + 'static {}

/// View the start of `data` as a record of type `T`.
///
/// Fails if `data` is shorter than the record, or misaligned for it —
/// the MIMI record types have alignment 1 and never trip the second
/// check.
#[inline]
pub fn from_bytes<T: Pod>(data: &[u8]) -> Result<&T> {
    if data.len() < mem::size_of::<T>() {
        return Err(());
    }
    let ptr = data.as_ptr();
    if (ptr as usize) % mem::align_of::<T>() != 0 {
        return Err(());
    }
    // Length and alignment hold, and Pod rules out invalid bit
    // patterns, so the reference cast is sound.
    Ok(unsafe { &*ptr.cast() })
}

/// Mutable view of the start of `data` as a record of type `T`.
///
/// Used where a record is patched in place, such as a directory entry
/// inside a cached sector.
#[inline]
pub fn from_bytes_mut<T: Pod>(data: &mut [u8]) -> Result<&mut T> {
    if data.len() < mem::size_of::<T>() {
        return Err(());
    }
    let ptr = data.as_mut_ptr();
    if (ptr as usize) % mem::align_of::<T>() != 0 {
        return Err(());
    }
    // Same argument as `from_bytes`; writes of any bit pattern keep a
    // Pod value valid.
    Ok(unsafe { &mut *ptr.cast() })
}

/// View `count` consecutive records at the start of `data`.
///
/// This is how relocation and symbol tables are read: one bounds check
/// up front, then plain indexing.
#[inline]
pub fn slice_from_bytes<T: Pod>(data: &[u8], count: usize) -> Result<&[T]> {
    let size = count.checked_mul(mem::size_of::<T>()).ok_or(())?;
    if data.len() < size {
        return Err(());
    }
    let ptr = data.as_ptr();
    if (ptr as usize) % mem::align_of::<T>() != 0 {
        return Err(());
    }
    // Covered by the checks above for every element at once.
    Ok(unsafe { slice::from_raw_parts(ptr.cast(), count) })
}

/// The bytes of one record, for appending to an output buffer.
#[inline]
pub fn bytes_of<T: Pod>(val: &T) -> &[u8] {
    // A Pod value has no padding, so all of its bytes are initialized
    // and readable.
    unsafe { slice::from_raw_parts(slice::from_ref(val).as_ptr().cast(), mem::size_of::<T>()) }
}

/// The bytes of a run of records, for writing a whole table at once.
#[inline]
pub fn bytes_of_slice<T: Pod>(val: &[T]) -> &[u8] {
    // As `bytes_of`, extended over the run; Pod types have no padding
    // between elements either.
    unsafe {
        slice::from_raw_parts(val.as_ptr().cast(), val.len().wrapping_mul(mem::size_of::<T>()))
    }
}

/// A cursor over a record file's bytes.
///
/// Readers walk a file header-then-sections-then-tables; each `read`
/// here narrows the cursor past what it returned, and any failure
/// leaves the cursor empty so every later read fails too — a chain of
/// reads needs checking only where its result is used. There is no
/// panicking indexing to reach for by accident.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Bytes<'data>(pub &'data [u8]);

impl<'data> fmt::Debug for Bytes<'data> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("Bytes(")?;
        for byte in self.0.iter().take(8) {
            write!(fmt, "{:02x} ", byte)?;
        }
        if self.0.len() > 8 {
            write!(fmt, "...; {}", self.0.len())?;
        }
        fmt.write_str(")")
    }
}

impl<'data> Bytes<'data> {
    /// Bytes left to read.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Drop `count` bytes from the front.
    #[inline]
    pub fn skip(&mut self, count: usize) -> Result<()> {
        match self.0.get(count..) {
            Some(tail) => {
                self.0 = tail;
                Ok(())
            }
            None => {
                self.0 = &[];
                Err(())
            }
        }
    }

    /// Split off the next `count` bytes, as a section's raw contents.
    #[inline]
    pub fn read_bytes(&mut self, count: usize) -> Result<Bytes<'data>> {
        match (self.0.get(..count), self.0.get(count..)) {
            (Some(head), Some(tail)) => {
                self.0 = tail;
                Ok(Bytes(head))
            }
            _ => {
                self.0 = &[];
                Err(())
            }
        }
    }

    /// Read the record at the front of the cursor.
    #[inline]
    pub fn read<T: Pod>(&mut self) -> Result<&'data T> {
        match from_bytes(self.0) {
            Ok(value) => {
                // `from_bytes` checked the length.
                self.skip(mem::size_of::<T>())?;
                Ok(value)
            }
            Err(()) => {
                self.0 = &[];
                Err(())
            }
        }
    }

    /// Read a table of `count` records at the front of the cursor.
    #[inline]
    pub fn read_slice<T: Pod>(&mut self, count: usize) -> Result<&'data [T]> {
        match slice_from_bytes(self.0, count) {
            Ok(table) => {
                // `slice_from_bytes` checked the length, and its size
                // product did not overflow.
                self.skip(count * mem::size_of::<T>())?;
                Ok(table)
            }
            Err(()) => {
                self.0 = &[];
                Err(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endian::U32;

    #[test]
    fn record_views_at_any_offset() {
        let data = [0xAA, 0x2A, 0, 0, 0];
        // Alignment 1: a record view works mid-buffer.
        let value = from_bytes::<U32>(&data[1..]).unwrap();
        assert_eq!(value.get(), 42);
        // Too short.
        assert!(from_bytes::<U32>(&data[2..]).is_err());
    }

    #[test]
    fn cursor_narrows_and_fails_empty() {
        let data = [0x01u8, 0, 0, 0, 0x02, 0];
        let mut bytes = Bytes(&data);
        assert_eq!(bytes.read::<U32>().unwrap().get(), 1);
        assert_eq!(bytes.len(), 2);
        // A failed read empties the cursor for good.
        assert!(bytes.read::<U32>().is_err());
        assert!(bytes.is_empty());
        assert!(bytes.read_bytes(1).is_err());
    }

    #[test]
    fn tables_read_in_one_bounds_check() {
        let data = [1u8, 0, 0, 0, 2, 0, 0, 0];
        let mut bytes = Bytes(&data);
        let table = bytes.read_slice::<U32>(2).unwrap();
        assert_eq!(table[0].get(), 1);
        assert_eq!(table[1].get(), 2);
        assert!(bytes.is_empty());
        assert!(Bytes(&data).read_slice::<U32>(3).is_err());
    }
}
