//! Interface for reading the MIMI binary formats.
//!
//! Everything here is zero-copy: readers borrow the file bytes and expose
//! [`Pod`](crate::pod::Pod) views of the records inside. Every offset and
//! count is validated before it is trusted; the loader relies on that.

use core::{fmt, result};

mod obj;
pub use obj::*;

mod task;
pub use task::*;

/// The error type used within the read module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error(pub(crate) &'static str);

impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for Error {}

/// The result type used within the read module.
pub type Result<T> = result::Result<T, Error>;

pub(crate) trait ReadError<T> {
    fn read_error(self, error: &'static str) -> Result<T>;
}

impl<T> ReadError<T> for result::Result<T, ()> {
    fn read_error(self, error: &'static str) -> Result<T> {
        self.map_err(|()| Error(error))
    }
}

impl<T> ReadError<T> for Option<T> {
    fn read_error(self, error: &'static str) -> Result<T> {
        self.ok_or(Error(error))
    }
}

/// A NUL-terminated string table carried at the tail of a token or AST file.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringTable<'data> {
    pub data: &'data [u8],
}

impl<'data> StringTable<'data> {
    /// Return the NUL-terminated byte string at `offset`.
    pub fn get(&self, offset: u32) -> Option<&'data [u8]> {
        self.data
            .get(offset as usize..)
            .and_then(|data| memchr::memchr(0, data).map(|end| &data[..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_table() {
        let table = StringTable {
            data: b"main\0x\0not terminated",
        };
        assert_eq!(table.get(0), Some(&b"main"[..]));
        assert_eq!(table.get(5), Some(&b"x"[..]));
        assert_eq!(table.get(7), None);
        assert_eq!(table.get(1000), None);
    }
}
