//! The FAT32 volume layer: the compiler's working store and the home of
//! `.mimi` images.
//!
//! The layer is deliberately small: 8.3 names only (long-file-name entries
//! are traversed past, never consumed), a single-sector write-back cache,
//! and timestamps written as zeros. Durability requires an explicit
//! [`Volume::flush`] or a close.

pub mod device;
pub use device::{BlockDevice, RamDisk, SECTOR_SIZE};

mod volume;
pub use volume::{Volume, FAT_EOC};

mod dir;
pub use dir::{display_name, short_name, Attributes, DirEntry, DirEntryInfo, DirSlot};

mod file;
pub use file::{FileHandle, OpenMode};

pub mod format;
pub use format::format;
