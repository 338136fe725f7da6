//! A self-hosted C compiler, linker, and relocating program loader for
//! the MIMI executable format, with the tiny multitasking kernel that
//! runs the result.
//!
//! The system targets microcontrollers with a few hundred kilobytes of
//! RAM. The compiler is a chain of disk-buffered passes over a FAT32
//! volume — the filesystem is the compiler's working memory — and its
//! back end emits 16-bit ARM Thumb directly. The linker produces a
//! position-independent `.mimi` image; the loader places it in one
//! arena block, patches its relocations, and hands it to the scheduler.
//!
//! ## Example
//!
//! Compile and load on an in-memory volume:
//!
//! ```
//! use mimic::fs::{format, RamDisk, Volume};
//! use mimic::kernel::{Kernel, KernelConfig, NullPlatform};
//!
//! let mut disk = RamDisk::new(8192);
//! format(&mut disk, "MIMIC").unwrap();
//! let mut vol = Volume::mount(disk).unwrap();
//!
//! vol.write_file("main.c", b"int main() { return 42; }\n").unwrap();
//! mimic::cc::compile(&mut vol, "main.c", "main.mimi").unwrap();
//!
//! let mut kernel = Kernel::new(KernelConfig::default(), NullPlatform::new());
//! let task = mimic::kernel::load_and_start(&mut kernel, &mut vol, "main.mimi", 5).unwrap();
//! kernel.tick();
//! assert_eq!(kernel.current(), task);
//! ```
//!
//! ## Layout
//!
//! - [`mimi`]: the on-disk formats shared by every pass and the loader.
//! - [`read`] / [`write`]: validating readers and serializers for object
//!   files and `.mimi` images.
//! - [`fs`]: the FAT32 volume layer over a 512-byte-sector block device.
//! - [`stream`]: buffered byte streams, the compiler's I/O substrate.
//! - [`cc`]: lexer, parser, Thumb encoders, and code generator.
//! - [`link`]: object merge and image emission.
//! - [`kernel`]: arena allocator, task table, scheduler, syscalls, and
//!   the loader.

pub mod common;
pub use common::{Arch, ErrorCode, RelocKind, SectionId, SymbolKind};

pub mod endian;
pub mod pod;

pub mod mimi;

pub mod read;
pub mod write;

pub mod fs;
pub mod stream;

pub mod cc;
pub mod link;

pub mod kernel;
