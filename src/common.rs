//! Definitions shared by the compiler, linker, loader, and kernel.

use core::fmt;

/// The instruction-set architecture of a `.mimi` image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Arch {
    /// 16-bit ARM Thumb, plus the Thumb-2 encodings the compiler emits
    /// (`BL`, `SDIV`).
    Thumb,
}

impl Arch {
    pub fn from_u8(arch: u8) -> Option<Arch> {
        match arch {
            crate::mimi::ARCH_THUMB => Some(Arch::Thumb),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Arch::Thumb => crate::mimi::ARCH_THUMB,
        }
    }
}

/// A section of a `.mimi` image or object file.
///
/// `Bss` holds no file bytes; it exists so symbols can name the zero-filled
/// region. `Null` marks symbols with no section, such as syscalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionId {
    Null,
    Text,
    Rodata,
    Data,
    Bss,
}

impl SectionId {
    pub fn from_u8(section: u8) -> Option<SectionId> {
        match section {
            crate::mimi::SEC_NULL => Some(SectionId::Null),
            crate::mimi::SEC_TEXT => Some(SectionId::Text),
            crate::mimi::SEC_RODATA => Some(SectionId::Rodata),
            crate::mimi::SEC_DATA => Some(SectionId::Data),
            crate::mimi::SEC_BSS => Some(SectionId::Bss),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SectionId::Null => crate::mimi::SEC_NULL,
            SectionId::Text => crate::mimi::SEC_TEXT,
            SectionId::Rodata => crate::mimi::SEC_RODATA,
            SectionId::Data => crate::mimi::SEC_DATA,
            SectionId::Bss => crate::mimi::SEC_BSS,
        }
    }
}

/// The kind of a relocation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Store the 32-bit runtime value of the symbol.
    Abs32,
    /// Store `symbol_value - patch_addr - 4`.
    Rel32,
    /// Patch a two-halfword Thumb `BL` instruction pair.
    ThumbCall,
    /// Patch an 11-bit unconditional Thumb `B` instruction.
    ThumbBranch,
    /// Store the runtime address of a data-section symbol inside data.
    DataPtr,
}

impl RelocKind {
    pub fn from_u8(kind: u8) -> Option<RelocKind> {
        match kind {
            crate::mimi::RELOC_ABS32 => Some(RelocKind::Abs32),
            crate::mimi::RELOC_REL32 => Some(RelocKind::Rel32),
            crate::mimi::RELOC_THUMB_CALL => Some(RelocKind::ThumbCall),
            crate::mimi::RELOC_THUMB_BRANCH => Some(RelocKind::ThumbBranch),
            crate::mimi::RELOC_DATA_PTR => Some(RelocKind::DataPtr),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            RelocKind::Abs32 => crate::mimi::RELOC_ABS32,
            RelocKind::Rel32 => crate::mimi::RELOC_REL32,
            RelocKind::ThumbCall => crate::mimi::RELOC_THUMB_CALL,
            RelocKind::ThumbBranch => crate::mimi::RELOC_THUMB_BRANCH,
            RelocKind::DataPtr => crate::mimi::RELOC_DATA_PTR,
        }
    }
}

/// The kind of a symbol record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Defined in this object, not visible to other objects.
    Local,
    /// Defined in this object, visible to other objects.
    Global,
    /// Referenced but not defined; resolved at link or load time.
    Extern,
    /// A kernel syscall; `value` is the syscall number.
    Syscall,
}

impl SymbolKind {
    pub fn from_u8(kind: u8) -> Option<SymbolKind> {
        match kind {
            crate::mimi::SYM_LOCAL => Some(SymbolKind::Local),
            crate::mimi::SYM_GLOBAL => Some(SymbolKind::Global),
            crate::mimi::SYM_EXTERN => Some(SymbolKind::Extern),
            crate::mimi::SYM_SYSCALL => Some(SymbolKind::Syscall),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SymbolKind::Local => crate::mimi::SYM_LOCAL,
            SymbolKind::Global => crate::mimi::SYM_GLOBAL,
            SymbolKind::Extern => crate::mimi::SYM_EXTERN,
            SymbolKind::Syscall => crate::mimi::SYM_SYSCALL,
        }
    }
}

/// The signed error codes shared by every layer.
///
/// Syscalls return these as negative `i32` values; the CLI surface negates
/// them again for exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Resource exhaustion: arena, FAT, directory, or task table full.
    Nomem,
    /// Malformed argument: bad descriptor, mode, or whence.
    Inval,
    /// Missing path component or symbol.
    Noent,
    /// Block device or stream failure.
    Io,
    /// Resource temporarily unavailable.
    Busy,
    /// Operation not permitted on this handle or block.
    Perm,
    /// Unknown syscall number.
    Nosys,
    /// Malformed on-disk structure.
    Corrupt,
    /// Object too large for a fixed table.
    Toolarge,
    /// Not a loadable `.mimi` image.
    Noexec,
    /// Path component is not a directory.
    Notdir,
}

impl ErrorCode {
    /// The signed code as returned from syscalls.
    pub fn as_i32(self) -> i32 {
        match self {
            ErrorCode::Nomem => -1,
            ErrorCode::Inval => -2,
            ErrorCode::Noent => -3,
            ErrorCode::Io => -4,
            ErrorCode::Busy => -5,
            ErrorCode::Perm => -6,
            ErrorCode::Nosys => -7,
            ErrorCode::Corrupt => -8,
            ErrorCode::Toolarge => -9,
            ErrorCode::Noexec => -10,
            ErrorCode::Notdir => -11,
        }
    }

    /// The non-zero process exit code for this error.
    pub fn exit_code(self) -> i32 {
        -self.as_i32()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Nomem => "out of memory",
            ErrorCode::Inval => "invalid argument",
            ErrorCode::Noent => "no such file or symbol",
            ErrorCode::Io => "I/O error",
            ErrorCode::Busy => "resource busy",
            ErrorCode::Perm => "operation not permitted",
            ErrorCode::Nosys => "unknown syscall",
            ErrorCode::Corrupt => "corrupt on-disk structure",
            ErrorCode::Toolarge => "object too large",
            ErrorCode::Noexec => "not executable",
            ErrorCode::Notdir => "not a directory",
        };
        f.write_str(name)
    }
}

impl std::error::Error for ErrorCode {}

/// The result type used by the fs, compiler, linker, and kernel layers.
pub type Result<T> = core::result::Result<T, ErrorCode>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_contract() {
        assert_eq!(ErrorCode::Nomem.as_i32(), -1);
        assert_eq!(ErrorCode::Notdir.as_i32(), -11);
        assert_eq!(ErrorCode::Noexec.exit_code(), 10);
    }

    #[test]
    fn raw_round_trips() {
        for kind in [
            RelocKind::Abs32,
            RelocKind::Rel32,
            RelocKind::ThumbCall,
            RelocKind::ThumbBranch,
            RelocKind::DataPtr,
        ] {
            assert_eq!(RelocKind::from_u8(kind.to_u8()), Some(kind));
        }
        assert_eq!(SectionId::from_u8(0xff), None);
    }
}
