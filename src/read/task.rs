//! Reader for `.mimi` executable images.

use crate::common::{Arch, RelocKind, SectionId, SymbolKind};
use crate::mimi;
use crate::pod::Bytes;
use crate::read::{Error, ReadError, Result};

/// A parsed `.mimi` executable image.
///
/// [`TaskFile::parse`] performs every check the loader is required to make
/// before trusting an offset, so downstream code can index sections and
/// symbol tables without re-validating.
#[derive(Debug)]
pub struct TaskFile<'data> {
    header: &'data mimi::TaskHeader,
    text: &'data [u8],
    rodata: &'data [u8],
    data: &'data [u8],
    relocs: &'data [mimi::Reloc],
    symbols: &'data [mimi::Symbol],
}

/// Validate the fixed header of a `.mimi` image.
///
/// This is the loader's step-1 contract: magic and version are checked
/// before any other field is trusted, then the architecture, then the
/// entry point. Trailing garbage after the symbol table is not an error.
pub fn validate_header(header: &mimi::TaskHeader, arch: Arch) -> Result<()> {
    if header.magic.get() != mimi::MAGIC {
        return Err(Error("Invalid MIMI magic"));
    }
    if header.version != mimi::VERSION {
        return Err(Error("Unsupported MIMI version"));
    }
    if header.arch != arch.to_u8() {
        return Err(Error("MIMI architecture mismatch"));
    }
    let text_size = header.text_size.get();
    if text_size == 0 {
        return Err(Error("MIMI image has no text"));
    }
    if header.entry_offset.get() >= text_size {
        return Err(Error("MIMI entry point outside text"));
    }
    Ok(())
}

/// Check one relocation record against the header's section sizes.
pub fn validate_reloc(header: &mimi::TaskHeader, reloc: &mimi::Reloc) -> Result<()> {
    let section = SectionId::from_u8(reloc.section.get() as u8)
        .read_error("Invalid relocation section")?;
    let section_size = match section {
        SectionId::Text => header.text_size.get(),
        SectionId::Rodata => header.rodata_size.get(),
        SectionId::Data => header.data_size.get(),
        _ => return Err(Error("Relocation against non-file section")),
    };
    let offset = reloc.offset.get();
    if offset.checked_add(4).map_or(true, |end| end > section_size) {
        return Err(Error("Relocation outside its section"));
    }
    RelocKind::from_u8(reloc.kind).read_error("Unknown relocation type")?;
    if reloc.symbol_idx.get() >= header.symbol_count.get() {
        return Err(Error("Relocation symbol index out of range"));
    }
    Ok(())
}

impl<'data> TaskFile<'data> {
    /// Parse and validate a complete `.mimi` image.
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let mut tail = Bytes(data);
        let header = tail
            .read::<mimi::TaskHeader>()
            .read_error("Truncated MIMI header")?;
        validate_header(header, Arch::Thumb)?;

        let text = tail
            .read_bytes(header.text_size.get() as usize)
            .read_error("Truncated MIMI text section")?;
        let rodata = tail
            .read_bytes(header.rodata_size.get() as usize)
            .read_error("Truncated MIMI rodata section")?;
        let data = tail
            .read_bytes(header.data_size.get() as usize)
            .read_error("Truncated MIMI data section")?;
        let relocs = tail
            .read_slice::<mimi::Reloc>(header.reloc_count.get() as usize)
            .read_error("Truncated MIMI relocation table")?;
        let symbols = tail
            .read_slice::<mimi::Symbol>(header.symbol_count.get() as usize)
            .read_error("Truncated MIMI symbol table")?;

        for reloc in relocs {
            validate_reloc(header, reloc)?;
        }
        for symbol in symbols {
            SymbolKind::from_u8(symbol.kind).read_error("Unknown symbol type")?;
            SectionId::from_u8(symbol.section).read_error("Invalid symbol section")?;
        }

        Ok(TaskFile {
            header,
            text: text.0,
            rodata: rodata.0,
            data: data.0,
            relocs,
            symbols,
        })
    }

    #[inline]
    pub fn header(&self) -> &'data mimi::TaskHeader {
        self.header
    }

    /// Image name from the header, without NUL padding.
    pub fn name(&self) -> &'data [u8] {
        mimi::name_str(&self.header.name)
    }

    /// Entry point offset within `.text`.
    #[inline]
    pub fn entry_offset(&self) -> u32 {
        self.header.entry_offset.get()
    }

    /// File bytes of a section. `Bss` and `Null` have none.
    pub fn section(&self, id: SectionId) -> &'data [u8] {
        match id {
            SectionId::Text => self.text,
            SectionId::Rodata => self.rodata,
            SectionId::Data => self.data,
            SectionId::Null | SectionId::Bss => &[],
        }
    }

    #[inline]
    pub fn relocs(&self) -> &'data [mimi::Reloc] {
        self.relocs
    }

    #[inline]
    pub fn symbols(&self) -> &'data [mimi::Symbol] {
        self.symbols
    }

    /// Look up a symbol record by table index.
    pub fn symbol(&self, index: u32) -> Result<&'data mimi::Symbol> {
        self.symbols
            .get(index as usize)
            .read_error("Symbol index out of range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endian::U32;

    fn empty_header() -> mimi::TaskHeader {
        mimi::TaskHeader {
            magic: U32::new(mimi::MAGIC),
            version: mimi::VERSION,
            flags: 0,
            arch: mimi::ARCH_THUMB,
            pad: 0,
            entry_offset: U32::new(0),
            text_size: U32::new(4),
            rodata_size: U32::new(0),
            data_size: U32::new(0),
            bss_size: U32::new(0),
            reloc_count: U32::new(0),
            symbol_count: U32::new(0),
            stack_request: U32::new(0),
            heap_request: U32::new(0),
            name: [0; mimi::NAME_LEN],
            reserved: U32::new(0),
        }
    }

    #[test]
    fn header_checks() {
        let mut header = empty_header();
        assert!(validate_header(&header, Arch::Thumb).is_ok());

        header.entry_offset.set(4);
        assert_eq!(
            validate_header(&header, Arch::Thumb),
            Err(Error("MIMI entry point outside text"))
        );

        header.entry_offset.set(0);
        header.text_size.set(0);
        assert_eq!(
            validate_header(&header, Arch::Thumb),
            Err(Error("MIMI image has no text"))
        );

        header.text_size.set(4);
        header.magic.set(0xdead_beef);
        assert_eq!(
            validate_header(&header, Arch::Thumb),
            Err(Error("Invalid MIMI magic"))
        );
    }

    #[test]
    fn truncated_text_is_rejected() {
        let header = empty_header();
        let mut image = crate::pod::bytes_of(&header).to_vec();
        image.extend_from_slice(&[0; 2]);
        assert!(TaskFile::parse(&image).is_err());
        image.extend_from_slice(&[0; 2]);
        assert!(TaskFile::parse(&image).is_ok());
    }
}
