//! Reader for per-compile object files, the linker's input.

use crate::common::{RelocKind, SectionId, SymbolKind};
use crate::mimi;
use crate::pod::Bytes;
use crate::read::{Error, ReadError, Result};

/// A parsed object file.
///
/// Objects carry only text and data; rodata and bss exist only in the
/// linked image.
#[derive(Debug)]
pub struct ObjFile<'data> {
    header: &'data mimi::ObjHeader,
    text: &'data [u8],
    data: &'data [u8],
    relocs: &'data [mimi::Reloc],
    symbols: &'data [mimi::Symbol],
}

impl<'data> ObjFile<'data> {
    /// Parse and validate an object file.
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let mut tail = Bytes(data);
        let header = tail
            .read::<mimi::ObjHeader>()
            .read_error("Truncated object header")?;
        let text = tail
            .read_bytes(header.text_size.get() as usize)
            .read_error("Truncated object text")?;
        let data = tail
            .read_bytes(header.data_size.get() as usize)
            .read_error("Truncated object data")?;
        let relocs = tail
            .read_slice::<mimi::Reloc>(header.reloc_count.get() as usize)
            .read_error("Truncated object relocation table")?;
        let symbols = tail
            .read_slice::<mimi::Symbol>(header.symbol_count.get() as usize)
            .read_error("Truncated object symbol table")?;

        for reloc in relocs {
            let section_size = match SectionId::from_u8(reloc.section.get() as u8) {
                Some(SectionId::Text) => header.text_size.get(),
                Some(SectionId::Data) => header.data_size.get(),
                _ => return Err(Error("Invalid object relocation section")),
            };
            let offset = reloc.offset.get();
            if offset.checked_add(4).map_or(true, |end| end > section_size) {
                return Err(Error("Object relocation outside its section"));
            }
            RelocKind::from_u8(reloc.kind).read_error("Unknown object relocation type")?;
            if reloc.symbol_idx.get() >= header.symbol_count.get() {
                return Err(Error("Object relocation symbol index out of range"));
            }
        }
        for symbol in symbols {
            SymbolKind::from_u8(symbol.kind).read_error("Unknown object symbol type")?;
            SectionId::from_u8(symbol.section).read_error("Invalid object symbol section")?;
        }

        Ok(ObjFile {
            header,
            text: text.0,
            data: data.0,
            relocs,
            symbols,
        })
    }

    #[inline]
    pub fn header(&self) -> &'data mimi::ObjHeader {
        self.header
    }

    #[inline]
    pub fn text(&self) -> &'data [u8] {
        self.text
    }

    #[inline]
    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    #[inline]
    pub fn relocs(&self) -> &'data [mimi::Reloc] {
        self.relocs
    }

    #[inline]
    pub fn symbols(&self) -> &'data [mimi::Symbol] {
        self.symbols
    }
}
