//! Writer for per-compile object files, the code generator's output.

use core::mem::size_of;

use crate::common::{RelocKind, SectionId, SymbolKind};
use crate::endian::{U16, U32};
use crate::mimi;
use crate::pod::{bytes_of, bytes_of_slice};

/// Accumulates an object file's sections, relocations, and symbols as the
/// code generator runs, then serializes them in contract order.
#[derive(Debug, Default)]
pub struct ObjBuilder {
    pub text: Vec<u8>,
    pub data: Vec<u8>,
    relocs: Vec<mimi::Reloc>,
    symbols: Vec<mimi::Symbol>,
}

impl ObjBuilder {
    pub fn new() -> Self {
        ObjBuilder::default()
    }

    /// Append a symbol record, returning its table index.
    pub fn add_symbol(
        &mut self,
        name: &str,
        value: u32,
        section: SectionId,
        kind: SymbolKind,
    ) -> u32 {
        let index = self.symbols.len() as u32;
        self.symbols.push(mimi::Symbol {
            name: mimi::name_bytes(name),
            value: U32::new(value),
            section: section.to_u8(),
            kind: kind.to_u8(),
            pad: [0; 2],
        });
        index
    }

    /// Record a fix-up at `offset` within `section` against `symbol_idx`.
    pub fn add_reloc(&mut self, offset: u32, section: SectionId, kind: RelocKind, symbol_idx: u32) {
        self.relocs.push(mimi::Reloc {
            offset: U32::new(offset),
            section: U16::new(section.to_u8() as u16),
            kind: kind.to_u8(),
            pad: 0,
            symbol_idx: U32::new(symbol_idx),
        });
    }

    pub fn symbols(&self) -> &[mimi::Symbol] {
        &self.symbols
    }

    pub fn relocs(&self) -> &[mimi::Reloc] {
        &self.relocs
    }

    /// Find a symbol index by name.
    pub fn symbol_index(&self, name: &str) -> Option<u32> {
        let name = mimi::name_bytes(name);
        self.symbols
            .iter()
            .position(|symbol| symbol.name == name)
            .map(|index| index as u32)
    }

    /// Update a symbol's value and section once its definition is seen.
    pub fn define_symbol(&mut self, index: u32, value: u32, section: SectionId, kind: SymbolKind) {
        if let Some(symbol) = self.symbols.get_mut(index as usize) {
            symbol.value.set(value);
            symbol.section = section.to_u8();
            symbol.kind = kind.to_u8();
        }
    }

    /// Total serialized size in bytes.
    pub fn size(&self) -> usize {
        size_of::<mimi::ObjHeader>()
            + self.text.len()
            + self.data.len()
            + self.relocs.len() * size_of::<mimi::Reloc>()
            + self.symbols.len() * size_of::<mimi::Symbol>()
    }

    /// Serialize in contract order: header, text, data, relocations, symbols.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.reserve(self.size());
        let header = mimi::ObjHeader {
            text_size: U32::new(self.text.len() as u32),
            data_size: U32::new(self.data.len() as u32),
            reloc_count: U32::new(self.relocs.len() as u32),
            symbol_count: U32::new(self.symbols.len() as u32),
        };
        out.extend_from_slice(bytes_of(&header));
        out.extend_from_slice(&self.text);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(bytes_of_slice(&self.relocs));
        out.extend_from_slice(bytes_of_slice(&self.symbols));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::ObjFile;

    #[test]
    fn object_round_trip() {
        let mut builder = ObjBuilder::new();
        builder.text.extend_from_slice(&[0x70, 0x47]); // BX LR
        builder.text.extend_from_slice(&[0x00, 0x00]);
        builder.data.extend_from_slice(b"hi\0\0");
        let main = builder.add_symbol("main", 0, SectionId::Text, SymbolKind::Global);
        let lit = builder.add_symbol("$str0", 0, SectionId::Data, SymbolKind::Local);
        builder.add_reloc(0, SectionId::Text, RelocKind::ThumbCall, main);
        builder.add_reloc(0, SectionId::Data, RelocKind::DataPtr, lit);

        let mut file = Vec::new();
        builder.write_to(&mut file);
        assert_eq!(file.len(), builder.size());

        let obj = ObjFile::parse(&file).unwrap();
        assert_eq!(obj.text(), &builder.text[..]);
        assert_eq!(obj.data(), b"hi\0\0");
        assert_eq!(obj.relocs().len(), 2);
        assert_eq!(mimi::name_str(&obj.symbols()[0].name), b"main");
    }
}
