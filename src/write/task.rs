//! Writer for `.mimi` executable images, the linker's output.

use core::mem::size_of;

use crate::endian::U32;
use crate::mimi;
use crate::pod::{bytes_of, bytes_of_slice};

/// The assembled contents of a `.mimi` image, ready to serialize.
///
/// The linker fills this in after section concatenation and symbol merging;
/// the writer owns only the layout.
#[derive(Debug, Default)]
pub struct TaskBuilder {
    pub entry_offset: u32,
    pub stack_request: u32,
    pub heap_request: u32,
    pub name: String,
    pub text: Vec<u8>,
    pub rodata: Vec<u8>,
    pub data: Vec<u8>,
    pub bss_size: u32,
    pub relocs: Vec<mimi::Reloc>,
    pub symbols: Vec<mimi::Symbol>,
}

impl TaskBuilder {
    /// The header this builder will serialize.
    pub fn header(&self) -> mimi::TaskHeader {
        mimi::TaskHeader {
            magic: U32::new(mimi::MAGIC),
            version: mimi::VERSION,
            flags: 0,
            arch: mimi::ARCH_THUMB,
            pad: 0,
            entry_offset: U32::new(self.entry_offset),
            text_size: U32::new(self.text.len() as u32),
            rodata_size: U32::new(self.rodata.len() as u32),
            data_size: U32::new(self.data.len() as u32),
            bss_size: U32::new(self.bss_size),
            reloc_count: U32::new(self.relocs.len() as u32),
            symbol_count: U32::new(self.symbols.len() as u32),
            stack_request: U32::new(self.stack_request),
            heap_request: U32::new(self.heap_request),
            name: mimi::name_bytes(&self.name),
            reserved: U32::new(0),
        }
    }

    /// Total serialized size in bytes.
    pub fn size(&self) -> usize {
        mimi::HEADER_SIZE
            + self.text.len()
            + self.rodata.len()
            + self.data.len()
            + self.relocs.len() * size_of::<mimi::Reloc>()
            + self.symbols.len() * size_of::<mimi::Symbol>()
    }

    /// Serialize in contract order: header, `.text`, `.rodata`, `.data`,
    /// relocations, symbols. `.bss` is never stored.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.reserve(self.size());
        out.extend_from_slice(bytes_of(&self.header()));
        out.extend_from_slice(&self.text);
        out.extend_from_slice(&self.rodata);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(bytes_of_slice(&self.relocs));
        out.extend_from_slice(bytes_of_slice(&self.symbols));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::bytes_of;
    use crate::read::TaskFile;

    #[test]
    fn image_round_trip() {
        let builder = TaskBuilder {
            entry_offset: 0,
            stack_request: mimi::DEFAULT_STACK_SIZE,
            heap_request: mimi::DEFAULT_HEAP_SIZE,
            name: "blink".to_string(),
            text: vec![0x70, 0x47, 0x00, 0x00],
            rodata: Vec::new(),
            data: vec![1, 2, 3, 4],
            bss_size: 32,
            relocs: Vec::new(),
            symbols: Vec::new(),
        };

        let mut file = Vec::new();
        builder.write_to(&mut file);
        assert_eq!(file.len(), builder.size());

        let image = TaskFile::parse(&file).unwrap();
        // Field-for-field identity with what was written.
        assert_eq!(bytes_of(image.header()), bytes_of(&builder.header()));
        assert_eq!(image.name(), b"blink");
        assert_eq!(image.header().bss_size.get(), 32);
    }
}
