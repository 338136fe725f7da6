//! Pass 5: object files to a `.mimi` executable.
//!
//! Sections concatenate in input order, each object's placed at a 4-byte
//! base. Every relocation offset and every defined symbol value shifts by
//! its object's section base, and each object's symbols are renumbered
//! into the merged table with relocations rewritten to the new indices.
//!
//! Merge rules by name: a GLOBAL definition fills in an earlier EXTERN;
//! two GLOBAL definitions are a duplicate-symbol error; EXTERN references
//! with a known kernel syscall name become SYSCALL symbols carrying the
//! syscall number. Anything still undefined after that fails the link.
//!
//! The zero tail of the merged data section is not stored in the image;
//! it becomes `bss_size` and the loader zero-fills it, with care taken
//! not to hoist bytes that a data relocation must patch.

use indexmap::IndexMap;
use log::debug;

use crate::common::{ErrorCode, Result, SectionId, SymbolKind};
use crate::fs::{BlockDevice, Volume};
use crate::kernel::syscall;
use crate::mimi;
use crate::read::ObjFile;
use crate::write::TaskBuilder;

/// Counters reported by the linker.
#[derive(Debug, Default, Clone)]
pub struct LinkStats {
    pub text_size: u32,
    pub data_size: u32,
    pub bss_size: u32,
    pub relocs: u32,
    pub symbols: u32,
    pub entry_offset: u32,
}

fn align4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// Link `objects` into a `.mimi` image at `output_path`.
pub fn link<D: BlockDevice>(
    vol: &mut Volume<D>,
    objects: &[&[u8]],
    output_path: &str,
) -> Result<LinkStats> {
    if objects.is_empty() {
        return Err(ErrorCode::Inval);
    }

    let mut image = TaskBuilder {
        stack_request: mimi::DEFAULT_STACK_SIZE,
        heap_request: mimi::DEFAULT_HEAP_SIZE,
        name: image_name(output_path),
        ..TaskBuilder::default()
    };

    // Index of the merged symbol with each name, for non-local symbols.
    let mut by_name: IndexMap<[u8; mimi::NAME_LEN], u32> = IndexMap::new();

    for &raw in objects {
        let object = ObjFile::parse(raw).map_err(|err| {
            debug!("link: bad object: {}", err);
            ErrorCode::Corrupt
        })?;

        align4(&mut image.text);
        align4(&mut image.data);
        let text_base = image.text.len() as u32;
        let data_base = image.data.len() as u32;
        image.text.extend_from_slice(object.text());
        image.data.extend_from_slice(object.data());

        // Renumber this object's symbols into the merged table.
        let mut index_map = Vec::with_capacity(object.symbols().len());
        for symbol in object.symbols() {
            let kind = SymbolKind::from_u8(symbol.kind).ok_or(ErrorCode::Corrupt)?;
            let mut merged = *symbol;
            match SectionId::from_u8(symbol.section).ok_or(ErrorCode::Corrupt)? {
                SectionId::Text => merged.value.set(symbol.value.get() + text_base),
                SectionId::Data => merged.value.set(symbol.value.get() + data_base),
                _ => {}
            }

            let new_index = match kind {
                SymbolKind::Local => {
                    // Locals are invisible across objects; append as-is.
                    image.symbols.push(merged);
                    image.symbols.len() as u32 - 1
                }
                SymbolKind::Global | SymbolKind::Syscall => {
                    match by_name.get(&symbol.name).copied() {
                        Some(existing) => {
                            let slot = &mut image.symbols[existing as usize];
                            if slot.kind != mimi::SYM_EXTERN {
                                debug!(
                                    "link: duplicate symbol {}",
                                    String::from_utf8_lossy(mimi::name_str(&symbol.name))
                                );
                                return Err(ErrorCode::Inval);
                            }
                            *slot = merged;
                            existing
                        }
                        None => {
                            image.symbols.push(merged);
                            let index = image.symbols.len() as u32 - 1;
                            by_name.insert(symbol.name, index);
                            index
                        }
                    }
                }
                SymbolKind::Extern => match by_name.get(&symbol.name).copied() {
                    Some(existing) => existing,
                    None => {
                        image.symbols.push(merged);
                        let index = image.symbols.len() as u32 - 1;
                        by_name.insert(symbol.name, index);
                        index
                    }
                },
            };
            index_map.push(new_index);
        }

        // Shift relocation offsets and rewrite their symbol indices.
        for reloc in object.relocs() {
            let mut merged = *reloc;
            match SectionId::from_u8(reloc.section.get() as u8) {
                Some(SectionId::Text) => merged.offset.set(reloc.offset.get() + text_base),
                Some(SectionId::Data) => merged.offset.set(reloc.offset.get() + data_base),
                _ => return Err(ErrorCode::Corrupt),
            }
            let old = reloc.symbol_idx.get() as usize;
            let new = *index_map.get(old).ok_or(ErrorCode::Corrupt)?;
            merged.symbol_idx.set(new);
            image.relocs.push(merged);
        }
    }

    // Externs with syscall names resolve to SYSCALL symbols now; the
    // loader performs the same lookup for images linked elsewhere.
    for symbol in &mut image.symbols {
        if symbol.kind == mimi::SYM_EXTERN {
            let name = mimi::name_str(&symbol.name);
            match syscall::syscall_by_name(name) {
                Some(number) => {
                    symbol.kind = mimi::SYM_SYSCALL;
                    symbol.section = mimi::SEC_NULL;
                    symbol.value.set(number as u32);
                }
                None => {
                    debug!(
                        "link: unresolved external {}",
                        String::from_utf8_lossy(name)
                    );
                    return Err(ErrorCode::Noent);
                }
            }
        }
    }

    // Entry point: the GLOBAL `main`.
    let main_name = mimi::name_bytes("main");
    let entry = image
        .symbols
        .iter()
        .find(|s| s.name == main_name && s.kind == mimi::SYM_GLOBAL)
        .ok_or(ErrorCode::Noent)?;
    if entry.section != mimi::SEC_TEXT {
        return Err(ErrorCode::Noexec);
    }
    image.entry_offset = entry.value.get();

    // Hoist the zero tail of data into bss, but never past the last byte
    // a data relocation patches.
    let mut keep = image.data.len();
    while keep > 0 && image.data[keep - 1] == 0 {
        keep -= 1;
    }
    for reloc in &image.relocs {
        if reloc.section.get() as u8 == mimi::SEC_DATA {
            keep = keep.max(reloc.offset.get() as usize + 4);
        }
    }
    keep = (keep + 3) & !3;
    image.bss_size = (image.data.len() - keep) as u32;
    image.data.truncate(keep);

    let stats = LinkStats {
        text_size: image.text.len() as u32,
        data_size: image.data.len() as u32,
        bss_size: image.bss_size,
        relocs: image.relocs.len() as u32,
        symbols: image.symbols.len() as u32,
        entry_offset: image.entry_offset,
    };

    let mut file = Vec::new();
    image.write_to(&mut file);
    vol.write_file(output_path, &file)?;
    debug!(
        "link: {} text={} data={} bss={} entry={:#x}",
        output_path, stats.text_size, stats.data_size, stats.bss_size, stats.entry_offset
    );
    Ok(stats)
}

/// The image name recorded in the header: the file's base name without
/// its extension.
fn image_name(path: &str) -> String {
    let base = path.rsplit('/').next().unwrap_or(path);
    let stem = base.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(base);
    stem.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RelocKind;
    use crate::fs::{format, RamDisk};
    use crate::read::TaskFile;
    use crate::write::ObjBuilder;

    fn fresh_volume() -> Volume<RamDisk> {
        let mut disk = RamDisk::new(4096);
        format(&mut disk, "TEST").unwrap();
        Volume::mount(disk).unwrap()
    }

    fn object_with_main(extra: impl FnOnce(&mut ObjBuilder)) -> Vec<u8> {
        let mut builder = ObjBuilder::new();
        builder.text.extend_from_slice(&[0x70, 0x47, 0xC0, 0x46]); // BX LR; NOP
        builder.add_symbol("main", 0, SectionId::Text, SymbolKind::Global);
        extra(&mut builder);
        let mut raw = Vec::new();
        builder.write_to(&mut raw);
        raw
    }

    #[test]
    fn entry_is_main() {
        let mut vol = fresh_volume();
        let obj = object_with_main(|_| {});
        let stats = link(&mut vol, &[&obj], "a.mimi").unwrap();
        assert_eq!(stats.entry_offset, 0);

        let raw = vol.read_file("a.mimi").unwrap();
        let image = TaskFile::parse(&raw).unwrap();
        assert_eq!(image.name(), b"a");
        assert_eq!(image.header().stack_request.get(), mimi::DEFAULT_STACK_SIZE);
        assert_eq!(image.header().heap_request.get(), mimi::DEFAULT_HEAP_SIZE);
    }

    #[test]
    fn missing_main_fails() {
        let mut vol = fresh_volume();
        let mut builder = ObjBuilder::new();
        builder.text.extend_from_slice(&[0x70, 0x47]);
        builder.add_symbol("helper", 0, SectionId::Text, SymbolKind::Global);
        let mut raw = Vec::new();
        builder.write_to(&mut raw);
        assert_eq!(link(&mut vol, &[&raw], "a.mimi").err(), Some(ErrorCode::Noent));
    }

    #[test]
    fn global_fills_extern_and_indices_remap() {
        let mut vol = fresh_volume();

        // Object A calls `helper`, known only as an extern. Its symbol
        // table is [helper(EXTERN), main(GLOBAL)].
        let mut a = ObjBuilder::new();
        a.text.extend_from_slice(&[0; 8]);
        let helper_a = a.add_symbol("helper", 0, SectionId::Null, SymbolKind::Extern);
        a.add_symbol("main", 0, SectionId::Text, SymbolKind::Global);
        a.add_reloc(0, SectionId::Text, RelocKind::ThumbCall, helper_a);
        let mut raw_a = Vec::new();
        a.write_to(&mut raw_a);

        // Object B defines helper at its local text offset 4.
        let mut b = ObjBuilder::new();
        b.text.extend_from_slice(&[0; 12]);
        b.add_symbol("other", 0, SectionId::Text, SymbolKind::Local);
        b.add_symbol("helper", 4, SectionId::Text, SymbolKind::Global);
        let mut raw_b = Vec::new();
        b.write_to(&mut raw_b);

        let stats = link(&mut vol, &[&raw_a, &raw_b], "ab.mimi").unwrap();
        assert_eq!(stats.text_size, 20);

        let raw = vol.read_file("ab.mimi").unwrap();
        let image = TaskFile::parse(&raw).unwrap();
        let reloc = &image.relocs()[0];
        let target = image.symbol(reloc.symbol_idx.get()).unwrap();
        assert_eq!(mimi::name_str(&target.name), b"helper");
        assert_eq!(target.kind, mimi::SYM_GLOBAL);
        // Object B's text base is 8, so helper lands at 12.
        assert_eq!(target.value.get(), 12);
    }

    #[test]
    fn duplicate_globals_fail() {
        let mut vol = fresh_volume();
        let a = object_with_main(|_| {});
        let b = object_with_main(|_| {});
        assert_eq!(
            link(&mut vol, &[&a, &b], "dup.mimi").err(),
            Some(ErrorCode::Inval)
        );
    }

    #[test]
    fn syscall_extern_resolves() {
        let mut vol = fresh_volume();
        let obj = object_with_main(|builder| {
            builder.add_symbol("sleep_ms", 0, SectionId::Null, SymbolKind::Extern);
        });
        link(&mut vol, &[&obj], "s.mimi").unwrap();

        let raw = vol.read_file("s.mimi").unwrap();
        let image = TaskFile::parse(&raw).unwrap();
        let symbol = image
            .symbols()
            .iter()
            .find(|s| mimi::name_str(&s.name) == b"sleep_ms")
            .unwrap();
        assert_eq!(symbol.kind, mimi::SYM_SYSCALL);
        assert_eq!(symbol.value.get(), 2);
    }

    #[test]
    fn unknown_extern_fails() {
        let mut vol = fresh_volume();
        let obj = object_with_main(|builder| {
            builder.add_symbol("no_such_fn", 0, SectionId::Null, SymbolKind::Extern);
        });
        assert_eq!(
            link(&mut vol, &[&obj], "u.mimi").err(),
            Some(ErrorCode::Noent)
        );
    }

    #[test]
    fn zero_tail_hoists_to_bss() {
        let mut vol = fresh_volume();
        let obj = object_with_main(|builder| {
            builder.data.extend_from_slice(&7u32.to_le_bytes());
            builder.data.extend_from_slice(&[0; 40]);
            builder.add_symbol("buf", 4, SectionId::Data, SymbolKind::Global);
        });
        let stats = link(&mut vol, &[&obj], "b.mimi").unwrap();
        assert_eq!(stats.data_size, 4);
        assert_eq!(stats.bss_size, 40);
    }
}
