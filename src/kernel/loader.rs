//! The relocating loader.
//!
//! Reads a `.mimi` image from the volume, validates the header before
//! trusting any other field, lays the task out in one contiguous
//! user-arena block, streams the sections in, zero-fills bss, applies
//! every relocation against the block base, and hands the slot to the
//! scheduler READY. Any failure tears the half-built task down — arena
//! block freed, slot returned to FREE — before the error comes back.
//!
//! `THUMB_CALL` relocations against syscall symbols rewrite the `BL`
//! pair into `MOV r7, #n; SVC #0` in place, which is the load-time half
//! of the contract whose compile-time half lives in the code generator.

use log::{debug, warn};

use crate::cc::thumb;
use crate::common::{Arch, ErrorCode, RelocKind, Result, SectionId, SymbolKind};
use crate::fs::{BlockDevice, FileHandle, OpenMode, Volume};
use crate::kernel::syscall::syscall_by_name;
use crate::kernel::task::{MemLayout, TaskState};
use crate::kernel::{Kernel, Platform};
use crate::mimi;
use crate::pod;
use crate::read;

/// Load `path` and mark the new task READY at `priority`.
///
/// Returns the task id.
pub fn load_and_start<D: BlockDevice, P: Platform>(
    kernel: &mut Kernel<P>,
    vol: &mut Volume<D>,
    path: &str,
    priority: u8,
) -> Result<usize> {
    let mut file = vol.open(path, OpenMode::READ)?;

    // Step 1: header checks, magic and version first.
    let mut raw = [0u8; mimi::HEADER_SIZE];
    if vol.read(&mut file, &mut raw)? != raw.len() {
        vol.close(file)?;
        return Err(ErrorCode::Noexec);
    }
    let header = match pod::from_bytes::<mimi::TaskHeader>(&raw) {
        Ok(header) => *header,
        Err(()) => {
            vol.close(file)?;
            return Err(ErrorCode::Noexec);
        }
    };
    if let Err(err) = read::validate_header(&header, Arch::Thumb) {
        warn!("load {}: {}", path, err);
        vol.close(file)?;
        return Err(ErrorCode::Noexec);
    }

    // Step 2: claim a task slot.
    let slot = match kernel.task_alloc() {
        Some(slot) => slot,
        None => {
            vol.close(file)?;
            return Err(ErrorCode::Nomem);
        }
    };

    match populate(kernel, vol, &mut file, &header, slot, priority) {
        Ok(()) => {
            vol.close(file)?;
            let task = &kernel.tasks[slot];
            debug!(
                "load {}: task {} entry {:#x} total {:#x}",
                path, slot, task.entry, task.layout.total_size
            );
            Ok(slot)
        }
        Err(err) => {
            // Tear down the partial task before reporting.
            kernel.teardown(slot);
            vol.close(file)?;
            Err(err)
        }
    }
}

/// Steps 3-7: layout, arena, sections, relocations, finalize.
fn populate<D: BlockDevice, P: Platform>(
    kernel: &mut Kernel<P>,
    vol: &mut Volume<D>,
    file: &mut FileHandle,
    header: &mimi::TaskHeader,
    slot: usize,
    priority: u8,
) -> Result<()> {
    // Step 3: region offsets within one contiguous block.
    let text_size = header.text_size.get();
    let rodata_size = header.rodata_size.get();
    let data_size = header.data_size.get();
    let bss_size = header.bss_size.get();
    let heap_size = match header.heap_request.get() {
        0 => mimi::DEFAULT_HEAP_SIZE,
        n => n,
    };
    let stack_size = match header.stack_request.get() {
        0 => mimi::DEFAULT_STACK_SIZE,
        n => n,
    };

    // Guard the layout sums against crafted headers before narrowing.
    let stack_top = text_size as u64
        + rodata_size as u64
        + data_size as u64
        + bss_size as u64
        + heap_size as u64
        + stack_size as u64;
    let total = (stack_top + 31) & !31;
    if total > u32::MAX as u64 {
        return Err(ErrorCode::Nomem);
    }

    let layout = MemLayout {
        text_start: 0,
        text_size,
        rodata_start: text_size,
        rodata_size,
        data_start: text_size + rodata_size,
        data_size,
        bss_start: text_size + rodata_size + data_size,
        bss_size,
        heap_start: text_size + rodata_size + data_size + bss_size,
        heap_size,
        heap_used: 0,
        stack_top: stack_top as u32,
        stack_size,
        total_size: total as u32,
    };

    // Step 4: one block, owned by this task.
    let base = kernel
        .user_alloc(slot as u8, layout.total_size)
        .ok_or(ErrorCode::Nomem)?;

    // Step 5: sections into place, bss zeroed.
    copy_section(kernel, vol, file, base + layout.text_start, text_size)?;
    copy_section(kernel, vol, file, base + layout.rodata_start, rodata_size)?;
    copy_section(kernel, vol, file, base + layout.data_start, data_size)?;
    kernel.with_user_arena(|arena| -> Result<()> {
        let bss = arena
            .bytes_mut(base + layout.bss_start, bss_size as usize)
            .ok_or(ErrorCode::Nomem)?;
        bss.fill(0);
        Ok(())
    })?;

    // Step 6: relocate. The symbol table sits after the relocations;
    // pull it into a temporary kernel-side buffer first.
    let reloc_count = header.reloc_count.get() as usize;
    let symbol_count = header.symbol_count.get() as usize;
    let mut symbols: Vec<mimi::Symbol> = Vec::new();
    if symbol_count > 0 {
        let symbols_at = mimi::HEADER_SIZE as u32
            + text_size
            + rodata_size
            + data_size
            + (reloc_count * core::mem::size_of::<mimi::Reloc>()) as u32;
        vol.seek(file, symbols_at)?;
        let mut raw = vec![0u8; symbol_count * core::mem::size_of::<mimi::Symbol>()];
        if vol.read(file, &mut raw)? != raw.len() {
            return Err(ErrorCode::Corrupt);
        }
        match pod::slice_from_bytes::<mimi::Symbol>(&raw, symbol_count) {
            Ok(table) => symbols.extend_from_slice(table),
            Err(()) => return Err(ErrorCode::Corrupt),
        }
    }

    if reloc_count > 0 {
        let relocs_at = mimi::HEADER_SIZE as u32 + text_size + rodata_size + data_size;
        vol.seek(file, relocs_at)?;
        for _ in 0..reloc_count {
            let mut raw = [0u8; core::mem::size_of::<mimi::Reloc>()];
            if vol.read(file, &mut raw)? != raw.len() {
                return Err(ErrorCode::Corrupt);
            }
            let reloc = match pod::from_bytes::<mimi::Reloc>(&raw) {
                Ok(reloc) => *reloc,
                Err(()) => return Err(ErrorCode::Corrupt),
            };
            if let Err(err) = read::validate_reloc(header, &reloc) {
                warn!("load: {}", err);
                return Err(ErrorCode::Corrupt);
            }
            apply_reloc(kernel, base, &layout, &reloc, &symbols)?;
        }
    }

    // Step 7: finalize the TCB, under the scheduler's critical section
    // like every other task-table mutation.
    critical_section::with(|_| {
        let task = &mut kernel.tasks[slot];
        task.entry = base + layout.text_start + header.entry_offset.get();
        task.base = base;
        task.layout = layout;
        task.priority = priority;
        task.name = header.name;
        task.saved.sp = base + layout.stack_top;
        // Entry addresses carry the Thumb bit when branched to.
        task.saved.pc = task.entry | 1;
        task.state = TaskState::Ready;
    });
    Ok(())
}

/// Stream `size` bytes from the image into arena memory at `addr`.
fn copy_section<D: BlockDevice, P: Platform>(
    kernel: &mut Kernel<P>,
    vol: &mut Volume<D>,
    file: &mut FileHandle,
    addr: u32,
    size: u32,
) -> Result<()> {
    let mut remaining = size as usize;
    let mut at = addr;
    let mut chunk = [0u8; 512];
    while remaining > 0 {
        let n = remaining.min(chunk.len());
        if vol.read(file, &mut chunk[..n])? != n {
            return Err(ErrorCode::Corrupt);
        }
        kernel.with_user_arena(|arena| -> Result<()> {
            let dst = arena.bytes_mut(at, n).ok_or(ErrorCode::Nomem)?;
            dst.copy_from_slice(&chunk[..n]);
            Ok(())
        })?;
        at += n as u32;
        remaining -= n;
    }
    Ok(())
}

fn section_start(layout: &MemLayout, section: SectionId) -> u32 {
    match section {
        SectionId::Text => layout.text_start,
        SectionId::Rodata => layout.rodata_start,
        SectionId::Data => layout.data_start,
        SectionId::Bss => layout.bss_start,
        SectionId::Null => 0,
    }
}

/// The runtime value a relocation's symbol resolves to, or the syscall
/// number for syscall symbols.
enum Resolved {
    Address(u32),
    Syscall(u8),
}

fn resolve(base: u32, layout: &MemLayout, symbol: &mimi::Symbol) -> Result<Resolved> {
    let kind = SymbolKind::from_u8(symbol.kind).ok_or(ErrorCode::Corrupt)?;
    match kind {
        SymbolKind::Syscall => Ok(Resolved::Syscall(symbol.value.get() as u8)),
        SymbolKind::Extern => {
            // Leftover externs resolve against the kernel syscall table.
            match syscall_by_name(mimi::name_str(&symbol.name)) {
                Some(number) => Ok(Resolved::Syscall(number)),
                None => {
                    warn!(
                        "load: unresolved symbol {}",
                        String::from_utf8_lossy(mimi::name_str(&symbol.name))
                    );
                    Err(ErrorCode::Noent)
                }
            }
        }
        SymbolKind::Local | SymbolKind::Global => {
            let section = SectionId::from_u8(symbol.section).ok_or(ErrorCode::Corrupt)?;
            Ok(Resolved::Address(
                base + section_start(layout, section) + symbol.value.get(),
            ))
        }
    }
}

fn apply_reloc<P: Platform>(
    kernel: &mut Kernel<P>,
    base: u32,
    layout: &MemLayout,
    reloc: &mimi::Reloc,
    symbols: &[mimi::Symbol],
) -> Result<()> {
    let section = SectionId::from_u8(reloc.section.get() as u8).ok_or(ErrorCode::Corrupt)?;
    let kind = RelocKind::from_u8(reloc.kind).ok_or(ErrorCode::Corrupt)?;
    let symbol = symbols
        .get(reloc.symbol_idx.get() as usize)
        .ok_or(ErrorCode::Corrupt)?;
    let patch_addr = base + section_start(layout, section) + reloc.offset.get();
    let resolved = resolve(base, layout, symbol)?;

    let value = match (&resolved, kind) {
        (Resolved::Syscall(number), RelocKind::ThumbCall) => {
            // Rewrite the BL pair into `MOV r7, #n; SVC #0`; both forms
            // are four bytes.
            let mov = thumb::mov_imm(thumb::R7, *number);
            let svc = thumb::svc(0);
            let mut patch = [0u8; 4];
            patch[..2].copy_from_slice(&mov.to_le_bytes());
            patch[2..].copy_from_slice(&svc.to_le_bytes());
            return write_patch(kernel, patch_addr, &patch);
        }
        (Resolved::Syscall(number), _) => {
            // An absolute reference to a syscall stores its number.
            *number as u32
        }
        (Resolved::Address(address), _) => *address,
    };

    match kind {
        RelocKind::Abs32 | RelocKind::DataPtr => {
            write_patch(kernel, patch_addr, &value.to_le_bytes())
        }
        RelocKind::Rel32 => {
            let rel = value.wrapping_sub(patch_addr).wrapping_sub(4);
            write_patch(kernel, patch_addr, &rel.to_le_bytes())
        }
        RelocKind::ThumbCall => {
            let offset = value as i64 - (patch_addr as i64 + 4);
            let offset = offset as i32;
            if !thumb::bl_in_range(offset) {
                warn!("load: BL target out of range");
                return Err(ErrorCode::Corrupt);
            }
            let (hi, lo) = thumb::bl(offset);
            let mut patch = [0u8; 4];
            patch[..2].copy_from_slice(&hi.to_le_bytes());
            patch[2..].copy_from_slice(&lo.to_le_bytes());
            write_patch(kernel, patch_addr, &patch)
        }
        RelocKind::ThumbBranch => {
            let offset = value as i64 - (patch_addr as i64 + 4);
            let offset = offset as i32;
            if !thumb::b_in_range(offset) {
                warn!("load: branch target out of range");
                return Err(ErrorCode::Corrupt);
            }
            write_patch(kernel, patch_addr, &thumb::b(offset).to_le_bytes())
        }
    }
}

fn write_patch<P: Platform>(kernel: &mut Kernel<P>, addr: u32, bytes: &[u8]) -> Result<()> {
    kernel.with_user_arena(|arena| -> Result<()> {
        let dst = arena
            .bytes_mut(addr, bytes.len())
            .ok_or(ErrorCode::Corrupt)?;
        dst.copy_from_slice(bytes);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{format, RamDisk};
    use crate::kernel::{KernelConfig, NullPlatform};
    use crate::write::TaskBuilder;
    use crate::endian::{U16, U32};

    fn fixture() -> (Kernel<NullPlatform>, Volume<RamDisk>) {
        let mut disk = RamDisk::new(4096);
        format(&mut disk, "TEST").unwrap();
        let vol = Volume::mount(disk).unwrap();
        (Kernel::new(KernelConfig::default(), NullPlatform::new()), vol)
    }

    fn minimal_image() -> TaskBuilder {
        TaskBuilder {
            name: "mini".into(),
            text: vec![0x2A, 0x20, 0x70, 0x47], // MOVS r0, #42; BX LR
            ..TaskBuilder::default()
        }
    }

    #[test]
    fn loads_a_minimal_image() {
        let (mut k, mut vol) = fixture();
        let mut file = Vec::new();
        minimal_image().write_to(&mut file);
        vol.write_file("mini.mimi", &file).unwrap();

        let id = load_and_start(&mut k, &mut vol, "mini.mimi", 5).unwrap();
        let task = k.task(id).unwrap();
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.priority, 5);
        assert_eq!(task.name_str(), b"mini");
        assert_eq!(task.entry, task.base);
        assert_eq!(task.saved.sp, task.base + task.layout.stack_top);
        // Defaults applied, total aligned.
        assert_eq!(task.layout.heap_size, mimi::DEFAULT_HEAP_SIZE);
        assert_eq!(task.layout.stack_size, mimi::DEFAULT_STACK_SIZE);
        assert_eq!(task.layout.total_size % 32, 0);

        // The text bytes are in place at the block base.
        let text = k.with_user_arena(|arena| arena.bytes(task.base, 4).map(<[u8]>::to_vec));
        assert_eq!(text.unwrap(), vec![0x2A, 0x20, 0x70, 0x47]);
    }

    #[test]
    fn rejects_bad_magic_and_entry() {
        let (mut k, mut vol) = fixture();
        let mut image = minimal_image();
        image.entry_offset = 4; // == text_size
        let mut file = Vec::new();
        image.write_to(&mut file);
        vol.write_file("bad.mimi", &file).unwrap();
        assert_eq!(
            load_and_start(&mut k, &mut vol, "bad.mimi", 5).err(),
            Some(ErrorCode::Noexec)
        );
        // The failed load leaves no task behind.
        assert_eq!(k.task_count(), 1);

        let mut file = Vec::new();
        minimal_image().write_to(&mut file);
        file[0] = 0xFF;
        vol.write_file("bad2.mimi", &file).unwrap();
        assert_eq!(
            load_and_start(&mut k, &mut vol, "bad2.mimi", 5).err(),
            Some(ErrorCode::Noexec)
        );
    }

    #[test]
    fn bss_is_zeroed_over_recycled_memory() {
        let (mut k, mut vol) = fixture();
        // Dirty the arena, then free it back.
        let scratch = k.user_alloc(7, 4096).unwrap();
        k.with_user_arena(|arena| {
            arena.bytes_mut(scratch, 4096).unwrap().fill(0xAA);
            arena.free_all(7);
            arena.coalesce();
        });

        let mut image = minimal_image();
        image.bss_size = 64;
        let mut file = Vec::new();
        image.write_to(&mut file);
        vol.write_file("z.mimi", &file).unwrap();

        let id = load_and_start(&mut k, &mut vol, "z.mimi", 3).unwrap();
        let task = k.task(id).unwrap();
        let bss_addr = task.base + task.layout.bss_start;
        let bss = k
            .with_user_arena(|arena| arena.bytes(bss_addr, 64).map(<[u8]>::to_vec))
            .unwrap();
        assert!(bss.iter().all(|&b| b == 0));
    }

    #[test]
    fn bl_patch_matches_spec_vector() {
        let (mut k, mut vol) = fixture();
        // Symbol at text offset 0x200, call site at 0x100.
        let mut image = TaskBuilder {
            name: "bl".into(),
            text: vec![0; 0x204],
            ..TaskBuilder::default()
        };
        image.text[0x200] = 0x70; // BX LR at the target
        image.text[0x201] = 0x47;
        image.symbols.push(mimi::Symbol {
            name: mimi::name_bytes("target"),
            value: U32::new(0x200),
            section: mimi::SEC_TEXT,
            kind: mimi::SYM_GLOBAL,
            pad: [0; 2],
        });
        image.relocs.push(mimi::Reloc {
            offset: U32::new(0x100),
            section: U16::new(mimi::SEC_TEXT as u16),
            kind: mimi::RELOC_THUMB_CALL,
            pad: 0,
            symbol_idx: U32::new(0),
        });
        let mut file = Vec::new();
        image.write_to(&mut file);
        vol.write_file("bl.mimi", &file).unwrap();

        let id = load_and_start(&mut k, &mut vol, "bl.mimi", 4).unwrap();
        let task = k.task(id).unwrap();
        let at = task.base + 0x100;
        let patched = k
            .with_user_arena(|arena| arena.bytes(at, 4).map(<[u8]>::to_vec))
            .unwrap();
        let hi = u16::from_le_bytes([patched[0], patched[1]]);
        let lo = u16::from_le_bytes([patched[2], patched[3]]);
        assert_eq!(hi, 0xF000);
        assert_eq!(lo, 0xF87E);
    }

    #[test]
    fn syscall_extern_call_rewrites_to_svc() {
        let (mut k, mut vol) = fixture();
        let mut image = TaskBuilder {
            name: "svc".into(),
            text: vec![0; 8],
            ..TaskBuilder::default()
        };
        image.symbols.push(mimi::Symbol {
            name: mimi::name_bytes("sleep_ms"),
            value: U32::new(0),
            section: mimi::SEC_NULL,
            kind: mimi::SYM_EXTERN,
            pad: [0; 2],
        });
        image.relocs.push(mimi::Reloc {
            offset: U32::new(0),
            section: U16::new(mimi::SEC_TEXT as u16),
            kind: mimi::RELOC_THUMB_CALL,
            pad: 0,
            symbol_idx: U32::new(0),
        });
        let mut file = Vec::new();
        image.write_to(&mut file);
        vol.write_file("svc.mimi", &file).unwrap();

        let id = load_and_start(&mut k, &mut vol, "svc.mimi", 4).unwrap();
        let task = k.task(id).unwrap();
        let patched = k
            .with_user_arena(|arena| arena.bytes(task.base, 4).map(<[u8]>::to_vec))
            .unwrap();
        let first = u16::from_le_bytes([patched[0], patched[1]]);
        let second = u16::from_le_bytes([patched[2], patched[3]]);
        assert_eq!(first, thumb::mov_imm(thumb::R7, 2));
        assert_eq!(second, thumb::svc(0));
    }

    #[test]
    fn no_reloc_image_never_touches_symbols() {
        let (mut k, mut vol) = fixture();
        // reloc_count == 0 and no symbol table at all.
        let mut file = Vec::new();
        minimal_image().write_to(&mut file);
        vol.write_file("n.mimi", &file).unwrap();
        assert!(load_and_start(&mut k, &mut vol, "n.mimi", 6).is_ok());
    }
}
