//! End-to-end scenarios: compile C source on a RAM-backed volume, link,
//! load into a kernel, and schedule.

use mimic::cc;
use mimic::cc::thumb;
use mimic::common::ErrorCode;
use mimic::fs::{format, RamDisk, Volume};
use mimic::kernel::{
    load_and_start, syscall::nr, Kernel, KernelConfig, NullPlatform, TaskState,
};
use mimic::mimi;
use mimic::read::TaskFile;

fn boot() -> (Volume<RamDisk>, Kernel<NullPlatform>) {
    let mut disk = RamDisk::new(16 * 1024);
    format(&mut disk, "MIMIC").unwrap();
    let vol = Volume::mount(disk).unwrap();
    let kernel = Kernel::new(KernelConfig::default(), NullPlatform::new());
    (vol, kernel)
}

fn halfwords(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[test]
fn return_42_compiles_loads_and_runs() {
    let (mut vol, mut kernel) = boot();
    vol.write_file("main.c", b"int main() { return 42; }\n").unwrap();
    cc::compile(&mut vol, "main.c", "main.mimi").unwrap();

    let raw = vol.read_file("main.mimi").unwrap();
    let image = TaskFile::parse(&raw).unwrap();
    // Prologue, the constant load, a branch to the epilogue, and the
    // epilogue itself.
    assert!(image.header().text_size.get() >= 8);
    assert_eq!(image.entry_offset(), 0);
    assert!(image.relocs().is_empty());

    // One GLOBAL symbol: main at text offset 0.
    let symbols = image.symbols();
    assert_eq!(symbols.len(), 1);
    assert_eq!(mimi::name_str(&symbols[0].name), b"main");
    assert_eq!(symbols[0].kind, mimi::SYM_GLOBAL);
    assert_eq!(symbols[0].value.get(), 0);

    let code = halfwords(image.section(mimic::common::SectionId::Text));
    assert_eq!(code[0], 0xB5F0); // PUSH {r4-r7, lr}
    assert!(code.contains(&0x202A)); // MOVS r0, #42
    assert!(code.contains(&0xBDF0)); // POP {r4-r7, pc}

    let task = load_and_start(&mut kernel, &mut vol, "main.mimi", 5).unwrap();
    assert_eq!(kernel.tick(), Some(task));
    assert_eq!(kernel.task(task).unwrap().state, TaskState::Running);
}

#[test]
fn led_blink_lowers_to_svc_with_no_relocations() {
    let (mut vol, _) = boot();
    let source = b"int main() {\n\
                   gpio_init(25);\n\
                   gpio_set_dir(25, 1);\n\
                   gpio_put(25, 1);\n\
                   sleep_ms(500);\n\
                   gpio_put(25, 0);\n\
                   sleep_ms(500);\n\
                   return 0;\n\
                   }\n";
    vol.write_file("blink.c", source).unwrap();
    cc::compile(&mut vol, "blink.c", "blink.mimi").unwrap();

    let raw = vol.read_file("blink.mimi").unwrap();
    let image = TaskFile::parse(&raw).unwrap();
    assert_eq!(image.relocs().len(), 0);
    assert_eq!(image.name(), b"blink");

    let code = halfwords(image.section(mimic::common::SectionId::Text));
    let svc = thumb::svc(0);
    for number in [40u8, 41, 42, 2] {
        assert!(
            code.windows(2)
                .any(|w| w == [thumb::mov_imm(7, number), svc]),
            "missing MOV r7, #{}; SVC #0",
            number
        );
    }
}

#[test]
fn cross_function_call_is_patched_at_load() {
    let (mut vol, mut kernel) = boot();
    let source = b"int add(int a, int b) { return a + b; }\n\
                   int main() { return add(40, 2); }\n";
    vol.write_file("call.c", source).unwrap();
    cc::compile(&mut vol, "call.c", "call.mimi").unwrap();

    let raw = vol.read_file("call.mimi").unwrap();
    let image = TaskFile::parse(&raw).unwrap();
    assert_eq!(image.relocs().len(), 1);
    let reloc = &image.relocs()[0];
    let target = image.symbol(reloc.symbol_idx.get()).unwrap();
    assert_eq!(mimi::name_str(&target.name), b"add");

    let task = load_and_start(&mut kernel, &mut vol, "call.mimi", 5).unwrap();
    let base = kernel.task(task).unwrap().base;

    // Decode the patched BL and check it lands on `add`.
    let call_addr = base + reloc.offset.get();
    let patched = kernel
        .with_user_arena(|arena| arena.bytes(call_addr, 4).map(<[u8]>::to_vec))
        .unwrap();
    let hi = u16::from_le_bytes([patched[0], patched[1]]);
    let lo = u16::from_le_bytes([patched[2], patched[3]]);
    let offset = thumb::bl_offset(hi, lo);
    let dest = (call_addr as i64 + 4 + offset as i64) as u32;
    assert_eq!(dest, base + target.value.get());
}

#[test]
fn task_heap_is_mass_freed_on_exit() {
    let (mut vol, mut kernel) = boot();
    vol.write_file("main.c", b"int main() { return 0; }\n").unwrap();
    cc::compile(&mut vol, "main.c", "main.mimi").unwrap();

    let before = kernel.with_user_arena(|arena| arena.free_bytes());

    let task = load_and_start(&mut kernel, &mut vol, "main.mimi", 2).unwrap();
    kernel.tick();
    assert_eq!(kernel.current(), task);

    // The task leaks ten 1 KB allocations, then exits.
    for _ in 0..10 {
        let addr = kernel.dispatch(&mut vol, nr::MALLOC, [1024, 0, 0, 0]);
        assert!(addr > 0);
    }
    assert!(kernel.with_user_arena(|arena| arena.free_bytes()) < before);
    kernel.dispatch(&mut vol, nr::EXIT, [0, 0, 0, 0]);

    assert_eq!(kernel.with_user_arena(|arena| arena.free_bytes()), before);
    assert_eq!(kernel.current(), 0);
}

#[test]
fn lower_priority_number_runs_first() {
    let (mut vol, mut kernel) = boot();
    vol.write_file("main.c", b"int main() { return 0; }\n").unwrap();
    cc::compile(&mut vol, "main.c", "main.mimi").unwrap();

    let a = load_and_start(&mut kernel, &mut vol, "main.mimi", 2).unwrap();
    let b = load_and_start(&mut kernel, &mut vol, "main.mimi", 5).unwrap();

    assert_eq!(kernel.tick(), Some(a));
    // While A is READY or RUNNING, B never runs.
    for _ in 0..5 {
        kernel.tick();
        assert_eq!(kernel.current(), a);
    }

    // A sleeps; B gets the processor. A's wake preempts B again.
    kernel.sleep(100);
    assert_eq!(kernel.current(), b);
    kernel.platform.advance(100);
    assert_eq!(kernel.tick(), Some(a));
}

#[test]
fn a_larger_program_compiles_and_loads() {
    let (mut vol, mut kernel) = boot();
    let source = b"int total = 0;\n\
                   int table[8];\n\
                   \n\
                   int square(int n) { return n * n; }\n\
                   \n\
                   int main() {\n\
                   int i;\n\
                   for (i = 0; i < 8; i++) {\n\
                   table[i] = square(i);\n\
                   total += table[i];\n\
                   }\n\
                   if (total > 100) {\n\
                   puts(\"big\");\n\
                   } else {\n\
                   puts(\"small\");\n\
                   }\n\
                   while (total > 0) { total = total - 7; }\n\
                   return total;\n\
                   }\n";
    vol.write_file("prog.c", source).unwrap();
    let stats = cc::compile(&mut vol, "prog.c", "prog.mimi").unwrap();
    assert!(stats.lex.tokens > 50);
    assert!(stats.codegen.text_bytes > 0);

    let raw = vol.read_file("prog.mimi").unwrap();
    let image = TaskFile::parse(&raw).unwrap();
    // `table` is zero-filled and ends up as bss, not file bytes.
    assert!(image.header().bss_size.get() >= 32);

    let task = load_and_start(&mut kernel, &mut vol, "prog.mimi", 4).unwrap();
    assert_eq!(kernel.task(task).unwrap().state, TaskState::Ready);
}

#[test]
fn intermediate_files_are_left_on_the_volume() {
    let (mut vol, _) = boot();
    vol.write_file("main.c", b"int main() { return 1; }\n").unwrap();
    cc::compile(&mut vol, "main.c", "main.mimi").unwrap();
    let names: Vec<String> = vol
        .read_dir("/")
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    // `.mimi` truncates to the 8.3 extension `MIM`.
    for name in ["MAIN.C", "MAIN.TOK", "MAIN.AST", "MAIN.O", "MAIN.MIM"] {
        assert!(names.iter().any(|n| n == name), "missing {}", name);
    }
}

#[test]
fn compile_errors_fail_the_build() {
    let (mut vol, _) = boot();
    vol.write_file("bad.c", b"int main() { return 42 }\n").unwrap();
    assert_eq!(
        cc::compile(&mut vol, "bad.c", "bad.mimi").err(),
        Some(ErrorCode::Corrupt)
    );
}
