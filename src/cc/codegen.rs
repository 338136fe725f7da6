//! Pass 4: AST file to object file.
//!
//! The generator walks the serialized AST by file offset, emitting Thumb
//! halfwords into the object's text buffer. Expressions evaluate into
//! `r0`, with the left operand of a binary operation pushed across the
//! evaluation of the right and popped into `r1` — more code bytes than a
//! real register allocator would produce, in exchange for a tiny and
//! predictable compiler.
//!
//! Forward branches are placeholders: a labels table and a branch queue
//! are patched once the function is complete. Large constants and the
//! addresses of globals and string literals load from a per-function
//! literal pool placed after the epilogue; pool words holding addresses
//! carry `ABS32` relocations. Calls emit a `BL` placeholder and a
//! `THUMB_CALL` relocation, except calls to names in the kernel syscall
//! table, which lower directly to `MOV r7, #n; SVC #0` with no
//! relocation.

use indexmap::IndexMap;
use log::debug;

use crate::cc::ast::{AstFile, Node, NodeFlags, NodeKind};
use crate::cc::thumb::{self, Alu, Cond};
use crate::cc::token::TokKind;
use crate::cc::Diagnostics;
use crate::common::{RelocKind, Result, SectionId, SymbolKind};
use crate::fs::{BlockDevice, Volume};
use crate::kernel::syscall;
use crate::write::ObjBuilder;

/// Counters reported by the code generator.
#[derive(Debug, Default, Clone)]
pub struct CodegenStats {
    pub functions: u32,
    pub text_bytes: u32,
    pub data_bytes: u32,
    pub relocs: u32,
    pub symbols: u32,
}

/// Largest frame addressable through `LDR Rd, [SP, #imm8*4]`.
const MAX_FRAME: u32 = 255 * 4;

#[derive(Debug, Clone, Copy)]
enum BranchKind {
    B,
    Cond(Cond),
}

#[derive(Debug, Clone, Copy)]
struct Branch {
    at: u32,
    label: usize,
    kind: BranchKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PoolValue {
    Const(u32),
    /// Symbol index; the pool word gets an `ABS32` relocation.
    Symbol(u32),
}

#[derive(Debug, Clone, Copy)]
struct LocalVar {
    name: u32,
    offset: u32,
    array: bool,
}

#[derive(Debug, Clone, Copy)]
struct GlobalVar {
    symbol: u32,
    array: bool,
}

/// A global whose data is emitted after all functions, so initialized
/// words precede the zero tail the linker hoists into bss.
#[derive(Debug, Clone, Copy)]
struct PendingGlobal {
    symbol: u32,
    kind: SymbolKind,
    words: u32,
    /// AST offset of the initializer expression, if any.
    init: u32,
}

/// Where an lvalue lives.
enum Place {
    /// A scalar local at a frame offset.
    Local(u32),
    /// The address is in `r0`.
    Addr,
}

struct CodeGen<'d> {
    obj: ObjBuilder,
    diag: &'d mut Diagnostics,
    /// Global variables: name offset -> symbol and shape.
    globals: IndexMap<u32, GlobalVar>,
    pending_globals: Vec<PendingGlobal>,
    /// Functions: name offset -> symbol index.
    funcs: IndexMap<u32, u32>,
    /// String literals: payload -> symbol index.
    strings: IndexMap<Vec<u8>, u32>,
    functions: u32,

    // Per-function state.
    fn_name: String,
    labels: Vec<Option<u32>>,
    branches: Vec<Branch>,
    pool: Vec<PoolValue>,
    pool_sites: Vec<(u32, u8, usize)>,
    locals: Vec<LocalVar>,
    scopes: Vec<usize>,
    frame_size: u32,
    frame_used: u32,
    epilogue: usize,
    break_labels: Vec<usize>,
    continue_labels: Vec<usize>,
    named_labels: IndexMap<u32, usize>,
}

/// Run the code generator over `ast_path`, writing `obj_path`.
pub fn codegen<D: BlockDevice>(
    vol: &mut Volume<D>,
    ast_path: &str,
    obj_path: &str,
    diag: &mut Diagnostics,
) -> Result<CodegenStats> {
    let mut ast = AstFile::open(vol, ast_path)?;
    let mut gen = CodeGen {
        obj: ObjBuilder::new(),
        diag,
        globals: IndexMap::new(),
        pending_globals: Vec::new(),
        funcs: IndexMap::new(),
        strings: IndexMap::new(),
        functions: 0,
        fn_name: String::new(),
        labels: Vec::new(),
        branches: Vec::new(),
        pool: Vec::new(),
        pool_sites: Vec::new(),
        locals: Vec::new(),
        scopes: Vec::new(),
        frame_size: 0,
        frame_used: 0,
        epilogue: 0,
        break_labels: Vec::new(),
        continue_labels: Vec::new(),
        named_labels: IndexMap::new(),
    };

    let root = ast.node(vol, ast.root_offset())?;
    let items = ast.children_of(vol, &root)?;
    for offset in items {
        let node = ast.node(vol, offset)?;
        match node.kind {
            NodeKind::FuncDef => gen.function(vol, &mut ast, &node)?,
            NodeKind::VarDecl => gen.global(vol, &mut ast, &node)?,
            NodeKind::RecordDecl | NodeKind::EnumDecl => {}
            _ => gen.diag.error(0, "unexpected node at file scope")?,
        }
    }
    gen.emit_globals(vol, &mut ast)?;

    let stats = CodegenStats {
        functions: gen.functions,
        text_bytes: gen.obj.text.len() as u32,
        data_bytes: gen.obj.data.len() as u32,
        relocs: gen.obj.relocs().len() as u32,
        symbols: gen.obj.symbols().len() as u32,
    };

    let mut file = Vec::new();
    gen.obj.write_to(&mut file);
    vol.write_file(obj_path, &file)?;
    debug!(
        "codegen: {} functions, {} text, {} data",
        stats.functions, stats.text_bytes, stats.data_bytes
    );
    Ok(stats)
}

impl<'d> CodeGen<'d> {
    // ---- emission ----

    fn text_offset(&self) -> u32 {
        self.obj.text.len() as u32
    }

    fn emit16(&mut self, halfword: u16) {
        self.obj.text.extend_from_slice(&halfword.to_le_bytes());
    }

    fn emit_pair(&mut self, pair: (u16, u16)) {
        self.emit16(pair.0);
        self.emit16(pair.1);
    }

    fn patch16(&mut self, at: u32, halfword: u16) {
        let at = at as usize;
        self.obj.text[at..at + 2].copy_from_slice(&halfword.to_le_bytes());
    }

    fn err(&mut self, msg: impl Into<String>) -> Result<()> {
        let msg = format!("{}: {}", self.fn_name, msg.into());
        self.diag.error(0, msg)
    }

    // ---- labels and branches ----

    fn new_label(&mut self) -> usize {
        self.labels.push(None);
        self.labels.len() - 1
    }

    fn bind(&mut self, label: usize) {
        self.labels[label] = Some(self.text_offset());
    }

    /// Unconditional branch to a label; placeholder until fix-up.
    fn branch(&mut self, label: usize) {
        self.branches.push(Branch {
            at: self.text_offset(),
            label,
            kind: BranchKind::B,
        });
        self.emit16(0);
    }

    /// Branch to `label` when `cond` holds. Emitted as an inverted-
    /// condition skip over a wide `B`, so the label can be anywhere in
    /// the function.
    fn branch_if(&mut self, cond: Cond, label: usize) {
        self.emit16(thumb::bcc(cond.invert(), 0));
        self.branch(label);
    }

    /// Compare `r0` against zero and branch if it is zero.
    fn branch_if_zero(&mut self, label: usize) {
        self.emit16(thumb::cmp_imm(thumb::R0, 0));
        self.branch_if(Cond::Eq, label);
    }

    fn fixup_branches(&mut self) -> Result<()> {
        let branches = core::mem::take(&mut self.branches);
        for branch in branches {
            let target = match self.labels[branch.label] {
                Some(target) => target,
                None => {
                    self.err("branch to unbound label")?;
                    continue;
                }
            };
            let offset = target as i32 - (branch.at as i32 + 4);
            match branch.kind {
                BranchKind::B => {
                    if !thumb::b_in_range(offset) {
                        self.err("branch out of range")?;
                        continue;
                    }
                    self.patch16(branch.at, thumb::b(offset));
                }
                BranchKind::Cond(cond) => {
                    if !thumb::bcc_in_range(offset) {
                        self.err("conditional branch out of range")?;
                        continue;
                    }
                    self.patch16(branch.at, thumb::bcc(cond, offset));
                }
            }
        }
        Ok(())
    }

    // ---- literal pool ----

    /// Load a pool value into `rd`; the `LDR` literal offset is patched
    /// when the pool is flushed after the epilogue.
    fn pool_load(&mut self, rd: u8, value: PoolValue) {
        let index = match self.pool.iter().position(|v| *v == value) {
            Some(index) => index,
            None => {
                self.pool.push(value);
                self.pool.len() - 1
            }
        };
        self.pool_sites.push((self.text_offset(), rd, index));
        self.emit16(thumb::ldr_pc(rd, 0));
    }

    fn flush_pool(&mut self) -> Result<()> {
        if self.pool.is_empty() {
            return Ok(());
        }
        if self.text_offset() % 4 != 0 {
            self.emit16(thumb::nop());
        }
        let base = self.text_offset();
        let pool = core::mem::take(&mut self.pool);
        for value in &pool {
            match value {
                PoolValue::Const(value) => {
                    self.obj.text.extend_from_slice(&value.to_le_bytes());
                }
                PoolValue::Symbol(symbol) => {
                    let at = self.text_offset();
                    self.obj
                        .add_reloc(at, SectionId::Text, RelocKind::Abs32, *symbol);
                    self.obj.text.extend_from_slice(&0u32.to_le_bytes());
                }
            }
        }
        let sites = core::mem::take(&mut self.pool_sites);
        for (site, rd, index) in sites {
            let word = base + index as u32 * 4;
            // The literal base is the load's PC rounded down to a word.
            let pc = (site + 4) & !3;
            let offset = word as i32 - pc as i32;
            if !(0..=1020).contains(&offset) || offset % 4 != 0 {
                self.err("literal pool out of range")?;
                continue;
            }
            self.patch16(site, thumb::ldr_pc(rd, (offset / 4) as u8));
        }
        Ok(())
    }

    /// Load a constant into `rd`, from an immediate when it fits.
    fn load_const(&mut self, rd: u8, value: u32) {
        if value <= 0xFF {
            self.emit16(thumb::mov_imm(rd, value as u8));
        } else {
            self.pool_load(rd, PoolValue::Const(value));
        }
    }

    // ---- symbols ----

    fn string_symbol<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        offset: u32,
    ) -> Result<u32> {
        let payload = ast.string(vol, offset)?;
        if let Some(&symbol) = self.strings.get(&payload) {
            return Ok(symbol);
        }
        let name = format!("$str{}", self.strings.len());
        let at = self.obj.data.len() as u32;
        self.obj.data.extend_from_slice(&payload);
        self.obj.data.push(0);
        while self.obj.data.len() % 4 != 0 {
            self.obj.data.push(0);
        }
        let symbol = self
            .obj
            .add_symbol(&name, at, SectionId::Data, SymbolKind::Local);
        self.strings.insert(payload, symbol);
        Ok(symbol)
    }

    /// The symbol index for a called or referenced function, adding an
    /// extern record on first sight.
    fn func_symbol<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        name: u32,
    ) -> Result<u32> {
        if let Some(&symbol) = self.funcs.get(&name) {
            return Ok(symbol);
        }
        let text = ast.string(vol, name)?;
        let text = String::from_utf8_lossy(&text).into_owned();
        let symbol = self
            .obj
            .add_symbol(&text, 0, SectionId::Null, SymbolKind::Extern);
        self.funcs.insert(name, symbol);
        Ok(symbol)
    }

    // ---- locals ----

    fn push_scope(&mut self) {
        self.scopes.push(self.locals.len());
    }

    fn pop_scope(&mut self) {
        if let Some(mark) = self.scopes.pop() {
            self.locals.truncate(mark);
        }
    }

    fn lookup_local(&self, name: u32) -> Option<LocalVar> {
        self.locals.iter().rev().find(|v| v.name == name).copied()
    }

    fn add_local(&mut self, name: u32, words: u32, array: bool) -> Result<u32> {
        let offset = self.frame_used;
        self.frame_used += words * 4;
        if self.frame_used > self.frame_size {
            // The pre-scan bounds the frame; running past it is a
            // generator bug surfaced as a diagnostic rather than a panic.
            self.err("frame accounting mismatch")?;
        }
        self.locals.push(LocalVar {
            name,
            offset,
            array,
        });
        Ok(offset)
    }

    // ---- frame pre-scan ----

    /// Total bytes of locals declared anywhere in a statement tree.
    fn scan_frame<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        offset: u32,
    ) -> Result<u32> {
        if offset == 0 {
            return Ok(0);
        }
        let node = ast.node(vol, offset)?;
        let mut bytes = 0;
        match node.kind {
            NodeKind::VarDecl => {
                bytes += self.decl_size(vol, ast, &node)? * 4;
            }
            NodeKind::Block => {
                for child in ast.children_of(vol, &node)? {
                    bytes += self.scan_frame(vol, ast, child)?;
                }
            }
            NodeKind::If
            | NodeKind::While
            | NodeKind::DoWhile
            | NodeKind::For
            | NodeKind::Switch
            | NodeKind::Case
            | NodeKind::Default
            | NodeKind::Label => {
                for child in node.children {
                    bytes += self.scan_frame(vol, ast, child)?;
                }
            }
            _ => {}
        }
        Ok(bytes)
    }

    /// Size of a local declaration in words.
    fn decl_size<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        node: &Node,
    ) -> Result<u32> {
        if node.flags.contains(NodeFlags::ARRAY) {
            let size = ast.node(vol, node.children[0])?;
            if size.data == 0 {
                self.err("array size required")?;
                return Ok(1);
            }
            Ok(size.data)
        } else {
            Ok(1)
        }
    }

    // ---- functions ----

    fn function<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        node: &Node,
    ) -> Result<()> {
        let name_bytes = ast.string(vol, node.data)?;
        self.fn_name = String::from_utf8_lossy(&name_bytes).into_owned();

        // Reset per-function state.
        self.labels.clear();
        self.branches.clear();
        self.pool.clear();
        self.pool_sites.clear();
        self.locals.clear();
        self.scopes.clear();
        self.named_labels.clear();
        self.frame_used = 0;
        self.epilogue = self.new_label();

        let entry = self.text_offset();
        let kind = if node.flags.contains(NodeFlags::STATIC) {
            SymbolKind::Local
        } else {
            SymbolKind::Global
        };
        match self.funcs.get(&node.data).copied() {
            Some(symbol) => {
                self.obj.define_symbol(symbol, entry, SectionId::Text, kind);
            }
            None => {
                let name = self.fn_name.clone();
                let symbol = self.obj.add_symbol(&name, entry, SectionId::Text, kind);
                self.funcs.insert(node.data, symbol);
            }
        }

        let param_list = ast.node(vol, node.children[0])?;
        let params = ast.children_of(vol, &param_list)?;
        let body_offset = node.children[1];

        let frame = params.len() as u32 * 4 + self.scan_frame(vol, ast, body_offset)?;
        self.frame_size = (frame + 3) & !3;
        if self.frame_size > MAX_FRAME {
            self.err("stack frame too large")?;
            self.frame_size = MAX_FRAME;
        }

        // Prologue.
        self.emit16(thumb::push(0xF0, true)); // PUSH {r4-r7, lr}
        let mut remaining = self.frame_size;
        while remaining > 0 {
            let chunk = remaining.min(127 * 4);
            self.emit16(thumb::sub_sp((chunk / 4) as u8));
            remaining -= chunk;
        }

        // Bind parameters to frame slots. The first four arrive in
        // r0-r3; the rest were pushed by the caller and sit above the
        // saved registers.
        self.push_scope();
        for (index, &param) in params.iter().enumerate() {
            let decl = ast.node(vol, param)?;
            let offset = self.add_local(decl.data, 1, false)?;
            if index < 4 {
                self.emit16(thumb::str_sp(index as u8, (offset / 4) as u8));
            } else {
                let src = self.frame_size + 20 + (index as u32 - 4) * 4;
                if src > MAX_FRAME {
                    self.err("parameter beyond addressable frame")?;
                    continue;
                }
                self.emit16(thumb::ldr_sp(thumb::R0, (src / 4) as u8));
                self.emit16(thumb::str_sp(thumb::R0, (offset / 4) as u8));
            }
        }

        self.statement(vol, ast, body_offset)?;
        self.pop_scope();

        // Epilogue; falling off the end returns zero.
        self.bind(self.epilogue);
        let mut remaining = self.frame_size;
        while remaining > 0 {
            let chunk = remaining.min(127 * 4);
            self.emit16(thumb::add_sp((chunk / 4) as u8));
            remaining -= chunk;
        }
        self.emit16(thumb::pop(0xF0, true)); // POP {r4-r7, pc}

        self.flush_pool()?;
        self.fixup_branches()?;
        self.functions += 1;
        Ok(())
    }

    // ---- globals ----

    /// Fold the constant initializers the data section accepts.
    fn const_eval<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        offset: u32,
    ) -> Result<Option<u32>> {
        let node = ast.node(vol, offset)?;
        match node.kind {
            NodeKind::IntLit | NodeKind::CharLit => Ok(Some(node.data)),
            NodeKind::Unary if node.data == TokKind::Minus as u32 => {
                match self.const_eval(vol, ast, node.children[0])? {
                    Some(value) => Ok(Some((value as i32).wrapping_neg() as u32)),
                    None => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    /// Register a file-scope variable. Its data is emitted after every
    /// function, so zero-filled globals form the tail the linker hoists
    /// into bss.
    fn global<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        node: &Node,
    ) -> Result<()> {
        let name_bytes = ast.string(vol, node.data)?;
        let name = String::from_utf8_lossy(&name_bytes).into_owned();
        let array = node.flags.contains(NodeFlags::ARRAY);

        if node.flags.contains(NodeFlags::EXTERN) {
            if !self.globals.contains_key(&node.data) {
                let symbol = self
                    .obj
                    .add_symbol(&name, 0, SectionId::Null, SymbolKind::Extern);
                self.globals.insert(node.data, GlobalVar { symbol, array });
            }
            return Ok(());
        }

        let words = self.decl_size(vol, ast, node)?;
        let init = if node.flags.contains(NodeFlags::HAS_INIT) {
            node.children.last().copied().unwrap_or(0)
        } else {
            0
        };
        let kind = if node.flags.contains(NodeFlags::STATIC) {
            SymbolKind::Local
        } else {
            SymbolKind::Global
        };
        // A definition may follow an earlier `extern` declaration.
        let symbol = match self.globals.get(&node.data) {
            Some(&var) => var.symbol,
            None => self
                .obj
                .add_symbol(&name, 0, SectionId::Data, SymbolKind::Global),
        };
        self.globals.insert(node.data, GlobalVar { symbol, array });
        self.pending_globals.push(PendingGlobal {
            symbol,
            kind,
            words,
            init,
        });
        Ok(())
    }

    /// Lay registered globals out in the data section and fix up their
    /// symbols.
    fn emit_globals<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
    ) -> Result<()> {
        let pending = core::mem::take(&mut self.pending_globals);
        for global in pending {
            let mut pointer_to = None;
            let mut value = 0;
            if global.init != 0 {
                let init_node = ast.node(vol, global.init)?;
                if init_node.kind == NodeKind::StrLit {
                    pointer_to = Some(self.string_symbol(vol, ast, init_node.data)?);
                } else {
                    match self.const_eval(vol, ast, global.init)? {
                        Some(folded) => value = folded,
                        None => self.err("global initializer must be a constant")?,
                    }
                }
            }

            while self.obj.data.len() % 4 != 0 {
                self.obj.data.push(0);
            }
            let at = self.obj.data.len() as u32;
            self.obj
                .define_symbol(global.symbol, at, SectionId::Data, global.kind);
            if let Some(target) = pointer_to {
                self.obj
                    .add_reloc(at, SectionId::Data, RelocKind::DataPtr, target);
                self.obj.data.extend_from_slice(&0u32.to_le_bytes());
            } else {
                self.obj.data.extend_from_slice(&value.to_le_bytes());
            }
            for _ in 1..global.words {
                self.obj.data.extend_from_slice(&0u32.to_le_bytes());
            }
        }
        Ok(())
    }

    // ---- statements ----

    fn statement<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        offset: u32,
    ) -> Result<()> {
        let node = ast.node(vol, offset)?;
        match node.kind {
            NodeKind::Block => {
                self.push_scope();
                for child in ast.children_of(vol, &node)? {
                    let kind = ast.node(vol, child)?.kind;
                    if kind == NodeKind::VarDecl {
                        self.local_decl(vol, ast, child)?;
                    } else {
                        self.statement(vol, ast, child)?;
                    }
                }
                self.pop_scope();
            }
            NodeKind::VarDecl => self.local_decl(vol, ast, offset)?,
            NodeKind::If => {
                let end = self.new_label();
                self.expression(vol, ast, node.children[0])?;
                if node.children.len() == 3 {
                    let otherwise = self.new_label();
                    self.branch_if_zero(otherwise);
                    self.statement(vol, ast, node.children[1])?;
                    self.branch(end);
                    self.bind(otherwise);
                    self.statement(vol, ast, node.children[2])?;
                } else {
                    self.branch_if_zero(end);
                    self.statement(vol, ast, node.children[1])?;
                }
                self.bind(end);
            }
            NodeKind::While => {
                let start = self.new_label();
                let end = self.new_label();
                self.bind(start);
                self.expression(vol, ast, node.children[0])?;
                self.branch_if_zero(end);
                self.break_labels.push(end);
                self.continue_labels.push(start);
                self.statement(vol, ast, node.children[1])?;
                self.break_labels.pop();
                self.continue_labels.pop();
                self.branch(start);
                self.bind(end);
            }
            NodeKind::DoWhile => {
                let start = self.new_label();
                let check = self.new_label();
                let end = self.new_label();
                self.bind(start);
                self.break_labels.push(end);
                self.continue_labels.push(check);
                self.statement(vol, ast, node.children[0])?;
                self.break_labels.pop();
                self.continue_labels.pop();
                self.bind(check);
                self.expression(vol, ast, node.children[1])?;
                self.emit16(thumb::cmp_imm(thumb::R0, 0));
                self.branch_if(Cond::Ne, start);
                self.bind(end);
            }
            NodeKind::For => {
                let check = self.new_label();
                let update = self.new_label();
                let end = self.new_label();
                if node.children[0] != 0 {
                    self.expression(vol, ast, node.children[0])?;
                }
                self.bind(check);
                if node.children[1] != 0 {
                    self.expression(vol, ast, node.children[1])?;
                    self.branch_if_zero(end);
                }
                self.break_labels.push(end);
                self.continue_labels.push(update);
                self.statement(vol, ast, node.children[3])?;
                self.break_labels.pop();
                self.continue_labels.pop();
                self.bind(update);
                if node.children[2] != 0 {
                    self.expression(vol, ast, node.children[2])?;
                }
                self.branch(check);
                self.bind(end);
            }
            NodeKind::Switch => {
                // Parsed but deliberately not lowered yet.
                self.err("switch lowering is not implemented")?;
            }
            NodeKind::Case | NodeKind::Default => {
                self.err("case label outside switch")?;
            }
            NodeKind::Return => {
                match node.children.first() {
                    Some(&value) => self.expression(vol, ast, value)?,
                    None => self.emit16(thumb::mov_imm(thumb::R0, 0)),
                }
                self.branch(self.epilogue);
            }
            NodeKind::Break => match self.break_labels.last() {
                Some(&label) => self.branch(label),
                None => self.err("break outside loop")?,
            },
            NodeKind::Continue => match self.continue_labels.last() {
                Some(&label) => self.branch(label),
                None => self.err("continue outside loop")?,
            },
            NodeKind::Goto => {
                let label = self.named_label(node.data);
                self.branch(label);
            }
            NodeKind::Label => {
                let label = self.named_label(node.data);
                self.bind(label);
                self.statement(vol, ast, node.children[0])?;
            }
            NodeKind::ExprStmt => {
                self.expression(vol, ast, node.children[0])?;
            }
            NodeKind::Empty | NodeKind::RecordDecl | NodeKind::EnumDecl => {}
            _ => {
                self.err("expression node in statement position")?;
            }
        }
        Ok(())
    }

    fn named_label(&mut self, name: u32) -> usize {
        if let Some(&label) = self.named_labels.get(&name) {
            return label;
        }
        let label = self.new_label();
        self.named_labels.insert(name, label);
        label
    }

    fn local_decl<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        offset: u32,
    ) -> Result<()> {
        let node = ast.node(vol, offset)?;
        if node.flags.contains(NodeFlags::STATIC) {
            self.diag
                .warning(0, "static local treated as automatic");
        }
        let words = self.decl_size(vol, ast, &node)?;
        let array = node.flags.contains(NodeFlags::ARRAY);
        let slot = self.add_local(node.data, words, array)?;
        if node.flags.contains(NodeFlags::HAS_INIT) {
            if let Some(&init) = node.children.last() {
                self.expression(vol, ast, init)?;
                self.emit16(thumb::str_sp(thumb::R0, (slot / 4) as u8));
            }
        }
        Ok(())
    }

    // ---- expressions ----

    fn push_r0(&mut self) {
        self.emit16(thumb::push(1 << thumb::R0, false));
    }

    fn pop_reg(&mut self, rd: u8) {
        self.emit16(thumb::pop(1 << rd, false));
    }

    /// `r0 = 1` when the comparison held, else `0`. Assumes flags are set.
    fn cond_set(&mut self, cond: Cond) {
        self.emit16(thumb::bcc(cond, 2));
        self.emit16(thumb::mov_imm(thumb::R0, 0));
        self.emit16(thumb::b(0));
        self.emit16(thumb::mov_imm(thumb::R0, 1));
    }

    /// `r0 = lhs op r0`, with the left operand in `lhs_reg`. `scratch`
    /// must differ from `lhs_reg`, `r0`, and `r1`.
    fn binop(&mut self, op: TokKind, lhs: u8, scratch: u8) -> Result<()> {
        use TokKind::*;
        match op {
            Plus | PlusAssign => self.emit16(thumb::add_reg(thumb::R0, lhs, thumb::R0)),
            Minus | MinusAssign => self.emit16(thumb::sub_reg(thumb::R0, lhs, thumb::R0)),
            Star | StarAssign => self.emit16(thumb::alu(Alu::Mul, thumb::R0, lhs)),
            Slash | SlashAssign => self.emit_pair(thumb::sdiv(thumb::R0, lhs, thumb::R0)),
            Percent | PercentAssign => {
                self.emit_pair(thumb::sdiv(scratch, lhs, thumb::R0));
                self.emit16(thumb::alu(Alu::Mul, scratch, thumb::R0));
                self.emit16(thumb::sub_reg(thumb::R0, lhs, scratch));
            }
            Amp | AmpAssign => self.emit16(thumb::alu(Alu::And, thumb::R0, lhs)),
            Pipe | PipeAssign => self.emit16(thumb::alu(Alu::Orr, thumb::R0, lhs)),
            Caret | CaretAssign => self.emit16(thumb::alu(Alu::Eor, thumb::R0, lhs)),
            Shl | ShlAssign => {
                self.emit16(thumb::mov_reg(scratch, thumb::R0));
                self.emit16(thumb::mov_reg(thumb::R0, lhs));
                self.emit16(thumb::alu(Alu::Lsl, thumb::R0, scratch));
            }
            Shr | ShrAssign => {
                // Arithmetic shift; everything is a signed word here.
                self.emit16(thumb::mov_reg(scratch, thumb::R0));
                self.emit16(thumb::mov_reg(thumb::R0, lhs));
                self.emit16(thumb::alu(Alu::Asr, thumb::R0, scratch));
            }
            EqEq => self.compare(lhs, Cond::Eq),
            Ne => self.compare(lhs, Cond::Ne),
            Lt => self.compare(lhs, Cond::Lt),
            Le => self.compare(lhs, Cond::Le),
            Gt => self.compare(lhs, Cond::Gt),
            Ge => self.compare(lhs, Cond::Ge),
            _ => self.err("unsupported binary operator")?,
        }
        Ok(())
    }

    fn compare(&mut self, lhs: u8, cond: Cond) {
        self.emit16(thumb::cmp_reg(lhs, thumb::R0));
        self.cond_set(cond);
    }

    fn expression<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        offset: u32,
    ) -> Result<()> {
        let node = ast.node(vol, offset)?;
        match node.kind {
            NodeKind::IntLit | NodeKind::CharLit => self.load_const(thumb::R0, node.data),
            NodeKind::StrLit => {
                let symbol = self.string_symbol(vol, ast, node.data)?;
                self.pool_load(thumb::R0, PoolValue::Symbol(symbol));
            }
            NodeKind::Ident => self.ident_value(vol, ast, &node)?,
            NodeKind::Unary => self.unary(vol, ast, &node)?,
            NodeKind::PostOp => self.post_op(vol, ast, &node)?,
            NodeKind::Binary => self.binary(vol, ast, &node)?,
            NodeKind::Assign => self.assign(vol, ast, &node)?,
            NodeKind::Ternary => {
                let otherwise = self.new_label();
                let end = self.new_label();
                self.expression(vol, ast, node.children[0])?;
                self.branch_if_zero(otherwise);
                self.expression(vol, ast, node.children[1])?;
                self.branch(end);
                self.bind(otherwise);
                self.expression(vol, ast, node.children[2])?;
                self.bind(end);
            }
            NodeKind::Call => self.call(vol, ast, &node)?,
            NodeKind::Index => {
                self.index_addr(vol, ast, &node)?;
                self.emit16(thumb::ldr_imm(thumb::R0, thumb::R0, 0));
            }
            NodeKind::Member => {
                self.err("struct member access requires field offsets")?;
            }
            _ => self.err("statement node in expression position")?,
        }
        Ok(())
    }

    fn ident_value<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        node: &Node,
    ) -> Result<()> {
        if let Some(var) = self.lookup_local(node.data) {
            if var.array {
                self.emit16(thumb::add_rd_sp(thumb::R0, (var.offset / 4) as u8));
            } else {
                self.emit16(thumb::ldr_sp(thumb::R0, (var.offset / 4) as u8));
            }
            return Ok(());
        }
        if let Some(&var) = self.globals.get(&node.data) {
            self.pool_load(thumb::R0, PoolValue::Symbol(var.symbol));
            if !var.array {
                // An array name decays to its address; scalars load.
                self.emit16(thumb::ldr_imm(thumb::R0, thumb::R0, 0));
            }
            return Ok(());
        }
        if self.funcs.contains_key(&node.data) {
            let symbol = self.funcs[&node.data];
            self.pool_load(thumb::R0, PoolValue::Symbol(symbol));
            return Ok(());
        }
        let name = ast.string(vol, node.data)?;
        self.err(format!(
            "undeclared identifier `{}`",
            String::from_utf8_lossy(&name)
        ))?;
        self.emit16(thumb::mov_imm(thumb::R0, 0));
        Ok(())
    }

    fn unary<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        node: &Node,
    ) -> Result<()> {
        use TokKind::*;
        let op = node.data;
        if op == PlusPlus as u32 || op == MinusMinus as u32 {
            // Pre-increment: store the new value and keep it.
            return self.inc_dec(vol, ast, node.children[0], op == PlusPlus as u32, false);
        }
        if op == Amp as u32 {
            return self.lvalue_addr(vol, ast, node.children[0]);
        }
        self.expression(vol, ast, node.children[0])?;
        if op == Minus as u32 {
            self.emit16(thumb::alu(Alu::Neg, thumb::R0, thumb::R0));
        } else if op == Tilde as u32 {
            self.emit16(thumb::alu(Alu::Mvn, thumb::R0, thumb::R0));
        } else if op == Bang as u32 {
            self.emit16(thumb::cmp_imm(thumb::R0, 0));
            self.cond_set(Cond::Eq);
        } else if op == Star as u32 {
            self.emit16(thumb::ldr_imm(thumb::R0, thumb::R0, 0));
        } else {
            self.err("unsupported unary operator")?;
        }
        Ok(())
    }

    fn post_op<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        node: &Node,
    ) -> Result<()> {
        let inc = node.data == TokKind::PlusPlus as u32;
        self.inc_dec(vol, ast, node.children[0], inc, true)
    }

    /// Shared pre/post increment and decrement over an lvalue. Leaves the
    /// old value in `r0` for postfix, the new value for prefix.
    fn inc_dec<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        target: u32,
        inc: bool,
        postfix: bool,
    ) -> Result<()> {
        match self.lvalue(vol, ast, target)? {
            Place::Local(offset) => {
                let slot = (offset / 4) as u8;
                self.emit16(thumb::ldr_sp(thumb::R0, slot));
                let step = if inc {
                    thumb::add_imm3(thumb::R2, thumb::R0, 1)
                } else {
                    thumb::sub_imm3(thumb::R2, thumb::R0, 1)
                };
                self.emit16(step);
                self.emit16(thumb::str_sp(thumb::R2, slot));
                if !postfix {
                    self.emit16(thumb::mov_reg(thumb::R0, thumb::R2));
                }
            }
            Place::Addr => {
                self.emit16(thumb::mov_reg(thumb::R1, thumb::R0));
                self.emit16(thumb::ldr_imm(thumb::R0, thumb::R1, 0));
                let step = if inc {
                    thumb::add_imm3(thumb::R2, thumb::R0, 1)
                } else {
                    thumb::sub_imm3(thumb::R2, thumb::R0, 1)
                };
                self.emit16(step);
                self.emit16(thumb::str_imm(thumb::R2, thumb::R1, 0));
                if !postfix {
                    self.emit16(thumb::mov_reg(thumb::R0, thumb::R2));
                }
            }
        }
        Ok(())
    }

    fn binary<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        node: &Node,
    ) -> Result<()> {
        use TokKind::*;
        let op = node.data;
        if op == Comma as u32 {
            self.expression(vol, ast, node.children[0])?;
            return self.expression(vol, ast, node.children[1]);
        }
        if op == AndAnd as u32 || op == OrOr as u32 {
            return self.logical(vol, ast, node, op == AndAnd as u32);
        }
        self.expression(vol, ast, node.children[0])?;
        self.push_r0();
        self.expression(vol, ast, node.children[1])?;
        self.pop_reg(thumb::R1);
        let op = match TokKind::from_u16(op as u16) {
            Some(op) => op,
            None => {
                return self.err("corrupt operator in binary node");
            }
        };
        self.binop(op, thumb::R1, thumb::R2)
    }

    fn logical<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        node: &Node,
        is_and: bool,
    ) -> Result<()> {
        let short = self.new_label();
        let end = self.new_label();
        self.expression(vol, ast, node.children[0])?;
        self.emit16(thumb::cmp_imm(thumb::R0, 0));
        self.branch_if(if is_and { Cond::Eq } else { Cond::Ne }, short);
        self.expression(vol, ast, node.children[1])?;
        self.emit16(thumb::cmp_imm(thumb::R0, 0));
        self.branch_if(if is_and { Cond::Eq } else { Cond::Ne }, short);
        self.emit16(thumb::mov_imm(thumb::R0, if is_and { 1 } else { 0 }));
        self.branch(end);
        self.bind(short);
        self.emit16(thumb::mov_imm(thumb::R0, if is_and { 0 } else { 1 }));
        self.bind(end);
        Ok(())
    }

    /// Evaluate an lvalue. Scalars in the frame stay symbolic; anything
    /// else computes its address into `r0`.
    fn lvalue<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        offset: u32,
    ) -> Result<Place> {
        let node = ast.node(vol, offset)?;
        match node.kind {
            NodeKind::Ident => {
                if let Some(var) = self.lookup_local(node.data) {
                    if var.array {
                        self.err("array is not assignable")?;
                        return Ok(Place::Local(var.offset));
                    }
                    return Ok(Place::Local(var.offset));
                }
                if let Some(&var) = self.globals.get(&node.data) {
                    if var.array {
                        self.err("array is not assignable")?;
                    }
                    self.pool_load(thumb::R0, PoolValue::Symbol(var.symbol));
                    return Ok(Place::Addr);
                }
                let name = ast.string(vol, node.data)?;
                self.err(format!(
                    "undeclared identifier `{}`",
                    String::from_utf8_lossy(&name)
                ))?;
                Ok(Place::Local(0))
            }
            NodeKind::Unary if node.data == TokKind::Star as u32 => {
                self.expression(vol, ast, node.children[0])?;
                Ok(Place::Addr)
            }
            NodeKind::Index => {
                self.index_addr(vol, ast, &node)?;
                Ok(Place::Addr)
            }
            NodeKind::Member => {
                self.err("struct member access requires field offsets")?;
                Ok(Place::Local(0))
            }
            _ => {
                self.err("expression is not assignable")?;
                Ok(Place::Local(0))
            }
        }
    }

    /// Materialize an lvalue's address into `r0` for the `&` operator.
    fn lvalue_addr<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        offset: u32,
    ) -> Result<()> {
        match self.lvalue(vol, ast, offset)? {
            Place::Local(slot) => {
                self.emit16(thumb::add_rd_sp(thumb::R0, (slot / 4) as u8));
            }
            Place::Addr => {}
        }
        Ok(())
    }

    /// `base[index]` element address into `r0`, scaling by the word size.
    fn index_addr<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        node: &Node,
    ) -> Result<()> {
        self.expression(vol, ast, node.children[0])?;
        self.push_r0();
        self.expression(vol, ast, node.children[1])?;
        self.emit16(thumb::lsl_imm(thumb::R0, thumb::R0, 2));
        self.pop_reg(thumb::R1);
        self.emit16(thumb::add_reg(thumb::R0, thumb::R1, thumb::R0));
        Ok(())
    }

    fn assign<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        node: &Node,
    ) -> Result<()> {
        let op = match TokKind::from_u16(node.data as u16) {
            Some(op) => op,
            None => return self.err("corrupt operator in assignment"),
        };
        let simple = op == TokKind::Assign;
        match self.lvalue(vol, ast, node.children[0])? {
            Place::Local(offset) => {
                let slot = (offset / 4) as u8;
                self.expression(vol, ast, node.children[1])?;
                if !simple {
                    self.emit16(thumb::ldr_sp(thumb::R1, slot));
                    self.binop(op, thumb::R1, thumb::R2)?;
                }
                self.emit16(thumb::str_sp(thumb::R0, slot));
            }
            Place::Addr => {
                self.push_r0();
                self.expression(vol, ast, node.children[1])?;
                self.pop_reg(thumb::R1);
                if !simple {
                    self.emit16(thumb::ldr_imm(thumb::R2, thumb::R1, 0));
                    self.binop(op, thumb::R2, thumb::R3)?;
                }
                self.emit16(thumb::str_imm(thumb::R0, thumb::R1, 0));
            }
        }
        Ok(())
    }

    fn call<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ast: &mut AstFile,
        node: &Node,
    ) -> Result<()> {
        let callee = ast.node(vol, node.children[0])?;
        if callee.kind != NodeKind::Ident {
            return self.err("call target must be a function name");
        }
        let args = &node.children[1..];
        let name = ast.string(vol, callee.data)?;

        if let Some(number) = syscall::syscall_by_name(&name) {
            if args.len() > 4 {
                self.err("syscalls take at most four arguments")?;
            }
            let reg_args = args.len().min(4);
            for &arg in &args[..reg_args] {
                self.expression(vol, ast, arg)?;
                self.push_r0();
            }
            for index in (0..reg_args).rev() {
                self.pop_reg(index as u8);
            }
            self.emit16(thumb::mov_imm(thumb::R7, number));
            self.emit16(thumb::svc(0));
            return Ok(());
        }

        let symbol = self.func_symbol(vol, ast, callee.data)?;

        // Arguments beyond the fourth go on the stack, pushed
        // right-to-left so the fifth ends up on top.
        let stacked = args.len().saturating_sub(4);
        for &arg in args[4..].iter().rev() {
            self.expression(vol, ast, arg)?;
            self.push_r0();
        }
        let reg_args = args.len().min(4);
        for &arg in &args[..reg_args] {
            self.expression(vol, ast, arg)?;
            self.push_r0();
        }
        for index in (0..reg_args).rev() {
            self.pop_reg(index as u8);
        }

        self.obj.add_reloc(
            self.text_offset(),
            SectionId::Text,
            RelocKind::ThumbCall,
            symbol,
        );
        self.emit_pair(thumb::bl(0));

        if stacked > 0 {
            self.emit16(thumb::add_sp(stacked as u8));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cc::{lexer::lex, parser::parse};
    use crate::fs::{format, RamDisk};
    use crate::mimi;
    use crate::read::ObjFile;

    fn build(source: &str) -> (Volume<RamDisk>, Vec<u8>) {
        let mut disk = RamDisk::new(8192);
        format(&mut disk, "TEST").unwrap();
        let mut vol = Volume::mount(disk).unwrap();
        vol.write_file("t.c", source.as_bytes()).unwrap();
        let mut diag = Diagnostics::new();
        lex(&mut vol, "t.c", "t.tok", &mut diag).unwrap();
        parse(&mut vol, "t.tok", "t.ast", &mut diag).unwrap();
        assert!(diag.ok(), "front end: {:?}", diag.error_msg);
        codegen(&mut vol, "t.ast", "t.o", &mut diag).unwrap();
        assert!(diag.ok(), "codegen: {:?}", diag.error_msg);
        let object = vol.read_file("t.o").unwrap();
        (vol, object)
    }

    fn halfwords(text: &[u8]) -> Vec<u16> {
        text.chunks(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    #[test]
    fn return_42_text() {
        let (_, object) = build("int main() { return 42; }\n");
        let obj = ObjFile::parse(&object).unwrap();
        let code = halfwords(obj.text());
        // PUSH {r4-r7, lr}; MOVS r0, #42; B epilogue; POP {r4-r7, pc}
        assert_eq!(code[0], 0xB5F0);
        assert!(code.contains(&0x202A));
        assert_eq!(code.last(), Some(&0xBDF0));
        assert!(obj.relocs().is_empty());
        let main = &obj.symbols()[0];
        assert_eq!(mimi::name_str(&main.name), b"main");
        assert_eq!(main.value.get(), 0);
        assert_eq!(main.kind, mimi::SYM_GLOBAL);
    }

    #[test]
    fn syscall_call_is_svc_not_reloc() {
        let (_, object) = build(
            "int main() {\n\
             gpio_init(25);\n\
             gpio_set_dir(25, 1);\n\
             gpio_put(25, 1);\n\
             sleep_ms(500);\n\
             return 0;\n\
             }\n",
        );
        let obj = ObjFile::parse(&object).unwrap();
        assert!(obj.relocs().is_empty());
        let code = halfwords(obj.text());
        // MOV r7, #40 (GPIO_INIT) then SVC 0, and a sleep at #2.
        let svc = thumb::svc(0);
        assert!(code.windows(2).any(|w| w == [thumb::mov_imm(7, 40), svc]));
        assert!(code.windows(2).any(|w| w == [thumb::mov_imm(7, 41), svc]));
        assert!(code.windows(2).any(|w| w == [thumb::mov_imm(7, 42), svc]));
        assert!(code.windows(2).any(|w| w == [thumb::mov_imm(7, 2), svc]));
    }

    #[test]
    fn call_records_thumb_call_reloc() {
        let (_, object) = build(
            "int helper(int x) { return x + 1; }\n\
             int main() { return helper(41); }\n",
        );
        let obj = ObjFile::parse(&object).unwrap();
        let relocs = obj.relocs();
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].kind, mimi::RELOC_THUMB_CALL);
        let symbol = &obj.symbols()[relocs[0].symbol_idx.get() as usize];
        assert_eq!(mimi::name_str(&symbol.name), b"helper");
        assert_eq!(symbol.kind, mimi::SYM_GLOBAL);
    }

    #[test]
    fn string_literal_gets_data_and_reloc() {
        let (_, object) = build("int main() { puts(\"hi\"); return 0; }\n");
        let obj = ObjFile::parse(&object).unwrap();
        assert!(obj.data().starts_with(b"hi\0"));
        // The pool word holding the string address is relocated.
        assert!(obj
            .relocs()
            .iter()
            .any(|r| r.kind == mimi::RELOC_ABS32 && r.section.get() == mimi::SEC_TEXT as u16));
    }

    #[test]
    fn globals_fold_constants() {
        let (_, object) = build("int answer = 42;\nint neg = -7;\nint main() { return answer; }\n");
        let obj = ObjFile::parse(&object).unwrap();
        assert_eq!(&obj.data()[..4], &42u32.to_le_bytes());
        assert_eq!(&obj.data()[4..8], &(-7i32).to_le_bytes());
    }

    #[test]
    fn locals_and_arithmetic() {
        let (_, object) = build(
            "int main() {\n\
             int a = 6;\n\
             int b = 7;\n\
             return a * b;\n\
             }\n",
        );
        let obj = ObjFile::parse(&object).unwrap();
        let code = halfwords(obj.text());
        // Frame reservation and a multiply.
        assert!(code.contains(&thumb::sub_sp(2)));
        assert!(code.contains(&thumb::alu(Alu::Mul, 0, 1)));
    }

    #[test]
    fn while_loop_branches_back() {
        let (_, object) = build(
            "int main() {\n\
             int i = 0;\n\
             while (i < 10) { i = i + 1; }\n\
             return i;\n\
             }\n",
        );
        let obj = ObjFile::parse(&object).unwrap();
        let code = halfwords(obj.text());
        // At least one backward unconditional branch.
        assert!(code
            .iter()
            .any(|&hw| hw & 0xF800 == 0xE000 && hw & 0x400 != 0));
    }

    #[test]
    fn five_argument_call_spills_to_stack() {
        let (_, object) = build(
            "int sum(int a, int b, int c, int d, int e) { return a + b + c + d + e; }\n\
             int main() { return sum(1, 2, 3, 4, 5); }\n",
        );
        let obj = ObjFile::parse(&object).unwrap();
        let code = halfwords(obj.text());
        // Caller discards one stacked argument after the call.
        assert!(code.contains(&thumb::add_sp(1)));
    }

    #[test]
    fn struct_member_access_is_rejected() {
        let mut disk = RamDisk::new(8192);
        format(&mut disk, "TEST").unwrap();
        let mut vol = Volume::mount(disk).unwrap();
        vol.write_file("t.c", b"struct p { int x; };\nint main(struct p *q) { return q->x; }\n")
            .unwrap();
        let mut diag = Diagnostics::new();
        lex(&mut vol, "t.c", "t.tok", &mut diag).unwrap();
        parse(&mut vol, "t.tok", "t.ast", &mut diag).unwrap();
        assert!(diag.ok());
        codegen(&mut vol, "t.ast", "t.o", &mut diag).unwrap();
        assert!(!diag.ok());
    }
}
