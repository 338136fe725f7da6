//! Pass 2: token file to AST file.
//!
//! Recursive descent for declarations and statements, precedence climbing
//! for expressions. The parser streams the token file with one token of
//! lookahead and appends nodes to the `.ast` file as they complete, so a
//! parent is always written after its children and can embed their file
//! offsets. The token file's string table is copied forward to the tail
//! of the AST file, which keeps every name offset valid across the pass
//! boundary.
//!
//! Preprocessor tokens are discarded here; see the crate notes on the
//! deliberately absent preprocessor.
//!
//! Diagnostics from this pass report token indices, since token records
//! carry no line numbers.

use crate::cc::ast::{AstWriter, NodeFlags, NodeKind};
use crate::cc::token::TokKind;
use crate::cc::{Diagnostics, MAX_ERRORS};
use crate::common::{ErrorCode, Result};
use crate::endian::U32;
use crate::fs::{BlockDevice, Volume};
use crate::mimi::{AstHeader, Tok, TokHeader, AST_MAX_CHILDREN};
use crate::pod::bytes_of;
use crate::stream::Stream;

/// Counters reported by the parser.
#[derive(Debug, Default, Clone)]
pub struct ParseStats {
    pub nodes: u32,
    pub functions: u32,
}

/// The current token, decoded.
#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokKind,
    value: u32,
}

const EOF: Token = Token {
    kind: TokKind::Eof,
    value: 0,
};

struct Parser<'d> {
    input: Stream,
    writer: AstWriter,
    diag: &'d mut Diagnostics,
    token_count: u32,
    consumed: u32,
    cur: Token,
    ahead: Option<Token>,
    functions: u32,
}

/// Run the parser over `tok_path`, writing `ast_path`.
pub fn parse<D: BlockDevice>(
    vol: &mut Volume<D>,
    tok_path: &str,
    ast_path: &str,
    diag: &mut Diagnostics,
) -> Result<ParseStats> {
    let mut input = Stream::open_read(vol, tok_path)?;
    let mut raw = [0u8; core::mem::size_of::<TokHeader>()];
    if input.read(vol, &mut raw)? != raw.len() {
        return Err(ErrorCode::Corrupt);
    }
    let tok_header = match crate::pod::from_bytes::<TokHeader>(&raw) {
        Ok(header) => *header,
        Err(()) => return Err(ErrorCode::Corrupt),
    };

    let mut output = Stream::open_write(vol, ast_path)?;
    output.write(vol, &[0; core::mem::size_of::<AstHeader>()])?;

    let mut parser = Parser {
        input,
        writer: AstWriter::new(output),
        diag,
        token_count: tok_header.token_count.get(),
        consumed: 0,
        cur: EOF,
        ahead: None,
        functions: 0,
    };
    parser.advance(vol)?;
    let root = parser.translation_unit(vol);

    let Parser {
        mut input,
        writer,
        functions,
        ..
    } = parser;
    let node_count = writer.node_count();
    let mut output = writer.into_stream();
    let root = root?;

    // Carry the string table forward from the token file.
    let string_offset = output.position();
    let string_size = tok_header.string_size.get();
    input.seek(vol, tok_header.string_offset.get())?;
    let mut remaining = string_size as usize;
    let mut chunk = [0u8; 256];
    while remaining > 0 {
        let n = remaining.min(chunk.len());
        if input.read(vol, &mut chunk[..n])? != n {
            return Err(ErrorCode::Corrupt);
        }
        output.write(vol, &chunk[..n])?;
        remaining -= n;
    }
    input.close(vol)?;

    let header = AstHeader {
        root_offset: U32::new(root),
        string_offset: U32::new(string_offset),
        string_size: U32::new(string_size),
        node_count: U32::new(node_count),
    };
    output.seek(vol, 0)?;
    output.write(vol, bytes_of(&header))?;
    output.close(vol)?;

    Ok(ParseStats {
        nodes: node_count,
        functions,
    })
}

/// Binding power of a left-associative binary operator, or `None`.
fn binary_prec(kind: TokKind) -> Option<u8> {
    use TokKind::*;
    Some(match kind {
        OrOr => 1,
        AndAnd => 2,
        Pipe => 3,
        Caret => 4,
        Amp => 5,
        EqEq | Ne => 6,
        Lt | Gt | Le | Ge => 7,
        Shl | Shr => 8,
        Plus | Minus => 9,
        Star | Slash | Percent => 10,
        _ => return None,
    })
}

fn is_assign_op(kind: TokKind) -> bool {
    use TokKind::*;
    matches!(
        kind,
        Assign
            | PlusAssign
            | MinusAssign
            | StarAssign
            | SlashAssign
            | PercentAssign
            | AmpAssign
            | PipeAssign
            | CaretAssign
            | ShlAssign
            | ShrAssign
    )
}

fn starts_declaration(kind: TokKind) -> bool {
    kind.is_storage_class()
        || kind.is_type_specifier()
        || matches!(kind, TokKind::KwStruct | TokKind::KwUnion | TokKind::KwEnum)
}

/// What one declarator turned out to be.
enum Declarator {
    Var {
        name: u32,
        ptr_depth: u32,
        array: Option<u32>,
    },
    Func {
        name: u32,
        param_list: u32,
    },
    /// Recovery produced nothing usable.
    Broken,
}

/// Collected declaration specifiers.
#[derive(Default, Clone, Copy)]
struct Specifiers {
    flags: NodeFlags,
    saw_type: bool,
    /// A struct/union/enum declaration node parsed along the way.
    record: Option<u32>,
}

impl<'d> Parser<'d> {
    fn fetch<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<Token> {
        if self.consumed >= self.token_count {
            return Ok(EOF);
        }
        let mut raw = [0u8; core::mem::size_of::<Tok>()];
        if self.input.read(vol, &mut raw)? != raw.len() {
            return Err(ErrorCode::Corrupt);
        }
        self.consumed += 1;
        let record = match crate::pod::from_bytes::<Tok>(&raw) {
            Ok(record) => *record,
            Err(()) => return Err(ErrorCode::Corrupt),
        };
        let kind = TokKind::from_u16(record.kind.get()).ok_or(ErrorCode::Corrupt)?;
        Ok(Token {
            kind,
            value: record.value.get(),
        })
    }

    /// Step to the next token, discarding preprocessor tokens.
    fn advance<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<()> {
        loop {
            self.cur = match self.ahead.take() {
                Some(token) => token,
                None => self.fetch(vol)?,
            };
            if !self.cur.kind.is_preprocessor() {
                return Ok(());
            }
        }
    }

    fn peek<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<TokKind> {
        if self.ahead.is_none() {
            loop {
                let token = self.fetch(vol)?;
                if !token.kind.is_preprocessor() {
                    self.ahead = Some(token);
                    break;
                }
            }
        }
        Ok(self.ahead.map(|t| t.kind).unwrap_or(TokKind::Eof))
    }

    fn error_here(&mut self, msg: impl Into<String>) -> Result<()> {
        self.diag.error(self.consumed, msg)
    }

    /// Consume `kind` or record a diagnostic. Returns whether it matched.
    fn expect<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        kind: TokKind,
        what: &str,
    ) -> Result<bool> {
        if self.cur.kind == kind {
            self.advance(vol)?;
            Ok(true)
        } else {
            self.error_here(format!("expected {}", what))?;
            Ok(false)
        }
    }

    /// Skip ahead to a statement boundary: past the next `;`, or up to a
    /// brace.
    fn recover<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<()> {
        loop {
            match self.cur.kind {
                TokKind::Eof | TokKind::LBrace | TokKind::RBrace => return Ok(()),
                TokKind::Semi => {
                    self.advance(vol)?;
                    return Ok(());
                }
                _ => self.advance(vol)?,
            }
        }
    }

    fn emit<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        kind: NodeKind,
        flags: NodeFlags,
        data: u32,
        children: &[u32],
    ) -> Result<u32> {
        self.writer.emit(vol, kind, flags, data, children)
    }

    // ---- declarations ----

    fn translation_unit<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<u32> {
        let mut items = Vec::new();
        while self.cur.kind != TokKind::Eof {
            if self.diag.error_count >= MAX_ERRORS {
                break;
            }
            if starts_declaration(self.cur.kind) {
                items.extend(self.declaration(vol, true)?);
            } else {
                self.error_here("expected declaration at top level")?;
                self.recover(vol)?;
                if self.cur.kind == TokKind::LBrace || self.cur.kind == TokKind::RBrace {
                    // A stray brace at top level never starts a
                    // declaration; drop it and keep going.
                    self.advance(vol)?;
                }
            }
        }
        self.writer
            .emit_chain(vol, NodeKind::TranslationUnit, NodeFlags::empty(), 0, &items)
    }

    fn specifiers<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<Specifiers> {
        let mut spec = Specifiers::default();
        loop {
            match self.cur.kind {
                TokKind::KwStatic => {
                    spec.flags |= NodeFlags::STATIC;
                    self.advance(vol)?;
                }
                TokKind::KwExtern => {
                    spec.flags |= NodeFlags::EXTERN;
                    self.advance(vol)?;
                }
                TokKind::KwAuto | TokKind::KwRegister | TokKind::KwConst | TokKind::KwVolatile => {
                    self.advance(vol)?;
                }
                TokKind::KwTypedef => {
                    self.diag.warning(self.consumed, "typedef ignored");
                    self.advance(vol)?;
                }
                TokKind::KwUnsigned => {
                    spec.flags |= NodeFlags::UNSIGNED;
                    spec.saw_type = true;
                    self.advance(vol)?;
                }
                TokKind::KwFloat | TokKind::KwDouble => {
                    self.diag
                        .warning(self.consumed, "floating point treated as int");
                    spec.saw_type = true;
                    self.advance(vol)?;
                }
                TokKind::KwVoid
                | TokKind::KwChar
                | TokKind::KwShort
                | TokKind::KwInt
                | TokKind::KwLong
                | TokKind::KwSigned => {
                    spec.saw_type = true;
                    self.advance(vol)?;
                }
                TokKind::KwStruct | TokKind::KwUnion => {
                    spec.record = Some(self.record_decl(vol, NodeKind::RecordDecl)?);
                    spec.saw_type = true;
                }
                TokKind::KwEnum => {
                    spec.record = Some(self.record_decl(vol, NodeKind::EnumDecl)?);
                    spec.saw_type = true;
                }
                _ => break,
            }
        }
        Ok(spec)
    }

    /// Parse `struct`/`union`/`enum` with an optional tag and body. Bodies
    /// are consumed in form only; members are not modeled.
    fn record_decl<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        kind: NodeKind,
    ) -> Result<u32> {
        self.advance(vol)?;
        let mut name = 0;
        if self.cur.kind == TokKind::Ident {
            name = self.cur.value;
            self.advance(vol)?;
        }
        if self.cur.kind == TokKind::LBrace {
            let mut depth = 0u32;
            loop {
                match self.cur.kind {
                    TokKind::LBrace => depth += 1,
                    TokKind::RBrace => {
                        depth -= 1;
                        if depth == 0 {
                            self.advance(vol)?;
                            break;
                        }
                    }
                    TokKind::Eof => {
                        self.error_here("unterminated struct/union/enum body")?;
                        break;
                    }
                    _ => {}
                }
                self.advance(vol)?;
            }
        }
        self.emit(vol, kind, NodeFlags::empty(), name, &[])
    }

    /// Parse one declarator after the specifiers.
    fn declarator<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<Declarator> {
        let mut ptr_depth = 0;
        while self.cur.kind == TokKind::Star {
            ptr_depth += 1;
            self.advance(vol)?;
        }
        if self.cur.kind != TokKind::Ident {
            self.error_here("expected declarator name")?;
            self.recover(vol)?;
            return Ok(Declarator::Broken);
        }
        let name = self.cur.value;
        self.advance(vol)?;

        if self.cur.kind == TokKind::LParen {
            let param_list = self.param_list(vol)?;
            return Ok(Declarator::Func { name, param_list });
        }

        let mut array = None;
        if self.cur.kind == TokKind::LBracket {
            self.advance(vol)?;
            let count = match self.cur.kind {
                TokKind::IntLit | TokKind::CharLit => {
                    let count = self.cur.value;
                    self.advance(vol)?;
                    count
                }
                TokKind::RBracket => 0,
                _ => {
                    self.error_here("array bound must be an integer constant")?;
                    self.recover(vol)?;
                    return Ok(Declarator::Broken);
                }
            };
            self.expect(vol, TokKind::RBracket, "`]`")?;
            array = Some(count);
        }
        Ok(Declarator::Var {
            name,
            ptr_depth,
            array,
        })
    }

    fn param_list<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<u32> {
        self.advance(vol)?; // past `(`
        let mut params = Vec::new();
        let mut flags = NodeFlags::empty();
        if self.cur.kind == TokKind::KwVoid && self.peek(vol)? == TokKind::RParen {
            self.advance(vol)?;
        }
        while self.cur.kind != TokKind::RParen && self.cur.kind != TokKind::Eof {
            if self.cur.kind == TokKind::Ellipsis {
                flags |= NodeFlags::VARARGS;
                self.advance(vol)?;
                break;
            }
            let spec = self.specifiers(vol)?;
            if !spec.saw_type && spec.record.is_none() {
                self.error_here("expected parameter type")?;
                break;
            }
            let mut ptr_depth = 0;
            while self.cur.kind == TokKind::Star {
                ptr_depth += 1;
                self.advance(vol)?;
            }
            let mut name = 0;
            if self.cur.kind == TokKind::Ident {
                name = self.cur.value;
                self.advance(vol)?;
            }
            if self.cur.kind == TokKind::LBracket {
                // Array parameters decay to pointers.
                self.advance(vol)?;
                if self.cur.kind == TokKind::IntLit {
                    self.advance(vol)?;
                }
                self.expect(vol, TokKind::RBracket, "`]`")?;
                ptr_depth += 1;
            }
            let var_flags = spec.flags.with_ptr_depth(ptr_depth);
            params.push(self.emit(vol, NodeKind::VarDecl, var_flags, name, &[])?);
            if self.cur.kind == TokKind::Comma {
                self.advance(vol)?;
            } else {
                break;
            }
        }
        self.expect(vol, TokKind::RParen, "`)`")?;
        self.writer
            .emit_chain(vol, NodeKind::ParamList, flags, 0, &params)
    }

    /// Parse a full declaration. At top level this may turn into a
    /// function definition; in blocks it only declares variables.
    fn declaration<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        top_level: bool,
    ) -> Result<Vec<u32>> {
        let spec = self.specifiers(vol)?;
        let mut items = Vec::new();

        // `struct S { ... };` with no declarator.
        if self.cur.kind == TokKind::Semi {
            self.advance(vol)?;
            items.extend(spec.record);
            return Ok(items);
        }
        if !spec.saw_type && spec.record.is_none() {
            self.error_here("expected type in declaration")?;
            self.recover(vol)?;
            return Ok(items);
        }

        loop {
            match self.declarator(vol)? {
                Declarator::Broken => return Ok(items),
                Declarator::Func { name, param_list } => {
                    if self.cur.kind == TokKind::LBrace {
                        if !top_level {
                            self.error_here("nested function definition")?;
                            self.recover(vol)?;
                            return Ok(items);
                        }
                        let body = self.block(vol)?;
                        let func = self.emit(
                            vol,
                            NodeKind::FuncDef,
                            spec.flags,
                            name,
                            &[param_list, body],
                        )?;
                        self.functions += 1;
                        items.push(func);
                        return Ok(items);
                    }
                    // A plain declaration; externs are discovered at
                    // call sites, so nothing is emitted.
                    self.expect(vol, TokKind::Semi, "`;` after function declaration")?;
                    return Ok(items);
                }
                Declarator::Var {
                    name,
                    ptr_depth,
                    array,
                } => {
                    let mut flags = spec.flags.with_ptr_depth(ptr_depth);
                    let mut children = Vec::new();
                    if let Some(count) = array {
                        flags |= NodeFlags::ARRAY;
                        children.push(self.emit(
                            vol,
                            NodeKind::IntLit,
                            NodeFlags::empty(),
                            count,
                            &[],
                        )?);
                    }
                    if self.cur.kind == TokKind::Assign {
                        self.advance(vol)?;
                        if self.cur.kind == TokKind::LBrace {
                            self.error_here("initializer lists are not supported")?;
                            self.recover(vol)?;
                            return Ok(items);
                        }
                        flags |= NodeFlags::HAS_INIT;
                        children.push(self.assign_expr(vol)?);
                    }
                    items.push(self.emit(vol, NodeKind::VarDecl, flags, name, &children)?);
                }
            }
            match self.cur.kind {
                TokKind::Comma => self.advance(vol)?,
                _ => {
                    self.expect(vol, TokKind::Semi, "`;` after declaration")?;
                    return Ok(items);
                }
            }
        }
    }

    // ---- statements ----

    fn block<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<u32> {
        self.advance(vol)?; // past `{`
        let mut items = Vec::new();
        while self.cur.kind != TokKind::RBrace && self.cur.kind != TokKind::Eof {
            if self.diag.error_count >= MAX_ERRORS {
                break;
            }
            if starts_declaration(self.cur.kind) {
                items.extend(self.declaration(vol, false)?);
            } else {
                items.push(self.statement(vol)?);
            }
        }
        self.expect(vol, TokKind::RBrace, "`}`")?;
        self.writer
            .emit_chain(vol, NodeKind::Block, NodeFlags::empty(), 0, &items)
    }

    fn paren_expr<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<u32> {
        self.expect(vol, TokKind::LParen, "`(`")?;
        let expr = self.expression(vol)?;
        self.expect(vol, TokKind::RParen, "`)`")?;
        Ok(expr)
    }

    fn statement<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<u32> {
        let cur_kind = self.cur.kind;
        match cur_kind {
            TokKind::LBrace => self.block(vol),
            TokKind::Semi => {
                self.advance(vol)?;
                self.emit(vol, NodeKind::Empty, NodeFlags::empty(), 0, &[])
            }
            TokKind::KwIf => {
                self.advance(vol)?;
                let cond = self.paren_expr(vol)?;
                let then = self.statement(vol)?;
                if self.cur.kind == TokKind::KwElse {
                    self.advance(vol)?;
                    let otherwise = self.statement(vol)?;
                    self.emit(vol, NodeKind::If, NodeFlags::empty(), 0, &[cond, then, otherwise])
                } else {
                    self.emit(vol, NodeKind::If, NodeFlags::empty(), 0, &[cond, then])
                }
            }
            TokKind::KwWhile => {
                self.advance(vol)?;
                let cond = self.paren_expr(vol)?;
                let body = self.statement(vol)?;
                self.emit(vol, NodeKind::While, NodeFlags::empty(), 0, &[cond, body])
            }
            TokKind::KwDo => {
                self.advance(vol)?;
                let body = self.statement(vol)?;
                self.expect(vol, TokKind::KwWhile, "`while` after `do` body")?;
                let cond = self.paren_expr(vol)?;
                self.expect(vol, TokKind::Semi, "`;`")?;
                self.emit(vol, NodeKind::DoWhile, NodeFlags::empty(), 0, &[body, cond])
            }
            TokKind::KwFor => {
                self.advance(vol)?;
                self.expect(vol, TokKind::LParen, "`(`")?;
                let init = if self.cur.kind == TokKind::Semi {
                    0
                } else {
                    self.expression(vol)?
                };
                self.expect(vol, TokKind::Semi, "`;`")?;
                let cond = if self.cur.kind == TokKind::Semi {
                    0
                } else {
                    self.expression(vol)?
                };
                self.expect(vol, TokKind::Semi, "`;`")?;
                let update = if self.cur.kind == TokKind::RParen {
                    0
                } else {
                    self.expression(vol)?
                };
                self.expect(vol, TokKind::RParen, "`)`")?;
                let body = self.statement(vol)?;
                self.emit(
                    vol,
                    NodeKind::For,
                    NodeFlags::empty(),
                    0,
                    &[init, cond, update, body],
                )
            }
            TokKind::KwSwitch => {
                self.advance(vol)?;
                let cond = self.paren_expr(vol)?;
                let body = self.statement(vol)?;
                self.emit(vol, NodeKind::Switch, NodeFlags::empty(), 0, &[cond, body])
            }
            TokKind::KwCase => {
                self.advance(vol)?;
                let value = self.case_value(vol)?;
                self.expect(vol, TokKind::Colon, "`:` after case value")?;
                let stmt = self.statement(vol)?;
                self.emit(vol, NodeKind::Case, NodeFlags::empty(), value, &[stmt])
            }
            TokKind::KwDefault => {
                self.advance(vol)?;
                self.expect(vol, TokKind::Colon, "`:` after default")?;
                let stmt = self.statement(vol)?;
                self.emit(vol, NodeKind::Default, NodeFlags::empty(), 0, &[stmt])
            }
            TokKind::KwReturn => {
                self.advance(vol)?;
                if self.cur.kind == TokKind::Semi {
                    self.advance(vol)?;
                    self.emit(vol, NodeKind::Return, NodeFlags::empty(), 0, &[])
                } else {
                    let value = self.expression(vol)?;
                    self.expect(vol, TokKind::Semi, "`;`")?;
                    self.emit(vol, NodeKind::Return, NodeFlags::empty(), 0, &[value])
                }
            }
            TokKind::KwBreak => {
                self.advance(vol)?;
                self.expect(vol, TokKind::Semi, "`;`")?;
                self.emit(vol, NodeKind::Break, NodeFlags::empty(), 0, &[])
            }
            TokKind::KwContinue => {
                self.advance(vol)?;
                self.expect(vol, TokKind::Semi, "`;`")?;
                self.emit(vol, NodeKind::Continue, NodeFlags::empty(), 0, &[])
            }
            TokKind::KwGoto => {
                self.advance(vol)?;
                let name = if self.cur.kind == TokKind::Ident {
                    let name = self.cur.value;
                    self.advance(vol)?;
                    name
                } else {
                    self.error_here("expected label after goto")?;
                    0
                };
                self.expect(vol, TokKind::Semi, "`;`")?;
                self.emit(vol, NodeKind::Goto, NodeFlags::empty(), name, &[])
            }
            TokKind::Ident if self.peek(vol)? == TokKind::Colon => {
                let name = self.cur.value;
                self.advance(vol)?;
                self.advance(vol)?;
                let stmt = self.statement(vol)?;
                self.emit(vol, NodeKind::Label, NodeFlags::empty(), name, &[stmt])
            }
            _ => {
                let expr = self.expression(vol)?;
                if !self.expect(vol, TokKind::Semi, "`;` after expression")? {
                    self.recover(vol)?;
                }
                self.emit(vol, NodeKind::ExprStmt, NodeFlags::empty(), 0, &[expr])
            }
        }
    }

    /// A case label's integer constant, with optional leading minus.
    fn case_value<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<u32> {
        let negate = if self.cur.kind == TokKind::Minus {
            self.advance(vol)?;
            true
        } else {
            false
        };
        match self.cur.kind {
            TokKind::IntLit | TokKind::CharLit => {
                let raw = self.cur.value;
                self.advance(vol)?;
                Ok(if negate { (raw as i32).wrapping_neg() as u32 } else { raw })
            }
            _ => {
                self.error_here("case value must be an integer constant")?;
                Ok(0)
            }
        }
    }

    // ---- expressions ----

    fn expression<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<u32> {
        let mut lhs = self.assign_expr(vol)?;
        while self.cur.kind == TokKind::Comma {
            self.advance(vol)?;
            let rhs = self.assign_expr(vol)?;
            lhs = self.emit(
                vol,
                NodeKind::Binary,
                NodeFlags::empty(),
                TokKind::Comma as u32,
                &[lhs, rhs],
            )?;
        }
        Ok(lhs)
    }

    fn assign_expr<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<u32> {
        let lhs = self.ternary_expr(vol)?;
        if is_assign_op(self.cur.kind) {
            let op = self.cur.kind;
            self.advance(vol)?;
            // Right associative.
            let rhs = self.assign_expr(vol)?;
            return self.emit(vol, NodeKind::Assign, NodeFlags::empty(), op as u32, &[lhs, rhs]);
        }
        Ok(lhs)
    }

    fn ternary_expr<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<u32> {
        let cond = self.binary_expr(vol, 1)?;
        if self.cur.kind != TokKind::Question {
            return Ok(cond);
        }
        self.advance(vol)?;
        let then = self.expression(vol)?;
        self.expect(vol, TokKind::Colon, "`:` in conditional expression")?;
        let otherwise = self.ternary_expr(vol)?;
        self.emit(
            vol,
            NodeKind::Ternary,
            NodeFlags::empty(),
            0,
            &[cond, then, otherwise],
        )
    }

    fn binary_expr<D: BlockDevice>(&mut self, vol: &mut Volume<D>, min_prec: u8) -> Result<u32> {
        let mut lhs = self.unary_expr(vol)?;
        while let Some(prec) = binary_prec(self.cur.kind) {
            if prec < min_prec {
                break;
            }
            let op = self.cur.kind;
            self.advance(vol)?;
            let rhs = self.binary_expr(vol, prec + 1)?;
            lhs = self.emit(
                vol,
                NodeKind::Binary,
                NodeFlags::empty(),
                op as u32,
                &[lhs, rhs],
            )?;
        }
        Ok(lhs)
    }

    fn unary_expr<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<u32> {
        use TokKind::*;
        match self.cur.kind {
            Plus => {
                self.advance(vol)?;
                self.unary_expr(vol)
            }
            Minus | Bang | Tilde | Star | Amp | PlusPlus | MinusMinus => {
                let op = self.cur.kind;
                self.advance(vol)?;
                let operand = self.unary_expr(vol)?;
                self.emit(vol, NodeKind::Unary, NodeFlags::empty(), op as u32, &[operand])
            }
            KwSizeof => {
                self.advance(vol)?;
                if self.cur.kind == TokKind::LParen && starts_declaration(self.peek(vol)?) {
                    self.advance(vol)?;
                    self.specifiers(vol)?;
                    while self.cur.kind == TokKind::Star {
                        self.advance(vol)?;
                    }
                    self.expect(vol, TokKind::RParen, "`)`")?;
                } else {
                    // The operand parses and is then discarded; every
                    // object in this subset is word sized.
                    self.unary_expr(vol)?;
                }
                self.emit(vol, NodeKind::IntLit, NodeFlags::empty(), 4, &[])
            }
            _ => self.postfix_expr(vol),
        }
    }

    fn postfix_expr<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<u32> {
        let mut expr = self.primary_expr(vol)?;
        loop {
            match self.cur.kind {
                TokKind::LParen => {
                    self.advance(vol)?;
                    let mut children = vec![expr];
                    while self.cur.kind != TokKind::RParen && self.cur.kind != TokKind::Eof {
                        if children.len() == AST_MAX_CHILDREN {
                            self.error_here("too many call arguments")?;
                            break;
                        }
                        children.push(self.assign_expr(vol)?);
                        if self.cur.kind == TokKind::Comma {
                            self.advance(vol)?;
                        } else {
                            break;
                        }
                    }
                    self.expect(vol, TokKind::RParen, "`)` after arguments")?;
                    expr = self.emit(vol, NodeKind::Call, NodeFlags::empty(), 0, &children)?;
                }
                TokKind::LBracket => {
                    self.advance(vol)?;
                    let index = self.expression(vol)?;
                    self.expect(vol, TokKind::RBracket, "`]`")?;
                    expr = self.emit(vol, NodeKind::Index, NodeFlags::empty(), 0, &[expr, index])?;
                }
                TokKind::Dot | TokKind::Arrow => {
                    let flags = if self.cur.kind == TokKind::Arrow {
                        NodeFlags::ARROW
                    } else {
                        NodeFlags::empty()
                    };
                    self.advance(vol)?;
                    let name = if self.cur.kind == TokKind::Ident {
                        let name = self.cur.value;
                        self.advance(vol)?;
                        name
                    } else {
                        self.error_here("expected member name")?;
                        0
                    };
                    expr = self.emit(vol, NodeKind::Member, flags, name, &[expr])?;
                }
                TokKind::PlusPlus | TokKind::MinusMinus => {
                    let op = self.cur.kind;
                    self.advance(vol)?;
                    expr = self.emit(vol, NodeKind::PostOp, NodeFlags::empty(), op as u32, &[expr])?;
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary_expr<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<u32> {
        match self.cur.kind {
            TokKind::IntLit => {
                let value = self.cur.value;
                self.advance(vol)?;
                self.emit(vol, NodeKind::IntLit, NodeFlags::empty(), value, &[])
            }
            TokKind::CharLit => {
                let value = self.cur.value;
                self.advance(vol)?;
                self.emit(vol, NodeKind::CharLit, NodeFlags::empty(), value, &[])
            }
            TokKind::StrLit => {
                let offset = self.cur.value;
                self.advance(vol)?;
                self.emit(vol, NodeKind::StrLit, NodeFlags::empty(), offset, &[])
            }
            TokKind::Ident => {
                let name = self.cur.value;
                self.advance(vol)?;
                self.emit(vol, NodeKind::Ident, NodeFlags::empty(), name, &[])
            }
            TokKind::LParen => {
                self.advance(vol)?;
                let expr = self.expression(vol)?;
                self.expect(vol, TokKind::RParen, "`)`")?;
                Ok(expr)
            }
            _ => {
                self.error_here("expected expression")?;
                self.advance(vol)?;
                self.emit(vol, NodeKind::IntLit, NodeFlags::empty(), 0, &[])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cc::ast::AstFile;
    use crate::cc::lexer::lex;
    use crate::fs::{format, RamDisk};

    fn parse_source(source: &str) -> (Volume<RamDisk>, ParseStats) {
        let mut disk = RamDisk::new(8192);
        format(&mut disk, "TEST").unwrap();
        let mut vol = Volume::mount(disk).unwrap();
        vol.write_file("t.c", source.as_bytes()).unwrap();
        let mut diag = Diagnostics::new();
        lex(&mut vol, "t.c", "t.tok", &mut diag).unwrap();
        assert!(diag.ok());
        let stats = parse(&mut vol, "t.tok", "t.ast", &mut diag).unwrap();
        assert!(diag.ok(), "parse errors: {:?}", diag.error_msg);
        (vol, stats)
    }

    #[test]
    fn minimal_function() {
        let (mut vol, stats) = parse_source("int main() { return 42; }\n");
        assert_eq!(stats.functions, 1);

        let mut ast = AstFile::open(&mut vol, "t.ast").unwrap();
        let root = ast.node(&mut vol, ast.root_offset()).unwrap();
        assert_eq!(root.kind, NodeKind::TranslationUnit);
        assert_eq!(root.children.len(), 1);

        let func = ast.node(&mut vol, root.children[0]).unwrap();
        assert_eq!(func.kind, NodeKind::FuncDef);
        assert_eq!(ast.string(&mut vol, func.data).unwrap(), b"main");

        let body = ast.node(&mut vol, func.children[1]).unwrap();
        assert_eq!(body.kind, NodeKind::Block);
        let ret = ast.node(&mut vol, body.children[0]).unwrap();
        assert_eq!(ret.kind, NodeKind::Return);
        let value = ast.node(&mut vol, ret.children[0]).unwrap();
        assert_eq!(value.kind, NodeKind::IntLit);
        assert_eq!(value.data, 42);
    }

    #[test]
    fn precedence_shapes_the_tree() {
        // 1 + 2 * 3 parses as 1 + (2 * 3).
        let (mut vol, _) = parse_source("int f() { return 1 + 2 * 3; }\n");
        let mut ast = AstFile::open(&mut vol, "t.ast").unwrap();
        let root = ast.node(&mut vol, ast.root_offset()).unwrap();
        let func = ast.node(&mut vol, root.children[0]).unwrap();
        let body = ast.node(&mut vol, func.children[1]).unwrap();
        let ret = ast.node(&mut vol, body.children[0]).unwrap();
        let add = ast.node(&mut vol, ret.children[0]).unwrap();
        assert_eq!(add.kind, NodeKind::Binary);
        assert_eq!(add.data, TokKind::Plus as u32);
        let lhs = ast.node(&mut vol, add.children[0]).unwrap();
        assert_eq!(lhs.data, 1);
        let rhs = ast.node(&mut vol, add.children[1]).unwrap();
        assert_eq!(rhs.kind, NodeKind::Binary);
        assert_eq!(rhs.data, TokKind::Star as u32);
    }

    #[test]
    fn assignment_is_right_associative() {
        let (mut vol, _) = parse_source("int f() { int a; int b; a = b = 1; return a; }\n");
        let mut ast = AstFile::open(&mut vol, "t.ast").unwrap();
        let root = ast.node(&mut vol, ast.root_offset()).unwrap();
        let func = ast.node(&mut vol, root.children[0]).unwrap();
        let body = ast.node(&mut vol, func.children[1]).unwrap();
        let stmt = ast.node(&mut vol, body.children[2]).unwrap();
        let assign = ast.node(&mut vol, stmt.children[0]).unwrap();
        assert_eq!(assign.kind, NodeKind::Assign);
        let rhs = ast.node(&mut vol, assign.children[1]).unwrap();
        assert_eq!(rhs.kind, NodeKind::Assign);
    }

    #[test]
    fn control_flow_statements() {
        let (_, stats) = parse_source(
            "int f(int n) {\n\
             int i;\n\
             for (i = 0; i < n; i++) { if (i == 3) break; else continue; }\n\
             while (n > 0) n--;\n\
             do { n++; } while (n < 10);\n\
             switch (n) { case 1: return 1; default: return 0; }\n\
             }\n",
        );
        assert_eq!(stats.functions, 1);
    }

    #[test]
    fn long_blocks_chain() {
        let mut body = String::new();
        for i in 0..40 {
            body.push_str(&format!("x = {};\n", i));
        }
        let source = format!("int x; int f() {{ {} return x; }}\n", body);
        let (mut vol, _) = parse_source(&source);

        let mut ast = AstFile::open(&mut vol, "t.ast").unwrap();
        let root = ast.node(&mut vol, ast.root_offset()).unwrap();
        // Root: [x, f].
        let all = ast.children_of(&mut vol, &root).unwrap();
        assert_eq!(all.len(), 2);
        let func = ast.node(&mut vol, all[1]).unwrap();
        let body = ast.node(&mut vol, func.children[1]).unwrap();
        assert!(body.flags.contains(NodeFlags::CONT));
        let stmts = ast.children_of(&mut vol, &body).unwrap();
        assert_eq!(stmts.len(), 41);
    }

    #[test]
    fn struct_bodies_parse_in_form() {
        let (_, stats) = parse_source(
            "struct point { int x; int y; };\n\
             int f() { return 0; }\n",
        );
        assert_eq!(stats.functions, 1);
    }

    #[test]
    fn ten_errors_abort() {
        let mut disk = RamDisk::new(8192);
        format(&mut disk, "TEST").unwrap();
        let mut vol = Volume::mount(disk).unwrap();
        vol.write_file("t.c", b"int f() { @ @ @ @ @ @ @ @ @ @ @ @ ; }\n")
            .unwrap();
        let mut diag = Diagnostics::new();
        // The stray characters are lexer errors; ten of them abort.
        assert!(lex(&mut vol, "t.c", "t.tok", &mut diag).is_err());
        assert_eq!(diag.error_count, MAX_ERRORS);
    }
}
