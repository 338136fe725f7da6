//! Pass 1: source bytes to a token file.
//!
//! The lexer streams the source through a small buffer and appends 8-byte
//! token records to the `.tok` file as it goes, so the whole token stream
//! never sits in RAM. Identifier and string payloads go into a string
//! table that is deduplicated in memory and appended after the last token;
//! the 16-byte header is written twice, once as a placeholder and once
//! with the final counts after a seek back.

use indexmap::IndexMap;

use crate::cc::token::{keyword, TokFlags, TokKind};
use crate::cc::Diagnostics;
use crate::common::Result;
use crate::endian::{U16, U32};
use crate::fs::{BlockDevice, Volume};
use crate::mimi::{Tok, TokHeader};
use crate::pod::bytes_of;
use crate::stream::Stream;

/// Upper bound on the string table, matching the `u16`-indexable layouts
/// the rest of the toolchain assumes.
pub const STRING_TABLE_MAX: usize = 0x10000;

/// Counters reported by the lexer.
#[derive(Debug, Default, Clone)]
pub struct LexStats {
    pub tokens: u32,
    pub lines: u32,
    pub string_bytes: u32,
}

struct Lexer<'d> {
    input: Stream,
    output: Stream,
    diag: &'d mut Diagnostics,
    /// Pushed-back bytes, most recent last.
    pending: Vec<u8>,
    line: u32,
    col: u32,
    at_line_start: bool,
    token_count: u32,
    /// Interned strings: text -> offset of its NUL-terminated copy.
    strings: IndexMap<Vec<u8>, u32>,
    string_size: u32,
}

/// Run the lexer over `source_path`, writing `tok_path`.
pub fn lex<D: BlockDevice>(
    vol: &mut Volume<D>,
    source_path: &str,
    tok_path: &str,
    diag: &mut Diagnostics,
) -> Result<LexStats> {
    let input = Stream::open_read(vol, source_path)?;
    let mut output = Stream::open_write(vol, tok_path)?;

    // Placeholder header; patched after EOF.
    output.write(vol, &[0; core::mem::size_of::<TokHeader>()])?;

    let mut lexer = Lexer {
        input,
        output,
        diag,
        pending: Vec::new(),
        line: 1,
        col: 0,
        at_line_start: true,
        token_count: 0,
        strings: IndexMap::new(),
        string_size: 0,
    };

    let result = lexer.run(vol);

    let Lexer {
        input,
        mut output,
        token_count,
        strings,
        string_size,
        line,
        ..
    } = lexer;
    input.close(vol)?;
    result?;

    // Append the string table, then rewrite the header with real counts.
    let string_offset = output.position();
    for text in strings.keys() {
        output.write(vol, text)?;
        output.putc(vol, 0)?;
    }
    let header = TokHeader {
        token_count: U32::new(token_count),
        string_offset: U32::new(string_offset),
        string_size: U32::new(string_size),
        reserved: U32::new(0),
    };
    output.seek(vol, 0)?;
    output.write(vol, bytes_of(&header))?;
    output.close(vol)?;

    Ok(LexStats {
        tokens: token_count,
        lines: line,
        string_bytes: string_size,
    })
}

impl<'d> Lexer<'d> {
    fn getc<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<Option<u8>> {
        let byte = match self.pending.pop() {
            Some(byte) => Some(byte),
            None => self.input.getc(vol)?,
        };
        if let Some(byte) = byte {
            if byte == b'\n' {
                self.line += 1;
                self.col = 0;
            } else {
                self.col += 1;
            }
        }
        Ok(byte)
    }

    fn ungetc(&mut self, byte: u8) {
        // Column bookkeeping is approximate across pushback; diagnostics
        // only need the line.
        if byte == b'\n' {
            self.line -= 1;
        } else if self.col > 0 {
            self.col -= 1;
        }
        self.pending.push(byte);
    }

    /// Intern `text` and return its string-table offset.
    fn intern(&mut self, text: &[u8]) -> Result<u32> {
        if let Some(&offset) = self.strings.get(text) {
            return Ok(offset);
        }
        let offset = self.string_size;
        let next = offset as usize + text.len() + 1;
        if next > STRING_TABLE_MAX {
            // Best effort: record the overflow and alias the string to
            // offset 0 so lexing can continue.
            self.diag.error(self.line, "string table overflow")?;
            return Ok(0);
        }
        self.strings.insert(text.to_vec(), offset);
        self.string_size = next as u32;
        Ok(offset)
    }

    fn emit<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        kind: TokKind,
        flags: TokFlags,
        value: u32,
    ) -> Result<()> {
        let record = Tok {
            kind: U16::new(kind as u16),
            flags: U16::new(flags.bits()),
            value: U32::new(value),
        };
        self.output.write(vol, bytes_of(&record))?;
        self.token_count += 1;
        Ok(())
    }

    fn run<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<()> {
        while let Some(byte) = self.getc(vol)? {
            match byte {
                b' ' | b'\t' | b'\r' => {}
                b'\n' => {
                    self.at_line_start = true;
                }
                b'/' => match self.getc(vol)? {
                    Some(b'/') => self.skip_line(vol)?,
                    Some(b'*') => self.skip_block_comment(vol)?,
                    Some(b'=') => {
                        self.at_line_start = false;
                        self.emit(vol, TokKind::SlashAssign, TokFlags::empty(), 0)?;
                    }
                    next => {
                        self.at_line_start = false;
                        if let Some(next) = next {
                            self.ungetc(next);
                        }
                        self.emit(vol, TokKind::Slash, TokFlags::empty(), 0)?;
                    }
                },
                // `#` opens a directive only as the first non-blank byte of
                // a line; the directive consumes through end of line.
                b'#' if self.at_line_start => self.directive(vol)?,
                _ => {
                    self.at_line_start = false;
                    match byte {
                        b'0'..=b'9' => self.number(vol, byte)?,
                        b'\'' => self.char_literal(vol)?,
                        b'"' => self.string_literal(vol)?,
                        b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.ident(vol, byte)?,
                        _ => self.operator(vol, byte)?,
                    }
                }
            }
        }
        self.emit(vol, TokKind::Eof, TokFlags::empty(), 0)
    }

    fn skip_line<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<()> {
        while let Some(byte) = self.getc(vol)? {
            if byte == b'\n' {
                self.at_line_start = true;
                break;
            }
        }
        Ok(())
    }

    fn skip_block_comment<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<()> {
        // Two-character window for the closing `*/`.
        let mut prev = 0u8;
        while let Some(byte) = self.getc(vol)? {
            if prev == b'*' && byte == b'/' {
                return Ok(());
            }
            prev = byte;
        }
        self.diag.error(self.line, "unterminated block comment")?;
        Ok(())
    }

    fn number<D: BlockDevice>(&mut self, vol: &mut Volume<D>, first: u8) -> Result<()> {
        let mut value: u32 = 0;
        let mut next = self.getc(vol)?;
        if first == b'0' && matches!(next, Some(b'x') | Some(b'X')) {
            let mut digits = 0;
            loop {
                match self.getc(vol)? {
                    Some(byte) if byte.is_ascii_hexdigit() => {
                        let digit = (byte as char).to_digit(16).unwrap_or(0);
                        value = value.wrapping_mul(16).wrapping_add(digit);
                        digits += 1;
                    }
                    other => {
                        next = other;
                        break;
                    }
                }
            }
            if digits == 0 {
                self.diag.error(self.line, "hex literal with no digits")?;
            }
        } else if first == b'0' {
            // Octal, or a plain zero.
            while let Some(byte) = next {
                if (b'0'..=b'7').contains(&byte) {
                    value = value.wrapping_mul(8).wrapping_add((byte - b'0') as u32);
                    next = self.getc(vol)?;
                } else {
                    break;
                }
            }
        } else {
            value = (first - b'0') as u32;
            while let Some(byte) = next {
                if byte.is_ascii_digit() {
                    value = value.wrapping_mul(10).wrapping_add((byte - b'0') as u32);
                    next = self.getc(vol)?;
                } else {
                    break;
                }
            }
        }

        // Integer suffixes are scanned and recorded, nothing more.
        let mut flags = TokFlags::empty();
        while let Some(byte) = next {
            match byte {
                b'u' | b'U' => flags |= TokFlags::UNSIGNED,
                b'l' | b'L' => flags |= TokFlags::LONG,
                _ => break,
            }
            next = self.getc(vol)?;
        }
        if let Some(byte) = next {
            self.ungetc(byte);
        }
        self.emit(vol, TokKind::IntLit, flags, value)
    }

    fn escape(&mut self, byte: u8) -> u8 {
        match byte {
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'0' => 0,
            // Anything else after a backslash is taken literally.
            other => other,
        }
    }

    fn char_literal<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<()> {
        let value = match self.getc(vol)? {
            None | Some(b'\n') => {
                self.diag.error(self.line, "unterminated character literal")?;
                return Ok(());
            }
            Some(b'\\') => match self.getc(vol)? {
                Some(byte) => self.escape(byte),
                None => {
                    self.diag.error(self.line, "unterminated character literal")?;
                    return Ok(());
                }
            },
            Some(byte) => byte,
        };
        match self.getc(vol)? {
            Some(b'\'') => self.emit(vol, TokKind::CharLit, TokFlags::empty(), value as u32),
            _ => {
                self.diag.error(self.line, "unterminated character literal")?;
                Ok(())
            }
        }
    }

    fn string_literal<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<()> {
        let mut payload = Vec::new();
        loop {
            match self.getc(vol)? {
                None | Some(b'\n') => {
                    self.diag.error(self.line, "unterminated string literal")?;
                    return Ok(());
                }
                Some(b'"') => break,
                Some(b'\\') => match self.getc(vol)? {
                    Some(byte) => payload.push(self.escape(byte)),
                    None => {
                        self.diag.error(self.line, "unterminated string literal")?;
                        return Ok(());
                    }
                },
                Some(byte) => payload.push(byte),
            }
        }
        let offset = self.intern(&payload)?;
        self.emit(vol, TokKind::StrLit, TokFlags::empty(), offset)
    }

    fn ident<D: BlockDevice>(&mut self, vol: &mut Volume<D>, first: u8) -> Result<()> {
        let mut text = vec![first];
        loop {
            match self.getc(vol)? {
                Some(byte) if byte.is_ascii_alphanumeric() || byte == b'_' => text.push(byte),
                Some(byte) => {
                    self.ungetc(byte);
                    break;
                }
                None => break,
            }
        }
        match keyword(&text) {
            Some(kind) => self.emit(vol, kind, TokFlags::empty(), 0),
            None => {
                let offset = self.intern(&text)?;
                self.emit(vol, TokKind::Ident, TokFlags::empty(), offset)
            }
        }
    }

    fn directive<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<()> {
        // Skip spaces between `#` and the directive word.
        let mut byte = self.getc(vol)?;
        while matches!(byte, Some(b' ') | Some(b'\t')) {
            byte = self.getc(vol)?;
        }
        let mut word = Vec::new();
        while let Some(b) = byte {
            if b.is_ascii_alphabetic() {
                word.push(b);
                byte = self.getc(vol)?;
            } else {
                break;
            }
        }
        if let Some(b) = byte {
            self.ungetc(b);
        }

        let kind = match word.as_slice() {
            b"include" => TokKind::PpInclude,
            b"define" => TokKind::PpDefine,
            b"ifdef" => TokKind::PpIfdef,
            b"ifndef" => TokKind::PpIfndef,
            b"else" => TokKind::PpElse,
            b"endif" => TokKind::PpEndif,
            b"pragma" => TokKind::PpPragma,
            _ => {
                self.diag.error(self.line, "unknown preprocessor directive")?;
                return self.skip_line(vol);
            }
        };

        if kind == TokKind::PpInclude {
            let (name, system) = self.include_name(vol)?;
            let offset = self.intern(&name)?;
            let flags = if system {
                TokFlags::SYS_HEADER
            } else {
                TokFlags::empty()
            };
            self.emit(vol, kind, flags, offset)?;
        } else {
            self.emit(vol, kind, TokFlags::empty(), 0)?;
        }
        // Directives are line-oriented; the body is not tokenized.
        self.skip_line(vol)
    }

    fn include_name<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<(Vec<u8>, bool)> {
        let mut byte = self.getc(vol)?;
        while matches!(byte, Some(b' ') | Some(b'\t')) {
            byte = self.getc(vol)?;
        }
        let (close, system) = match byte {
            Some(b'<') => (b'>', true),
            Some(b'"') => (b'"', false),
            _ => {
                self.diag.error(self.line, "malformed #include")?;
                return Ok((Vec::new(), false));
            }
        };
        let mut name = Vec::new();
        loop {
            match self.getc(vol)? {
                Some(b) if b == close => break,
                Some(b'\n') | None => {
                    self.diag.error(self.line, "malformed #include")?;
                    break;
                }
                Some(b) => name.push(b),
            }
        }
        Ok((name, system))
    }

    fn operator<D: BlockDevice>(&mut self, vol: &mut Volume<D>, first: u8) -> Result<()> {
        use TokKind::*;
        let kind = match first {
            b'(' => LParen,
            b')' => RParen,
            b'{' => LBrace,
            b'}' => RBrace,
            b'[' => LBracket,
            b']' => RBracket,
            b';' => Semi,
            b',' => Comma,
            b':' => Colon,
            b'?' => Question,
            b'~' => Tilde,
            b'+' => match self.getc(vol)? {
                Some(b'+') => PlusPlus,
                Some(b'=') => PlusAssign,
                next => return self.emit_short(vol, Plus, next),
            },
            b'-' => match self.getc(vol)? {
                Some(b'-') => MinusMinus,
                Some(b'=') => MinusAssign,
                Some(b'>') => Arrow,
                next => return self.emit_short(vol, Minus, next),
            },
            b'*' => match self.getc(vol)? {
                Some(b'=') => StarAssign,
                next => return self.emit_short(vol, Star, next),
            },
            b'%' => match self.getc(vol)? {
                Some(b'=') => PercentAssign,
                next => return self.emit_short(vol, Percent, next),
            },
            b'&' => match self.getc(vol)? {
                Some(b'&') => AndAnd,
                Some(b'=') => AmpAssign,
                next => return self.emit_short(vol, Amp, next),
            },
            b'|' => match self.getc(vol)? {
                Some(b'|') => OrOr,
                Some(b'=') => PipeAssign,
                next => return self.emit_short(vol, Pipe, next),
            },
            b'^' => match self.getc(vol)? {
                Some(b'=') => CaretAssign,
                next => return self.emit_short(vol, Caret, next),
            },
            b'!' => match self.getc(vol)? {
                Some(b'=') => Ne,
                next => return self.emit_short(vol, Bang, next),
            },
            b'=' => match self.getc(vol)? {
                Some(b'=') => EqEq,
                next => return self.emit_short(vol, Assign, next),
            },
            b'<' => match self.getc(vol)? {
                Some(b'=') => Le,
                Some(b'<') => match self.getc(vol)? {
                    Some(b'=') => ShlAssign,
                    next => return self.emit_short(vol, Shl, next),
                },
                next => return self.emit_short(vol, Lt, next),
            },
            b'>' => match self.getc(vol)? {
                Some(b'=') => Ge,
                Some(b'>') => match self.getc(vol)? {
                    Some(b'=') => ShrAssign,
                    next => return self.emit_short(vol, Shr, next),
                },
                next => return self.emit_short(vol, Gt, next),
            },
            b'.' => match self.getc(vol)? {
                Some(b'.') => match self.getc(vol)? {
                    // Only three contiguous dots form an ellipsis.
                    Some(b'.') => Ellipsis,
                    next => {
                        if let Some(next) = next {
                            self.ungetc(next);
                        }
                        self.ungetc(b'.');
                        return self.emit(vol, Dot, TokFlags::empty(), 0);
                    }
                },
                next => return self.emit_short(vol, Dot, next),
            },
            other => {
                self.diag
                    .error(self.line, format!("stray character {:#04x}", other))?;
                return Ok(());
            }
        };
        self.emit(vol, kind, TokFlags::empty(), 0)
    }

    fn emit_short<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        kind: TokKind,
        lookahead: Option<u8>,
    ) -> Result<()> {
        if let Some(byte) = lookahead {
            self.ungetc(byte);
        }
        self.emit(vol, kind, TokFlags::empty(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{format, RamDisk};
    use crate::pod::Bytes;
    use crate::read::StringTable;

    fn lex_source(source: &str) -> (Vec<Tok>, Vec<u8>) {
        let mut disk = RamDisk::new(4096);
        format(&mut disk, "TEST").unwrap();
        let mut vol = Volume::mount(disk).unwrap();
        vol.write_file("t.c", source.as_bytes()).unwrap();
        let mut diag = Diagnostics::new();
        lex(&mut vol, "t.c", "t.tok", &mut diag).unwrap();
        assert!(diag.ok(), "lex errors: {:?}", diag.error_msg);

        let raw = vol.read_file("t.tok").unwrap();
        let mut bytes = Bytes(&raw);
        let header = *bytes.read::<TokHeader>().unwrap();
        let tokens = bytes
            .read_slice::<Tok>(header.token_count.get() as usize)
            .unwrap()
            .to_vec();
        let strings = raw[header.string_offset.get() as usize..].to_vec();
        assert_eq!(strings.len(), header.string_size.get() as usize);
        (tokens, strings)
    }

    fn kinds(tokens: &[Tok]) -> Vec<TokKind> {
        tokens
            .iter()
            .map(|t| TokKind::from_u16(t.kind.get()).unwrap())
            .collect()
    }

    #[test]
    fn return_42() {
        let (tokens, _) = lex_source("int main() { return 42; }\n");
        use TokKind::*;
        assert_eq!(
            kinds(&tokens),
            [KwInt, Ident, LParen, RParen, LBrace, KwReturn, IntLit, Semi, RBrace, Eof]
        );
        assert_eq!(tokens[6].value.get(), 42);
    }

    #[test]
    fn numeric_bases_and_suffixes() {
        let (tokens, _) = lex_source("0x2A 052 42 7u 9L\n");
        let values: Vec<u32> = tokens[..5].iter().map(|t| t.value.get()).collect();
        assert_eq!(values, [42, 42, 42, 7, 9]);
        assert_eq!(
            TokFlags::from_bits_truncate(tokens[3].flags.get()),
            TokFlags::UNSIGNED
        );
    }

    #[test]
    fn char_and_string_escapes() {
        let (tokens, strings) = lex_source("'\\n' \"a\\tb\"\n");
        assert_eq!(tokens[0].value.get(), b'\n' as u32);
        let table = StringTable { data: &strings };
        assert_eq!(table.get(tokens[1].value.get()), Some(&b"a\tb"[..]));
    }

    #[test]
    fn identifiers_are_interned_once() {
        let (tokens, _) = lex_source("abc xyz abc\n");
        assert_eq!(tokens[0].value.get(), tokens[2].value.get());
        assert_ne!(tokens[0].value.get(), tokens[1].value.get());
    }

    #[test]
    fn multi_character_operators() {
        let (tokens, _) = lex_source("a <<= b >> c != d ... e -> f\n");
        use TokKind::*;
        assert_eq!(
            kinds(&tokens),
            [Ident, ShlAssign, Ident, Shr, Ident, Ne, Ident, Ellipsis, Ident, Arrow, Ident, Eof]
        );
    }

    #[test]
    fn comments_are_skipped() {
        let (tokens, _) = lex_source("a // line\n/* block\nstill */ b\n");
        assert_eq!(kinds(&tokens), [TokKind::Ident, TokKind::Ident, TokKind::Eof]);
    }

    #[test]
    fn include_directive() {
        let (tokens, strings) = lex_source("#include <gpio.h>\nint x;\n");
        assert_eq!(kinds(&tokens)[0], TokKind::PpInclude);
        assert_eq!(
            TokFlags::from_bits_truncate(tokens[0].flags.get()),
            TokFlags::SYS_HEADER
        );
        let table = StringTable { data: &strings };
        assert_eq!(table.get(tokens[0].value.get()), Some(&b"gpio.h"[..]));
    }

    #[test]
    fn define_body_is_not_tokenized() {
        let (tokens, _) = lex_source("#define FOO 1\nint x;\n");
        use TokKind::*;
        assert_eq!(kinds(&tokens), [PpDefine, KwInt, Ident, Semi, Eof]);
    }

    #[test]
    fn ident_strings_are_nul_terminated() {
        let (tokens, strings) = lex_source("alpha beta\n");
        let table = StringTable { data: &strings };
        for tok in &tokens {
            if tok.kind.get() == TokKind::Ident as u16 {
                assert!(table.get(tok.value.get()).is_some());
            }
        }
    }
}
