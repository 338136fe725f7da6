//! Token kinds and the keyword table.
//!
//! The numeric values are part of the pass contract: the lexer writes them
//! as the `kind` field of [`crate::mimi::Tok`] records and the parser
//! reads them back, possibly on a different boot.

use bitflags::bitflags;

/// A token kind, stored on disk as a `u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TokKind {
    Eof = 0,

    // Literals. `value` holds the folded integer, the character code, or
    // a string-table offset.
    IntLit = 1,
    CharLit = 2,
    StrLit = 3,
    Ident = 4,

    // Keywords.
    KwVoid = 10,
    KwChar = 11,
    KwShort = 12,
    KwInt = 13,
    KwLong = 14,
    KwFloat = 15,
    KwDouble = 16,
    KwSigned = 17,
    KwUnsigned = 18,
    KwConst = 19,
    KwVolatile = 20,
    KwStatic = 21,
    KwExtern = 22,
    KwAuto = 23,
    KwRegister = 24,
    KwTypedef = 25,
    KwStruct = 26,
    KwUnion = 27,
    KwEnum = 28,
    KwIf = 29,
    KwElse = 30,
    KwWhile = 31,
    KwDo = 32,
    KwFor = 33,
    KwSwitch = 34,
    KwCase = 35,
    KwDefault = 36,
    KwReturn = 37,
    KwBreak = 38,
    KwContinue = 39,
    KwGoto = 40,
    KwSizeof = 41,

    // Punctuation.
    LParen = 60,
    RParen = 61,
    LBrace = 62,
    RBrace = 63,
    LBracket = 64,
    RBracket = 65,
    Semi = 66,
    Comma = 67,
    Colon = 68,
    Question = 69,

    // Operators.
    Plus = 80,
    Minus = 81,
    Star = 82,
    Slash = 83,
    Percent = 84,
    Amp = 85,
    Pipe = 86,
    Caret = 87,
    Tilde = 88,
    Bang = 89,
    Lt = 90,
    Gt = 91,
    Assign = 92,
    Dot = 93,
    PlusPlus = 94,
    MinusMinus = 95,
    Shl = 96,
    Shr = 97,
    Le = 98,
    Ge = 99,
    EqEq = 100,
    Ne = 101,
    AndAnd = 102,
    OrOr = 103,
    PlusAssign = 104,
    MinusAssign = 105,
    StarAssign = 106,
    SlashAssign = 107,
    PercentAssign = 108,
    AmpAssign = 109,
    PipeAssign = 110,
    CaretAssign = 111,
    ShlAssign = 112,
    ShrAssign = 113,
    Arrow = 114,
    Ellipsis = 115,

    // Preprocessor directives. The parser discards these.
    PpInclude = 140,
    PpDefine = 141,
    PpIfdef = 142,
    PpIfndef = 143,
    PpElse = 144,
    PpEndif = 145,
    PpPragma = 146,
}

bitflags! {
    /// Per-token flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TokFlags: u16 {
        /// Integer literal carried a `u`/`U` suffix.
        const UNSIGNED = 0x01;
        /// Integer literal carried an `l`/`L` suffix.
        const LONG = 0x02;
        /// `#include <...>` rather than `#include "..."`.
        const SYS_HEADER = 0x04;
    }
}

/// The reserved words, checked after an identifier is scanned.
pub const KEYWORDS: &[(&str, TokKind)] = &[
    ("auto", TokKind::KwAuto),
    ("break", TokKind::KwBreak),
    ("case", TokKind::KwCase),
    ("char", TokKind::KwChar),
    ("const", TokKind::KwConst),
    ("continue", TokKind::KwContinue),
    ("default", TokKind::KwDefault),
    ("do", TokKind::KwDo),
    ("double", TokKind::KwDouble),
    ("else", TokKind::KwElse),
    ("enum", TokKind::KwEnum),
    ("extern", TokKind::KwExtern),
    ("float", TokKind::KwFloat),
    ("for", TokKind::KwFor),
    ("goto", TokKind::KwGoto),
    ("if", TokKind::KwIf),
    ("int", TokKind::KwInt),
    ("long", TokKind::KwLong),
    ("register", TokKind::KwRegister),
    ("return", TokKind::KwReturn),
    ("short", TokKind::KwShort),
    ("signed", TokKind::KwSigned),
    ("sizeof", TokKind::KwSizeof),
    ("static", TokKind::KwStatic),
    ("struct", TokKind::KwStruct),
    ("switch", TokKind::KwSwitch),
    ("typedef", TokKind::KwTypedef),
    ("union", TokKind::KwUnion),
    ("unsigned", TokKind::KwUnsigned),
    ("void", TokKind::KwVoid),
    ("volatile", TokKind::KwVolatile),
    ("while", TokKind::KwWhile),
];

/// Look up a scanned identifier in the keyword table.
pub fn keyword(text: &[u8]) -> Option<TokKind> {
    KEYWORDS
        .iter()
        .find(|(word, _)| word.as_bytes() == text)
        .map(|&(_, kind)| kind)
}

impl TokKind {
    /// Decode a `u16` read from a token record.
    pub fn from_u16(raw: u16) -> Option<TokKind> {
        use TokKind::*;
        const KINDS: &[TokKind] = &[
            Eof, IntLit, CharLit, StrLit, Ident, KwVoid, KwChar, KwShort, KwInt, KwLong, KwFloat,
            KwDouble, KwSigned, KwUnsigned, KwConst, KwVolatile, KwStatic, KwExtern, KwAuto,
            KwRegister, KwTypedef, KwStruct, KwUnion, KwEnum, KwIf, KwElse, KwWhile, KwDo, KwFor,
            KwSwitch, KwCase, KwDefault, KwReturn, KwBreak, KwContinue, KwGoto, KwSizeof, LParen,
            RParen, LBrace, RBrace, LBracket, RBracket, Semi, Comma, Colon, Question, Plus, Minus,
            Star, Slash, Percent, Amp, Pipe, Caret, Tilde, Bang, Lt, Gt, Assign, Dot, PlusPlus,
            MinusMinus, Shl, Shr, Le, Ge, EqEq, Ne, AndAnd, OrOr, PlusAssign, MinusAssign,
            StarAssign, SlashAssign, PercentAssign, AmpAssign, PipeAssign, CaretAssign, ShlAssign,
            ShrAssign, Arrow, Ellipsis, PpInclude, PpDefine, PpIfdef, PpIfndef, PpElse, PpEndif,
            PpPragma,
        ];
        KINDS.iter().copied().find(|&kind| kind as u16 == raw)
    }

    /// True for the preprocessor-directive kinds.
    pub fn is_preprocessor(self) -> bool {
        (self as u16) >= TokKind::PpInclude as u16 && (self as u16) <= TokKind::PpPragma as u16
    }

    /// True for storage-class keywords.
    pub fn is_storage_class(self) -> bool {
        matches!(
            self,
            TokKind::KwStatic
                | TokKind::KwExtern
                | TokKind::KwAuto
                | TokKind::KwRegister
                | TokKind::KwTypedef
        )
    }

    /// True for type-specifier and qualifier keywords.
    pub fn is_type_specifier(self) -> bool {
        matches!(
            self,
            TokKind::KwVoid
                | TokKind::KwChar
                | TokKind::KwShort
                | TokKind::KwInt
                | TokKind::KwLong
                | TokKind::KwFloat
                | TokKind::KwDouble
                | TokKind::KwSigned
                | TokKind::KwUnsigned
                | TokKind::KwConst
                | TokKind::KwVolatile
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_resolve() {
        assert_eq!(keyword(b"while"), Some(TokKind::KwWhile));
        assert_eq!(keyword(b"main"), None);
    }

    #[test]
    fn kinds_round_trip() {
        for raw in 0..200u16 {
            if let Some(kind) = TokKind::from_u16(raw) {
                assert_eq!(kind as u16, raw);
            }
        }
        assert_eq!(TokKind::from_u16(TokKind::Ellipsis as u16), Some(TokKind::Ellipsis));
        assert_eq!(TokKind::from_u16(999), None);
    }
}
