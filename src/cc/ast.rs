//! AST node kinds and the on-disk node writer/reader.
//!
//! Nodes are serialized in post order: children are written before their
//! parent, so a parent embeds its children by absolute file offset. The
//! file header is at offset 0, which therefore doubles as "no node".
//!
//! A node holds at most [`AST_MAX_CHILDREN`](crate::mimi::AST_MAX_CHILDREN)
//! inline children. Longer sequences (block bodies, translation units) are
//! chained: a node carrying [`NodeFlags::CONT`] stores a continuation node
//! of the same kind in its final child slot.

use bitflags::bitflags;

use crate::common::{ErrorCode, Result};
use crate::endian::{U16, U32};
use crate::fs::{BlockDevice, Volume};
use crate::mimi::{AstHeader, AstNode, AST_MAX_CHILDREN};
use crate::pod::bytes_of;
use crate::stream::Stream;

/// An AST node kind, stored on disk as a `u8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    TranslationUnit = 1,
    /// `data` = name offset; children `[ParamList, Block]`.
    FuncDef = 2,
    ParamList = 3,
    /// `data` = name offset; children `[array size][initializer]` by flags.
    VarDecl = 4,
    /// A struct or union declaration, parsed in form only.
    RecordDecl = 5,
    EnumDecl = 6,

    Block = 10,
    /// Children `[cond, then]` or `[cond, then, else]`.
    If = 11,
    While = 12,
    /// Children `[body, cond]`.
    DoWhile = 13,
    /// Children `[init, cond, update, body]`; absent parts are offset 0.
    For = 14,
    Switch = 15,
    /// `data` = case value; child = labeled statement.
    Case = 16,
    Default = 17,
    /// Optional child = value expression.
    Return = 18,
    Break = 19,
    Continue = 20,
    /// `data` = label name offset.
    Goto = 21,
    /// `data` = label name offset; child = labeled statement.
    Label = 22,
    ExprStmt = 23,
    Empty = 24,

    /// `data` = assignment operator token kind; children `[lvalue, rhs]`.
    Assign = 30,
    /// `data` = operator token kind; children `[lhs, rhs]`.
    Binary = 31,
    /// `data` = operator token kind; child = operand.
    Unary = 32,
    /// Postfix `++`/`--`; `data` = operator token kind.
    PostOp = 33,
    /// Children `[cond, then, else]`.
    Ternary = 34,
    /// Children `[callee, args...]`.
    Call = 35,
    /// Children `[base, index]`.
    Index = 36,
    /// `data` = member name offset; child = base.
    Member = 37,
    /// `data` = name offset.
    Ident = 38,
    /// `data` = folded value.
    IntLit = 39,
    CharLit = 40,
    /// `data` = string-table offset of the payload.
    StrLit = 41,
}

impl NodeKind {
    pub fn from_u8(raw: u8) -> Option<NodeKind> {
        use NodeKind::*;
        const KINDS: &[NodeKind] = &[
            TranslationUnit, FuncDef, ParamList, VarDecl, RecordDecl, EnumDecl, Block, If, While,
            DoWhile, For, Switch, Case, Default, Return, Break, Continue, Goto, Label, ExprStmt,
            Empty, Assign, Binary, Unary, PostOp, Ternary, Call, Index, Member, Ident, IntLit,
            CharLit, StrLit,
        ];
        KINDS.iter().copied().find(|&kind| kind as u8 == raw)
    }
}

bitflags! {
    /// Node flag bits. The meaning of the low bits depends on the kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        /// Declarations: low two bits are the pointer depth.
        const PTR_LO = 0x01;
        const PTR_HI = 0x02;
        /// Declarator had `[...]`; the element count is the first child.
        const ARRAY = 0x04;
        /// `static` storage class.
        const STATIC = 0x08;
        /// `extern` storage class.
        const EXTERN = 0x10;
        /// Declaration carries an initializer as its last child.
        const HAS_INIT = 0x20;
        /// `unsigned` type specifier.
        const UNSIGNED = 0x40;
        /// The final child slot holds a continuation node, not a child.
        const CONT = 0x80;
        /// `Member` access spelled `->` rather than `.`.
        const ARROW = 0x01;
        /// `ParamList` ended with `...`.
        const VARARGS = 0x02;
    }
}

impl NodeFlags {
    /// Pointer depth packed into the low bits of a declaration's flags.
    pub fn with_ptr_depth(self, depth: u32) -> NodeFlags {
        let clamped = depth.min(3) as u8;
        NodeFlags::from_bits_retain((self.bits() & !0x03) | clamped)
    }

    pub fn ptr_depth(self) -> u32 {
        (self.bits() & 0x03) as u32
    }
}

/// Appends serialized nodes to the AST file.
pub struct AstWriter {
    stream: Stream,
    node_count: u32,
}

impl AstWriter {
    /// Wrap a write stream positioned after the header placeholder.
    pub fn new(stream: Stream) -> Self {
        AstWriter {
            stream,
            node_count: 0,
        }
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Current file offset, where the next node will land.
    pub fn position(&self) -> u32 {
        self.stream.position()
    }

    /// Write one node and return its offset. Panics are avoided by
    /// chunking in [`AstWriter::emit_chain`]; direct callers stay within
    /// the inline limit.
    pub fn emit<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        kind: NodeKind,
        flags: NodeFlags,
        data: u32,
        children: &[u32],
    ) -> Result<u32> {
        if children.len() > AST_MAX_CHILDREN {
            return Err(ErrorCode::Toolarge);
        }
        let offset = self.stream.position();
        let node = AstNode {
            kind: kind as u8,
            flags: flags.bits(),
            child_count: U16::new(children.len() as u16),
            data: U32::new(data),
        };
        self.stream.write(vol, bytes_of(&node))?;
        for &child in children {
            self.stream.write(vol, &child.to_le_bytes())?;
        }
        self.node_count += 1;
        Ok(offset)
    }

    /// Write a node with an unbounded child list, chaining continuation
    /// nodes through the final child slot. Returns the head node's offset.
    pub fn emit_chain<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        kind: NodeKind,
        flags: NodeFlags,
        data: u32,
        children: &[u32],
    ) -> Result<u32> {
        if children.len() <= AST_MAX_CHILDREN {
            return self.emit(vol, kind, flags, data, children);
        }
        let head_len = AST_MAX_CHILDREN - 1;
        // Post-order: the continuation must exist before the head points
        // at it.
        let cont = self.emit_chain(vol, kind, flags, data, &children[head_len..])?;
        let mut inline: Vec<u32> = children[..head_len].to_vec();
        inline.push(cont);
        self.emit(vol, kind, flags | NodeFlags::CONT, data, &inline)
    }

    /// Hand the underlying stream back for the header patch.
    pub fn into_stream(self) -> Stream {
        self.stream
    }
}

/// A decoded node prefix plus its child offsets.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub flags: NodeFlags,
    pub data: u32,
    pub children: Vec<u32>,
}

/// Random-access reader over a serialized AST file.
///
/// Node reads seek the underlying stream; the AST never needs to fit in
/// RAM.
pub struct AstFile {
    stream: Stream,
    header: AstHeader,
}

impl AstFile {
    pub fn open<D: BlockDevice>(vol: &mut Volume<D>, path: &str) -> Result<AstFile> {
        let mut stream = Stream::open_read(vol, path)?;
        let mut raw = [0u8; core::mem::size_of::<AstHeader>()];
        if stream.read(vol, &mut raw)? != raw.len() {
            return Err(ErrorCode::Corrupt);
        }
        let header = match crate::pod::from_bytes::<AstHeader>(&raw) {
            Ok(header) => *header,
            Err(()) => return Err(ErrorCode::Corrupt),
        };
        Ok(AstFile { stream, header })
    }

    pub fn root_offset(&self) -> u32 {
        self.header.root_offset.get()
    }

    /// Read the node whose prefix is at `offset`.
    pub fn node<D: BlockDevice>(&mut self, vol: &mut Volume<D>, offset: u32) -> Result<Node> {
        if offset == 0 || offset >= self.header.string_offset.get() {
            return Err(ErrorCode::Corrupt);
        }
        self.stream.seek(vol, offset)?;
        let mut raw = [0u8; core::mem::size_of::<AstNode>()];
        if self.stream.read(vol, &mut raw)? != raw.len() {
            return Err(ErrorCode::Corrupt);
        }
        let prefix = match crate::pod::from_bytes::<AstNode>(&raw) {
            Ok(prefix) => *prefix,
            Err(()) => return Err(ErrorCode::Corrupt),
        };
        let kind = NodeKind::from_u8(prefix.kind).ok_or(ErrorCode::Corrupt)?;
        let count = prefix.child_count.get() as usize;
        if count > crate::mimi::AST_MAX_CHILDREN {
            return Err(ErrorCode::Corrupt);
        }
        let mut children = Vec::with_capacity(count);
        for _ in 0..count {
            let mut word = [0u8; 4];
            if self.stream.read(vol, &mut word)? != 4 {
                return Err(ErrorCode::Corrupt);
            }
            children.push(u32::from_le_bytes(word));
        }
        Ok(Node {
            kind,
            flags: NodeFlags::from_bits_retain(prefix.flags),
            data: prefix.data.get(),
            children,
        })
    }

    /// Read the full child list of a node, following continuation chains.
    pub fn children_of<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        node: &Node,
    ) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        let mut cur = node.clone();
        loop {
            if cur.flags.contains(NodeFlags::CONT) {
                let (inline, cont) = match cur.children.split_last() {
                    Some((&cont, inline)) => (inline.to_vec(), cont),
                    None => return Err(ErrorCode::Corrupt),
                };
                out.extend_from_slice(&inline);
                cur = self.node(vol, cont)?;
            } else {
                out.extend_from_slice(&cur.children);
                return Ok(out);
            }
        }
    }

    /// Read the NUL-terminated string at `offset` in the trailing table.
    pub fn string<D: BlockDevice>(&mut self, vol: &mut Volume<D>, offset: u32) -> Result<Vec<u8>> {
        if offset >= self.header.string_size.get() {
            return Err(ErrorCode::Corrupt);
        }
        self.stream
            .seek(vol, self.header.string_offset.get() + offset)?;
        let mut out = Vec::new();
        loop {
            match self.stream.getc(vol)? {
                Some(0) => return Ok(out),
                Some(byte) => out.push(byte),
                None => return Err(ErrorCode::Corrupt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ptr_depth_packing() {
        let flags = NodeFlags::ARRAY.with_ptr_depth(2);
        assert_eq!(flags.ptr_depth(), 2);
        assert!(flags.contains(NodeFlags::ARRAY));
        assert_eq!(NodeFlags::empty().with_ptr_depth(9).ptr_depth(), 3);
    }

    #[test]
    fn kinds_round_trip() {
        for raw in 0..60u8 {
            if let Some(kind) = NodeKind::from_u8(raw) {
                assert_eq!(kind as u8, raw);
            }
        }
        assert_eq!(NodeKind::from_u8(NodeKind::StrLit as u8), Some(NodeKind::StrLit));
    }
}
