//! The AST node pool.
//!
//! Nodes are fixed-width records held in a per-compile [`NodePool`] and
//! addressed by [`NodeRef`] indices. Child slots are named; `next` links
//! sibling lists. Template bodies are deep-cloned into their own detached
//! pool so they can outlive the compile that parsed them.

use crate::lexer::Token;
use crate::source::SourceSpan;
use bitflags::bitflags;

/// Index of a node within a [`NodePool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(pub u32);

bitflags! {
    /// Modifier bits carried by a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u16 {
        const CONST      = 1 << 0;
        const STATIC     = 1 << 1;
        const PRIVATE    = 1 << 2;
        const ARRAY      = 1 << 3;
        const POINTER    = 1 << 4;
        const GETTER     = 1 << 5;
        const SETTER     = 1 << 6;
        /// Condition evaluated after the body (do-while)
        const DEFER_COND = 1 << 7;
        /// Node tree owned by a detached (template) pool
        const DETACHED   = 1 << 8;
        /// Declaration is exported from its module
        const EXPORTED   = 1 << 9;
        /// Loop variant: for-loop with init/step slots
        const FOR_LOOP   = 1 << 10;
    }
}

/// Node kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum NodeKind {
    Empty,
    Error,
    Root,
    Break,
    Catch,
    Class,
    Continue,
    Delete,
    Export,
    Expression,
    ExpressionSequence,
    FieldInit,
    Function,
    FunctionExpression,
    Identifier,
    If,
    Import,
    ImportSymbol,
    Literal,
    Loop,
    ObjectProperty,
    Parameter,
    Property,
    Return,
    ScopedBlock,
    Sizeof,
    Switch,
    SwitchCase,
    This,
    Throw,
    Try,
    TypeDef,
    TypeSpecifier,
    Variable,
}

/// Expression operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Operator {
    None,
    Add,
    AddEq,
    Sub,
    SubEq,
    Mul,
    MulEq,
    Div,
    DivEq,
    Mod,
    ModEq,
    Xor,
    XorEq,
    BitAnd,
    BitAndEq,
    BitOr,
    BitOrEq,
    BitInv,
    ShLeft,
    ShLeftEq,
    ShRight,
    ShRightEq,
    Not,
    Eq,
    NotEq,
    LogAnd,
    LogAndEq,
    LogOr,
    LogOrEq,
    Assign,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    PreInc,
    PostInc,
    PreDec,
    PostDec,
    Negate,
    Index,
    Conditional,
    Member,
    New,
    Call,
    Cast,
}

impl Operator {
    /// The assignment operator corresponding to a compound form, if any
    /// (`+=` yields `+`).
    pub fn base_of_compound(self) -> Option<Operator> {
        match self {
            Operator::AddEq => Some(Operator::Add),
            Operator::SubEq => Some(Operator::Sub),
            Operator::MulEq => Some(Operator::Mul),
            Operator::DivEq => Some(Operator::Div),
            Operator::ModEq => Some(Operator::Mod),
            Operator::XorEq => Some(Operator::Xor),
            Operator::BitAndEq => Some(Operator::BitAnd),
            Operator::BitOrEq => Some(Operator::BitOr),
            Operator::ShLeftEq => Some(Operator::ShLeft),
            Operator::ShRightEq => Some(Operator::ShRight),
            Operator::LogAndEq => Some(Operator::LogAnd),
            Operator::LogOrEq => Some(Operator::LogOr),
            _ => None,
        }
    }

    /// Source spelling used by diagnostics, overload lookup, and the
    /// canonical printer.
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Add => "+",
            Operator::AddEq => "+=",
            Operator::Sub => "-",
            Operator::SubEq => "-=",
            Operator::Mul => "*",
            Operator::MulEq => "*=",
            Operator::Div => "/",
            Operator::DivEq => "/=",
            Operator::Mod => "%",
            Operator::ModEq => "%=",
            Operator::Xor => "^",
            Operator::XorEq => "^=",
            Operator::BitAnd => "&",
            Operator::BitAndEq => "&=",
            Operator::BitOr => "|",
            Operator::BitOrEq => "|=",
            Operator::BitInv => "~",
            Operator::ShLeft => "<<",
            Operator::ShLeftEq => "<<=",
            Operator::ShRight => ">>",
            Operator::ShRightEq => ">>=",
            Operator::Not => "!",
            Operator::Eq => "==",
            Operator::NotEq => "!=",
            Operator::LogAnd => "&&",
            Operator::LogAndEq => "&&=",
            Operator::LogOr => "||",
            Operator::LogOrEq => "||=",
            Operator::Assign => "=",
            Operator::Less => "<",
            Operator::LessEq => "<=",
            Operator::Greater => ">",
            Operator::GreaterEq => ">=",
            Operator::PreInc | Operator::PostInc => "++",
            Operator::PreDec | Operator::PostDec => "--",
            Operator::Negate => "-",
            Operator::Index => "[]",
            Operator::Conditional => "?:",
            Operator::Member => ".",
            Operator::New => "new",
            Operator::Call => "()",
            Operator::Cast => "cast",
            Operator::None => "",
        }
    }
}

/// Literal classes. Sized integer classes come from numeric suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum LiteralKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    String,
    TemplateString,
    Array,
    Object,
    Null,
    True,
    False,
}

/// Literal payload
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum LiteralValue {
    None,
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Str(String),
}

/// One parse-tree node
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct Node {
    /// Kind tag
    pub kind: NodeKind,
    /// Originating token
    pub tok: Token,
    /// Operator for expression nodes
    pub op: Operator,
    /// Literal class for literal nodes
    pub lit_kind: Option<LiteralKind>,
    /// Literal payload for literal nodes
    pub lit_value: LiteralValue,
    /// Modifier bits
    pub flags: NodeFlags,
    /// Full source range of the node
    pub span: SourceSpan,

    // Child slots
    pub data_type: Option<NodeRef>,
    pub lvalue: Option<NodeRef>,
    pub rvalue: Option<NodeRef>,
    pub cond: Option<NodeRef>,
    pub body: Option<NodeRef>,
    pub else_body: Option<NodeRef>,
    pub initializer: Option<NodeRef>,
    pub parameters: Option<NodeRef>,
    pub template_parameters: Option<NodeRef>,
    pub modifier: Option<NodeRef>,
    pub alias: Option<NodeRef>,
    pub inheritance: Option<NodeRef>,
    /// Sibling link
    pub next: Option<NodeRef>,
}

impl Node {
    fn new(kind: NodeKind, tok: Token) -> Self {
        let span = tok.span;
        Node {
            kind,
            tok,
            op: Operator::None,
            lit_kind: None,
            lit_value: LiteralValue::None,
            flags: NodeFlags::empty(),
            span,
            data_type: None,
            lvalue: None,
            rvalue: None,
            cond: None,
            body: None,
            else_body: None,
            initializer: None,
            parameters: None,
            template_parameters: None,
            modifier: None,
            alias: None,
            inheritance: None,
            next: None,
        }
    }

    /// Identifier/keyword text of the originating token.
    pub fn text(&self) -> &str {
        &self.tok.lexeme
    }

    /// True for the `Error` sentinel.
    pub fn is_error(&self) -> bool {
        self.kind == NodeKind::Error
    }
}

/// A growable pool of AST nodes
#[derive(Debug, Default)]
pub struct NodePool {
    nodes: Vec<Node>,
}

impl NodePool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        NodePool::default()
    }

    /// Allocates a node and returns its reference.
    pub fn alloc(&mut self, kind: NodeKind, tok: Token) -> NodeRef {
        self.nodes.push(Node::new(kind, tok));
        NodeRef(self.nodes.len() as u32 - 1)
    }

    /// Shared access to a node.
    pub fn get(&self, r: NodeRef) -> &Node {
        &self.nodes[r.0 as usize]
    }

    /// Mutable access to a node.
    pub fn get_mut(&mut self, r: NodeRef) -> &mut Node {
        &mut self.nodes[r.0 as usize]
    }

    /// Number of nodes allocated.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no nodes have been allocated.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates a sibling list starting at `first`.
    pub fn siblings(&self, first: Option<NodeRef>) -> SiblingIter<'_> {
        SiblingIter { pool: self, cur: first }
    }

    /// Number of nodes in a sibling list.
    pub fn sibling_count(&self, first: Option<NodeRef>) -> usize {
        self.siblings(first).count()
    }

    /// Appends `node` to the sibling list rooted at `*slot`.
    pub fn append_sibling(&mut self, slot: &mut Option<NodeRef>, node: NodeRef) {
        match slot {
            None => *slot = Some(node),
            Some(first) => {
                let mut cur = *first;
                while let Some(next) = self.get(cur).next {
                    cur = next;
                }
                self.get_mut(cur).next = Some(node);
            }
        }
    }

    /// Deep-clones the subtree at `root` into `target`, marking the clone
    /// detached. Sibling links of `root` itself are not followed.
    pub fn clone_into(&self, root: NodeRef, target: &mut NodePool) -> NodeRef {
        let cloned = self.clone_rec(root, target, false);
        target.get_mut(cloned).flags |= NodeFlags::DETACHED;
        cloned
    }

    fn clone_rec(&self, r: NodeRef, target: &mut NodePool, follow_next: bool) -> NodeRef {
        let src = self.get(r).clone();
        let dst = target.alloc(src.kind, src.tok.clone());
        {
            let node = target.get_mut(dst);
            node.op = src.op;
            node.lit_kind = src.lit_kind;
            node.lit_value = src.lit_value.clone();
            node.flags = src.flags;
            node.span = src.span;
        }
        macro_rules! clone_slot {
            ($slot:ident, $follow:expr) => {
                if let Some(child) = src.$slot {
                    let c = self.clone_rec(child, target, $follow);
                    target.get_mut(dst).$slot = Some(c);
                }
            };
        }
        clone_slot!(data_type, true);
        clone_slot!(lvalue, true);
        clone_slot!(rvalue, true);
        clone_slot!(cond, true);
        clone_slot!(body, true);
        clone_slot!(else_body, true);
        clone_slot!(initializer, true);
        clone_slot!(parameters, true);
        clone_slot!(template_parameters, true);
        clone_slot!(modifier, true);
        clone_slot!(alias, true);
        clone_slot!(inheritance, true);
        if follow_next {
            clone_slot!(next, true);
        }
        dst
    }
}

/// Iterator over a `next`-linked sibling list
pub struct SiblingIter<'a> {
    pool: &'a NodePool,
    cur: Option<NodeRef>,
}

impl<'a> Iterator for SiblingIter<'a> {
    type Item = NodeRef;

    fn next(&mut self) -> Option<NodeRef> {
        let cur = self.cur?;
        self.cur = self.pool.get(cur).next;
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::TokenKind;

    fn tok(text: &str) -> Token {
        Token::new(TokenKind::Identifier, text.into(), SourceSpan::default())
    }

    #[test]
    fn test_sibling_append_and_iter() {
        let mut pool = NodePool::new();
        let a = pool.alloc(NodeKind::Identifier, tok("a"));
        let b = pool.alloc(NodeKind::Identifier, tok("b"));
        let c = pool.alloc(NodeKind::Identifier, tok("c"));
        let mut head = None;
        pool.append_sibling(&mut head, a);
        pool.append_sibling(&mut head, b);
        pool.append_sibling(&mut head, c);
        let names: Vec<&str> = pool.siblings(head).map(|r| pool.get(r).text()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_clone_into_detached() {
        let mut pool = NodePool::new();
        let child = pool.alloc(NodeKind::Identifier, tok("child"));
        let root = pool.alloc(NodeKind::Variable, tok("root"));
        pool.get_mut(root).lvalue = Some(child);

        let mut detached = NodePool::new();
        let cloned = pool.clone_into(root, &mut detached);
        assert!(detached.get(cloned).flags.contains(NodeFlags::DETACHED));
        let cl = detached.get(cloned).lvalue.unwrap();
        assert_eq!(detached.get(cl).text(), "child");
        // the original is untouched
        assert!(!pool.get(root).flags.contains(NodeFlags::DETACHED));
    }

    #[test]
    fn test_compound_operator_base() {
        assert_eq!(Operator::AddEq.base_of_compound(), Some(Operator::Add));
        assert_eq!(Operator::Assign.base_of_compound(), None);
    }
}
