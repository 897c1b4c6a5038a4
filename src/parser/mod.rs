//! Syntax analysis: tokens to an AST.

mod ast;
mod cursor;
mod grammar;
mod printer;

pub use ast::{
    LiteralKind, LiteralValue, Node, NodeFlags, NodeKind, NodePool, NodeRef, Operator, SiblingIter,
};
pub use cursor::TokenCursor;
pub use grammar::{ParseOutput, Parser, Rule};
pub use printer::{ast_eq, print_ast};
