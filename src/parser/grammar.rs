//! Recursive-descent grammar with transactional backtracking.
//!
//! Every production returns `Option<NodeRef>`: `None` means "did not
//! match" and guarantees the cursor and logger are back where they were.
//! Hard errors inside a matched production emit a diagnostic, produce an
//! `Error` node and recover to the next synchronization point, so one run
//! reports as many errors as possible.

use super::ast::{LiteralKind, LiteralValue, NodeFlags, NodeKind, NodePool, NodeRef, Operator};
use super::cursor::TokenCursor;
use crate::error::{Diagnostic, ErrorCode, Logger};
use crate::lexer::{Token, TokenKind};
use std::collections::HashSet;

/// A grammar production
pub type Rule = fn(&mut Parser) -> Option<NodeRef>;

/// Output of one parse: the root node, the pool that owns the tree, and
/// every diagnostic the run accumulated.
#[derive(Debug)]
pub struct ParseOutput {
    /// Root node (kind `Root`), body links the top-level statements
    pub root: NodeRef,
    /// Pool owning every node of the tree
    pub pool: NodePool,
    /// Diagnostics, committed transactions only
    pub diagnostics: Vec<Diagnostic>,
}

impl ParseOutput {
    /// True when no error-severity diagnostics were produced.
    pub fn is_clean(&self) -> bool {
        !self
            .diagnostics
            .iter()
            .any(|d| d.severity == crate::error::Severity::Error)
    }
}

/// The parser state: cursor, node pool, transactional logger, and the
/// type names the parser has seen (class/typedef/template parameters).
pub struct Parser {
    cursor: TokenCursor,
    pool: NodePool,
    logger: Logger,
    type_names: Vec<HashSet<String>>,
    module_path: String,
}

impl Parser {
    /// Creates a parser over a token stream.
    pub fn new(tokens: Vec<Token>, module_path: impl Into<String>) -> Self {
        Parser {
            cursor: TokenCursor::new(tokens),
            pool: NodePool::new(),
            logger: Logger::new(),
            type_names: vec![HashSet::new()],
            module_path: module_path.into(),
        }
    }

    /// Parses a whole program.
    pub fn parse(mut self) -> ParseOutput {
        let root_tok = self.cursor.get().clone();
        let root = self.pool.alloc(NodeKind::Root, root_tok);

        let mut body = None;
        while !self.cursor.at_end() {
            let before = self.cursor.position();
            match self.statement() {
                Some(node) => self.pool.append_sibling(&mut body, node),
                None => {
                    self.error(
                        ErrorCode::UnexpectedToken,
                        format!("Unexpected token '{}'", self.cursor.get()),
                    );
                    let err = self.error_node();
                    self.pool.append_sibling(&mut body, err);
                    self.find_recovery_token(true);
                }
            }
            // Always make progress, whatever the production did.
            if self.cursor.position() == before {
                self.cursor.consume();
            }
        }
        self.pool.get_mut(root).body = body;

        ParseOutput {
            root,
            pool: self.pool,
            diagnostics: self.logger.take(),
        }
    }

    // ------------------------------------------------------------------
    // Transactions & helpers
    // ------------------------------------------------------------------

    fn begin(&mut self) {
        self.cursor.begin();
        self.logger.begin();
    }

    fn commit(&mut self) {
        self.cursor.commit();
        self.logger.commit();
    }

    fn revert(&mut self) {
        self.cursor.revert();
        self.logger.revert();
    }

    /// Runs `f` in a transaction: committed on `Some`, reverted on `None`.
    fn tx(&mut self, f: impl FnOnce(&mut Self) -> Option<NodeRef>) -> Option<NodeRef> {
        self.begin();
        match f(self) {
            Some(n) => {
                self.commit();
                Some(n)
            }
            None => {
                self.revert();
                None
            }
        }
    }

    fn error(&mut self, code: ErrorCode, message: impl Into<String>) {
        let mut d = Diagnostic::error(code, message, self.cursor.span());
        d.module_path = self.module_path.clone();
        self.logger.submit(d);
    }

    /// Allocates the `Error` sentinel node at the current token.
    fn error_node(&mut self) -> NodeRef {
        let tok = self.cursor.get().clone();
        self.pool.alloc(NodeKind::Error, tok)
    }

    fn node(&mut self, kind: NodeKind) -> NodeRef {
        let tok = self.cursor.get().clone();
        self.pool.alloc(kind, tok)
    }

    fn node_at(&mut self, kind: NodeKind, tok: Token) -> NodeRef {
        self.pool.alloc(kind, tok)
    }

    fn is_symbol(&self, s: &str) -> bool {
        self.cursor.get().is_symbol(s)
    }

    fn is_keyword(&self, k: &str) -> bool {
        self.cursor.get().is_keyword(k)
    }

    fn eat_symbol(&mut self, s: &str) -> bool {
        if self.is_symbol(s) {
            self.cursor.consume();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, k: &str) -> bool {
        if self.is_keyword(k) {
            self.cursor.consume();
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, s: &str) -> bool {
        if self.eat_symbol(s) {
            true
        } else {
            self.error(ErrorCode::ExpectedChar, format!("Expected '{}'", s));
            false
        }
    }

    /// Optional statement terminator.
    fn eos(&mut self) {
        self.eat_symbol(";");
    }

    /// Mandatory statement terminator, with skip-ahead recovery.
    fn eos_required(&mut self) -> bool {
        if self.eat_symbol(";") {
            return true;
        }
        self.error(ErrorCode::ExpectedChar, "Expected ';'");
        self.find_recovery_token(true);
        false
    }

    /// Skips ahead to `;` (consumed when `consume_semicolon`), `}` (left in
    /// place), a statement keyword, or end of input.
    fn find_recovery_token(&mut self, consume_semicolon: bool) {
        const SYNC_KEYWORDS: &[&str] = &[
            "if", "while", "do", "for", "switch", "try", "return", "break", "continue", "delete",
            "throw", "let", "const", "function", "class", "type", "import", "export",
        ];
        while !self.cursor.at_end() {
            if self.is_symbol(";") {
                if consume_semicolon {
                    self.cursor.consume();
                }
                return;
            }
            if self.is_symbol("}") {
                return;
            }
            let t = self.cursor.get();
            if t.kind == TokenKind::Keyword && SYNC_KEYWORDS.contains(&t.lexeme.as_str()) {
                return;
            }
            self.cursor.consume();
        }
    }

    fn add_type_name(&mut self, name: &str) {
        if let Some(scope) = self.type_names.last_mut() {
            scope.insert(name.to_string());
        }
    }

    fn push_type_scope(&mut self) {
        self.type_names.push(HashSet::new());
    }

    fn pop_type_scope(&mut self) {
        self.type_names.pop();
    }

    /// True if the parser has seen `name` declared as a type.
    pub fn is_type_name(&self, name: &str) -> bool {
        self.type_names.iter().any(|s| s.contains(name))
    }

    // ------------------------------------------------------------------
    // Combinators
    // ------------------------------------------------------------------

    /// Greedy repetition: matches `rule` as long as it succeeds. Returns the
    /// head of the sibling chain, or `None` when nothing matched.
    fn array_of(&mut self, rule: Rule) -> Option<NodeRef> {
        let mut head = None;
        while let Some(n) = rule(self) {
            self.pool.append_sibling(&mut head, n);
        }
        head
    }

    /// Comma-separated list. A leading comma raises `before_err`; a comma
    /// not followed by an element raises `after_err`; both yield an `Error`
    /// node so the caller can continue.
    fn list_of(
        &mut self,
        rule: Rule,
        before_err: (ErrorCode, &str),
        after_err: (ErrorCode, &str),
    ) -> Option<NodeRef> {
        if self.is_symbol(",") {
            self.error(before_err.0, before_err.1);
            return Some(self.error_node());
        }
        let first = rule(self)?;
        let mut head = Some(first);
        while self.eat_symbol(",") {
            match rule(self) {
                Some(n) => self.pool.append_sibling(&mut head, n),
                None => {
                    self.error(after_err.0, after_err.1);
                    return Some(self.error_node());
                }
            }
        }
        head
    }

    /// First matching rule wins.
    fn one_of(&mut self, rules: &[Rule]) -> Option<NodeRef> {
        for rule in rules {
            if let Some(n) = rule(self) {
                return Some(n);
            }
        }
        None
    }

    /// All rules in sequence, chained as siblings; reverts wholesale if any
    /// member fails.
    fn all_of(&mut self, rules: &[Rule]) -> Option<NodeRef> {
        self.begin();
        let mut head = None;
        for rule in rules {
            match rule(self) {
                Some(n) => self.pool.append_sibling(&mut head, n),
                None => {
                    self.revert();
                    return None;
                }
            }
        }
        self.commit();
        head
    }

    // ------------------------------------------------------------------
    // Basic productions
    // ------------------------------------------------------------------

    fn identifier(&mut self) -> Option<NodeRef> {
        if self.cursor.get().kind != TokenKind::Identifier {
            return None;
        }
        let tok = self.cursor.get().clone();
        self.cursor.consume();
        Some(self.node_at(NodeKind::Identifier, tok))
    }

    /// `name`, `module.name`, optional `<args>` and `[]` suffix.
    fn type_specifier(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            let name = p.identifier()?;
            let name_tok = p.pool.get(name).tok.clone();
            let spec = p.node_at(NodeKind::TypeSpecifier, name_tok);
            p.pool.get_mut(spec).body = Some(name);

            // module-qualified name
            if p.is_symbol(".") {
                p.begin();
                p.cursor.consume();
                match p.identifier() {
                    Some(member) => {
                        p.commit();
                        let s = p.pool.get_mut(spec);
                        s.lvalue = s.body;
                        s.body = Some(member);
                        let member_tok = p.pool.get(member).tok.clone();
                        p.pool.get_mut(spec).tok = member_tok;
                    }
                    None => p.revert(),
                }
            }

            if p.is_symbol("<") {
                p.begin();
                p.cursor.consume();
                let args = p.list_of(
                    Parser::type_specifier,
                    (ErrorCode::ExpectedTemplateArg, "Expected template argument"),
                    (ErrorCode::ExpectedTemplateArg, "Expected template argument after ','"),
                );
                if args.is_some() && p.is_symbol(">") {
                    p.cursor.consume();
                    p.commit();
                    p.pool.get_mut(spec).template_parameters = args;
                } else if args.is_some() && p.is_symbol(">>") {
                    // `Box<Box<i32>>`: the shift token carries both closers
                    p.cursor.split_symbol_head();
                    p.commit();
                    p.pool.get_mut(spec).template_parameters = args;
                } else {
                    p.revert();
                }
            }

            if p.is_symbol("[") {
                p.begin();
                p.cursor.consume();
                if p.is_symbol("]") {
                    p.cursor.consume();
                    p.commit();
                    p.pool.get_mut(spec).flags |= NodeFlags::ARRAY;
                } else {
                    p.revert();
                }
            }

            Some(spec)
        })
    }

    /// `name` or `name: type`
    fn parameter(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            let name = p.identifier()?;
            let tok = p.pool.get(name).tok.clone();
            let param = p.node_at(NodeKind::Parameter, tok);
            p.pool.get_mut(param).lvalue = Some(name);
            if p.eat_symbol(":") {
                match p.type_specifier() {
                    Some(t) => p.pool.get_mut(param).data_type = Some(t),
                    None => {
                        p.error(ErrorCode::ExpectedTypeIdentifier, "Expected type identifier");
                        return Some(p.error_node());
                    }
                }
            }
            Some(param)
        })
    }

    /// `( a: T, b: U )`, possibly empty.
    fn parameter_list(&mut self) -> Option<NodeRef> {
        if !self.eat_symbol("(") {
            return None;
        }
        if self.eat_symbol(")") {
            return Some(self.node(NodeKind::Empty));
        }
        let params = self.list_of(
            Parser::parameter,
            (ErrorCode::ExpectedParameter, "Expected parameter"),
            (ErrorCode::ExpectedParameter, "Expected parameter after ','"),
        );
        match params {
            Some(list) => {
                self.expect_symbol(")");
                Some(list)
            }
            None => {
                self.error(ErrorCode::ExpectedParameter, "Expected parameter list");
                self.find_recovery_token(false);
                Some(self.error_node())
            }
        }
    }

    /// `<A, B>` at a declaration site.
    fn template_params(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.eat_symbol("<") {
                return None;
            }
            let params = p.list_of(
                Parser::identifier,
                (ErrorCode::ExpectedIdentifier, "Expected template parameter"),
                (ErrorCode::ExpectedIdentifier, "Expected template parameter after ','"),
            )?;
            if !p.eat_symbol(">") {
                return None;
            }
            for r in p.pool.siblings(Some(params)).collect::<Vec<_>>() {
                let name = p.pool.get(r).text().to_string();
                p.add_type_name(&name);
            }
            Some(params)
        })
    }

    // ------------------------------------------------------------------
    // Literals
    // ------------------------------------------------------------------

    fn number_literal(&mut self) -> Option<NodeRef> {
        if self.cursor.get().kind != TokenKind::Number {
            return None;
        }
        let tok = self.cursor.get().clone();
        self.cursor.consume();

        let suffix = if self.cursor.get().kind == TokenKind::NumberSuffix {
            let s = self.cursor.get().lexeme.to_ascii_lowercase();
            self.cursor.consume();
            Some(s)
        } else {
            None
        };

        let text = tok.lexeme.clone();
        let node = self.node_at(NodeKind::Literal, tok);
        let is_decimal = text.contains('.');

        let (kind, value) = if is_decimal {
            match text.trim_end_matches('.').parse::<f64>() {
                Ok(f) => (LiteralKind::F64, LiteralValue::Float(f)),
                Err(_) => {
                    self.error(ErrorCode::MalformedNumericConstant, "Malformed numerical constant");
                    (LiteralKind::F64, LiteralValue::Float(0.0))
                }
            }
        } else {
            match suffix.as_deref() {
                Some("b") => match text.parse::<i64>() {
                    Ok(v) => (LiteralKind::I8, LiteralValue::Signed(v)),
                    Err(_) => {
                        self.error(ErrorCode::MalformedNumericConstant, "Malformed numerical constant");
                        (LiteralKind::I8, LiteralValue::Signed(0))
                    }
                },
                Some("s") => match text.parse::<i64>() {
                    Ok(v) => (LiteralKind::I16, LiteralValue::Signed(v)),
                    Err(_) => {
                        self.error(ErrorCode::MalformedNumericConstant, "Malformed numerical constant");
                        (LiteralKind::I16, LiteralValue::Signed(0))
                    }
                },
                Some("ub") => (LiteralKind::U8, LiteralValue::Unsigned(text.parse().unwrap_or(0))),
                Some("us") => (LiteralKind::U16, LiteralValue::Unsigned(text.parse().unwrap_or(0))),
                Some("ul") => (LiteralKind::U32, LiteralValue::Unsigned(text.parse().unwrap_or(0))),
                Some("ull") => (LiteralKind::U64, LiteralValue::Unsigned(text.parse().unwrap_or(0))),
                _ => match text.parse::<i64>() {
                    Ok(v) if i32::try_from(v).is_ok() => (LiteralKind::I32, LiteralValue::Signed(v)),
                    Ok(v) => (LiteralKind::I64, LiteralValue::Signed(v)),
                    Err(_) => {
                        self.error(ErrorCode::MalformedNumericConstant, "Malformed numerical constant");
                        (LiteralKind::I32, LiteralValue::Signed(0))
                    }
                },
            }
        };

        let n = self.pool.get_mut(node);
        n.lit_kind = Some(kind);
        n.lit_value = value;
        Some(node)
    }

    fn string_literal(&mut self) -> Option<NodeRef> {
        let kind = self.cursor.get().kind;
        let lit_kind = match kind {
            TokenKind::String => LiteralKind::String,
            TokenKind::TemplateString => LiteralKind::TemplateString,
            _ => return None,
        };
        let tok = self.cursor.get().clone();
        self.cursor.consume();
        let text = tok.lexeme.clone();
        let node = self.node_at(NodeKind::Literal, tok);
        let n = self.pool.get_mut(node);
        n.lit_kind = Some(lit_kind);
        n.lit_value = LiteralValue::Str(text);
        Some(node)
    }

    fn array_literal(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.is_symbol("[") {
                return None;
            }
            let tok = p.cursor.get().clone();
            p.cursor.consume();
            let node = p.node_at(NodeKind::Literal, tok);
            p.pool.get_mut(node).lit_kind = Some(LiteralKind::Array);
            if p.eat_symbol("]") {
                return Some(node);
            }
            let elems = p.list_of(
                Parser::assignment_expression,
                (ErrorCode::ExpectedExpression, "Expected expression"),
                (ErrorCode::ExpectedExpression, "Expected expression after ','"),
            )?;
            if !p.eat_symbol("]") {
                return None;
            }
            p.pool.get_mut(node).body = Some(elems);
            Some(node)
        })
    }

    fn object_literal_property(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            let name = p.identifier()?;
            if !p.eat_symbol(":") {
                return None;
            }
            let value = p.assignment_expression()?;
            let tok = p.pool.get(name).tok.clone();
            let prop = p.node_at(NodeKind::ObjectProperty, tok);
            let n = p.pool.get_mut(prop);
            n.lvalue = Some(name);
            n.initializer = Some(value);
            Some(prop)
        })
    }

    fn object_literal(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.is_symbol("{") {
                return None;
            }
            let tok = p.cursor.get().clone();
            p.cursor.consume();
            let props = p.list_of(
                Parser::object_literal_property,
                (ErrorCode::ExpectedExpression, "Expected object literal property"),
                (ErrorCode::ExpectedExpression, "Expected object literal property after ','"),
            )?;
            if !p.eat_symbol("}") {
                return None;
            }
            let node = p.node_at(NodeKind::Literal, tok);
            let n = p.pool.get_mut(node);
            n.lit_kind = Some(LiteralKind::Object);
            n.body = Some(props);
            Some(node)
        })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn function_expression(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.is_keyword("function") {
                return None;
            }
            let tok = p.cursor.get().clone();
            p.cursor.consume();
            if !p.is_symbol("(") {
                return None;
            }
            let params = p.parameter_list()?;
            let node = p.node_at(NodeKind::FunctionExpression, tok);
            if p.eat_symbol(":") {
                let ret = p.type_specifier();
                p.pool.get_mut(node).data_type = ret;
            }
            let body = p.block()?;
            let n = p.pool.get_mut(node);
            n.parameters = Some(params);
            n.body = Some(body);
            Some(node)
        })
    }

    fn primary_expression(&mut self) -> Option<NodeRef> {
        if let Some(n) = self.number_literal() {
            return Some(n);
        }
        if let Some(n) = self.string_literal() {
            return Some(n);
        }

        let tok = self.cursor.get().clone();
        match tok.kind {
            TokenKind::Keyword => match tok.lexeme.as_str() {
                "this" => {
                    self.cursor.consume();
                    Some(self.node_at(NodeKind::This, tok))
                }
                "true" | "false" | "null" => {
                    self.cursor.consume();
                    let node = self.node_at(NodeKind::Literal, tok.clone());
                    self.pool.get_mut(node).lit_kind = Some(match tok.lexeme.as_str() {
                        "true" => LiteralKind::True,
                        "false" => LiteralKind::False,
                        _ => LiteralKind::Null,
                    });
                    Some(node)
                }
                "new" => {
                    self.cursor.consume();
                    let spec = match self.type_specifier() {
                        Some(s) => s,
                        None => {
                            self.error(ErrorCode::ExpectedTypeIdentifier, "Expected type identifier");
                            return Some(self.error_node());
                        }
                    };
                    let node = self.node_at(NodeKind::Expression, tok);
                    {
                        let n = self.pool.get_mut(node);
                        n.op = Operator::New;
                        n.data_type = Some(spec);
                    }
                    if self.eat_symbol("(") {
                        if !self.is_symbol(")") {
                            let args = self.list_of(
                                Parser::assignment_expression,
                                (ErrorCode::ExpectedExpression, "Expected expression"),
                                (ErrorCode::ExpectedExpression, "Expected expression after ','"),
                            );
                            self.pool.get_mut(node).parameters = args;
                        }
                        self.expect_symbol(")");
                    }
                    Some(node)
                }
                "sizeof" => {
                    self.cursor.consume();
                    self.expect_symbol("(");
                    let spec = match self.type_specifier() {
                        Some(s) => s,
                        None => {
                            self.error(ErrorCode::ExpectedTypeIdentifier, "Expected type identifier");
                            return Some(self.error_node());
                        }
                    };
                    self.expect_symbol(")");
                    let node = self.node_at(NodeKind::Sizeof, tok);
                    self.pool.get_mut(node).data_type = Some(spec);
                    Some(node)
                }
                "function" => self.function_expression(),
                _ => None,
            },
            TokenKind::Identifier => self.identifier(),
            TokenKind::Symbol => match tok.lexeme.as_str() {
                "(" => self.tx(|p| {
                    p.cursor.consume();
                    let inner = p.expression()?;
                    if !p.eat_symbol(")") {
                        return None;
                    }
                    Some(inner)
                }),
                "[" => self.array_literal(),
                "{" => self.object_literal(),
                _ => None,
            },
            _ => None,
        }
    }

    fn call_member_expression(&mut self) -> Option<NodeRef> {
        let mut base = self.primary_expression()?;
        loop {
            if self.is_symbol("(") {
                let tok = self.cursor.get().clone();
                self.cursor.consume();
                let args = if self.is_symbol(")") {
                    None
                } else {
                    self.list_of(
                        Parser::assignment_expression,
                        (ErrorCode::ExpectedExpression, "Expected expression"),
                        (ErrorCode::ExpectedExpression, "Expected expression after ','"),
                    )
                };
                self.expect_symbol(")");
                let call = self.node_at(NodeKind::Expression, tok);
                let n = self.pool.get_mut(call);
                n.op = Operator::Call;
                n.lvalue = Some(base);
                n.parameters = args;
                base = call;
            } else if self.is_symbol("[") {
                let tok = self.cursor.get().clone();
                self.cursor.consume();
                let index = match self.expression() {
                    Some(e) => e,
                    None => {
                        self.error(ErrorCode::ExpectedExpression, "Expected expression");
                        self.error_node()
                    }
                };
                self.expect_symbol("]");
                let node = self.node_at(NodeKind::Expression, tok);
                let n = self.pool.get_mut(node);
                n.op = Operator::Index;
                n.lvalue = Some(base);
                n.rvalue = Some(index);
                base = node;
            } else if self.is_symbol(".") {
                let tok = self.cursor.get().clone();
                self.cursor.consume();
                let member = match self.identifier() {
                    Some(m) => m,
                    None => {
                        self.error(ErrorCode::ExpectedIdentifier, "Expected identifier");
                        self.error_node()
                    }
                };
                let node = self.node_at(NodeKind::Expression, tok);
                let n = self.pool.get_mut(node);
                n.op = Operator::Member;
                n.lvalue = Some(base);
                n.rvalue = Some(member);
                base = node;
            } else {
                return Some(base);
            }
        }
    }

    fn postfix_expression(&mut self) -> Option<NodeRef> {
        let base = self.call_member_expression()?;
        if self.is_symbol("++") || self.is_symbol("--") {
            let tok = self.cursor.get().clone();
            let op = if tok.lexeme == "++" {
                Operator::PostInc
            } else {
                Operator::PostDec
            };
            self.cursor.consume();
            let node = self.node_at(NodeKind::Expression, tok);
            let n = self.pool.get_mut(node);
            n.op = op;
            n.lvalue = Some(base);
            return Some(node);
        }
        Some(base)
    }

    fn unary_expression(&mut self) -> Option<NodeRef> {
        let tok = self.cursor.get().clone();
        let op = if tok.kind == TokenKind::Symbol {
            match tok.lexeme.as_str() {
                "!" => Some(Operator::Not),
                "~" => Some(Operator::BitInv),
                "-" => Some(Operator::Negate),
                "++" => Some(Operator::PreInc),
                "--" => Some(Operator::PreDec),
                _ => None,
            }
        } else {
            None
        };
        match op {
            Some(op) => self.tx(|p| {
                p.cursor.consume();
                let operand = p.unary_expression()?;
                let node = p.node_at(NodeKind::Expression, tok);
                let n = p.pool.get_mut(node);
                n.op = op;
                n.lvalue = Some(operand);
                Some(node)
            }),
            None => self.postfix_expression(),
        }
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Parser) -> Option<NodeRef>,
        ops: &[(&str, Operator)],
    ) -> Option<NodeRef> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (sym, op) in ops {
                if self.is_symbol(sym) {
                    let tok = self.cursor.get().clone();
                    self.cursor.consume();
                    let rhs = match next(self) {
                        Some(r) => r,
                        None => {
                            self.error(ErrorCode::ExpectedExpression, "Expected expression");
                            self.error_node()
                        }
                    };
                    let node = self.node_at(NodeKind::Expression, tok);
                    let n = self.pool.get_mut(node);
                    n.op = *op;
                    n.lvalue = Some(lhs);
                    n.rvalue = Some(rhs);
                    lhs = node;
                    continue 'outer;
                }
            }
            return Some(lhs);
        }
    }

    fn multiplicative_expression(&mut self) -> Option<NodeRef> {
        self.binary_level(
            Parser::unary_expression,
            &[("*", Operator::Mul), ("/", Operator::Div), ("%", Operator::Mod)],
        )
    }

    fn additive_expression(&mut self) -> Option<NodeRef> {
        self.binary_level(
            Parser::multiplicative_expression,
            &[("+", Operator::Add), ("-", Operator::Sub)],
        )
    }

    fn shift_expression(&mut self) -> Option<NodeRef> {
        self.binary_level(
            Parser::additive_expression,
            &[("<<", Operator::ShLeft), (">>", Operator::ShRight)],
        )
    }

    fn relational_expression(&mut self) -> Option<NodeRef> {
        self.binary_level(
            Parser::shift_expression,
            &[
                ("<=", Operator::LessEq),
                (">=", Operator::GreaterEq),
                ("<", Operator::Less),
                (">", Operator::Greater),
            ],
        )
    }

    fn equality_expression(&mut self) -> Option<NodeRef> {
        self.binary_level(
            Parser::relational_expression,
            &[("==", Operator::Eq), ("!=", Operator::NotEq)],
        )
    }

    fn bitwise_and_expression(&mut self) -> Option<NodeRef> {
        self.binary_level(Parser::equality_expression, &[("&", Operator::BitAnd)])
    }

    fn xor_expression(&mut self) -> Option<NodeRef> {
        self.binary_level(Parser::bitwise_and_expression, &[("^", Operator::Xor)])
    }

    fn bitwise_or_expression(&mut self) -> Option<NodeRef> {
        self.binary_level(Parser::xor_expression, &[("|", Operator::BitOr)])
    }

    fn logical_and_expression(&mut self) -> Option<NodeRef> {
        self.binary_level(Parser::bitwise_or_expression, &[("&&", Operator::LogAnd)])
    }

    fn logical_or_expression(&mut self) -> Option<NodeRef> {
        self.binary_level(Parser::logical_and_expression, &[("||", Operator::LogOr)])
    }

    fn conditional_expression(&mut self) -> Option<NodeRef> {
        let cond = self.logical_or_expression()?;
        if !self.is_symbol("?") {
            return Some(cond);
        }
        let tok = self.cursor.get().clone();
        self.cursor.consume();
        let then = match self.assignment_expression() {
            Some(t) => t,
            None => {
                self.error(ErrorCode::ExpectedExpression, "Expected expression");
                self.error_node()
            }
        };
        self.expect_symbol(":");
        let otherwise = match self.assignment_expression() {
            Some(e) => e,
            None => {
                self.error(ErrorCode::ExpectedExpression, "Expected expression");
                self.error_node()
            }
        };
        let node = self.node_at(NodeKind::Expression, tok);
        let n = self.pool.get_mut(node);
        n.op = Operator::Conditional;
        n.cond = Some(cond);
        n.lvalue = Some(then);
        n.rvalue = Some(otherwise);
        Some(node)
    }

    fn assignment_operator(&self) -> Option<Operator> {
        let t = self.cursor.get();
        if t.kind != TokenKind::Symbol {
            return None;
        }
        match t.lexeme.as_str() {
            "=" => Some(Operator::Assign),
            "+=" => Some(Operator::AddEq),
            "-=" => Some(Operator::SubEq),
            "*=" => Some(Operator::MulEq),
            "/=" => Some(Operator::DivEq),
            "%=" => Some(Operator::ModEq),
            "&=" => Some(Operator::BitAndEq),
            "|=" => Some(Operator::BitOrEq),
            "^=" => Some(Operator::XorEq),
            "<<=" => Some(Operator::ShLeftEq),
            ">>=" => Some(Operator::ShRightEq),
            "&&=" => Some(Operator::LogAndEq),
            "||=" => Some(Operator::LogOrEq),
        _ => None,
        }
    }

    fn assignment_expression(&mut self) -> Option<NodeRef> {
        let lhs = self.conditional_expression()?;
        let Some(op) = self.assignment_operator() else {
            return Some(lhs);
        };
        let tok = self.cursor.get().clone();
        self.cursor.consume();
        let rhs = match self.assignment_expression() {
            Some(r) => r,
            None => {
                self.error(ErrorCode::ExpectedExpression, "Expected expression");
                self.error_node()
            }
        };
        let node = self.node_at(NodeKind::Expression, tok);
        let n = self.pool.get_mut(node);
        n.op = op;
        n.lvalue = Some(lhs);
        n.rvalue = Some(rhs);
        Some(node)
    }

    /// Comma-sequenced expression.
    fn expression(&mut self) -> Option<NodeRef> {
        let first = self.assignment_expression()?;
        if !self.is_symbol(",") {
            return Some(first);
        }
        let tok = self.pool.get(first).tok.clone();
        let seq = self.node_at(NodeKind::ExpressionSequence, tok);
        let mut head = Some(first);
        while self.eat_symbol(",") {
            match self.assignment_expression() {
                Some(n) => self.pool.append_sibling(&mut head, n),
                None => {
                    self.error(ErrorCode::ExpectedExpression, "Expected expression after ','");
                    let err = self.error_node();
                    self.pool.append_sibling(&mut head, err);
                    break;
                }
            }
        }
        self.pool.get_mut(seq).body = head;
        Some(seq)
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn variable_decl(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            let name = p.identifier()?;
            let tok = p.pool.get(name).tok.clone();
            let node = p.node_at(NodeKind::Variable, tok);
            p.pool.get_mut(node).lvalue = Some(name);
            if p.eat_symbol(":") {
                match p.type_specifier() {
                    Some(t) => p.pool.get_mut(node).data_type = Some(t),
                    None => {
                        p.error(ErrorCode::ExpectedTypeIdentifier, "Expected type identifier");
                        return Some(p.error_node());
                    }
                }
            }
            if p.eat_symbol("=") {
                match p.assignment_expression() {
                    Some(e) => p.pool.get_mut(node).initializer = Some(e),
                    None => {
                        p.error(ErrorCode::ExpectedExpression, "Expected expression");
                        return Some(p.error_node());
                    }
                }
            }
            Some(node)
        })
    }

    /// `let`/`const` declaration list, without the terminator.
    fn variable_decl_list(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            let is_const = if p.eat_keyword("const") {
                true
            } else if p.eat_keyword("let") {
                false
            } else {
                return None;
            };
            let is_static = p.eat_keyword("static");
            let list = match p.list_of(
                Parser::variable_decl,
                (ErrorCode::ExpectedVariableDecl, "Expected variable declaration"),
                (ErrorCode::ExpectedVariableDecl, "Expected variable declaration after ','"),
            ) {
                Some(l) => l,
                None => {
                    p.error(ErrorCode::ExpectedVariableDecl, "Expected variable declaration");
                    return Some(p.error_node());
                }
            };
            for r in p.pool.siblings(Some(list)).collect::<Vec<_>>() {
                let n = p.pool.get_mut(r);
                if is_const {
                    n.flags |= NodeFlags::CONST;
                }
                if is_static {
                    n.flags |= NodeFlags::STATIC;
                }
            }
            Some(list)
        })
    }

    fn variable_statement(&mut self) -> Option<NodeRef> {
        let list = self.variable_decl_list()?;
        self.eos_required();
        Some(list)
    }

    fn function_decl(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.eat_keyword("function") {
                return None;
            }
            let name = match p.identifier() {
                Some(n) => n,
                None => {
                    p.error(ErrorCode::ExpectedIdentifier, "Expected identifier");
                    return Some(p.error_node());
                }
            };
            let tok = p.pool.get(name).tok.clone();
            let node = p.node_at(NodeKind::Function, tok);
            p.pool.get_mut(node).lvalue = Some(name);

            p.push_type_scope();
            let tparams = p.template_params();
            p.pool.get_mut(node).template_parameters = tparams;

            let params = match p.parameter_list() {
                Some(ps) => ps,
                None => {
                    p.error(ErrorCode::ExpectedChar, "Expected '('");
                    p.pop_type_scope();
                    return Some(p.error_node());
                }
            };
            p.pool.get_mut(node).parameters = Some(params);

            if p.eat_symbol(":") {
                match p.type_specifier() {
                    Some(t) => p.pool.get_mut(node).data_type = Some(t),
                    None => p.error(ErrorCode::ExpectedTypeIdentifier, "Expected type identifier"),
                }
            }

            let body = match p.block() {
                Some(b) => b,
                None => {
                    p.error(ErrorCode::ExpectedFunctionBody, "Expected function body");
                    p.pop_type_scope();
                    return Some(p.error_node());
                }
            };
            p.pool.get_mut(node).body = Some(body);
            p.pop_type_scope();
            Some(node)
        })
    }

    fn field_init(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            let name = p.identifier()?;
            if !p.eat_symbol("(") {
                return None;
            }
            let tok = p.pool.get(name).tok.clone();
            let node = p.node_at(NodeKind::FieldInit, tok);
            p.pool.get_mut(node).lvalue = Some(name);
            if !p.is_symbol(")") {
                let args = p.list_of(
                    Parser::assignment_expression,
                    (ErrorCode::ExpectedExpression, "Expected expression"),
                    (ErrorCode::ExpectedExpression, "Expected expression after ','"),
                )?;
                p.pool.get_mut(node).parameters = Some(args);
            }
            if !p.eat_symbol(")") {
                return None;
            }
            Some(node)
        })
    }

    fn class_member(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if p.is_symbol("}") {
                return None;
            }
            let mut flags = NodeFlags::empty();
            if p.eat_keyword("private") {
                flags |= NodeFlags::PRIVATE;
            }
            if p.eat_keyword("static") {
                flags |= NodeFlags::STATIC;
            }

            let tok = p.cursor.get().clone();

            // constructor
            if p.eat_keyword("constructor") {
                let node = p.node_at(NodeKind::Function, tok);
                let params = p.parameter_list().unwrap_or_else(|| {
                    p.error(ErrorCode::ExpectedChar, "Expected '('");
                    p.error_node()
                });
                p.pool.get_mut(node).parameters = Some(params);
                if p.eat_symbol(":") {
                    let inits = p.list_of(
                        Parser::field_init,
                        (ErrorCode::ExpectedExpression, "Expected field initializer"),
                        (ErrorCode::ExpectedExpression, "Expected field initializer after ','"),
                    );
                    p.pool.get_mut(node).initializer = inits;
                }
                let body = p.block().unwrap_or_else(|| {
                    p.error(ErrorCode::ExpectedFunctionBody, "Expected function body");
                    p.error_node()
                });
                let n = p.pool.get_mut(node);
                n.body = Some(body);
                n.flags |= flags;
                return Some(node);
            }

            // destructor
            if p.eat_keyword("destructor") {
                let node = p.node_at(NodeKind::Function, tok);
                p.expect_symbol("(");
                p.expect_symbol(")");
                let body = p.block().unwrap_or_else(|| {
                    p.error(ErrorCode::ExpectedFunctionBody, "Expected function body");
                    p.error_node()
                });
                let n = p.pool.get_mut(node);
                n.body = Some(body);
                n.flags |= flags;
                return Some(node);
            }

            // getter / setter
            if p.is_keyword("get") || p.is_keyword("set") {
                let is_getter = p.is_keyword("get");
                p.cursor.consume();
                if let Some(name) = p.identifier() {
                    let name_tok = p.pool.get(name).tok.clone();
                    let node = p.node_at(NodeKind::Function, name_tok);
                    {
                        let n = p.pool.get_mut(node);
                        n.lvalue = Some(name);
                        n.flags |= flags
                            | if is_getter {
                                NodeFlags::GETTER
                            } else {
                                NodeFlags::SETTER
                            };
                    }
                    let params = p.parameter_list().unwrap_or_else(|| {
                        p.error(ErrorCode::ExpectedChar, "Expected '('");
                        p.error_node()
                    });
                    p.pool.get_mut(node).parameters = Some(params);
                    if p.eat_symbol(":") {
                        let ret = p.type_specifier();
                        p.pool.get_mut(node).data_type = ret;
                    }
                    let body = p.block().unwrap_or_else(|| {
                        p.error(ErrorCode::ExpectedFunctionBody, "Expected function body");
                        p.error_node()
                    });
                    p.pool.get_mut(node).body = Some(body);
                    return Some(node);
                }
                return None;
            }

            // operator overload: `operator <symbol>` or cast `operator <type>`
            if p.eat_keyword("operator") {
                let node = p.node_at(NodeKind::Function, tok);
                p.pool.get_mut(node).flags |= flags;

                let op_tok = p.cursor.get().clone();
                let op = if op_tok.kind == TokenKind::Symbol {
                    let mapped = match op_tok.lexeme.as_str() {
                        "+" => Some(Operator::Add),
                        "-" => Some(Operator::Sub),
                        "*" => Some(Operator::Mul),
                        "/" => Some(Operator::Div),
                        "%" => Some(Operator::Mod),
                        "==" => Some(Operator::Eq),
                        "!=" => Some(Operator::NotEq),
                        "<" => Some(Operator::Less),
                        "<=" => Some(Operator::LessEq),
                        ">" => Some(Operator::Greater),
                        ">=" => Some(Operator::GreaterEq),
                        "[" => Some(Operator::Index),
                        "=" => Some(Operator::Assign),
                        _ => None,
                    };
                    if mapped == Some(Operator::Index) {
                        p.cursor.consume();
                        if !p.eat_symbol("]") {
                            p.error(ErrorCode::ExpectedChar, "Expected ']'");
                        }
                    } else if mapped.is_some() {
                        p.cursor.consume();
                    }
                    mapped
                } else {
                    None
                };

                match op {
                    Some(op) => p.pool.get_mut(node).op = op,
                    None => match p.type_specifier() {
                        Some(spec) => {
                            let n = p.pool.get_mut(node);
                            n.op = Operator::Cast;
                            n.data_type = Some(spec);
                        }
                        None => {
                            p.error(ErrorCode::ExpectedOperator, "Expected operator");
                            return Some(p.error_node());
                        }
                    },
                }

                let params = p.parameter_list().unwrap_or_else(|| {
                    p.error(ErrorCode::ExpectedChar, "Expected '('");
                    p.error_node()
                });
                p.pool.get_mut(node).parameters = Some(params);
                if p.pool.get(node).op != Operator::Cast && p.eat_symbol(":") {
                    let ret = p.type_specifier();
                    p.pool.get_mut(node).data_type = ret;
                }
                let body = p.block().unwrap_or_else(|| {
                    p.error(ErrorCode::ExpectedFunctionBody, "Expected function body");
                    p.error_node()
                });
                p.pool.get_mut(node).body = Some(body);
                return Some(node);
            }

            // method or property
            let name = p.identifier()?;
            let name_tok = p.pool.get(name).tok.clone();

            if p.is_symbol("(") {
                let node = p.node_at(NodeKind::Function, name_tok);
                {
                    let n = p.pool.get_mut(node);
                    n.lvalue = Some(name);
                    n.flags |= flags;
                }
                let params = p.parameter_list().unwrap_or_else(|| p.error_node());
                p.pool.get_mut(node).parameters = Some(params);
                if p.eat_symbol(":") {
                    let ret = p.type_specifier();
                    p.pool.get_mut(node).data_type = ret;
                }
                let body = p.block().unwrap_or_else(|| {
                    p.error(ErrorCode::ExpectedFunctionBody, "Expected function body");
                    p.error_node()
                });
                p.pool.get_mut(node).body = Some(body);
                return Some(node);
            }

            if p.eat_symbol(":") {
                let node = p.node_at(NodeKind::Property, name_tok);
                {
                    let n = p.pool.get_mut(node);
                    n.lvalue = Some(name);
                    n.flags |= flags;
                }
                match p.type_specifier() {
                    Some(t) => p.pool.get_mut(node).data_type = Some(t),
                    None => {
                        p.error(ErrorCode::ExpectedTypeIdentifier, "Expected type identifier");
                        return Some(p.error_node());
                    }
                }
                p.eos_required();
                return Some(node);
            }

            None
        })
    }

    fn class_def(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.eat_keyword("class") {
                return None;
            }
            let name = match p.identifier() {
                Some(n) => n,
                None => {
                    p.error(ErrorCode::ExpectedIdentifier, "Expected identifier");
                    return Some(p.error_node());
                }
            };
            let class_name = p.pool.get(name).text().to_string();
            p.add_type_name(&class_name);

            let tok = p.pool.get(name).tok.clone();
            let node = p.node_at(NodeKind::Class, tok);
            p.pool.get_mut(node).lvalue = Some(name);

            p.push_type_scope();
            let tparams = p.template_params();
            p.pool.get_mut(node).template_parameters = tparams;

            if p.eat_keyword("extends") {
                let bases = p.list_of(
                    Parser::type_specifier,
                    (ErrorCode::ExpectedTypeIdentifier, "Expected type identifier"),
                    (ErrorCode::ExpectedTypeIdentifier, "Expected type identifier after ','"),
                );
                p.pool.get_mut(node).inheritance = bases;
            }

            if !p.expect_symbol("{") {
                p.pop_type_scope();
                return Some(p.error_node());
            }

            let mut members = None;
            while !p.cursor.at_end() && !p.is_symbol("}") {
                let before = p.cursor.position();
                match p.class_member() {
                    Some(m) => p.pool.append_sibling(&mut members, m),
                    None => {
                        p.error(ErrorCode::ExpectedClassMember, "Expected class property or method");
                        let err = p.error_node();
                        p.pool.append_sibling(&mut members, err);
                        p.find_recovery_token(true);
                    }
                }
                if p.cursor.position() == before {
                    p.cursor.consume();
                }
            }
            p.expect_symbol("}");
            p.pool.get_mut(node).body = members;
            p.pop_type_scope();
            p.eos();
            Some(node)
        })
    }

    fn type_def(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.eat_keyword("type") {
                return None;
            }
            let name = match p.identifier() {
                Some(n) => n,
                None => {
                    p.error(ErrorCode::ExpectedIdentifier, "Expected identifier");
                    return Some(p.error_node());
                }
            };
            let type_name = p.pool.get(name).text().to_string();
            p.add_type_name(&type_name);
            let tok = p.pool.get(name).tok.clone();
            let node = p.node_at(NodeKind::TypeDef, tok);
            p.pool.get_mut(node).lvalue = Some(name);

            p.push_type_scope();
            let tparams = p.template_params();
            p.pool.get_mut(node).template_parameters = tparams;

            if !p.expect_symbol("=") {
                p.pop_type_scope();
                return Some(p.error_node());
            }
            match p.type_specifier() {
                Some(t) => p.pool.get_mut(node).data_type = Some(t),
                None => {
                    p.error(ErrorCode::ExpectedTypeIdentifier, "Expected type identifier");
                    p.pop_type_scope();
                    return Some(p.error_node());
                }
            }
            p.pop_type_scope();
            p.eos_required();
            Some(node)
        })
    }

    // ------------------------------------------------------------------
    // Imports & exports
    // ------------------------------------------------------------------

    fn import_symbol(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            let name = p.identifier()?;
            let tok = p.pool.get(name).tok.clone();
            let node = p.node_at(NodeKind::ImportSymbol, tok);
            p.pool.get_mut(node).lvalue = Some(name);
            if p.eat_keyword("as") {
                match p.identifier() {
                    Some(alias) => p.pool.get_mut(node).alias = Some(alias),
                    None => {
                        p.error(ErrorCode::ExpectedIdentifier, "Expected identifier");
                        return Some(p.error_node());
                    }
                }
            }
            Some(node)
        })
    }

    fn import_statement(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.eat_keyword("import") {
                return None;
            }
            let tok = p.cursor.prev().clone();
            let node = p.node_at(NodeKind::Import, tok);

            if p.eat_symbol("{") {
                let symbols = p.list_of(
                    Parser::import_symbol,
                    (ErrorCode::ExpectedImportList, "Expected import list"),
                    (ErrorCode::ExpectedImportList, "Expected import symbol after ','"),
                );
                match symbols {
                    Some(list) => p.pool.get_mut(node).body = Some(list),
                    None => {
                        p.error(ErrorCode::ExpectedImportList, "Expected import path or import list");
                        return Some(p.error_node());
                    }
                }
                p.expect_symbol("}");
                if !p.eat_keyword("from") {
                    p.error(ErrorCode::ExpectedKeyword, "Expected keyword 'from'");
                    return Some(p.error_node());
                }
            } else if p.eat_symbol("*") {
                if !p.eat_keyword("as") {
                    p.error(ErrorCode::ExpectedKeyword, "Expected keyword 'as'");
                    return Some(p.error_node());
                }
                match p.identifier() {
                    Some(alias) => p.pool.get_mut(node).alias = Some(alias),
                    None => {
                        p.error(ErrorCode::ExpectedIdentifier, "Expected identifier");
                        return Some(p.error_node());
                    }
                }
                if !p.eat_keyword("from") {
                    p.error(ErrorCode::ExpectedKeyword, "Expected keyword 'from'");
                    return Some(p.error_node());
                }
            }

            match p.string_literal() {
                Some(path) => p.pool.get_mut(node).rvalue = Some(path),
                None => {
                    p.error(ErrorCode::ExpectedImportPath, "Expected import path");
                    return Some(p.error_node());
                }
            }
            p.eos_required();
            Some(node)
        })
    }

    fn export_statement(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.eat_keyword("export") {
                return None;
            }
            let tok = p.cursor.prev().clone();
            let decl = p.one_of(&[
                Parser::variable_statement,
                Parser::function_decl,
                Parser::class_def,
                Parser::type_def,
            ]);
            match decl {
                Some(d) => {
                    for r in p.pool.siblings(Some(d)).collect::<Vec<_>>() {
                        p.pool.get_mut(r).flags |= NodeFlags::EXPORTED;
                    }
                    let node = p.node_at(NodeKind::Export, tok);
                    p.pool.get_mut(node).body = Some(d);
                    Some(node)
                }
                None => {
                    p.error(ErrorCode::UnexpectedToken, "Expected declaration after 'export'");
                    Some(p.error_node())
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn block(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.is_symbol("{") {
                return None;
            }
            let tok = p.cursor.get().clone();
            p.cursor.consume();
            let node = p.node_at(NodeKind::ScopedBlock, tok);
            let mut body = None;
            while !p.cursor.at_end() && !p.is_symbol("}") {
                let before = p.cursor.position();
                match p.statement() {
                    Some(s) => p.pool.append_sibling(&mut body, s),
                    None => {
                        p.error(
                            ErrorCode::UnexpectedToken,
                            format!("Unexpected token '{}'", p.cursor.get()),
                        );
                        let err = p.error_node();
                        p.pool.append_sibling(&mut body, err);
                        p.find_recovery_token(true);
                    }
                }
                if p.cursor.position() == before {
                    p.cursor.consume();
                }
            }
            p.expect_symbol("}");
            p.pool.get_mut(node).body = body;
            Some(node)
        })
    }

    fn if_statement(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.eat_keyword("if") {
                return None;
            }
            let tok = p.cursor.prev().clone();
            let node = p.node_at(NodeKind::If, tok);
            p.expect_symbol("(");
            match p.expression() {
                Some(c) => p.pool.get_mut(node).cond = Some(c),
                None => {
                    p.error(ErrorCode::ExpectedExpression, "Expected expression");
                    let err = p.error_node();
                    p.pool.get_mut(node).cond = Some(err);
                }
            }
            p.expect_symbol(")");
            match p.statement() {
                Some(b) => p.pool.get_mut(node).body = Some(b),
                None => {
                    p.error(ErrorCode::UnexpectedToken, "Expected statement");
                    let err = p.error_node();
                    p.pool.get_mut(node).body = Some(err);
                }
            }
            if p.eat_keyword("else") {
                match p.statement() {
                    Some(e) => p.pool.get_mut(node).else_body = Some(e),
                    None => {
                        p.error(ErrorCode::UnexpectedToken, "Expected statement");
                        let err = p.error_node();
                        p.pool.get_mut(node).else_body = Some(err);
                    }
                }
            }
            Some(node)
        })
    }

    fn while_statement(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.eat_keyword("while") {
                return None;
            }
            let tok = p.cursor.prev().clone();
            let node = p.node_at(NodeKind::Loop, tok);
            p.expect_symbol("(");
            let cond = p.expression().unwrap_or_else(|| {
                p.error(ErrorCode::ExpectedExpression, "Expected expression");
                p.error_node()
            });
            p.expect_symbol(")");
            let body = p.statement().unwrap_or_else(|| {
                p.error(ErrorCode::UnexpectedToken, "Expected statement");
                p.error_node()
            });
            let n = p.pool.get_mut(node);
            n.cond = Some(cond);
            n.body = Some(body);
            Some(node)
        })
    }

    fn do_while_statement(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.eat_keyword("do") {
                return None;
            }
            let tok = p.cursor.prev().clone();
            let node = p.node_at(NodeKind::Loop, tok);
            let body = p.statement().unwrap_or_else(|| {
                p.error(ErrorCode::UnexpectedToken, "Expected statement");
                p.error_node()
            });
            if !p.eat_keyword("while") {
                p.error(ErrorCode::ExpectedKeyword, "Expected keyword 'while'");
                return Some(p.error_node());
            }
            p.expect_symbol("(");
            let cond = p.expression().unwrap_or_else(|| {
                p.error(ErrorCode::ExpectedExpression, "Expected expression");
                p.error_node()
            });
            p.expect_symbol(")");
            p.eos_required();
            let n = p.pool.get_mut(node);
            n.cond = Some(cond);
            n.body = Some(body);
            n.flags |= NodeFlags::DEFER_COND;
            Some(node)
        })
    }

    fn for_statement(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.eat_keyword("for") {
                return None;
            }
            let tok = p.cursor.prev().clone();
            let node = p.node_at(NodeKind::Loop, tok);
            p.pool.get_mut(node).flags |= NodeFlags::FOR_LOOP;
            p.expect_symbol("(");

            if !p.is_symbol(";") {
                let init = p
                    .variable_decl_list()
                    .or_else(|| p.expression());
                p.pool.get_mut(node).initializer = init;
            }
            p.expect_symbol(";");

            if !p.is_symbol(";") {
                let cond = p.expression();
                p.pool.get_mut(node).cond = cond;
            }
            p.expect_symbol(";");

            if !p.is_symbol(")") {
                let step = p.expression();
                p.pool.get_mut(node).modifier = step;
            }
            p.expect_symbol(")");

            let body = p.statement().unwrap_or_else(|| {
                p.error(ErrorCode::UnexpectedToken, "Expected statement");
                p.error_node()
            });
            p.pool.get_mut(node).body = Some(body);
            Some(node)
        })
    }

    fn switch_case(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            let tok = p.cursor.get().clone();
            let cond = if p.eat_keyword("case") {
                match p.expression() {
                    Some(c) => Some(c),
                    None => {
                        p.error(ErrorCode::ExpectedExpression, "Expected expression");
                        Some(p.error_node())
                    }
                }
            } else if p.eat_keyword("default") {
                None
            } else {
                return None;
            };
            p.expect_symbol(":");
            let node = p.node_at(NodeKind::SwitchCase, tok);
            p.pool.get_mut(node).cond = cond;
            let mut body = None;
            while !p.cursor.at_end()
                && !p.is_symbol("}")
                && !p.is_keyword("case")
                && !p.is_keyword("default")
            {
                let before = p.cursor.position();
                match p.statement() {
                    Some(s) => p.pool.append_sibling(&mut body, s),
                    None => break,
                }
                if p.cursor.position() == before {
                    break;
                }
            }
            p.pool.get_mut(node).body = body;
            Some(node)
        })
    }

    fn switch_statement(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.eat_keyword("switch") {
                return None;
            }
            let tok = p.cursor.prev().clone();
            let node = p.node_at(NodeKind::Switch, tok);
            p.expect_symbol("(");
            let cond = p.expression().unwrap_or_else(|| {
                p.error(ErrorCode::ExpectedExpression, "Expected expression");
                p.error_node()
            });
            p.pool.get_mut(node).cond = Some(cond);
            p.expect_symbol(")");
            p.expect_symbol("{");
            let mut cases = None;
            while !p.cursor.at_end() && !p.is_symbol("}") {
                let before = p.cursor.position();
                match p.switch_case() {
                    Some(c) => p.pool.append_sibling(&mut cases, c),
                    None => {
                        p.error(ErrorCode::ExpectedSwitchCase, "Expected 'case' or 'default'");
                        p.find_recovery_token(true);
                    }
                }
                if p.cursor.position() == before {
                    p.cursor.consume();
                }
            }
            p.expect_symbol("}");
            p.pool.get_mut(node).body = cases;
            Some(node)
        })
    }

    fn try_statement(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.eat_keyword("try") {
                return None;
            }
            let tok = p.cursor.prev().clone();
            let node = p.node_at(NodeKind::Try, tok);
            let body = p.statement().unwrap_or_else(|| {
                p.error(ErrorCode::UnexpectedToken, "Expected statement");
                p.error_node()
            });
            p.pool.get_mut(node).body = Some(body);

            if !p.eat_keyword("catch") {
                p.error(ErrorCode::ExpectedCatchBlock, "Expected 'catch' block");
                return Some(node);
            }
            let catch_tok = p.cursor.prev().clone();
            let catch = p.node_at(NodeKind::Catch, catch_tok);
            p.expect_symbol("(");
            match p.parameter() {
                Some(param) => p.pool.get_mut(catch).parameters = Some(param),
                None => p.error(ErrorCode::ExpectedParameter, "Expected parameter"),
            }
            p.expect_symbol(")");
            let catch_body = p.statement().unwrap_or_else(|| {
                p.error(ErrorCode::UnexpectedToken, "Expected statement");
                p.error_node()
            });
            p.pool.get_mut(catch).body = Some(catch_body);
            p.pool.get_mut(node).else_body = Some(catch);
            Some(node)
        })
    }

    fn return_statement(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.eat_keyword("return") {
                return None;
            }
            let tok = p.cursor.prev().clone();
            let node = p.node_at(NodeKind::Return, tok);
            if !p.is_symbol(";") {
                let value = p.expression();
                p.pool.get_mut(node).body = value;
            }
            p.eos_required();
            Some(node)
        })
    }

    fn simple_keyword_statement(&mut self, kw: &str, kind: NodeKind) -> Option<NodeRef> {
        if !self.eat_keyword(kw) {
            return None;
        }
        let tok = self.cursor.prev().clone();
        let node = self.node_at(kind, tok);
        self.eos_required();
        Some(node)
    }

    fn delete_statement(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.eat_keyword("delete") {
                return None;
            }
            let tok = p.cursor.prev().clone();
            let node = p.node_at(NodeKind::Delete, tok);
            match p.expression() {
                Some(e) => p.pool.get_mut(node).body = Some(e),
                None => {
                    p.error(ErrorCode::ExpectedExpression, "Expected expression");
                    return Some(p.error_node());
                }
            }
            p.eos_required();
            Some(node)
        })
    }

    fn throw_statement(&mut self) -> Option<NodeRef> {
        self.tx(|p| {
            if !p.eat_keyword("throw") {
                return None;
            }
            let tok = p.cursor.prev().clone();
            let node = p.node_at(NodeKind::Throw, tok);
            match p.expression() {
                Some(e) => p.pool.get_mut(node).body = Some(e),
                None => {
                    p.error(ErrorCode::ExpectedExpression, "Expected expression");
                    return Some(p.error_node());
                }
            }
            p.eos_required();
            Some(node)
        })
    }

    fn expression_statement(&mut self) -> Option<NodeRef> {
        let expr = self.expression()?;
        self.eos_required();
        Some(expr)
    }

    /// One statement, any kind.
    pub(crate) fn statement(&mut self) -> Option<NodeRef> {
        if self.is_symbol(";") {
            let node = self.node(NodeKind::Empty);
            self.cursor.consume();
            return Some(node);
        }
        if self.is_symbol("{") {
            return self.block();
        }

        let t = self.cursor.get();
        if t.kind == TokenKind::Keyword {
            let kw = t.lexeme.clone();
            return match kw.as_str() {
                "if" => self.if_statement(),
                "while" => self.while_statement(),
                "do" => self.do_while_statement(),
                "for" => self.for_statement(),
                "switch" => self.switch_statement(),
                "try" => self.try_statement(),
                "return" => self.return_statement(),
                "break" => self.simple_keyword_statement("break", NodeKind::Break),
                "continue" => self.simple_keyword_statement("continue", NodeKind::Continue),
                "delete" => self.delete_statement(),
                "throw" => self.throw_statement(),
                "let" | "const" => self.variable_statement(),
                "function" => self
                    .function_decl()
                    .or_else(|| self.expression_statement()),
                "class" => self.class_def(),
                "type" => self.type_def(),
                "import" => self.import_statement(),
                "export" => self.export_statement(),
                "this" | "new" | "sizeof" | "null" | "true" | "false" => {
                    self.expression_statement()
                }
                _ => {
                    self.error(
                        ErrorCode::UnexpectedKeyword,
                        format!("Unexpected keyword '{}'", kw),
                    );
                    let err = self.error_node();
                    self.find_recovery_token(true);
                    Some(err)
                }
            };
        }

        self.expression_statement()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::source::SourceBuffer;

    fn tokens(src: &str) -> Vec<Token> {
        let buf = SourceBuffer::new("t.gs", src);
        let (tokens, diags) = Lexer::new(&buf).tokenize();
        assert!(diags.is_empty(), "lexer complained: {:?}", diags);
        tokens
    }

    fn parser(src: &str) -> Parser {
        Parser::new(tokens(src), "t.gs")
    }

    fn parse(src: &str) -> ParseOutput {
        parser(src).parse()
    }

    fn top_kinds(out: &ParseOutput) -> Vec<NodeKind> {
        out.pool
            .siblings(out.pool.get(out.root).body)
            .map(|r| out.pool.get(r).kind)
            .collect()
    }

    #[test]
    fn test_array_of_reverts_cleanly() {
        // a number can never start an identifier; the combinator must
        // leave the cursor and the logger untouched
        let mut p = parser("5");
        let r = p.array_of(Parser::identifier);
        assert!(r.is_none());
        assert_eq!(p.cursor.get().lexeme, "5");
        assert_eq!(p.logger.committed_count(), 0);
        assert!(!p.logger.has_errors());
    }

    #[test]
    fn test_one_of_takes_first_match() {
        let mut p = parser("while (a) ;");
        let r = p.one_of(&[Parser::if_statement, Parser::while_statement]);
        let node = r.expect("while matched");
        assert_eq!(p.pool.get(node).kind, NodeKind::Loop);
    }

    #[test]
    fn test_all_of_reverts_wholesale() {
        let mut p = parser("a 5");
        let r = p.all_of(&[Parser::identifier, Parser::identifier]);
        assert!(r.is_none());
        assert_eq!(p.cursor.get().lexeme, "a");
    }

    #[test]
    fn test_variable_decl_shape() {
        let out = parse("let x: i32 = 5;");
        assert!(out.is_clean(), "{:?}", out.diagnostics);
        let var = out.pool.get(out.root).body.unwrap();
        let node = out.pool.get(var);
        assert_eq!(node.kind, NodeKind::Variable);
        assert_eq!(out.pool.get(node.lvalue.unwrap()).text(), "x");
        assert!(node.data_type.is_some());
        assert!(node.initializer.is_some());
        assert!(!node.flags.contains(NodeFlags::CONST));

        let out = parse("const y = 1;");
        let var = out.pool.get(out.root).body.unwrap();
        assert!(out.pool.get(var).flags.contains(NodeFlags::CONST));
    }

    #[test]
    fn test_decl_list_becomes_siblings() {
        let out = parse("let a = 1, b = 2;");
        assert!(out.is_clean());
        assert_eq!(top_kinds(&out), vec![NodeKind::Variable, NodeKind::Variable]);
    }

    #[test]
    fn test_function_decl_shape() {
        let out = parse("function add(a: i32, b: i32): i32 { return a + b; }");
        assert!(out.is_clean(), "{:?}", out.diagnostics);
        let f = out.pool.get(out.root).body.unwrap();
        let node = out.pool.get(f);
        assert_eq!(node.kind, NodeKind::Function);
        assert_eq!(out.pool.get(node.lvalue.unwrap()).text(), "add");
        assert_eq!(out.pool.sibling_count(node.parameters), 2);
        assert!(node.data_type.is_some());
    }

    #[test]
    fn test_class_members() {
        let out = parse(
            "class Point {\n\
                 x: f32;\n\
                 private y: f32;\n\
                 constructor(x: f32) : x(x) { }\n\
                 destructor() { }\n\
                 get len(): f32 { return 0.0; }\n\
                 set len(v: f32) { }\n\
                 operator+(o: Point): Point { return this; }\n\
                 scaled(f: f32): Point { return this; }\n\
             }",
        );
        assert!(out.is_clean(), "{:?}", out.diagnostics);
        let class = out.pool.get(out.root).body.unwrap();
        let node = out.pool.get(class);
        assert_eq!(node.kind, NodeKind::Class);
        let members: Vec<&crate::parser::ast::Node> = out
            .pool
            .siblings(node.body)
            .map(|r| out.pool.get(r))
            .collect();
        assert_eq!(members.len(), 8);
        assert_eq!(members[0].kind, NodeKind::Property);
        assert!(members[1].flags.contains(NodeFlags::PRIVATE));
        assert!(members[2].tok.is_keyword("constructor"));
        assert!(members[2].initializer.is_some());
        assert!(members[3].tok.is_keyword("destructor"));
        assert!(members[4].flags.contains(NodeFlags::GETTER));
        assert!(members[5].flags.contains(NodeFlags::SETTER));
        assert_eq!(members[6].op, Operator::Add);
        assert_eq!(members[7].kind, NodeKind::Function);
    }

    #[test]
    fn test_template_class_and_specialized_use() {
        let out = parse("class Box<T> { value: T; }\nlet b: Box<i32> = new Box<i32>();");
        assert!(out.is_clean(), "{:?}", out.diagnostics);
        let kinds = top_kinds(&out);
        assert_eq!(kinds, vec![NodeKind::Class, NodeKind::Variable]);
    }

    #[test]
    fn test_import_forms() {
        let out = parse(
            "import { a, b as c } from './util';\n\
             import * as util from './util';\n\
             import './side_effects';",
        );
        assert!(out.is_clean(), "{:?}", out.diagnostics);
        let tops: Vec<NodeRef> = out.pool.siblings(out.pool.get(out.root).body).collect();
        assert_eq!(tops.len(), 3);
        let first = out.pool.get(tops[0]);
        assert_eq!(out.pool.sibling_count(first.body), 2);
        let second = out.pool.get(tops[1]);
        assert!(second.alias.is_some());
        let third = out.pool.get(tops[2]);
        assert!(third.body.is_none() && third.alias.is_none());
    }

    #[test]
    fn test_do_while_sets_defer_cond() {
        let out = parse("do { } while (x < 10);");
        assert!(out.is_clean(), "{:?}", out.diagnostics);
        let l = out.pool.get(out.pool.get(out.root).body.unwrap());
        assert_eq!(l.kind, NodeKind::Loop);
        assert!(l.flags.contains(NodeFlags::DEFER_COND));
    }

    #[test]
    fn test_switch_cases() {
        let out = parse(
            "switch (x) {\n\
                 case 1: break;\n\
                 case 2: break;\n\
                 default: break;\n\
             }",
        );
        assert!(out.is_clean(), "{:?}", out.diagnostics);
        let s = out.pool.get(out.pool.get(out.root).body.unwrap());
        assert_eq!(s.kind, NodeKind::Switch);
        let cases: Vec<NodeRef> = out.pool.siblings(s.body).collect();
        assert_eq!(cases.len(), 3);
        assert!(out.pool.get(cases[2]).cond.is_none());
    }

    #[test]
    fn test_precedence() {
        let out = parse("let r = 1 + 2 * 3;");
        assert!(out.is_clean());
        let var = out.pool.get(out.pool.get(out.root).body.unwrap());
        let add = out.pool.get(var.initializer.unwrap());
        assert_eq!(add.op, Operator::Add);
        let mul = out.pool.get(add.rvalue.unwrap());
        assert_eq!(mul.op, Operator::Mul);
    }

    #[test]
    fn test_error_recovery_reports_and_continues() {
        let out = parse("let = 5;\nlet b = 6;");
        assert!(!out.is_clean());
        // the second declaration still parses
        assert!(top_kinds(&out).contains(&NodeKind::Variable));
    }

    #[test]
    fn test_sequence_expression() {
        let out = parse("a = 1, b = 2;");
        assert!(out.is_clean(), "{:?}", out.diagnostics);
        let seq = out.pool.get(out.pool.get(out.root).body.unwrap());
        assert_eq!(seq.kind, NodeKind::ExpressionSequence);
        assert_eq!(out.pool.sibling_count(seq.body), 2);
    }

    #[test]
    fn test_sizeof_and_new() {
        let out = parse("let s = sizeof(vec3f);\nlet v = new vec3f(1.0, 2.0, 3.0);");
        assert!(out.is_clean(), "{:?}", out.diagnostics);
    }

    #[test]
    fn test_try_catch_throw() {
        let out = parse("try { throw 5; } catch (e: i64) { }");
        assert!(out.is_clean(), "{:?}", out.diagnostics);
        let t = out.pool.get(out.pool.get(out.root).body.unwrap());
        assert_eq!(t.kind, NodeKind::Try);
        let catch = out.pool.get(t.else_body.unwrap());
        assert_eq!(catch.kind, NodeKind::Catch);
        assert!(catch.parameters.is_some());
    }
}
