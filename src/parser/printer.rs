//! Canonical AST serializer.
//!
//! Prints a parse tree back to source in a canonical form: every
//! subexpression parenthesized, one statement per line. For the grammar
//! subset with an unambiguous canonical form, `parse(print(ast))` is
//! structurally identical to `ast` (see [`ast_eq`]).

use super::ast::{LiteralKind, LiteralValue, NodeFlags, NodeKind, NodePool, NodeRef, Operator};

/// Prints the subtree at `root` as canonical source text.
pub fn print_ast(pool: &NodePool, root: NodeRef) -> String {
    let mut out = String::new();
    let node = pool.get(root);
    match node.kind {
        NodeKind::Root => {
            for stmt in pool.siblings(node.body) {
                print_statement(pool, stmt, 0, &mut out);
            }
        }
        _ => print_statement(pool, root, 0, &mut out),
    }
    out
}

fn indent(depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push_str("    ");
    }
}

fn print_statement(pool: &NodePool, r: NodeRef, depth: usize, out: &mut String) {
    let node = pool.get(r);
    match node.kind {
        NodeKind::Empty => {
            indent(depth, out);
            out.push_str(";\n");
        }
        NodeKind::Error => {
            indent(depth, out);
            out.push_str("/* error */;\n");
        }
        NodeKind::ScopedBlock => {
            indent(depth, out);
            out.push_str("{\n");
            for stmt in pool.siblings(node.body) {
                print_statement(pool, stmt, depth + 1, out);
            }
            indent(depth, out);
            out.push_str("}\n");
        }
        NodeKind::Variable => {
            indent(depth, out);
            if node.flags.contains(NodeFlags::CONST) {
                out.push_str("const ");
            } else {
                out.push_str("let ");
            }
            if node.flags.contains(NodeFlags::STATIC) {
                out.push_str("static ");
            }
            out.push_str(pool.get(node.lvalue.unwrap()).text());
            if let Some(tp) = node.data_type {
                out.push_str(": ");
                print_type(pool, tp, out);
            }
            if let Some(init) = node.initializer {
                out.push_str(" = ");
                print_expr(pool, init, out);
            }
            out.push_str(";\n");
        }
        NodeKind::Function => {
            indent(depth, out);
            out.push_str("function ");
            out.push_str(pool.get(node.lvalue.unwrap()).text());
            print_template_params(pool, node.template_parameters, out);
            print_params(pool, node.parameters, out);
            if let Some(ret) = node.data_type {
                out.push_str(": ");
                print_type(pool, ret, out);
            }
            out.push(' ');
            print_body_block(pool, node.body, depth, out);
        }
        NodeKind::Class => print_class(pool, r, depth, out),
        NodeKind::TypeDef => {
            indent(depth, out);
            out.push_str("type ");
            out.push_str(pool.get(node.lvalue.unwrap()).text());
            print_template_params(pool, node.template_parameters, out);
            out.push_str(" = ");
            print_type(pool, node.data_type.unwrap(), out);
            out.push_str(";\n");
        }
        NodeKind::If => {
            indent(depth, out);
            out.push_str("if (");
            print_expr(pool, node.cond.unwrap(), out);
            out.push_str(")\n");
            print_statement(pool, node.body.unwrap(), depth + 1, out);
            if let Some(else_body) = node.else_body {
                indent(depth, out);
                out.push_str("else\n");
                print_statement(pool, else_body, depth + 1, out);
            }
        }
        NodeKind::Loop => {
            indent(depth, out);
            if node.flags.contains(NodeFlags::FOR_LOOP) {
                out.push_str("for (");
                if let Some(init) = node.initializer {
                    if pool.get(init).kind == NodeKind::Variable {
                        print_for_init_decl(pool, init, out);
                    } else {
                        print_expr(pool, init, out);
                    }
                }
                out.push_str("; ");
                if let Some(cond) = node.cond {
                    print_expr(pool, cond, out);
                }
                out.push_str("; ");
                if let Some(step) = node.modifier {
                    print_expr(pool, step, out);
                }
                out.push_str(")\n");
                print_statement(pool, node.body.unwrap(), depth + 1, out);
            } else if node.flags.contains(NodeFlags::DEFER_COND) {
                out.push_str("do\n");
                print_statement(pool, node.body.unwrap(), depth + 1, out);
                indent(depth, out);
                out.push_str("while (");
                print_expr(pool, node.cond.unwrap(), out);
                out.push_str(");\n");
            } else {
                out.push_str("while (");
                print_expr(pool, node.cond.unwrap(), out);
                out.push_str(")\n");
                print_statement(pool, node.body.unwrap(), depth + 1, out);
            }
        }
        NodeKind::Switch => {
            indent(depth, out);
            out.push_str("switch (");
            print_expr(pool, node.cond.unwrap(), out);
            out.push_str(") {\n");
            for case in pool.siblings(node.body) {
                let c = pool.get(case);
                indent(depth + 1, out);
                match c.cond {
                    Some(v) => {
                        out.push_str("case ");
                        print_expr(pool, v, out);
                        out.push_str(":\n");
                    }
                    None => out.push_str("default:\n"),
                }
                for stmt in pool.siblings(c.body) {
                    print_statement(pool, stmt, depth + 2, out);
                }
            }
            indent(depth, out);
            out.push_str("}\n");
        }
        NodeKind::Try => {
            indent(depth, out);
            out.push_str("try\n");
            print_statement(pool, node.body.unwrap(), depth + 1, out);
            if let Some(catch) = node.else_body {
                let c = pool.get(catch);
                indent(depth, out);
                out.push_str("catch (");
                if let Some(param) = c.parameters {
                    print_param(pool, param, out);
                }
                out.push_str(")\n");
                print_statement(pool, c.body.unwrap(), depth + 1, out);
            }
        }
        NodeKind::Return => {
            indent(depth, out);
            out.push_str("return");
            if let Some(value) = node.body {
                out.push(' ');
                print_expr(pool, value, out);
            }
            out.push_str(";\n");
        }
        NodeKind::Break => {
            indent(depth, out);
            out.push_str("break;\n");
        }
        NodeKind::Continue => {
            indent(depth, out);
            out.push_str("continue;\n");
        }
        NodeKind::Delete => {
            indent(depth, out);
            out.push_str("delete ");
            print_expr(pool, node.body.unwrap(), out);
            out.push_str(";\n");
        }
        NodeKind::Throw => {
            indent(depth, out);
            out.push_str("throw ");
            print_expr(pool, node.body.unwrap(), out);
            out.push_str(";\n");
        }
        NodeKind::Import => {
            indent(depth, out);
            out.push_str("import ");
            if let Some(symbols) = node.body {
                out.push_str("{ ");
                let mut first = true;
                for sym in pool.siblings(Some(symbols)) {
                    if !first {
                        out.push_str(", ");
                    }
                    first = false;
                    let s = pool.get(sym);
                    out.push_str(pool.get(s.lvalue.unwrap()).text());
                    if let Some(alias) = s.alias {
                        out.push_str(" as ");
                        out.push_str(pool.get(alias).text());
                    }
                }
                out.push_str(" } from ");
            } else if let Some(alias) = node.alias {
                out.push_str("* as ");
                out.push_str(pool.get(alias).text());
                out.push_str(" from ");
            }
            print_expr(pool, node.rvalue.unwrap(), out);
            out.push_str(";\n");
        }
        NodeKind::Export => {
            indent(depth, out);
            out.push_str("export ");
            // the declaration renders with its own indentation; strip ours
            let mut inner = String::new();
            if let Some(decl) = node.body {
                print_statement(pool, decl, 0, &mut inner);
            }
            out.push_str(inner.trim_start());
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        _ => {
            indent(depth, out);
            print_expr(pool, r, out);
            out.push_str(";\n");
        }
    }
}

fn print_for_init_decl(pool: &NodePool, first: NodeRef, out: &mut String) {
    let node = pool.get(first);
    if node.flags.contains(NodeFlags::CONST) {
        out.push_str("const ");
    } else {
        out.push_str("let ");
    }
    let mut first_decl = true;
    for decl in pool.siblings(Some(first)) {
        if !first_decl {
            out.push_str(", ");
        }
        first_decl = false;
        let d = pool.get(decl);
        out.push_str(pool.get(d.lvalue.unwrap()).text());
        if let Some(tp) = d.data_type {
            out.push_str(": ");
            print_type(pool, tp, out);
        }
        if let Some(init) = d.initializer {
            out.push_str(" = ");
            print_expr(pool, init, out);
        }
    }
}

fn print_class(pool: &NodePool, r: NodeRef, depth: usize, out: &mut String) {
    let node = pool.get(r);
    indent(depth, out);
    out.push_str("class ");
    out.push_str(pool.get(node.lvalue.unwrap()).text());
    print_template_params(pool, node.template_parameters, out);
    if node.inheritance.is_some() {
        out.push_str(" extends ");
        let mut first = true;
        for base in pool.siblings(node.inheritance) {
            if !first {
                out.push_str(", ");
            }
            first = false;
            print_type(pool, base, out);
        }
    }
    out.push_str(" {\n");
    for member in pool.siblings(node.body) {
        let m = pool.get(member);
        indent(depth + 1, out);
        if m.flags.contains(NodeFlags::PRIVATE) {
            out.push_str("private ");
        }
        if m.flags.contains(NodeFlags::STATIC) {
            out.push_str("static ");
        }
        match m.kind {
            NodeKind::Property => {
                out.push_str(pool.get(m.lvalue.unwrap()).text());
                out.push_str(": ");
                print_type(pool, m.data_type.unwrap(), out);
                out.push_str(";\n");
            }
            NodeKind::Function => {
                if m.flags.contains(NodeFlags::GETTER) {
                    out.push_str("get ");
                    out.push_str(pool.get(m.lvalue.unwrap()).text());
                } else if m.flags.contains(NodeFlags::SETTER) {
                    out.push_str("set ");
                    out.push_str(pool.get(m.lvalue.unwrap()).text());
                } else if m.op == Operator::Cast {
                    out.push_str("operator ");
                    print_type(pool, m.data_type.unwrap(), out);
                } else if m.op != Operator::None {
                    out.push_str("operator ");
                    out.push_str(m.op.symbol());
                } else if let Some(name) = m.lvalue {
                    out.push_str(pool.get(name).text());
                } else if m.tok.is_keyword("constructor") {
                    out.push_str("constructor");
                } else {
                    out.push_str("destructor");
                }
                print_params(pool, m.parameters, out);
                if let Some(inits) = m.initializer {
                    out.push_str(" : ");
                    let mut first = true;
                    for init in pool.siblings(Some(inits)) {
                        if !first {
                            out.push_str(", ");
                        }
                        first = false;
                        let fi = pool.get(init);
                        out.push_str(pool.get(fi.lvalue.unwrap()).text());
                        out.push('(');
                        let mut first_arg = true;
                        for arg in pool.siblings(fi.parameters) {
                            if !first_arg {
                                out.push_str(", ");
                            }
                            first_arg = false;
                            print_expr(pool, arg, out);
                        }
                        out.push(')');
                    }
                }
                if m.op != Operator::Cast {
                    if let Some(ret) = m.data_type {
                        out.push_str(": ");
                        print_type(pool, ret, out);
                    }
                }
                out.push(' ');
                print_body_block(pool, m.body, depth + 1, out);
            }
            _ => out.push_str("/* error */;\n"),
        }
    }
    indent(depth, out);
    out.push_str("}\n");
}

fn print_body_block(pool: &NodePool, body: Option<NodeRef>, depth: usize, out: &mut String) {
    match body {
        Some(b) if pool.get(b).kind == NodeKind::ScopedBlock => {
            out.push_str("{\n");
            for stmt in pool.siblings(pool.get(b).body) {
                print_statement(pool, stmt, depth + 1, out);
            }
            indent(depth, out);
            out.push_str("}\n");
        }
        Some(b) => {
            out.push_str("{\n");
            print_statement(pool, b, depth + 1, out);
            indent(depth, out);
            out.push_str("}\n");
        }
        None => out.push_str("{\n}\n"),
    }
}

fn print_template_params(pool: &NodePool, params: Option<NodeRef>, out: &mut String) {
    if params.is_none() {
        return;
    }
    out.push('<');
    let mut first = true;
    for param in pool.siblings(params) {
        if !first {
            out.push_str(", ");
        }
        first = false;
        out.push_str(pool.get(param).text());
    }
    out.push('>');
}

fn print_params(pool: &NodePool, params: Option<NodeRef>, out: &mut String) {
    out.push('(');
    let mut first = true;
    for param in pool.siblings(params) {
        if pool.get(param).kind != NodeKind::Parameter {
            continue;
        }
        if !first {
            out.push_str(", ");
        }
        first = false;
        print_param(pool, param, out);
    }
    out.push(')');
}

fn print_param(pool: &NodePool, param: NodeRef, out: &mut String) {
    let p = pool.get(param);
    out.push_str(pool.get(p.lvalue.unwrap()).text());
    if let Some(tp) = p.data_type {
        out.push_str(": ");
        print_type(pool, tp, out);
    }
}

fn print_type(pool: &NodePool, r: NodeRef, out: &mut String) {
    let node = pool.get(r);
    if let Some(module) = node.lvalue {
        out.push_str(pool.get(module).text());
        out.push('.');
    }
    out.push_str(pool.get(node.body.unwrap()).text());
    if node.template_parameters.is_some() {
        out.push('<');
        let mut first = true;
        for arg in pool.siblings(node.template_parameters) {
            if !first {
                out.push_str(", ");
            }
            first = false;
            print_type(pool, arg, out);
        }
        out.push('>');
    }
    if node.flags.contains(NodeFlags::ARRAY) {
        out.push_str("[]");
    }
}

fn print_expr(pool: &NodePool, r: NodeRef, out: &mut String) {
    let node = pool.get(r);
    match node.kind {
        NodeKind::Identifier => out.push_str(node.text()),
        NodeKind::This => out.push_str("this"),
        NodeKind::Error => out.push_str("/* error */"),
        NodeKind::Literal => print_literal(pool, r, out),
        NodeKind::Sizeof => {
            out.push_str("sizeof(");
            print_type(pool, node.data_type.unwrap(), out);
            out.push(')');
        }
        NodeKind::ExpressionSequence => {
            let mut first = true;
            for e in pool.siblings(node.body) {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                print_expr(pool, e, out);
            }
        }
        NodeKind::FunctionExpression => {
            out.push_str("function ");
            print_params(pool, node.parameters, out);
            if let Some(ret) = node.data_type {
                out.push_str(": ");
                print_type(pool, ret, out);
            }
            out.push(' ');
            let mut inner = String::new();
            print_body_block(pool, node.body, 0, &mut inner);
            out.push_str(inner.trim_end());
        }
        NodeKind::Expression => print_operator_expr(pool, r, out),
        _ => out.push_str("/* error */"),
    }
}

fn paren(pool: &NodePool, r: NodeRef, out: &mut String) {
    let simple = matches!(
        pool.get(r).kind,
        NodeKind::Identifier | NodeKind::This | NodeKind::Literal | NodeKind::Sizeof
    );
    if simple {
        print_expr(pool, r, out);
    } else {
        out.push('(');
        print_expr(pool, r, out);
        out.push(')');
    }
}

fn print_operator_expr(pool: &NodePool, r: NodeRef, out: &mut String) {
    let node = pool.get(r);
    match node.op {
        Operator::Call => {
            paren(pool, node.lvalue.unwrap(), out);
            out.push('(');
            let mut first = true;
            for arg in pool.siblings(node.parameters) {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                print_expr(pool, arg, out);
            }
            out.push(')');
        }
        Operator::Index => {
            paren(pool, node.lvalue.unwrap(), out);
            out.push('[');
            print_expr(pool, node.rvalue.unwrap(), out);
            out.push(']');
        }
        Operator::Member => {
            paren(pool, node.lvalue.unwrap(), out);
            out.push('.');
            out.push_str(pool.get(node.rvalue.unwrap()).text());
        }
        Operator::New => {
            out.push_str("new ");
            print_type(pool, node.data_type.unwrap(), out);
            out.push('(');
            let mut first = true;
            for arg in pool.siblings(node.parameters) {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                print_expr(pool, arg, out);
            }
            out.push(')');
        }
        Operator::Conditional => {
            paren(pool, node.cond.unwrap(), out);
            out.push_str(" ? ");
            paren(pool, node.lvalue.unwrap(), out);
            out.push_str(" : ");
            paren(pool, node.rvalue.unwrap(), out);
        }
        Operator::Not | Operator::BitInv | Operator::Negate => {
            out.push_str(node.op.symbol());
            paren(pool, node.lvalue.unwrap(), out);
        }
        Operator::PreInc | Operator::PreDec => {
            out.push_str(node.op.symbol());
            paren(pool, node.lvalue.unwrap(), out);
        }
        Operator::PostInc | Operator::PostDec => {
            paren(pool, node.lvalue.unwrap(), out);
            out.push_str(node.op.symbol());
        }
        _ => {
            paren(pool, node.lvalue.unwrap(), out);
            out.push(' ');
            out.push_str(node.op.symbol());
            out.push(' ');
            paren(pool, node.rvalue.unwrap(), out);
        }
    }
}

fn print_literal(pool: &NodePool, r: NodeRef, out: &mut String) {
    let node = pool.get(r);
    match node.lit_kind {
        Some(LiteralKind::I8) => print_int(&node.lit_value, "b", out),
        Some(LiteralKind::I16) => print_int(&node.lit_value, "s", out),
        Some(LiteralKind::I32) | Some(LiteralKind::I64) => print_int(&node.lit_value, "", out),
        Some(LiteralKind::U8) => print_int(&node.lit_value, "ub", out),
        Some(LiteralKind::U16) => print_int(&node.lit_value, "us", out),
        Some(LiteralKind::U32) => print_int(&node.lit_value, "ul", out),
        Some(LiteralKind::U64) => print_int(&node.lit_value, "ull", out),
        Some(LiteralKind::F32) | Some(LiteralKind::F64) => {
            if let LiteralValue::Float(f) = node.lit_value {
                out.push_str(&format!("{:?}", f));
            }
        }
        Some(LiteralKind::String) => {
            if let LiteralValue::Str(s) = &node.lit_value {
                out.push('\'');
                out.push_str(&s.replace('\\', "\\\\").replace('\'', "\\'"));
                out.push('\'');
            }
        }
        Some(LiteralKind::TemplateString) => {
            if let LiteralValue::Str(s) = &node.lit_value {
                out.push('`');
                out.push_str(&s.replace('\\', "\\\\").replace('`', "\\`"));
                out.push('`');
            }
        }
        Some(LiteralKind::Array) => {
            out.push('[');
            let mut first = true;
            for e in pool.siblings(node.body) {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                print_expr(pool, e, out);
            }
            out.push(']');
        }
        Some(LiteralKind::Object) => {
            out.push('{');
            let mut first = true;
            for p in pool.siblings(node.body) {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                let prop = pool.get(p);
                out.push_str(pool.get(prop.lvalue.unwrap()).text());
                out.push_str(": ");
                print_expr(pool, prop.initializer.unwrap(), out);
            }
            out.push('}');
        }
        Some(LiteralKind::True) => out.push_str("true"),
        Some(LiteralKind::False) => out.push_str("false"),
        Some(LiteralKind::Null) => out.push_str("null"),
        None => out.push_str("/* error */"),
    }
}

fn print_int(value: &LiteralValue, suffix: &str, out: &mut String) {
    match value {
        LiteralValue::Signed(v) => out.push_str(&format!("{}{}", v, suffix)),
        LiteralValue::Unsigned(v) => out.push_str(&format!("{}{}", v, suffix)),
        _ => {}
    }
}

/// Structural equality of two subtrees, ignoring spans and token trivia.
pub fn ast_eq(a_pool: &NodePool, a: NodeRef, b_pool: &NodePool, b: NodeRef) -> bool {
    let na = a_pool.get(a);
    let nb = b_pool.get(b);
    if na.kind != nb.kind || na.op != nb.op || na.lit_kind != nb.lit_kind {
        return false;
    }
    let flags_a = na.flags & !NodeFlags::DETACHED;
    let flags_b = nb.flags & !NodeFlags::DETACHED;
    if flags_a != flags_b {
        return false;
    }
    if na.lit_value != nb.lit_value {
        return false;
    }
    if na.kind == NodeKind::Identifier && na.text() != nb.text() {
        return false;
    }

    macro_rules! slot_eq {
        ($slot:ident) => {
            match (na.$slot, nb.$slot) {
                (None, None) => true,
                (Some(ca), Some(cb)) => ast_eq(a_pool, ca, b_pool, cb),
                _ => false,
            }
        };
    }
    slot_eq!(data_type)
        && slot_eq!(lvalue)
        && slot_eq!(rvalue)
        && slot_eq!(cond)
        && slot_eq!(body)
        && slot_eq!(else_body)
        && slot_eq!(initializer)
        && slot_eq!(parameters)
        && slot_eq!(template_parameters)
        && slot_eq!(modifier)
        && slot_eq!(alias)
        && slot_eq!(inheritance)
        && slot_eq!(next)
}
