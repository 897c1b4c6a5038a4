//! Parser round-trip and diagnostics-policy tests.

use gscript::lexer::Lexer;
use gscript::parser::{ast_eq, print_ast, ParseOutput, Parser};
use gscript::source::SourceBuffer;

fn parse(src: &str) -> ParseOutput {
    let buf = SourceBuffer::new("input.gs", src);
    let (tokens, diags) = Lexer::new(&buf).tokenize();
    assert!(diags.is_empty(), "lexer complained: {:?}", diags);
    Parser::new(tokens, "input.gs").parse()
}

/// parse(print(ast)) is structurally identical to ast for the canonical
/// subset of the grammar.
fn assert_roundtrip(src: &str) {
    let first = parse(src);
    assert!(first.is_clean(), "first parse of {:?}: {:?}", src, first.diagnostics);
    let printed = print_ast(&first.pool, first.root);
    let second = parse(&printed);
    assert!(
        second.is_clean(),
        "reparse of {:?} failed: {:?}",
        printed,
        second.diagnostics
    );
    assert!(
        ast_eq(&first.pool, first.root, &second.pool, second.root),
        "round trip changed the tree.\noriginal source: {}\nprinted: {}",
        src,
        printed
    );
}

#[test]
fn roundtrip_declarations() {
    assert_roundtrip("let x: i32 = 5;");
    assert_roundtrip("const name = 'gs';");
    assert_roundtrip("let a = 1, b = 2;");
    assert_roundtrip("function add(a: i32, b: i32): i32 { return a + b; }");
    assert_roundtrip("type integer = i32;");
}

#[test]
fn roundtrip_expressions() {
    assert_roundtrip("let r = 1 + 2 * 3 - 4 / 2;");
    assert_roundtrip("let r = a < b && c >= d || !e;");
    assert_roundtrip("let r = (x ? y : z) + 1;");
    assert_roundtrip("let r = f(1, 2)[3].field;");
    assert_roundtrip("let r = -x + ~y;");
    assert_roundtrip("let r = x << 2 & mask | bits ^ flip;");
    assert_roundtrip("let v = new vec3f(1.0, 2.0, 3.0);");
    assert_roundtrip("let s = sizeof(vec2d);");
    assert_roundtrip("let arr = [1, 2, 3];");
    assert_roundtrip("x++;");
    assert_roundtrip("x += 5;");
}

#[test]
fn roundtrip_literals() {
    assert_roundtrip("let a = 1b;");
    assert_roundtrip("let b = 200us;");
    assert_roundtrip("let c = 7ull;");
    assert_roundtrip("let d = 0.25;");
    assert_roundtrip("let e = true;");
    assert_roundtrip("let f = null;");
    assert_roundtrip("let g = `template`;");
}

#[test]
fn roundtrip_statements() {
    assert_roundtrip("if (a) { b; } else { c; }");
    assert_roundtrip("while (a < 10) { a++; }");
    assert_roundtrip("do { a++; } while (a < 10);");
    assert_roundtrip("for (let i = 0; i < 10; i++) { work(i); }");
    assert_roundtrip("switch (x) { case 1: break; default: break; }");
    assert_roundtrip("try { risky(); } catch (e: i64) { }");
    assert_roundtrip("throw 5;");
    assert_roundtrip("delete p;");
}

#[test]
fn roundtrip_class_and_modules() {
    assert_roundtrip(
        "class Point extends Base {\n\
             x: f32;\n\
             private y: f32;\n\
             constructor(x: f32) : x(x) { }\n\
             get mag(): f32 { return x; }\n\
             sum(): f32 { return x; }\n\
         }",
    );
    assert_roundtrip("class Box<T> { value: T; }");
    assert_roundtrip("import { a, b as c } from './util';");
    assert_roundtrip("import * as util from './util';");
    assert_roundtrip("export function f(): i32 { return 1; }");
    assert_roundtrip("export let shared = 9;");
}

#[test]
fn errors_do_not_abort_the_parse() {
    let out = parse("let = 1;\nlet ok = 2;\nfunction (broken) { }\nlet also_ok = 3;");
    assert!(!out.is_clean());
    // multiple diagnostics in one run
    assert!(out.diagnostics.len() >= 2);
    // healthy declarations around the damage still parse
    let names: Vec<String> = out
        .pool
        .siblings(out.pool.get(out.root).body)
        .filter(|r| out.pool.get(*r).kind == gscript::parser::NodeKind::Variable)
        .filter_map(|r| out.pool.get(r).lvalue)
        .map(|n| out.pool.get(n).text().to_string())
        .collect();
    assert!(names.contains(&"ok".to_string()));
    assert!(names.contains(&"also_ok".to_string()));
}

#[test]
fn reverted_alternatives_leave_no_diagnostics() {
    // `a < b > c` exercises the template-argument probe, which must back
    // out silently and fall back to comparisons
    let out = parse("let r = a < b > c;");
    assert!(out.is_clean(), "{:?}", out.diagnostics);
}
