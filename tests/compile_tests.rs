//! Module graph, diagnostics-policy, and semantic-check tests.

mod common;

use gscript::compiler::{CompileOptions, Pipeline};
use gscript::error::{Error, ErrorCode, Severity};
use gscript::source::SourceBuffer;
use std::fs;

fn compile_err(source: &str) -> Vec<gscript::Diagnostic> {
    let mut pipeline = Pipeline::new(CompileOptions::default());
    match pipeline.compile_source(SourceBuffer::new("err.gs", source)) {
        Ok(out) => panic!("expected failure, compiled with {:?}", out.diagnostics),
        Err(Error::Compile { diagnostics }) => diagnostics,
        Err(e) => panic!("unexpected error kind: {}", e),
    }
}

fn has_code(diags: &[gscript::Diagnostic], code: ErrorCode) -> bool {
    diags.iter().any(|d| d.code == code)
}

#[test]
fn cyclic_imports_name_every_frame() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.gs");
    let b = dir.path().join("b.gs");
    fs::write(&a, "import { x } from './b';\nexport let y = 1;").unwrap();
    fs::write(&b, "import { y } from './a';\nexport let x = 2;").unwrap();

    let mut pipeline = Pipeline::new(CompileOptions::default());
    let err = pipeline.compile_file(&a).unwrap_err();
    let Error::Compile { diagnostics } = err else {
        panic!("expected compile failure");
    };
    let cyclic: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.code == ErrorCode::CyclicImports)
        .collect();
    assert_eq!(cyclic.len(), 1, "all: {:#?}", diagnostics);
    assert!(cyclic[0].message.contains("a.gs"));
    assert!(cyclic[0].message.contains("b.gs"));
    // the cycle is the only error reported
    let errors = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .count();
    assert_eq!(errors, 1, "all: {:#?}", diagnostics);
}

#[test]
fn imports_bind_functions_and_globals() {
    let dir = tempfile::tempdir().unwrap();
    let util = dir.path().join("util.gs");
    let main = dir.path().join("main.gs");
    fs::write(
        &util,
        "export function triple(x: i32): i32 { return x * 3; }\n\
         export let base: i32 = 4;",
    )
    .unwrap();
    fs::write(
        &main,
        "import { triple, base } from './util';\n\
         function main(): i32 { return triple(base); }",
    )
    .unwrap();

    let mut pipeline = Pipeline::new(CompileOptions::default());
    let mut output = pipeline.compile_file(&main).unwrap();
    assert!(output.is_clean());
    assert_eq!(output.module.dependencies.len(), 1);

    // run it end to end for good measure
    use gscript::backend::{self, Backend, VmBackend, VmOptions};
    let mut vm = VmBackend::new(VmOptions::default());
    let ctx = pipeline.context().clone();
    for dep in pipeline.take_dependency_outputs().iter_mut() {
        backend::finalize_module(&mut vm, &ctx, dep).unwrap();
        backend::run_module_init(&mut vm, &ctx, dep).unwrap();
    }
    backend::finalize_module(&mut vm, &ctx, &mut output).unwrap();
    backend::run_module_init(&mut vm, &ctx, &output).unwrap();
    let main_id = ctx.funcs.read().get_by_fqn("main::main")[0];
    let mut result = 0u64;
    vm.call(&ctx, main_id, Some(&mut result), &[]).unwrap();
    assert_eq!(result as i32, 12);
}

#[test]
fn non_exported_symbols_are_invisible() {
    let dir = tempfile::tempdir().unwrap();
    let util = dir.path().join("util.gs");
    let main = dir.path().join("main.gs");
    fs::write(&util, "function hidden(): i32 { return 1; }").unwrap();
    fs::write(
        &main,
        "import { hidden } from './util';\nfunction main(): i32 { return hidden(); }",
    )
    .unwrap();

    let mut pipeline = Pipeline::new(CompileOptions::default());
    let err = pipeline.compile_file(&main).unwrap_err();
    assert!(has_code(err.diagnostics(), ErrorCode::SymbolNotFound));
}

#[test]
fn missing_module_is_reported() {
    let diags = compile_err("import { a } from './definitely_not_here';");
    assert!(has_code(&diags, ErrorCode::FailedToResolveModule));
}

#[test]
fn undefined_identifier_does_not_stop_the_compile() {
    let diags = compile_err(
        "function main(): i32 {\n\
             let a = missing_one;\n\
             let b = missing_two;\n\
             return 0;\n\
         }",
    );
    let undefined = diags
        .iter()
        .filter(|d| d.code == ErrorCode::UndefinedIdentifier)
        .count();
    assert_eq!(undefined, 2, "all: {:#?}", diags);
}

#[test]
fn break_outside_loop_is_rejected() {
    let diags = compile_err("function main(): i32 { break; return 0; }");
    assert!(has_code(&diags, ErrorCode::BreakOutsideLoop));
}

#[test]
fn continue_outside_loop_is_rejected() {
    let diags = compile_err("function main(): i32 { continue; return 0; }");
    assert!(has_code(&diags, ErrorCode::ContinueOutsideLoop));
}

#[test]
fn returning_value_from_void_function_is_rejected() {
    let diags = compile_err("function f() { return 1; }");
    assert!(has_code(&diags, ErrorCode::ReturnValueForbidden));
}

#[test]
fn missing_return_value_is_rejected() {
    let diags = compile_err("function f(): i32 { }");
    assert!(has_code(&diags, ErrorCode::ReturnValueMissing));
}

#[test]
fn const_assignment_is_rejected() {
    let diags = compile_err(
        "function main(): i32 {\n\
             const x: i32 = 1;\n\
             x = 2;\n\
             return x;\n\
         }",
    );
    assert!(has_code(&diags, ErrorCode::NotWritable));
}

#[test]
fn getter_only_property_rejects_writes() {
    let diags = compile_err(
        "class C {\n\
             n: i32;\n\
             constructor() { this.n = 1; }\n\
             get v(): i32 { return this.n; }\n\
         }\n\
         function main(): i32 {\n\
             let c: C = new C();\n\
             c.v = 5;\n\
             return 0;\n\
         }",
    );
    assert!(has_code(&diags, ErrorCode::NotWritable));
}

#[test]
fn private_property_access_is_rejected() {
    let diags = compile_err(
        "class C {\n\
             private secret: i32;\n\
             constructor() { this.secret = 1; }\n\
         }\n\
         function main(): i32 {\n\
             let c: C = new C();\n\
             return c.secret;\n\
         }",
    );
    assert!(has_code(&diags, ErrorCode::PrivateAccess));
}

#[test]
fn duplicate_destructor_is_rejected() {
    let diags = compile_err(
        "class C {\n\
             destructor() { }\n\
             destructor() { }\n\
         }\n\
         function main(): i32 { return 0; }",
    );
    assert!(has_code(&diags, ErrorCode::DestructorAlreadyExists));
}

#[test]
fn duplicate_field_in_initializer_list_is_rejected() {
    let diags = compile_err(
        "class C {\n\
             x: i32;\n\
             constructor() : x(1), x(2) { }\n\
         }\n\
         function main(): i32 { return 0; }",
    );
    assert!(has_code(&diags, ErrorCode::PropertyAlreadyInitialized));
}

#[test]
fn template_arity_is_checked() {
    let diags = compile_err(
        "class Pair<A, B> { a: A; b: B; }\n\
         let p: Pair<i32> = new Pair<i32>();",
    );
    assert!(has_code(&diags, ErrorCode::TemplateWrongArity));
}

#[test]
fn template_args_on_non_template_rejected() {
    let diags = compile_err("let x: i32<f32> = 0;");
    assert!(has_code(&diags, ErrorCode::NotATemplate));
}

#[test]
fn ambiguous_overload_lists_candidates() {
    let diags = compile_err(
        "function q(x: f32): i32 { return 1; }\n\
         function q(x: f64): i32 { return 2; }\n\
         function main(): i32 { return q(5); }",
    );
    let ambiguous: Vec<_> = diags
        .iter()
        .filter(|d| d.code == ErrorCode::AmbiguousFunction)
        .collect();
    assert_eq!(ambiguous.len(), 1);
    // candidates ride along as info notes
    assert!(ambiguous[0].notes.len() >= 2);
    assert!(ambiguous[0]
        .notes
        .iter()
        .all(|n| n.severity == Severity::Info));
}

#[test]
fn type_as_value_is_rejected() {
    let diags = compile_err("function main(): i32 { return i32 + 1; }");
    assert!(has_code(&diags, ErrorCode::TypeAsValue));
}

#[test]
fn alias_chain_resolves_through_typedef() {
    assert_eq!(
        common::run_main_i32(
            "type integer = i32;\n\
             type int2 = integer;\n\
             function main(): int2 { let v: integer = 21; return v * 2; }"
        ),
        42
    );
}
