//! End-to-end tests: compile → optimize → allocate → VM → run.

mod common;

use common::{run_main, run_main_f64, run_main_i32};

#[test]
fn arithmetic_and_locals() {
    assert_eq!(run_main_i32("function main(): i32 { return 1 + 2 * 3; }"), 7);
    assert_eq!(
        run_main_i32(
            "function main(): i32 {\n\
                 let a: i32 = 10;\n\
                 let b: i32 = 4;\n\
                 a = a - b;\n\
                 return a * b;\n\
             }"
        ),
        24
    );
}

#[test]
fn float_arithmetic() {
    assert_eq!(
        run_main_f64("function main(): f64 { return 0.5 + 0.25; }"),
        0.75
    );
    assert_eq!(
        run_main_f64("function main(): f64 { let x: f64 = 9.0; return x / 2.0; }"),
        4.5
    );
}

#[test]
fn integer_float_conversion() {
    assert_eq!(
        run_main_f64("function main(): f64 { let n: i32 = 3; return n + 0.5; }"),
        3.5
    );
}

#[test]
fn if_else_branches() {
    let src = |v: i32| {
        format!(
            "function main(): i32 {{\n\
                 let x: i32 = {};\n\
                 if (x > 10) {{ return 1; }} else {{ return 2; }}\n\
             }}",
            v
        )
    };
    assert_eq!(run_main_i32(&src(11)), 1);
    assert_eq!(run_main_i32(&src(9)), 2);
}

#[test]
fn while_loop_sums() {
    assert_eq!(
        run_main_i32(
            "function main(): i32 {\n\
                 let total: i32 = 0;\n\
                 let i: i32 = 1;\n\
                 while (i <= 10) {\n\
                     total = total + i;\n\
                     i = i + 1;\n\
                 }\n\
                 return total;\n\
             }"
        ),
        55
    );
}

#[test]
fn for_loop_with_step() {
    assert_eq!(
        run_main_i32(
            "function main(): i32 {\n\
                 let total: i32 = 0;\n\
                 for (let i = 0; i < 5; i = i + 1) {\n\
                     total = total + i;\n\
                 }\n\
                 return total;\n\
             }"
        ),
        10
    );
}

#[test]
fn do_while_runs_body_first() {
    assert_eq!(
        run_main_i32(
            "function main(): i32 {\n\
                 let n: i32 = 0;\n\
                 do { n = n + 1; } while (false);\n\
                 return n;\n\
             }"
        ),
        1
    );
}

#[test]
fn break_and_continue() {
    assert_eq!(
        run_main_i32(
            "function main(): i32 {\n\
                 let total: i32 = 0;\n\
                 for (let i = 0; i < 100; i = i + 1) {\n\
                     if (i == 5) { break; }\n\
                     if (i == 2) { continue; }\n\
                     total = total + i;\n\
                 }\n\
                 return total;\n\
             }"
        ),
        0 + 1 + 3 + 4
    );
}

#[test]
fn switch_selects_case() {
    let src = |v: i32| {
        format!(
            "function main(): i32 {{\n\
                 let x: i32 = {};\n\
                 switch (x) {{\n\
                     case 1: return 10;\n\
                     case 2: return 20;\n\
                     default: return 30;\n\
                 }}\n\
             }}",
            v
        )
    };
    assert_eq!(run_main_i32(&src(1)), 10);
    assert_eq!(run_main_i32(&src(2)), 20);
    assert_eq!(run_main_i32(&src(7)), 30);
}

#[test]
fn function_calls_and_overloads() {
    assert_eq!(
        run_main_i32(
            "function double(x: i32): i32 { return x * 2; }\n\
             function main(): i32 { return double(double(5)); }"
        ),
        20
    );
    assert_eq!(
        run_main_i32(
            "function pick(x: i32): i32 { return 1; }\n\
             function pick(x: f64): i32 { return 2; }\n\
             function main(): i32 { return pick(5) * 10 + pick(0.5); }"
        ),
        12
    );
}

#[test]
fn recursion() {
    assert_eq!(
        run_main_i32(
            "function fib(n: i32): i32 {\n\
                 if (n < 2) { return n; }\n\
                 return fib(n - 1) + fib(n - 2);\n\
             }\n\
             function main(): i32 { return fib(10); }"
        ),
        55
    );
}

#[test]
fn conditional_expression() {
    assert_eq!(
        run_main_i32(
            "function main(): i32 {\n\
                 let x: i32 = 3;\n\
                 return x > 2 ? 100 : 200;\n\
             }"
        ),
        100
    );
}

#[test]
fn globals_initialize_before_main() {
    assert_eq!(
        run_main_i32(
            "let counter: i32 = 40;\n\
             function main(): i32 { return counter + 2; }"
        ),
        42
    );
}

#[test]
fn class_fields_and_methods() {
    assert_eq!(
        run_main_i32(
            "class Point {\n\
                 x: i32;\n\
                 y: i32;\n\
                 constructor(x: i32, y: i32) {\n\
                     this.x = x;\n\
                     this.y = y;\n\
                 }\n\
                 sum(): i32 { return this.x + this.y; }\n\
             }\n\
             function main(): i32 {\n\
                 let p: Point = new Point(30, 12);\n\
                 return p.sum();\n\
             }"
        ),
        42
    );
}

#[test]
fn class_field_mutation_through_member() {
    assert_eq!(
        run_main_i32(
            "class Counter {\n\
                 n: i32;\n\
                 constructor() { this.n = 0; }\n\
                 bump(): i32 {\n\
                     this.n = this.n + 1;\n\
                     return this.n;\n\
                 }\n\
             }\n\
             function main(): i32 {\n\
                 let c: Counter = new Counter();\n\
                 c.bump();\n\
                 c.bump();\n\
                 return c.bump();\n\
             }"
        ),
        3
    );
}

#[test]
fn getters_and_setters_route_through_accessors() {
    assert_eq!(
        run_main_i32(
            "class Cell {\n\
                 raw: i32;\n\
                 constructor() { this.raw = 0; }\n\
                 get value(): i32 { return this.raw; }\n\
                 set value(v: i32) { this.raw = v * 2; }\n\
             }\n\
             function main(): i32 {\n\
                 let c: Cell = new Cell();\n\
                 c.value = 21;\n\
                 return c.value;\n\
             }"
        ),
        42
    );
}

#[test]
fn template_class_specializes() {
    assert_eq!(
        run_main_i32(
            "class Box<T> {\n\
                 value: T;\n\
                 constructor(v: T) { this.value = v; }\n\
                 unwrap(): T { return this.value; }\n\
             }\n\
             function main(): i32 {\n\
                 let b: Box<i32> = new Box<i32>(42);\n\
                 return b.unwrap();\n\
             }"
        ),
        42
    );
}

#[test]
fn math_module_host_calls() {
    assert_eq!(
        run_main_f64("function main(): f64 { return math.sqrt(81.0); }"),
        9.0
    );
    assert_eq!(
        run_main_f64("function main(): f64 { return math.max(1.5, math.min(9.0, 4.5)); }"),
        4.5
    );
}

#[test]
fn try_catch_catches_throw() {
    assert_eq!(
        run_main(
            "function main(): i64 {\n\
                 try {\n\
                     throw 7;\n\
                 } catch (e: i64) {\n\
                     return e + 1;\n\
                 }\n\
                 return 0;\n\
             }"
        )
        .unwrap() as i64,
        8
    );
}

#[test]
fn division_by_zero_is_a_runtime_error() {
    let err = run_main(
        "function main(): i32 {\n\
             let z: i32 = 0;\n\
             return 10 / z;\n\
         }",
    )
    .unwrap_err();
    match err {
        gscript::Error::Runtime(e) => {
            assert_eq!(e.code, gscript::ErrorCode::DivisionByZero);
        }
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

#[test]
fn sizeof_is_compile_time() {
    assert_eq!(
        run_main("function main(): u64 { return sizeof(vec3d); }").unwrap(),
        24
    );
}

#[test]
fn print_does_not_disturb_results() {
    assert_eq!(
        run_main_i32(
            "function main(): i32 {\n\
                 print('from the vm');\n\
                 return 5;\n\
             }"
        ),
        5
    );
}

#[test]
fn compound_assignment_and_incdec() {
    assert_eq!(
        run_main_i32(
            "function main(): i32 {\n\
                 let x: i32 = 10;\n\
                 x += 5;\n\
                 x -= 3;\n\
                 x *= 2;\n\
                 x++;\n\
                 x--;\n\
                 return x;\n\
             }"
        ),
        24
    );
}
