//! Optimizer behavior over real compiled functions.

use gscript::compiler::{
    CompileOptions, ControlFlowGraph, Instruction, Opcode, Operand, OptimizationGroup, Pipeline,
};
use gscript::compiler::FunctionDef;
use gscript::source::SourceBuffer;
use gscript::types::{DataType, TypeRegistry};

fn registry() -> (TypeRegistry, u64) {
    let mut reg = TypeRegistry::new();
    reg.add(DataType::primitive("i32", 4, false, true)).unwrap();
    let id = reg.get_by_name("i32").unwrap().id;
    (reg, id)
}

fn instr(op: Opcode, ops: &[Operand]) -> Instruction {
    let mut i = Instruction::new(op, Default::default());
    for (n, o) in ops.iter().enumerate() {
        i.operands[n] = *o;
    }
    i
}

/// S6: CSE rewrites the duplicate computation and is idempotent.
#[test]
fn cse_scenario_and_idempotence() {
    let (types, t) = registry();
    let mut f = FunctionDef::new("s6");
    for _ in 0..5 {
        f.alloc_register();
    }
    f.emit(instr(Opcode::IAdd, &[Operand::reg(2, t), Operand::reg(0, t), Operand::reg(1, t)]));
    f.emit(instr(Opcode::IAdd, &[Operand::reg(3, t), Operand::reg(0, t), Operand::reg(1, t)]));
    f.emit(instr(Opcode::IAdd, &[Operand::reg(4, t), Operand::reg(2, t), Operand::reg(3, t)]));
    f.emit(instr(Opcode::Ret, &[Operand::reg(4, t)]));

    let mut group = OptimizationGroup::default_pipeline();
    group.run(&mut f, &types);

    let dump_once: Vec<String> = f.code.iter().map(|i| i.to_string()).collect();
    // the duplicate add is gone; the final add consumes the surviving value
    assert!(dump_once.iter().any(|l| l.starts_with("iadd")), "{:?}", dump_once);
    let adds = f.code.iter().filter(|i| i.op == Opcode::IAdd).count();
    assert_eq!(adds, 2, "{:?}", dump_once);

    let mut group2 = OptimizationGroup::default_pipeline();
    group2.run(&mut f, &types);
    let dump_twice: Vec<String> = f.code.iter().map(|i| i.to_string()).collect();
    assert_eq!(dump_once, dump_twice);
}

/// I2: the CFG stays well-formed after every optimizer pass, for every
/// function of a real compile.
#[test]
fn cfg_well_formed_after_optimization() {
    let source = "\
        function collatz(n: i32): i32 {\n\
            let steps: i32 = 0;\n\
            while (n != 1) {\n\
                if (n % 2 == 0) { n = n / 2; } else { n = 3 * n + 1; }\n\
                steps = steps + 1;\n\
            }\n\
            return steps;\n\
        }\n\
        function main(): i32 { return collatz(27); }";

    let mut pipeline = Pipeline::new(CompileOptions {
        opt_level: 1,
        ..Default::default()
    });
    let output = pipeline
        .compile_source(SourceBuffer::new("collatz.gs", source))
        .unwrap();
    for func in &output.funcs {
        let cfg = ControlFlowGraph::build(func);
        assert!(cfg.is_well_formed(func), "function {} broke:\n{}", func.name, func.dump());
    }
}

/// Optimization must not change observable behavior.
#[test]
fn optimized_and_unoptimized_agree() {
    let source = "\
        function main(): i32 {\n\
            let a: i32 = 6;\n\
            let b: i32 = 7;\n\
            let x: i32 = a * b;\n\
            let y: i32 = a * b;\n\
            let unused: i32 = 123;\n\
            return x + y;\n\
        }";

    let run = |opt_level: u8| -> i32 {
        use gscript::backend::{self, Backend, VmBackend, VmOptions};
        let mut pipeline = Pipeline::new(CompileOptions {
            opt_level,
            ..Default::default()
        });
        let mut output = pipeline
            .compile_source(SourceBuffer::new("agree.gs", source))
            .unwrap();
        let ctx = pipeline.context().clone();
        let mut vm = VmBackend::new(VmOptions::default());
        backend::finalize_module(&mut vm, &ctx, &mut output).unwrap();
        backend::run_module_init(&mut vm, &ctx, &output).unwrap();
        let main = ctx.funcs.read().get_by_fqn("agree::main")[0];
        let mut result = 0u64;
        vm.call(&ctx, main, Some(&mut result), &[]).unwrap();
        result as i32
    };

    assert_eq!(run(0), 84);
    assert_eq!(run(1), 84);
}

/// The group stops at quiescence well inside its iteration cap.
#[test]
fn group_reaches_quiescence() {
    let (types, t) = registry();
    let mut f = FunctionDef::new("quiet");
    f.alloc_register();
    f.emit(instr(Opcode::Assign, &[Operand::reg(0, t), Operand::imm(1, t)]));
    f.emit(instr(Opcode::Ret, &[Operand::reg(0, t)]));
    let mut group = OptimizationGroup::default_pipeline();
    let passes = group.run(&mut f, &types);
    assert!(passes <= 2, "took {} passes", passes);
}
