//! Register allocation over compiled functions and hand-built IR.

use gscript::compiler::{
    allocate, CompileOptions, FunctionDef, Instruction, Liveness, Opcode, Operand, Pipeline,
};
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

/// S5: three values live at once on a two-register machine spill exactly
/// one to a stack slot; the other two hold registers.
#[test]
fn spill_scenario() {
    let (types, t) = registry();
    let mut f = FunctionDef::new("pressure");
    for _ in 0..5 {
        f.alloc_register();
    }
    f.emit(instr(Opcode::Assign, &[Operand::reg(0, t), Operand::imm(1, t)]));
    f.emit(instr(Opcode::Assign, &[Operand::reg(1, t), Operand::imm(2, t)]));
    f.emit(instr(Opcode::Assign, &[Operand::reg(2, t), Operand::imm(3, t)]));
    f.emit(instr(Opcode::IAdd, &[Operand::reg(3, t), Operand::reg(0, t), Operand::reg(1, t)]));
    f.emit(instr(Opcode::IAdd, &[Operand::reg(4, t), Operand::reg(3, t), Operand::reg(2, t)]));
    f.emit(instr(Opcode::Ret, &[Operand::reg(4, t)]));

    let result = allocate(&mut f, &types, 2, 2);
    assert_eq!(result.spill_count, 1);
    assert_eq!(result.spilled().count(), 1);
    assert!(result.in_registers().count() >= 2);
    assert!(f.frame_size() > 0);

    // the spilled range's operands point at its stack slot
    let spilled = result.spilled().next().unwrap();
    let mut annotated = 0;
    for idx in spilled.range.begin..=spilled.range.end {
        for op in &f.code[idx].operands {
            if op.location == Some(spilled.location) {
                annotated += 1;
            }
        }
    }
    assert!(annotated >= 2, "spill must cover definition and use");
}

/// I3: no two overlapping live ranges share a physical register.
#[test]
fn no_overlap_shares_register_in_compiled_code() {
    let source = "\
        function mix(a: i32, b: i32, c: i32): i32 {\n\
            let d: i32 = a + b;\n\
            let e: i32 = b + c;\n\
            let f: i32 = a + c;\n\
            let g: i32 = d * e;\n\
            return g + f;\n\
        }\n\
        function main(): i32 { return mix(1, 2, 3); }";

    let mut pipeline = Pipeline::new(CompileOptions::default());
    let output = pipeline
        .compile_source(SourceBuffer::new("mix.gs", source))
        .unwrap();
    let types = pipeline.context().types.read();

    for func in output.funcs.iter() {
        let mut f = func.clone();
        let result = allocate(&mut f, &types, 3, 3);
        let regs: Vec<_> = result.in_registers().collect();
        for (i, a) in regs.iter().enumerate() {
            for b in regs.iter().skip(i + 1) {
                if a.location == b.location && a.range.is_fp == b.range.is_fp {
                    assert!(
                        !a.range.overlaps(&b.range),
                        "{}: {:?} and {:?} share {:?}",
                        f.name,
                        a.range,
                        b.range,
                        a.location
                    );
                }
            }
        }
    }
}

/// Every register read sits inside a live range that was defined before
/// it, post-allocation included.
#[test]
fn reads_are_covered_by_definitions() {
    let (types, t) = registry();
    let mut f = FunctionDef::new("cover");
    for _ in 0..3 {
        f.alloc_register();
    }
    f.emit(instr(Opcode::Assign, &[Operand::reg(0, t), Operand::imm(4, t)]));
    f.emit(instr(Opcode::IAdd, &[Operand::reg(1, t), Operand::reg(0, t), Operand::imm(1, t)]));
    f.emit(instr(Opcode::IAdd, &[Operand::reg(2, t), Operand::reg(1, t), Operand::reg(0, t)]));
    f.emit(instr(Opcode::Ret, &[Operand::reg(2, t)]));

    let liveness = Liveness::build(&f, &types);
    for (idx, instrn) in f.code.iter().enumerate() {
        let assigns = instrn.assigns().and_then(|a| a.reg_id());
        for op in &instrn.operands {
            if let Some(r) = op.reg_id() {
                if assigns == Some(r) {
                    continue;
                }
                assert!(liveness.is_live(r, idx), "%{} dead at {}", r, idx);
            }
        }
    }
}

/// A spilled value in compiled code still computes the right answer on
/// the VM, which emits the store/load pair around the usage gap.
#[test]
fn spilled_code_still_runs() {
    use gscript::backend::{self, Backend, VmBackend, VmOptions};

    let source = "\
        function main(): i32 {\n\
            let a: i32 = 1;\n\
            let b: i32 = 2;\n\
            let c: i32 = 3;\n\
            let d: i32 = 4;\n\
            let e: i32 = 5;\n\
            return a + b + c + d + e;\n\
        }";
    let mut pipeline = Pipeline::new(CompileOptions { opt_level: 0, ..Default::default() });
    let mut output = pipeline
        .compile_source(SourceBuffer::new("spill.gs", source))
        .unwrap();

    // force heavy pressure before the backend sees the code
    {
        let types = pipeline.context().types.read();
        for func in output.funcs.iter_mut() {
            allocate(func, &types, 2, 2);
        }
    }

    struct Pressured(VmBackend);
    impl Backend for Pressured {
        fn gp_count(&self) -> u16 {
            2
        }
        fn fp_count(&self) -> u16 {
            2
        }
        fn perform_register_allocation(&self) -> bool {
            false // allocation already done above
        }
        fn generate(
            &mut self,
            ctx: &gscript::compiler::Context,
            output: &mut gscript::compiler::CompilationOutput,
        ) -> gscript::Result<()> {
            self.0.generate(ctx, output)
        }
        fn call(
            &mut self,
            ctx: &gscript::compiler::Context,
            function: gscript::types::FunctionId,
            ret: Option<&mut u64>,
            args: &[u64],
        ) -> gscript::Result<()> {
            self.0.call(ctx, function, ret, args)
        }
    }

    let ctx = pipeline.context().clone();
    let mut vm = Pressured(VmBackend::new(VmOptions::default()));
    backend::finalize_module(&mut vm, &ctx, &mut output).unwrap();
    backend::run_module_init(&mut vm, &ctx, &output).unwrap();
    let main = ctx.funcs.read().get_by_fqn("spill::main")[0];
    let mut result = 0u64;
    vm.call(&ctx, main, Some(&mut result), &[]).unwrap();
    assert_eq!(result as i32, 15);
}
