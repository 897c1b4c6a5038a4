//! Dataflow optimization passes and the pass manager.
//!
//! A tree of steps runs over each function until no step reports a
//! change (capped to guarantee termination). The CFG and liveness are
//! rebuilt before every step so no pass ever sees stale analysis.

use super::cfg::{BasicBlock, ControlFlowGraph, Liveness};
use super::ir::{FunctionDef, Opcode, Operand, OperandKind, RegisterId};
use crate::types::TypeRegistry;
use std::collections::HashMap;

/// Upper bound on group iterations; quiescence is normally reached in
/// two or three.
const MAX_PASSES: u32 = 8;

/// One optimization step. Per-block steps override [`execute_block`],
/// whole-function steps override [`execute_function`].
///
/// [`execute_block`]: OptimizationStep::execute_block
/// [`execute_function`]: OptimizationStep::execute_function
pub trait OptimizationStep {
    /// Step name for trace logs.
    fn name(&self) -> &'static str;

    /// True when the step works block-by-block.
    fn per_block(&self) -> bool {
        true
    }

    /// Per-block entry point.
    fn execute_block(
        &mut self,
        _func: &mut FunctionDef,
        _block: &BasicBlock,
        _liveness: &Liveness,
    ) -> bool {
        false
    }

    /// Whole-function entry point.
    fn execute_function(&mut self, _func: &mut FunctionDef, _liveness: &Liveness) -> bool {
        false
    }
}

/// An ordered group of steps, itself usable as a step of a parent group.
pub struct OptimizationGroup {
    steps: Vec<Box<dyn OptimizationStep>>,
}

impl OptimizationGroup {
    /// Creates an empty group.
    pub fn new() -> Self {
        OptimizationGroup { steps: Vec::new() }
    }

    /// The mandatory pipeline: copy propagation, common-subexpression
    /// elimination, dead-store elimination.
    pub fn default_pipeline() -> Self {
        let mut g = OptimizationGroup::new();
        g.add(CopyPropagation::default());
        g.add(CommonSubexpressionElimination::default());
        g.add(DeadStoreElimination::default());
        g
    }

    /// Appends a step.
    pub fn add(&mut self, step: impl OptimizationStep + 'static) {
        self.steps.push(Box::new(step));
    }

    /// Runs the group to quiescence over one function. Returns the number
    /// of iterations performed.
    pub fn run(&mut self, func: &mut FunctionDef, types: &TypeRegistry) -> u32 {
        let mut passes = 0;
        for _ in 0..MAX_PASSES {
            passes += 1;
            let mut changed = false;
            for step in &mut self.steps {
                // fresh analysis before every step
                func.rebuild_labels();
                let liveness = Liveness::build(func, types);
                let step_changed = if step.per_block() {
                    let cfg = ControlFlowGraph::build(func);
                    let blocks = cfg.blocks.clone();
                    let mut any = false;
                    for block in &blocks {
                        any |= step.execute_block(func, block, &liveness);
                    }
                    any
                } else {
                    step.execute_function(func, &liveness)
                };
                if step_changed {
                    tracing::debug!(step = step.name(), func = %func.name, "optimizer changed code");
                    func.rebuild_labels();
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        passes
    }
}

impl Default for OptimizationGroup {
    fn default() -> Self {
        Self::default_pipeline()
    }
}

impl OptimizationStep for OptimizationGroup {
    fn name(&self) -> &'static str {
        "group"
    }

    fn per_block(&self) -> bool {
        false
    }

    fn execute_function(&mut self, func: &mut FunctionDef, liveness: &Liveness) -> bool {
        let mut changed = false;
        for step in &mut self.steps {
            if step.per_block() {
                let cfg = ControlFlowGraph::build(func);
                let blocks = cfg.blocks.clone();
                for block in &blocks {
                    changed |= step.execute_block(func, block, liveness);
                }
            } else {
                changed |= step.execute_function(func, liveness);
            }
        }
        changed
    }
}

fn is_add_zero(instr: &super::ir::Instruction) -> bool {
    matches!(instr.op, Opcode::IAdd | Opcode::UAdd)
        && instr.operands[2].imm_bits() == Some(0)
}

/// Copy propagation.
///
/// Within a block, `assign r, x` (and `add r, x, 0`) establish that `r`
/// currently holds `x`; later reads of `r` are rewritten to `x` with the
/// operand's declared type preserved. Any assignment to a register drops
/// its entry.
#[derive(Default)]
pub struct CopyPropagation;

impl OptimizationStep for CopyPropagation {
    fn name(&self) -> &'static str {
        "copy-propagation"
    }

    fn execute_block(
        &mut self,
        func: &mut FunctionDef,
        block: &BasicBlock,
        _liveness: &Liveness,
    ) -> bool {
        let mut known: HashMap<RegisterId, Operand> = HashMap::new();
        let mut changed = false;

        for i in block.begin..block.end {
            let instr = &func.code[i];
            let is_copy = instr.op == Opcode::Assign || is_add_zero(instr);

            if is_copy {
                let Some(dst) = instr.operands[0].reg_id() else { continue };
                let src = instr.operands[1];
                // collapse chains at record time
                let resolved = src
                    .reg_id()
                    .and_then(|r| known.get(&r).copied())
                    .unwrap_or(src);
                known.insert(dst, resolved);
                if resolved.kind != src.kind {
                    let declared = func.code[i].operands[1].type_id;
                    func.code[i].operands[1] = resolved;
                    func.code[i].operands[1].type_id = declared;
                    changed = true;
                }
                continue;
            }

            let assigned_reg = instr.assigns().and_then(|a| a.reg_id());
            let info = instr.op.info();
            for o in 0..info.operand_count as usize {
                let op = &func.code[i].operands[o];
                if !op.is_valid() || op.is_imm() || op.is_arg() {
                    continue;
                }
                if info.assigns_operand == Some(o as u8) {
                    continue;
                }
                let Some(r) = op.reg_id() else { continue };
                if let Some(replacement) = known.get(&r) {
                    let declared = func.code[i].operands[o].type_id;
                    func.code[i].operands[o] = *replacement;
                    func.code[i].operands[o].type_id = declared;
                    changed = true;
                }
            }

            if let Some(r) = assigned_reg {
                known.remove(&r);
            }
        }

        changed
    }
}

fn cse_key(instr: &super::ir::Instruction) -> Option<(Opcode, [OperandKind; 2])> {
    // pure value-producing ops only; memory and allocation identity stay
    if instr.op.info().assigns_operand != Some(0) {
        return None;
    }
    match instr.op {
        Opcode::Assign
        | Opcode::Load
        | Opcode::StackAllocate
        | Opcode::ModuleData
        | Opcode::Reserve
        | Opcode::Call => None,
        op if op.reads_assigned_operand() && op != Opcode::Cvt => None,
        _ => Some((instr.op, [instr.operands[1].kind, instr.operands[2].kind])),
    }
}

/// Common-subexpression elimination.
///
/// Remembers each pure assignment's opcode and operand tuple; a later
/// instruction computing the same tuple with no intervening operand
/// reassignment becomes `assign dst, earlier_dst`.
#[derive(Default)]
pub struct CommonSubexpressionElimination;

impl OptimizationStep for CommonSubexpressionElimination {
    fn name(&self) -> &'static str {
        "common-subexpression-elimination"
    }

    fn execute_block(
        &mut self,
        func: &mut FunctionDef,
        block: &BasicBlock,
        _liveness: &Liveness,
    ) -> bool {
        let mut seen: HashMap<(Opcode, [OperandKind; 2]), Operand> = HashMap::new();
        let mut changed = false;

        for i in block.begin..block.end {
            let key = cse_key(&func.code[i]);

            if let Some(key) = key {
                if let Some(earlier) = seen.get(&key).copied() {
                    let dst = func.code[i].operands[0];
                    let span = func.code[i].span;
                    let mut repl = super::ir::Instruction::new(Opcode::Assign, span);
                    repl.operands[0] = dst;
                    repl.operands[1] = earlier;
                    repl.operands[1].type_id = dst.type_id;
                    func.code[i] = repl;
                    changed = true;
                    // the destination now aliases the earlier value; its
                    // own memo entries are stale
                    invalidate(&mut seen, dst.reg_id());
                    continue;
                }
                let dst = func.code[i].operands[0];
                invalidate(&mut seen, dst.reg_id());
                seen.insert(key, dst);
                continue;
            }

            let assigned = func.code[i].assigns().and_then(|a| a.reg_id());
            invalidate(&mut seen, assigned);
        }

        changed
    }
}

fn invalidate(seen: &mut HashMap<(Opcode, [OperandKind; 2]), Operand>, reg: Option<RegisterId>) {
    let Some(reg) = reg else { return };
    seen.retain(|(_, operands), dst| {
        dst.reg_id() != Some(reg)
            && !operands
                .iter()
                .any(|k| matches!(k, OperandKind::Register(r) if *r == reg))
    });
}

/// Dead-store elimination.
///
/// Drops pure assignments whose destination register is never read
/// downstream, discoverable as a liveness range with zero uses.
#[derive(Default)]
pub struct DeadStoreElimination;

fn removable(op: Opcode) -> bool {
    if op.info().assigns_operand != Some(0) {
        return false;
    }
    !matches!(
        op,
        Opcode::Call | Opcode::StackAllocate | Opcode::ModuleData | Opcode::Reserve
    )
}

impl OptimizationStep for DeadStoreElimination {
    fn name(&self) -> &'static str {
        "dead-store-elimination"
    }

    fn per_block(&self) -> bool {
        false
    }

    fn execute_function(&mut self, func: &mut FunctionDef, liveness: &Liveness) -> bool {
        let mut dead = Vec::new();
        for range in &liveness.ranges {
            if range.usage_count != 0
                || range.begin != range.end
                || !removable(func.code[range.begin].op)
            {
                continue;
            }
            // a zero-length range flags a candidate; confirm no later
            // instruction reads the register on any path (a reassignment
            // in one branch arm must not kill the other arm's store)
            let reg = range.reg;
            let read_later = func.code[range.begin + 1..].iter().any(|i| {
                i.involves(reg, true)
                    || (i.op.reads_assigned_operand() && i.involves(reg, false))
            });
            if !read_later {
                dead.push(range.begin);
            }
        }
        if dead.is_empty() {
            return false;
        }
        for i in &dead {
            func.code[*i] = super::ir::Instruction::new(Opcode::Noop, func.code[*i].span);
        }
        func.code.retain(|instr| instr.op != Opcode::Noop);
        func.rebuild_labels();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::Instruction;
    use crate::source::SourceSpan;
    use crate::types::{DataType, TypeId, TypeRegistry};

    fn registry() -> (TypeRegistry, TypeId) {
        let mut reg = TypeRegistry::new();
        reg.add(DataType::primitive("i32", 4, false, true)).unwrap();
        let id = reg.get_by_name("i32").unwrap().id;
        (reg, id)
    }

    fn instr(op: Opcode, ops: &[Operand]) -> Instruction {
        let mut i = Instruction::new(op, SourceSpan::default());
        for (n, o) in ops.iter().enumerate() {
            i.operands[n] = *o;
        }
        i
    }

    #[test]
    fn test_copy_propagation_substitutes() {
        let (types, t) = registry();
        let mut f = FunctionDef::new("cp");
        for _ in 0..3 {
            f.alloc_register();
        }
        // %1 = %0; %2 = %1 + %1  =>  %2 = %0 + %0
        f.emit(instr(Opcode::Assign, &[Operand::reg(1, t), Operand::reg(0, t)]));
        f.emit(instr(
            Opcode::IAdd,
            &[Operand::reg(2, t), Operand::reg(1, t), Operand::reg(1, t)],
        ));
        f.emit(instr(Opcode::Ret, &[Operand::reg(2, t)]));

        let mut group = OptimizationGroup::new();
        group.add(CopyPropagation);
        group.run(&mut f, &types);

        assert_eq!(f.code[1].operands[1].reg_id(), Some(0));
        assert_eq!(f.code[1].operands[2].reg_id(), Some(0));
    }

    #[test]
    fn test_copy_propagation_add_zero() {
        let (types, t) = registry();
        let mut f = FunctionDef::new("cp0");
        for _ in 0..3 {
            f.alloc_register();
        }
        // %1 = %0 + 0; ret %1  =>  ret %0 (after DCE of the copy)
        f.emit(instr(
            Opcode::IAdd,
            &[Operand::reg(1, t), Operand::reg(0, t), Operand::imm(0, t)],
        ));
        f.emit(instr(Opcode::Ret, &[Operand::reg(1, t)]));

        let mut group = OptimizationGroup::new();
        group.add(CopyPropagation);
        group.run(&mut f, &types);
        assert_eq!(f.code[1].operands[0].reg_id(), Some(0));
    }

    #[test]
    fn test_cse_rewrites_duplicate() {
        let (types, t) = registry();
        let mut f = FunctionDef::new("cse");
        for _ in 0..5 {
            f.alloc_register();
        }
        // r2 = r0 + r1; r3 = r0 + r1; r4 = r2 + r3
        f.emit(instr(
            Opcode::IAdd,
            &[Operand::reg(2, t), Operand::reg(0, t), Operand::reg(1, t)],
        ));
        f.emit(instr(
            Opcode::IAdd,
            &[Operand::reg(3, t), Operand::reg(0, t), Operand::reg(1, t)],
        ));
        f.emit(instr(
            Opcode::IAdd,
            &[Operand::reg(4, t), Operand::reg(2, t), Operand::reg(3, t)],
        ));
        f.emit(instr(Opcode::Ret, &[Operand::reg(4, t)]));

        let mut group = OptimizationGroup::new();
        group.add(CommonSubexpressionElimination);
        group.run(&mut f, &types);

        assert_eq!(f.code[1].op, Opcode::Assign);
        assert_eq!(f.code[1].operands[1].reg_id(), Some(2));

        // idempotence: a second run changes nothing
        let before: Vec<String> = f.code.iter().map(|i| i.to_string()).collect();
        let mut group2 = OptimizationGroup::new();
        group2.add(CommonSubexpressionElimination);
        group2.run(&mut f, &types);
        let after: Vec<String> = f.code.iter().map(|i| i.to_string()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_cse_respects_reassignment() {
        let (types, t) = registry();
        let mut f = FunctionDef::new("cse2");
        for _ in 0..4 {
            f.alloc_register();
        }
        // r2 = r0 + r1; r0 = 5; r3 = r0 + r1  -- not a common subexpression
        f.emit(instr(
            Opcode::IAdd,
            &[Operand::reg(2, t), Operand::reg(0, t), Operand::reg(1, t)],
        ));
        f.emit(instr(Opcode::Assign, &[Operand::reg(0, t), Operand::imm(5, t)]));
        f.emit(instr(
            Opcode::IAdd,
            &[Operand::reg(3, t), Operand::reg(0, t), Operand::reg(1, t)],
        ));
        f.emit(instr(Opcode::Ret, &[Operand::reg(3, t)]));

        let mut group = OptimizationGroup::new();
        group.add(CommonSubexpressionElimination);
        group.run(&mut f, &types);
        assert_eq!(f.code[2].op, Opcode::IAdd);
    }

    #[test]
    fn test_dead_store_removed() {
        let (types, t) = registry();
        let mut f = FunctionDef::new("dce");
        for _ in 0..2 {
            f.alloc_register();
        }
        f.emit(instr(Opcode::Assign, &[Operand::reg(0, t), Operand::imm(1, t)]));
        f.emit(instr(Opcode::Assign, &[Operand::reg(1, t), Operand::imm(2, t)]));
        f.emit(instr(Opcode::Ret, &[Operand::reg(1, t)]));

        let mut group = OptimizationGroup::new();
        group.add(DeadStoreElimination);
        group.run(&mut f, &types);

        assert_eq!(f.code.len(), 2);
        assert_eq!(f.code[0].operands[0].reg_id(), Some(1));
    }

    #[test]
    fn test_call_result_never_removed() {
        let (types, t) = registry();
        let mut f = FunctionDef::new("call");
        f.alloc_register();
        f.emit(instr(Opcode::Call, &[Operand::func(0), Operand::reg(0, t)]));
        f.emit(instr(Opcode::Ret, &[]));

        let mut group = OptimizationGroup::new();
        group.add(DeadStoreElimination);
        group.run(&mut f, &types);
        assert_eq!(f.code.len(), 2);
        assert_eq!(f.code[0].op, Opcode::Call);
    }

    #[test]
    fn test_pipeline_s6_scenario() {
        let (types, t) = registry();
        let mut f = FunctionDef::new("s6");
        for _ in 0..5 {
            f.alloc_register();
        }
        f.emit(instr(
            Opcode::IAdd,
            &[Operand::reg(2, t), Operand::reg(0, t), Operand::reg(1, t)],
        ));
        f.emit(instr(
            Opcode::IAdd,
            &[Operand::reg(3, t), Operand::reg(0, t), Operand::reg(1, t)],
        ));
        f.emit(instr(
            Opcode::IAdd,
            &[Operand::reg(4, t), Operand::reg(2, t), Operand::reg(3, t)],
        ));
        f.emit(instr(Opcode::Ret, &[Operand::reg(4, t)]));

        let mut group = OptimizationGroup::default_pipeline();
        group.run(&mut f, &types);

        // r3's copy propagates into the final add and dies
        let final_add = f
            .code
            .iter()
            .find(|i| i.op == Opcode::IAdd && i.operands[0].reg_id() == Some(4))
            .expect("final add survives");
        assert_eq!(final_add.operands[1].reg_id(), Some(2));
        assert_eq!(final_add.operands[2].reg_id(), Some(2));

        // stable under a second full run
        let before: Vec<String> = f.code.iter().map(|i| i.to_string()).collect();
        let mut group2 = OptimizationGroup::default_pipeline();
        group2.run(&mut f, &types);
        let after: Vec<String> = f.code.iter().map(|i| i.to_string()).collect();
        assert_eq!(before, after);
    }
}
