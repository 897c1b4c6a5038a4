//! Control-flow graph and liveness analysis over linear IR.

use super::ir::{FunctionDef, Opcode, OperandKind, RegisterId};
use crate::types::TypeRegistry;
use std::collections::HashMap;

/// A basic block: a half-open instruction-index range plus predecessor
/// and successor block indices.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    /// Index of the first instruction
    pub begin: usize,
    /// One past the last instruction
    pub end: usize,
    /// Predecessor block indices
    pub from: Vec<usize>,
    /// Successor block indices
    pub to: Vec<usize>,
}

/// The CFG of one function
#[derive(Debug, Clone, Default)]
pub struct ControlFlowGraph {
    /// Blocks in instruction order
    pub blocks: Vec<BasicBlock>,
}

impl ControlFlowGraph {
    /// Partitions a function's code into blocks and wires the edges.
    ///
    /// A block starts at each label target and after every jump, branch,
    /// or ret. The last instruction of a block determines its out-edges.
    pub fn build(func: &FunctionDef) -> Self {
        let code = &func.code;
        if code.is_empty() {
            return ControlFlowGraph::default();
        }

        let mut leaders = vec![false; code.len()];
        leaders[0] = true;
        for (i, instr) in code.iter().enumerate() {
            match instr.op {
                Opcode::Label => leaders[i] = true,
                Opcode::Jump | Opcode::Branch | Opcode::Ret => {
                    if i + 1 < code.len() {
                        leaders[i + 1] = true;
                    }
                }
                _ => {}
            }
        }

        let mut blocks = Vec::new();
        let mut block_of = vec![0usize; code.len()];
        let mut begin = 0;
        for i in 1..=code.len() {
            if i == code.len() || leaders[i] {
                let idx = blocks.len();
                for b in begin..i {
                    block_of[b] = idx;
                }
                blocks.push(BasicBlock {
                    begin,
                    end: i,
                    from: Vec::new(),
                    to: Vec::new(),
                });
                begin = i;
            }
        }

        let mut cfg = ControlFlowGraph { blocks };
        let mut edges: Vec<(usize, usize)> = Vec::new();
        for (b, block) in cfg.blocks.iter().enumerate() {
            let last = &code[block.end - 1];
            match last.op {
                Opcode::Jump => {
                    if let OperandKind::Label(l) = last.operands[0].kind {
                        if let Some(t) = func.label_target(l) {
                            edges.push((b, block_of[t]));
                        }
                    }
                }
                Opcode::Branch => {
                    for oi in [1, 2] {
                        if let OperandKind::Label(l) = last.operands[oi].kind {
                            if let Some(t) = func.label_target(l) {
                                edges.push((b, block_of[t]));
                            }
                        }
                    }
                }
                Opcode::Ret => {}
                _ => {
                    if b + 1 < cfg.blocks.len() {
                        edges.push((b, b + 1));
                    }
                }
            }
        }
        for (from, to) in edges {
            cfg.blocks[from].to.push(to);
            cfg.blocks[to].from.push(from);
        }
        cfg
    }

    /// Index of the block containing an instruction.
    pub fn block_at(&self, instr: usize) -> Option<usize> {
        self.blocks
            .iter()
            .position(|b| b.begin <= instr && instr < b.end)
    }

    /// True when the block reachably flows back to itself.
    pub fn is_loop(&self, block: usize) -> bool {
        let mut visited = vec![false; self.blocks.len()];
        let mut work: Vec<usize> = self.blocks[block].to.clone();
        while let Some(b) = work.pop() {
            if b == block {
                return true;
            }
            if !visited[b] {
                visited[b] = true;
                work.extend(self.blocks[b].to.iter().copied());
            }
        }
        false
    }

    /// Validates that every jump/branch resolves and edges match the
    /// terminator of each block. Used by tests and the optimizer driver.
    pub fn is_well_formed(&self, func: &FunctionDef) -> bool {
        for instr in &func.code {
            match instr.op {
                Opcode::Jump | Opcode::Branch => {
                    for op in &instr.operands {
                        if let OperandKind::Label(l) = op.kind {
                            if func.label_target(l).is_none() {
                                return false;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        for block in &self.blocks {
            if block.begin >= block.end || block.end > func.code.len() {
                return false;
            }
            let expected = match func.code[block.end - 1].op {
                Opcode::Ret => 0,
                Opcode::Jump => 1,
                Opcode::Branch => func.code[block.end - 1]
                    .operands
                    .iter()
                    .filter(|o| matches!(o.kind, OperandKind::Label(_)))
                    .count(),
                _ => usize::from(block.to.len() == 1),
            };
            if block.to.len() != expected && !matches!(func.code[block.end - 1].op, Opcode::Ret) {
                // fallthrough from the final block legitimately has no edge
                let is_final_fallthrough = block.to.is_empty()
                    && !matches!(func.code[block.end - 1].op, Opcode::Jump | Opcode::Branch);
                if !is_final_fallthrough {
                    return false;
                }
            }
        }
        true
    }
}

/// A register's live range: the closed instruction-index interval in
/// which its value is still needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRange {
    /// Virtual register id
    pub reg: RegisterId,
    /// Defining instruction index
    pub begin: usize,
    /// Last instruction index that needs the value
    pub end: usize,
    /// Number of reads within the range
    pub usage_count: u32,
    /// Floating-point class
    pub is_fp: bool,
}

impl LiveRange {
    /// True when two ranges overlap in time.
    pub fn overlaps(&self, other: &LiveRange) -> bool {
        (self.begin >= other.begin && self.begin <= other.end)
            || (other.begin >= self.begin && other.begin <= self.end)
    }
}

/// Liveness/def-use result for one function
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    /// All ranges, general-purpose and floating-point mixed
    pub ranges: Vec<LiveRange>,
}

impl Liveness {
    /// Computes live ranges.
    ///
    /// A range opens at each assignment and closes at the last use. A
    /// re-assignment inside the range extends it only when the
    /// instruction also reads the old value. Backward jumps into a range
    /// extend it to the jump site, repeated to a fixed point, so values
    /// live across loop back-edges stay allocated throughout the loop.
    pub fn build(func: &FunctionDef, types: &TypeRegistry) -> Self {
        let code = &func.code;
        let mut ranges: Vec<LiveRange> = Vec::new();

        for i in 0..code.len() {
            let Some(assigned) = code[i].assigns() else {
                continue;
            };
            let reg = assigned.reg_id().expect("assigns() yields registers");
            if assigned.is_arg() {
                continue;
            }
            let is_fp = types
                .effective(assigned.type_id)
                .map(|t| t.is_floating_point())
                .unwrap_or(false);

            // Skip re-assignments that land inside an established range
            // for the same register id and class.
            if ranges
                .iter()
                .any(|r| r.reg == reg && r.is_fp == is_fp && r.begin <= i && r.end > i)
            {
                continue;
            }

            let mut range = LiveRange {
                reg,
                begin: i,
                end: i,
                usage_count: 0,
                is_fp,
            };

            loop {
                // Forward scan for uses; a plain re-assignment closes the
                // range, a reading re-assignment (or cvt) extends it.
                let mut i1 = range.end + 1;
                while i1 < code.len() {
                    let reassigns = code[i1]
                        .assigns()
                        .map(|a| a.reg_id() == Some(reg))
                        .unwrap_or(false);
                    if reassigns {
                        if code[i1].op.reads_assigned_operand() || code[i1].involves(reg, true) {
                            range.end = i1;
                            range.usage_count += 1;
                            i1 += 1;
                            continue;
                        }
                        break;
                    }
                    if code[i1].involves(reg, false) {
                        range.end = i1;
                        range.usage_count += 1;
                    }
                    i1 += 1;
                }

                // Backward jumps into the range drag the end to the jump.
                let mut extended = false;
                for (j, instr) in code.iter().enumerate().skip(range.end + 1) {
                    let mut targets = Vec::new();
                    match instr.op {
                        Opcode::Jump => {
                            if let OperandKind::Label(l) = instr.operands[0].kind {
                                targets.push(l);
                            }
                        }
                        Opcode::Branch => {
                            for oi in [1, 2] {
                                if let OperandKind::Label(l) = instr.operands[oi].kind {
                                    targets.push(l);
                                }
                            }
                        }
                        _ => {}
                    }
                    for l in targets {
                        let Some(t) = func.label_target(l) else { continue };
                        if t > j {
                            continue;
                        }
                        if range.begin < t && range.end >= t && range.end < j {
                            range.end = j;
                            extended = true;
                        }
                    }
                }
                if !extended {
                    break;
                }
            }

            ranges.push(range);
        }

        Liveness { ranges }
    }

    /// True when `reg` holds a needed value at instruction `at`.
    pub fn is_live(&self, reg: RegisterId, at: usize) -> bool {
        self.ranges
            .iter()
            .any(|r| r.reg == reg && r.begin <= at && at <= r.end)
    }

    /// Every range of a register.
    pub fn ranges_for(&self, reg: RegisterId) -> Vec<&LiveRange> {
        self.ranges.iter().filter(|r| r.reg == reg).collect()
    }

    /// Map from register id to total downstream read count.
    pub fn usage_counts(&self) -> HashMap<RegisterId, u32> {
        let mut map = HashMap::new();
        for r in &self.ranges {
            *map.entry(r.reg).or_insert(0) += r.usage_count;
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{Instruction, Operand};
    use crate::source::SourceSpan;
    use crate::types::{DataType, TypeId, TypeRegistry};

    fn registry() -> (TypeRegistry, TypeId, TypeId) {
        let mut reg = TypeRegistry::new();
        reg.add(DataType::primitive("i32", 4, false, true)).unwrap();
        reg.add(DataType::primitive("f64", 8, true, true)).unwrap();
        reg.add(DataType::primitive("bool", 1, false, false)).unwrap();
        let i32_id = reg.get_by_name("i32").unwrap().id;
        let f64_id = reg.get_by_name("f64").unwrap().id;
        (reg, i32_id, f64_id)
    }

    fn instr(op: Opcode, ops: &[Operand]) -> Instruction {
        let mut i = Instruction::new(op, SourceSpan::default());
        for (n, o) in ops.iter().enumerate() {
            i.operands[n] = *o;
        }
        i
    }

    fn straight_line(i32_id: TypeId) -> FunctionDef {
        let mut f = FunctionDef::new("t");
        // %0 = 1; %1 = 2; %2 = %0 + %1; ret %2
        f.alloc_register();
        f.alloc_register();
        f.alloc_register();
        f.emit(instr(Opcode::Assign, &[Operand::reg(0, i32_id), Operand::imm(1, i32_id)]));
        f.emit(instr(Opcode::Assign, &[Operand::reg(1, i32_id), Operand::imm(2, i32_id)]));
        f.emit(instr(
            Opcode::IAdd,
            &[Operand::reg(2, i32_id), Operand::reg(0, i32_id), Operand::reg(1, i32_id)],
        ));
        f.emit(instr(Opcode::Ret, &[Operand::reg(2, i32_id)]));
        f
    }

    #[test]
    fn test_cfg_single_block() {
        let (_, i32_id, _) = registry();
        let f = straight_line(i32_id);
        let cfg = ControlFlowGraph::build(&f);
        assert_eq!(cfg.blocks.len(), 1);
        assert_eq!(cfg.blocks[0].begin, 0);
        assert_eq!(cfg.blocks[0].end, 4);
        assert!(cfg.is_well_formed(&f));
    }

    fn looped(i32_id: TypeId, bool_id: TypeId) -> FunctionDef {
        let mut f = FunctionDef::new("loop");
        for _ in 0..3 {
            f.alloc_register();
        }
        let header = f.alloc_label();
        let body = f.alloc_label();
        let exit = f.alloc_label();
        // %0 = 0
        f.emit(instr(Opcode::Assign, &[Operand::reg(0, i32_id), Operand::imm(0, i32_id)]));
        // header: %1 = %0 < 10; branch %1, body, exit
        f.emit(instr(Opcode::Label, &[Operand::label(header)]));
        f.emit(instr(
            Opcode::ILt,
            &[Operand::reg(1, bool_id), Operand::reg(0, i32_id), Operand::imm(10, i32_id)],
        ));
        f.emit(instr(
            Opcode::Branch,
            &[Operand::reg(1, bool_id), Operand::label(body), Operand::label(exit)],
        ));
        // body: %0++; jump header
        f.emit(instr(Opcode::Label, &[Operand::label(body)]));
        f.emit(instr(Opcode::IInc, &[Operand::reg(0, i32_id)]));
        f.emit(instr(Opcode::Jump, &[Operand::label(header)]));
        // exit: ret
        f.emit(instr(Opcode::Label, &[Operand::label(exit)]));
        f.emit(instr(Opcode::Ret, &[]));
        f
    }

    #[test]
    fn test_cfg_loop_detection() {
        let (reg, i32_id, _) = registry();
        let bool_id = reg.get_by_name("bool").unwrap().id;
        let f = looped(i32_id, bool_id);
        let cfg = ControlFlowGraph::build(&f);
        assert!(cfg.is_well_formed(&f));
        let header_block = cfg.block_at(1).unwrap();
        assert!(cfg.is_loop(header_block));
        let entry = cfg.block_at(0).unwrap();
        assert!(!cfg.is_loop(entry));
    }

    #[test]
    fn test_liveness_straight_line() {
        let (reg, i32_id, _) = registry();
        let f = straight_line(i32_id);
        let lv = Liveness::build(&f, &reg);
        let r0 = lv.ranges_for(0);
        assert_eq!(r0.len(), 1);
        assert_eq!((r0[0].begin, r0[0].end), (0, 2));
        let r2 = lv.ranges_for(2);
        assert_eq!((r2[0].begin, r2[0].end), (2, 3));
        assert!(lv.is_live(0, 1));
        assert!(!lv.is_live(0, 3));
    }

    #[test]
    fn test_liveness_loop_back_edge_extends() {
        let (reg, i32_id, _) = registry();
        let bool_id = reg.get_by_name("bool").unwrap().id;
        let f = looped(i32_id, bool_id);
        let lv = Liveness::build(&f, &reg);
        // %0 is written at 0, read at 2 and 5, and must stay live through
        // the backward jump at 6.
        let r0 = lv.ranges_for(0);
        assert_eq!(r0.len(), 1);
        assert_eq!(r0[0].begin, 0);
        assert_eq!(r0[0].end, 6);
    }

    #[test]
    fn test_liveness_fp_class() {
        let (reg, _, f64_id) = registry();
        let mut f = FunctionDef::new("fp");
        f.alloc_register();
        f.emit(instr(Opcode::Assign, &[Operand::reg(0, f64_id), Operand::imm(0, f64_id)]));
        f.emit(instr(Opcode::Ret, &[Operand::reg(0, f64_id)]));
        let lv = Liveness::build(&f, &reg);
        assert!(lv.ranges[0].is_fp);
    }
}
