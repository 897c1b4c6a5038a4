//! Linear-scan register allocation.
//!
//! Walks live ranges in start order with two parallel allocators (general
//! purpose and floating point). When a class runs out of registers the
//! active range with the furthest end is spilled to a stack slot, unless
//! the incoming range ends even later, in which case it spills itself.

use super::cfg::{LiveRange, Liveness};
use super::ir::{FunctionDef, Location, StackSlotId};
use crate::types::TypeRegistry;

/// Where one live range ended up.
#[derive(Debug, Clone)]
pub struct RangeAssignment {
    /// The allocated range
    pub range: LiveRange,
    /// Physical register or spill slot
    pub location: Location,
}

/// Result of allocating one function.
#[derive(Debug, Clone, Default)]
pub struct AllocationResult {
    /// Every range with its final location
    pub assignments: Vec<RangeAssignment>,
    /// Stack bytes added for spills
    pub spill_bytes: u32,
    /// Number of spilled ranges
    pub spill_count: u32,
}

impl AllocationResult {
    /// Assignments that received a physical register.
    pub fn in_registers(&self) -> impl Iterator<Item = &RangeAssignment> {
        self.assignments
            .iter()
            .filter(|a| matches!(a.location, Location::Physical(_)))
    }

    /// Assignments that were spilled.
    pub fn spilled(&self) -> impl Iterator<Item = &RangeAssignment> {
        self.assignments
            .iter()
            .filter(|a| matches!(a.location, Location::Spilled(_)))
    }
}

/// Allocates `func`'s virtual registers onto a register file with
/// `gp_count` integer and `fp_count` floating-point registers, rewriting
/// every operand in each range's span with its physical location.
pub fn allocate(
    func: &mut FunctionDef,
    types: &TypeRegistry,
    gp_count: u16,
    fp_count: u16,
) -> AllocationResult {
    let liveness = Liveness::build(func, types);
    let (gp, fp): (Vec<LiveRange>, Vec<LiveRange>) =
        liveness.ranges.into_iter().partition(|r| !r.is_fp);

    let mut result = AllocationResult::default();
    scan_class(func, types, gp, gp_count, &mut result);
    scan_class(func, types, fp, fp_count, &mut result);
    rewrite_operands(func, &result);
    result
}

fn spill_slot(func: &mut FunctionDef, types: &TypeRegistry, range: &LiveRange) -> (StackSlotId, u32) {
    // spill size: the value's own size for primitives, pointer size for
    // anything held by reference
    let type_id = func.code[range.begin]
        .assigns()
        .map(|a| a.type_id)
        .unwrap_or(0);
    let size = types
        .effective(type_id)
        .filter(|t| t.is_primitive())
        .map(|t| t.size)
        .unwrap_or(8);
    (func.alloc_stack(size), size)
}

fn scan_class(
    func: &mut FunctionDef,
    types: &TypeRegistry,
    mut ranges: Vec<LiveRange>,
    k: u16,
    result: &mut AllocationResult,
) {
    ranges.sort_by_key(|r| r.begin);

    let mut free: Vec<u16> = (0..k).rev().collect();
    // active assignments, kept sorted by range end
    let mut active: Vec<(LiveRange, u16)> = Vec::new();

    for current in ranges {
        // a class with no registers at all spills everything
        if k == 0 {
            let (slot, size) = spill_slot(func, types, &current);
            result.assignments.push(RangeAssignment {
                range: current,
                location: Location::Spilled(slot),
            });
            result.spill_bytes += size;
            result.spill_count += 1;
            continue;
        }

        // expire ranges that ended before this one begins
        let mut expired = 0;
        while expired < active.len() && active[expired].0.end < current.begin {
            expired += 1;
        }
        for (range, phys) in active.drain(..expired) {
            free.push(phys);
            result.assignments.push(RangeAssignment {
                range,
                location: Location::Physical(phys),
            });
        }

        if let Some(phys) = free.pop() {
            active.push((current, phys));
            active.sort_by_key(|(r, _)| r.end);
            continue;
        }

        // register pressure: spill the furthest-ending range
        let (victim, victim_phys) = active.last().cloned().expect("k > 0");
        if victim.end > current.end {
            let (slot, size) = spill_slot(func, types, &victim);
            tracing::debug!(
                reg = victim.reg,
                slot,
                func = %func.name,
                "spilling active range"
            );
            result.assignments.push(RangeAssignment {
                range: victim,
                location: Location::Spilled(slot),
            });
            result.spill_bytes += size;
            result.spill_count += 1;
            active.pop();
            active.push((current, victim_phys));
            active.sort_by_key(|(r, _)| r.end);
        } else {
            let (slot, size) = spill_slot(func, types, &current);
            tracing::debug!(reg = current.reg, slot, func = %func.name, "spilling incoming range");
            result.assignments.push(RangeAssignment {
                range: current,
                location: Location::Spilled(slot),
            });
            result.spill_bytes += size;
            result.spill_count += 1;
        }
    }

    for (range, phys) in active {
        result.assignments.push(RangeAssignment {
            range,
            location: Location::Physical(phys),
        });
    }
}

fn rewrite_operands(func: &mut FunctionDef, result: &AllocationResult) {
    for assignment in &result.assignments {
        let range = &assignment.range;
        for idx in range.begin..=range.end.min(func.code.len() - 1) {
            for op in func.code[idx].operands.iter_mut() {
                if op.reg_id() == Some(range.reg) {
                    op.location = Some(assignment.location);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{Instruction, Opcode, Operand};
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

    /// Three values all live at once on a two-register machine.
    fn pressured(t: TypeId) -> FunctionDef {
        let mut f = FunctionDef::new("pressure");
        for _ in 0..5 {
            f.alloc_register();
        }
        f.emit(instr(Opcode::Assign, &[Operand::reg(0, t), Operand::imm(1, t)]));
        f.emit(instr(Opcode::Assign, &[Operand::reg(1, t), Operand::imm(2, t)]));
        f.emit(instr(Opcode::Assign, &[Operand::reg(2, t), Operand::imm(3, t)]));
        f.emit(instr(
            Opcode::IAdd,
            &[Operand::reg(3, t), Operand::reg(0, t), Operand::reg(1, t)],
        ));
        f.emit(instr(
            Opcode::IAdd,
            &[Operand::reg(4, t), Operand::reg(3, t), Operand::reg(2, t)],
        ));
        f.emit(instr(Opcode::Ret, &[Operand::reg(4, t)]));
        f
    }

    #[test]
    fn test_spill_exactly_one_of_three() {
        let (types, t) = registry();
        let mut f = pressured(t);
        let result = allocate(&mut f, &types, 2, 2);

        assert_eq!(result.spill_count, 1);
        let spilled: Vec<_> = result.spilled().collect();
        assert_eq!(spilled.len(), 1);
        // the other overlapping values hold registers
        assert!(result.in_registers().count() >= 2);
        // frame grew by the spilled value's size
        assert_eq!(result.spill_bytes, 4);
        assert_eq!(f.frame_size(), 4);
    }

    #[test]
    fn test_no_overlapping_ranges_share_register() {
        let (types, t) = registry();
        let mut f = pressured(t);
        let result = allocate(&mut f, &types, 2, 2);

        let regs: Vec<_> = result.in_registers().collect();
        for (i, a) in regs.iter().enumerate() {
            for b in regs.iter().skip(i + 1) {
                if a.location == b.location && a.range.is_fp == b.range.is_fp {
                    assert!(
                        !a.range.overlaps(&b.range),
                        "{:?} and {:?} share {:?}",
                        a.range,
                        b.range,
                        a.location
                    );
                }
            }
        }
    }

    #[test]
    fn test_operands_rewritten() {
        let (types, t) = registry();
        let mut f = pressured(t);
        allocate(&mut f, &types, 2, 2);

        // every register operand inside a live range carries a location
        for instr in &f.code {
            for op in &instr.operands {
                if op.reg_id().is_some() {
                    assert!(op.location.is_some(), "unannotated operand in {}", instr);
                }
            }
        }
    }

    #[test]
    fn test_enough_registers_no_spill() {
        let (types, t) = registry();
        let mut f = pressured(t);
        let result = allocate(&mut f, &types, 4, 4);
        assert_eq!(result.spill_count, 0);
        assert_eq!(f.frame_size(), 0);
    }

    #[test]
    fn test_sequential_ranges_reuse_register() {
        let (types, t) = registry();
        let mut f = FunctionDef::new("seq");
        for _ in 0..2 {
            f.alloc_register();
        }
        // %0 dies before %1 is born; one register suffices
        f.emit(instr(Opcode::Assign, &[Operand::reg(0, t), Operand::imm(1, t)]));
        f.emit(instr(Opcode::Param, &[Operand::reg(0, t)]));
        f.emit(instr(Opcode::Assign, &[Operand::reg(1, t), Operand::imm(2, t)]));
        f.emit(instr(Opcode::Ret, &[Operand::reg(1, t)]));
        let result = allocate(&mut f, &types, 1, 1);
        assert_eq!(result.spill_count, 0);
    }
}
