//! The three-address intermediate representation.
//!
//! IR is linear: an instruction's index is its address. Virtual registers
//! are written once at emission time, except through `reserve`/`resolve`
//! pairs which exist to model phi-like joins for the optimizer and the
//! register allocator.

use crate::source::SourceSpan;
use crate::types::{FunctionId, TypeId};
use bitflags::bitflags;
use std::collections::HashMap;

/// Virtual register id
pub type RegisterId = u32;
/// Label id, unique within one function
pub type LabelId = u32;
/// Stack allocation id, unique within one function
pub type StackSlotId = u32;

/// Every IR opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Opcode {
    Noop,
    Label,
    StackAllocate,
    StackFree,
    ModuleData,
    Reserve,
    Resolve,
    Load,
    Store,
    Jump,
    Cvt,
    Param,
    Call,
    Ret,
    Branch,

    IAdd, UAdd, FAdd, DAdd,
    ISub, USub, FSub, DSub,
    IMul, UMul, FMul, DMul,
    IDiv, UDiv, FDiv, DDiv,
    IMod, UMod, FMod, DMod,
    ILt, ULt, FLt, DLt,
    ILte, ULte, FLte, DLte,
    IGt, UGt, FGt, DGt,
    IGte, UGte, FGte, DGte,
    IEq, UEq, FEq, DEq,
    INeq, UNeq, FNeq, DNeq,
    IInc, UInc, FInc, DInc,
    IDec, UDec, FDec, DDec,
    INeg, FNeg, DNeg,
    Not, Inv, Shl, Shr,
    LAnd, BAnd, LOr, BOr, Xor,
    Assign,
}

/// Declared operand classes of an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandClass {
    /// Operand unused
    Nil,
    /// Immediate value
    Imm,
    /// Label id
    Lbl,
    /// Virtual register
    Reg,
    /// Register or immediate
    Val,
    /// Function id or function pointer in a register
    Fun,
}

/// Static descriptor of an opcode
#[derive(Debug, Clone, Copy)]
pub struct OpcodeInfo {
    /// Mnemonic used in IR dumps
    pub name: &'static str,
    /// Number of meaningful operands
    pub operand_count: u8,
    /// Operand classes
    pub operands: [OperandClass; 3],
    /// Index of the operand assigned by the instruction, if any
    pub assigns_operand: Option<u8>,
}

macro_rules! opcode_table {
    ($($variant:ident => ($name:literal, $count:literal, [$a:ident, $b:ident, $c:ident], $assigns:expr);)*) => {
        impl Opcode {
            /// The static descriptor for this opcode.
            pub fn info(self) -> &'static OpcodeInfo {
                use OperandClass::*;
                match self {
                    $(Opcode::$variant => {
                        static INFO: OpcodeInfo = OpcodeInfo {
                            name: $name,
                            operand_count: $count,
                            operands: [$a, $b, $c],
                            assigns_operand: $assigns,
                        };
                        &INFO
                    })*
                }
            }
        }
    };
}

opcode_table! {
    Noop          => ("noop", 0, [Nil, Nil, Nil], None);
    Label         => ("label", 1, [Lbl, Nil, Nil], None);
    StackAllocate => ("stack_allocate", 3, [Reg, Imm, Imm], Some(0));
    StackFree     => ("stack_free", 1, [Imm, Nil, Nil], None);
    ModuleData    => ("module_data", 3, [Reg, Imm, Imm], Some(0));
    Reserve       => ("reserve", 1, [Reg, Nil, Nil], Some(0));
    Resolve       => ("resolve", 2, [Reg, Val, Nil], None);
    Load          => ("load", 2, [Reg, Val, Nil], Some(0));
    Store         => ("store", 2, [Val, Val, Nil], None);
    Jump          => ("jump", 1, [Lbl, Nil, Nil], None);
    Cvt           => ("cvt", 3, [Reg, Val, Imm], Some(0));
    Param         => ("param", 1, [Val, Nil, Nil], None);
    Call          => ("call", 2, [Fun, Reg, Nil], Some(1));
    Ret           => ("ret", 1, [Val, Nil, Nil], None);
    Branch        => ("branch", 3, [Val, Lbl, Lbl], None);

    IAdd => ("iadd", 3, [Reg, Val, Val], Some(0));
    UAdd => ("uadd", 3, [Reg, Val, Val], Some(0));
    FAdd => ("fadd", 3, [Reg, Val, Val], Some(0));
    DAdd => ("dadd", 3, [Reg, Val, Val], Some(0));
    ISub => ("isub", 3, [Reg, Val, Val], Some(0));
    USub => ("usub", 3, [Reg, Val, Val], Some(0));
    FSub => ("fsub", 3, [Reg, Val, Val], Some(0));
    DSub => ("dsub", 3, [Reg, Val, Val], Some(0));
    IMul => ("imul", 3, [Reg, Val, Val], Some(0));
    UMul => ("umul", 3, [Reg, Val, Val], Some(0));
    FMul => ("fmul", 3, [Reg, Val, Val], Some(0));
    DMul => ("dmul", 3, [Reg, Val, Val], Some(0));
    IDiv => ("idiv", 3, [Reg, Val, Val], Some(0));
    UDiv => ("udiv", 3, [Reg, Val, Val], Some(0));
    FDiv => ("fdiv", 3, [Reg, Val, Val], Some(0));
    DDiv => ("ddiv", 3, [Reg, Val, Val], Some(0));
    IMod => ("imod", 3, [Reg, Val, Val], Some(0));
    UMod => ("umod", 3, [Reg, Val, Val], Some(0));
    FMod => ("fmod", 3, [Reg, Val, Val], Some(0));
    DMod => ("dmod", 3, [Reg, Val, Val], Some(0));
    ILt  => ("ilt", 3, [Reg, Val, Val], Some(0));
    ULt  => ("ult", 3, [Reg, Val, Val], Some(0));
    FLt  => ("flt", 3, [Reg, Val, Val], Some(0));
    DLt  => ("dlt", 3, [Reg, Val, Val], Some(0));
    ILte => ("ilte", 3, [Reg, Val, Val], Some(0));
    ULte => ("ulte", 3, [Reg, Val, Val], Some(0));
    FLte => ("flte", 3, [Reg, Val, Val], Some(0));
    DLte => ("dlte", 3, [Reg, Val, Val], Some(0));
    IGt  => ("igt", 3, [Reg, Val, Val], Some(0));
    UGt  => ("ugt", 3, [Reg, Val, Val], Some(0));
    FGt  => ("fgt", 3, [Reg, Val, Val], Some(0));
    DGt  => ("dgt", 3, [Reg, Val, Val], Some(0));
    IGte => ("igte", 3, [Reg, Val, Val], Some(0));
    UGte => ("ugte", 3, [Reg, Val, Val], Some(0));
    FGte => ("fgte", 3, [Reg, Val, Val], Some(0));
    DGte => ("dgte", 3, [Reg, Val, Val], Some(0));
    IEq  => ("ieq", 3, [Reg, Val, Val], Some(0));
    UEq  => ("ueq", 3, [Reg, Val, Val], Some(0));
    FEq  => ("feq", 3, [Reg, Val, Val], Some(0));
    DEq  => ("deq", 3, [Reg, Val, Val], Some(0));
    INeq => ("ineq", 3, [Reg, Val, Val], Some(0));
    UNeq => ("uneq", 3, [Reg, Val, Val], Some(0));
    FNeq => ("fneq", 3, [Reg, Val, Val], Some(0));
    DNeq => ("dneq", 3, [Reg, Val, Val], Some(0));
    IInc => ("iinc", 1, [Reg, Nil, Nil], Some(0));
    UInc => ("uinc", 1, [Reg, Nil, Nil], Some(0));
    FInc => ("finc", 1, [Reg, Nil, Nil], Some(0));
    DInc => ("dinc", 1, [Reg, Nil, Nil], Some(0));
    IDec => ("idec", 1, [Reg, Nil, Nil], Some(0));
    UDec => ("udec", 1, [Reg, Nil, Nil], Some(0));
    FDec => ("fdec", 1, [Reg, Nil, Nil], Some(0));
    DDec => ("ddec", 1, [Reg, Nil, Nil], Some(0));
    INeg => ("ineg", 2, [Reg, Val, Nil], Some(0));
    FNeg => ("fneg", 2, [Reg, Val, Nil], Some(0));
    DNeg => ("dneg", 2, [Reg, Val, Nil], Some(0));
    Not  => ("not", 2, [Reg, Val, Nil], Some(0));
    Inv  => ("inv", 2, [Reg, Val, Nil], Some(0));
    Shl  => ("shl", 3, [Reg, Val, Val], Some(0));
    Shr  => ("shr", 3, [Reg, Val, Val], Some(0));
    LAnd => ("land", 3, [Reg, Val, Val], Some(0));
    BAnd => ("band", 3, [Reg, Val, Val], Some(0));
    LOr  => ("lor", 3, [Reg, Val, Val], Some(0));
    BOr  => ("bor", 3, [Reg, Val, Val], Some(0));
    Xor  => ("xor", 3, [Reg, Val, Val], Some(0));
    Assign => ("assign", 2, [Reg, Val, Nil], Some(0));
}

impl Opcode {
    /// Every opcode in its stable serialization order. The cache format
    /// stores an opcode as its index into this table.
    pub const ALL: [Opcode; 80] = [
        Opcode::Noop, Opcode::Label, Opcode::StackAllocate, Opcode::StackFree,
        Opcode::ModuleData, Opcode::Reserve, Opcode::Resolve, Opcode::Load, Opcode::Store,
        Opcode::Jump, Opcode::Cvt, Opcode::Param, Opcode::Call, Opcode::Ret, Opcode::Branch,
        Opcode::IAdd, Opcode::UAdd, Opcode::FAdd, Opcode::DAdd,
        Opcode::ISub, Opcode::USub, Opcode::FSub, Opcode::DSub,
        Opcode::IMul, Opcode::UMul, Opcode::FMul, Opcode::DMul,
        Opcode::IDiv, Opcode::UDiv, Opcode::FDiv, Opcode::DDiv,
        Opcode::IMod, Opcode::UMod, Opcode::FMod, Opcode::DMod,
        Opcode::ILt, Opcode::ULt, Opcode::FLt, Opcode::DLt,
        Opcode::ILte, Opcode::ULte, Opcode::FLte, Opcode::DLte,
        Opcode::IGt, Opcode::UGt, Opcode::FGt, Opcode::DGt,
        Opcode::IGte, Opcode::UGte, Opcode::FGte, Opcode::DGte,
        Opcode::IEq, Opcode::UEq, Opcode::FEq, Opcode::DEq,
        Opcode::INeq, Opcode::UNeq, Opcode::FNeq, Opcode::DNeq,
        Opcode::IInc, Opcode::UInc, Opcode::FInc, Opcode::DInc,
        Opcode::IDec, Opcode::UDec, Opcode::FDec, Opcode::DDec,
        Opcode::INeg, Opcode::FNeg, Opcode::DNeg,
        Opcode::Not, Opcode::Inv, Opcode::Shl, Opcode::Shr,
        Opcode::LAnd, Opcode::BAnd, Opcode::LOr, Opcode::BOr, Opcode::Xor,
        Opcode::Assign,
    ];

    /// Index into [`Opcode::ALL`].
    pub fn index(self) -> u8 {
        Self::ALL.iter().position(|o| *o == self).expect("opcode in table") as u8
    }

    /// Inverse of [`Opcode::index`].
    pub fn from_index(idx: u8) -> Option<Opcode> {
        Self::ALL.get(idx as usize).copied()
    }

    /// True for instructions whose assigned operand is also an input
    /// (`cvt`, the inc/dec family). Liveness must keep the old value
    /// alive up to them.
    pub fn reads_assigned_operand(self) -> bool {
        matches!(
            self,
            Opcode::Cvt
                | Opcode::IInc
                | Opcode::UInc
                | Opcode::FInc
                | Opcode::DInc
                | Opcode::IDec
                | Opcode::UDec
                | Opcode::FDec
                | Opcode::DDec
        )
    }
}

bitflags! {
    /// Attribute bits on an IR value
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ValueFlags: u8 {
        const POINTER   = 1 << 0;
        const READ_ONLY = 1 << 1;
    }
}

/// Post-allocation location of a register operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Physical register index within its class
    Physical(u16),
    /// Spilled to a stack slot
    Spilled(StackSlotId),
}

/// What an operand refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// Slot unused
    None,
    /// Virtual register
    Register(RegisterId),
    /// Immediate bits
    Immediate(u64),
    /// Pointer to a stack allocation
    StackSlot(StackSlotId),
    /// Function argument by index
    Argument(u32),
    /// Pointer into a module's global storage
    ModuleData {
        /// Owning module id
        module: u32,
        /// Global slot index
        slot: u32,
    },
    /// A type used as a value (template args, cvt targets)
    TypeRef(TypeId),
    /// A function
    FunctionRef(FunctionId),
    /// A module
    ModuleRef(u32),
    /// Branch/jump target
    Label(LabelId),
}

/// One IR operand: what it refers to, its type, its flags, and the
/// physical location assigned by the register allocator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Operand {
    /// Referent
    pub kind: OperandKind,
    /// Value type
    pub type_id: TypeId,
    /// Pointer/read-only bits
    pub flags: ValueFlags,
    /// Filled in by register allocation
    pub location: Option<Location>,
}

impl Operand {
    /// The unused operand.
    pub fn none() -> Self {
        Operand {
            kind: OperandKind::None,
            type_id: 0,
            flags: ValueFlags::empty(),
            location: None,
        }
    }

    /// A virtual register of the given type.
    pub fn reg(id: RegisterId, type_id: TypeId) -> Self {
        Operand {
            kind: OperandKind::Register(id),
            type_id,
            flags: ValueFlags::empty(),
            location: None,
        }
    }

    /// An immediate with raw bits and a type.
    pub fn imm(bits: u64, type_id: TypeId) -> Self {
        Operand {
            kind: OperandKind::Immediate(bits),
            type_id,
            flags: ValueFlags::empty(),
            location: None,
        }
    }

    /// A label operand.
    pub fn label(id: LabelId) -> Self {
        Operand {
            kind: OperandKind::Label(id),
            type_id: 0,
            flags: ValueFlags::empty(),
            location: None,
        }
    }

    /// A function operand.
    pub fn func(id: FunctionId) -> Self {
        Operand {
            kind: OperandKind::FunctionRef(id),
            type_id: 0,
            flags: ValueFlags::empty(),
            location: None,
        }
    }

    /// An argument-slot operand.
    pub fn arg(index: u32, type_id: TypeId) -> Self {
        Operand {
            kind: OperandKind::Argument(index),
            type_id,
            flags: ValueFlags::empty(),
            location: None,
        }
    }

    /// A stack-slot pointer operand.
    pub fn stack(id: StackSlotId, type_id: TypeId) -> Self {
        Operand {
            kind: OperandKind::StackSlot(id),
            type_id,
            flags: ValueFlags::POINTER,
            location: None,
        }
    }

    /// True for any used operand.
    pub fn is_valid(&self) -> bool {
        self.kind != OperandKind::None
    }

    /// The register id, if this is a register operand.
    pub fn reg_id(&self) -> Option<RegisterId> {
        match self.kind {
            OperandKind::Register(id) => Some(id),
            _ => None,
        }
    }

    /// True for immediates.
    pub fn is_imm(&self) -> bool {
        matches!(self.kind, OperandKind::Immediate(_))
    }

    /// True for argument slots.
    pub fn is_arg(&self) -> bool {
        matches!(self.kind, OperandKind::Argument(_))
    }

    /// Immediate bits, if this is an immediate.
    pub fn imm_bits(&self) -> Option<u64> {
        match self.kind {
            OperandKind::Immediate(bits) => Some(bits),
            _ => None,
        }
    }

    /// Marks the operand read-only and returns it.
    pub fn read_only(mut self) -> Self {
        self.flags |= ValueFlags::READ_ONLY;
        self
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.kind {
            OperandKind::None => write!(f, "_"),
            OperandKind::Register(id) => match self.location {
                Some(Location::Physical(p)) => write!(f, "${}", p),
                Some(Location::Spilled(s)) => write!(f, "[slot {}]", s),
                None => write!(f, "%{}", id),
            },
            OperandKind::Immediate(bits) => write!(f, "{}", bits as i64),
            OperandKind::StackSlot(id) => write!(f, "&stack{}", id),
            OperandKind::Argument(i) => write!(f, "arg{}", i),
            OperandKind::ModuleData { module, slot } => write!(f, "@{}:{}", module, slot),
            OperandKind::TypeRef(id) => write!(f, "type({:#x})", id),
            OperandKind::FunctionRef(id) => write!(f, "fn#{}", id),
            OperandKind::ModuleRef(id) => write!(f, "module#{}", id),
            OperandKind::Label(id) => write!(f, "L{}", id),
        }
    }
}

/// One IR instruction: opcode, up to three operands, source location.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// Opcode
    pub op: Opcode,
    /// Operand slots; unused slots hold `Operand::none()`
    pub operands: [Operand; 3],
    /// Source location the instruction was lowered from
    pub span: SourceSpan,
}

impl Instruction {
    /// Creates an instruction with empty operands.
    pub fn new(op: Opcode, span: SourceSpan) -> Self {
        Instruction {
            op,
            operands: [Operand::none(), Operand::none(), Operand::none()],
            span,
        }
    }

    /// The operand this instruction assigns, when it is a register.
    pub fn assigns(&self) -> Option<&Operand> {
        let idx = self.op.info().assigns_operand? as usize;
        let op = &self.operands[idx];
        op.reg_id().map(|_| op)
    }

    /// True when `reg` appears in any operand; with `exclude_assignment`
    /// the assigned operand itself does not count.
    pub fn involves(&self, reg: RegisterId, exclude_assignment: bool) -> bool {
        let assigns_idx = self.op.info().assigns_operand.map(|i| i as usize);
        self.operands.iter().enumerate().any(|(i, op)| {
            if exclude_assignment && Some(i) == assigns_idx {
                return false;
            }
            op.reg_id() == Some(reg)
        })
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let info = self.op.info();
        write!(f, "{}", info.name)?;
        for i in 0..info.operand_count as usize {
            if self.operands[i].is_valid() {
                write!(f, " {}", self.operands[i])?;
            }
        }
        Ok(())
    }
}

/// One stack allocation within a function frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackAlloc {
    /// Allocation id referenced by `stack_allocate`/`stack_free`
    pub id: StackSlotId,
    /// Size in bytes
    pub size: u32,
}

/// The code holder for one function: the linear instruction list plus
/// its stack allocations and label table.
#[derive(Debug, Clone, Default)]
pub struct FunctionDef {
    /// Registry id once the function is registered
    pub function_id: Option<FunctionId>,
    /// Name for dumps and diagnostics
    pub name: String,
    /// Linear instruction list
    pub code: Vec<Instruction>,
    /// Stack allocations by id
    pub stack: Vec<StackAlloc>,
    /// Label id to instruction index, rebuilt after mutation
    pub labels: HashMap<LabelId, usize>,
    next_reg: RegisterId,
    next_label: LabelId,
    next_stack: StackSlotId,
}

impl FunctionDef {
    /// Creates an empty function body.
    pub fn new(name: impl Into<String>) -> Self {
        FunctionDef {
            name: name.into(),
            ..FunctionDef::default()
        }
    }

    /// Appends an instruction and returns its index.
    pub fn emit(&mut self, instr: Instruction) -> usize {
        if instr.op == Opcode::Label {
            if let OperandKind::Label(id) = instr.operands[0].kind {
                self.labels.insert(id, self.code.len());
            }
        }
        self.code.push(instr);
        self.code.len() - 1
    }

    /// Allocates a fresh virtual register id.
    pub fn alloc_register(&mut self) -> RegisterId {
        let id = self.next_reg;
        self.next_reg += 1;
        id
    }

    /// Allocates a fresh label id.
    pub fn alloc_label(&mut self) -> LabelId {
        let id = self.next_label;
        self.next_label += 1;
        id
    }

    /// Records a stack allocation and returns its id.
    pub fn alloc_stack(&mut self, size: u32) -> StackSlotId {
        let id = self.next_stack;
        self.next_stack += 1;
        self.stack.push(StackAlloc { id, size });
        id
    }

    /// Size of a stack allocation.
    pub fn stack_size(&self, id: StackSlotId) -> Option<u32> {
        self.stack.iter().find(|a| a.id == id).map(|a| a.size)
    }

    /// Total frame bytes for all stack allocations.
    pub fn frame_size(&self) -> u32 {
        self.stack.iter().map(|a| a.size).sum()
    }

    /// Rebuilds the label table after instructions moved.
    pub fn rebuild_labels(&mut self) {
        self.labels.clear();
        for (i, instr) in self.code.iter().enumerate() {
            if instr.op == Opcode::Label {
                if let OperandKind::Label(id) = instr.operands[0].kind {
                    self.labels.insert(id, i);
                }
            }
        }
    }

    /// Instruction index of a label.
    pub fn label_target(&self, label: LabelId) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    /// Highest allocated register id plus one.
    pub fn register_count(&self) -> u32 {
        self.next_reg
    }

    /// Renders the whole body, one instruction per line.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, instr) in self.code.iter().enumerate() {
            out.push_str(&format!("{:4}: {}\n", i, instr));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_table() {
        assert_eq!(Opcode::IAdd.info().name, "iadd");
        assert_eq!(Opcode::IAdd.info().assigns_operand, Some(0));
        assert_eq!(Opcode::Branch.info().operand_count, 3);
        assert_eq!(Opcode::Branch.info().assigns_operand, None);
        // resolve does not count as an assignment
        assert_eq!(Opcode::Resolve.info().assigns_operand, None);
        assert_eq!(Opcode::Reserve.info().assigns_operand, Some(0));
        assert_eq!(Opcode::Call.info().assigns_operand, Some(1));
    }

    #[test]
    fn test_assigns_and_involves() {
        let mut i = Instruction::new(Opcode::IAdd, SourceSpan::default());
        i.operands[0] = Operand::reg(1, 0);
        i.operands[1] = Operand::reg(1, 0);
        i.operands[2] = Operand::reg(2, 0);
        assert_eq!(i.assigns().unwrap().reg_id(), Some(1));
        assert!(i.involves(1, false));
        assert!(i.involves(1, true)); // also read
        assert!(i.involves(2, true));
        assert!(!i.involves(3, false));

        let mut only_dst = Instruction::new(Opcode::Assign, SourceSpan::default());
        only_dst.operands[0] = Operand::reg(5, 0);
        only_dst.operands[1] = Operand::imm(7, 0);
        assert!(only_dst.involves(5, false));
        assert!(!only_dst.involves(5, true));
    }

    #[test]
    fn test_labels_track_emission() {
        let mut f = FunctionDef::new("t");
        let l = f.alloc_label();
        let mut li = Instruction::new(Opcode::Label, SourceSpan::default());
        li.operands[0] = Operand::label(l);
        f.emit(Instruction::new(Opcode::Noop, SourceSpan::default()));
        let idx = f.emit(li);
        assert_eq!(f.label_target(l), Some(idx));
        f.code.insert(0, Instruction::new(Opcode::Noop, SourceSpan::default()));
        f.rebuild_labels();
        assert_eq!(f.label_target(l), Some(idx + 1));
    }

    #[test]
    fn test_display() {
        let mut i = Instruction::new(Opcode::Assign, SourceSpan::default());
        i.operands[0] = Operand::reg(3, 0);
        i.operands[1] = Operand::imm(5, 0);
        assert_eq!(i.to_string(), "assign %3 5");
    }
}
