//! The bytecode VM backend.
//!
//! Lowers each IR instruction to one or two VM instructions over a
//! register machine: 12 allocatable registers per class plus two scratch
//! registers each used to shuttle spilled values (a spill store precedes
//! and a reload follows every use of a spilled range). The interpreter
//! in this module is the reference executor for the generated artifact;
//! it owns the VM memory (module data, strings, stack, heap) and the
//! host-call boundary.

use super::Backend;
use crate::bind::CallContext;
use crate::compiler::{
    CompilationOutput, Context, FunctionDef, Location, Opcode, Operand, OperandKind,
};
use crate::error::{Error, ErrorCode, Result, RuntimeError};
use crate::source::SourceSpan;
use crate::types::{ArgKind, FunctionAddress, FunctionFlags, FunctionId, TypeId};
use std::collections::HashMap;

/// Registers visible to the allocator; two more per class are scratch.
const ALLOCATABLE: u16 = 12;
const SCRATCH0: u8 = 12;
const SCRATCH1: u8 = 13;
/// Call recursion bound for the interpreter.
const MAX_CALL_DEPTH: u32 = 1024;
/// Low addresses trap as null dereferences.
const NULL_GUARD: u32 = 64;

/// VM sizing options (CLI `-s` and `-m`).
#[derive(Debug, Clone, Copy)]
pub struct VmOptions {
    /// Stack bytes
    pub stack_size: u32,
    /// Heap bytes
    pub heap_size: u32,
    /// Trace each executed instruction
    pub log_exec: bool,
    /// Dump lowered VM instructions per function
    pub log_instructions: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            stack_size: 8 * 1024 * 1024,
            heap_size: 8 * 1024 * 1024,
            log_exec: false,
            log_instructions: false,
        }
    }
}

/// A value source
#[derive(Debug, Clone, Copy)]
enum Src {
    Reg(u8),
    FReg(u8),
    /// Raw bits; floating-point immediates are normalized to f64 bits
    Imm(u64),
}

/// A value destination
#[derive(Debug, Clone, Copy)]
enum Dst {
    Reg(u8),
    FReg(u8),
}

/// Primitive class used by `cvt`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumKind {
    Signed(u8),
    Unsigned(u8),
    F32,
    F64,
    Bool,
}

/// One VM instruction
#[derive(Debug, Clone, Copy)]
enum VmOp {
    Nop,
    Mov { dst: Dst, src: Src },
    LoadArg { dst: Dst, index: u16 },
    StackAddr { dst: u8, offset: u32 },
    ModuleAddr { dst: u8, module: u32, slot: u32 },
    StringAddr { dst: u8, module: u32, index: u32 },
    SpillLoad { dst: Dst, offset: u32 },
    SpillStore { src: Src, offset: u32 },
    Load { dst: Dst, addr: Src, size: u8 },
    Store { src: Src, addr: Src, size: u8 },
    Alu { op: Opcode, dst: Dst, a: Src, b: Src },
    Un { op: Opcode, dst: Dst, a: Src },
    Cvt { dst: Dst, src: Src, from: NumKind, to: NumKind },
    Param { src: Src },
    Call { func: FunctionId, dst: Option<Dst> },
    Jump { target: u32 },
    Branch { cond: Src, t: u32, f: u32 },
    Ret { src: Option<Src> },
}

/// The bytecode VM: emitter + interpreter + memory.
pub struct VmBackend {
    options: VmOptions,
    code: Vec<VmOp>,
    /// instruction index → source location
    source_map: Vec<SourceSpan>,
    entries: HashMap<FunctionId, u32>,
    frame_sizes: HashMap<FunctionId, u32>,
    memory: Vec<u8>,
    module_base: HashMap<u32, u32>,
    string_addr: HashMap<(u32, u32), u32>,
    stack_base: u32,
    stack_ptr: u32,
    heap_base: u32,
    heap_top: u32,
    free_list: Vec<(u32, u32)>,
    params: Vec<u64>,
    depth: u32,
    runtime_ready: bool,
}

impl VmBackend {
    /// Creates a VM with the given sizing.
    pub fn new(options: VmOptions) -> Self {
        VmBackend {
            options,
            code: Vec::new(),
            source_map: Vec::new(),
            entries: HashMap::new(),
            frame_sizes: HashMap::new(),
            memory: vec![0; NULL_GUARD as usize],
            module_base: HashMap::new(),
            string_addr: HashMap::new(),
            stack_base: 0,
            stack_ptr: 0,
            heap_base: 0,
            heap_top: 0,
            free_list: Vec::new(),
            params: Vec::new(),
            depth: 0,
            runtime_ready: false,
        }
    }

    /// The instruction-index → source map.
    pub fn source_map(&self) -> &[SourceSpan] {
        &self.source_map
    }

    fn runtime_error(&self, code: ErrorCode, message: String, pc: usize) -> Error {
        let span = self.source_map.get(pc).copied();
        Error::Runtime(RuntimeError {
            code,
            message,
            span,
        })
    }

    fn ensure_runtime(&mut self) {
        if self.runtime_ready {
            return;
        }
        self.stack_base = self.memory.len() as u32;
        self.memory
            .resize(self.memory.len() + self.options.stack_size as usize, 0);
        self.heap_base = self.memory.len() as u32;
        self.memory
            .resize(self.memory.len() + self.options.heap_size as usize, 0);
        self.stack_ptr = self.stack_base;
        self.heap_top = self.heap_base;
        self.runtime_ready = true;
    }

    fn alloc_raw(&mut self, size: u32) -> Option<u32> {
        let size = size.max(1).div_ceil(8) * 8;
        if let Some(pos) = self.free_list.iter().position(|(_, s)| *s >= size) {
            let (addr, _) = self.free_list.remove(pos);
            return Some(addr);
        }
        if self.heap_top + size > self.heap_base + self.options.heap_size {
            return None;
        }
        let addr = self.heap_top;
        self.heap_top += size;
        Some(addr)
    }
}

// ---------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------

struct Emitter<'a> {
    ctx: &'a Context,
    module_id: u32,
    code: Vec<VmOp>,
    spans: Vec<SourceSpan>,
    base: u32,
    labels: HashMap<u32, u32>,
    /// (instruction, label, branch slot: 0 = jump/true, 1 = false)
    patches: Vec<(usize, u32, u8)>,
    slot_offsets: HashMap<u32, u32>,
    scratch_toggle: bool,
}

impl<'a> Emitter<'a> {
    fn is_fp(&self, type_id: TypeId) -> bool {
        self.ctx
            .types
            .read()
            .effective(type_id)
            .map(|t| t.is_floating_point())
            .unwrap_or(false)
    }

    fn type_size(&self, type_id: TypeId) -> u8 {
        self.ctx
            .types
            .read()
            .effective(type_id)
            .map(|t| {
                if t.is_primitive() {
                    t.size.clamp(1, 8) as u8
                } else {
                    8
                }
            })
            .unwrap_or(8)
    }

    fn num_kind(&self, type_id: TypeId) -> NumKind {
        let types = self.ctx.types.read();
        let Some(t) = types.effective(type_id) else {
            return NumKind::Signed(8);
        };
        if t.id == self.ctx.prims.bool_ {
            NumKind::Bool
        } else if t.is_floating_point() {
            if t.size == 4 {
                NumKind::F32
            } else {
                NumKind::F64
            }
        } else if t.is_unsigned() {
            NumKind::Unsigned(t.size.clamp(1, 8) as u8)
        } else {
            NumKind::Signed(t.size.clamp(1, 8) as u8)
        }
    }

    fn emit(&mut self, op: VmOp, span: SourceSpan) -> usize {
        self.code.push(op);
        self.spans.push(span);
        self.code.len() - 1
    }

    fn scratch(&mut self) -> u8 {
        self.scratch_toggle = !self.scratch_toggle;
        if self.scratch_toggle {
            SCRATCH0
        } else {
            SCRATCH1
        }
    }

    /// Lowers a source operand, reloading spilled values through scratch.
    fn src_of(&mut self, op: &Operand, span: SourceSpan) -> Result<Src> {
        let fp = self.is_fp(op.type_id);
        match op.kind {
            OperandKind::Register(_) => match op.location {
                Some(Location::Physical(p)) => Ok(if fp {
                    Src::FReg(p as u8)
                } else {
                    Src::Reg(p as u8)
                }),
                Some(Location::Spilled(slot)) => {
                    let offset = *self.slot_offsets.get(&slot).unwrap_or(&0);
                    let s = self.scratch();
                    let dst = if fp { Dst::FReg(s) } else { Dst::Reg(s) };
                    self.emit(VmOp::SpillLoad { dst, offset }, span);
                    Ok(if fp { Src::FReg(s) } else { Src::Reg(s) })
                }
                None => Err(Error::Backend {
                    reason: "register operand with no allocation".into(),
                }),
            },
            OperandKind::Immediate(bits) => {
                if op.type_id == self.ctx.prims.string {
                    let s = self.scratch();
                    self.emit(
                        VmOp::StringAddr {
                            dst: s,
                            module: self.module_id,
                            index: bits as u32,
                        },
                        span,
                    );
                    return Ok(Src::Reg(s));
                }
                if fp {
                    // normalize f32 immediates to f64 bits
                    let types = self.ctx.types.read();
                    let is_f32 = types
                        .effective(op.type_id)
                        .map(|t| t.size == 4)
                        .unwrap_or(false);
                    let bits = if is_f32 {
                        (f32::from_bits(bits as u32) as f64).to_bits()
                    } else {
                        bits
                    };
                    return Ok(Src::Imm(bits));
                }
                Ok(Src::Imm(bits))
            }
            OperandKind::Argument(i) => {
                let s = self.scratch();
                let dst = if fp { Dst::FReg(s) } else { Dst::Reg(s) };
                self.emit(VmOp::LoadArg { dst, index: i as u16 }, span);
                Ok(if fp { Src::FReg(s) } else { Src::Reg(s) })
            }
            OperandKind::ModuleData { module, slot } => {
                let s = self.scratch();
                self.emit(VmOp::ModuleAddr { dst: s, module, slot }, span);
                Ok(Src::Reg(s))
            }
            OperandKind::StackSlot(slot) => {
                let offset = *self.slot_offsets.get(&slot).unwrap_or(&0);
                let s = self.scratch();
                self.emit(VmOp::StackAddr { dst: s, offset }, span);
                Ok(Src::Reg(s))
            }
            _ => Err(Error::Backend {
                reason: format!("operand {:?} is not a value source", op.kind),
            }),
        }
    }

    /// Where an assigned operand lands, plus the spill slot to store to
    /// afterwards (the "store after" half of a spill round trip).
    fn dst_of(&mut self, op: &Operand) -> Result<(Dst, Option<u32>)> {
        let fp = self.is_fp(op.type_id);
        match (op.kind, op.location) {
            (OperandKind::Register(_), Some(Location::Physical(p))) => Ok((
                if fp { Dst::FReg(p as u8) } else { Dst::Reg(p as u8) },
                None,
            )),
            (OperandKind::Register(_), Some(Location::Spilled(slot))) => {
                let offset = *self.slot_offsets.get(&slot).unwrap_or(&0);
                let s = SCRATCH0;
                Ok((if fp { Dst::FReg(s) } else { Dst::Reg(s) }, Some(offset)))
            }
            _ => Err(Error::Backend {
                reason: "assignment destination is not an allocated register".into(),
            }),
        }
    }

    fn finish_dst(&mut self, dst: (Dst, Option<u32>), span: SourceSpan) {
        if let Some(offset) = dst.1 {
            let src = match dst.0 {
                Dst::Reg(r) => Src::Reg(r),
                Dst::FReg(r) => Src::FReg(r),
            };
            self.emit(VmOp::SpillStore { src, offset }, span);
        }
    }

    fn label_target(&mut self, label: u32, at: usize, slot: u8) {
        self.patches.push((at, label, slot));
    }

    fn lower_function(&mut self, func: &FunctionDef) -> Result<()> {
        // frame layout: stack allocations first, spill slots among them
        let mut offset = 0u32;
        self.slot_offsets.clear();
        for alloc in &func.stack {
            self.slot_offsets.insert(alloc.id, offset);
            offset += alloc.size.max(1).div_ceil(8) * 8;
        }
        self.labels.clear();
        self.patches.clear();

        for instr in &func.code {
            let span = instr.span;
            match instr.op {
                Opcode::Noop | Opcode::StackFree | Opcode::Reserve => {}
                Opcode::Label => {
                    if let OperandKind::Label(l) = instr.operands[0].kind {
                        self.labels.insert(l, self.code.len() as u32);
                    }
                    self.emit(VmOp::Nop, span);
                }
                Opcode::StackAllocate => {
                    let dst = self.dst_of(&instr.operands[0])?;
                    let slot = instr.operands[2].imm_bits().unwrap_or(0) as u32;
                    let off = *self.slot_offsets.get(&slot).unwrap_or(&0);
                    let Dst::Reg(r) = dst.0 else {
                        return Err(Error::Backend {
                            reason: "stack address in a float register".into(),
                        });
                    };
                    self.emit(VmOp::StackAddr { dst: r, offset: off }, span);
                    self.finish_dst(dst, span);
                }
                Opcode::ModuleData => {
                    let dst = self.dst_of(&instr.operands[0])?;
                    let module = instr.operands[1].imm_bits().unwrap_or(0) as u32;
                    let slot = instr.operands[2].imm_bits().unwrap_or(0) as u32;
                    let Dst::Reg(r) = dst.0 else {
                        return Err(Error::Backend {
                            reason: "module address in a float register".into(),
                        });
                    };
                    self.emit(VmOp::ModuleAddr { dst: r, module, slot }, span);
                    self.finish_dst(dst, span);
                }
                Opcode::Resolve | Opcode::Assign => {
                    let src = self.src_of(&instr.operands[1], span)?;
                    let dst = self.dst_of(&instr.operands[0])?;
                    self.emit(VmOp::Mov { dst: dst.0, src }, span);
                    self.finish_dst(dst, span);
                }
                Opcode::Load => {
                    let addr = self.src_of(&instr.operands[1], span)?;
                    let size = self.type_size(instr.operands[0].type_id);
                    let dst = self.dst_of(&instr.operands[0])?;
                    self.emit(VmOp::Load { dst: dst.0, addr, size }, span);
                    self.finish_dst(dst, span);
                }
                Opcode::Store => {
                    let mut src = self.src_of(&instr.operands[0], span)?;
                    let addr = self.src_of(&instr.operands[1], span)?;
                    let size = self.type_size(instr.operands[0].type_id);
                    // f32 immediates were normalized to f64 bits; narrow
                    // them back before a 4-byte store
                    if size == 4 && self.is_fp(instr.operands[0].type_id) {
                        if let Src::Imm(bits) = src {
                            src = Src::Imm((f64::from_bits(bits) as f32).to_bits() as u64);
                        }
                    }
                    self.emit(VmOp::Store { src, addr, size }, span);
                }
                Opcode::Jump => {
                    if let OperandKind::Label(l) = instr.operands[0].kind {
                        let at = self.emit(VmOp::Jump { target: 0 }, span);
                        self.label_target(l, at, 0);
                    }
                }
                Opcode::Branch => {
                    let cond = self.src_of(&instr.operands[0], span)?;
                    let at = self.emit(VmOp::Branch { cond, t: 0, f: 0 }, span);
                    if let OperandKind::Label(l) = instr.operands[1].kind {
                        self.label_target(l, at, 0);
                    }
                    if let OperandKind::Label(l) = instr.operands[2].kind {
                        self.label_target(l, at, 1);
                    }
                }
                Opcode::Cvt => {
                    let src = self.src_of(&instr.operands[1], span)?;
                    let from = self.num_kind(instr.operands[1].type_id);
                    let to = self.num_kind(instr.operands[2].imm_bits().unwrap_or(0));
                    let dst = self.dst_of(&instr.operands[0])?;
                    self.emit(VmOp::Cvt { dst: dst.0, src, from, to }, span);
                    self.finish_dst(dst, span);
                }
                Opcode::Param => {
                    let src = self.src_of(&instr.operands[0], span)?;
                    self.emit(VmOp::Param { src }, span);
                }
                Opcode::Call => {
                    let OperandKind::FunctionRef(fid) = instr.operands[0].kind else {
                        return Err(Error::Backend {
                            reason: "indirect calls are not supported by the VM emitter".into(),
                        });
                    };
                    let dst = if instr.operands[1].reg_id().is_some() {
                        Some(self.dst_of(&instr.operands[1])?)
                    } else {
                        None
                    };
                    self.emit(
                        VmOp::Call {
                            func: fid,
                            dst: dst.as_ref().map(|d| d.0),
                        },
                        span,
                    );
                    if let Some(d) = dst {
                        self.finish_dst(d, span);
                    }
                }
                Opcode::Ret => {
                    let src = if instr.operands[0].is_valid() {
                        Some(self.src_of(&instr.operands[0], span)?)
                    } else {
                        None
                    };
                    self.emit(VmOp::Ret { src }, span);
                }
                op if op.info().operand_count == 3 && op.info().assigns_operand == Some(0) => {
                    let a = self.src_of(&instr.operands[1], span)?;
                    let b = self.src_of(&instr.operands[2], span)?;
                    let dst = self.dst_of(&instr.operands[0])?;
                    self.emit(VmOp::Alu { op, dst: dst.0, a, b }, span);
                    self.finish_dst(dst, span);
                }
                op if op.info().operand_count == 2 && op.info().assigns_operand == Some(0) => {
                    let a = self.src_of(&instr.operands[1], span)?;
                    let dst = self.dst_of(&instr.operands[0])?;
                    self.emit(VmOp::Un { op, dst: dst.0, a }, span);
                    self.finish_dst(dst, span);
                }
                op if op.info().operand_count == 1 && op.info().assigns_operand == Some(0) => {
                    // inc/dec: read-modify-write in place
                    let a = self.src_of(&instr.operands[0], span)?;
                    let dst = self.dst_of(&instr.operands[0])?;
                    let alu = match op {
                        Opcode::IInc => Opcode::IAdd,
                        Opcode::UInc => Opcode::UAdd,
                        Opcode::FInc => Opcode::FAdd,
                        Opcode::DInc => Opcode::DAdd,
                        Opcode::IDec => Opcode::ISub,
                        Opcode::UDec => Opcode::USub,
                        Opcode::FDec => Opcode::FSub,
                        _ => Opcode::DSub,
                    };
                    let one = if matches!(op, Opcode::FInc | Opcode::FDec | Opcode::DInc | Opcode::DDec)
                    {
                        Src::Imm(1.0f64.to_bits())
                    } else {
                        Src::Imm(1)
                    };
                    self.emit(VmOp::Alu { op: alu, dst: dst.0, a, b: one }, span);
                    self.finish_dst(dst, span);
                }
                op => {
                    return Err(Error::Backend {
                        reason: format!("VM emitter cannot lower '{}'", op.info().name),
                    });
                }
            }
        }

        // patch branch targets now every label has a home
        for (at, label, slot) in std::mem::take(&mut self.patches) {
            let Some(target) = self.labels.get(&label).copied() else {
                return Err(Error::Backend {
                    reason: format!("jump to unplaced label L{}", label),
                });
            };
            match &mut self.code[at] {
                VmOp::Jump { target: t } => *t = target,
                VmOp::Branch { t, f, .. } => {
                    if slot == 0 {
                        *t = target;
                    } else {
                        *f = target;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Backend for VmBackend {
    fn gp_count(&self) -> u16 {
        ALLOCATABLE
    }

    fn fp_count(&self) -> u16 {
        ALLOCATABLE
    }

    fn generate(&mut self, ctx: &Context, output: &mut CompilationOutput) -> Result<()> {
        // module data segment
        let base = self.memory.len() as u32;
        self.memory
            .resize(self.memory.len() + output.module.data_size.max(1) as usize, 0);
        self.module_base.insert(output.module.id, base);

        // intern string literals: bytes followed by (addr, len) records
        for (i, s) in output.module.strings.iter().enumerate() {
            let bytes_at = self.memory.len() as u32;
            self.memory.extend_from_slice(s.as_bytes());
            while self.memory.len() % 8 != 0 {
                self.memory.push(0);
            }
            let struct_at = self.memory.len() as u32;
            self.memory.extend_from_slice(&(bytes_at as u64).to_le_bytes());
            self.memory.extend_from_slice(&(s.len() as u64).to_le_bytes());
            self.string_addr
                .insert((output.module.id, i as u32), struct_at);
        }

        for func in &output.funcs {
            let Some(fid) = func.function_id else { continue };
            let mut em = Emitter {
                ctx,
                module_id: output.module.id,
                code: Vec::new(),
                spans: Vec::new(),
                base: self.code.len() as u32,
                labels: HashMap::new(),
                patches: Vec::new(),
                slot_offsets: HashMap::new(),
                scratch_toggle: false,
            };
            em.lower_function(func)?;

            // relocate local targets into the global instruction buffer
            let base = em.base;
            for op in em.code.iter_mut() {
                match op {
                    VmOp::Jump { target } => *target += base,
                    VmOp::Branch { t, f, .. } => {
                        *t += base;
                        *f += base;
                    }
                    _ => {}
                }
            }

            let frame: u32 = func
                .stack
                .iter()
                .map(|a| a.size.max(1).div_ceil(8) * 8)
                .sum();
            self.frame_sizes.insert(fid, frame);
            self.entries.insert(fid, base);
            if self.options.log_instructions {
                for (i, op) in em.code.iter().enumerate() {
                    tracing::info!(target: "gscript::vmi", "{:5}: {:?}", base as usize + i, op);
                }
            }
            self.code.extend(em.code);
            self.source_map.extend(em.spans);
            ctx.funcs
                .write()
                .get_mut(fid)
                .expect("function registered")
                .address = FunctionAddress::Bytecode(base);
        }
        tracing::debug!(
            module = %output.module.name,
            instructions = self.code.len(),
            "VM generation complete"
        );
        Ok(())
    }

    fn call(
        &mut self,
        ctx: &Context,
        function: FunctionId,
        ret: Option<&mut u64>,
        args: &[u64],
    ) -> Result<()> {
        self.ensure_runtime();
        let bits = self.invoke(ctx, function, args.to_vec())?;
        if let Some(out) = ret {
            *out = bits;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------

struct Frame {
    args: Vec<u64>,
    frame_base: u32,
    regs: [u64; 16],
    fregs: [f64; 16],
}

impl VmBackend {
    fn invoke(&mut self, ctx: &Context, function: FunctionId, args: Vec<u64>) -> Result<u64> {
        let (is_host, entry) = {
            let funcs = ctx.funcs.read();
            let f = funcs.get(function).ok_or_else(|| Error::Backend {
                reason: format!("unknown function #{}", function),
            })?;
            (
                f.flags.contains(FunctionFlags::HOST),
                self.entries.get(&function).copied(),
            )
        };
        if is_host {
            return self.call_host(ctx, function, args);
        }
        let entry = entry.ok_or_else(|| Error::Backend {
            reason: format!("function #{} was not generated", function),
        })?;
        self.exec(ctx, function, entry, args)
    }

    fn exec(&mut self, ctx: &Context, function: FunctionId, entry: u32, args: Vec<u64>) -> Result<u64> {
        self.depth += 1;
        if self.depth > MAX_CALL_DEPTH {
            self.depth -= 1;
            return Err(self.runtime_error(
                ErrorCode::StackOverflow,
                "call depth exceeded".into(),
                entry as usize,
            ));
        }
        let frame_size = self.frame_sizes.get(&function).copied().unwrap_or(0);
        if self.stack_ptr + frame_size > self.heap_base {
            self.depth -= 1;
            return Err(self.runtime_error(
                ErrorCode::StackOverflow,
                "stack space exhausted".into(),
                entry as usize,
            ));
        }
        let mut frame = Frame {
            args,
            frame_base: self.stack_ptr,
            regs: [0; 16],
            fregs: [0.0; 16],
        };
        self.stack_ptr += frame_size;

        let result = self.run_loop(ctx, entry, &mut frame);

        self.stack_ptr = frame.frame_base;
        self.depth -= 1;
        result
    }

    fn read_src(&self, frame: &Frame, src: Src) -> u64 {
        match src {
            Src::Reg(r) => frame.regs[r as usize],
            Src::FReg(r) => frame.fregs[r as usize].to_bits(),
            Src::Imm(bits) => bits,
        }
    }

    fn write_dst(&self, frame: &mut Frame, dst: Dst, bits: u64) {
        match dst {
            Dst::Reg(r) => frame.regs[r as usize] = bits,
            Dst::FReg(r) => frame.fregs[r as usize] = f64::from_bits(bits),
        }
    }

    fn check_addr(&self, addr: u64, size: u8, pc: usize) -> Result<usize> {
        if addr < NULL_GUARD as u64 {
            return Err(self.runtime_error(
                ErrorCode::NullAccess,
                "null pointer access".into(),
                pc,
            ));
        }
        let end = addr as usize + size as usize;
        if end > self.memory.len() {
            return Err(self.runtime_error(
                ErrorCode::NullAccess,
                format!("address {:#x} is out of range", addr),
                pc,
            ));
        }
        Ok(addr as usize)
    }

    fn run_loop(&mut self, ctx: &Context, entry: u32, frame: &mut Frame) -> Result<u64> {
        let mut pc = entry as usize;
        loop {
            let op = *self.code.get(pc).ok_or_else(|| Error::Backend {
                reason: "program counter ran off the code buffer".into(),
            })?;
            if self.options.log_exec {
                tracing::info!(target: "gscript::vm", "{:5}: {:?}", pc, op);
            }
            match op {
                VmOp::Nop => {}
                VmOp::Mov { dst, src } => {
                    let bits = self.read_src(frame, src);
                    self.write_dst(frame, dst, bits);
                }
                VmOp::LoadArg { dst, index } => {
                    let bits = frame.args.get(index as usize).copied().unwrap_or(0);
                    self.write_dst(frame, dst, bits);
                }
                VmOp::StackAddr { dst, offset } => {
                    frame.regs[dst as usize] = (frame.frame_base + offset) as u64;
                }
                VmOp::ModuleAddr { dst, module, slot } => {
                    let base = self.module_base.get(&module).copied().unwrap_or(0);
                    let offset = ctx
                        .modules
                        .read()
                        .get(module)
                        .and_then(|m| m.globals.get(slot as usize).map(|g| g.offset))
                        .unwrap_or(0);
                    frame.regs[dst as usize] = (base + offset) as u64;
                }
                VmOp::StringAddr { dst, module, index } => {
                    let addr = self.string_addr.get(&(module, index)).copied().unwrap_or(0);
                    frame.regs[dst as usize] = addr as u64;
                }
                VmOp::SpillLoad { dst, offset } => {
                    let at = (frame.frame_base + offset) as usize;
                    let bits = u64::from_le_bytes(self.memory[at..at + 8].try_into().unwrap());
                    self.write_dst(frame, dst, bits);
                }
                VmOp::SpillStore { src, offset } => {
                    let bits = self.read_src(frame, src);
                    let at = (frame.frame_base + offset) as usize;
                    self.memory[at..at + 8].copy_from_slice(&bits.to_le_bytes());
                }
                VmOp::Load { dst, addr, size } => {
                    let a = self.read_src(frame, addr);
                    let at = self.check_addr(a, size, pc)?;
                    let mut buf = [0u8; 8];
                    buf[..size as usize].copy_from_slice(&self.memory[at..at + size as usize]);
                    let bits = u64::from_le_bytes(buf);
                    let bits = match dst {
                        Dst::FReg(_) if size == 4 => {
                            (f32::from_bits(bits as u32) as f64).to_bits()
                        }
                        _ => bits,
                    };
                    self.write_dst(frame, dst, bits);
                }
                VmOp::Store { src, addr, size } => {
                    let mut bits = self.read_src(frame, src);
                    if matches!(src, Src::FReg(_)) && size == 4 {
                        bits = (f64::from_bits(bits) as f32).to_bits() as u64;
                    }
                    let a = self.read_src(frame, addr);
                    let at = self.check_addr(a, size, pc)?;
                    self.memory[at..at + size as usize]
                        .copy_from_slice(&bits.to_le_bytes()[..size as usize]);
                }
                VmOp::Alu { op, dst, a, b } => {
                    let x = self.read_src(frame, a);
                    let y = self.read_src(frame, b);
                    let bits = self.alu(op, x, y, pc)?;
                    self.write_dst(frame, dst, bits);
                }
                VmOp::Un { op, dst, a } => {
                    let x = self.read_src(frame, a);
                    let bits = match op {
                        Opcode::INeg => (-(x as i64)) as u64,
                        Opcode::FNeg | Opcode::DNeg => (-f64::from_bits(x)).to_bits(),
                        Opcode::Not => u64::from(x == 0),
                        Opcode::Inv => !x,
                        _ => x,
                    };
                    self.write_dst(frame, dst, bits);
                }
                VmOp::Cvt { dst, src, from, to } => {
                    let bits = self.read_src(frame, src);
                    let converted = convert(bits, from, to);
                    self.write_dst(frame, dst, converted);
                }
                VmOp::Param { src } => {
                    let bits = self.read_src(frame, src);
                    self.params.push(bits);
                }
                VmOp::Call { func, dst } => {
                    let args = std::mem::take(&mut self.params);
                    let bits = self.invoke(ctx, func, args)?;
                    if let Some(d) = dst {
                        self.write_dst(frame, d, bits);
                    }
                }
                VmOp::Jump { target } => {
                    pc = target as usize;
                    continue;
                }
                VmOp::Branch { cond, t, f } => {
                    let c = self.read_src(frame, cond);
                    pc = if c != 0 { t as usize } else { f as usize };
                    continue;
                }
                VmOp::Ret { src } => {
                    return Ok(src.map(|s| self.read_src(frame, s)).unwrap_or(0));
                }
            }
            pc += 1;
        }
    }

    fn alu(&self, op: Opcode, x: u64, y: u64, pc: usize) -> Result<u64> {
        use Opcode::*;
        let fx = f64::from_bits(x);
        let fy = f64::from_bits(y);
        let f32x = fx as f32;
        let f32y = fy as f32;
        let sx = x as i64;
        let sy = y as i64;
        let div0 = |d: u64| {
            if d == 0 {
                Err(self.runtime_error(
                    ErrorCode::DivisionByZero,
                    "Division by zero".into(),
                    pc,
                ))
            } else {
                Ok(())
            }
        };
        Ok(match op {
            IAdd => sx.wrapping_add(sy) as u64,
            UAdd => x.wrapping_add(y),
            FAdd => ((f32x + f32y) as f64).to_bits(),
            DAdd => (fx + fy).to_bits(),
            ISub => sx.wrapping_sub(sy) as u64,
            USub => x.wrapping_sub(y),
            FSub => ((f32x - f32y) as f64).to_bits(),
            DSub => (fx - fy).to_bits(),
            IMul => sx.wrapping_mul(sy) as u64,
            UMul => x.wrapping_mul(y),
            FMul => ((f32x * f32y) as f64).to_bits(),
            DMul => (fx * fy).to_bits(),
            IDiv => {
                div0(y)?;
                sx.wrapping_div(sy) as u64
            }
            UDiv => {
                div0(y)?;
                x / y
            }
            FDiv => ((f32x / f32y) as f64).to_bits(),
            DDiv => (fx / fy).to_bits(),
            IMod => {
                div0(y)?;
                sx.wrapping_rem(sy) as u64
            }
            UMod => {
                div0(y)?;
                x % y
            }
            FMod => ((f32x % f32y) as f64).to_bits(),
            DMod => (fx % fy).to_bits(),
            ILt => u64::from(sx < sy),
            ULt => u64::from(x < y),
            FLt => u64::from(f32x < f32y),
            DLt => u64::from(fx < fy),
            ILte => u64::from(sx <= sy),
            ULte => u64::from(x <= y),
            FLte => u64::from(f32x <= f32y),
            DLte => u64::from(fx <= fy),
            IGt => u64::from(sx > sy),
            UGt => u64::from(x > y),
            FGt => u64::from(f32x > f32y),
            DGt => u64::from(fx > fy),
            IGte => u64::from(sx >= sy),
            UGte => u64::from(x >= y),
            FGte => u64::from(f32x >= f32y),
            DGte => u64::from(fx >= fy),
            IEq | UEq => u64::from(x == y),
            FEq => u64::from(f32x == f32y),
            DEq => u64::from(fx == fy),
            INeq | UNeq => u64::from(x != y),
            FNeq => u64::from(f32x != f32y),
            DNeq => u64::from(fx != fy),
            Shl => x.wrapping_shl(y as u32),
            Shr => x.wrapping_shr(y as u32),
            LAnd => u64::from(x != 0 && y != 0),
            LOr => u64::from(x != 0 || y != 0),
            BAnd => x & y,
            BOr => x | y,
            Xor => x ^ y,
            _ => {
                return Err(Error::Backend {
                    reason: format!("'{}' is not an ALU operation", op.info().name),
                })
            }
        })
    }

    fn call_host(&mut self, ctx: &Context, function: FunctionId, raw_args: Vec<u64>) -> Result<u64> {
        let (name, wrapper, signature, is_method, ret_type) = {
            let funcs = ctx.funcs.read();
            let f = funcs.get(function).ok_or_else(|| Error::Backend {
                reason: format!("unknown function #{}", function),
            })?;
            (
                f.name.clone(),
                f.wrapper,
                f.signature.clone(),
                f.is_method(),
                f.signature.return_type,
            )
        };

        // the intrinsics of the runtime boundary execute natively
        match name.as_str() {
            "alloc" => {
                let size = raw_args.first().copied().unwrap_or(0) as u32;
                return self
                    .alloc_raw(size)
                    .map(|a| a as u64)
                    .ok_or_else(|| {
                        self.runtime_error(
                            ErrorCode::OutOfMemory,
                            format!("Out of memory (limit: {} bytes)", self.options.heap_size),
                            usize::MAX,
                        )
                    });
            }
            "free" => {
                if let Some(addr) = raw_args.first() {
                    self.free_list.push((*addr as u32, 8));
                }
                return Ok(0);
            }
            "memcopy" => {
                let dst = raw_args.first().copied().unwrap_or(0) as usize;
                let src = raw_args.get(1).copied().unwrap_or(0) as usize;
                let len = raw_args.get(2).copied().unwrap_or(0) as usize;
                if dst + len <= self.memory.len() && src + len <= self.memory.len() {
                    self.memory.copy_within(src..src + len, dst);
                }
                return Ok(0);
            }
            "print" => {
                let struct_at = raw_args.first().copied().unwrap_or(0) as usize;
                if struct_at + 16 <= self.memory.len() {
                    let ptr = u64::from_le_bytes(
                        self.memory[struct_at..struct_at + 8].try_into().unwrap(),
                    ) as usize;
                    let len = u64::from_le_bytes(
                        self.memory[struct_at + 8..struct_at + 16].try_into().unwrap(),
                    ) as usize;
                    if ptr + len <= self.memory.len() {
                        let text = String::from_utf8_lossy(&self.memory[ptr..ptr + len]);
                        println!("{}", text);
                    }
                }
                return Ok(0);
            }
            "__raise" => {
                let code = raw_args.first().copied().unwrap_or(0);
                return Err(Error::Runtime(RuntimeError {
                    code: ErrorCode::UncaughtException,
                    message: format!("Uncaught exception ({})", code as i64),
                    span: None,
                }));
            }
            _ => {}
        }

        let Some(wrapper_index) = wrapper else {
            return Err(Error::Backend {
                reason: format!("host function '{}' has no wrapper", name),
            });
        };
        let wrapper = {
            let host_fns = ctx.host_fns.read();
            host_fns
                .get(wrapper_index as usize)
                .copied()
                .ok_or_else(|| Error::Backend {
                    reason: format!("wrapper index {} is out of range", wrapper_index),
                })?
        };

        // split off the receiver and translate pointer args into host
        // pointers per the binding convention
        let mut arg_iter = raw_args.into_iter();
        let this_ptr = if is_method {
            let vm_addr = arg_iter.next().unwrap_or(0) as usize;
            if vm_addr >= self.memory.len() {
                std::ptr::null_mut()
            } else {
                self.memory[vm_addr..].as_mut_ptr()
            }
        } else {
            std::ptr::null_mut()
        };
        let explicit: Vec<ArgKind> = signature
            .explicit_args()
            .map(|a| a.kind)
            .collect();
        let mut args = Vec::new();
        for (bits, kind) in arg_iter.zip(explicit.iter()) {
            match kind {
                ArgKind::Pointer => {
                    let vm_addr = bits as usize;
                    if vm_addr < self.memory.len() {
                        args.push(self.memory[vm_addr..].as_mut_ptr() as u64);
                    } else {
                        args.push(0);
                    }
                }
                _ => args.push(bits),
            }
        }

        // object returns are placement-constructed into fresh VM heap
        let ret_is_object = {
            let types = ctx.types.read();
            types
                .effective(ret_type)
                .map(|t| !t.is_primitive() && t.size > 0 && t.id != ctx.prims.void)
                .unwrap_or(false)
        };
        let (return_ptr, ret_vm_addr) = if ret_is_object {
            let size = ctx
                .types
                .read()
                .effective(ret_type)
                .map(|t| t.size)
                .unwrap_or(8);
            match self.alloc_raw(size) {
                Some(addr) => (self.memory[addr as usize..].as_mut_ptr(), addr as u64),
                None => {
                    return Err(self.runtime_error(
                        ErrorCode::OutOfMemory,
                        "Out of memory".into(),
                        usize::MAX,
                    ))
                }
            }
        } else {
            (std::ptr::null_mut(), 0)
        };

        let mut cc = CallContext {
            return_bits: 0,
            return_ptr,
            function_id: function,
            this_ptr,
            exec_ctx: std::ptr::null_mut(),
            args,
        };
        wrapper(&mut cc);
        Ok(if ret_is_object { ret_vm_addr } else { cc.return_bits })
    }
}

/// Reinterprets raw bits from one primitive class to another. Floats are
/// carried as f64 bits internally regardless of declared width.
fn convert(bits: u64, from: NumKind, to: NumKind) -> u64 {
    // decode the source into a wide signed/unsigned/float view
    let as_f64 = match from {
        NumKind::F32 | NumKind::F64 => f64::from_bits(bits),
        NumKind::Signed(_) => bits as i64 as f64,
        NumKind::Unsigned(_) | NumKind::Bool => bits as f64,
    };
    let as_i64 = match from {
        NumKind::F32 | NumKind::F64 => f64::from_bits(bits) as i64,
        _ => bits as i64,
    };
    let as_u64 = match from {
        NumKind::F32 | NumKind::F64 => f64::from_bits(bits) as u64,
        _ => bits,
    };

    match to {
        NumKind::F64 => as_f64.to_bits(),
        NumKind::F32 => ((as_f64 as f32) as f64).to_bits(),
        NumKind::Bool => u64::from(match from {
            NumKind::F32 | NumKind::F64 => as_f64 != 0.0,
            _ => bits != 0,
        }),
        NumKind::Signed(width) => {
            let v = as_i64;
            match width {
                1 => v as i8 as i64 as u64,
                2 => v as i16 as i64 as u64,
                4 => v as i32 as i64 as u64,
                _ => v as u64,
            }
        }
        NumKind::Unsigned(width) => {
            let v = as_u64;
            match width {
                1 => v as u8 as u64,
                2 => v as u16 as u64,
                4 => v as u32 as u64,
                _ => v,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_int_to_float() {
        let bits = convert(5i64 as u64, NumKind::Signed(4), NumKind::F64);
        assert_eq!(f64::from_bits(bits), 5.0);
    }

    #[test]
    fn test_convert_float_to_int_truncates() {
        let bits = convert(7.9f64.to_bits(), NumKind::F64, NumKind::Signed(4));
        assert_eq!(bits as i64, 7);
    }

    #[test]
    fn test_convert_narrows_unsigned() {
        let bits = convert(0x1_FFu64, NumKind::Unsigned(8), NumKind::Unsigned(1));
        assert_eq!(bits, 0xFF);
    }

    #[test]
    fn test_convert_bool() {
        assert_eq!(convert(0, NumKind::Signed(4), NumKind::Bool), 0);
        assert_eq!(convert(3, NumKind::Signed(4), NumKind::Bool), 1);
        assert_eq!(convert(0.0f64.to_bits(), NumKind::F64, NumKind::Bool), 0);
        assert_eq!(convert(2.5f64.to_bits(), NumKind::F64, NumKind::Bool), 1);
    }
}
