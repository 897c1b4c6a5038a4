//! Minimal native x86-64 emitter.
//!
//! Translates IR to machine code with the SysV calling convention at the
//! function boundary. The supported subset is deliberately narrow:
//! integer-primitive signatures of up to six register arguments, and the
//! integer ALU/move/return opcodes. Anything outside it is reported as a
//! backend failure for that function; the remaining functions still
//! translate. Execution of the emitted bytes is the embedder's business
//! (mapping executable pages is outside this crate), so `call` reports
//! rather than runs.

use super::Backend;
use crate::compiler::{CompilationOutput, Context, Location, Opcode, Operand, OperandKind};
use crate::error::{Error, Result};
use crate::types::{ArgKind, FunctionId};
use std::collections::HashMap;

/// Physical registers handed to the allocator, in allocation order:
/// rbx, r12, r13, r14, r15 (callee-saved, so calls need no shuffling).
const GP_POOL: [u8; 5] = [3, 12, 13, 14, 15];
/// Argument registers of the SysV convention: rdi rsi rdx rcx r8 r9.
const ARG_REGS: [u8; 6] = [7, 6, 2, 1, 8, 9];

/// The native x86-64 backend.
#[derive(Default)]
pub struct NativeBackend {
    /// Emitted machine code per function
    pub artifacts: HashMap<FunctionId, Vec<u8>>,
    log_ir: bool,
}

impl NativeBackend {
    /// Creates the backend.
    pub fn new(log_ir: bool) -> Self {
        NativeBackend {
            artifacts: HashMap::new(),
            log_ir,
        }
    }
}

struct Asm {
    buf: Vec<u8>,
}

impl Asm {
    fn rex(&mut self, r: u8, b: u8) {
        self.buf
            .push(0x48 | (((r >> 3) & 1) << 2) | ((b >> 3) & 1));
    }

    fn modrm_reg(&mut self, reg: u8, rm: u8) {
        self.buf.push(0xC0 | ((reg & 7) << 3) | (rm & 7));
    }

    /// mov r64, imm64
    fn mov_imm(&mut self, dst: u8, imm: u64) {
        self.rex(0, dst);
        self.buf.push(0xB8 | (dst & 7));
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    /// mov dst, src
    fn mov_reg(&mut self, dst: u8, src: u8) {
        self.rex(src, dst);
        self.buf.push(0x89);
        self.modrm_reg(src, dst);
    }

    /// add/sub dst, src
    fn alu_reg(&mut self, opcode: u8, dst: u8, src: u8) {
        self.rex(src, dst);
        self.buf.push(opcode);
        self.modrm_reg(src, dst);
    }

    /// imul dst, src
    fn imul_reg(&mut self, dst: u8, src: u8) {
        self.rex(dst, src);
        self.buf.push(0x0F);
        self.buf.push(0xAF);
        self.modrm_reg(dst, src);
    }

    fn push(&mut self, reg: u8) {
        if reg >= 8 {
            self.buf.push(0x41);
        }
        self.buf.push(0x50 | (reg & 7));
    }

    fn pop(&mut self, reg: u8) {
        if reg >= 8 {
            self.buf.push(0x41);
        }
        self.buf.push(0x58 | (reg & 7));
    }

    fn ret(&mut self) {
        self.buf.push(0xC3);
    }
}

fn unsupported(func_name: &str, what: &str) -> Error {
    Error::Backend {
        reason: format!(
            "native backend cannot translate '{}': {}",
            func_name, what
        ),
    }
}

impl NativeBackend {
    fn operand_reg(&self, op: &Operand, func_name: &str) -> Result<u8> {
        match (op.kind, op.location) {
            (OperandKind::Register(_), Some(Location::Physical(p))) => GP_POOL
                .get(p as usize)
                .copied()
                .ok_or_else(|| unsupported(func_name, "register index out of pool")),
            (OperandKind::Register(_), Some(Location::Spilled(_))) => {
                Err(unsupported(func_name, "spilled values"))
            }
            _ => Err(unsupported(func_name, "non-register operand")),
        }
    }

    fn translate(
        &self,
        ctx: &Context,
        func: &crate::compiler::FunctionDef,
        fid: FunctionId,
    ) -> Result<Vec<u8>> {
        // signature gate: integer primitives in registers only
        {
            let funcs = ctx.funcs.read();
            let types = ctx.types.read();
            let f = funcs.get(fid).ok_or_else(|| Error::Backend {
                reason: "unregistered function".into(),
            })?;
            if f.signature.args.len() > ARG_REGS.len() {
                return Err(unsupported(&func.name, "more than six arguments"));
            }
            for arg in &f.signature.args {
                if arg.kind != ArgKind::Value {
                    return Err(unsupported(&func.name, "non-value argument passing"));
                }
                let ok = types
                    .effective(arg.type_id)
                    .map(|t| t.is_primitive() && !t.is_floating_point())
                    .unwrap_or(false);
                if !ok {
                    return Err(unsupported(&func.name, "non-integer argument type"));
                }
            }
            let ret_ok = types
                .effective(f.signature.return_type)
                .map(|t| t.is_primitive() && !t.is_floating_point())
                .unwrap_or(false);
            if !ret_ok {
                return Err(unsupported(&func.name, "non-integer return type"));
            }
        }

        let mut asm = Asm { buf: Vec::new() };
        // prologue: preserve the callee-saved pool
        for reg in GP_POOL {
            asm.push(reg);
        }

        for instr in &func.code {
            match instr.op {
                Opcode::Noop | Opcode::Label | Opcode::StackFree | Opcode::Reserve => {}
                Opcode::Assign | Opcode::Resolve => {
                    let dst = self.operand_reg(&instr.operands[0], &func.name)?;
                    match instr.operands[1].kind {
                        OperandKind::Immediate(bits) => asm.mov_imm(dst, bits),
                        OperandKind::Register(_) => {
                            let src = self.operand_reg(&instr.operands[1], &func.name)?;
                            asm.mov_reg(dst, src);
                        }
                        OperandKind::Argument(i) => {
                            let src = ARG_REGS[i as usize];
                            asm.mov_reg(dst, src);
                        }
                        _ => return Err(unsupported(&func.name, "move source kind")),
                    }
                }
                Opcode::IAdd | Opcode::UAdd | Opcode::ISub | Opcode::USub | Opcode::IMul
                | Opcode::UMul => {
                    let dst = self.operand_reg(&instr.operands[0], &func.name)?;
                    let load = |asm: &mut Asm, op: &Operand, into: u8| -> Result<()> {
                        match op.kind {
                            OperandKind::Immediate(bits) => {
                                asm.mov_imm(into, bits);
                                Ok(())
                            }
                            OperandKind::Register(_) => {
                                let r = self.operand_reg(op, &func.name)?;
                                asm.mov_reg(into, r);
                                Ok(())
                            }
                            OperandKind::Argument(i) => {
                                asm.mov_reg(into, ARG_REGS[i as usize]);
                                Ok(())
                            }
                            _ => Err(unsupported(&func.name, "ALU operand kind")),
                        }
                    };
                    // rax/rcx as scratch
                    load(&mut asm, &instr.operands[1], 0)?;
                    load(&mut asm, &instr.operands[2], 1)?;
                    match instr.op {
                        Opcode::IAdd | Opcode::UAdd => asm.alu_reg(0x01, 0, 1),
                        Opcode::ISub | Opcode::USub => asm.alu_reg(0x29, 0, 1),
                        _ => asm.imul_reg(0, 1),
                    }
                    asm.mov_reg(dst, 0);
                }
                Opcode::Ret => {
                    if instr.operands[0].is_valid() {
                        match instr.operands[0].kind {
                            OperandKind::Immediate(bits) => asm.mov_imm(0, bits),
                            OperandKind::Register(_) => {
                                let src = self.operand_reg(&instr.operands[0], &func.name)?;
                                asm.mov_reg(0, src);
                            }
                            OperandKind::Argument(i) => asm.mov_reg(0, ARG_REGS[i as usize]),
                            _ => return Err(unsupported(&func.name, "return operand kind")),
                        }
                    }
                    for reg in GP_POOL.iter().rev() {
                        asm.pop(*reg);
                    }
                    asm.ret();
                }
                other => {
                    return Err(unsupported(&func.name, other.info().name));
                }
            }
        }

        Ok(asm.buf)
    }
}

impl Backend for NativeBackend {
    fn gp_count(&self) -> u16 {
        GP_POOL.len() as u16
    }

    fn fp_count(&self) -> u16 {
        0
    }

    fn generate(&mut self, ctx: &Context, output: &mut CompilationOutput) -> Result<()> {
        let mut failures = Vec::new();
        for func in &output.funcs {
            let Some(fid) = func.function_id else { continue };
            if self.log_ir {
                tracing::info!(target: "gscript::native", "[{}]\n{}", func.name, func.dump());
            }
            match self.translate(ctx, func, fid) {
                Ok(bytes) => {
                    self.artifacts.insert(fid, bytes);
                }
                Err(e) => failures.push(format!("{}", e)),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Backend {
                reason: failures.join("; "),
            })
        }
    }

    fn call(
        &mut self,
        _ctx: &Context,
        _function: FunctionId,
        _ret: Option<&mut u64>,
        _args: &[u64],
    ) -> Result<()> {
        Err(Error::Backend {
            reason: "the native backend emits code but does not execute it; map the artifact \
                     into executable memory or run with '-b vm'"
                .into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{FunctionDef, Instruction, Operand};
    use crate::source::SourceSpan;

    #[test]
    fn test_prologue_and_ret_emitted() {
        let pipeline = crate::compiler::Pipeline::new(Default::default());
        let ctx = pipeline.context().clone();
        let i32_id = ctx.prims.i32_;

        let mut def = FunctionDef::new("answer");
        let mut ret = Instruction::new(Opcode::Ret, SourceSpan::default());
        ret.operands[0] = Operand::imm(42, i32_id);
        def.emit(ret);

        let fid = {
            let mut funcs = ctx.funcs.write();
            funcs
                .register(crate::types::Function::script(
                    "answer",
                    "test::answer",
                    crate::types::FunctionSignature::new(i32_id, &[]),
                    1,
                    SourceSpan::default(),
                ))
                .unwrap()
        };
        def.function_id = Some(fid);

        let be = NativeBackend::new(false);
        let bytes = be.translate(&ctx, &def, fid).unwrap();
        // push rbx ... mov rax, 42 ... pops ... ret
        assert_eq!(bytes[0], 0x53); // push rbx
        assert_eq!(*bytes.last().unwrap(), 0xC3); // ret
        assert!(bytes.windows(2).any(|w| w == [0x48, 0xB8])); // mov rax, imm64
    }

    #[test]
    fn test_unsupported_signature_reported() {
        let pipeline = crate::compiler::Pipeline::new(Default::default());
        let ctx = pipeline.context().clone();
        let f64_id = ctx.prims.f64_;

        let def = FunctionDef::new("floaty");
        let fid = {
            let mut funcs = ctx.funcs.write();
            funcs
                .register(crate::types::Function::script(
                    "floaty",
                    "test::floaty",
                    crate::types::FunctionSignature::new(f64_id, &[]),
                    1,
                    SourceSpan::default(),
                ))
                .unwrap()
        };

        let be = NativeBackend::new(false);
        let err = be.translate(&ctx, &def, fid).unwrap_err();
        assert!(err.to_string().contains("floaty"));
    }
}
