//! Code-emission backends.

mod native;
mod vm;

pub use native::NativeBackend;
pub use vm::{VmBackend, VmOptions};

use crate::compiler::{CompilationOutput, Context};
use crate::error::Result;
use crate::types::FunctionId;

/// A code-emission target.
pub trait Backend {
    /// General-purpose registers available to the allocator.
    fn gp_count(&self) -> u16;

    /// Floating-point registers available to the allocator.
    fn fp_count(&self) -> u16;

    /// False for backends that do their own allocation.
    fn perform_register_allocation(&self) -> bool {
        true
    }

    /// Lowers a compiled module to an executable artifact.
    fn generate(&mut self, ctx: &Context, output: &mut CompilationOutput) -> Result<()>;

    /// Invokes a generated (or bound) function. Primitive returns are
    /// written into `ret` as raw bits.
    fn call(
        &mut self,
        ctx: &Context,
        function: FunctionId,
        ret: Option<&mut u64>,
        args: &[u64],
    ) -> Result<()>;
}

/// Runs register allocation (when the backend wants it) and generation
/// for one compiled module.
pub fn finalize_module(
    backend: &mut dyn Backend,
    ctx: &Context,
    output: &mut CompilationOutput,
) -> Result<()> {
    if backend.perform_register_allocation() {
        let types = ctx.types.read();
        for func in output.funcs.iter_mut() {
            let result = crate::compiler::regalloc::allocate(
                func,
                &types,
                backend.gp_count(),
                backend.fp_count(),
            );
            if result.spill_count > 0 {
                tracing::debug!(
                    func = %func.name,
                    spills = result.spill_count,
                    "register pressure forced spills"
                );
            }
        }
    }
    backend.generate(ctx, output)
}

/// Runs a module's initializer on the backend.
pub fn run_module_init(
    backend: &mut dyn Backend,
    ctx: &Context,
    output: &CompilationOutput,
) -> Result<()> {
    if let Some(init) = output.module.init_function {
        backend.call(ctx, init, None, &[])?;
    }
    Ok(())
}
