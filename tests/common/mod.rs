//! Shared harness for end-to-end tests: compile a source string, lower
//! it onto the VM backend, run the module initializer, and call `main`.
#![allow(dead_code)]

use gscript::backend::{self, Backend, VmBackend, VmOptions};
use gscript::compiler::{CompilationOutput, CompileOptions, Pipeline};
use gscript::error::Result;
use gscript::source::SourceBuffer;

pub struct Harness {
    pub pipeline: Pipeline,
    pub vm: VmBackend,
    pub output: CompilationOutput,
}

pub fn compile(name: &str, source: &str) -> Result<Harness> {
    let mut pipeline = Pipeline::new(CompileOptions::default());
    let mut output = pipeline.compile_source(SourceBuffer::new(name, source))?;
    let mut vm = VmBackend::new(VmOptions::default());
    let ctx = pipeline.context().clone();
    for dep in pipeline.take_dependency_outputs().iter_mut() {
        backend::finalize_module(&mut vm, &ctx, dep)?;
        backend::run_module_init(&mut vm, &ctx, dep)?;
    }
    backend::finalize_module(&mut vm, &ctx, &mut output)?;
    backend::run_module_init(&mut vm, &ctx, &output)?;
    Ok(Harness {
        pipeline,
        vm,
        output,
    })
}

pub fn run_main(source: &str) -> Result<u64> {
    let mut h = compile("script.gs", source)?;
    let ctx = h.pipeline.context().clone();
    let main = ctx
        .funcs
        .read()
        .get_by_fqn("script::main")
        .first()
        .copied()
        .expect("script declares main");
    let mut result = 0u64;
    h.vm.call(&ctx, main, Some(&mut result), &[])?;
    Ok(result)
}

pub fn run_main_i32(source: &str) -> i32 {
    run_main(source).expect("script runs") as i32
}

pub fn run_main_f64(source: &str) -> f64 {
    f64::from_bits(run_main(source).expect("script runs"))
}
