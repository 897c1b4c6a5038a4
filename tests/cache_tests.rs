//! On-disk module cache behavior through the pipeline.

use gscript::compiler::{CompileOptions, Pipeline};
use std::fs;

fn options(cache_dir: &std::path::Path) -> CompileOptions {
    CompileOptions {
        cache_dir: Some(cache_dir.to_path_buf()),
        ..CompileOptions::default()
    }
}

#[test]
fn imported_module_is_cached_and_reloaded() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("cache");
    let util = dir.path().join("util.gs");
    let main = dir.path().join("main.gs");
    fs::write(&util, "export function inc(x: i32): i32 { return x + 1; }").unwrap();
    fs::write(
        &main,
        "import { inc } from './util';\nfunction main(): i32 { return inc(41); }",
    )
    .unwrap();

    // first compile populates the cache
    {
        let mut pipeline = Pipeline::new(options(&cache));
        let output = pipeline.compile_file(&main).unwrap();
        assert!(output.is_clean());
    }
    let cached_files: Vec<_> = fs::read_dir(&cache)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|x| x == "gsc").unwrap_or(false))
        .collect();
    assert!(!cached_files.is_empty(), "no .gsc files were written");

    // second compile loads util from the cache and still runs
    use gscript::backend::{self, Backend, VmBackend, VmOptions};
    let mut pipeline = Pipeline::new(options(&cache));
    let mut output = pipeline.compile_file(&main).unwrap();
    let ctx = pipeline.context().clone();
    let mut vm = VmBackend::new(VmOptions::default());
    for dep in pipeline.take_dependency_outputs().iter_mut() {
        backend::finalize_module(&mut vm, &ctx, dep).unwrap();
        backend::run_module_init(&mut vm, &ctx, dep).unwrap();
    }
    backend::finalize_module(&mut vm, &ctx, &mut output).unwrap();
    backend::run_module_init(&mut vm, &ctx, &output).unwrap();
    let main_id = ctx.funcs.read().get_by_fqn("main::main")[0];
    let mut result = 0u64;
    vm.call(&ctx, main_id, Some(&mut result), &[]).unwrap();
    assert_eq!(result as i32, 42);
}

#[test]
fn corrupt_cache_falls_back_to_source() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("cache");
    let util = dir.path().join("util.gs");
    let main = dir.path().join("main.gs");
    fs::write(&util, "export let seven: i32 = 7;").unwrap();
    fs::write(
        &main,
        "import { seven } from './util';\nfunction main(): i32 { return seven; }",
    )
    .unwrap();

    {
        let mut pipeline = Pipeline::new(options(&cache));
        pipeline.compile_file(&main).unwrap();
    }

    // flip bits in every cached file
    for entry in fs::read_dir(&cache).unwrap().filter_map(|e| e.ok()) {
        if entry.path().extension().map(|x| x == "gsc").unwrap_or(false) {
            let mut bytes = fs::read(entry.path()).unwrap();
            let mid = bytes.len() / 2;
            bytes[mid] ^= 0xff;
            fs::write(entry.path(), bytes).unwrap();
        }
    }

    // compilation still succeeds by recompiling from source
    let mut pipeline = Pipeline::new(options(&cache));
    let output = pipeline.compile_file(&main).unwrap();
    assert!(output.is_clean());
}

#[test]
fn edited_source_invalidates_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("cache");
    let util = dir.path().join("util.gs");
    let main = dir.path().join("main.gs");
    fs::write(&util, "export let value: i32 = 1;").unwrap();
    fs::write(
        &main,
        "import { value } from './util';\nfunction main(): i32 { return value; }",
    )
    .unwrap();

    {
        let mut pipeline = Pipeline::new(options(&cache));
        pipeline.compile_file(&main).unwrap();
    }

    // change the dependency's contents; the stale cache must be ignored
    fs::write(&util, "export let value: i32 = 2;").unwrap();

    use gscript::backend::{self, Backend, VmBackend, VmOptions};
    let mut pipeline = Pipeline::new(options(&cache));
    let mut output = pipeline.compile_file(&main).unwrap();
    let ctx = pipeline.context().clone();
    let mut vm = VmBackend::new(VmOptions::default());
    for dep in pipeline.take_dependency_outputs().iter_mut() {
        backend::finalize_module(&mut vm, &ctx, dep).unwrap();
        backend::run_module_init(&mut vm, &ctx, dep).unwrap();
    }
    backend::finalize_module(&mut vm, &ctx, &mut output).unwrap();
    backend::run_module_init(&mut vm, &ctx, &output).unwrap();
    let main_id = ctx.funcs.read().get_by_fqn("main::main")[0];
    let mut result = 0u64;
    vm.call(&ctx, main_id, Some(&mut result), &[]).unwrap();
    assert_eq!(result as i32, 2);
}
