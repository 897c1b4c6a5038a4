//! The compilation pipeline.
//!
//! A [`Pipeline`] owns one compile: lexer → parser → compiler →
//! optimizer. Registries live in a shared [`Context`] so that resolving
//! an `import` can spawn a child pipeline over the same registries while
//! the parent waits; the shared import stack catches cycles.

pub mod cfg;
pub(crate) mod codegen;
pub mod ir;
pub mod optimizer;
pub mod regalloc;
pub mod templates;
pub mod value;

pub use cfg::{BasicBlock, ControlFlowGraph, LiveRange, Liveness};
pub use codegen::{CompilationOutput, ImportResolver};
pub use ir::{
    FunctionDef, Instruction, LabelId, Location, Opcode, OpcodeInfo, Operand, OperandClass,
    OperandKind, RegisterId, StackAlloc, StackSlotId, ValueFlags,
};
pub use optimizer::{
    CommonSubexpressionElimination, CopyPropagation, DeadStoreElimination, OptimizationGroup,
    OptimizationStep,
};
pub use regalloc::{allocate, AllocationResult, RangeAssignment};

use crate::error::{Diagnostic, Error, ErrorCode, Result, Severity};
use crate::lexer::Lexer;
use crate::modules::{
    read_cached_module, resolve_import, write_cached_module, CachedModule, ImportStack,
    ModuleRegistry,
};
use crate::parser::Parser;
use crate::source::SourceBuffer;
use crate::types::{
    DataType, FunctionId, FunctionRegistry, TypeId, TypeRegistry,
};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Cached ids of the primitive types every compile needs.
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct Primitives {
    pub void: TypeId,
    pub bool_: TypeId,
    pub i8_: TypeId,
    pub i16_: TypeId,
    pub i32_: TypeId,
    pub i64_: TypeId,
    pub u8_: TypeId,
    pub u16_: TypeId,
    pub u32_: TypeId,
    pub u64_: TypeId,
    pub f32_: TypeId,
    pub f64_: TypeId,
    pub string: TypeId,
    pub error: TypeId,
}

/// Registries shared by every pipeline of one script context.
pub struct Context {
    /// All data types
    pub types: RwLock<TypeRegistry>,
    /// All functions
    pub funcs: RwLock<FunctionRegistry>,
    /// All modules
    pub modules: RwLock<ModuleRegistry>,
    /// Host wrapper table (see [`crate::bind`])
    pub host_fns: RwLock<Vec<crate::bind::HostWrapper>>,
    /// Primitive type ids
    pub prims: Primitives,
}

impl Context {
    /// Creates a context with the primitive types registered. Runtime
    /// intrinsics and the builtin library are installed separately via
    /// [`crate::builtin::install`].
    pub fn new() -> Arc<Self> {
        let mut types = TypeRegistry::new();
        let table = [
            ("void", 0u32, false, true),
            ("bool", 1, false, false),
            ("i8", 1, false, true),
            ("i16", 2, false, true),
            ("i32", 4, false, true),
            ("i64", 8, false, true),
            ("u8", 1, false, false),
            ("u16", 2, false, false),
            ("u32", 4, false, false),
            ("u64", 8, false, false),
            ("f32", 4, true, true),
            ("f64", 8, true, true),
        ];
        for (name, size, float, signed) in table {
            types
                .add(DataType::primitive(name, size, float, signed))
                .expect("primitive names are unique");
        }
        // `string` is an immutable (data pointer, byte length) pair
        let mut string_ty = DataType::object("string", "string", 0, false);
        string_ty.size = 16;
        string_ty.align = 8;
        string_ty.meta |= crate::types::TypeMeta::HOST
            | crate::types::TypeMeta::TRIVIALLY_COPYABLE
            | crate::types::TypeMeta::TRIVIALLY_CONSTRUCTIBLE
            | crate::types::TypeMeta::TRIVIALLY_DESTRUCTIBLE;
        types.add(string_ty).expect("string is unique");

        let id = |name: &str| types.get_by_name(name).expect("registered").id;
        let prims = Primitives {
            void: id("void"),
            bool_: id("bool"),
            i8_: id("i8"),
            i16_: id("i16"),
            i32_: id("i32"),
            i64_: id("i64"),
            u8_: id("u8"),
            u16_: id("u16"),
            u32_: id("u32"),
            u64_: id("u64"),
            f32_: id("f32"),
            f64_: id("f64"),
            string: id("string"),
            error: types.error_type(),
        };

        Arc::new(Context {
            types: RwLock::new(types),
            funcs: RwLock::new(FunctionRegistry::new()),
            modules: RwLock::new(ModuleRegistry::new()),
            host_fns: RwLock::new(Vec::new()),
            prims,
        })
    }
}

/// Options steering one pipeline.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// 0 disables the optimizer; anything else runs the default group
    pub opt_level: u8,
    /// Dump optimized IR per function through `tracing`
    pub log_ir: bool,
    /// Directory for `.gsc` cached modules; `None` disables the cache
    pub cache_dir: Option<PathBuf>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            opt_level: 1,
            log_ir: false,
            cache_dir: None,
        }
    }
}

/// One compilation coordinator. Not safe for concurrent use; nested
/// compiles happen through child pipelines that share the context.
pub struct Pipeline {
    ctx: Arc<Context>,
    options: CompileOptions,
    import_stack: Arc<Mutex<ImportStack>>,
    /// diagnostics surfaced by child compiles
    child_diagnostics: Vec<Diagnostic>,
    /// finished outputs of imported modules, dependency order, so the
    /// backend can generate and initialize them ahead of the root
    dep_outputs: Arc<Mutex<Vec<CompilationOutput>>>,
}

impl Pipeline {
    /// Creates a pipeline with a fresh context and the builtin library
    /// installed.
    pub fn new(options: CompileOptions) -> Self {
        let ctx = Context::new();
        crate::builtin::install(&ctx).expect("builtin installation is infallible on a fresh context");
        Pipeline::with_context(ctx, options)
    }

    /// Creates a pipeline over an existing context.
    pub fn with_context(ctx: Arc<Context>, options: CompileOptions) -> Self {
        Pipeline {
            ctx,
            options,
            import_stack: Arc::new(Mutex::new(ImportStack::new())),
            child_diagnostics: Vec::new(),
            dep_outputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The shared context.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Spawns the child pipeline used to compile an imported module.
    fn spawn_child(&self) -> Pipeline {
        Pipeline {
            ctx: self.ctx.clone(),
            options: self.options.clone(),
            import_stack: self.import_stack.clone(),
            child_diagnostics: Vec::new(),
            dep_outputs: self.dep_outputs.clone(),
        }
    }

    /// Takes the outputs of every module compiled to satisfy imports, in
    /// dependency order (each module before its importers).
    pub fn take_dependency_outputs(&mut self) -> Vec<CompilationOutput> {
        std::mem::take(&mut *self.dep_outputs.lock())
    }

    /// Compiles a script file, following its imports.
    pub fn compile_file(&mut self, path: &Path) -> Result<CompilationOutput> {
        let buffer = SourceBuffer::from_file(path)
            .map_err(|e| Error::io(path.to_string_lossy(), e))?;
        self.compile_source(buffer)
    }

    /// Compiles one source buffer, following its imports.
    pub fn compile_source(&mut self, buffer: SourceBuffer) -> Result<CompilationOutput> {
        let path = buffer.path().to_string();
        let module_name = Path::new(&path)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "script".to_string());
        let module_id = buffer.module_id();
        tracing::debug!(module = %path, id = module_id, "compiling");

        {
            let mut stack = self.import_stack.lock();
            if let Err(diag) = stack.push(&path, Default::default()) {
                return Err(Error::Compile {
                    diagnostics: vec![diag],
                });
            }
        }
        let result = self.compile_inner(&buffer, module_id, &module_name, &path);
        self.import_stack.lock().pop();
        result
    }

    fn compile_inner(
        &mut self,
        buffer: &SourceBuffer,
        module_id: u32,
        module_name: &str,
        path: &str,
    ) -> Result<CompilationOutput> {
        let (tokens, lex_diags) = Lexer::new(buffer).tokenize();
        let parse = Parser::new(tokens, path).parse();

        let current_dir = Path::new(path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let ctx = self.ctx.clone();
        let mut child_diags: Vec<Diagnostic> = Vec::new();
        let mut resolver = |import_path: &str, span: crate::source::SourceSpan| {
            Self::resolve_for(
                self.spawn_child(),
                &current_dir,
                import_path,
                span,
                &mut child_diags,
            )
        };

        let compiler = codegen::Compiler::new(
            &ctx,
            &parse.pool,
            module_id,
            module_name,
            path,
            Some(&mut resolver),
        );
        let mut output = compiler.run(parse.root);

        let mut diagnostics = lex_diags;
        diagnostics.extend(parse.diagnostics);
        diagnostics.extend(child_diags);
        diagnostics.extend(std::mem::take(&mut self.child_diagnostics));
        diagnostics.append(&mut output.diagnostics);
        output.diagnostics = diagnostics;

        if output
            .diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
        {
            return Err(Error::Compile {
                diagnostics: output.diagnostics,
            });
        }

        if self.options.opt_level > 0 {
            let types = self.ctx.types.read();
            for func in output.funcs.iter_mut() {
                let mut group = OptimizationGroup::default_pipeline();
                group.run(func, &types);
            }
        }
        if self.options.log_ir {
            for func in &output.funcs {
                tracing::info!(target: "gscript::ir", "[{}]\n{}", func.name, func.dump());
            }
        }

        output.module.source_mtime = buffer.mtime().timestamp();
        output.module.source_hash = buffer.content_hash();

        // hand the finished module to the registries
        self.ctx
            .modules
            .write()
            .add(output.module.clone())
            .map_err(|e| Error::Bind {
                reason: e.to_string(),
            })?;

        if let Some(cache_dir) = self.options.cache_dir.clone() {
            self.write_cache(&cache_dir, &output);
        }

        Ok(output)
    }

    fn resolve_for(
        mut child: Pipeline,
        current_dir: &Path,
        import_path: &str,
        span: crate::source::SourceSpan,
        sink: &mut Vec<Diagnostic>,
    ) -> std::result::Result<u32, Diagnostic> {
        let resolved = resolve_import(current_dir, import_path);
        let path_str = resolved.to_string_lossy().to_string();

        if let Some(existing) = child.ctx.modules.read().get_by_path(&path_str) {
            return Ok(existing.id);
        }

        let buffer = match SourceBuffer::from_file(&resolved) {
            Ok(b) => b,
            Err(_) => {
                return Err(Diagnostic::error(
                    ErrorCode::FailedToResolveModule,
                    format!("Failed to resolve module '{}'", import_path),
                    span,
                ));
            }
        };

        // cached module fast path
        if let Some(cache_dir) = child.options.cache_dir.clone() {
            let cache_path = cache_dir.join(format!("{}.gsc", buffer.module_id()));
            if cache_path.exists() {
                match read_cached_module(
                    &cache_path,
                    buffer.mtime().timestamp(),
                    buffer.content_hash(),
                ) {
                    Ok(cached) => match child.load_cached(cached) {
                        Ok(id) => return Ok(id),
                        Err(e) => {
                            tracing::debug!(error = %e, "cache load failed, recompiling")
                        }
                    },
                    Err(e) => tracing::debug!(error = %e, "cache rejected, recompiling"),
                }
            }
        }

        match child.compile_source(buffer) {
            Ok(output) => {
                sink.extend(output.diagnostics.clone());
                let id = output.module.id;
                child.dep_outputs.lock().push(output);
                Ok(id)
            }
            Err(Error::Compile { diagnostics }) => {
                // a cycle propagates as the one cyclic-imports error naming
                // every frame, not as a generic resolution failure
                if let Some(cyc) = diagnostics
                    .iter()
                    .find(|d| d.code == ErrorCode::CyclicImports)
                {
                    return Err(cyc.clone());
                }
                sink.extend(diagnostics);
                Err(Diagnostic::error(
                    ErrorCode::FailedToResolveModule,
                    format!("Failed to resolve module '{}'", import_path),
                    span,
                ))
            }
            Err(e) => Err(Diagnostic::error(
                ErrorCode::FailedToResolveModule,
                format!("Failed to resolve module '{}': {}", import_path, e),
                span,
            )),
        }
    }

    /// Registers a validated cached module: types first, then functions,
    /// then the deferred call-target fixups.
    fn load_cached(&mut self, mut cached: CachedModule) -> Result<u32> {
        let mut new_ids: Vec<FunctionId> = Vec::with_capacity(cached.funcs.len());

        {
            let mut types = self.ctx.types.write();
            for ty in &cached.types {
                if types.get(ty.id).is_none() {
                    let mut shell = ty.clone();
                    shell.methods.clear();
                    shell.destructor = None;
                    for p in shell.properties.iter_mut() {
                        p.getter = None;
                        p.setter = None;
                    }
                    types.add(shell)?;
                }
            }
        }

        {
            let mut funcs = self.ctx.funcs.write();
            for f in &cached.funcs {
                let id = funcs.register(f.function.clone())?;
                new_ids.push(id);
            }
        }

        // map file-local function indices back onto registry ids
        let map = |idx: Option<u32>| idx.and_then(|i| new_ids.get(i as usize).copied());
        {
            let mut types = self.ctx.types.write();
            for ty in &cached.types {
                if let Some(t) = types.get_mut(ty.id) {
                    t.methods = ty
                        .methods
                        .iter()
                        .filter_map(|m| new_ids.get(*m as usize).copied())
                        .collect();
                    t.destructor = map(ty.destructor);
                    for (dst, src) in t.properties.iter_mut().zip(ty.properties.iter()) {
                        dst.getter = map(src.getter);
                        dst.setter = map(src.setter);
                    }
                }
            }
        }

        // resolve call targets by name + signature hash
        {
            let funcs = self.ctx.funcs.read();
            for (fi, f) in cached.funcs.iter_mut().enumerate() {
                for fixup in f.fixups.clone() {
                    let candidates = funcs.get_by_fqn(&fixup.fqn);
                    let target = candidates.iter().copied().find(|id| {
                        funcs
                            .get(*id)
                            .map(|cand| {
                                crate::modules::signature_hash(&cand.signature) == fixup.sig_hash
                            })
                            .unwrap_or(false)
                    });
                    match target {
                        Some(t) => {
                            f.def.code[fixup.instr as usize].operands[fixup.operand as usize] =
                                Operand::func(t);
                        }
                        None => {
                            return Err(Error::Cache {
                                reason: format!(
                                    "unresolved call target '{}' in cached function #{}",
                                    fixup.fqn, fi
                                ),
                            });
                        }
                    }
                }
            }
        }

        cached.module.functions = new_ids.clone();
        cached.module.init_function = map(cached.module.init_function);
        for symbol in cached.module.exports.values_mut() {
            if let crate::modules::ModuleSymbol::Functions(ids) = symbol {
                *ids = ids
                    .iter()
                    .filter_map(|i| new_ids.get(*i as usize).copied())
                    .collect();
            }
        }

        let id = cached.module.id;
        for (f, new_id) in cached.funcs.iter_mut().zip(new_ids.iter()) {
            f.def.function_id = Some(*new_id);
        }
        tracing::debug!(module = %cached.module.path, "loaded module from cache");
        self.dep_outputs.lock().push(CompilationOutput {
            module: cached.module.clone(),
            funcs: cached.funcs.iter().map(|f| f.def.clone()).collect(),
            diagnostics: Vec::new(),
        });
        self.ctx.modules.write().add(cached.module)?;
        Ok(id)
    }

    fn write_cache(&self, cache_dir: &Path, output: &CompilationOutput) {
        if std::fs::create_dir_all(cache_dir).is_err() {
            return;
        }
        let types = {
            let reg = self.ctx.types.read();
            output
                .module
                .types
                .iter()
                .filter_map(|id| reg.get(*id).cloned())
                .collect::<Vec<_>>()
        };
        let funcs = {
            let reg = self.ctx.funcs.read();
            output
                .funcs
                .iter()
                .filter_map(|def| {
                    let id = def.function_id?;
                    let function = reg.get(id)?.clone();
                    Some(crate::modules::CachedFunction {
                        function,
                        def: def.clone(),
                        fixups: Vec::new(),
                    })
                })
                .collect::<Vec<_>>()
        };
        let cached = CachedModule {
            module: output.module.clone(),
            types,
            funcs,
        };
        let path = cache_dir.join(format!("{}.gsc", output.module.id));
        if let Err(e) = write_cached_module(&path, &cached) {
            tracing::warn!(error = %e, "failed to write module cache");
        }
    }
}
