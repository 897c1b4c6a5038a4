//! Template instantiation: generic declarations are kept as detached
//! ASTs and specialized on demand by cloning and recompiling them with
//! the parameter names bound to concrete types.

use super::codegen::Compiler;
use super::Context;
use crate::error::ErrorCode;
use crate::modules::Symbol;
use crate::parser::{NodeKind, NodePool, NodeRef};
use crate::source::SourceSpan;
use crate::types::{DataType, TemplateAst, TypeId, TypeMeta, TypeShape};
use std::sync::Arc;

/// Specialization recursion bound. A genuine runaway (each level widening
/// the type) is reported instead of overflowing the stack.
pub const MAX_SPECIALIZATION_DEPTH: u32 = 64;

fn template_params(pool: &NodePool, node: NodeRef) -> Vec<String> {
    pool.siblings(pool.get(node).template_parameters)
        .map(|p| pool.get(p).text().to_string())
        .collect()
}

/// Registers a template class/typedef: its declaration subtree is cloned
/// into a detached pool owned by the registered type.
pub(crate) fn declare(comp: &mut Compiler, node: NodeRef, name: &str) -> Result<TypeId, ()> {
    let mut detached = NodePool::new();
    let root = comp.pool.clone_into(node, &mut detached);
    let param_names = template_params(&detached, root);
    let module_id = comp.module_id;

    let fqn = format!("{}::{}", comp.module_name(), name);
    let mut ty = DataType::object(&fqn, name, module_id, true);
    ty.shape = TypeShape::Template(Arc::new(TemplateAst {
        pool: detached,
        root,
        origin_module: module_id,
        param_names,
    }));
    ty.meta |= TypeMeta::TEMPLATE;
    let id = ty.id;
    comp.ctx.types.write().add(ty).map_err(|_| ())?;
    Ok(id)
}

/// Registers a template function the same way; it specializes through
/// [`instantiate_function`].
pub(crate) fn declare_function(
    comp: &mut Compiler,
    node: NodeRef,
    name: &str,
) -> Result<TypeId, ()> {
    declare(comp, node, name)
}

fn template_module_name(comp: &Compiler) -> String {
    comp.module_name().to_string()
}

fn specialized_name(ctx: &Context, base: &str, args: &[TypeId]) -> String {
    let arg_names: Vec<String> = {
        let types = ctx.types.read();
        args.iter()
            .map(|a| {
                types
                    .get(*a)
                    .map(|t| t.fully_qualified_name.clone())
                    .unwrap_or_else(|| format!("{:#x}", a))
            })
            .collect()
    };
    format!("{}<{}>", base, arg_names.join(","))
}

/// Specializes a template type for concrete arguments. The generated
/// fully-qualified name doubles as the specialization cache key; repeat
/// requests return the cached type, which also terminates recursive
/// instantiations.
pub(crate) fn instantiate(
    comp: &mut Compiler,
    template_id: TypeId,
    args: &[TypeId],
    span: SourceSpan,
) -> Result<TypeId, ()> {
    let (tpl, base_fqn, base_name) = {
        let types = comp.ctx.types.read();
        let Some(ty) = types.get(template_id) else {
            return Err(());
        };
        match &ty.shape {
            TypeShape::Template(tpl) => (
                tpl.clone(),
                ty.fully_qualified_name.clone(),
                ty.name.clone(),
            ),
            _ => return Err(()),
        }
    };

    if args.len() != tpl.param_names.len() {
        comp.logger.submit(crate::error::Diagnostic::error(
            ErrorCode::TemplateWrongArity,
            format!(
                "Template '{}' takes {} argument(s), {} given",
                base_name,
                tpl.param_names.len(),
                args.len()
            ),
            span,
        ));
        return Err(());
    }

    let fqn = specialized_name(comp.ctx, &base_fqn, args);
    if let Some(existing) = comp.ctx.types.read().get_by_name(&fqn) {
        return Ok(existing.id);
    }

    if comp.template_depth + 1 > MAX_SPECIALIZATION_DEPTH {
        comp.logger.submit(crate::error::Diagnostic::error(
            ErrorCode::TemplateDepthExceeded,
            format!(
                "Template specialization of '{}' exceeded the depth limit ({})",
                base_name, MAX_SPECIALIZATION_DEPTH
            ),
            span,
        ));
        return Err(());
    }

    tracing::debug!(template = %base_name, %fqn, "instantiating template");

    let display = specialized_name(comp.ctx, &base_name, args);
    let module_name = template_module_name(comp);
    let module_path = format!("<template {}>", fqn);

    let root_kind = tpl.pool.get(tpl.root).kind;

    let mut sub = Compiler::for_template(
        comp.ctx,
        &tpl.pool,
        tpl.origin_module,
        module_name,
        module_path,
        comp.template_depth + 1,
    );

    // the template sees its definition-site imports: rebind the origin
    // module's dependency exports
    bind_origin_imports(&mut sub, tpl.origin_module);

    // parameter names map to the concrete argument types
    for (pname, arg) in tpl.param_names.iter().zip(args.iter()) {
        sub.scopes_declare_type(pname, *arg);
    }

    let result = match root_kind {
        NodeKind::Class => {
            let mut ty = DataType::object(&fqn, &display, tpl.origin_module, true);
            ty.shape = TypeShape::Class;
            let id = ty.id;
            if comp.ctx.types.write().add(ty).is_err() {
                return Err(());
            }
            sub.scopes_declare_type(&base_name, id);
            sub.compile_class_body(tpl.root, id);
            Ok(id)
        }
        NodeKind::TypeDef => {
            let target = tpl
                .pool
                .get(tpl.root)
                .data_type
                .map(|t| sub.resolve_type_spec(t));
            let mut ty = DataType::object(&fqn, &display, tpl.origin_module, false);
            ty.shape = TypeShape::Alias {
                target: target.unwrap_or(comp.ctx.prims.error),
            };
            let id = ty.id;
            if comp.ctx.types.write().add(ty).is_err() {
                return Err(());
            }
            Ok(id)
        }
        NodeKind::Function => {
            // function templates instantiate to a callable, not a type
            let fid = sub.compile_function_inner(
                tpl.root,
                display.clone(),
                fqn.clone(),
                None,
                Default::default(),
            );
            match fid {
                Some(_) => Ok(comp.ctx.prims.void),
                None => Err(()),
            }
        }
        _ => Err(()),
    };

    // fold the specialization's output back into the requesting compile
    let (mut defs, mut module, diagnostics) = sub.into_parts();
    if !defs.is_empty() {
        // index 0 is the unused __init__ shell of the sub-compiler
        comp.funcs.extend(defs.drain(1..));
    }
    comp.module_types_extend(&module.types);
    comp.module_functions_extend(&module.functions);
    module.functions.clear();
    for diag in diagnostics {
        comp.logger.submit(diag);
    }

    if let Ok(id) = result {
        if id != comp.ctx.prims.void {
            comp.module_types_extend(&[id]);
        }
    }
    result
}

/// Instantiates a function template with explicit argument types.
pub fn instantiate_function(
    comp: &mut Compiler,
    template_id: TypeId,
    args: &[TypeId],
    span: SourceSpan,
) -> Result<TypeId, ()> {
    instantiate(comp, template_id, args, span)
}

fn bind_origin_imports(sub: &mut Compiler, origin_module: u32) {
    let bindings: Vec<(String, Symbol)> = {
        let modules = sub.ctx.modules.read();
        let Some(origin) = modules.get(origin_module) else {
            return;
        };
        let mut out = Vec::new();
        for dep in &origin.dependencies {
            let Some(dep_module) = modules.get(*dep) else {
                continue;
            };
            for (name, symbol) in &dep_module.exports {
                match symbol {
                    crate::modules::ModuleSymbol::Type(t) => {
                        out.push((name.clone(), Symbol::Type(*t)))
                    }
                    crate::modules::ModuleSymbol::Functions(ids) => {
                        out.push((name.clone(), Symbol::Functions(ids.clone())))
                    }
                    _ => {}
                }
            }
            out.push((dep_module.name.clone(), Symbol::Module(*dep)));
        }
        out
    };
    for (name, symbol) in bindings {
        sub.scopes_redeclare(name, symbol);
    }
}
