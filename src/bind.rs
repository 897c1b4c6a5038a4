//! The host binding ABI.
//!
//! Host code registers types, functions, and enums against a [`Context`].
//! Every bound function is reached through a uniform wrapper:
//!
//! - non-methods: `wrapper(&mut CallContext)` with `this_ptr` null
//! - methods: the same, with `this_ptr` set
//!
//! Argument passing convention: primitives travel by value in the raw
//! `args` bit slots (floats as their IEEE bits); objects travel as
//! pointers to their storage. A pointer the callee treats as a pointer is
//! doubly indirected by the calling backend (the argument is parked in a
//! scratch slot and the slot's address passed). The wrapper placement-
//! constructs object returns through `return_ptr` and writes primitive
//! returns into `return_bits`. Signature mismatches are undefined
//! behavior, which is why registration spells out every argument.

use crate::compiler::Context;
use crate::error::{Error, Result};
use crate::modules::{EnumDef, Module, ModuleSymbol};
use crate::source::module_id_from_path;
use crate::types::{
    Access, ArgKind, DataType, Function, FunctionFlags, FunctionId, FunctionSignature, Property,
    PropertyFlags, SignatureArg, TypeId, TypeMeta,
};

/// The uniform call frame a wrapper receives.
pub struct CallContext {
    /// Primitive return value, written as raw bits
    pub return_bits: u64,
    /// Object return storage, null for primitive/void returns
    pub return_ptr: *mut u8,
    /// Registry id of the function being called
    pub function_id: FunctionId,
    /// Receiver storage for methods, null otherwise
    pub this_ptr: *mut u8,
    /// Backend execution state (memory translation for VM pointers)
    pub exec_ctx: *mut u8,
    /// Raw argument bits, implicit arguments excluded
    pub args: Vec<u64>,
}

/// A host-side adapter with the uniform signature.
pub type HostWrapper = fn(&mut CallContext);

/// Registers a free host function. `params` lists explicit arguments
/// only; objects must be marked [`ArgKind::Pointer`].
pub fn bind_function(
    ctx: &Context,
    name: &str,
    return_type: TypeId,
    params: &[(ArgKind, TypeId)],
    wrapper: HostWrapper,
) -> Result<FunctionId> {
    let signature = FunctionSignature::new(return_type, params);
    let wrapper_index = {
        let mut host_fns = ctx.host_fns.write();
        host_fns.push(wrapper);
        host_fns.len() as u32 - 1
    };
    let mut f = Function::script(name, name, signature, 0, Default::default());
    f.flags |= FunctionFlags::HOST;
    f.source = None;
    f.wrapper = Some(wrapper_index);
    ctx.funcs.write().register(f)
}

/// Declares a function the backends implement themselves (the runtime
/// intrinsics of the global module).
pub fn declare_intrinsic(
    ctx: &Context,
    name: &str,
    return_type: TypeId,
    params: &[(ArgKind, TypeId)],
) -> Result<FunctionId> {
    let signature = FunctionSignature::new(return_type, params);
    let mut f = Function::script(name, name, signature, 0, Default::default());
    f.flags |= FunctionFlags::HOST | FunctionFlags::INLINE;
    f.source = None;
    ctx.funcs.write().register(f)
}

/// Builder for one host-bound type.
pub struct TypeBuilder<'c> {
    ctx: &'c Context,
    ty: DataType,
    methods: Vec<(String, FunctionSignature, FunctionFlags, HostWrapper)>,
}

impl<'c> TypeBuilder<'c> {
    /// Starts a binding. `host_hash` is the host language's type-identity
    /// hash; registering two types with the same hash is a hard error.
    pub fn new(ctx: &'c Context, name: &str, host_hash: u64, size: u32, align: u32) -> Self {
        let mut ty = DataType::object(name, name, 0, false);
        ty.size = size;
        ty.align = align;
        ty.meta |= TypeMeta::HOST;
        ty.host_hash = Some(host_hash);
        TypeBuilder {
            ctx,
            ty,
            methods: Vec::new(),
        }
    }

    /// Overrides the meta flags (pod, trivially constructible/copyable/
    /// destructible).
    pub fn meta(mut self, meta: TypeMeta) -> Self {
        self.ty.meta = meta | TypeMeta::HOST;
        self
    }

    /// Adds a direct field.
    pub fn property(mut self, name: &str, offset: u32, type_id: TypeId) -> Self {
        self.ty.properties.push(Property {
            name: name.to_string(),
            access: Access::Public,
            offset,
            type_id,
            flags: PropertyFlags::READABLE | PropertyFlags::WRITABLE,
            getter: None,
            setter: None,
        });
        self
    }

    /// Adds a method. The wrapper is called with `this_ptr` set.
    pub fn method(
        mut self,
        name: &str,
        return_type: TypeId,
        params: &[(ArgKind, TypeId)],
        wrapper: HostWrapper,
    ) -> Self {
        let mut args = vec![SignatureArg {
            kind: ArgKind::ThisPtr,
            type_id: self.ty.id,
        }];
        args.extend(params.iter().map(|&(kind, type_id)| SignatureArg { kind, type_id }));
        let signature = FunctionSignature {
            this_type: Some(self.ty.id),
            return_type,
            args,
        };
        self.methods.push((
            name.to_string(),
            signature,
            FunctionFlags::METHOD | FunctionFlags::THISCALL,
            wrapper,
        ));
        self
    }

    /// Adds a constructor.
    pub fn constructor(self, params: &[(ArgKind, TypeId)], wrapper: HostWrapper) -> Self {
        let void = self.ctx.prims.void;
        let mut b = self.method("constructor", void, params, wrapper);
        let last = b.methods.last_mut().expect("just pushed");
        last.2 |= FunctionFlags::CONSTRUCTOR;
        b.ty.meta.remove(TypeMeta::TRIVIALLY_CONSTRUCTIBLE);
        b
    }

    /// Adds the destructor.
    pub fn destructor(self, wrapper: HostWrapper) -> Self {
        let void = self.ctx.prims.void;
        let mut b = self.method("destructor", void, &[], wrapper);
        let last = b.methods.last_mut().expect("just pushed");
        last.2 |= FunctionFlags::DESTRUCTOR;
        b.ty.meta.remove(TypeMeta::TRIVIALLY_DESTRUCTIBLE);
        b
    }

    /// Registers the type and its methods.
    pub fn build(self) -> Result<TypeId> {
        let TypeBuilder { ctx, mut ty, methods } = self;
        let type_name = ty.name.clone();
        let type_id = ty.id;

        let mut method_ids = Vec::new();
        {
            let mut funcs = ctx.funcs.write();
            let mut host_fns = ctx.host_fns.write();
            for (name, signature, flags, wrapper) in methods {
                host_fns.push(wrapper);
                let wrapper_index = host_fns.len() as u32 - 1;
                let fqn = format!("{}::{}", type_name, name);
                let mut f = Function::script(&name, fqn, signature, 0, Default::default());
                f.flags |= flags | FunctionFlags::HOST;
                f.source = None;
                f.wrapper = Some(wrapper_index);
                let id = funcs.register(f)?;
                if flags.contains(FunctionFlags::DESTRUCTOR) {
                    ty.destructor = Some(id);
                }
                method_ids.push(id);
            }
        }
        ty.methods = method_ids;
        ctx.types.write().add(ty)
    }
}

/// Registers a host module shell so enums/globals can hang off it.
pub fn bind_module(ctx: &Context, name: &str) -> Result<u32> {
    let path = format!("<host {}>", name);
    let module = Module {
        id: module_id_from_path(&path),
        name: name.to_string(),
        path,
        ..Module::default()
    };
    ctx.modules.write().add(module)
}

/// Attaches an enum to a module; script reads values through the member
/// operator (`mod.Value`).
pub fn bind_enum(ctx: &Context, module_id: u32, def: EnumDef) -> Result<()> {
    let mut modules = ctx.modules.write();
    let module = modules.get_mut(module_id).ok_or_else(|| Error::Bind {
        reason: format!("module {} is not registered", module_id),
    })?;
    let idx = module.enums.len() as u32;
    module
        .exports
        .insert(def.name.clone(), ModuleSymbol::Enum(idx));
    module.enums.push(def);
    Ok(())
}

/// Exports a host function set under a module's namespace.
pub fn export_function(ctx: &Context, module_id: u32, name: &str, id: FunctionId) -> Result<()> {
    let mut modules = ctx.modules.write();
    let module = modules.get_mut(module_id).ok_or_else(|| Error::Bind {
        reason: format!("module {} is not registered", module_id),
    })?;
    match module.exports.get_mut(name) {
        Some(ModuleSymbol::Functions(ids)) => ids.push(id),
        _ => {
            module
                .exports
                .insert(name.to_string(), ModuleSymbol::Functions(vec![id]));
        }
    }
    module.functions.push(id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Context;

    fn noop_wrapper(ctx: &mut CallContext) {
        ctx.return_bits = 0;
    }

    #[test]
    fn test_bind_function_registers() {
        let ctx = Context::new();
        let f64_ = ctx.prims.f64_;
        let id = bind_function(
            &ctx,
            "half",
            f64_,
            &[(ArgKind::Value, f64_)],
            noop_wrapper,
        )
        .unwrap();
        let funcs = ctx.funcs.read();
        let f = funcs.get(id).unwrap();
        assert!(f.flags.contains(FunctionFlags::HOST));
        assert!(f.wrapper.is_some());
    }

    #[test]
    fn test_duplicate_host_hash_rejected() {
        let ctx = Context::new();
        TypeBuilder::new(&ctx, "HostThing", 0xabc, 8, 8).build().unwrap();
        let err = TypeBuilder::new(&ctx, "OtherThing", 0xabc, 8, 8).build();
        assert!(err.is_err());
    }

    #[test]
    fn test_enum_binding() {
        let ctx = Context::new();
        let m = bind_module(&ctx, "colors").unwrap();
        bind_enum(
            &ctx,
            m,
            EnumDef {
                name: "Color".into(),
                values: vec![("red".into(), 0), ("green".into(), 1)],
            },
        )
        .unwrap();
        let modules = ctx.modules.read();
        let module = modules.get(m).unwrap();
        assert_eq!(module.enums.len(), 1);
        assert!(module.export("Color").is_some());
    }
}
