//! Modules: the compiled unit registry, import resolution, scopes, and
//! the on-disk cache.

mod cache;
mod resolver;
mod scope;

pub use cache::{
    read_cached_module, signature_hash, write_cached_module, CachedFunction, CachedModule,
    CallFixup, CACHE_MAGIC, CACHE_VERSION,
};
pub use resolver::{resolve_import, ImportStack};
pub use scope::{Scope, ScopeKind, ScopeManager, Symbol};

use crate::error::{Error, Result};
use crate::source::SourceSpan;
use crate::types::{FunctionId, FunctionRegistry, TypeId, TypeRegistry};
use std::collections::HashMap;

/// One global variable owned by a module.
#[derive(Debug, Clone)]
pub struct Global {
    /// Name in the module's root scope
    pub name: String,
    /// Offset into the module's data arena
    pub offset: u32,
    /// Value type
    pub type_id: TypeId,
    /// Declaration site
    pub span: SourceSpan,
}

/// A host-registered enum bound onto a module.
#[derive(Debug, Clone)]
pub struct EnumDef {
    /// Enum name
    pub name: String,
    /// Ordered (name, value) pairs
    pub values: Vec<(String, i64)>,
}

/// What an exported name refers to.
#[derive(Debug, Clone)]
pub enum ModuleSymbol {
    /// A type
    Type(TypeId),
    /// An overload set
    Functions(Vec<FunctionId>),
    /// Index into the module's globals
    Global(u32),
    /// Index into the module's enums
    Enum(u32),
}

/// One compiled source file and everything it registered.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Stable id derived from the canonical path
    pub id: u32,
    /// Short name (file stem)
    pub name: String,
    /// Canonical path
    pub path: String,
    /// Types the module owns
    pub types: Vec<TypeId>,
    /// Functions the module owns
    pub functions: Vec<FunctionId>,
    /// Host-bound enums
    pub enums: Vec<EnumDef>,
    /// Module-level variables, in declaration order
    pub globals: Vec<Global>,
    /// Direct dependency module ids
    pub dependencies: Vec<u32>,
    /// Synthesized `__init__`, absent for host-only modules
    pub init_function: Option<FunctionId>,
    /// Importable names
    pub exports: HashMap<String, ModuleSymbol>,
    /// Interned string literals, referenced by index from the IR
    pub strings: Vec<String>,
    /// Bytes of global storage the module needs
    pub data_size: u32,
    /// Source modification time (epoch seconds)
    pub source_mtime: i64,
    /// Source content hash
    pub source_hash: u64,
}

impl Module {
    /// Looks up an exported symbol.
    pub fn export(&self, name: &str) -> Option<&ModuleSymbol> {
        self.exports.get(name)
    }
}

/// Owns every module, remembering registration order so teardown can run
/// strictly LIFO across modules.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    by_id: HashMap<u32, Module>,
    by_path: HashMap<String, u32>,
    order: Vec<u32>,
}

impl ModuleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        ModuleRegistry::default()
    }

    /// Registers a module.
    pub fn add(&mut self, module: Module) -> Result<u32> {
        if self.by_id.contains_key(&module.id) {
            return Err(Error::Bind {
                reason: format!("module '{}' is already registered", module.path),
            });
        }
        let id = module.id;
        self.by_path.insert(module.path.clone(), id);
        self.order.push(id);
        self.by_id.insert(id, module);
        Ok(id)
    }

    /// Lookup by id.
    pub fn get(&self, id: u32) -> Option<&Module> {
        self.by_id.get(&id)
    }

    /// Mutable lookup by id.
    pub fn get_mut(&mut self, id: u32) -> Option<&mut Module> {
        self.by_id.get_mut(&id)
    }

    /// Lookup by canonical path.
    pub fn get_by_path(&self, path: &str) -> Option<&Module> {
        self.by_path.get(path).and_then(|id| self.by_id.get(id))
    }

    /// Registration order, oldest first.
    pub fn registration_order(&self) -> &[u32] {
        &self.order
    }

    /// Destroys one module: its types leave the type registry and its
    /// functions stop resolving by name. Function records themselves stay
    /// (ids are process-stable).
    pub fn destroy(
        &mut self,
        id: u32,
        types: &mut TypeRegistry,
        funcs: &mut FunctionRegistry,
    ) -> Option<Module> {
        let module = self.by_id.remove(&id)?;
        self.by_path.remove(&module.path);
        self.order.retain(|m| *m != id);
        for tid in module.types.iter().rev() {
            types.remove(*tid);
        }
        for fid in module.functions.iter().rev() {
            funcs.retire(*fid);
        }
        tracing::debug!(module = %module.path, "destroyed module");
        Some(module)
    }

    /// Destroys every module in reverse registration order.
    pub fn destroy_all(&mut self, types: &mut TypeRegistry, funcs: &mut FunctionRegistry) {
        let order: Vec<u32> = self.order.iter().rev().copied().collect();
        for id in order {
            self.destroy(id, types, funcs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(path: &str) -> Module {
        Module {
            id: crate::source::module_id_from_path(path),
            name: path.trim_end_matches(".gs").to_string(),
            path: path.to_string(),
            ..Module::default()
        }
    }

    #[test]
    fn test_registration_and_lookup() {
        let mut reg = ModuleRegistry::new();
        let id = reg.add(module("a.gs")).unwrap();
        assert!(reg.get(id).is_some());
        assert!(reg.get_by_path("a.gs").is_some());
        assert!(reg.add(module("a.gs")).is_err());
    }

    #[test]
    fn test_teardown_reverse_order() {
        let mut reg = ModuleRegistry::new();
        let a = reg.add(module("a.gs")).unwrap();
        let b = reg.add(module("b.gs")).unwrap();
        assert_eq!(reg.registration_order(), &[a, b]);
        let mut types = TypeRegistry::new();
        let mut funcs = FunctionRegistry::new();
        reg.destroy_all(&mut types, &mut funcs);
        assert!(reg.get(a).is_none());
        assert!(reg.get(b).is_none());
    }
}
