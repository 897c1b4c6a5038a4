//! Type and function registries: canonicalization, lookup, equivalence,
//! conversion, and overload resolution.

use super::data_type::{
    Access, ArgKind, DataType, FunctionId, TypeId, TypeMeta, TypeShape,
};
use super::functions::{Function, FunctionFlags};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Maximum alias-chain length tolerated before declaring a cycle. Chains
/// are produced by `type X = Y` declarations and stay tiny in practice.
const MAX_ALIAS_DEPTH: usize = 64;

/// Owns every [`DataType`] in the process.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    by_id: HashMap<TypeId, DataType>,
    by_name: HashMap<String, TypeId>,
    by_host_hash: HashMap<u64, TypeId>,
    error_type: TypeId,
}

impl TypeRegistry {
    /// Creates an empty registry containing only the error sentinel.
    pub fn new() -> Self {
        let mut reg = TypeRegistry::default();
        let mut err = DataType::primitive("<error>", 0, false, true);
        err.shape = TypeShape::Error;
        err.meta = TypeMeta::empty();
        reg.error_type = err.id;
        reg.by_name.insert(err.fully_qualified_name.clone(), err.id);
        reg.by_id.insert(err.id, err);
        reg
    }

    /// The sentinel type substituted while recovering from errors.
    pub fn error_type(&self) -> TypeId {
        self.error_type
    }

    /// Registers a type. Duplicate ids or host hashes are hard errors.
    pub fn add(&mut self, ty: DataType) -> Result<TypeId> {
        if self.by_id.contains_key(&ty.id) {
            return Err(Error::Bind {
                reason: format!("type '{}' is already registered", ty.fully_qualified_name),
            });
        }
        if let Some(hash) = ty.host_hash {
            if self.by_host_hash.contains_key(&hash) {
                return Err(Error::Bind {
                    reason: format!(
                        "host hash of type '{}' is already registered",
                        ty.fully_qualified_name
                    ),
                });
            }
            self.by_host_hash.insert(hash, ty.id);
        }
        let id = ty.id;
        self.by_name.insert(ty.fully_qualified_name.clone(), id);
        self.by_id.insert(id, ty);
        Ok(id)
    }

    /// Removes a type (module teardown).
    pub fn remove(&mut self, id: TypeId) {
        if let Some(ty) = self.by_id.remove(&id) {
            self.by_name.remove(&ty.fully_qualified_name);
            if let Some(hash) = ty.host_hash {
                self.by_host_hash.remove(&hash);
            }
        }
    }

    /// Lookup by id.
    pub fn get(&self, id: TypeId) -> Option<&DataType> {
        self.by_id.get(&id)
    }

    /// Mutable lookup by id.
    pub fn get_mut(&mut self, id: TypeId) -> Option<&mut DataType> {
        self.by_id.get_mut(&id)
    }

    /// Lookup by fully qualified name.
    pub fn get_by_name(&self, fqn: &str) -> Option<&DataType> {
        self.by_name.get(fqn).and_then(|id| self.by_id.get(id))
    }

    /// Lookup by the host's type-identity hash.
    pub fn get_by_host_hash(&self, hash: u64) -> Option<&DataType> {
        self.by_host_hash.get(&hash).and_then(|id| self.by_id.get(id))
    }

    /// Follows the alias chain to the non-alias type.
    pub fn effective(&self, id: TypeId) -> Option<&DataType> {
        let mut cur = self.by_id.get(&id)?;
        for _ in 0..MAX_ALIAS_DEPTH {
            match cur.shape {
                TypeShape::Alias { target } => cur = self.by_id.get(&target)?,
                _ => return Some(cur),
            }
        }
        None
    }

    /// Effective id of a type (alias chain collapsed).
    pub fn effective_id(&self, id: TypeId) -> TypeId {
        self.effective(id).map(|t| t.id).unwrap_or(id)
    }

    /// Equality: effective ids are identical.
    pub fn equals(&self, a: TypeId, b: TypeId) -> bool {
        self.effective_id(a) == self.effective_id(b)
    }

    /// Equivalence: same meta flags, method set, property set, and base
    /// list, compared recursively through the function registry.
    pub fn equivalent(&self, a: TypeId, b: TypeId, funcs: &FunctionRegistry) -> bool {
        if self.equals(a, b) {
            return true;
        }
        let (Some(ta), Some(tb)) = (self.effective(a), self.effective(b)) else {
            return false;
        };

        if ta.meta != tb.meta {
            return false;
        }

        if ta.properties.len() != tb.properties.len() {
            return false;
        }
        for (pa, pb) in ta.properties.iter().zip(tb.properties.iter()) {
            if pa.name != pb.name
                || pa.offset != pb.offset
                || pa.access != pb.access
                || pa.flags != pb.flags
            {
                return false;
            }
            if !self.equals(pa.type_id, pb.type_id)
                && !self.equivalent(pa.type_id, pb.type_id, funcs)
            {
                return false;
            }
        }

        if ta.methods.len() != tb.methods.len() {
            return false;
        }
        for (ma, mb) in ta.methods.iter().zip(tb.methods.iter()) {
            let (Some(fa), Some(fb)) = (funcs.get(*ma), funcs.get(*mb)) else {
                return false;
            };
            if fa.name != fb.name
                || fa.access != fb.access
                || fa.is_method() != fb.is_method()
                || !fa.signature.matches(&fb.signature)
            {
                return false;
            }
        }

        if ta.bases.len() != tb.bases.len() {
            return false;
        }
        ta.bases
            .iter()
            .zip(tb.bases.iter())
            .all(|(ba, bb)| self.equals(ba.type_id, bb.type_id) && ba.access == bb.access)
    }

    /// Conversion rule: primitives interconvert; otherwise a cast operator
    /// on `from` returning `to`, or a single-argument constructor of `to`
    /// taking exactly `from`.
    pub fn is_convertible(&self, from: TypeId, to: TypeId, funcs: &FunctionRegistry) -> bool {
        if self.equals(from, to) {
            return true;
        }
        let (Some(tf), Some(tt)) = (self.effective(from), self.effective(to)) else {
            return false;
        };
        if tf.is_primitive() && tt.is_primitive() {
            return true;
        }

        // cast operator on the source type
        for mid in &tf.methods {
            if let Some(m) = funcs.get(*mid) {
                if m.flags.contains(FunctionFlags::OPERATOR)
                    && m.name == "operator cast"
                    && self.equals(m.signature.return_type, tt.id)
                {
                    return true;
                }
            }
        }

        // single-argument constructor on the target type
        for mid in &tt.methods {
            if let Some(m) = funcs.get(*mid) {
                if m.flags.contains(FunctionFlags::CONSTRUCTOR) {
                    let explicit: Vec<_> = m.signature.explicit_args().collect();
                    if explicit.len() == 1 && self.equals(explicit[0].type_id, tf.id) {
                        return true;
                    }
                }
            }
        }

        false
    }

    /// Implicit assignability, strictly stricter than convertibility:
    /// same primitive family, or the same (or equivalent) trivially
    /// copyable type.
    pub fn is_implicitly_assignable(
        &self,
        from: TypeId,
        to: TypeId,
        funcs: &FunctionRegistry,
    ) -> bool {
        if self.equals(from, to) {
            return true;
        }
        let (Some(tf), Some(tt)) = (self.effective(from), self.effective(to)) else {
            return false;
        };
        if tf.is_primitive() && tt.is_primitive() {
            let same_family = (tf.is_floating_point() == tt.is_floating_point())
                && (tf.is_floating_point() || tf.is_unsigned() == tt.is_unsigned());
            return same_family;
        }
        tf.is_trivially_copyable()
            && tt.is_trivially_copyable()
            && self.equivalent(from, to, funcs)
    }

    /// Every registered type id, in arbitrary order.
    pub fn ids(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.by_id.keys().copied()
    }
}

/// Flags steering one overload-resolution query.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchFlags {
    /// Skip arity/convertibility filtering entirely
    pub ignore_args: bool,
    /// Count implicit args when checking arity
    pub include_implicit: bool,
    /// Require return type equality instead of convertibility
    pub strict_return: bool,
}

/// Owns every [`Function`]; indices double as function ids.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: Vec<Function>,
    by_fqn: HashMap<String, Vec<FunctionId>>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        FunctionRegistry::default()
    }

    /// Registers a function and assigns its id. A function whose name and
    /// signature both collide with an existing registration is rejected.
    pub fn register(&mut self, mut f: Function) -> Result<FunctionId> {
        if let Some(existing) = self.by_fqn.get(&f.fully_qualified_name) {
            for id in existing {
                if self.functions[*id as usize].same_overload(&f) {
                    return Err(Error::Bind {
                        reason: format!(
                            "function '{}' was already declared",
                            f.fully_qualified_name
                        ),
                    });
                }
            }
        }
        let id = self.functions.len() as FunctionId;
        f.id = id;
        self.by_fqn
            .entry(f.fully_qualified_name.clone())
            .or_default()
            .push(id);
        self.functions.push(f);
        Ok(id)
    }

    /// Retires a function: its record stays (ids are process-stable) but
    /// name lookups no longer find it. Used by module teardown.
    pub fn retire(&mut self, id: FunctionId) {
        if let Some(f) = self.functions.get(id as usize) {
            let fqn = f.fully_qualified_name.clone();
            if let Some(ids) = self.by_fqn.get_mut(&fqn) {
                ids.retain(|i| *i != id);
                if ids.is_empty() {
                    self.by_fqn.remove(&fqn);
                }
            }
        }
    }

    /// Lookup by id.
    pub fn get(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id as usize)
    }

    /// Mutable lookup by id.
    pub fn get_mut(&mut self, id: FunctionId) -> Option<&mut Function> {
        self.functions.get_mut(id as usize)
    }

    /// All overloads registered under a fully qualified name.
    pub fn get_by_fqn(&self, fqn: &str) -> &[FunctionId] {
        self.by_fqn.get(fqn).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Overload resolution over `candidates`.
    ///
    /// Filters by arity (unless `ignore_args`), argument convertibility,
    /// then return-type compatibility. If exactly one survivor matches
    /// every argument type *equally*, only it is returned; otherwise all
    /// survivors come back and the caller reports ambiguity.
    pub fn function_match(
        &self,
        types: &TypeRegistry,
        candidates: &[FunctionId],
        return_hint: Option<TypeId>,
        arg_types: &[TypeId],
        flags: MatchFlags,
    ) -> Vec<FunctionId> {
        let mut survivors: Vec<FunctionId> = Vec::new();

        'candidate: for &id in candidates {
            let Some(f) = self.get(id) else { continue };

            if !flags.ignore_args {
                let arity = if flags.include_implicit {
                    f.signature.args.len()
                } else {
                    f.signature.explicit_arg_count()
                };
                if arity != arg_types.len() {
                    continue;
                }
                let params: Vec<TypeId> = if flags.include_implicit {
                    f.signature.args.iter().map(|a| a.type_id).collect()
                } else {
                    f.signature.explicit_args().map(|a| a.type_id).collect()
                };
                for (supplied, wanted) in arg_types.iter().zip(params.iter()) {
                    if !types.is_convertible(*supplied, *wanted, self) {
                        continue 'candidate;
                    }
                }
            }

            if let Some(ret) = return_hint {
                let ok = if flags.strict_return {
                    types.equals(f.signature.return_type, ret)
                } else {
                    types.is_convertible(f.signature.return_type, ret, self)
                };
                if !ok {
                    continue;
                }
            }

            survivors.push(id);
        }

        if survivors.len() > 1 && !flags.ignore_args {
            // a candidate equal in every argument type beats the rest
            let exact: Vec<FunctionId> = survivors
                .iter()
                .copied()
                .filter(|id| {
                    let f = &self.functions[*id as usize];
                    let params: Vec<TypeId> =
                        f.signature.explicit_args().map(|a| a.type_id).collect();
                    params.len() == arg_types.len()
                        && params
                            .iter()
                            .zip(arg_types.iter())
                            .all(|(p, a)| types.equals(*p, *a))
                })
                .collect();
            if exact.len() == 1 {
                return exact;
            }
        }

        survivors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::data_type::{FunctionSignature, SignatureArg};

    fn reg_with_primitives() -> TypeRegistry {
        let mut reg = TypeRegistry::new();
        for (name, size, float, signed) in [
            ("void", 0, false, true),
            ("bool", 1, false, false),
            ("i32", 4, false, true),
            ("u32", 4, false, false),
            ("f32", 4, true, true),
            ("f64", 8, true, true),
        ] {
            reg.add(DataType::primitive(name, size, float, signed)).unwrap();
        }
        reg
    }

    fn tid(reg: &TypeRegistry, name: &str) -> TypeId {
        reg.get_by_name(name).unwrap().id
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let mut reg = reg_with_primitives();
        assert!(reg.add(DataType::primitive("i32", 4, false, true)).is_err());
    }

    #[test]
    fn test_alias_chain_terminates() {
        let mut reg = reg_with_primitives();
        let i32_id = tid(&reg, "i32");
        let mut alias = DataType::primitive("int", 4, false, true);
        alias.shape = TypeShape::Alias { target: i32_id };
        let alias_id = reg.add(alias).unwrap();
        assert_eq!(reg.effective_id(alias_id), i32_id);
        assert!(reg.equals(alias_id, i32_id));
    }

    #[test]
    fn test_primitives_convertible() {
        let reg = reg_with_primitives();
        let funcs = FunctionRegistry::new();
        assert!(reg.is_convertible(tid(&reg, "i32"), tid(&reg, "f64"), &funcs));
        assert!(reg.is_convertible(tid(&reg, "bool"), tid(&reg, "u32"), &funcs));
    }

    #[test]
    fn test_implicit_assignability_stricter() {
        let reg = reg_with_primitives();
        let funcs = FunctionRegistry::new();
        let i32_id = tid(&reg, "i32");
        let u32_id = tid(&reg, "u32");
        let f32_id = tid(&reg, "f32");
        let f64_id = tid(&reg, "f64");
        // convertible but not implicitly assignable across families
        assert!(reg.is_convertible(i32_id, f32_id, &funcs));
        assert!(!reg.is_implicitly_assignable(i32_id, f32_id, &funcs));
        assert!(!reg.is_implicitly_assignable(i32_id, u32_id, &funcs));
        assert!(reg.is_implicitly_assignable(f32_id, f64_id, &funcs));
    }

    #[test]
    fn test_duplicate_function_rejected() {
        let reg = reg_with_primitives();
        let mut funcs = FunctionRegistry::new();
        let void_id = tid(&reg, "void");
        let i32_id = tid(&reg, "i32");
        let sig = FunctionSignature {
            this_type: None,
            return_type: void_id,
            args: vec![SignatureArg { kind: ArgKind::Value, type_id: i32_id }],
        };
        let f1 = Function::script("foo", "main::foo", sig.clone(), 1, Default::default());
        let f2 = Function::script("foo", "main::foo", sig, 1, Default::default());
        funcs.register(f1).unwrap();
        assert!(funcs.register(f2).is_err());
    }

    #[test]
    fn test_overload_resolution_exact_wins() {
        let reg = reg_with_primitives();
        let mut funcs = FunctionRegistry::new();
        let void_id = tid(&reg, "void");
        let i32_id = tid(&reg, "i32");
        let f64_id = tid(&reg, "f64");

        let mk = |arg: TypeId| FunctionSignature {
            this_type: None,
            return_type: void_id,
            args: vec![SignatureArg { kind: ArgKind::Value, type_id: arg }],
        };
        let a = funcs
            .register(Function::script("p", "main::p", mk(i32_id), 1, Default::default()))
            .unwrap();
        let b = funcs
            .register(Function::script("p", "main::p", mk(f64_id), 1, Default::default()))
            .unwrap();

        let candidates = funcs.get_by_fqn("main::p").to_vec();
        // exact i32 match wins over the convertible f64 overload
        let found = funcs.function_match(&reg, &candidates, None, &[i32_id], MatchFlags::default());
        assert_eq!(found, vec![a]);
        let found = funcs.function_match(&reg, &candidates, None, &[f64_id], MatchFlags::default());
        assert_eq!(found, vec![b]);
    }

    #[test]
    fn test_overload_resolution_ambiguous_returns_all() {
        let reg = reg_with_primitives();
        let mut funcs = FunctionRegistry::new();
        let void_id = tid(&reg, "void");
        let f32_id = tid(&reg, "f32");
        let f64_id = tid(&reg, "f64");
        let i32_id = tid(&reg, "i32");

        let mk = |arg: TypeId| FunctionSignature {
            this_type: None,
            return_type: void_id,
            args: vec![SignatureArg { kind: ArgKind::Value, type_id: arg }],
        };
        funcs
            .register(Function::script("q", "main::q", mk(f32_id), 1, Default::default()))
            .unwrap();
        funcs
            .register(Function::script("q", "main::q", mk(f64_id), 1, Default::default()))
            .unwrap();

        let candidates = funcs.get_by_fqn("main::q").to_vec();
        // i32 converts to both floats, neither is exact
        let found = funcs.function_match(&reg, &candidates, None, &[i32_id], MatchFlags::default());
        assert_eq!(found.len(), 2);
    }
}
