//! Data types: primitives, objects, signatures, aliases, templates.

use crate::parser::{NodePool, NodeRef};
use crate::source::hash64;
use bitflags::bitflags;
use std::sync::Arc;

/// Stable 64-bit type id, a hash of the fully qualified name
pub type TypeId = u64;

/// Stable per-process function id, the function registry index
pub type FunctionId = u32;

/// Derives a type id from a fully qualified name.
pub fn type_id_from_name(fqn: &str) -> TypeId {
    hash64(fqn.as_bytes())
}

bitflags! {
    /// Meta flags describing a type's shape
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeMeta: u32 {
        const POD                     = 1 << 0;
        const TRIVIALLY_CONSTRUCTIBLE = 1 << 1;
        const TRIVIALLY_COPYABLE      = 1 << 2;
        const TRIVIALLY_DESTRUCTIBLE  = 1 << 3;
        const PRIMITIVE               = 1 << 4;
        const FLOATING_POINT          = 1 << 5;
        const INTEGRAL                = 1 << 6;
        const UNSIGNED                = 1 << 7;
        const FUNCTION                = 1 << 8;
        const TEMPLATE                = 1 << 9;
        /// Bound from the host rather than compiled from script
        const HOST                    = 1 << 10;
    }
}

/// Access modifier on declarations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    /// Visible to importers
    #[default]
    Public,
    /// Visible only inside the declaring type or module
    Private,
}

/// How one argument travels in a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// By value (primitives)
    Value,
    /// By pointer (objects)
    Pointer,
    /// Implicit `this`
    ThisPtr,
    /// Implicit return-value pointer
    RetPtr,
    /// Implicit execution context
    ContextPtr,
    /// Implicit closure capture data
    CapturePtr,
    /// Implicit module type id
    ModuleTypeId,
}

impl ArgKind {
    /// True for compiler-inserted arguments.
    pub fn is_implicit(self) -> bool {
        !matches!(self, ArgKind::Value | ArgKind::Pointer)
    }
}

/// One argument slot of a function signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureArg {
    /// Passing convention
    pub kind: ArgKind,
    /// Argument type
    pub type_id: TypeId,
}

/// A function type: this-type, return type, and the ordered argument
/// list with implicit arguments always listed first.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSignature {
    /// Owning type for methods
    pub this_type: Option<TypeId>,
    /// Return type (`void` for none)
    pub return_type: TypeId,
    /// All arguments, implicit first
    pub args: Vec<SignatureArg>,
}

impl FunctionSignature {
    /// Creates a free-function signature with explicit args only.
    pub fn new(return_type: TypeId, explicit: &[(ArgKind, TypeId)]) -> Self {
        FunctionSignature {
            this_type: None,
            return_type,
            args: explicit
                .iter()
                .map(|&(kind, type_id)| SignatureArg { kind, type_id })
                .collect(),
        }
    }

    /// The explicit (caller-supplied) arguments.
    pub fn explicit_args(&self) -> impl Iterator<Item = &SignatureArg> {
        self.args.iter().filter(|a| !a.kind.is_implicit())
    }

    /// Number of explicit arguments.
    pub fn explicit_arg_count(&self) -> usize {
        self.explicit_args().count()
    }

    /// Structural match ignoring the this-type. Used for equivalence and
    /// for the "same overload" rule.
    pub fn matches(&self, other: &FunctionSignature) -> bool {
        self.return_type == other.return_type
            && self.args.len() == other.args.len()
            && self
                .args
                .iter()
                .zip(other.args.iter())
                .all(|(a, b)| a.kind == b.kind && (a.kind == ArgKind::ThisPtr || a.type_id == b.type_id))
    }
}

bitflags! {
    /// Property attribute bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PropertyFlags: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const STATIC   = 1 << 2;
        const POINTER  = 1 << 3;
    }
}

/// A named member of an object type.
///
/// With no accessors the property is a direct field at `offset`;
/// otherwise reads/writes route through `getter`/`setter` and the
/// offset is meaningless.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    /// Member name
    pub name: String,
    /// Visibility
    pub access: Access,
    /// Byte offset inside the owning object
    pub offset: u32,
    /// Member type
    pub type_id: TypeId,
    /// Attribute bits
    pub flags: PropertyFlags,
    /// Accessor used for reads, if any
    pub getter: Option<FunctionId>,
    /// Accessor used for writes, if any
    pub setter: Option<FunctionId>,
}

impl Property {
    /// True when accesses go through accessor functions.
    pub fn uses_accessors(&self) -> bool {
        self.getter.is_some() || self.setter.is_some()
    }
}

/// One inherited base of a class
#[derive(Debug, Clone, PartialEq)]
pub struct TypeBase {
    /// Base type
    pub type_id: TypeId,
    /// Byte offset of the base subobject
    pub offset: u32,
    /// Inheritance visibility
    pub access: Access,
}

/// The body of a template type: its detached AST and definition context.
#[derive(Debug)]
pub struct TemplateAst {
    /// Pool owning the detached clone of the declaration
    pub pool: NodePool,
    /// Root of the declaration inside `pool`
    pub root: NodeRef,
    /// Module the template was declared in
    pub origin_module: u32,
    /// Template parameter names, in order
    pub param_names: Vec<String>,
}

/// Type variants
#[derive(Debug, Clone)]
pub enum TypeShape {
    /// Fixed-width scalar
    Primitive,
    /// Plain object with fields
    Object,
    /// Callable signature
    Function(FunctionSignature),
    /// Transparent name for another type
    Alias {
        /// Aliased type
        target: TypeId,
    },
    /// Uninstantiated generic; holds the AST to clone on demand
    Template(Arc<TemplateAst>),
    /// Object with inheritance
    Class,
    /// Sentinel produced while recovering from compile errors
    Error,
}

/// A registered data type.
#[derive(Debug, Clone)]
pub struct DataType {
    /// Stable id, `hash64(fully_qualified_name)`
    pub id: TypeId,
    /// Unqualified name
    pub name: String,
    /// `module::Name` (or `Name<Args>` for specializations)
    pub fully_qualified_name: String,
    /// Variant payload
    pub shape: TypeShape,
    /// Size in bytes
    pub size: u32,
    /// Natural alignment in bytes
    pub align: u32,
    /// Meta flags
    pub meta: TypeMeta,
    /// Identity hash supplied by the host for bound types
    pub host_hash: Option<u64>,
    /// Named members
    pub properties: Vec<Property>,
    /// Methods, constructors included
    pub methods: Vec<FunctionId>,
    /// Destructor, if the type needs one
    pub destructor: Option<FunctionId>,
    /// Base classes in declaration order
    pub bases: Vec<TypeBase>,
    /// Module that owns the type
    pub owner_module: u32,
    /// Visibility to importers
    pub access: Access,
}

impl DataType {
    /// Creates a primitive type.
    pub fn primitive(name: &str, size: u32, float: bool, signed: bool) -> Self {
        let mut meta = TypeMeta::PRIMITIVE
            | TypeMeta::POD
            | TypeMeta::TRIVIALLY_CONSTRUCTIBLE
            | TypeMeta::TRIVIALLY_COPYABLE
            | TypeMeta::TRIVIALLY_DESTRUCTIBLE;
        if float {
            meta |= TypeMeta::FLOATING_POINT;
        } else if size > 0 {
            meta |= TypeMeta::INTEGRAL;
            if !signed {
                meta |= TypeMeta::UNSIGNED;
            }
        }
        DataType {
            id: type_id_from_name(name),
            name: name.to_string(),
            fully_qualified_name: name.to_string(),
            shape: TypeShape::Primitive,
            size,
            align: size.max(1),
            meta,
            host_hash: None,
            properties: Vec::new(),
            methods: Vec::new(),
            destructor: None,
            bases: Vec::new(),
            owner_module: 0,
            access: Access::Public,
        }
    }

    /// Creates an empty object/class shell to be laid out by the compiler.
    pub fn object(fqn: &str, name: &str, owner_module: u32, class: bool) -> Self {
        DataType {
            id: type_id_from_name(fqn),
            name: name.to_string(),
            fully_qualified_name: fqn.to_string(),
            shape: if class { TypeShape::Class } else { TypeShape::Object },
            size: 0,
            align: 1,
            meta: TypeMeta::TRIVIALLY_CONSTRUCTIBLE
                | TypeMeta::TRIVIALLY_COPYABLE
                | TypeMeta::TRIVIALLY_DESTRUCTIBLE,
            host_hash: None,
            properties: Vec::new(),
            methods: Vec::new(),
            destructor: None,
            bases: Vec::new(),
            owner_module,
            access: Access::Public,
        }
    }

    /// Finds a direct property by name.
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// True for floating-point primitives.
    pub fn is_floating_point(&self) -> bool {
        self.meta.contains(TypeMeta::FLOATING_POINT)
    }

    /// True for primitives.
    pub fn is_primitive(&self) -> bool {
        self.meta.contains(TypeMeta::PRIMITIVE)
    }

    /// True for unsigned integral primitives.
    pub fn is_unsigned(&self) -> bool {
        self.meta.contains(TypeMeta::UNSIGNED)
    }

    /// True when values can be memcpy'd.
    pub fn is_trivially_copyable(&self) -> bool {
        self.meta.contains(TypeMeta::TRIVIALLY_COPYABLE)
    }

    /// True when no destructor call is needed.
    pub fn is_trivially_destructible(&self) -> bool {
        self.meta.contains(TypeMeta::TRIVIALLY_DESTRUCTIBLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_meta() {
        let t = DataType::primitive("u32", 4, false, false);
        assert!(t.meta.contains(TypeMeta::PRIMITIVE | TypeMeta::INTEGRAL | TypeMeta::UNSIGNED));
        assert!(!t.meta.contains(TypeMeta::FLOATING_POINT));
        let f = DataType::primitive("f64", 8, true, true);
        assert!(f.is_floating_point());
        assert!(!f.is_unsigned());
    }

    #[test]
    fn test_type_ids_unique_per_name() {
        assert_ne!(type_id_from_name("i32"), type_id_from_name("u32"));
        assert_eq!(type_id_from_name("vec2f"), type_id_from_name("vec2f"));
    }

    #[test]
    fn test_signature_match_ignores_this() {
        let a = FunctionSignature {
            this_type: Some(1),
            return_type: 10,
            args: vec![
                SignatureArg { kind: ArgKind::ThisPtr, type_id: 1 },
                SignatureArg { kind: ArgKind::Value, type_id: 20 },
            ],
        };
        let b = FunctionSignature {
            this_type: Some(2),
            return_type: 10,
            args: vec![
                SignatureArg { kind: ArgKind::ThisPtr, type_id: 2 },
                SignatureArg { kind: ArgKind::Value, type_id: 20 },
            ],
        };
        assert!(a.matches(&b));
    }

    #[test]
    fn test_explicit_args_skip_implicit() {
        let sig = FunctionSignature {
            this_type: None,
            return_type: 0,
            args: vec![
                SignatureArg { kind: ArgKind::RetPtr, type_id: 5 },
                SignatureArg { kind: ArgKind::ContextPtr, type_id: 0 },
                SignatureArg { kind: ArgKind::Value, type_id: 7 },
            ],
        };
        assert_eq!(sig.explicit_arg_count(), 1);
    }
}
