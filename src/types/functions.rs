//! Function records.

use super::data_type::{Access, FunctionId, FunctionSignature};
use crate::source::SourceSpan;
use bitflags::bitflags;

bitflags! {
    /// Function attribute bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FunctionFlags: u16 {
        const METHOD      = 1 << 0;
        const TEMPLATE    = 1 << 1;
        const THISCALL    = 1 << 2;
        const INLINE      = 1 << 3;
        const HOST        = 1 << 4;
        const CONSTRUCTOR = 1 << 5;
        const DESTRUCTOR  = 1 << 6;
        const GETTER      = 1 << 7;
        const SETTER      = 1 << 8;
        const OPERATOR    = 1 << 9;
    }
}

/// Where the callable code for a function lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FunctionAddress {
    /// Not linked yet (script function before backend generation)
    #[default]
    Unlinked,
    /// Offset into the VM instruction buffer
    Bytecode(u32),
    /// Entry point of natively generated code
    Native(usize),
    /// Index of a backend-provided intrinsic generator
    Intrinsic(u32),
}

/// A registered function or method.
#[derive(Debug, Clone)]
pub struct Function {
    /// Registry index, stable for the process lifetime
    pub id: FunctionId,
    /// Bare name (`add`, `operator+`, `constructor`)
    pub name: String,
    /// Human-readable name for diagnostics
    pub display_name: String,
    /// `module::Type::name` style qualified name
    pub fully_qualified_name: String,
    /// The function type
    pub signature: FunctionSignature,
    /// Visibility
    pub access: Access,
    /// Attribute bits
    pub flags: FunctionFlags,
    /// Declaration site, none for host functions
    pub source: Option<SourceSpan>,
    /// Module that owns the function
    pub owner_module: u32,
    /// Executable address once generated/bound
    pub address: FunctionAddress,
    /// Host-side wrapper index for bound functions (see `bind`)
    pub wrapper: Option<u32>,
}

impl Function {
    /// Creates a script function record; the registry assigns the id.
    pub fn script(
        name: impl Into<String>,
        fqn: impl Into<String>,
        signature: FunctionSignature,
        owner_module: u32,
        source: SourceSpan,
    ) -> Self {
        let name = name.into();
        Function {
            id: 0,
            display_name: name.clone(),
            name,
            fully_qualified_name: fqn.into(),
            signature,
            access: Access::Public,
            flags: FunctionFlags::empty(),
            source: Some(source),
            owner_module,
            address: FunctionAddress::Unlinked,
            wrapper: None,
        }
    }

    /// True for methods (including constructors and accessors).
    pub fn is_method(&self) -> bool {
        self.flags.contains(FunctionFlags::METHOD)
    }

    /// "Same overload" rule: name and signature match.
    pub fn same_overload(&self, other: &Function) -> bool {
        self.name == other.name
            && self.fully_qualified_name == other.fully_qualified_name
            && self.signature.matches(&other.signature)
    }
}
