//! The compiler's value abstraction.
//!
//! A [`Value`] pairs an IR operand with its semantic type and the
//! attributes expression lowering needs: writability, const-ness, and the
//! accessor routing for properties that have getters/setters. Operator
//! lowering itself lives in `codegen`; this module only carries the data.

use super::ir::{Operand, OperandKind};
use crate::source::SourceSpan;
use crate::types::{FunctionId, TypeId};
use bitflags::bitflags;

bitflags! {
    /// Value attribute bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ValueAttrs: u8 {
        /// Declared const; writes are rejected
        const CONST  = 1 << 0;
        /// Names a storage location that can be assigned
        const LVALUE = 1 << 1;
        /// The operand holds a pointer to the value
        const INDIRECT = 1 << 2;
    }
}

/// Routing for a property reached through accessor functions.
#[derive(Debug, Clone, Copy)]
pub struct AccessorPath {
    /// Object the property belongs to
    pub base: Operand,
    /// The object's type
    pub base_type: TypeId,
    /// Getter to call for reads
    pub getter: Option<FunctionId>,
    /// Setter to call for writes
    pub setter: Option<FunctionId>,
    /// Property type
    pub property_type: TypeId,
}

/// What non-data symbols a value can stand for. Using a type, function
/// set, or module where a value is expected is diagnosed by the caller.
#[derive(Debug, Clone)]
pub enum ValueBody {
    /// An ordinary data value held in `operand`
    Data(Operand),
    /// A type name
    Type(TypeId),
    /// An overload set
    Functions(Vec<FunctionId>),
    /// A module name
    Module(u32),
    /// A property routed through accessors
    Accessor(AccessorPath),
}

/// One evaluated expression result.
#[derive(Debug, Clone)]
pub struct Value {
    /// Payload
    pub body: ValueBody,
    /// Semantic type (`<error>` while recovering)
    pub type_id: TypeId,
    /// Attributes
    pub attrs: ValueAttrs,
    /// Name for diagnostics, when the value came from a declaration
    pub name: Option<String>,
    /// Source range the value was computed from
    pub span: SourceSpan,
}

impl Value {
    /// A plain rvalue.
    pub fn rvalue(operand: Operand, type_id: TypeId, span: SourceSpan) -> Self {
        Value {
            body: ValueBody::Data(operand),
            type_id,
            attrs: ValueAttrs::empty(),
            name: None,
            span,
        }
    }

    /// A named, assignable storage location.
    pub fn lvalue(operand: Operand, type_id: TypeId, name: impl Into<String>, span: SourceSpan) -> Self {
        Value {
            body: ValueBody::Data(operand),
            type_id,
            attrs: ValueAttrs::LVALUE,
            name: Some(name.into()),
            span,
        }
    }

    /// The sentinel produced while recovering from an error.
    pub fn error(error_type: TypeId, span: SourceSpan) -> Self {
        Value {
            body: ValueBody::Data(Operand::none()),
            type_id: error_type,
            attrs: ValueAttrs::empty(),
            name: None,
            span,
        }
    }

    /// Marks the value const and returns it.
    pub fn as_const(mut self) -> Self {
        self.attrs |= ValueAttrs::CONST;
        self
    }

    /// The data operand, if this is a data value.
    pub fn operand(&self) -> Option<Operand> {
        match &self.body {
            ValueBody::Data(op) => Some(*op),
            ValueBody::Accessor(_) => None,
            _ => None,
        }
    }

    /// True when assignment to this value is allowed.
    pub fn is_writable(&self) -> bool {
        if self.attrs.contains(ValueAttrs::CONST) {
            return false;
        }
        match &self.body {
            ValueBody::Data(_) => self.attrs.contains(ValueAttrs::LVALUE),
            ValueBody::Accessor(path) => path.setter.is_some(),
            _ => false,
        }
    }

    /// True when the value can be read.
    pub fn is_readable(&self) -> bool {
        match &self.body {
            ValueBody::Data(op) => op.kind != OperandKind::None,
            ValueBody::Accessor(path) => path.getter.is_some(),
            _ => false,
        }
    }

    /// True for non-data symbols (types, modules, overload sets).
    pub fn is_symbolic(&self) -> bool {
        matches!(
            self.body,
            ValueBody::Type(_) | ValueBody::Functions(_) | ValueBody::Module(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_blocks_writes() {
        let v = Value::lvalue(Operand::reg(0, 1), 1, "x", SourceSpan::default());
        assert!(v.is_writable());
        let c = v.as_const();
        assert!(!c.is_writable());
    }

    #[test]
    fn test_accessor_writability_follows_setter() {
        let path = AccessorPath {
            base: Operand::reg(0, 1),
            base_type: 1,
            getter: Some(3),
            setter: None,
            property_type: 2,
        };
        let v = Value {
            body: ValueBody::Accessor(path),
            type_id: 2,
            attrs: ValueAttrs::empty(),
            name: None,
            span: SourceSpan::default(),
        };
        assert!(v.is_readable());
        assert!(!v.is_writable());
    }
}
