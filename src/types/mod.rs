//! The semantic type layer: data types, functions, registries.

mod data_type;
mod functions;
mod registry;

pub use data_type::{
    type_id_from_name, Access, ArgKind, DataType, FunctionId, FunctionSignature, Property,
    PropertyFlags, SignatureArg, TemplateAst, TypeBase, TypeId, TypeMeta, TypeShape,
};
pub use functions::{Function, FunctionAddress, FunctionFlags};
pub use registry::{FunctionRegistry, MatchFlags, TypeRegistry};
