//! The versioned binary format for cached compiled modules.
//!
//! Layout (all little-endian):
//!
//! ```text
//! magic         : 4 bytes "TSNC"
//! version       : u32
//! source_mtime  : i64
//! source_hash   : u64
//! module_id     : u32
//! module_name   : lp_string
//! module_path   : lp_string
//! dep_count     : u32
//! deps[]        : { module_id: u32, source_mtime: i64 }
//! type_count    : u32
//! types[]       : type records
//! func_count    : u32
//! funcs[]       : function records (signature + IR, no spans)
//! source_map    : { line, col, length } per instruction, per function
//! checksum      : u64 over everything above
//! ```
//!
//! Readers verify magic, version, staleness, and checksum; any mismatch
//! makes the caller recompile from source. Writers stage to a temp file
//! and rename into place so concurrent readers never observe a partial
//! file. Template types are not cached (they carry ASTs); their
//! specializations are ordinary types and cache normally. `call` targets
//! are stored by qualified name and signature hash, and resolved by the
//! loader after every type and function has been registered.

use super::{EnumDef, Global, Module, ModuleSymbol};
use crate::compiler::ir::{FunctionDef, Instruction, Opcode, Operand, OperandKind, ValueFlags};
use crate::error::{Error, Result};
use crate::source::{hash64, SourceSpan};
use crate::types::{
    Access, ArgKind, DataType, Function, FunctionAddress, FunctionFlags, FunctionSignature,
    Property, PropertyFlags, SignatureArg, TypeBase, TypeMeta, TypeShape,
};
use std::path::Path;

/// File magic
pub const CACHE_MAGIC: [u8; 4] = *b"TSNC";
/// Current format version
pub const CACHE_VERSION: u32 = 2;

/// A call-target fixup the loader resolves after registration.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFixup {
    /// Instruction index within the function body
    pub instr: u32,
    /// Operand slot
    pub operand: u8,
    /// Fully qualified name of the callee
    pub fqn: String,
    /// Signature hash disambiguating overloads
    pub sig_hash: u64,
}

/// One cached function: its registry record, IR body, and fixups.
#[derive(Debug, Clone)]
pub struct CachedFunction {
    /// Function record (id unassigned until re-registration)
    pub function: Function,
    /// IR body with spans restored from the source map
    pub def: FunctionDef,
    /// Call targets to resolve after loading
    pub fixups: Vec<CallFixup>,
}

/// Everything a cache file holds.
#[derive(Debug, Clone)]
pub struct CachedModule {
    /// Module metadata
    pub module: Module,
    /// Types owned by the module, templates excluded
    pub types: Vec<DataType>,
    /// Functions owned by the module
    pub funcs: Vec<CachedFunction>,
}

/// Hash used to pick the right overload when resolving fixups.
pub fn signature_hash(sig: &FunctionSignature) -> u64 {
    let mut bytes = Vec::with_capacity(8 + sig.args.len() * 9);
    bytes.extend_from_slice(&sig.return_type.to_le_bytes());
    for arg in &sig.args {
        bytes.push(arg.kind as u8);
        bytes.extend_from_slice(&arg.type_id.to_le_bytes());
    }
    hash64(&bytes)
}

// ---------------------------------------------------------------------
// Byte-level framing
// ---------------------------------------------------------------------

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Cache {
                reason: "truncated file".into(),
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }
    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }
    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }
    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }
    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Cache {
            reason: "non-utf8 string".into(),
        })
    }
}

// ---------------------------------------------------------------------
// Record encoding
// ---------------------------------------------------------------------

fn access_tag(a: Access) -> u8 {
    match a {
        Access::Public => 0,
        Access::Private => 1,
    }
}

fn access_from(tag: u8) -> Access {
    if tag == 1 {
        Access::Private
    } else {
        Access::Public
    }
}

fn arg_kind_tag(k: ArgKind) -> u8 {
    match k {
        ArgKind::Value => 0,
        ArgKind::Pointer => 1,
        ArgKind::ThisPtr => 2,
        ArgKind::RetPtr => 3,
        ArgKind::ContextPtr => 4,
        ArgKind::CapturePtr => 5,
        ArgKind::ModuleTypeId => 6,
    }
}

fn arg_kind_from(tag: u8) -> Result<ArgKind> {
    Ok(match tag {
        0 => ArgKind::Value,
        1 => ArgKind::Pointer,
        2 => ArgKind::ThisPtr,
        3 => ArgKind::RetPtr,
        4 => ArgKind::ContextPtr,
        5 => ArgKind::CapturePtr,
        6 => ArgKind::ModuleTypeId,
        _ => {
            return Err(Error::Cache {
                reason: "bad argument kind".into(),
            })
        }
    })
}

fn write_signature(w: &mut Writer, sig: &FunctionSignature) {
    match sig.this_type {
        Some(t) => {
            w.u8(1);
            w.u64(t);
        }
        None => w.u8(0),
    }
    w.u64(sig.return_type);
    w.u32(sig.args.len() as u32);
    for arg in &sig.args {
        w.u8(arg_kind_tag(arg.kind));
        w.u64(arg.type_id);
    }
}

fn read_signature(r: &mut Reader) -> Result<FunctionSignature> {
    let this_type = if r.u8()? == 1 { Some(r.u64()?) } else { None };
    let return_type = r.u64()?;
    let count = r.u32()? as usize;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = arg_kind_from(r.u8()?)?;
        let type_id = r.u64()?;
        args.push(SignatureArg { kind, type_id });
    }
    Ok(FunctionSignature {
        this_type,
        return_type,
        args,
    })
}

fn write_type(w: &mut Writer, ty: &DataType) {
    w.u64(ty.id);
    w.string(&ty.name);
    w.string(&ty.fully_qualified_name);
    let (tag, payload_alias, payload_sig): (u8, Option<u64>, Option<&FunctionSignature>) =
        match &ty.shape {
            TypeShape::Primitive => (0, None, None),
            TypeShape::Object => (1, None, None),
            TypeShape::Function(sig) => (2, None, Some(sig)),
            TypeShape::Alias { target } => (3, Some(*target), None),
            TypeShape::Class => (4, None, None),
            TypeShape::Error => (5, None, None),
            TypeShape::Template(_) => unreachable!("templates are filtered before writing"),
        };
    w.u8(tag);
    if let Some(target) = payload_alias {
        w.u64(target);
    }
    if let Some(sig) = payload_sig {
        write_signature(w, sig);
    }
    w.u32(ty.size);
    w.u32(ty.align);
    w.u32(ty.meta.bits());
    match ty.host_hash {
        Some(h) => {
            w.u8(1);
            w.u64(h);
        }
        None => w.u8(0),
    }
    w.u32(ty.properties.len() as u32);
    for p in &ty.properties {
        w.string(&p.name);
        w.u8(access_tag(p.access));
        w.u32(p.offset);
        w.u64(p.type_id);
        w.u8(p.flags.bits());
        w.i32(p.getter.map(|g| g as i32).unwrap_or(-1));
        w.i32(p.setter.map(|s| s as i32).unwrap_or(-1));
    }
    w.u32(ty.methods.len() as u32);
    for m in &ty.methods {
        w.u32(*m);
    }
    w.i32(ty.destructor.map(|d| d as i32).unwrap_or(-1));
    w.u32(ty.bases.len() as u32);
    for b in &ty.bases {
        w.u64(b.type_id);
        w.u32(b.offset);
        w.u8(access_tag(b.access));
    }
    w.u32(ty.owner_module);
    w.u8(access_tag(ty.access));
}

fn read_type(r: &mut Reader) -> Result<DataType> {
    let id = r.u64()?;
    let name = r.string()?;
    let fqn = r.string()?;
    let tag = r.u8()?;
    let shape = match tag {
        0 => TypeShape::Primitive,
        1 => TypeShape::Object,
        2 => TypeShape::Function(read_signature(r)?),
        3 => TypeShape::Alias { target: r.u64()? },
        4 => TypeShape::Class,
        5 => TypeShape::Error,
        _ => {
            return Err(Error::Cache {
                reason: "bad type shape".into(),
            })
        }
    };
    let size = r.u32()?;
    let align = r.u32()?;
    let meta = TypeMeta::from_bits_truncate(r.u32()?);
    let host_hash = if r.u8()? == 1 { Some(r.u64()?) } else { None };
    let prop_count = r.u32()? as usize;
    let mut properties = Vec::with_capacity(prop_count);
    for _ in 0..prop_count {
        let name = r.string()?;
        let access = access_from(r.u8()?);
        let offset = r.u32()?;
        let type_id = r.u64()?;
        let flags = PropertyFlags::from_bits_truncate(r.u8()?);
        let getter = r.i32()?;
        let setter = r.i32()?;
        properties.push(Property {
            name,
            access,
            offset,
            type_id,
            flags,
            getter: (getter >= 0).then_some(getter as u32),
            setter: (setter >= 0).then_some(setter as u32),
        });
    }
    let method_count = r.u32()? as usize;
    let mut methods = Vec::with_capacity(method_count);
    for _ in 0..method_count {
        methods.push(r.u32()?);
    }
    let destructor = r.i32()?;
    let base_count = r.u32()? as usize;
    let mut bases = Vec::with_capacity(base_count);
    for _ in 0..base_count {
        bases.push(TypeBase {
            type_id: r.u64()?,
            offset: r.u32()?,
            access: access_from(r.u8()?),
        });
    }
    let owner_module = r.u32()?;
    let access = access_from(r.u8()?);
    Ok(DataType {
        id,
        name,
        fully_qualified_name: fqn,
        shape,
        size,
        align,
        meta,
        host_hash,
        properties,
        methods,
        destructor: (destructor >= 0).then_some(destructor as u32),
        bases,
        owner_module,
        access,
    })
}

fn write_operand(w: &mut Writer, op: &Operand) {
    let (tag, a, b): (u8, u64, u64) = match op.kind {
        OperandKind::None => (0, 0, 0),
        OperandKind::Register(r) => (1, r as u64, 0),
        OperandKind::Immediate(bits) => (2, bits, 0),
        OperandKind::StackSlot(s) => (3, s as u64, 0),
        OperandKind::Argument(i) => (4, i as u64, 0),
        OperandKind::ModuleData { module, slot } => (5, module as u64, slot as u64),
        OperandKind::TypeRef(t) => (6, t, 0),
        OperandKind::FunctionRef(_) => (7, 0, 0), // patched via fixups
        OperandKind::ModuleRef(m) => (8, m as u64, 0),
        OperandKind::Label(l) => (9, l as u64, 0),
    };
    w.u8(tag);
    w.u64(a);
    w.u64(b);
    w.u64(op.type_id);
    w.u8(op.flags.bits());
}

fn read_operand(r: &mut Reader) -> Result<Operand> {
    let tag = r.u8()?;
    let a = r.u64()?;
    let b = r.u64()?;
    let type_id = r.u64()?;
    let flags = ValueFlags::from_bits_truncate(r.u8()?);
    let kind = match tag {
        0 => OperandKind::None,
        1 => OperandKind::Register(a as u32),
        2 => OperandKind::Immediate(a),
        3 => OperandKind::StackSlot(a as u32),
        4 => OperandKind::Argument(a as u32),
        5 => OperandKind::ModuleData {
            module: a as u32,
            slot: b as u32,
        },
        6 => OperandKind::TypeRef(a),
        7 => OperandKind::FunctionRef(u32::MAX),
        8 => OperandKind::ModuleRef(a as u32),
        9 => OperandKind::Label(a as u32),
        _ => {
            return Err(Error::Cache {
                reason: "bad operand kind".into(),
            })
        }
    };
    Ok(Operand {
        kind,
        type_id,
        flags,
        location: None,
    })
}

fn write_function(
    w: &mut Writer,
    f: &Function,
    def: &FunctionDef,
    all_funcs: &dyn Fn(u32) -> Option<(String, u64)>,
) {
    w.string(&f.name);
    w.string(&f.display_name);
    w.string(&f.fully_qualified_name);
    w.u8(access_tag(f.access));
    w.u16(f.flags.bits());
    w.u32(f.owner_module);
    write_signature(w, &f.signature);

    w.u32(def.stack.len() as u32);
    for alloc in &def.stack {
        w.u32(alloc.id);
        w.u32(alloc.size);
    }

    // collect call-target fixups while writing the body
    let mut fixups: Vec<CallFixup> = Vec::new();
    for (idx, instr) in def.code.iter().enumerate() {
        for (o, operand) in instr.operands.iter().enumerate() {
            if let OperandKind::FunctionRef(target) = operand.kind {
                if let Some((fqn, sig_hash)) = all_funcs(target) {
                    fixups.push(CallFixup {
                        instr: idx as u32,
                        operand: o as u8,
                        fqn,
                        sig_hash,
                    });
                }
            }
        }
    }

    w.u32(def.code.len() as u32);
    for instr in &def.code {
        w.u8(instr.op.index());
        for operand in &instr.operands {
            write_operand(w, operand);
        }
    }

    w.u32(fixups.len() as u32);
    for fx in &fixups {
        w.u32(fx.instr);
        w.u8(fx.operand);
        w.string(&fx.fqn);
        w.u64(fx.sig_hash);
    }
}

fn read_function(r: &mut Reader) -> Result<CachedFunction> {
    let name = r.string()?;
    let display_name = r.string()?;
    let fqn = r.string()?;
    let access = access_from(r.u8()?);
    let flags = FunctionFlags::from_bits_truncate(r.u16()?);
    let owner_module = r.u32()?;
    let signature = read_signature(r)?;

    let mut def = FunctionDef::new(name.clone());
    let stack_count = r.u32()? as usize;
    for _ in 0..stack_count {
        let _id = r.u32()?;
        let size = r.u32()?;
        def.alloc_stack(size);
    }

    let code_count = r.u32()? as usize;
    for _ in 0..code_count {
        let op = Opcode::from_index(r.u8()?).ok_or_else(|| Error::Cache {
            reason: "bad opcode".into(),
        })?;
        let mut instr = Instruction::new(op, SourceSpan::default());
        for o in 0..3 {
            instr.operands[o] = read_operand(r)?;
        }
        def.emit(instr);
    }

    let fixup_count = r.u32()? as usize;
    let mut fixups = Vec::with_capacity(fixup_count);
    for _ in 0..fixup_count {
        fixups.push(CallFixup {
            instr: r.u32()?,
            operand: r.u8()?,
            fqn: r.string()?,
            sig_hash: r.u64()?,
        });
    }

    let mut function = Function::script(name, fqn, signature, owner_module, SourceSpan::default());
    function.display_name = display_name;
    function.access = access;
    function.flags = flags;
    function.address = FunctionAddress::Unlinked;
    function.source = None;

    Ok(CachedFunction {
        function,
        def,
        fixups,
    })
}

// ---------------------------------------------------------------------
// Whole-file read/write
// ---------------------------------------------------------------------

fn write_module_meta(w: &mut Writer, m: &Module) {
    w.u32(m.strings.len() as u32);
    for s in &m.strings {
        w.string(s);
    }
    w.u32(m.globals.len() as u32);
    for g in &m.globals {
        w.string(&g.name);
        w.u32(g.offset);
        w.u64(g.type_id);
    }
    w.u32(m.data_size);
    w.i32(m.init_function.map(|f| f as i32).unwrap_or(-1));
    w.u32(m.enums.len() as u32);
    for e in &m.enums {
        w.string(&e.name);
        w.u32(e.values.len() as u32);
        for (name, value) in &e.values {
            w.string(name);
            w.i64(*value);
        }
    }
    w.u32(m.exports.len() as u32);
    let mut names: Vec<&String> = m.exports.keys().collect();
    names.sort();
    for name in names {
        w.string(name);
        match &m.exports[name] {
            ModuleSymbol::Type(t) => {
                w.u8(0);
                w.u64(*t);
            }
            ModuleSymbol::Functions(ids) => {
                w.u8(1);
                w.u32(ids.len() as u32);
                for id in ids {
                    w.u32(*id);
                }
            }
            ModuleSymbol::Global(i) => {
                w.u8(2);
                w.u64(*i as u64);
            }
            ModuleSymbol::Enum(i) => {
                w.u8(3);
                w.u64(*i as u64);
            }
        }
    }
}

fn read_module_meta(r: &mut Reader, m: &mut Module) -> Result<()> {
    let string_count = r.u32()? as usize;
    for _ in 0..string_count {
        m.strings.push(r.string()?);
    }
    let global_count = r.u32()? as usize;
    for _ in 0..global_count {
        let name = r.string()?;
        let offset = r.u32()?;
        let type_id = r.u64()?;
        m.globals.push(Global {
            name,
            offset,
            type_id,
            span: SourceSpan::default(),
        });
    }
    m.data_size = r.u32()?;
    let init = r.i32()?;
    m.init_function = (init >= 0).then_some(init as u32);
    let enum_count = r.u32()? as usize;
    for _ in 0..enum_count {
        let name = r.string()?;
        let value_count = r.u32()? as usize;
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            let vname = r.string()?;
            let value = r.i64()?;
            values.push((vname, value));
        }
        m.enums.push(EnumDef { name, values });
    }
    let export_count = r.u32()? as usize;
    for _ in 0..export_count {
        let name = r.string()?;
        let tag = r.u8()?;
        let symbol = match tag {
            0 => ModuleSymbol::Type(r.u64()?),
            1 => {
                let n = r.u32()? as usize;
                let mut ids = Vec::with_capacity(n);
                for _ in 0..n {
                    ids.push(r.u32()?);
                }
                ModuleSymbol::Functions(ids)
            }
            2 => ModuleSymbol::Global(r.u64()? as u32),
            3 => ModuleSymbol::Enum(r.u64()? as u32),
            _ => {
                return Err(Error::Cache {
                    reason: "bad export tag".into(),
                })
            }
        };
        m.exports.insert(name, symbol);
    }
    Ok(())
}

/// Serializes a compiled module and atomically renames it into place.
///
/// Function ids are process-local registry indices, so every function
/// reference in the file (type methods, accessors, exports, the
/// initializer) is rewritten to an index into the file's own function
/// table; the loader maps them back after re-registration.
pub fn write_cached_module(path: &Path, cached: &CachedModule) -> Result<()> {
    let file_index: std::collections::HashMap<u32, u32> = cached
        .funcs
        .iter()
        .enumerate()
        .map(|(i, f)| (f.function.id, i as u32))
        .collect();
    let remap = |id: Option<u32>| -> Option<u32> {
        id.and_then(|i| file_index.get(&i).copied())
    };

    let mut w = Writer::default();
    w.buf.extend_from_slice(&CACHE_MAGIC);
    w.u32(CACHE_VERSION);
    w.i64(cached.module.source_mtime);
    w.u64(cached.module.source_hash);
    w.u32(cached.module.id);
    w.string(&cached.module.name);
    w.string(&cached.module.path);

    w.u32(cached.module.dependencies.len() as u32);
    for dep in &cached.module.dependencies {
        w.u32(*dep);
        w.i64(0); // dependency mtimes are validated through their own caches
    }

    let types: Vec<DataType> = cached
        .types
        .iter()
        .filter(|t| !matches!(t.shape, TypeShape::Template(_)))
        .cloned()
        .map(|mut t| {
            t.methods = t
                .methods
                .iter()
                .filter_map(|m| file_index.get(m).copied())
                .collect();
            t.destructor = remap(t.destructor);
            for p in t.properties.iter_mut() {
                p.getter = remap(p.getter);
                p.setter = remap(p.setter);
            }
            t
        })
        .collect();
    w.u32(types.len() as u32);
    for ty in &types {
        write_type(&mut w, ty);
    }

    let lookup = |id: u32| -> Option<(String, u64)> {
        cached
            .funcs
            .iter()
            .find(|f| f.function.id == id)
            .map(|f| {
                (
                    f.function.fully_qualified_name.clone(),
                    signature_hash(&f.function.signature),
                )
            })
    };
    w.u32(cached.funcs.len() as u32);
    for f in &cached.funcs {
        write_function(&mut w, &f.function, &f.def, &lookup);
    }

    let mut module_for_write = cached.module.clone();
    module_for_write.init_function = remap(module_for_write.init_function);
    module_for_write.functions = cached
        .module
        .functions
        .iter()
        .filter_map(|f| file_index.get(f).copied())
        .collect();
    for symbol in module_for_write.exports.values_mut() {
        if let ModuleSymbol::Functions(ids) = symbol {
            *ids = ids
                .iter()
                .filter_map(|f| file_index.get(f).copied())
                .collect();
        }
    }
    write_module_meta(&mut w, &module_for_write);

    // source map: (line, col, length) per instruction
    for f in &cached.funcs {
        for instr in &f.def.code {
            w.u32(instr.span.line);
            w.u32(instr.span.col);
            w.u32(instr.span.len);
        }
    }

    let checksum = hash64(&w.buf);
    w.u64(checksum);

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &w.buf).map_err(|e| Error::io(tmp.to_string_lossy(), e))?;
    std::fs::rename(&tmp, path).map_err(|e| Error::io(path.to_string_lossy(), e))?;
    tracing::debug!(path = %path.display(), bytes = w.buf.len(), "wrote module cache");
    Ok(())
}

/// Reads and validates a cache file. `current_mtime`/`current_hash`
/// describe the present source file; a cache older than the source, or
/// one with a different hash, is rejected so the caller recompiles.
pub fn read_cached_module(
    path: &Path,
    current_mtime: i64,
    current_hash: u64,
) -> Result<CachedModule> {
    let data = std::fs::read(path).map_err(|e| Error::io(path.to_string_lossy(), e))?;
    if data.len() < 8 {
        return Err(Error::Cache {
            reason: "file too small".into(),
        });
    }
    let (body, tail) = data.split_at(data.len() - 8);
    let stored_checksum = u64::from_le_bytes(tail.try_into().unwrap());
    if hash64(body) != stored_checksum {
        return Err(Error::Cache {
            reason: "checksum mismatch".into(),
        });
    }

    let mut r = Reader::new(body);
    if r.bytes(4)? != CACHE_MAGIC {
        return Err(Error::Cache {
            reason: "bad magic".into(),
        });
    }
    if r.u32()? != CACHE_VERSION {
        return Err(Error::Cache {
            reason: "version mismatch".into(),
        });
    }
    let source_mtime = r.i64()?;
    let source_hash = r.u64()?;
    if source_mtime < current_mtime {
        return Err(Error::Cache {
            reason: "source newer than cache".into(),
        });
    }
    if source_hash != current_hash {
        return Err(Error::Cache {
            reason: "source content changed".into(),
        });
    }

    let mut module = Module {
        id: r.u32()?,
        name: r.string()?,
        path: r.string()?,
        source_mtime,
        source_hash,
        ..Module::default()
    };

    let dep_count = r.u32()? as usize;
    for _ in 0..dep_count {
        module.dependencies.push(r.u32()?);
        let _dep_mtime = r.i64()?;
    }

    let type_count = r.u32()? as usize;
    let mut types = Vec::with_capacity(type_count);
    for _ in 0..type_count {
        let ty = read_type(&mut r)?;
        module.types.push(ty.id);
        types.push(ty);
    }

    let func_count = r.u32()? as usize;
    let mut funcs = Vec::with_capacity(func_count);
    for _ in 0..func_count {
        funcs.push(read_function(&mut r)?);
    }

    read_module_meta(&mut r, &mut module)?;

    // restore the per-instruction source map
    for f in funcs.iter_mut() {
        for instr in f.def.code.iter_mut() {
            let line = r.u32()?;
            let col = r.u32()?;
            let len = r.u32()?;
            instr.span = SourceSpan::new(0, len, line, col);
        }
    }

    Ok(CachedModule {
        module,
        types,
        funcs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::Opcode;

    fn sample() -> CachedModule {
        let mut def = FunctionDef::new("main");
        let r0 = def.alloc_register();
        let mut i = Instruction::new(Opcode::Assign, SourceSpan::new(0, 3, 2, 5));
        i.operands[0] = Operand::reg(r0, 42);
        i.operands[1] = Operand::imm(7, 42);
        def.emit(i);
        let mut ret = Instruction::new(Opcode::Ret, SourceSpan::new(4, 1, 3, 1));
        ret.operands[0] = Operand::reg(r0, 42);
        def.emit(ret);

        let function = Function::script(
            "main",
            "main::main",
            FunctionSignature::new(42, &[]),
            9,
            SourceSpan::default(),
        );

        let module = Module {
            id: 9,
            name: "main".into(),
            path: "/tmp/main.gs".into(),
            source_mtime: 1000,
            source_hash: 0xfeed,
            functions: vec![0],
            ..Module::default()
        };

        CachedModule {
            module,
            types: Vec::new(),
            funcs: vec![CachedFunction {
                function,
                def,
                fixups: Vec::new(),
            }],
        }
    }

    #[test]
    fn test_roundtrip() {
        let dir = std::env::temp_dir().join("gscache-test-roundtrip");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("9.gsc");
        let cached = sample();
        write_cached_module(&path, &cached).unwrap();
        let back = read_cached_module(&path, 1000, 0xfeed).unwrap();
        assert_eq!(back.module.id, 9);
        assert_eq!(back.module.name, "main");
        assert_eq!(back.funcs.len(), 1);
        assert_eq!(back.funcs[0].def.code.len(), 2);
        assert_eq!(back.funcs[0].def.code[0].op, Opcode::Assign);
        // the source map came back
        assert_eq!(back.funcs[0].def.code[0].span.line, 2);
        assert_eq!(back.funcs[0].def.code[0].span.col, 5);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_stale_source_rejected() {
        let dir = std::env::temp_dir().join("gscache-test-stale");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("9.gsc");
        write_cached_module(&path, &sample()).unwrap();
        // source modified after the cache was written
        assert!(matches!(
            read_cached_module(&path, 2000, 0xfeed),
            Err(Error::Cache { .. })
        ));
        // source content hash changed
        assert!(matches!(
            read_cached_module(&path, 1000, 0xbeef),
            Err(Error::Cache { .. })
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = std::env::temp_dir().join("gscache-test-corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("9.gsc");
        write_cached_module(&path, &sample()).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read_cached_module(&path, 1000, 0xfeed),
            Err(Error::Cache { .. })
        ));
        std::fs::remove_file(&path).ok();
    }
}
