//! The builtin library: runtime intrinsics, the `math` module, and the
//! componentwise vector types.
//!
//! The vector family is one generic Rust implementation monomorphized
//! for the required element types and wired in through the binding ABI,
//! instead of a hand-written copy per type.

use crate::bind::{
    bind_function, bind_module, declare_intrinsic, export_function, CallContext, TypeBuilder,
};
use crate::compiler::Context;
use crate::error::Result;
use crate::source::hash64;
use crate::types::{ArgKind, TypeMeta};

/// Installs the intrinsics and builtin types into a fresh context.
pub fn install(ctx: &Context) -> Result<()> {
    install_intrinsics(ctx)?;
    install_math(ctx)?;
    install_vectors(ctx)?;
    Ok(())
}

/// The runtime boundary of §6.4: declared in the global module so user
/// code can name them; the backends supply the implementations.
fn install_intrinsics(ctx: &Context) -> Result<()> {
    let p = &ctx.prims;
    declare_intrinsic(ctx, "alloc", p.u64_, &[(ArgKind::Value, p.u64_)])?;
    declare_intrinsic(ctx, "free", p.void, &[(ArgKind::Value, p.u64_)])?;
    declare_intrinsic(
        ctx,
        "memcopy",
        p.void,
        &[
            (ArgKind::Value, p.u64_),
            (ArgKind::Value, p.u64_),
            (ArgKind::Value, p.u64_),
        ],
    )?;
    declare_intrinsic(ctx, "print", p.void, &[(ArgKind::Pointer, p.string)])?;
    declare_intrinsic(ctx, "__raise", p.void, &[(ArgKind::Value, p.i64_)])?;
    Ok(())
}

fn f64_arg(ctx: &CallContext, i: usize) -> f64 {
    f64::from_bits(ctx.args.get(i).copied().unwrap_or(0))
}

fn math_sqrt(ctx: &mut CallContext) {
    ctx.return_bits = f64_arg(ctx, 0).sqrt().to_bits();
}

fn math_abs(ctx: &mut CallContext) {
    ctx.return_bits = f64_arg(ctx, 0).abs().to_bits();
}

fn math_floor(ctx: &mut CallContext) {
    ctx.return_bits = f64_arg(ctx, 0).floor().to_bits();
}

fn math_ceil(ctx: &mut CallContext) {
    ctx.return_bits = f64_arg(ctx, 0).ceil().to_bits();
}

fn math_min(ctx: &mut CallContext) {
    ctx.return_bits = f64_arg(ctx, 0).min(f64_arg(ctx, 1)).to_bits();
}

fn math_max(ctx: &mut CallContext) {
    ctx.return_bits = f64_arg(ctx, 0).max(f64_arg(ctx, 1)).to_bits();
}

fn math_pow(ctx: &mut CallContext) {
    ctx.return_bits = f64_arg(ctx, 0).powf(f64_arg(ctx, 1)).to_bits();
}

fn install_math(ctx: &Context) -> Result<()> {
    let p = ctx.prims;
    let module = bind_module(ctx, "math")?;
    let one = [(ArgKind::Value, p.f64_)];
    let two = [(ArgKind::Value, p.f64_), (ArgKind::Value, p.f64_)];
    for (name, params, wrapper) in [
        ("sqrt", &one[..], math_sqrt as fn(&mut CallContext)),
        ("abs", &one[..], math_abs),
        ("floor", &one[..], math_floor),
        ("ceil", &one[..], math_ceil),
        ("min", &two[..], math_min),
        ("max", &two[..], math_max),
        ("pow", &two[..], math_pow),
    ] {
        let id = bind_function(ctx, name, p.f64_, params, wrapper)?;
        export_function(ctx, module, name, id)?;
    }
    Ok(())
}

/// Element type of a vector binding.
trait VecElem: Copy {
    const SIZE: u32;
    fn from_bits(bits: u64) -> Self;
    fn to_bits(self) -> u64;
    fn add(self, other: Self) -> Self;
    fn mul(self, other: Self) -> Self;
    fn to_f64(self) -> f64;
}

impl VecElem for f32 {
    const SIZE: u32 = 4;
    fn from_bits(bits: u64) -> Self {
        f32::from_bits(bits as u32)
    }
    fn to_bits(self) -> u64 {
        self.to_bits() as u64
    }
    fn add(self, other: Self) -> Self {
        self + other
    }
    fn mul(self, other: Self) -> Self {
        self * other
    }
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl VecElem for f64 {
    const SIZE: u32 = 8;
    fn from_bits(bits: u64) -> Self {
        f64::from_bits(bits)
    }
    fn to_bits(self) -> u64 {
        self.to_bits()
    }
    fn add(self, other: Self) -> Self {
        self + other
    }
    fn mul(self, other: Self) -> Self {
        self * other
    }
    fn to_f64(self) -> f64 {
        self
    }
}

unsafe fn read_vec<T: VecElem, const N: usize>(ptr: *const u8) -> [T; N] {
    let mut out = [T::from_bits(0); N];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = std::ptr::read_unaligned(ptr.cast::<T>().add(i));
    }
    out
}

unsafe fn write_vec<T: VecElem, const N: usize>(ptr: *mut u8, v: [T; N]) {
    for (i, e) in v.into_iter().enumerate() {
        std::ptr::write_unaligned(ptr.cast::<T>().add(i), e);
    }
}

fn vec_construct<T: VecElem, const N: usize>(ctx: &mut CallContext) {
    let mut v = [T::from_bits(0); N];
    for (i, slot) in v.iter_mut().enumerate() {
        *slot = T::from_bits(ctx.args.get(i).copied().unwrap_or(0));
    }
    unsafe { write_vec::<T, N>(ctx.this_ptr, v) };
}

fn vec_add<T: VecElem, const N: usize>(ctx: &mut CallContext) {
    let a = unsafe { read_vec::<T, N>(ctx.this_ptr) };
    let other = ctx.args.first().copied().unwrap_or(0) as usize as *const u8;
    let b = unsafe { read_vec::<T, N>(other) };
    let mut out = [T::from_bits(0); N];
    for i in 0..N {
        out[i] = a[i].add(b[i]);
    }
    unsafe { write_vec::<T, N>(ctx.return_ptr, out) };
}

fn vec_dot<T: VecElem, const N: usize>(ctx: &mut CallContext) {
    let a = unsafe { read_vec::<T, N>(ctx.this_ptr) };
    let other = ctx.args.first().copied().unwrap_or(0) as usize as *const u8;
    let b = unsafe { read_vec::<T, N>(other) };
    let mut acc = 0.0f64;
    for i in 0..N {
        acc += a[i].mul(b[i]).to_f64();
    }
    ctx.return_bits = acc.to_bits();
}

fn vec_length<T: VecElem, const N: usize>(ctx: &mut CallContext) {
    let a = unsafe { read_vec::<T, N>(ctx.this_ptr) };
    let mut acc = 0.0f64;
    for e in a {
        acc += e.mul(e).to_f64();
    }
    ctx.return_bits = acc.sqrt().to_bits();
}

fn register_vector<T: VecElem, const N: usize>(
    ctx: &Context,
    name: &str,
    elem_type: crate::types::TypeId,
) -> Result<()> {
    const FIELDS: [&str; 4] = ["x", "y", "z", "w"];
    let p = ctx.prims;
    let size = T::SIZE * N as u32;
    let mut builder = TypeBuilder::new(ctx, name, hash64(name.as_bytes()), size, T::SIZE).meta(
        TypeMeta::POD
            | TypeMeta::TRIVIALLY_CONSTRUCTIBLE
            | TypeMeta::TRIVIALLY_COPYABLE
            | TypeMeta::TRIVIALLY_DESTRUCTIBLE,
    );
    for (i, field) in FIELDS.iter().take(N).enumerate() {
        builder = builder.property(field, i as u32 * T::SIZE, elem_type);
    }
    let elem_params: Vec<(ArgKind, crate::types::TypeId)> =
        (0..N).map(|_| (ArgKind::Value, elem_type)).collect();
    let self_id = crate::types::type_id_from_name(name);
    builder = builder
        .constructor(&elem_params, vec_construct::<T, N>)
        .method(
            "operator+",
            self_id,
            &[(ArgKind::Pointer, self_id)],
            vec_add::<T, N>,
        )
        .method("dot", p.f64_, &[(ArgKind::Pointer, self_id)], vec_dot::<T, N>)
        .method("length", p.f64_, &[], vec_length::<T, N>);
    builder.build()?;
    Ok(())
}

fn install_vectors(ctx: &Context) -> Result<()> {
    let p = ctx.prims;
    register_vector::<f32, 2>(ctx, "vec2f", p.f32_)?;
    register_vector::<f64, 2>(ctx, "vec2d", p.f64_)?;
    register_vector::<f32, 3>(ctx, "vec3f", p.f32_)?;
    register_vector::<f64, 3>(ctx, "vec3d", p.f64_)?;
    register_vector::<f32, 4>(ctx, "vec4f", p.f32_)?;
    register_vector::<f64, 4>(ctx, "vec4d", p.f64_)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_registers_everything() {
        let ctx = Context::new();
        install(&ctx).unwrap();
        let types = ctx.types.read();
        for name in ["vec2f", "vec2d", "vec3f", "vec3d", "vec4f", "vec4d"] {
            assert!(types.get_by_name(name).is_some(), "{} missing", name);
        }
        assert_eq!(types.get_by_name("vec3f").unwrap().size, 12);
        assert_eq!(types.get_by_name("vec3d").unwrap().size, 24);
        let funcs = ctx.funcs.read();
        for name in ["alloc", "free", "memcopy", "print", "__raise"] {
            assert!(!funcs.get_by_fqn(name).is_empty(), "{} missing", name);
        }
        assert!(!funcs.get_by_fqn("sqrt").is_empty());
    }

    #[test]
    fn test_vector_properties_laid_out() {
        let ctx = Context::new();
        install(&ctx).unwrap();
        let types = ctx.types.read();
        let v3 = types.get_by_name("vec3d").unwrap();
        let names: Vec<&str> = v3.properties.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["x", "y", "z"]);
        assert_eq!(v3.properties[2].offset, 16);
    }

    #[test]
    fn test_math_module_exports() {
        let ctx = Context::new();
        install(&ctx).unwrap();
        let modules = ctx.modules.read();
        let math = modules.get_by_path("<host math>").unwrap();
        assert!(math.export("sqrt").is_some());
        assert!(math.export("pow").is_some());
    }

    #[test]
    fn test_math_wrapper_computes() {
        let mut cc = CallContext {
            return_bits: 0,
            return_ptr: std::ptr::null_mut(),
            function_id: 0,
            this_ptr: std::ptr::null_mut(),
            exec_ctx: std::ptr::null_mut(),
            args: vec![9.0f64.to_bits()],
        };
        math_sqrt(&mut cc);
        assert_eq!(f64::from_bits(cc.return_bits), 3.0);
    }
}
