//! The public compile entry point (§4.G), grounded on the teacher's top-level
//! `compile`/`compile_and_interpret` wrappers: mark the environment, hand the bytes
//! to the compiler, and roll back on any failure.

use crate::{compiler, config::CompileOptions, environment::Environment, error::CompileError, module::Module};

/// Compiles one Wasm binary against `env`, atomically: on success every new
/// signature/function/table/memory/global and istream byte committed by this call
/// is kept; on failure `env` is left exactly as it was found (§4.A "mark/reset").
///
/// The caller is responsible for registering the returned [`Module`]'s exports
/// into `env` (via [`Environment::register_module`]) under whatever name the
/// embedder wants this module addressable as — `compile` itself never registers
/// anything, so a module that's merely compiled for inspection never shows up as an
/// importable dependency of a later compile.
pub fn compile(env: &mut Environment, wasm: &[u8], options: &CompileOptions) -> Result<Module, CompileError> {
    log::trace!("compiling module ({} bytes)", wasm.len());
    let mark = env.mark();
    match compiler::compile_module(env, wasm, options) {
        Ok(module) => {
            log::debug!(
                "compile succeeded: {} functions, {} exports",
                module.func_count(),
                module.exports.len()
            );
            Ok(module)
        }
        Err(err) => {
            log::warn!("compile failed, rolling back: {err}");
            env.reset(mark);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ExternVal;

    fn wat_to_bytes(src: &str) -> alloc::vec::Vec<u8> {
        wat::parse_str(src).expect("test fixture must parse as valid wat")
    }

    #[test]
    fn compiles_a_minimal_exported_function() {
        let mut env = Environment::new();
        let wasm = wat_to_bytes(
            r#"(module
                (func (export "answer") (result i32)
                    i32.const 42))"#,
        );
        let module = compile(&mut env, &wasm, &CompileOptions::default()).expect("compile should succeed");
        assert!(matches!(module.exports.get("answer"), Some(ExternVal::Func(_))));
    }

    #[test]
    fn failed_compile_leaves_environment_untouched() {
        let mut env = Environment::new();
        let before = env.mark();
        let wasm = wat_to_bytes(
            r#"(module
                (func (result i32)
                    f32.const 1.0))"#,
        );
        let result = compile(&mut env, &wasm, &CompileOptions::default());
        assert!(result.is_err());
        let after = env.mark();
        assert_eq!(
            alloc::format!("{before:?}"),
            alloc::format!("{after:?}")
        );
    }

    #[test]
    fn rejects_type_mismatch_in_a_nested_block() {
        let mut env = Environment::new();
        let wasm = wat_to_bytes(
            r#"(module
                (func (result i32)
                    (block (result i32)
                        f64.const 1.0)))"#,
        );
        let err = compile(&mut env, &wasm, &CompileOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::TypeMismatch { .. }));
    }
}
