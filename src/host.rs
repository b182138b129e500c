//! External collaborator seams (§6): thin traits the embedding host implements.
//! The compiler only records calls through these; it never resolves them itself.

use alloc::string::String;

/// Resolves a host function import to a callable handle the runtime will dispatch
/// through `InterpCallHost`. The compiler treats the returned handle as opaque.
pub trait HostResolver {
    fn resolve_host_func(
        &self,
        module: &str,
        field: &str,
        sig: &crate::value_type::FuncSig,
    ) -> Option<crate::environment::HostFuncHandle>;
}

/// A resolver that recognizes no host imports — the default when an embedder only
/// links Wasm-defined modules against each other.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHostFuncs;

impl HostResolver for NoHostFuncs {
    fn resolve_host_func(
        &self,
        _module: &str,
        _field: &str,
        _sig: &crate::value_type::FuncSig,
    ) -> Option<crate::environment::HostFuncHandle> {
        None
    }
}

/// Chain/block context a gas-metered contract call may want surfaced; not consulted
/// by the compiler itself, but threaded through so a single `host` module names
/// every seam an embedder needs (§6).
pub trait ChainContext {
    fn block_number(&self) -> u64;
    fn caller(&self) -> String;
}
