//! The Environment (§4.A): process-wide compiled state shared across module compiles.

use crate::value_type::{FuncSig, ValType};
use alloc::{string::String, vec::Vec};
use hashbrown::HashMap;

/// Short string-keyed lookups (export names, module names) use FNV instead of
/// hashbrown's default hasher — cheaper for the small keys this compiler deals in.
pub type FnvHashMap<K, V> = HashMap<K, V, core::hash::BuildHasherDefault<fnv::FnvHasher>>;

pub type SigIdx = u32;
pub type FuncIdx = u32;
pub type GlobalIdx = u32;
pub type TableIdx = u32;
pub type MemIdx = u32;

pub const N_BYTES_PER_MEMORY_PAGE: u32 = 65536;

/// A single constant value as stored in a [`Global`] or produced by an init expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    V128(u128),
}

impl Value {
    pub fn val_type(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
            Value::V128(_) => ValType::V128,
        }
    }
}

/// An opaque identifier for an externally supplied callable, resolved by the host
/// embedding this compiler. The compiler never calls through it; it only records it.
pub type HostFuncHandle = u32;

#[derive(Debug, Clone)]
pub enum FuncEntry {
    /// A function defined by Wasm bytecode and compiled to the istream.
    Defined {
        sig: SigIdx,
        /// Byte offset of the function's first emitted instruction, or
        /// [`crate::istream::INVALID_OFFSET`] until its body has been emitted.
        offset: u32,
        /// Parameter types followed by declared local types, in slot order.
        locals: Vec<ValType>,
    },
    /// A function implemented by the host, reachable only through `InterpCallHost`.
    Host { sig: SigIdx, handle: HostFuncHandle },
}

impl FuncEntry {
    pub fn sig(&self) -> SigIdx {
        match self {
            FuncEntry::Defined { sig, .. } => *sig,
            FuncEntry::Host { sig, .. } => *sig,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Table {
    pub initial: u32,
    pub maximum: Option<u32>,
    /// Function indices into the environment; `None` marks an uninitialized slot.
    pub elements: Vec<Option<FuncIdx>>,
}

impl Table {
    pub fn size(&self) -> u32 {
        self.elements.len() as u32
    }
}

#[derive(Debug, Clone)]
pub struct Memory {
    pub initial: u32,
    pub maximum: Option<u32>,
    pub data: Vec<u8>,
}

impl Memory {
    pub fn new(initial: u32, maximum: Option<u32>) -> Self {
        Self {
            initial,
            maximum,
            data: alloc::vec![0u8; initial as usize * N_BYTES_PER_MEMORY_PAGE as usize],
        }
    }

    pub fn size_pages(&self) -> u32 {
        (self.data.len() / N_BYTES_PER_MEMORY_PAGE as usize) as u32
    }
}

#[derive(Debug, Clone)]
pub struct Global {
    pub val_type: ValType,
    pub mutable: bool,
    pub value: Value,
}

/// Export kind + environment-wide index, as recorded in a registered module's export map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternVal {
    Func(FuncIdx),
    Table(TableIdx),
    Memory(MemIdx),
    Global(GlobalIdx),
}

/// A finished, registered module: just enough to resolve imports against it (§4.E
/// "Import resolution"). This is *not* the in-progress module under compilation
/// (see [`crate::module::Module`]) — it is the durable record an embedder registers
/// after a successful `compile()` so later modules can import from it.
#[derive(Debug, Clone, Default)]
pub struct RegisteredModule {
    pub exports: FnvHashMap<String, ExternVal>,
}

/// Snapshot of every appendable environment vector's length, used to roll back a
/// failed compile (§4.A "mark/reset").
#[derive(Debug, Clone, Copy)]
pub struct Mark {
    signatures: usize,
    functions: usize,
    tables: usize,
    memories: usize,
    globals: usize,
    istream: usize,
}

#[derive(Debug, Default)]
pub struct Environment {
    pub signatures: Vec<FuncSig>,
    pub functions: Vec<FuncEntry>,
    pub tables: Vec<Table>,
    pub memories: Vec<Memory>,
    pub globals: Vec<Global>,
    pub registered_modules: FnvHashMap<String, RegisteredModule>,
    /// The shared istream buffer. Temporarily taken by a [`crate::public::compile`] call.
    pub istream: Vec<u8>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_signature(&mut self, sig: FuncSig) -> SigIdx {
        let idx = self.signatures.len() as u32;
        self.signatures.push(sig);
        idx
    }

    pub fn push_function(&mut self, func: FuncEntry) -> FuncIdx {
        let idx = self.functions.len() as u32;
        self.functions.push(func);
        idx
    }

    pub fn push_table(&mut self, table: Table) -> TableIdx {
        let idx = self.tables.len() as u32;
        self.tables.push(table);
        idx
    }

    pub fn push_memory(&mut self, memory: Memory) -> MemIdx {
        let idx = self.memories.len() as u32;
        self.memories.push(memory);
        idx
    }

    pub fn push_global(&mut self, global: Global) -> GlobalIdx {
        let idx = self.globals.len() as u32;
        self.globals.push(global);
        idx
    }

    pub fn register_module(&mut self, name: String, module: RegisteredModule) {
        self.registered_modules.insert(name, module);
    }

    pub fn lookup_module(&self, name: &str) -> Option<&RegisteredModule> {
        self.registered_modules.get(name)
    }

    /// Takes ownership of the shared istream buffer for the duration of one compile.
    pub fn take_istream(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.istream)
    }

    /// Returns the istream buffer after a compile, successful or not.
    pub fn give_back_istream(&mut self, istream: Vec<u8>) {
        self.istream = istream;
    }

    pub fn mark(&self) -> Mark {
        Mark {
            signatures: self.signatures.len(),
            functions: self.functions.len(),
            tables: self.tables.len(),
            memories: self.memories.len(),
            globals: self.globals.len(),
            istream: self.istream.len(),
        }
    }

    /// Truncates every owned vector back to its length at `mark`, undoing every side
    /// effect of an aborted compile. Registered-module additions are never partial
    /// (a module is registered only after `compile()` returns `Ok`), so they are not
    /// part of the mark/reset snapshot.
    pub fn reset(&mut self, mark: Mark) {
        self.signatures.truncate(mark.signatures);
        self.functions.truncate(mark.functions);
        self.tables.truncate(mark.tables);
        self.memories.truncate(mark.memories);
        self.globals.truncate(mark.globals);
        self.istream.truncate(mark.istream);
    }
}
