#![cfg_attr(not(feature = "std"), no_std)]
#![allow(dead_code)]

extern crate alloc;

pub mod compiler;
pub mod config;
pub mod environment;
pub mod error;
pub mod gas;
pub mod host;
pub mod istream;
pub mod label;
pub mod limits;
pub mod module;
pub mod opcode;
pub mod public;
pub mod typecheck;
pub mod value_type;

pub use config::{CompileOptions, WasmFeatures};
pub use environment::Environment;
pub use error::CompileError;
pub use module::Module;
pub use public::compile;
