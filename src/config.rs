//! Compile-time configuration (§6 "Feature flags"), grounded on the teacher's
//! `compiler/config.rs` `CompilerConfig` builder.

/// Optional Wasm proposals this compiler understands. Anything beyond the MVP is
/// off by default and rejected with `CompileError::FeatureDisabled` when the binary
/// uses it without the matching flag turned on.
#[derive(Debug, Clone, Copy)]
pub struct WasmFeatures {
    pub mutable_globals: bool,
    pub sign_extension: bool,
    pub bulk_memory: bool,
    pub reference_types: bool,
    pub simd: bool,
    pub threads: bool,
    pub exceptions: bool,
}

impl Default for WasmFeatures {
    fn default() -> Self {
        Self {
            mutable_globals: true,
            sign_extension: true,
            bulk_memory: false,
            reference_types: false,
            simd: false,
            threads: false,
            exceptions: false,
        }
    }
}

/// Top-level knobs passed into `compile()` (§4.G).
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub features: WasmFeatures,
    /// Run the gas instrumentation pass (§4.F) and emit `AddGas` opcodes.
    pub enable_gas_metering: bool,
    /// Allow an entrypoint whose signature doesn't match what the embedder expects,
    /// deferring the mismatch to a runtime check instead of a compile error.
    pub allow_malformed_entrypoint_func_type: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            features: WasmFeatures::default(),
            enable_gas_metering: true,
            allow_malformed_entrypoint_func_type: false,
        }
    }
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_features(mut self, features: WasmFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_gas_metering(mut self, enable: bool) -> Self {
        self.enable_gas_metering = enable;
        self
    }

    pub fn with_allow_malformed_entrypoint_func_type(mut self, allow: bool) -> Self {
        self.allow_malformed_entrypoint_func_type = allow;
        self
    }
}
