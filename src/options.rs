//! Flat analysis options; each toggle independently enables one analysis or
//! verification stage.

/// Configuration surface for one reduction run.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AnalyzeOptions {
    /// Master switch for populating reduction points at all.
    pub(crate) reduce: bool,
    /// Model the class hierarchy; disabling forces conservative fallbacks
    /// (native calls, no widening).
    pub(crate) hierarchy: bool,
    /// Register call-stubbing reduction points.
    pub(crate) method_removal: bool,
    /// Also consider constructor/class-initializer call sites.
    pub(crate) init_method_removal: bool,
    /// Run the dependency analysis on methods with try/catch regions; when
    /// off such methods degrade to stubbing without instruction deletion.
    pub(crate) method_with_try_catch: bool,
    /// Register parameter-subtyping reduction points.
    pub(crate) param_subtyping: bool,
    /// Register supertype-widening reduction points.
    pub(crate) parent_collapsing: bool,
    /// Structurally re-validate every encoded class; failures count as an
    /// invalid probe, not a crash.
    pub(crate) check_output: bool,
    /// Register a stub point for every call site instead of only
    /// resolver-approved ones. Strictly less precise; sound only because
    /// every candidate closure is re-verified by the oracle.
    pub(crate) replace_all: bool,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            reduce: true,
            hierarchy: true,
            method_removal: true,
            init_method_removal: false,
            method_with_try_catch: true,
            param_subtyping: false,
            parent_collapsing: false,
            check_output: true,
            replace_all: false,
        }
    }
}
