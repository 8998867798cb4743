//! Bridge Error Taxonomy
//!
//! Typed failures for every layer of the bridge: module loading, symbol
//! resolution, arena lifecycle, and native call status mapping.

use thiserror::Error;

/// Errors produced by the dynamic-invocation bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The module file could not be located in any probed directory.
    #[error("Module not found: {name}")]
    ModuleNotFound {
        /// Normalized module name
        name: String,
    },

    /// The platform loader failed to load the module file.
    #[error("Failed to load module '{name}': {reason}")]
    ModuleLoadFailed {
        /// Normalized module name
        name: String,
        /// Platform error text
        reason: String,
    },

    /// The entry point is not exported by the loaded module.
    #[error("Symbol '{entry_point}' not found in module '{module}'")]
    SymbolNotFound {
        /// Requested entry point
        entry_point: String,
        /// Module that was queried
        module: String,
    },

    /// Unload was refused because a resolved symbol is still referenced.
    ///
    /// This is a caller ordering defect (a handle outlived its intended
    /// scope), not a native fault; the module stays loaded and intact.
    #[error("Cannot unload module '{module}': symbol '{entry_point}' is still referenced")]
    ModuleStillReferenced {
        /// The symbol whose handle is still outstanding
        entry_point: String,
        /// Module the unload was attempted on
        module: String,
    },

    /// The native pool allocator returned a null pool.
    ///
    /// The native runtime has no recovery path for this; callers must treat
    /// it as fatal and not retry.
    #[error("Native arena allocation failed: pool runtime is out of memory")]
    ArenaExhausted,

    /// An arena was used after its own or an ancestor's destruction.
    #[error("Arena already destroyed")]
    ArenaDestroyed,

    /// More arguments than the arity dispatcher supports.
    #[error("Too many arguments for native dispatch: {0} (max {max})", max = crate::call::MAX_ARGS)]
    TooManyArgs(usize),

    /// A string argument could not be encoded for the native boundary.
    #[error("Invalid string for native call: {what}")]
    InvalidString {
        /// What was being encoded
        what: String,
    },

    /// A native call returned a non-success status.
    #[error("Native call failed (code {code}): {message}")]
    NativeCallFailed {
        /// Numeric status code from the native error object
        code: i32,
        /// Top-of-chain message
        message: String,
    },

    /// A native call failed with a permission-denied status code.
    #[error("Authorization denied by native library (code {code}): {message}")]
    AuthorizationDenied {
        /// Numeric status code from the native error object
        code: i32,
        /// Top-of-chain message
        message: String,
    },

    /// No native runtime installation could be discovered.
    #[error("Native runtime not found: {detail}. Install the runtime or point `install_dir` in dynvoke.toml at an existing installation.")]
    RuntimeNotFound {
        /// Which locations were probed
        detail: String,
    },

    /// Bridge configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
