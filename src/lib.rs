//! Dynvoke - Lazy Dynamic-Invocation Bridge
//!
//! Binds application code to native, C-linkage libraries that are loaded on
//! first use, resolved by entry-point name, and called with pool-allocated
//! arguments. The crate is the safe, reference-counted core such an adapter
//! needs; what the native operations *mean* (repository logs, item
//! listings, diffs) stays with the adapter built on top.
//!
//! # Architecture
//!
//! ```text
//! Application code
//!       │  Binding { module, entry_point }
//!       ▼
//! LibraryRegistry ── load-once module cache, normalized names
//!       │
//!       ▼
//! NativeModule ── per-module symbol cache, unload refusal
//!       │
//!       ▼
//! SymbolHandle ── refcounted resolved entry point
//!       │
//!       ▼
//! invoke(symbol, arena, args, receiver)
//!       │                    ▲
//!       ▼                    │ trampoline + baton
//! Native library ────────────┘
//! ```
//!
//! Transient allocations for a call live in a [`ScopedArena`], which
//! mirrors the native parent/child pool contract: one destroy releases the
//! whole subtree, deterministically, on every exit path.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dynvoke::{
//!     Arg, Binding, BridgeConfig, LibloadingLoader, LibraryRegistry, NativePoolRuntime,
//!     RuntimeLocation, ScopedArena,
//! };
//!
//! # fn main() -> Result<(), dynvoke::BridgeError> {
//! let config = BridgeConfig::default();
//! let location = RuntimeLocation::discover(&config.runtime)?;
//! let registry = LibraryRegistry::new(Arc::new(LibloadingLoader), location);
//!
//! const CREATE_CONTEXT: Binding = Binding::new("libsvn_client-1", "svn_client_create_context");
//! let symbol = registry.resolve_binding(&CREATE_CONTEXT)?;
//!
//! let pools = Arc::new(NativePoolRuntime::from_registry(&registry)?);
//! let arena = ScopedArena::create_root(pools)?;
//! let mut ctx: *mut () = std::ptr::null_mut();
//! dynvoke::invoke(
//!     &symbol,
//!     &arena,
//!     &[Arg::OutPtr(&mut ctx as *mut *mut () as *mut ()), Arg::Pool],
//!     None,
//! )?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod arena;
pub mod call;
pub mod config;
pub mod discovery;
pub mod error;
pub mod module;
pub mod platform;
pub mod registry;
pub mod session;
pub mod symbol;
pub mod testing;

// Re-export commonly used types
pub use arena::{NativePoolRuntime, PoolRuntime, RawPool, ScopedArena};
pub use call::{invoke, Arg, CallbackPayload, ErrorFrame, RawError, RawReceiverFn, Receiver};
pub use config::{BridgeConfig, ConfigError, RuntimeConfig};
pub use discovery::RuntimeLocation;
pub use error::{BridgeError, BridgeResult};
pub use module::NativeModule;
pub use platform::{LibloadingLoader, PlatformLoader, PlatformModule, SymbolAddress};
pub use registry::{Binding, LibraryRegistry};
pub use session::{BridgeHost, BridgeSession};
pub use symbol::SymbolHandle;
