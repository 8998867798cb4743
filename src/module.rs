//! Native Modules
//!
//! One loaded native library plus its symbol cache. Loading is lazy and
//! guarded; resolution caches one canonical [`SymbolHandle`] per entry point
//! and hands out clones; unloading is refused while any clone is still
//! outstanding.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::{BridgeError, BridgeResult};
use crate::platform::{PlatformLoader, PlatformModule};
use crate::symbol::SymbolHandle;

/// Baseline count held by the module's own cache entry. Anything above this
/// means a caller still holds a clone.
const CACHE_BASELINE: usize = 1;

struct ModuleState {
    /// Non-`None` iff the module is loaded.
    platform: Option<Box<dyn PlatformModule>>,
    /// One canonical handle per resolved entry point.
    symbols: HashMap<String, SymbolHandle>,
}

/// A lazily loaded native library.
pub struct NativeModule {
    name: String,
    path: PathBuf,
    /// Serializes load/resolve/unload for this module without blocking
    /// unrelated modules.
    state: Mutex<ModuleState>,
}

impl std::fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeModule")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl NativeModule {
    /// Describe a module at `path`. Nothing is loaded until [`load`](Self::load).
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            state: Mutex::new(ModuleState {
                platform: None,
                symbols: HashMap::new(),
            }),
        }
    }

    /// Normalized module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path the module is (or will be) loaded from.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Whether the platform handle is currently held.
    pub fn is_loaded(&self) -> bool {
        self.state.lock().platform.is_some()
    }

    /// Load the module. No-op when already loaded.
    pub fn load(&self, loader: &dyn PlatformLoader) -> BridgeResult<()> {
        let mut state = self.state.lock();
        if state.platform.is_some() {
            return Ok(());
        }

        let platform =
            loader
                .load_module(&self.path)
                .map_err(|reason| BridgeError::ModuleLoadFailed {
                    name: self.name.clone(),
                    reason,
                })?;

        log::debug!("loaded module '{}' from {}", self.name, self.path.display());
        state.platform = Some(platform);
        Ok(())
    }

    /// Resolve an entry point, caching the canonical handle on first use.
    ///
    /// The returned handle is a clone of the cached one, so its count is at
    /// least 2 while both are alive.
    pub fn resolve(&self, entry_point: &str) -> BridgeResult<SymbolHandle> {
        let mut state = self.state.lock();

        if let Some(handle) = state.symbols.get(entry_point) {
            return Ok(handle.clone());
        }

        let platform = state
            .platform
            .as_ref()
            .ok_or_else(|| BridgeError::ModuleNotFound {
                name: self.name.clone(),
            })?;

        let address =
            platform
                .resolve(entry_point)
                .ok_or_else(|| BridgeError::SymbolNotFound {
                    entry_point: entry_point.to_string(),
                    module: self.name.clone(),
                })?;

        let handle = SymbolHandle::from_raw(entry_point, address);
        state.symbols.insert(entry_point.to_string(), handle.clone());
        log::trace!("resolved '{}' in module '{}'", entry_point, self.name);
        Ok(handle)
    }

    /// Unload the module, refusing if any resolved symbol is still held
    /// outside the cache.
    ///
    /// On refusal the module stays loaded and the cache intact; forcing the
    /// unload would leave the outstanding function pointers dangling. On
    /// success the cache is cleared and the platform handle dropped.
    pub fn unload(&self) -> BridgeResult<()> {
        let mut state = self.state.lock();
        if state.platform.is_none() {
            return Ok(());
        }

        for (entry_point, handle) in &state.symbols {
            if handle.reference_count() > CACHE_BASELINE {
                return Err(BridgeError::ModuleStillReferenced {
                    entry_point: entry_point.clone(),
                    module: self.name.clone(),
                });
            }
        }

        state.symbols.clear();
        state.platform = None;
        log::debug!("unloaded module '{}'", self.name);
        Ok(())
    }

    /// Number of entry points currently cached. Used by unload tests.
    pub fn cached_symbols(&self) -> usize {
        self.state.lock().symbols.len()
    }
}
