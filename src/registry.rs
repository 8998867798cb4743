//! Library Registry
//!
//! Thread-safe cache of [`NativeModule`] instances keyed by normalized
//! module name. The registry is an explicitly constructed value that callers
//! hold and pass; there is no process-wide singleton. One registry instance
//! is expected to live for the process (or for the lifetime of the last
//! [`BridgeSession`](crate::session::BridgeSession)).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::discovery::RuntimeLocation;
use crate::error::{BridgeError, BridgeResult};
use crate::module::NativeModule;
use crate::platform::{self, PlatformLoader};
use crate::symbol::SymbolHandle;

/// Declarative binding descriptor: which entry point in which module a
/// bindable operation lives at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Module file name, canonical or bare (normalized on lookup).
    pub module: &'static str,
    /// Exported entry-point name.
    pub entry_point: &'static str,
}

impl Binding {
    /// Describe a bindable operation.
    pub const fn new(module: &'static str, entry_point: &'static str) -> Self {
        Self {
            module,
            entry_point,
        }
    }
}

/// Process-wide cache of loaded native modules.
pub struct LibraryRegistry {
    loader: Arc<dyn PlatformLoader>,
    location: RuntimeLocation,
    /// Guards the whole check-then-load-then-insert sequence so concurrent
    /// callers can never double-load a module.
    modules: Mutex<HashMap<String, Arc<NativeModule>>>,
}

impl LibraryRegistry {
    /// Build a registry over a discovered runtime location and a platform
    /// loader.
    pub fn new(loader: Arc<dyn PlatformLoader>, location: RuntimeLocation) -> Self {
        Self {
            loader,
            location,
            modules: Mutex::new(HashMap::new()),
        }
    }

    /// Two spellings of one module must never produce two cache entries:
    /// lowercase, and append the platform suffix when absent.
    fn normalize(name: &str) -> String {
        platform::module_filename(&name.to_lowercase())
    }

    /// Get (loading if necessary) the module for `name`.
    pub fn get_module(&self, name: &str) -> BridgeResult<Arc<NativeModule>> {
        let normalized = Self::normalize(name);
        let mut modules = self.modules.lock();

        if let Some(module) = modules.get(&normalized) {
            return Ok(Arc::clone(module));
        }

        let path = self.location.module_path(&normalized);
        if !path.is_file() {
            return Err(BridgeError::ModuleNotFound { name: normalized });
        }

        let module = Arc::new(NativeModule::new(&normalized, path));
        module.load(self.loader.as_ref())?;
        modules.insert(normalized, Arc::clone(&module));
        Ok(module)
    }

    /// Resolve `(module_name, entry_point)` to a symbol handle, loading the
    /// module on first use.
    pub fn resolve(&self, module_name: &str, entry_point: &str) -> BridgeResult<SymbolHandle> {
        let module = self.get_module(module_name)?;
        module.resolve(entry_point)
    }

    /// Resolve a declarative binding descriptor.
    pub fn resolve_binding(&self, binding: &Binding) -> BridgeResult<SymbolHandle> {
        self.resolve(binding.module, binding.entry_point)
    }

    /// Unload `name` and drop it from the cache. On refusal the entry stays
    /// cached and loaded.
    pub fn release_module(&self, name: &str) -> BridgeResult<()> {
        let normalized = Self::normalize(name);
        let mut modules = self.modules.lock();

        if let Some(module) = modules.get(&normalized) {
            module.unload()?;
            modules.remove(&normalized);
        }
        Ok(())
    }

    /// Unload every cached module. Modules that refuse (outstanding symbol
    /// handles) are logged and kept; everything else is dropped from the
    /// cache. Called at last-client teardown.
    pub fn release_all(&self) {
        let mut modules = self.modules.lock();
        modules.retain(|name, module| match module.unload() {
            Ok(()) => false,
            Err(err) => {
                log::warn!("keeping module '{}' at teardown: {}", name, err);
                true
            }
        });
    }

    /// Number of cached modules. Used by teardown tests.
    pub fn cached_modules(&self) -> usize {
        self.modules.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLoader;
    use std::path::Path;

    /// Registry over a tempdir that actually contains the module files the
    /// fake loader pretends to load.
    fn registry_with(files: &[&str], symbols: &[&str]) -> (LibraryRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        for file in files {
            std::fs::write(dir.path().join(file), b"").unwrap();
        }
        let registry = LibraryRegistry::new(
            Arc::new(FakeLoader::with_symbols(symbols)),
            RuntimeLocation::at(dir.path()),
        );
        (registry, dir)
    }

    fn module_file(stem: &str) -> String {
        platform::module_filename(stem)
    }

    #[test]
    fn spellings_normalize_to_one_entry() {
        let file = module_file("native-lib");
        let (registry, _dir) = registry_with(&[&file], &["do_work"]);

        let a = registry.get_module("native-lib").unwrap();
        let b = registry.get_module(&file.to_uppercase()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.cached_modules(), 1);
    }

    #[test]
    fn missing_module_file_is_module_not_found() {
        let (registry, _dir) = registry_with(&[], &[]);
        let err = registry.get_module("native-lib").unwrap_err();
        assert!(matches!(err, BridgeError::ModuleNotFound { .. }));
        assert_eq!(registry.cached_modules(), 0);
    }

    #[test]
    fn resolve_binding_goes_through_cache() {
        let file = module_file("native-lib");
        let (registry, _dir) = registry_with(&[&file], &["do_work"]);

        const DO_WORK: Binding = Binding::new("native-lib", "do_work");
        let a = registry.resolve_binding(&DO_WORK).unwrap();
        let b = registry.resolve_binding(&DO_WORK).unwrap();
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn release_module_refuses_with_outstanding_handle() {
        let file = module_file("native-lib");
        let (registry, _dir) = registry_with(&[&file], &["do_work"]);

        let handle = registry.resolve("native-lib", "do_work").unwrap();
        assert!(registry.release_module("native-lib").is_err());
        assert_eq!(registry.cached_modules(), 1);

        drop(handle);
        registry.release_module("native-lib").unwrap();
        assert_eq!(registry.cached_modules(), 0);
    }

    #[test]
    fn release_all_keeps_refused_modules() {
        let lib_a = module_file("lib-a");
        let lib_b = module_file("lib-b");
        let (registry, _dir) = registry_with(&[&lib_a, &lib_b], &["do_work"]);

        let _held = registry.resolve("lib-a", "do_work").unwrap();
        registry.resolve("lib-b", "do_work").unwrap();

        registry.release_all();
        assert_eq!(registry.cached_modules(), 1);
        assert!(registry.get_module("lib-a").unwrap().is_loaded());
    }

    #[test]
    fn release_unknown_module_is_noop() {
        let (registry, _dir) = registry_with(&[], &[]);
        registry.release_module("never-loaded").unwrap();
    }

    #[test]
    fn concurrent_lookups_load_once() {
        let file = module_file("native-lib");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(&file), b"").unwrap();

        let loader = Arc::new(FakeLoader::with_symbols(&["do_work"]));
        let registry = Arc::new(LibraryRegistry::new(
            Arc::clone(&loader) as Arc<dyn crate::platform::PlatformLoader>,
            RuntimeLocation::at(dir.path()),
        ));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.resolve("native-lib", "do_work").unwrap();
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(loader.load_count(), 1);
    }

    #[test]
    fn module_path_is_inside_install_dir() {
        let file = module_file("native-lib");
        let (registry, dir) = registry_with(&[&file], &["do_work"]);
        let module = registry.get_module("native-lib").unwrap();
        assert_eq!(module.path().parent(), Some(dir.path() as &Path));
    }
}
