//! Platform Loader
//!
//! The single seam between the bridge and the operating system's dynamic
//! loader. Everything above this module talks in terms of [`PlatformLoader`]
//! and [`PlatformModule`]; the production implementation wraps libloading,
//! and tests substitute counting fakes.

use std::ffi::CString;
use std::path::Path;

/// The address of one exported entry point inside a loaded module.
///
/// Plain data; the pointed-to code is owned by the module and stays valid
/// only while the module remains loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolAddress(*const ());

// The address is an immutable code pointer; sharing it across threads is
// safe, calling through it is governed by the module's load state.
unsafe impl Send for SymbolAddress {}
unsafe impl Sync for SymbolAddress {}

impl SymbolAddress {
    /// Wrap a raw entry-point address.
    pub fn new(ptr: *const ()) -> Self {
        Self(ptr)
    }

    /// Get the raw address.
    pub fn as_ptr(&self) -> *const () {
        self.0
    }

    /// Get the address as an integer, for arity-dispatch transmutes.
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// One loaded native module, as seen by the platform loader.
///
/// Dropping the box unloads the module; there is no separate unload call.
pub trait PlatformModule: Send + Sync {
    /// Resolve an exported entry point by name. Returns `None` when the
    /// module does not export it.
    fn resolve(&self, name: &str) -> Option<SymbolAddress>;
}

/// The native loader primitive.
pub trait PlatformLoader: Send + Sync {
    /// Load the module file at `path`. The error string carries the
    /// platform loader's own diagnostic text.
    fn load_module(&self, path: &Path) -> Result<Box<dyn PlatformModule>, String>;
}

/// Production loader backed by libloading.
pub struct LibloadingLoader;

impl PlatformLoader for LibloadingLoader {
    #[cfg(windows)]
    fn load_module(&self, path: &Path) -> Result<Box<dyn PlatformModule>, String> {
        use libloading::os::windows::{Library, LOAD_WITH_ALTERED_SEARCH_PATH};

        // Altered search path puts the module's own directory first, so its
        // native dependencies resolve relative to it.
        let library = unsafe {
            Library::load_with_flags(path, LOAD_WITH_ALTERED_SEARCH_PATH)
                .map_err(|e| e.to_string())?
        };
        Ok(Box::new(LoadedLibrary {
            library: library.into(),
        }))
    }

    #[cfg(not(windows))]
    fn load_module(&self, path: &Path) -> Result<Box<dyn PlatformModule>, String> {
        // Safety: loading a dynamic library runs its initializers. We trust
        // the discovery layer to only hand us paths inside a probed native
        // runtime installation.
        let library = unsafe { libloading::Library::new(path).map_err(|e| e.to_string())? };
        Ok(Box::new(LoadedLibrary { library }))
    }
}

struct LoadedLibrary {
    library: libloading::Library,
}

impl PlatformModule for LoadedLibrary {
    fn resolve(&self, name: &str) -> Option<SymbolAddress> {
        let c_name = CString::new(name).ok()?;

        // Safety: we only read the symbol's address; the caller is
        // responsible for transmuting it to the correct signature.
        let symbol: libloading::Symbol<'_, *const ()> =
            unsafe { self.library.get(c_name.as_bytes_with_nul()).ok()? };

        Some(SymbolAddress::new(*symbol))
    }
}

/// Construct the platform-specific module filename for a bare name.
///
/// Names that already carry the platform suffix pass through unchanged.
pub fn module_filename(name: &str) -> String {
    #[cfg(target_os = "windows")]
    {
        if name.ends_with(".dll") {
            name.to_string()
        } else {
            format!("{}.dll", name)
        }
    }

    #[cfg(target_os = "macos")]
    {
        if name.ends_with(".dylib") {
            name.to_string()
        } else if name.starts_with("lib") {
            format!("{}.dylib", name)
        } else {
            format!("lib{}.dylib", name)
        }
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        if name.ends_with(".so") || name.contains(".so.") {
            name.to_string()
        } else if name.starts_with("lib") {
            format!("{}.so", name)
        } else {
            format!("lib{}.so", name)
        }
    }
}

/// The platform's module suffix.
pub fn module_suffix() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        ".dll"
    }
    #[cfg(target_os = "macos")]
    {
        ".dylib"
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        ".so"
    }
}
