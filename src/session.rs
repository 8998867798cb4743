//! Bridge Sessions
//!
//! Logical-client accounting over a shared registry. Adapters open one
//! session per connected client; when the last session drops, the shared
//! native modules are released so the process holds no stale library
//! handles between connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::registry::LibraryRegistry;

/// Shared owner of a registry and the count of sessions over it.
pub struct BridgeHost {
    registry: Arc<LibraryRegistry>,
    clients: AtomicUsize,
}

impl BridgeHost {
    /// Host the given registry.
    pub fn new(registry: Arc<LibraryRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            clients: AtomicUsize::new(0),
        })
    }

    /// Open a session for one logical client.
    pub fn connect(self: &Arc<Self>) -> BridgeSession {
        self.clients.fetch_add(1, Ordering::SeqCst);
        BridgeSession {
            host: Arc::clone(self),
        }
    }

    /// Number of currently connected sessions.
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }
}

/// One logical client's access to the shared registry.
///
/// Dropping the last session triggers
/// [`LibraryRegistry::release_all`]; modules pinned by outstanding symbol
/// handles survive teardown and are logged by the registry.
pub struct BridgeSession {
    host: Arc<BridgeHost>,
}

impl BridgeSession {
    /// The shared registry this session operates through.
    pub fn registry(&self) -> &LibraryRegistry {
        &self.host.registry
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        if self.host.clients.fetch_sub(1, Ordering::SeqCst) == 1 {
            log::debug!("last bridge session disconnected, releasing native modules");
            self.host.registry.release_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::RuntimeLocation;
    use crate::platform;
    use crate::testing::FakeLoader;

    fn host_with_module() -> (Arc<BridgeHost>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let file = platform::module_filename("native-lib");
        std::fs::write(dir.path().join(file), b"").unwrap();

        let registry = Arc::new(LibraryRegistry::new(
            Arc::new(FakeLoader::with_symbols(&["do_work"])),
            RuntimeLocation::at(dir.path()),
        ));
        (BridgeHost::new(registry), dir)
    }

    #[test]
    fn sessions_are_counted() {
        let (host, _dir) = host_with_module();
        let first = host.connect();
        let second = host.connect();
        assert_eq!(host.client_count(), 2);
        drop(first);
        assert_eq!(host.client_count(), 1);
        drop(second);
        assert_eq!(host.client_count(), 0);
    }

    #[test]
    fn last_disconnect_releases_modules() {
        let (host, _dir) = host_with_module();
        let first = host.connect();
        let second = host.connect();

        first.registry().resolve("native-lib", "do_work").unwrap();
        assert_eq!(first.registry().cached_modules(), 1);

        drop(first);
        // Still one client connected, modules stay cached.
        assert_eq!(second.registry().cached_modules(), 1);

        let registry = Arc::clone(&host.registry);
        drop(second);
        assert_eq!(registry.cached_modules(), 0);
    }
}
