//! Test Doubles
//!
//! Counting fakes for the platform seams. Exposed publicly so downstream
//! adapters can exercise their bindings without a native runtime installed;
//! the bridge's own tests use them to verify load-once and unload-refusal
//! behavior.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::{PoolRuntime, RawPool};
use crate::platform::{PlatformLoader, PlatformModule, SymbolAddress};

#[derive(Default)]
struct FakeCounters {
    loads: AtomicUsize,
    unloads: AtomicUsize,
    resolves: AtomicUsize,
}

/// A platform loader that never touches the OS loader.
///
/// Every successful load produces a module exporting the configured symbol
/// names at distinct synthetic addresses. Load, unload (module drop), and
/// resolve counts are observable.
pub struct FakeLoader {
    symbols: Vec<String>,
    failure: Option<String>,
    counters: Arc<FakeCounters>,
}

impl FakeLoader {
    /// A loader whose modules export exactly `symbols`.
    pub fn with_symbols(symbols: &[&str]) -> Self {
        Self {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            failure: None,
            counters: Arc::new(FakeCounters::default()),
        }
    }

    /// A loader that fails every load with `reason`.
    pub fn failing(reason: &str) -> Self {
        Self {
            symbols: Vec::new(),
            failure: Some(reason.to_string()),
            counters: Arc::new(FakeCounters::default()),
        }
    }

    /// Number of successful loads performed.
    pub fn load_count(&self) -> usize {
        self.counters.loads.load(Ordering::SeqCst)
    }

    /// Number of modules dropped (unloaded).
    pub fn unload_count(&self) -> usize {
        self.counters.unloads.load(Ordering::SeqCst)
    }

    /// Number of platform-level symbol lookups (cache misses).
    pub fn resolve_count(&self) -> usize {
        self.counters.resolves.load(Ordering::SeqCst)
    }
}

impl PlatformLoader for FakeLoader {
    fn load_module(&self, _path: &Path) -> Result<Box<dyn PlatformModule>, String> {
        if let Some(reason) = &self.failure {
            return Err(reason.clone());
        }

        let load_index = self.counters.loads.fetch_add(1, Ordering::SeqCst);
        let addresses = self
            .symbols
            .iter()
            .enumerate()
            .map(|(i, name)| {
                // Distinct non-null addresses per (load, symbol).
                let addr = 0x1000_0000 + load_index * 0x1_0000 + i * 0x10;
                (name.clone(), SymbolAddress::new(addr as *const ()))
            })
            .collect();

        Ok(Box::new(FakeModule {
            addresses,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct FakeModule {
    addresses: HashMap<String, SymbolAddress>,
    counters: Arc<FakeCounters>,
}

impl PlatformModule for FakeModule {
    fn resolve(&self, name: &str) -> Option<SymbolAddress> {
        self.counters.resolves.fetch_add(1, Ordering::SeqCst);
        self.addresses.get(name).copied()
    }
}

impl Drop for FakeModule {
    fn drop(&mut self) {
        self.counters.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakePoolState {
    /// Live pool ids.
    live: Vec<usize>,
    /// Child pool id -> parent pool id, for cascade-on-destroy.
    parents: HashMap<usize, usize>,
    /// Allocations held alive per pool, freed when the pool dies.
    allocations: HashMap<usize, Vec<std::ffi::CString>>,
    next_id: usize,
    destroys: usize,
    /// Pools remaining capacity; `None` means unlimited.
    budget: Option<usize>,
}

impl FakePoolState {
    fn release(&mut self, id: usize) {
        self.live.retain(|p| *p != id);
        self.allocations.remove(&id);
        self.parents.remove(&id);

        let children: Vec<usize> = self
            .parents
            .iter()
            .filter(|(_, parent)| **parent == id)
            .map(|(child, _)| *child)
            .collect();
        for child in children {
            self.release(child);
        }
    }
}

/// An in-process stand-in for the native pool allocator.
///
/// Tracks live pools and keeps duplicated strings alive for exactly the
/// owning pool's lifetime, so use-after-destroy shows up as a test failure
/// rather than undefined behavior.
pub struct FakePoolRuntime {
    state: Mutex<FakePoolState>,
}

impl FakePoolRuntime {
    /// Unlimited-capacity runtime.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakePoolState {
                live: Vec::new(),
                parents: HashMap::new(),
                allocations: HashMap::new(),
                next_id: 1,
                destroys: 0,
                budget: None,
            }),
        }
    }

    /// Runtime that allows only `pools` creations, then reports exhaustion.
    pub fn with_budget(pools: usize) -> Self {
        let runtime = Self::new();
        runtime.state.lock().budget = Some(pools);
        runtime
    }

    /// Number of pools currently live.
    pub fn live_pools(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Number of native destroy calls observed.
    pub fn destroy_count(&self) -> usize {
        self.state.lock().destroys
    }

    /// Whether `pool` is still live.
    pub fn is_live(&self, pool: RawPool) -> bool {
        self.state.lock().live.contains(&pool.as_usize())
    }
}

impl Default for FakePoolRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolRuntime for FakePoolRuntime {
    fn create_pool(&self, parent: Option<RawPool>) -> Option<RawPool> {
        let mut state = self.state.lock();
        if let Some(budget) = &mut state.budget {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }

        if let Some(parent) = parent {
            assert!(
                state.live.contains(&parent.as_usize()),
                "child pool created under a dead parent"
            );
        }

        let id = state.next_id;
        state.next_id += 1;
        state.live.push(id);
        state.allocations.insert(id, Vec::new());
        if let Some(parent) = parent {
            state.parents.insert(id, parent.as_usize());
        }
        Some(RawPool::from_usize(id))
    }

    fn destroy_pool(&self, pool: RawPool) {
        let mut state = self.state.lock();
        state.destroys += 1;
        let id = pool.as_usize();
        assert!(
            state.live.contains(&id),
            "native destroy called on a dead pool (double free)"
        );
        state.release(id);
    }

    fn duplicate(&self, pool: RawPool, bytes: &[u8]) -> *const libc::c_char {
        let mut state = self.state.lock();
        let id = pool.as_usize();
        assert!(state.live.contains(&id), "duplicate into a dead pool");
        let owned = std::ffi::CString::new(bytes.to_vec()).expect("no interior NUL");
        let ptr = owned.as_ptr();
        state
            .allocations
            .get_mut(&id)
            .expect("pool allocation list")
            .push(owned);
        ptr
    }
}
