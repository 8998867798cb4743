//! Scoped Arenas
//!
//! Hierarchical memory arenas mirroring the native pool contract: child
//! pools hang off a parent, destroying a parent frees the whole subtree in
//! one native call, and every pointer carved from a pool dies with it.
//!
//! The tree holds no owning cycles. Each [`ScopedArena`] owns its node;
//! parents track children through weak references used only to invalidate
//! them when an ancestor goes away. Destruction is idempotent and runs on
//! drop, so release is guaranteed on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use libc::c_char;
use parking_lot::Mutex;

use crate::error::{BridgeError, BridgeResult};
use crate::registry::{Binding, LibraryRegistry};
use crate::symbol::SymbolHandle;

/// Opaque handle to one native pool.
///
/// Transparent over one machine word so it can cross the C trampoline
/// boundary directly.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPool(usize);

// An opaque token; all dereferencing happens on the native side.
unsafe impl Send for RawPool {}
unsafe impl Sync for RawPool {}

impl RawPool {
    /// Wrap a raw native pool pointer.
    pub fn new(ptr: *mut ()) -> Self {
        Self(ptr as usize)
    }

    /// Wrap a pool token given as an integer.
    pub fn from_usize(value: usize) -> Self {
        Self(value)
    }

    /// The token as an integer, for lowering into native call words.
    pub fn as_usize(&self) -> usize {
        self.0
    }

    /// The token as a raw pointer.
    pub fn as_ptr(&self) -> *mut () {
        self.0 as *mut ()
    }
}

/// The native pool primitives the arena layer is built on.
///
/// The production implementation, [`NativePoolRuntime`], resolves these
/// through the module registry; tests use
/// [`FakePoolRuntime`](crate::testing::FakePoolRuntime).
pub trait PoolRuntime: Send + Sync {
    /// Create a pool, optionally as a child of `parent`. `None` signals
    /// unrecoverable allocator exhaustion.
    fn create_pool(&self, parent: Option<RawPool>) -> Option<RawPool>;

    /// Destroy a pool and, natively, its whole subtree.
    fn destroy_pool(&self, pool: RawPool);

    /// Duplicate `bytes` into pool-owned memory, NUL-terminated. The result
    /// lives exactly as long as the pool.
    fn duplicate(&self, pool: RawPool, bytes: &[u8]) -> *const c_char;
}

/// Pool primitives resolved from the native allocator library through the
/// registry: pool creation, destruction, and string duplication.
///
/// Holding the three symbol handles keeps the allocator module pinned
/// (unload is refused) for as long as any arena tree built on it can exist.
pub struct NativePoolRuntime {
    create: SymbolHandle,
    destroy: SymbolHandle,
    duplicate: SymbolHandle,
}

impl NativePoolRuntime {
    /// Allocator-library binding for pool creation.
    pub const CREATE_POOL: Binding = Binding::new("libapr-1", "apr_pool_create_ex");
    /// Allocator-library binding for pool destruction.
    pub const DESTROY_POOL: Binding = Binding::new("libapr-1", "apr_pool_destroy");
    /// Allocator-library binding for pool-owned string duplication.
    pub const DUPLICATE: Binding = Binding::new("libapr-1", "apr_pstrdup");

    /// Resolve the pool primitives, loading the allocator module on first
    /// use.
    pub fn from_registry(registry: &LibraryRegistry) -> BridgeResult<Self> {
        Ok(Self {
            create: registry.resolve_binding(&Self::CREATE_POOL)?,
            destroy: registry.resolve_binding(&Self::DESTROY_POOL)?,
            duplicate: registry.resolve_binding(&Self::DUPLICATE)?,
        })
    }
}

type CreatePoolFn = unsafe extern "C" fn(
    newpool: *mut *mut (),
    parent: *mut (),
    abort_fn: *const (),
    allocator: *mut (),
) -> libc::c_int;
type DestroyPoolFn = unsafe extern "C" fn(pool: *mut ());
type DuplicateFn = unsafe extern "C" fn(pool: *mut (), s: *const c_char) -> *mut c_char;

impl PoolRuntime for NativePoolRuntime {
    fn create_pool(&self, parent: Option<RawPool>) -> Option<RawPool> {
        // Safety: the binding targets the allocator's documented
        // create(newpool, parent, abort_fn, allocator) entry point. A null
        // abort handler keeps the allocator's install-time default.
        let create: CreatePoolFn =
            unsafe { std::mem::transmute(self.create.address().as_usize()) };
        let mut pool: *mut () = std::ptr::null_mut();
        let parent = parent.map_or(std::ptr::null_mut(), |p| p.as_ptr());
        let status =
            unsafe { create(&mut pool, parent, std::ptr::null(), std::ptr::null_mut()) };
        if status != 0 || pool.is_null() {
            return None;
        }
        Some(RawPool::new(pool))
    }

    fn destroy_pool(&self, pool: RawPool) {
        let destroy: DestroyPoolFn =
            unsafe { std::mem::transmute(self.destroy.address().as_usize()) };
        unsafe { destroy(pool.as_ptr()) };
    }

    fn duplicate(&self, pool: RawPool, bytes: &[u8]) -> *const c_char {
        // The arena layer rejects interior NULs before we get here, so a
        // temporary NUL-terminated copy is always constructible.
        let source = std::ffi::CString::new(bytes.to_vec()).expect("validated by allocate_string");
        let duplicate: DuplicateFn =
            unsafe { std::mem::transmute(self.duplicate.address().as_usize()) };
        unsafe { duplicate(pool.as_ptr(), source.as_ptr()) }
    }
}

struct ArenaNode {
    runtime: Arc<dyn PoolRuntime>,
    pool: RawPool,
    destroyed: AtomicBool,
    children: Mutex<Vec<Weak<ArenaNode>>>,
}

impl ArenaNode {
    /// Mark this node and every descendant dead. Returns whether this call
    /// performed the transition (false when already destroyed).
    fn invalidate(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.invalidate();
            }
        }
        true
    }
}

/// A node in a rooted arena tree.
///
/// Not `Clone`: each arena value uniquely owns its node, so drop order in
/// the creating scope determines release order. Arenas are not meant for
/// concurrent use; each logical operation owns its tree for its duration.
pub struct ScopedArena {
    node: Arc<ArenaNode>,
}

impl ScopedArena {
    /// Create a root arena.
    pub fn create_root(runtime: Arc<dyn PoolRuntime>) -> BridgeResult<Self> {
        let pool = runtime
            .create_pool(None)
            .ok_or(BridgeError::ArenaExhausted)?;
        Ok(Self {
            node: Arc::new(ArenaNode {
                runtime,
                pool,
                destroyed: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Create a child arena. The child's pool is freed natively when either
    /// it or any ancestor is destroyed.
    pub fn create_child(&self) -> BridgeResult<Self> {
        if self.is_destroyed() {
            return Err(BridgeError::ArenaDestroyed);
        }

        let runtime = Arc::clone(&self.node.runtime);
        let pool = runtime
            .create_pool(Some(self.node.pool))
            .ok_or(BridgeError::ArenaExhausted)?;

        let child = Arc::new(ArenaNode {
            runtime,
            pool,
            destroyed: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
        });
        self.node.children.lock().push(Arc::downgrade(&child));
        Ok(Self { node: child })
    }

    /// The underlying native pool, for passing as a call argument.
    pub fn as_raw(&self) -> RawPool {
        self.node.pool
    }

    /// Whether this arena (or an ancestor) has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.node.destroyed.load(Ordering::Acquire)
    }

    /// Duplicate `text` into pool-owned, NUL-terminated memory.
    ///
    /// The returned pointer is valid only until this arena or any ancestor
    /// is destroyed; callers must copy out anything they need to keep.
    pub fn allocate_string(&self, text: &str) -> BridgeResult<*const c_char> {
        if self.is_destroyed() {
            return Err(BridgeError::ArenaDestroyed);
        }
        if text.as_bytes().contains(&0) {
            return Err(BridgeError::InvalidString {
                what: format!("interior NUL in {:?}", text),
            });
        }
        Ok(self.node.runtime.duplicate(self.node.pool, text.as_bytes()))
    }

    /// Destroy this arena and invalidate its whole subtree. Idempotent: a
    /// second call, or a call after an ancestor's destroy, is a no-op.
    ///
    /// Only the node that performs the transition issues a native destroy;
    /// descendant pools are freed by the native cascade and must not be
    /// destroyed again.
    pub fn destroy(&self) {
        if self.node.invalidate() {
            self.node.runtime.destroy_pool(self.node.pool);
        }
    }
}

impl Drop for ScopedArena {
    fn drop(&mut self) {
        // Finalization path for abandoned arenas; harmless after an
        // explicit destroy.
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePoolRuntime;

    fn runtime() -> Arc<FakePoolRuntime> {
        Arc::new(FakePoolRuntime::new())
    }

    #[test]
    fn root_create_and_destroy() {
        let rt = runtime();
        let arena = ScopedArena::create_root(rt.clone()).unwrap();
        assert_eq!(rt.live_pools(), 1);
        arena.destroy();
        assert_eq!(rt.live_pools(), 0);
        assert!(arena.is_destroyed());
    }

    #[test]
    fn destroy_is_idempotent() {
        let rt = runtime();
        let arena = ScopedArena::create_root(rt.clone()).unwrap();
        arena.destroy();
        arena.destroy();
        assert_eq!(rt.destroy_count(), 1);
    }

    #[test]
    fn drop_destroys_abandoned_arena() {
        let rt = runtime();
        {
            let _arena = ScopedArena::create_root(rt.clone()).unwrap();
            assert_eq!(rt.live_pools(), 1);
        }
        assert_eq!(rt.live_pools(), 0);
    }

    #[test]
    fn parent_destroy_invalidates_child() {
        let rt = runtime();
        let root = ScopedArena::create_root(rt.clone()).unwrap();
        let child = root.create_child().unwrap();
        child.allocate_string("transient").unwrap();

        root.destroy();
        assert!(child.is_destroyed());
        assert_eq!(rt.live_pools(), 0);

        // Second destroy on the child must not reach the native layer.
        child.destroy();
        assert_eq!(rt.destroy_count(), 1);
    }

    #[test]
    fn grandchildren_are_invalidated_too() {
        let rt = runtime();
        let root = ScopedArena::create_root(rt.clone()).unwrap();
        let child = root.create_child().unwrap();
        let grandchild = child.create_child().unwrap();

        root.destroy();
        assert!(grandchild.is_destroyed());
        grandchild.destroy();
        child.destroy();
        assert_eq!(rt.destroy_count(), 1);
    }

    #[test]
    fn child_destroy_leaves_parent_usable() {
        let rt = runtime();
        let root = ScopedArena::create_root(rt.clone()).unwrap();
        let child = root.create_child().unwrap();

        child.destroy();
        assert!(!root.is_destroyed());
        root.allocate_string("still fine").unwrap();
        assert_eq!(rt.live_pools(), 1);
    }

    #[test]
    fn allocation_after_destroy_is_an_error() {
        let rt = runtime();
        let root = ScopedArena::create_root(rt.clone()).unwrap();
        let child = root.create_child().unwrap();
        root.destroy();

        assert!(matches!(
            child.allocate_string("late"),
            Err(BridgeError::ArenaDestroyed)
        ));
        assert!(matches!(
            child.create_child(),
            Err(BridgeError::ArenaDestroyed)
        ));
    }

    #[test]
    fn exhausted_runtime_reports_fatal_error() {
        let rt = Arc::new(FakePoolRuntime::with_budget(1));
        let root = ScopedArena::create_root(rt.clone()).unwrap();
        assert!(matches!(
            root.create_child(),
            Err(BridgeError::ArenaExhausted)
        ));
    }

    #[test]
    fn interior_nul_is_rejected() {
        let rt = runtime();
        let root = ScopedArena::create_root(rt).unwrap();
        assert!(matches!(
            root.allocate_string("bad\0string"),
            Err(BridgeError::InvalidString { .. })
        ));
    }
}
