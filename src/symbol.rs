//! Symbol Handles
//!
//! Reference-counted wrappers around resolved entry points. The count is the
//! load-bearing state for [`NativeModule::unload`](crate::module::NativeModule::unload):
//! a module refuses to unload while any handle besides its own cached copy
//! is alive, because unloading would leave that handle's address dangling.

use std::sync::Arc;

use crate::platform::SymbolAddress;

#[derive(Debug)]
struct SymbolInner {
    name: String,
    address: SymbolAddress,
}

/// A resolved, reference-counted native entry point.
///
/// Cloning increments the shared atomic count, dropping decrements it. The
/// handle never frees the underlying address; that is the owning module's
/// job at unload time, which is what lets the unload check be a pure
/// observation of the count.
#[derive(Debug, Clone)]
pub struct SymbolHandle {
    inner: Arc<SymbolInner>,
}

impl SymbolHandle {
    /// Wrap a freshly resolved address. The new handle starts with count 1
    /// and takes shared ownership of nothing but the count cell; the
    /// address itself stays owned by whichever module exported it.
    pub fn from_raw(name: impl Into<String>, address: SymbolAddress) -> Self {
        Self {
            inner: Arc::new(SymbolInner {
                name: name.into(),
                address,
            }),
        }
    }

    /// Entry-point name this handle was resolved from.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The resolved address.
    pub fn address(&self) -> SymbolAddress {
        self.inner.address
    }

    /// Number of live handles sharing this resolution, including `self`.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: &str) -> SymbolHandle {
        SymbolHandle::from_raw(name, SymbolAddress::new(0xfeed_0000 as *const ()))
    }

    #[test]
    fn clone_shares_one_count_cell() {
        let a = handle("do_work");
        assert_eq!(a.reference_count(), 1);

        let b = a.clone();
        assert_eq!(a.reference_count(), 2);
        assert_eq!(b.reference_count(), 2);
        assert_eq!(a.address(), b.address());

        drop(b);
        assert_eq!(a.reference_count(), 1);
    }

    #[test]
    fn name_and_address_survive_clone() {
        let a = handle("svn_client_log4");
        let b = a.clone();
        assert_eq!(b.name(), "svn_client_log4");
        assert_eq!(b.address().as_usize(), 0xfeed_0000);
    }
}
