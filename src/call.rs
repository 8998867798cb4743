//! Native Calls and Callback Bridging
//!
//! Invokes a resolved symbol with arena-owned arguments, optionally wiring
//! an application callback through a C trampoline that the native side may
//! invoke any number of times before the call returns.
//!
//! Calling convention: every bound entry point takes machine-word arguments
//! and returns a pool-allocated error object pointer (null on success), the
//! way the Subversion client libraries do. Arguments lower to `u64` words
//! and the call is dispatched by arity, since the exact signature is only
//! known at the binding site.
//!
//! Application failures raised inside a callback never unwind across the
//! native frame. The trampoline captures them into the baton's side channel,
//! hands the native caller a bridge-owned stop-iteration sentinel, and
//! [`invoke`] surfaces the captured failure verbatim once control returns.

use std::ffi::CStr;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use libc::{c_char, c_long, c_void};

use crate::arena::{RawPool, ScopedArena};
use crate::error::{BridgeError, BridgeResult};
use crate::symbol::SymbolHandle;

/// Bridge-reserved status code carried by the stop-iteration sentinel.
/// Never produced by the native layer.
const STOP_ITERATION_CODE: i32 = 999_999;

/// Native status codes that mean "permission denied" rather than a general
/// fault: not-authorized, DAV forbidden, and the authz-unreadable pair.
const AUTHORIZATION_DENIED_CODES: &[i32] = &[170_001, 175_013, 220_001, 220_002];

/// Most arguments any bound entry point takes (`svn_client_log4` has 13).
pub const MAX_ARGS: usize = 13;

/// Native error object, as returned by bound entry points.
///
/// Field-for-field mirror of `svn_error_t`: a numeric status, an optional
/// message, a nested cause, the owning pool, and file/line diagnostics. The
/// object and its whole chain live in a native pool and are reclaimed with
/// it; the bridge only reads them.
#[repr(C)]
pub struct RawError {
    /// Numeric status code.
    pub code: i32,
    /// Optional NUL-terminated message.
    pub message: *const c_char,
    /// Optional nested cause.
    pub child: *mut RawError,
    /// Pool the error object was allocated from.
    pub pool: RawPool,
    /// Source file that raised the error, when compiled with diagnostics.
    pub file: *const c_char,
    /// Source line that raised the error.
    pub line: c_long,
}

/// One decoded frame of a native error chain.
#[derive(Debug, Clone)]
pub struct ErrorFrame {
    /// Numeric status code.
    pub code: i32,
    /// Message text, empty when the native side supplied none.
    pub message: String,
    /// `file:line` location when diagnostics were compiled in.
    pub location: Option<String>,
}

/// Data handed to the application callback on each native invocation.
///
/// `data` points at native-owned memory whose lifetime is bounded by the
/// call's arena; copy out anything needed past the invocation.
pub struct CallbackPayload {
    /// Native-owned payload pointer; shape is defined by the bound operation.
    pub data: *const c_void,
    /// Scratch pool the native side provided for this invocation.
    pub pool: RawPool,
}

/// Application callback invoked by the native side during one call.
pub type Receiver<'a> = &'a mut dyn FnMut(&CallbackPayload) -> BridgeResult<()>;

/// Raw shape of the trampoline the native side calls.
pub type RawReceiverFn =
    unsafe extern "C" fn(baton: *mut c_void, data: *const c_void, pool: RawPool) -> *mut RawError;

/// One argument of a native call.
pub enum Arg<'a> {
    /// Unsigned machine word.
    UInt(u64),
    /// Signed value, lowered to its two's-complement word.
    Int(i64),
    /// String duplicated into the call's arena before dispatch.
    Str(&'a str),
    /// Pool-owned string pointer the caller already allocated.
    CStr(*const c_char),
    /// Arbitrary native pointer (arena-owned per the signature contract).
    Ptr(*const ()),
    /// Out-parameter pointer the native side writes through.
    OutPtr(*mut ()),
    /// The call arena's pool handle.
    Pool,
    /// Placeholder for the callback trampoline; lowered to null when the
    /// call carries no receiver.
    Receiver,
    /// Placeholder for the per-call baton pointer.
    Baton,
}

/// Per-call side channel shared with the trampoline.
struct BatonState<'a> {
    callback: Option<Receiver<'a>>,
    failure: Option<BridgeError>,
    panic: Option<Box<dyn std::any::Any + Send>>,
    /// Sentinel handed to the native caller, reclaimed after the call.
    issued_sentinel: Option<*mut RawError>,
}

/// Trampoline the native side invokes for each callback delivery.
///
/// Never unwinds: callback errors and panics are parked in the baton and a
/// stop-iteration sentinel is returned so the native side abandons the
/// remaining deliveries.
unsafe extern "C" fn receiver_trampoline(
    baton: *mut c_void,
    data: *const c_void,
    pool: RawPool,
) -> *mut RawError {
    let state = &mut *(baton as *mut BatonState<'_>);
    let callback = match state.callback.as_mut() {
        Some(callback) => callback,
        // Native side invoked a receiver nobody registered; stop iteration.
        None => return issue_sentinel(state),
    };

    let payload = CallbackPayload { data, pool };
    match panic::catch_unwind(AssertUnwindSafe(|| callback(&payload))) {
        Ok(Ok(())) => ptr::null_mut(),
        Ok(Err(failure)) => {
            state.failure = Some(failure);
            issue_sentinel(state)
        }
        Err(payload) => {
            state.panic = Some(payload);
            issue_sentinel(state)
        }
    }
}

fn issue_sentinel(state: &mut BatonState<'_>) -> *mut RawError {
    let sentinel = Box::into_raw(Box::new(RawError {
        code: STOP_ITERATION_CODE,
        message: ptr::null(),
        child: ptr::null_mut(),
        pool: RawPool::from_usize(0),
        file: ptr::null(),
        line: 0,
    }));
    state.issued_sentinel = Some(sentinel);
    sentinel
}

/// Invoke a resolved entry point with arena-owned arguments and an optional
/// receiver.
///
/// `Arg::Str` values are duplicated into `arena` first, so every pointer
/// the native side sees is pool-owned. On a non-success native status the
/// full cause chain is logged and mapped to a typed error; a failure raised
/// by `receiver` is returned exactly as raised.
///
/// The caller is responsible for the binding being correct: the entry point
/// must match the word-argument, error-pointer-return convention, and the
/// `args` slice must match its arity and meaning.
pub fn invoke(
    symbol: &SymbolHandle,
    arena: &ScopedArena,
    args: &[Arg<'_>],
    receiver: Option<Receiver<'_>>,
) -> BridgeResult<()> {
    if args.len() > MAX_ARGS {
        return Err(BridgeError::TooManyArgs(args.len()));
    }

    let mut state = BatonState {
        callback: receiver,
        failure: None,
        panic: None,
        issued_sentinel: None,
    };
    let baton_ptr = &mut state as *mut BatonState<'_> as *mut c_void;

    // Lower every argument to a machine word. Strings go through the arena
    // so their pointers obey the pool-ownership contract.
    let mut words = [0u64; MAX_ARGS];
    for (slot, arg) in words.iter_mut().zip(args.iter()) {
        *slot = match arg {
            Arg::UInt(value) => *value,
            Arg::Int(value) => *value as u64,
            Arg::Str(text) => arena.allocate_string(text)? as u64,
            Arg::CStr(ptr) => *ptr as u64,
            Arg::Ptr(ptr) => *ptr as u64,
            Arg::OutPtr(ptr) => *ptr as u64,
            Arg::Pool => arena.as_raw().as_usize() as u64,
            Arg::Receiver => {
                if state.callback.is_some() {
                    receiver_trampoline as usize as u64
                } else {
                    0
                }
            }
            Arg::Baton => baton_ptr as u64,
        };
    }

    let status = dispatch(symbol.address().as_usize(), &words[..args.len()]);

    // Reclaim the sentinel before anything else; the native contract is
    // that a receiver's error pointer propagates back unchanged.
    let sentinel = state.issued_sentinel.take();
    let stopped_by_bridge = sentinel.map_or(false, |s| std::ptr::eq(s, status));
    if let Some(sentinel) = sentinel {
        // Safety: allocated by issue_sentinel via Box::into_raw, returned
        // to us by contract, and never freed by the native layer.
        unsafe { drop(Box::from_raw(sentinel)) };
    }

    if let Some(payload) = state.panic.take() {
        panic::resume_unwind(payload);
    }
    if let Some(failure) = state.failure.take() {
        return Err(failure);
    }
    if status.is_null() || stopped_by_bridge {
        return Ok(());
    }
    Err(map_native_error(symbol.name(), status))
}

macro_rules! dispatch_arity {
    ($addr:expr, $words:expr, { $($n:literal => ($($idx:tt),*)),* $(,)? }) => {
        match $words.len() {
            $(
                $n => {
                    type Native = unsafe extern "C" fn($(dispatch_arity!(@word $idx),)*) -> *mut RawError;
                    // Safety: the binding site guarantees the entry point
                    // follows the word-argument convention at this arity.
                    let f: Native = unsafe { std::mem::transmute($addr) };
                    unsafe { f($($words[$idx],)*) }
                }
            )*
            _ => unreachable!("argument count checked against MAX_ARGS"),
        }
    };
    (@word $idx:tt) => { u64 };
}

/// Transmute `addr` to the word-argument convention at the given arity and
/// call it.
fn dispatch(addr: usize, words: &[u64]) -> *mut RawError {
    dispatch_arity!(addr, words, {
        0 => (),
        1 => (0),
        2 => (0, 1),
        3 => (0, 1, 2),
        4 => (0, 1, 2, 3),
        5 => (0, 1, 2, 3, 4),
        6 => (0, 1, 2, 3, 4, 5),
        7 => (0, 1, 2, 3, 4, 5, 6),
        8 => (0, 1, 2, 3, 4, 5, 6, 7),
        9 => (0, 1, 2, 3, 4, 5, 6, 7, 8),
        10 => (0, 1, 2, 3, 4, 5, 6, 7, 8, 9),
        11 => (0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10),
        12 => (0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11),
        13 => (0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12),
    })
}

/// Decode a native error chain. Depth-capped against malformed cycles.
///
/// # Safety
///
/// `error` must point at a live, well-formed native error object.
unsafe fn collect_chain(error: *mut RawError) -> Vec<ErrorFrame> {
    let mut frames = Vec::new();
    let mut current = error;
    while !current.is_null() && frames.len() < 32 {
        let raw = &*current;
        let message = if raw.message.is_null() {
            String::new()
        } else {
            CStr::from_ptr(raw.message).to_string_lossy().into_owned()
        };
        let location = if raw.file.is_null() {
            None
        } else {
            Some(format!(
                "{}:{}",
                CStr::from_ptr(raw.file).to_string_lossy(),
                raw.line
            ))
        };
        frames.push(ErrorFrame {
            code: raw.code,
            message,
            location,
        });
        current = raw.child;
    }
    frames
}

/// Log a native failure's whole cause chain, then map it to a typed error.
fn map_native_error(entry_point: &str, error: *mut RawError) -> BridgeError {
    // Safety: non-null per the caller, pool-owned and alive until the call
    // arena is destroyed, which cannot happen while we hold `&ScopedArena`.
    let frames = unsafe { collect_chain(error) };

    for (depth, frame) in frames.iter().enumerate() {
        log::error!(
            "native call '{}' failed [{}] code {} at {}: {}",
            entry_point,
            depth,
            frame.code,
            frame.location.as_deref().unwrap_or("<unknown>"),
            frame.message
        );
    }

    let top = frames.first();
    let code = top.map_or(0, |frame| frame.code);
    let message = top
        .map(|frame| frame.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "no message supplied".to_string());

    if frames
        .iter()
        .any(|frame| AUTHORIZATION_DENIED_CODES.contains(&frame.code))
    {
        BridgeError::AuthorizationDenied { code, message }
    } else {
        BridgeError::NativeCallFailed { code, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SymbolAddress;
    use crate::testing::FakePoolRuntime;
    use std::mem;
    use std::sync::Arc;

    fn arena() -> ScopedArena {
        ScopedArena::create_root(Arc::new(FakePoolRuntime::new())).unwrap()
    }

    fn symbol_for(name: &str, f: *const ()) -> SymbolHandle {
        SymbolHandle::from_raw(name, SymbolAddress::new(f))
    }

    /// Native side that delivers `count` items to the receiver, stopping
    /// early when it returns an error, which propagates back unchanged.
    unsafe extern "C" fn native_enumerate(
        count: u64,
        receiver: u64,
        baton: u64,
        pool: u64,
    ) -> *mut RawError {
        let receiver: RawReceiverFn = mem::transmute(receiver as usize);
        for item in 0..count {
            let status = receiver(
                baton as *mut c_void,
                &item as *const u64 as *const c_void,
                RawPool::from_usize(pool as usize),
            );
            if !status.is_null() {
                return status;
            }
        }
        ptr::null_mut()
    }

    /// Native side that fails with a two-frame error chain.
    unsafe extern "C" fn native_fail(code: u64) -> *mut RawError {
        let child = Box::into_raw(Box::new(RawError {
            code: 5,
            message: b"underlying cause\0".as_ptr() as *const c_char,
            child: ptr::null_mut(),
            pool: RawPool::from_usize(0),
            file: b"fake_native.c\0".as_ptr() as *const c_char,
            line: 42,
        }));
        Box::into_raw(Box::new(RawError {
            code: code as i32,
            message: b"operation failed\0".as_ptr() as *const c_char,
            child,
            pool: RawPool::from_usize(0),
            file: ptr::null(),
            line: 0,
        }))
    }

    unsafe extern "C" fn native_succeed(_a: u64, _b: u64) -> *mut RawError {
        ptr::null_mut()
    }

    #[test]
    fn success_with_plain_args() {
        let arena = arena();
        let symbol = symbol_for("native_succeed", native_succeed as *const ());
        invoke(
            &symbol,
            &arena,
            &[Arg::UInt(1), Arg::Str("hello")],
            None,
        )
        .unwrap();
    }

    #[test]
    fn callback_invoked_per_item() {
        let arena = arena();
        let symbol = symbol_for("native_enumerate", native_enumerate as *const ());

        let mut seen = Vec::new();
        let mut callback = |payload: &CallbackPayload| {
            seen.push(unsafe { *(payload.data as *const u64) });
            Ok(())
        };
        invoke(
            &symbol,
            &arena,
            &[Arg::UInt(4), Arg::Receiver, Arg::Baton, Arg::Pool],
            Some(&mut callback),
        )
        .unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn callback_failure_is_returned_verbatim() {
        let arena = arena();
        let symbol = symbol_for("native_enumerate", native_enumerate as *const ());

        let mut delivered = 0u64;
        let mut callback = |payload: &CallbackPayload| {
            delivered += 1;
            let item = unsafe { *(payload.data as *const u64) };
            if item == 2 {
                Err(BridgeError::InvalidString {
                    what: "application rejects item 2".to_string(),
                })
            } else {
                Ok(())
            }
        };
        let err = invoke(
            &symbol,
            &arena,
            &[Arg::UInt(10), Arg::Receiver, Arg::Baton, Arg::Pool],
            Some(&mut callback),
        )
        .unwrap_err();

        match err {
            BridgeError::InvalidString { what } => {
                assert!(what.contains("application rejects item 2"))
            }
            other => panic!("wrong error surfaced: {other}"),
        }
        // Iteration stopped at the failing item.
        assert_eq!(delivered, 3);
    }

    #[test]
    fn callback_panic_resumes_after_native_frame() {
        let arena = arena();
        let symbol = symbol_for("native_enumerate", native_enumerate as *const ());

        let mut callback = |_: &CallbackPayload| -> BridgeResult<()> { panic!("receiver bug") };
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            invoke(
                &symbol,
                &arena,
                &[Arg::UInt(3), Arg::Receiver, Arg::Baton, Arg::Pool],
                Some(&mut callback),
            )
        }));
        let payload = result.unwrap_err();
        let text = payload.downcast_ref::<&str>().copied().unwrap_or_default();
        assert_eq!(text, "receiver bug");
    }

    #[test]
    fn native_error_chain_is_mapped() {
        let arena = arena();
        let symbol = symbol_for("native_fail", native_fail as *const ());

        let err = invoke(&symbol, &arena, &[Arg::UInt(160_006)], None).unwrap_err();
        match err {
            BridgeError::NativeCallFailed { code, message } => {
                assert_eq!(code, 160_006);
                assert_eq!(message, "operation failed");
            }
            other => panic!("wrong mapping: {other}"),
        }
    }

    #[test]
    fn authorization_code_gets_distinguished_error() {
        let arena = arena();
        let symbol = symbol_for("native_fail", native_fail as *const ());

        let err = invoke(&symbol, &arena, &[Arg::UInt(170_001)], None).unwrap_err();
        assert!(matches!(err, BridgeError::AuthorizationDenied { .. }));
    }

    #[test]
    fn missing_receiver_lowers_to_null() {
        let arena = arena();
        let symbol = symbol_for("native_succeed", native_succeed as *const ());
        invoke(&symbol, &arena, &[Arg::Receiver, Arg::Baton], None).unwrap();
    }

    #[test]
    fn chain_walker_reads_both_frames() {
        let error = unsafe { native_fail(100) };
        let frames = unsafe { collect_chain(error) };
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].code, 100);
        assert_eq!(frames[1].code, 5);
        assert_eq!(frames[1].location.as_deref(), Some("fake_native.c:42"));
    }
}
