//! Panic isolation for listener callbacks.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::error;

/// Run one listener callback, containing a panic so later listeners still run.
///
/// Returns `false` when the callback panicked.
pub fn call_listener(kind: &'static str, call: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(()) => true,
        Err(panic) => {
            error!(listener = kind, panic = %panic_message(panic.as_ref()), "listener panicked");
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
}
