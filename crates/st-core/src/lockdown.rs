//! Process-wide emergency lock down flag.
//!
//! Once set, every daemon loop terminates at its next iteration and the
//! command processor refuses work with a dedicated error. There is no way
//! back short of restarting the process.

use std::sync::atomic::{AtomicBool, Ordering};

static EMERGENCY_LOCK_DOWN: AtomicBool = AtomicBool::new(false);

/// True once [`trigger`] has been called.
pub fn is_effective() -> bool {
    EMERGENCY_LOCK_DOWN.load(Ordering::Acquire)
}

/// Place the process into emergency lock down.
pub fn trigger() {
    tracing::warn!("emergency lock down is now in effect");
    EMERGENCY_LOCK_DOWN.store(true, Ordering::Release);
}

#[doc(hidden)]
pub fn clear_for_tests() {
    EMERGENCY_LOCK_DOWN.store(false, Ordering::Release);
}
