//! OS signal wiring: `SIGTERM`/`SIGINT` request shutdown, `SIGUSR1` dumps
//! metrics, `SIGPIPE` is ignored so a broken pipe during COPY surfaces as
//! an `EPIPE` write error instead of killing the process.
//!
//! Only `runtime::run` (the production entry point) calls [`install`].
//! Tests drive `runtime::serve` directly with their own shutdown flag and
//! never touch real signals, so concurrently-running test servers can't
//! stomp on each other through this process-wide state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static SHUTDOWN_SLOT: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Set by the `SIGUSR1` handler; `serve`'s loop polls and clears it.
pub static DUMP_METRICS: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_: libc::c_int) {
    if let Some(flag) = SHUTDOWN_SLOT.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

extern "C" fn on_usr1(_: libc::c_int) {
    DUMP_METRICS.store(true, Ordering::SeqCst);
}

/// Installs the process-wide handlers described above, wiring `shutdown`
/// to `SIGTERM`/`SIGINT`. Idempotent in the sense that only the first
/// call's `shutdown` flag ever gets set by a signal (`OnceLock`).
pub fn install(shutdown: Arc<AtomicBool>) {
    let _ = SHUTDOWN_SLOT.set(shutdown);
    unsafe {
        libc::signal(libc::SIGTERM, on_shutdown_signal as usize);
        libc::signal(libc::SIGINT, on_shutdown_signal as usize);
        libc::signal(libc::SIGUSR1, on_usr1 as usize);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
