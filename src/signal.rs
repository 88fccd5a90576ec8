//! Global shutdown signal (spec §5 "Cancellation"): a single
//! process-wide halt flag checked between `wait()` calls so an
//! in-flight transaction can be aborted without completing it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use tokio::sync::Notify;

static HALT: AtomicBool = AtomicBool::new(false);

fn notify() -> &'static Notify {
    static NOTIFY: OnceLock<Notify> = OnceLock::new();
    NOTIFY.get_or_init(Notify::new)
}

/// Request a best-effort shutdown: every task currently suspended in
/// [`crate::wire::Connection::wait`] wakes with the `retry` bit set and
/// subsequently observes [`halt_requested`] as true.
pub fn request_halt() {
    HALT.store(true, Ordering::SeqCst);
    notify().notify_waiters();
}

pub fn halt_requested() -> bool {
    HALT.load(Ordering::SeqCst)
}

/// Resolves immediately if a halt has already been requested;
/// otherwise resolves the next time [`request_halt`] is called.
/// Intended to be raced against a real I/O wait in a `tokio::select!`.
pub async fn wait_for_halt() {
    if halt_requested() {
        return;
    }
    notify().notified().await;
}
