use std::sync::atomic::{AtomicU64, Ordering};

/// Client ID reserved for single, non-batched checks (passive checks,
/// `-t` test runs). Never returned by [`new_client_id`].
pub const SINGLE_CHECK_CLIENT_ID: u64 = 0;

static LAST_CLIENT_ID: AtomicU64 = AtomicU64::new(SINGLE_CHECK_CLIENT_ID);

/// Returns a process-unique, monotonically increasing identifier for a
/// request batch. The first value issued is `1`.
pub fn new_client_id() -> u64 {
    LAST_CLIENT_ID.fetch_add(1, Ordering::Relaxed) + 1
}
