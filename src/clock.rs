//! Write timestamps for last-writer-wins ordering.
//!
//! Wall-clock milliseconds, clamped to be non-decreasing within the
//! process. A small OS clock regression therefore reuses the previous
//! reading; ties are broken by actor id downstream, so convergence does
//! not depend on clocks being exact.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Current timestamp in milliseconds since the UNIX epoch, never lower
/// than a previously returned value.
pub fn now_millis() -> i64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let prev = LAST_MILLIS.fetch_max(wall, Ordering::SeqCst);
    wall.max(prev)
}
