//! Clock, locking and structural-sharing helpers.

use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::config::StructuralSharing;

/// Locks `mutex`, recovering the guard if a listener panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

static CLOCK_ANCHOR: LazyLock<(u64, tokio::time::Instant)> = LazyLock::new(|| {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
    (wall, tokio::time::Instant::now())
});

/// Milliseconds since the Unix epoch.
///
/// Anchored once to the wall clock and advanced with tokio's clock, so
/// timestamps follow `tokio::time::pause`/`advance` in tests.
#[must_use]
pub fn now_millis() -> u64 {
    let (wall, anchor) = *CLOCK_ANCHOR;
    let elapsed = tokio::time::Instant::now().saturating_duration_since(anchor);
    wall.saturating_add(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

/// Time left before data updated at `updated_at` turns stale.
///
/// `Duration::MAX` means "never stale".
#[must_use]
pub fn time_until_stale(updated_at: u64, stale_time: Duration) -> Duration {
    if stale_time == Duration::MAX {
        return Duration::MAX;
    }
    let stale_ms = u64::try_from(stale_time.as_millis()).unwrap_or(u64::MAX);
    let stale_at = updated_at.saturating_add(stale_ms);
    Duration::from_millis(stale_at.saturating_sub(now_millis()))
}

/// Structural equality over the closed set of JSON shapes.
///
/// Arrays compare element-wise in order, objects compare by member set and
/// member values regardless of member order, everything else compares as a
/// primitive. Numbers compare by their JSON representation, so `1` and `1.0`
/// are different values.
#[must_use]
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(left), Value::Array(right)) => {
            left.len() == right.len() && left.iter().zip(right).all(|(l, r)| deep_equal(l, r))
        }
        (Value::Object(left), Value::Object(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .all(|(name, l)| right.get(name).is_some_and(|r| deep_equal(l, r)))
        }
        (left, right) => left == right,
    }
}

/// Returns `prev` when `next` is deeply equal to it, otherwise `next`.
///
/// Sharing is all-or-nothing at the top level: a JSON tree has no interior
/// reference identity to preserve.
#[must_use]
pub fn replace_equal_deep(prev: Option<&Arc<Value>>, next: Arc<Value>) -> Arc<Value> {
    match prev {
        Some(prev) if Arc::ptr_eq(prev, &next) || deep_equal(prev, &next) => Arc::clone(prev),
        _ => next,
    }
}

/// Applies the configured structural-sharing policy.
#[must_use]
pub fn replace_data(
    prev: Option<&Arc<Value>>,
    next: Arc<Value>,
    sharing: &StructuralSharing,
) -> Arc<Value> {
    match sharing {
        StructuralSharing::Enabled => replace_equal_deep(prev, next),
        StructuralSharing::Disabled => next,
        StructuralSharing::Custom(share) => share(prev, next),
    }
}
