//! Bounded retry-with-yield for contended operations that may legitimately
//! lose a race (a writable shadow conflict, a CAS on a bucket's extremum).
//!
//! Unlike a spin loop, each failed attempt yields the thread before
//! retrying; after `N` attempts the caller gets
//! [`vtm_core::error::Error::ConcurrentLock`] instead of spinning forever.

use vtm_core::error::{Error, Result};

/// Call `attempt` up to `N` times, yielding the thread between failures.
/// `attempt` returns `Ok(Some(value))` on success, `Ok(None)` to retry, or
/// `Err` to abort immediately.
pub fn transactional_yield_retry<const N: u32, T>(
    mut attempt: impl FnMut() -> Result<Option<T>>,
) -> Result<T> {
    for i in 0..N {
        if let Some(value) = attempt()? {
            return Ok(value);
        }
        if i + 1 < N {
            std::thread::yield_now();
        }
    }
    Err(Error::ConcurrentLock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn succeeds_once_the_condition_clears() {
        let attempts = AtomicU32::new(0);
        let result = transactional_yield_retry::<5, _>(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            Ok(if n >= 2 { Some(n) } else { None })
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn exhausts_into_concurrent_lock() {
        let result = transactional_yield_retry::<3, ()>(|| Ok(None));
        assert!(matches!(result, Err(Error::ConcurrentLock)));
    }

    #[test]
    fn propagates_immediate_errors() {
        let result: Result<()> =
            transactional_yield_retry::<3, ()>(|| Err(Error::InvalidState("nope".into())));
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }
}
