//! Bounded retry with fixed back-off.
//!
//! Filesystem operations on Windows race with Explorer and antivirus
//! handles; network shares drop connections. Every such call goes through
//! [`try_execute`] instead of an ad-hoc loop.

use anyhow::Result;
use std::thread;
use std::time::Duration;

use crate::error::{tool_exit_code, NimpError};

/// Attempt count and delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Directory removal/creation racing with open handles.
    pub const FILESYSTEM: Self = Self::new(10, Duration::from_secs(10));

    /// Renaming a freshly written artifact on a network share.
    pub const RENAME: Self = Self::new(30, Duration::from_secs(2));

    /// Listing or downloading artifacts.
    pub const NETWORK: Self = Self::new(5, Duration::from_secs(10));

    /// Symbol store uploads.
    pub const SYMSTORE: Self = Self::new(3, Duration::from_secs(10));
}

/// Run `action` until it succeeds, `is_retryable` rejects the error, or the
/// attempts are exhausted. The last error is returned as-is.
pub fn try_execute<T, F, P>(policy: RetryPolicy, is_retryable: P, mut action: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
    P: Fn(&anyhow::Error) -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= attempts || !is_retryable(&e) {
                    return Err(e);
                }
                tracing::warn!("{:#} (Attempt {} of {})", e, attempt, attempts);
                if !policy.delay.is_zero() {
                    thread::sleep(policy.delay);
                }
                attempt += 1;
            }
        }
    }
}

/// Retryable when any cause is an I/O error or a transient [`NimpError`].
pub fn is_transient(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause.downcast_ref::<std::io::Error>().is_some()
            || cause
                .downcast_ref::<NimpError>()
                .is_some_and(NimpError::is_transient)
            || cause.downcast_ref::<zip::result::ZipError>().is_some()
    })
}

/// Retryable when a tool failed with one of `codes`.
pub fn on_exit_codes(codes: &'static [i32]) -> impl Fn(&anyhow::Error) -> bool {
    move |error| tool_exit_code(error).is_some_and(|code| codes.contains(&code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::cell::Cell;

    const FAST: RetryPolicy = RetryPolicy::new(3, Duration::ZERO);

    #[test]
    fn test_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result = try_execute(FAST, is_transient, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(std::io::Error::other("busy").into())
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_exhaustion_returns_last_error() {
        let calls = Cell::new(0);
        let result: Result<()> = try_execute(FAST, is_transient, || {
            calls.set(calls.get() + 1);
            Err(NimpError::Filesystem(format!("attempt {}", calls.get())).into())
        });
        assert_eq!(calls.get(), 3);
        assert!(result.unwrap_err().to_string().contains("attempt 3"));
    }

    #[test]
    fn test_non_retryable_stops_immediately() {
        let calls = Cell::new(0);
        let result: Result<()> = try_execute(FAST, is_transient, || {
            calls.set(calls.get() + 1);
            Err(anyhow!("bad configuration"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_exit_code_predicate() {
        let calls = Cell::new(0);
        let result: Result<()> = try_execute(FAST, on_exit_codes(&[32, 80]), || {
            calls.set(calls.get() + 1);
            let code = if calls.get() == 1 { 32 } else { 5 };
            Err(NimpError::tool("symstore.exe", code).into())
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
    }
}
