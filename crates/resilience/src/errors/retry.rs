/// Classification for retry policy.
///
/// Used to decide how a caller of the resilience layer should react to a
/// [`ResilienceError`](super::ResilienceError).
///
/// # Behavior Summary
///
/// | Class | Retry in-process? | Move to next fallback step? |
/// |-------|-------------------|-----------------------------|
/// | `Never` | No | No |
/// | `WithBackoff` | Yes, after a backoff delay | Yes |
/// | `NextStep` | No | Yes |
/// | `Defer` | No, hand off to the deferred scheduler | Yes |
/// | `FailFast` | No (circuit open) | Yes |
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryClass {
    /// Permanent failure or exhausted budget. Retrying won't help.
    Never,

    /// Transient failure. Retry with exponential backoff.
    WithBackoff,

    /// This step gave up (sub-deadline); later steps may still succeed.
    NextStep,

    /// A hard quota is exhausted. Retrying before the quota reset is wasted
    /// work, so the request is deferred instead.
    Defer,

    /// Circuit breaker is open for this provider. No call was attempted.
    FailFast,
}
