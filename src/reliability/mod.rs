//! Delivery policy for network calls: cancellation contexts, retry
//! classification and backoff.

pub mod backoff;
pub mod context;
pub mod retry;

pub use backoff::{
    BackoffFn, MAX_RETRY_AFTER, ResponseInfo, exponential_backoff_with_jitter, parse_retry_after,
};
pub use context::{ContextError, RequestContext};
pub use retry::{RetryPolicy, check_retry, is_retryable_status, upsert_retry_policy};
