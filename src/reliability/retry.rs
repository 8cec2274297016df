use super::backoff::ResponseInfo;
use super::context::{ContextError, RequestContext};

/// Decides whether a finished attempt should be retried.
///
/// `Err` means the context is finished; its error is what the caller sees.
pub type RetryPolicy =
    fn(&RequestContext, Option<&ResponseInfo>, Option<&reqwest::Error>) -> Result<bool, ContextError>;

/// Client mistakes that cannot succeed on retry.
const NON_RETRYABLE_STATUSES: [u16; 9] = [400, 401, 403, 404, 409, 410, 413, 422, 501];

/// Default policy: retry server errors, throttling, transport failures and
/// malformed status codes; give up on client mistakes and on a finished
/// context.
pub fn check_retry(
    ctx: &RequestContext,
    response: Option<&ResponseInfo>,
    err: Option<&reqwest::Error>,
) -> Result<bool, ContextError> {
    if let Some(ctx_err) = ctx.err() {
        return Err(ctx_err);
    }

    if let Some(err) = err {
        return Ok(is_retryable_transport_error(err));
    }

    Ok(response.is_none_or(|response| is_retryable_status(response.status)))
}

/// Like [`check_retry`], but a 409 Conflict is retried: the row being upserted
/// is still being created by an earlier request.
pub fn upsert_retry_policy(
    ctx: &RequestContext,
    response: Option<&ResponseInfo>,
    err: Option<&reqwest::Error>,
) -> Result<bool, ContextError> {
    if let Some(ctx_err) = ctx.err() {
        return Err(ctx_err);
    }
    if response.is_some_and(|response| response.status == 409) {
        return Ok(true);
    }
    check_retry(ctx, response, err)
}

pub fn is_retryable_status(status: u16) -> bool {
    match status {
        0 => true,
        s if s >= 600 => true,
        s if NON_RETRYABLE_STATUSES.contains(&s) => false,
        400..=599 => true,
        _ => false,
    }
}

fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    // Request construction and redirect loops fail the same way every time.
    !(err.is_builder() || err.is_redirect())
}
