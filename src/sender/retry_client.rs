use super::client::{ClientError, HttpClient};
use crate::reliability::{
    BackoffFn, RequestContext, ResponseInfo, RetryPolicy, check_retry,
    exponential_backoff_with_jitter,
};
use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;
use tracing::{debug, warn};

/// Longest error body kept in `ClientError::HttpError`.
const MAX_ERROR_BODY: usize = 1024;

/// HTTP client that retries according to a `RetryPolicy` and sleeps a
/// `BackoffFn` between attempts. Every wait is cut short by the context.
#[derive(Debug, Clone)]
pub struct RetryClient {
    http: HttpClient,
    policy: RetryPolicy,
    backoff: BackoffFn,
}

impl RetryClient {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            policy: check_retry,
            backoff: exponential_backoff_with_jitter,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffFn) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Sends the request built by `build` until it succeeds, the policy gives
    /// up, retries run out or `ctx` finishes. `policy` overrides the client
    /// default for this call.
    pub async fn execute<F>(
        &self,
        ctx: &RequestContext,
        policy: Option<RetryPolicy>,
        build: F,
    ) -> Result<Response, ClientError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let policy = policy.unwrap_or(self.policy);
        let retry_max = self.http.config.retry_max;
        let mut attempt: u32 = 0;

        loop {
            if let Some(ctx_err) = ctx.err() {
                return Err(ctx_err.into());
            }

            self.http.stats.record_attempt(attempt);
            let sent = tokio::select! {
                sent = build(&self.http.client).send() => sent,
                ctx_err = ctx.done() => return Err(ctx_err.into()),
            };

            let (response, transport_err) = match sent {
                Ok(response) => (Some(response), None),
                Err(err) => (None, Some(err)),
            };
            let info = response.as_ref().map(ResponseInfo::from_response);

            let retry = policy(ctx, info.as_ref(), transport_err.as_ref())?;
            if !retry {
                return self.finish(response, transport_err).await;
            }

            let last = match (response, transport_err) {
                (Some(response), _) => error_from_response(response).await,
                (None, Some(err)) => ClientError::NetworkError(err),
                (None, None) => ClientError::HttpError {
                    status: 0,
                    message: "no response".to_string(),
                },
            };

            if attempt >= retry_max {
                self.http.stats.record_outcome(false);
                return Err(ClientError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: Box::new(last),
                });
            }

            let wait = (self.backoff)(
                self.http.config.retry_wait_min,
                self.http.config.retry_wait_max,
                attempt,
                info.as_ref(),
            );
            warn!(
                attempt = attempt + 1,
                status = info.map(|i| i.status),
                wait_ms = wait.as_millis() as u64,
                "Request failed, retrying: {last}"
            );

            sleep_or_cancel(ctx, wait).await?;
            attempt += 1;
        }
    }

    async fn finish(
        &self,
        response: Option<Response>,
        transport_err: Option<reqwest::Error>,
    ) -> Result<Response, ClientError> {
        let outcome = match (response, transport_err) {
            (Some(response), _) if response.status().is_success() => Ok(response),
            (Some(response), _) => Err(error_from_response(response).await),
            (None, Some(err)) => Err(ClientError::NetworkError(err)),
            (None, None) => Err(ClientError::HttpError {
                status: 0,
                message: "no response".to_string(),
            }),
        };
        self.http.stats.record_outcome(outcome.is_ok());
        if let Err(err) = &outcome {
            debug!("Request not retried: {err}");
        }
        outcome
    }
}

async fn sleep_or_cancel(ctx: &RequestContext, wait: Duration) -> Result<(), ClientError> {
    tokio::select! {
        () = tokio::time::sleep(wait) => Ok(()),
        ctx_err = ctx.done() => Err(ctx_err.into()),
    }
}

async fn error_from_response(response: Response) -> ClientError {
    let status = response.status().as_u16();
    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    ClientError::HttpError { status, message }
}
