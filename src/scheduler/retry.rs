//! Default retry policy.

use crate::cache::directives::ResponseDirectives;
use crate::core::error::TransportError;
use crate::core::request::Request;
use crate::core::response::Response;
use crate::core::traits::{RetryDecision, RetryPolicy};

const MAX_FAILURE_RETRIES: u32 = 5;
const MAX_RESPONSE_RETRIES: u32 = 5;
const FAILURE_DELAY_MS: u64 = 3_000;
const RESPONSE_DELAY_MS: u64 = 5_000;

/// Stock policy: transient transport failures are retried for idempotent
/// requests, and 202/503 responses are retried honoring `Retry-After`.
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    max_failure_retries: u32,
    max_response_retries: u32,
    failure_delay_ms: u64,
    response_delay_ms: u64,
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self {
            max_failure_retries: MAX_FAILURE_RETRIES,
            max_response_retries: MAX_RESPONSE_RETRIES,
            failure_delay_ms: FAILURE_DELAY_MS,
            response_delay_ms: RESPONSE_DELAY_MS,
        }
    }
}

impl DefaultRetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same decision rules with custom delays; used by tests and latency
    /// sensitive embedders.
    pub fn with_delays(failure_delay_ms: u64, response_delay_ms: u64) -> Self {
        Self {
            failure_delay_ms,
            response_delay_ms,
            ..Self::default()
        }
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn on_error(&self, request: &Request, error: &TransportError) -> RetryDecision {
        if !request.is_idempotent() {
            return RetryDecision::no();
        }
        if !error.kind.is_transient() {
            return RetryDecision::no();
        }
        if request.retry_count_failure() >= self.max_failure_retries {
            return RetryDecision::no();
        }
        RetryDecision::after(self.failure_delay_ms)
    }

    fn on_response(&self, request: &Request, response: &Response) -> RetryDecision {
        if !matches!(response.status(), 202 | 503) {
            return RetryDecision::no();
        }
        if request.retry_count_response() >= self.max_response_retries {
            return RetryDecision::no();
        }
        let delay = ResponseDirectives::parse(response)
            .retry_after_ms
            .unwrap_or(self.response_delay_ms);
        RetryDecision::after(delay)
    }
}
