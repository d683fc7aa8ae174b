//! Core capability traits for the dispatch engine.
//!
//! These are the seams between the scheduler and its collaborators: the
//! wire transport, the retry policy, and the priority promotion rule.
//! Implementations are chosen once at manager construction time.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;

use super::error::TransportError;
use super::priority::Priority;
use super::request::Request;
use super::response::Response;

/// One wire attempt as handed to the transport. The transport performs no
/// redirect, retry, or cache handling of its own.
#[derive(Debug, Clone)]
pub struct TransportCall {
    pub method: Method,
    pub uri: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

/// Raw result of a wire attempt: status, headers, fully-buffered body, and
/// the elapsed wall time of the exchange.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Bytes,
    pub elapsed_ms: u64,
}

/// Trait for the blocking HTTP primitive underneath the scheduler.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a single wire call for the given target.
    async fn execute(&self, call: TransportCall) -> Result<TransportResponse, TransportError>;
}

/// Outcome of consulting the retry policy for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay_ms: u64,
}

impl RetryDecision {
    pub fn no() -> Self {
        Self {
            retry: false,
            delay_ms: 0,
        }
    }

    pub fn after(delay_ms: u64) -> Self {
        Self {
            retry: true,
            delay_ms,
        }
    }
}

/// Trait deciding whether a failed or answered attempt should be retried.
pub trait RetryPolicy: Send + Sync {
    /// Consulted when the transport raised an error.
    fn on_error(&self, request: &Request, error: &TransportError) -> RetryDecision;

    /// Consulted when the transport produced a response.
    fn on_response(&self, request: &Request, response: &Response) -> RetryDecision;

    /// Veto hook for 3xx handling; the scheduler follows redirects unless
    /// this returns false.
    fn should_redirect(&self, _request: &Request, _response: &Response) -> bool {
        true
    }
}

/// Trait raising the priority of queued works as they age.
pub trait PromotionPolicy: Send + Sync {
    /// Invoked once per waiting work on each scheduler pass.
    fn promote(&self, priority: &mut Priority, now: u64);
}
