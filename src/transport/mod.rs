//! Default HTTP transport built on reqwest.
//!
//! The executor performs exactly one wire exchange per call: connect, send,
//! read the full body. Redirects, retries, and caching are the scheduler's
//! job, so the underlying client is built with redirects disabled unless
//! the configuration opts into native redirect following.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::io;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::core::error::{CommsError, CommsResult, TransportError, TransportErrorKind};
use crate::core::traits::{Transport, TransportCall, TransportResponse};

/// reqwest-backed [`Transport`] implementation.
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(config: &EngineConfig) -> CommsResult<Self> {
        let redirect_policy = if config.use_native_redirects {
            reqwest::redirect::Policy::limited(config.redirect_limit as usize)
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .read_timeout(Duration::from_millis(config.read_timeout_ms))
            .redirect(redirect_policy)
            .danger_accept_invalid_certs(config.disable_tls_verification)
            .build()
            .map_err(|e| CommsError::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpExecutor {
    async fn execute(&self, call: TransportCall) -> Result<TransportResponse, TransportError> {
        let method = reqwest::Method::from_bytes(call.method.as_str().as_bytes())
            .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;

        let mut builder = self
            .client
            .request(method, &call.uri)
            // Guard rail over the per-phase client timeouts.
            .timeout(Duration::from_millis(
                call.connect_timeout_ms.saturating_add(call.read_timeout_ms),
            ));
        for (name, value) in &call.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &call.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.as_str().to_ascii_lowercase())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let body = response.bytes().await.map_err(|e| {
            TransportError::new(TransportErrorKind::Read, format!("reading body: {e}"))
        })?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        log::debug!(
            "{} {} -> {} ({} bytes, {elapsed_ms} ms)",
            call.method,
            call.uri,
            status,
            body.len()
        );

        Ok(TransportResponse {
            status,
            headers,
            body,
            elapsed_ms,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    TransportError::new(classify(&err), err.to_string())
}

/// Best-effort mapping of a reqwest failure onto the engine's typed kinds.
/// The io error chain is authoritative where available; TLS and DNS
/// failures are recognized by their rendered causes.
fn classify(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        return TransportErrorKind::Timeout;
    }

    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return TransportErrorKind::ConnectionRefused,
                io::ErrorKind::TimedOut => return TransportErrorKind::Timeout,
                io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                    return TransportErrorKind::RouteUnreachable
                }
                _ => {}
            }
        }
        let rendered = cause.to_string().to_ascii_lowercase();
        if rendered.contains("dns") || rendered.contains("resolve") {
            return TransportErrorKind::Dns;
        }
        if rendered.contains("certificate") {
            return TransportErrorKind::TlsCertificate;
        }
        if rendered.contains("handshake") {
            return TransportErrorKind::TlsHandshake;
        }
        if rendered.contains("tls") || rendered.contains("ssl") {
            return TransportErrorKind::Tls;
        }
        source = cause.source();
    }

    if err.is_connect() {
        TransportErrorKind::Connect
    } else if err.is_body() || err.is_decode() {
        TransportErrorKind::Read
    } else {
        TransportErrorKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[test]
    fn builds_with_default_config() {
        let config = EngineConfig::default();
        assert!(HttpExecutor::new(&config).is_ok());
    }

    #[test]
    fn builds_with_tls_verification_disabled() {
        let config = EngineConfig {
            disable_tls_verification: true,
            ..EngineConfig::default()
        };
        assert!(HttpExecutor::new(&config).is_ok());
    }
}
