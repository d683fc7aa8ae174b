//! Request model and identity fingerprinting.
//!
//! A request's identity is derived from the *original* URI it was submitted
//! with; redirects append to the endpoint history but never change the id,
//! which is what makes dedup and cache keys stable across a redirect chain.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use http::{Method, Uri};
use sha2::{Digest, Sha256};

use super::error::{CommsError, CommsResult};

/// A unit of HTTP work as submitted by a producer.
///
/// Holds the redirect history (`endpoints`), the optional body, the header
/// map, and the monotonic retry/redirect counters the scheduler maintains.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    /// Chronological endpoint history. The first entry is the original URI
    /// (defines identity), the last is the current target.
    endpoints: Vec<String>,
    body: Option<Bytes>,
    headers: BTreeMap<String, String>,
    idempotent: bool,
    id: u32,
    redirect_count: u32,
    retry_count_failure: u32,
    retry_count_response: u32,
}

impl Request {
    pub fn new(
        method: Method,
        uri: &str,
        body: Option<Bytes>,
        headers: BTreeMap<String, String>,
        idempotent: bool,
    ) -> CommsResult<Self> {
        if body.is_some() && method != Method::POST {
            return Err(CommsError::Protocol(format!(
                "body not supported for {method} requests"
            )));
        }
        let normalized = normalize_uri(uri)?;
        let id = fingerprint(&normalized, body.as_deref())?;
        Ok(Self {
            method,
            endpoints: vec![normalized],
            body,
            headers,
            idempotent,
            id,
            redirect_count: 0,
            retry_count_failure: 0,
            retry_count_response: 0,
        })
    }

    /// Stable 32-bit identity derived from the original URI and body.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The URI the next attempt will be sent to (most recent redirect target).
    pub fn current_uri(&self) -> &str {
        self.endpoints.last().expect("endpoint history never empty")
    }

    /// The URI the request was originally submitted with.
    pub fn original_uri(&self) -> &str {
        self.endpoints.first().expect("endpoint history never empty")
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn redirect_count(&self) -> u32 {
        self.redirect_count
    }

    pub fn retry_count_failure(&self) -> u32 {
        self.retry_count_failure
    }

    pub fn retry_count_response(&self) -> u32 {
        self.retry_count_response
    }

    pub(crate) fn record_failure_retry(&mut self) {
        self.retry_count_failure += 1;
    }

    pub(crate) fn record_response_retry(&mut self) {
        self.retry_count_response += 1;
    }

    /// Redirect this request to `uri`.
    ///
    /// Returns `false` (leaving the request untouched) when the target is
    /// already present in the endpoint history, which is how redirect cycles
    /// are refused. The request id is never recomputed here.
    pub fn redirect(&mut self, uri: &str) -> bool {
        let normalized = match normalize_uri(uri) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("Rejecting redirect to unparseable URI {uri}: {e}");
                return false;
            }
        };
        if self.endpoints.iter().any(|seen| *seen == normalized) {
            log::debug!("Refusing redirect cycle back to {normalized}");
            return false;
        }
        self.endpoints.push(normalized);
        self.redirect_count += 1;
        true
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Request {}

/// Normalize a URI string: lower-cased scheme and host, explicit path,
/// query and fragment preserved verbatim.
///
/// `http::Uri` drops fragments, so the fragment is split off before parsing
/// and re-attached to the normalized text.
pub fn normalize_uri(raw: &str) -> CommsResult<String> {
    let (without_fragment, fragment) = match raw.split_once('#') {
        Some((u, f)) => (u, Some(f)),
        None => (raw, None),
    };

    let uri: Uri = without_fragment.parse()?;
    let scheme = uri
        .scheme_str()
        .ok_or_else(|| CommsError::Protocol(format!("URI missing scheme: {raw}")))?
        .to_ascii_lowercase();
    let host = uri
        .host()
        .ok_or_else(|| CommsError::Protocol(format!("URI missing host: {raw}")))?
        .to_ascii_lowercase();

    let mut out = format!("{scheme}://{host}");
    if let Some(port) = uri.port_u16() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    let path = uri.path();
    if path.is_empty() {
        out.push('/');
    } else {
        out.push_str(path);
    }
    if let Some(query) = uri.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    Ok(out)
}

/// Parse a query string into key/value pairs.
///
/// Key-only parameters map to an empty value.
fn query_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect()
}

/// Derive the 32-bit fingerprint for a normalized URI + optional body.
///
/// The identity text concatenates scheme, host, path, the query pairs in
/// sorted order, the fragment, and the base64 body. The digest is folded to
/// 32 bits and the port is added on top so a request with no other identity
/// text still hashes non-zero.
pub fn fingerprint(normalized_uri: &str, body: Option<&[u8]>) -> CommsResult<u32> {
    let (without_fragment, fragment) = match normalized_uri.split_once('#') {
        Some((u, f)) => (u, Some(f)),
        None => (normalized_uri, None),
    };
    let uri: Uri = without_fragment
        .parse()
        .map_err(|e| CommsError::Protocol(format!("invalid URI {normalized_uri}: {e}")))?;

    let mut text = String::new();
    if let Some(scheme) = uri.scheme_str() {
        text.push_str(scheme);
        text.push('|');
    }
    if let Some(host) = uri.host() {
        text.push_str(host);
        text.push('|');
    }
    text.push_str(uri.path());

    if let Some(query) = uri.query() {
        let mut pairs = query_pairs(query);
        pairs.sort();
        for (key, value) in pairs {
            text.push('|');
            text.push_str(&key);
            text.push('=');
            text.push_str(&value);
        }
    }
    if let Some(fragment) = fragment {
        text.push('|');
        text.push_str(fragment);
    }
    if let Some(body) = body {
        text.push('|');
        text.push_str(&BASE64.encode(body));
    }

    let digest = Sha256::digest(text.as_bytes());
    let folded = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);

    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });
    Ok(folded.wrapping_add(u32::from(port)))
}
