//! Response model and its cache wire form.
//!
//! Responses are serialized for the cache as a length-prefixed JSON metadata
//! block followed by the raw body bytes as the tail, so older readers can
//! skip fields they do not understand and the body never round-trips through
//! a text encoding.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::{CommsError, CommsResult};

/// A fully-buffered HTTP response as seen by callers.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    /// Header names lower-cased; values keep their wire order.
    headers: HashMap<String, Vec<String>>,
    body: Bytes,
    request_id: u32,
    response_time_ms: u64,
    created_at: u64,
    from_cache: bool,
}

/// Parsed metadata block of the serialized form. Unknown fields are ignored
/// and missing ones default, so the format can grow without breaking old
/// entries.
#[derive(Serialize, Deserialize)]
struct ResponseMeta {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    headers: HashMap<String, Vec<String>>,
    #[serde(default)]
    request_id: u32,
    #[serde(default)]
    response_time_ms: u64,
    #[serde(default)]
    created_at: u64,
}

impl Response {
    pub fn new(
        status: u16,
        headers: HashMap<String, Vec<String>>,
        body: Bytes,
        request_id: u32,
        response_time_ms: u64,
    ) -> Self {
        let headers = headers
            .into_iter()
            .map(|(name, values)| (name.to_ascii_lowercase(), values))
            .collect();
        Self {
            status,
            headers,
            body,
            request_id,
            response_time_ms,
            created_at: crate::core::epoch_ms(),
            from_cache: false,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body decoded as UTF-8, with invalid sequences replaced.
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn response_time_ms(&self) -> u64 {
        self.response_time_ms
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub(crate) fn mark_from_cache(&mut self) {
        self.from_cache = true;
    }

    pub fn headers(&self) -> &HashMap<String, Vec<String>> {
        &self.headers
    }

    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values of a header, case-insensitive.
    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303)
    }

    /// Whether the response may be written back to the cache.
    pub fn is_cacheable_status(&self) -> bool {
        matches!(self.status, 200 | 201)
    }

    /// Serialize for cache storage: 4-byte big-endian metadata length, the
    /// JSON metadata block, then the raw body tail.
    pub fn serialize(&self) -> CommsResult<Vec<u8>> {
        let meta = ResponseMeta {
            status: self.status,
            headers: self.headers.clone(),
            request_id: self.request_id,
            response_time_ms: self.response_time_ms,
            created_at: self.created_at,
        };
        let header = serde_json::to_vec(&meta)?;
        let mut out = Vec::with_capacity(4 + header.len() + self.body.len());
        out.extend_from_slice(&(header.len() as u32).to_be_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Inverse of [`serialize`](Self::serialize). The result is not marked
    /// as cache-originated; the cache layer does that on read.
    pub fn deserialize(bytes: &[u8]) -> CommsResult<Self> {
        if bytes.len() < 4 {
            return Err(CommsError::Protocol(
                "serialized response shorter than its length prefix".to_string(),
            ));
        }
        let meta_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let body_start = 4usize.checked_add(meta_len).ok_or_else(|| {
            CommsError::Protocol("serialized response length overflow".to_string())
        })?;
        if bytes.len() < body_start {
            return Err(CommsError::Protocol(format!(
                "serialized response truncated: expected {} metadata bytes, have {}",
                meta_len,
                bytes.len() - 4
            )));
        }
        let meta: ResponseMeta = serde_json::from_slice(&bytes[4..body_start])?;
        Ok(Self {
            status: meta.status,
            headers: meta.headers,
            body: Bytes::copy_from_slice(&bytes[body_start..]),
            request_id: meta.request_id,
            response_time_ms: meta.response_time_ms,
            created_at: meta.created_at,
            from_cache: false,
        })
    }
}
