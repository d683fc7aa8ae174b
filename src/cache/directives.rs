//! Parsing of cache, redirect, and retry directives out of a response.

use http::Uri;
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;

use crate::core::response::Response;

/// The directives a response carries for the scheduler: freshness grants,
/// validator, redirect target, and retry hint.
#[derive(Debug, Clone, Default)]
pub struct ResponseDirectives {
    /// From `Cache-Control: max-age`, in milliseconds.
    pub ttl_ms: Option<u64>,
    /// From `Cache-Control: max-stale`, in milliseconds.
    pub max_stale_ms: Option<u64>,
    /// `no-cache` suppresses writeback regardless of cache behavior.
    pub no_cache: bool,
    /// First `ETag` value, verbatim.
    pub etag: Option<String>,
    /// First `Location` value, verbatim (resolve with [`resolve_location`]).
    pub location: Option<String>,
    /// From `Retry-After`, in milliseconds. HTTP-dates in the past clamp
    /// to zero (retry immediately).
    pub retry_after_ms: Option<u64>,
}

impl ResponseDirectives {
    pub fn parse(response: &Response) -> Self {
        let mut directives = Self::default();

        for header in response.header_values("cache-control") {
            for part in header.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                match part.split_once('=') {
                    Some((key, value)) => {
                        let value = value.trim().trim_matches('"');
                        match key.trim().to_ascii_lowercase().as_str() {
                            "max-age" => {
                                directives.ttl_ms = value
                                    .parse::<u64>()
                                    .ok()
                                    .map(|secs| secs.saturating_mul(1_000));
                            }
                            "max-stale" => {
                                directives.max_stale_ms = value
                                    .parse::<u64>()
                                    .ok()
                                    .map(|secs| secs.saturating_mul(1_000));
                            }
                            _ => {}
                        }
                    }
                    None => {
                        if part.eq_ignore_ascii_case("no-cache") {
                            directives.no_cache = true;
                        }
                    }
                }
            }
        }

        directives.etag = response.header("etag").map(str::to_string);
        directives.location = response.header("location").map(str::to_string);
        directives.retry_after_ms = response
            .header("retry-after")
            .and_then(|value| parse_retry_after(value, crate::core::epoch_ms()));

        directives
    }

    /// Resolve the `Location` directive against the URI the request was
    /// answered from. Relative locations (leading `/`) are rewritten as
    /// absolute by composing the request scheme and host with the location
    /// path, the request query, and the location fragment. Absolute
    /// locations are returned as-is.
    pub fn resolve_location(&self, current_uri: &str) -> Option<String> {
        let location = self.location.as_deref()?;
        if !location.starts_with('/') || location.starts_with("//") {
            return Some(location.to_string());
        }

        let (without_fragment, _) = match current_uri.split_once('#') {
            Some((u, f)) => (u, Some(f)),
            None => (current_uri, None),
        };
        let uri: Uri = match without_fragment.parse() {
            Ok(uri) => uri,
            Err(e) => {
                log::warn!("Cannot resolve relative Location against {current_uri}: {e}");
                return None;
            }
        };
        let scheme = uri.scheme_str()?;
        let host = uri.host()?;

        let (location_path, location_fragment) = match location.split_once('#') {
            Some((p, f)) => (p, Some(f)),
            None => (location, None),
        };

        let mut target = format!("{scheme}://{host}");
        if let Some(port) = uri.port_u16() {
            target.push(':');
            target.push_str(&port.to_string());
        }
        target.push_str(location_path);
        if let Some(query) = uri.query() {
            target.push('?');
            target.push_str(query);
        }
        if let Some(fragment) = location_fragment {
            target.push('#');
            target.push_str(fragment);
        }
        Some(target)
    }
}

/// `Retry-After` is either integer seconds or an RFC-1123 HTTP-date; a date
/// already in the past means "retry immediately".
fn parse_retry_after(value: &str, now_ms: u64) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds.saturating_mul(1_000));
    }
    let date = OffsetDateTime::parse(value, &Rfc2822).ok()?;
    let target_ms = date.unix_timestamp_nanos() / 1_000_000;
    let delta = target_ms - now_ms as i128;
    if delta <= 0 {
        Some(0)
    } else {
        Some(delta as u64)
    }
}
