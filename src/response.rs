// ABOUTME: Response stamping at the edge: cache lifetime, Vary, marker and CORS headers
// ABOUTME: Generic over the response type so the same rules run natively and on Fastly

use crate::config::EdgeConfig;
use crate::fallback::OriginResponse;
use http::header::{CACHE_CONTROL, VARY};
use http::{HeaderName, HeaderValue, StatusCode};

/// Header identifying responses produced by this pipeline
pub const MARKER_HEADER: &str = "x-image-edge";
pub const PROTOCOL_VERSION: &str = "v1.0";

const PREFLIGHT_MAX_AGE: u32 = 86400;

/// Storage-internal header prefixes never forwarded to clients
const INTERNAL_HEADER_PREFIXES: &[&str] = &["x-goog-", "x-guploader-"];

/// Header access over a concrete response type
pub trait ResponseHeaders: OriginResponse {
    fn header_str(&self, name: &str) -> Option<String>;
    fn set_header_str(&mut self, name: &str, value: &str);
    fn remove_header(&mut self, name: &str);
    fn header_names(&self) -> Vec<String>;
}

impl<B> ResponseHeaders for http::Response<B> {
    fn header_str(&self, name: &str) -> Option<String> {
        self.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn set_header_str(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            self.headers_mut().insert(name, value);
        }
    }

    fn remove_header(&mut self, name: &str) {
        self.headers_mut().remove(name);
    }

    fn header_names(&self) -> Vec<String> {
        self.headers().keys().map(|k| k.as_str().to_string()).collect()
    }
}

/// Lifetime in seconds from a `Cache-Control` value. `s-maxage` wins over
/// `max-age` since it targets shared caches.
pub fn parse_max_age(cache_control: &str) -> Option<u32> {
    let mut max_age = None;
    let mut s_maxage = None;
    for directive in cache_control.split(',') {
        let Some((name, value)) = directive.trim().split_once('=') else {
            continue;
        };
        let seconds = value
            .trim()
            .trim_matches('"')
            .parse::<u64>()
            .ok()
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX));
        match name.trim().to_ascii_lowercase().as_str() {
            "s-maxage" => s_maxage = seconds,
            "max-age" => max_age = seconds,
            _ => {}
        }
    }
    s_maxage.or(max_age)
}

/// Apply the edge's response rules to a routed response.
///
/// Success: `public, max-age=<ttl>` with the origin lifetime clamped to the
/// configured bounds. Redirects keep the origin's `Cache-Control` (the compute
/// engine marks them `private, no-store`). Everything else is `no-store`.
pub fn stamp_response<R: ResponseHeaders>(resp: &mut R, config: &EdgeConfig, negotiated: bool) {
    let status = resp.status();
    let cache_control = resp.header_str(CACHE_CONTROL.as_str());

    if status.is_success() {
        let ttl = config
            .edge_ttl
            .clamp(cache_control.as_deref().and_then(parse_max_age));
        resp.set_header_str(CACHE_CONTROL.as_str(), &format!("public, max-age={}", ttl));
    } else if status.is_redirection() && status != StatusCode::NOT_MODIFIED {
        if cache_control.is_none() {
            resp.set_header_str(CACHE_CONTROL.as_str(), "private, no-store");
        }
    } else if status != StatusCode::NOT_MODIFIED {
        resp.set_header_str(CACHE_CONTROL.as_str(), "no-store");
    }

    if negotiated {
        add_vary_accept(resp);
    }

    strip_internal_headers(resp);
    resp.set_header_str(MARKER_HEADER, PROTOCOL_VERSION);
    if config.cors_enabled {
        add_cors_headers(resp);
    }
}

/// Merge `Accept` into any existing `Vary`
pub fn add_vary_accept<R: ResponseHeaders>(resp: &mut R) {
    match resp.header_str(VARY.as_str()) {
        None => resp.set_header_str(VARY.as_str(), "Accept"),
        Some(existing) => {
            let covered = existing
                .split(',')
                .map(str::trim)
                .any(|v| v == "*" || v.eq_ignore_ascii_case("accept"));
            if !covered {
                resp.set_header_str(VARY.as_str(), &format!("{}, Accept", existing));
            }
        }
    }
}

fn strip_internal_headers<R: ResponseHeaders>(resp: &mut R) {
    for name in resp.header_names() {
        let lower = name.to_ascii_lowercase();
        if INTERNAL_HEADER_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            resp.remove_header(&name);
        }
    }
}

pub fn add_cors_headers<R: ResponseHeaders>(resp: &mut R) {
    resp.set_header_str("access-control-allow-origin", "*");
    resp.set_header_str("access-control-allow-methods", "GET, HEAD, OPTIONS");
    resp.set_header_str("access-control-allow-headers", "Accept, Content-Type");
    resp.set_header_str(
        "access-control-expose-headers",
        "Content-Length, ETag, X-Image-Edge",
    );
}

/// Headers for a `204` answer to an `OPTIONS` preflight
pub fn cors_preflight_headers<R: ResponseHeaders>(resp: &mut R) {
    add_cors_headers(resp);
    resp.set_header_str("access-control-max-age", &PREFLIGHT_MAX_AGE.to_string());
    resp.set_header_str(MARKER_HEADER, PROTOCOL_VERSION);
}
