// ABOUTME: Per-request normalization at the edge, before any cache lookup
// ABOUTME: Validates, negotiates and keys the request; the key is the rewritten path

use crate::descriptor::TransformDescriptor;
use crate::key::CanonicalKey;
use crate::negotiate::{resolve_format, AutoFormatPolicy};
use crate::params::validate_query;

/// The parts of an inbound request the normalizer reads
#[derive(Debug, Clone, Copy)]
pub struct RawRequest<'a> {
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub accept: Option<&'a str>,
}

impl<'a> RawRequest<'a> {
    pub fn new(path: &'a str, query: Option<&'a str>, accept: Option<&'a str>) -> Self {
        Self {
            path,
            query,
            accept,
        }
    }

    /// Split a request target like `/cat.png?width=300` into path and query
    pub fn from_target(target: &'a str, accept: Option<&'a str>) -> Self {
        match target.split_once('?') {
            Some((path, query)) => Self::new(path, Some(query), accept),
            None => Self::new(target, None, accept),
        }
    }
}

/// Outcome of normalization: the key every downstream lookup uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRequest {
    pub key: CanonicalKey,
    pub descriptor: TransformDescriptor,
    /// Format was picked from `Accept`; responses must vary on it
    pub negotiated: bool,
}

impl NormalizedRequest {
    /// Rewritten request path. The query is always empty after normalization.
    pub fn path(&self) -> &str {
        self.key.as_str()
    }
}

/// Validate, negotiate and key one request. Pure: no I/O, no shared state.
pub fn normalize(raw: &RawRequest<'_>, policy: AutoFormatPolicy) -> NormalizedRequest {
    let mut descriptor = raw.query.map(validate_query).unwrap_or_default();
    let negotiated = resolve_format(&mut descriptor, raw.accept, policy);
    let key = CanonicalKey::build(raw.path, &descriptor);

    NormalizedRequest {
        key,
        descriptor,
        negotiated,
    }
}
