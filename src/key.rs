// ABOUTME: Canonical cache key construction and decomposition
// ABOUTME: `<path>/<name=value,...>` in fixed order, or `<path>/original`

use crate::descriptor::{ImageFormat, TransformDescriptor};
use crate::params::validate_params;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fmt;
use thiserror::Error;
use url::form_urlencoded;

/// Final path segment of a key that requests the unmodified asset
pub const ORIGINAL_SENTINEL: &str = "original";

/// Bytes escaped in one segment of an object URL path
const OBJECT_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'=')
    .remove(b',');

/// Why a path could not be read back as a canonical key
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key has no original asset path")]
    MissingPath,

    #[error("key has no variant segment")]
    MissingVariant,

    #[error("variant segment `{0}` is not in canonical form")]
    NotCanonical(String),

    #[error("variant segment requests an unresolved auto format")]
    UnresolvedAuto,

    #[error("path is not valid percent-encoded UTF-8")]
    BadEncoding,
}

/// Deterministic key for one image variant, used for both edge cache and
/// persistent store lookups
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    /// Build the key for `descriptor` applied to the asset at `path`
    pub fn build(path: &str, descriptor: &TransformDescriptor) -> Self {
        let variant = token_list(descriptor).unwrap_or_else(|| ORIGINAL_SENTINEL.to_string());
        CanonicalKey(format!("{}/{}", path, variant))
    }

    /// Read a request path as a key, accepting only canonical forms.
    ///
    /// Anything `build` could not have produced is rejected, including token
    /// lists out of order, unknown names, out-of-range values and `auto`.
    /// The path stays percent-encoded but must decode to UTF-8.
    pub fn parse(path: &str) -> Result<Self, KeyError> {
        let key = CanonicalKey(path.to_string());
        key.decompose()?;
        key.object_name()?;
        Ok(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Object name in the persistent store: percent-decoded, no leading slash
    pub fn object_name(&self) -> Result<String, KeyError> {
        decode(self.0.trim_start_matches('/'))
    }

    /// Object name of the original asset behind this key
    pub fn source_object_name(&self) -> Result<String, KeyError> {
        let (path, _) = self.decompose()?;
        decode(path.trim_start_matches('/'))
    }

    /// `object_name` re-encoded segment by segment for use in a URL path, so
    /// a store that decodes the path sees exactly the name it was written as
    pub fn object_url_path(&self) -> Result<String, KeyError> {
        let name = self.object_name()?;
        let segments: Vec<String> = name
            .split('/')
            .map(|segment| utf8_percent_encode(segment, OBJECT_SEGMENT).to_string())
            .collect();
        Ok(segments.join("/"))
    }

    pub fn is_original(&self) -> bool {
        self.variant_segment() == Some(ORIGINAL_SENTINEL)
    }

    /// Split back into the original asset path and its descriptor
    pub fn decompose(&self) -> Result<(&str, TransformDescriptor), KeyError> {
        let (path, variant) = self.0.rsplit_once('/').ok_or(KeyError::MissingPath)?;
        if path.is_empty() || path == "/" {
            return Err(KeyError::MissingPath);
        }
        if variant.is_empty() {
            return Err(KeyError::MissingVariant);
        }
        if variant == ORIGINAL_SENTINEL {
            return Ok((path, TransformDescriptor::default()));
        }

        let pairs = variant
            .split(',')
            .map(|token| token.split_once('=').unwrap_or((token, "")));
        let descriptor = validate_params(pairs);

        if descriptor.wants_auto_format() {
            return Err(KeyError::UnresolvedAuto);
        }
        if token_list(&descriptor).as_deref() != Some(variant) {
            return Err(KeyError::NotCanonical(variant.to_string()));
        }
        Ok((path, descriptor))
    }

    /// Public URL that re-enters the edge for this variant:
    /// the original path with the tokens as query parameters
    pub fn redirect_target(&self) -> Result<String, KeyError> {
        let (path, descriptor) = self.decompose()?;
        let pairs = tokens(&descriptor);
        if pairs.is_empty() {
            return Ok(path.to_string());
        }
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        Ok(format!("{}?{}", path, query))
    }

    fn variant_segment(&self) -> Option<&str> {
        self.0.rsplit_once('/').map(|(_, variant)| variant)
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn decode(raw: &str) -> Result<String, KeyError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|name| name.into_owned())
        .map_err(|_| KeyError::BadEncoding)
}

/// Comma-joined `name=value` tokens, or `None` for an empty descriptor
pub fn token_list(descriptor: &TransformDescriptor) -> Option<String> {
    let tokens: Vec<String> = tokens(descriptor)
        .into_iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(","))
    }
}

// Order: format, quality, width, height.
fn tokens(d: &TransformDescriptor) -> Vec<(&'static str, String)> {
    let mut out = Vec::with_capacity(4);
    if let Some(format) = d.format {
        out.push(("format", format.as_str().to_string()));
    }
    if let Some(quality) = d.quality {
        out.push(("quality", quality.to_string()));
    }
    if let Some(width) = d.width {
        out.push(("width", width.to_string()));
    }
    if let Some(height) = d.height {
        out.push(("height", height.to_string()));
    }
    out
}
