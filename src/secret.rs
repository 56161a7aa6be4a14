// ABOUTME: Shared-secret contract between the edge and the compute engine
// ABOUTME: The edge attaches the header; the compute engine verifies it

use crate::error::ConfigError;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::fmt;

/// Header carrying the secret when a deployment does not override it
pub const DEFAULT_SECRET_HEADER: &str = "x-origin-secret";

/// Deployment-wide token proving a compute call came through the edge
#[derive(Clone)]
pub struct SharedSecret {
    header: HeaderName,
    value: HeaderValue,
}

/// Why a compute call was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    Missing,
    Mismatch,
}

impl AuthFailure {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthFailure::Missing => StatusCode::UNAUTHORIZED,
            AuthFailure::Mismatch => StatusCode::FORBIDDEN,
        }
    }
}

impl SharedSecret {
    pub fn new(header: &str, value: &str) -> Result<Self, ConfigError> {
        let header = HeaderName::try_from(header.trim()).map_err(|e| ConfigError::Invalid {
            key: "secret_header",
            reason: e.to_string(),
        })?;
        let value = value.trim();
        if value.is_empty() {
            return Err(ConfigError::Missing("origin_secret"));
        }
        let mut value = HeaderValue::try_from(value).map_err(|e| ConfigError::Invalid {
            key: "origin_secret",
            reason: e.to_string(),
        })?;
        value.set_sensitive(true);
        Ok(Self { header, value })
    }

    pub fn header_name(&self) -> &HeaderName {
        &self.header
    }

    pub fn header_value(&self) -> &HeaderValue {
        &self.value
    }

    /// Add the secret header to an outgoing fallback request
    pub fn attach(&self, headers: &mut HeaderMap) {
        headers.insert(self.header.clone(), self.value.clone());
    }

    /// Check an incoming compute request
    pub fn verify(&self, headers: &HeaderMap) -> Result<(), AuthFailure> {
        let provided = headers.get(&self.header).ok_or(AuthFailure::Missing)?;
        if constant_time_eq(provided.as_bytes(), self.value.as_bytes()) {
            Ok(())
        } else {
            Err(AuthFailure::Mismatch)
        }
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecret")
            .field("header", &self.header)
            .field("value", &"<redacted>")
            .finish()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
