// ABOUTME: Tiered-origin routing: persistent store first, compute engine on miss
// ABOUTME: One primary attempt, at most one authenticated fallback attempt

use crate::error::{ConfigError, EdgeError, Result};
use crate::key::CanonicalKey;
use crate::normalize::NormalizedRequest;
use crate::secret::SharedSecret;
use http::{HeaderMap, StatusCode};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Primary statuses that send a request to the compute engine by default.
/// GCS and S3 answer 403 for missing objects when listing is not allowed.
pub const DEFAULT_FALLBACK_STATUSES: &[u16] = &[403, 404, 500, 502, 503, 504];

/// Object metadata the compute engine writes with every stored variant:
/// expiry as Unix seconds, surfaced by GCS as a response header
pub const EXPIRES_AT_HEADER: &str = "x-goog-meta-expires-at";

/// Anything an origin hands back that the router can inspect
pub trait OriginResponse {
    fn status(&self) -> StatusCode;

    /// When a stored variant stops being valid, in Unix seconds
    fn expires_at(&self) -> Option<u64> {
        None
    }
}

impl<B> OriginResponse for http::Response<B> {
    fn status(&self) -> StatusCode {
        http::Response::status(self)
    }

    fn expires_at(&self) -> Option<u64> {
        self.headers()
            .get(EXPIRES_AT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_expires_at)
    }
}

pub fn parse_expires_at(value: &str) -> Option<u64> {
    value.trim().parse().ok()
}

/// Transport-level origin failure (no response at all)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OriginError {
    #[error("origin timed out: {0}")]
    Timeout(String),

    #[error("origin unreachable: {0}")]
    Transport(String),
}

/// A single request to an origin, addressed by canonical key
#[derive(Debug)]
pub struct OriginRequest<'a> {
    pub key: &'a CanonicalKey,
    pub headers: HeaderMap,
}

/// One tier behind the edge cache
pub trait Origin {
    type Response: OriginResponse;

    fn name(&self) -> &str;

    fn fetch(&self, request: OriginRequest<'_>) -> std::result::Result<Self::Response, OriginError>;
}

/// Which primary statuses trigger the fallback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackPolicy {
    statuses: BTreeSet<u16>,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_STATUSES.iter().copied())
    }
}

impl FallbackPolicy {
    pub fn new(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
        }
    }

    /// Parse a comma-separated status list such as `403,404,500`
    pub fn parse(list: &str) -> std::result::Result<Self, ConfigError> {
        let mut statuses = BTreeSet::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let status = StatusCode::from_bytes(item.as_bytes()).map_err(|_| ConfigError::Invalid {
                key: "fallback_statuses",
                reason: format!("`{}` is not an HTTP status code", item),
            })?;
            statuses.insert(status.as_u16());
        }
        if statuses.is_empty() {
            return Err(ConfigError::Invalid {
                key: "fallback_statuses",
                reason: "at least one status is required".into(),
            });
        }
        Ok(Self { statuses })
    }

    pub fn triggers(&self, status: StatusCode) -> bool {
        self.statuses.contains(&status.as_u16())
    }
}

/// Request lifecycle at the edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Normalized,
    PrimaryLookup,
    Found,
    Miss,
    FallbackCompute,
    StoreAndServe,
    Serve,
    Redirect,
    Error,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Serve | RequestState::Redirect | RequestState::Error)
    }

    /// Where a compute engine response leads
    fn after_compute(status: StatusCode) -> &'static [RequestState] {
        if status.is_success() {
            &[RequestState::StoreAndServe, RequestState::Serve]
        } else if status.is_redirection() {
            &[RequestState::Redirect]
        } else {
            &[RequestState::Error]
        }
    }
}

/// Which tier produced the response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedBy {
    Primary,
    Compute,
}

/// A routed response with the states it went through
#[derive(Debug)]
pub struct Routed<R> {
    pub response: R,
    pub source: ServedBy,
    pub trace: Vec<RequestState>,
}

impl<R> Routed<R> {
    pub fn terminal(&self) -> Option<RequestState> {
        self.trace.last().copied().filter(RequestState::is_terminal)
    }
}

/// Primary-then-fallback router. Not a retry loop: each request makes at most
/// one primary attempt and at most one compute attempt.
pub struct FallbackRouter<'a, P, F> {
    primary: Option<P>,
    compute: F,
    policy: &'a FallbackPolicy,
    secret: &'a SharedSecret,
    now: SystemTime,
}

impl<'a, P, F> FallbackRouter<'a, P, F>
where
    P: Origin,
    F: Origin<Response = P::Response>,
{
    pub fn new(primary: Option<P>, compute: F, policy: &'a FallbackPolicy, secret: &'a SharedSecret) -> Self {
        Self {
            primary,
            compute,
            policy,
            secret,
            now: SystemTime::now(),
        }
    }

    /// Judge stored-variant expiry against `now` instead of the wall clock
    pub fn with_clock(mut self, now: SystemTime) -> Self {
        self.now = now;
        self
    }

    fn is_expired(&self, resp: &P::Response) -> bool {
        let now = self
            .now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        resp.status().is_success() && resp.expires_at().is_some_and(|at| at <= now)
    }

    pub fn route(&self, normalized: &NormalizedRequest) -> Result<Routed<P::Response>> {
        let key = &normalized.key;
        let mut trace = vec![RequestState::Received, RequestState::Normalized];

        if let Some(primary) = &self.primary {
            trace.push(RequestState::PrimaryLookup);
            let request = OriginRequest {
                key,
                headers: HeaderMap::new(),
            };
            match primary.fetch(request) {
                Ok(resp) if self.is_expired(&resp) => {
                    debug!(key = %key, expires_at = ?resp.expires_at(), "Stored variant expired");
                }
                Ok(resp) if !self.policy.triggers(resp.status()) => {
                    trace.extend([RequestState::Found, RequestState::Serve]);
                    debug!(key = %key, status = %resp.status(), origin = primary.name(), "Primary hit");
                    return Ok(Routed {
                        response: resp,
                        source: ServedBy::Primary,
                        trace,
                    });
                }
                Ok(resp) => {
                    debug!(key = %key, status = %resp.status(), "Primary miss");
                }
                Err(e) if self.policy.triggers(StatusCode::BAD_GATEWAY) => {
                    warn!(key = %key, error = %e, "Primary unreachable, falling back");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Primary unreachable");
                    return Err(EdgeError::Upstream("Image store unavailable".into()));
                }
            }
            trace.push(RequestState::Miss);
        }

        trace.push(RequestState::FallbackCompute);
        let mut headers = HeaderMap::new();
        self.secret.attach(&mut headers);
        let request = OriginRequest { key, headers };

        match self.compute.fetch(request) {
            Ok(resp) => {
                let status = resp.status();
                trace.extend_from_slice(RequestState::after_compute(status));
                info!(key = %key, status = %status, origin = self.compute.name(), "Compute engine answered");
                Ok(Routed {
                    response: resp,
                    source: ServedBy::Compute,
                    trace,
                })
            }
            Err(OriginError::Timeout(msg)) => {
                warn!(key = %key, error = %msg, "Compute engine timed out");
                Err(EdgeError::GatewayTimeout("Image transformation timed out".into()))
            }
            Err(OriginError::Transport(msg)) => {
                warn!(key = %key, error = %msg, "Compute engine unreachable");
                Err(EdgeError::Upstream("Image transformation unavailable".into()))
            }
        }
    }
}
