// ABOUTME: Request canonicalization and tiered-origin fallback for on-demand image variants
// ABOUTME: Pure protocol logic shared by the Fastly edge and the Cloud Run compute engine

pub mod config;
pub mod descriptor;
pub mod error;
pub mod fallback;
pub mod key;
pub mod negotiate;
pub mod normalize;
pub mod params;
pub mod response;
pub mod secret;

pub use config::{EdgeConfig, TtlBounds};
pub use descriptor::{ImageFormat, TransformDescriptor};
pub use error::{ConfigError, EdgeError};
pub use fallback::{
    parse_expires_at, FallbackPolicy, FallbackRouter, Origin, OriginError, OriginRequest, OriginResponse, RequestState, Routed,
    ServedBy,
};
pub use key::{CanonicalKey, KeyError};
pub use negotiate::AutoFormatPolicy;
pub use normalize::{normalize, NormalizedRequest, RawRequest};
pub use response::{ResponseHeaders, MARKER_HEADER, PROTOCOL_VERSION};
pub use secret::{AuthFailure, SharedSecret, DEFAULT_SECRET_HEADER};
