// ABOUTME: Content negotiation for `format=auto` requests
// ABOUTME: Picks avif, then webp, then jpeg from the client's Accept header

use crate::descriptor::{ImageFormat, TransformDescriptor};
use crate::error::ConfigError;

/// Format served when the client advertises neither avif nor webp
pub const DEFAULT_FORMAT: ImageFormat = ImageFormat::Jpeg;

/// When a request is treated as asking for automatic format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoFormatPolicy {
    /// Only a literal `format=auto` negotiates. A missing `format` keeps the
    /// source format.
    #[default]
    ExplicitAuto,
    /// A missing `format` negotiates too
    AbsentOrAuto,
}

impl AutoFormatPolicy {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "explicit" => Ok(AutoFormatPolicy::ExplicitAuto),
            "absent-or-auto" => Ok(AutoFormatPolicy::AbsentOrAuto),
            other => Err(ConfigError::Invalid {
                key: "auto_format_policy",
                reason: format!("expected `explicit` or `absent-or-auto`, got `{}`", other),
            }),
        }
    }

    fn applies_to(&self, descriptor: &TransformDescriptor) -> bool {
        match self {
            AutoFormatPolicy::ExplicitAuto => descriptor.wants_auto_format(),
            AutoFormatPolicy::AbsentOrAuto => {
                descriptor.format.is_none() || descriptor.wants_auto_format()
            }
        }
    }
}

/// Pick a concrete output format from an `Accept` header value
pub fn negotiate_format(accept: Option<&str>) -> ImageFormat {
    let Some(accept) = accept else {
        return DEFAULT_FORMAT;
    };
    if accepts(accept, "image/avif") {
        ImageFormat::Avif
    } else if accepts(accept, "image/webp") {
        ImageFormat::Webp
    } else {
        DEFAULT_FORMAT
    }
}

/// Replace an automatic format request with a concrete one.
///
/// Returns `true` when negotiation ran, meaning the response must vary on
/// `Accept`. A concrete format is left untouched.
pub fn resolve_format(
    descriptor: &mut TransformDescriptor,
    accept: Option<&str>,
    policy: AutoFormatPolicy,
) -> bool {
    if !policy.applies_to(descriptor) {
        return false;
    }
    descriptor.format = Some(negotiate_format(accept));
    true
}

/// True when `media_type` appears in the Accept list without `q=0`
fn accepts(accept: &str, media_type: &str) -> bool {
    accept.split(',').any(|range| {
        let mut parts = range.split(';');
        let ty = parts.next().unwrap_or("").trim();
        if !ty.eq_ignore_ascii_case(media_type) {
            return false;
        }
        !parts.any(|param| {
            let param = param.trim();
            param
                .strip_prefix("q=")
                .or_else(|| param.strip_prefix("Q="))
                .and_then(|q| q.trim().parse::<f32>().ok())
                .is_some_and(|q| q <= 0.0)
        })
    })
}
