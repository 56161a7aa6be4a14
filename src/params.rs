// ABOUTME: Table-driven validation of transformation query parameters
// ABOUTME: Bad values are dropped one by one and never fail the request

use crate::descriptor::{ImageFormat, TransformDescriptor};
use tracing::debug;
use url::form_urlencoded;

/// Quality values above this are clamped, not dropped
pub const MAX_QUALITY: u8 = 100;

/// Why a parameter value was left out of the descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnsupportedFormat,
    NotAnInteger,
    NotPositive,
    OutOfRange,
}

/// Result of applying one parameter to a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamOutcome {
    Parsed,
    Clamped,
    Dropped(DropReason),
}

/// One recognized query parameter and how to apply it
pub struct ParamRule {
    pub name: &'static str,
    pub apply: fn(&str, &mut TransformDescriptor) -> ParamOutcome,
}

/// Every parameter the edge understands. Add an operation by adding a row.
pub const PARAM_RULES: &[ParamRule] = &[
    ParamRule {
        name: "format",
        apply: apply_format,
    },
    ParamRule {
        name: "quality",
        apply: apply_quality,
    },
    ParamRule {
        name: "width",
        apply: apply_width,
    },
    ParamRule {
        name: "height",
        apply: apply_height,
    },
];

/// Look up a rule by parameter name, ignoring ASCII case
pub fn find_rule(name: &str) -> Option<(usize, &'static ParamRule)> {
    PARAM_RULES
        .iter()
        .enumerate()
        .find(|(_, rule)| rule.name.eq_ignore_ascii_case(name.trim()))
}

/// Build a descriptor from raw `(name, value)` pairs.
///
/// Unknown names are ignored. When a name repeats, its last value wins and is
/// validated on its own, so the outcome never depends on pair order beyond that.
pub fn validate_params<I, K, V>(pairs: I) -> TransformDescriptor
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut latest: Vec<Option<String>> = vec![None; PARAM_RULES.len()];
    for (name, value) in pairs {
        if let Some((index, _)) = find_rule(name.as_ref()) {
            latest[index] = Some(value.as_ref().to_string());
        }
    }

    let mut descriptor = TransformDescriptor::default();
    for (rule, value) in PARAM_RULES.iter().zip(latest) {
        let Some(value) = value else { continue };
        match (rule.apply)(&value, &mut descriptor) {
            ParamOutcome::Dropped(reason) => {
                debug!(param = rule.name, value = %value, ?reason, "Dropping parameter");
            }
            ParamOutcome::Clamped => {
                debug!(param = rule.name, value = %value, "Clamped parameter");
            }
            ParamOutcome::Parsed => {}
        }
    }
    descriptor
}

/// Build a descriptor from a raw (still percent-encoded) query string
pub fn validate_query(query: &str) -> TransformDescriptor {
    validate_params(form_urlencoded::parse(query.as_bytes()))
}

fn apply_format(raw: &str, d: &mut TransformDescriptor) -> ParamOutcome {
    match ImageFormat::parse(raw) {
        Some(format) => {
            d.format = Some(format);
            ParamOutcome::Parsed
        }
        None => ParamOutcome::Dropped(DropReason::UnsupportedFormat),
    }
}

fn apply_quality(raw: &str, d: &mut TransformDescriptor) -> ParamOutcome {
    let value = match parse_positive(raw) {
        Ok(v) => v,
        Err(reason) => return ParamOutcome::Dropped(reason),
    };
    if value > i64::from(MAX_QUALITY) {
        d.quality = Some(MAX_QUALITY);
        ParamOutcome::Clamped
    } else {
        d.quality = Some(value as u8);
        ParamOutcome::Parsed
    }
}

fn apply_width(raw: &str, d: &mut TransformDescriptor) -> ParamOutcome {
    match parse_dimension(raw) {
        Ok(v) => {
            d.width = Some(v);
            ParamOutcome::Parsed
        }
        Err(reason) => ParamOutcome::Dropped(reason),
    }
}

fn apply_height(raw: &str, d: &mut TransformDescriptor) -> ParamOutcome {
    match parse_dimension(raw) {
        Ok(v) => {
            d.height = Some(v);
            ParamOutcome::Parsed
        }
        Err(reason) => ParamOutcome::Dropped(reason),
    }
}

fn parse_positive(raw: &str) -> Result<i64, DropReason> {
    let raw = raw.trim();
    let value: i64 = match raw.parse() {
        Ok(value) => value,
        // Too many digits for i64: still an integer, just beyond every limit
        Err(_) if is_digits(raw.strip_prefix('+').unwrap_or(raw)) => i64::MAX,
        Err(_) if raw.strip_prefix('-').is_some_and(is_digits) => return Err(DropReason::NotPositive),
        Err(_) => return Err(DropReason::NotAnInteger),
    };
    if value <= 0 {
        return Err(DropReason::NotPositive);
    }
    Ok(value)
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_dimension(raw: &str) -> Result<u32, DropReason> {
    let value = parse_positive(raw)?;
    u32::try_from(value).map_err(|_| DropReason::OutOfRange)
}
