// ABOUTME: Transformation descriptor and output format types
// ABOUTME: The validated, strongly typed form of one image variant request

use std::fmt;

/// Output formats a request may ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Jpeg,
    Webp,
    Avif,
    Png,
    /// Resolved against the client's `Accept` header before keying
    Auto,
}

impl ImageFormat {
    /// Parse a `format` value. Case-insensitive; anything unsupported is `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jpeg" => Some(ImageFormat::Jpeg),
            "webp" => Some(ImageFormat::Webp),
            "avif" => Some(ImageFormat::Avif),
            "png" => Some(ImageFormat::Png),
            "auto" => Some(ImageFormat::Auto),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Webp => "webp",
            ImageFormat::Avif => "avif",
            ImageFormat::Png => "png",
            ImageFormat::Auto => "auto",
        }
    }

    /// MIME type of a concrete format
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            ImageFormat::Jpeg => Some("image/jpeg"),
            ImageFormat::Webp => Some("image/webp"),
            ImageFormat::Avif => Some("image/avif"),
            ImageFormat::Png => Some("image/png"),
            ImageFormat::Auto => None,
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, ImageFormat::Auto)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated transformation parameters for one image variant.
///
/// Every field is optional. When present, `width` and `height` are strictly
/// positive and `quality` lies in `1..=100`; the parameter validator is the
/// only producer that guarantees this.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TransformDescriptor {
    pub format: Option<ImageFormat>,
    pub quality: Option<u8>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl TransformDescriptor {
    /// No transformation requested: the unmodified asset
    pub fn is_empty(&self) -> bool {
        self.format.is_none() && self.quality.is_none() && self.width.is_none() && self.height.is_none()
    }

    pub fn wants_auto_format(&self) -> bool {
        self.format.is_some_and(|f| f.is_auto())
    }
}
