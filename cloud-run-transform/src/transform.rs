// ABOUTME: Pixel work for one variant: decode, orient, resize and re-encode
// ABOUTME: CPU-bound; callers run it on the blocking pool

use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageDecoder, ImageEncoder, ImageReader};
use image_edge::{ImageFormat, TransformDescriptor};
use std::io::Cursor;
use thiserror::Error;

/// Quality used when a lossy format is requested without one
pub const DEFAULT_QUALITY: u8 = 80;

/// Largest output the engine will allocate, in pixels
const MAX_OUTPUT_PIXELS: u64 = 100_000_000;

/// AVIF encoder speed (1 slowest .. 10 fastest)
const AVIF_SPEED: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("cannot decode source image: {0}")]
    Decode(String),

    #[error("cannot encode {format}: {reason}")]
    Encode { format: ImageFormat, reason: String },

    #[error("requested {width}x{height} output exceeds the pixel limit")]
    TooManyPixels { width: u32, height: u32 },
}

/// Encoded variant
#[derive(Debug, Clone)]
pub struct Rendered {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

/// Decode `source`, apply `descriptor` and encode the result.
///
/// Both dimensions crop to cover the box; one dimension keeps the aspect
/// ratio. Without a requested format the source format is kept (sources the
/// engine cannot write come out as PNG).
pub fn render(source: &[u8], descriptor: &TransformDescriptor) -> Result<Rendered, TransformError> {
    let (image, source_format) = decode(source)?;

    let (width, height) = target_dimensions(image.width(), image.height(), descriptor);
    if u64::from(width) * u64::from(height) > MAX_OUTPUT_PIXELS {
        return Err(TransformError::TooManyPixels { width, height });
    }

    let resized = match (descriptor.width, descriptor.height) {
        (Some(w), Some(h)) => image.resize_to_fill(w, h, FilterType::Lanczos3),
        (Some(w), None) => image.resize(w, u32::MAX, FilterType::Lanczos3),
        (None, Some(h)) => image.resize(u32::MAX, h, FilterType::Lanczos3),
        (None, None) => image,
    };

    let format = match descriptor.format {
        Some(f) if !f.is_auto() => f,
        _ => source_format,
    };
    let quality = descriptor.quality.unwrap_or(DEFAULT_QUALITY);
    let bytes = encode(&resized, format, quality)?;

    Ok(Rendered { bytes, format })
}

/// Output size for a source of `src_w` x `src_h`
pub fn target_dimensions(src_w: u32, src_h: u32, descriptor: &TransformDescriptor) -> (u32, u32) {
    let scale = |num: u32, value: u32, den: u32| -> u32 {
        let scaled = (u64::from(value) * u64::from(num) + u64::from(den) / 2) / u64::from(den.max(1));
        u32::try_from(scaled.max(1)).unwrap_or(u32::MAX)
    };
    match (descriptor.width, descriptor.height) {
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, scale(src_h, w, src_w)),
        (None, Some(h)) => (scale(src_w, h, src_h), h),
        (None, None) => (src_w, src_h),
    }
}

fn decode(source: &[u8]) -> Result<(DynamicImage, ImageFormat), TransformError> {
    let reader = ImageReader::new(Cursor::new(source))
        .with_guessed_format()
        .map_err(|e| TransformError::Decode(e.to_string()))?;

    let source_format = match reader.format() {
        Some(image::ImageFormat::Jpeg) => ImageFormat::Jpeg,
        Some(image::ImageFormat::WebP) => ImageFormat::Webp,
        Some(image::ImageFormat::Avif) => ImageFormat::Avif,
        Some(_) => ImageFormat::Png,
        None => return Err(TransformError::Decode("unrecognized image format".into())),
    };

    let mut decoder = reader
        .into_decoder()
        .map_err(|e| TransformError::Decode(e.to_string()))?;
    let orientation = decoder
        .orientation()
        .map_err(|e| TransformError::Decode(e.to_string()))?;
    let mut image = DynamicImage::from_decoder(decoder).map_err(|e| TransformError::Decode(e.to_string()))?;
    image.apply_orientation(orientation);

    Ok((image, source_format))
}

fn encode(image: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>, TransformError> {
    let (width, height) = (image.width(), image.height());
    let mut buf = Vec::new();

    let result = match format {
        ImageFormat::Jpeg => {
            let rgb = image.to_rgb8();
            JpegEncoder::new_with_quality(&mut buf, quality).write_image(
                rgb.as_raw(),
                width,
                height,
                ExtendedColorType::Rgb8,
            )
        }
        ImageFormat::Webp => {
            let rgba = image.to_rgba8();
            WebPEncoder::new_lossless(&mut buf).write_image(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)
        }
        ImageFormat::Avif => {
            let rgba = image.to_rgba8();
            AvifEncoder::new_with_speed_quality(&mut buf, AVIF_SPEED, quality).write_image(
                rgba.as_raw(),
                width,
                height,
                ExtendedColorType::Rgba8,
            )
        }
        ImageFormat::Png | ImageFormat::Auto => {
            let rgba = image.to_rgba8();
            PngEncoder::new(&mut buf).write_image(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)
        }
    };

    result.map_err(|e| TransformError::Encode {
        format,
        reason: e.to_string(),
    })?;
    Ok(buf)
}

#[cfg(test)]
pub(crate) fn fixture(width: u32, height: u32, format: image::ImageFormat) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| image::Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), format)
        .expect("Failed to encode fixture");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(format: Option<ImageFormat>, width: Option<u32>, height: Option<u32>) -> TransformDescriptor {
        TransformDescriptor {
            format,
            quality: None,
            width,
            height,
        }
    }

    fn dimensions(bytes: &[u8]) -> (u32, u32) {
        let img = image::load_from_memory(bytes).expect("output should decode");
        (img.width(), img.height())
    }

    #[test]
    fn test_cover_crop_with_both_dimensions() {
        let source = fixture(64, 32, image::ImageFormat::Png);
        let out = render(&source, &descriptor(None, Some(20), Some(20))).unwrap();
        assert_eq!(out.format, ImageFormat::Png);
        assert_eq!(dimensions(&out.bytes), (20, 20));
    }

    #[test]
    fn test_single_dimension_keeps_aspect() {
        let source = fixture(64, 32, image::ImageFormat::Png);
        let out = render(&source, &descriptor(None, Some(32), None)).unwrap();
        assert_eq!(dimensions(&out.bytes), (32, 16));

        let out = render(&source, &descriptor(None, None, Some(8))).unwrap();
        assert_eq!(dimensions(&out.bytes), (16, 8));
    }

    #[test]
    fn test_format_conversion() {
        let source = fixture(16, 16, image::ImageFormat::Png);

        let out = render(&source, &descriptor(Some(ImageFormat::Jpeg), None, None)).unwrap();
        assert_eq!(&out.bytes[..3], &[0xFF, 0xD8, 0xFF]);

        let out = render(&source, &descriptor(Some(ImageFormat::Webp), None, None)).unwrap();
        assert_eq!(&out.bytes[..4], b"RIFF");
        assert_eq!(&out.bytes[8..12], b"WEBP");
    }

    #[test]
    fn test_source_format_kept_without_request() {
        let source = fixture(16, 16, image::ImageFormat::Jpeg);
        let out = render(&source, &descriptor(None, Some(8), None)).unwrap();
        assert_eq!(out.format, ImageFormat::Jpeg);

        let source = fixture(16, 16, image::ImageFormat::Bmp);
        let out = render(&source, &descriptor(None, None, None)).unwrap();
        assert_eq!(out.format, ImageFormat::Png);
    }

    #[test]
    fn test_jpeg_quality_changes_size() {
        let source = fixture(128, 128, image::ImageFormat::Png);
        let mut low = descriptor(Some(ImageFormat::Jpeg), None, None);
        low.quality = Some(5);
        let mut high = low;
        high.quality = Some(100);
        let low = render(&source, &low).unwrap();
        let high = render(&source, &high).unwrap();
        assert!(low.bytes.len() < high.bytes.len());
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        let err = render(b"definitely not an image", &descriptor(None, Some(10), None)).unwrap_err();
        assert!(matches!(err, TransformError::Decode(_)));
    }

    #[test]
    fn test_pixel_limit() {
        let source = fixture(4, 4, image::ImageFormat::Png);
        let err = render(&source, &descriptor(None, Some(100_000), Some(100_000))).unwrap_err();
        assert_eq!(
            err,
            TransformError::TooManyPixels {
                width: 100_000,
                height: 100_000
            }
        );
    }

    #[test]
    fn test_target_dimensions() {
        assert_eq!(target_dimensions(64, 32, &descriptor(None, Some(32), None)), (32, 16));
        assert_eq!(target_dimensions(64, 32, &descriptor(None, None, Some(64))), (128, 64));
        assert_eq!(target_dimensions(1000, 1, &descriptor(None, Some(10), None)), (10, 1));
        assert_eq!(target_dimensions(5, 7, &descriptor(None, None, None)), (5, 7));
    }
}
