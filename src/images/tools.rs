use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};

use super::ImageProxyError;

const JPEG_QUALITY: u8 = 85;
const PLACEHOLDER_SIZE: u32 = 64;

/// Encoding family of a cached image, chosen from the source URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    Gif,
    Png,
    Jpeg,
}

impl TargetFormat {
    /// Keep gifs as gifs and pngs as pngs, everything else becomes a jpeg.
    pub fn from_url(url: &str) -> Self {
        let path = match reqwest::Url::parse(url) {
            Ok(parsed) => PathBuf::from(parsed.path()),
            Err(_) => PathBuf::from(url.split(['?', '#']).next().unwrap_or(url)),
        };

        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());

        match extension.as_deref() {
            Some("gif") => TargetFormat::Gif,
            Some("png") => TargetFormat::Png,
            _ => TargetFormat::Jpeg,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            TargetFormat::Gif => "image/gif",
            TargetFormat::Png => "image/png",
            TargetFormat::Jpeg => "image/jpeg",
        }
    }
}

// Decode, shrink to fit and re-encode
pub fn convert_image(
    image_data: &[u8],
    format: TargetFormat,
    max_width: u32,
    max_height: u32,
) -> Result<Vec<u8>, ImageProxyError> {
    let img = image::load_from_memory(image_data)
        .map_err(|e| ImageProxyError::ConversionError(format!("Failed to load image: {}", e)))?;

    let resized = downscale(img, max_width, max_height);

    encode_image(resized, format)
}

/// Shrinks `img` to fit inside `max_width` x `max_height`, keeping its
/// aspect ratio. Images that already fit are returned untouched.
pub fn downscale(img: DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    let (current_width, current_height) = img.dimensions();
    let max_width = max_width.max(1);
    let max_height = max_height.max(1);

    if current_width <= max_width && current_height <= max_height {
        return img;
    }

    img.resize(max_width, max_height, FilterType::Lanczos3)
}

fn encode_image(img: DynamicImage, format: TargetFormat) -> Result<Vec<u8>, ImageProxyError> {
    let mut output = Vec::new();

    match format {
        TargetFormat::Jpeg => {
            // JPEG has no alpha channel
            let rgb = img.to_rgb8();
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, JPEG_QUALITY);
            encoder
                .encode_image(&rgb)
                .map_err(|e| ImageProxyError::ConversionError(format!("JPEG encoding failed: {}", e)))?;
        }
        TargetFormat::Png => {
            img.write_to(&mut Cursor::new(&mut output), image::ImageFormat::Png)
                .map_err(|e| ImageProxyError::ConversionError(format!("PNG encoding failed: {}", e)))?;
        }
        TargetFormat::Gif => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_to(&mut Cursor::new(&mut output), image::ImageFormat::Gif)
                .map_err(|e| ImageProxyError::ConversionError(format!("GIF encoding failed: {}", e)))?;
        }
    }

    Ok(output)
}

// Sniff the mime type from the file signature
pub fn detect_image_type(data: &[u8]) -> &'static str {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        "image/png"
    } else if data.starts_with(&[0x47, 0x49, 0x46, 0x38]) {
        "image/gif"
    } else if data.starts_with(&[0x52, 0x49, 0x46, 0x46]) && data.get(8..12) == Some(&[0x57, 0x45, 0x42, 0x50]) {
        "image/webp"
    } else if data.starts_with(&[0x42, 0x4D]) {
        "image/bmp"
    } else {
        "image/jpeg"
    }
}

/// Image served in place of anything that could not be fetched.
///
/// Uses the file at `path` when configured, otherwise draws a plain framed
/// tile.
pub fn load_placeholder(path: Option<&Path>) -> Result<Vec<u8>, ImageProxyError> {
    match path {
        Some(path) => {
            let data = std::fs::read(path)?;
            image::guess_format(&data).map_err(|e| {
                ImageProxyError::ImageError(format!("Placeholder {} is not an image: {}", path.display(), e))
            })?;
            Ok(data)
        }
        None => generate_placeholder(),
    }
}

fn generate_placeholder() -> Result<Vec<u8>, ImageProxyError> {
    let fill = Rgba([0xE6, 0xE6, 0xE6, 0xFF]);
    let frame = Rgba([0x9E, 0x9E, 0x9E, 0xFF]);
    let last = PLACEHOLDER_SIZE - 1;

    let tile = RgbaImage::from_fn(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE, |x, y| {
        let on_border = x < 2 || y < 2 || x > last - 2 || y > last - 2;
        let on_cross = x == y || x + y == last;
        if on_border || on_cross {
            frame
        } else {
            fill
        }
    });

    encode_image(DynamicImage::ImageRgba8(tile), TargetFormat::Png)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 255]));
        encode_image(DynamicImage::ImageRgba8(img), TargetFormat::Png).unwrap()
    }

    #[test]
    fn target_format_follows_extension() {
        assert_eq!(TargetFormat::from_url("http://example.com/a.gif"), TargetFormat::Gif);
        assert_eq!(TargetFormat::from_url("http://example.com/a.PNG"), TargetFormat::Png);
        assert_eq!(TargetFormat::from_url("http://example.com/a.png?size=2"), TargetFormat::Png);
        assert_eq!(TargetFormat::from_url("http://example.com/a.webp"), TargetFormat::Jpeg);
        assert_eq!(TargetFormat::from_url("http://example.com/image"), TargetFormat::Jpeg);
        assert_eq!(TargetFormat::from_url("not a url.gif"), TargetFormat::Gif);
    }

    #[test]
    fn large_images_are_shrunk_to_fit() {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(2048, 512));
        let resized = downscale(img, 1024, 768);

        assert_eq!(resized.dimensions(), (1024, 256));
    }

    #[test]
    fn tall_images_are_bounded_by_height() {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(800, 1600));
        let (width, height) = downscale(img, 1024, 768).dimensions();

        assert_eq!(height, 768);
        assert_eq!(width, 384);
    }

    #[test]
    fn small_images_are_never_upscaled() {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(100, 50));
        assert_eq!(downscale(img, 1024, 768).dimensions(), (100, 50));
    }

    #[test]
    fn conversion_honours_target_family() {
        let source = sample_png(40, 30);

        let png = convert_image(&source, TargetFormat::Png, 1024, 768).unwrap();
        let jpeg = convert_image(&source, TargetFormat::Jpeg, 1024, 768).unwrap();
        let gif = convert_image(&source, TargetFormat::Gif, 1024, 768).unwrap();

        assert_eq!(detect_image_type(&png), "image/png");
        assert_eq!(detect_image_type(&jpeg), "image/jpeg");
        assert_eq!(detect_image_type(&gif), "image/gif");
    }

    #[test]
    fn garbage_fails_to_convert() {
        let result = convert_image(b"<html>not an image</html>", TargetFormat::Png, 10, 10);
        assert!(matches!(result, Err(ImageProxyError::ConversionError(_))));
    }

    #[test]
    fn generated_placeholder_is_a_png() {
        let placeholder = load_placeholder(None).unwrap();

        assert_eq!(detect_image_type(&placeholder), "image/png");
        let decoded = image::load_from_memory(&placeholder).unwrap();
        assert_eq!(decoded.dimensions(), (PLACEHOLDER_SIZE, PLACEHOLDER_SIZE));
    }

    #[test]
    fn placeholder_file_must_be_an_image() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("default.png");
        std::fs::write(&bogus, b"nope").unwrap();

        assert!(load_placeholder(Some(&bogus)).is_err());

        let real = dir.path().join("real.png");
        std::fs::write(&real, sample_png(4, 4)).unwrap();
        assert_eq!(load_placeholder(Some(&real)).unwrap(), sample_png(4, 4));
    }

    #[test]
    fn unknown_signatures_default_to_jpeg() {
        assert_eq!(detect_image_type(b""), "image/jpeg");
        assert_eq!(detect_image_type(b"BM...."), "image/bmp");
    }
}
