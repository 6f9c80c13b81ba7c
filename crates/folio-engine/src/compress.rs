use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};

use crate::config::QualityTarget;

pub const QUALITY_START: u8 = 90;
pub const QUALITY_STEP: u8 = 10;
pub const QUALITY_FLOOR: u8 = 40;

const JPEG_DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedImage {
    pub url: String,
    /// JPEG quality of the final encode; `None` when the input was passed through.
    pub quality: Option<u8>,
    pub width: u32,
    pub height: u32,
}

impl CompressedImage {
    fn unchanged(url: &str) -> Self {
        Self {
            url: url.to_string(),
            quality: None,
            width: 0,
            height: 0,
        }
    }

    pub fn within(&self, target: &QualityTarget) -> bool {
        self.url.len() <= target.max_bytes
    }
}

/// Shrinks a `data:` image URL to fit `target`.
///
/// Downscales to `max_width`, then re-encodes as JPEG from quality 90 down
/// to 40 until the data URL (base64 overhead included) fits `max_bytes`.
/// Anything that cannot be decoded locally, remote URLs included, comes
/// back unchanged.
pub fn compress_image(url: &str, target: &QualityTarget) -> CompressedImage {
    let Some(bytes) = decode_data_url(url) else {
        return CompressedImage::unchanged(url);
    };
    let Ok(decoded) = image::load_from_memory(&bytes) else {
        return CompressedImage::unchanged(url);
    };

    let max_width = target.max_width.max(1);
    let resized = if decoded.width() > max_width {
        let height = (f64::from(decoded.height()) * f64::from(max_width) / f64::from(decoded.width()))
            .round()
            .max(1.0) as u32;
        decoded.resize_exact(max_width, height, FilterType::Triangle)
    } else {
        decoded
    };
    let flattened = flatten_alpha(&resized);

    let mut quality = QUALITY_START;
    loop {
        let Some(encoded) = encode_jpeg(&flattened, quality) else {
            return CompressedImage::unchanged(url);
        };
        let candidate = format!("{JPEG_DATA_URL_PREFIX}{}", BASE64.encode(encoded));
        if candidate.len() <= target.max_bytes || quality <= QUALITY_FLOOR {
            return CompressedImage {
                url: candidate,
                quality: Some(quality),
                width: flattened.width(),
                height: flattened.height(),
            };
        }
        quality = quality.saturating_sub(QUALITY_STEP).max(QUALITY_FLOOR);
    }
}

/// Decodes the payload of a base64 `data:` URL.
pub fn decode_data_url(url: &str) -> Option<Vec<u8>> {
    let trimmed = url.trim();
    let rest = trimmed.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    if !meta.split(';').any(|part| part.trim().eq_ignore_ascii_case("base64")) {
        return None;
    }
    BASE64.decode(payload.trim().as_bytes()).ok()
}

pub fn to_data_url(bytes: &[u8], mime_type: &str) -> String {
    format!("data:{mime_type};base64,{}", BASE64.encode(bytes))
}

/// Blends transparent pixels over white; JPEG has no alpha channel.
fn flatten_alpha(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flattened
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Option<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
    encoder.encode_image(image).ok()?;
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

    use super::*;
    use crate::config::QualityTarget;

    fn png_data_url(image: RgbaImage) -> anyhow::Result<String> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(to_data_url(&bytes, "image/png"))
    }

    fn noise(width: u32, height: u32) -> RgbaImage {
        let mut state: u32 = 0x9E37_79B9;
        RgbaImage::from_fn(width, height, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let [r, g, b, _] = state.to_le_bytes();
            Rgba([r, g, b, 255])
        })
    }

    #[test]
    fn large_noise_image_hits_budget_or_floor() -> anyhow::Result<()> {
        let url = png_data_url(noise(2400, 1600))?;
        let target = QualityTarget {
            max_bytes: 50 * 1024,
            max_width: 1024,
        };
        let out = compress_image(&url, &target);
        assert!(out.url.starts_with("data:image/jpeg;base64,"));
        assert!(out.within(&target) || out.quality == Some(QUALITY_FLOOR));
        assert_eq!(out.width, 1024);
        assert_eq!(out.height, 683);
        Ok(())
    }

    #[test]
    fn smooth_image_fits_budget() -> anyhow::Result<()> {
        let gradient = RgbaImage::from_fn(1800, 1200, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        });
        let url = png_data_url(gradient)?;
        let target = QualityTarget {
            max_bytes: 200 * 1024,
            max_width: 1024,
        };
        let out = compress_image(&url, &target);
        assert!(out.within(&target), "{} bytes", out.url.len());
        assert!(out.quality.is_some());
        Ok(())
    }

    #[test]
    fn transparent_pixels_flatten_to_white() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 0])));
        let flat = flatten_alpha(&image);
        assert_eq!(flat.get_pixel(0, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn undecodable_input_is_returned_unchanged() {
        let target = QualityTarget {
            max_bytes: 10,
            max_width: 64,
        };
        for url in [
            "https://cdn.example.test/scene.png",
            "data:image/png;base64,!!!not-base64!!!",
            "data:image/png;base64,AAAA",
            "data:text/plain,hello",
        ] {
            let out = compress_image(url, &target);
            assert_eq!(out.url, url);
            assert_eq!(out.quality, None);
        }
    }
}
