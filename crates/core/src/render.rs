//! Annotation rendering: draw detection boxes and labels over an image and
//! encode the result as JPEG.
//!
//! Drawing happens on a transparent overlay that is alpha-composited back
//! onto the RGB-normalized source, so translucent inputs and label plates
//! behave the same way regardless of the input format.

use ab_glyph::{FontArc, PxScale};
use image::{DynamicImage, Rgb, RgbImage, Rgba, RgbaImage, imageops};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use once_cell::sync::Lazy;
use std::io::Cursor;
use tracing::{debug, warn};

use crate::models::Detection;

/// Box colour for defective classes
const DEFECT_COLOR: Rgba<u8> = Rgba([239, 68, 68, 255]);
/// Box colour for everything else
const NORMAL_COLOR: Rgba<u8> = Rgba([34, 197, 94, 255]);
/// Label text colour
const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);

const BOX_WIDTH: i64 = 3;
const FONT_SIZE: f32 = 16.0;
/// Height of the filled label plate above a box
const PLATE_HEIGHT: i64 = 24;

/// JPEG quality for annotated outputs
const ANNOTATED_JPEG_QUALITY: u8 = 90;
/// JPEG quality for thumbnails
const THUMBNAIL_JPEG_QUALITY: u8 = 85;
/// Longest-side cap for thumbnails
pub const THUMBNAIL_MAX_SIDE: u32 = 400;

/// Cyrillic-capable fonts tried in order; the label text is Russian
const FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/TTF/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/TTF/LiberationSans-Bold.ttf",
];

/// Loaded once per process. Without any usable font, boxes and plates are
/// still drawn; only the label text is skipped.
static LABEL_FONT: Lazy<Option<FontArc>> = Lazy::new(|| {
    for path in FONT_PATHS {
        if let Ok(bytes) = std::fs::read(path)
            && let Ok(font) = FontArc::try_from_vec(bytes)
        {
            debug!("Loaded annotation font: {}", path);
            return Some(font);
        }
    }
    warn!("No usable system font found, annotation labels will be drawn without text");
    None
});

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to decode image: {0}")]
    Decode(image::ImageError),
    #[error("failed to encode image: {0}")]
    Encode(image::ImageError),
}

/// Draw detection annotations onto an image and return JPEG bytes (q90).
pub fn draw_annotations(
    image_bytes: &[u8],
    detections: &[Detection],
) -> Result<Vec<u8>, RenderError> {
    let decoded = image::load_from_memory(image_bytes).map_err(RenderError::Decode)?;
    let base = normalize_rgb(decoded);
    let (width, height) = base.dimensions();

    let mut overlay = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0]));

    for detection in detections {
        let [x1, y1, x2, y2] = match detection.bbox[..] {
            [x1, y1, x2, y2] => [x1, y1, x2, y2],
            _ => continue,
        };
        let color = if detection.has_defective_class() {
            DEFECT_COLOR
        } else {
            NORMAL_COLOR
        };

        draw_box_outline(&mut overlay, x1, y1, x2, y2, color);
        draw_label_plate(&mut overlay, detection, x1, y1, color);
    }

    let mut composed = DynamicImage::ImageRgb8(base).to_rgba8();
    imageops::overlay(&mut composed, &overlay, 0, 0);
    let flattened = DynamicImage::ImageRgba8(composed).to_rgb8();

    encode_jpeg(flattened, ANNOTATED_JPEG_QUALITY)
}

/// Downscale an image so its longest side is at most
/// [`THUMBNAIL_MAX_SIDE`] pixels and encode it as JPEG (q85).
pub fn thumbnail_jpeg(image_bytes: &[u8]) -> Result<Vec<u8>, RenderError> {
    let decoded = image::load_from_memory(image_bytes).map_err(RenderError::Decode)?;
    let (width, height) = (decoded.width(), decoded.height());

    let resized = if width.max(height) > THUMBNAIL_MAX_SIDE {
        decoded.resize(
            THUMBNAIL_MAX_SIDE,
            THUMBNAIL_MAX_SIDE,
            imageops::FilterType::Lanczos3,
        )
    } else {
        decoded
    };

    encode_jpeg(normalize_rgb(resized), THUMBNAIL_JPEG_QUALITY)
}

/// Convert any decoded image to RGB, compositing transparency onto a white
/// background using the image's own alpha as mask.
fn normalize_rgb(image: DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = a as u16;
        let blend = |c: u8| ((c as u16 * alpha + 255 * (255 - alpha)) / 255) as u8;
        rgb.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }
    rgb
}

/// 3 px hollow rectangle, clamped to the canvas
fn draw_box_outline(overlay: &mut RgbaImage, x1: i64, y1: i64, x2: i64, y2: i64, color: Rgba<u8>) {
    let (width, height) = overlay.dimensions();
    let (x1, x2) = (x1.min(x2), x1.max(x2));
    let (y1, y2) = (y1.min(y2), y1.max(y2));

    for inset in 0..BOX_WIDTH {
        let left = (x1 + inset).clamp(0, width as i64 - 1);
        let top = (y1 + inset).clamp(0, height as i64 - 1);
        let right = (x2 - inset).clamp(0, width as i64 - 1);
        let bottom = (y2 - inset).clamp(0, height as i64 - 1);
        if right <= left || bottom <= top {
            break;
        }
        draw_hollow_rect_mut(
            overlay,
            Rect::at(left as i32, top as i32)
                .of_size((right - left) as u32, (bottom - top) as u32),
            color,
        );
    }
}

/// Filled plate above the box carrying `"{label} {conf}%"` in white
fn draw_label_plate(overlay: &mut RgbaImage, detection: &Detection, x1: i64, y1: i64, color: Rgba<u8>) {
    let label = if !detection.class_localized.is_empty() {
        detection.class_localized.as_str()
    } else if !detection.class_name.is_empty() {
        detection.class_name.as_str()
    } else {
        "object"
    };
    let text = format!("{} {:.0}%", label, detection.confidence * 100.0);

    let scale = PxScale::from(FONT_SIZE);
    let text_width = match LABEL_FONT.as_ref() {
        Some(font) => text_size(scale, font, &text).0 as i64,
        None => text.chars().count() as i64 * 8,
    };

    let (width, height) = overlay.dimensions();
    let plate_top = (y1 - PLATE_HEIGHT).max(0);
    let plate_left = x1.clamp(0, width as i64 - 1);
    let plate_right = (x1 + text_width + 10).clamp(plate_left + 1, width as i64);
    let plate_bottom = y1.clamp(plate_top + 1, height as i64);

    draw_filled_rect_mut(
        overlay,
        Rect::at(plate_left as i32, plate_top as i32).of_size(
            (plate_right - plate_left) as u32,
            (plate_bottom - plate_top) as u32,
        ),
        color,
    );

    if let Some(font) = LABEL_FONT.as_ref() {
        draw_text_mut(
            overlay,
            TEXT_COLOR,
            (plate_left + 5) as i32,
            (y1 - 20).max(0) as i32,
            scale,
            font,
            &text,
        );
    }
}

fn encode_jpeg(image: RgbImage, quality: u8) -> Result<Vec<u8>, RenderError> {
    let mut out = Vec::new();
    let mut cursor = Cursor::new(&mut out);
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality);
    DynamicImage::ImageRgb8(image)
        .write_with_encoder(encoder)
        .map_err(RenderError::Encode)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BboxSize, DefectSummary};
    use image::ImageFormat;

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, Rgba([120, 130, 140, 255]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn detection(class_name: &str) -> Detection {
        Detection {
            class_name: class_name.to_string(),
            class_localized: "Изолятор".to_string(),
            confidence: 0.87,
            bbox: vec![10, 10, 50, 50],
            bbox_size: BboxSize::from_dimensions(40, 40),
            defect_summary: DefectSummary {
                kind: "Повреждение".to_string(),
                severity: Some("high".to_string()),
                description: String::new(),
            },
            is_manual: false,
            detection_id: None,
        }
    }

    #[test]
    fn test_annotated_output_is_jpeg_with_same_dimensions() {
        let png = sample_png(100, 80);
        let jpeg = draw_annotations(&png, &[detection("damaged_insulator")]).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8], "JPEG SOI marker expected");

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 80));
    }

    #[test]
    fn test_defective_class_paints_red() {
        let png = sample_png(100, 100);
        let jpeg = draw_annotations(&png, &[detection("damaged_insulator")]).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        // Sample the top edge of the box: red channel dominates
        let pixel = decoded.get_pixel(30, 10);
        assert!(pixel[0] > 150 && pixel[1] < 120, "expected red edge, got {:?}", pixel);
    }

    #[test]
    fn test_normal_class_paints_green() {
        let png = sample_png(100, 100);
        let jpeg = draw_annotations(&png, &[detection("insulator")]).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        let pixel = decoded.get_pixel(30, 10);
        assert!(pixel[1] > 130 && pixel[0] < 120, "expected green edge, got {:?}", pixel);
    }

    #[test]
    fn test_transparency_composites_onto_white() {
        let image = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 0]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();

        let jpeg = draw_annotations(&bytes, &[]).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        let pixel = decoded.get_pixel(5, 5);
        assert!(
            pixel.0.iter().all(|&c| c > 240),
            "fully transparent input should flatten to white, got {:?}",
            pixel
        );
    }

    #[test]
    fn test_malformed_bbox_is_skipped() {
        let png = sample_png(60, 60);
        let mut bad = detection("insulator");
        bad.bbox = vec![1, 2, 3];
        // Must not panic, just render without the box
        let jpeg = draw_annotations(&png, &[bad]).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_thumbnail_caps_longest_side() {
        let png = sample_png(800, 600);
        let jpeg = thumbnail_jpeg(&png).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (400, 300));
    }

    #[test]
    fn test_small_image_is_not_upscaled() {
        let png = sample_png(200, 100);
        let jpeg = thumbnail_jpeg(&png).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (200, 100));
    }
}
