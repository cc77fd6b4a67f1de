use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::models::{Detection, Result, WorkerError};

const BOX_THICKNESS: i32 = 3;
const JPEG_QUALITY: u8 = 90;

const PALETTE: [Rgba<u8>; 6] = [
    Rgba([230, 57, 70, 255]),
    Rgba([46, 196, 182, 255]),
    Rgba([255, 183, 3, 255]),
    Rgba([86, 117, 255, 255]),
    Rgba([155, 93, 229, 255]),
    Rgba([118, 200, 60, 255]),
];

/// Renders detections over the source frame and encodes the result as JPEG.
///
/// Boxes are clamped to the frame; degenerate boxes are skipped. An empty
/// detection list produces the plain re-encoded frame.
pub fn render_annotated(frame: &DynamicImage, detections: &[Detection]) -> Result<Vec<u8>> {
    let mut canvas: RgbaImage = frame.to_rgba8();
    let width = canvas.width() as i32;
    let height = canvas.height() as i32;
    if width == 0 || height == 0 {
        return Err(WorkerError::Annotation("empty frame".to_string()));
    }

    for detection in detections {
        let color = color_for(&detection.label);
        let x1 = (detection.bbox.x1.round() as i32).clamp(0, width - 1);
        let y1 = (detection.bbox.y1.round() as i32).clamp(0, height - 1);
        let x2 = (detection.bbox.x2.round() as i32).clamp(0, width - 1);
        let y2 = (detection.bbox.y2.round() as i32).clamp(0, height - 1);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        for inset in 0..BOX_THICKNESS {
            let w = x2 - x1 - 2 * inset;
            let h = y2 - y1 - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(x1 + inset, y1 + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }
    }

    let rgb = DynamicImage::ImageRgba8(canvas).to_rgb8();
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| WorkerError::Annotation(format!("JPEG encode failed: {e}")))?;
    Ok(buffer)
}

fn color_for(label: &str) -> Rgba<u8> {
    let mut hash = 0usize;
    for byte in label.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as usize);
    }
    PALETTE[hash % PALETTE.len()]
}
