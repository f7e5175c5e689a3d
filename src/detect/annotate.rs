//! Draws detection boxes onto the composed canvas in place.
//!
//! Rectangles only, two pixels thick, in the class color converted to YUV.
//! Unknown class ids fall back to mid gray. Coordinates are clamped so a box
//! touching the canvas edge never writes out of bounds.

use anyhow::Result;

use crate::frame::Nv12Frame;

use super::classes::ClassTable;
use super::postprocess::Detection;

const BORDER: u32 = 2;
const FALLBACK_GRAY: (u8, u8, u8) = (128, 128, 128);

/// BT.601 full-range RGB to YUV.
fn rgb_to_yuv(rgb: [u8; 3]) -> (u8, u8, u8) {
    let (r, g, b) = (rgb[0] as f32, rgb[1] as f32, rgb[2] as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = -0.169 * r - 0.331 * g + 0.5 * b + 128.0;
    let v = 0.5 * r - 0.419 * g - 0.081 * b + 128.0;
    (
        y.clamp(0.0, 255.0) as u8,
        u.clamp(0.0, 255.0) as u8,
        v.clamp(0.0, 255.0) as u8,
    )
}

/// Draw every detection's bounding rectangle onto the canvas.
pub fn annotate_canvas(
    canvas: &mut Nv12Frame,
    detections: &[Detection],
    classes: &ClassTable,
) -> Result<()> {
    for det in detections {
        let yuv = classes
            .get(det.class_id)
            .map(|record| rgb_to_yuv(record.color))
            .unwrap_or(FALLBACK_GRAY);
        draw_rect(canvas, &det.bbox, yuv);
    }
    Ok(())
}

fn draw_rect(canvas: &mut Nv12Frame, bbox: &[f32; 4], yuv: (u8, u8, u8)) {
    let w = canvas.width;
    let h = canvas.height;
    let x1 = (bbox[0].max(0.0) as u32).min(w.saturating_sub(1));
    let y1 = (bbox[1].max(0.0) as u32).min(h.saturating_sub(1));
    let x2 = (bbox[2].max(0.0) as u32).min(w.saturating_sub(1));
    let y2 = (bbox[3].max(0.0) as u32).min(h.saturating_sub(1));
    if x2 <= x1 || y2 <= y1 {
        return;
    }

    // Top and bottom edges.
    for t in 0..BORDER {
        let top = (y1 + t).min(h - 1);
        let bottom = y2.saturating_sub(t).max(y1);
        fill_span(canvas, x1, x2, top, yuv);
        fill_span(canvas, x1, x2, bottom, yuv);
    }
    // Left and right edges.
    for row in y1..=y2 {
        for t in 0..BORDER {
            let left = (x1 + t).min(w - 1);
            let right = x2.saturating_sub(t).max(x1);
            put_pixel(canvas, left, row, yuv);
            put_pixel(canvas, right, row, yuv);
        }
    }
}

fn fill_span(canvas: &mut Nv12Frame, x1: u32, x2: u32, row: u32, yuv: (u8, u8, u8)) {
    for x in x1..=x2 {
        put_pixel(canvas, x, row, yuv);
    }
}

fn put_pixel(canvas: &mut Nv12Frame, x: u32, y: u32, (py, pu, pv): (u8, u8, u8)) {
    let w = canvas.width as usize;
    canvas.y[y as usize * w + x as usize] = py;
    // Chroma is subsampled 2x2; the interleaved pair covers the quad.
    let uv_index = (y as usize / 2) * w + (x as usize / 2) * 2;
    canvas.uv[uv_index] = pu;
    canvas.uv[uv_index + 1] = pv;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::classes::ClassRecord;

    fn canvas() -> Nv12Frame {
        Nv12Frame::filled(32, 32, 0, 0, 0)
    }

    fn table() -> ClassTable {
        ClassTable::new(vec![ClassRecord {
            server_id: 1,
            name: "thing".into(),
            superclass: "stuff".into(),
            color: [255, 255, 255],
        }])
    }

    fn det(class_id: usize, bbox: [f32; 4]) -> Detection {
        Detection {
            class_id,
            confidence: 0.9,
            bbox,
        }
    }

    #[test]
    fn draws_box_edges_not_interior() {
        let mut frame = canvas();
        annotate_canvas(&mut frame, &[det(0, [4.0, 4.0, 20.0, 20.0])], &table()).unwrap();

        // White in full-range BT.601 has luma 255.
        assert_eq!(frame.y[4 * 32 + 4], 255); // corner
        assert_eq!(frame.y[4 * 32 + 12], 255); // top edge
        assert_eq!(frame.y[12 * 32 + 4], 255); // left edge
        assert_eq!(frame.y[12 * 32 + 12], 0); // interior untouched
    }

    #[test]
    fn clamps_box_to_canvas() {
        let mut frame = canvas();
        annotate_canvas(&mut frame, &[det(0, [-10.0, -10.0, 100.0, 100.0])], &table()).unwrap();
        assert_eq!(frame.y[0], 255);
        assert_eq!(frame.y[31 * 32 + 31], 255);
    }

    #[test]
    fn unknown_class_uses_fallback_gray() {
        let mut frame = canvas();
        annotate_canvas(&mut frame, &[det(42, [4.0, 4.0, 20.0, 20.0])], &table()).unwrap();
        assert_eq!(frame.y[4 * 32 + 4], 128);
    }

    #[test]
    fn degenerate_box_is_ignored() {
        let mut frame = canvas();
        annotate_canvas(&mut frame, &[det(0, [10.0, 10.0, 10.0, 10.0])], &table()).unwrap();
        assert!(frame.y.iter().all(|&p| p == 0));
    }
}
