//! Tensor decode and non-maximum suppression.
//!
//! The network emits per-anchor rows of `[cx, cy, w, h, class scores...]`
//! with box coordinates normalized to `[0, 1]`. Decode picks the best class
//! per anchor, drops rows below the confidence threshold, converts center
//! boxes to pixel corner boxes clamped to the canvas, then runs greedy
//! per-class NMS.

use anyhow::{anyhow, Result};
use serde::Serialize;

use super::engine::OutputTensor;

/// One post-NMS detection on canvas coordinates.
#[derive(Clone, Debug, Serialize)]
pub struct Detection {
    pub class_id: usize,
    pub confidence: f32,
    /// Corner box `[x1, y1, x2, y2]`, clamped to the canvas.
    pub bbox: [f32; 4],
}

/// Intersection-over-union of two corner boxes. Zero-area union yields 0.
pub fn box_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy per-class non-maximum suppression.
///
/// Candidates are ordered by descending confidence (stable, so equal scores
/// keep input order); each survivor suppresses later same-class boxes whose
/// IoU meets the threshold.
pub fn nms(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && box_iou(&k.bbox, &candidate.bbox) >= iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// Decode one raw output tensor into suppressed detections.
pub fn decode_detections(
    output: &OutputTensor,
    confidence_threshold: f32,
    iou_threshold: f32,
    canvas_width: u32,
    canvas_height: u32,
) -> Result<Vec<Detection>> {
    if output.stride < 5 {
        return Err(anyhow!(
            "output stride {} leaves no class scores",
            output.stride
        ));
    }
    if output.data.len() != output.anchors * output.stride {
        return Err(anyhow!(
            "output tensor size {} does not match {}x{}",
            output.data.len(),
            output.anchors,
            output.stride
        ));
    }

    let max_x = canvas_width as f32;
    let max_y = canvas_height as f32;

    let mut candidates = Vec::new();
    for i in 0..output.anchors {
        let row = output.anchor(i);
        let scores = &row[4..];

        let (class_id, &confidence) = scores
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .ok_or_else(|| anyhow!("anchor row has no class scores"))?;
        if confidence < confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        let bbox = [
            ((cx - w / 2.0) * max_x).clamp(0.0, max_x),
            ((cy - h / 2.0) * max_y).clamp(0.0, max_y),
            ((cx + w / 2.0) * max_x).clamp(0.0, max_x),
            ((cy + h / 2.0) * max_y).clamp(0.0, max_y),
        ];
        candidates.push(Detection {
            class_id,
            confidence,
            bbox,
        });
    }

    Ok(nms(candidates, iou_threshold))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: usize, confidence: f32, bbox: [f32; 4]) -> Detection {
        Detection {
            class_id,
            confidence,
            bbox,
        }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = [10.0, 10.0, 50.0, 50.0];
        assert!((box_iou(&b, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = [0.0, 0.0, 10.0, 10.0];
        let b = [20.0, 20.0, 30.0, 30.0];
        assert_eq!(box_iou(&a, &b), 0.0);
    }

    #[test]
    fn iou_of_degenerate_boxes_is_zero() {
        let a = [5.0, 5.0, 5.0, 5.0];
        assert_eq!(box_iou(&a, &a), 0.0);
    }

    #[test]
    fn nms_suppresses_overlapping_same_class() {
        // IoU of these two is 64/136 ≈ 0.47, above a 0.4 threshold.
        let kept = nms(
            vec![
                det(0, 0.9, [0.0, 0.0, 10.0, 10.0]),
                det(0, 0.5, [1.0, 1.0, 9.0, 9.0]),
            ],
            0.4,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn nms_keeps_overlapping_different_classes() {
        let kept = nms(
            vec![
                det(0, 0.9, [0.0, 0.0, 10.0, 10.0]),
                det(1, 0.5, [1.0, 1.0, 9.0, 9.0]),
            ],
            0.4,
        );
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn nms_is_idempotent() {
        let first = nms(
            vec![
                det(0, 0.9, [0.0, 0.0, 10.0, 10.0]),
                det(0, 0.5, [1.0, 1.0, 9.0, 9.0]),
                det(0, 0.8, [100.0, 100.0, 120.0, 120.0]),
                det(2, 0.7, [0.0, 0.0, 10.0, 10.0]),
            ],
            0.4,
        );
        let second = nms(first.clone(), 0.4);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.class_id, b.class_id);
            assert_eq!(a.bbox, b.bbox);
        }
    }

    #[test]
    fn decode_picks_argmax_class_and_clamps() {
        // Two anchors, three classes: stride 7. The second anchor sits near
        // the canvas edge so its corners must clamp.
        let data = vec![
            0.5, 0.5, 0.25, 0.25, 0.1, 0.8, 0.2, // anchor 0 -> class 1
            0.01, 0.01, 0.1, 0.1, 0.6, 0.1, 0.1, // anchor 1 -> class 0, clipped
        ];
        let output = OutputTensor::new(data, 2, 7).unwrap();

        let dets = decode_detections(&output, 0.5, 0.5, 640, 640).unwrap();
        assert_eq!(dets.len(), 2);

        let c1 = dets.iter().find(|d| d.class_id == 1).unwrap();
        assert_eq!(c1.bbox, [240.0, 240.0, 400.0, 400.0]);

        let c0 = dets.iter().find(|d| d.class_id == 0).unwrap();
        assert_eq!(c0.bbox[0], 0.0);
        assert_eq!(c0.bbox[1], 0.0);
        assert!((c0.bbox[2] - 38.4).abs() < 1e-3);
    }

    #[test]
    fn decode_drops_low_confidence() {
        let data = vec![0.5, 0.5, 0.2, 0.2, 0.3, 0.2];
        let output = OutputTensor::new(data, 1, 6).unwrap();
        let dets = decode_detections(&output, 0.5, 0.5, 640, 640).unwrap();
        assert!(dets.is_empty());
    }

    #[test]
    fn decode_rejects_malformed_tensor() {
        let output = OutputTensor {
            data: vec![0.0; 10],
            anchors: 2,
            stride: 6,
        };
        assert!(decode_detections(&output, 0.5, 0.5, 640, 640).is_err());
    }
}
