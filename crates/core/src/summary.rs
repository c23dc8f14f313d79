//! Manual-annotation merge policy for image summaries.
//!
//! Users draw correction boxes over an annotated image; those become
//! detections with `is_manual = true`. A merge replaces the previous manual
//! set while preserving every model-produced entry, then recomputes the
//! aggregate counters from the merged list.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::{BboxSize, DefectSummary, Detection, ImageSummary};

/// Label used when a manual box has no name
pub const MANUAL_LABEL: &str = "Ручная аннотация";

/// Defect-summary types for manual entries
pub const DEFECT_KIND_DAMAGED: &str = "Повреждение";
pub const DEFECT_KIND_NORMAL: &str = "Норма";

/// A user-drawn box in `{x, y, width, height}` form
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ManualBox {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Defaults to true: an operator drawing a box usually marks damage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_defect: Option<bool>,
}

impl ManualBox {
    pub fn is_defect(&self) -> bool {
        self.is_defect.unwrap_or(true)
    }

    /// Convert to a detection entry: absolute `[x1, y1, x2, y2]` bbox,
    /// confidence pinned to 1.0, `is_manual` set.
    pub fn to_detection(&self) -> Detection {
        let label = self
            .name
            .clone()
            .unwrap_or_else(|| MANUAL_LABEL.to_string());
        let is_defect = self.is_defect();
        Detection {
            class_name: label.clone(),
            class_localized: label,
            confidence: 1.0,
            bbox: vec![self.x, self.y, self.x + self.width, self.y + self.height],
            bbox_size: BboxSize::from_dimensions(self.width, self.height),
            defect_summary: DefectSummary {
                kind: if is_defect {
                    DEFECT_KIND_DAMAGED.to_string()
                } else {
                    DEFECT_KIND_NORMAL.to_string()
                },
                severity: Some(if is_defect { "high" } else { "none" }.to_string()),
                description: MANUAL_LABEL.to_string(),
            },
            is_manual: true,
            detection_id: None,
        }
    }
}

/// Merge user-drawn boxes into an image summary.
///
/// Every previously-present manual entry is dropped, every non-manual entry
/// is kept, and the new manual entries are appended. Counters are
/// recomputed from the merged list. Re-issuing the same merge yields the
/// same detections.
pub fn merge_manual_boxes(summary: &mut ImageSummary, boxes: &[ManualBox]) {
    summary.detections.retain(|d| !d.is_manual);
    summary
        .detections
        .extend(boxes.iter().map(ManualBox::to_detection));

    summary.manual_annotations = boxes
        .iter()
        .map(|b| serde_json::to_value(b).unwrap_or_default())
        .collect();
    summary.has_manual_annotations = !boxes.is_empty();

    recompute_counts(summary);
}

/// Replace the full detection list (the metrics endpoint's contract) and
/// recompute counters unless the caller supplies them.
pub fn replace_detections(
    summary: &mut ImageSummary,
    detections: Vec<Detection>,
    total_objects: Option<i64>,
    defects_count: Option<i64>,
    has_defects: Option<bool>,
) {
    summary.detections = detections;
    recompute_counts(summary);
    if let Some(total) = total_objects {
        summary.total_objects = total;
    }
    if let Some(defects) = defects_count {
        summary.defects_count = defects;
    }
    if let Some(has) = has_defects {
        summary.has_defects = has;
    }
}

/// Recompute `total_objects`, `defects_count` and `has_defects` from the
/// detection list. An entry is defective iff its severity is set and not
/// "none".
pub fn recompute_counts(summary: &mut ImageSummary) {
    summary.total_objects = summary.detections.len() as i64;
    summary.defects_count = summary
        .detections
        .iter()
        .filter(|d| d.defect_summary.is_defective())
        .count() as i64;
    summary.has_defects = summary.defects_count > 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_detection(class_name: &str, is_manual: bool) -> Detection {
        Detection {
            class_name: class_name.to_string(),
            class_localized: class_name.to_string(),
            confidence: 0.8,
            bbox: vec![0, 0, 40, 40],
            bbox_size: BboxSize::from_dimensions(40, 40),
            defect_summary: DefectSummary {
                kind: DEFECT_KIND_DAMAGED.to_string(),
                severity: Some("high".to_string()),
                description: String::new(),
            },
            is_manual,
            detection_id: None,
        }
    }

    #[test]
    fn test_merge_replaces_only_manual_entries() {
        // One model detection, one stale manual entry
        let mut summary = ImageSummary {
            detections: vec![
                model_detection("damaged_insulator", false),
                model_detection("foo", true),
            ],
            ..Default::default()
        };

        let boxes = vec![ManualBox {
            x: 0,
            y: 0,
            width: 5,
            height: 5,
            name: Some("bar".to_string()),
            is_defect: Some(true),
        }];
        merge_manual_boxes(&mut summary, &boxes);

        assert_eq!(summary.detections.len(), 2);
        assert_eq!(summary.detections[0].class_name, "damaged_insulator");
        assert!(!summary.detections[0].is_manual);

        let manual = &summary.detections[1];
        assert_eq!(manual.class_name, "bar");
        assert!(manual.is_manual);
        assert_eq!(manual.confidence, 1.0);
        assert_eq!(manual.bbox, vec![0, 0, 5, 5]);

        assert!(!summary.detections.iter().any(|d| d.class_name == "foo"));
        assert_eq!(summary.total_objects, 2);
        assert_eq!(summary.defects_count, 2);
        assert!(summary.has_defects);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut summary = ImageSummary {
            detections: vec![model_detection("pole", false)],
            ..Default::default()
        };
        let boxes = vec![ManualBox {
            x: 10,
            y: 10,
            width: 20,
            height: 20,
            name: None,
            is_defect: None,
        }];

        merge_manual_boxes(&mut summary, &boxes);
        let first = summary.detections.clone();
        merge_manual_boxes(&mut summary, &boxes);

        assert_eq!(summary.detections, first);
        assert_eq!(
            summary.detections.iter().filter(|d| d.is_manual).count(),
            boxes.len()
        );
    }

    #[test]
    fn test_unnamed_box_defaults() {
        let unnamed = ManualBox {
            x: 1,
            y: 2,
            width: 3,
            height: 4,
            name: None,
            is_defect: None,
        };
        let detection = unnamed.to_detection();
        assert_eq!(detection.class_name, MANUAL_LABEL);
        assert_eq!(detection.defect_summary.kind, DEFECT_KIND_DAMAGED);
        assert_eq!(detection.bbox, vec![1, 2, 4, 6]);
    }

    #[test]
    fn test_normal_box_is_not_counted_as_defect() {
        let mut summary = ImageSummary::default();
        let boxes = vec![ManualBox {
            x: 0,
            y: 0,
            width: 50,
            height: 50,
            name: Some("insulator".to_string()),
            is_defect: Some(false),
        }];
        merge_manual_boxes(&mut summary, &boxes);
        assert_eq!(summary.total_objects, 1);
        assert_eq!(summary.defects_count, 0);
        assert!(!summary.has_defects);
    }

    #[test]
    fn test_replace_detections_recomputes_unless_overridden() {
        let mut summary = ImageSummary::default();
        replace_detections(
            &mut summary,
            vec![model_detection("bad_insulator", false)],
            None,
            None,
            None,
        );
        assert_eq!(summary.total_objects, 1);
        assert_eq!(summary.defects_count, 1);

        replace_detections(&mut summary, Vec::new(), Some(5), None, None);
        assert_eq!(summary.total_objects, 5);
        assert_eq!(summary.defects_count, 0);
        assert!(!summary.has_defects);
    }
}
