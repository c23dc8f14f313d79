//! Domain types for the batch-analysis pipeline.
//!
//! Wire names follow the detector service contract (`class`, `class_ru`,
//! `bbox`, ...) so rows written by the worker deserialize unchanged in the
//! API responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;

/// Object classes that count as defects
pub const DEFECTIVE_CLASSES: &[&str] = &["bad_insulator", "damaged_insulator"];

/// Lifecycle state shared by tasks and images.
///
/// Monotonic for tasks: Queued -> Processing -> Completed | Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "analysis_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed)
    }
}

/// One batch submission
#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct AnalysisTask {
    pub task_id: Uuid,
    pub status: AnalysisStatus,
    pub route_name: Option<String>,
    pub total_files: i32,
    pub total_bytes: i64,
    pub processed_files: i32,
    pub failed_files: i32,
    pub defects_found: i32,
    pub confidence_threshold: f64,
    pub preview_limit: i32,
    pub message: Option<String>,
    pub originals_archive_file_id: Option<Uuid>,
    pub results_archive_file_id: Option<Uuid>,
    #[schema(value_type = Option<Object>)]
    pub task_metadata: Option<serde_json::Value>,
    #[schema(value_type = String, format = DateTime)]
    pub created_at: DateTime<Utc>,
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: DateTime<Utc>,
    #[schema(value_type = Option<String>, format = DateTime)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One file within a task
#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct AnalysisImage {
    pub image_id: Uuid,
    pub task_id: Uuid,
    pub file_id: Uuid,
    pub file_name: String,
    pub file_size: i64,
    pub status: AnalysisStatus,
    pub result_file_id: Option<Uuid>,
    pub is_preview: bool,
    #[schema(value_type = Option<Object>)]
    #[sqlx(json(nullable))]
    pub summary: Option<ImageSummary>,
    pub error_message: Option<String>,
    #[schema(value_type = String, format = DateTime)]
    pub created_at: DateTime<Utc>,
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: DateTime<Utc>,
}

/// Pixel extent of a bounding box
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BboxSize {
    pub width: i64,
    pub height: i64,
    pub area: i64,
    pub is_small: bool,
}

impl BboxSize {
    /// Boxes under 30 px on either side are flagged small
    pub fn from_dimensions(width: i64, height: i64) -> Self {
        Self {
            width,
            height,
            area: width * height,
            is_small: width < 30 || height < 30,
        }
    }
}

/// Defect classification attached to a detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DefectSummary {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Option<String>,
    pub description: String,
}

impl DefectSummary {
    /// Defective iff severity is set and not "none"
    pub fn is_defective(&self) -> bool {
        self.severity.as_deref().is_some_and(|s| s != "none")
    }
}

/// One detected object, model-produced or manually drawn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_name: String,
    #[serde(rename = "class_ru")]
    pub class_localized: String,
    pub confidence: f64,
    /// Absolute pixel coordinates `[x1, y1, x2, y2]`
    pub bbox: Vec<i64>,
    pub bbox_size: BboxSize,
    pub defect_summary: DefectSummary,
    #[serde(default)]
    pub is_manual: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_id: Option<String>,
}

impl Detection {
    /// Whether the detected class belongs to the defective set
    pub fn has_defective_class(&self) -> bool {
        DEFECTIVE_CLASSES.contains(&self.class_name.as_str())
    }
}

/// The per-image analysis record stored in the image row's `summary` column.
///
/// This is also the detector's `/predict` response shape; the worker stores
/// the response as-is and the manual-merge path rewrites it under a row
/// lock. Unknown upstream fields survive round trips through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ImageSummary {
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub statistics: BTreeMap<String, i64>,
    #[serde(default)]
    pub total_objects: i64,
    #[serde(default)]
    pub defects_count: i64,
    #[serde(default)]
    pub has_defects: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manual_annotations: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub has_manual_annotations: bool,
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Aggregate metadata recorded on the task row at finalization
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct TaskMetadata {
    pub total_files: i64,
    pub total_objects: i64,
    pub defects_found: i64,
    pub class_stats: BTreeMap<String, i64>,
    pub class_stats_percent: BTreeMap<String, ClassShare>,
}

/// Per-class share of all detected objects
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClassShare {
    pub count: i64,
    /// `count / total_objects * 100`, rounded to two decimals
    pub percentage: f64,
}

/// Work-queue payload published at intake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJobMessage {
    pub task_id: Uuid,
    pub confidence_threshold: f64,
    pub preview_limit: i32,
}

/// Lossy progress notification fanned out to WebSocket subscribers.
/// The durable record is the task row.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProgressEvent {
    pub task_id: Uuid,
    pub status: AnalysisStatus,
    pub processed_files: i32,
    pub total_files: i32,
    #[serde(default)]
    pub failed_files: i32,
    #[serde(default)]
    pub defects_found: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!AnalysisStatus::Queued.is_terminal());
        assert!(!AnalysisStatus::Processing.is_terminal());
        assert!(AnalysisStatus::Completed.is_terminal());
        assert!(AnalysisStatus::Failed.is_terminal());
    }

    #[test]
    fn test_progress_event_round_trip() {
        let event = ProgressEvent {
            task_id: Uuid::new_v4(),
            status: AnalysisStatus::Processing,
            processed_files: 100,
            total_files: 120,
            failed_files: 0,
            defects_found: 7,
            message: Some("Обработано 100/120 файлов".to_string()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"status\":\"processing\""));
        let back: ProgressEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.processed_files, 100);
        assert_eq!(back.status, AnalysisStatus::Processing);
    }

    #[test]
    fn test_detection_wire_names_and_defective_set() {
        let detection = Detection {
            class_name: "damaged_insulator".to_string(),
            class_localized: "Повреждённый изолятор".to_string(),
            confidence: 0.91,
            bbox: vec![10, 10, 50, 50],
            bbox_size: BboxSize::from_dimensions(40, 40),
            defect_summary: DefectSummary {
                kind: "Повреждение".to_string(),
                severity: Some("high".to_string()),
                description: String::new(),
            },
            is_manual: false,
            detection_id: None,
        };
        assert!(detection.has_defective_class());
        assert!(detection.defect_summary.is_defective());

        let json = serde_json::to_value(&detection).unwrap();
        assert_eq!(json["class"], "damaged_insulator");
        assert_eq!(json["class_ru"], "Повреждённый изолятор");
        assert_eq!(json["defect_summary"]["type"], "Повреждение");
    }

    #[test]
    fn test_summary_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "detections": [],
            "statistics": {},
            "total_objects": 0,
            "defects_count": 0,
            "has_defects": false,
            "model_version": "yolov8n-2024"
        });
        let summary: ImageSummary = serde_json::from_value(raw).unwrap();
        let back = serde_json::to_value(&summary).unwrap();
        assert_eq!(back["model_version"], "yolov8n-2024");
    }

    #[test]
    fn test_small_bbox_flag() {
        assert!(BboxSize::from_dimensions(29, 100).is_small);
        assert!(!BboxSize::from_dimensions(30, 30).is_small);
    }
}
