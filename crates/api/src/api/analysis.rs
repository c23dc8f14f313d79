use actix_web::{HttpResponse, delete, get, post, web, web::Data};
use base64::Engine;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::models::{
    AnnotateRequest, HistoryQuery, ImageMetric, ImageMetricsRequest, ImageMetricsResponse,
    ImageMetricsSaved, TaskImageResponse, TaskImagesQuery, TaskImagesResponse, TaskListItem,
    TaskResponse,
};
use crate::auth::AuthenticatedUser;
use crate::errors::ApiError;
use lineguard_core::annotator::AnnotatorClient;
use lineguard_core::files::FilesClient;
use lineguard_core::models::AnalysisImage;
use lineguard_core::render;
use lineguard_core::tasks;

/// Upper bound on the history page size
const MAX_HISTORY_LIMIT: i64 = 100;
/// Upper bound on the images page size
const MAX_IMAGES_LIMIT: i64 = 500;
/// How many preview rows a task response carries
const TASK_PREVIEW_ROWS: i64 = 10;

#[utoipa::path(
    params(("task_id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "OK", body = TaskResponse),
        (status = 404, description = "Task not found"),
    ),
    tag = "Analysis",
)]
#[get("/analysis/tasks/{task_id}")]
#[tracing::instrument(name = "get_task", skip(user, postgres_pool), fields(user = %user, task_id = %task_id))]
pub(crate) async fn get_task(
    user: AuthenticatedUser,
    postgres_pool: Data<Pool<Postgres>>,
    task_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let pool = postgres_pool.into_inner();
    let task_id = task_id.into_inner();

    let task = tasks::get_task(&pool, task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Задача не найдена".to_string()))?;
    let previews = tasks::get_preview_images(&pool, task_id, TASK_PREVIEW_ROWS).await?;

    Ok(HttpResponse::Ok().json(TaskResponse::from_task(task, previews)))
}

#[utoipa::path(
    params(("limit" = Option<i64>, Query, description = "Page size (1..=100, default 20)")),
    responses(
        (status = 200, description = "OK", body = Vec<TaskListItem>),
        (status = 422, description = "Limit out of range"),
    ),
    tag = "Analysis",
)]
#[get("/analysis/history")]
#[tracing::instrument(name = "list_tasks", skip(user, postgres_pool), fields(user = %user, limit = query.limit))]
pub(crate) async fn list_tasks(
    user: AuthenticatedUser,
    postgres_pool: Data<Pool<Postgres>>,
    web::Query(query): web::Query<HistoryQuery>,
) -> Result<HttpResponse, ApiError> {
    if query.limit < 1 || query.limit > MAX_HISTORY_LIMIT {
        return Err(ApiError::Unprocessable(format!(
            "limit must be between 1 and {MAX_HISTORY_LIMIT}"
        )));
    }

    let items = tasks::list_tasks(&postgres_pool.into_inner(), query.limit).await?;
    let response: Vec<TaskListItem> = items.into_iter().map(TaskListItem::from).collect();
    Ok(HttpResponse::Ok().json(response))
}

#[utoipa::path(
    params(
        ("task_id" = Uuid, Path, description = "Task ID"),
        ("skip" = Option<i64>, Query, description = "Rows to skip"),
        ("limit" = Option<i64>, Query, description = "Page size (1..=500, default 100)"),
        ("include_thumbnails" = Option<bool>, Query, description = "Attach base64 JPEG thumbnails"),
    ),
    responses(
        (status = 200, description = "OK", body = TaskImagesResponse),
        (status = 404, description = "Task not found"),
        (status = 422, description = "Pagination parameter out of range"),
    ),
    tag = "Analysis",
)]
#[get("/analysis/tasks/{task_id}/images")]
#[tracing::instrument(name = "get_task_images", skip(user, postgres_pool, files_client), fields(user = %user, task_id = %task_id, skip = query.skip, limit = query.limit))]
pub(crate) async fn get_task_images(
    user: AuthenticatedUser,
    postgres_pool: Data<Pool<Postgres>>,
    files_client: Data<FilesClient>,
    task_id: web::Path<Uuid>,
    web::Query(query): web::Query<TaskImagesQuery>,
) -> Result<HttpResponse, ApiError> {
    if query.skip < 0 {
        return Err(ApiError::Unprocessable("skip must not be negative".to_string()));
    }
    if query.limit < 1 || query.limit > MAX_IMAGES_LIMIT {
        return Err(ApiError::Unprocessable(format!(
            "limit must be between 1 and {MAX_IMAGES_LIMIT}"
        )));
    }

    let pool = postgres_pool.into_inner();
    let task_id = task_id.into_inner();

    tasks::get_task(&pool, task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Задача не найдена".to_string()))?;

    let (images, total) = tasks::get_task_images(&pool, task_id, query.skip, query.limit).await?;

    let thumbnails = if query.include_thumbnails && !images.is_empty() {
        build_thumbnails(&files_client, &images).await
    } else {
        HashMap::new()
    };

    let response = TaskImagesResponse {
        total,
        skip: query.skip,
        limit: query.limit,
        images: images
            .into_iter()
            .map(|image| {
                let thumbnail_source = image.result_file_id.unwrap_or(image.file_id);
                let thumbnail = thumbnails.get(&thumbnail_source).cloned();
                TaskImageResponse::from_row(image, thumbnail)
            })
            .collect(),
    };
    Ok(HttpResponse::Ok().json(response))
}

/// Batch-download annotated results (falling back to originals) and render
/// them down to data-URI thumbnails. Best effort: a failed download or an
/// undecodable image just means no thumbnail for that row.
async fn build_thumbnails(
    files_client: &FilesClient,
    images: &[AnalysisImage],
) -> HashMap<Uuid, String> {
    let file_ids: Vec<Uuid> = images
        .iter()
        .map(|image| image.result_file_id.unwrap_or(image.file_id))
        .collect();

    let downloaded = match files_client.batch_download(&file_ids).await {
        Ok(files) => files,
        Err(e) => {
            warn!("thumbnail batch download failed: {}", e);
            return HashMap::new();
        }
    };

    let mut thumbnails = HashMap::with_capacity(downloaded.len());
    for file in downloaded {
        match render::thumbnail_jpeg(&file.bytes) {
            Ok(jpeg) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(jpeg);
                thumbnails.insert(file.file_id, format!("data:image/jpeg;base64,{encoded}"));
            }
            Err(e) => {
                warn!(file_id = %file.file_id, "failed to render thumbnail: {}", e);
            }
        }
    }
    thumbnails
}

#[utoipa::path(
    params(
        ("task_id" = Uuid, Path, description = "Task ID"),
        ("image_id" = Uuid, Path, description = "Image ID"),
    ),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Task or image not found"),
    ),
    tag = "Analysis",
)]
#[delete("/analysis/tasks/{task_id}/images/{image_id}")]
#[tracing::instrument(name = "delete_task_image", skip(user, postgres_pool, files_client), fields(user = %user, task_id = %path.0, image_id = %path.1))]
pub(crate) async fn delete_task_image(
    user: AuthenticatedUser,
    postgres_pool: Data<Pool<Postgres>>,
    files_client: Data<FilesClient>,
    path: web::Path<(Uuid, Uuid)>,
) -> Result<HttpResponse, ApiError> {
    let (task_id, image_id) = path.into_inner();
    let pool = postgres_pool.into_inner();

    tasks::get_task(&pool, task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Задача не найдена".to_string()))?;

    let blob_ids = tasks::delete_image(&pool, task_id, image_id).await?;
    delete_blobs_best_effort(&files_client, blob_ids).await;

    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    params(("task_id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Task not found"),
    ),
    tag = "Analysis",
)]
#[delete("/analysis/tasks/{task_id}")]
#[tracing::instrument(name = "delete_task", skip(user, postgres_pool, files_client), fields(user = %user, task_id = %task_id))]
pub(crate) async fn delete_task(
    user: AuthenticatedUser,
    postgres_pool: Data<Pool<Postgres>>,
    files_client: Data<FilesClient>,
    task_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let task_id = task_id.into_inner();
    let pool = postgres_pool.into_inner();

    tasks::get_task(&pool, task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Задача не найдена".to_string()))?;

    let blob_ids = tasks::delete_task(&pool, task_id).await?;
    info!(task_id = %task_id, blob_count = blob_ids.len(), "task deleted, collecting blobs");
    delete_blobs_best_effort(&files_client, blob_ids).await;

    Ok(HttpResponse::NoContent().finish())
}

/// Blob cleanup after a row deletion. The rows are already gone, so blob
/// failures are logged and swallowed; a missing blob is not an error.
async fn delete_blobs_best_effort(files_client: &FilesClient, blob_ids: Vec<Uuid>) {
    for blob_id in blob_ids {
        if let Err(e) = files_client.delete(blob_id, true).await {
            warn!(blob_id = %blob_id, "failed to delete blob: {}", e);
        }
    }
}

#[utoipa::path(
    request_body = AnnotateRequest,
    params(
        ("task_id" = Uuid, Path, description = "Task ID"),
        ("image_id" = Uuid, Path, description = "Image ID"),
    ),
    responses(
        (status = 200, description = "Annotated image stored"),
        (status = 404, description = "Task or image not found"),
        (status = 503, description = "Annotation service unavailable"),
    ),
    tag = "Analysis",
)]
#[post("/analysis/tasks/{task_id}/images/{image_id}/annotate")]
#[tracing::instrument(name = "annotate_image", skip(user, postgres_pool, annotator_client, request), fields(user = %user, task_id = %path.0, image_id = %path.1, box_count = request.bboxes.len()))]
pub(crate) async fn annotate_image(
    user: AuthenticatedUser,
    postgres_pool: Data<Pool<Postgres>>,
    annotator_client: Data<AnnotatorClient>,
    path: web::Path<(Uuid, Uuid)>,
    web::Json(request): web::Json<AnnotateRequest>,
) -> Result<HttpResponse, ApiError> {
    if request.bboxes.is_empty() {
        return Err(ApiError::Validation("at least one bbox is required".to_string()));
    }

    let (task_id, image_id) = path.into_inner();
    let pool = postgres_pool.into_inner();

    tasks::get_task(&pool, task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Задача не найдена".to_string()))?;
    let image = tasks::get_image(&pool, task_id, image_id)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound("Изображение не найдено или не принадлежит задаче".to_string())
        })?;

    // Draw on top of the annotated result when one exists
    let annotate_target = image.result_file_id.unwrap_or(image.file_id);
    let project_id = request
        .project_id
        .unwrap_or_else(|| task_id.to_string());
    let file_type = request
        .file_type
        .unwrap_or_else(|| "ANALYSIS_RESULT".to_string());

    let outcome = annotator_client
        .annotate(annotate_target, &request.bboxes, &project_id, &file_type)
        .await?;

    match outcome.file_id {
        Some(new_file_id) => {
            tasks::merge_image_summary(&pool, task_id, image_id, &request.bboxes, Some(new_file_id))
                .await?;
        }
        None => {
            warn!(image_id = %image_id, "annotator returned no file id, summary not merged");
        }
    }

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": outcome.success,
        "file_id": outcome.file_id,
        "filename": outcome.filename,
        "message": outcome.message.unwrap_or_else(|| "Image annotated successfully".to_string()),
    })))
}

#[utoipa::path(
    request_body = ImageMetricsRequest,
    params(
        ("task_id" = Uuid, Path, description = "Task ID"),
        ("image_id" = Uuid, Path, description = "Image ID"),
    ),
    responses(
        (status = 200, description = "Metrics stored", body = ImageMetricsSaved),
        (status = 404, description = "Task or image not found"),
    ),
    tag = "Analysis",
)]
#[post("/analysis/tasks/{task_id}/images/{image_id}/metrics")]
#[tracing::instrument(name = "save_image_metrics", skip(user, postgres_pool, request), fields(user = %user, task_id = %path.0, image_id = %path.1, metric_count = request.metrics.len()))]
pub(crate) async fn save_image_metrics(
    user: AuthenticatedUser,
    postgres_pool: Data<Pool<Postgres>>,
    path: web::Path<(Uuid, Uuid)>,
    web::Json(request): web::Json<ImageMetricsRequest>,
) -> Result<HttpResponse, ApiError> {
    let (task_id, image_id) = path.into_inner();
    let pool = postgres_pool.into_inner();

    tasks::get_task(&pool, task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Задача не найдена".to_string()))?;

    let detections: Vec<_> = request
        .metrics
        .into_iter()
        .map(ImageMetric::into_detection)
        .collect();
    let metrics_count = detections.len();

    let image = tasks::replace_image_detections(
        &pool,
        task_id,
        image_id,
        detections,
        request.total_objects,
        request.defects_count,
        request.has_defects,
        request.statistics,
    )
    .await?;

    let summary = image.summary.unwrap_or_default();
    Ok(HttpResponse::Ok().json(ImageMetricsSaved {
        image_id,
        metrics_count,
        total_objects: summary.total_objects,
        defects_count: summary.defects_count,
        has_defects: summary.has_defects,
    }))
}

#[utoipa::path(
    params(
        ("task_id" = Uuid, Path, description = "Task ID"),
        ("image_id" = Uuid, Path, description = "Image ID"),
    ),
    responses(
        (status = 200, description = "OK", body = ImageMetricsResponse),
        (status = 404, description = "Task or image not found"),
    ),
    tag = "Analysis",
)]
#[get("/analysis/tasks/{task_id}/images/{image_id}/metrics")]
#[tracing::instrument(name = "get_image_metrics", skip(user, postgres_pool), fields(user = %user, task_id = %path.0, image_id = %path.1))]
pub(crate) async fn get_image_metrics(
    user: AuthenticatedUser,
    postgres_pool: Data<Pool<Postgres>>,
    path: web::Path<(Uuid, Uuid)>,
) -> Result<HttpResponse, ApiError> {
    let (task_id, image_id) = path.into_inner();
    let pool = postgres_pool.into_inner();

    tasks::get_task(&pool, task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Задача не найдена".to_string()))?;
    let image = tasks::get_image(&pool, task_id, image_id)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound("Изображение не найдено или не принадлежит задаче".to_string())
        })?;

    let summary = image.summary.unwrap_or_default();
    let metrics: Vec<ImageMetric> = summary
        .detections
        .iter()
        .map(ImageMetric::from_detection)
        .collect();

    Ok(HttpResponse::Ok().json(ImageMetricsResponse {
        image_id,
        metrics,
        total_objects: summary.total_objects,
        defects_count: summary.defects_count,
        has_defects: summary.has_defects,
        statistics: summary.statistics,
    }))
}
