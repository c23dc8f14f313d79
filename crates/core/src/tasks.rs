//! The task store: durable state machine for analysis tasks and their
//! image rows.
//!
//! Every mutator runs as a single transaction. Deletions report the blob
//! ids to garbage-collect before committing so callers can clean the blob
//! service afterwards (best effort, not transactional with it). Nothing in
//! here retries; retry policy belongs to callers.

use sqlx::{Pool, Postgres, postgres::PgPoolOptions};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::models::{AnalysisImage, AnalysisStatus, AnalysisTask};
use crate::summary::{ManualBox, merge_manual_boxes, replace_detections};

/// Task-store failure kinds. Writers roll back and surface `Storage`;
/// readers surface `StorageUnavailable`.
#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("storage write failed: {0}")]
    Storage(sqlx::Error),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(sqlx::Error),
    #[error("task not found")]
    TaskNotFound,
    #[error("image not found")]
    ImageNotFound,
    #[error("invalid stored summary: {0}")]
    InvalidSummary(serde_json::Error),
}

type Result<T> = std::result::Result<T, TaskStoreError>;

fn write_err(e: sqlx::Error) -> TaskStoreError {
    TaskStoreError::Storage(e)
}

fn read_err(e: sqlx::Error) -> TaskStoreError {
    match e {
        sqlx::Error::RowNotFound => TaskStoreError::TaskNotFound,
        other => TaskStoreError::StorageUnavailable(other),
    }
}

const TASK_COLUMNS: &str = "task_id, status, route_name, total_files, total_bytes, \
     processed_files, failed_files, defects_found, confidence_threshold, preview_limit, \
     message, originals_archive_file_id, results_archive_file_id, task_metadata, \
     created_at, updated_at, completed_at";

const IMAGE_COLUMNS: &str = "image_id, task_id, file_id, file_name, file_size, status, \
     result_file_id, is_preview, summary, error_message, created_at, updated_at";

/// Fields accepted by [`update_task_progress`]; any subset may be set.
#[derive(Debug, Default, Clone)]
pub struct TaskProgressUpdate {
    pub processed_files: Option<i32>,
    pub failed_files: Option<i32>,
    pub defects_found: Option<i32>,
    pub status: Option<AnalysisStatus>,
    pub message: Option<String>,
}

/// Fields accepted by [`update_image`]; any subset may be set.
#[derive(Debug, Default, Clone)]
pub struct ImageUpdate {
    pub status: Option<AnalysisStatus>,
    pub summary: Option<crate::models::ImageSummary>,
    pub is_preview: Option<bool>,
    pub result_file_id: Option<Uuid>,
    pub error_message: Option<String>,
}

/// Archive/metadata fields settable on a task
#[derive(Debug, Default, Clone)]
pub struct TaskArchives {
    pub originals_archive_file_id: Option<Uuid>,
    pub results_archive_file_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
}

/// A file to register under a task
#[derive(Debug, Clone)]
pub struct NewImage {
    pub file_id: Uuid,
    pub file_name: String,
    pub file_size: i64,
}

pub async fn initialize_pool(config: &DatabaseConfig) -> anyhow::Result<Pool<Postgres>> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .test_before_acquire(false) // Skip pre-acquire health check for lower latency
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                // Session-level timeouts to prevent runaway queries and idle transactions
                sqlx::query("SET statement_timeout = '30s'")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("SET idle_in_transaction_session_timeout = '60s'")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&config.url)
        .await?;

    sqlx::migrate!("src/tasks/migrations").run(&pool).await?;

    Ok(pool)
}

#[tracing::instrument(name = "database.create_task", skip(pool), fields(database.system = "postgresql", database.operation = "INSERT", total_files = total_files))]
pub async fn create_task(
    pool: &Pool<Postgres>,
    total_files: i32,
    total_bytes: i64,
    confidence_threshold: f64,
    preview_limit: i32,
    route_name: Option<&str>,
) -> Result<AnalysisTask> {
    let query = format!(
        "INSERT INTO analysis_tasks \
            (total_files, total_bytes, confidence_threshold, preview_limit, route_name) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING {TASK_COLUMNS}"
    );
    sqlx::query_as::<_, AnalysisTask>(&query)
        .bind(total_files)
        .bind(total_bytes)
        .bind(confidence_threshold)
        .bind(preview_limit)
        .bind(route_name)
        .fetch_one(pool)
        .await
        .map_err(write_err)
}

/// Bulk-insert image rows for a task in one statement, preserving input
/// order so callers can line rows up with their source entries.
#[tracing::instrument(name = "database.add_images", skip(pool, images), fields(database.system = "postgresql", database.operation = "INSERT", task_id = %task_id, image_count = images.len()))]
pub async fn add_images(
    pool: &Pool<Postgres>,
    task_id: Uuid,
    images: &[NewImage],
) -> Result<Vec<AnalysisImage>> {
    if images.is_empty() {
        return Ok(Vec::new());
    }

    let file_ids: Vec<Uuid> = images.iter().map(|i| i.file_id).collect();
    let file_names: Vec<String> = images.iter().map(|i| i.file_name.clone()).collect();
    let file_sizes: Vec<i64> = images.iter().map(|i| i.file_size).collect();

    let query = format!(
        "INSERT INTO analysis_images (task_id, file_id, file_name, file_size) \
         SELECT $1, ids.file_id, ids.file_name, ids.file_size \
         FROM UNNEST($2::uuid[], $3::text[], $4::bigint[]) \
             WITH ORDINALITY AS ids(file_id, file_name, file_size, ord) \
         ORDER BY ids.ord \
         RETURNING {IMAGE_COLUMNS}"
    );

    let mut tx = pool.begin().await.map_err(write_err)?;
    let rows = sqlx::query_as::<_, AnalysisImage>(&query)
        .bind(task_id)
        .bind(&file_ids)
        .bind(&file_names)
        .bind(&file_sizes)
        .fetch_all(&mut *tx)
        .await
        .map_err(write_err)?;
    tx.commit().await.map_err(write_err)?;

    Ok(rows)
}

#[tracing::instrument(name = "database.get_task", skip(pool), fields(database.system = "postgresql", database.operation = "SELECT", task_id = %task_id))]
pub async fn get_task(pool: &Pool<Postgres>, task_id: Uuid) -> Result<Option<AnalysisTask>> {
    let query = format!("SELECT {TASK_COLUMNS} FROM analysis_tasks WHERE task_id = $1");
    sqlx::query_as::<_, AnalysisTask>(&query)
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .map_err(read_err)
}

#[tracing::instrument(name = "database.list_tasks", skip(pool), fields(database.system = "postgresql", database.operation = "SELECT", limit = limit))]
pub async fn list_tasks(pool: &Pool<Postgres>, limit: i64) -> Result<Vec<AnalysisTask>> {
    let query = format!(
        "SELECT {TASK_COLUMNS} FROM analysis_tasks ORDER BY created_at DESC LIMIT $1"
    );
    sqlx::query_as::<_, AnalysisTask>(&query)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(read_err)
}

/// Paginated image rows for a task, stable by creation order, plus the
/// total row count.
#[tracing::instrument(name = "database.get_task_images", skip(pool), fields(database.system = "postgresql", database.operation = "SELECT", task_id = %task_id, skip = skip, limit = limit))]
pub async fn get_task_images(
    pool: &Pool<Postgres>,
    task_id: Uuid,
    skip: i64,
    limit: i64,
) -> Result<(Vec<AnalysisImage>, i64)> {
    let total: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM analysis_images WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(pool)
            .await
            .map_err(read_err)?;

    let query = format!(
        "SELECT {IMAGE_COLUMNS} FROM analysis_images \
         WHERE task_id = $1 ORDER BY created_at ASC OFFSET $2 LIMIT $3"
    );
    let images = sqlx::query_as::<_, AnalysisImage>(&query)
        .bind(task_id)
        .bind(skip)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(read_err)?;

    Ok((images, total))
}

/// Image rows promoted to previews, creation order
#[tracing::instrument(name = "database.get_preview_images", skip(pool), fields(database.system = "postgresql", database.operation = "SELECT", task_id = %task_id))]
pub async fn get_preview_images(
    pool: &Pool<Postgres>,
    task_id: Uuid,
    limit: i64,
) -> Result<Vec<AnalysisImage>> {
    let query = format!(
        "SELECT {IMAGE_COLUMNS} FROM analysis_images \
         WHERE task_id = $1 AND is_preview ORDER BY created_at ASC LIMIT $2"
    );
    sqlx::query_as::<_, AnalysisImage>(&query)
        .bind(task_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(read_err)
}

#[tracing::instrument(name = "database.get_image", skip(pool), fields(database.system = "postgresql", database.operation = "SELECT", task_id = %task_id, image_id = %image_id))]
pub async fn get_image(
    pool: &Pool<Postgres>,
    task_id: Uuid,
    image_id: Uuid,
) -> Result<Option<AnalysisImage>> {
    let query = format!(
        "SELECT {IMAGE_COLUMNS} FROM analysis_images WHERE image_id = $1 AND task_id = $2"
    );
    sqlx::query_as::<_, AnalysisImage>(&query)
        .bind(image_id)
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .map_err(read_err)
}

/// Apply any subset of progress fields. Setting a terminal status stamps
/// `completed_at`.
#[tracing::instrument(name = "database.update_task_progress", skip(pool, update), fields(database.system = "postgresql", database.operation = "UPDATE", task_id = %task_id))]
pub async fn update_task_progress(
    pool: &Pool<Postgres>,
    task_id: Uuid,
    update: TaskProgressUpdate,
) -> Result<AnalysisTask> {
    let query = format!(
        "UPDATE analysis_tasks SET \
            processed_files = COALESCE($2, processed_files), \
            failed_files = COALESCE($3, failed_files), \
            defects_found = COALESCE($4, defects_found), \
            status = COALESCE($5, status), \
            message = COALESCE($6, message), \
            completed_at = CASE \
                WHEN $5::analysis_status IN ('completed'::analysis_status, 'failed'::analysis_status) \
                THEN NOW() ELSE completed_at END, \
            updated_at = NOW() \
         WHERE task_id = $1 \
         RETURNING {TASK_COLUMNS}"
    );
    sqlx::query_as::<_, AnalysisTask>(&query)
        .bind(task_id)
        .bind(update.processed_files)
        .bind(update.failed_files)
        .bind(update.defects_found)
        .bind(update.status)
        .bind(update.message)
        .fetch_optional(pool)
        .await
        .map_err(write_err)?
        .ok_or(TaskStoreError::TaskNotFound)
}

/// Apply any subset of image fields
#[tracing::instrument(name = "database.update_image", skip(pool, update), fields(database.system = "postgresql", database.operation = "UPDATE", image_id = %image_id))]
pub async fn update_image(
    pool: &Pool<Postgres>,
    image_id: Uuid,
    update: ImageUpdate,
) -> Result<AnalysisImage> {
    let summary_json = match &update.summary {
        Some(summary) => Some(serde_json::to_value(summary).map_err(TaskStoreError::InvalidSummary)?),
        None => None,
    };

    let query = format!(
        "UPDATE analysis_images SET \
            status = COALESCE($2, status), \
            summary = COALESCE($3, summary), \
            is_preview = COALESCE($4, is_preview), \
            result_file_id = COALESCE($5, result_file_id), \
            error_message = COALESCE($6, error_message), \
            updated_at = NOW() \
         WHERE image_id = $1 \
         RETURNING {IMAGE_COLUMNS}"
    );
    sqlx::query_as::<_, AnalysisImage>(&query)
        .bind(image_id)
        .bind(update.status)
        .bind(summary_json)
        .bind(update.is_preview)
        .bind(update.result_file_id)
        .bind(update.error_message)
        .fetch_optional(pool)
        .await
        .map_err(write_err)?
        .ok_or(TaskStoreError::ImageNotFound)
}

/// Merge user-drawn boxes into an image's summary under a row lock.
///
/// The read-modify-write runs inside one transaction with
/// `SELECT ... FOR UPDATE`, so a concurrently running worker and the HTTP
/// annotate path serialize on the row instead of clobbering each other.
#[tracing::instrument(name = "database.merge_image_summary", skip(pool, boxes), fields(database.system = "postgresql", database.operation = "UPDATE", task_id = %task_id, image_id = %image_id, box_count = boxes.len()))]
pub async fn merge_image_summary(
    pool: &Pool<Postgres>,
    task_id: Uuid,
    image_id: Uuid,
    boxes: &[ManualBox],
    new_result_file_id: Option<Uuid>,
) -> Result<AnalysisImage> {
    let mut tx = pool.begin().await.map_err(write_err)?;

    let locked: Option<(Option<serde_json::Value>,)> = sqlx::query_as(
        "SELECT summary FROM analysis_images \
         WHERE image_id = $1 AND task_id = $2 FOR UPDATE",
    )
    .bind(image_id)
    .bind(task_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(write_err)?;

    let Some((summary_json,)) = locked else {
        return Err(TaskStoreError::ImageNotFound);
    };

    let mut summary = match summary_json {
        Some(value) => serde_json::from_value(value).map_err(TaskStoreError::InvalidSummary)?,
        None => crate::models::ImageSummary::default(),
    };
    merge_manual_boxes(&mut summary, boxes);
    let merged = serde_json::to_value(&summary).map_err(TaskStoreError::InvalidSummary)?;

    let query = format!(
        "UPDATE analysis_images SET \
            summary = $2, \
            result_file_id = COALESCE($3, result_file_id), \
            updated_at = NOW() \
         WHERE image_id = $1 \
         RETURNING {IMAGE_COLUMNS}"
    );
    let image = sqlx::query_as::<_, AnalysisImage>(&query)
        .bind(image_id)
        .bind(merged)
        .bind(new_result_file_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(write_err)?;

    tx.commit().await.map_err(write_err)?;
    Ok(image)
}

/// Replace an image's detection list wholesale (the metrics endpoint),
/// under the same row lock as the manual merge.
#[tracing::instrument(name = "database.replace_image_detections", skip(pool, detections), fields(database.system = "postgresql", database.operation = "UPDATE", task_id = %task_id, image_id = %image_id))]
pub async fn replace_image_detections(
    pool: &Pool<Postgres>,
    task_id: Uuid,
    image_id: Uuid,
    detections: Vec<crate::models::Detection>,
    total_objects: Option<i64>,
    defects_count: Option<i64>,
    has_defects: Option<bool>,
    statistics: Option<std::collections::BTreeMap<String, i64>>,
) -> Result<AnalysisImage> {
    let mut tx = pool.begin().await.map_err(write_err)?;

    let locked: Option<(Option<serde_json::Value>,)> = sqlx::query_as(
        "SELECT summary FROM analysis_images \
         WHERE image_id = $1 AND task_id = $2 FOR UPDATE",
    )
    .bind(image_id)
    .bind(task_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(write_err)?;

    let Some((summary_json,)) = locked else {
        return Err(TaskStoreError::ImageNotFound);
    };

    let mut summary: crate::models::ImageSummary = match summary_json {
        Some(value) => serde_json::from_value(value).map_err(TaskStoreError::InvalidSummary)?,
        None => Default::default(),
    };
    replace_detections(&mut summary, detections, total_objects, defects_count, has_defects);
    if let Some(stats) = statistics {
        summary.statistics = stats;
    }
    let replaced = serde_json::to_value(&summary).map_err(TaskStoreError::InvalidSummary)?;

    let query = format!(
        "UPDATE analysis_images SET summary = $2, updated_at = NOW() \
         WHERE image_id = $1 \
         RETURNING {IMAGE_COLUMNS}"
    );
    let image = sqlx::query_as::<_, AnalysisImage>(&query)
        .bind(image_id)
        .bind(replaced)
        .fetch_one(&mut *tx)
        .await
        .map_err(write_err)?;

    tx.commit().await.map_err(write_err)?;
    Ok(image)
}

#[tracing::instrument(name = "database.set_task_archives", skip(pool, archives), fields(database.system = "postgresql", database.operation = "UPDATE", task_id = %task_id))]
pub async fn set_task_archives(
    pool: &Pool<Postgres>,
    task_id: Uuid,
    archives: TaskArchives,
) -> Result<AnalysisTask> {
    let query = format!(
        "UPDATE analysis_tasks SET \
            originals_archive_file_id = COALESCE($2, originals_archive_file_id), \
            results_archive_file_id = COALESCE($3, results_archive_file_id), \
            task_metadata = COALESCE($4, task_metadata), \
            updated_at = NOW() \
         WHERE task_id = $1 \
         RETURNING {TASK_COLUMNS}"
    );
    sqlx::query_as::<_, AnalysisTask>(&query)
        .bind(task_id)
        .bind(archives.originals_archive_file_id)
        .bind(archives.results_archive_file_id)
        .bind(archives.metadata)
        .fetch_optional(pool)
        .await
        .map_err(write_err)?
        .ok_or(TaskStoreError::TaskNotFound)
}

/// Clear a task's staging-archive reference after the worker deletes the blob
#[tracing::instrument(name = "database.clear_originals_archive", skip(pool), fields(database.system = "postgresql", database.operation = "UPDATE", task_id = %task_id))]
pub async fn clear_originals_archive(pool: &Pool<Postgres>, task_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE analysis_tasks SET originals_archive_file_id = NULL, updated_at = NOW() \
         WHERE task_id = $1",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .map_err(write_err)?;
    Ok(())
}

/// Delete one image row; decrements the parent task's totals and returns
/// the blob ids (original + annotated result) to garbage-collect.
#[tracing::instrument(name = "database.delete_image", skip(pool), fields(database.system = "postgresql", database.operation = "DELETE", task_id = %task_id, image_id = %image_id))]
pub async fn delete_image(
    pool: &Pool<Postgres>,
    task_id: Uuid,
    image_id: Uuid,
) -> Result<Vec<Uuid>> {
    let mut tx = pool.begin().await.map_err(write_err)?;

    let deleted: Option<(Uuid, Option<Uuid>, i64)> = sqlx::query_as(
        "DELETE FROM analysis_images WHERE image_id = $1 AND task_id = $2 \
         RETURNING file_id, result_file_id, file_size",
    )
    .bind(image_id)
    .bind(task_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(write_err)?;

    let Some((file_id, result_file_id, file_size)) = deleted else {
        return Err(TaskStoreError::ImageNotFound);
    };

    sqlx::query(
        "UPDATE analysis_tasks SET \
            total_files = GREATEST(total_files - 1, 0), \
            total_bytes = GREATEST(total_bytes - $2, 0), \
            updated_at = NOW() \
         WHERE task_id = $1",
    )
    .bind(task_id)
    .bind(file_size)
    .execute(&mut *tx)
    .await
    .map_err(write_err)?;

    tx.commit().await.map_err(write_err)?;

    let mut blob_ids = vec![file_id];
    blob_ids.extend(result_file_id);
    Ok(blob_ids)
}

/// Delete a task and (by cascade) all of its image rows. Returns every
/// referenced blob id: originals, annotated results and both archives.
#[tracing::instrument(name = "database.delete_task", skip(pool), fields(database.system = "postgresql", database.operation = "DELETE", task_id = %task_id))]
pub async fn delete_task(pool: &Pool<Postgres>, task_id: Uuid) -> Result<Vec<Uuid>> {
    let mut tx = pool.begin().await.map_err(write_err)?;

    let image_refs: Vec<(Uuid, Option<Uuid>)> =
        sqlx::query_as("SELECT file_id, result_file_id FROM analysis_images WHERE task_id = $1")
            .bind(task_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(write_err)?;

    let task_refs: Option<(Option<Uuid>, Option<Uuid>)> = sqlx::query_as(
        "DELETE FROM analysis_tasks WHERE task_id = $1 \
         RETURNING originals_archive_file_id, results_archive_file_id",
    )
    .bind(task_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(write_err)?;

    let Some((originals_archive, results_archive)) = task_refs else {
        return Err(TaskStoreError::TaskNotFound);
    };

    tx.commit().await.map_err(write_err)?;

    let mut blob_ids = Vec::with_capacity(image_refs.len() * 2 + 2);
    for (file_id, result_file_id) in image_refs {
        blob_ids.push(file_id);
        blob_ids.extend(result_file_id);
    }
    blob_ids.extend(originals_archive);
    blob_ids.extend(results_archive);
    Ok(blob_ids)
}
