use actix_multipart::form::MultipartForm;
use actix_web::{HttpResponse, post, web, web::Data};
use sqlx::{Pool, Postgres};
use tracing::{error, info};

use crate::analysis::models::{BatchQuery, BatchUpload, TaskCreateResponse};
use crate::auth::AuthenticatedUser;
use crate::errors::ApiError;
use lineguard_core::archive::pack_staging_archive;
use lineguard_core::config::{BatchLimitsConfig, NatsConfig};
use lineguard_core::files::{FileKind, FilesClient, UploadItem};
use lineguard_core::models::AnalysisJobMessage;
use lineguard_core::tasks::{self, NewImage, TaskArchives};
use lineguard_core::{nats, validation};

/// Accept a batch of aerial images for analysis.
///
/// The first `UPLOAD_PREVIEW_LIMIT` files are uploaded individually and get
/// image rows right away; the remainder is shipped to the worker as one
/// staging ZIP. The work-queue message is published only after every row
/// and the staging blob exist — no partial state is ever enqueued.
#[utoipa::path(
    request_body(content = BatchUpload, content_type = "multipart/form-data"),
    params(
        ("conf" = Option<f64>, Query, description = "Confidence threshold (0.0..=1.0, default 0.35)"),
        ("route_name" = Option<String>, Query, description = "Route label, up to 250 characters"),
        ("preview_limit" = Option<i64>, Query, description = "Previews kept for the history view (1..=10)"),
    ),
    responses(
        (status = 202, description = "Task accepted", body = TaskCreateResponse),
        (status = 400, description = "Bad Request (file count, extension or size)"),
        (status = 422, description = "Query parameter out of range"),
        (status = 503, description = "A collaborating service is unavailable"),
    ),
    tag = "Analysis",
)]
#[post("/predict/batch")]
#[tracing::instrument(name = "create_batch_task", skip_all, fields(user = %user, file_count = payload.files.len(), conf = query.conf))]
pub(crate) async fn create_batch_task(
    user: AuthenticatedUser,
    postgres_pool: Data<Pool<Postgres>>,
    files_client: Data<FilesClient>,
    nats_client: Data<async_nats::Client>,
    nats_config: Data<NatsConfig>,
    limits: Data<BatchLimitsConfig>,
    web::Query(query): web::Query<BatchQuery>,
    MultipartForm(payload): MultipartForm<BatchUpload>,
) -> Result<HttpResponse, ApiError> {
    validation::validate_file_count(payload.files.len(), limits.max_batch_files)?;
    validation::validate_confidence(query.conf)?;
    if let Some(route_name) = &query.route_name {
        validation::validate_route_name(route_name)?;
    }
    let requested_previews = query.preview_limit.unwrap_or(limits.preview_limit as i64);
    validation::validate_preview_limit(requested_previews, limits.preview_limit)?;
    let preview_limit = requested_previews.min(limits.preview_limit as i64) as i32;

    // Name and measure every file before touching any collaborator
    let mut total_bytes: u64 = 0;
    let mut file_names = Vec::with_capacity(payload.files.len());
    for (idx, file) in payload.files.iter().enumerate() {
        let file_name = file
            .file_name
            .clone()
            .unwrap_or_else(|| format!("file_{idx}"));
        validation::validate_file_name(&file_name)?;
        total_bytes += file.data.len() as u64;
        file_names.push(file_name);
    }
    validation::validate_total_size(total_bytes, limits.max_batch_size_bytes)?;

    let pool = postgres_pool.into_inner();
    let task = tasks::create_task(
        &pool,
        payload.files.len() as i32,
        total_bytes as i64,
        query.conf,
        preview_limit,
        query.route_name.as_deref(),
    )
    .await?;

    // Partition: the first N files become preview rows, the rest travel in
    // one staging archive the worker unpacks.
    let preview_count = payload.files.len().min(limits.upload_preview_limit);
    let project_id = task.task_id.to_string();

    let mut preview_items = Vec::with_capacity(preview_count);
    let mut bulk_files: Vec<(String, Vec<u8>)> = Vec::new();
    for (idx, file) in payload.files.into_iter().enumerate() {
        let file_name = std::path::Path::new(&file_names[idx])
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&file_names[idx])
            .to_string();
        let content_type = mime_guess::from_path(&file_name)
            .first_or_octet_stream()
            .to_string();
        if idx < preview_count {
            preview_items.push(UploadItem {
                bytes: file.data.to_vec(),
                file_name,
                content_type,
            });
        } else {
            bulk_files.push((file_name, file.data.to_vec()));
        }
    }

    if !preview_items.is_empty() {
        let uploaded = files_client
            .batch_upload(preview_items, &project_id, FileKind::Original)
            .await?;
        let rows: Vec<NewImage> = uploaded
            .files
            .into_iter()
            .map(|blob| NewImage {
                file_id: blob.id,
                file_name: blob.file_name,
                file_size: blob.file_size,
            })
            .collect();
        tasks::add_images(&pool, task.task_id, &rows).await?;
    }

    if !bulk_files.is_empty() {
        let archive_bytes = tokio::task::spawn_blocking(move || pack_staging_archive(&bulk_files))
            .await
            .map_err(|e| ApiError::Internal(format!("staging archive task failed: {e}")))?
            .map_err(|e| ApiError::Internal(format!("failed to build staging archive: {e}")))?;

        let archive_blob = files_client
            .upload(
                archive_bytes,
                &format!("{}_temp_uploaded_archive.zip", task.task_id),
                "application/zip",
                &project_id,
                FileKind::Archive,
            )
            .await?;

        tasks::set_task_archives(
            &pool,
            task.task_id,
            TaskArchives {
                originals_archive_file_id: Some(archive_blob.id),
                ..Default::default()
            },
        )
        .await?;
    }

    let message = AnalysisJobMessage {
        task_id: task.task_id,
        confidence_threshold: query.conf,
        preview_limit,
    };
    if let Err(e) = nats::publish_job(&nats_client, &nats_config.queue_subject, &message).await {
        error!(task_id = %task.task_id, error = %e, "failed to enqueue analysis job");
        return Err(ApiError::Unavailable(
            "Не удалось поставить задачу в очередь".to_string(),
        ));
    }

    info!(
        task_id = %task.task_id,
        total_files = task.total_files,
        total_bytes = total_bytes,
        "batch task accepted"
    );

    Ok(HttpResponse::Accepted().json(TaskCreateResponse {
        task_id: task.task_id,
        status: task.status,
    }))
}
