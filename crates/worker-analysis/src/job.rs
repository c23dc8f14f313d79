//! The batch-analysis job: drives one task from Queued to a terminal state.
//!
//! The image loop is strictly sequential — the detector is the bottleneck
//! and one job should monopolize exactly one detector slot. Per-image
//! failures are recorded on the image row and processing continues; only
//! task-store and broker failures abort the job (the message is then
//! redelivered and the redelivery guard settles the task as Failed).

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use lineguard_core::archive::{self, ResultsArchive};
use lineguard_core::files::{FileKind, UploadItem};
use lineguard_core::models::{
    AnalysisJobMessage, AnalysisStatus, AnalysisTask, ClassShare, ProgressEvent, TaskMetadata,
};
use lineguard_core::tasks::{
    self, ImageUpdate, NewImage, TaskArchives, TaskProgressUpdate, TaskStoreError,
};
use lineguard_core::worker::WorkerContext;
use lineguard_core::{nats, render};

/// Bulk entries are uploaded and registered in chunks of this size
const BULK_CHUNK_SIZE: usize = 100;
/// Aggregate counters are flushed and published at this cadence
const PROGRESS_CADENCE: i32 = 100;

#[instrument(skip(ctx), fields(task_id = %job.task_id, conf = job.confidence_threshold))]
pub(crate) async fn process_analysis_job(job: AnalysisJobMessage, ctx: WorkerContext) -> Result<()> {
    info!("Processing analysis job");

    let Some(task) = tasks::get_task(&ctx.pool, job.task_id).await? else {
        warn!("Task row is gone, dropping job");
        return Ok(());
    };

    // A task that is no longer Queued was already picked up once: this is a
    // redelivery after a worker failure. Restarting would rebuild the
    // output archive and duplicate progress, so the task is settled as
    // Failed instead.
    if task.status != AnalysisStatus::Queued {
        warn!(status = ?task.status, "Redelivered job, marking task as failed");
        finalize_failed(&ctx, &task, "Задача перезапущена после сбоя обработчика").await?;
        return Ok(());
    }

    tasks::update_task_progress(
        &ctx.pool,
        task.task_id,
        TaskProgressUpdate {
            status: Some(AnalysisStatus::Processing),
            message: Some("Обработка началась".to_string()),
            ..Default::default()
        },
    )
    .await?;

    let (preview_rows, _) = tasks::get_task_images(
        &ctx.pool,
        task.task_id,
        0,
        ctx.limits.upload_preview_limit as i64,
    )
    .await?;

    let mut archive_entries = Vec::new();
    if let Some(staging_id) = task.originals_archive_file_id {
        info!("Downloading staging archive");
        let archive_bytes = ctx
            .files
            .download(staging_id)
            .await
            .context("failed to download staging archive")?;
        archive_entries =
            tokio::task::spawn_blocking(move || archive::unpack_staging_archive(&archive_bytes))
                .await
                .context("staging unpack task failed")?
                .context("failed to unpack staging archive")?;
        info!(count = archive_entries.len(), "Staging archive unpacked");
    }

    let total_files = (preview_rows.len() + archive_entries.len()) as i32;
    if total_files == 0 {
        warn!("Nothing to process");
        finalize_failed(&ctx, &task, "Нет файлов для обработки").await?;
        return Ok(());
    }

    let preview_limit = job
        .preview_limit
        .clamp(1, ctx.limits.preview_limit as i32) as usize;
    let project_id = task.task_id.to_string();

    let mut run = JobRun::new(
        &ctx,
        task.task_id,
        job.confidence_threshold,
        preview_limit,
        total_files,
    )?;

    // Preview pass: rows created at intake, originals fetched in one batch
    if !preview_rows.is_empty() {
        let file_ids: Vec<Uuid> = preview_rows.iter().map(|row| row.file_id).collect();
        let mut downloads: HashMap<Uuid, Vec<u8>> = match ctx.files.batch_download(&file_ids).await
        {
            Ok(files) => files.into_iter().map(|f| (f.file_id, f.bytes)).collect(),
            Err(e) => {
                warn!("Preview batch download failed ({}), falling back to single downloads", e);
                HashMap::new()
            }
        };

        for row in &preview_rows {
            let file_name = safe_file_name(&row.file_name);
            let bytes = match downloads.remove(&row.file_id) {
                Some(bytes) => bytes,
                None => match ctx.files.download(row.file_id).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        run.record_image_failure(row.image_id, &format!("download failed: {e}"))
                            .await?;
                        continue;
                    }
                },
            };
            run.process_image(row.image_id, &file_name, bytes).await?;
        }
    }

    // Bulk pass: chunks of 100 — upload originals, register rows, analyze
    let mut remaining = archive_entries;
    while !remaining.is_empty() {
        let chunk: Vec<_> = remaining
            .drain(..remaining.len().min(BULK_CHUNK_SIZE))
            .collect();

        let items: Vec<UploadItem> = chunk
            .iter()
            .map(|entry| {
                let file_name = safe_file_name(&entry.name);
                let content_type = mime_guess::from_path(&file_name)
                    .first_or_octet_stream()
                    .to_string();
                UploadItem {
                    bytes: entry.bytes.clone(),
                    file_name,
                    content_type,
                }
            })
            .collect();

        let uploaded = match ctx
            .files
            .batch_upload(items, &project_id, FileKind::Original)
            .await
        {
            Ok(outcome) => outcome.files,
            Err(e) => {
                // The whole chunk is lost: no blobs, no rows, no detector calls
                error!("Chunk batch upload failed: {}", e);
                run.record_chunk_failure(chunk.len() as i32).await?;
                continue;
            }
        };

        let new_rows: Vec<NewImage> = uploaded
            .into_iter()
            .map(|blob| NewImage {
                file_id: blob.id,
                file_name: blob.file_name,
                file_size: blob.file_size,
            })
            .collect();
        let rows = tasks::add_images(&ctx.pool, task.task_id, &new_rows).await?;

        for (idx, entry) in chunk.into_iter().enumerate() {
            match rows.get(idx) {
                Some(row) => {
                    let file_name = safe_file_name(&entry.name);
                    run.process_image(row.image_id, &file_name, entry.bytes).await?;
                }
                None => {
                    warn!(file_name = %entry.name, "File was not registered by the batch upload");
                    run.record_chunk_failure(1).await?;
                }
            }
        }
    }

    run.finalize(&task, &project_id).await
}

/// Settle a task as Failed and emit the terminal progress event
async fn finalize_failed(ctx: &WorkerContext, task: &AnalysisTask, message: &str) -> Result<()> {
    match tasks::update_task_progress(
        &ctx.pool,
        task.task_id,
        TaskProgressUpdate {
            status: Some(AnalysisStatus::Failed),
            message: Some(message.to_string()),
            ..Default::default()
        },
    )
    .await
    {
        Ok(_) | Err(TaskStoreError::TaskNotFound) => {}
        Err(e) => return Err(e.into()),
    }

    let event = ProgressEvent {
        task_id: task.task_id,
        status: AnalysisStatus::Failed,
        processed_files: task.processed_files,
        total_files: task.total_files,
        failed_files: task.failed_files,
        defects_found: task.defects_found,
        message: Some(message.to_string()),
    };
    if let Err(e) = nats::publish_progress(&ctx.nats_client, &ctx.updates_subject, &event).await {
        warn!("Failed to publish terminal progress event: {}", e);
    }
    Ok(())
}

/// One annotated image kept as a preview candidate
struct PreviewCandidate {
    image_id: Uuid,
    file_name: String,
    annotated: Vec<u8>,
}

/// Mutable state of one job run
struct JobRun<'a> {
    ctx: &'a WorkerContext,
    task_id: Uuid,
    confidence_threshold: f64,
    preview_limit: usize,
    total_files: i32,
    processed: i32,
    failed: i32,
    defects_found: i32,
    total_objects: i64,
    defects_total: i64,
    class_stats: BTreeMap<String, i64>,
    results: ResultsArchive,
    defect_candidates: Vec<PreviewCandidate>,
    regular_candidates: Vec<PreviewCandidate>,
}

impl<'a> JobRun<'a> {
    fn new(
        ctx: &'a WorkerContext,
        task_id: Uuid,
        confidence_threshold: f64,
        preview_limit: usize,
        total_files: i32,
    ) -> Result<Self> {
        Ok(Self {
            ctx,
            task_id,
            confidence_threshold,
            preview_limit,
            total_files,
            processed: 0,
            failed: 0,
            defects_found: 0,
            total_objects: 0,
            defects_total: 0,
            class_stats: BTreeMap::new(),
            results: ResultsArchive::create().context("failed to open results archive")?,
            defect_candidates: Vec::new(),
            regular_candidates: Vec::new(),
        })
    }

    /// Analyze one image end to end: detector, overlay, archive entry,
    /// counters, row update. Detector and rendering failures stay on the
    /// image row; store failures bubble up and abort the job.
    async fn process_image(
        &mut self,
        image_id: Uuid,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        match tasks::update_image(
            &self.ctx.pool,
            image_id,
            ImageUpdate {
                status: Some(AnalysisStatus::Processing),
                ..Default::default()
            },
        )
        .await
        {
            Ok(_) => {}
            Err(TaskStoreError::ImageNotFound) => {
                // Row deleted mid-run; count it and move on
                return self.record_counted_failure().await;
            }
            Err(e) => return Err(e.into()),
        }

        let content_type = mime_guess::from_path(file_name)
            .first_or_octet_stream()
            .to_string();

        let summary = match self
            .ctx
            .detector
            .predict(file_name, bytes.clone(), &content_type, self.confidence_threshold)
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                warn!(image_id = %image_id, "Detection failed: {}", e);
                return self.record_image_failure(image_id, &e.to_string()).await;
            }
        };

        let annotated = match render::draw_annotations(&bytes, &summary.detections) {
            Ok(annotated) => annotated,
            Err(e) => {
                warn!(image_id = %image_id, "Annotation rendering failed: {}", e);
                return self.record_image_failure(image_id, &e.to_string()).await;
            }
        };

        let annotated_name = archive::annotated_file_name(file_name);
        self.results
            .add_annotated(summary.has_defects, &annotated_name, &annotated)
            .context("failed to append to results archive")?;

        self.total_objects += summary.total_objects;
        self.defects_total += summary.defects_count;
        for (class_name, count) in &summary.statistics {
            *self.class_stats.entry(class_name.clone()).or_default() += count;
        }
        if summary.has_defects {
            self.defects_found += summary.defects_count as i32;
        }

        let candidate = PreviewCandidate {
            image_id,
            file_name: annotated_name,
            annotated,
        };
        if summary.has_defects {
            if self.defect_candidates.len() < self.preview_limit {
                self.defect_candidates.push(candidate);
            }
        } else if self.regular_candidates.len() < self.preview_limit {
            self.regular_candidates.push(candidate);
        }

        match tasks::update_image(
            &self.ctx.pool,
            image_id,
            ImageUpdate {
                status: Some(AnalysisStatus::Completed),
                summary: Some(summary),
                ..Default::default()
            },
        )
        .await
        {
            Ok(_) => {
                self.processed += 1;
                if should_publish(self.processed, self.failed, true) {
                    self.flush_and_publish().await?;
                }
                Ok(())
            }
            Err(TaskStoreError::ImageNotFound) => self.record_counted_failure().await,
            Err(e) => Err(e.into()),
        }
    }

    /// Record a failure on the image row and advance the failed counter
    async fn record_image_failure(&mut self, image_id: Uuid, error_message: &str) -> Result<()> {
        match tasks::update_image(
            &self.ctx.pool,
            image_id,
            ImageUpdate {
                status: Some(AnalysisStatus::Failed),
                error_message: Some(error_message.to_string()),
                ..Default::default()
            },
        )
        .await
        {
            Ok(_) | Err(TaskStoreError::ImageNotFound) => {}
            Err(e) => return Err(e.into()),
        }
        self.record_counted_failure().await
    }

    /// Advance the failed counter without touching any row
    async fn record_counted_failure(&mut self) -> Result<()> {
        self.failed += 1;
        if should_publish(self.processed, self.failed, false) {
            self.flush_and_publish().await?;
        }
        Ok(())
    }

    /// A whole chunk failed before any rows existed
    async fn record_chunk_failure(&mut self, count: i32) -> Result<()> {
        let crossed = crosses_cadence(self.failed, count);
        self.failed += count;
        if crossed {
            self.flush_and_publish().await?;
        }
        Ok(())
    }

    /// Write aggregate counters to the task row and publish a progress event
    async fn flush_and_publish(&mut self) -> Result<()> {
        tasks::update_task_progress(
            &self.ctx.pool,
            self.task_id,
            TaskProgressUpdate {
                processed_files: Some(self.processed),
                failed_files: Some(self.failed),
                defects_found: Some(self.defects_found),
                ..Default::default()
            },
        )
        .await?;
        self.publish_event(
            AnalysisStatus::Processing,
            &format!("Обработано {}/{} файлов", self.processed, self.total_files),
        );
        Ok(())
    }

    /// Fire-and-forget event publish; the fan-out is lossy by contract
    fn publish_event(&self, status: AnalysisStatus, message: &str) {
        let event = ProgressEvent {
            task_id: self.task_id,
            status,
            processed_files: self.processed,
            total_files: self.total_files,
            failed_files: self.failed,
            defects_found: self.defects_found,
            message: Some(message.to_string()),
        };
        let client = self.ctx.nats_client.clone();
        let subject = self.ctx.updates_subject.clone();
        tokio::spawn(async move {
            if let Err(e) = nats::publish_progress(&client, &subject, &event).await {
                warn!("Failed to publish progress event: {}", e);
            }
        });
    }

    /// Promotion, archive upload, staging cleanup and terminal status
    async fn finalize(self, task: &AnalysisTask, project_id: &str) -> Result<()> {
        let JobRun {
            ctx,
            task_id,
            preview_limit,
            total_files,
            processed,
            failed,
            defects_found,
            total_objects,
            defects_total,
            class_stats,
            results,
            defect_candidates,
            regular_candidates,
            ..
        } = self;

        // Promote previews: defective candidates first, then normal ones
        let previews = select_previews(defect_candidates, regular_candidates, preview_limit);
        for candidate in previews {
            let blob = ctx
                .files
                .upload(
                    candidate.annotated,
                    &candidate.file_name,
                    "image/jpeg",
                    project_id,
                    FileKind::Preview,
                )
                .await
                .context("failed to upload preview image")?;
            // A missing row here is an invariant violation, not a skip:
            // every candidate was recorded as Completed moments ago
            tasks::update_image(
                &ctx.pool,
                candidate.image_id,
                ImageUpdate {
                    is_preview: Some(true),
                    result_file_id: Some(blob.id),
                    ..Default::default()
                },
            )
            .await
            .context("preview image row disappeared during promotion")?;
        }

        // Upload the results archive and record final metadata
        let results_bytes = tokio::task::spawn_blocking(move || results.finish())
            .await
            .context("results archive task failed")?
            .context("failed to finalize results archive")?;
        let results_blob = ctx
            .files
            .upload(
                results_bytes,
                &format!("{task_id}_results.zip"),
                "application/zip",
                project_id,
                FileKind::Archive,
            )
            .await
            .context("failed to upload results archive")?;

        let metadata = build_task_metadata(
            total_files as i64,
            total_objects,
            defects_total,
            class_stats,
        );
        tasks::set_task_archives(
            &ctx.pool,
            task_id,
            TaskArchives {
                results_archive_file_id: Some(results_blob.id),
                metadata: Some(serde_json::to_value(&metadata)?),
                ..Default::default()
            },
        )
        .await?;

        // The staging archive served its purpose; losing this cleanup only
        // leaks a blob
        if let Some(staging_id) = task.originals_archive_file_id {
            info!("Deleting staging archive");
            if let Err(e) = ctx.files.delete(staging_id, true).await {
                warn!("Failed to delete staging archive: {}", e);
            }
            if let Err(e) = tasks::clear_originals_archive(&ctx.pool, task_id).await {
                warn!("Failed to clear staging archive reference: {}", e);
            }
        }

        let final_status = if failed == 0 {
            AnalysisStatus::Completed
        } else {
            AnalysisStatus::Failed
        };
        let final_message = if failed == 0 {
            "Завершено"
        } else {
            "Задача завершилась с ошибками"
        };
        tasks::update_task_progress(
            &ctx.pool,
            task_id,
            TaskProgressUpdate {
                processed_files: Some(processed),
                failed_files: Some(failed),
                defects_found: Some(defects_found),
                status: Some(final_status),
                message: Some(final_message.to_string()),
            },
        )
        .await?;

        let event = ProgressEvent {
            task_id,
            status: final_status,
            processed_files: processed,
            total_files,
            failed_files: failed,
            defects_found,
            message: Some("Задача завершена".to_string()),
        };
        if let Err(e) = nats::publish_progress(&ctx.nats_client, &ctx.updates_subject, &event).await
        {
            warn!("Failed to publish terminal progress event: {}", e);
        }

        info!(
            processed = processed,
            failed = failed,
            defects = defects_found,
            status = ?final_status,
            "Analysis job finished"
        );
        Ok(())
    }
}

/// Strip any path components a client smuggled into the file name
fn safe_file_name(name: &str) -> String {
    std::path::Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name)
        .to_string()
}

/// Cadence rule: publish when the counter advanced by the last image
/// reaches a multiple of [`PROGRESS_CADENCE`]
fn should_publish(processed: i32, failed: i32, success: bool) -> bool {
    if success {
        processed > 0 && processed % PROGRESS_CADENCE == 0
    } else {
        failed > 0 && failed % PROGRESS_CADENCE == 0
    }
}

/// Whether bumping `counter` by `delta` crosses a cadence boundary
fn crosses_cadence(counter: i32, delta: i32) -> bool {
    (counter + delta) / PROGRESS_CADENCE > counter / PROGRESS_CADENCE
}

/// Final previews: all defective candidates first, topped up with normal
/// ones, capped at `limit`
fn select_previews<T>(defective: Vec<T>, regular: Vec<T>, limit: usize) -> Vec<T> {
    let mut selected: Vec<T> = defective.into_iter().take(limit).collect();
    let remaining = limit.saturating_sub(selected.len());
    selected.extend(regular.into_iter().take(remaining));
    selected
}

/// Aggregate metadata recorded on the task row, with per-class percentages
/// rounded to two decimals
fn build_task_metadata(
    total_files: i64,
    total_objects: i64,
    defects_found: i64,
    class_stats: BTreeMap<String, i64>,
) -> TaskMetadata {
    let class_stats_percent = if total_objects > 0 {
        class_stats
            .iter()
            .map(|(class_name, &count)| {
                let percentage =
                    (count as f64 / total_objects as f64 * 100.0 * 100.0).round() / 100.0;
                (class_name.clone(), ClassShare { count, percentage })
            })
            .collect()
    } else {
        BTreeMap::new()
    };

    TaskMetadata {
        total_files,
        total_objects,
        defects_found,
        class_stats,
        class_stats_percent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadence_fires_on_hundredth_completion() {
        assert!(!should_publish(1, 0, true));
        assert!(!should_publish(99, 0, true));
        assert!(should_publish(100, 0, true));
        assert!(should_publish(200, 3, true));
        // A failure does not trigger the success cadence
        assert!(!should_publish(100, 1, false));
        assert!(should_publish(37, 100, false));
        assert!(!should_publish(0, 0, true));
    }

    #[test]
    fn test_chunk_failure_cadence_crossing() {
        assert!(crosses_cadence(0, 100));
        assert!(crosses_cadence(99, 1));
        assert!(!crosses_cadence(100, 99));
        assert!(crosses_cadence(150, 100));
        assert!(!crosses_cadence(0, 99));
    }

    #[test]
    fn test_select_previews_defect_first() {
        let selected = select_previews(vec!["d1", "d2"], vec!["r1", "r2", "r3"], 4);
        assert_eq!(selected, vec!["d1", "d2", "r1", "r2"]);
    }

    #[test]
    fn test_select_previews_caps_defective() {
        let selected = select_previews(vec!["d1", "d2", "d3"], vec!["r1"], 2);
        assert_eq!(selected, vec!["d1", "d2"]);
    }

    #[test]
    fn test_select_previews_short_supply() {
        let selected = select_previews(vec!["d1"], Vec::<&str>::new(), 10);
        assert_eq!(selected, vec!["d1"]);
    }

    #[test]
    fn test_metadata_percentages_round_to_two_decimals() {
        let mut stats = BTreeMap::new();
        stats.insert("damaged_insulator".to_string(), 13i64);
        stats.insert("insulator".to_string(), 12i64);
        let metadata = build_task_metadata(25, 25, 13, stats);

        assert_eq!(
            metadata.class_stats_percent["damaged_insulator"].percentage,
            52.0
        );
        assert_eq!(metadata.class_stats_percent["insulator"].percentage, 48.0);

        let mut uneven = BTreeMap::new();
        uneven.insert("pole".to_string(), 1i64);
        let metadata = build_task_metadata(7, 7, 0, uneven);
        assert_eq!(metadata.class_stats_percent["pole"].percentage, 14.29);
    }

    #[test]
    fn test_metadata_with_no_objects_has_no_percentages() {
        let metadata = build_task_metadata(5, 0, 0, BTreeMap::new());
        assert!(metadata.class_stats_percent.is_empty());
    }

    #[test]
    fn test_safe_file_name_strips_directories() {
        assert_eq!(safe_file_name("dir/sub/shot.jpg"), "shot.jpg");
        assert_eq!(safe_file_name("plain.png"), "plain.png");
        assert_eq!(safe_file_name("опора.jpeg"), "опора.jpeg");
    }
}
