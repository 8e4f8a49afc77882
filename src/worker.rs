//! The long-lived worker: one process, one model, one unit at a time.
//!
//! Lifecycle: connect clients → load model (done by the caller, 30–60 s) →
//! set the readiness key → blocking-pop loop. Inside the loop each unit is
//! a straight-line sequence — claim, publish, download, process, upload,
//! record, publish — with no cooperative yielding between steps. The model
//! call is synchronous; the whole format handler runs on the blocking
//! thread pool via `spawn_blocking` so it never stalls the async clients.
//!
//! A unit failure never crashes the worker: it is recorded on the unit's
//! ledger row and the loop continues. The worker exits only on init
//! failure or when told to shut down, in which case it finishes the
//! in-flight unit first.

use crate::bus::{publish_task_update, publish_user_event, update_task_meta, Bus};
use crate::config::{
    worker_ready_key, Config, QUEUE_KEY, STAT_UNITS_COMPLETED, STAT_UNITS_FAILED,
};
use crate::error::{PipelineError, UnitError};
use crate::ledger::{BeginUnit, Ledger};
use crate::model::{DecodeTable, VisionModel};
use crate::pipeline::anon::TokenDictionary;
use crate::pipeline::kvp::MasterTable;
use crate::pipeline::{self, primary_artifact_kind, Artifact, PageOutcome, UnitContext};
use crate::store::{self, ArtifactStore};
use crate::types::{
    ArtifactKind, FormatKind, QueueMessage, SideKeys, TaskStatus, TaskUpdate, UnitFormat,
    UnitStatus,
};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// How a popped message was resolved.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Completed,
    /// Redelivery of an already-completed unit; nothing was run.
    Skipped,
}

pub struct Worker {
    worker_id: u32,
    worker_name: String,
    cfg: Config,
    bus: Arc<dyn Bus>,
    ledger: Arc<dyn Ledger>,
    store: ArtifactStore,
    model: Arc<dyn VisionModel>,
    // Shared with the blocking-pool closure that runs each handler.
    master: Arc<MasterTable>,
    tokens: Arc<TokenDictionary>,
    decode: Arc<DecodeTable>,
    scratch: TempDir,
    running: Arc<AtomicBool>,
}

impl Worker {
    /// Build a worker around already-connected clients and a loaded model,
    /// then advertise readiness on the bus.
    pub async fn init(
        worker_id: u32,
        cfg: Config,
        bus: Arc<dyn Bus>,
        ledger: Arc<dyn Ledger>,
        store: ArtifactStore,
        model: Arc<dyn VisionModel>,
    ) -> Result<Worker, PipelineError> {
        let master = Arc::new(MasterTable::load(cfg.master_kvps_path.as_deref())?);
        let tokens = Arc::new(TokenDictionary::load(cfg.anon_tokens_path.as_deref())?);
        let decode = Arc::new(DecodeTable::from_overrides(&cfg.decode_overrides)?);

        std::fs::create_dir_all(&cfg.scratch_dir).map_err(|e| {
            PipelineError::InvalidConfig(format!(
                "scratch dir {} unusable: {e}",
                cfg.scratch_dir.display()
            ))
        })?;
        let scratch = TempDir::with_prefix_in(format!("worker_{worker_id}_"), &cfg.scratch_dir)
            .map_err(|e| PipelineError::Internal(format!("scratch tempdir: {e}")))?;

        let worker = Worker {
            worker_name: format!("worker-{worker_id}"),
            worker_id,
            cfg,
            bus,
            ledger,
            store,
            model,
            master,
            tokens,
            decode,
            scratch,
            running: Arc::new(AtomicBool::new(true)),
        };

        worker.advertise_ready().await?;
        info!(
            "[{}] Ready ({})",
            worker.worker_name,
            worker.model.describe()
        );
        Ok(worker)
    }

    /// Handle used by signal handlers to request shutdown.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    async fn advertise_ready(&self) -> Result<(), PipelineError> {
        self.bus
            .set_with_ttl(
                &worker_ready_key(self.worker_id),
                "1",
                Duration::from_secs(self.cfg.ready_ttl_secs),
            )
            .await
            .map_err(PipelineError::BusConnect)
    }

    /// Main loop: blocking-pop with timeout until shutdown is requested.
    /// The in-flight unit always finishes before the loop exits.
    pub async fn run(&self) {
        info!("[{}] Starting main loop", self.worker_name);
        let pop_timeout = Duration::from_secs(self.cfg.queue_pop_timeout_secs);

        while self.running.load(Ordering::SeqCst) {
            match self.bus.pop_with_timeout(QUEUE_KEY, pop_timeout).await {
                Ok(Some(raw)) => self.handle_message(&raw).await,
                Ok(None) => {
                    // Idle tick: keep the readiness key alive.
                    if let Err(e) = self.advertise_ready().await {
                        warn!("[{}] Ready refresh failed: {e}", self.worker_name);
                    }
                }
                Err(e) => {
                    error!("[{}] Queue pop failed: {e}", self.worker_name);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!("[{}] Shutdown complete", self.worker_name);
    }

    /// Drain the queue until it is empty, then return the number of
    /// messages handled. The unit-processing path is identical to `run`.
    pub async fn drain(&self) -> usize {
        let mut handled = 0;
        while let Ok(Some(raw)) = self
            .bus
            .pop_with_timeout(QUEUE_KEY, Duration::from_millis(20))
            .await
        {
            self.handle_message(&raw).await;
            handled += 1;
        }
        handled
    }

    async fn handle_message(&self, raw: &str) {
        let msg: QueueMessage = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                error!("[{}] Dropping unparsable queue message: {e}", self.worker_name);
                return;
            }
        };

        match self.process_unit(&msg).await {
            Ok(Disposition::Completed) => {}
            Ok(Disposition::Skipped) => {
                debug!(
                    "[{}] Skipped already-completed unit ({}, page {}, {})",
                    self.worker_name,
                    msg.effective_task_id(),
                    msg.page_number,
                    msg.format_type
                );
            }
            Err(err) => self.handle_failure(&msg, &err).await,
        }
    }

    async fn process_unit(&self, msg: &QueueMessage) -> Result<Disposition, UnitError> {
        let task_id = msg.effective_task_id();
        let format = msg.format_type;
        let unit_format = UnitFormat::from(format);
        let started = Instant::now();

        if msg.page_image_key.is_empty() {
            return Err(UnitError::InvalidInput {
                detail: "queue message carries no page image key".into(),
            });
        }

        info!(
            "[{}] Processing {task_id} page {} ({format})",
            self.worker_name, msg.page_number
        );

        // Claim the unit; redeliveries of completed units short-circuit.
        let begin = with_retry("begin_unit", || {
            self.ledger
                .begin_unit(task_id, msg.page_number, unit_format, &self.worker_name)
        })
        .await?;
        if begin == BeginUnit::AlreadyCompleted {
            return Ok(Disposition::Skipped);
        }

        if let Err(e) = self.ledger.mark_task_processing(task_id).await {
            warn!("[{}] mark_task_processing failed: {e}", self.worker_name);
        }
        self.publish_status(
            msg,
            UnitStatus::Processing,
            format!("Processing page {} ({format})", msg.page_number),
            None,
        )
        .await;

        // Fetch the page image to private scratch.
        let image_path = self.scratch_path(task_id, msg.page_number);
        with_retry("download_page_image", || {
            self.store.download_to(&msg.page_image_key, &image_path)
        })
        .await
        .map_err(|source| UnitError::ImageDownload {
            key: msg.page_image_key.clone(),
            source,
        })?;

        // Format-specific processing. The model call holds the GPU and is
        // synchronous, so the whole handler runs inside `spawn_blocking`
        // with cloned inputs.
        let outcome = {
            let model = Arc::clone(&self.model);
            let master = Arc::clone(&self.master);
            let tokens = Arc::clone(&self.tokens);
            let decode = Arc::clone(&self.decode);
            let raw_output_dir = self.cfg.raw_output_dir.clone();
            let options = msg.options();
            let owned_task_id = task_id.to_string();
            let page_number = msg.page_number;
            let image = image_path.clone();
            tokio::task::spawn_blocking(move || {
                let ctx = UnitContext {
                    task_id: &owned_task_id,
                    page_number,
                    options: &options,
                    master: &master,
                    tokens: &tokens,
                    decode: &decode,
                    raw_output_dir: raw_output_dir.as_deref(),
                };
                pipeline::process_page(model.as_ref(), format, &image, &ctx)
            })
            .await
            .map_err(|e| UnitError::Internal(format!("processing task panicked: {e}")))??
        };

        // Upload artifacts and slot their keys.
        let timestamp = store::key_timestamp();
        let mut result_key: Option<String> = None;
        let mut txt_key: Option<String> = None;
        let mut side = SideKeys::default();

        for artifact in &outcome.artifacts {
            let key = self.upload_artifact(msg, task_id, artifact, &timestamp, &outcome).await?;
            if artifact.kind == primary_artifact_kind(format) {
                result_key = Some(key.clone());
            }
            match artifact.kind {
                ArtifactKind::Txt => txt_key = Some(key),
                ArtifactKind::KvpJson => side.json_result_key = Some(key),
                ArtifactKind::AnonJson => side.anon_json_key = Some(key),
                ArtifactKind::AnonTxt => side.anon_txt_key = Some(key),
                ArtifactKind::AnonMapping => side.anon_mapping_key = Some(key),
                ArtifactKind::AnonAudit => side.anon_audit_key = Some(key),
                ArtifactKind::Html | ArtifactKind::Json | ArtifactKind::KvpHtml => {}
            }
        }

        let result_key = result_key.ok_or_else(|| UnitError::InvalidInput {
            detail: format!("handler for {format} produced no primary artifact"),
        })?;

        // Derived-format rule: an html unit's txt side artifact becomes a
        // completed ledger row of its own, upsert on conflict.
        if let Some(txt_key) = &txt_key {
            with_retry("upsert_derived_unit", || {
                self.ledger.upsert_derived_unit(
                    task_id,
                    msg.page_number,
                    msg.total_pages,
                    UnitFormat::Txt,
                    &self.worker_name,
                    txt_key,
                )
            })
            .await?;
        }

        let processing_time_ms = started.elapsed().as_millis() as i64;
        with_retry("complete_unit", || {
            self.ledger.complete_unit(
                task_id,
                msg.page_number,
                unit_format,
                &self.worker_name,
                &result_key,
                &side,
                processing_time_ms,
            )
        })
        .await?;

        // Preview key: html and kvp results qualify; the ledger guard keeps
        // html on top when both exist. A lost update is re-derived by the
        // terminal recompute.
        if matches!(format, FormatKind::Html | FormatKind::Kvp) {
            let update = with_retry("set_primary_result", || {
                self.ledger
                    .set_primary_result(task_id, &result_key, unit_format)
            })
            .await;
            if let Err(e) = update {
                warn!("[{}] primary key update failed: {e}", self.worker_name);
            }
        }

        if let Err(e) = std::fs::remove_file(&image_path) {
            warn!(
                "[{}] Failed to remove scratch image {}: {e}",
                self.worker_name,
                image_path.display()
            );
        }

        self.publish_status(
            msg,
            UnitStatus::Completed,
            format!("Page {} processed successfully", msg.page_number),
            None,
        )
        .await;
        if let Err(e) = self.bus.incr(STAT_UNITS_COMPLETED).await {
            warn!("[{}] stats increment failed: {e}", self.worker_name);
        }

        self.settle_task(msg).await;

        info!(
            "[{}] Completed {task_id} page {} ({format}) in {processing_time_ms}ms{}",
            self.worker_name,
            msg.page_number,
            if outcome.soft_error {
                " [degraded artifact]"
            } else {
                ""
            }
        );
        Ok(Disposition::Completed)
    }

    fn scratch_path(&self, task_id: &str, page_number: u32) -> PathBuf {
        self.scratch
            .path()
            .join(format!("{task_id}_page_{page_number}.jpg"))
    }

    async fn upload_artifact(
        &self,
        msg: &QueueMessage,
        task_id: &str,
        artifact: &Artifact,
        timestamp: &str,
        outcome: &PageOutcome,
    ) -> Result<String, UnitError> {
        let filename = store::result_filename(msg.page_number, artifact.kind, timestamp);
        let key = store::result_key(
            &msg.user_id,
            task_id,
            &filename,
            artifact.kind.is_restricted(),
        );

        let mut metadata = vec![
            ("task_id", task_id.to_string()),
            ("user_id", msg.user_id.clone()),
            ("page_number", msg.page_number.to_string()),
            ("format_type", artifact.kind.label().to_string()),
            ("worker_id", self.worker_name.clone()),
            ("timestamp", timestamp.to_string()),
        ];
        if let Some((width, height)) = outcome.dimensions {
            metadata.push(("width", width.to_string()));
            metadata.push(("height", height.to_string()));
        }

        with_retry("upload_artifact", || {
            self.store
                .put_text(&key, &artifact.body, artifact.kind.content_type(), &metadata)
        })
        .await
        .map_err(|source| UnitError::ArtifactUpload {
            key: key.clone(),
            source,
        })?;
        debug!("[{}] Uploaded {key}", self.worker_name);
        Ok(key)
    }

    async fn publish_status(
        &self,
        msg: &QueueMessage,
        status: UnitStatus,
        message: String,
        error: Option<String>,
    ) {
        let task_id = msg.effective_task_id();

        let mut fields = vec![
            ("status".to_string(), status.as_str().to_string()),
            ("worker_id".to_string(), self.worker_name.clone()),
            ("message".to_string(), message.clone()),
        ];
        let now = Utc::now().timestamp().to_string();
        match status {
            UnitStatus::Processing => fields.push(("started_at".to_string(), now)),
            UnitStatus::Completed | UnitStatus::Failed => {
                fields.push(("completed_at".to_string(), now))
            }
            UnitStatus::Pending => {}
        }
        if let Some(err) = &error {
            fields.push(("error".to_string(), err.clone()));
        }
        update_task_meta(self.bus.as_ref(), &self.cfg, task_id, &fields).await;

        let mut update = TaskUpdate::new(task_id, &msg.user_id, status).with_message(message);
        if let Some(err) = error {
            update = update.with_error(err);
        }
        publish_task_update(self.bus.as_ref(), &update).await;
    }

    /// Recompute the task aggregate after a terminal unit transition; on a
    /// terminal task, expire the transient metadata and notify the user.
    async fn settle_task(&self, msg: &QueueMessage) {
        let task_id = msg.effective_task_id();
        let status = match self.ledger.recompute_task_status(task_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!("[{}] Task recompute failed for {task_id}: {e}", self.worker_name);
                return;
            }
        };
        if !status.is_terminal() {
            return;
        }

        update_task_meta(
            self.bus.as_ref(),
            &self.cfg,
            task_id,
            &[("status".to_string(), status.as_str().to_string())],
        )
        .await;
        if let Err(e) = self
            .bus
            .expire(
                &self.cfg.task_data_key(task_id),
                Duration::from_secs(self.cfg.task_meta_ttl_secs),
            )
            .await
        {
            warn!("[{}] Metadata expiry failed for {task_id}: {e}", self.worker_name);
        }

        let message = match status {
            TaskStatus::Completed => "All requested formats finished",
            _ => "Processing failed for all pages",
        };
        let update = TaskUpdate::new(task_id, &msg.user_id, status).with_message(message);
        publish_user_event(self.bus.as_ref(), &msg.user_id, &update).await;
        info!("[{}] Task {task_id} is {status}", self.worker_name);
    }

    async fn handle_failure(&self, msg: &QueueMessage, err: &UnitError) {
        let task_id = msg.effective_task_id();
        let unit_format = UnitFormat::from(msg.format_type);
        error!(
            "[{}] Unit ({task_id}, page {}, {}) failed: {err}",
            self.worker_name, msg.page_number, msg.format_type
        );

        let err_string = err.to_string();
        let fail = with_retry("fail_unit", || {
            self.ledger.fail_unit(
                task_id,
                msg.page_number,
                unit_format,
                &self.worker_name,
                &err_string,
            )
        })
        .await;
        if let Err(e) = fail {
            error!("[{}] Could not record unit failure: {e}", self.worker_name);
        }

        self.publish_status(
            msg,
            UnitStatus::Failed,
            "Processing failed".to_string(),
            Some(err.to_string()),
        )
        .await;
        if let Err(e) = self.bus.incr(STAT_UNITS_FAILED).await {
            warn!("[{}] stats increment failed: {e}", self.worker_name);
        }

        self.settle_task(msg).await;
    }
}

/// Bounded retry with exponential backoff for transient infra calls.
/// Exhaustion surfaces the last error, which becomes a unit failure.
async fn with_retry<T, E, F, Fut>(what: &str, mut call: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    const ATTEMPTS: u32 = 3;
    let mut delay = Duration::from_millis(250);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < ATTEMPTS => {
                warn!("{what} attempt {attempt}/{ATTEMPTS} failed: {e}, retrying");
                sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let failures = Cell::new(2);
        let result: Result<u32, String> = with_retry("op", || {
            let remaining = failures.get();
            let failures = &failures;
            async move {
                if remaining > 0 {
                    failures.set(remaining - 1);
                    Err("transient".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn retry_gives_up_after_three_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), String> = with_retry("op", || {
            calls.set(calls.get() + 1);
            async { Err("down".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }
}
