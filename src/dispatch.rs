//! Dispatcher: explode a task submission into per-(page, format) units.
//!
//! Ordering is the whole contract here: ledger rows are written **first**,
//! then queue messages. A crash between the two leaves pending rows with no
//! message — visible, and safely repaired by resubmitting — whereas the
//! reverse order could hand workers messages with no row to claim.
//!
//! Inserts are idempotent on `(task, page, format)`; a resubmission skips
//! the enqueue for every unit that already reached a terminal state, and
//! re-enqueues the rest. Pages of one format enqueue in ascending order so
//! early pages surface first under FIFO consumption.

use crate::bus::{update_task_meta, Bus};
use crate::config::{Config, QUEUE_KEY};
use crate::error::PipelineError;
use crate::ledger::{InsertOutcome, Ledger, NewTask, NewUnit};
use crate::types::{FormatKind, FormatOptions, QueueMessage, UnitFormat};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One user submission, page images already uploaded.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    /// Externally allocated id; a v4 UUID is generated when absent.
    pub task_id: Option<String>,
    pub user_id: String,
    pub source_file_key: String,
    pub requested_formats: Vec<FormatKind>,
    pub total_pages: u32,
    /// Object-store key per page, index 0 = page 1.
    pub page_image_keys: Vec<String>,
    pub options: FormatOptions,
}

pub struct Dispatcher {
    cfg: Config,
    ledger: Arc<dyn Ledger>,
    bus: Arc<dyn Bus>,
}

impl Dispatcher {
    pub fn new(cfg: Config, ledger: Arc<dyn Ledger>, bus: Arc<dyn Bus>) -> Dispatcher {
        Dispatcher { cfg, ledger, bus }
    }

    /// Fan a submission out into units. Returns the task id.
    pub async fn submit(&self, submission: TaskSubmission) -> Result<String, PipelineError> {
        let formats = canonical_formats(&submission.requested_formats);
        if formats.is_empty() {
            return Err(PipelineError::InvalidSubmission(
                "requested_formats must not be empty".into(),
            ));
        }
        if submission.total_pages == 0 {
            return Err(PipelineError::InvalidSubmission(
                "total_pages must be at least 1".into(),
            ));
        }
        if submission.page_image_keys.len() != submission.total_pages as usize {
            return Err(PipelineError::InvalidSubmission(format!(
                "expected {} page image keys, got {}",
                submission.total_pages,
                submission.page_image_keys.len()
            )));
        }

        let task_id = submission
            .task_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let dispatch_err = |detail: String| PipelineError::DispatchFailed {
            task_id: task_id.clone(),
            detail,
        };

        self.ledger
            .create_task(&NewTask {
                task_id: task_id.clone(),
                user_id: submission.user_id.clone(),
                source_file_key: submission.source_file_key.clone(),
                requested_formats: formats.clone(),
                total_pages: submission.total_pages,
            })
            .await
            .map_err(|e| dispatch_err(e.to_string()))?;

        // Rows first, then messages.
        let mut enqueued = 0usize;
        for format in &formats {
            for page in 1..=submission.total_pages {
                let image_key = &submission.page_image_keys[(page - 1) as usize];
                let outcome = self
                    .ledger
                    .insert_unit(&NewUnit {
                        task_id: task_id.clone(),
                        page_number: page,
                        total_pages: submission.total_pages,
                        format: UnitFormat::from(*format),
                        page_image_key: image_key.clone(),
                    })
                    .await
                    .map_err(|e| dispatch_err(e.to_string()))?;

                if let InsertOutcome::Exists { terminal: true } = outcome {
                    debug!("Unit ({task_id}, {page}, {format}) already terminal, not enqueued");
                    continue;
                }

                let message = self.build_message(&task_id, &submission, page, *format);
                let payload = serde_json::to_string(&message)
                    .map_err(|e| dispatch_err(e.to_string()))?;
                self.bus
                    .push(QUEUE_KEY, &payload)
                    .await
                    .map_err(|e| dispatch_err(e.to_string()))?;
                enqueued += 1;
            }
        }

        // Transient metadata for clients polling before a worker picks up.
        update_task_meta(
            self.bus.as_ref(),
            &self.cfg,
            &task_id,
            &[
                ("status".to_string(), "pending".to_string()),
                ("total_pages".to_string(), submission.total_pages.to_string()),
            ],
        )
        .await;
        let _ = self
            .bus
            .expire(
                &self.cfg.task_data_key(&task_id),
                Duration::from_secs(self.cfg.task_meta_ttl_secs),
            )
            .await;

        info!(
            "Dispatched task {task_id}: {} formats x {} pages, {enqueued} units enqueued",
            formats.len(),
            submission.total_pages
        );
        Ok(task_id)
    }

    fn build_message(
        &self,
        task_id: &str,
        submission: &TaskSubmission,
        page: u32,
        format: FormatKind,
    ) -> QueueMessage {
        let options = &submission.options;
        QueueMessage {
            task_id: task_id.to_string(),
            user_id: submission.user_id.clone(),
            page_number: page,
            total_pages: submission.total_pages,
            format_type: format,
            page_image_key: submission.page_image_keys[(page - 1) as usize].clone(),
            parent_task_id: None,
            selected_kvps: match format {
                FormatKind::Kvp => options.selected_kvps.clone(),
                _ => None,
            },
            anon_strategy: match format {
                FormatKind::Anon => Some(options.anon_strategy),
                _ => None,
            },
            anon_generate_audit: match format {
                FormatKind::Anon => Some(options.anon_generate_audit),
                _ => None,
            },
            anon_selected_fields: match format {
                FormatKind::Anon => options.anon_selected_fields.clone(),
                _ => None,
            },
        }
    }
}

/// Requested formats deduplicated into canonical order; submission order is
/// not significant.
fn canonical_formats(requested: &[FormatKind]) -> Vec<FormatKind> {
    FormatKind::ALL
        .into_iter()
        .filter(|f| requested.contains(f))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::ledger::MemoryLedger;
    use crate::types::SideKeys;

    fn submission(formats: &[FormatKind], pages: u32) -> TaskSubmission {
        TaskSubmission {
            task_id: Some("t-1".into()),
            user_id: "u-1".into(),
            source_file_key: "uploads/u-1/2026-08/f/doc.pdf".into(),
            requested_formats: formats.to_vec(),
            total_pages: pages,
            page_image_keys: (1..=pages)
                .map(|p| format!("uploads/u-1/2026-08/f/page_{p}.jpg"))
                .collect(),
            options: FormatOptions::default(),
        }
    }

    fn dispatcher() -> (Dispatcher, Arc<MemoryBus>, Arc<MemoryLedger>) {
        let bus = Arc::new(MemoryBus::new());
        let ledger = Arc::new(MemoryLedger::new());
        let d = Dispatcher::new(Config::default(), ledger.clone(), bus.clone());
        (d, bus, ledger)
    }

    #[tokio::test]
    async fn fan_out_creates_rows_and_messages() {
        let (d, bus, ledger) = dispatcher();
        let task_id = d
            .submit(submission(&[FormatKind::Kvp, FormatKind::Html], 2))
            .await
            .unwrap();

        assert_eq!(bus.queue_len(QUEUE_KEY).await.unwrap(), 4);
        assert_eq!(ledger.list_units(&task_id).await.unwrap().len(), 4);

        // Canonical format order, ascending pages within each format.
        let mut seen = Vec::new();
        while let Some(raw) = bus
            .pop_with_timeout(QUEUE_KEY, Duration::from_millis(10))
            .await
            .unwrap()
        {
            let msg: QueueMessage = serde_json::from_str(&raw).unwrap();
            seen.push((msg.format_type, msg.page_number));
        }
        assert_eq!(
            seen,
            vec![
                (FormatKind::Html, 1),
                (FormatKind::Html, 2),
                (FormatKind::Kvp, 1),
                (FormatKind::Kvp, 2),
            ]
        );
    }

    #[tokio::test]
    async fn resubmission_skips_terminal_units() {
        let (d, bus, ledger) = dispatcher();
        let task_id = d.submit(submission(&[FormatKind::Json], 2)).await.unwrap();
        assert_eq!(bus.queue_len(QUEUE_KEY).await.unwrap(), 2);

        // Page 1 finishes; page 2 stays pending.
        ledger
            .begin_unit(&task_id, 1, UnitFormat::Json, "w")
            .await
            .unwrap();
        ledger
            .complete_unit(&task_id, 1, UnitFormat::Json, "w", "k", &SideKeys::default(), 3)
            .await
            .unwrap();

        // Drain and resubmit: only the unfinished unit is enqueued again.
        while bus
            .pop_with_timeout(QUEUE_KEY, Duration::from_millis(10))
            .await
            .unwrap()
            .is_some()
        {}
        d.submit(submission(&[FormatKind::Json], 2)).await.unwrap();
        assert_eq!(bus.queue_len(QUEUE_KEY).await.unwrap(), 1);

        let raw = bus
            .pop_with_timeout(QUEUE_KEY, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let msg: QueueMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(msg.page_number, 2);
    }

    #[tokio::test]
    async fn anon_options_travel_only_on_anon_messages() {
        let (d, bus, _) = dispatcher();
        let mut sub = submission(&[FormatKind::Anon, FormatKind::Html], 1);
        sub.options.anon_generate_audit = true;
        d.submit(sub).await.unwrap();

        let mut by_format = std::collections::HashMap::new();
        while let Some(raw) = bus
            .pop_with_timeout(QUEUE_KEY, Duration::from_millis(10))
            .await
            .unwrap()
        {
            let msg: QueueMessage = serde_json::from_str(&raw).unwrap();
            by_format.insert(msg.format_type, msg);
        }
        assert_eq!(
            by_format[&FormatKind::Anon].anon_generate_audit,
            Some(true)
        );
        assert!(by_format[&FormatKind::Html].anon_generate_audit.is_none());
    }

    #[tokio::test]
    async fn invalid_submissions_are_rejected_before_any_write() {
        let (d, bus, ledger) = dispatcher();

        let empty_formats = submission(&[], 1);
        assert!(d.submit(empty_formats).await.is_err());

        let mut short_keys = submission(&[FormatKind::Html], 3);
        short_keys.page_image_keys.pop();
        assert!(d.submit(short_keys).await.is_err());

        assert_eq!(bus.queue_len(QUEUE_KEY).await.unwrap(), 0);
        assert!(ledger.get_task("t-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn generates_task_id_when_absent() {
        let (d, _, ledger) = dispatcher();
        let mut sub = submission(&[FormatKind::Html], 1);
        sub.task_id = None;
        let task_id = d.submit(sub).await.unwrap();
        assert!(uuid::Uuid::parse_str(&task_id).is_ok());
        assert!(ledger.get_task(&task_id).await.unwrap().is_some());
    }
}
