//! Core data model: formats, statuses, queue messages, ledger rows.
//!
//! `format_type` is a sum type with one pipeline handler per variant, not a
//! string compared at runtime. Two enums cover the two distinct roles a
//! format plays:
//!
//! * [`FormatKind`] — what a client may *request* (html, json, kvp, anon).
//! * [`UnitFormat`] — what a ledger row may *record*. This is `FormatKind`
//!   plus `txt`, the derived format a worker inserts as a byproduct of html
//!   processing. Derived rows exist without a queue message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Formats ──────────────────────────────────────────────────────────────

/// A client-requestable output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    /// Positioned page HTML (plus a derived plain-text artifact).
    Html,
    /// Key-value JSON extraction.
    Json,
    /// KVP extraction normalised against the master table.
    Kvp,
    /// Anonymised extraction with tokenised text, mapping and audit.
    Anon,
}

impl FormatKind {
    /// All requestable formats in canonical order. The order also decides
    /// enqueue order across formats for one submission burst.
    pub const ALL: [FormatKind; 4] = [
        FormatKind::Html,
        FormatKind::Json,
        FormatKind::Kvp,
        FormatKind::Anon,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FormatKind::Html => "html",
            FormatKind::Json => "json",
            FormatKind::Kvp => "kvp",
            FormatKind::Anon => "anon",
        }
    }

    pub fn parse(s: &str) -> Option<FormatKind> {
        match s {
            "html" => Some(FormatKind::Html),
            "json" => Some(FormatKind::Json),
            "kvp" => Some(FormatKind::Kvp),
            "anon" => Some(FormatKind::Anon),
            _ => None,
        }
    }
}

impl fmt::Display for FormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A format as recorded on a ledger row: requestable formats plus derived
/// ones that only a worker creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitFormat {
    Html,
    Json,
    Kvp,
    Anon,
    /// Plain text derived from an html unit. Never enqueued.
    Txt,
}

impl UnitFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitFormat::Html => "html",
            UnitFormat::Json => "json",
            UnitFormat::Kvp => "kvp",
            UnitFormat::Anon => "anon",
            UnitFormat::Txt => "txt",
        }
    }

    pub fn parse(s: &str) -> Option<UnitFormat> {
        match s {
            "html" => Some(UnitFormat::Html),
            "json" => Some(UnitFormat::Json),
            "kvp" => Some(UnitFormat::Kvp),
            "anon" => Some(UnitFormat::Anon),
            "txt" => Some(UnitFormat::Txt),
            _ => None,
        }
    }

    /// Derived formats have no queue message and no page image key.
    pub fn is_derived(&self) -> bool {
        matches!(self, UnitFormat::Txt)
    }
}

impl From<FormatKind> for UnitFormat {
    fn from(f: FormatKind) -> Self {
        match f {
            FormatKind::Html => UnitFormat::Html,
            FormatKind::Json => UnitFormat::Json,
            FormatKind::Kvp => UnitFormat::Kvp,
            FormatKind::Anon => UnitFormat::Anon,
        }
    }
}

impl fmt::Display for UnitFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Artifacts ────────────────────────────────────────────────────────────

/// One stored output file of a processed unit.
///
/// A single unit can emit several artifacts (an anon unit emits up to four);
/// the kind decides the filename label, extension, MIME type and whether the
/// artifact belongs under the access-restricted key root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Html,
    Txt,
    Json,
    /// KVP reviewer HTML (the primary kvp artifact).
    KvpHtml,
    /// KVP structured JSON (side artifact).
    KvpJson,
    AnonJson,
    AnonTxt,
    /// Token → original mapping. Reconstruction-enabling; restricted.
    AnonMapping,
    /// Compliance audit trail. Restricted.
    AnonAudit,
}

impl ArtifactKind {
    /// Label used inside result filenames (`page_{N}_{label}_{ts}.{ext}`).
    pub fn label(&self) -> &'static str {
        match self {
            ArtifactKind::Html => "html",
            ArtifactKind::Txt => "txt",
            ArtifactKind::Json => "json",
            ArtifactKind::KvpHtml => "kvp",
            ArtifactKind::KvpJson => "kvp_json",
            ArtifactKind::AnonJson => "anon_json",
            ArtifactKind::AnonTxt => "anon_txt",
            ArtifactKind::AnonMapping => "anon_mapping",
            ArtifactKind::AnonAudit => "anon_audit",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Html | ArtifactKind::KvpHtml => "html",
            ArtifactKind::Txt | ArtifactKind::AnonTxt => "txt",
            _ => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactKind::Html | ArtifactKind::KvpHtml => "text/html",
            ArtifactKind::Txt | ArtifactKind::AnonTxt => "text/plain",
            _ => "application/json",
        }
    }

    /// Mapping and audit files are the only artifacts that link back to
    /// original values; they live under a separate key root so bucket
    /// policy can fence them off.
    pub fn is_restricted(&self) -> bool {
        matches!(self, ArtifactKind::AnonMapping | ArtifactKind::AnonAudit)
    }
}

// ── Statuses ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Processing => "processing",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<UnitStatus> {
        match s {
            "pending" => Some(UnitStatus::Pending),
            "processing" => Some(UnitStatus::Processing),
            "completed" => Some(UnitStatus::Completed),
            "failed" => Some(UnitStatus::Failed),
            _ => None,
        }
    }

    /// Terminal units are never mutated again except through explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::Failed)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task-level status, recomputed from the unit aggregate.
pub type TaskStatus = UnitStatus;

// ── Anonymisation options ────────────────────────────────────────────────

/// How anonymised replacement values are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnonStrategy {
    /// Fixed placeholder preserving only a length hint.
    Redact,
    /// Realistic fake value whose type is inferred from the key name.
    Synthetic,
    /// Reduced precision (age band, year only, 3-digit ZIP, ...).
    Generalize,
    /// Keep only the last significant characters.
    Mask,
}

impl AnonStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnonStrategy::Redact => "redact",
            AnonStrategy::Synthetic => "synthetic",
            AnonStrategy::Generalize => "generalize",
            AnonStrategy::Mask => "mask",
        }
    }
}

/// A user-selected extraction field: either a master-table key or a custom
/// free-form key name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SelectedField {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_key_name: Option<String>,
}

impl SelectedField {
    pub fn master(name: impl Into<String>) -> Self {
        SelectedField {
            key_name: Some(name.into()),
            custom_key_name: None,
        }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        SelectedField {
            key_name: None,
            custom_key_name: Some(name.into()),
        }
    }

    /// Effective field name; master key wins when both are set.
    pub fn name(&self) -> Option<&str> {
        self.key_name
            .as_deref()
            .or(self.custom_key_name.as_deref())
    }
}

/// Per-format options travelling alongside the format tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatOptions {
    /// kvp: restrict the structured output to these fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_kvps: Option<Vec<SelectedField>>,
    /// anon: replacement strategy.
    pub anon_strategy: AnonStrategy,
    /// anon: emit the compliance audit artifact.
    pub anon_generate_audit: bool,
    /// anon: fields the user flagged as interesting. Extraction still covers
    /// the whole page; this is a prompt hint only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anon_selected_fields: Option<Vec<SelectedField>>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            selected_kvps: None,
            anon_strategy: AnonStrategy::Synthetic,
            anon_generate_audit: false,
            anon_selected_fields: None,
        }
    }
}

// ── Queue message ────────────────────────────────────────────────────────

/// One unit of work on the queue. Carries the full addressing needed to
/// process without further lookups. Delivery is at-least-once; workers must
/// be idempotent against re-delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub task_id: String,
    pub user_id: String,
    pub page_number: u32,
    pub total_pages: u32,
    pub format_type: FormatKind,
    pub page_image_key: String,
    /// Submitters that enqueue compound child ids put the real task id here;
    /// it takes precedence over `task_id` for all addressing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_kvps: Option<Vec<SelectedField>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anon_strategy: Option<AnonStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anon_generate_audit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anon_selected_fields: Option<Vec<SelectedField>>,
}

impl QueueMessage {
    /// Task id for ledger and artifact addressing.
    pub fn effective_task_id(&self) -> &str {
        self.parent_task_id.as_deref().unwrap_or(&self.task_id)
    }

    /// Collect the per-format options carried on the message.
    pub fn options(&self) -> FormatOptions {
        FormatOptions {
            selected_kvps: self.selected_kvps.clone(),
            anon_strategy: self.anon_strategy.unwrap_or(AnonStrategy::Synthetic),
            anon_generate_audit: self.anon_generate_audit.unwrap_or(false),
            anon_selected_fields: self.anon_selected_fields.clone(),
        }
    }
}

// ── Ledger rows ──────────────────────────────────────────────────────────

/// Optional side-artifact keys recorded alongside a unit's primary result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideKeys {
    pub json_result_key: Option<String>,
    pub anon_json_key: Option<String>,
    pub anon_txt_key: Option<String>,
    pub anon_mapping_key: Option<String>,
    pub anon_audit_key: Option<String>,
}

/// One `(task, page, format)` work record — the atomic scheduling unit.
#[derive(Debug, Clone)]
pub struct PageUnit {
    pub task_id: String,
    pub page_number: u32,
    pub total_pages: u32,
    pub format: UnitFormat,
    pub status: UnitStatus,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<i64>,
    pub result_key: Option<String>,
    pub side: SideKeys,
    /// Empty for derived units.
    pub page_image_key: String,
    pub error_message: Option<String>,
}

/// One user submission.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub user_id: String,
    pub source_file_key: String,
    pub requested_formats: Vec<FormatKind>,
    pub total_pages: u32,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub primary_result_key: Option<String>,
    pub primary_result_format: Option<UnitFormat>,
}

// ── Pub/sub payloads ─────────────────────────────────────────────────────

/// Real-time status update published on the `task_updates` channel.
///
/// Best-effort: subscribers may miss updates during reconnect; durable
/// progress is always re-readable from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub task_id: String,
    pub user_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskUpdate {
    pub fn new(task_id: &str, user_id: &str, status: UnitStatus) -> Self {
        TaskUpdate {
            task_id: task_id.to_string(),
            user_id: user_id.to_string(),
            status: status.as_str().to_string(),
            message: None,
            progress: None,
            error: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_message_round_trip() {
        let msg = QueueMessage {
            task_id: "t-1".into(),
            user_id: "u-1".into(),
            page_number: 2,
            total_pages: 3,
            format_type: FormatKind::Kvp,
            page_image_key: "uploads/u-1/2026-08/f-1/page_2.jpg".into(),
            parent_task_id: None,
            selected_kvps: Some(vec![SelectedField::master("invoice_number")]),
            anon_strategy: None,
            anon_generate_audit: None,
            anon_selected_fields: None,
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"format_type\":\"kvp\""));
        assert!(json.contains("\"page_image_key\""));
        // Absent optionals stay off the wire entirely.
        assert!(!json.contains("anon_strategy"));

        let back: QueueMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.format_type, FormatKind::Kvp);
        assert_eq!(back.page_number, 2);
        assert_eq!(
            back.selected_kvps.unwrap()[0].name(),
            Some("invoice_number")
        );
    }

    #[test]
    fn parent_task_id_takes_precedence() {
        let mut msg: QueueMessage = serde_json::from_str(
            r#"{"task_id":"t-1:page2","user_id":"u","page_number":1,
                "total_pages":1,"format_type":"html","page_image_key":"k",
                "parent_task_id":"t-1"}"#,
        )
        .unwrap();
        assert_eq!(msg.effective_task_id(), "t-1");
        msg.parent_task_id = None;
        assert_eq!(msg.effective_task_id(), "t-1:page2");
    }

    #[test]
    fn task_update_uses_camel_case_keys() {
        let upd = TaskUpdate::new("t-9", "u-9", UnitStatus::Processing)
            .with_message("Processing page 1 (html)");
        let json = serde_json::to_string(&upd).unwrap();
        assert!(json.contains("\"taskId\":\"t-9\""));
        assert!(json.contains("\"userId\":\"u-9\""));
        assert!(json.contains("\"status\":\"processing\""));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn unit_status_terminality() {
        assert!(!UnitStatus::Pending.is_terminal());
        assert!(!UnitStatus::Processing.is_terminal());
        assert!(UnitStatus::Completed.is_terminal());
        assert!(UnitStatus::Failed.is_terminal());
    }

    #[test]
    fn artifact_kind_routing() {
        assert_eq!(ArtifactKind::KvpHtml.extension(), "html");
        assert_eq!(ArtifactKind::KvpJson.content_type(), "application/json");
        assert!(ArtifactKind::AnonMapping.is_restricted());
        assert!(ArtifactKind::AnonAudit.is_restricted());
        assert!(!ArtifactKind::AnonJson.is_restricted());
        assert_eq!(ArtifactKind::AnonTxt.label(), "anon_txt");
    }

    #[test]
    fn format_parsing() {
        assert_eq!(FormatKind::parse("anon"), Some(FormatKind::Anon));
        assert_eq!(FormatKind::parse("txt"), None);
        assert_eq!(UnitFormat::parse("txt"), Some(UnitFormat::Txt));
        assert!(UnitFormat::Txt.is_derived());
        assert!(!UnitFormat::Html.is_derived());
    }
}
