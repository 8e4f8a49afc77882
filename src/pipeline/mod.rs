//! Format-specific page processing.
//!
//! Each submodule handles exactly one output format; [`process_page`]
//! dispatches on the [`FormatKind`] sum type. Every handler is synchronous —
//! the model call owns the GPU and there is nothing useful to overlap, so
//! the worker runs the whole handler on the blocking thread pool via
//! `spawn_blocking`.
//!
//! ## Data Flow
//!
//! ```text
//! image ──▶ generate (VLM) ──▶ parse/normalise ──▶ artifacts
//!            html: detect language first, then layout, then reconstruct
//!            json/kvp/anon: first {…} region, soft-fail on bad JSON
//! ```
//!
//! A handler returns a [`PageOutcome`]: one artifact per output file plus
//! ancillary metadata. The worker owns uploads and ledger writes; handlers
//! never touch infra.

pub mod anon;
pub mod html;
pub mod json_kv;
pub mod kvp;
pub mod kvp_html;
pub mod reconstruct;

use crate::error::UnitError;
use crate::model::{DecodeTable, PromptFamily, VisionModel};
use crate::types::{ArtifactKind, FormatKind, FormatOptions};
use std::path::Path;
use tracing::warn;

/// Everything a handler needs besides the image itself.
pub struct UnitContext<'a> {
    pub task_id: &'a str,
    pub page_number: u32,
    pub options: &'a FormatOptions,
    pub master: &'a kvp::MasterTable,
    pub tokens: &'a anon::TokenDictionary,
    pub decode: &'a DecodeTable,
    /// When set, raw VLM responses are dumped here for debugging.
    pub raw_output_dir: Option<&'a Path>,
}

/// One output file produced by a handler.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub body: String,
}

/// The result of processing one unit.
#[derive(Debug, Clone, Default)]
pub struct PageOutcome {
    pub artifacts: Vec<Artifact>,
    pub language: Option<String>,
    /// Source-resolution page dimensions, recorded as upload metadata.
    pub dimensions: Option<(u32, u32)>,
    /// Soft failure: the unit completes but the artifact is a diagnostic
    /// document instead of the normal schema.
    pub soft_error: bool,
}

impl PageOutcome {
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }
}

/// The artifact whose key becomes the unit's `result_key`.
pub fn primary_artifact_kind(format: FormatKind) -> ArtifactKind {
    match format {
        FormatKind::Html => ArtifactKind::Html,
        FormatKind::Json => ArtifactKind::Json,
        FormatKind::Kvp => ArtifactKind::KvpHtml,
        FormatKind::Anon => ArtifactKind::AnonJson,
    }
}

/// Dispatch a unit to its format handler.
pub fn process_page(
    model: &dyn VisionModel,
    format: FormatKind,
    image: &Path,
    ctx: &UnitContext<'_>,
) -> Result<PageOutcome, UnitError> {
    match format {
        FormatKind::Html => html::process(model, image, ctx),
        FormatKind::Json => json_kv::process(model, image, ctx),
        FormatKind::Kvp => kvp::process(model, image, ctx),
        FormatKind::Anon => anon::process(model, image, ctx),
    }
}

// ── Shared helpers ───────────────────────────────────────────────────────

/// First `{…}` region of a model response: from the first `{` to the last
/// `}`. The prompts demand raw JSON, but models still wrap output in prose
/// or fences often enough that scanning beats trusting.
pub(crate) fn extract_json_region(output: &str) -> Option<&str> {
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&output[start..=end])
}

/// Diagnostic document stored in place of the expected schema when the
/// model output fails to parse. The unit still completes — soft failure.
pub(crate) fn diagnostic_document(
    error: &str,
    raw_output: &str,
    page_number: u32,
) -> serde_json::Value {
    serde_json::json!({
        "error": error,
        "raw_output": raw_output,
        "page_number": page_number,
        "message": "Model generated output but JSON parsing failed",
    })
}

/// Minimal HTML entity escaping for text injected into artifacts.
pub(crate) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Best-effort raw model output dump for debugging. Never fails the unit.
pub(crate) fn dump_raw_output(ctx: &UnitContext<'_>, family: PromptFamily, output: &str) {
    let Some(dir) = ctx.raw_output_dir else {
        return;
    };
    let ts = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!(
        "{}_page{}_{}_{ts}.txt",
        ctx.task_id,
        ctx.page_number,
        family.label()
    ));
    let result = std::fs::create_dir_all(dir)
        .and_then(|_| std::fs::write(&path, output));
    if let Err(e) = result {
        warn!("Failed to dump raw model output to {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_region_spans_first_to_last_brace() {
        let output = "Sure, here is the JSON:\n{\"a\": {\"b\": 1}}\nDone.";
        assert_eq!(extract_json_region(output), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json_region("no braces at all"), None);
        assert_eq!(extract_json_region("} backwards {"), None);
    }

    #[test]
    fn diagnostic_shape_is_stable() {
        let doc = diagnostic_document("invalid json", "garbage", 3);
        assert_eq!(doc["error"], "invalid json");
        assert_eq!(doc["raw_output"], "garbage");
        assert_eq!(doc["page_number"], 3);
        assert!(doc["message"].as_str().unwrap().contains("parsing failed"));
    }

    #[test]
    fn escaping_covers_the_usual_suspects() {
        assert_eq!(
            escape_html(r#"<a href="x">Tom & Jerry's</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; Jerry&#39;s&lt;/a&gt;"
        );
    }

    #[test]
    fn primary_kinds_per_format() {
        assert_eq!(primary_artifact_kind(FormatKind::Html), ArtifactKind::Html);
        assert_eq!(primary_artifact_kind(FormatKind::Json), ArtifactKind::Json);
        assert_eq!(primary_artifact_kind(FormatKind::Kvp), ArtifactKind::KvpHtml);
        assert_eq!(primary_artifact_kind(FormatKind::Anon), ArtifactKind::AnonJson);
    }
}
