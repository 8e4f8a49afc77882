//! Key-value JSON handler.
//!
//! One greedy generation, then a strict parse of the first `{…}` region.
//! Expected shape: `{"document_type", "extracted_pairs": [{"key","value"}]}`.
//! A parse failure is a *soft* failure: the unit still completes, but the
//! stored artifact is a diagnostic document carrying the raw output so the
//! user sees something actionable instead of a bare error row.

use crate::error::UnitError;
use crate::model::{PromptFamily, VisionModel};
use crate::pipeline::{
    diagnostic_document, dump_raw_output, extract_json_region, Artifact, PageOutcome,
    UnitContext,
};
use crate::prompts;
use crate::types::ArtifactKind;
use std::path::Path;
use tracing::{info, warn};

pub fn process(
    model: &dyn VisionModel,
    image: &Path,
    ctx: &UnitContext<'_>,
) -> Result<PageOutcome, UnitError> {
    let raw = model.generate(image, prompts::KV_JSON_PROMPT, &ctx.decode.json_kv)?;
    dump_raw_output(ctx, PromptFamily::KvJson, &raw);

    let (body, soft_error) = match parse_extraction(&raw) {
        Ok(parsed) => {
            let pairs = parsed["extracted_pairs"]
                .as_array()
                .map(|a| a.len())
                .unwrap_or(0);
            info!(
                "Page {}: {} key-value pairs ({})",
                ctx.page_number,
                pairs,
                parsed["document_type"].as_str().unwrap_or("unknown")
            );
            (serde_json::to_string_pretty(&parsed).unwrap_or_default(), false)
        }
        Err(kind) => {
            warn!("Page {}: {kind}, storing diagnostic artifact", ctx.page_number);
            let doc = diagnostic_document(kind, &raw, ctx.page_number);
            (serde_json::to_string_pretty(&doc).unwrap_or_default(), true)
        }
    };

    Ok(PageOutcome {
        artifacts: vec![Artifact {
            kind: ArtifactKind::Json,
            body,
        }],
        language: None,
        dimensions: None,
        soft_error,
    })
}

/// Parse the model response into the expected extraction object.
fn parse_extraction(raw: &str) -> Result<serde_json::Value, &'static str> {
    let region = extract_json_region(raw).ok_or("no valid json")?;
    let value: serde_json::Value =
        serde_json::from_str(region).map_err(|_| "invalid json")?;
    if !value.is_object() {
        return Err("invalid json");
    }
    Ok(value)
}
