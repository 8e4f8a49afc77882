//! HTML handler: language detection, layout extraction, reconstruction,
//! and the derived plain-text artifact.
//!
//! The plain text is extracted from the *raw* layout output, before
//! reconstruction, so it reflects the model's reading order rather than the
//! positioned rendering. Its artifact rides along in the outcome; the
//! worker records it as a derived `txt` unit on the ledger.

use crate::error::UnitError;
use crate::model::{PromptFamily, VisionModel};
use crate::pipeline::reconstruct::reconstruct;
use crate::pipeline::{dump_raw_output, Artifact, PageOutcome, UnitContext};
use crate::prompts;
use crate::types::ArtifactKind;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tracing::{debug, info};

/// Detected-language → ISO code. Anything unknown falls back to `en`.
const LANGUAGE_CODES: [(&str, &str); 11] = [
    ("english", "en"),
    ("german", "de"),
    ("french", "fr"),
    ("spanish", "es"),
    ("italian", "it"),
    ("czech", "cs"),
    ("polish", "pl"),
    ("russian", "ru"),
    ("chinese", "zh"),
    ("japanese", "ja"),
    ("korean", "ko"),
];

static RE_FENCE_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^```[a-zA-Z]*\s*\n?").unwrap());
static RE_FENCE_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n?```\s*$").unwrap());
static RE_BR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Normalise a model-reported language name to an ISO code.
pub fn normalize_language(language: &str) -> &'static str {
    let lower = language.trim().to_lowercase();
    LANGUAGE_CODES
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, code)| *code)
        .unwrap_or("en")
}

/// Strip a wrapping markdown fence the model sometimes adds despite the
/// prompt forbidding it.
pub fn strip_fences(output: &str) -> String {
    if !output.trim_start().starts_with("```") {
        return output.to_string();
    }
    let stripped = RE_FENCE_OPEN.replace(output.trim_start(), "");
    RE_FENCE_CLOSE.replace(&stripped, "").to_string()
}

/// Plain text from the raw layout output: tags stripped, whitespace
/// collapsed, break tags treated as separators.
pub fn plain_text_from_layout(layout: &str) -> String {
    let text = RE_BR.replace_all(layout, " ");
    let text = RE_TAG.replace_all(&text, " ");
    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    RE_WS.replace_all(&text, " ").trim().to_string()
}

/// Detect the document language: one short greedy call, first non-empty
/// line of the response, normalised to ISO.
fn detect_language(
    model: &dyn VisionModel,
    image: &Path,
    ctx: &UnitContext<'_>,
) -> Result<String, UnitError> {
    let output = model.generate(image, prompts::LANGUAGE_PROMPT, &ctx.decode.language)?;
    let language = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("English")
        .to_string();
    debug!("Detected language: {language}");
    Ok(language)
}

pub fn process(
    model: &dyn VisionModel,
    image: &Path,
    ctx: &UnitContext<'_>,
) -> Result<PageOutcome, UnitError> {
    // Source-resolution dimensions drive the coordinate mapping. Format is
    // sniffed from content; the scratch filename extension is not trusted.
    let (width, height) = image::ImageReader::open(image)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| UnitError::ImageProbe {
            detail: e.to_string(),
        })?
        .into_dimensions()
        .map_err(|e| UnitError::ImageProbe {
            detail: e.to_string(),
        })?;

    let language = detect_language(model, image, ctx)?;
    let lang_code = normalize_language(&language);

    let prompt = prompts::html_layout_prompt(&language);
    let raw = model.generate(image, &prompt, &ctx.decode.html)?;
    dump_raw_output(ctx, PromptFamily::HtmlLayout, &raw);
    info!(
        "Page {} layout: {} chars ({language})",
        ctx.page_number,
        raw.len()
    );

    let layout = strip_fences(&raw);
    let text = plain_text_from_layout(&layout);
    let html = reconstruct(&layout, width, height, lang_code);

    Ok(PageOutcome {
        artifacts: vec![
            Artifact {
                kind: ArtifactKind::Html,
                body: html,
            },
            Artifact {
                kind: ArtifactKind::Txt,
                body: text,
            },
        ],
        language: Some(language),
        dimensions: Some((width, height)),
        soft_error: false,
    })
}
