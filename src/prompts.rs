//! Prompts for the four extraction modes.
//!
//! Every prompt lives here so behaviour changes touch exactly one module and
//! unit tests can inspect prompt construction without a model. The prompts
//! are opaque to the rest of the pipeline; only their *output grammars* are
//! contractual:
//!
//! * language detection — a single word on the first line
//! * html layout — `<span class data-bbox="x1 y1 x2 y2" data-font>…</span>`
//!   elements with coordinates normalised to 0–1000, origin top-left
//! * kv / kvp / anon — one top-level JSON object as the first `{…}` region

use crate::types::SelectedField;

/// Language detection: one word, first line, nothing else.
pub const LANGUAGE_PROMPT: &str = "You are a language detection assistant.

What language is this document written in?

Reply with ONLY the language name (e.g., \"German\", \"English\", \"French\"). No explanation.";

/// System half of the layout-extraction prompt.
pub const HTML_SYSTEM_PROMPT: &str =
    "You are a precise document layout extractor. Output ONLY valid HTML with tight data-bbox attributes.";

/// Layout extraction parameterised by the detected language.
pub fn html_layout_prompt(language: &str) -> String {
    format!(
        r#"{HTML_SYSTEM_PROMPT}

You are a visual-layout expert. Parse this document and extract text with TIGHT BOUNDING BOXES and FONT CLASSIFICATION at the LINE LEVEL.

Language: {language}

RULES:
1. One element per visual line of text. Never merge lines, even inside a paragraph; each line gets its own span with its own tight bbox.

2. Every element MUST carry:
   - data-bbox="x1 y1 x2 y2" (normalized 0-1000, origin top-left), tight around the line's ink with no vertical padding
   - data-font="type" (see classification below)

3. Format: <span class="type" data-bbox="x1 y1 x2 y2" data-font="mono">exact text of the line</span>

4. Tight boxes: y1 at the tallest ascender, y2 at the lowest descender, x1/x2 at the outermost characters. Box per line only. Include even single digits or isolated characters in table cells.

5. Font classification (exactly one of):
   - "mono"  fixed-width (receipts, code)
   - "sans"  proportional sans-serif
   - "serif" proportional serif
   - "hand"  handwritten or cursive
   - "other" anything else or uncertain

6. Text preservation: transcribe VERBATIM per line. Keep every hyphen, number and punctuation mark. Read '0' as zero, not 'o'. Do not fix or reformat anything.

7. Special elements: checkboxes as [x]/[ ]; table cells line by line, never the whole table; treat isolated table characters as digits when context suggests.

Classes (semantic context only): title, header, label, value, text, small.

Extract EVERY line of text. Output ONLY the HTML spans, no extra text or wrappers."#
    )
}

/// Key-value JSON extraction (the `json` format).
pub const KV_JSON_PROMPT: &str = r#"You are an expert forensic document reader. Extract key-value pairs with perfect fidelity.

You process scanned invoices, receipts, delivery notes, contracts, ID cards, bank statements and forms in any language, handwriting and layout.

Your only job right now:
1. Recognise what kind of document this is.
2. Extract every single visible key-value pair with 100% fidelity.

You never translate or rephrase anything.

Output exactly this JSON and nothing else — no markdown, no explanations:

{
  "document_type": "invoice",
  "extracted_pairs": [
    {"key": "Rechnungsnummer:", "value": "2025-98765"},
    {"key": "Datum:", "value": "21.11.2025"},
    {"key": "IBAN:", "value": "DE89 3704 0044 0532 0130 00"}
  ]
}

Rules you never break:
- document_type = one short lowercase English word (invoice / receipt / delivery_note / bank_statement / id_card / contract / form / certificate / letter / other); if unsure -> "form"
- key = copied character-perfect from the page (language, case, punctuation, colon yes/no)
- value = everything that visually belongs to that key; if empty -> null
- Never invent keys that are not visible
- One array entry per visual key on the page
- Raw JSON only"#;

/// KVP extraction, optionally hinting the model toward user-selected keys.
///
/// Selection is a filter on the model's final output; extraction still scans
/// the whole page, and the normaliser does its own matching downstream.
pub fn kvp_extraction_prompt(selected: Option<&[SelectedField]>) -> String {
    let mut prompt = String::from(
        r#"You are extracting key-value pairs from this document image. Think step-by-step, then output only valid JSON.

PROCESS:
1. Scan the layout top-to-bottom, left-to-right. For non-table content, keys are labels to the left of or above values; associate by proximity and structure. For tables, headers are keys and each cell pairs with its header.
2. Transcribe exactly as visible. No corrections, no assumptions. If a label has no value, use null. Preserve formatting and symbols.
3. For ambiguous text prefer digits in numbers and letters in names; mark "uncertain": true only when genuinely unclear. Confidence: "high" (clear print), "medium" (degraded), "low" (faded or handwritten).
4. Tables: headers as keys, rows as objects with per-row confidence.
5. Final filter: "#,
    );

    match selected_names(selected) {
        Some(names) => {
            prompt.push_str(&format!(
                "Extract ONLY values for these exact keys: {}. Ignore all other data. If a key has no value, omit it.",
                names
                    .iter()
                    .map(|n| format!("\"{n}\""))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        None => {
            prompt.push_str("Extract all visible key-value pairs without filtering.");
        }
    }

    prompt.push_str(
        r#"

OUTPUT JSON SCHEMA:
{
  "items": [{"key": "exact_key", "value": "exact_value", "confidence": "high|medium|low", "uncertain": true|false}],
  "tables": [{"headers": ["header1"], "rows": [{"header1": "value", "confidence": "high|medium|low"}]}]
}

Output only the JSON object. No extra text."#,
    );

    prompt
}

/// Anonymisation extraction: everything on the page, always unfiltered.
/// Selected fields are only a note; anonymisation must cover the full page.
pub fn anon_extraction_prompt(selected: Option<&[SelectedField]>) -> String {
    let mut prompt = String::from(
        r#"Extract ALL key-value pairs from this document. Output only valid JSON.

EXTRACTION RULES:

1. NON-TABLE CONTENT: the key is typically left of or above its value. Extract the key exactly as written, then its associated value. Include labels, field names and headings that have corresponding data.

2. TABLE CONTENT: column headers become keys; each cell value pairs with its column header, row by row.

3. FIDELITY: transcribe exactly as visible. Preserve original language, formatting and symbols. If a field label has no value, use null.

4. CONFIDENCE: "high" clear machine print, "medium" readable but degraded, "low" handwritten or faded.

OUTPUT FORMAT (valid JSON only):

{
  "items": [
    {"key": "Invoice No", "value": "12345", "confidence": "high"}
  ],
  "tables": [
    {"headers": ["Item", "Qty"], "rows": [{"Item": "Widget A", "Qty": "10", "confidence": "high"}]}
  ]
}

IMPORTANT: extract EVERYTHING visible. This data will be anonymized for privacy compliance."#,
    );

    if let Some(names) = selected_names(selected) {
        prompt.push_str(&format!(
            "\n\nNOTE: the user is particularly interested in these fields: {}.\nStill extract ALL fields for complete anonymization.",
            names
                .iter()
                .map(|n| format!("\"{n}\""))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    prompt
}

fn selected_names(selected: Option<&[SelectedField]>) -> Option<Vec<String>> {
    let names: Vec<String> = selected?
        .iter()
        .filter_map(|f| f.name().map(str::to_string))
        .collect();
    if names.is_empty() {
        None
    } else {
        Some(names)
    }
}
