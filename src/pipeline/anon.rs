//! Anonymisation handler.
//!
//! Extraction first (everything on the page, unfiltered), then a
//! replacement pass over every non-empty value:
//!
//! * **redact** — fixed placeholder preserving only a length hint
//! * **synthetic** — realistic fake value, type inferred from the key name
//! * **generalize** — reduced precision (year only, 3-digit ZIP, age bands
//!   with everything over 89 collapsed into one coarse bucket)
//! * **mask** — last significant characters kept, the rest starred
//!
//! The replacement generator is a *pure function* of
//! `(value, key, strategy)`: synthetic values come from an RNG seeded with
//! a digest of the inputs, so re-running a unit reproduces its output.
//!
//! Alongside the anonymised document the handler emits a tokenised text
//! rendering (`key: [KIND_NNN]`), a token → original mapping, and an
//! optional audit trail whose records carry a 16-hex-prefix SHA-256 of the
//! original — never the original itself. Mapping and audit are the only
//! artifacts that link back to originals; they are routed to the
//! restricted key root by their artifact kind.

use crate::error::{PipelineError, UnitError};
use crate::model::{PromptFamily, VisionModel};
use crate::pipeline::{
    diagnostic_document, dump_raw_output, extract_json_region, Artifact, PageOutcome,
    UnitContext,
};
use crate::prompts;
use crate::types::{AnonStrategy, ArtifactKind};
use chrono::Utc;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DEFAULT_TOKEN_DICTIONARY: &str = include_str!("../../data/anon_tokens.json");

static RE_YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(19|20)\d{2}\b").unwrap());

// ── Token dictionary ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct TokenKindDef {
    kind: String,
    keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenFile {
    kinds: Vec<TokenKindDef>,
}

/// Key-name → token-kind dictionary. Data, not code: loaded at startup and
/// overridable via `DOCPIPE_ANON_TOKENS` so new field families don't need a
/// recompile. First matching kind wins, so specific kinds (DOB, SSN) come
/// before generic ones (DATE, ID) in the file.
#[derive(Debug, Clone, Default)]
pub struct TokenDictionary {
    kinds: Vec<TokenKindDef>,
}

impl TokenDictionary {
    pub fn load(path: Option<&Path>) -> Result<TokenDictionary, PipelineError> {
        let (content, origin) = match path {
            Some(p) => (
                std::fs::read_to_string(p).map_err(|e| PipelineError::DataTable {
                    path: p.to_path_buf(),
                    detail: e.to_string(),
                })?,
                p.to_path_buf(),
            ),
            None => (
                DEFAULT_TOKEN_DICTIONARY.to_string(),
                PathBuf::from("data/anon_tokens.json"),
            ),
        };
        let file: TokenFile =
            serde_json::from_str(&content).map_err(|e| PipelineError::DataTable {
                path: origin,
                detail: e.to_string(),
            })?;
        Ok(TokenDictionary { kinds: file.kinds })
    }

    /// Token kind for a field key. `FIELD` when nothing matches.
    pub fn classify(&self, key: &str) -> &str {
        let lower = key.to_lowercase();
        self.kinds
            .iter()
            .find(|def| def.keywords.iter().any(|kw| lower.contains(kw.as_str())))
            .map(|def| def.kind.as_str())
            .unwrap_or("FIELD")
    }
}

// ── Value replacement ────────────────────────────────────────────────────

fn seeded_rng(value: &str, key: &str) -> StdRng {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hasher.update([0x1f]);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    StdRng::seed_from_u64(u64::from_le_bytes(
        digest[..8].try_into().expect("digest is 32 bytes"),
    ))
}

/// 16-hex-prefix SHA-256 of an original value, as recorded in audit rows.
pub fn original_digest(value: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(value.as_bytes()))[..16].to_string()
}

const FIRST_NAMES: [&str; 10] = [
    "Alex", "Jordan", "Sam", "Chris", "Morgan", "Taylor", "Jamie", "Robin", "Casey", "Dana",
];
const LAST_NAMES: [&str; 10] = [
    "Miller", "Schmidt", "Garcia", "Novak", "Dubois", "Rossi", "Kowalski", "Weber",
    "Johnson", "Silva",
];
const STREETS: [&str; 6] = ["Oak", "Main", "Park", "Lake", "Hill", "Cedar"];

fn synthetic_value(value: &str, key: &str, kind: &str) -> String {
    let mut rng = seeded_rng(value, key);
    match kind {
        "NAME" => format!(
            "{} {}",
            FIRST_NAMES[rng.gen_range(0..FIRST_NAMES.len())],
            LAST_NAMES[rng.gen_range(0..LAST_NAMES.len())]
        ),
        "DOB" | "DATE" => format!(
            "{:02}.{:02}.{}",
            rng.gen_range(1..=28),
            rng.gen_range(1..=12),
            rng.gen_range(1950..=2005)
        ),
        "EMAIL" => format!(
            "{}.{}@example.com",
            FIRST_NAMES[rng.gen_range(0..FIRST_NAMES.len())].to_lowercase(),
            LAST_NAMES[rng.gen_range(0..LAST_NAMES.len())].to_lowercase()
        ),
        "PHONE" => format!(
            "+1-555-{:03}-{:04}",
            rng.gen_range(0..1000),
            rng.gen_range(0..10000)
        ),
        "IBAN" => {
            let mut digits = String::new();
            for _ in 0..20 {
                digits.push(char::from(b'0' + rng.gen_range(0..10u8)));
            }
            format!("DE{digits}")
        }
        "ACCOUNT" => format!("{:010}", rng.gen_range(0u64..10_000_000_000)),
        "ZIP" => format!("{:05}", rng.gen_range(10000..100000)),
        "ADDRESS" => format!(
            "{} {} Street",
            rng.gen_range(1..300),
            STREETS[rng.gen_range(0..STREETS.len())]
        ),
        "SSN" => format!(
            "{:03}-{:02}-{:04}",
            rng.gen_range(100..900),
            rng.gen_range(10..100),
            rng.gen_range(1000..10000)
        ),
        "AMOUNT" => {
            let cents = rng.gen_range(100u64..1_000_000);
            let amount = format!("{}.{:02}", cents / 100, cents % 100);
            // Keep the original's currency marker when there is one.
            if value.contains('$') {
                format!("${amount}")
            } else if value.contains('€') {
                format!("{amount} €")
            } else {
                amount
            }
        }
        _ => {
            let mut id = String::new();
            for _ in 0..8 {
                let c = rng.gen_range(0..36u8);
                id.push(if c < 10 {
                    char::from(b'0' + c)
                } else {
                    char::from(b'A' + c - 10)
                });
            }
            id
        }
    }
}

fn generalize_value(value: &str, key: &str, kind: &str) -> String {
    // Ages get bands regardless of token kind; >89 collapses to one bucket.
    if key.to_lowercase().contains("age") {
        if let Ok(age) = value.trim().parse::<u32>() {
            return if age > 89 {
                "90+".to_string()
            } else {
                let lo = age / 10 * 10;
                format!("{lo}-{}", lo + 9)
            };
        }
    }
    match kind {
        "DOB" | "DATE" => RE_YEAR
            .find(value)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "[DATE]".to_string()),
        "ZIP" => {
            let digits: String = value.chars().filter(char::is_ascii_digit).collect();
            if digits.len() >= 3 {
                format!("{}**", &digits[..3])
            } else {
                "[ZIP]".to_string()
            }
        }
        "AMOUNT" => {
            let numeric: String = value
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            match numeric.parse::<f64>() {
                Ok(n) if n < 100.0 => "under 100".to_string(),
                Ok(n) if n < 1_000.0 => "100-1,000".to_string(),
                Ok(n) if n < 10_000.0 => "1,000-10,000".to_string(),
                Ok(_) => "over 10,000".to_string(),
                Err(_) => "[AMOUNT]".to_string(),
            }
        }
        _ => "[GENERALIZED]".to_string(),
    }
}

fn mask_value(value: &str) -> String {
    let significant = value.chars().filter(|c| c.is_alphanumeric()).count();
    let keep = if significant > 4 { 4 } else { 1.min(significant) };
    let mut seen = 0;
    let mut out = String::with_capacity(value.len());
    // Walk from the end so "last N significant characters" is exact.
    for c in value.chars().rev().collect::<Vec<_>>() {
        if c.is_alphanumeric() {
            if seen < keep {
                out.push(c);
            } else {
                out.push('*');
            }
            seen += 1;
        } else {
            out.push(c);
        }
    }
    out.chars().rev().collect()
}

/// The external value-generator contract: a pure function
/// `(original, key, strategy) → replacement`.
pub fn anonymize_value(
    value: &str,
    key: &str,
    strategy: AnonStrategy,
    dictionary: &TokenDictionary,
) -> String {
    let kind = dictionary.classify(key);
    match strategy {
        AnonStrategy::Redact => format!("[REDACTED:{}]", value.chars().count()),
        AnonStrategy::Synthetic => synthetic_value(value, key, kind),
        AnonStrategy::Generalize => generalize_value(value, key, kind),
        AnonStrategy::Mask => mask_value(value),
    }
}

// ── Document pass ────────────────────────────────────────────────────────

/// One audit record. Carries the digest prefix, lengths, strategy and
/// timestamp — never the original value.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub field_key: String,
    pub token: String,
    pub original_sha256: String,
    pub original_len: usize,
    pub replacement_len: usize,
    pub strategy: String,
    pub timestamp: String,
}

/// Everything the replacement pass produces.
#[derive(Debug, Clone)]
pub struct AnonOutcome {
    /// The extraction with every non-empty value replaced.
    pub anonymized: Value,
    /// `key: [KIND_NNN]` lines in page order.
    pub tokenized_lines: Vec<String>,
    /// Token → original value.
    pub mapping: BTreeMap<String, String>,
    pub audit: Vec<AuditEntry>,
}

/// Replace every non-empty value in a raw `{items, tables}` extraction.
pub fn anonymize_extraction(
    raw: &Value,
    strategy: AnonStrategy,
    dictionary: &TokenDictionary,
) -> AnonOutcome {
    let mut anonymized = raw.clone();
    let stamped_at = Utc::now().to_rfc3339();
    let mut counters: BTreeMap<String, u32> = BTreeMap::new();
    let mut outcome = AnonOutcome {
        anonymized: Value::Null,
        tokenized_lines: Vec::new(),
        mapping: BTreeMap::new(),
        audit: Vec::new(),
    };

    let mut replace = |key: &str, slot: &mut Value| {
        let Value::String(original) = slot else {
            return;
        };
        if original.is_empty() {
            return;
        }
        let replacement = anonymize_value(original, key, strategy, dictionary);

        let kind = dictionary.classify(key);
        let counter = counters.entry(kind.to_string()).or_insert(0);
        *counter += 1;
        let token = format!("[{kind}_{counter:03}]");

        outcome.tokenized_lines.push(format!("{key}: {token}"));
        outcome.mapping.insert(token.clone(), original.clone());
        outcome.audit.push(AuditEntry {
            field_key: key.to_string(),
            token,
            original_sha256: original_digest(original),
            original_len: original.chars().count(),
            replacement_len: replacement.chars().count(),
            strategy: strategy.as_str().to_string(),
            timestamp: stamped_at.clone(),
        });

        *slot = Value::String(replacement);
    };

    if let Some(items) = anonymized.get_mut("items").and_then(Value::as_array_mut) {
        for item in items {
            let key = item["key"].as_str().unwrap_or("").to_string();
            if let Some(slot) = item.get_mut("value") {
                replace(&key, slot);
            }
        }
    }

    if let Some(tables) = anonymized.get_mut("tables").and_then(Value::as_array_mut) {
        for table in tables {
            let headers: Vec<String> = table["headers"]
                .as_array()
                .map(|h| {
                    h.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            if let Some(rows) = table.get_mut("rows").and_then(Value::as_array_mut) {
                for row in rows {
                    for header in &headers {
                        if let Some(slot) = row.get_mut(header.as_str()) {
                            replace(header, slot);
                        }
                    }
                }
            }
        }
    }

    outcome.anonymized = anonymized;
    outcome
}

/// Reverse a tokenised text with its mapping. The mapping round-trip
/// contract: `detokenize(anon_txt, mapping)` yields `key: original` lines.
pub fn detokenize(tokenized: &str, mapping: &BTreeMap<String, String>) -> String {
    let mut out = tokenized.to_string();
    for (token, original) in mapping {
        out = out.replace(token, original);
    }
    out
}

// ── Handler ──────────────────────────────────────────────────────────────

pub fn process(
    model: &dyn VisionModel,
    image: &Path,
    ctx: &UnitContext<'_>,
) -> Result<PageOutcome, UnitError> {
    let options = ctx.options;
    let prompt = prompts::anon_extraction_prompt(options.anon_selected_fields.as_deref());
    let raw = model.generate(image, &prompt, &ctx.decode.anon)?;
    dump_raw_output(ctx, PromptFamily::Anon, &raw);

    let parsed = extract_json_region(&raw)
        .and_then(|r| serde_json::from_str::<Value>(r).ok())
        .filter(|v| v.get("items").is_some() || v.get("tables").is_some());

    let Some(extraction) = parsed else {
        warn!(
            "Page {}: anon extraction unparsable, soft failure",
            ctx.page_number
        );
        let doc = diagnostic_document("invalid json", &raw, ctx.page_number);
        return Ok(PageOutcome {
            artifacts: vec![Artifact {
                kind: ArtifactKind::AnonJson,
                body: serde_json::to_string_pretty(&doc).unwrap_or_default(),
            }],
            soft_error: true,
            ..PageOutcome::default()
        });
    };

    let strategy = options.anon_strategy;
    let outcome = anonymize_extraction(&extraction, strategy, ctx.tokens);
    info!(
        "Page {}: anonymized {} values ({})",
        ctx.page_number,
        outcome.mapping.len(),
        strategy.as_str()
    );

    let timestamp = Utc::now().to_rfc3339();
    let mapping_doc = serde_json::json!({
        "tokens": outcome.mapping,
        "strategy": strategy.as_str(),
        "page_number": ctx.page_number,
        "timestamp": timestamp,
    });

    let mut artifacts = vec![
        Artifact {
            kind: ArtifactKind::AnonJson,
            body: serde_json::to_string_pretty(&outcome.anonymized).unwrap_or_default(),
        },
        Artifact {
            kind: ArtifactKind::AnonTxt,
            body: outcome.tokenized_lines.join("\n"),
        },
        Artifact {
            kind: ArtifactKind::AnonMapping,
            body: serde_json::to_string_pretty(&mapping_doc).unwrap_or_default(),
        },
    ];

    if options.anon_generate_audit && !outcome.audit.is_empty() {
        let audit_doc = serde_json::json!({
            "version": "anon-v1",
            "timestamp": timestamp,
            "strategy": strategy.as_str(),
            "page_number": ctx.page_number,
            "total_fields": outcome.audit.len(),
            "entries": outcome.audit,
        });
        artifacts.push(Artifact {
            kind: ArtifactKind::AnonAudit,
            body: serde_json::to_string_pretty(&audit_doc).unwrap_or_default(),
        });
    }

    Ok(PageOutcome {
        artifacts,
        ..PageOutcome::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dict() -> TokenDictionary {
        TokenDictionary::load(None).unwrap()
    }

    fn scenario_page() -> Value {
        json!({
            "items": [
                {"key": "Name", "value": "John Smith", "confidence": "high"},
                {"key": "DOB", "value": "01.01.1970", "confidence": "high"},
                {"key": "Amount", "value": "$500.00", "confidence": "high"}
            ],
            "tables": []
        })
    }

    #[test]
    fn classification_orders_specific_before_generic() {
        let d = dict();
        assert_eq!(d.classify("Name"), "NAME");
        assert_eq!(d.classify("DOB"), "DOB");
        assert_eq!(d.classify("Amount"), "AMOUNT");
        assert_eq!(d.classify("Invoice Date"), "DATE");
        assert_eq!(d.classify("SSN"), "SSN");
        assert_eq!(d.classify("Mystery Field XYZ"), "FIELD");
    }

    #[test]
    fn synthetic_page_carries_no_originals() {
        let outcome =
            anonymize_extraction(&scenario_page(), AnonStrategy::Synthetic, &dict());
        let text = serde_json::to_string(&outcome.anonymized).unwrap();
        assert!(!text.contains("John Smith"));
        assert!(!text.contains("01.01.1970"));
        assert!(!text.contains("$500.00"));

        // Per-kind counters start at 001.
        assert_eq!(
            outcome.tokenized_lines,
            vec!["Name: [NAME_001]", "DOB: [DOB_001]", "Amount: [AMOUNT_001]"]
        );
        assert_eq!(outcome.mapping.len(), 3);
        assert_eq!(outcome.mapping["[NAME_001]"], "John Smith");
        assert_eq!(outcome.mapping["[DOB_001]"], "01.01.1970");
        assert_eq!(outcome.mapping["[AMOUNT_001]"], "$500.00");
    }

    #[test]
    fn replacement_is_a_pure_function() {
        let d = dict();
        let a = anonymize_value("John Smith", "Name", AnonStrategy::Synthetic, &d);
        let b = anonymize_value("John Smith", "Name", AnonStrategy::Synthetic, &d);
        assert_eq!(a, b);
        let c = anonymize_value("Jane Doe", "Name", AnonStrategy::Synthetic, &d);
        assert_ne!(a, c);
    }

    #[test]
    fn redact_keeps_only_a_length_hint() {
        let d = dict();
        assert_eq!(
            anonymize_value("John Smith", "Name", AnonStrategy::Redact, &d),
            "[REDACTED:10]"
        );
    }

    #[test]
    fn mask_keeps_last_four_significant_chars() {
        let d = dict();
        assert_eq!(
            anonymize_value("123-45-6789", "SSN", AnonStrategy::Mask, &d),
            "***-**-6789"
        );
        assert_eq!(
            anonymize_value("DE89370400440532013000", "IBAN", AnonStrategy::Mask, &d),
            "******************3000"
        );
        // Short values keep a single character.
        assert_eq!(anonymize_value("42", "ID No", AnonStrategy::Mask, &d), "*2");
    }

    #[test]
    fn generalize_reduces_precision() {
        let d = dict();
        assert_eq!(
            anonymize_value("01.01.1970", "DOB", AnonStrategy::Generalize, &d),
            "1970"
        );
        assert_eq!(
            anonymize_value("94107", "ZIP", AnonStrategy::Generalize, &d),
            "941**"
        );
        assert_eq!(
            anonymize_value("$500.00", "Amount", AnonStrategy::Generalize, &d),
            "100-1,000"
        );
        assert_eq!(
            anonymize_value("34", "Age", AnonStrategy::Generalize, &d),
            "30-39"
        );
        // HIPAA-style coarse bucket above 89.
        assert_eq!(
            anonymize_value("93", "Age", AnonStrategy::Generalize, &d),
            "90+"
        );
    }

    #[test]
    fn synthetic_amount_keeps_currency_marker() {
        let d = dict();
        let fake = anonymize_value("$500.00", "Amount", AnonStrategy::Synthetic, &d);
        assert!(fake.starts_with('$'), "got {fake}");
        let fake_eur = anonymize_value("1.234,56 €", "Betrag", AnonStrategy::Synthetic, &d);
        assert!(fake_eur.ends_with('€'), "got {fake_eur}");
    }

    #[test]
    fn mapping_round_trip_restores_originals() {
        let outcome =
            anonymize_extraction(&scenario_page(), AnonStrategy::Synthetic, &dict());
        let tokenized = outcome.tokenized_lines.join("\n");
        let restored = detokenize(&tokenized, &outcome.mapping);
        assert_eq!(
            restored,
            "Name: John Smith\nDOB: 01.01.1970\nAmount: $500.00"
        );
    }

    #[test]
    fn audit_entries_hash_but_never_contain_originals() {
        let outcome =
            anonymize_extraction(&scenario_page(), AnonStrategy::Synthetic, &dict());
        assert_eq!(outcome.audit.len(), 3);
        let serialized = serde_json::to_string(&outcome.audit).unwrap();
        assert!(!serialized.contains("John Smith"));
        assert!(!serialized.contains("$500.00"));

        let name_entry = &outcome.audit[0];
        assert_eq!(name_entry.field_key, "Name");
        assert_eq!(name_entry.original_sha256.len(), 16);
        assert_eq!(name_entry.original_sha256, original_digest("John Smith"));
        assert_eq!(name_entry.original_len, 10);
    }

    #[test]
    fn empty_values_produce_empty_mapping() {
        let raw = json!({
            "items": [
                {"key": "Fax", "value": null},
                {"key": "Note", "value": ""}
            ],
            "tables": []
        });
        let outcome = anonymize_extraction(&raw, AnonStrategy::Redact, &dict());
        assert!(outcome.mapping.is_empty());
        assert!(outcome.tokenized_lines.is_empty());
        assert!(outcome.audit.is_empty());
    }

    #[test]
    fn table_cells_are_anonymized_too() {
        let raw = json!({
            "items": [],
            "tables": [{
                "headers": ["Name", "Amount"],
                "rows": [{"Name": "Maria Beck", "Amount": "12.00", "confidence": "high"}]
            }]
        });
        let outcome = anonymize_extraction(&raw, AnonStrategy::Redact, &dict());
        let text = serde_json::to_string(&outcome.anonymized).unwrap();
        assert!(!text.contains("Maria Beck"));
        assert!(text.contains("[REDACTED:10]"));
        assert_eq!(outcome.mapping["[NAME_001]"], "Maria Beck");
        assert_eq!(outcome.mapping["[AMOUNT_001]"], "12.00");
    }

    #[test]
    fn counters_increment_within_a_kind() {
        let raw = json!({
            "items": [
                {"key": "Customer Name", "value": "A"},
                {"key": "Holder Name", "value": "B"}
            ],
            "tables": []
        });
        let outcome = anonymize_extraction(&raw, AnonStrategy::Redact, &dict());
        assert_eq!(
            outcome.tokenized_lines,
            vec!["Customer Name: [NAME_001]", "Holder Name: [NAME_002]"]
        );
    }
}
