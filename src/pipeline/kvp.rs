//! KVP handler: extraction, master-table normalisation, structured output.
//!
//! The model returns a raw `{items: [], tables: []}` extraction. What
//! happens next depends on whether the user selected specific fields:
//!
//! * no selection — the raw extraction is normalised against the master
//!   table: aliases resolve to canonical keys, items are bucketed into
//!   categories, tables flatten into `line_items`, sectors aggregate, and
//!   completeness stats are computed;
//! * selection — a structured dict with exactly one entry per selected key
//!   is built (empty string when not found), while the raw extraction is
//!   still persisted for downstream use.
//!
//! The master table is data, not code: a JSON document mapping sectors to
//! canonical keys and their aliases, loaded once at startup and overridable
//! via `DOCPIPE_MASTER_KVPS`.

use crate::error::{PipelineError, UnitError};
use crate::model::{PromptFamily, VisionModel};
use crate::pipeline::{
    diagnostic_document, dump_raw_output, extract_json_region, kvp_html, Artifact,
    PageOutcome, UnitContext,
};
use crate::prompts;
use crate::types::{ArtifactKind, SelectedField};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Field categories in display order. Unmatched keys land in `other`.
pub const CATEGORIES: [&str; 7] = [
    "header", "supplier", "customer", "delivery", "totals", "payment", "other",
];

const DEFAULT_MASTER_KVPS: &str = include_str!("../../data/master_kvps.json");

// ── Master table ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct MasterFile {
    #[serde(default)]
    version: String,
    #[serde(default)]
    sectors: BTreeMap<String, MasterSector>,
}

#[derive(Debug, Clone, Deserialize)]
struct MasterSector {
    name: String,
    #[serde(default)]
    kvps: Vec<MasterEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct MasterEntry {
    key: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    required: bool,
}

/// One canonical key definition, flattened out of its sector.
#[derive(Debug, Clone)]
pub struct MasterKvp {
    pub key: String,
    pub aliases: Vec<String>,
    pub category: String,
    pub sector: String,
    pub sector_name: String,
    pub required: bool,
}

/// The loaded alias → canonical key → sector table.
#[derive(Debug, Clone, Default)]
pub struct MasterTable {
    pub version: String,
    pub keys: Vec<MasterKvp>,
}

impl MasterTable {
    /// Load from an override path, or fall back to the bundled table.
    pub fn load(path: Option<&Path>) -> Result<MasterTable, PipelineError> {
        let (content, origin) = match path {
            Some(p) => (
                std::fs::read_to_string(p).map_err(|e| PipelineError::DataTable {
                    path: p.to_path_buf(),
                    detail: e.to_string(),
                })?,
                p.to_path_buf(),
            ),
            None => (
                DEFAULT_MASTER_KVPS.to_string(),
                PathBuf::from("data/master_kvps.json"),
            ),
        };
        let file: MasterFile =
            serde_json::from_str(&content).map_err(|e| PipelineError::DataTable {
                path: origin,
                detail: e.to_string(),
            })?;

        let mut keys = Vec::new();
        for (sector_id, sector) in &file.sectors {
            for entry in &sector.kvps {
                keys.push(MasterKvp {
                    key: entry.key.clone(),
                    aliases: entry.aliases.clone(),
                    category: entry
                        .category
                        .clone()
                        .filter(|c| CATEGORIES.contains(&c.as_str()))
                        .unwrap_or_else(|| "other".to_string()),
                    sector: sector_id.clone(),
                    sector_name: sector.name.clone(),
                    required: entry.required,
                });
            }
        }
        info!(
            "Loaded {} master KVPs from {} sectors",
            keys.len(),
            file.sectors.len()
        );
        Ok(MasterTable {
            version: file.version,
            keys,
        })
    }

    /// Open-ended extraction mode: no normalisation targets.
    pub fn empty() -> MasterTable {
        MasterTable::default()
    }
}

/// Per-canonical-key lookup info.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    pub category: String,
    pub sector: String,
    pub sector_name: String,
    pub required: bool,
}

/// Lookup maps derived from the master table.
#[derive(Debug, Clone, Default)]
pub struct AliasMap {
    alias_to_standard: HashMap<String, String>,
    info: HashMap<String, KeyInfo>,
}

impl AliasMap {
    pub fn build(master: &MasterTable) -> AliasMap {
        let mut map = AliasMap::default();
        for def in &master.keys {
            map.info.insert(
                def.key.clone(),
                KeyInfo {
                    category: def.category.clone(),
                    sector: def.sector.clone(),
                    sector_name: def.sector_name.clone(),
                    required: def.required,
                },
            );
            // The canonical key is its own alias.
            for alias in std::iter::once(&def.key).chain(def.aliases.iter()) {
                map.alias_to_standard
                    .insert(alias.to_lowercase().trim().to_string(), def.key.clone());
            }
        }
        map
    }

    /// Resolve an extracted key to its canonical name, if any.
    pub fn resolve(&self, raw_key: &str) -> Option<&str> {
        self.alias_to_standard
            .get(raw_key.to_lowercase().trim())
            .map(String::as_str)
    }

    pub fn info(&self, standard_key: &str) -> Option<&KeyInfo> {
        self.info.get(standard_key)
    }
}

// ── Normalised output ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct NormalizedItem {
    pub visible_key: String,
    pub standardized_key: Option<String>,
    pub value: Value,
    pub confidence: String,
    pub uncertain: bool,
    pub required: bool,
    pub found: bool,
    pub sector: Option<String>,
    pub sector_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SectorRef {
    pub sector_id: String,
    pub sector_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionStats {
    pub total_standardized_keys: usize,
    pub keys_found: usize,
    pub line_items_found: usize,
    pub required_keys: usize,
    pub required_keys_found: usize,
    pub completeness_pct: f64,
    pub required_completeness_pct: f64,
    pub sectors_matched: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizedExtraction {
    pub document_type: String,
    pub extraction_mode: String,
    /// Category name → items; `line_items` handled separately.
    pub fields: BTreeMap<String, Vec<NormalizedItem>>,
    pub line_items: Vec<serde_json::Map<String, Value>>,
    pub sectors_detected: Vec<SectorRef>,
    pub extraction_stats: ExtractionStats,
}

fn value_found(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Normalise a raw `{items, tables}` extraction against the master table.
pub fn normalize_extraction(raw: &Value, master: &MasterTable) -> NormalizedExtraction {
    let alias = AliasMap::build(master);
    let mut fields: BTreeMap<String, Vec<NormalizedItem>> = CATEGORIES
        .iter()
        .map(|c| (c.to_string(), Vec::new()))
        .collect();
    let mut line_items = Vec::new();
    let mut sectors: BTreeSet<(String, String)> = BTreeSet::new();

    let empty = Vec::new();
    let items = raw["items"].as_array().unwrap_or(&empty);
    for item in items {
        let visible_key = item["key"].as_str().unwrap_or("").to_string();
        let value = item["value"].clone();
        let confidence = item["confidence"].as_str().unwrap_or("medium").to_string();
        let uncertain = item["uncertain"].as_bool().unwrap_or(false);

        let standardized = alias.resolve(&visible_key).map(str::to_string);
        let info = standardized.as_deref().and_then(|k| alias.info(k));
        let category = info
            .map(|i| i.category.clone())
            .unwrap_or_else(|| "other".to_string());
        let found = value_found(&value);

        if let (Some(i), true) = (info, found) {
            sectors.insert((i.sector.clone(), i.sector_name.clone()));
        }

        fields.entry(category).or_default().push(NormalizedItem {
            visible_key,
            required: info.map(|i| i.required).unwrap_or(false),
            sector: info.map(|i| i.sector.clone()),
            sector_name: info.map(|i| i.sector_name.clone()),
            standardized_key: standardized,
            value,
            confidence,
            uncertain,
            found,
        });
    }

    let tables = raw["tables"].as_array().unwrap_or(&empty);
    for table in tables {
        let headers: Vec<&str> = table["headers"]
            .as_array()
            .map(|h| h.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        for row in table["rows"].as_array().unwrap_or(&empty) {
            let mut line_item = serde_json::Map::new();
            let confidence = row["confidence"].as_str().unwrap_or("medium");
            for header in &headers {
                let Some(cell) = row.get(*header) else {
                    continue;
                };
                let standard = alias
                    .resolve(header)
                    .map(str::to_string)
                    .unwrap_or_else(|| header.to_string());
                if let Some(info) = alias.info(&standard) {
                    if value_found(cell) {
                        sectors.insert((info.sector.clone(), info.sector_name.clone()));
                    }
                }
                line_item.insert(standard, cell.clone());
            }
            line_item.insert("confidence".to_string(), Value::String(confidence.to_string()));
            line_items.push(line_item);
        }
    }

    // Stats over the normalised items.
    let all_items = fields.values().flatten();
    let keys_found = all_items.clone().filter(|i| i.found).count();
    let required_keys_found = all_items.filter(|i| i.required && i.found).count();
    let total_std = master.keys.len();
    let total_required = master.keys.iter().filter(|k| k.required).count();
    let pct = |num: usize, den: usize, when_empty: f64| {
        if den > 0 {
            (num as f64 / den as f64 * 1000.0).round() / 10.0
        } else {
            when_empty
        }
    };

    NormalizedExtraction {
        document_type: raw["document_type"]
            .as_str()
            .unwrap_or("unknown")
            .to_string(),
        extraction_mode: "kvp".to_string(),
        extraction_stats: ExtractionStats {
            total_standardized_keys: total_std,
            keys_found,
            line_items_found: line_items.len(),
            required_keys: total_required,
            required_keys_found,
            completeness_pct: pct(keys_found, total_std, 0.0),
            required_completeness_pct: pct(required_keys_found, total_required, 100.0),
            sectors_matched: sectors.len(),
        },
        fields,
        line_items,
        sectors_detected: sectors
            .into_iter()
            .map(|(sector_id, sector_name)| SectorRef {
                sector_id,
                sector_name,
            })
            .collect(),
    }
}

/// Structured output: exactly one entry per selected key, empty string when
/// the page has no matching value. Alias resolution first, then a direct
/// separator-insensitive match for custom fields. Higher-confidence values
/// overwrite earlier low-confidence ones.
pub fn structured_output(
    raw: &Value,
    selected: &[SelectedField],
    alias: &AliasMap,
) -> BTreeMap<String, String> {
    let mut output: BTreeMap<String, String> = selected
        .iter()
        .filter_map(|f| f.name().map(|n| (n.to_string(), String::new())))
        .collect();

    let empty = Vec::new();
    for item in raw["items"].as_array().unwrap_or(&empty) {
        let raw_key = item["key"].as_str().unwrap_or("");
        let value = match &item["value"] {
            Value::String(s) => s.clone(),
            Value::Null => continue,
            other => other.to_string(),
        };
        let high_confidence = item["confidence"].as_str() == Some("high");

        if let Some(std_key) = alias.resolve(raw_key) {
            if let Some(slot) = output.get_mut(std_key) {
                if slot.is_empty() || high_confidence {
                    *slot = value.clone();
                }
            }
        }

        // Custom fields match on the name itself, ignoring separators.
        let flat = |s: &str| s.to_lowercase().replace(['_', '-'], " ");
        let raw_flat = flat(raw_key.trim());
        for (selected_key, slot) in output.iter_mut() {
            if flat(selected_key) == raw_flat && (slot.is_empty() || high_confidence) {
                *slot = value.clone();
            }
        }
    }

    output
}

// ── Handler ──────────────────────────────────────────────────────────────

pub fn process(
    model: &dyn VisionModel,
    image: &Path,
    ctx: &UnitContext<'_>,
) -> Result<PageOutcome, UnitError> {
    let selected = ctx
        .options
        .selected_kvps
        .as_deref()
        .filter(|s| s.iter().any(|f| f.name().is_some()));

    let prompt = prompts::kvp_extraction_prompt(selected);
    let raw = model.generate(image, &prompt, &ctx.decode.kvp)?;
    dump_raw_output(ctx, PromptFamily::Kvp, &raw);

    let parsed = extract_json_region(&raw)
        .and_then(|r| serde_json::from_str::<Value>(r).ok())
        .filter(|v| v.get("items").is_some() || v.get("tables").is_some());

    let Some(extraction) = parsed else {
        warn!("Page {}: kvp output unparsable, soft failure", ctx.page_number);
        let doc = diagnostic_document("invalid json", &raw, ctx.page_number);
        return Ok(PageOutcome {
            artifacts: vec![
                Artifact {
                    kind: ArtifactKind::KvpHtml,
                    body: kvp_html::render_error(ctx.page_number),
                },
                Artifact {
                    kind: ArtifactKind::KvpJson,
                    body: serde_json::to_string_pretty(&doc).unwrap_or_default(),
                },
            ],
            soft_error: true,
            ..PageOutcome::default()
        });
    };

    let (json_body, html_body) = match selected {
        Some(selected) => {
            let alias = AliasMap::build(ctx.master);
            let structured = structured_output(&extraction, selected, &alias);
            info!(
                "Page {}: structured output with {} selected fields",
                ctx.page_number,
                structured.len()
            );
            // Persist the RAW extraction, not the filtered view: it keeps
            // repeated keys and unselected data for downstream use.
            (
                serde_json::to_string_pretty(&extraction).unwrap_or_default(),
                kvp_html::render_structured(&structured),
            )
        }
        None => {
            let normalized = normalize_extraction(&extraction, ctx.master);
            info!(
                "Page {}: {} keys found, {} line items",
                ctx.page_number,
                normalized.extraction_stats.keys_found,
                normalized.extraction_stats.line_items_found
            );
            (
                serde_json::to_string_pretty(&normalized).unwrap_or_default(),
                kvp_html::render_normalized(&normalized),
            )
        }
    };

    Ok(PageOutcome {
        artifacts: vec![
            Artifact {
                kind: ArtifactKind::KvpHtml,
                body: html_body,
            },
            Artifact {
                kind: ArtifactKind::KvpJson,
                body: json_body,
            },
        ],
        ..PageOutcome::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_master() -> MasterTable {
        MasterTable {
            version: "test".into(),
            keys: vec![
                MasterKvp {
                    key: "invoice_number".into(),
                    aliases: vec!["Invoice No".into(), "Rechnungsnummer".into()],
                    category: "header".into(),
                    sector: "invoicing".into(),
                    sector_name: "Invoicing".into(),
                    required: true,
                },
                MasterKvp {
                    key: "iban".into(),
                    aliases: vec!["IBAN".into()],
                    category: "payment".into(),
                    sector: "banking".into(),
                    sector_name: "Banking".into(),
                    required: false,
                },
            ],
        }
    }

    #[test]
    fn every_alias_resolves_to_its_canonical_key() {
        let master = test_master();
        let alias = AliasMap::build(&master);
        for def in &master.keys {
            for a in std::iter::once(&def.key).chain(def.aliases.iter()) {
                assert_eq!(alias.resolve(a), Some(def.key.as_str()), "alias {a}");
            }
        }
        // Case- and whitespace-insensitive.
        assert_eq!(alias.resolve("  INVOICE NO "), Some("invoice_number"));
        assert_eq!(alias.resolve("unheard of"), None);
    }

    #[test]
    fn normalisation_buckets_categories_and_sectors() {
        let raw = json!({
            "items": [
                {"key": "Invoice No", "value": "INV-42", "confidence": "high"},
                {"key": "IBAN", "value": "DE89 3704 0044", "confidence": "medium"},
                {"key": "Scribble", "value": "???", "confidence": "low", "uncertain": true}
            ],
            "tables": []
        });
        let n = normalize_extraction(&raw, &test_master());

        assert_eq!(n.fields["header"].len(), 1);
        assert_eq!(
            n.fields["header"][0].standardized_key.as_deref(),
            Some("invoice_number")
        );
        assert!(n.fields["header"][0].required);
        assert_eq!(n.fields["payment"].len(), 1);
        assert_eq!(n.fields["other"].len(), 1);
        assert!(n.fields["other"][0].uncertain);
        assert!(n.fields["other"][0].standardized_key.is_none());

        let sector_ids: Vec<&str> =
            n.sectors_detected.iter().map(|s| s.sector_id.as_str()).collect();
        assert_eq!(sector_ids, vec!["banking", "invoicing"]);

        assert_eq!(n.extraction_stats.keys_found, 3);
        assert_eq!(n.extraction_stats.required_keys_found, 1);
        assert_eq!(n.extraction_stats.required_completeness_pct, 100.0);
        assert_eq!(n.extraction_stats.sectors_matched, 2);
    }

    #[test]
    fn tables_flatten_to_line_items_with_normalised_columns() {
        let raw = json!({
            "items": [],
            "tables": [{
                "headers": ["Invoice No", "Qty"],
                "rows": [
                    {"Invoice No": "A-1", "Qty": "10", "confidence": "high"},
                    {"Invoice No": "A-2", "Qty": "3"}
                ]
            }]
        });
        let n = normalize_extraction(&raw, &test_master());
        assert_eq!(n.line_items.len(), 2);
        // Header resolved through the alias map; unknown header kept as-is.
        assert_eq!(n.line_items[0]["invoice_number"], "A-1");
        assert_eq!(n.line_items[0]["Qty"], "10");
        assert_eq!(n.line_items[1]["confidence"], "medium");
        assert_eq!(n.extraction_stats.line_items_found, 2);
    }

    #[test]
    fn empty_values_do_not_count_as_found() {
        let raw = json!({
            "items": [
                {"key": "Invoice No", "value": null, "confidence": "high"},
                {"key": "IBAN", "value": "", "confidence": "high"}
            ],
            "tables": []
        });
        let n = normalize_extraction(&raw, &test_master());
        assert_eq!(n.extraction_stats.keys_found, 0);
        assert!(n.sectors_detected.is_empty());
    }

    #[test]
    fn structured_output_covers_every_selected_key() {
        let raw = json!({
            "items": [
                {"key": "Rechnungsnummer", "value": "2025-1", "confidence": "high"},
                {"key": "Ben", "value": "yes", "confidence": "medium"}
            ],
            "tables": []
        });
        let selected = vec![
            SelectedField::master("invoice_number"),
            SelectedField::master("iban"),
            SelectedField::custom("Ben"),
        ];
        let alias = AliasMap::build(&test_master());
        let out = structured_output(&raw, &selected, &alias);

        assert_eq!(out["invoice_number"], "2025-1");
        assert_eq!(out["iban"], "");
        assert_eq!(out["Ben"], "yes");
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn high_confidence_overwrites_low() {
        let raw = json!({
            "items": [
                {"key": "Invoice No", "value": "smudged", "confidence": "low"},
                {"key": "Rechnungsnummer", "value": "2025-9", "confidence": "high"}
            ],
            "tables": []
        });
        let selected = vec![SelectedField::master("invoice_number")];
        let alias = AliasMap::build(&test_master());
        let out = structured_output(&raw, &selected, &alias);
        assert_eq!(out["invoice_number"], "2025-9");
    }

    #[test]
    fn bundled_master_table_loads() {
        let master = MasterTable::load(None).unwrap();
        assert!(!master.keys.is_empty());
        // Scenario anchors from the bundled table.
        let alias = AliasMap::build(&master);
        assert!(alias.resolve("invoice no").is_some());
    }
}
