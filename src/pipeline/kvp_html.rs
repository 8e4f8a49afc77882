//! KVP result → reviewer HTML.
//!
//! The primary kvp artifact is an HTML page the frontend can drop straight
//! into its viewer: stats badges, detected sectors, one section per field
//! category, line items as a table, confidence markers. The structured
//! (selected-fields) variant renders a simple found/not-found table.

use crate::pipeline::escape_html;
use crate::pipeline::kvp::{NormalizedExtraction, NormalizedItem, CATEGORIES};
use serde_json::Value;
use std::collections::BTreeMap;

const STYLES: &str = r#"<style>
.kvp-results {
    font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Helvetica, Arial, sans-serif;
    max-width: 1200px;
    margin: 0 auto;
    padding: 24px;
    background: #ffffff;
    color: #1a1a1a;
}
.kvp-stats { display: flex; gap: 12px; flex-wrap: wrap; margin-bottom: 24px; padding: 16px; background: #f5f5f5; border-radius: 8px; }
.kvp-stat { display: flex; flex-direction: column; padding: 8px 16px; background: white; border-radius: 6px; border: 1px solid #e0e0e0; }
.kvp-stat-label { font-size: 12px; color: #666; text-transform: uppercase; }
.kvp-stat-value { font-size: 20px; font-weight: 600; }
.kvp-sectors { margin-bottom: 24px; }
.kvp-sector-chip { display: inline-block; padding: 4px 12px; margin-right: 8px; background: #e8f0fe; color: #1a56db; border-radius: 12px; font-size: 13px; }
.kvp-section { margin-bottom: 24px; }
.kvp-section h3 { font-size: 15px; margin-bottom: 8px; border-bottom: 1px solid #e0e0e0; padding-bottom: 4px; }
.kvp-item { display: flex; justify-content: space-between; padding: 6px 8px; border-bottom: 1px solid #f0f0f0; }
.kvp-key { color: #555; }
.kvp-key .std { color: #999; font-size: 12px; margin-left: 6px; }
.kvp-value { font-weight: 500; }
.kvp-missing .kvp-value { color: #bbb; font-style: italic; }
.conf-low { border-left: 3px solid #f0ad4e; }
.conf-uncertain { border-left: 3px solid #d9534f; }
.kvp-table { width: 100%; border-collapse: collapse; margin-top: 8px; }
.kvp-table th, .kvp-table td { text-align: left; padding: 6px 8px; border-bottom: 1px solid #e8e8e8; font-size: 14px; }
.kvp-table th { background: #fafafa; text-transform: capitalize; }
.kvp-error { padding: 24px; background: #fdf2f2; border: 1px solid #f5c6c6; border-radius: 8px; color: #9b1c1c; }
</style>"#;

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn item_row(item: &NormalizedItem) -> String {
    let value = value_text(&item.value);
    let mut classes = String::from("kvp-item");
    if !item.found {
        classes.push_str(" kvp-missing");
    }
    if item.uncertain {
        classes.push_str(" conf-uncertain");
    } else if item.confidence == "low" {
        classes.push_str(" conf-low");
    }
    let std_tag = item
        .standardized_key
        .as_deref()
        .map(|k| format!(" <span class=\"std\">({})</span>", escape_html(k)))
        .unwrap_or_default();
    format!(
        "<div class=\"{classes}\"><span class=\"kvp-key\">{}{std_tag}</span>\
         <span class=\"kvp-value\">{}</span></div>\n",
        escape_html(&item.visible_key),
        if value.is_empty() {
            "(not found)".to_string()
        } else {
            escape_html(&value)
        },
    )
}

/// Full categorised view.
pub fn render_normalized(extraction: &NormalizedExtraction) -> String {
    let mut html = String::from(STYLES);
    html.push_str("<div class=\"kvp-results\">\n");

    // Stats badges.
    let stats = &extraction.extraction_stats;
    html.push_str("<div class=\"kvp-stats\">\n");
    for (label, value) in [
        ("Keys found", stats.keys_found.to_string()),
        ("Line items", stats.line_items_found.to_string()),
        ("Completeness", format!("{}%", stats.completeness_pct)),
        (
            "Required",
            format!("{}/{}", stats.required_keys_found, stats.required_keys),
        ),
    ] {
        html.push_str(&format!(
            "<div class=\"kvp-stat\"><span class=\"kvp-stat-label\">{label}</span>\
             <span class=\"kvp-stat-value\">{value}</span></div>\n"
        ));
    }
    html.push_str("</div>\n");

    if !extraction.sectors_detected.is_empty() {
        html.push_str("<div class=\"kvp-sectors\">\n");
        for sector in &extraction.sectors_detected {
            html.push_str(&format!(
                "<span class=\"kvp-sector-chip\">{}</span>\n",
                escape_html(&sector.sector_name)
            ));
        }
        html.push_str("</div>\n");
    }

    let titles: BTreeMap<&str, &str> = [
        ("header", "Header Information"),
        ("supplier", "Supplier Details"),
        ("customer", "Customer Details"),
        ("delivery", "Delivery Information"),
        ("totals", "Totals & Amounts"),
        ("payment", "Payment Information"),
        ("other", "Other Fields"),
    ]
    .into_iter()
    .collect();

    for category in CATEGORIES {
        let Some(items) = extraction.fields.get(category) else {
            continue;
        };
        if items.is_empty() {
            continue;
        }
        html.push_str(&format!(
            "<div class=\"kvp-section\"><h3>{}</h3>\n",
            titles.get(category).unwrap_or(&category)
        ));
        for item in items {
            html.push_str(&item_row(item));
        }
        html.push_str("</div>\n");
    }

    if !extraction.line_items.is_empty() {
        // Column order from the first row, minus the confidence marker.
        let columns: Vec<&String> = extraction.line_items[0]
            .keys()
            .filter(|k| k.as_str() != "confidence")
            .collect();
        html.push_str("<div class=\"kvp-section\"><h3>Line Items</h3>\n<table class=\"kvp-table\"><tr>");
        for col in &columns {
            html.push_str(&format!("<th>{}</th>", escape_html(col)));
        }
        html.push_str("</tr>\n");
        for row in &extraction.line_items {
            html.push_str("<tr>");
            for col in &columns {
                let cell = row.get(*col).map(value_text).unwrap_or_default();
                html.push_str(&format!("<td>{}</td>", escape_html(&cell)));
            }
            html.push_str("</tr>\n");
        }
        html.push_str("</table></div>\n");
    }

    html.push_str("</div>\n");
    html
}

/// Selected-fields view: one row per chosen key.
pub fn render_structured(structured: &BTreeMap<String, String>) -> String {
    let mut html = String::from(STYLES);
    html.push_str("<div class=\"kvp-results\">\n<div class=\"kvp-section\"><h3>Selected Fields</h3>\n");
    for (key, value) in structured {
        let missing = if value.is_empty() { " kvp-missing" } else { "" };
        html.push_str(&format!(
            "<div class=\"kvp-item{missing}\"><span class=\"kvp-key\">{}</span>\
             <span class=\"kvp-value\">{}</span></div>\n",
            escape_html(key),
            if value.is_empty() {
                "(not found)".to_string()
            } else {
                escape_html(value)
            },
        ));
    }
    html.push_str("</div>\n</div>\n");
    html
}

/// Soft-failure card shown when the extraction could not be parsed.
pub fn render_error(page_number: u32) -> String {
    format!(
        "{STYLES}<div class=\"kvp-results\"><div class=\"kvp-error\">\
         Extraction for page {page_number} could not be parsed. \
         The raw model output is preserved in the JSON artifact.\
         </div></div>\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::kvp::{normalize_extraction, MasterTable};
    use serde_json::json;

    #[test]
    fn normalized_render_contains_sections_and_stats() {
        let raw = json!({
            "items": [{"key": "Order <No>", "value": "A&B-1", "confidence": "high"}],
            "tables": [{
                "headers": ["Item", "Price"],
                "rows": [{"Item": "Widget", "Price": "5.00", "confidence": "high"}]
            }]
        });
        let normalized = normalize_extraction(&raw, &MasterTable::empty());
        let html = render_normalized(&normalized);

        assert!(html.contains("Keys found"));
        assert!(html.contains("Other Fields"));
        assert!(html.contains("Line Items"));
        // Values and keys are escaped.
        assert!(html.contains("Order &lt;No&gt;"));
        assert!(html.contains("A&amp;B-1"));
        assert!(!html.contains("Order <No>"));
    }

    #[test]
    fn structured_render_marks_missing_fields() {
        let mut structured = BTreeMap::new();
        structured.insert("invoice_number".to_string(), "INV-1".to_string());
        structured.insert("iban".to_string(), String::new());
        let html = render_structured(&structured);

        assert!(html.contains("INV-1"));
        assert!(html.contains("(not found)"));
        assert!(html.contains("kvp-missing"));
    }

    #[test]
    fn error_card_names_the_page() {
        let html = render_error(7);
        assert!(html.contains("page 7"));
        assert!(html.contains("kvp-error"));
    }
}
