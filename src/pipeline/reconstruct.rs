//! Page reconstruction: bbox-bearing layout spans → positioned page HTML.
//!
//! The layout model emits flat spans with `data-bbox="x1 y1 x2 y2"` in a
//! 0–1000 normalised space (origin top-left) and a `data-font` class. This
//! module converts them to absolutely positioned elements at the source
//! resolution (300 DPI) inside a page shell that scales down to 96 DPI for
//! display.
//!
//! Font sizing is width-based: the only reliable signal in the layout
//! output is how wide a line's box is relative to how many characters it
//! holds. `font_size = clamp(round(char_width × 1.9), 8, 200)`, with a 0.7
//! multiplier for handwriting, which the model consistently boxes larger
//! than its visual weight.

use crate::pipeline::escape_html;
use once_cell::sync::Lazy;
use regex::Regex;

const LINEBREAK: &str = "___LINEBREAK___";
/// 300 DPI source → 96 DPI display.
const DPI_SCALE: f64 = 96.0 / 300.0;
/// Height/width ratio beyond which a box is treated as vertical text.
const VERTICAL_ASPECT: f64 = 3.0;

static RE_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:span|div|p)\b([^>]*)>(.*?)</(?:span|div|p)>").unwrap()
});
static RE_BBOX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"data-bbox\s*=\s*"([^"]*)""#).unwrap());
static RE_FONT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"data-font\s*=\s*"([^"]*)""#).unwrap());
static RE_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"class\s*=\s*"([^"]*)""#).unwrap());
static RE_BR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

/// One positioned line of text.
#[derive(Debug, Clone)]
pub struct Element {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
    /// Text with `<br>` breaks encoded as a placeholder until escaping.
    pub text: String,
    pub class: String,
    pub font_type: String,
    pub font_size: u32,
    pub is_vertical: bool,
}

/// Compute the pixel font size for one element.
///
/// Monotonic in `char_width` for a fixed font type, clamped to `[8, 200]`;
/// `hand` scales the clamped size by 0.7.
pub fn font_size_px(char_width: f64, font_type: &str) -> u32 {
    let base = (char_width * 1.9).round() as i64;
    let clamped = base.clamp(8, 200) as u32;
    if font_type == "hand" {
        (clamped as f64 * 0.7) as u32
    } else {
        clamped
    }
}

fn font_family(font_type: &str) -> &'static str {
    match font_type {
        "mono" => "'VT323', monospace",
        "serif" => "'Times New Roman', serif",
        "hand" => "'Courier New', monospace",
        _ => "system-ui, sans-serif",
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Parse the layout output into positioned elements at pixel coordinates.
pub fn parse_elements(layout: &str, width: u32, height: u32) -> Vec<Element> {
    let w = width as f64;
    let h = height as f64;
    let mut elements = Vec::new();

    for caps in RE_ELEMENT.captures_iter(layout) {
        let attrs = &caps[1];
        let inner = &caps[2];

        let Some(bbox) = RE_BBOX.captures(attrs) else {
            continue;
        };
        let coords: Vec<f64> = bbox[1]
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if coords.len() != 4 {
            continue;
        }

        // Normalised 0-1000 → source pixels.
        let x1 = (coords[0] * w / 1000.0) as i32;
        let y1 = (coords[1] * h / 1000.0) as i32;
        let x2 = (coords[2] * w / 1000.0) as i32;
        let y2 = (coords[3] * h / 1000.0) as i32;
        let width_px = x2 - x1;
        let height_px = y2 - y1;
        if width_px <= 0 {
            continue;
        }

        let font_type = RE_FONT
            .captures(attrs)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "sans".to_string());
        let class = RE_CLASS
            .captures(attrs)
            .and_then(|c| c[1].split_whitespace().next().map(str::to_string))
            .unwrap_or_else(|| "text".to_string());

        // Preserve explicit breaks through tag stripping.
        let text = RE_BR.replace_all(inner, LINEBREAK);
        let text = RE_TAG.replace_all(&text, "");
        let text = decode_entities(&text).replace('\n', LINEBREAK);
        if text.replace(LINEBREAK, "").trim().is_empty() {
            continue;
        }

        let text_len = text.replace(LINEBREAK, "").chars().count();
        if text_len < 1 {
            continue;
        }
        let char_width = width_px as f64 / text_len as f64;

        let is_vertical =
            height_px > 0 && (height_px as f64 / width_px as f64) > VERTICAL_ASPECT;

        elements.push(Element {
            left: x1,
            top: y1,
            width: width_px,
            height: height_px,
            font_size: font_size_px(char_width, &font_type),
            text,
            class,
            font_type,
            is_vertical,
        });
    }

    // Reading order: top-to-bottom, then left-to-right.
    elements.sort_by_key(|e| (e.top, e.left));
    elements
}

/// Build the final positioned page from the raw layout output.
pub fn reconstruct(layout: &str, width: u32, height: u32, lang_code: &str) -> String {
    let elements = parse_elements(layout, width, height);
    if elements.is_empty() {
        return empty_page(width, height, lang_code);
    }

    let mut spans = String::new();
    for el in &elements {
        let escaped = escape_html(&el.text).replace(LINEBREAK, "<br>");
        let (vertical_class, vertical_style) = if el.is_vertical {
            (
                " vertical-text",
                " writing-mode: vertical-rl; text-orientation: mixed; transform: rotate(180deg);",
            )
        } else {
            ("", "")
        };
        spans.push_str(&format!(
            "<span class=\"word {}{vertical_class}\" \
             style=\"position:absolute; left:{}px; top:{}px; \
             font-size:{}px; line-height:1.2; \
             font-family:{}; \
             white-space:nowrap;{vertical_style}\">{escaped}</span>\n",
            el.class,
            el.left,
            el.top,
            el.font_size,
            font_family(&el.font_type),
        ));
    }

    page_shell(width, height, lang_code, &spans)
}

/// Valid empty page for layouts with zero parseable elements.
pub fn empty_page(width: u32, height: u32, lang_code: &str) -> String {
    page_shell(
        width,
        height,
        lang_code,
        "        <div class=\"empty\">No content extracted</div>\n",
    )
}

fn page_shell(width: u32, height: u32, lang_code: &str, body: &str) -> String {
    let display_w = (width as f64 * DPI_SCALE) as u32;
    let display_h = (height as f64 * DPI_SCALE) as u32;
    format!(
        r#"<!DOCTYPE html>
<html lang="{lang_code}">
<head>
<meta charset="UTF-8">
<title>Document</title>
<link href="https://fonts.googleapis.com/css2?family=VT323&display=swap" rel="stylesheet">
<style>
    * {{ margin:0; padding:0; box-sizing:border-box; }}
    body {{
        background:#f9f9f9;
        display: flex;
        justify-content: center;
        align-items: flex-start;
        padding: 20px;
    }}
    .page-wrapper {{
        width: {display_w}px;
        height: {display_h}px;
    }}
    .page-container {{
        position: relative;
        width: {width}px;
        height: {height}px;
        background: white;
        margin: 20px auto;
        box-shadow: 0 0 10px rgba(0,0,0,0.1);
        overflow: hidden;
        transform: scale({DPI_SCALE:.4});
        transform-origin: top left;
    }}
    .word {{
        position: absolute;
        white-space: nowrap;
        line-height: 1.2 !important;
        overflow: visible;
    }}
    .vertical-text {{
        writing-mode: vertical-rl;
        text-orientation: mixed;
    }}
    .empty {{
        position: absolute;
        top: 50%;
        left: 50%;
        transform: translate(-50%, -50%);
        color: #999;
        font-size: 24px;
    }}
</style>
</head>
<body>
<div class="page-wrapper">
    <div class="page-container">
{body}    </div>
</div>
</body>
</html>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2000x3000 px page: one normalised unit = 2 px wide, 3 px tall.
    const W: u32 = 2000;
    const H: u32 = 3000;

    #[test]
    fn parses_bbox_into_pixel_coordinates() {
        let layout = r#"<span class="label" data-bbox="100 200 300 230" data-font="sans">Invoice No</span>"#;
        let els = parse_elements(layout, W, H);
        assert_eq!(els.len(), 1);
        let el = &els[0];
        assert_eq!(el.left, 200);
        assert_eq!(el.top, 600);
        assert_eq!(el.width, 400);
        assert_eq!(el.height, 90);
        assert_eq!(el.class, "label");
        assert_eq!(el.font_type, "sans");
    }

    #[test]
    fn font_size_is_monotonic_and_clamped() {
        let narrow = font_size_px(3.0, "sans");
        let wide = font_size_px(12.0, "sans");
        assert!(wide > narrow);

        assert_eq!(font_size_px(0.5, "sans"), 8);
        assert_eq!(font_size_px(500.0, "sans"), 200);
    }

    #[test]
    fn handwriting_scales_to_seventy_percent() {
        let printed = font_size_px(10.0, "sans");
        let hand = font_size_px(10.0, "hand");
        assert_eq!(hand, (printed as f64 * 0.7) as u32);
        // The multiplier applies after clamping.
        assert_eq!(font_size_px(500.0, "hand"), 140);
    }

    #[test]
    fn tall_narrow_boxes_become_vertical() {
        // 40 px wide, 600 px tall at pixel scale → aspect 15.
        let layout = r#"<span class="text" data-bbox="100 100 120 300" data-font="sans">縦書き</span>"#;
        let els = parse_elements(layout, W, H);
        assert!(els[0].is_vertical);

        let html = reconstruct(layout, W, H, "ja");
        assert!(html.contains("writing-mode: vertical-rl"));
        assert!(html.contains("rotate(180deg)"));
    }

    #[test]
    fn elements_sort_by_top_then_left() {
        let layout = r#"
<span class="text" data-bbox="500 300 700 330" data-font="sans">third</span>
<span class="text" data-bbox="500 100 700 130" data-font="sans">second</span>
<span class="text" data-bbox="100 100 300 130" data-font="sans">first</span>"#;
        let els = parse_elements(layout, W, H);
        let order: Vec<&str> = els.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn elements_without_bbox_or_text_are_skipped() {
        let layout = r#"
<span class="text">no bbox</span>
<span class="text" data-bbox="0 0 100 30" data-font="sans">   </span>
<span class="text" data-bbox="0 0 100 30" data-font="sans">kept</span>"#;
        let els = parse_elements(layout, W, H);
        assert_eq!(els.len(), 1);
        assert_eq!(els[0].text, "kept");
    }

    #[test]
    fn breaks_survive_escaping() {
        let layout = r#"<span class="text" data-bbox="0 0 400 60" data-font="sans">line one<br>line &amp; two</span>"#;
        let html = reconstruct(layout, W, H, "en");
        assert!(html.contains("line one<br>line &amp; two"));
    }

    #[test]
    fn char_width_ignores_breaks() {
        // 10 visible chars over 400 px → char width 40 either way.
        let plain = r#"<span data-bbox="0 0 200 15" data-font="sans">aaaaabbbbb</span>"#;
        let broken = r#"<span data-bbox="0 0 200 15" data-font="sans">aaaaa<br>bbbbb</span>"#;
        let a = parse_elements(plain, W, H);
        let b = parse_elements(broken, W, H);
        assert_eq!(a[0].font_size, b[0].font_size);
    }

    #[test]
    fn zero_elements_yield_valid_empty_shell() {
        let html = reconstruct("no spans here", W, H, "en");
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("No content extracted"));
        assert!(html.contains("lang=\"en\""));
    }

    #[test]
    fn shell_scales_source_to_display_dpi() {
        let layout =
            r#"<span class="text" data-bbox="0 0 500 30" data-font="sans">x</span>"#;
        let html = reconstruct(layout, W, H, "en");
        // 2000 × 0.32 = 640, 3000 × 0.32 = 960.
        assert!(html.contains("width: 640px"));
        assert!(html.contains("height: 960px"));
        assert!(html.contains("scale(0.3200)"));
    }
}
