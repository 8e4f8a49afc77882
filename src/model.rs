//! Vision-language model adapter.
//!
//! The pipeline treats the VLM as a black-box callable:
//! `generate(image, prompt, params) -> text`. Loading the model is a
//! one-shot, synchronous, expensive (30–60 s) operation that happens exactly
//! once per worker process, inside the adapter constructor. The adapter is
//! not thread-safe by contract — workers are single-threaded with respect to
//! model calls, so the trait takes `&self` but implementations may assume no
//! concurrent callers.
//!
//! Two implementations ship:
//!
//! * [`HttpVision`] — posts the page image and prompt to a local
//!   single-tenant inference endpoint. Construction performs the warm-up
//!   request that blocks until the weights are resident; this is the "load
//!   once" step the pool manager serialises across workers.
//! * [`SimulatedVision`] — deterministic-on-seed fixture generator for
//!   development and tests. Recognises each prompt family and produces
//!   grammar-conforming output; tests can also script exact responses.

use crate::config::{Config, ModelBackend};
use crate::error::{ModelError, PipelineError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

// ── Decoding parameters ──────────────────────────────────────────────────

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: Option<f32>,
    pub repetition_penalty: Option<f32>,
    /// Stop at the first newline (language detection only).
    pub stop_on_newline: bool,
}

impl DecodeParams {
    /// Language detection: greedy, 20-token cap, first line only.
    pub fn language() -> Self {
        DecodeParams {
            temperature: 0.0,
            max_tokens: 20,
            top_p: None,
            repetition_penalty: None,
            stop_on_newline: true,
        }
    }

    /// Layout extraction: slight temperature, narrow nucleus, mild
    /// repetition penalty so long span streams don't loop.
    pub fn html() -> Self {
        DecodeParams {
            temperature: 0.1,
            max_tokens: 16_384,
            top_p: Some(0.4),
            repetition_penalty: Some(1.05),
            stop_on_newline: false,
        }
    }

    /// Key-value JSON extraction: greedy, strict parser downstream.
    pub fn json_kv() -> Self {
        DecodeParams {
            temperature: 0.0,
            max_tokens: 4_096,
            top_p: None,
            repetition_penalty: None,
            stop_on_newline: false,
        }
    }

    /// KVP extraction needs headroom for dense tables.
    pub fn kvp() -> Self {
        DecodeParams {
            temperature: 0.0,
            max_tokens: 20_480,
            top_p: None,
            repetition_penalty: None,
            stop_on_newline: false,
        }
    }

    /// Anonymisation uses the same parser as kvp.
    pub fn anon() -> Self {
        DecodeParams::kvp()
    }
}

/// Per-format decode parameters with env overrides applied once at startup.
#[derive(Debug, Clone)]
pub struct DecodeTable {
    pub language: DecodeParams,
    pub html: DecodeParams,
    pub json_kv: DecodeParams,
    pub kvp: DecodeParams,
    pub anon: DecodeParams,
}

impl DecodeTable {
    pub fn from_overrides(
        overrides: &BTreeMap<String, String>,
    ) -> Result<DecodeTable, PipelineError> {
        Ok(DecodeTable {
            language: apply(DecodeParams::language(), "LANGUAGE", overrides)?,
            html: apply(DecodeParams::html(), "HTML", overrides)?,
            json_kv: apply(DecodeParams::json_kv(), "JSON", overrides)?,
            kvp: apply(DecodeParams::kvp(), "KVP", overrides)?,
            anon: apply(DecodeParams::anon(), "ANON", overrides)?,
        })
    }
}

fn apply(
    mut params: DecodeParams,
    fmt: &str,
    overrides: &BTreeMap<String, String>,
) -> Result<DecodeParams, PipelineError> {
    let bad = |key: &str, val: &str| {
        PipelineError::InvalidConfig(format!("{key} is not a number: '{val}'"))
    };
    let key = format!("DOCPIPE_GEN_{fmt}_TEMPERATURE");
    if let Some(v) = overrides.get(&key) {
        params.temperature = v.parse().map_err(|_| bad(&key, v))?;
    }
    let key = format!("DOCPIPE_GEN_{fmt}_MAX_TOKENS");
    if let Some(v) = overrides.get(&key) {
        params.max_tokens = v.parse().map_err(|_| bad(&key, v))?;
    }
    let key = format!("DOCPIPE_GEN_{fmt}_TOP_P");
    if let Some(v) = overrides.get(&key) {
        params.top_p = Some(v.parse().map_err(|_| bad(&key, v))?);
    }
    let key = format!("DOCPIPE_GEN_{fmt}_REPETITION_PENALTY");
    if let Some(v) = overrides.get(&key) {
        params.repetition_penalty = Some(v.parse().map_err(|_| bad(&key, v))?);
    }
    Ok(params)
}

// ── Adapter trait ────────────────────────────────────────────────────────

/// The black-box generate call. Synchronous: a model call owns the GPU for
/// its duration and there is nothing useful to overlap inside one worker.
pub trait VisionModel: Send + Sync {
    fn generate(
        &self,
        image: &Path,
        prompt: &str,
        params: &DecodeParams,
    ) -> Result<String, ModelError>;

    /// Human-readable backend description for startup logs.
    fn describe(&self) -> String;
}

/// Construct the configured adapter. This is the per-process "load exactly
/// once" step — expensive for real backends, instant for the simulator.
pub fn load_vision_model(
    cfg: &Config,
) -> Result<std::sync::Arc<dyn VisionModel>, PipelineError> {
    match cfg.model_backend {
        ModelBackend::Simulated => Ok(std::sync::Arc::new(SimulatedVision::new(0))),
        ModelBackend::Http => {
            let adapter = HttpVision::connect(
                &cfg.model_endpoint,
                cfg.model_path.as_deref(),
                Duration::from_secs(cfg.generation_timeout_secs),
            )
            .map_err(PipelineError::ModelInit)?;
            Ok(std::sync::Arc::new(adapter))
        }
    }
}

// ── Prompt families ──────────────────────────────────────────────────────

/// Which extraction mode a prompt belongs to. Used by the simulator to pick
/// a grammar-conforming fixture and by the raw-output dump for filenames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptFamily {
    Language,
    HtmlLayout,
    KvJson,
    Kvp,
    Anon,
}

impl PromptFamily {
    pub fn classify(prompt: &str) -> PromptFamily {
        if prompt.contains("language detection assistant") {
            PromptFamily::Language
        } else if prompt.contains("data-bbox") {
            PromptFamily::HtmlLayout
        } else if prompt.contains("document_type") {
            PromptFamily::KvJson
        } else if prompt.contains("anonymized for privacy compliance") {
            PromptFamily::Anon
        } else {
            PromptFamily::Kvp
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PromptFamily::Language => "language",
            PromptFamily::HtmlLayout => "html",
            PromptFamily::KvJson => "json",
            PromptFamily::Kvp => "kvp",
            PromptFamily::Anon => "anon",
        }
    }
}

// ── HTTP shell ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    text: String,
}

/// Thin shell over a local single-tenant inference endpoint.
///
/// The endpoint owns the GPU and serves exactly one worker, preserving the
/// process-level GPU isolation of the pool. Expected surface:
/// `POST /load {model_path}` (blocks until resident) and
/// `POST /generate {image_b64, prompt, ...} -> {text}`.
pub struct HttpVision {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpVision {
    pub fn connect(
        endpoint: &str,
        model_path: Option<&Path>,
        call_timeout: Duration,
    ) -> Result<HttpVision, ModelError> {
        // Warm-up can take as long as a model load; give it headroom beyond
        // the per-generation timeout.
        let client = reqwest::blocking::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| ModelError::Request {
                detail: e.to_string(),
            })?;

        info!("Warming up vision model at {endpoint} (this may take 30-60s)...");
        let warmup = client
            .post(format!("{endpoint}/load"))
            .timeout(Duration::from_secs(180))
            .json(&serde_json::json!({
                "model_path": model_path.map(|p| p.display().to_string()),
            }))
            .send()
            .map_err(|e| ModelError::Warmup {
                detail: e.to_string(),
            })?;
        if !warmup.status().is_success() {
            return Err(ModelError::Warmup {
                detail: format!("HTTP {}", warmup.status()),
            });
        }
        info!("Vision model ready at {endpoint}");

        Ok(HttpVision {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

impl VisionModel for HttpVision {
    fn generate(
        &self,
        image: &Path,
        prompt: &str,
        params: &DecodeParams,
    ) -> Result<String, ModelError> {
        let bytes = std::fs::read(image).map_err(|e| ModelError::Request {
            detail: format!("read {}: {e}", image.display()),
        })?;

        let body = serde_json::json!({
            "image_b64": STANDARD.encode(&bytes),
            "prompt": prompt,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "top_p": params.top_p,
            "repetition_penalty": params.repetition_penalty,
            "stop_on_newline": params.stop_on_newline,
        });

        let response = self
            .client
            .post(format!("{}/generate", self.endpoint))
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout {
                        secs: self.client_timeout_secs(),
                    }
                } else {
                    ModelError::Request {
                        detail: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            return Err(ModelError::Backend {
                detail: format!("HTTP {}", response.status()),
            });
        }

        let parsed: GenerateResponse = response.json().map_err(|e| ModelError::Backend {
            detail: format!("bad response body: {e}"),
        })?;
        debug!("Generated {} chars", parsed.text.len());
        Ok(parsed.text)
    }

    fn describe(&self) -> String {
        format!("http vision endpoint at {}", self.endpoint)
    }
}

impl HttpVision {
    fn client_timeout_secs(&self) -> u64 {
        // reqwest doesn't expose the configured timeout; report the
        // recommended default the config carries.
        300
    }
}

// ── Simulated backend ────────────────────────────────────────────────────

/// Deterministic fixture backend.
///
/// Output depends only on `(seed, prompt family, image path)`, satisfying
/// the deterministic-on-seed adapter contract. Tests can enqueue scripted
/// responses per family; scripted responses are consumed FIFO before the
/// built-in fixtures apply.
pub struct SimulatedVision {
    seed: u64,
    scripted: Mutex<HashMap<PromptFamily, VecDeque<String>>>,
    calls: AtomicUsize,
}

impl SimulatedVision {
    pub fn new(seed: u64) -> Self {
        SimulatedVision {
            seed,
            scripted: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue an exact response for the next call of this prompt family.
    pub fn script(&self, family: PromptFamily, response: impl Into<String>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(family)
            .or_default()
            .push_back(response.into());
    }

    /// Total generate calls served, scripted or not.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn stamp(&self, image: &Path) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(image.display().to_string().as_bytes());
        let digest = hasher.finalize();
        u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
    }

    fn fixture(&self, family: PromptFamily, image: &Path) -> String {
        let stamp = self.stamp(image);
        match family {
            PromptFamily::Language => "English".to_string(),
            PromptFamily::HtmlLayout => format!(
                "<span class=\"title\" data-bbox=\"60 40 620 80\" data-font=\"sans\">Statement {stamp:08x}</span>\n\
                 <span class=\"label\" data-bbox=\"60 120 260 150\" data-font=\"sans\">Reference No</span>\n\
                 <span class=\"value\" data-bbox=\"300 120 560 150\" data-font=\"mono\">{}</span>\n",
                stamp % 1_000_000
            ),
            PromptFamily::KvJson => format!(
                "{{\"document_type\": \"form\", \"extracted_pairs\": [\
                 {{\"key\": \"Reference No\", \"value\": \"{}\"}}, \
                 {{\"key\": \"Status\", \"value\": \"open\"}}]}}",
                stamp % 1_000_000
            ),
            PromptFamily::Kvp | PromptFamily::Anon => format!(
                "{{\"items\": [\
                 {{\"key\": \"Reference No\", \"value\": \"{}\", \"confidence\": \"high\"}}, \
                 {{\"key\": \"Name\", \"value\": \"Sample Holder\", \"confidence\": \"medium\"}}], \
                 \"tables\": []}}",
                stamp % 1_000_000
            ),
        }
    }
}

impl VisionModel for SimulatedVision {
    fn generate(
        &self,
        image: &Path,
        prompt: &str,
        _params: &DecodeParams,
    ) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let family = PromptFamily::classify(prompt);

        if let Some(scripted) = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&family)
            .and_then(|q| q.pop_front())
        {
            return Ok(scripted);
        }

        Ok(self.fixture(family, image))
    }

    fn describe(&self) -> String {
        format!("simulated vision backend (seed {})", self.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn default_params_match_recommended_table() {
        assert_eq!(DecodeParams::language().max_tokens, 20);
        assert!(DecodeParams::language().stop_on_newline);
        let html = DecodeParams::html();
        assert_eq!(html.temperature, 0.1);
        assert_eq!(html.max_tokens, 16_384);
        assert_eq!(html.top_p, Some(0.4));
        assert_eq!(html.repetition_penalty, Some(1.05));
        assert_eq!(DecodeParams::json_kv().max_tokens, 4_096);
        assert_eq!(DecodeParams::kvp().max_tokens, 20_480);
        assert_eq!(DecodeParams::anon(), DecodeParams::kvp());
    }

    #[test]
    fn overrides_apply_per_format() {
        let mut overrides = BTreeMap::new();
        overrides.insert("DOCPIPE_GEN_HTML_MAX_TOKENS".into(), "8192".into());
        overrides.insert("DOCPIPE_GEN_KVP_TEMPERATURE".into(), "0.2".into());
        let table = DecodeTable::from_overrides(&overrides).unwrap();
        assert_eq!(table.html.max_tokens, 8_192);
        assert_eq!(table.kvp.temperature, 0.2);
        // Untouched formats keep defaults.
        assert_eq!(table.json_kv.max_tokens, 4_096);
    }

    #[test]
    fn bad_override_is_rejected() {
        let mut overrides = BTreeMap::new();
        overrides.insert("DOCPIPE_GEN_ANON_MAX_TOKENS".into(), "lots".into());
        assert!(DecodeTable::from_overrides(&overrides).is_err());
    }

    #[test]
    fn prompt_family_classification() {
        assert_eq!(
            PromptFamily::classify(crate::prompts::LANGUAGE_PROMPT),
            PromptFamily::Language
        );
        assert_eq!(
            PromptFamily::classify(&crate::prompts::html_layout_prompt("English")),
            PromptFamily::HtmlLayout
        );
        assert_eq!(
            PromptFamily::classify(crate::prompts::KV_JSON_PROMPT),
            PromptFamily::KvJson
        );
        assert_eq!(
            PromptFamily::classify(&crate::prompts::kvp_extraction_prompt(None)),
            PromptFamily::Kvp
        );
        assert_eq!(
            PromptFamily::classify(&crate::prompts::anon_extraction_prompt(None)),
            PromptFamily::Anon
        );
    }

    #[test]
    fn simulator_is_deterministic_per_image() {
        let sim_a = SimulatedVision::new(7);
        let sim_b = SimulatedVision::new(7);
        let image = PathBuf::from("/scratch/t1_page_1.jpg");
        let params = DecodeParams::html();
        let prompt = crate::prompts::html_layout_prompt("English");
        let a = sim_a.generate(&image, &prompt, &params).unwrap();
        let b = sim_b.generate(&image, &prompt, &params).unwrap();
        assert_eq!(a, b);

        let other = sim_a
            .generate(&PathBuf::from("/scratch/t1_page_2.jpg"), &prompt, &params)
            .unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn scripted_responses_consume_fifo() {
        let sim = SimulatedVision::new(0);
        sim.script(PromptFamily::Kvp, "{\"items\": [], \"tables\": []}");
        let image = PathBuf::from("/x.jpg");
        let prompt = crate::prompts::kvp_extraction_prompt(None);
        let first = sim
            .generate(&image, &prompt, &DecodeParams::kvp())
            .unwrap();
        assert_eq!(first, "{\"items\": [], \"tables\": []}");
        // Queue drained: falls back to the built-in fixture.
        let second = sim
            .generate(&image, &prompt, &DecodeParams::kvp())
            .unwrap();
        assert!(second.contains("\"items\""));
        assert_eq!(sim.call_count(), 2);
    }
}
