use anyhow::{anyhow, bail, Context, Result};
use etherscape_contracts::chat::CONCEPTS;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::media::truncate_text;

pub const DEFAULT_THEME_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundingSource {
    pub title: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeResult {
    pub image_prompt: String,
    pub next_theme: String,
    pub grounding_sources: Vec<GroundingSource>,
}

/// Turns a concept into an image prompt plus the theme the next evolution
/// step should explore.
pub trait ThemeGenerator: Send {
    fn generate(&self, concept: &str, art_style: &str, use_search_grounding: bool) -> Result<ThemeResult>;
}

pub struct GeminiThemeGenerator {
    api_base: String,
    api_key: String,
    model: String,
    http: HttpClient,
}

impl GeminiThemeGenerator {
    pub fn new(api_base: String, api_key: impl Into<String>) -> Self {
        Self {
            api_base,
            api_key: api_key.into(),
            model: DEFAULT_THEME_MODEL.to_string(),
            http: HttpClient::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn build_payload(concept: &str, art_style: &str, use_search_grounding: bool) -> Value {
        let instruction = format!(
            "You are the creative director of an endlessly evolving art installation.\n\
             Current theme: {concept}\n\
             Art style: {art_style}\n\
             Write one vivid image-generation prompt for this theme in this style, \
             then propose a related but distinct theme for the next artwork.\n\
             Reply with JSON only: {{\"imagePrompt\": string, \"nextTheme\": string}}."
        );
        let mut payload = json!({
            "contents": [{"role": "user", "parts": [{"text": instruction}]}],
        });
        // Search grounding and JSON mode cannot be combined.
        if use_search_grounding {
            payload["tools"] = json!([{"google_search": {}}]);
        } else {
            payload["generationConfig"] = json!({"responseMimeType": "application/json"});
        }
        payload
    }
}

impl ThemeGenerator for GeminiThemeGenerator {
    fn generate(&self, concept: &str, art_style: &str, use_search_grounding: bool) -> Result<ThemeResult> {
        if self.api_key.trim().is_empty() {
            bail!("Gemini API key is required for theme generation.");
        }
        let endpoint = format!(
            "{}/models/{}:generateContent",
            self.api_base.trim_end_matches('/'),
            self.model
        );
        let payload = Self::build_payload(concept, art_style, use_search_grounding);
        let response = self
            .http
            .post(&endpoint)
            .header("x-goog-api-key", self.api_key.trim())
            .json(&payload)
            .send()
            .context("theme request failed")?;
        let status = response.status();
        let body = response.text().context("theme response read failed")?;
        if !status.is_success() {
            bail!(
                "theme request failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }
        let body: Value = serde_json::from_str(&body).context("theme response is not JSON")?;
        parse_theme_response(&body)
    }
}

pub(crate) fn parse_theme_response(body: &Value) -> Result<ThemeResult> {
    let candidate = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .ok_or_else(|| anyhow!("theme response has no candidates"))?;
    let text = candidate
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default();
    let reply: Value = serde_json::from_str(strip_code_fence(&text))
        .with_context(|| format!("theme reply is not JSON: {}", truncate_text(&text, 200)))?;

    let image_prompt = reply
        .get("imagePrompt")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("theme reply missing imagePrompt"))?
        .to_string();
    let next_theme = reply
        .get("nextTheme")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    let grounding_sources = candidate
        .get("groundingMetadata")
        .and_then(|meta| meta.get("groundingChunks"))
        .and_then(Value::as_array)
        .map(|chunks| {
            chunks
                .iter()
                .filter_map(|chunk| chunk.get("web"))
                .filter_map(|web| {
                    let uri = web.get("uri").and_then(Value::as_str)?.trim();
                    if uri.is_empty() {
                        return None;
                    }
                    let title = web
                        .get("title")
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|title| !title.is_empty())
                        .unwrap_or(uri);
                    Some(GroundingSource {
                        title: title.to_string(),
                        uri: uri.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ThemeResult {
        image_prompt,
        next_theme,
        grounding_sources,
    })
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Offline generator: prompt is the concept in the given style, next theme
/// walks the built-in concept list.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunThemeGenerator;

impl ThemeGenerator for DryrunThemeGenerator {
    fn generate(&self, concept: &str, art_style: &str, _use_search_grounding: bool) -> Result<ThemeResult> {
        let concept = concept.trim();
        if concept.is_empty() {
            bail!("concept is empty");
        }
        let image_prompt = if art_style.trim().is_empty() {
            concept.to_string()
        } else {
            format!("{concept}, in a {} style", art_style.trim())
        };
        let next_theme = match CONCEPTS.iter().position(|item| item.eq_ignore_ascii_case(concept)) {
            Some(index) => CONCEPTS[(index + 1) % CONCEPTS.len()].to_string(),
            None => {
                let digest = Sha256::digest(concept.as_bytes());
                CONCEPTS[usize::from(digest[0]) % CONCEPTS.len()].to_string()
            }
        };
        Ok(ThemeResult {
            image_prompt,
            next_theme,
            grounding_sources: Vec::new(),
        })
    }
}
