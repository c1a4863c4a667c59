use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

use super::{
    load_base_image, map_object, nearest_ratio, require_key, response_json_or_error, send,
    DispatchOptions, DispatchResult, ImageProvider, ProviderError,
};
use crate::media::{encode_data_url, ImageBytes};

const IMAGEN_RATIOS: &[&str] = &["1:1", "3:4", "4:3", "9:16", "16:9"];
const GEMINI_RATIOS: &[&str] = &[
    "1:1", "2:3", "3:2", "3:4", "4:3", "4:5", "5:4", "9:16", "16:9", "21:9",
];

/// Imagen models answer on `:predict`; Gemini image models on
/// `:generateContent`. Both return inline base64 bytes.
pub struct GeminiProvider {
    api_base: String,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(api_base: String) -> Self {
        Self {
            api_base,
            http: HttpClient::new(),
        }
    }

    fn model_path(model: &str) -> String {
        let trimmed = model.trim();
        if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        }
    }

    fn is_imagen(model: &str) -> bool {
        model
            .trim()
            .trim_start_matches("models/")
            .to_ascii_lowercase()
            .starts_with("imagen")
    }

    fn predict(&self, model: &str, api_key: &str, options: &DispatchOptions) -> DispatchResult<String> {
        let endpoint = format!("{}/{}:predict", self.api_base, Self::model_path(model));
        let mut parameters = map_object(json!({
            "sampleCount": 1,
            "aspectRatio": nearest_ratio(&options.aspect_ratio, IMAGEN_RATIOS),
        }));
        if let Some(negative) = options.negative_prompt() {
            parameters.insert("negativePrompt".to_string(), Value::String(negative.to_string()));
        }
        if let Some(seed) = options.params.seed {
            parameters.insert("seed".to_string(), Value::Number(seed.into()));
            parameters.insert("addWatermark".to_string(), Value::Bool(false));
        }
        let payload = json!({
            "instances": [{ "prompt": options.prompt }],
            "parameters": parameters,
        });
        let response = send(
            self.name(),
            "Gemini predict request failed",
            self.http
                .post(&endpoint)
                .header("x-goog-api-key", api_key)
                .json(&payload),
        )?;
        let body = response_json_or_error(self.name(), response)?;
        let prediction = body
            .get("predictions")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(Value::as_object)
            .ok_or_else(|| {
                ProviderError::fatal(self.name(), "Imagen returned no predictions; the prompt may have been filtered.")
            })?;
        let data = prediction
            .get("bytesBase64Encoded")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ProviderError::fatal(self.name(), "Imagen prediction missing image bytes"))?;
        let mime = prediction
            .get("mimeType")
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        Ok(format!("data:{mime};base64,{data}"))
    }

    fn generate_content(
        &self,
        model: &str,
        api_key: &str,
        options: &DispatchOptions,
    ) -> DispatchResult<String> {
        let endpoint = format!("{}/{}:generateContent", self.api_base, Self::model_path(model));
        let mut parts = Vec::new();
        if let Some(base) = options.base_image.as_ref() {
            let image = load_base_image(self.name(), &self.http, base)?;
            parts.push(json!({
                "inlineData": {
                    "mimeType": image.mime_type,
                    "data": BASE64.encode(&image.bytes),
                }
            }));
        }
        let mut text = options.prompt.clone();
        if let Some(negative) = options.negative_prompt() {
            text.push_str(&format!("\nAvoid: {negative}"));
        }
        parts.push(json!({ "text": text }));

        let payload = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "responseModalities": ["IMAGE", "TEXT"],
                "imageConfig": {
                    "aspectRatio": nearest_ratio(&options.aspect_ratio, GEMINI_RATIOS),
                },
            },
        });
        let response = send(
            self.name(),
            "Gemini generateContent request failed",
            self.http
                .post(&endpoint)
                .header("x-goog-api-key", api_key)
                .json(&payload),
        )?;
        let body = response_json_or_error(self.name(), response)?;
        if let Some(image) = extract_inline_image(&body)? {
            return Ok(encode_data_url(&image.mime_type, &image.bytes));
        }
        let reason = body
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
            .map(|reason| format!("Gemini blocked the prompt ({reason})."))
            .unwrap_or_else(|| "Gemini returned no image.".to_string());
        Err(ProviderError::fatal(self.name(), reason))
    }
}

fn extract_inline_image(body: &Value) -> DispatchResult<Option<ImageBytes>> {
    let candidates = body
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            let inline: Map<String, Value> = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64
                .decode(data.as_bytes())
                .map_err(|err| ProviderError::fatal("gemini", format!("Gemini image base64 decode failed: {err}")))?;
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png")
                .to_string();
            return Ok(Some(ImageBytes { bytes, mime_type }));
        }
    }
    Ok(None)
}

impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(
        &self,
        model: &str,
        api_key: Option<&str>,
        options: &DispatchOptions,
    ) -> DispatchResult<String> {
        let api_key = require_key(self.name(), api_key)?;
        if Self::is_imagen(model) {
            if options.base_image.is_some() {
                return Err(ProviderError::fatal(
                    self.name(),
                    format!("{model} does not accept a base image."),
                ));
            }
            return self.predict(model, api_key, options);
        }
        self.generate_content(model, api_key, options)
    }
}
