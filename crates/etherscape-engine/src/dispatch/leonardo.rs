use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

use super::{
    load_base_image, map_object, require_key, response_json_or_error, send, DispatchOptions,
    DispatchResult, ImageProvider, PollPolicy, PollStatus, ProviderError,
};
use crate::media::ImageBytes;

/// Leonardo.Ai. Image-to-image first stages the base image through a
/// presigned upload and references it by its init image id.
pub struct LeonardoProvider {
    api_base: String,
    http: HttpClient,
    poll: PollPolicy,
}

impl LeonardoProvider {
    pub fn new(api_base: String, poll: PollPolicy) -> Self {
        Self {
            api_base,
            http: HttpClient::new(),
            poll,
        }
    }

    fn upload_init_image(&self, api_key: &str, image: ImageBytes) -> DispatchResult<String> {
        let extension = match image.extension() {
            "jpg" => "jpg",
            "webp" => "webp",
            _ => "png",
        };
        let endpoint = format!("{}/init-image", self.api_base);
        let response = send(
            self.name(),
            "Leonardo init-image request failed",
            self.http
                .post(&endpoint)
                .bearer_auth(api_key)
                .json(&json!({ "extension": extension })),
        )?;
        let body = response_json_or_error(self.name(), response)?;
        let upload = body
            .get("uploadInitImage")
            .and_then(Value::as_object)
            .ok_or_else(|| ProviderError::fatal(self.name(), "Leonardo init-image response missing uploadInitImage"))?;
        let init_id = upload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::fatal(self.name(), "Leonardo init-image response missing id"))?;
        let upload_url = upload
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::fatal(self.name(), "Leonardo init-image response missing url"))?;
        let fields = presigned_fields(upload.get("fields"));

        let mut form = MultipartForm::new();
        for (key, value) in fields {
            form = form.text(key, value);
        }
        let part = MultipartPart::bytes(image.bytes)
            .file_name(format!("init.{extension}"))
            .mime_str(&image.mime_type)
            .map_err(|err| ProviderError::fatal(self.name(), format!("invalid base image type: {err}")))?;
        form = form.part("file", part);

        let response = send(
            self.name(),
            "Leonardo init-image upload failed",
            self.http.post(upload_url).multipart(form),
        )?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ProviderError::from_status(self.name(), status.as_u16(), &body));
        }
        Ok(init_id)
    }

    fn build_payload(&self, model: &str, options: &DispatchOptions, init_image_id: Option<String>) -> Value {
        let mut payload = map_object(json!({
            "prompt": options.prompt,
            "modelId": model.trim(),
            "width": options.dimensions.width,
            "height": options.dimensions.height,
            "num_images": 1,
        }));
        if let Some(negative) = options.negative_prompt() {
            payload.insert("negative_prompt".to_string(), Value::String(negative.to_string()));
        }
        if let Some(cfg) = options.params.cfg_scale {
            payload.insert("guidance_scale".to_string(), json!(cfg.round() as i64));
        }
        if let Some(steps) = options.params.steps {
            payload.insert("num_inference_steps".to_string(), Value::Number(steps.into()));
        }
        if let Some(seed) = options.params.seed {
            payload.insert("seed".to_string(), Value::Number(seed.into()));
        }
        if let Some(preset) = options.params.style_preset.as_deref().filter(|v| !v.trim().is_empty()) {
            payload.insert("presetStyle".to_string(), Value::String(preset.to_string()));
        }
        for (name, enabled) in &options.params.toggles {
            payload.insert(name.clone(), Value::Bool(*enabled));
        }
        if let Some(init_id) = init_image_id {
            let strength = options
                .base_image
                .as_ref()
                .map(|base| base.strength.clamp(0.1, 0.9))
                .unwrap_or(0.5);
            payload.insert("init_image_id".to_string(), Value::String(init_id));
            payload.insert("init_strength".to_string(), json!(strength));
        }
        Value::Object(payload)
    }
}

/// Presigned form fields arrive either as an object or as a JSON string.
fn presigned_fields(raw: Option<&Value>) -> Vec<(String, String)> {
    let object: Map<String, Value> = match raw {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(text)) => serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|value| value.as_object().cloned())
            .unwrap_or_default(),
        _ => Map::new(),
    };
    object
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(text) => text,
                other => other.to_string(),
            };
            (key, text)
        })
        .collect()
}

fn generation_status(body: &Value) -> PollStatus<String> {
    let generation = body.get("generations_by_pk").cloned().unwrap_or(Value::Null);
    let status = generation
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_uppercase();
    match status.as_str() {
        "COMPLETE" => generation
            .get("generated_images")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("url"))
            .and_then(Value::as_str)
            .map(|url| PollStatus::Ready(url.to_string()))
            .unwrap_or_else(|| PollStatus::Failed("Leonardo generation completed without images".to_string())),
        "FAILED" => PollStatus::Failed("Leonardo generation failed".to_string()),
        _ => PollStatus::Pending,
    }
}

impl ImageProvider for LeonardoProvider {
    fn name(&self) -> &str {
        "leonardo"
    }

    fn generate(
        &self,
        model: &str,
        api_key: Option<&str>,
        options: &DispatchOptions,
    ) -> DispatchResult<String> {
        let api_key = require_key(self.name(), api_key)?;
        let init_image_id = match options.base_image.as_ref() {
            Some(base) => {
                let image = load_base_image(self.name(), &self.http, base)?;
                Some(self.upload_init_image(api_key, image)?)
            }
            None => None,
        };

        let endpoint = format!("{}/generations", self.api_base);
        let payload = self.build_payload(model, options, init_image_id);
        let response = send(
            self.name(),
            "Leonardo request failed",
            self.http
                .post(&endpoint)
                .bearer_auth(api_key)
                .json(&payload),
        )?;
        let body = response_json_or_error(self.name(), response)?;
        let generation_id = body
            .get("sdGenerationJob")
            .and_then(|job| job.get("generationId"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::fatal(self.name(), "Leonardo response missing generationId"))?;

        let poll_url = format!("{}/generations/{generation_id}", self.api_base);
        self.poll.poll_until(self.name(), |_| {
            let response = send(
                self.name(),
                "Leonardo poll request failed",
                self.http.get(&poll_url).bearer_auth(api_key),
            )?;
            let body = response_json_or_error(self.name(), response)?;
            Ok(generation_status(&body))
        })
    }
}
