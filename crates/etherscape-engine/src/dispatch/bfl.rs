use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use super::{
    load_base_image, map_object, require_key, response_json_or_error, send, DispatchOptions,
    DispatchResult, ImageProvider, PollPolicy, PollStatus, ProviderError,
};

/// Black Forest Labs: submit to `/{model}`, then poll the returned
/// `polling_url` until the task is `Ready`.
pub struct BflProvider {
    api_base: String,
    http: HttpClient,
    poll: PollPolicy,
}

impl BflProvider {
    pub fn new(api_base: String, poll: PollPolicy) -> Self {
        Self {
            api_base,
            http: HttpClient::new(),
            poll,
        }
    }

    fn build_payload(&self, options: &DispatchOptions) -> DispatchResult<Value> {
        let mut payload = map_object(json!({
            "prompt": options.prompt,
            "width": options.dimensions.width,
            "height": options.dimensions.height,
            "output_format": "png",
        }));
        if let Some(seed) = options.params.seed {
            payload.insert("seed".to_string(), Value::Number(seed.into()));
        }
        if let Some(steps) = options.params.steps {
            payload.insert("steps".to_string(), Value::Number(steps.into()));
        }
        if let Some(cfg) = options.params.cfg_scale {
            payload.insert("guidance".to_string(), json!(cfg));
        }
        if let Some(base) = options.base_image.as_ref() {
            let image = load_base_image(self.name(), &self.http, base)?;
            payload.insert(
                "image_prompt".to_string(),
                Value::String(BASE64.encode(&image.bytes)),
            );
        }
        Ok(Value::Object(payload))
    }
}

fn task_status(payload: &Value) -> PollStatus<String> {
    let status = payload
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match status.as_str() {
        "ready" => payload
            .get("result")
            .and_then(|result| result.get("sample"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|url| PollStatus::Ready(url.to_string()))
            .unwrap_or_else(|| PollStatus::Failed("BFL ready response missing sample URL".to_string())),
        "error" | "failed" | "request moderated" | "content moderated" | "task not found" => {
            let detail = payload
                .get("details")
                .or_else(|| payload.get("error"))
                .map(|value| match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            let original = payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if detail.is_empty() {
                PollStatus::Failed(format!("BFL generation failed: {original}"))
            } else {
                PollStatus::Failed(format!("BFL generation failed: {original} ({detail})"))
            }
        }
        _ => PollStatus::Pending,
    }
}

impl ImageProvider for BflProvider {
    fn name(&self) -> &str {
        "bfl"
    }

    fn generate(
        &self,
        model: &str,
        api_key: Option<&str>,
        options: &DispatchOptions,
    ) -> DispatchResult<String> {
        let api_key = require_key(self.name(), api_key)?;
        let endpoint = format!("{}/{}", self.api_base, model.trim().trim_start_matches('/'));
        let payload = self.build_payload(options)?;
        let response = send(
            self.name(),
            "BFL request failed",
            self.http
                .post(&endpoint)
                .header("x-key", api_key)
                .json(&payload),
        )?;
        let submitted = response_json_or_error(self.name(), response)?;
        let polling_url = submitted
            .get("polling_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| {
                submitted
                    .get("id")
                    .and_then(Value::as_str)
                    .map(|id| format!("{}/get_result?id={id}", self.api_base))
            })
            .ok_or_else(|| ProviderError::fatal(self.name(), "BFL response missing polling_url"))?;

        self.poll.poll_until(self.name(), |_| {
            let response = send(
                self.name(),
                "BFL poll request failed",
                self.http.get(&polling_url).header("x-key", api_key),
            )?;
            let payload = response_json_or_error(self.name(), response)?;
            Ok(task_status(&payload))
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::task_status;
    use crate::dispatch::PollStatus;

    #[test]
    fn ready_task_yields_sample() {
        let status = task_status(&json!({
            "status": "Ready",
            "result": {"sample": "https://delivery.bfl.ai/x.png"}
        }));
        assert_eq!(status, PollStatus::Ready("https://delivery.bfl.ai/x.png".to_string()));
    }

    #[test]
    fn moderated_task_fails_with_status() {
        let status = task_status(&json!({"status": "Content Moderated"}));
        assert_eq!(
            status,
            PollStatus::Failed("BFL generation failed: Content Moderated".to_string())
        );
    }

    #[test]
    fn pending_states_keep_polling() {
        assert_eq!(task_status(&json!({"status": "Pending"})), PollStatus::Pending);
        assert_eq!(task_status(&json!({})), PollStatus::Pending);
    }
}
