use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use super::{
    map_object, require_key, response_json_or_error, send, DispatchOptions, DispatchResult,
    ImageProvider, PollPolicy, PollStatus, ProviderError,
};

pub struct ReplicateProvider {
    api_base: String,
    http: HttpClient,
    poll: PollPolicy,
}

impl ReplicateProvider {
    pub fn new(api_base: String, poll: PollPolicy) -> Self {
        Self {
            api_base,
            http: HttpClient::new(),
            poll,
        }
    }

    fn build_input(&self, options: &DispatchOptions) -> DispatchResult<Value> {
        let mut input = map_object(json!({
            "prompt": options.prompt,
            "width": options.dimensions.width,
            "height": options.dimensions.height,
            "num_outputs": 1,
        }));
        if let Some(negative) = options.negative_prompt() {
            input.insert("negative_prompt".to_string(), Value::String(negative.to_string()));
        }
        if let Some(seed) = options.params.seed {
            input.insert("seed".to_string(), Value::Number(seed.into()));
        }
        if let Some(cfg) = options.params.cfg_scale {
            input.insert("guidance_scale".to_string(), json!(cfg));
        }
        if let Some(steps) = options.params.steps {
            input.insert("num_inference_steps".to_string(), Value::Number(steps.into()));
        }
        if let Some(sampler) = options.params.sampler.as_deref().filter(|v| !v.trim().is_empty()) {
            input.insert("scheduler".to_string(), Value::String(sampler.to_string()));
        }
        if let Some(base) = options.base_image.as_ref() {
            let url = base.url.trim();
            if !(url.starts_with("data:") || url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ProviderError::fatal(
                    self.name(),
                    "Replicate base images must be data: or http(s) URLs.",
                ));
            }
            input.insert("image".to_string(), Value::String(url.to_string()));
            input.insert(
                "prompt_strength".to_string(),
                json!(base.strength.clamp(0.0, 1.0)),
            );
        }
        Ok(Value::Object(input))
    }

    fn poll_prediction(&self, poll_url: &str, api_key: &str) -> DispatchResult<String> {
        self.poll.poll_until(self.name(), |_| {
            let response = send(
                self.name(),
                "Replicate poll request failed",
                self.http.get(poll_url).bearer_auth(api_key),
            )?;
            let prediction = response_json_or_error(self.name(), response)?;
            Ok(prediction_status(&prediction))
        })
    }
}

/// Maps a prediction body onto a poll status.
fn prediction_status(prediction: &Value) -> PollStatus<String> {
    let status = prediction
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match status.as_str() {
        "succeeded" => {
            let mut urls = Vec::new();
            if let Some(output) = prediction.get("output") {
                extract_output_urls(output, &mut urls);
            }
            match urls.into_iter().next() {
                Some(url) => PollStatus::Ready(url),
                None => PollStatus::Failed("Replicate prediction returned no image URLs".to_string()),
            }
        }
        "failed" | "canceled" => {
            let reason = prediction
                .get("error")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or("no reason given");
            PollStatus::Failed(format!("Replicate prediction {status}: {reason}"))
        }
        _ => PollStatus::Pending,
    }
}

fn extract_output_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if !trimmed.is_empty()
                && (trimmed.starts_with("http") || trimmed.starts_with("data:"))
                && !out.iter().any(|existing| existing == trimmed)
            {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                extract_output_urls(row, out);
            }
        }
        Value::Object(obj) => {
            if let Some(url) = obj.get("url") {
                extract_output_urls(url, out);
            }
        }
        _ => {}
    }
}

impl ImageProvider for ReplicateProvider {
    fn name(&self) -> &str {
        "replicate"
    }

    fn generate(
        &self,
        model: &str,
        api_key: Option<&str>,
        options: &DispatchOptions,
    ) -> DispatchResult<String> {
        let api_key = require_key(self.name(), api_key)?;
        let endpoint = format!("{}/predictions", self.api_base);
        let payload = json!({
            "model": model.trim(),
            "input": self.build_input(options)?,
        });
        let response = send(
            self.name(),
            "Replicate request failed",
            self.http
                .post(&endpoint)
                .bearer_auth(api_key)
                .json(&payload),
        )?;
        let prediction = response_json_or_error(self.name(), response)?;
        match prediction_status(&prediction) {
            PollStatus::Ready(url) => return Ok(url),
            PollStatus::Failed(reason) => return Err(ProviderError::reported(self.name(), reason)),
            PollStatus::Pending => {}
        }
        let poll_url = prediction
            .get("urls")
            .and_then(|urls| urls.get("get"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ProviderError::fatal(self.name(), "Replicate prediction missing poll URL"))?;
        self.poll_prediction(poll_url, api_key)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::prediction_status;
    use crate::dispatch::PollStatus;

    #[test]
    fn succeeded_prediction_yields_first_url() {
        let status = prediction_status(&json!({
            "status": "succeeded",
            "output": ["https://replicate.delivery/a.png", "https://replicate.delivery/b.png"]
        }));
        assert_eq!(status, PollStatus::Ready("https://replicate.delivery/a.png".to_string()));
    }

    #[test]
    fn failed_prediction_reports_error() {
        let status = prediction_status(&json!({"status": "failed", "error": "NSFW content"}));
        assert_eq!(
            status,
            PollStatus::Failed("Replicate prediction failed: NSFW content".to_string())
        );
    }

    #[test]
    fn starting_prediction_is_pending() {
        assert_eq!(
            prediction_status(&json!({"status": "starting"})),
            PollStatus::Pending
        );
        assert_eq!(
            prediction_status(&json!({"status": "succeeded", "output": []})),
            PollStatus::Failed("Replicate prediction returned no image URLs".to_string())
        );
    }
}
