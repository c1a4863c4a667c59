use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;

use super::{
    load_base_image, nearest_ratio, require_key, response_image_or_error, send, DispatchOptions,
    DispatchResult, ImageProvider, ProviderError,
};

const STABILITY_RATIOS: &[&str] = &[
    "1:1", "16:9", "9:16", "21:9", "9:21", "2:3", "3:2", "4:5", "5:4",
];

pub struct StabilityProvider {
    api_base: String,
    http: HttpClient,
}

impl StabilityProvider {
    pub fn new(api_base: String) -> Self {
        Self {
            api_base,
            http: HttpClient::new(),
        }
    }

    /// Endpoint path and the `model` form field, if the endpoint hosts
    /// several models.
    fn route(model: &str) -> (&'static str, Option<String>) {
        let normalized = model.trim().to_ascii_lowercase();
        if normalized.starts_with("sd3") {
            ("v2beta/stable-image/generate/sd3", Some(model.trim().to_string()))
        } else if normalized.contains("ultra") {
            ("v2beta/stable-image/generate/ultra", None)
        } else {
            ("v2beta/stable-image/generate/core", None)
        }
    }
}

impl ImageProvider for StabilityProvider {
    fn name(&self) -> &str {
        "stability"
    }

    fn generate(
        &self,
        model: &str,
        api_key: Option<&str>,
        options: &DispatchOptions,
    ) -> DispatchResult<String> {
        let api_key = require_key(self.name(), api_key)?;
        let (path, model_field) = Self::route(model);
        let endpoint = format!("{}/{}", self.api_base, path);

        let mut form = MultipartForm::new()
            .text("prompt", options.prompt.clone())
            .text("output_format", "png");
        if let Some(model_field) = model_field {
            form = form.text("model", model_field);
        }
        if let Some(base) = options.base_image.as_ref() {
            let image = load_base_image(self.name(), &self.http, base)?;
            let filename = format!("base.{}", image.extension());
            let part = MultipartPart::bytes(image.bytes)
                .file_name(filename)
                .mime_str(&image.mime_type)
                .map_err(|err| ProviderError::fatal(self.name(), format!("invalid base image type: {err}")))?;
            form = form
                .text("mode", "image-to-image")
                .text("strength", base.strength.clamp(0.0, 1.0).to_string())
                .part("image", part);
        } else {
            form = form.text(
                "aspect_ratio",
                nearest_ratio(&options.aspect_ratio, STABILITY_RATIOS),
            );
        }
        if let Some(negative) = options.negative_prompt() {
            form = form.text("negative_prompt", negative.to_string());
        }
        if let Some(seed) = options.params.seed {
            form = form.text("seed", seed.to_string());
        }
        if let Some(cfg) = options.params.cfg_scale {
            form = form.text("cfg_scale", cfg.to_string());
        }
        if let Some(preset) = options
            .params
            .style_preset
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            form = form.text("style_preset", preset.to_string());
        }

        let response = send(
            self.name(),
            "Stability request failed",
            self.http
                .post(&endpoint)
                .bearer_auth(api_key)
                .header("Accept", "image/*")
                .multipart(form),
        )?;
        let image = response_image_or_error(self.name(), response)?;
        Ok(image.to_data_url())
    }
}
