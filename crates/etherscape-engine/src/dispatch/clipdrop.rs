use reqwest::blocking::multipart::Form as MultipartForm;
use reqwest::blocking::Client as HttpClient;

use super::{
    require_key, response_image_or_error, send, DispatchOptions, DispatchResult, ImageProvider,
    ProviderError,
};

/// Text-to-image only; the service renders fixed 1024px squares.
pub struct ClipdropProvider {
    api_base: String,
    http: HttpClient,
}

impl ClipdropProvider {
    pub fn new(api_base: String) -> Self {
        Self {
            api_base,
            http: HttpClient::new(),
        }
    }
}

impl ImageProvider for ClipdropProvider {
    fn name(&self) -> &str {
        "clipdrop"
    }

    fn generate(
        &self,
        _model: &str,
        api_key: Option<&str>,
        options: &DispatchOptions,
    ) -> DispatchResult<String> {
        let api_key = require_key(self.name(), api_key)?;
        if options.base_image.is_some() {
            return Err(ProviderError::fatal(
                self.name(),
                "Clipdrop text-to-image does not accept a base image.",
            ));
        }
        let endpoint = format!("{}/text-to-image/v1", self.api_base);
        let form = MultipartForm::new().text("prompt", options.prompt.clone());
        let response = send(
            self.name(),
            "Clipdrop request failed",
            self.http
                .post(&endpoint)
                .header("x-api-key", api_key)
                .multipart(form),
        )?;
        let image = response_image_or_error(self.name(), response)?;
        Ok(image.to_data_url())
    }
}
