//! Provider Dispatch Service: one generation call against one provider,
//! normalized to a single image URL or a classified [`ProviderError`].

mod bfl;
mod clipdrop;
mod dryrun;
mod error;
mod gemini;
mod leonardo;
mod poll;
mod replicate;
mod stability;

use std::collections::BTreeMap;

use etherscape_contracts::dimensions::{parse_aspect_ratio, Dimensions};
use etherscape_contracts::providers::{BFL, CLIPDROP, FAL, GEMINI, LEONARDO, REPLICATE, STABILITY};
use etherscape_contracts::settings::{AdvancedParams, BaseImage};
use reqwest::blocking::{RequestBuilder, Response as HttpResponse};
use serde_json::{Map, Value};

use crate::config::EngineEnv;
use crate::media::{decode_data_url, load_media, ImageBytes};

pub use bfl::BflProvider;
pub use clipdrop::ClipdropProvider;
pub use dryrun::DryrunProvider;
pub use error::{ProviderError, ProviderErrorKind};
pub use gemini::GeminiProvider;
pub use leonardo::LeonardoProvider;
pub use poll::{PollPolicy, PollStatus, DEFAULT_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL};
pub use replicate::ReplicateProvider;
pub use stability::StabilityProvider;

pub type DispatchResult<T> = Result<T, ProviderError>;

/// Everything a provider needs for one image, already resolved by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOptions {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub dimensions: Dimensions,
    pub aspect_ratio: String,
    pub params: AdvancedParams,
    pub base_image: Option<BaseImage>,
}

impl DispatchOptions {
    pub fn new(prompt: impl Into<String>, dimensions: Dimensions, aspect_ratio: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            dimensions,
            aspect_ratio: aspect_ratio.into(),
            params: AdvancedParams::default(),
            base_image: None,
        }
    }

    pub fn negative_prompt(&self) -> Option<&str> {
        self.negative_prompt
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(
        &self,
        model: &str,
        api_key: Option<&str>,
        options: &DispatchOptions,
    ) -> DispatchResult<String>;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry(env: &EngineEnv, poll: PollPolicy) -> ImageProviderRegistry {
    let mut registry = ImageProviderRegistry::new();
    registry.register(GeminiProvider::new(env.api_base(GEMINI)));
    registry.register(StabilityProvider::new(env.api_base(STABILITY)));
    registry.register(ClipdropProvider::new(env.api_base(CLIPDROP)));
    registry.register(ReplicateProvider::new(env.api_base(REPLICATE), poll));
    registry.register(BflProvider::new(env.api_base(BFL), poll));
    registry.register(LeonardoProvider::new(env.api_base(LEONARDO), poll));
    registry.register(DryrunProvider);
    registry
}

/// The orchestrator's view of the dispatch service.
pub trait ImageDispatcher: Send {
    fn generate(
        &self,
        provider_id: &str,
        model_id: &str,
        api_key: Option<&str>,
        options: &DispatchOptions,
    ) -> DispatchResult<String>;
}

pub struct ProviderDispatch {
    registry: ImageProviderRegistry,
}

impl ProviderDispatch {
    pub fn new(registry: ImageProviderRegistry) -> Self {
        Self { registry }
    }

    pub fn from_env(env: &EngineEnv, poll: PollPolicy) -> Self {
        Self::new(default_provider_registry(env, poll))
    }

    pub fn registry(&self) -> &ImageProviderRegistry {
        &self.registry
    }
}

impl ImageDispatcher for ProviderDispatch {
    fn generate(
        &self,
        provider_id: &str,
        model_id: &str,
        api_key: Option<&str>,
        options: &DispatchOptions,
    ) -> DispatchResult<String> {
        if provider_id == FAL {
            return Err(ProviderError::fatal(
                FAL,
                "fal streams over the realtime channel and cannot be dispatched.",
            ));
        }
        let Some(provider) = self.registry.get(provider_id) else {
            return Err(ProviderError::config(
                provider_id,
                format!("Unknown image provider '{provider_id}'."),
            ));
        };
        provider.generate(model_id, api_key, options)
    }
}

pub(crate) fn require_key<'a>(provider: &str, api_key: Option<&'a str>) -> DispatchResult<&'a str> {
    api_key
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ProviderError::missing_key(provider))
}

pub(crate) fn send(provider: &str, context: &str, builder: RequestBuilder) -> DispatchResult<HttpResponse> {
    builder
        .send()
        .map_err(|err| ProviderError::from_transport(provider, context, err))
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> DispatchResult<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| ProviderError::from_transport(provider, "response body read failed", err))?;
    if !status.is_success() {
        return Err(ProviderError::from_status(provider, code, &body));
    }
    serde_json::from_str(&body)
        .map_err(|err| ProviderError::fatal(provider, format!("{provider} returned invalid JSON: {err}")))
}

/// Reads raw image bytes, falling back to a JSON body with a base64 image.
pub(crate) fn response_image_or_error(provider: &str, response: HttpResponse) -> DispatchResult<ImageBytes> {
    let status = response.status();
    if !status.is_success() {
        let code = status.as_u16();
        let body = response.text().unwrap_or_default();
        return Err(ProviderError::from_status(provider, code, &body));
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_ascii_lowercase())
        .unwrap_or_default();
    let bytes = response
        .bytes()
        .map_err(|err| ProviderError::from_transport(provider, "image body read failed", err))?
        .to_vec();
    if content_type.starts_with("image/") {
        return Ok(ImageBytes {
            bytes,
            mime_type: content_type,
        });
    }
    let payload: Value = serde_json::from_slice(&bytes)
        .map_err(|err| ProviderError::fatal(provider, format!("{provider} returned neither image nor JSON: {err}")))?;
    let encoded = payload
        .get("image")
        .or_else(|| payload.get("base64"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ProviderError::fatal(provider, format!("{provider} response missing image bytes")))?;
    let decoded = decode_data_url(&format!("data:image/png;base64,{encoded}"))
        .ok_or_else(|| ProviderError::fatal(provider, format!("{provider} image base64 decode failed")))?;
    Ok(decoded)
}

pub(crate) fn load_base_image(
    provider: &str,
    http: &reqwest::blocking::Client,
    base: &BaseImage,
) -> DispatchResult<ImageBytes> {
    load_media(http, &base.url)
        .map_err(|err| ProviderError::fatal(provider, format!("failed to load base image: {err:#}")))
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Snaps a free-form ratio onto the nearest one a provider accepts.
pub(crate) fn nearest_ratio(aspect_ratio: &str, allowed: &[&'static str]) -> &'static str {
    let fallback = allowed.first().copied().unwrap_or("1:1");
    let trimmed = aspect_ratio.trim();
    if let Some(exact) = allowed.iter().copied().find(|candidate| *candidate == trimmed) {
        return exact;
    }
    let Some((width, height)) = parse_aspect_ratio(trimmed) else {
        return fallback;
    };
    let target = width / height;
    let mut best = fallback;
    let mut best_delta = f64::MAX;
    for candidate in allowed.iter().copied() {
        if let Some((w, h)) = parse_aspect_ratio(candidate) {
            let delta = (w / h - target).abs();
            if delta < best_delta {
                best_delta = delta;
                best = candidate;
            }
        }
    }
    best
}
