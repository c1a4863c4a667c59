use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::ProviderCatalog;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Image,
    Video,
    Audio,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// Numeric and boolean knobs forwarded to providers that understand them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedParams {
    pub cfg_scale: Option<f64>,
    pub steps: Option<u32>,
    pub seed: Option<i64>,
    pub sampler: Option<String>,
    pub style_preset: Option<String>,
    pub toggles: BTreeMap<String, bool>,
}

impl AdvancedParams {
    pub fn toggle(&self, name: &str) -> Option<bool> {
        self.toggles.get(name).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseImage {
    /// `data:` URL or `http(s)` URL of the source image.
    pub url: String,
    /// How far the result may drift from the source, 0.0..=1.0.
    pub strength: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveSync {
    pub enabled: bool,
    pub authenticated: bool,
}

impl DriveSync {
    pub fn active(&self) -> bool {
        self.enabled && self.authenticated
    }
}

/// Everything one generation attempt needs. Built fresh for every start,
/// single generation or re-generation and never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub concept: String,
    pub art_style: String,
    pub aspect_ratio: String,
    pub media_type: MediaType,
    pub negative_prompt: Option<String>,
    pub params: AdvancedParams,
    pub selected_provider: String,
    pub selected_model: String,
    pub api_keys: BTreeMap<String, String>,
    pub catalog: ProviderCatalog,
    pub use_search_grounding: bool,
    pub drive: DriveSync,
    pub base_image: Option<BaseImage>,
    /// Used verbatim instead of asking the theme generator.
    pub prompt_override: Option<String>,
    /// History item this generation derives from.
    pub derived_from: Option<String>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            concept: String::new(),
            art_style: String::new(),
            aspect_ratio: "1:1".to_string(),
            media_type: MediaType::Image,
            negative_prompt: None,
            params: AdvancedParams::default(),
            selected_provider: crate::providers::GEMINI.to_string(),
            selected_model: String::new(),
            api_keys: BTreeMap::new(),
            catalog: ProviderCatalog::default(),
            use_search_grounding: false,
            drive: DriveSync::default(),
            base_image: None,
            prompt_override: None,
            derived_from: None,
        }
    }
}

impl GenerationSettings {
    pub fn new(
        concept: impl Into<String>,
        art_style: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            concept: concept.into(),
            art_style: art_style.into(),
            selected_provider: provider.into(),
            selected_model: model.into(),
            ..Self::default()
        }
    }

    /// Trimmed, non-empty key for `provider`.
    pub fn api_key(&self, provider: &str) -> Option<&str> {
        self.api_keys
            .get(provider)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn prompt_override(&self) -> Option<&str> {
        self.prompt_override
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn with_concept(&self, concept: impl Into<String>) -> Self {
        Self {
            concept: concept.into(),
            ..self.clone()
        }
    }

    pub fn with_selection(
        &self,
        provider: impl Into<String>,
        model: impl Into<String>,
        params: AdvancedParams,
    ) -> Self {
        Self {
            selected_provider: provider.into(),
            selected_model: model.into(),
            params,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{GenerationSettings, MediaType};

    #[test]
    fn api_key_ignores_blank_values() {
        let mut settings = GenerationSettings::new("c", "s", "gemini", "imagen");
        settings
            .api_keys
            .insert("gemini".to_string(), "   ".to_string());
        settings
            .api_keys
            .insert("stability".to_string(), " sk-1 ".to_string());
        assert_eq!(settings.api_key("gemini"), None);
        assert_eq!(settings.api_key("stability"), Some("sk-1"));
        assert_eq!(settings.api_key("leonardo"), None);
    }

    #[test]
    fn derived_settings_leave_original_untouched() {
        let settings = GenerationSettings::new("first", "Impressionistic", "gemini", "imagen");
        let next = settings.with_concept("second");
        assert_eq!(settings.concept, "first");
        assert_eq!(next.concept, "second");
        assert_eq!(next.art_style, "Impressionistic");
    }

    #[test]
    fn partial_json_fills_defaults() -> anyhow::Result<()> {
        let settings: GenerationSettings = serde_json::from_value(json!({
            "concept": "Cosmic jellyfish ballet",
            "art_style": "Impressionistic",
            "aspect_ratio": "16:9",
            "media_type": "image",
            "selected_provider": "gemini",
        }))?;
        assert_eq!(settings.media_type, MediaType::Image);
        assert!(settings.catalog.get("gemini").is_some());
        assert!(settings.prompt_override().is_none());
        Ok(())
    }
}
