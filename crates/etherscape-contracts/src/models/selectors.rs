use super::registry::{Capability, ModelSetting, ProviderCatalog};

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSelection {
    pub provider: String,
    pub model: ModelSetting,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ModelSelector<'a> {
    pub catalog: &'a ProviderCatalog,
}

impl<'a> ModelSelector<'a> {
    pub fn new(catalog: &'a ProviderCatalog) -> Self {
        Self { catalog }
    }

    /// Picks `requested` when it exists on `provider` and supports
    /// `capability`, otherwise the provider's first capable model.
    pub fn select(
        &self,
        provider: &str,
        requested: Option<&str>,
        capability: Capability,
    ) -> Result<ModelSelection, String> {
        let Some(entry) = self.catalog.get(provider) else {
            return Err(format!("Provider '{provider}' is not in the catalog."));
        };

        let requested = requested
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let fallback_reason = if let Some(requested_value) = requested {
            if let Some(model) = entry
                .model(requested_value)
                .filter(|model| model.supports(capability))
            {
                return Ok(ModelSelection {
                    provider: provider.to_string(),
                    model: model.clone(),
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            Some(format!(
                "Requested model '{requested_value}' unavailable on '{provider}' for {}.",
                capability_label(capability)
            ))
        } else {
            Some("No model specified; using provider default.".to_string())
        };

        let Some(model) = entry.models_for(capability).next().cloned() else {
            return Err(format!(
                "Provider '{provider}' has no model for {}.",
                capability_label(capability)
            ));
        };
        Ok(ModelSelection {
            provider: provider.to_string(),
            model,
            requested: requested.map(str::to_string),
            fallback_reason,
        })
    }
}

fn capability_label(capability: Capability) -> &'static str {
    match capability {
        Capability::TextToImage => "text-to-image",
        Capability::ImageToImage => "image-to-image",
    }
}
