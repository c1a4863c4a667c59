use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::providers::{BFL, CLIPDROP, DRYRUN, FAL, GEMINI, LEONARDO, REPLICATE, STABILITY};
use crate::settings::AdvancedParams;

const COMMON_RATIOS: &[&str] = &[
    "1:1", "16:9", "9:16", "4:3", "3:4", "3:2", "2:3", "21:9", "9:21", "5:4", "4:5",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    #[default]
    Generate,
    Upscale,
    Inpaint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    TextToImage,
    ImageToImage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSetting {
    pub id: String,
    pub name: String,
    pub role: ModelRole,
    pub base_dimension: u32,
    pub supports_negative_prompt: bool,
    pub supports_image_to_image: bool,
    pub aspect_ratios: Vec<String>,
    pub default_cfg_scale: Option<f64>,
    pub default_steps: Option<u32>,
    pub samplers: Vec<String>,
    pub style_presets: Vec<String>,
    pub default_toggles: BTreeMap<String, bool>,
}

impl Default for ModelSetting {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            role: ModelRole::Generate,
            base_dimension: 1024,
            supports_negative_prompt: false,
            supports_image_to_image: false,
            aspect_ratios: COMMON_RATIOS.iter().map(|ratio| ratio.to_string()).collect(),
            default_cfg_scale: None,
            default_steps: None,
            samplers: Vec::new(),
            style_presets: Vec::new(),
            default_toggles: BTreeMap::new(),
        }
    }
}

impl ModelSetting {
    pub fn new(id: &str, name: &str, base_dimension: u32) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            base_dimension,
            ..Self::default()
        }
    }

    /// Upscale and inpaint models never take part in prompt-driven generation.
    pub fn is_generator(&self) -> bool {
        self.role == ModelRole::Generate
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::TextToImage => self.is_generator(),
            Capability::ImageToImage => self.is_generator() && self.supports_image_to_image,
        }
    }

    pub fn supports_aspect_ratio(&self, ratio: &str) -> bool {
        self.aspect_ratios.iter().any(|item| item == ratio.trim())
    }

    pub fn default_params(&self) -> AdvancedParams {
        AdvancedParams {
            cfg_scale: self.default_cfg_scale,
            steps: self.default_steps,
            seed: None,
            sampler: self.samplers.first().cloned(),
            style_preset: None,
            toggles: self.default_toggles.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageProviderSetting {
    pub id: String,
    pub name: String,
    pub requires_api_key: bool,
    /// Served over the streaming socket instead of request/response dispatch.
    pub realtime: bool,
    pub models: Vec<ModelSetting>,
}

impl Default for ImageProviderSetting {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            requires_api_key: true,
            realtime: false,
            models: Vec::new(),
        }
    }
}

impl ImageProviderSetting {
    pub fn model(&self, id: &str) -> Option<&ModelSetting> {
        self.models.iter().find(|model| model.id == id)
    }

    pub fn models_for(&self, capability: Capability) -> impl Iterator<Item = &ModelSetting> {
        self.models
            .iter()
            .filter(move |model| model.supports(capability))
    }

    pub fn has_generator(&self) -> bool {
        self.models.iter().any(ModelSetting::is_generator)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderCatalog {
    providers: IndexMap<String, ImageProviderSetting>,
}

impl Default for ProviderCatalog {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ProviderCatalog {
    pub fn new(providers: Option<IndexMap<String, ImageProviderSetting>>) -> Self {
        Self {
            providers: providers.unwrap_or_else(default_providers),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ImageProviderSetting> {
        self.providers.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &ImageProviderSetting> {
        self.providers.values()
    }

    pub fn model(&self, provider: &str, model: &str) -> Option<&ModelSetting> {
        self.get(provider)?.model(model)
    }

    pub fn insert(&mut self, provider: ImageProviderSetting) {
        self.providers.insert(provider.id.clone(), provider);
    }

    /// Swaps a provider's model list after a discovery refresh. Returns
    /// `false` when the provider is unknown.
    pub fn replace_models(&mut self, provider: &str, models: Vec<ModelSetting>) -> bool {
        match self.providers.get_mut(provider) {
            Some(entry) => {
                entry.models = models;
                true
            }
            None => false,
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn toggles(values: &[(&str, bool)]) -> BTreeMap<String, bool> {
    values
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

fn default_providers() -> IndexMap<String, ImageProviderSetting> {
    let mut map = IndexMap::new();

    let mut insert =
        |id: &str, name: &str, requires_api_key: bool, realtime: bool, models: Vec<ModelSetting>| {
            map.insert(
                id.to_string(),
                ImageProviderSetting {
                    id: id.to_string(),
                    name: name.to_string(),
                    requires_api_key,
                    realtime,
                    models,
                },
            );
        };

    insert(
        GEMINI,
        "Google Gemini",
        true,
        false,
        vec![
            ModelSetting {
                aspect_ratios: strings(&["1:1", "3:4", "4:3", "9:16", "16:9"]),
                ..ModelSetting::new("imagen-4.0-generate-001", "Imagen 4", 1024)
            },
            ModelSetting {
                supports_image_to_image: true,
                ..ModelSetting::new("gemini-2.5-flash-image", "Gemini 2.5 Flash Image", 1024)
            },
        ],
    );
    insert(
        FAL,
        "Fal.ai Realtime",
        true,
        true,
        vec![
            ModelSetting {
                supports_negative_prompt: true,
                default_cfg_scale: Some(1.5),
                default_steps: Some(4),
                ..ModelSetting::new("fal-ai/fast-lcm-diffusion", "Fast LCM Diffusion", 512)
            },
            ModelSetting {
                supports_negative_prompt: true,
                default_cfg_scale: Some(1.0),
                default_steps: Some(2),
                ..ModelSetting::new("fal-ai/fast-turbo-diffusion", "Fast Turbo Diffusion", 512)
            },
        ],
    );
    insert(
        STABILITY,
        "Stability AI",
        true,
        false,
        vec![
            ModelSetting {
                supports_negative_prompt: true,
                supports_image_to_image: true,
                default_cfg_scale: Some(4.0),
                ..ModelSetting::new("sd3.5-large", "Stable Diffusion 3.5 Large", 1024)
            },
            ModelSetting {
                supports_negative_prompt: true,
                style_presets: strings(&[
                    "3d-model",
                    "analog-film",
                    "anime",
                    "cinematic",
                    "comic-book",
                    "digital-art",
                    "fantasy-art",
                    "line-art",
                    "neon-punk",
                    "photographic",
                    "pixel-art",
                ]),
                ..ModelSetting::new("stable-image-core", "Stable Image Core", 1024)
            },
            ModelSetting {
                supports_negative_prompt: true,
                supports_image_to_image: true,
                ..ModelSetting::new("stable-image-ultra", "Stable Image Ultra", 1024)
            },
            ModelSetting {
                role: ModelRole::Upscale,
                ..ModelSetting::new("esrgan-v1-x2plus", "Real-ESRGAN x2", 1024)
            },
            ModelSetting {
                role: ModelRole::Inpaint,
                ..ModelSetting::new("stable-inpaint", "Inpaint", 1024)
            },
        ],
    );
    insert(
        LEONARDO,
        "Leonardo.Ai",
        true,
        false,
        vec![
            ModelSetting {
                supports_negative_prompt: true,
                supports_image_to_image: true,
                default_cfg_scale: Some(7.0),
                default_steps: Some(30),
                style_presets: strings(&[
                    "DYNAMIC",
                    "CINEMATIC",
                    "CREATIVE",
                    "ILLUSTRATION",
                    "RAYTRACED",
                    "VIBRANT",
                    "NONE",
                ]),
                default_toggles: toggles(&[("alchemy", true), ("photoReal", false)]),
                ..ModelSetting::new(
                    "de7d3faf-762f-48e0-b3b7-9d0ac3a3fcf3",
                    "Leonardo Phoenix 1.0",
                    1024,
                )
            },
            ModelSetting {
                supports_negative_prompt: true,
                supports_image_to_image: true,
                default_cfg_scale: Some(7.0),
                default_steps: Some(30),
                default_toggles: toggles(&[("alchemy", true)]),
                ..ModelSetting::new("aa77f04e-3eec-4034-9c07-d0f619684628", "Leonardo Kino XL", 1024)
            },
        ],
    );
    insert(
        REPLICATE,
        "Replicate",
        true,
        false,
        vec![
            ModelSetting {
                default_steps: Some(4),
                ..ModelSetting::new("black-forest-labs/flux-schnell", "FLUX.1 [schnell]", 1024)
            },
            ModelSetting {
                supports_negative_prompt: true,
                supports_image_to_image: true,
                default_cfg_scale: Some(7.5),
                default_steps: Some(30),
                samplers: strings(&[
                    "K_EULER",
                    "DDIM",
                    "DPMSolverMultistep",
                    "K_EULER_ANCESTRAL",
                    "PNDM",
                    "KLMS",
                ]),
                ..ModelSetting::new("stability-ai/sdxl", "SDXL", 1024)
            },
            ModelSetting {
                role: ModelRole::Upscale,
                ..ModelSetting::new("nightmareai/real-esrgan", "Real-ESRGAN", 1024)
            },
        ],
    );
    insert(
        BFL,
        "Black Forest Labs",
        true,
        false,
        vec![
            ModelSetting {
                supports_image_to_image: true,
                ..ModelSetting::new("flux-pro-1.1", "FLUX1.1 [pro]", 1024)
            },
            ModelSetting {
                supports_image_to_image: true,
                default_cfg_scale: Some(3.0),
                default_steps: Some(28),
                ..ModelSetting::new("flux-dev", "FLUX.1 [dev]", 1024)
            },
        ],
    );
    insert(
        CLIPDROP,
        "Clipdrop",
        true,
        false,
        vec![ModelSetting {
            aspect_ratios: strings(&["1:1"]),
            ..ModelSetting::new("text-to-image-v1", "Clipdrop Text to Image", 1024)
        }],
    );
    insert(
        DRYRUN,
        "Offline preview",
        false,
        false,
        vec![ModelSetting {
            supports_negative_prompt: true,
            supports_image_to_image: true,
            ..ModelSetting::new("dryrun-image-1", "Solid colour preview", 512)
        }],
    );

    map
}
