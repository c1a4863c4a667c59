use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{Map, Value};

use crate::dimensions::parse_aspect_ratio;
use crate::models::{Capability, ModelSelector};
use crate::settings::{AdvancedParams, GenerationSettings};

pub const CFG_SCALE_MIN: f64 = 0.0;
pub const CFG_SCALE_MAX: f64 = 30.0;

pub const CONCEPTS: &[&str] = &[
    "Cosmic jellyfish ballet",
    "Clockwork forest at dawn",
    "Bioluminescent desert caravan",
    "Floating archipelago of libraries",
    "Cathedral of crystallized rain",
    "Neon koi in a flooded subway",
    "Glacier whispering to the aurora",
    "Orchard growing on a comet",
];

pub const ART_STYLES: &[&str] = &[
    "Impressionistic",
    "Art Nouveau",
    "Ukiyo-e woodblock",
    "Surrealist oil painting",
    "Cyberpunk illustration",
    "Watercolor",
    "Baroque chiaroscuro",
    "Low-poly 3D render",
];

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Map<String, Value>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatAction {
    GenerateNow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatOutcome {
    pub success: bool,
    pub message: String,
    pub action: Option<ChatAction>,
}

impl ChatOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            action: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            action: None,
        }
    }
}

/// Draft of the user-editable generation controls the chat layer mutates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatControls {
    pub concept: String,
    pub art_style: String,
    pub negative_prompt: Option<String>,
    pub aspect_ratio: String,
    pub params: AdvancedParams,
    /// Defaults of the selected model, restored by a random pick.
    pub default_params: AdvancedParams,
}

impl ChatControls {
    pub fn from_settings(settings: &GenerationSettings) -> Self {
        let requested = Some(settings.selected_model.as_str());
        let default_params = ModelSelector::new(&settings.catalog)
            .select(&settings.selected_provider, requested, Capability::TextToImage)
            .map(|selection| selection.model.default_params())
            .unwrap_or_default();
        Self {
            concept: settings.concept.clone(),
            art_style: settings.art_style.clone(),
            negative_prompt: settings.negative_prompt.clone(),
            aspect_ratio: settings.aspect_ratio.clone(),
            params: settings.params.clone(),
            default_params,
        }
    }

    /// A new settings value with these controls applied.
    pub fn apply_to(&self, settings: &GenerationSettings) -> GenerationSettings {
        GenerationSettings {
            concept: self.concept.clone(),
            art_style: self.art_style.clone(),
            negative_prompt: self.negative_prompt.clone(),
            aspect_ratio: self.aspect_ratio.clone(),
            params: self.params.clone(),
            ..settings.clone()
        }
    }
}

fn string_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).map(str::trim)
}

fn number_arg(args: &Map<String, Value>, key: &str) -> Option<f64> {
    match args.get(key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

enum SeedArg {
    Random,
    Fixed(i64),
}

fn seed_arg(args: &Map<String, Value>) -> Option<SeedArg> {
    match args.get("seed")? {
        Value::Number(number) => number.as_i64().map(SeedArg::Fixed),
        Value::String(text) => {
            let text = text.trim();
            if text.eq_ignore_ascii_case("random") {
                Some(SeedArg::Random)
            } else {
                text.parse::<i64>().ok().map(SeedArg::Fixed)
            }
        }
        _ => None,
    }
}

/// `W:H` with both sides positive integers.
pub fn is_valid_aspect_ratio(raw: &str) -> bool {
    let Some((width, height)) = raw.trim().split_once(':') else {
        return false;
    };
    let positive = |side: &str| side.trim().parse::<u32>().map(|v| v > 0).unwrap_or(false);
    positive(width) && positive(height) && parse_aspect_ratio(raw).is_some()
}

pub fn apply_function_call<R: Rng + ?Sized>(
    controls: &mut ChatControls,
    call: &FunctionCall,
    rng: &mut R,
) -> ChatOutcome {
    let args = &call.args;
    match call.name.as_str() {
        "set_art_style" => match string_arg(args, "art_style").filter(|v| !v.is_empty()) {
            Some(style) => {
                controls.art_style = style.to_string();
                ChatOutcome::ok(format!("Art style set to '{style}'."))
            }
            None => ChatOutcome::error("Art style must be a non-empty string."),
        },
        "set_negative_prompt" => match args.get("negative_prompt") {
            Some(Value::String(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    controls.negative_prompt = None;
                    ChatOutcome::ok("Negative prompt cleared.")
                } else {
                    controls.negative_prompt = Some(text.to_string());
                    ChatOutcome::ok(format!("Negative prompt set to '{text}'."))
                }
            }
            _ => ChatOutcome::error("Negative prompt must be a string."),
        },
        "set_theme" => match string_arg(args, "theme").filter(|v| !v.is_empty()) {
            Some(theme) => {
                controls.concept = theme.to_string();
                ChatOutcome::ok(format!("Theme set to '{theme}'."))
            }
            None => ChatOutcome::error("Theme must be a non-empty string."),
        },
        "set_seed" => match seed_arg(args) {
            Some(SeedArg::Random) => {
                controls.params.seed = None;
                ChatOutcome::ok("Seed cleared; each generation uses a random seed.")
            }
            Some(SeedArg::Fixed(seed)) => {
                controls.params.seed = Some(seed);
                ChatOutcome::ok(format!("Seed set to {seed}."))
            }
            None => ChatOutcome::error("Seed must be an integer or 'random'."),
        },
        "set_cfg_scale" => match number_arg(args, "cfg_scale") {
            Some(value) if (CFG_SCALE_MIN..=CFG_SCALE_MAX).contains(&value) => {
                controls.params.cfg_scale = Some(value);
                ChatOutcome::ok(format!("CFG scale set to {value}."))
            }
            Some(value) => ChatOutcome::error(format!(
                "CFG scale {value} is outside {CFG_SCALE_MIN}-{CFG_SCALE_MAX}."
            )),
            None => ChatOutcome::error("CFG scale must be a number."),
        },
        "set_aspect_ratio" => match string_arg(args, "aspect_ratio") {
            Some(ratio) if is_valid_aspect_ratio(ratio) => {
                controls.aspect_ratio = ratio.to_string();
                ChatOutcome::ok(format!("Aspect ratio set to {ratio}."))
            }
            Some(ratio) => ChatOutcome::error(format!(
                "Aspect ratio '{ratio}' must look like W:H with positive integers."
            )),
            None => ChatOutcome::error("Aspect ratio must be a string like 16:9."),
        },
        "select_random_concept_and_style" => {
            let concept = CONCEPTS.choose(rng).copied().unwrap_or_default();
            let style = ART_STYLES.choose(rng).copied().unwrap_or_default();
            controls.concept = concept.to_string();
            controls.art_style = style.to_string();
            controls.params = controls.default_params.clone();
            ChatOutcome::ok(format!(
                "Picked '{concept}' in {style}; advanced parameters reset to defaults."
            ))
        }
        "generate_image_now" => ChatOutcome {
            success: true,
            message: "Generating an image with the current settings.".to_string(),
            action: Some(ChatAction::GenerateNow),
        },
        other => ChatOutcome::error(format!("Unknown function '{other}'.")),
    }
}
