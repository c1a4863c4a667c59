use std::collections::BTreeMap;
use std::env;

use etherscape_contracts::providers::{BFL, CLIPDROP, FAL, GEMINI, LEONARDO, REPLICATE, STABILITY};

const KEY_VARS: &[(&str, &[&str])] = &[
    (GEMINI, &["GEMINI_API_KEY", "GOOGLE_API_KEY"]),
    (FAL, &["FAL_KEY", "FAL_API_KEY"]),
    (STABILITY, &["STABILITY_API_KEY"]),
    (REPLICATE, &["REPLICATE_API_TOKEN", "REPLICATE_API_KEY"]),
    (LEONARDO, &["LEONARDO_API_KEY"]),
    (BFL, &["BFL_API_KEY"]),
    (CLIPDROP, &["CLIPDROP_API_KEY"]),
];

const BASE_VARS: &[(&str, &str, &str)] = &[
    (
        GEMINI,
        "GEMINI_API_BASE",
        "https://generativelanguage.googleapis.com/v1beta",
    ),
    (FAL, "FAL_API_BASE", "https://fal.run"),
    (STABILITY, "STABILITY_API_BASE", "https://api.stability.ai"),
    (REPLICATE, "REPLICATE_API_BASE", "https://api.replicate.com/v1"),
    (
        LEONARDO,
        "LEONARDO_API_BASE",
        "https://cloud.leonardo.ai/api/rest/v1",
    ),
    (BFL, "BFL_API_BASE", "https://api.bfl.ai/v1"),
    (CLIPDROP, "CLIPDROP_API_BASE", "https://clipdrop-api.co"),
];

pub const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Keys, base URLs and Drive credentials resolved from the process
/// environment. Blank values count as unset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineEnv {
    pub api_keys: BTreeMap<String, String>,
    pub api_bases: BTreeMap<String, String>,
    pub drive_api_base: String,
    pub drive_access_token: Option<String>,
    pub drive_folder_id: Option<String>,
}

impl EngineEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut api_keys = BTreeMap::new();
        for (provider, vars) in KEY_VARS {
            if let Some(value) = vars.iter().find_map(|var| read(var)) {
                api_keys.insert((*provider).to_string(), value);
            }
        }

        let mut api_bases = BTreeMap::new();
        for (provider, var, default) in BASE_VARS {
            let base = read(var).unwrap_or_else(|| (*default).to_string());
            api_bases.insert(
                (*provider).to_string(),
                base.trim_end_matches('/').to_string(),
            );
        }

        Self {
            api_keys,
            api_bases,
            drive_api_base: read("GOOGLE_DRIVE_API_BASE")
                .unwrap_or_else(|| DRIVE_UPLOAD_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            drive_access_token: read("GOOGLE_DRIVE_ACCESS_TOKEN"),
            drive_folder_id: read("ETHERSCAPE_DRIVE_FOLDER_ID"),
        }
    }

    pub fn api_key(&self, provider: &str) -> Option<&str> {
        self.api_keys.get(provider).map(String::as_str)
    }

    pub fn api_base(&self, provider: &str) -> String {
        self.api_bases
            .get(provider)
            .cloned()
            .or_else(|| {
                BASE_VARS
                    .iter()
                    .find(|(id, _, _)| *id == provider)
                    .map(|(_, _, default)| (*default).to_string())
            })
            .unwrap_or_default()
    }

    /// Keys from the environment fill gaps; keys already present win.
    pub fn merge_api_keys(&self, keys: &mut BTreeMap<String, String>) {
        for (provider, value) in &self.api_keys {
            let missing = keys
                .get(provider)
                .map(|existing| existing.trim().is_empty())
                .unwrap_or(true);
            if missing {
                keys.insert(provider.clone(), value.clone());
            }
        }
    }
}
