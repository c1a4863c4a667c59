use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use etherscape_contracts::models::{ModelSetting, ProviderCatalog};
use etherscape_contracts::providers::LEONARDO;
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;

use crate::media::truncate_text;

/// Lists Leonardo platform models.
pub fn fetch_leonardo_models(http: &HttpClient, api_base: &str, api_key: &str) -> Result<Vec<ModelSetting>> {
    if api_key.trim().is_empty() {
        bail!("leonardo API key is required.");
    }
    let endpoint = format!("{}/platformModels", api_base.trim_end_matches('/'));
    let response = http
        .get(&endpoint)
        .bearer_auth(api_key.trim())
        .send()
        .context("Leonardo model list request failed")?;
    let status = response.status();
    let body = response.text().context("Leonardo model list read failed")?;
    if !status.is_success() {
        bail!(
            "Leonardo model list failed ({}): {}",
            status.as_u16(),
            truncate_text(&body, 512)
        );
    }
    let payload: Value = serde_json::from_str(&body).context("Leonardo model list is not JSON")?;
    Ok(parse_leonardo_models(&payload))
}

pub fn parse_leonardo_models(payload: &Value) -> Vec<ModelSetting> {
    let Some(rows) = payload.get("custom_models").and_then(Value::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let id = row.get("id").and_then(Value::as_str)?.trim();
            if id.is_empty() {
                return None;
            }
            let name = row
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .unwrap_or(id);
            Some(ModelSetting {
                supports_negative_prompt: true,
                supports_image_to_image: true,
                default_cfg_scale: Some(7.0),
                default_steps: Some(30),
                default_toggles: BTreeMap::from([("alchemy".to_string(), false)]),
                ..ModelSetting::new(id, name, 1024)
            })
        })
        .collect()
}

/// Replaces Leonardo's model list, keeping the tuned settings of models the
/// catalog already knows. Returns how many models the provider now lists.
pub fn merge_leonardo_models(catalog: &mut ProviderCatalog, discovered: Vec<ModelSetting>) -> Result<usize> {
    if discovered.is_empty() {
        bail!("Leonardo returned no models; keeping the existing list.");
    }
    let merged: Vec<ModelSetting> = discovered
        .into_iter()
        .map(|model| {
            catalog
                .model(LEONARDO, &model.id)
                .cloned()
                .unwrap_or(model)
        })
        .collect();
    let count = merged.len();
    if !catalog.replace_models(LEONARDO, merged) {
        bail!("catalog has no leonardo provider entry");
    }
    Ok(count)
}

pub fn refresh_leonardo_catalog(
    catalog: &mut ProviderCatalog,
    http: &HttpClient,
    api_base: &str,
    api_key: &str,
) -> Result<usize> {
    let discovered = fetch_leonardo_models(http, api_base, api_key)?;
    merge_leonardo_models(catalog, discovered)
}
