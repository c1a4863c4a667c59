use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::dimensions::Dimensions;
use crate::settings::{AdvancedParams, MediaType};

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;
const SCHEMA_VERSION: u32 = 1;

/// One recorded generation. Only the Drive file id may change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: String,
    pub created_at: String,
    pub media_url: String,
    pub prompt: String,
    pub concept: String,
    pub media_type: MediaType,
    pub art_style: String,
    pub aspect_ratio: String,
    pub provider_id: String,
    pub model_id: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub params: AdvancedParams,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub derived_from: Option<String>,
    #[serde(default)]
    pub drive_file_id: Option<String>,
}

impl HistoryItem {
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryItem {
    pub media_url: String,
    pub prompt: String,
    pub concept: String,
    pub media_type: MediaType,
    pub art_style: String,
    pub aspect_ratio: String,
    pub provider_id: String,
    pub model_id: String,
    pub negative_prompt: Option<String>,
    pub params: AdvancedParams,
    pub dimensions: Dimensions,
    pub derived_from: Option<String>,
}

pub trait HistoryRecorder: Send {
    fn add(&mut self, item: NewHistoryItem) -> anyhow::Result<HistoryItem>;
    /// Returns whether an item with `id` existed.
    fn delete(&mut self, id: &str) -> anyhow::Result<bool>;
    fn attach_drive_file(&mut self, id: &str, drive_file_id: &str) -> anyhow::Result<bool>;
    /// Newest first.
    fn items(&self) -> Vec<HistoryItem>;
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryFile {
    schema_version: u32,
    items: Vec<HistoryItem>,
}

/// Bounded history ledger, newest first, optionally mirrored to a JSON file.
#[derive(Debug, Clone)]
pub struct JsonHistoryStore {
    path: Option<PathBuf>,
    capacity: usize,
    items: Vec<HistoryItem>,
}

impl JsonHistoryStore {
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            path: None,
            capacity: capacity.max(1),
            items: Vec::new(),
        }
    }

    /// Loads `path` when it exists. A file that exists but does not parse is
    /// an error rather than silently discarded history.
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> anyhow::Result<Self> {
        let path = path.into();
        let mut items = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read history {}", path.display()))?;
            let parsed: HistoryFile = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse history {}", path.display()))?;
            parsed.items
        } else {
            Vec::new()
        };
        let capacity = capacity.max(1);
        items.truncate(capacity);
        Ok(Self {
            path: Some(path),
            capacity,
            items,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&HistoryItem> {
        self.items.iter().find(|item| item.id == id)
    }

    fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = HistoryFile {
            schema_version: SCHEMA_VERSION,
            items: self.items.clone(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&payload)?)
            .with_context(|| format!("failed to write history {}", path.display()))?;
        Ok(())
    }
}

impl HistoryRecorder for JsonHistoryStore {
    fn add(&mut self, item: NewHistoryItem) -> anyhow::Result<HistoryItem> {
        let recorded = HistoryItem {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            media_url: item.media_url,
            prompt: item.prompt,
            concept: item.concept,
            media_type: item.media_type,
            art_style: item.art_style,
            aspect_ratio: item.aspect_ratio,
            provider_id: item.provider_id,
            model_id: item.model_id,
            negative_prompt: item.negative_prompt,
            params: item.params,
            width: item.dimensions.width,
            height: item.dimensions.height,
            derived_from: item.derived_from,
            drive_file_id: None,
        };
        self.items.insert(0, recorded.clone());
        self.items.truncate(self.capacity);
        self.persist()?;
        Ok(recorded)
    }

    fn delete(&mut self, id: &str) -> anyhow::Result<bool> {
        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        if self.items.len() == before {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    fn attach_drive_file(&mut self, id: &str, drive_file_id: &str) -> anyhow::Result<bool> {
        let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
            return Ok(false);
        };
        item.drive_file_id = Some(drive_file_id.to_string());
        self.persist()?;
        Ok(true)
    }

    fn items(&self) -> Vec<HistoryItem> {
        self.items.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::Value;

    use super::{HistoryRecorder, JsonHistoryStore, NewHistoryItem};
    use crate::dimensions::Dimensions;
    use crate::settings::{AdvancedParams, MediaType};

    fn entry(concept: &str) -> NewHistoryItem {
        NewHistoryItem {
            media_url: "data:image/png;base64,AAAA".to_string(),
            prompt: format!("a painting of {concept}"),
            concept: concept.to_string(),
            media_type: MediaType::Image,
            art_style: "Impressionistic".to_string(),
            aspect_ratio: "16:9".to_string(),
            provider_id: "gemini".to_string(),
            model_id: "imagen-4.0-generate-001".to_string(),
            negative_prompt: None,
            params: AdvancedParams {
                seed: Some(7),
                ..AdvancedParams::default()
            },
            dimensions: Dimensions {
                width: 1344,
                height: 768,
            },
            derived_from: None,
        }
    }

    #[test]
    fn newest_first_and_oldest_evicted() -> anyhow::Result<()> {
        let mut store = JsonHistoryStore::in_memory(2);
        store.add(entry("one"))?;
        store.add(entry("two"))?;
        store.add(entry("three"))?;
        let concepts: Vec<String> = store.items().into_iter().map(|item| item.concept).collect();
        assert_eq!(concepts, vec!["three".to_string(), "two".to_string()]);
        Ok(())
    }

    #[test]
    fn persists_and_reloads() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("history").join("history.json");
        let mut store = JsonHistoryStore::open(&path, 50)?;
        let first = store.add(entry("Cosmic jellyfish ballet"))?;
        assert!(store.attach_drive_file(&first.id, "drive-1")?);
        assert!(!store.attach_drive_file("missing", "drive-2")?);

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(raw["schema_version"], Value::from(1));

        let reopened = JsonHistoryStore::open(&path, 50)?;
        let item = reopened.get(&first.id).cloned().unwrap_or_else(|| panic!("missing"));
        assert_eq!(item.drive_file_id.as_deref(), Some("drive-1"));
        assert_eq!(item.params.seed, Some(7));
        assert_eq!(item.dimensions().size_label(), "1344x768");
        Ok(())
    }

    #[test]
    fn delete_reports_presence() -> anyhow::Result<()> {
        let mut store = JsonHistoryStore::in_memory(5);
        let item = store.add(entry("one"))?;
        assert!(store.delete(&item.id)?);
        assert!(!store.delete(&item.id)?);
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn corrupt_file_is_an_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("history.json");
        fs::write(&path, "not json")?;
        assert!(JsonHistoryStore::open(&path, 50).is_err());
        Ok(())
    }
}
