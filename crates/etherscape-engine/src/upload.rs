use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::media::{load_media, truncate_text};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadRequest {
    pub media_url: String,
    pub filename: String,
    pub prompt: String,
    pub concept: String,
    pub art_style: String,
    pub aspect_ratio: String,
    pub original_id: String,
    pub provider_id: String,
    pub model_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub id: String,
    pub name: String,
}

pub trait CloudUploader: Send {
    fn upload(&self, request: &UploadRequest) -> Result<UploadedFile>;
}

/// Google Drive v3 multipart upload with a caller-supplied OAuth token.
pub struct DriveUploader {
    api_base: String,
    access_token: String,
    folder_id: Option<String>,
    http: HttpClient,
}

impl DriveUploader {
    pub fn new(api_base: String, access_token: impl Into<String>, folder_id: Option<String>) -> Self {
        Self {
            api_base,
            access_token: access_token.into(),
            folder_id,
            http: HttpClient::new(),
        }
    }

    fn metadata(&self, request: &UploadRequest, mime_type: &str) -> Value {
        let mut properties = Map::new();
        for (key, value) in [
            ("prompt", truncate_text(&request.prompt, 100)),
            ("concept", truncate_text(&request.concept, 100)),
            ("artStyle", request.art_style.clone()),
            ("aspectRatio", request.aspect_ratio.clone()),
            ("originalId", request.original_id.clone()),
            ("provider", request.provider_id.clone()),
            ("model", truncate_text(&request.model_id, 100)),
        ] {
            if !value.trim().is_empty() {
                properties.insert(key.to_string(), Value::String(value));
            }
        }
        let mut metadata = json!({
            "name": request.filename,
            "mimeType": mime_type,
            "description": request.prompt,
            "appProperties": properties,
        });
        if let Some(folder) = self.folder_id.as_deref().filter(|id| !id.trim().is_empty()) {
            metadata["parents"] = json!([folder.trim()]);
        }
        metadata
    }
}

/// Assembles a `multipart/related` body: JSON metadata first, media second.
fn multipart_related_body(metadata: &Value, mime_type: &str, bytes: &[u8]) -> Result<(String, Vec<u8>)> {
    let digest = Sha256::digest(bytes);
    let boundary = format!(
        "etherscape-{}",
        digest[..8]
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>()
    );
    let metadata = serde_json::to_string(metadata).context("failed to serialize upload metadata")?;
    let mut body = Vec::with_capacity(bytes.len() + metadata.len() + 256);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{boundary}\r\nContent-Type: {mime_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    Ok((format!("multipart/related; boundary={boundary}"), body))
}

impl CloudUploader for DriveUploader {
    fn upload(&self, request: &UploadRequest) -> Result<UploadedFile> {
        if self.access_token.trim().is_empty() {
            bail!("Google Drive access token is required.");
        }
        let media = load_media(&self.http, &request.media_url)
            .context("failed to load media for Drive upload")?;
        let metadata = self.metadata(request, &media.mime_type);
        let (content_type, body) = multipart_related_body(&metadata, &media.mime_type, &media.bytes)?;
        let endpoint = format!(
            "{}/files?uploadType=multipart&fields=id,name",
            self.api_base.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(self.access_token.trim())
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .context("Drive upload request failed")?;
        let status = response.status();
        let text = response.text().context("Drive upload response read failed")?;
        if !status.is_success() {
            bail!(
                "Drive upload failed ({}): {}",
                status.as_u16(),
                truncate_text(&text, 512)
            );
        }
        let payload: Value = serde_json::from_str(&text).context("Drive upload returned invalid JSON")?;
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Drive upload response missing file id"))?
            .to_string();
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&request.filename)
            .to_string();
        Ok(UploadedFile { id, name })
    }
}
