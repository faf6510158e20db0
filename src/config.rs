//! Sync configuration.
//!
//! The library never reads the environment or disk on its own: the owner
//! builds a [`SyncConfig`] (the CLI does so from args, env and `geosync.json`)
//! and hands it to the service.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::entities::{DEFAULT_OVERLAY_OPACITY, SubjectId};

/// Reconnect policy: fixed delay, capped attempts, no backoff.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 3000,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// e.g. `wss://api.example.com`
    pub ws_base_url: String,
    /// e.g. `https://api.example.com`
    pub api_base_url: String,
    /// Bearer token, sent as `token` query param on the channel and as
    /// `Authorization` header on HTTP calls
    pub token: Option<String>,
    /// Channel path, `{subject_id}` substituted
    pub ws_path: String,
    /// Layer list path for resync, `{subject_id}` substituted
    pub layers_path: String,
    /// Single-layer raster path, `{subject_id}` and `{layer_id}` substituted
    pub raster_path: String,
    pub reconnect: ReconnectPolicy,
    /// Opacity of auto-created overlays
    pub overlay_opacity: f32,
    /// Decoded rasters kept in memory
    pub raster_cache_size: usize,
    pub http_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "ws://localhost:8000".to_string(),
            api_base_url: "http://localhost:8000".to_string(),
            token: None,
            ws_path: "/ws/verification/{subject_id}".to_string(),
            layers_path: "/api/v1/verification/{subject_id}/layers".to_string(),
            raster_path: "/api/v1/verification/{subject_id}/layers/{layer_id}/raster".to_string(),
            reconnect: ReconnectPolicy::default(),
            overlay_opacity: DEFAULT_OVERLAY_OPACITY,
            raster_cache_size: 64,
            http_timeout_ms: 30_000,
        }
    }
}

impl SyncConfig {
    /// Load from a JSON file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: SyncConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// Channel URL for a subject, token appended as query parameter.
    pub fn channel_url(&self, subject: &SubjectId) -> Result<Url> {
        let mut url = fill_url(&self.ws_base_url, &self.ws_path, &[("{subject_id}", subject.as_str())])?;
        if let Some(token) = self.token.as_deref().filter(|t| !t.is_empty()) {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }

    pub fn layers_url(&self, subject: &SubjectId) -> Result<Url> {
        fill_url(&self.api_base_url, &self.layers_path, &[("{subject_id}", subject.as_str())])
    }

    /// Deterministic raster-fetch URL for a layer.
    pub fn raster_url(&self, subject: &SubjectId, layer_id: &str) -> Result<Url> {
        fill_url(
            &self.api_base_url,
            &self.raster_path,
            &[("{subject_id}", subject.as_str()), ("{layer_id}", layer_id)],
        )
    }

    /// Resolve a possibly relative reference (thumbnail) against the API base.
    pub fn resolve(&self, reference: &str) -> Result<Url> {
        match Url::parse(reference) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => join_url(&self.api_base_url, reference),
            Err(e) => Err(e).with_context(|| format!("Invalid URL: {}", reference)),
        }
    }
}

/// Append a path template to `base`. Each placeholder value lands in exactly
/// one percent-encoded path segment, so ids can't add segments, a query or a
/// fragment.
fn fill_url(base: &str, template: &str, values: &[(&str, &str)]) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("Invalid URL: {}", base))?;
    url.set_query(None);
    url.set_fragment(None);
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| anyhow::anyhow!("URL cannot take a path: {}", base))?;
        segments.pop_if_empty();
        for part in template.split('/').filter(|p| !p.is_empty()) {
            let mut segment = part.to_string();
            for (placeholder, value) in values {
                if segment.contains(placeholder) {
                    // `.` and `..` would be dropped or collapse the path
                    if matches!(*value, "" | "." | "..") {
                        anyhow::bail!("Invalid path segment {:?} for {}", value, placeholder);
                    }
                    segment = segment.replace(placeholder, value);
                }
            }
            segments.push(&segment);
        }
    }
    Ok(url)
}

/// Append `path` to `base`, keeping any path prefix the base already has.
fn join_url(base: &str, path: &str) -> Result<Url> {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    let joined = format!("{}/{}", base, path);
    Url::parse(&joined).with_context(|| format!("Invalid URL: {}", joined))
}
